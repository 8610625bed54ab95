use chrono::{DateTime, Utc};
use serde::Serialize;
use serenity::model::id::UserId;
use std::{fmt, time::Duration};
use tokio::time::Instant;

use crate::sources::ResolvedTrack;

/// Plataforma de origen de una pista
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Platform {
    YouTube,
    SoundCloud,
    Twitch,
    Spotify,
    Bandcamp,
    Other,
}

impl Platform {
    /// Detecta la plataforma a partir del host de una URL
    pub fn from_url(raw: &str) -> Self {
        let host = url::Url::parse(raw)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .unwrap_or_default();

        Self::from_host(&host)
    }

    /// Detecta la plataforma a partir del nombre del extractor de yt-dlp
    pub fn from_extractor(extractor: &str) -> Self {
        let extractor = extractor.to_lowercase();
        if extractor.contains("youtube") {
            Platform::YouTube
        } else if extractor.contains("soundcloud") {
            Platform::SoundCloud
        } else if extractor.contains("twitch") {
            Platform::Twitch
        } else if extractor.contains("spotify") {
            Platform::Spotify
        } else if extractor.contains("bandcamp") {
            Platform::Bandcamp
        } else {
            Platform::Other
        }
    }

    fn from_host(host: &str) -> Self {
        if host.ends_with("youtube.com") || host == "youtu.be" {
            Platform::YouTube
        } else if host.ends_with("soundcloud.com") {
            Platform::SoundCloud
        } else if host.ends_with("twitch.tv") {
            Platform::Twitch
        } else if host.ends_with("spotify.com") {
            Platform::Spotify
        } else if host.ends_with("bandcamp.com") {
            Platform::Bandcamp
        } else {
            Platform::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::SoundCloud => "SoundCloud",
            Platform::Twitch => "Twitch",
            Platform::Spotify => "Spotify",
            Platform::Bandcamp => "Bandcamp",
            Platform::Other => "Other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Duración de una pista: finita o en vivo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackLength {
    Finite(Duration),
    Live,
}

impl TrackLength {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            TrackLength::Finite(d) => Some(*d),
            TrackLength::Live => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, TrackLength::Live)
    }
}

/// Una pista resuelta y lista para reproducir
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    id: String,
    title: String,
    query: String,
    #[serde(skip)]
    stream_url: String,
    length: TrackLength,
    platform: Platform,
    requested_by: UserId,
    uploader: Option<String>,
    thumbnail: Option<String>,
    added_at: DateTime<Utc>,
    #[serde(skip)]
    resolved_at: Instant,
    #[serde(skip)]
    stale: bool,
}

impl Track {
    pub fn new(
        id: String,
        title: String,
        query: String,
        stream_url: String,
        length: TrackLength,
        requested_by: UserId,
    ) -> Self {
        let platform = Platform::from_url(&query);
        Self {
            id,
            title,
            query,
            stream_url,
            length,
            platform,
            requested_by,
            uploader: None,
            thumbnail: None,
            added_at: Utc::now(),
            resolved_at: Instant::now(),
            stale: false,
        }
    }

    /// Construye la pista a partir del resultado del resolver
    pub fn from_resolved(resolved: ResolvedTrack, query: &str, requested_by: UserId) -> Self {
        let length = match resolved.duration {
            Some(d) if !resolved.is_live => TrackLength::Finite(d),
            _ => TrackLength::Live,
        };

        // Para búsquedas guardamos la URL de la página, que sí es re-resolvible
        let source = resolved
            .webpage_url
            .clone()
            .unwrap_or_else(|| query.to_string());

        let mut track = Self::new(
            resolved.id,
            resolved.title,
            source,
            resolved.direct_url,
            length,
            requested_by,
        )
        .with_platform(resolved.platform);
        track.uploader = resolved.uploader;
        track.thumbnail = resolved.thumbnail;
        track
    }

    // Getters
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn query(&self) -> &str {
        &self.query
    }
    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }
    pub fn length(&self) -> TrackLength {
        self.length
    }
    pub fn duration(&self) -> Option<Duration> {
        self.length.as_duration()
    }
    pub fn is_live(&self) -> bool {
        self.length.is_live()
    }
    pub fn platform(&self) -> Platform {
        self.platform
    }
    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }
    pub fn uploader(&self) -> Option<&str> {
        self.uploader.as_deref()
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    // Setters
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_uploader(mut self, uploader: impl Into<String>) -> Self {
        self.uploader = Some(uploader.into());
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    /// Los localizadores de stream caducan; esta copia pedirá uno nuevo antes de sonar
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Copia nueva de la pista para volver a encolarla (loop de cola)
    pub fn fresh_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.added_at = Utc::now();
        copy.stale = true;
        copy
    }

    pub fn needs_refresh(&self, ttl: Duration) -> bool {
        self.stale || self.resolved_at.elapsed() >= ttl
    }

    /// Aplica un localizador recién resuelto, conservando la identidad de la pista
    pub fn refresh_locator(&mut self, resolved: ResolvedTrack) {
        self.stream_url = resolved.direct_url;
        self.resolved_at = Instant::now();
        self.stale = false;
        if resolved.is_live {
            self.length = TrackLength::Live;
        } else if let Some(d) = resolved.duration {
            self.length = TrackLength::Finite(d);
        }
    }
}

/// Formatea segundos como MM:SS o HH:MM:SS
pub fn format_time(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

use async_trait::async_trait;
use serde::Deserialize;
use std::{process::Stdio, time::Duration};
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};

use super::{is_url, ResolveError, ResolvedTrack, TrackResolver};
use crate::audio::track::Platform;

/// Resolver basado en `yt-dlp -J`
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
}

/// Subconjunto del JSON de yt-dlp que nos interesa
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    duration: Option<f64>,
    is_live: Option<bool>,
    extractor_key: Option<String>,
    extractor: Option<String>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    entries: Option<Vec<YtDlpInfo>>,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn command(&self, query: &str) -> Command {
        let target = search_target(query);

        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "-J",
            "--no-playlist",
            "--format",
            "bestaudio[ext=m4a]/bestaudio[ext=webm]/bestaudio/best",
            "--no-warnings",
            "--socket-timeout",
            "15",
            "--geo-bypass",
        ])
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError> {
        info!("🔍 Resolviendo con yt-dlp: {}", query);

        let output = match timeout(self.timeout, self.command(query).output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ResolveError::Failed(format!("yt-dlp no disponible: {}", e))),
            Err(_) => {
                warn!("⏰ Timeout resolviendo: {}", query);
                return Err(ResolveError::Failed(format!(
                    "timeout tras {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("yt-dlp stderr: {}", stderr.trim());
            return Err(classify_stderr(query, &stderr));
        }

        parse_output(query, &output.stdout)
    }
}

/// Lo que se le pasa a yt-dlp: URLs tal cual, texto como búsqueda.
/// Spotify no es reproducible, así que su enlace se busca en YouTube.
fn search_target(query: &str) -> String {
    if !is_url(query) {
        return format!("ytsearch1:{}", query);
    }
    if Platform::from_url(query) != Platform::Spotify {
        return query.to_string();
    }

    let id = url::Url::parse(query)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| query.to_string());
    debug!("🎧 Enlace de Spotify convertido en búsqueda: {}", id);
    format!("ytsearch1:spotify track {}", id)
}

/// Convierte la salida JSON de yt-dlp en una pista resuelta
fn parse_output(query: &str, stdout: &[u8]) -> Result<ResolvedTrack, ResolveError> {
    let mut info: YtDlpInfo = serde_json::from_slice(stdout)
        .map_err(|e| ResolveError::Failed(format!("JSON inválido de yt-dlp: {}", e)))?;

    // Búsquedas y playlists: nos quedamos con la primera entrada
    if let Some(entries) = info.entries.take() {
        info = entries
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;
    }

    let direct_url = info
        .url
        .ok_or_else(|| ResolveError::Unplayable("sin formato de audio reproducible".into()))?;

    let is_live = info.is_live.unwrap_or(false);
    let platform = info
        .extractor_key
        .as_deref()
        .or(info.extractor.as_deref())
        .map(Platform::from_extractor)
        .unwrap_or_else(|| Platform::from_url(query));

    Ok(ResolvedTrack {
        id: info.id.unwrap_or_default(),
        title: info.title.unwrap_or_else(|| "Unknown title".to_string()),
        direct_url,
        duration: if is_live {
            None
        } else {
            info.duration
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(Duration::from_secs_f64)
        },
        is_live,
        platform,
        uploader: info.uploader,
        thumbnail: info.thumbnail,
        webpage_url: info.webpage_url,
    })
}

/// Traduce el stderr de yt-dlp a la taxonomía de errores
fn classify_stderr(query: &str, stderr: &str) -> ResolveError {
    let lower = stderr.to_lowercase();

    if lower.contains("http error 429") || lower.contains("too many requests") {
        ResolveError::RateLimited
    } else if lower.contains("private video")
        || lower.contains("video unavailable")
        || lower.contains("not available in your country")
        || lower.contains("sign in to confirm")
        || lower.contains("live event will begin")
    {
        let line = stderr
            .lines()
            .find(|l| l.contains("ERROR"))
            .unwrap_or("unavailable")
            .trim()
            .to_string();
        ResolveError::Unplayable(line)
    } else if lower.contains("unsupported url") || lower.contains("no video results") {
        ResolveError::NotFound(query.to_string())
    } else {
        ResolveError::Failed(stderr.lines().last().unwrap_or_default().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_first_search_entry() {
        let json = br#"{
            "_type": "playlist",
            "entries": [{
                "id": "dQw4w9WgXcQ",
                "title": "Never Gonna Give You Up",
                "url": "https://rr1.googlevideo.com/audio",
                "duration": 212.0,
                "is_live": false,
                "extractor_key": "Youtube",
                "uploader": "Rick Astley",
                "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg",
                "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
            }]
        }"#;

        let track = parse_output("rick", json).unwrap();
        assert_eq!(track.title, "Never Gonna Give You Up");
        assert_eq!(track.duration, Some(Duration::from_secs(212)));
        assert_eq!(track.platform, Platform::YouTube);
        assert!(!track.is_live);
    }

    #[test]
    fn search_targets_by_query_kind() {
        assert_eq!(search_target("lofi beats"), "ytsearch1:lofi beats");
        assert_eq!(
            search_target("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(
            search_target("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC?si=abc"),
            "ytsearch1:spotify track 4uLU6hMCjMI75M1A2tKUQC"
        );
    }

    #[test]
    fn live_streams_have_no_duration() {
        let json = br#"{"id": "x", "title": "radio", "url": "https://live/x.m3u8",
            "duration": 12.0, "is_live": true, "extractor": "twitch:stream"}"#;
        let track = parse_output("https://twitch.tv/x", json).unwrap();
        assert!(track.is_live);
        assert_eq!(track.duration, None);
        assert_eq!(track.platform, Platform::Twitch);
    }

    #[test]
    fn empty_search_is_not_found() {
        let json = br#"{"_type": "playlist", "entries": []}"#;
        assert_eq!(
            parse_output("nothing", json),
            Err(ResolveError::NotFound("nothing".into()))
        );
    }

    #[test]
    fn classifies_common_failures() {
        assert_eq!(
            classify_stderr("q", "ERROR: HTTP Error 429: Too Many Requests"),
            ResolveError::RateLimited
        );
        assert!(matches!(
            classify_stderr("q", "ERROR: [youtube] abc: Private video"),
            ResolveError::Unplayable(_)
        ));
        assert_eq!(
            classify_stderr("q", "ERROR: Unsupported URL: https://x"),
            ResolveError::NotFound("q".into())
        );
    }
}

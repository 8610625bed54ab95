//! Turns engine events into chat messages.
//!
//! The engine knows nothing about Discord channels; the bot remembers the
//! text channel each guild last used a command in and the presenter posts
//! there. Progress ticks and state changes only go to the logs.

use dashmap::DashMap;
use serenity::{
    http::Http,
    model::id::{ChannelId, GuildId},
};
use std::{fmt::Write as _, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        events::{EngineEvent, EventKind, PlayerSnapshot, TrackEndReason},
        queue::{LoopMode, QueueSnapshot},
        track::{format_time, Track, TrackLength},
    },
    error::ErrorKind,
};

const PAGE_SIZE: usize = 10;

/// Consume eventos del motor hasta que se cierre el canal
pub async fn run(
    http: Arc<Http>,
    events: flume::Receiver<EngineEvent>,
    channels: Arc<DashMap<GuildId, ChannelId>>,
) {
    info!("📣 Presentador de eventos iniciado");

    while let Ok(event) = events.recv_async().await {
        let guild_id = event.guild_id;

        match &event.kind {
            EventKind::ProgressTick { position, .. } => {
                debug!("⏱️ guild {}: {}", guild_id, format_time(*position));
            }
            EventKind::StateChanged { state } => {
                debug!("guild {} -> {:?}", guild_id, state);
            }
            _ => {}
        }

        let Some(text) = render(&event.kind) else {
            continue;
        };
        let channel = channels.get(&guild_id).map(|c| *c);
        if let Some(channel) = channel {
            if let Err(e) = channel.say(&http, text).await {
                warn!("⚠️ No se pudo publicar en el canal {}: {:?}", channel, e);
            }
        }

        if matches!(event.kind, EventKind::IdleDisconnect) {
            channels.remove(&guild_id);
        }
    }

    info!("📣 Presentador de eventos detenido");
}

/// Mensaje para un evento, o `None` si no se publica
pub fn render(kind: &EventKind) -> Option<String> {
    match kind {
        EventKind::TrackStarted {
            track,
            position,
            total,
        } => Some(format!(
            "🎵 Reproduciendo: **{}** ({}) [{}/{}] · pedido por <@{}>",
            track.title(),
            length_label(track.length()),
            position,
            total,
            track.requested_by()
        )),
        EventKind::TrackEnded {
            track,
            reason: TrackEndReason::Skipped,
        } => Some(format!("⏭️ Saltada: **{}**", track.title())),
        EventKind::ErrorOccurred { kind, message } => Some(match kind {
            ErrorKind::Resolution => format!("❌ No se pudo cargar la pista, pasando a la siguiente: {}", message),
            ErrorKind::TranscodeSpawn | ErrorKind::Playback | ErrorKind::StreamExpired => {
                format!("❌ Error de reproducción, pasando a la siguiente: {}", message)
            }
            ErrorKind::VoiceConnectionLost => "🔌 Se perdió la conexión de voz".to_string(),
            ErrorKind::InvalidCommand | ErrorKind::Closed => format!("❌ {}", message),
        }),
        EventKind::IdleDisconnect => Some("👋 Desconectado por inactividad".to_string()),
        EventKind::TrackEnded { .. }
        | EventKind::QueueChanged { .. }
        | EventKind::ProgressTick { .. }
        | EventKind::StateChanged { .. } => None,
    }
}

fn length_label(length: TrackLength) -> String {
    match length {
        TrackLength::Finite(total) => format_time(total),
        TrackLength::Live => "🔴 En vivo".to_string(),
    }
}

fn loop_label(mode: LoopMode) -> &'static str {
    match mode {
        LoopMode::Off => "➡️ sin repetición",
        LoopMode::Single => "🔂 repitiendo canción",
        LoopMode::All => "🔁 repitiendo cola",
    }
}

fn track_line(out: &mut String, number: usize, track: &Track) {
    let _ = writeln!(
        out,
        "`{}.` {} ({})",
        number,
        track.title(),
        length_label(track.length())
    );
}

/// Página de la cola (base 1) en texto plano
pub fn format_queue(queue: &QueueSnapshot, page: usize) -> String {
    if queue.tracks.is_empty() {
        return "📭 La cola está vacía".to_string();
    }

    let pages = queue.tracks.len().div_ceil(PAGE_SIZE);
    let page = page.clamp(1, pages);
    let start = (page - 1) * PAGE_SIZE;

    let mut out = format!(
        "📜 **Cola** · {} pistas · {} · {}\n",
        queue.tracks.len(),
        format_time(queue.total_duration),
        loop_label(queue.loop_mode)
    );
    for (i, track) in queue.tracks.iter().enumerate().skip(start).take(PAGE_SIZE) {
        if queue.current_index == Some(i) {
            out.push_str("▶️ ");
        }
        track_line(&mut out, i + 1, track);
    }
    if pages > 1 {
        let _ = write!(out, "Página {}/{}", page, pages);
    }
    out
}

pub fn format_now_playing(snapshot: &PlayerSnapshot) -> String {
    let Some(track) = &snapshot.current else {
        return "❌ No hay nada reproduciéndose actualmente".to_string();
    };

    let position = snapshot.position.unwrap_or(Duration::ZERO);
    let progress = match track.length() {
        TrackLength::Finite(total) => {
            format!("{} {} / {}", progress_bar(position, total), format_time(position), format_time(total))
        }
        TrackLength::Live => format!("🔴 En vivo · {}", format_time(position)),
    };

    let mut out = format!("🎵 **{}**\n{}\n", track.title(), progress);
    if let Some(uploader) = track.uploader() {
        let _ = writeln!(out, "🎤 {}", uploader);
    }
    let _ = write!(
        out,
        "🔊 {}% · 🎛️ {} · {}",
        (snapshot.volume * 100.0).round() as u32,
        snapshot.effect.name,
        loop_label(snapshot.queue.loop_mode)
    );
    out
}

fn progress_bar(position: Duration, total: Duration) -> String {
    const WIDTH: usize = 12;
    let filled = if total.is_zero() {
        0
    } else {
        ((position.as_secs_f64() / total.as_secs_f64()) * WIDTH as f64).round() as usize
    };
    let filled = filled.min(WIDTH);
    format!("{}🔘{}", "▬".repeat(filled), "▬".repeat(WIDTH - filled))
}

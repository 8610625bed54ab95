use serde::Serialize;
use serenity::model::id::GuildId;
use std::time::Duration;
use tracing::trace;

use crate::{
    audio::{
        effects::{EffectSettings, QualityPreset},
        queue::QueueSnapshot,
        track::{Track, TrackLength},
    },
    error::ErrorKind,
};

/// Estado del reproductor de un guild
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Idle,
    Loading,
    Playing,
    Paused,
    /// La cola terminó; el temporizador de inactividad está corriendo
    Draining,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackEndReason {
    Finished,
    Skipped,
    Error,
    Stopped,
}

/// Evento publicado hacia la capa de presentación
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub guild_id: GuildId,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TrackStarted {
        track: Track,
        /// Posición en la cola (base 1)
        position: usize,
        total: usize,
    },
    TrackEnded {
        track: Track,
        reason: TrackEndReason,
    },
    QueueChanged {
        snapshot: QueueSnapshot,
    },
    ProgressTick {
        position: Duration,
        length: TrackLength,
    },
    ErrorOccurred {
        kind: ErrorKind,
        message: String,
    },
    IdleDisconnect,
    StateChanged {
        state: PlayerState,
    },
}

/// Estado completo del reproductor para `/nowplaying` y similares
#[derive(Debug, Clone, Serialize)]
pub struct PlayerSnapshot {
    pub state: PlayerState,
    pub current: Option<Track>,
    pub position: Option<Duration>,
    pub queue: QueueSnapshot,
    pub volume: f32,
    pub effect: EffectSettings,
    pub preset: QualityPreset,
    pub listeners: usize,
}

/// Emisor de eventos ligado a un guild
#[derive(Debug, Clone)]
pub struct EventBus {
    guild_id: GuildId,
    tx: flume::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(guild_id: GuildId, tx: flume::Sender<EngineEvent>) -> Self {
        Self { guild_id, tx }
    }

    pub fn emit(&self, kind: EventKind) {
        let event = EngineEvent {
            guild_id: self.guild_id,
            kind,
        };
        // Sin presentador conectado los eventos se descartan
        if self.tx.send(event).is_err() {
            trace!("Evento descartado, no hay receptor");
        }
    }
}

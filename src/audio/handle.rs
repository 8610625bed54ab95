use serde::Serialize;
use serenity::model::id::{GuildId, UserId};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::{
    audio::{
        effects::{EffectSettings, QualityPreset},
        events::PlayerSnapshot,
        queue::LoopMode,
        track::Track,
    },
    error::{EngineError, Result},
    sources::{ResolveError, ResolvedTrack},
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Mensajes que procesa el actor de un guild, en orden de llegada
#[derive(Debug)]
pub(crate) enum Intent {
    AddTrack {
        query: String,
        requester: UserId,
        reply: Reply<AddedTrack>,
    },
    /// Resultado de la resolución lanzada por `AddTrack`
    Resolved {
        query: String,
        requester: UserId,
        result: std::result::Result<ResolvedTrack, ResolveError>,
        reply: Reply<AddedTrack>,
    },
    /// Resultado de refrescar el localizador de la pista actual
    Refreshed {
        generation: u64,
        result: std::result::Result<ResolvedTrack, ResolveError>,
    },
    RemoveTrack {
        index: usize,
        reply: Reply<Track>,
    },
    MoveTrack {
        from: usize,
        to: usize,
        reply: Reply<()>,
    },
    Clear {
        reply: Reply<usize>,
    },
    Shuffle {
        reply: Reply<bool>,
    },
    SetLoop {
        mode: LoopMode,
        reply: Reply<()>,
    },
    Skip {
        user: UserId,
        forced: bool,
        reply: Reply<SkipOutcome>,
    },
    Previous {
        reply: Reply<Track>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Seek {
        position: Duration,
        reply: Reply<()>,
    },
    SetEffect {
        name: String,
        intensity: Option<f64>,
        reply: Reply<EffectSettings>,
    },
    SetPreset {
        preset: QualityPreset,
        reply: Reply<()>,
    },
    SetVolume {
        volume: f32,
        reply: Reply<f32>,
    },
    ListenersChanged {
        count: usize,
        reply: Reply<()>,
    },
    VoiceLost {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<PlayerSnapshot>,
    },
    Leave {
        reply: Reply<()>,
    },
    InactivityExpired {
        timer_id: u64,
    },
}

/// Pista añadida y su posición en la cola (base 0)
#[derive(Debug, Clone, Serialize)]
pub struct AddedTrack {
    pub track: Track,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SkipOutcome {
    Skipped,
    Voted { votes: usize, required: usize },
}

/// Votos necesarios para saltar: la mitad de los oyentes, redondeando hacia arriba
pub fn required_votes(listeners: usize) -> usize {
    listeners.div_ceil(2).max(1)
}

/// Punto de entrada a los comandos de un guild.
///
/// Cada método envía un intent al actor y espera su respuesta. Si el actor
/// ya terminó devuelve [`EngineError::Closed`].
#[derive(Debug, Clone)]
pub struct GuildHandle {
    guild_id: GuildId,
    tx: mpsc::Sender<Intent>,
}

impl GuildHandle {
    pub(crate) fn new(guild_id: GuildId, tx: mpsc::Sender<Intent>) -> Self {
        Self { guild_id, tx }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Espera a que el actor termine
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Intent) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Resuelve y encola; responde cuando la resolución termina
    pub async fn add_track(&self, query: impl Into<String>, requester: UserId) -> Result<AddedTrack> {
        let query = query.into();
        self.request(|reply| Intent::AddTrack {
            query,
            requester,
            reply,
        })
        .await
    }

    pub async fn remove_track(&self, index: usize) -> Result<Track> {
        self.request(|reply| Intent::RemoveTrack { index, reply }).await
    }

    pub async fn move_track(&self, from: usize, to: usize) -> Result<()> {
        self.request(|reply| Intent::MoveTrack { from, to, reply })
            .await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.request(|reply| Intent::Clear { reply }).await
    }

    pub async fn shuffle(&self) -> Result<bool> {
        self.request(|reply| Intent::Shuffle { reply }).await
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> Result<()> {
        self.request(|reply| Intent::SetLoop { mode, reply }).await
    }

    pub async fn skip_vote(&self, user: UserId, forced: bool) -> Result<SkipOutcome> {
        self.request(|reply| Intent::Skip {
            user,
            forced,
            reply,
        })
        .await
    }

    pub async fn previous(&self) -> Result<Track> {
        self.request(|reply| Intent::Previous { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| Intent::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| Intent::Resume { reply }).await
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.request(|reply| Intent::Seek { position, reply }).await
    }

    pub async fn set_effect(&self, name: impl Into<String>, intensity: Option<f64>) -> Result<EffectSettings> {
        let name = name.into();
        self.request(|reply| Intent::SetEffect {
            name,
            intensity,
            reply,
        })
        .await
    }

    pub async fn set_quality_preset(&self, preset: QualityPreset) -> Result<()> {
        self.request(|reply| Intent::SetPreset { preset, reply })
            .await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<f32> {
        self.request(|reply| Intent::SetVolume { volume, reply })
            .await
    }

    pub async fn listeners_changed(&self, count: usize) -> Result<()> {
        self.request(|reply| Intent::ListenersChanged { count, reply })
            .await
    }

    pub async fn voice_lost(&self) -> Result<()> {
        self.request(|reply| Intent::VoiceLost { reply }).await
    }

    pub async fn snapshot(&self) -> Result<PlayerSnapshot> {
        self.request(|reply| Intent::Snapshot { reply }).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.request(|reply| Intent::Leave { reply }).await
    }
}

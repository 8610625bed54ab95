use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::GuildId;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    audio::{
        events::EngineEvent, handle::GuildHandle, player::PlaybackController,
        transcoder::Transcoder, voice::VoiceConnection,
    },
    config::EngineConfig,
    sources::TrackResolver,
};

/// Colaboradores compartidos por todos los guilds
#[derive(Clone)]
pub struct EngineDeps {
    pub resolver: Arc<dyn TrackResolver>,
    pub transcoder: Arc<dyn Transcoder>,
    pub events: flume::Sender<EngineEvent>,
    pub config: EngineConfig,
}

pub(crate) struct GuildEntry {
    /// Distingue un actor de su sucesor en el mismo guild
    pub(crate) instance: u64,
    pub(crate) handle: GuildHandle,
    pub(crate) token: CancellationToken,
}

pub(crate) type EngineMap = Arc<DashMap<GuildId, GuildEntry>>;

/// Registro de reproductores activos, uno por guild.
///
/// Se crean en el primer uso y se eliminan solos al terminar (leave,
/// inactividad o pérdida de la conexión de voz).
#[derive(Clone)]
pub struct GuildEngineRegistry {
    engines: EngineMap,
    deps: EngineDeps,
    next_instance: Arc<AtomicU64>,
}

impl GuildEngineRegistry {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            engines: Arc::new(DashMap::new()),
            deps,
            next_instance: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<GuildHandle> {
        self.engines.get(&guild_id).map(|entry| entry.handle.clone())
    }

    /// Devuelve el reproductor del guild, creándolo con `voice` si no existe
    pub fn get_or_spawn(&self, guild_id: GuildId, voice: Arc<dyn VoiceConnection>) -> GuildHandle {
        match self.engines.entry(guild_id) {
            Entry::Occupied(entry) => entry.get().handle.clone(),
            Entry::Vacant(entry) => {
                let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
                let (handle, token) = PlaybackController::spawn(
                    guild_id,
                    instance,
                    &self.deps,
                    voice,
                    self.engines.clone(),
                );
                info!("🆕 Reproductor #{} creado para guild {}", instance, guild_id);

                entry.insert(GuildEntry {
                    instance,
                    handle: handle.clone(),
                    token,
                });
                handle
            }
        }
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.engines.contains_key(&guild_id)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Cancela todos los reproductores y espera a que terminen
    pub async fn shutdown(&self) {
        let running: Vec<(GuildHandle, CancellationToken)> = self
            .engines
            .iter()
            .map(|entry| (entry.handle.clone(), entry.token.clone()))
            .collect();

        info!("🛑 Cerrando {} reproductores", running.len());
        for (_, token) in &running {
            token.cancel();
        }
        for (handle, _) in running {
            handle.closed().await;
        }
    }
}

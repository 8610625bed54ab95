use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::{
    model::id::{ChannelId, GuildId},
    prelude::Context,
};
use songbird::{
    events::CoreEvent,
    input::{Input, RawAdapter},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird,
};
use std::sync::Arc;
use symphonia::core::io::ReadOnlySource;
use tokio_util::io::SyncIoBridge;
use tracing::{error, info, warn};

use crate::audio::{
    handle::GuildHandle,
    registry::GuildEngineRegistry,
    transcoder::{PcmStream, CHANNELS, SAMPLE_RATE},
    voice::{VoiceConnection, VoiceError},
};

/// Canal de voz de un guild sobre songbird
pub struct SongbirdVoice {
    guild_id: GuildId,
    manager: Arc<Songbird>,
    call: Arc<tokio::sync::Mutex<Call>>,
    current: Mutex<Option<TrackHandle>>,
}

impl SongbirdVoice {
    pub fn new(guild_id: GuildId, manager: Arc<Songbird>, call: Arc<tokio::sync::Mutex<Call>>) -> Self {
        Self {
            guild_id,
            manager,
            call,
            current: Mutex::new(None),
        }
    }

    fn with_track(&self, op: impl FnOnce(&TrackHandle) -> songbird::tracks::TrackResult<()>) -> Result<(), VoiceError> {
        let current = self.current.lock();
        let track = current.as_ref().ok_or(VoiceError::NotConnected)?;
        op(track).map_err(|e| VoiceError::Driver(e.to_string()))
    }
}

#[async_trait]
impl VoiceConnection for SongbirdVoice {
    async fn play(&self, pcm: PcmStream, volume: f32) -> Result<(), VoiceError> {
        // El mixer de songbird lee de forma síncrona desde su propio hilo
        let source = ReadOnlySource::new(SyncIoBridge::new(pcm));
        let input: Input = RawAdapter::new(source, SAMPLE_RATE, CHANNELS).into();

        let mut call = self.call.lock().await;
        if call.current_channel().is_none() {
            return Err(VoiceError::NotConnected);
        }
        call.stop();
        let track = call.play_input(input);
        if let Err(e) = track.set_volume(volume) {
            warn!("⚠️ No se pudo ajustar el volumen inicial: {}", e);
        }

        *self.current.lock() = Some(track);
        Ok(())
    }

    fn stop(&self) {
        if let Some(track) = self.current.lock().take() {
            let _ = track.stop();
        }
    }

    fn pause(&self) -> Result<(), VoiceError> {
        self.with_track(|t| t.pause())
    }

    fn resume(&self) -> Result<(), VoiceError> {
        self.with_track(|t| t.play())
    }

    fn set_volume(&self, volume: f32) -> Result<(), VoiceError> {
        self.with_track(|t| t.set_volume(volume))
    }

    async fn disconnect(&self) {
        self.stop();
        if let Err(e) = self.manager.remove(self.guild_id).await {
            warn!("⚠️ Error al salir del canal de voz en guild {}: {:?}", self.guild_id, e);
        } else {
            info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
        }
    }
}

/// Avisa al reproductor cuando el driver de voz se cae
struct DriverDisconnectHandler {
    guild_id: GuildId,
    handle: GuildHandle,
}

#[async_trait]
impl VoiceEventHandler for DriverDisconnectHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(_) = ctx {
            warn!("🔌 Driver de voz desconectado en guild {}", self.guild_id);
            let handle = self.handle.clone();
            tokio::spawn(async move {
                // Cerrado = ya se fue por su cuenta
                let _ = handle.voice_lost().await;
            });
        }

        None
    }
}

/// Devuelve el reproductor del guild, uniéndose a `channel_id` si aún no existe
pub async fn connect(
    ctx: &Context,
    registry: &GuildEngineRegistry,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> Result<GuildHandle> {
    if let Some(handle) = registry.get(guild_id) {
        return Ok(handle);
    }

    let manager = songbird::get(ctx)
        .await
        .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;

    let call = manager.join(guild_id, channel_id).await.map_err(|e| {
        error!("Error al conectar al canal de voz: {:?}", e);
        anyhow::anyhow!("No pude conectarme a tu canal de voz")
    })?;
    info!("🔊 Conectado al canal de voz {} en guild {}", channel_id, guild_id);

    let voice = Arc::new(SongbirdVoice::new(guild_id, manager, call.clone()));
    let handle = registry.get_or_spawn(guild_id, voice);

    call.lock().await.add_global_event(
        Event::Core(CoreEvent::DriverDisconnect),
        DriverDisconnectHandler {
            guild_id,
            handle: handle.clone(),
        },
    );

    Ok(handle)
}

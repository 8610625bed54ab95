//! # Bot Module
//!
//! Discord adapter around the playback engine.
//!
//! This module contains everything that knows about Discord:
//! - Slash command registration and dispatch onto [`GuildHandle`] methods
//! - The songbird-backed voice sink and driver-disconnect reporting
//! - Voice state tracking, reported to each guild's player as a listener count
//! - The presenter that posts engine events to the guild's text channel
//!
//! [`GuildHandle`]: crate::audio::GuildHandle

use anyhow::Result;
use dashmap::DashMap;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;
pub mod presenter;
pub mod voice;

use crate::{audio::GuildEngineRegistry, config::Config};

/// Handler de eventos de Discord
pub struct JukeboxBot {
    config: Arc<Config>,
    pub registry: GuildEngineRegistry,
    /// Último canal de texto usado por guild; ahí publica el presentador
    pub text_channels: Arc<DashMap<GuildId, ChannelId>>,
}

impl JukeboxBot {
    pub fn new(
        config: Config,
        registry: GuildEngineRegistry,
        text_channels: Arc<DashMap<GuildId, ChannelId>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            text_channels,
        }
    }

    /// Registra los comandos slash, globales o por guild según `GUILD_ID`
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        match self.config.guild_id {
            Some(guild_id) => {
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);
                let guild_id = GuildId::new(guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registrando comandos de guild: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Informa al reproductor del guild de cuántos oyentes quedan en su canal
    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let Some(player) = self.registry.get(guild_id) else {
            return;
        };

        let bot_id = ctx.cache.current_user().id;
        if new.user_id == bot_id && new.channel_id.is_none() {
            info!("🔌 Bot desconectado del canal de voz en guild {}", guild_id);
            let _ = player.voice_lost().await;
            return;
        }

        if let Some(count) = listener_count(&ctx, guild_id) {
            debug!("👥 {} oyentes en guild {}", count, guild_id);
            if let Err(e) = player.listeners_changed(count).await {
                debug!("Reproductor de guild {} ya cerrado: {}", guild_id, e);
            }
        }
    }
}

/// Canal de voz en el que está el bot, según la caché
pub(crate) fn bot_voice_channel(ctx: &Context, guild_id: GuildId) -> Option<ChannelId> {
    let bot_id = ctx.cache.current_user().id;
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild.voice_states.get(&bot_id)?.channel_id
}

/// Oyentes humanos en el canal de voz del bot, según la caché
pub(crate) fn listener_count(ctx: &Context, guild_id: GuildId) -> Option<usize> {
    let channel = bot_voice_channel(ctx, guild_id)?;
    let bot_id = ctx.cache.current_user().id;
    let guild = guild_id.to_guild_cached(&ctx.cache)?;

    let count = guild
        .voice_states
        .values()
        .filter(|vs| vs.channel_id == Some(channel) && vs.user_id != bot_id)
        .filter(|vs| !vs.member.as_ref().is_some_and(|m| m.user.bot))
        .count();
    Some(count)
}

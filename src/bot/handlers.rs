use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::{CommandDataOptionValue, CommandInteraction},
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::time::Duration;
use tracing::info;

use crate::{
    audio::{handle::GuildHandle, LoopMode, QualityPreset, SkipOutcome},
    bot::{bot_voice_channel, presenter, voice, JukeboxBot},
    error::EngineError,
};

/// Comandos con handler, en el mismo orden que el `match` de abajo
pub const COMMANDS: &[&str] = &[
    "play",
    "skip",
    "previous",
    "pause",
    "resume",
    "seek",
    "queue",
    "nowplaying",
    "remove",
    "move",
    "shuffle",
    "loop",
    "clear",
    "volume",
    "effect",
    "quality",
    "leave",
];

/// Comandos que solo consultan y se pueden usar desde fuera del canal
const READ_ONLY: &[&str] = &["queue", "nowplaying"];

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &JukeboxBot) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );
    bot.text_channels.insert(guild_id, command.channel_id);

    if command.data.name == "play" {
        return handle_play(ctx, &command, bot, guild_id).await;
    }

    let Some(player) = bot.registry.get(guild_id) else {
        return respond(ctx, &command, "❌ No hay nada reproduciéndose actualmente", true).await;
    };

    if !READ_ONLY.contains(&command.data.name.as_str()) {
        let user_channel = user_voice_channel(ctx, guild_id, command.user.id);
        if let Err(e) = require_same_channel(user_channel, bot_voice_channel(ctx, guild_id)) {
            return respond(ctx, &command, format!("❌ {}", e), true).await;
        }
    }

    let reply = match command.data.name.as_str() {
        "skip" => {
            let forced = bool_option(&command, "force").unwrap_or(false);
            if forced && !can_force(&command) {
                return respond(ctx, &command, "❌ Necesitas el permiso Gestionar canales para forzar", true)
                    .await;
            }
            player.skip_vote(command.user.id, forced).await.map(|outcome| match outcome {
                SkipOutcome::Skipped => "⏭️ Saltada".to_string(),
                SkipOutcome::Voted { votes, required } => {
                    format!("🗳️ Voto registrado ({}/{})", votes, required)
                }
            })
        }
        "previous" => player
            .previous()
            .await
            .map(|track| format!("⏮️ Volviendo a **{}**", track.title())),
        "pause" => player.pause().await.map(|_| "⏸️ Reproducción pausada".to_string()),
        "resume" => player.resume().await.map(|_| "▶️ Reproducción reanudada".to_string()),
        "seek" => {
            let raw = str_option(&command, "position").unwrap_or_default();
            match parse_timestamp(raw) {
                Some(position) => player
                    .seek(position)
                    .await
                    .map(|_| format!("⏩ Saltando a {}", crate::audio::track::format_time(position))),
                None => Err(EngineError::invalid(format!("Posición inválida: {}", raw))),
            }
        }
        "queue" => {
            let page = int_option(&command, "page").unwrap_or(1).max(1) as usize;
            player
                .snapshot()
                .await
                .map(|snapshot| presenter::format_queue(&snapshot.queue, page))
        }
        "nowplaying" => player
            .snapshot()
            .await
            .map(|snapshot| presenter::format_now_playing(&snapshot)),
        "remove" => match position_option(&command, "position") {
            Some(index) => player
                .remove_track(index)
                .await
                .map(|track| format!("❌ Quitada: **{}**", track.title())),
            None => Err(EngineError::invalid("Posición inválida")),
        },
        "move" => match (position_option(&command, "from"), position_option(&command, "to")) {
            (Some(from), Some(to)) => player
                .move_track(from, to)
                .await
                .map(|_| format!("📍 Pista movida de {} a {}", from + 1, to + 1)),
            _ => Err(EngineError::invalid("Posición inválida")),
        },
        "shuffle" => player.shuffle().await.map(|shuffled| {
            if shuffled {
                "🔀 Cola mezclada".to_string()
            } else {
                "➡️ No hay suficientes pistas para mezclar".to_string()
            }
        }),
        "loop" => {
            let raw = str_option(&command, "mode").unwrap_or("off");
            match LoopMode::parse(raw) {
                Some(mode) => player.set_loop_mode(mode).await.map(|_| match mode {
                    LoopMode::Single => "🔂 Repetir canción activado".to_string(),
                    LoopMode::All => "🔁 Repetir cola activado".to_string(),
                    LoopMode::Off => "➡️ Repetición desactivada".to_string(),
                }),
                None => Err(EngineError::invalid(format!("Modo desconocido: {}", raw))),
            }
        }
        "clear" => player
            .clear()
            .await
            .map(|removed| format!("🗑️ Cola limpiada ({} pistas)", removed)),
        "volume" => match int_option(&command, "level") {
            Some(level) => player
                .set_volume(level as f32 / 100.0)
                .await
                .map(|v| format!("🔊 Volumen ajustado a {}%", (v * 100.0).round() as u32)),
            None => player
                .snapshot()
                .await
                .map(|s| format!("🔊 Volumen actual: {}%", (s.volume * 100.0).round() as u32)),
        },
        "effect" => {
            let name = str_option(&command, "type").unwrap_or("none");
            let intensity = number_option(&command, "intensity");
            player
                .set_effect(name, intensity)
                .await
                .map(|settings| format!("🎛️ Efecto {} ({})", settings.name, settings.intensity))
        }
        "quality" => {
            let raw = str_option(&command, "preset").unwrap_or("standard");
            match QualityPreset::parse(raw) {
                Some(preset) => player
                    .set_quality_preset(preset)
                    .await
                    .map(|_| format!("🎚️ Preset de calidad: {}", preset.description())),
                None => Err(EngineError::invalid(format!("Preset desconocido: {}", raw))),
            }
        }
        "leave" => {
            let result = player.leave().await.map(|_| "👋 Desconectado del canal de voz".to_string());
            bot.text_channels.remove(&guild_id);
            result
        }
        _ => Ok("❌ Comando no reconocido".to_string()),
    };

    match reply {
        Ok(text) => respond(ctx, &command, text, false).await,
        Err(e) => respond(ctx, &command, format!("❌ {}", e), true).await,
    }
}

async fn handle_play(ctx: &Context, command: &CommandInteraction, bot: &JukeboxBot, guild_id: GuildId) -> Result<()> {
    let query = str_option(command, "query")
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?
        .to_string();

    let Some(channel_id) = user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, command, "❌ Debes estar en un canal de voz", true).await;
    };
    if bot.registry.contains(guild_id) {
        if let Err(e) = require_same_channel(Some(channel_id), bot_voice_channel(ctx, guild_id)) {
            return respond(ctx, command, format!("❌ {}", e), true).await;
        }
    }

    // Defer la respuesta ya que la resolución puede tardar
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let text = match play(ctx, bot, guild_id, channel_id, query, command.user.id).await {
        Ok(text) => text,
        Err(e) => format!("❌ {}", e),
    };
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(text))
        .await?;

    Ok(())
}

async fn play(
    ctx: &Context,
    bot: &JukeboxBot,
    guild_id: GuildId,
    channel_id: ChannelId,
    query: String,
    user: UserId,
) -> Result<String> {
    let fresh = !bot.registry.contains(guild_id);
    let player: GuildHandle = voice::connect(ctx, &bot.registry, guild_id, channel_id).await?;
    if fresh {
        if let Some(count) = super::listener_count(ctx, guild_id) {
            player.listeners_changed(count).await?;
        }
    }

    let added = player.add_track(query, user).await?;
    Ok(format!(
        "➕ Agregado a la cola en la posición {}: **{}**",
        added.position + 1,
        added.track.title()
    ))
}

async fn respond(ctx: &Context, command: &CommandInteraction, content: impl Into<String>, ephemeral: bool) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;

    Ok(())
}

// Funciones auxiliares

fn option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .map(|opt| &opt.value)
}

fn str_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    option(command, name).and_then(|v| v.as_str())
}

fn int_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    option(command, name).and_then(|v| v.as_i64())
}

fn number_option(command: &CommandInteraction, name: &str) -> Option<f64> {
    option(command, name).and_then(|v| v.as_f64())
}

fn bool_option(command: &CommandInteraction, name: &str) -> Option<bool> {
    option(command, name).and_then(|v| v.as_bool())
}

/// Posición 1-based del usuario a índice de la cola
fn position_option(command: &CommandInteraction, name: &str) -> Option<usize> {
    int_option(command, name).and_then(to_index)
}

fn to_index(position: i64) -> Option<usize> {
    usize::try_from(position).ok()?.checked_sub(1)
}

fn can_force(command: &CommandInteraction) -> bool {
    command
        .member
        .as_ref()
        .and_then(|m| m.permissions)
        .is_some_and(|p| p.manage_channels())
}

fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

/// El usuario tiene que escuchar en el mismo canal que el bot
pub fn require_same_channel(user: Option<ChannelId>, bot: Option<ChannelId>) -> Result<(), EngineError> {
    match (user, bot) {
        (None, _) => Err(EngineError::invalid("Debes estar en un canal de voz")),
        (Some(user), Some(bot)) if user != bot => Err(EngineError::invalid(
            "Debes estar en el mismo canal de voz que el bot",
        )),
        _ => Ok(()),
    }
}

/// Acepta segundos (`90`), `MM:SS` o `HH:MM:SS`
pub fn parse_timestamp(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() > 3 {
        return None;
    }

    let mut total: u64 = 0;
    for (i, part) in parts.iter().enumerate() {
        let value: u64 = part.parse().ok()?;
        if i > 0 && value >= 60 {
            return None;
        }
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    Some(Duration::from_secs(total))
}

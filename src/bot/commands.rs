use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

use crate::audio::{effects::EFFECTS, QualityPreset};

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in definitions() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, definitions()).await?;

    Ok(())
}

pub fn definitions() -> Vec<CreateCommand> {
    vec![
        play_command(),
        skip_command(),
        previous_command(),
        pause_command(),
        resume_command(),
        seek_command(),
        queue_command(),
        nowplaying_command(),
        remove_command(),
        move_command(),
        shuffle_command(),
        loop_command(),
        clear_command(),
        volume_command(),
        effect_command(),
        quality_command(),
        leave_command(),
    ]
}

// Comandos de reproducción

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción o la agrega a la cola")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip")
        .description("Vota para saltar la canción actual")
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "force",
            "Saltar sin votación (requiere Gestionar canales)",
        ))
}

fn previous_command() -> CreateCommand {
    CreateCommand::new("previous").description("Vuelve a la canción anterior")
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn seek_command() -> CreateCommand {
    CreateCommand::new("seek")
        .description("Salta a una posición de la canción actual")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "position",
                "Posición (ej: 90, 1:30, 1:02:00)",
            )
            .required(true),
        )
}

// Comandos de cola

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Muestra la cola de reproducción")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Número de página")
                .min_int_value(1),
        )
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Muestra información de la canción actual")
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Quita una canción de la cola")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "position", "Posición en la cola")
                .min_int_value(1)
                .required(true),
        )
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Mueve una canción dentro de la cola")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "from", "Posición actual")
                .min_int_value(1)
                .required(true),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "to", "Nueva posición")
                .min_int_value(1)
                .required(true),
        )
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla las canciones pendientes")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Configura el modo de repetición")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Modo de repetición")
                .add_string_choice("Desactivar", "off")
                .add_string_choice("Canción", "single")
                .add_string_choice("Cola", "all")
                .required(true),
        )
}

fn clear_command() -> CreateCommand {
    CreateCommand::new("clear").description("Limpia la cola (la canción actual sigue sonando)")
}

// Comandos de audio

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Ajusta el volumen de reproducción")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "level",
                "Nivel de volumen (0-200)",
            )
            .min_int_value(0)
            .max_int_value(200),
        )
}

fn effect_command() -> CreateCommand {
    let kind = EFFECTS.iter().fold(
        CreateCommandOption::new(CommandOptionType::String, "type", "Tipo de efecto").required(true),
        |option, effect| option.add_string_choice(effect.label, effect.name),
    );

    CreateCommand::new("effect")
        .description("Aplica un efecto de audio")
        .add_option(kind)
        .add_option(CreateCommandOption::new(
            CommandOptionType::Number,
            "intensity",
            "Intensidad del efecto",
        ))
}

fn quality_command() -> CreateCommand {
    let preset = QualityPreset::ALL.iter().fold(
        CreateCommandOption::new(CommandOptionType::String, "preset", "Preset de calidad")
            .required(true),
        |option, preset| option.add_string_choice(preset.description(), preset.as_str()),
    );

    CreateCommand::new("quality")
        .description("Cambia el preset de calidad de audio")
        .add_option(preset)
}

// Comandos de conexión

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Detiene todo y desconecta el bot del canal de voz")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn command_names_are_unique_and_dispatched() {
        let names: Vec<String> = definitions()
            .iter()
            .map(|c| serde_json::to_value(c).unwrap()["name"].as_str().unwrap().to_string())
            .collect();

        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        for name in &names {
            assert!(
                crate::bot::handlers::COMMANDS.contains(&name.as_str()),
                "/{} no tiene handler",
                name
            );
        }
    }

    #[test]
    fn effect_choices_cover_the_registry() {
        let json = serde_json::to_value(effect_command()).unwrap();
        let choices = json["options"][0]["choices"].as_array().unwrap();
        assert_eq!(choices.len(), EFFECTS.len());
        assert_eq!(choices[0]["value"], "none");
    }
}

use anyhow::{Context, Result};
use serde::Serialize;
use std::{str::FromStr, time::Duration};

/// Parámetros del motor de reproducción, compartidos por todos los guilds
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub default_volume: f32,
    pub max_queue_size: usize,
    /// Espera con la cola agotada antes de desconectar
    pub idle_timeout: Duration,
    /// Espera con el canal vacío antes de desconectar
    pub alone_timeout: Duration,
    pub resolve_timeout: Duration,
    /// Edad máxima de un localizador de stream antes de volver a resolverlo
    pub locator_ttl: Duration,
    /// Margen para que el transcodificador salga limpio antes de matarlo
    pub stop_grace: Duration,
    pub inbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_volume: 0.5,
            max_queue_size: 1000,
            idle_timeout: Duration::from_secs(180),
            alone_timeout: Duration::from_secs(60),
            resolve_timeout: Duration::from_secs(30),
            locator_ttl: Duration::from_secs(30 * 60),
            stop_grace: Duration::from_secs(2),
            inbox_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    // Discord
    #[serde(skip)]
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Rendimiento
    pub worker_threads: usize,

    // Binarios externos
    pub ffmpeg_path: String,
    pub ytdlp_path: String,

    pub engine: EngineConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key: &str| std::env::var(key).ok())?;

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Construye la configuración a partir de una fuente de variables
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = EngineConfig::default();

        Ok(Self {
            // Discord
            discord_token: lookup("DISCORD_TOKEN").context("DISCORD_TOKEN no está definido")?,
            application_id: lookup("APPLICATION_ID")
                .context("APPLICATION_ID no está definido")?
                .parse()
                .context("APPLICATION_ID inválido")?,
            guild_id: lookup("GUILD_ID").and_then(|s| s.parse().ok()),

            worker_threads: match lookup("WORKER_THREADS") {
                Some(val) if !val.trim().is_empty() => val.parse().context("WORKER_THREADS inválido")?,
                _ => num_cpus::get(),
            },

            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            ytdlp_path: lookup("YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),

            engine: EngineConfig {
                default_volume: parse_or(&lookup, "DEFAULT_VOLUME", defaults.default_volume)?,
                max_queue_size: parse_or(&lookup, "MAX_QUEUE_SIZE", defaults.max_queue_size)?,
                idle_timeout: duration_or(&lookup, "IDLE_TIMEOUT", defaults.idle_timeout)?,
                alone_timeout: duration_or(&lookup, "ALONE_TIMEOUT", defaults.alone_timeout)?,
                resolve_timeout: duration_or(&lookup, "RESOLVE_TIMEOUT", defaults.resolve_timeout)?,
                locator_ttl: duration_or(&lookup, "LOCATOR_TTL", defaults.locator_ttl)?,
                stop_grace: duration_or(&lookup, "TRANSCODER_STOP_GRACE", defaults.stop_grace)?,
                inbox_capacity: parse_or(&lookup, "INBOX_CAPACITY", defaults.inbox_capacity)?,
            },
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// - Volume must be between 0.0 and 2.0
    /// - Queue size, inbox capacity and worker threads must be > 0
    /// - Timeouts must be non-zero
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;

        if !(0.0..=2.0).contains(&engine.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and 2.0, got: {}",
                engine.default_volume
            );
        }

        if engine.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if engine.inbox_capacity == 0 {
            anyhow::bail!("Inbox capacity must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        for (name, value) in [
            ("IDLE_TIMEOUT", engine.idle_timeout),
            ("ALONE_TIMEOUT", engine.alone_timeout),
            ("RESOLVE_TIMEOUT", engine.resolve_timeout),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        self.engine.clone()
    }

    /// Resumen sin datos sensibles para los logs
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Audio: {}% vol, cola máx. {}\n  \
            Timeouts: idle {}, alone {}, resolve {}, locator ttl {}\n  \
            Binarios: {} / {}\n  \
            Workers: {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            (self.engine.default_volume * 100.0) as u32,
            self.engine.max_queue_size,
            humantime::format_duration(self.engine.idle_timeout),
            humantime::format_duration(self.engine.alone_timeout),
            humantime::format_duration(self.engine.resolve_timeout),
            humantime::format_duration(self.engine.locator_ttl),
            self.ffmpeg_path,
            self.ytdlp_path,
            self.worker_threads,
        )
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} inválido: {}", key, raw)),
        _ => Ok(default),
    }
}

/// Acepta sintaxis de humantime (`3m`, `90s`) o segundos a secas
fn duration_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            let raw = raw.trim();
            match raw.parse::<u64>() {
                Ok(secs) => Ok(Duration::from_secs(secs)),
                Err(_) => humantime::parse_duration(raw)
                    .with_context(|| format!("{} inválido: {}", key, raw)),
            }
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        let config =
            Config::from_lookup(lookup(&[("DISCORD_TOKEN", "t"), ("APPLICATION_ID", "42")])).unwrap();

        assert_eq!(config.application_id, 42);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
        assert_eq!(config.engine.idle_timeout, Duration::from_secs(180));
        assert_eq!(config.engine.alone_timeout, Duration::from_secs(60));
        assert_eq!(config.engine.inbox_capacity, 64);
        config.validate().unwrap();
    }

    #[test]
    fn durations_accept_humantime_and_plain_seconds() {
        let config = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "t"),
            ("APPLICATION_ID", "1"),
            ("IDLE_TIMEOUT", "3m"),
            ("ALONE_TIMEOUT", "45"),
            ("LOCATOR_TTL", "1h 30m"),
        ]))
        .unwrap();

        assert_eq!(config.engine.idle_timeout, Duration::from_secs(180));
        assert_eq!(config.engine.alone_timeout, Duration::from_secs(45));
        assert_eq!(config.engine.locator_ttl, Duration::from_secs(5400));
    }

    #[test]
    fn missing_token_is_an_error() {
        assert!(Config::from_lookup(lookup(&[("APPLICATION_ID", "1")])).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_volume() {
        let config = Config::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "t"),
            ("APPLICATION_ID", "1"),
            ("DEFAULT_VOLUME", "3.5"),
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }
}

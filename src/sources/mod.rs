//! Track resolution.
//!
//! The engine never talks to a streaming site itself; it goes through a
//! [`TrackResolver`], which turns a URL or a free-text query into a
//! [`ResolvedTrack`] with a direct stream locator. Resolution runs in child
//! tasks of the guild actor so a slow site never stalls playback.

pub mod ytdlp;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::audio::track::Platform;

pub use ytdlp::YtDlpResolver;

/// Metadatos devueltos por el resolver
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTrack {
    pub id: String,
    pub title: String,
    /// Localizador directo del stream; puede caducar.
    pub direct_url: String,
    pub duration: Option<Duration>,
    pub is_live: bool,
    pub platform: Platform,
    pub uploader: Option<String>,
    pub thumbnail: Option<String>,
    /// URL canónica de la página, útil para volver a resolver.
    pub webpage_url: Option<String>,
}

/// Fallos de resolución
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("No se encontraron resultados para: {0}")]
    NotFound(String),

    /// Privado, bloqueado por región, eliminado...
    #[error("La pista no se puede reproducir: {0}")]
    Unplayable(String),

    #[error("La plataforma está limitando las peticiones, inténtalo más tarde")]
    RateLimited,

    #[error("Error del resolver: {0}")]
    Failed(String),
}

/// Trait común para los servicios de resolución
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resuelve una URL o término de búsqueda
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError>;
}

/// ¿Es la consulta una URL o un término de búsqueda?
pub fn is_url(query: &str) -> bool {
    match url::Url::parse(query) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

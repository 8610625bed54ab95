//! Error types for the playback engine.
//!
//! Every error except [`EngineError::VoiceConnectionLost`] and
//! [`EngineError::Closed`] is recovered inside the guild actor; the variants
//! only travel back to callers as command rejections or as
//! [`ErrorKind`]-tagged events.

use serde::Serialize;
use thiserror::Error;

use crate::sources::ResolveError;

/// Error principal del motor de reproducción
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Índice inválido, seek fuera de rango, quitar la pista actual, etc.
    /// Se rechaza sin mutar estado.
    #[error("Comando inválido: {0}")]
    InvalidCommand(String),

    #[error("No se pudo resolver la pista: {0}")]
    Resolution(#[from] ResolveError),

    #[error("No se pudo iniciar el transcodificador: {0}")]
    TranscodeSpawn(String),

    #[error("El stream expiró y debe resolverse de nuevo")]
    StreamExpired,

    #[error("Se perdió la conexión de voz")]
    VoiceConnectionLost,

    /// Fallo al controlar la pista en el driver de voz; la sesión sigue viva.
    #[error("Error de reproducción: {0}")]
    Playback(String),

    #[error("La cola está llena (máximo {0} canciones)")]
    QueueFull(usize),

    /// El actor del guild ya no existe (leave, timeout o pérdida de voz).
    #[error("El reproductor de este servidor ya no está activo")]
    Closed,
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidCommand(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCommand(_) | Self::QueueFull(_) => ErrorKind::InvalidCommand,
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::TranscodeSpawn(_) => ErrorKind::TranscodeSpawn,
            Self::StreamExpired => ErrorKind::StreamExpired,
            Self::VoiceConnectionLost => ErrorKind::VoiceConnectionLost,
            Self::Playback(_) => ErrorKind::Playback,
            Self::Closed => ErrorKind::Closed,
        }
    }
}

/// Categoría de error que se publica en los eventos para la capa de presentación
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCommand,
    Resolution,
    TranscodeSpawn,
    StreamExpired,
    VoiceConnectionLost,
    /// El transcodificador terminó con error a mitad de la pista.
    Playback,
    Closed,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

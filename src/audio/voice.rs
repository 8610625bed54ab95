use async_trait::async_trait;
use thiserror::Error;

use crate::audio::transcoder::PcmStream;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("No hay conexión de voz activa")]
    NotConnected,

    #[error("Error en el driver de voz: {0}")]
    Driver(String),
}

/// Salida de audio de un guild (el canal de voz)
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Empieza a reproducir el PCM, reemplazando lo que estuviera sonando
    async fn play(&self, pcm: PcmStream, volume: f32) -> Result<(), VoiceError>;

    fn stop(&self);

    fn pause(&self) -> Result<(), VoiceError>;

    fn resume(&self) -> Result<(), VoiceError>;

    fn set_volume(&self, volume: f32) -> Result<(), VoiceError>;

    async fn disconnect(&self);
}

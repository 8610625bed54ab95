//! Per-guild streaming playback engine for a Discord music bot.
//!
//! [`audio`] holds the engine itself (queue, transcoder lifecycle, effects,
//! progress and inactivity timers), [`sources`] the track resolvers and
//! [`bot`] the serenity/songbird adapter that drives it.

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod sources;

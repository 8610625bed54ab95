//! # Audio Module
//!
//! Per-guild playback engine: one actor per guild owns the queue, the
//! active transcoder session and every timer tied to them.
//!
//! ## Architecture
//!
//! ### [`registry`] - Guild Engine Registry
//! - Creates a guild's actor on first use, hands out [`GuildHandle`]s
//! - Actors remove themselves on leave, inactivity or voice loss
//!
//! ### [`player`] - Playback Controller
//! - Processes intents strictly in arrival order
//! - Drives the `Idle → Loading → Playing ⇄ Paused → Draining` lifecycle
//! - Refreshes expired stream locators and skips failing tracks
//!
//! ### [`queue`] - Queue Management
//! - Ordered tracks with a cursor, loop modes and skip votes
//! - Shuffle and reordering never move the current entry
//!
//! ### [`effects`] - Audio Processing
//! - Declarative effect table rendered into an ffmpeg `-af` chain
//! - Quality presets and per-platform input options
//!
//! ### [`transcoder`] - External Transcoder
//! - Spawns ffmpeg, exposes its PCM output and classifies its exit
//!
//! ## Output Format
//!
//! - **Sample Rate**: 48kHz
//! - **Channels**: 2 (stereo)
//! - **Samples**: 32-bit float little-endian, as songbird expects for raw input

pub mod effects;
pub mod events;
pub mod handle;
pub mod inactivity;
pub mod player;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod track;
pub mod transcoder;
pub mod voice;

pub use effects::{EffectSettings, QualityPreset};
pub use events::{EngineEvent, EventKind, PlayerSnapshot, PlayerState, TrackEndReason};
pub use handle::{AddedTrack, GuildHandle, SkipOutcome};
pub use queue::{LoopMode, QueueSnapshot};
pub use registry::{EngineDeps, GuildEngineRegistry};
pub use track::{Track, TrackLength};
pub use transcoder::{FfmpegTranscoder, Transcoder};
pub use voice::VoiceConnection;

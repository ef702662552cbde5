//! Core library for lip-sync audio playback.
//!
//! The crate plays short clips, measures their loudness while they play and
//! guarantees that every decode buffer, analysis graph and worker thread is
//! released however playback ends. Each module owns one layer of that
//! pipeline, from the loudness algorithm up to the registry callers use.

pub mod analysis;
pub mod backend;
pub mod clip;
pub mod config;
pub mod error;
pub mod graph;
pub mod registry;
pub mod render;
pub mod session;
pub mod source;

pub use analysis::{fallback_loudness, loudness, LOUDNESS_GAIN};
pub use backend::{
    clamp_volume, AudioBackend, BackendState, LibraryBackend, NativeElementBackend, PlayFuture,
};
pub use clip::{Clip, ClipCallbacks, ClipId, ClipState, Outcome};
pub use config::{AnalyserSettings, AutoplayPolicy, BackendKind, PlaybackConfig, SoundConfig};
pub use error::{Result, SoundError};
pub use graph::{AnalyserNode, ContextState, DeviceContext};
pub use registry::SoundRegistry;
pub use render::PlaybackClock;
pub use session::PlaybackSession;
pub use source::{decode_all, DecodedAudio, SourceStream};

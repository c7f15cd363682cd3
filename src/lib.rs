//! Audio delivery engine for the Harmony music player.
//!
//! Streams encrypted Deezer tracks to an audio decoder as cleartext
//! FLAC/MP3 bytes while the download is still in flight, and runs the
//! companion background download manager.

pub mod crypto;
pub mod db;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use engine::{Engine, EngineConfig};
pub use errors::{HarmonyError, Result};

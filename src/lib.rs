//! Voice-driven slide navigation over a persistent WebSocket.
//!
//! The server accepts one connection per viewer, transcribes streamed audio
//! chunks, classifies transcripts into navigation commands (keyword match
//! first, semantic fallback), and drives a per-session slide state machine.
//! The client side captures microphone audio, streams it up, and reacts to
//! the server's event messages, reconnecting with exponential backoff when
//! the network drops.

pub mod client;
pub mod command;
pub mod error;
pub mod presentations;
pub mod protocol;
pub mod server;
pub mod session;
pub mod settings;
pub mod stt;

pub use error::{DeviceError, LiveError, SttError};
pub use settings::Settings;

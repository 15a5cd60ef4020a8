//! stillwater: guided-meditation scripts, a meditation-teacher chat and
//! speech playback.
//!
//! Scripts and chat replies come from the Anthropic Messages API. Speech goes
//! through the [`speech::SpeechPlatform`] capability interface, implemented
//! natively by [`speech::KokoroPlatform`]. Session bookkeeping is plain
//! key-value pairs in a [`storage::Storage`].

pub mod anthropic;
pub mod config;
pub mod error;
pub mod history;
pub mod meditation;
pub mod speech;
pub mod storage;
pub mod viewport;

pub use anthropic::{ChatMessage, Credential, MessagesClient, Role};
pub use config::Config;
pub use error::{Error, Result, SpeechError, StorageError, ViewportError};
pub use meditation::{ChatSession, GuidanceLevel, MeditationConfig, ScriptGenerator, Technique};
pub use speech::{SpeechController, SpeechPlatform, VoiceName};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use viewport::{DisplayContext, MediaQuery, Viewport};

//! Meditation content: script generation and the meditation-teacher chat.
//!
//! Components:
//! - `script`: prompt synthesis + one Messages API call per script
//! - `chat`: an owned conversation log replayed on every exchange

pub mod chat;
pub mod script;

pub use chat::ChatSession;
pub use script::{build_prompt, GuidanceLevel, MeditationConfig, ScriptGenerator, Technique};

//! Speech playback.
//!
//! The host speech facility is reached only through [`SpeechPlatform`], so
//! the controller logic runs the same against the native Kokoro backend and
//! against test doubles.
//!
//! - `text`: cleanup of script text before it is spoken
//! - `controller`: [`SpeechController`], which owns the current utterance
//! - `kokoro`: native Kokoro ONNX + rodio implementation of the platform

pub mod controller;
pub mod kokoro;
pub mod text;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use controller::SpeechController;
pub use kokoro::KokoroPlatform;

/// The voices offered to users. Each maps to a fixed language/pitch/rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VoiceName {
    Serene,
    Gentle,
    Grounded,
    Bright,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceProfile {
    pub lang: &'static str,
    pub pitch: f32,
    pub rate: f32,
}

impl VoiceName {
    pub const ALL: [VoiceName; 4] = [Self::Serene, Self::Gentle, Self::Grounded, Self::Bright];

    pub fn profile(self) -> VoiceProfile {
        match self {
            Self::Serene => VoiceProfile { lang: "en-US", pitch: 1.0, rate: 0.85 },
            Self::Gentle => VoiceProfile { lang: "en-GB", pitch: 1.1, rate: 0.8 },
            Self::Grounded => VoiceProfile { lang: "en-US", pitch: 0.85, rate: 0.75 },
            Self::Bright => VoiceProfile { lang: "en-AU", pitch: 1.15, rate: 0.9 },
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Serene => "serene",
            Self::Gentle => "gentle",
            Self::Grounded => "grounded",
            Self::Bright => "bright",
        }
    }
}

impl fmt::Display for VoiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// A voice as enumerated by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformVoice {
    pub name: String,
    /// BCP 47 language tag, e.g. `en-US`.
    pub lang: String,
    pub default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtteranceId(pub u64);

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One unit of text handed to the platform, with its voice parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    pub voice: Option<PlatformVoice>,
    pub lang: String,
    pub pitch: f32,
    pub rate: f32,
    pub volume: f32,
}

/// How an utterance finished. Platforms deliver exactly one per utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtteranceEvent {
    End,
    /// Cancelled before it finished.
    Interrupted,
    Error(String),
}

pub type EventCallback = Box<dyn FnOnce(UtteranceEvent) + Send>;
pub type VoicesChangedCallback = Arc<dyn Fn() + Send + Sync>;

/// Capability interface over a host speech-synthesis facility.
///
/// Implementations may invoke callbacks from any thread, including
/// synchronously from inside `speak` or `cancel`.
pub trait SpeechPlatform: Send + Sync {
    /// Whether the facility exists at all on this host.
    fn is_available(&self) -> bool;

    /// Currently known voices. May be empty until loading finishes.
    fn voices(&self) -> Vec<PlatformVoice>;

    /// Register (or clear) the callback fired when the voice list changes.
    fn set_voices_changed(&self, callback: Option<VoicesChangedCallback>);

    /// Queue `utterance` for playback. `on_event` fires once when it finishes.
    fn speak(&self, utterance: Utterance, on_event: EventCallback);

    fn pause(&self);

    fn resume(&self);

    /// Stop and discard whatever is playing.
    fn cancel(&self);

    /// True while an utterance is playing or paused.
    fn is_speaking(&self) -> bool;
}

//! Guided-meditation script generation.
//!
//! Builds a single prompt from a [`MeditationConfig`] and asks the Messages
//! API for the script. Pause markers (`[PAUSE 10s]`) in the reply are left in
//! place; the speech layer turns them into ellipses.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anthropic::{ChatMessage, MessagesClient};
use crate::error::Result;

pub const SCRIPT_FALLBACK: &str = "Unable to generate meditation script.";
const SCRIPT_ERROR: &str = "Failed to generate meditation script";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Technique {
    Mindfulness,
    Breathing,
    BodyScan,
    LovingKindness,
    Visualization,
}

impl Technique {
    pub fn label(self) -> &'static str {
        match self {
            Self::Mindfulness => "mindfulness",
            Self::Breathing => "breathing",
            Self::BodyScan => "body-scan",
            Self::LovingKindness => "loving-kindness",
            Self::Visualization => "visualization",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GuidanceLevel {
    Low,
    Balanced,
    High,
}

impl GuidanceLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Balanced => "balanced",
            Self::High => "high",
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            Self::Low => {
                "Keep guidance minimal. Give brief cues, then leave long stretches of silence \
                 marked with pause markers such as [PAUSE 30s] or [PAUSE 60s]. Let the \
                 listener do most of the work on their own."
            }
            Self::Balanced => {
                "Balance guidance and silence. Offer clear, gentle instructions and follow \
                 each section with a pause marker such as [PAUSE 10s] or [PAUSE 20s]."
            }
            Self::High => {
                "Guide the listener continuously and in detail. Describe each step, \
                 sensation and transition, and keep pauses short, using markers such as \
                 [PAUSE 5s]."
            }
        }
    }
}

impl fmt::Display for GuidanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Input to a single script generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeditationConfig {
    pub topic: String,
    pub technique: Technique,
    pub guidance_level: GuidanceLevel,
    pub duration_minutes: NonZeroU32,
}

/// Build the script prompt. Topic, technique label and duration appear verbatim.
pub fn build_prompt(config: &MeditationConfig) -> String {
    format!(
        "Create a guided meditation script.\n\n\
         Topic: {topic}\n\
         Technique: {technique}\n\
         Duration: {duration} minutes\n\
         Guidance level: {guidance}\n\n\
         {instructions}\n\n\
         Write in a calm, warm, second-person voice suitable for being read aloud \
         by a speech synthesizer. Pace the script so that, including pauses, it \
         lasts about {duration} minutes. Mark every pause on its own as \
         [PAUSE Ns], where N is the number of seconds. Do not include a title, \
         headings, stage directions or any text other than the script itself.",
        topic = config.topic,
        technique = config.technique.label(),
        duration = config.duration_minutes,
        guidance = config.guidance_level.label(),
        instructions = config.guidance_level.instructions(),
    )
}

pub struct ScriptGenerator<'a> {
    client: &'a MessagesClient,
    max_tokens: u32,
}

impl<'a> ScriptGenerator<'a> {
    pub fn new(client: &'a MessagesClient, max_tokens: u32) -> Self {
        Self { client, max_tokens }
    }

    /// Generate a script for `config`. One request, no retry.
    pub async fn generate(&self, config: &MeditationConfig) -> Result<String> {
        let t_start = Instant::now();
        let messages = [ChatMessage::user(build_prompt(config))];

        let text = self
            .client
            .send(&messages, None, self.max_tokens, SCRIPT_ERROR)
            .await?;

        let script = text.unwrap_or_else(|| SCRIPT_FALLBACK.to_string());
        info!(
            "Generated {} script on '{}' ({} min, {} chars, {:.0}ms)",
            config.technique,
            config.topic,
            config.duration_minutes,
            script.len(),
            t_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    fn config(topic: &str, technique: Technique, guidance: GuidanceLevel, minutes: u32) -> MeditationConfig {
        MeditationConfig {
            topic: topic.into(),
            technique,
            guidance_level: guidance,
            duration_minutes: NonZeroU32::new(minutes).unwrap(),
        }
    }

    #[test]
    fn prompt_embeds_topic_technique_and_duration() {
        for &technique in Technique::value_variants() {
            for &guidance in GuidanceLevel::value_variants() {
                for minutes in [1, 10, 45] {
                    let cfg = config("letting go of work stress", technique, guidance, minutes);
                    let prompt = build_prompt(&cfg);
                    assert!(prompt.contains("letting go of work stress"));
                    assert!(prompt.contains(technique.label()));
                    assert!(prompt.contains(&format!("{minutes} minutes")));
                }
            }
        }
    }

    #[test]
    fn prompt_varies_with_guidance_level() {
        let low = build_prompt(&config("sleep", Technique::BodyScan, GuidanceLevel::Low, 10));
        let high = build_prompt(&config("sleep", Technique::BodyScan, GuidanceLevel::High, 10));
        assert!(low.contains("[PAUSE 30s]"));
        assert!(high.contains("[PAUSE 5s]"));
        assert_ne!(low, high);
    }

    #[test]
    fn technique_labels_are_kebab_case() {
        assert_eq!(Technique::LovingKindness.to_string(), "loving-kindness");
        assert_eq!(
            serde_json::to_string(&Technique::BodyScan).unwrap(),
            "\"body-scan\""
        );
        assert_eq!(
            Technique::from_str("body-scan", true).unwrap(),
            Technique::BodyScan
        );
    }
}

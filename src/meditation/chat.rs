//! Meditation-teacher chat.
//!
//! The session owns its log; every `send_message` replays the whole log.
//! There is no truncation, so request size grows with the conversation.

use tracing::debug;

use crate::anthropic::{ChatMessage, MessagesClient};
use crate::error::Result;

pub const CHAT_FALLBACK: &str = "I'm sorry, I couldn't generate a response.";
const CHAT_ERROR: &str = "Failed to get a response from the meditation guide";

const SYSTEM_PROMPT: &str = "You are a calm, compassionate meditation teacher. Answer questions \
about meditation, mindfulness, breathing and relaxation with warmth and clarity. Keep answers \
short and practical, suggest simple exercises when they help, and never give medical advice.";

pub struct ChatSession<'a> {
    client: &'a MessagesClient,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

impl<'a> ChatSession<'a> {
    pub fn new(client: &'a MessagesClient, max_tokens: u32) -> Self {
        Self {
            client,
            max_tokens,
            messages: Vec::new(),
        }
    }

    /// Start over with an empty conversation.
    pub fn create_chat(&mut self) {
        debug!("Chat reset ({} messages discarded)", self.messages.len());
        self.messages = Vec::new();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Send `text` and return the assistant's reply.
    ///
    /// The user record stays in the log even if the request fails.
    pub async fn send_message(&mut self, text: &str) -> Result<String> {
        self.messages.push(ChatMessage::user(text));

        let reply = self
            .client
            .send(&self.messages, Some(SYSTEM_PROMPT), self.max_tokens, CHAT_ERROR)
            .await?
            .unwrap_or_else(|| CHAT_FALLBACK.to_string());

        self.messages.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }
}

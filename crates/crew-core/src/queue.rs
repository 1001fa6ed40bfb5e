//! Per-session FIFO of follow-up prompts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::session::LaunchToken;

/// A prompt waiting for the running turn to finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedPrompt {
    /// Submission order within the session, starting at 1.
    pub order: u64,
    pub prompt: String,
    pub queued_at: DateTime<Utc>,
}

/// What happened to a prompt handed to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// Waiting behind the running turn; `position` is 1 for the next to run.
    Queued { order: u64, position: usize },

    /// The session was idle, so the prompt started a new attachment.
    Started { order: u64, launch_token: LaunchToken },
}

/// Strict FIFO queue. No priorities, no reordering.
#[derive(Debug, Clone, Default)]
pub struct PromptQueue {
    items: VecDeque<QueuedPrompt>,
    next_order: u64,
}

impl PromptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a prompt and returns its submission order.
    pub fn push(&mut self, prompt: impl Into<String>) -> u64 {
        let order = self.next_order();
        self.items.push_back(QueuedPrompt {
            order,
            prompt: prompt.into(),
            queued_at: Utc::now(),
        });
        order
    }

    /// Reserves a submission order for a prompt that runs without queuing.
    pub fn next_order(&mut self) -> u64 {
        self.next_order = self.next_order.saturating_add(1);
        self.next_order
    }

    /// Removes the oldest prompt.
    pub fn pop(&mut self) -> Option<QueuedPrompt> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&QueuedPrompt> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops every pending prompt and returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedPrompt> {
        self.items.iter()
    }
}

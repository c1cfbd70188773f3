// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors produced by a provider adapter or the stream reassembler.
///
/// The variants mirror the error kinds the agent loop must distinguish:
/// configuration errors fail a run synchronously, transport errors are
/// retried with backoff, protocol errors abort the run, and `Aborted` marks
/// user-initiated cancellation.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// Server-requested wait before the next attempt, when the provider
        /// communicated one (e.g. a Retry-After header).
        retry_after_ms: Option<u64>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream aborted")]
    Aborted,
}

impl ModelError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), retry_after_ms: None }
    }

    pub fn transport_with_retry_after(message: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::Transport {
            message: message.into(),
            retry_after_ms: Some(retry_after_ms),
        }
    }

    /// Whether the agent loop may retry the request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

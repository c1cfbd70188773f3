// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod entry;
mod store;

pub use entry::{EntryPayload, FileOpsDetails, SessionEntry};
pub use store::{
    default_base_dir, encode_cwd, list_all_sessions, list_sessions, SessionError, SessionStore,
    SessionSummary,
};

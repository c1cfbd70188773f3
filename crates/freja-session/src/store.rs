// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs4::fs_std::FileExt;
use thiserror::Error;
use tracing::warn;
use ulid::Ulid;

use freja_model::Message;

use crate::{EntryPayload, SessionEntry};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file {0} is locked by another agent")]
    Locked(PathBuf),
    #[error("duplicate entry id {0}")]
    DuplicateId(String),
    #[error("unknown entry id {0}")]
    UnknownId(String),
    #[error("missing or invalid session header in {0}")]
    InvalidHeader(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("encoding entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Header info for session pickers.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub cwd: String,
    pub created_at: chrono::DateTime<Utc>,
    pub path: PathBuf,
    pub entries: usize,
}

/// Encode a working directory into a session directory name: leading `/`
/// stripped, separators replaced with `-`, wrapped with `--…--`.
pub fn encode_cwd(cwd: &str) -> String {
    let stripped = cwd.strip_prefix('/').unwrap_or(cwd);
    format!("--{}--", stripped.replace('/', "-"))
}

/// Default on-disk location for session logs.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".freja")
        .join("sessions")
}

/// Append-only, branching conversation log.
///
/// One JSON entry per line; the first line is the session header.  Entries
/// form a tree via parent pointers; the *current path* is the chain from the
/// newest leaf back to the header.  Entries are never rewritten — branching
/// and "deletion" are modeled by divergent parent pointers.
///
/// The store holds an exclusive advisory lock on the file for its lifetime;
/// two agents can never append to the same session.
pub struct SessionStore {
    path: PathBuf,
    file: File,
    entries: Vec<SessionEntry>,
    index: HashMap<String, usize>,
    generator: ulid::Generator,
}

impl SessionStore {
    /// Create a fresh session for `cwd` under `base_dir`.
    pub fn create(cwd: &str, base_dir: &Path) -> Result<Self, SessionError> {
        let dir = base_dir.join(encode_cwd(cwd));
        std::fs::create_dir_all(&dir)?;
        let header = SessionEntry {
            id: Ulid::new().to_string(),
            parent: None,
            timestamp: Utc::now(),
            payload: EntryPayload::Session { cwd: cwd.to_string(), created_at: Utc::now() },
        };
        let path = dir.join(format!("{}.jsonl", header.id));
        let file = OpenOptions::new().create_new(true).append(true).read(true).open(&path)?;
        if !file.try_lock_exclusive()? {
            return Err(SessionError::Locked(path));
        }
        let mut store = Self {
            path,
            file,
            entries: Vec::new(),
            index: HashMap::new(),
            generator: ulid::Generator::new(),
        };
        store.write_line(&header)?;
        store.insert(header)?;
        Ok(store)
    }

    /// Open an existing session file, acquiring the exclusive append lock.
    ///
    /// Malformed lines are skipped with a warning; a duplicate id or a
    /// missing header fails the open.
    pub fn open(path: &Path) -> Result<Self, SessionError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries: Vec<SessionEntry> = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), lineno = lineno + 1, error = %e,
                          "skipping malformed session entry");
                }
            }
        }
        let header_ok = matches!(
            entries.first().map(|e| &e.payload),
            Some(EntryPayload::Session { .. })
        );
        if !header_ok {
            return Err(SessionError::InvalidHeader(path.to_path_buf()));
        }

        let file = OpenOptions::new().append(true).read(true).open(path)?;
        if !file.try_lock_exclusive()? {
            return Err(SessionError::Locked(path.to_path_buf()));
        }
        let mut store = Self {
            path: path.to_path_buf(),
            file,
            entries: Vec::new(),
            index: HashMap::new(),
            generator: ulid::Generator::new(),
        };
        for entry in entries {
            store.insert(entry)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.entries[0].id
    }

    pub fn cwd(&self) -> &str {
        match &self.entries[0].payload {
            EntryPayload::Session { cwd, .. } => cwd,
            _ => unreachable!("first entry is always the header"),
        }
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Append a new entry as a child of the current leaf.
    pub fn append(&mut self, payload: EntryPayload) -> Result<String, SessionError> {
        let parent = self.current_leaf().id.clone();
        self.append_to(&parent, payload)
    }

    /// Append a new entry under an explicit parent (branching).
    pub fn append_to(
        &mut self,
        parent_id: &str,
        payload: EntryPayload,
    ) -> Result<String, SessionError> {
        if !self.index.contains_key(parent_id) {
            return Err(SessionError::UnknownId(parent_id.to_string()));
        }
        let entry = SessionEntry {
            id: self.next_id(),
            parent: Some(parent_id.to_string()),
            timestamp: Utc::now(),
            payload,
        };
        self.write_line(&entry)?;
        let id = entry.id.clone();
        self.insert(entry)?;
        Ok(id)
    }

    /// The leaf with the most recent id.  Ids are ULIDs, so lexicographic
    /// order is chronological order.  An entry is a leaf when no other entry
    /// points at it (a forked session's header is newer than its copied
    /// entries, so "max id overall" would be wrong).
    pub fn current_leaf(&self) -> &SessionEntry {
        let parents: std::collections::HashSet<&str> = self
            .entries
            .iter()
            .filter_map(|e| e.parent.as_deref())
            .collect();
        self.entries
            .iter()
            .filter(|e| !parents.contains(e.id.as_str()))
            .max_by(|a, b| a.id.cmp(&b.id))
            .expect("store always holds at least the header")
    }

    /// Chain from `leaf_id` back to the header, returned root-first.
    pub fn path_to(&self, leaf_id: &str) -> Result<Vec<&SessionEntry>, SessionError> {
        let mut chain = Vec::new();
        let mut cursor = Some(leaf_id.to_string());
        while let Some(id) = cursor {
            let entry = self
                .get(&id)
                .ok_or_else(|| SessionError::UnknownId(id.clone()))?;
            chain.push(entry);
            cursor = entry.parent.clone();
        }
        chain.reverse();
        Ok(chain)
    }

    /// The current path: newest leaf plus its ancestors, root-first.
    pub fn current_path(&self) -> Vec<&SessionEntry> {
        let leaf = self.current_leaf().id.clone();
        self.path_to(&leaf).expect("leaf came from the index")
    }

    /// Fork a new session file seeded with the ancestor chain of `entry_id`.
    ///
    /// The copied entries keep their ids; only the oldest one is re-parented
    /// onto the new header.  Appends to the returned store branch from
    /// `entry_id` without touching this session.
    pub fn fork_from(&self, entry_id: &str, base_dir: &Path) -> Result<Self, SessionError> {
        let chain = self.path_to(entry_id)?;
        let cwd = self.cwd().to_string();
        let mut forked = Self::create(&cwd, base_dir)?;
        let new_root = forked.id().to_string();
        for (i, entry) in chain.iter().skip(1).enumerate() {
            let mut copy = (*entry).clone();
            if i == 0 {
                copy.parent = Some(new_root.clone());
            }
            forked.write_line(&copy)?;
            forked.insert(copy)?;
        }
        Ok(forked)
    }

    /// Materialize the current path into an ordered message list, applying
    /// the newest compaction so only the summary and entries from the
    /// first-kept id onward contribute.
    pub fn build_context(&self) -> Vec<Message> {
        self.build_context_with_ids().into_iter().map(|(_, m)| m).collect()
    }

    /// Like [`build_context`](Self::build_context), pairing each message
    /// with the id of the entry it came from.  The synthetic summary message
    /// carries the compaction entry's id.
    pub fn build_context_with_ids(&self) -> Vec<(String, Message)> {
        let path = self.current_path();
        let newest_compaction = path.iter().rev().find_map(|e| match &e.payload {
            EntryPayload::Compaction { summary, first_kept_entry_id, .. } => {
                Some((e.id.clone(), summary.clone(), first_kept_entry_id.clone()))
            }
            _ => None,
        });

        let mut messages = Vec::new();
        let first_kept = match &newest_compaction {
            Some((id, summary, first_kept)) => {
                messages.push((id.clone(), Message::user(summary.clone())));
                Some(first_kept.clone())
            }
            None => None,
        };

        for entry in path {
            if let Some(first_kept) = &first_kept {
                if entry.id.as_str() < first_kept.as_str() {
                    continue;
                }
            }
            match &entry.payload {
                EntryPayload::Message { message } => {
                    messages.push((entry.id.clone(), message.clone()));
                }
                EntryPayload::CustomMessage { tag, payload } => {
                    messages.push((entry.id.clone(), Message::custom(tag.clone(), payload.clone())));
                }
                EntryPayload::BranchSummary { summary } => {
                    messages.push((entry.id.clone(), Message::user(summary.clone())));
                }
                // The newest compaction is already represented by the leading
                // summary message; older ones fall before the first-kept id.
                EntryPayload::Compaction { .. } => {}
                EntryPayload::Session { .. }
                | EntryPayload::ThinkingLevelChange { .. }
                | EntryPayload::ModelChange { .. }
                | EntryPayload::Label { .. } => {}
            }
        }
        messages
    }

    /// The newest compaction entry on the current path, if any.
    pub fn latest_compaction(&self) -> Option<&SessionEntry> {
        self.current_path()
            .into_iter()
            .rev()
            .find(|e| matches!(e.payload, EntryPayload::Compaction { .. }))
    }

    fn next_id(&mut self) -> String {
        match self.generator.generate() {
            Ok(id) => id.to_string(),
            // Random-part overflow within one millisecond; a fresh ULID is
            // still newer than everything persisted.
            Err(_) => Ulid::new().to_string(),
        }
    }

    fn write_line(&mut self, entry: &SessionEntry) -> Result<(), SessionError> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.file, "{line}")?;
        self.file.sync_data()?;
        Ok(())
    }

    fn insert(&mut self, entry: SessionEntry) -> Result<(), SessionError> {
        if self.index.contains_key(&entry.id) {
            return Err(SessionError::DuplicateId(entry.id));
        }
        self.index.insert(entry.id.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }
}

/// List sessions recorded for `cwd` under `base_dir`, newest first.
pub fn list_sessions(base_dir: &Path, cwd: &str) -> Vec<SessionSummary> {
    summaries_in_dir(&base_dir.join(encode_cwd(cwd)))
}

/// List every session under `base_dir` across all working directories.
pub fn list_all_sessions(base_dir: &Path) -> Vec<SessionSummary> {
    let Ok(dirs) = std::fs::read_dir(base_dir) else {
        return Vec::new();
    };
    let mut all: Vec<SessionSummary> = dirs
        .flatten()
        .filter(|d| d.path().is_dir())
        .flat_map(|d| summaries_in_dir(&d.path()))
        .collect();
    all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    all
}

fn summaries_in_dir(dir: &Path) -> Vec<SessionSummary> {
    let Ok(files) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for file in files.flatten() {
        let path = file.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        match read_summary(&path) {
            Some(summary) => out.push(summary),
            None => warn!(path = %path.display(), "skipping session file without a valid header"),
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out
}

fn read_summary(path: &Path) -> Option<SessionSummary> {
    let reader = BufReader::new(File::open(path).ok()?);
    let mut lines = reader.lines();
    let header: SessionEntry = serde_json::from_str(&lines.next()?.ok()?).ok()?;
    let EntryPayload::Session { cwd, created_at } = header.payload else {
        return None;
    };
    let entries = 1 + lines.filter(|l| l.as_ref().is_ok_and(|s| !s.trim().is_empty())).count();
    Some(SessionSummary { id: header.id, cwd, created_at, path: path.to_path_buf(), entries })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

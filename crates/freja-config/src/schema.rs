// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Reasoning effort requested from the model.
///
/// Maps to provider-specific thinking budgets; `Xhigh` is only honoured by
/// models that declare the capability (the agent rejects it otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    /// Parse a level from its lowercase config spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::Xhigh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }
}

/// Draining behaviour for the steering and follow-up queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Each poll returns at most one queued message.
    #[default]
    OneAtATime,
    /// Each poll returns and clears the whole queue.
    All,
}

/// Context-compaction tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Master switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Headroom kept free for the summary and the system prompt.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: u64,
    /// Lower bound on estimated tokens preserved after the cut.
    #[serde(default = "default_keep_recent_tokens")]
    pub keep_recent_tokens: u64,
}

fn default_true() -> bool {
    true
}

fn default_reserve_tokens() -> u64 {
    16_384
}

fn default_keep_recent_tokens() -> u64 {
    20_000
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: default_reserve_tokens(),
            keep_recent_tokens: default_keep_recent_tokens(),
        }
    }
}

/// Agent-loop configuration recognised by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default reasoning effort for model calls.
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    /// How the mid-run steering queue is drained.
    #[serde(default)]
    pub steering_mode: QueueMode,
    /// How the at-stop follow-up queue is drained.
    #[serde(default)]
    pub follow_up_mode: QueueMode,
    /// Cap on provider-requested retry delays, in milliseconds.
    /// `0` disables the cap entirely.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            thinking_level: ThinkingLevel::default(),
            steering_mode: QueueMode::default(),
            follow_up_mode: QueueMode::default(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            compaction: CompactionConfig::default(),
        }
    }
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_thinking_level_is_off() {
        assert_eq!(ThinkingLevel::default(), ThinkingLevel::Off);
    }

    #[test]
    fn default_queue_modes_are_one_at_a_time() {
        let c = AgentConfig::default();
        assert_eq!(c.steering_mode, QueueMode::OneAtATime);
        assert_eq!(c.follow_up_mode, QueueMode::OneAtATime);
    }

    #[test]
    fn default_retry_cap_is_sixty_seconds() {
        assert_eq!(AgentConfig::default().max_retry_delay_ms, 60_000);
    }

    #[test]
    fn default_compaction_values() {
        let c = CompactionConfig::default();
        assert!(c.enabled);
        assert_eq!(c.reserve_tokens, 16_384);
        assert_eq!(c.keep_recent_tokens, 20_000);
    }

    // ── ThinkingLevel parsing ─────────────────────────────────────────────────

    #[test]
    fn thinking_level_parses_all_spellings() {
        for (s, want) in [
            ("off", ThinkingLevel::Off),
            ("minimal", ThinkingLevel::Minimal),
            ("low", ThinkingLevel::Low),
            ("medium", ThinkingLevel::Medium),
            ("high", ThinkingLevel::High),
            ("xhigh", ThinkingLevel::Xhigh),
        ] {
            assert_eq!(ThinkingLevel::parse(s), Some(want));
        }
    }

    #[test]
    fn thinking_level_rejects_unknown_spelling() {
        assert_eq!(ThinkingLevel::parse("ultra"), None);
    }

    #[test]
    fn thinking_level_round_trips_via_as_str() {
        for lvl in [
            ThinkingLevel::Off,
            ThinkingLevel::Minimal,
            ThinkingLevel::Low,
            ThinkingLevel::Medium,
            ThinkingLevel::High,
            ThinkingLevel::Xhigh,
        ] {
            assert_eq!(ThinkingLevel::parse(lvl.as_str()), Some(lvl));
        }
    }

    // ── Serde spellings ───────────────────────────────────────────────────────

    #[test]
    fn queue_mode_serialises_kebab_case() {
        let s = serde_yaml::to_string(&QueueMode::OneAtATime).unwrap();
        assert!(s.contains("one-at-a-time"), "got: {s}");
    }

    #[test]
    fn config_deserialises_partial_yaml_with_defaults() {
        let yaml = "agent:\n  steering_mode: all\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.agent.steering_mode, QueueMode::All);
        assert_eq!(c.agent.follow_up_mode, QueueMode::OneAtATime);
        assert_eq!(c.agent.max_retry_delay_ms, 60_000);
        assert!(c.agent.compaction.enabled);
    }

    #[test]
    fn config_deserialises_compaction_overrides() {
        let yaml = "agent:\n  compaction:\n    enabled: false\n    reserve_tokens: 1000\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!c.agent.compaction.enabled);
        assert_eq!(c.agent.compaction.reserve_tokens, 1000);
        // untouched field keeps its default
        assert_eq!(c.agent.compaction.keep_recent_tokens, 20_000);
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c, Config::default());
    }
}

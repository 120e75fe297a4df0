//! Configuration loading and management.
//!
//! Settings load from the global config dir (`~/.config/plover/settings.json`)
//! and are overridden field-by-field by the project file
//! (`./.plover/settings.json`). All fields are optional; accessor methods
//! supply defaults.

use crate::agent::{AgentConfig, QueueMode, RetryPolicy};
use crate::compaction::CompactionSettings;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Model
    #[serde(alias = "defaultProvider")]
    pub default_provider: Option<String>,
    #[serde(alias = "defaultModel")]
    pub default_model: Option<String>,
    #[serde(alias = "defaultThinkingLevel")]
    pub default_thinking_level: Option<String>,

    // Prompting
    #[serde(alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(alias = "maxToolIterations")]
    pub max_tool_iterations: Option<usize>,

    // Message handling
    #[serde(alias = "steeringMode")]
    pub steering_mode: Option<String>,
    #[serde(alias = "followUpMode")]
    pub follow_up_mode: Option<String>,

    // Sessions
    #[serde(alias = "sessionsDir")]
    pub sessions_dir: Option<String>,

    // Compaction
    pub compaction: Option<CompactionConfig>,

    // Retry
    pub retry: Option<RetryConfig>,

    // Tools
    #[serde(alias = "enabledTools")]
    pub enabled_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: Option<bool>,
    #[serde(alias = "keepRecentTokens")]
    pub keep_recent_tokens: Option<u64>,
    #[serde(alias = "reserveTokens")]
    pub reserve_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    #[serde(alias = "maxRetries")]
    pub max_retries: Option<u32>,
    #[serde(alias = "baseDelayMs")]
    pub base_delay_ms: Option<u64>,
    #[serde(alias = "maxDelayMs")]
    pub max_delay_ms: Option<u64>,
}

impl Config {
    /// Global configuration directory.
    pub fn global_dir() -> PathBuf {
        std::env::var("PLOVER_CONFIG_DIR").map_or_else(
            |_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                Path::new(&home).join(".config").join("plover")
            },
            PathBuf::from,
        )
    }

    /// Default sessions directory.
    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions_dir
            .as_ref()
            .map_or_else(|| Self::global_dir().join("sessions"), PathBuf::from)
    }

    /// Load global settings merged with project settings.
    pub fn load() -> Result<Self> {
        let global = Self::load_file(&Self::global_dir().join("settings.json"))?;
        let project = Self::load_file(&Path::new(".plover").join("settings.json"))?;
        Ok(global.merged_with(project))
    }

    fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }

    /// Field-by-field override: any field set in `other` wins.
    fn merged_with(self, other: Self) -> Self {
        Self {
            default_provider: other.default_provider.or(self.default_provider),
            default_model: other.default_model.or(self.default_model),
            default_thinking_level: other.default_thinking_level.or(self.default_thinking_level),
            system_prompt: other.system_prompt.or(self.system_prompt),
            max_tool_iterations: other.max_tool_iterations.or(self.max_tool_iterations),
            steering_mode: other.steering_mode.or(self.steering_mode),
            follow_up_mode: other.follow_up_mode.or(self.follow_up_mode),
            sessions_dir: other.sessions_dir.or(self.sessions_dir),
            compaction: other.compaction.or(self.compaction),
            retry: other.retry.or(self.retry),
            enabled_tools: other.enabled_tools.or(self.enabled_tools),
        }
    }

    pub fn steering_queue_mode(&self) -> QueueMode {
        self.steering_mode
            .as_deref()
            .and_then(QueueMode::parse)
            .unwrap_or(QueueMode::OneAtATime)
    }

    pub fn follow_up_queue_mode(&self) -> QueueMode {
        self.follow_up_mode
            .as_deref()
            .and_then(QueueMode::parse)
            .unwrap_or(QueueMode::OneAtATime)
    }

    pub fn compaction_enabled(&self) -> bool {
        self.compaction
            .as_ref()
            .and_then(|c| c.enabled)
            .unwrap_or(true)
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.as_ref().and_then(|r| r.enabled).unwrap_or(true)
    }

    pub fn compaction_settings(&self) -> CompactionSettings {
        let defaults = CompactionSettings::default();
        let Some(compaction) = &self.compaction else {
            return defaults;
        };
        CompactionSettings {
            keep_recent_tokens: compaction
                .keep_recent_tokens
                .unwrap_or(defaults.keep_recent_tokens),
            reserve_tokens: compaction
                .reserve_tokens
                .unwrap_or(defaults.reserve_tokens),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let Some(retry) = &self.retry else {
            return defaults;
        };
        RetryPolicy {
            max_retries: retry.max_retries.unwrap_or(defaults.max_retries),
            base_delay_ms: retry.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            max_delay_ms: retry.max_delay_ms.unwrap_or(defaults.max_delay_ms),
        }
    }

    /// Build the scheduler configuration from settings.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            system_prompt: self.system_prompt.clone(),
            max_tool_iterations: self.max_tool_iterations.unwrap_or(50),
            retry: self.retry_policy(),
            compaction: self.compaction_settings(),
        }
    }

    /// Tool names to enable, defaulting to the full built-in set.
    pub fn enabled_tool_names(&self) -> Vec<&str> {
        self.enabled_tools.as_ref().map_or_else(
            || crate::tools::BUILTIN_TOOLS.to_vec(),
            |tools| tools.iter().map(String::as_str).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.steering_queue_mode(), QueueMode::OneAtATime);
        assert!(config.compaction_enabled());
        assert!(config.retry_enabled());
        assert_eq!(config.compaction_settings().keep_recent_tokens, 30_000);
        assert_eq!(config.retry_policy().max_retries, 3);
        assert_eq!(config.enabled_tool_names().len(), 7);
    }

    #[test]
    fn camel_case_aliases_parse() {
        let config: Config = serde_json::from_str(
            r#"{
                "defaultModel": "claude-sonnet-4-20250514",
                "steeringMode": "all",
                "compaction": { "keepRecentTokens": 1000, "reserveTokens": 2000 },
                "retry": { "maxRetries": 7, "baseDelayMs": 50 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.default_model.as_deref(), Some("claude-sonnet-4-20250514"));
        assert_eq!(config.steering_queue_mode(), QueueMode::All);
        assert_eq!(config.compaction_settings().keep_recent_tokens, 1000);
        assert_eq!(config.retry_policy().max_retries, 7);
        assert_eq!(config.retry_policy().base_delay_ms, 50);
    }

    #[test]
    fn project_overrides_global() {
        let global: Config =
            serde_json::from_str(r#"{ "defaultModel": "a", "systemPrompt": "keep" }"#).unwrap();
        let project: Config = serde_json::from_str(r#"{ "defaultModel": "b" }"#).unwrap();
        let merged = global.merged_with(project);
        assert_eq!(merged.default_model.as_deref(), Some("b"));
        assert_eq!(merged.system_prompt.as_deref(), Some("keep"));
    }
}

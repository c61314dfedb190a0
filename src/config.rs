//! Gateway configuration and the durable pool-state file.
//!
//! One YAML document holds the tunable settings *and* the mutable pool
//! state (credential list, wasted log, unknown-model list). It is read once
//! at startup and rewritten after every pool mutation, so nothing survives
//! only in memory. Environment variables override any field on load.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::models::upstream::{self, PersonaStyle, StyleAttribute};
use crate::tokens::{TokenBudget, TokenCounter};

/// Session-token grammar accepted in the credential list. Entries may carry
/// an `account-class@` tag and a `sessionKey=` prefix around the raw token.
pub static COOKIE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:(claude[-_][a-z0-9-_]*?)@)?(?:sessionKey=)?(sk-ant-sid01-[\w-]{86}-[\w-]{6}AA)")
        .expect("cookie pattern")
});

/// Behavior toggles, all persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Start a fresh upstream conversation for every request.
    pub renew_always: bool,
    /// Re-send the previous turn through the regenerate endpoint when the
    /// caller repeats the same message list.
    pub retry_regenerate: bool,
    /// Ship the rendered prompt as a text attachment with a stub prompt.
    pub prompt_experiments: bool,
    /// Alternate between full and jailbreak-only system prompts while a
    /// conversation continues.
    pub system_experiments: bool,
    /// Ask the streaming collaborator to watch for replies written in the
    /// user's voice.
    pub prevent_imperson: bool,
    /// Promote all but the last turn of each role into example messages.
    pub all_samples: bool,
    /// Demote labeled example messages back into normal turns.
    pub no_samples: bool,
    /// Drop the role label of the final assistant message.
    pub strip_assistant: bool,
    /// Drop the role label of the final user message.
    pub strip_human: bool,
    /// Forward sampling parameters on pool-credential completion calls.
    pub pass_params: bool,
    /// Dismiss dismissable account flags during validation.
    pub clear_flags: bool,
    /// Leave upstream conversations in place instead of deleting them.
    pub preserve_chats: bool,
    /// Log rendered prompts and applied regex directives at debug level.
    pub log_messages: bool,
    /// Guard literal role-label colons inside content (§ colon formatting).
    pub full_colon: bool,
    /// Token-padding limits, `"min,extra,max"` read right-to-left.
    /// Empty disables padding.
    pub padtxt: String,
    /// Structured-tag prompt layout plus the inline directive sublanguage.
    pub xml_plot: bool,
    /// Rotate away from restricted accounts instead of serving with them.
    pub skip_restricted: bool,
    /// Desired state of the account's artifacts preview setting.
    pub artifacts: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            renew_always: true,
            retry_regenerate: false,
            prompt_experiments: true,
            system_experiments: true,
            prevent_imperson: true,
            all_samples: false,
            no_samples: false,
            strip_assistant: false,
            strip_human: false,
            pass_params: true,
            clear_flags: true,
            preserve_chats: false,
            log_messages: true,
            full_colon: true,
            padtxt: "1000,1000,15000".into(),
            xml_plot: true,
            skip_restricted: false,
            artifacts: false,
        }
    }
}

/// When the in-memory set of seen upstream account ids is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapReset {
    /// Keep the set for the whole process lifetime.
    #[default]
    Never,
    /// Clear it each time a validation sweep completes.
    Sweep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleAttributeConfig {
    pub name: String,
    pub percentage: f64,
}

/// Optional custom persona style attached to completion calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaStyleConfig {
    pub name: String,
    pub prompt: String,
    pub summary: String,
    #[serde(default)]
    pub attributes: Vec<StyleAttributeConfig>,
}

impl PersonaStyleConfig {
    pub fn to_style(&self) -> PersonaStyle {
        let key = uuid::Uuid::new_v4().to_string();
        PersonaStyle {
            kind: "custom".into(),
            uuid: key.clone(),
            key,
            name: self.name.clone(),
            prompt: self.prompt.clone(),
            summary: self.summary.clone(),
            is_default: false,
            attributes: self
                .attributes
                .iter()
                .map(|a| StyleAttribute {
                    name: a.name.clone(),
                    percentage: a.percentage,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Single session token; superseded by `cookie_array` when non-empty.
    pub cookie: String,
    /// Credential pool, one `class@token` entry per element.
    pub cookie_array: Vec<String>,
    /// Retired credentials, `reason@redacted-suffix` records.
    pub wasted_cookie: Vec<String>,
    /// Model ids observed upstream but absent from the known list.
    pub unknown_models: Vec<String>,
    /// Uses per credential before auto-rotation; negative enters sweep mode.
    pub cookie_counter: i32,
    /// 1-based starting cursor; 0 lets the gateway pick.
    pub cookie_index: i64,
    pub proxy_password: String,
    pub ip: String,
    pub port: u16,
    /// Messages between full system-prompt rounds (`system_experiments`).
    pub system_interval: u32,
    /// Custom relay endpoint replacing the default web API host.
    pub r_proxy: String,
    /// Custom relay endpoint for direct-key pass-through mode.
    pub api_r_proxy: String,
    pub placeholder_token: String,
    pub placeholder_byte: String,
    pub prompt_experiment_first: String,
    pub prompt_experiment_next: String,
    pub personality_format: String,
    pub scenario_format: String,
    pub overlap_reset: OverlapReset,
    pub persona_style: Option<PersonaStyleConfig>,
    pub settings: Settings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cookie: String::new(),
            cookie_array: Vec::new(),
            wasted_cookie: Vec::new(),
            unknown_models: Vec::new(),
            cookie_counter: 3,
            cookie_index: 0,
            proxy_password: String::new(),
            ip: "127.0.0.1".into(),
            port: 8444,
            system_interval: 3,
            r_proxy: String::new(),
            api_r_proxy: String::new(),
            placeholder_token: String::new(),
            placeholder_byte: String::new(),
            prompt_experiment_first: String::new(),
            prompt_experiment_next: String::new(),
            personality_format: "{{char}}'s personality: {{personality}}".into(),
            scenario_format: "Dialogue scenario: {{scenario}}".into(),
            overlap_reset: OverlapReset::Never,
            persona_style: None,
            settings: Settings::default(),
        }
    }
}

impl GatewayConfig {
    /// Canonicalize mutable state after load: extract well-formed credential
    /// entries, drop duplicate tokens, scrub the unknown-model list.
    pub fn normalize(&mut self) {
        let joined = self.cookie_array.join(",");
        let mut seen = std::collections::HashSet::new();
        self.cookie_array = COOKIE_PATTERN
            .captures_iter(&joined)
            .filter_map(|caps| {
                let token = caps.get(2)?.as_str().to_string();
                seen.insert(token)
                    .then(|| caps.get(0).map(|m| m.as_str().to_string()))
                    .flatten()
            })
            .collect();

        let mut kept = Vec::new();
        for model in self.unknown_models.drain(..) {
            if !model.is_empty()
                && !kept.contains(&model)
                && !upstream::KNOWN_MODELS.contains(&model.as_str())
            {
                kept.push(model);
            }
        }
        self.unknown_models = kept;

        self.r_proxy = self.r_proxy.trim_end_matches('/').to_string();
    }

    /// Reject impossible configurations before any request is served.
    pub fn validate(&self, counter: &dyn TokenCounter) -> Result<()> {
        if self.settings.all_samples && self.settings.no_samples {
            return Err(GatewayError::config(
                "only one can be used at the same time: all_samples/no_samples",
            ));
        }
        if !self.settings.padtxt.is_empty() {
            TokenBudget::parse(&self.settings.padtxt)?;
            for (field, value) in [
                ("placeholder_token", &self.placeholder_token),
                ("placeholder_byte", &self.placeholder_byte),
            ] {
                if !value.is_empty() && counter.count_text(value.trim()) == 0 {
                    return Err(GatewayError::config(format!(
                        "{field} counts to zero tokens and cannot be used for padding"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Where the cursor starts: an explicit 1-based index wins, otherwise a
    /// random entry in serving mode or the first entry in sweep mode.
    pub fn initial_cursor(&self, pool_len: usize) -> usize {
        if pool_len == 0 {
            return 0;
        }
        if self.cookie_index > 0 {
            ((self.cookie_index - 1) as usize).min(pool_len - 1)
        } else if self.cookie_counter >= 0 {
            use rand::Rng;
            rand::thread_rng().gen_range(0..pool_len)
        } else {
            0
        }
    }

    /// Offset term for sweep-mode progress accounting.
    pub fn start_index_offset(&self) -> i64 {
        (self.cookie_index - 1).max(0)
    }

    /// Base URL of the web API, honoring the relay override.
    pub fn endpoint(&self) -> &str {
        if self.r_proxy.is_empty() {
            upstream::DEFAULT_ENDPOINT
        } else {
            &self.r_proxy
        }
    }

    /// Rotation backoff only applies when talking to the default host.
    pub fn uses_default_endpoint(&self) -> bool {
        self.r_proxy.is_empty() || self.r_proxy == upstream::DEFAULT_ENDPOINT
    }

    /// Fold environment overrides over every field, one variable per key.
    pub fn apply_env_overrides(&mut self) {
        env_string("COOKIE", &mut self.cookie);
        if let Ok(v) = std::env::var("COOKIE_ARRAY") {
            self.cookie_array = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        env_i32("COOKIE_COUNTER", &mut self.cookie_counter);
        env_i64("COOKIE_INDEX", &mut self.cookie_index);
        env_string("PROXY_PASSWORD", &mut self.proxy_password);
        env_string("IP", &mut self.ip);
        if let Some(port) = env_parse::<u16>("PORT") {
            self.port = port;
        }
        if let Some(n) = env_parse::<u32>("SYSTEM_INTERVAL") {
            self.system_interval = n;
        }
        env_string("R_PROXY", &mut self.r_proxy);
        env_string("API_R_PROXY", &mut self.api_r_proxy);
        env_string("PLACEHOLDER_TOKEN", &mut self.placeholder_token);
        env_string("PLACEHOLDER_BYTE", &mut self.placeholder_byte);
        env_string("PROMPT_EXPERIMENT_FIRST", &mut self.prompt_experiment_first);
        env_string("PROMPT_EXPERIMENT_NEXT", &mut self.prompt_experiment_next);
        env_string("PERSONALITY_FORMAT", &mut self.personality_format);
        env_string("SCENARIO_FORMAT", &mut self.scenario_format);

        env_bool("RENEW_ALWAYS", &mut self.settings.renew_always);
        env_bool("RETRY_REGENERATE", &mut self.settings.retry_regenerate);
        env_bool("PROMPT_EXPERIMENTS", &mut self.settings.prompt_experiments);
        env_bool("SYSTEM_EXPERIMENTS", &mut self.settings.system_experiments);
        env_bool("PREVENT_IMPERSON", &mut self.settings.prevent_imperson);
        env_bool("ALL_SAMPLES", &mut self.settings.all_samples);
        env_bool("NO_SAMPLES", &mut self.settings.no_samples);
        env_bool("STRIP_ASSISTANT", &mut self.settings.strip_assistant);
        env_bool("STRIP_HUMAN", &mut self.settings.strip_human);
        env_bool("PASS_PARAMS", &mut self.settings.pass_params);
        env_bool("CLEAR_FLAGS", &mut self.settings.clear_flags);
        env_bool("PRESERVE_CHATS", &mut self.settings.preserve_chats);
        env_bool("LOG_MESSAGES", &mut self.settings.log_messages);
        env_bool("FULL_COLON", &mut self.settings.full_colon);
        env_string("PADTXT", &mut self.settings.padtxt);
        env_bool("XML_PLOT", &mut self.settings.xml_plot);
        env_bool("SKIP_RESTRICTED", &mut self.settings.skip_restricted);
        env_bool("ARTIFACTS", &mut self.settings.artifacts);

        if matches!(std::env::var("PROMPT_STYLE_ENABLED").as_deref(), Ok("true")) {
            let attr = |key: &str, default: f64| StyleAttributeConfig {
                name: key.to_string(),
                percentage: env_parse::<f64>(&format!("PROMPT_{}", key.to_uppercase()))
                    .unwrap_or(default),
            };
            self.persona_style = Some(PersonaStyleConfig {
                name: std::env::var("PROMPT_NAME").unwrap_or_else(|_| "Recover".into()),
                prompt: std::env::var("PROMPT_TEXT").unwrap_or_default(),
                summary: std::env::var("PROMPT_SUMMARY").unwrap_or_default(),
                attributes: vec![
                    attr("Systematic", 0.9),
                    attr("Analytical", 0.8),
                    attr("Methodical", 0.9),
                ],
            });
        }
    }
}

fn env_string(key: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *slot = v;
    }
}

fn env_bool(key: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => *slot = true,
            "false" | "0" | "no" | "off" => *slot = false,
            _ => {}
        }
    }
}

fn env_i32(key: &str, slot: &mut i32) {
    if let Some(n) = env_parse::<i32>(key) {
        *slot = n;
    }
}

fn env_i64(key: &str, slot: &mut i64) {
    if let Some(n) = env_parse::<i64>(key) {
        *slot = n;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Durable home of the configuration document.
///
/// Environment-supplied pools are treated as read-only: the gateway still
/// tracks wasted credentials in memory but skips rewriting the file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Store that never writes, for env-only deployments and tests.
    pub fn readonly() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the config file, or defaults when the file does not exist yet.
    /// Returns `(config, existed)`.
    pub fn load(&self) -> Result<(GatewayConfig, bool)> {
        let Some(path) = &self.path else {
            return Ok((GatewayConfig::default(), false));
        };
        if !path.exists() {
            return Ok((GatewayConfig::default(), false));
        }
        let text = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_yaml::from_str(&text)
            .map_err(|e| GatewayError::config(format!("invalid config file: {e}")))?;
        Ok((config, true))
    }

    /// Rewrite the whole document. Called after every pool mutation; the
    /// write must land before the mutation is considered committed.
    pub fn save(&self, config: &GatewayConfig) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_yaml::to_string(config)
            .map_err(|e| GatewayError::config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicTokenCounter;

    fn token(n: u8) -> String {
        format!(
            "sk-ant-sid01-{}-{}AA",
            (0..86).map(|_| char::from(b'a' + n % 26)).collect::<String>(),
            (0..6).map(|_| char::from(b'a' + n % 26)).collect::<String>()
        )
    }

    #[test]
    fn normalize_extracts_and_dedupes_cookies() {
        let mut config = GatewayConfig {
            cookie_array: vec![
                format!("claude_pro@sessionKey={}", token(1)),
                token(1),
                format!("garbage {}", token(2)),
                "not-a-cookie".into(),
            ],
            ..Default::default()
        };
        config.normalize();
        assert_eq!(config.cookie_array.len(), 2);
        assert!(config.cookie_array[0].starts_with("claude_pro@"));
    }

    #[test]
    fn normalize_scrubs_unknown_models() {
        let mut config = GatewayConfig {
            unknown_models: vec![
                "claude-2.1".into(),
                "claude-next".into(),
                "claude-next".into(),
                String::new(),
            ],
            ..Default::default()
        };
        config.normalize();
        assert_eq!(config.unknown_models, vec!["claude-next".to_string()]);
    }

    #[test]
    fn validate_rejects_sample_mode_conflict() {
        let mut config = GatewayConfig::default();
        config.settings.all_samples = true;
        config.settings.no_samples = true;
        let err = config
            .validate(&HeuristicTokenCounter::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn validate_rejects_zero_token_placeholder() {
        let config = GatewayConfig {
            placeholder_token: "   ".into(),
            ..Default::default()
        };
        let err = config
            .validate(&HeuristicTokenCounter::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn initial_cursor_prefers_explicit_index() {
        let config = GatewayConfig {
            cookie_index: 2,
            ..Default::default()
        };
        assert_eq!(config.initial_cursor(5), 1);
        // Clamped into range.
        assert_eq!(config.initial_cursor(1), 0);

        let sweep = GatewayConfig {
            cookie_counter: -1,
            ..Default::default()
        };
        assert_eq!(sweep.initial_cursor(5), 0);
    }

    #[test]
    fn store_round_trips_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::at(dir.path().join("config.yaml"));
        let mut config = GatewayConfig::default();
        config.wasted_cookie.push("Banned@deadbeef".into());
        store.save(&config).unwrap();
        let (loaded, existed) = store.load().unwrap();
        assert!(existed);
        assert_eq!(loaded.wasted_cookie, config.wasted_cookie);
    }
}

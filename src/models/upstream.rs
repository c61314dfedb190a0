use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default base URL of the private web API.
pub const DEFAULT_ENDPOINT: &str = "https://claude.ai";

/// Public API host used for direct-key pass-through mode.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.anthropic.com";

/// Model ids the gateway advertises out of the box. Accounts may surface
/// additional ids; those land in the persisted unknown-model list.
pub const KNOWN_MODELS: &[&str] = &[
    "claude-3-5-sonnet-20241022",
    "claude-3-5-sonnet-20240620",
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
    "claude-2.1",
    "claude-2.0",
    "claude-instant-1.2",
];

static LEGACY_MODEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)claude-([12]|instant)").expect("legacy model pattern"));

/// Pre-streaming-era models use a different prompt-formatting convention
/// (full-width colon guard instead of the carriage-return wedge).
pub fn is_legacy_model(model: &str) -> bool {
    LEGACY_MODEL.is_match(model)
}

/// Legacy models other than 2.1 also skip system-prefix handling in the
/// directive engine.
pub fn is_pre_2_1_model(model: &str) -> bool {
    is_legacy_model(model) && !model.to_ascii_lowercase().contains("claude-2.1")
}

/// IANA timezone attached to upstream conversation calls.
pub fn timezone() -> &'static str {
    "America/New_York"
}

// ---------------------------------------------------------------------------
// Account bootstrap / organization lookups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapResponse {
    pub account: Option<BootstrapAccount>,
    #[serde(default)]
    pub statsig: Value,
}

impl BootstrapResponse {
    /// Default model override buried in the bootstrap feature-gate payload,
    /// when the account carries one.
    pub fn default_model(&self) -> Option<String> {
        let values = self.statsig.get("values")?;
        values
            .get("layer_configs")
            .and_then(|layers| layers.as_object())
            .and_then(|layers| {
                layers.values().find_map(|layer| {
                    layer
                        .pointer("/value/console_default_model_override/model")
                        .and_then(|m| m.as_str())
                })
            })
            .or_else(|| {
                values
                    .get("dynamic_configs")
                    .and_then(|cfgs| cfgs.as_object())
                    .and_then(|cfgs| {
                        cfgs.values()
                            .find_map(|cfg| cfg.pointer("/value/model").and_then(|m| m.as_str()))
                    })
            })
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapAccount {
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub completed_verification_at: Option<Value>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
    #[serde(default)]
    pub settings: Value,
}

impl BootstrapAccount {
    /// The organization that can hold chat conversations.
    pub fn chat_organization(&self) -> Option<&Organization> {
        self.memberships
            .iter()
            .map(|m| &m.organization)
            .find(|org| org.capabilities.iter().any(|c| c == "chat"))
    }

    pub fn is_verified(&self) -> bool {
        !matches!(self.completed_verification_at, None | Some(Value::Null))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Membership {
    pub organization: Organization,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub api_disabled_reason: Option<Value>,
    #[serde(default)]
    pub api_disabled_until: Option<Value>,
    #[serde(default)]
    pub active_flags: Vec<AccountFlag>,
}

/// Paid account classes recognized from organization capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountClass {
    Pro,
    TeamPro,
}

impl AccountClass {
    pub fn tag(&self) -> &'static str {
        match self {
            AccountClass::Pro => "claude_pro",
            AccountClass::TeamPro => "claude_team_pro",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "claude_pro" => Some(AccountClass::Pro),
            "claude_team_pro" => Some(AccountClass::TeamPro),
            _ => None,
        }
    }
}

impl Organization {
    pub fn account_class(&self) -> Option<AccountClass> {
        if self.capabilities.iter().any(|c| c == "claude_pro") {
            Some(AccountClass::Pro)
        } else if self.capabilities.iter().any(|c| c == "raven") {
            Some(AccountClass::TeamPro)
        } else {
            None
        }
    }

    /// Disabled with no recovery date — the credential is unusable.
    pub fn is_hard_disabled(&self) -> bool {
        !matches!(self.api_disabled_reason, None | Some(Value::Null))
            && matches!(self.api_disabled_until, None | Some(Value::Null))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountFlag {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl AccountFlag {
    pub fn is_ban(&self) -> bool {
        self.kind == "consumer_banned"
    }

    /// Bans and restricted-mode flags cannot be dismissed.
    pub fn is_dismissable(&self) -> bool {
        !self.is_ban() && self.kind != "consumer_restricted_mode"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSummary {
    pub uuid: String,
}

// ---------------------------------------------------------------------------
// Conversation call bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ConversationShell {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub extracted_content: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: usize,
}

impl Attachment {
    /// Wrap a rendered prompt as the text attachment the web client uploads.
    pub fn of_prompt(prompt: &str) -> Self {
        Self {
            extracted_content: prompt.to_string(),
            file_name: "paste.txt".into(),
            file_type: "txt".into(),
            file_size: prompt.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StyleAttribute {
    pub name: String,
    pub percentage: f64,
}

/// Custom persona style rider for completion calls.
#[derive(Debug, Clone, Serialize)]
pub struct PersonaStyle {
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub uuid: String,
    pub name: String,
    pub prompt: String,
    pub summary: String,
    #[serde(rename = "isDefault")]
    pub is_default: bool,
    pub attributes: Vec<StyleAttribute>,
}

/// `POST …/completion` body.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionBody {
    pub attachments: Vec<Attachment>,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub rendering_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_to_sample: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personalized_styles: Option<Vec<PersonaStyle>>,
    pub sync_sources: Vec<String>,
    pub prompt: String,
    pub timezone: String,
}

/// `POST …/retry_completion` body; the prompt is intentionally empty.
#[derive(Debug, Clone, Serialize)]
pub struct RetryBody {
    pub prompt: String,
    pub parent_message_uuid: String,
    pub timezone: String,
    pub attachments: Vec<Attachment>,
    pub files: Vec<String>,
    pub rendering_mode: String,
}

impl Default for RetryBody {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            parent_message_uuid: String::new(),
            timezone: timezone().into(),
            attachments: Vec::new(),
            files: Vec::new(),
            rendering_mode: "raw".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_model_detection() {
        assert!(is_legacy_model("claude-2.1"));
        assert!(is_legacy_model("claude-instant-1.2"));
        assert!(!is_legacy_model("claude-3-opus-20240229"));
        assert!(is_pre_2_1_model("claude-2.0"));
        assert!(!is_pre_2_1_model("claude-2.1"));
    }

    #[test]
    fn chat_organization_prefers_chat_capability() {
        let account: BootstrapAccount = serde_json::from_value(json!({
            "memberships": [
                {"organization": {"uuid": "a", "capabilities": ["billing"]}},
                {"organization": {"uuid": "b", "capabilities": ["chat", "claude_pro"]}}
            ]
        }))
        .unwrap();
        let org = account.chat_organization().unwrap();
        assert_eq!(org.uuid, "b");
        assert_eq!(org.account_class(), Some(AccountClass::Pro));
    }

    #[test]
    fn hard_disabled_requires_missing_recovery_date() {
        let org: Organization = serde_json::from_value(json!({
            "uuid": "x",
            "api_disabled_reason": "tos",
            "api_disabled_until": "2026-01-01"
        }))
        .unwrap();
        assert!(!org.is_hard_disabled());

        let org: Organization = serde_json::from_value(json!({
            "uuid": "x",
            "api_disabled_reason": "tos"
        }))
        .unwrap();
        assert!(org.is_hard_disabled());
    }

    #[test]
    fn flag_dismissability() {
        let ban = AccountFlag {
            kind: "consumer_banned".into(),
            expires_at: None,
        };
        assert!(ban.is_ban());
        assert!(!ban.is_dismissable());
        let warn = AccountFlag {
            kind: "warning".into(),
            expires_at: None,
        };
        assert!(warn.is_dismissable());
    }

    #[test]
    fn default_model_read_from_bootstrap_gates() {
        let boot: BootstrapResponse = serde_json::from_value(json!({
            "account": null,
            "statsig": {"values": {"layer_configs": {
                "abc": {"value": {"console_default_model_override": {"model": "claude-3-haiku-20240307"}}}
            }}}
        }))
        .unwrap();
        assert_eq!(
            boot.default_model().as_deref(),
            Some("claude-3-haiku-20240307")
        );
    }
}

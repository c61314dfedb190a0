//! The request orchestrator.
//!
//! Takes a classified inbound chat request and produces the matching
//! upstream call: a conversation renewal plus completion, a regenerate
//! call, a continuation, or a direct pass-through against the vendor's
//! public API. Feeds completion results back into the session manager.

use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use serde_json::{json, Value};

use crate::config::GatewayConfig;
use crate::conversation::{ClassifyOptions, RequestType};
use crate::error::{GatewayError, Result};
use crate::models::chat::{ChatCompletionRequest, ChatCompletionResponse};
use crate::models::upstream::{
    self, is_legacy_model, is_pre_2_1_model, Attachment, CompletionBody, RetryBody,
};
use crate::pipeline::{self, ColonScope, FinalizeOptions};
use crate::session::SessionManager;

/// Server banner, also the greeting short-circuit body.
pub fn banner() -> String {
    format!("sessionbridge v{}", env!("CARGO_PKG_VERSION"))
}

static VENDOR_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sk-ant-api\d\d-[\w-]{86}-[\w-]{6}AA").expect("vendor key pattern"));
static STOP_SET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\|stopSet *(\[.*?\]) *\|>").expect("stopSet tag"));
static STOP_REVOKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\|stopRevoke *(\[.*?\]) *\|>").expect("stopRevoke tag"));

/// Parsed inbound `Authorization` header.
#[derive(Debug, Clone, Default)]
pub struct InboundAuth {
    /// Direct vendor API keys, when the caller opted out of the pool.
    pub api_keys: Option<Vec<String>>,
    /// The keys came from an explicit `oaiKey:`/`3rdKey:` marker.
    pub explicit: bool,
    /// `oaiKey:` marker: target the OpenAI-compatible chat endpoint.
    pub oai: bool,
    /// Raw bearer value for the proxy-password check.
    pub bearer: Option<String>,
}

impl InboundAuth {
    pub fn parse(header: Option<&str>) -> Self {
        let Some(header) = header else {
            return Self::default();
        };
        let bearer = header.strip_prefix("Bearer ").map(|s| s.to_string());
        let oai = header.contains("oaiKey:");
        for marker in ["3rdKey:", "oaiKey:"] {
            if let Some(rest) = header.split(marker).nth(1) {
                let keys: Vec<String> = rest
                    .split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
                if !keys.is_empty() {
                    return Self {
                        api_keys: Some(keys),
                        explicit: true,
                        oai,
                        bearer,
                    };
                }
            }
        }
        let vendor: Vec<String> = VENDOR_KEY
            .find_iter(header)
            .map(|m| m.as_str().to_string())
            .collect();
        Self {
            api_keys: (!vendor.is_empty()).then_some(vendor),
            explicit: false,
            oai: false,
            bearer,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_keys.is_some()
    }
}

/// Which public-API endpoint shape a direct-key request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVariant {
    /// Legacy text completion.
    Complete,
    /// Vendor messages endpoint.
    Messages,
    /// OpenAI-compatible chat completions.
    OpenAi,
}

/// Everything the response relay needs to know about the call it carries.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_type: RequestType,
    pub model: String,
    pub api_mode: bool,
    pub stream: bool,
}

/// Outcome of orchestration: answered locally or streaming from upstream.
pub enum ChatOutcome {
    Immediate(ChatCompletionResponse),
    Upstream {
        response: reqwest::Response,
        meta: RequestMeta,
    },
}

/// Merge caller stop sequences with `<|stopSet|>`/`<|stopRevoke|>`
/// directives and the implicit role terminators.
pub fn merge_stop_sequences(
    caller: &[String],
    set: Option<&str>,
    revoke: Option<&str>,
) -> Option<Vec<String>> {
    if caller.is_empty() && set.is_none() && revoke.is_none() {
        return None;
    }
    let parse = |raw: Option<&str>| -> Vec<String> {
        raw.and_then(|r| serde_json::from_str::<Vec<String>>(r).ok())
            .unwrap_or_default()
    };
    let revoked = parse(revoke);
    let mut merged = parse(set);
    merged.extend(caller.iter().cloned());
    merged.push("\n\nHuman:".into());
    merged.push("\n\nAssistant:".into());
    Some(
        merged
            .into_iter()
            .filter(|s| !s.is_empty() && !revoked.contains(s))
            .collect(),
    )
}

/// Split a flat API-mode prompt back into a system preamble and role turns.
fn split_rounds(prompt: &str) -> (String, Vec<(&'static str, String)>) {
    let prepped = if prompt.contains("\n\nHuman:") {
        prompt.to_string()
    } else {
        format!("\n\nHuman:{prompt}")
    };
    let mut rounds = prepped.split("\n\nHuman:");
    let system = rounds.next().unwrap_or_default().trim().to_string();
    let mut turns = Vec::new();
    for round in rounds {
        let mut parts = round.split("\n\nAssistant:");
        turns.push(("user", parts.next().unwrap_or_default().trim().to_string()));
        for part in parts {
            turns.push(("assistant", part.trim().to_string()));
        }
    }
    (system, turns)
}

/// Fold consecutive same-role (or empty) turns back together, re-labelling
/// the folded turn with a guarded role line.
fn fold_turns(
    turns: Vec<(&'static str, String)>,
    full_colon: bool,
    legacy: bool,
) -> Vec<(&'static str, String)> {
    let mut folded: Vec<(&'static str, String)> = Vec::new();
    for (role, content) in turns {
        let join = match folded.last() {
            Some((last_role, last_content)) if full_colon => {
                *last_role == role || last_content.is_empty()
            }
            _ => false,
        };
        if join {
            let label = if role == "user" { "Human" } else { "Assistant" };
            let glue = if legacy {
                format!("\n{label}{} ", pipeline::FULL_WIDTH_COLON)
            } else {
                format!("\n{}\n{label}: ", pipeline::COLON_WEDGE)
            };
            let last = folded.last_mut().expect("nonempty");
            last.1.push_str(&glue);
            last.1.push_str(&content);
        } else {
            folded.push((role, content));
        }
    }
    folded.into_iter().filter(|(_, c)| !c.is_empty()).collect()
}

/// Base URL for direct-key calls: explicit-key relays are taken verbatim,
/// otherwise a single `/v1` suffix is ensured.
fn api_base(config: &GatewayConfig, explicit: bool) -> String {
    let base = if config.api_r_proxy.trim().is_empty() {
        upstream::DEFAULT_API_ENDPOINT
    } else {
        config.api_r_proxy.trim()
    };
    let base = base.trim_end_matches('/');
    if explicit || base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{base}/v1")
    }
}

/// Drive one chat request end to end, returning either a locally answered
/// body or the upstream streaming response.
pub async fn execute_chat(
    session: &Arc<SessionManager>,
    request: ChatCompletionRequest,
    auth: InboundAuth,
) -> Result<ChatOutcome> {
    let config = session.config_snapshot();
    let account = session.active_account();
    let is_paid = account.as_ref().map(|a| a.is_paid()).unwrap_or(false);

    let force_model = request.model.contains("--force");
    let requested_model = request.model.replace("--force", "").trim().to_string();
    let model = if auth.has_api_key() || force_model || is_paid {
        requested_model.clone()
    } else {
        account
            .as_ref()
            .and_then(|a| a.cookie_model.clone())
            .unwrap_or_else(|| requested_model.clone())
    };

    if !auth.has_api_key() {
        if !config.proxy_password.is_empty()
            && auth.bearer.as_deref() != Some(config.proxy_password.as_str())
        {
            return Err(GatewayError::config("proxy password wrong"));
        }
        if account.is_none() {
            return Err(GatewayError::config(
                "no session credential available or API key format wrong",
            ));
        }
        session.set_requested_model(Some(model.clone()));
        if !session.is_rotating() && !is_paid {
            let pinned = account.as_ref().and_then(|a| a.cookie_model.as_deref());
            if pinned.is_some() && pinned != Some(model.as_str()) {
                session.rotate(true, false);
            }
        }
    }
    session.wait_until_stable().await;

    // Rotation may have landed on a different account while we waited.
    let account = session.active_account();
    let is_paid = account.as_ref().map(|a| a.is_paid()).unwrap_or(false);

    if request.messages.is_empty() {
        return Err(GatewayError::config("empty message list"));
    }

    // Greeting probe: answer locally with the banner.
    if !request.stream
        && request.messages.len() == 1
        && request.messages[0].role == crate::models::chat::Role::User
        && request.messages[0].content == "Hi"
    {
        return Ok(ChatOutcome::Immediate(ChatCompletionResponse::of_text(
            banner(),
        )));
    }

    let model_list = session.model_list();
    if !model_list.iter().any(|m| m == &model) && !model.starts_with("claude-") && !force_model {
        return Err(GatewayError::config(format!(
            "invalid model selected: {model}"
        )));
    }

    // Classify and update conversation identity.
    let classification = {
        let mut controller = session.controller().lock().expect("controller");
        controller.classify(
            &request.messages,
            ClassifyOptions {
                has_api_key: auth.has_api_key(),
                renew_always: config.settings.renew_always,
                retry_regenerate: config.settings.retry_regenerate,
                system_experiments: config.settings.system_experiments,
                system_interval: config.system_interval,
            },
        )
    };
    let request_type = classification.request_type;
    let api_mode = request_type == RequestType::Api;

    // Render stages 1–5.
    let rendered = pipeline::render_messages(&request.messages, request_type, &config)?;

    let legacy = is_legacy_model(&model);
    let messages_api = auth.explicit
        || (!legacy && !rendered.prompt.contains("<|completeAPI|>"))
        || rendered.prompt.contains("<|messagesAPI|>");
    let messages_log = rendered.prompt.contains("<|messagesLog|>");
    let fusion = api_mode && messages_api && rendered.prompt.contains("<|Fusion Mode|>");

    let stop_set = STOP_SET
        .captures(&rendered.prompt)
        .map(|c| c.get(1).unwrap().as_str().to_string());
    let stop_revoke = STOP_REVOKE
        .captures(&rendered.prompt)
        .map(|c| c.get(1).unwrap().as_str().to_string());
    let stop_sequences = merge_stop_sequences(
        &request.stop_sequences(),
        stop_set.as_deref(),
        stop_revoke.as_deref(),
    );

    // Stages 6–8.
    let scope = if fusion {
        ColonScope::Fusion
    } else if api_mode {
        ColonScope::Api
    } else {
        ColonScope::Plain
    };
    let finalized = pipeline::finalize_prompt(
        &rendered.prompt,
        FinalizeOptions {
            api_mode,
            legacy,
            pre_2_1: is_pre_2_1_model(&model),
            scope,
        },
        &config,
        &*session.counter(),
    )?;

    tracing::info!(
        model = %model,
        kind = request_type.label(),
        tokens = finalized.tokens,
        systems = %rendered.systems.join(" / "),
        "dispatching request"
    );
    if config.settings.log_messages {
        tracing::debug!(
            regex = %finalized.regex_log.join("\n"),
            prompt = %finalized.prompt,
            "rendered prompt"
        );
    }

    let meta = RequestMeta {
        request_type,
        model: model.clone(),
        api_mode,
        stream: request.stream,
    };

    // Direct-key pass-through.
    if api_mode {
        let keys = auth.api_keys.clone().unwrap_or_default();
        let key = keys
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| GatewayError::config("missing API key"))?;
        let variant = if auth.oai {
            ApiVariant::OpenAi
        } else if messages_api {
            ApiVariant::Messages
        } else {
            ApiVariant::Complete
        };
        let path = match variant {
            ApiVariant::OpenAi => "/chat/completions",
            ApiVariant::Messages => "/messages",
            ApiVariant::Complete => "/complete",
        };
        let url = format!("{}{}", api_base(&config, auth.explicit), path);

        let mut body = json!({
            "model": model,
            "stream": true,
        });
        let object = body.as_object_mut().expect("body object");
        if let Some(stops) = &stop_sequences {
            object.insert("stop_sequences".into(), json!(stops));
        }
        if let Some(t) = request.clamped_temperature() {
            object.insert("temperature".into(), json!(t));
        }
        if let Some(k) = request.top_k {
            object.insert("top_k".into(), json!(k));
        }
        if let Some(p) = request.top_p {
            object.insert("top_p".into(), json!(p));
        }
        if variant == ApiVariant::Complete {
            object.insert("prompt".into(), json!(finalized.prompt));
            if let Some(max) = request.max_tokens {
                object.insert("max_tokens_to_sample".into(), json!(max));
            }
        } else {
            let (system, turns) = split_rounds(&finalized.prompt);
            let folded = fold_turns(turns, config.settings.full_colon, legacy);
            let mut messages: Vec<Value> = folded
                .into_iter()
                .map(|(role, content)| json!({"role": role, "content": content}))
                .collect();
            if variant == ApiVariant::OpenAi {
                messages.insert(0, json!({"role": "system", "content": system}));
            } else if !system.is_empty() {
                object.insert("system".into(), json!(system));
            }
            if messages_log {
                tracing::info!(messages = %serde_json::to_string_pretty(&messages).unwrap_or_default(), "api messages");
            }
            object.insert("messages".into(), json!(messages));
            if let Some(max) = request.max_tokens {
                object.insert("max_tokens".into(), json!(max));
            }
        }

        let response = session.client().api_completion(&url, &key, &body).await?;
        return Ok(ChatOutcome::Upstream { response, meta });
    }

    // Pool-credential path needs a resolved account.
    let account = account.ok_or_else(|| GatewayError::config("no session credential available"))?;
    let endpoint = config.endpoint().to_string();

    if let Some(stale) = &classification.delete_first {
        session.delete_conversation(stale).await;
    }

    if request_type == RequestType::Retry {
        let conversation = {
            let controller = session.controller().lock().expect("controller");
            controller.conversation.uuid.clone()
        }
        .ok_or_else(|| GatewayError::config("no conversation to retry"))?;
        let response = session
            .client()
            .retry_completion(
                &endpoint,
                &account.org_uuid,
                &conversation,
                &RetryBody::default(),
            )
            .await?;
        return Ok(ChatOutcome::Upstream { response, meta });
    }

    let conversation = if request_type == RequestType::Renew {
        let fresh = classification
            .new_conversation
            .clone()
            .expect("renewal allocates a conversation");
        session
            .client()
            .create_conversation(&endpoint, &account.org_uuid, &fresh)
            .await?;
        fresh
    } else {
        let controller = session.controller().lock().expect("controller");
        controller
            .conversation
            .uuid
            .clone()
            .ok_or_else(|| GatewayError::config("no live conversation"))?
    };

    // Prompt-attachment experiment: the rendered prompt rides as a text
    // attachment; the literal prompt field carries the configured stub.
    let mut attachments = Vec::new();
    let prompt_field = if config.settings.prompt_experiments {
        let mut split = finalized.prompt.splitn(2, "\n\nPlainPrompt:");
        let head = split.next().unwrap_or_default();
        attachments.push(Attachment::of_prompt(head));
        let stub = if request_type == RequestType::Renew {
            config.prompt_experiment_first.clone()
        } else {
            config.prompt_experiment_next.clone()
        };
        match split.next() {
            Some(tail) => format!("{stub}{tail}"),
            None => stub,
        }
    } else {
        finalized.prompt.clone()
    };

    let pass = config.settings.pass_params;
    let body = CompletionBody {
        attachments,
        files: Vec::new(),
        model: (is_paid || force_model).then_some(model.clone()),
        rendering_mode: "messages".into(),
        max_tokens_to_sample: pass.then_some(request.max_tokens).flatten(),
        top_k: pass.then_some(request.top_k).flatten(),
        top_p: pass.then_some(request.top_p).flatten(),
        temperature: pass.then_some(request.clamped_temperature()).flatten(),
        personalized_styles: config
            .persona_style
            .as_ref()
            .map(|style| vec![style.to_style()]),
        sync_sources: Vec::new(),
        prompt: prompt_field,
        timezone: upstream::timezone().into(),
    };

    let response = session
        .client()
        .completion(&endpoint, &account.org_uuid, &conversation, &body)
        .await?;
    Ok(ChatOutcome::Upstream { response, meta })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendor_key(seed: char) -> String {
        format!(
            "sk-ant-api03-{}-{}AA",
            std::iter::repeat(seed).take(86).collect::<String>(),
            std::iter::repeat(seed).take(6).collect::<String>()
        )
    }

    #[test]
    fn auth_parses_explicit_third_party_keys() {
        let auth = InboundAuth::parse(Some("Bearer 3rdKey:key-one, key-two"));
        assert!(auth.explicit);
        assert!(!auth.oai);
        assert_eq!(
            auth.api_keys.as_deref(),
            Some(&["key-one".to_string(), "key-two".to_string()][..])
        );
    }

    #[test]
    fn auth_parses_oai_marker() {
        let auth = InboundAuth::parse(Some("Bearer oaiKey:sk-live-1"));
        assert!(auth.oai);
        assert!(auth.explicit);
    }

    #[test]
    fn auth_recognizes_vendor_key_pattern() {
        let key = vendor_key('k');
        let auth = InboundAuth::parse(Some(&format!("Bearer {key}")));
        assert!(!auth.explicit);
        assert_eq!(auth.api_keys.as_deref(), Some(&[key][..]));
    }

    #[test]
    fn auth_without_keys_keeps_bearer_for_password_check() {
        let auth = InboundAuth::parse(Some("Bearer hunter2"));
        assert!(auth.api_keys.is_none());
        assert_eq!(auth.bearer.as_deref(), Some("hunter2"));
    }

    #[test]
    fn stop_sequences_merge_and_revoke() {
        let merged = merge_stop_sequences(
            &["END".to_string()],
            Some(r#"["STOP"]"#),
            Some(r#"["\n\nHuman:"]"#),
        )
        .unwrap();
        assert!(merged.contains(&"STOP".to_string()));
        assert!(merged.contains(&"END".to_string()));
        assert!(merged.contains(&"\n\nAssistant:".to_string()));
        assert!(!merged.contains(&"\n\nHuman:".to_string()));
    }

    #[test]
    fn no_stop_input_yields_none() {
        assert!(merge_stop_sequences(&[], None, None).is_none());
    }

    #[test]
    fn rounds_split_into_system_and_turns() {
        let (system, turns) =
            split_rounds("sys text\n\nHuman: q1\n\nAssistant: a1\n\nHuman: q2");
        assert_eq!(system, "sys text");
        assert_eq!(
            turns,
            vec![
                ("user", "q1".to_string()),
                ("assistant", "a1".to_string()),
                ("user", "q2".to_string()),
            ]
        );
    }

    #[test]
    fn promptless_rounds_get_a_leading_user_turn() {
        let (system, turns) = split_rounds("just text");
        assert_eq!(system, "");
        assert_eq!(turns, vec![("user", "just text".to_string())]);
    }

    #[test]
    fn consecutive_turns_fold_with_guarded_labels() {
        let turns = vec![
            ("user", "a".to_string()),
            ("user", "b".to_string()),
            ("assistant", "c".to_string()),
        ];
        let folded = fold_turns(turns, true, false);
        assert_eq!(folded.len(), 2);
        assert!(folded[0].1.contains("a\n\r\nHuman: b"));

        let turns = vec![("user", "a".to_string()), ("user", "b".to_string())];
        let folded = fold_turns(turns, true, true);
        assert!(folded[0].1.contains(&format!(
            "a\nHuman{} b",
            pipeline::FULL_WIDTH_COLON
        )));
    }

    #[test]
    fn api_base_ensures_single_version_suffix() {
        let mut config = GatewayConfig::default();
        assert_eq!(api_base(&config, false), "https://api.anthropic.com/v1");
        config.api_r_proxy = "https://relay.example/v1".into();
        assert_eq!(api_base(&config, false), "https://relay.example/v1");
        // Explicit third-party keys take the relay verbatim.
        config.api_r_proxy = "https://relay.example/custom".into();
        assert_eq!(api_base(&config, true), "https://relay.example/custom");
    }
}

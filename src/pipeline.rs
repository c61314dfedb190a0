//! The prompt transformation pipeline.
//!
//! Turns a structured message list into the flat prompt text the upstream
//! web API expects: merge → annotate → sample modes → discard → render,
//! then directive post-processing, the role-colon guard, and token-budget
//! padding.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::config::GatewayConfig;
use crate::directive::{self, DirectiveOptions};
use crate::error::{GatewayError, Result};
use crate::models::chat::{ChatMessage, Role};
use crate::conversation::RequestType;
use crate::tokens::{TokenBudget, TokenCounter};

/// Role labels used in the flat prompt. System messages render label-less;
/// example messages use the single-letter forms.
fn replacement_label(key: &str) -> Option<&'static str> {
    match key {
        "user" => Some("Human"),
        "assistant" => Some("Assistant"),
        "system" => Some(""),
        "example_user" => Some("H"),
        "example_assistant" => Some("A"),
        _ => None,
    }
}

/// Reserved names that never count as a custom persona.
fn is_reserved_name(name: &str) -> bool {
    replacement_label(name).is_some()
}

/// A message plus its transient pipeline annotations. Recomputed per
/// request, never persisted.
#[derive(Debug, Clone)]
struct WorkMessage {
    role: Role,
    content: String,
    name: Option<String>,
    customname: bool,
    merged: bool,
    discard: bool,
    strip: bool,
    main: bool,
    jailbreak: bool,
    system_prompt: bool,
}

impl WorkMessage {
    fn from_chat(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
            name: msg.name.clone(),
            customname: false,
            merged: false,
            discard: false,
            strip: false,
            main: false,
            jailbreak: false,
            system_prompt: false,
        }
    }

    fn is_dialogue(&self) -> bool {
        matches!(self.role, Role::User | Role::Assistant)
    }
}

/// Stages 1–5: the rendered prompt plus the surviving-system preview list.
#[derive(Debug, Clone)]
pub struct RenderedMessages {
    pub prompt: String,
    pub systems: Vec<String>,
}

static SCENARIO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\[Circumstances and context of the dialogue: ([\s\S]+?)\.?\]$")
        .expect("scenario pattern")
});
static PERSONALITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\[([\s\S]+?)'s personality: ([\s\S]+?)\]$").expect("personality pattern")
});

/// Normalize line endings and literal `\n` sequences clients sometimes send.
pub fn normalize_newlines(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace("\\n", "\n")
}

/// Stages 1–5 of the pipeline.
pub fn render_messages(
    messages: &[ChatMessage],
    request_type: RequestType,
    config: &GatewayConfig,
) -> Result<RenderedMessages> {
    let settings = &config.settings;
    if settings.all_samples && settings.no_samples {
        return Err(GatewayError::config(
            "only one can be used at the same time: all_samples/no_samples",
        ));
    }

    let mut work: Vec<WorkMessage> = messages.iter().map(WorkMessage::from_chat).collect();

    // Sample messages first, then dialogue, mirroring how the example
    // transcript precedes the live one.
    let sample_idx: Vec<usize> = (0..work.len()).filter(|&i| work[i].name.is_some()).collect();
    let real_idx: Vec<usize> = (0..work.len()).filter(|&i| work[i].is_dialogue()).collect();
    let merged_idx: Vec<usize> = sample_idx
        .iter()
        .chain(real_idx.iter())
        .copied()
        .collect();

    for &i in &merged_idx {
        work[i].customname = work[i].is_dialogue()
            && work[i]
                .name
                .as_deref()
                .map(|n| !is_reserved_name(n))
                .unwrap_or(false);
    }

    // Stage 1: merge pass (legacy layout only). Chains accumulate into the
    // first message of a run so no content is dropped.
    if !settings.xml_plot {
        let mut head = None::<usize>;
        for window in merged_idx.windows(2) {
            let (i, j) = (window[0], window[1]);
            let head_idx = head.unwrap_or(i);
            let mergeable = match (&work[i].name, &work[j].name) {
                (Some(a), Some(b)) => a == b,
                _ => {
                    if work[j].role != Role::System {
                        work[j].role == work[i].role
                    } else {
                        true
                    }
                }
            };
            if mergeable {
                let extra = work[j].content.clone();
                work[head_idx].content.push('\n');
                work[head_idx].content.push_str(&extra);
                work[j].merged = true;
                head = Some(head_idx);
            } else {
                head = Some(j);
            }
        }
    }

    // Stage 2: annotations.
    let last_assistant = real_idx
        .iter()
        .rev()
        .copied()
        .find(|&i| !work[i].merged && work[i].role == Role::Assistant);
    let last_user = real_idx
        .iter()
        .rev()
        .copied()
        .find(|&i| !work[i].merged && work[i].role == Role::User);
    if let (Some(i), true) = (last_assistant, settings.strip_assistant) {
        work[i].strip = true;
    }
    if let (Some(i), true) = (last_user, settings.strip_human) {
        work[i].strip = true;
    }

    let system_idx: Vec<usize> = (0..work.len())
        .filter(|&i| work[i].role == Role::System && work[i].name.is_none())
        .collect();
    for (pos, &i) in system_idx.iter().enumerate() {
        if let Some(caps) = SCENARIO.captures(&work[i].content) {
            work[i].content = config.scenario_format.replace("{{scenario}}", &caps[1]);
        } else if let Some(caps) = PERSONALITY.captures(&work[i].content) {
            work[i].content = config
                .personality_format
                .replace("{{char}}", &caps[1])
                .replace("{{personality}}", &caps[2]);
        }
        work[i].main = pos == 0;
        work[i].jailbreak = pos == system_idx.len() - 1;
        if work[i].content == " " {
            work[i].discard = true;
        }
        work[i].system_prompt = true;
    }

    // Stage 3: sample modes.
    if settings.all_samples {
        for &i in &real_idx {
            if Some(i) == last_user || Some(i) == last_assistant {
                continue;
            }
            if !work[i].customname {
                work[i].name = Some(match work[i].role {
                    Role::User => "example_user".into(),
                    Role::Assistant => "example_assistant".into(),
                    Role::System => unreachable!("real logs are dialogue"),
                });
            }
            work[i].role = Role::System;
        }
    }
    if settings.no_samples {
        for &i in &sample_idx {
            match work[i].name.as_deref() {
                Some("example_user") => work[i].role = Role::User,
                Some("example_assistant") => work[i].role = Role::Assistant,
                Some(name) if !work[i].customname => {
                    return Err(GatewayError::config(format!("invalid role {name}")));
                }
                _ => {}
            }
            if !work[i].customname {
                work[i].name = None;
            }
        }
    }

    // Stage 4: discard pass, skipped when the full history renders.
    let mut systems = Vec::new();
    if !request_type.renders_full_history() {
        if let Some(i) = last_user {
            work[i].strip = true;
        }
        let same_round = request_type == RequestType::ContinueSameRound;
        for &i in &system_idx {
            work[i].discard = work[i].discard
                || if same_round {
                    !work[i].jailbreak
                } else {
                    !work[i].jailbreak && !work[i].main
                };
        }
        systems = system_idx
            .iter()
            .filter(|&&i| !work[i].discard)
            .map(|&i| {
                let head: String = work[i].content.chars().take(25).collect();
                format!("\"{}...\"", head.replace('\n', "\\n").trim())
            })
            .collect();
        for &i in &merged_idx {
            if Some(i) != last_user {
                work[i].discard = true;
            }
        }
    }

    // Stage 5: render.
    let mut prompt = String::new();
    for (idx, msg) in work.iter().enumerate() {
        if msg.merged || msg.discard {
            continue;
        }
        if msg.content.is_empty() {
            continue;
        }
        let part = if settings.xml_plot {
            let spacing = if idx > 0 { "\n\n" } else { "" };
            let prefix = if msg.customname {
                format!(
                    "{}: {}: ",
                    msg.role.as_str(),
                    msg.name.as_deref().unwrap_or_default().replace('_', " ")
                )
            } else if msg.role != Role::System || msg.name.is_some() {
                let key = msg.name.as_deref().unwrap_or(msg.role.as_str());
                format!(
                    "{}: ",
                    replacement_label(key).unwrap_or(msg.role.as_str())
                )
            } else {
                "xmlPlot: ".into()
            };
            format!(
                "{spacing}{}{}",
                if msg.strip { "" } else { prefix.as_str() },
                msg.content
            )
        } else {
            let spacing = if idx > 0 {
                if msg.system_prompt {
                    "\n"
                } else {
                    "\n\n"
                }
            } else {
                ""
            };
            let prefix = if msg.customname {
                format!(
                    "{}: ",
                    msg.name.as_deref().unwrap_or_default().replace('_', " ")
                )
            } else if msg.role != Role::System || msg.name.is_some() {
                let key = msg.name.as_deref().unwrap_or(msg.role.as_str());
                let label = replacement_label(key).unwrap_or(msg.role.as_str());
                if label.is_empty() {
                    String::new()
                } else {
                    format!("{label}: ")
                }
            } else {
                String::new()
            };
            let content = if msg.role == Role::System {
                msg.content.as_str()
            } else {
                msg.content.trim()
            };
            format!(
                "{spacing}{}{}",
                if msg.strip { "" } else { prefix.as_str() },
                content
            )
        };
        prompt.push_str(&part);
    }
    Ok(RenderedMessages { prompt, systems })
}

// ---------------------------------------------------------------------------
// Stage 7: role-colon guard
// ---------------------------------------------------------------------------

/// Which variant of the colon guard applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColonScope {
    /// Fusion mode: guard everything except the final assistant cue.
    Fusion,
    /// Direct-key mode: guard only the cues the round splitter must skip.
    Api,
    /// Pool-credential mode: guard every boundary.
    Plain,
}

/// Wedge byte spliced into modern-model prompts between the blank line and
/// the role label.
pub const COLON_WEDGE: char = '\r';
/// Full-width colon substituted on legacy models.
pub const FULL_WIDTH_COLON: char = '﹕';

#[derive(Debug, Clone, Copy)]
struct Boundary {
    pos: usize,
    len: usize,
    assistant: bool,
}

fn role_boundaries(content: &str) -> Vec<Boundary> {
    let mut found = Vec::new();
    for (label, assistant) in [("\n\nHuman:", false), ("\n\nAssistant:", true)] {
        for (pos, _) in content.match_indices(label) {
            found.push(Boundary {
                pos,
                len: label.len(),
                assistant,
            });
        }
    }
    found.sort_by_key(|b| b.pos);
    found
}

/// Guard role-delimiting colons so literal `Human:`/`Assistant:` strings in
/// content do not open a new turn upstream.
pub fn guard_role_colons(content: &str, legacy: bool, scope: ColonScope) -> String {
    let boundaries = role_boundaries(content);
    if boundaries.is_empty() {
        return content.to_string();
    }
    let first_human = boundaries.iter().find(|b| !b.assistant).map(|b| b.pos);
    let last_assistant = boundaries.iter().rev().find(|b| b.assistant).map(|b| b.pos);

    let selected: Vec<&Boundary> = boundaries
        .iter()
        .filter(|b| match scope {
            ColonScope::Plain => true,
            ColonScope::Fusion => {
                // Skip the trailing assistant cue the model completes after.
                !(b.assistant && content[b.pos + b.len..].trim().is_empty())
            }
            ColonScope::Api => {
                if b.assistant {
                    first_human.map(|h| b.pos < h).unwrap_or(true)
                } else {
                    last_assistant.map(|a| b.pos > a).unwrap_or(true)
                }
            }
        })
        .collect();

    let mut out = String::with_capacity(content.len() + selected.len());
    let mut cursor = 0;
    for b in selected {
        if legacy {
            // Replace the label's colon with the full-width variant.
            let colon_at = b.pos + b.len - 1;
            out.push_str(&content[cursor..colon_at]);
            out.push(FULL_WIDTH_COLON);
            cursor = colon_at + 1;
        } else {
            // Splice the wedge between the two newlines.
            out.push_str(&content[cursor..b.pos + 1]);
            out.push(COLON_WEDGE);
            cursor = b.pos + 1;
        }
    }
    out.push_str(&content[cursor..]);
    out
}

// ---------------------------------------------------------------------------
// Stage 8: token padding
// ---------------------------------------------------------------------------

static PAD_AMOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\|padtxt.*?(\d+)t.*?\|>").expect("pad amount tag"));
static PAD_OFF: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\|padtxt off.*?\|>").expect("pad off"));
static PAD_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\|padtxt.*?\|>").expect("pad tag"));
static PAD_TAG_SPACED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*<\|padtxt.*?\|>\s*").expect("pad tag spaced"));

/// Result of the padding stage: the final prompt and its token count.
#[derive(Debug, Clone)]
pub struct PaddedPrompt {
    pub prompt: String,
    pub tokens: u32,
}

/// Bring the prompt up to the configured token budget.
pub fn pad_prompt(
    content: &str,
    config: &GatewayConfig,
    api_mode: bool,
    counter: &dyn TokenCounter,
) -> Result<PaddedPrompt> {
    let budget = TokenBudget::parse(&config.settings.padtxt)?;
    let mut tokens = counter.count_text(content);

    let placeholder = {
        let configured = if budget.past_margin(tokens) && budget.min_limit > 0 {
            &config.placeholder_byte
        } else {
            &config.placeholder_token
        };
        if configured.is_empty() {
            random_placeholder()
        } else {
            configured.clone()
        }
    };
    let unit = counter.count_text(placeholder.trim());
    if unit == 0 {
        return Err(GatewayError::config(
            "padding placeholder counts to zero tokens",
        ));
    }

    // Inline amount tags consume exactly the requested token count.
    let mut text = content.to_string();
    while let Some((range, amount)) = PAD_AMOUNT.captures(&text).map(|caps| {
        let whole = caps.get(0).expect("whole match");
        (whole.range(), caps[1].parse::<u32>().unwrap_or(0))
    }) {
        let filler = placeholder.repeat((amount / unit) as usize);
        text.replace_range(range, &filler);
        tokens += amount;
    }

    // `<|padtxt off|>` short-circuits all further padding.
    if PAD_OFF.is_match(&text) {
        let stripped = PAD_TAG_SPACED.replace_all(&text, "\n\n");
        return Ok(PaddedPrompt {
            prompt: stripped.trim().to_string(),
            tokens,
        });
    }

    let fill = budget.fill_amount(tokens);
    let padding = placeholder.repeat((fill / unit) as usize);
    tokens += counter.count_text(&padding);

    let prompt = if PAD_TAG.is_match(&text) {
        let once = PAD_TAG.replace(&text, padding.as_str()).into_owned();
        PAD_TAG_SPACED.replace_all(&once, "\n\n").into_owned()
    } else if !api_mode && !padding.is_empty() {
        format!("{padding}\n\n\n{}", text.trim())
    } else {
        text
    };

    Ok(PaddedPrompt { prompt, tokens })
}

fn random_placeholder() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(5..15);
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

// ---------------------------------------------------------------------------
// Finalization: directives + colon guard + padding in order
// ---------------------------------------------------------------------------

/// Options the orchestrator derives from the request and rendered prompt.
#[derive(Debug, Clone, Copy)]
pub struct FinalizeOptions {
    pub api_mode: bool,
    pub legacy: bool,
    pub pre_2_1: bool,
    pub scope: ColonScope,
}

/// Final prompt with its request-log metadata.
#[derive(Debug, Clone)]
pub struct FinalPrompt {
    pub prompt: String,
    pub regex_log: Vec<String>,
    pub tokens: u32,
}

/// Stages 6–8 over an already rendered prompt.
pub fn finalize_prompt(
    raw: &str,
    opts: FinalizeOptions,
    config: &GatewayConfig,
    counter: &dyn TokenCounter,
) -> Result<FinalPrompt> {
    let pad_enabled = !config.settings.padtxt.is_empty();
    let mut regex_log = Vec::new();

    let mut prompt = if config.settings.xml_plot {
        let outcome = directive::process_prompt(
            raw,
            &DirectiveOptions {
                api_mode: opts.api_mode,
                keep_pad_tags: pad_enabled,
                nonsys: opts.pre_2_1,
            },
        );
        regex_log = outcome.regex_log;
        outcome.text
    } else if opts.api_mode {
        format!("\n\nHuman: {}\n\nAssistant:", normalize_newlines(raw))
    } else {
        normalize_newlines(raw).trim().to_string()
    };

    if config.settings.full_colon {
        prompt = guard_role_colons(&prompt, opts.legacy, opts.scope);
    }

    if pad_enabled {
        let padded = pad_prompt(&prompt, config, opts.api_mode, counter)?;
        Ok(FinalPrompt {
            prompt: padded.prompt,
            regex_log,
            tokens: padded.tokens,
        })
    } else {
        let tokens = counter.count_text(&prompt);
        Ok(FinalPrompt {
            prompt,
            regex_log,
            tokens,
        })
    }
}

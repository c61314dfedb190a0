//! The directive text engine.
//!
//! Prompt text may embed a small control sublanguage: regex rewrite tags,
//! merge-gate tags, numbered insertion tags, whitespace directives, and a
//! handful of API-mode markers. Each directive is parsed into a typed node
//! with its own apply step; malformed directives are logged and skipped,
//! never fatal.

use once_cell::sync::Lazy;
use regex::Regex;

/// Options steering a directive pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectiveOptions {
    /// Direct-key pass-through mode; enables the API-only markers.
    pub api_mode: bool,
    /// Leave `<|padtxt…|>` tags in place for the padding stage.
    pub keep_pad_tags: bool,
    /// Skip system-prefix rewriting (pre-2.1 legacy models).
    pub nonsys: bool,
}

/// Result of a full directive pass over one prompt.
#[derive(Debug, Clone)]
pub struct DirectiveOutcome {
    pub text: String,
    /// Raw regex directives that were applied, for request logging.
    pub regex_log: Vec<String>,
}

/// Which adjacent-block merges are enabled. A tag *disables* its scope, so
/// all fields default to true.
#[derive(Debug, Clone, Copy)]
pub struct MergeControls {
    pub all: bool,
    pub system: bool,
    pub human: bool,
    pub assistant: bool,
}

impl MergeControls {
    pub fn detect(content: &str) -> Self {
        Self {
            all: !content.contains("<|Merge Disable|>"),
            system: !content.contains("<|Merge System Disable|>"),
            human: !content.contains("<|Merge Human Disable|>"),
            assistant: !content.contains("<|Merge Assistant Disable|>"),
        }
    }
}

/// One `<regex order=N>"pattern":"replacement"</regex>` rewrite node.
#[derive(Debug, Clone)]
pub struct RegexDirective {
    pub raw: String,
    pub pattern: String,
    pub flags: String,
    pub replacement: String,
}

/// One `<@N>TEXT</@N>` insertion node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertDirective {
    pub depth: usize,
    pub text: String,
}

static REGEX_TAG_ORDERED: Lazy<Vec<Regex>> = Lazy::new(|| {
    (1..=3)
        .map(|order| {
            // Plain `<regex>` tags default to the second sweep.
            let optional = if order == 2 { "?" } else { "" };
            Regex::new(&format!(
                r#"<regex(?: +order *= *{order}){optional}> *"(.*)" *: *"(.*?)" *</regex>"#
            ))
            .expect("regex directive pattern")
        })
        .collect()
});

static REGEX_TAG_ANY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<regex( +order *= *\d)?>.*?</regex>").expect("regex tag strip"));
static INLINE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\s*<\|(.*?)\|>\s*").expect("inline tag"));
static ROLE_SPACING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\n\n(H(uman)?|A(ssistant)?): +").expect("role spacing"));
static ESCAPED_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<\|(\\.*?)\|>").expect("escaped tag"));
static LEADING_HUMAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Human: *").expect("leading human"));
static TRAILING_ASSISTANT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\nAssistant: *$").expect("trailing assistant"));
static FIRST_ROLE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.+:").expect("first role line"));
static XMLPLOT_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(\n\n|^\s*)xmlPlot:\s*").expect("xmlplot label"));
static XMLPLOT_LABEL_TIGHT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\n\n|^\s*)xmlPlot: *").expect("xmlplot label tight"));

/// Full directive pass, in sweep order: regex sweep 1 → merges → insertion
/// tags → regex sweep 2 → merges → plain-prompt split → regex sweep 3 →
/// cleanup → mode-specific finishing.
pub fn process_prompt(content: &str, opts: &DirectiveOptions) -> DirectiveOutcome {
    let mut regex_log = Vec::new();
    let mut text = apply_regex_sweep(content, 1, &mut regex_log);

    let controls = MergeControls::detect(&text);
    text = apply_merges(&text, &controls, opts.nonsys);
    text = apply_insertions(&text);
    text = apply_regex_sweep(&text, 2, &mut regex_log);
    text = apply_merges(&text, &controls, opts.nonsys);
    if !opts.api_mode {
        text = apply_plain_prompt_split(&text);
    }
    text = apply_regex_sweep(&text, 3, &mut regex_log);
    text = cleanup_pass(&text);
    text = if opts.api_mode {
        finish_api(&text, opts.keep_pad_tags)
    } else {
        finish_plain(&text, opts.keep_pad_tags)
    };

    DirectiveOutcome { text, regex_log }
}

// ---------------------------------------------------------------------------
// Regex rewrite directives
// ---------------------------------------------------------------------------

fn parse_regex_directives(content: &str, order: usize) -> Vec<RegexDirective> {
    REGEX_TAG_ORDERED[order - 1]
        .captures_iter(content)
        .map(|caps| {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let (pattern, flags) = split_pattern_flags(body);
            RegexDirective {
                raw: caps.get(0).map(|m| m.as_str()).unwrap_or_default().to_string(),
                pattern,
                flags,
                replacement: caps.get(2).map(|m| m.as_str()).unwrap_or_default().to_string(),
            }
        })
        .collect()
}

/// `"/pattern/flags"` splits into pattern + flags; bare patterns carry none.
fn split_pattern_flags(body: &str) -> (String, String) {
    if let Some(stripped) = body.strip_prefix('/') {
        if let Some(idx) = stripped.rfind('/') {
            return (
                stripped[..idx].to_string(),
                stripped[idx + 1..].to_string(),
            );
        }
    }
    (body.to_string(), String::new())
}

fn apply_regex_sweep(content: &str, order: usize, log: &mut Vec<String>) -> String {
    let mut text = content.to_string();
    for directive in parse_regex_directives(content, order) {
        match directive.compile() {
            Ok((re, global)) => {
                log.push(directive.raw.clone());
                let replacement = directive.rust_replacement();
                text = if global {
                    re.replace_all(&text, replacement.as_str()).into_owned()
                } else {
                    re.replace(&text, replacement.as_str()).into_owned()
                };
            }
            Err(err) => {
                tracing::warn!(directive = %directive.raw, %err, "skipping malformed regex directive");
            }
        }
    }
    text
}

impl RegexDirective {
    /// Compile the embedded pattern; returns the regex and whether the `g`
    /// flag asked for a global replace.
    fn compile(&self) -> Result<(Regex, bool), regex::Error> {
        let mut inline = String::new();
        let mut global = false;
        for flag in self.flags.chars() {
            match flag {
                'g' => global = true,
                'i' | 'm' | 's' | 'x' | 'u' => inline.push(flag),
                _ => {}
            }
        }
        let pattern = if inline.is_empty() {
            self.pattern.clone()
        } else {
            format!("(?{inline}){}", self.pattern)
        };
        Ok((Regex::new(&pattern)?, global))
    }

    /// Replacement string with escape sequences decoded and JS group syntax
    /// (`$&`, bare `$1`) mapped onto braced group references.
    fn rust_replacement(&self) -> String {
        static GROUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").expect("group ref"));
        let decoded = unescape_json_fragment(&self.replacement)
            .unwrap_or_else(|| self.replacement.clone())
            .replace("$&", "${0}");
        GROUP.replace_all(&decoded, "$${$1}").into_owned()
    }
}

/// Decode a replacement/escape fragment the way a JSON string literal
/// would, tolerating unescaped quotes.
fn unescape_json_fragment(fragment: &str) -> Option<String> {
    static QUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\\?""#).expect("quote escape"));
    let quoted = format!("\"{}\"", QUOTE.replace_all(fragment, "\\\""));
    serde_json::from_str::<String>(&quoted).ok()
}

// ---------------------------------------------------------------------------
// Merge gating
// ---------------------------------------------------------------------------

fn apply_merges(content: &str, controls: &MergeControls, nonsys: bool) -> String {
    let mut text = content.to_string();

    if XMLPLOT_LABEL.is_match(&text) {
        if !nonsys {
            text = strip_pre_dialogue_labels(&text);
        }
        let replacement = if controls.system && controls.human && controls.all {
            "\n\nHuman: "
        } else {
            "$1"
        };
        text = XMLPLOT_LABEL_TIGHT
            .replace_all(&text, replacement)
            .into_owned();
    }

    if controls.all && controls.human {
        text = merge_role_spans(&text, "Human", "Assistant");
    }
    if controls.all && controls.assistant {
        text = merge_role_spans(&text, "Assistant", "Human");
    }
    text
}

/// Remove `xmlPlot:` labels occurring before the first dialogue marker.
fn strip_pre_dialogue_labels(content: &str) -> String {
    let first_dialogue = ["\n\nHuman:", "\n\nAssistant:"]
        .iter()
        .filter_map(|marker| content.find(marker))
        .min()
        .unwrap_or(content.len());
    let (head, tail) = content.split_at(first_dialogue);
    format!("{}{}", XMLPLOT_LABEL.replace_all(head, "$1"), tail)
}

/// Collapse consecutive same-role blocks: inside each `role` span (up to the
/// next `until` marker or end of text), embedded `\n\nrole:` labels and the
/// whitespace after them fold into a blank line.
fn merge_role_spans(content: &str, role: &str, until: &str) -> String {
    let label = format!("\n\n{role}:");
    let stop = format!("\n\n{until}:");
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    let mut at_start = true;

    loop {
        let hit = if at_start && role == "Human" {
            // A leading `Human:` (after optional whitespace) also opens a span
            // and is normalized to a blank-line-prefixed label.
            let trimmed = rest.trim_start();
            if trimmed.starts_with("Human:") {
                Some((rest.len() - trimmed.len(), 0))
            } else {
                rest.find(&label).map(|i| (i, label.len()))
            }
        } else {
            rest.find(&label).map(|i| (i, label.len()))
        };
        at_start = false;

        let Some((pos, matched_len)) = hit else {
            out.push_str(rest);
            break;
        };
        if matched_len == 0 {
            // Start-of-text span: skip the leading whitespace, emit a label.
            out.push_str("\n\nHuman:");
            rest = &rest[pos + "Human:".len()..];
        } else {
            out.push_str(&rest[..pos]);
            out.push_str(&label);
            rest = &rest[pos + matched_len..];
        }

        let span_end = rest.find(&stop).unwrap_or(rest.len());
        let (span, tail) = rest.split_at(span_end);
        out.push_str(&collapse_labels(span, &label));
        rest = tail;
        if rest.is_empty() {
            break;
        }
    }
    out
}

/// Replace `label` + following whitespace with a blank line.
fn collapse_labels(span: &str, label: &str) -> String {
    let mut out = String::with_capacity(span.len());
    let mut rest = span;
    while let Some(pos) = rest.find(label) {
        out.push_str(&rest[..pos]);
        out.push_str("\n\n");
        rest = rest[pos + label.len()..].trim_start();
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Insertion directives
// ---------------------------------------------------------------------------

fn parse_insertions(content: &str) -> Vec<InsertDirective> {
    static OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@(\d+)>").expect("insert open"));
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(caps) = OPEN.captures(&content[offset..]) {
        let open = caps.get(0).unwrap();
        let depth: usize = match caps[1].parse() {
            Ok(n) => n,
            Err(_) => {
                offset += open.end();
                continue;
            }
        };
        let close = format!("</@{depth}>");
        let body_start = offset + open.end();
        match content[body_start..].find(&close) {
            Some(rel) => {
                found.push(InsertDirective {
                    depth,
                    text: content[body_start..body_start + rel].to_string(),
                });
                offset = body_start + rel + close.len();
            }
            None => {
                tracing::warn!(depth, "unterminated insertion directive");
                offset += open.end();
            }
        }
    }
    found
}

/// Splice each `<@N>TEXT</@N>` into the N-th-from-last blank-line-delimited
/// block, then strip the tags.
fn apply_insertions(content: &str) -> String {
    let inserts = parse_insertions(content);
    if inserts.is_empty() {
        return content.to_string();
    }
    let mut blocks: Vec<String> = content.split("\n\n").map(|b| b.to_string()).collect();
    for insert in &inserts {
        if insert.depth + 1 > blocks.len() {
            continue;
        }
        let idx = blocks.len() - 1 - insert.depth;
        blocks[idx].push_str("\n\n");
        blocks[idx].push_str(&insert.text);
    }
    strip_insertion_tags(&blocks.join("\n\n"))
}

fn strip_insertion_tags(content: &str) -> String {
    let mut out = content.to_string();
    for insert in parse_insertions(content) {
        let tag = format!("<@{0}>{1}</@{0}>", insert.depth, insert.text);
        out = out.replacen(&tag, "", 1);
    }
    out
}

// ---------------------------------------------------------------------------
// Plain-prompt split
// ---------------------------------------------------------------------------

/// When the final user segment opts in, relocate it behind a `PlainPrompt:`
/// marker so the orchestrator can carry it outside the attachment.
fn apply_plain_prompt_split(content: &str) -> String {
    let segments: Vec<&str> = content.split("\n\nHuman:").collect();
    let last = segments.len() - 1;
    if last < 2
        || !segments[last].contains("<|Plain Prompt Enable|>")
        || content.contains("\n\nPlainPrompt:")
    {
        return content.to_string();
    }
    static LABELED: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\n\nHuman: *PlainPrompt:").expect("labeled plain prompt"));
    let head = segments[..last].join("\n\nHuman:");
    let tail = LABELED.replace(segments[last], "\n\nPlainPrompt:");
    format!("{head}\n\nPlainPrompt:{tail}")
}

// ---------------------------------------------------------------------------
// Cleanup and finishing
// ---------------------------------------------------------------------------

fn cleanup_pass(content: &str) -> String {
    let mut text = REGEX_TAG_ANY.replace_all(content, "").into_owned();
    text = text.replace("\r\n", "\n").replace('\r', "\n");

    // Whitespace directives, each a typed node with a fixed expansion.
    for (tag, expansion) in [("curtail", "\n"), ("join", ""), ("space", " ")] {
        text = replace_inline_tag(&text, tag, expansion);
    }
    text = ROLE_SPACING.replace_all(&text, "\n\n$1: ").into_owned();
    text = ESCAPED_TAG
        .replace_all(&text, |caps: &regex::Captures| {
            unescape_json_fragment(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();
    text
}

/// Replace `<|tag|>` with its expansion, consuming surrounding whitespace.
fn replace_inline_tag(content: &str, tag: &str, expansion: &str) -> String {
    let needle = format!("<|{tag}|>");
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(pos) = rest.find(&needle) {
        out.push_str(rest[..pos].trim_end());
        out.push_str(expansion);
        rest = rest[pos + needle.len()..].trim_start();
    }
    out.push_str(rest);
    out
}

/// Strip remaining inline tags (padtxt excepted while padding is pending).
fn strip_inline_tags(content: &str, keep_pad_tags: bool) -> String {
    INLINE_TAG
        .replace_all(content, |caps: &regex::Captures| {
            if keep_pad_tags && caps[1].starts_with("padtxt") {
                caps[0].to_string()
            } else {
                "\n\n".to_string()
            }
        })
        .into_owned()
}

fn collapse_blank_runs(content: &str) -> String {
    let mut text = content.to_string();
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text
}

fn finish_api(content: &str, keep_pad_tags: bool) -> String {
    let mut text = ensure_assistant_cue(content);
    text = apply_no_assistant(&text);
    if text.contains("<|reverseHA|>") {
        text = apply_reverse_roles(&text);
    }
    let stripped = strip_inline_tags(&text, keep_pad_tags);
    let trimmed = stripped.trim();
    let prefixed = FIRST_ROLE_LINE.replace(trimmed, "\n\n${0}").into_owned();
    collapse_blank_runs(&prefixed)
}

fn finish_plain(content: &str, keep_pad_tags: bool) -> String {
    let stripped = strip_inline_tags(content, keep_pad_tags);
    let trimmed = stripped.trim();
    let without_human = LEADING_HUMAN.replace(trimmed, "").into_owned();
    let without_cue = TRAILING_ASSISTANT.replace(&without_human, "").into_owned();
    collapse_blank_runs(&without_cue)
}

/// Append `\n\nAssistant:` unless the text already ends in an assistant cue
/// (no human block after the last assistant block).
fn ensure_assistant_cue(content: &str) -> String {
    let last_assistant = content.rfind("\n\nAssistant:");
    let last_human = content.rfind("\n\nHuman:");
    let needs_cue = match (last_assistant, last_human) {
        (None, _) => true,
        (Some(a), Some(h)) => h > a,
        (Some(_), None) => false,
    };
    if needs_cue {
        format!("{content}\n\nAssistant:")
    } else {
        content.to_string()
    }
}

/// `<|noAssistant|>`: keep the text before the marker's position as prefix,
/// then splice in the remainder minus any trailing assistant cue.
fn apply_no_assistant(content: &str) -> String {
    const TAG: &str = "<|noAssistant|>";
    let Some(pos) = content.find(TAG) else {
        return content.to_string();
    };
    let prefix = content[..pos].trim_end();
    let mut rest = content[pos + TAG.len()..].trim_start();
    if let Some(idx) = rest.rfind("\n\nAssistant:") {
        if rest[idx + "\n\nAssistant:".len()..].trim().is_empty() {
            rest = &rest[..idx];
        }
    }
    format!("{prefix}\n\n{rest}")
}

/// `<|reverseHA|>`: drop the markers, then swap every Human/Assistant role
/// token (and the single-letter `A:`/`H:` line labels).
fn apply_reverse_roles(content: &str) -> String {
    let mut text = replace_inline_tag(content, "reverseHA", "\n\n");
    text = swap_tokens(&text, "Human", "Assistant");
    text = swap_tokens(&text, "\nA: ", "\nH: ");
    text
}

/// Swap all occurrences of two tokens in one left-to-right scan.
fn swap_tokens(content: &str, a: &str, b: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    loop {
        let next_a = rest.find(a);
        let next_b = rest.find(b);
        let (pos, from, to) = match (next_a, next_b) {
            (Some(pa), Some(pb)) if pa <= pb => (pa, a, b),
            (Some(pa), None) => (pa, a, b),
            (_, Some(pb)) => (pb, b, a),
            (None, None) => break,
        };
        out.push_str(&rest[..pos]);
        out.push_str(to);
        rest = &rest[pos + from.len()..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> DirectiveOptions {
        DirectiveOptions::default()
    }

    fn api() -> DirectiveOptions {
        DirectiveOptions {
            api_mode: true,
            ..Default::default()
        }
    }

    #[test]
    fn whitespace_directives_expand() {
        let out = process_prompt("a <|curtail|> b", &plain());
        assert_eq!(out.text, "a\nb");
        let out = process_prompt("a <|join|> b", &plain());
        assert_eq!(out.text, "ab");
        let out = process_prompt("a <|space|> b", &plain());
        assert_eq!(out.text, "a b");
    }

    #[test]
    fn escaped_tag_unescapes_or_passes_through() {
        let out = process_prompt(r"x<|\n|>y", &plain());
        assert_eq!(out.text, "x\ny");
        // Invalid escape survives untouched until the final strip.
        let out = process_prompt(r"x<|\q|>y", &plain());
        assert_eq!(out.text, "x\n\ny");
    }

    #[test]
    fn regex_directive_rewrites_and_logs() {
        // The rewrite scans the whole prompt, so the first occurrence of the
        // pattern is the one in the body preceding the tag.
        let content = "the cat sat<regex order=1>\"cat\":\"dog\"</regex>";
        let out = process_prompt(content, &plain());
        assert_eq!(out.text, "the dog sat");
        assert_eq!(out.regex_log.len(), 1);
    }

    #[test]
    fn regex_directive_supports_flags_and_groups() {
        let content = "Cat cat<regex>\"/(c)at/gi\":\"$1ow\"</regex>";
        let out = process_prompt(content, &plain());
        assert_eq!(out.text, "Cow cow");
    }

    #[test]
    fn malformed_regex_directive_is_skipped() {
        let content = "body<regex order=1>\"(unclosed\":\"x\"</regex>";
        let out = process_prompt(content, &plain());
        assert_eq!(out.text, "body");
        assert!(out.regex_log.is_empty());
    }

    #[test]
    fn insertion_splices_into_second_to_last_block() {
        let content = "first block\n\nsecond block\n\n<@1>inserted</@1>";
        let out = process_prompt(content, &plain());
        assert!(out.text.contains("second block\n\ninserted"));
        assert!(!out.text.contains("<@1>"));
    }

    #[test]
    fn insertion_out_of_range_is_dropped() {
        let out = process_prompt("only\n\n<@9>x</@9>", &plain());
        assert_eq!(out.text, "only");
        assert!(!out.text.contains('x'));
    }

    #[test]
    fn human_blocks_merge_unless_disabled() {
        let content = "\n\nHuman: one\n\nHuman: two\n\nAssistant: ok";
        let merged = process_prompt(content, &plain());
        assert_eq!(merged.text, "one\n\ntwo\n\nAssistant: ok");

        let gated = process_prompt(
            &format!("<|Merge Human Disable|>{content}"),
            &plain(),
        );
        assert!(gated.text.contains("Human: two"));
    }

    #[test]
    fn assistant_blocks_merge() {
        let content = "\n\nHuman: q\n\nAssistant: a\n\nAssistant: b";
        let out = process_prompt(content, &plain());
        assert!(out.text.contains("Assistant: a\n\nb"));
    }

    #[test]
    fn api_mode_appends_assistant_cue() {
        let out = process_prompt("\n\nHuman: hello", &api());
        assert!(out.text.ends_with("\n\nAssistant:"));
        // Already cued: unchanged.
        let out = process_prompt("\n\nHuman: hi\n\nAssistant:", &api());
        assert!(!out.text.ends_with("Assistant:\n\nAssistant:"));
    }

    #[test]
    fn no_assistant_discards_trailing_cue() {
        let out = process_prompt("\n\nHuman: q<|noAssistant|>tail\n\nAssistant:", &api());
        assert!(out.text.ends_with("tail"));
    }

    #[test]
    fn reverse_roles_swaps_every_token() {
        let out = process_prompt("<|reverseHA|>\n\nHuman: a\n\nAssistant: b", &api());
        assert!(out.text.contains("Assistant: a"));
        assert!(out.text.contains("Human: b"));
    }

    #[test]
    fn plain_prompt_split_requires_three_segments() {
        let content =
            "sys\n\nHuman: a\n\nHuman: b\n\nHuman: tail <|Plain Prompt Enable|>";
        let split = apply_plain_prompt_split(content);
        assert!(split.contains("\n\nPlainPrompt:"));
        assert!(!split.contains("PlainPrompt: tail\n\nHuman:"));

        let short = "sys\n\nHuman: tail <|Plain Prompt Enable|>";
        assert_eq!(apply_plain_prompt_split(short), short);
    }

    #[test]
    fn plain_mode_strips_outer_role_labels() {
        let out = process_prompt("\n\nHuman: hi\n\nAssistant: ", &plain());
        assert_eq!(out.text, "hi");
    }

    #[test]
    fn pad_tags_survive_when_requested() {
        let opts = DirectiveOptions {
            keep_pad_tags: true,
            ..Default::default()
        };
        let out = process_prompt("a\n\n<|padtxt 100t|>\n\nb", &opts);
        assert!(out.text.contains("<|padtxt 100t|>"));
        let out = process_prompt("a\n\n<|padtxt 100t|>\n\nb", &plain());
        assert!(!out.text.contains("padtxt"));
    }
}

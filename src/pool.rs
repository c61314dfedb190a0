//! The credential pool: ordered session tokens, a circular cursor, and
//! sweep-progress accounting. Pure data structure; live validation and
//! scheduling sit in [`crate::session`].

use sha2::{Digest, Sha256};

use crate::config::{GatewayConfig, COOKIE_PATTERN};
use crate::error::ValidationKind;

/// One pool entry: a session token with an optional account-class tag
/// (`claude_pro@sk-ant-sid01-…`). The tag may also name the account's
/// default model when bootstrap revealed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    tag: Option<String>,
    token: String,
}

impl CredentialEntry {
    /// Parse an entry from the credential-list grammar. Returns `None` for
    /// strings that do not contain a well-formed session token.
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = COOKIE_PATTERN.captures(raw)?;
        Some(Self {
            tag: caps.get(1).map(|m| m.as_str().to_string()),
            token: caps.get(2)?.as_str().to_string(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = Some(tag.into());
    }

    /// Cookie header value for upstream calls.
    pub fn session_cookie(&self) -> String {
        format!("sessionKey={}", self.token)
    }

    /// Short stable fingerprint; wasted-log records never carry the token.
    pub fn redacted_suffix(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        hex::encode(&digest[..4])
    }

    /// Serialized form for the persisted credential list.
    pub fn to_entry_string(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{tag}@{}", self.token),
            None => self.token.clone(),
        }
    }
}

/// Ordered credential sequence with a circular cursor.
#[derive(Debug)]
pub struct CredentialPool {
    entries: Vec<CredentialEntry>,
    cursor: usize,
    /// Uses per credential before auto-rotation; negative = sweep mode.
    use_budget: i32,
    /// Pool size when the process started; denominator of sweep progress.
    size_at_start: usize,
    /// Validation attempts so far.
    rotations: u64,
    /// Progress head start from an explicit starting index.
    start_offset: u64,
}

impl CredentialPool {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let entries: Vec<CredentialEntry> = config
            .cookie_array
            .iter()
            .filter_map(|raw| CredentialEntry::parse(raw))
            .collect();
        let cursor = config.initial_cursor(entries.len());
        let size_at_start = entries.len();
        Self {
            entries,
            cursor,
            use_budget: config.cookie_counter,
            size_at_start,
            rotations: 0,
            start_offset: config.start_index_offset() as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&CredentialEntry> {
        self.entries.get(self.cursor)
    }

    pub fn current_mut(&mut self) -> Option<&mut CredentialEntry> {
        self.entries.get_mut(self.cursor)
    }

    /// Uses allowed per credential before rotation; `None` disables the
    /// counter-based trigger.
    pub fn use_budget(&self) -> Option<u32> {
        (self.use_budget > 0).then_some(self.use_budget as u32)
    }

    /// Negative rotation budget: validate and retire everything, then exit.
    pub fn sweep_mode(&self) -> bool {
        self.use_budget < 0
    }

    /// Advance the cursor circularly. Pools of size ≤ 1 never rotate;
    /// reported as state, not an error.
    pub fn select_next(&mut self) -> bool {
        if self.entries.len() <= 1 {
            return false;
        }
        self.cursor = (self.cursor + 1) % self.entries.len();
        true
    }

    /// Record one validation attempt; returns coverage after it.
    pub fn note_attempt(&mut self) -> f64 {
        self.rotations += 1;
        self.progress()
    }

    /// Sweep coverage in percent. Monotonically non-decreasing: attempts
    /// only ever accumulate.
    pub fn progress(&self) -> f64 {
        if self.size_at_start == 0 {
            return 100.0;
        }
        ((self.rotations + self.start_offset) as f64 / self.size_at_start as f64) * 100.0
    }

    /// Remove the current entry, returning it with its wasted-log record.
    /// The cursor is folded back into range so the invariant
    /// `cursor ∈ [0, len)` holds whenever the pool is non-empty.
    pub fn retire_current(&mut self, kind: ValidationKind) -> Option<(CredentialEntry, String)> {
        if self.cursor >= self.entries.len() {
            return None;
        }
        let entry = self.entries.remove(self.cursor);
        if !self.entries.is_empty() {
            self.cursor %= self.entries.len();
        } else {
            self.cursor = 0;
        }
        let record = format!("{}@{}", kind.label(), entry.redacted_suffix());
        Some((entry, record))
    }

    /// Serialized pool for persistence.
    pub fn entry_strings(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.to_entry_string()).collect()
    }
}

//! Conversation identity and per-request classification.
//!
//! The controller owns the upstream conversation id and its turn depth,
//! keeps the previous request's message list for comparison, and decides
//! what kind of upstream call each inbound request becomes.

use uuid::Uuid;

use crate::models::chat::{ChatMessage, Role};

/// Sentinel system message some clients insert between chats; ignored when
/// snapshotting the last system message.
const NEW_CHAT_MARKER: &str = "[Start a new chat]";

/// The live upstream conversation, if any.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub uuid: Option<String>,
    /// Turns since the last full renewal.
    pub depth: u32,
}

impl Conversation {
    pub fn exists(&self) -> bool {
        self.uuid.is_some()
    }

    /// Allocate a fresh identifier, returning it; depth restarts at zero.
    pub fn renew(&mut self) -> String {
        let id = Uuid::new_v4().to_string();
        self.uuid = Some(id.clone());
        self.depth = 0;
        id
    }

    pub fn clear(&mut self) {
        self.uuid = None;
        self.depth = 0;
    }
}

/// First/last message per role, for equality comparisons between the
/// current and previous request. Discarded once superseded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptSnapshot {
    pub first_user: Option<ChatMessage>,
    pub first_system: Option<ChatMessage>,
    pub first_assistant: Option<ChatMessage>,
    pub last_user: Option<ChatMessage>,
    pub last_system: Option<ChatMessage>,
    pub last_assistant: Option<ChatMessage>,
}

impl PromptSnapshot {
    pub fn capture(messages: &[ChatMessage]) -> Self {
        let first = |role: Role| messages.iter().find(|m| m.role == role).cloned();
        let last = |role: Role| messages.iter().rev().find(|m| m.role == role).cloned();
        Self {
            first_user: first(Role::User),
            first_system: first(Role::System),
            first_assistant: first(Role::Assistant),
            last_user: last(Role::User),
            last_system: messages
                .iter()
                .rev()
                .find(|m| m.role == Role::System && m.content != NEW_CHAT_MARKER)
                .cloned(),
            last_assistant: last(Role::Assistant),
        }
    }
}

/// What kind of upstream call this request becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Direct API key supplied; pool and conversation are bypassed.
    Api,
    /// Same message list again: regenerate the previous turn.
    Retry,
    /// Discard the old conversation and start a new one.
    Renew,
    /// Continue the conversation, resending the full system prompt.
    ContinueNewRound,
    /// Continue the conversation inside the current round.
    ContinueSameRound,
    /// Message list identical to the previous request; nothing to send.
    Unchanged,
}

impl RequestType {
    /// Short tag used in request logs.
    pub fn label(&self) -> &'static str {
        match self {
            RequestType::Api => "api",
            RequestType::Retry => "R",
            RequestType::Renew => "r",
            RequestType::ContinueNewRound => "c-r",
            RequestType::ContinueSameRound => "c-c",
            RequestType::Unchanged => "-",
        }
    }

    /// Types that skip the discard pass and render the full history.
    pub fn renders_full_history(&self) -> bool {
        matches!(
            self,
            RequestType::Api | RequestType::Retry | RequestType::Renew
        )
    }
}

/// Settings slice the classifier needs.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyOptions {
    pub has_api_key: bool,
    pub renew_always: bool,
    pub retry_regenerate: bool,
    pub system_experiments: bool,
    pub system_interval: u32,
}

/// "Same prompt": equal message multisets after dropping system messages,
/// independent of order.
pub fn same_prompt(a: &[ChatMessage], b: &[ChatMessage]) -> bool {
    let project = |msgs: &[ChatMessage]| {
        let mut kept: Vec<(String, Option<String>, String)> = msgs
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                (
                    m.role.as_str().to_string(),
                    m.name.clone(),
                    m.content.clone(),
                )
            })
            .collect();
        kept.sort();
        kept
    };
    project(a) == project(b)
}

#[derive(Debug)]
pub struct ConversationController {
    pub conversation: Conversation,
    prev_messages: Vec<ChatMessage>,
    prev_snapshot: PromptSnapshot,
    prev_impersonated: bool,
}

impl Default for ConversationController {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of classification. `delete_first` carries the conversation that
/// must be deleted upstream before a renewal proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub request_type: RequestType,
    pub delete_first: Option<String>,
    pub new_conversation: Option<String>,
}

impl ConversationController {
    pub fn new() -> Self {
        Self {
            conversation: Conversation::default(),
            prev_messages: Vec::new(),
            prev_snapshot: PromptSnapshot::default(),
            prev_impersonated: false,
        }
    }

    pub fn prev_impersonated(&self) -> bool {
        self.prev_impersonated
    }

    /// Feed back the impersonation verdict from the streaming collaborator.
    pub fn set_prev_impersonated(&mut self, value: bool) {
        self.prev_impersonated = value;
    }

    /// Drop conversation identity, e.g. after an upstream delete or on
    /// process shutdown. Returns the id that was live, if any.
    pub fn take_conversation(&mut self) -> Option<String> {
        let id = self.conversation.uuid.take();
        self.conversation.depth = 0;
        id
    }

    /// Classify the request and update conversation identity/depth and the
    /// remembered previous prompt accordingly.
    pub fn classify(&mut self, messages: &[ChatMessage], opts: ClassifyOptions) -> Classification {
        if opts.has_api_key {
            return Classification {
                request_type: RequestType::Api,
                delete_first: None,
                new_conversation: None,
            };
        }

        let current = PromptSnapshot::capture(messages);
        let same = same_prompt(messages, &self.prev_messages);
        let same_char_diff_chat = !same
            && match (&current.first_system, &self.prev_snapshot.first_system) {
                (Some(cur), Some(prev)) => {
                    cur.content == prev.content
                        && current.first_user.as_ref().map(|m| &m.content)
                            != self.prev_snapshot.first_user.as_ref().map(|m| &m.content)
                }
                _ => false,
            };

        let retry = opts.retry_regenerate && same && self.conversation.exists();
        let renew = opts.renew_always
            || !self.conversation.exists()
            || self.prev_impersonated
            || (!opts.renew_always && same)
            || same_char_diff_chat;

        if !same {
            self.prev_messages = messages.to_vec();
        }
        self.prev_snapshot = current;

        if retry {
            return Classification {
                request_type: RequestType::Retry,
                delete_first: None,
                new_conversation: None,
            };
        }
        if renew {
            let delete_first = self.conversation.uuid.take();
            let fresh = self.conversation.renew();
            return Classification {
                request_type: RequestType::Renew,
                delete_first,
                new_conversation: Some(fresh),
            };
        }
        if same {
            return Classification {
                request_type: RequestType::Unchanged,
                delete_first: None,
                new_conversation: None,
            };
        }

        let experiments = !opts.renew_always && opts.system_experiments;
        if !experiments || self.conversation.depth >= opts.system_interval {
            self.conversation.depth = 0;
            Classification {
                request_type: RequestType::ContinueNewRound,
                delete_first: None,
                new_conversation: None,
            }
        } else {
            self.conversation.depth += 1;
            Classification {
                request_type: RequestType::ContinueSameRound,
                delete_first: None,
                new_conversation: None,
            }
        }
    }
}

#![forbid(unsafe_code)]
#![doc = r#"
Sessionbridge

Expose an OpenAI-compatible chat API over a private conversational web
backend, authenticating with a rotating pool of session credentials
instead of a single stable API key.

Crate highlights
- Session manager: rotates, validates, and retires credentials against
  live upstream account state; all pool mutations persist before they
  count.
- Conversation controller: classifies every request into renew / retry /
  continue / direct-API and tracks conversation identity and depth.
- Prompt pipeline: merges and annotates the message list, renders it to
  the flat upstream format, applies the inline directive sublanguage, and
  pads to a token budget.
- HTTP server (in `server`): `/v1/models` and `/v1/chat/completions`;
  streaming bodies relay through to an external SSE transform.

Modules
- `models`: Inbound chat types and upstream web-API payloads.
- `config`: Settings plus the durable pool-state document.
- `pool` / `session`: Credential pool data and its live manager.
- `conversation`: Request classification and conversation identity.
- `directive` / `pipeline` / `tokens`: The prompt transformation engine.
- `upstream` / `orchestrator` / `server`: Network collaborators and the
  request path.
"#]

pub mod config;
pub mod conversation;
pub mod directive;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod server;
pub mod session;
pub mod tokens;
pub mod upstream;
pub mod util;

pub use crate::config::{ConfigStore, GatewayConfig, Settings};
pub use crate::conversation::{ConversationController, RequestType};
pub use crate::error::{GatewayError, Result, ValidationKind};
pub use crate::orchestrator::{execute_chat, ChatOutcome, InboundAuth};
pub use crate::pool::{CredentialEntry, CredentialPool};
pub use crate::session::{CompletionSignals, SessionManager};
pub use crate::tokens::{HeuristicTokenCounter, SharedTokenCounter, TokenBudget, TokenCounter};

// Re-export model namespaces for convenience (downstream users can do
// `use sessionbridge::chat`).
pub use crate::models::{chat, upstream as vendor};

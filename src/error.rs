use actix_web::HttpResponse;
use thiserror::Error;

/// Why a credential failed live account validation.
///
/// Every kind except `UnknownModel` retires the credential; `UnknownModel`
/// is recorded in the persisted unknown-model list and the credential stays
/// in service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    /// Bootstrap resolved to no account at all.
    NullAccount,
    /// The account's API access is disabled with no recovery date.
    Disabled,
    /// The account never completed verification.
    Unverified,
    /// The account carries a consumer ban flag.
    Banned,
    /// The account's organization id was already bound to another pool entry.
    Overlap,
    /// The upstream rejected the session token outright.
    InvalidAuth,
}

impl ValidationKind {
    /// Label recorded in the wasted-credential log, `<label>@<suffix>`.
    pub fn label(&self) -> &'static str {
        match self {
            ValidationKind::NullAccount => "Null",
            ValidationKind::Disabled => "Disabled",
            ValidationKind::Unverified => "Unverified",
            ValidationKind::Banned => "Banned",
            ValidationKind::Overlap => "Overlap",
            ValidationKind::InvalidAuth => "Invalid",
        }
    }
}

impl std::fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Crate-wide error taxonomy.
///
/// `Validation` never leaves the session-manager loop; everything else
/// propagates to the request handler, which answers with a best-effort JSON
/// body (`Abort` excepted, where the connection is already gone).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("account validation failed: {0}")]
    Validation(ValidationKind),

    #[error("invalid authorization")]
    Auth,

    #[error("{0}")]
    Config(String),

    #[error("upstream error {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        /// Upstream error type string when the body carried one.
        kind: Option<String>,
        /// Set when the error signals an exceeded usage limit; triggers
        /// credential rotation after the response is finalized.
        exceeded_limit: bool,
    },

    #[error("client disconnected")]
    Abort,

    #[error(transparent)]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        GatewayError::Upstream {
            status,
            message: message.into(),
            kind: None,
            exceeded_limit: false,
        }
    }

    /// True when the error should trigger a credential rotation after the
    /// current response finishes.
    pub fn exceeded_limit(&self) -> bool {
        matches!(
            self,
            GatewayError::Upstream {
                exceeded_limit: true,
                ..
            }
        )
    }

    /// Render the OpenAI-style JSON error body every handler answers with.
    pub fn to_response(&self) -> HttpResponse {
        let (code, kind) = match self {
            GatewayError::Upstream { status, kind, .. } => {
                (*status, kind.clone().unwrap_or_else(|| "upstream_error".into()))
            }
            GatewayError::Config(_) => (500, "config_error".into()),
            GatewayError::Auth => (401, "invalid_authorization".into()),
            _ => (500, "internal_error".into()),
        };
        let body = serde_json::json!({
            "error": {
                "message": format!("sessionbridge: {self}"),
                "type": kind,
                "param": null,
                "code": code,
            }
        });
        HttpResponse::InternalServerError().json(body)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_labels_match_wasted_log_tags() {
        assert_eq!(ValidationKind::Banned.label(), "Banned");
        assert_eq!(ValidationKind::NullAccount.label(), "Null");
        assert_eq!(ValidationKind::InvalidAuth.label(), "Invalid");
    }

    #[test]
    fn exceeded_limit_only_on_flagged_upstream_errors() {
        let plain = GatewayError::upstream(500, "boom");
        assert!(!plain.exceeded_limit());
        let limited = GatewayError::Upstream {
            status: 429,
            message: "exceeded".into(),
            kind: None,
            exceeded_limit: true,
        };
        assert!(limited.exceeded_limit());
    }
}

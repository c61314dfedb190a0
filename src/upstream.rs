//! Fetch collaborator for the private conversational web API.
//!
//! Thin reqwest wrapper: builds the browser-shaped headers, keeps the
//! session cookie jar fed from `set-cookie` responses, and maps non-2xx
//! responses onto the crate error taxonomy. In-flight calls abort when the
//! driving future is dropped (client disconnect).

use reqwest::header::{self, HeaderMap, HeaderValue};
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::models::upstream::{
    BootstrapResponse, ConversationShell, ConversationSummary, Organization,
};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Cookie attributes that are metadata, not values to resend.
const COOKIE_ATTRIBUTES: &[&str] = &[
    "path", "expires", "domain", "httponly", "secure", "samesite", "max-age",
];

#[derive(Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    cookies: std::sync::Mutex<Vec<(String, String)>>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cookies: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Merge a `name=value; name2=value2` cookie string into the jar.
    pub fn absorb_cookie_str(&self, raw: &str) {
        let mut jar = self.cookies.lock().expect("cookie jar");
        for piece in raw.split(';') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let Some((name, value)) = piece.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if COOKIE_ATTRIBUTES.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            match jar.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = value.trim().to_string(),
                None => jar.push((name.to_string(), value.trim().to_string())),
            }
        }
    }

    /// Fold `set-cookie` headers from an upstream response into the jar.
    pub fn absorb_response(&self, res: &reqwest::Response) {
        for value in res.headers().get_all(header::SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                self.absorb_cookie_str(raw);
            }
        }
    }

    pub fn cookie_header(&self) -> String {
        let jar = self.cookies.lock().expect("cookie jar");
        jar.iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn web_headers(&self, base: &str, conversation: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        if let Ok(origin) = HeaderValue::from_str(base) {
            headers.insert(header::ORIGIN, origin);
        }
        let referer = match conversation {
            Some(uuid) if !uuid.is_empty() => format!("{base}/chat/{uuid}"),
            _ => format!("{base}/chats"),
        };
        if let Ok(value) = HeaderValue::from_str(&referer) {
            headers.insert(header::REFERER, value);
        }
        let cookie = self.cookie_header();
        if !cookie.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.insert(header::COOKIE, value);
            }
        }
        headers
    }

    /// Map error responses onto the taxonomy; absorb cookies on success.
    async fn check(&self, res: reqwest::Response) -> Result<reqwest::Response> {
        let status = res.status();
        if status.is_success() {
            self.absorb_response(&res);
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| {
                v.pointer("/error/message")
                    .or_else(|| v.get("detail"))
                    .and_then(|m| m.as_str())
            })
            .unwrap_or(status.canonical_reason().unwrap_or("upstream error"))
            .to_string();
        if message == "Invalid authorization" {
            return Err(GatewayError::Auth);
        }
        let kind = parsed
            .as_ref()
            .and_then(|v| v.pointer("/error/type").and_then(|t| t.as_str()))
            .map(|s| s.to_string());
        let exceeded_limit = status.as_u16() == 429
            || kind.as_deref() == Some("rate_limit_error")
            || message.contains("exceeded");
        Err(GatewayError::Upstream {
            status: status.as_u16(),
            message,
            kind,
            exceeded_limit,
        })
    }

    // -----------------------------------------------------------------
    // Account surface
    // -----------------------------------------------------------------

    pub async fn bootstrap(&self, base: &str) -> Result<BootstrapResponse> {
        let res = self
            .http
            .get(format!("{base}/api/bootstrap"))
            .headers(self.web_headers(base, None))
            .send()
            .await?;
        Ok(self.check(res).await?.json().await?)
    }

    pub async fn organizations(&self, base: &str) -> Result<Vec<Organization>> {
        let res = self
            .http
            .get(format!("{base}/api/organizations"))
            .headers(self.web_headers(base, None))
            .send()
            .await?;
        Ok(self.check(res).await?.json().await?)
    }

    pub async fn dismiss_flag(&self, base: &str, org: &str, kind: &str) -> Result<Value> {
        let res = self
            .http
            .post(format!("{base}/api/organizations/{org}/flags/{kind}/dismiss"))
            .headers(self.web_headers(base, None))
            .send()
            .await?;
        Ok(self.check(res).await?.json::<Value>().await.unwrap_or(Value::Null))
    }

    pub async fn update_account_settings(&self, base: &str, settings: Value) -> Result<()> {
        let res = self
            .http
            .put(format!("{base}/api/account"))
            .headers(self.web_headers(base, None))
            .json(&serde_json::json!({ "settings": settings }))
            .send()
            .await?;
        self.check(res).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Conversation surface
    // -----------------------------------------------------------------

    pub async fn list_conversations(
        &self,
        base: &str,
        org: &str,
    ) -> Result<Vec<ConversationSummary>> {
        let res = self
            .http
            .get(format!("{base}/api/organizations/{org}/chat_conversations"))
            .headers(self.web_headers(base, None))
            .send()
            .await?;
        Ok(self.check(res).await?.json().await?)
    }

    pub async fn create_conversation(&self, base: &str, org: &str, uuid: &str) -> Result<()> {
        let res = self
            .http
            .post(format!("{base}/api/organizations/{org}/chat_conversations"))
            .headers(self.web_headers(base, None))
            .json(&ConversationShell {
                uuid: uuid.to_string(),
                name: String::new(),
            })
            .send()
            .await?;
        self.check(res).await?;
        Ok(())
    }

    pub async fn delete_conversation(&self, base: &str, org: &str, uuid: &str) -> Result<()> {
        let res = self
            .http
            .delete(format!(
                "{base}/api/organizations/{org}/chat_conversations/{uuid}"
            ))
            .headers(self.web_headers(base, None))
            .send()
            .await?;
        // Deletion failures are tolerated; the conversation may be gone.
        if let Err(err) = self.check(res).await {
            tracing::debug!(%err, uuid, "conversation delete failed");
        }
        Ok(())
    }

    /// Streaming completion call; the returned response exposes the SSE
    /// byte stream for the relay.
    pub async fn completion(
        &self,
        base: &str,
        org: &str,
        conversation: &str,
        body: &impl serde::Serialize,
    ) -> Result<reqwest::Response> {
        let mut headers = self.web_headers(base, Some(conversation));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        let res = self
            .http
            .post(format!(
                "{base}/api/organizations/{org}/chat_conversations/{conversation}/completion"
            ))
            .headers(headers)
            .json(body)
            .send()
            .await?;
        self.check(res).await
    }

    /// Regenerate the previous turn.
    pub async fn retry_completion(
        &self,
        base: &str,
        org: &str,
        conversation: &str,
        body: &impl serde::Serialize,
    ) -> Result<reqwest::Response> {
        let mut headers = self.web_headers(base, Some(conversation));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        let res = self
            .http
            .post(format!(
                "{base}/api/organizations/{org}/chat_conversations/{conversation}/retry_completion"
            ))
            .headers(headers)
            .json(body)
            .send()
            .await?;
        self.check(res).await
    }

    // -----------------------------------------------------------------
    // Direct-key pass-through surface
    // -----------------------------------------------------------------

    /// Call the vendor's public API with a caller-supplied key.
    pub async fn api_completion(
        &self,
        url: &str,
        key: &str,
        body: &Value,
    ) -> Result<reqwest::Response> {
        let res = self
            .http
            .post(url)
            .header("anthropic-version", "2023-06-01")
            .header(header::AUTHORIZATION, format!("Bearer {key}"))
            .header("x-api-key", key)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, USER_AGENT)
            .json(body)
            .send()
            .await?;
        self.check(res).await
    }

    /// Model listing through a secondary OpenAI-compatible key.
    pub async fn list_api_models(&self, base: &str, key: &str) -> Result<Value> {
        let res = self
            .http
            .get(format!("{base}/v1/models"))
            .header(header::AUTHORIZATION, key)
            .send()
            .await?;
        Ok(self.check(res).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_jar_merges_and_filters_attributes() {
        let client = UpstreamClient::new(reqwest::Client::new());
        client.absorb_cookie_str("sessionKey=abc; Path=/; HttpOnly; Secure");
        client.absorb_cookie_str("cf_token=xyz");
        assert_eq!(client.cookie_header(), "sessionKey=abc; cf_token=xyz");

        // Same name updates in place, preserving order.
        client.absorb_cookie_str("sessionKey=def");
        assert_eq!(client.cookie_header(), "sessionKey=def; cf_token=xyz");
    }

    #[test]
    fn web_headers_carry_cookie_and_referer() {
        let client = UpstreamClient::new(reqwest::Client::new());
        client.absorb_cookie_str("sessionKey=abc");
        let headers = client.web_headers("https://example.com", Some("conv-1"));
        assert_eq!(
            headers.get(header::REFERER).unwrap(),
            "https://example.com/chat/conv-1"
        );
        assert_eq!(headers.get(header::COOKIE).unwrap(), "sessionKey=abc");
    }
}

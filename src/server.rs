//! Actix handlers for the OpenAI-compatible inbound surface.
//!
//! Streaming bodies pass through as-is: the transform that reshapes
//! upstream chunks into OpenAI SSE frames is an external collaborator fed
//! from the relayed byte stream (see `relay_upstream`). Post-completion
//! bookkeeping runs once the relayed stream is drained.

use std::sync::Arc;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::models::chat::{ChatCompletionRequest, ModelEntry, ModelList};
use crate::orchestrator::{self, ChatOutcome, InboundAuth, RequestMeta};
use crate::session::{CompletionSignals, SessionManager};

/// Optional relay override accepted on the query string.
#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    #[serde(rename = "api_rProxy")]
    pub api_relay: Option<String>,
}

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/v1/models").route(web::get().to(list_models)))
        .service(web::resource("/v1/chat/completions").route(web::post().to(chat_completions)))
        .service(web::resource("/v1/complete").route(web::post().to(complete_unsupported)))
        .default_service(web::route().to(index_page));
}

fn auth_header(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// `GET /v1/models`: known ids, discovered ids, and anything a secondary
/// `oaiKey:` relay lists, deduplicated in order.
async fn list_models(
    req: HttpRequest,
    query: web::Query<RelayQuery>,
    session: web::Data<SessionManager>,
) -> impl Responder {
    let session = session.into_inner();
    let mut ids = session.advertised_models();

    let auth = InboundAuth::parse(auth_header(&req).as_deref());
    if auth.oai {
        if let Some(key) = auth.api_keys.as_ref().and_then(|k| k.first()) {
            let config = session.config_snapshot();
            let base = query
                .api_relay
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| config.api_r_proxy.clone());
            let base = base.trim_end_matches('/').trim_end_matches("/v1");
            if !base.is_empty() {
                match session.client().list_api_models(base, key).await {
                    Ok(listing) => {
                        for entry in listing
                            .get("data")
                            .and_then(|d| d.as_array())
                            .into_iter()
                            .flatten()
                        {
                            if let Some(id) = entry.get("id").and_then(|i| i.as_str()) {
                                if !ids.iter().any(|m| m == id) {
                                    ids.push(id.to_string());
                                }
                            }
                        }
                    }
                    Err(err) => tracing::warn!(%err, "secondary model listing failed"),
                }
            }
        }
    }

    session.set_model_list(ids.clone());
    HttpResponse::Ok().json(ModelList {
        data: ids.into_iter().map(|id| ModelEntry { id }).collect(),
    })
}

async fn chat_completions(
    req: HttpRequest,
    body: web::Json<ChatCompletionRequest>,
    session: web::Data<SessionManager>,
) -> HttpResponse {
    let session = session.into_inner();
    let auth = InboundAuth::parse(auth_header(&req).as_deref());

    match orchestrator::execute_chat(&session, body.into_inner(), auth).await {
        Ok(ChatOutcome::Immediate(response)) => HttpResponse::Ok().json(response),
        Ok(ChatOutcome::Upstream { response, meta }) => relay_upstream(session, response, meta),
        Err(GatewayError::Abort) => {
            // Client is gone; nothing to answer.
            HttpResponse::Ok().finish()
        }
        Err(err) => {
            tracing::warn!(%err, "chat completion failed");
            let signals = CompletionSignals {
                exceeded_limit: err.exceeded_limit(),
                errored: true,
                ..Default::default()
            };
            let response = err.to_response();
            tokio::spawn(async move {
                session.after_completion(signals).await;
            });
            response
        }
    }
}

/// Forward the upstream byte stream to the client and run the pool/
/// conversation bookkeeping once it is drained. Dropping the returned
/// stream (client disconnect) also drops the upstream call.
fn relay_upstream(
    session: Arc<SessionManager>,
    response: reqwest::Response,
    meta: RequestMeta,
) -> HttpResponse {
    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            if meta.stream {
                "text/event-stream".to_string()
            } else {
                "application/json".to_string()
            }
        });

    tracing::info!(
        status = status.as_u16(),
        model = %meta.model,
        kind = meta.request_type.label(),
        "relaying upstream response"
    );

    let signals = CompletionSignals {
        api_mode: meta.api_mode,
        ..Default::default()
    };
    let relayed = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => yield Ok::<Bytes, std::io::Error>(bytes),
                Err(err) => {
                    yield Err(std::io::Error::other(err.to_string()));
                    break;
                }
            }
        }
        session.after_completion(signals).await;
    };

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, content_type))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(relayed)
}

/// `POST /v1/complete` is intentionally unsupported.
async fn complete_unsupported() -> impl Responder {
    HttpResponse::NotFound().json(serde_json::json!({
        "error": {
            "message": "sessionbridge: use the OpenAI-compatible /v1/chat/completions endpoint",
            "code": 404,
        }
    }))
}

/// Informational page for everything else.
async fn index_page(req: HttpRequest) -> impl Responder {
    if !matches!(req.path(), "/" | "/v1" | "/favicon.ico") {
        tracing::debug!(path = req.path(), "unknown request");
    }
    let banner = orchestrator::banner();
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/html; charset=utf-8"))
        .body(format!(
            "<!DOCTYPE html>\n<html>\n<body>\n{banner}<br/><br/>\
             Point an OpenAI-compatible client at <code>/v1</code> and pick a claude model.\
             \n</body>\n</html>"
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, GatewayConfig};
    use crate::tokens::HeuristicTokenCounter;
    use crate::upstream::UpstreamClient;
    use actix_web::{test, App};

    fn test_session() -> Arc<SessionManager> {
        SessionManager::new(
            GatewayConfig::default(),
            ConfigStore::readonly(),
            UpstreamClient::new(reqwest::Client::new()),
            Arc::new(HeuristicTokenCounter::default()),
        )
        .expect("session")
    }

    #[actix_web::test]
    async fn models_endpoint_lists_known_ids() {
        let session = test_session();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(Arc::clone(&session)))
                .configure(config_routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/v1/models").to_request();
        let body: ModelList = test::call_and_read_body_json(&app, req).await;
        assert!(body
            .data
            .iter()
            .any(|m| m.id == "claude-3-5-sonnet-20241022"));
        // The served list is remembered for model validation.
        assert!(!session.model_list().is_empty());
    }

    #[actix_web::test]
    async fn complete_endpoint_is_a_404_shim() {
        let session = test_session();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(session))
                .configure(config_routes),
        )
        .await;
        let req = test::TestRequest::post().uri("/v1/complete").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), 404);
    }

    #[actix_web::test]
    async fn unknown_paths_serve_the_info_page() {
        let session = test_session();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(session))
                .configure(config_routes),
        )
        .await;
        let req = test::TestRequest::get().uri("/anything").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), 200);
        let body = test::read_body(res).await;
        assert!(String::from_utf8_lossy(&body).contains("sessionbridge"));
    }

    #[actix_web::test]
    async fn greeting_probe_answers_locally() {
        let session = test_session();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(session))
                .configure(config_routes),
        )
        .await;
        // An API key keeps the pool out of the path; the greeting check
        // fires before any upstream call.
        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .insert_header((header::AUTHORIZATION, "Bearer 3rdKey:test-key"))
            .set_json(serde_json::json!({
                "model": "claude-3-opus-20240229",
                "messages": [{"role": "user", "content": "Hi"}]
            }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), 200);
        let body = test::read_body(res).await;
        assert!(String::from_utf8_lossy(&body).contains("sessionbridge v"));
    }

    #[actix_web::test]
    async fn missing_credentials_yield_json_error() {
        let session = test_session();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(session))
                .configure(config_routes),
        )
        .await;
        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(serde_json::json!({
                "model": "claude-3-opus-20240229",
                "messages": [{"role": "user", "content": "hello"}]
            }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), 500);
        let body: serde_json::Value = test::read_body_json(res).await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("sessionbridge"));
    }
}

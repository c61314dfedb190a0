//! End-to-end request path: a chat completion rides through classification,
//! prompt rendering, conversation creation, and the streaming relay against
//! a mock upstream.

use std::sync::Arc;

use actix_web::{test, web, App};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use sessionbridge::config::{ConfigStore, GatewayConfig};
use sessionbridge::server::config_routes;
use sessionbridge::session::SessionManager;
use sessionbridge::tokens::HeuristicTokenCounter;
use sessionbridge::upstream::UpstreamClient;

fn session_token(seed: char) -> String {
    format!(
        "sk-ant-sid01-{}-{}AA",
        std::iter::repeat(seed).take(86).collect::<String>(),
        std::iter::repeat(seed).take(6).collect::<String>()
    )
}

#[derive(Clone)]
struct MockState {
    completions: Arc<AsyncMutex<Vec<Value>>>,
    created: Arc<AsyncMutex<Vec<String>>>,
}

async fn bootstrap() -> Json<Value> {
    Json(json!({
        "account": {
            "email_address": "pro@example.com",
            "completed_verification_at": "2024-01-01T00:00:00Z",
            "memberships": [{
                "organization": {"uuid": "org-1", "capabilities": ["chat", "claude_pro"]}
            }],
            "settings": {"preview_feature_uses_artifacts": false},
        },
        "statsig": {"values": {}},
    }))
}

async fn organizations() -> Json<Value> {
    Json(json!([{
        "uuid": "org-1",
        "capabilities": ["chat", "claude_pro"],
        "active_flags": [],
    }]))
}

async fn create_conversation(
    State(state): State<MockState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let uuid = body["uuid"].as_str().unwrap_or_default().to_string();
    state.created.lock().await.push(uuid);
    Json(json!({}))
}

async fn completion(
    State(state): State<MockState>,
    Path((_org, _conv)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ([(axum::http::HeaderName, &'static str); 1], &'static str) {
    state.completions.lock().await.push(body);
    (
        [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
        "data: {\"completion\": \"mock reply\"}\n\n",
    )
}

struct MockUpstream {
    base_url: String,
    state: MockState,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start() -> Self {
        let state = MockState {
            completions: Arc::new(AsyncMutex::new(Vec::new())),
            created: Arc::new(AsyncMutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/api/bootstrap", get(bootstrap))
            .route("/api/organizations", get(organizations))
            .route(
                "/api/organizations/:org/chat_conversations",
                get(|| async { Json(json!([])) }).post(create_conversation),
            )
            .route(
                "/api/organizations/:org/chat_conversations/:conv/completion",
                post(completion),
            )
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
            join,
        }
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

async fn ready_session(mock: &MockUpstream) -> Arc<SessionManager> {
    let config = GatewayConfig {
        cookie_array: vec![session_token('b')],
        cookie_index: 1,
        r_proxy: mock.base_url.clone(),
        ..Default::default()
    };
    let manager = SessionManager::new(
        config,
        ConfigStore::readonly(),
        UpstreamClient::new(reqwest::Client::new()),
        Arc::new(HeuristicTokenCounter::default()),
    )
    .expect("manager");
    manager.activate(true).await;
    assert!(manager.active_account().is_some());
    manager
}

#[actix_web::test]
async fn chat_completion_creates_conversation_and_relays_stream() {
    let mock = MockUpstream::start().await;
    let session = ready_session(&mock).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::from(Arc::clone(&session)))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "claude-3-opus-20240229",
            "messages": [
                {"role": "system", "content": "Be helpful."},
                {"role": "user", "content": "hello there"}
            ],
            "stream": true
        }))
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), 200);
    let body = test::read_body(res).await;
    assert!(String::from_utf8_lossy(&body).contains("mock reply"));

    // A fresh conversation was allocated for the renewal.
    let created = mock.state.created.lock().await;
    assert_eq!(created.len(), 1);

    // The prompt rode in as a text attachment with an empty stub prompt.
    let completions = mock.state.completions.lock().await;
    assert_eq!(completions.len(), 1);
    let call = &completions[0];
    assert_eq!(call["rendering_mode"], "messages");
    assert_eq!(call["attachments"][0]["file_name"], "paste.txt");
    let attached = call["attachments"][0]["extracted_content"]
        .as_str()
        .unwrap();
    assert!(attached.contains("hello there"));
    assert_eq!(call["prompt"], "");
    // Paid account: the requested model goes upstream.
    assert_eq!(call["model"], "claude-3-opus-20240229");
}

#[actix_web::test]
async fn repeated_prompt_with_retry_enabled_targets_regenerate() {
    let mock = MockUpstream::start().await;

    // Retry needs renew_always off and retry_regenerate on.
    let mut config = GatewayConfig {
        cookie_array: vec![session_token('b')],
        cookie_index: 1,
        r_proxy: mock.base_url.clone(),
        ..Default::default()
    };
    config.settings.renew_always = false;
    config.settings.retry_regenerate = true;
    let session = SessionManager::new(
        config,
        ConfigStore::readonly(),
        UpstreamClient::new(reqwest::Client::new()),
        Arc::new(HeuristicTokenCounter::default()),
    )
    .expect("manager");
    session.activate(true).await;

    // The first request renews; the identical follow-up classifies as a
    // retry before any upstream call is built.
    use sessionbridge::conversation::{ClassifyOptions, RequestType};
    use sessionbridge::models::chat::{ChatMessage, Role};

    let messages = vec![
        ChatMessage::new(Role::User, "same question"),
    ];
    let opts = ClassifyOptions {
        has_api_key: false,
        renew_always: false,
        retry_regenerate: true,
        system_experiments: true,
        system_interval: 3,
    };
    let mut controller = session.controller().lock().expect("controller");
    assert_eq!(
        controller.classify(&messages, opts).request_type,
        RequestType::Renew
    );
    assert_eq!(
        controller.classify(&messages, opts).request_type,
        RequestType::Retry
    );
}

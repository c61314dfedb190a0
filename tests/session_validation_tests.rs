//! Credential validation against a mock upstream: retirement, rotation
//! state, persistence, and the bounded-concurrency conversation sweep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use sessionbridge::config::{ConfigStore, GatewayConfig};
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
    /// Conversations the sweep should find on login.
    leftovers: usize,
    deletes: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

fn account_for_cookie(cookie: &str) -> (&'static str, bool) {
    // Token seed decides which mock account answers: 'a' is banned,
    // anything else is a clean pro account.
    if cookie.contains("sk-ant-sid01-aaa") {
        ("org-a", true)
    } else {
        ("org-b", false)
    }
}

async fn bootstrap(headers: axum::http::HeaderMap) -> Json<Value> {
    let cookie = headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let (org, _) = account_for_cookie(cookie);
    Json(json!({
        "account": {
            "email_address": format!("{org}@example.com"),
            "completed_verification_at": "2024-01-01T00:00:00Z",
            "memberships": [{
                "organization": {
                    "uuid": org,
                    "capabilities": ["chat", "claude_pro"],
                }
            }],
            "settings": {"preview_feature_uses_artifacts": false},
        },
        "statsig": {"values": {}},
    }))
}

async fn organizations(headers: axum::http::HeaderMap) -> Json<Value> {
    let cookie = headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let (org, banned) = account_for_cookie(cookie);
    let flags = if banned {
        json!([{"type": "consumer_banned", "expires_at": null}])
    } else {
        json!([])
    };
    Json(json!([{
        "uuid": org,
        "name": org,
        "capabilities": ["chat", "claude_pro"],
        "active_flags": flags,
    }]))
}

async fn list_conversations(State(state): State<MockState>) -> Json<Value> {
    let list: Vec<Value> = (0..state.leftovers)
        .map(|i| json!({"uuid": format!("conv-{i}"), "name": ""}))
        .collect();
    Json(json!(list))
}

async fn delete_conversation(
    State(state): State<MockState>,
    Path((_org, _uuid)): Path<(String, String)>,
) -> Json<Value> {
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    state.deletes.fetch_add(1, Ordering::SeqCst);
    Json(json!({}))
}

struct MockUpstream {
    base_url: String,
    state: MockState,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(leftovers: usize) -> Self {
        let state = MockState {
            leftovers,
            deletes: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/api/bootstrap", get(bootstrap))
            .route("/api/organizations", get(organizations))
            .route(
                "/api/organizations/:org/chat_conversations",
                get(list_conversations),
            )
            .route(
                "/api/organizations/:org/chat_conversations/:uuid",
                delete(delete_conversation),
            )
            .route(
                "/api/organizations/:org/flags/:kind/dismiss",
                post(|| async { Json(json!({})) }),
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

fn manager_for(mock: &MockUpstream, tokens: Vec<String>, store: ConfigStore) -> Arc<SessionManager> {
    let config = GatewayConfig {
        cookie_array: tokens,
        cookie_index: 1,
        r_proxy: mock.base_url.clone(),
        ..Default::default()
    };
    SessionManager::new(
        config,
        store,
        UpstreamClient::new(reqwest::Client::new()),
        Arc::new(HeuristicTokenCounter::default()),
    )
    .expect("manager")
}

#[tokio::test]
async fn banned_credential_is_retired_and_persisted() {
    let mock = MockUpstream::start(0).await;
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::at(dir.path().join("config.yaml"));
    let manager = manager_for(
        &mock,
        vec![session_token('a'), session_token('b')],
        store.clone(),
    );

    manager.activate(true).await;

    // The banned entry is gone and logged; the survivor sits at the cursor.
    assert_eq!(manager.pool_len(), 1);
    let config = manager.config_snapshot();
    assert_eq!(config.wasted_cookie.len(), 1);
    assert!(config.wasted_cookie[0].starts_with("Banned@"));
    assert!(!config.wasted_cookie[0].contains("sk-ant-sid01"));

    // Mutation hit the durable document before anything else proceeded.
    let (saved, existed) = store.load().unwrap();
    assert!(existed);
    assert_eq!(saved.wasted_cookie.len(), 1);
    assert_eq!(saved.cookie_array.len(), 1);
    assert!(saved.cookie_array[0].contains("sk-ant-sid01-bbb"));

    // A one-entry pool cannot rotate, so the gate is open, not pending.
    assert!(!manager.is_rotating());

    // The scheduled reattempt validates the survivor.
    manager.activate(true).await;
    let account = manager.active_account().expect("survivor logged in");
    assert_eq!(account.org_uuid, "org-b");
    assert!(account.is_paid());
    assert!(!manager.is_rotating());
}

#[tokio::test]
async fn validation_retags_entries_with_account_class() {
    let mock = MockUpstream::start(0).await;
    let manager = manager_for(&mock, vec![session_token('b')], ConfigStore::readonly());

    manager.activate(true).await;

    let config = manager.config_snapshot();
    assert!(config.cookie_array[0].starts_with("claude_pro@"));
}

#[tokio::test]
async fn leftover_sweep_is_bounded_to_ten_concurrent_deletes() {
    let mock = MockUpstream::start(25).await;
    let manager = manager_for(&mock, vec![session_token('b')], ConfigStore::readonly());

    manager.activate(true).await;

    // All deletions completed before activation returned, never more than
    // ten in flight at once.
    assert_eq!(mock.state.deletes.load(Ordering::SeqCst), 25);
    let peak = mock.state.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 10, "peak concurrency was {peak}");
    assert!(peak > 1, "sweep ran sequentially");
}

#[tokio::test]
async fn second_credential_with_same_account_overlaps() {
    let mock = MockUpstream::start(0).await;
    // Two distinct tokens resolving to the same upstream account: the
    // second one retires as an overlap.
    let manager = manager_for(
        &mock,
        vec![session_token('b'), session_token('c')],
        ConfigStore::readonly(),
    );

    manager.activate(true).await;
    assert_eq!(manager.pool_len(), 2);

    {
        // Manually advance to the second entry, as a rotation would.
        manager.rotate(true, false);
    }
    manager.wait_until_stable().await;

    let config = manager.config_snapshot();
    assert_eq!(manager.pool_len(), 1);
    assert!(config.wasted_cookie.iter().any(|w| w.starts_with("Overlap@")));
}

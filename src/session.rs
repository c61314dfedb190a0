//! The session manager: the one owner of pool and conversation state.
//!
//! Request handlers hold an `Arc<SessionManager>` and go through it for
//! everything stateful: credential selection and validation, rotation
//! scheduling, conversation identity, and the persisted pool document.
//! Rotation state is published on a watch channel so requests suspend on a
//! notification instead of polling.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;

use crate::config::{ConfigStore, GatewayConfig, OverlapReset};
use crate::conversation::ConversationController;
use crate::error::{GatewayError, Result, ValidationKind};
use crate::models::upstream::{AccountClass, KNOWN_MODELS};
use crate::pool::CredentialPool;
use crate::tokens::SharedTokenCounter;
use crate::upstream::UpstreamClient;

/// Upstream calls in flight at once during bulk conversation cleanup.
const BULK_DELETE_CONCURRENCY: usize = 10;
/// Minimum spacing between validation attempts against the default host.
const ROTATION_BACKOFF: Duration = Duration::from_millis(15_000);

/// The account the current credential resolved to.
#[derive(Debug, Clone)]
pub struct ActiveAccount {
    pub org_uuid: String,
    pub class: Option<AccountClass>,
    pub cookie_model: Option<String>,
}

impl ActiveAccount {
    /// Paid accounts may pick any model; free accounts are pinned to the
    /// account's default.
    pub fn is_paid(&self) -> bool {
        self.class.is_some()
    }
}

/// Stream-side signals fed back after a completion finishes.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignals {
    pub api_mode: bool,
    pub exceeded_limit: bool,
    pub impersonated: bool,
    /// The request errored; skip the per-credential use counter.
    pub errored: bool,
    /// Model id the upstream reported having completed with.
    pub completion_model: Option<String>,
}

pub struct SessionManager {
    weak: Weak<SessionManager>,
    config: RwLock<GatewayConfig>,
    store: ConfigStore,
    pool: Mutex<CredentialPool>,
    seen_accounts: Mutex<HashSet<String>>,
    account: Mutex<Option<ActiveAccount>>,
    controller: Mutex<ConversationController>,
    client: UpstreamClient,
    counter: SharedTokenCounter,
    rotation: watch::Sender<bool>,
    timer: Mutex<Instant>,
    use_count: AtomicU32,
    requested_model: Mutex<Option<String>>,
    model_list: Mutex<Vec<String>>,
}

impl SessionManager {
    pub fn new(
        mut config: GatewayConfig,
        store: ConfigStore,
        client: UpstreamClient,
        counter: SharedTokenCounter,
    ) -> Result<Arc<Self>> {
        config.normalize();
        config.validate(&*counter)?;
        let pool = CredentialPool::from_config(&config);
        let (rotation, _) = watch::channel(false);
        let manager = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config: RwLock::new(config),
            store,
            pool: Mutex::new(pool),
            seen_accounts: Mutex::new(HashSet::new()),
            account: Mutex::new(None),
            controller: Mutex::new(ConversationController::new()),
            client,
            counter,
            rotation,
            timer: Mutex::new(Instant::now()),
            use_count: AtomicU32::new(0),
            requested_model: Mutex::new(None),
            model_list: Mutex::new(Vec::new()),
        });
        manager.persist();
        Ok(manager)
    }

    /// Handle for spawned tasks; the manager lives in an `Arc` for the
    /// whole process.
    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("session manager alive")
    }

    /// Kick off the first credential validation.
    pub fn start(&self) {
        self.set_rotating(true);
        *self.timer.lock().expect("timer") = Instant::now();
        let manager = self.arc();
        tokio::spawn(async move {
            manager.activate(true).await;
        });
    }

    // -----------------------------------------------------------------
    // Shared state accessors
    // -----------------------------------------------------------------

    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }

    pub fn counter(&self) -> SharedTokenCounter {
        Arc::clone(&self.counter)
    }

    pub fn controller(&self) -> &Mutex<ConversationController> {
        &self.controller
    }

    pub fn config_snapshot(&self) -> GatewayConfig {
        self.config.read().expect("config").clone()
    }

    pub fn active_account(&self) -> Option<ActiveAccount> {
        self.account.lock().expect("account").clone()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.lock().expect("pool").len()
    }

    /// Remember what model the caller asked for; validation skips
    /// credentials tagged for a different model.
    pub fn set_requested_model(&self, model: Option<String>) {
        *self.requested_model.lock().expect("requested model") = model;
    }

    /// Model ids the gateway advertises: the known list plus everything
    /// discovered on accounts so far.
    pub fn advertised_models(&self) -> Vec<String> {
        let config = self.config.read().expect("config");
        let mut ids: Vec<String> = KNOWN_MODELS.iter().map(|m| m.to_string()).collect();
        for extra in &config.unknown_models {
            if !ids.contains(extra) {
                ids.push(extra.clone());
            }
        }
        ids
    }

    /// The deduplicated listing most recently served on `/v1/models`.
    pub fn model_list(&self) -> Vec<String> {
        self.model_list.lock().expect("model list").clone()
    }

    pub fn set_model_list(&self, ids: Vec<String>) {
        *self.model_list.lock().expect("model list") = ids;
    }

    /// Record a model id observed upstream but absent everywhere else.
    pub fn record_unknown_model(&self, model: &str) {
        if KNOWN_MODELS.contains(&model) {
            return;
        }
        {
            let mut config = self.config.write().expect("config");
            if config.unknown_models.iter().any(|m| m == model) {
                return;
            }
            config.unknown_models.push(model.to_string());
        }
        self.persist();
    }

    // -----------------------------------------------------------------
    // Rotation machinery
    // -----------------------------------------------------------------

    pub fn is_rotating(&self) -> bool {
        *self.rotation.borrow()
    }

    fn set_rotating(&self, value: bool) {
        self.rotation.send_replace(value);
    }

    /// Suspend until no credential transition is in progress.
    pub async fn wait_until_stable(&self) {
        let mut rx = self.rotation.subscribe();
        // Only fails if the sender is gone, which cannot outlive `self`.
        let _ = rx.wait_for(|rotating| !*rotating).await;
    }

    /// Begin a credential transition and schedule the next validation.
    /// Pools of size ≤ 1 cannot rotate; reported as `false`, not an error.
    pub fn rotate(&self, reset_timer: bool, cleanup: bool) -> bool {
        {
            let mut pool = self.pool.lock().expect("pool");
            if pool.len() <= 1 {
                self.set_rotating(false);
                return false;
            }
            self.use_count.store(0, Ordering::Relaxed);
            self.set_rotating(true);
            if !cleanup {
                pool.select_next();
                tracing::info!("rotating to the next credential");
            }
        }
        let delay = self.rotation_delay();
        let manager = self.arc();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            manager.activate(reset_timer).await;
        });
        true
    }

    fn rotation_delay(&self) -> Duration {
        let default_endpoint = self.config.read().expect("config").uses_default_endpoint();
        if default_endpoint {
            let elapsed = self.timer.lock().expect("timer").elapsed();
            ROTATION_BACKOFF.saturating_sub(elapsed)
        } else {
            Duration::ZERO
        }
    }

    /// Validate the current credential against live upstream account state.
    pub async fn activate(&self, reset_timer: bool) {
        if reset_timer {
            *self.timer.lock().expect("timer") = Instant::now();
        }
        match self.try_activate().await {
            Ok(()) => {}
            Err(GatewayError::Auth) => {
                tracing::warn!("upstream rejected the session token");
                self.retire_current(ValidationKind::InvalidAuth);
            }
            Err(err) => {
                tracing::error!(%err, "credential validation failed");
                self.rotate(true, false);
            }
        }
    }

    async fn try_activate(&self) -> Result<()> {
        let endpoint = self.config.read().expect("config").endpoint().to_string();

        let entry = self.pool.lock().expect("pool").current().cloned();
        let Some(entry) = entry else {
            self.set_rotating(false);
            tracing::warn!("no session credential available; serving direct-key requests only");
            return Ok(());
        };

        // A credential tagged for a different model is useless for the
        // caller's request; skip it without burning the backoff timer.
        let requested = self.requested_model.lock().expect("requested model").clone();
        if let (Some(model), Some(tag)) = (requested.as_deref(), entry.tag()) {
            if AccountClass::from_tag(tag).is_none() && tag != model {
                self.rotate(false, false);
                return Ok(());
            }
        }

        let (percentage, sweep, pool_len, cursor) = {
            let mut pool = self.pool.lock().expect("pool");
            let percentage = pool.note_attempt();
            (percentage, pool.sweep_mode(), pool.len(), pool.cursor())
        };

        if sweep && percentage > 100.0 {
            tracing::info!("credential sweep completed");
            self.persist();
            std::process::exit(0);
        }
        if percentage > 100.0 {
            let reset = self.config.read().expect("config").overlap_reset;
            if reset == OverlapReset::Sweep {
                self.seen_accounts.lock().expect("seen accounts").clear();
            }
        }

        self.client.absorb_cookie_str(&entry.session_cookie());
        let boot = self.client.bootstrap(&endpoint).await?;
        let Some(ref account) = boot.account else {
            return self.fail_validation(ValidationKind::NullAccount, percentage);
        };
        let org = account
            .chat_organization()
            .cloned()
            .ok_or_else(|| GatewayError::upstream(500, "no chat-capable organization"))?;
        let cookie_model = boot.default_model();
        let class = org.account_class();

        // Retag the entry with what bootstrap revealed and remember any
        // model id we have never seen before.
        let tag_value = class
            .map(|c| c.tag().to_string())
            .or_else(|| cookie_model.clone());
        let unknown_model = cookie_model
            .as_deref()
            .map(|m| {
                !KNOWN_MODELS.contains(&m)
                    && !self
                        .config
                        .read()
                        .expect("config")
                        .unknown_models
                        .iter()
                        .any(|u| u == m)
            })
            .unwrap_or(false);
        let mut dirty = false;
        if let Some(tag) = &tag_value {
            let mut pool = self.pool.lock().expect("pool");
            if let Some(current) = pool.current_mut() {
                if current.tag() != Some(tag.as_str()) {
                    current.set_tag(tag.clone());
                    dirty = true;
                }
            }
        }
        if unknown_model {
            let model = cookie_model.clone().unwrap_or_default();
            tracing::info!(model = %model, "recording unknown account model");
            self.config
                .write()
                .expect("config")
                .unknown_models
                .push(model);
            dirty = true;
        }
        if dirty {
            self.persist();
        }

        // Free account pinned to a different model than requested.
        if class.is_none() {
            if let Some(model) = requested.as_deref() {
                if cookie_model.as_deref() != Some(model) {
                    self.rotate(true, false);
                    return Ok(());
                }
            }
        }

        tracing::info!(
            index = cursor + 1,
            account = account.email_address.as_deref().unwrap_or("?"),
            model = cookie_model.as_deref().unwrap_or("default"),
            class = class.map(|c| c.tag()).unwrap_or("free"),
            "logged in"
        );

        let overlap = pool_len > 0
            && percentage <= 100.0
            && self
                .seen_accounts
                .lock()
                .expect("seen accounts")
                .contains(&org.uuid);
        if org.is_hard_disabled() {
            return self.fail_validation(ValidationKind::Disabled, percentage);
        }
        if !account.is_verified() {
            return self.fail_validation(ValidationKind::Unverified, percentage);
        }
        if overlap {
            return self.fail_validation(ValidationKind::Overlap, percentage);
        }
        self.seen_accounts
            .lock()
            .expect("seen accounts")
            .insert(org.uuid.clone());

        if sweep {
            tracing::info!(
                progress = %format!("{percentage:.2}%"),
                remaining = pool_len,
                "sweep progress"
            );
            self.rotate(true, false);
            return Ok(());
        }

        let organizations = self.client.organizations(&endpoint).await?;
        let info = organizations
            .into_iter()
            .find(|o| o.capabilities.iter().any(|c| c == "chat"))
            .ok_or_else(|| GatewayError::upstream(500, "no chat-capable organization"))?;
        *self.account.lock().expect("account") = Some(ActiveAccount {
            org_uuid: info.uuid.clone(),
            class,
            cookie_model: cookie_model.clone(),
        });

        if !info.active_flags.is_empty() {
            let banned = info.active_flags.iter().any(|f| f.is_ban());
            tracing::warn!(
                flags = ?info.active_flags.iter().map(|f| f.kind.as_str()).collect::<Vec<_>>(),
                "account carries active flags"
            );
            if self.config.read().expect("config").settings.clear_flags {
                for flag in info.active_flags.iter().filter(|f| f.is_dismissable()) {
                    match self.client.dismiss_flag(&endpoint, &info.uuid, &flag.kind).await {
                        Ok(_) => tracing::info!(flag = %flag.kind, "flag dismissed"),
                        Err(err) => tracing::warn!(flag = %flag.kind, %err, "flag dismissal failed"),
                    }
                }
            }
            if banned {
                return self.fail_validation(ValidationKind::Banned, percentage);
            }
            if self.config.read().expect("config").settings.skip_restricted {
                tracing::info!("account is restricted; rotating past it");
                self.rotate(true, false);
                return Ok(());
            }
        }

        // Keep the artifacts preview setting in the configured state.
        let want_artifacts = self.config.read().expect("config").settings.artifacts;
        let has_artifacts = account
            .settings
            .get("preview_feature_uses_artifacts")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if has_artifacts != want_artifacts {
            let mut settings = account.settings.clone();
            if let Some(obj) = settings.as_object_mut() {
                obj.insert(
                    "preview_feature_uses_artifacts".into(),
                    serde_json::Value::Bool(want_artifacts),
                );
            }
            if let Err(err) = self.client.update_account_settings(&endpoint, settings).await {
                tracing::warn!(%err, "artifacts preference sync failed");
            }
        }

        self.set_rotating(false);

        // Clear out conversations left behind by earlier runs.
        if !self.config.read().expect("config").settings.preserve_chats {
            match self.client.list_conversations(&endpoint, &info.uuid).await {
                Ok(leftovers) if !leftovers.is_empty() => {
                    tracing::info!(count = leftovers.len(), "sweeping leftover conversations");
                    let uuids: Vec<String> = leftovers.into_iter().map(|c| c.uuid).collect();
                    self.bulk_delete_conversations(&endpoint, &info.uuid, uuids)
                        .await;
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "conversation listing failed"),
            }
        }
        Ok(())
    }

    fn fail_validation(&self, kind: ValidationKind, percentage: f64) -> Result<()> {
        tracing::warn!(reason = kind.label(), "credential failed validation");
        let sweep = self.pool.lock().expect("pool").sweep_mode();
        if sweep {
            tracing::info!(progress = %format!("{percentage:.2}%"), "sweep progress");
        }
        self.retire_current(kind);
        Ok(())
    }

    /// Retire the current credential: wasted-log record, pool shrink,
    /// persist, then a cleanup rotation (cursor stays put).
    pub fn retire_current(&self, kind: ValidationKind) {
        let retired = {
            let mut pool = self.pool.lock().expect("pool");
            pool.retire_current(kind)
        };
        let Some((_, record)) = retired else {
            self.set_rotating(false);
            return;
        };
        tracing::warn!(record = record.as_str(), "credential retired");
        {
            let mut config = self.config.write().expect("config");
            config.wasted_cookie.push(record);
            config.cookie.clear();
        }
        self.persist();
        self.rotate(true, true);
    }

    /// Write pool state through to the durable document. Mutations count as
    /// committed only once this returns.
    pub fn persist(&self) {
        let entries = self.pool.lock().expect("pool").entry_strings();
        let snapshot = {
            let mut config = self.config.write().expect("config");
            config.cookie_array = entries;
            config.clone()
        };
        if let Err(err) = self.store.save(&snapshot) {
            tracing::warn!(%err, "failed to persist pool state");
        }
    }

    // -----------------------------------------------------------------
    // Conversation bookkeeping
    // -----------------------------------------------------------------

    /// Delete one upstream conversation, clearing local identity if it is
    /// the live one. Honors chat preservation.
    pub async fn delete_conversation(&self, uuid: &str) {
        {
            let mut controller = self.controller.lock().expect("controller");
            if controller.conversation.uuid.as_deref() == Some(uuid) {
                controller.take_conversation();
            }
        }
        let endpoint = {
            let config = self.config.read().expect("config");
            if config.settings.preserve_chats {
                return;
            }
            config.endpoint().to_string()
        };
        let Some(account) = self.active_account() else {
            return;
        };
        let _ = self
            .client
            .delete_conversation(&endpoint, &account.org_uuid, uuid)
            .await;
    }

    /// Delete many conversations with bounded concurrency; all deletions
    /// complete before this returns, in no particular order.
    pub async fn bulk_delete_conversations(&self, endpoint: &str, org: &str, uuids: Vec<String>) {
        stream::iter(uuids)
            .map(|uuid| {
                let manager = self.arc();
                let endpoint = endpoint.to_string();
                let org = org.to_string();
                async move {
                    {
                        let mut controller = manager.controller.lock().expect("controller");
                        if controller.conversation.uuid.as_deref() == Some(uuid.as_str()) {
                            controller.take_conversation();
                        }
                    }
                    let _ = manager
                        .client
                        .delete_conversation(&endpoint, &org, &uuid)
                        .await;
                }
            })
            .buffer_unordered(BULK_DELETE_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
    }

    /// Post-completion bookkeeping: impersonation memory, unknown-model
    /// recording, and the rotation triggers.
    pub async fn after_completion(&self, signals: CompletionSignals) {
        {
            let mut controller = self.controller.lock().expect("controller");
            controller.set_prev_impersonated(signals.impersonated);
        }
        if !signals.api_mode {
            if let Some(model) = signals.completion_model.as_deref() {
                self.record_unknown_model(model);
            }
        }

        let threshold = self.config.read().expect("config").cookie_counter;
        let counter_hit = !signals.errored
            && threshold > 0
            && self.use_count.fetch_add(1, Ordering::Relaxed) + 1 >= threshold as u32;
        let should_change = signals.exceeded_limit || counter_hit;

        if !signals.api_mode && (should_change || signals.impersonated) {
            let live = {
                let mut controller = self.controller.lock().expect("controller");
                controller.take_conversation()
            };
            if let Some(uuid) = live {
                self.delete_conversation(&uuid).await;
            }
            if should_change {
                if signals.exceeded_limit {
                    tracing::info!("usage limit exceeded; rotating credential");
                }
                self.use_count.store(0, Ordering::Relaxed);
                self.rotate(true, false);
            }
        }
    }

    /// Shutdown path: drop the live conversation upstream, best effort.
    pub async fn shutdown_cleanup(&self) {
        let live = {
            let mut controller = self.controller.lock().expect("controller");
            controller.take_conversation()
        };
        if let Some(uuid) = live {
            self.delete_conversation(&uuid).await;
        }
    }
}

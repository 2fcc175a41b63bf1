//! Push-notification sender — delivers task snapshots to webhooks.
//!
//! Paired with a [`PushNotificationConfigStore`] that CRUDs the webhook
//! registrations the request handler exposes over the
//! `tasks/pushNotificationConfig/*` RPCs.
//!
//! For each terminal (or otherwise configured) event, the sender looks up the
//! configs registered for the task, renders the task snapshot as JSON, and
//! POSTs it to each URL in parallel with a per-request timeout and an
//! optional bearer token. Delivery is best-effort: a failed POST is logged
//! at WARN and never surfaces back to the event bus or affects task state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{A2AError, A2AResult};
use crate::types::{Task, TaskPushNotificationConfig};

/// Default per-delivery HTTP timeout for push notification delivery.
pub const DEFAULT_PUSH_SEND_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// PushNotificationConfigStore — CRUD for per-task webhook registrations
// ---------------------------------------------------------------------------

/// Persistence for push-notification configs, keyed by task ID.
///
/// Multiple configs may be registered per task (each with its own `id`);
/// `DefaultRequestHandler` delegates the `tasks/pushNotificationConfig/*`
/// RPCs straight through to this trait.
#[async_trait]
pub trait PushNotificationConfigStore: Send + Sync {
    /// Register or replace a config. Assigns an `id` if the caller didn't
    /// supply one. Returns the stored config (with its resolved `id`).
    async fn set(
        &self,
        config: TaskPushNotificationConfig,
    ) -> A2AResult<TaskPushNotificationConfig>;

    /// Look up a single config by task ID and config ID.
    ///
    /// If `config_id` is `None` and the task has exactly one config,
    /// returns that config — a convenience for agents that only ever
    /// register one webhook per task.
    async fn get(
        &self,
        task_id: &str,
        config_id: Option<&str>,
    ) -> A2AResult<Option<TaskPushNotificationConfig>>;

    /// List all configs registered for a task.
    async fn list(&self, task_id: &str) -> A2AResult<Vec<TaskPushNotificationConfig>>;

    /// Remove one config. Silently succeeds if it doesn't exist.
    async fn delete(&self, task_id: &str, config_id: &str) -> A2AResult<()>;
}

/// In-memory reference implementation of [`PushNotificationConfigStore`].
#[derive(Debug, Default)]
pub struct InMemoryPushNotificationConfigStore {
    configs: RwLock<HashMap<String, Vec<TaskPushNotificationConfig>>>,
}

impl InMemoryPushNotificationConfigStore {
    /// Create a new, empty config store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PushNotificationConfigStore for InMemoryPushNotificationConfigStore {
    async fn set(
        &self,
        mut config: TaskPushNotificationConfig,
    ) -> A2AResult<TaskPushNotificationConfig> {
        let config_id = config
            .push_notification_config
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        config.push_notification_config.id = Some(config_id.clone());
        config.id = Some(config_id.clone());

        let mut configs = self.configs.write().await;
        let entry = configs.entry(config.task_id.clone()).or_default();
        if let Some(existing) = entry
            .iter_mut()
            .find(|c| c.push_notification_config.id.as_deref() == Some(config_id.as_str()))
        {
            *existing = config.clone();
        } else {
            entry.push(config.clone());
        }

        debug!(task_id = %config.task_id, config_id = %config_id, "Push notification config registered");
        Ok(config)
    }

    async fn get(
        &self,
        task_id: &str,
        config_id: Option<&str>,
    ) -> A2AResult<Option<TaskPushNotificationConfig>> {
        let configs = self.configs.read().await;
        let Some(entries) = configs.get(task_id) else {
            return Ok(None);
        };

        match config_id {
            Some(id) => Ok(entries
                .iter()
                .find(|c| c.push_notification_config.id.as_deref() == Some(id))
                .cloned()),
            None => Ok(entries.first().cloned()),
        }
    }

    async fn list(&self, task_id: &str) -> A2AResult<Vec<TaskPushNotificationConfig>> {
        let configs = self.configs.read().await;
        Ok(configs.get(task_id).cloned().unwrap_or_default())
    }

    async fn delete(&self, task_id: &str, config_id: &str) -> A2AResult<()> {
        let mut configs = self.configs.write().await;
        if let Some(entries) = configs.get_mut(task_id) {
            entries.retain(|c| c.push_notification_config.id.as_deref() != Some(config_id));
            if entries.is_empty() {
                configs.remove(task_id);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PushNotificationSender — delivers task snapshots over HTTP
// ---------------------------------------------------------------------------

/// Delivers task snapshots to the webhooks registered for a task.
#[async_trait]
pub trait PushNotificationSender: Send + Sync {
    /// Render `task` and POST it to every config registered for `task.id`,
    /// in parallel, best-effort. Never returns an error for delivery
    /// failures — those are logged at WARN and otherwise swallowed.
    async fn send_notification(&self, task: &Task) -> A2AResult<()>;
}

/// Reference [`PushNotificationSender`] backed by `reqwest`.
///
/// Never blocks the event bus: callers should invoke
/// [`send_notification`](PushNotificationSender::send_notification) from a
/// spawned task rather than inline on the dispatch path.
pub struct DefaultPushNotificationSender {
    client: reqwest::Client,
    config_store: Arc<dyn PushNotificationConfigStore>,
    timeout: Duration,
}

impl DefaultPushNotificationSender {
    /// Create a sender with the default push-send timeout (10s).
    pub fn new(config_store: Arc<dyn PushNotificationConfigStore>) -> Self {
        Self::with_timeout(config_store, DEFAULT_PUSH_SEND_TIMEOUT)
    }

    /// Create a sender with an explicit per-delivery timeout.
    pub fn with_timeout(
        config_store: Arc<dyn PushNotificationConfigStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config_store,
            timeout,
        }
    }

    /// Expose the underlying config store so `RequestHandler` implementations
    /// can delegate CRUD RPCs without holding a second `Arc`.
    pub fn config_store(&self) -> &Arc<dyn PushNotificationConfigStore> {
        &self.config_store
    }

    async fn deliver_one(&self, url: &str, token: Option<&str>, body: &serde_json::Value) {
        let mut req = self.client.post(url).timeout(self.timeout).json(body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %url, status = %resp.status(), "Push notification delivered");
            }
            Ok(resp) => {
                warn!(url = %url, status = %resp.status(), "Push notification rejected by endpoint");
            }
            Err(err) => {
                warn!(url = %url, error = %err, "Push notification delivery failed");
            }
        }
    }
}

#[async_trait]
impl PushNotificationSender for DefaultPushNotificationSender {
    async fn send_notification(&self, task: &Task) -> A2AResult<()> {
        let configs = self.config_store.list(&task.id).await?;
        if configs.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_value(task).map_err(|e| {
            A2AError::InternalError {
                message: format!("Failed to serialize task for push notification: {e}"),
                data: None,
            }
        })?;

        let deliveries = configs.iter().map(|cfg| {
            self.deliver_one(
                &cfg.push_notification_config.url,
                cfg.push_notification_config.token.as_deref(),
                &body,
            )
        });
        futures::future::join_all(deliveries).await;

        Ok(())
    }
}

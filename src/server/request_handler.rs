//! Request handler — coordinates agent execution, task storage, and event delivery.
//!
//! The [`RequestHandler`] trait defines the interface that the axum integration
//! layer calls for each JSON-RPC method. [`DefaultRequestHandler`] provides
//! the standard implementation that wires together an [`AgentExecutor`],
//! [`TaskStore`], and [`EventQueue`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{A2AError, A2AResult};
use crate::types::{
    Message, Part, ReplicatedEventQueueItem, SendMessageResponse, StreamResponse, Task, TaskState,
    TaskStatus, TaskStatusUpdateEvent, TaskPushNotificationConfig,
};

use super::agent_executor::{AgentExecutor, RequestContext};
use super::event_queue::{EventQueue, InMemoryQueueManager, QueueManager};
use super::push_notification_sender::{PushNotificationConfigStore, PushNotificationSender};
use super::replicated_queue_bridge::ReplicationStrategy;
use super::task_store::{TaskListParams, TaskListResponse, TaskStore};

/// Default wall-clock budget for a single blocking agent invocation.
/// Exceeding this synthesizes a `FAILED` status rather than hanging the caller.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for `tasks/cancel` to observe the executor's `Canceled`
/// status before giving up.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Parameters for `message/send` and `message/stream`.
#[derive(Debug, Clone)]
pub struct SendMessageParams {
    /// The message to send to the agent.
    pub message: Message,

    /// Optional configuration for the send operation.
    pub configuration: Option<SendMessageConfiguration>,

    /// Optional metadata attached to the request.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Configuration options for message sending.
#[derive(Debug, Clone)]
pub struct SendMessageConfiguration {
    /// Accepted output MIME types / modes.
    pub accepted_output_modes: Option<Vec<String>>,

    /// If `true`, the server should block until the task completes.
    /// If `false` or `None`, the server may return immediately with a
    /// `submitted` or `working` task.
    pub blocking: Option<bool>,

    /// Maximum number of history messages to include in the response.
    pub history_length: Option<usize>,

    /// Push notification configuration.
    pub push_notification_config: Option<serde_json::Value>,
}

/// Parameters for `tasks/get`.
#[derive(Debug, Clone)]
pub struct GetTaskParams {
    /// The task ID to retrieve.
    pub id: String,

    /// Maximum number of history messages to include.
    pub history_length: Option<usize>,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Parameters for `tasks/cancel`.
#[derive(Debug, Clone)]
pub struct CancelTaskParams {
    /// The task ID to cancel.
    pub id: String,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

/// Parameters for `tasks/subscribe`.
#[derive(Debug, Clone)]
pub struct SubscribeToTaskParams {
    /// The task ID to subscribe to.
    pub id: String,

    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    pub tenant: Option<String>,
}

// Re-export from types.rs — uses proto oneof serialization pattern.
// SendMessageResponse is imported from crate::types above.

/// Trait for handling A2A JSON-RPC requests.
///
/// Each method corresponds to an A2A JSON-RPC method. The axum integration
/// layer dispatches incoming requests to these methods.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle `message/send` — execute agent logic and return the completed task or message.
    async fn on_message_send(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse>;

    /// Handle `message/stream` — execute agent logic and return an event stream.
    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>>;

    /// Handle `tasks/get` — retrieve a task by ID.
    async fn on_get_task(&self, params: GetTaskParams) -> A2AResult<Task>;

    /// Handle `tasks/list` — list tasks matching filter criteria.
    async fn on_list_tasks(&self, params: TaskListParams) -> A2AResult<TaskListResponse>;

    /// Handle `tasks/cancel` — cancel a running task.
    async fn on_cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task>;

    /// Handle `tasks/resubscribe` — re-subscribe to events for a running task.
    ///
    /// Allows a client to re-attach to a running streaming task's event stream.
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_resubscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        let _ = params;
        Err(A2AError::UnsupportedOperation {
            message: "tasks/resubscribe is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/subscribe` — subscribe to events for an existing task.
    async fn on_subscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>>;

    /// Handle `tasks/pushNotificationConfig/set`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_set_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/get`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_get_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/list`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_list_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }

    /// Handle `tasks/pushNotificationConfig/delete`.
    ///
    /// Default implementation returns `UnsupportedOperation`.
    async fn on_delete_task_push_notification_config(
        &self,
        _params: serde_json::Value,
    ) -> A2AResult<()> {
        Err(A2AError::UnsupportedOperation {
            message: "Push notification config is not supported".to_string(),
            data: None,
        })
    }
}

/// Tracks a running agent execution.
struct RunningAgent {
    /// Handle to the spawned tokio task running the agent.
    handle: JoinHandle<()>,
    /// The event queue for this execution.
    event_queue: EventQueue,
}

/// Where a blocking `message/send` stopped consuming events.
///
/// A blocking send can stop at a terminal state, an
/// `AUTH_REQUIRED`/`INPUT_REQUIRED` interruption, or a bare out-of-band
/// `Message` that never materializes a task.
enum ConsumeOutcome {
    /// A task snapshot at the point consumption stopped.
    Task(Task),
    /// A direct message reply with no associated task.
    Message(Message),
}

/// Default request handler — standard implementation wiring executor, store, and events.
///
/// This is the primary implementation of [`RequestHandler`] that coordinates:
/// - An [`AgentExecutor`] for running agent logic
/// - A [`TaskStore`] for persisting task state
/// - An [`EventQueue`] per task for streaming events
///
/// # Lifecycle
///
/// 1. `on_message_send` or `on_message_send_stream` creates a new task (or looks up
///    an existing one by context ID), persists it, and spawns the agent executor.
/// 2. The executor publishes events to the task's `EventQueue`.
/// 3. For `message/send`: events are consumed until a terminal state, then the
///    final task is returned.
/// 4. For `message/stream`: the event receiver is returned directly for SSE delivery.
/// 5. `on_cancel_task` calls the executor's cancel method and waits for the
///    cancellation event.
pub struct DefaultRequestHandler {
    executor: Arc<dyn AgentExecutor>,
    task_store: Arc<dyn TaskStore>,
    /// Per-task event queues and running agent handles. `Arc`-wrapped so
    /// the background persistence task spawned by `on_message_send_stream`
    /// (which must be `'static`) can share the same map for cleanup.
    running_agents: Arc<Mutex<HashMap<String, RunningAgent>>>,
    /// Delivers task snapshots to registered webhooks. `None` disables
    /// push notifications entirely — `*PushNotificationConfig` RPCs then
    /// answer `UnsupportedOperation`.
    push_sender: Option<Arc<dyn PushNotificationSender>>,
    /// Backing store for the `tasks/pushNotificationConfig/*` CRUD RPCs.
    /// Set together with `push_sender` via [`with_push_notifications`](Self::with_push_notifications).
    push_config_store: Option<Arc<dyn PushNotificationConfigStore>>,
    /// Cross-node replication bridge. When set, every event dispatched
    /// on a task's queue is mirrored to the shared log, and finalized tasks
    /// publish a poison-pill closure.
    replication: Option<Arc<dyn ReplicationStrategy>>,
    /// Registry of per-task main queues, both for tasks this node is
    /// executing (registered when the executor is spawned) and for tasks
    /// running on another node whose events arrive only via the
    /// replication bridge (registered lazily by the replication consumer
    /// loop). `on_subscribe_to_task`/`on_resubscribe_to_task` hand out taps
    /// off this registry regardless of which side produced the task.
    queue_manager: Arc<dyn QueueManager>,
    /// Wall-clock budget for a single blocking agent invocation.
    agent_timeout: Duration,
    /// Budget for `tasks/cancel` to observe the executor's terminal status.
    cancel_timeout: Duration,
}

impl DefaultRequestHandler {
    /// Create a new default request handler.
    ///
    /// Push notifications and replication are disabled by default; attach
    /// them with [`with_push_notifications`](Self::with_push_notifications)
    /// and [`with_replication`](Self::with_replication).
    pub fn new(executor: Arc<dyn AgentExecutor>, task_store: Arc<dyn TaskStore>) -> Self {
        Self {
            executor,
            task_store,
            running_agents: Arc::new(Mutex::new(HashMap::new())),
            push_sender: None,
            push_config_store: None,
            replication: None,
            queue_manager: Arc::new(InMemoryQueueManager::new()),
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }

    /// Enable push notifications: `sender` delivers terminal task
    /// snapshots to the webhooks registered in `config_store`, and the
    /// `tasks/pushNotificationConfig/*` RPCs delegate straight to it.
    pub fn with_push_notifications(
        mut self,
        sender: Arc<dyn PushNotificationSender>,
        config_store: Arc<dyn PushNotificationConfigStore>,
    ) -> Self {
        self.push_sender = Some(sender);
        self.push_config_store = Some(config_store);
        self
    }

    /// Enable the cross-node replication bridge.
    ///
    /// Also spawns the background consumer that drains
    /// [`ReplicationStrategy::subscribe`] and injects inbound events into
    /// this node's local event delivery, so a task produced on another node
    /// can still be tapped locally.
    pub fn with_replication(mut self, replication: Arc<dyn ReplicationStrategy>) -> Self {
        self.spawn_replication_consumer(&replication);
        self.replication = Some(replication);
        self
    }

    /// Drain inbound items from the replication bridge and apply them
    /// locally: persist via `save_with_origin(task, true)` (never
    /// re-triggering the finalized-signal loop) and forward the payload to
    /// any local tap registered against `queue_manager`, without
    /// re-publishing onto the bridge (that would echo the event back out).
    ///
    /// Items for a task this node is itself producing (present in
    /// `running_agents`) are skipped — this node already applied and
    /// mirrored that event on the outbound path, and every
    /// `ReplicationStrategy` (including the in-memory one, by its own
    /// documented contract) may echo a sender's own sends back to it.
    fn spawn_replication_consumer(&self, replication: &Arc<dyn ReplicationStrategy>) {
        let mut rx = replication.subscribe();
        let task_store = Arc::clone(&self.task_store);
        let running_agents = Arc::clone(&self.running_agents);
        let queue_manager = Arc::clone(&self.queue_manager);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(item) => {
                        Self::apply_replicated_item(
                            &task_store,
                            &running_agents,
                            &queue_manager,
                            item,
                        )
                        .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Replication consumer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Apply one inbound [`ReplicatedEventQueueItem`] — the body of
    /// [`spawn_replication_consumer`]'s loop, factored out so it can be
    /// unit-tested without a real broker.
    async fn apply_replicated_item(
        task_store: &Arc<dyn TaskStore>,
        running_agents: &Arc<Mutex<HashMap<String, RunningAgent>>>,
        queue_manager: &Arc<dyn QueueManager>,
        item: ReplicatedEventQueueItem,
    ) {
        if running_agents.lock().await.contains_key(&item.task_id) {
            debug!(task_id = %item.task_id, "Ignoring replicated echo of our own event");
            return;
        }

        if item.closed_event {
            let _ = queue_manager.close(&item.task_id).await;
            debug!(task_id = %item.task_id, "Replicated task closure applied");
            return;
        }

        let event = match StreamResponse::try_from(item.event) {
            Ok(event) => event,
            Err(_) => return,
        };

        if let Err(e) =
            Self::apply_replicated_event_to_store(task_store, &item.task_id, &event).await
        {
            warn!(task_id = %item.task_id, error = %e, "Failed to apply replicated event");
            return;
        }

        let queue = match queue_manager.get(&item.task_id).await {
            Some(queue) => queue,
            None => {
                let queue = EventQueue::with_default_capacity();
                let _ = queue_manager.add(&item.task_id, queue.clone()).await;
                queue
            }
        };
        let _ = queue.enqueue_event(event).await;
    }

    /// Like [`apply_event_to_store`](Self::apply_event_to_store), but for
    /// the replication receive path: creates the task locally if this is
    /// the first event this node has seen for it, and persists with
    /// `is_replicated = true` so the store never re-publishes a finalized
    /// signal back through the bridge.
    async fn apply_replicated_event_to_store(
        task_store: &Arc<dyn TaskStore>,
        task_id: &str,
        event: &StreamResponse,
    ) -> A2AResult<()> {
        let mut task = match task_store.get(task_id).await? {
            Some(task) => task,
            None => {
                let context_id = match event {
                    StreamResponse::Task(t) => t.context_id.clone(),
                    StreamResponse::StatusUpdate(e) => e.context_id.clone(),
                    StreamResponse::ArtifactUpdate(e) => e.context_id.clone(),
                    StreamResponse::Message(m) => m.context_id.clone().unwrap_or_default(),
                };
                Task {
                    id: task_id.to_string(),
                    context_id,
                    kind: "task".to_string(),
                    status: TaskStatus {
                        state: TaskState::Submitted,
                        message: None,
                        timestamp: Some(chrono::Utc::now().to_rfc3339()),
                    },
                    artifacts: None,
                    history: None,
                    metadata: None,
                }
            }
        };

        match event {
            StreamResponse::StatusUpdate(update) => {
                if let Some(ref current_msg) = task.status.message {
                    if update.status.message.as_ref() != Some(current_msg) {
                        let history = task.history.get_or_insert_with(Vec::new);
                        history.push(current_msg.clone());
                    }
                }

                if let Some(ref event_meta) = update.metadata {
                    if let Some(ref mut task_meta) = task.metadata {
                        if let (Some(task_obj), Some(event_obj)) =
                            (task_meta.as_object_mut(), event_meta.as_object())
                        {
                            for (k, v) in event_obj {
                                task_obj.insert(k.clone(), v.clone());
                            }
                        }
                    } else {
                        task.metadata = Some(event_meta.clone());
                    }
                }

                task.status = update.status.clone();
            }
            StreamResponse::ArtifactUpdate(update) => {
                let artifacts = task.artifacts.get_or_insert_with(Vec::new);
                let append_parts = update.append.unwrap_or(false);
                let artifact_id = &update.artifact.artifact_id;
                let existing_idx = artifacts.iter().position(|a| &a.artifact_id == artifact_id);

                if !append_parts {
                    if let Some(idx) = existing_idx {
                        artifacts[idx] = update.artifact.clone();
                    } else {
                        artifacts.push(update.artifact.clone());
                    }
                } else if let Some(idx) = existing_idx {
                    artifacts[idx].parts.extend(update.artifact.parts.clone());
                } else {
                    warn!(
                        task_id = %task_id,
                        artifact_id = %artifact_id,
                        "Received replicated append=true for nonexistent artifact — ignoring chunk"
                    );
                }
            }
            StreamResponse::Task(updated_task) => {
                task = updated_task.clone();
            }
            StreamResponse::Message(msg) => {
                let history = task.history.get_or_insert_with(Vec::new);
                history.push(msg.clone());
            }
        }

        task_store.save_with_origin(task, true).await
    }

    /// Override the default blocking-agent and cancel timeouts.
    pub fn with_timeouts(mut self, agent_timeout: Duration, cancel_timeout: Duration) -> Self {
        self.agent_timeout = agent_timeout;
        self.cancel_timeout = cancel_timeout;
        self
    }

    /// Create or retrieve a task for the given message.
    ///
    /// Task resolution logic:
    /// 1. If `task_id` is set, look up the existing task and validate state.
    /// 2. If the task exists but is terminal, return `InvalidParams`.
    /// 3. If `task_id` is set but doesn't exist, return `TaskNotFound`.
    /// 4. Otherwise create a new task in `submitted` state.
    async fn get_or_create_task(&self, params: &SendMessageParams) -> A2AResult<Task> {
        // Check if the message references an existing task.
        if let Some(ref task_id) = params.message.task_id {
            if let Some(task) = self.task_store.get(task_id).await? {
                // Verify it's not in a terminal state.
                if Self::is_terminal(&task.status.state) {
                    return Err(A2AError::InvalidParams {
                        message: format!(
                            "Task {} is in terminal state: {}",
                            task_id, task.status.state
                        ),
                        data: None,
                    });
                }
                // Add the new message to history: move the previous
                // status.message to history first, then clear it.
                let mut updated_task = task;
                if let Some(ref status_msg) = updated_task.status.message {
                    let history = updated_task.history.get_or_insert_with(Vec::new);
                    history.push(status_msg.clone());
                    updated_task.status.message = None;
                }
                let history = updated_task.history.get_or_insert_with(Vec::new);
                history.push(params.message.clone());
                self.task_store.save(updated_task.clone()).await?;
                return Ok(updated_task);
            } else {
                // task_id was specified but doesn't exist.
                return Err(A2AError::TaskNotFound {
                    message: format!("Task {} was specified but does not exist", task_id),
                    data: None,
                });
            }
        }

        // Create a new task.
        let task_id = Uuid::new_v4().to_string();
        let context_id = params
            .message
            .context_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let task = Task {
            id: task_id,
            context_id,
            kind: "task".to_string(),
            status: TaskStatus {
                state: TaskState::Submitted,
                message: None,
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            },
            artifacts: None,
            history: Some(vec![params.message.clone()]),
            metadata: params.metadata.clone(),
        };

        self.task_store.save(task.clone()).await?;
        debug!(task_id = %task.id, "Created new task");

        Ok(task)
    }

    /// Spawn the agent executor for a task.
    ///
    /// Returns the event queue for subscribing to events.
    ///
    /// Executes the agent and closes the queue afterwards. Does NOT
    /// auto-publish a `Working` status; that is the responsibility of the
    /// `AgentExecutor` implementation.
    async fn spawn_executor(
        &self,
        task: &Task,
        message: &Message,
        configuration: Option<&SendMessageConfiguration>,
    ) -> A2AResult<EventQueue> {
        let event_queue = EventQueue::with_default_capacity();

        // Convert the request_handler's SendMessageConfiguration to the
        // types.rs SendMessageConfiguration used by RequestContext.
        let types_config = configuration.map(|c| crate::types::SendMessageConfiguration {
            accepted_output_modes: c.accepted_output_modes.clone(),
            push_notification_config: c
                .push_notification_config
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            history_length: c.history_length.map(|h| h as i32),
            blocking: c.blocking,
        });

        let context = RequestContext {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            message: Some(message.clone()),
            task: Some(task.clone()),
            configuration: types_config,
            related_tasks: Vec::new(),
            metadata: task.metadata.clone(),
            call_context: None,
        };

        let executor = Arc::clone(&self.executor);
        let queue_clone = event_queue.clone();
        let task_id = task.id.clone();
        let context_id = task.context_id.clone();

        let handle = tokio::spawn(async move {
            // Execute the agent — state transitions (working, etc.) are the
            // agent's responsibility.
            if let Err(e) = executor.execute(context, queue_clone.clone()).await {
                error!(task_id = %task_id, error = %e, "Agent execution failed");

                // Publish a failed status: execution errors result in a
                // failed task.
                let failed_event = StreamResponse::StatusUpdate(TaskStatusUpdateEvent {
                    task_id: task_id.clone(),
                    context_id: context_id.clone(),
                    kind: "status-update".to_string(),
                    status: TaskStatus {
                        state: TaskState::Failed,
                        message: Some(Message {
                            message_id: Uuid::new_v4().to_string(),
                            role: crate::types::Role::Agent,
                            kind: "message".to_string(),
                            parts: vec![Part::text(format!("Agent execution failed: {}", e))],
                            context_id: None,
                            task_id: Some(task_id.clone()),
                            metadata: None,
                            extensions: None,
                            reference_task_ids: None,
                        }),
                        timestamp: Some(chrono::Utc::now().to_rfc3339()),
                    },
                    r#final: true,
                    metadata: None,
                });
                let _ = queue_clone.publish(failed_event);
            }
            // The broadcast channel auto-closes when all senders are
            // dropped, so an explicit close() here isn't needed.
        });

        // Track the running agent (mirrors Python's _register_producer).
        let mut running = self.running_agents.lock().await;
        running.insert(
            task.id.clone(),
            RunningAgent {
                handle,
                event_queue: event_queue.clone(),
            },
        );
        drop(running);

        // Register the main queue so subscribers can tap it regardless of
        // whether they arrive before or after this point.
        let _ = self.queue_manager.add(&task.id, event_queue.clone()).await;

        Ok(event_queue)
    }

    /// Consume events from the queue until the blocking send's interruption
    /// point is reached: a terminal status, `AUTH_REQUIRED`/`INPUT_REQUIRED`
    /// (when `stop_on_interrupt`), a bare out-of-band `Message`, the channel
    /// closing, or [`agent_timeout`](Self::agent_timeout) elapsing.
    ///
    /// Every event is persisted (C2/C3 reduction) and, when replication is
    /// configured, mirrored onto the shared log before the interrupt
    /// check runs. Reaching a terminal state fires [`finalize`](Self::finalize)
    /// exactly once: push notification dispatch, the replication
    /// poison-pill, and running-agent cleanup.
    ///
    /// Implements the special `AUTH_REQUIRED` rule: when `stop_on_interrupt`
    /// is set and the status is `AUTH_REQUIRED` or `INPUT_REQUIRED`, this
    /// returns immediately WITHOUT closing the queue or removing the
    /// running-agent entry — the executor keeps running and later events
    /// (e.g. from a resumed out-of-band auth flow) are still delivered to
    /// subsequent subscribers.
    async fn consume_events(
        &self,
        task_id: &str,
        mut rx: broadcast::Receiver<StreamResponse>,
        stop_on_interrupt: bool,
    ) -> A2AResult<ConsumeOutcome> {
        let deadline = tokio::time::Instant::now() + self.agent_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.synthesize_timeout_failure(task_id).await;
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(StreamResponse::Message(msg))) => {
                    self.replicate_event(task_id, &StreamResponse::Message(msg.clone()))
                        .await;
                    let mut running = self.running_agents.lock().await;
                    running.remove(task_id);
                    drop(running);
                    let _ = self.queue_manager.close(task_id).await;
                    return Ok(ConsumeOutcome::Message(msg));
                }
                Ok(Ok(event)) => {
                    self.apply_event(task_id, &event).await?;
                    self.replicate_event(task_id, &event).await;

                    let task =
                        self.task_store
                            .get(task_id)
                            .await?
                            .ok_or_else(|| A2AError::TaskNotFound {
                                message: task_id.to_string(),
                                data: None,
                            })?;

                    if task.status.state.is_final() {
                        self.finalize(task_id, &task).await;
                        return Ok(ConsumeOutcome::Task(task));
                    }

                    if stop_on_interrupt
                        && matches!(
                            task.status.state,
                            TaskState::AuthRequired | TaskState::InputRequired
                        )
                    {
                        return Ok(ConsumeOutcome::Task(task));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    let mut running = self.running_agents.lock().await;
                    running.remove(task_id);
                    drop(running);
                    let _ = self.queue_manager.close(task_id).await;
                    break;
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!(task_id = %task_id, missed = n, "Event consumer lagged");
                    continue;
                }
                Err(_elapsed) => {
                    return self.synthesize_timeout_failure(task_id).await;
                }
            }
        }

        let task = self
            .task_store
            .get(task_id)
            .await?
            .ok_or_else(|| A2AError::TaskNotFound {
                message: task_id.to_string(),
                data: None,
            })?;
        Ok(ConsumeOutcome::Task(task))
    }

    /// Consume events from the queue until a terminal state is reached.
    ///
    /// Thin wrapper over [`consume_events`](Self::consume_events) for callers
    /// (e.g. `tasks/cancel`) that only care about terminal states, never
    /// `AUTH_REQUIRED`/`INPUT_REQUIRED` interruption.
    async fn consume_until_terminal(
        &self,
        task_id: &str,
        rx: broadcast::Receiver<StreamResponse>,
    ) -> A2AResult<Task> {
        match self.consume_events(task_id, rx, false).await? {
            ConsumeOutcome::Task(task) => Ok(task),
            ConsumeOutcome::Message(_) => {
                self.task_store
                    .get(task_id)
                    .await?
                    .ok_or_else(|| A2AError::TaskNotFound {
                        message: task_id.to_string(),
                        data: None,
                    })
            }
        }
    }

    /// Synthesize a `FAILED` status after the blocking-agent timeout elapses
    /// Hitting an agent timeout emits a synthetic FAILED status.
    async fn synthesize_timeout_failure(&self, task_id: &str) -> A2AResult<ConsumeOutcome> {
        warn!(task_id = %task_id, timeout = ?self.agent_timeout, "Agent execution timed out");

        let mut task =
            self.task_store
                .get(task_id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: task_id.to_string(),
                    data: None,
                })?;

        if let Some(ref msg) = task.status.message {
            let history = task.history.get_or_insert_with(Vec::new);
            history.push(msg.clone());
        }

        task.status = TaskStatus {
            state: TaskState::Failed,
            message: Some(Message {
                message_id: Uuid::new_v4().to_string(),
                role: crate::types::Role::Agent,
                kind: "message".to_string(),
                parts: vec![Part::text(format!(
                    "Agent execution timed out after {:?}",
                    self.agent_timeout
                ))],
                context_id: None,
                task_id: Some(task_id.to_string()),
                metadata: None,
                extensions: None,
                reference_task_ids: None,
            }),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        };
        self.task_store.save(task.clone()).await?;
        self.finalize(task_id, &task).await;

        {
            let running = self.running_agents.lock().await;
            if let Some(agent) = running.get(task_id) {
                agent.handle.abort();
            }
        }

        Ok(ConsumeOutcome::Task(task))
    }

    /// Mirror an event onto the replication bridge, if configured.
    /// Replication failures never disturb local delivery.
    async fn replicate_event(&self, task_id: &str, event: &StreamResponse) {
        if let Some(ref replication) = self.replication {
            let item = ReplicatedEventQueueItem::from_event(task_id, event.clone());
            if let Err(e) = replication.send(item).await {
                warn!(task_id = %task_id, error = %e, "Replication send failed");
            }
        }
    }

    /// Run the once-per-lifecycle finalization steps for a task that just
    /// reached a terminal state: dispatch push notifications (C6, off the
    /// event-bus thread), publish the replication poison-pill, and drop
    /// the running-agent entry so later lookups see the task as no longer
    /// active.
    async fn finalize(&self, task_id: &str, task: &Task) {
        if let Some(ref sender) = self.push_sender {
            let sender = Arc::clone(sender);
            let task = task.clone();
            tokio::spawn(async move {
                if let Err(e) = sender.send_notification(&task).await {
                    warn!(error = %e, "Push notification dispatch failed");
                }
            });
        }

        if let Some(ref replication) = self.replication {
            if let Err(e) = replication.publish_closed(task_id).await {
                warn!(task_id = %task_id, error = %e, "Replication closure publish failed");
            }
        }

        let mut running = self.running_agents.lock().await;
        running.remove(task_id);
        drop(running);
        let _ = self.queue_manager.close(task_id).await;
    }

    /// Apply a stream event to the persisted task state.
    ///
    /// - For `StatusUpdate`: moves current status.message to history first, merges
    ///   event metadata into task metadata, then updates status.
    /// - For `ArtifactUpdate`: uses `append_artifact_to_task` logic — when
    ///   `append=true` and the artifact doesn't exist, the chunk is ignored.
    /// - For `Task`: replaces the entire task.
    /// - For `Message`: appends to history.
    async fn apply_event(&self, task_id: &str, event: &StreamResponse) -> A2AResult<()> {
        Self::apply_event_to_store(&self.task_store, task_id, event).await
    }

    /// Free-standing form of [`apply_event`](Self::apply_event) that only
    /// needs an `Arc<dyn TaskStore>`, so it can run inside a `'static`
    /// spawned task (e.g. `on_message_send_stream`'s persistence loop)
    /// without borrowing `&self`.
    async fn apply_event_to_store(
        task_store: &Arc<dyn TaskStore>,
        task_id: &str,
        event: &StreamResponse,
    ) -> A2AResult<()> {
        let mut task = task_store
            .get(task_id)
            .await?
            .ok_or_else(|| A2AError::TaskNotFound {
                message: task_id.to_string(),
                data: None,
            })?;

        match event {
            StreamResponse::StatusUpdate(update) => {
                // Move the CURRENT status.message to history BEFORE
                // replacing with the new status, unless the incoming update
                // carries the identical message (idempotence: a repeated
                // identical status-update must not duplicate it).
                if let Some(ref current_msg) = task.status.message {
                    if update.status.message.as_ref() != Some(current_msg) {
                        let history = task.history.get_or_insert_with(Vec::new);
                        history.push(current_msg.clone());
                    }
                }

                // Merge event metadata into task metadata.
                if let Some(ref event_meta) = update.metadata {
                    if let Some(ref mut task_meta) = task.metadata {
                        if let (Some(task_obj), Some(event_obj)) =
                            (task_meta.as_object_mut(), event_meta.as_object())
                        {
                            for (k, v) in event_obj {
                                task_obj.insert(k.clone(), v.clone());
                            }
                        }
                    } else {
                        task.metadata = Some(event_meta.clone());
                    }
                }

                task.status = update.status.clone();
            }
            StreamResponse::ArtifactUpdate(update) => {
                let artifacts = task.artifacts.get_or_insert_with(Vec::new);
                let append_parts = update.append.unwrap_or(false);
                let artifact_id = &update.artifact.artifact_id;

                // Find existing artifact by ID.
                let existing_idx = artifacts.iter().position(|a| &a.artifact_id == artifact_id);

                if !append_parts {
                    // First chunk — replace existing or add new.
                    if let Some(idx) = existing_idx {
                        artifacts[idx] = update.artifact.clone();
                    } else {
                        artifacts.push(update.artifact.clone());
                    }
                } else if let Some(idx) = existing_idx {
                    // Append parts to existing artifact.
                    artifacts[idx].parts.extend(update.artifact.parts.clone());
                } else {
                    // append=true but no existing artifact — ignore.
                    warn!(
                        task_id = %task_id,
                        artifact_id = %artifact_id,
                        "Received append=True for nonexistent artifact — ignoring chunk"
                    );
                }
            }
            StreamResponse::Task(updated_task) => {
                task = updated_task.clone();
            }
            StreamResponse::Message(msg) => {
                let history = task.history.get_or_insert_with(Vec::new);
                history.push(msg.clone());
            }
        }

        task_store.save(task).await
    }

    /// Check if a state is terminal.
    fn is_terminal(state: &TaskState) -> bool {
        matches!(
            state,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Rejected
        )
    }

    /// Trim task history to the requested length.
    ///
    /// - Only trims if `max_length` is `Some` AND > 0 AND history exists.
    /// - Keeps the most recent N messages (tail).
    fn trim_history(task: &mut Task, max_length: Option<usize>) {
        if let Some(max) = max_length {
            if max > 0 {
                if let Some(ref mut history) = task.history {
                    if history.len() > max {
                        let start = history.len() - max;
                        *history = history.split_off(start);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for DefaultRequestHandler {
    async fn on_message_send(&self, params: SendMessageParams) -> A2AResult<SendMessageResponse> {
        let task = self.get_or_create_task(&params).await?;
        let event_queue = self
            .spawn_executor(&task, &params.message, params.configuration.as_ref())
            .await?;
        let rx = event_queue.subscribe();

        // Consume events until a terminal state, AUTH_REQUIRED/INPUT_REQUIRED,
        // a bare Message, or the blocking-agent timeout.
        let history_length = params.configuration.as_ref().and_then(|c| c.history_length);
        match self.consume_events(&task.id, rx, true).await? {
            ConsumeOutcome::Task(mut final_task) => {
                Self::trim_history(&mut final_task, history_length);
                Ok(SendMessageResponse::Task(final_task))
            }
            ConsumeOutcome::Message(message) => Ok(SendMessageResponse::Message(message)),
        }
    }

    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        let task = self.get_or_create_task(&params).await?;
        let event_queue = self
            .spawn_executor(&task, &params.message, params.configuration.as_ref())
            .await?;
        let rx = event_queue.subscribe();

        // Spawn a background task to persist events as they arrive, mirror
        // them onto the replication bridge, and dispatch push notifications
        // and running-agent cleanup once the task reaches a final state.
        let task_id = task.id.clone();
        let task_store = Arc::clone(&self.task_store);
        let replication = self.replication.clone();
        let push_sender = self.push_sender.clone();
        let running_agents = Arc::clone(&self.running_agents);
        let queue_manager = Arc::clone(&self.queue_manager);

        // We need a separate subscription for persistence.
        let mut persist_rx = event_queue.subscribe();

        tokio::spawn(async move {
            loop {
                match persist_rx.recv().await {
                    Ok(StreamResponse::Message(msg)) => {
                        if let Some(ref replication) = replication {
                            let item = ReplicatedEventQueueItem::from_event(
                                &task_id,
                                StreamResponse::Message(msg),
                            );
                            if let Err(e) = replication.send(item).await {
                                warn!(task_id = %task_id, error = %e, "Replication send failed");
                            }
                        }
                        running_agents.lock().await.remove(&task_id);
                        let _ = queue_manager.close(&task_id).await;
                        break;
                    }
                    Ok(event) => {
                        if let Err(e) =
                            DefaultRequestHandler::apply_event_to_store(&task_store, &task_id, &event)
                                .await
                        {
                            warn!(task_id = %task_id, error = %e, "Failed to persist streamed event");
                        }

                        if let Some(ref replication) = replication {
                            let item = ReplicatedEventQueueItem::from_event(&task_id, event.clone());
                            if let Err(e) = replication.send(item).await {
                                warn!(task_id = %task_id, error = %e, "Replication send failed");
                            }
                        }

                        let task = match task_store.get(&task_id).await {
                            Ok(Some(task)) => task,
                            _ => continue,
                        };

                        if task.status.state.is_final() {
                            if let Some(ref sender) = push_sender {
                                let sender = Arc::clone(sender);
                                let task = task.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = sender.send_notification(&task).await {
                                        warn!(error = %e, "Push notification dispatch failed");
                                    }
                                });
                            }
                            if let Some(ref replication) = replication {
                                if let Err(e) = replication.publish_closed(&task_id).await {
                                    warn!(task_id = %task_id, error = %e, "Replication closure publish failed");
                                }
                            }
                            running_agents.lock().await.remove(&task_id);
                            let _ = queue_manager.close(&task_id).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        running_agents.lock().await.remove(&task_id);
                        let _ = queue_manager.close(&task_id).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(task_id = %task_id, missed = n, "Persist consumer lagged");
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn on_get_task(&self, params: GetTaskParams) -> A2AResult<Task> {
        let mut task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        Self::trim_history(&mut task, params.history_length);
        Ok(task)
    }

    async fn on_list_tasks(&self, params: TaskListParams) -> A2AResult<TaskListResponse> {
        self.task_store.list(&params).await
    }

    async fn on_cancel_task(&self, params: CancelTaskParams) -> A2AResult<Task> {
        // Look up the task.
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        // Can't cancel a terminal task.
        if Self::is_terminal(&task.status.state) {
            return Err(A2AError::TaskNotCancelable {
                message: format!(
                    "Task cannot be canceled - current state: {}",
                    task.status.state
                ),
                data: None,
            });
        }

        // Get or create event queue for this task.
        let event_queue = {
            let running = self.running_agents.lock().await;
            if let Some(agent) = running.get(&params.id) {
                agent.event_queue.clone()
            } else {
                // No running agent — create a temporary queue.
                EventQueue::with_default_capacity()
            }
        };

        let rx = event_queue.subscribe();

        // Call the executor's cancel method; no message accompanies a
        // cancel request.
        let context = RequestContext {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            message: None,
            task: Some(task.clone()),
            configuration: None,
            related_tasks: Vec::new(),
            metadata: params.metadata,
            call_context: None,
        };

        self.executor.cancel(context, event_queue.clone()).await?;

        // Cancel the ongoing producer task, if one exists.
        {
            let running = self.running_agents.lock().await;
            if let Some(agent) = running.get(&params.id) {
                agent.handle.abort();
            }
        }

        // Consume events until terminal, bounded by the cancel timeout so a
        // misbehaving executor can't hang the RPC indefinitely.
        let final_task = match tokio::time::timeout(
            self.cancel_timeout,
            self.consume_until_terminal(&task.id, rx),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(A2AError::InternalError {
                    message: format!(
                        "Cancel of task {} timed out after {:?}",
                        task.id, self.cancel_timeout
                    ),
                    data: None,
                });
            }
        };

        // Validate the cancel result: if the state isn't Canceled after
        // the executor's cancel() returns, report TaskNotCancelable.
        if final_task.status.state != TaskState::Canceled {
            return Err(A2AError::TaskNotCancelable {
                message: format!(
                    "Task cannot be canceled - current state: {}",
                    final_task.status.state
                ),
                data: None,
            });
        }

        Ok(final_task)
    }

    async fn on_subscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        // Verify the task exists.
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        // If the task is already terminal, return an error.
        if Self::is_terminal(&task.status.state) {
            return Err(A2AError::InvalidParams {
                message: format!(
                    "Task {} is in terminal state {:?} — cannot subscribe",
                    params.id, task.status.state
                ),
                data: None,
            });
        }

        // Tap the task's main queue, whether it's backed by an executor
        // running on this node or fed purely by inbound replicated events
        // for a task running elsewhere — `queue_manager` tracks both the
        // same way.
        match self.queue_manager.tap(&params.id).await {
            Some(tap) => Ok(tap.subscribe()),
            None => Err(A2AError::TaskNotFound {
                message: format!(
                    "Task {} has no active agent execution — cannot subscribe",
                    params.id
                ),
                data: None,
            }),
        }
    }

    async fn on_resubscribe_to_task(
        &self,
        params: SubscribeToTaskParams,
    ) -> A2AResult<broadcast::Receiver<StreamResponse>> {
        // Verify the task exists.
        let task =
            self.task_store
                .get(&params.id)
                .await?
                .ok_or_else(|| A2AError::TaskNotFound {
                    message: params.id.clone(),
                    data: None,
                })?;

        // If the task is already terminal, return an error.
        if Self::is_terminal(&task.status.state) {
            return Err(A2AError::InvalidParams {
                message: format!(
                    "Task {} is in terminal state: {}",
                    params.id, task.status.state
                ),
                data: None,
            });
        }

        // Tap the task's main queue (local executor or replicated feed).
        match self.queue_manager.tap(&params.id).await {
            Some(tap) => Ok(tap.subscribe()),
            None => Err(A2AError::TaskNotFound {
                message: format!("Task {} has no active agent execution", params.id),
                data: None,
            }),
        }
    }

    async fn on_set_task_push_notification_config(
        &self,
        params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        let Some(ref store) = self.push_config_store else {
            return Err(A2AError::UnsupportedOperation {
                message: "Push notification config is not supported".to_string(),
                data: None,
            });
        };

        let config: TaskPushNotificationConfig =
            serde_json::from_value(params).map_err(|e| A2AError::InvalidParams {
                message: format!("Invalid push notification config: {e}"),
                data: None,
            })?;

        // The config must name an existing task.
        self.task_store
            .get(&config.task_id)
            .await?
            .ok_or_else(|| A2AError::TaskNotFound {
                message: config.task_id.clone(),
                data: None,
            })?;

        let stored = store.set(config).await?;
        serde_json::to_value(stored).map_err(|e| A2AError::InternalError {
            message: format!("Failed to serialize push notification config: {e}"),
            data: None,
        })
    }

    async fn on_get_task_push_notification_config(
        &self,
        params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct GetParams {
            id: String,
            push_notification_config_id: Option<String>,
        }

        let Some(ref store) = self.push_config_store else {
            return Err(A2AError::UnsupportedOperation {
                message: "Push notification config is not supported".to_string(),
                data: None,
            });
        };

        let params: GetParams =
            serde_json::from_value(params).map_err(|e| A2AError::InvalidParams {
                message: format!("Invalid get push notification config params: {e}"),
                data: None,
            })?;

        let config = store
            .get(&params.id, params.push_notification_config_id.as_deref())
            .await?
            .ok_or_else(|| A2AError::InvalidParams {
                message: format!("No push notification config registered for task {}", params.id),
                data: None,
            })?;

        serde_json::to_value(config).map_err(|e| A2AError::InternalError {
            message: format!("Failed to serialize push notification config: {e}"),
            data: None,
        })
    }

    async fn on_list_task_push_notification_config(
        &self,
        params: serde_json::Value,
    ) -> A2AResult<serde_json::Value> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListParams {
            id: String,
        }

        let Some(ref store) = self.push_config_store else {
            return Err(A2AError::UnsupportedOperation {
                message: "Push notification config is not supported".to_string(),
                data: None,
            });
        };

        let params: ListParams =
            serde_json::from_value(params).map_err(|e| A2AError::InvalidParams {
                message: format!("Invalid list push notification config params: {e}"),
                data: None,
            })?;

        let configs = store.list(&params.id).await?;
        serde_json::to_value(configs).map_err(|e| A2AError::InternalError {
            message: format!("Failed to serialize push notification configs: {e}"),
            data: None,
        })
    }

    async fn on_delete_task_push_notification_config(
        &self,
        params: serde_json::Value,
    ) -> A2AResult<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DeleteParams {
            id: String,
            push_notification_config_id: String,
        }

        let Some(ref store) = self.push_config_store else {
            return Err(A2AError::UnsupportedOperation {
                message: "Push notification config is not supported".to_string(),
                data: None,
            });
        };

        let params: DeleteParams =
            serde_json::from_value(params).map_err(|e| A2AError::InvalidParams {
                message: format!("Invalid delete push notification config params: {e}"),
                data: None,
            })?;

        store
            .delete(&params.id, &params.push_notification_config_id)
            .await
    }
}

//! Task store — persistence layer for A2A tasks.
//!
//! The task store is responsible for persisting and retrieving [`Task`] objects.
//! The [`InMemoryTaskStore`] is provided for development and testing; production
//! deployments should implement the [`TaskStore`] trait backed by a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::A2AResult;
use crate::types::{Task, TaskState};

/// Parameters for listing tasks with optional filtering and pagination.
#[derive(Debug, Clone, Default)]
pub struct TaskListParams {
    /// Filter tasks by context ID.
    pub context_id: Option<String>,

    /// Filter tasks by state.
    pub status: Option<Vec<TaskState>>,

    /// Only include tasks whose `status.timestamp` is strictly after this
    /// RFC3339 timestamp.
    pub status_timestamp_after: Option<String>,

    /// Maximum number of tasks to return per page.
    pub page_size: Option<usize>,

    /// Opaque keyset token for pagination — everything up to and including
    /// the task it names has already been returned.
    pub page_token: Option<String>,

    /// If set, each returned task's `history` is trimmed to the most recent
    /// N messages.
    pub history_length: Option<usize>,

    /// If `false`, strips `artifacts` from each returned task. Defaults to
    /// `true` (artifacts included).
    pub include_artifacts: Option<bool>,
}

/// Response for a task listing request.
#[derive(Debug, Clone)]
pub struct TaskListResponse {
    /// The tasks matching the query.
    pub tasks: Vec<Task>,

    /// Token for the next page, if more results are available.
    pub next_page_token: Option<String>,

    /// Total count of tasks matching the filter (ignoring pagination),
    /// when the backend can compute it cheaply.
    pub total_count: Option<usize>,
}

/// Trait for persisting and retrieving A2A tasks.
///
/// Implementations must be `Send + Sync` for use in async server contexts.
/// All methods take `&self` and use interior mutability for thread safety.
///
/// # Provided implementations
///
/// - [`InMemoryTaskStore`] — simple in-memory store (data lost on restart)
/// - [`crate::server::file_task_store::FileTaskStore`] — one JSON file per task
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Save or update a task in the store.
    ///
    /// If a task with the same ID already exists, it is overwritten.
    ///
    /// `is_replicated` marks a save that originated from the replication
    /// bridge: implementations that also publish a "task finalized"
    /// signal on save should suppress that publication in this case to
    /// avoid an echo loop back through the replication bus. The in-memory
    /// and file-backed reference stores have no such signal and ignore it.
    async fn save(&self, task: Task) -> A2AResult<()> {
        self.save_with_origin(task, false).await
    }

    /// Save a task, indicating whether it arrived via replication.
    ///
    /// Implementations that need the distinction should override this
    /// method; [`save`](Self::save) forwards to it with `is_replicated = false`.
    async fn save_with_origin(&self, task: Task, is_replicated: bool) -> A2AResult<()> {
        let _ = is_replicated;
        self.save(task).await
    }

    /// Retrieve a task by its ID.
    ///
    /// Returns `None` if the task does not exist.
    async fn get(&self, task_id: &str) -> A2AResult<Option<Task>>;

    /// Delete a task by its ID.
    ///
    /// Silently succeeds if the task does not exist.
    async fn delete(&self, task_id: &str) -> A2AResult<()>;

    /// List tasks matching the given parameters.
    ///
    /// Applies `{context_id, status, status_timestamp_after}` filters, then
    /// orders by `(status.timestamp desc, id asc)` and paginates with the
    /// opaque keyset token described on [`TaskListParams::page_token`].
    async fn list(&self, params: &TaskListParams) -> A2AResult<TaskListResponse>;
}

/// Extends [`TaskStore`] with the "is this task still live" queries the
/// event queue system needs to decide whether a `tap()` against an
/// already-closed main queue should succeed.
///
/// Blanket-implemented for every `TaskStore` so callers never need a
/// separate object.
#[async_trait]
pub trait TaskStateProvider: TaskStore {
    /// Returns `true` if the task exists and has not reached a final state.
    async fn is_task_active(&self, task_id: &str) -> A2AResult<bool> {
        Ok(match self.get(task_id).await? {
            Some(task) => !task.status.state.is_final(),
            None => false,
        })
    }

    /// Returns `true` if the task exists and has reached a final state.
    async fn is_task_finalized(&self, task_id: &str) -> A2AResult<bool> {
        Ok(match self.get(task_id).await? {
            Some(task) => task.status.state.is_final(),
            None => false,
        })
    }
}

impl<T: TaskStore + ?Sized> TaskStateProvider for T {}

/// Parse a task's sort key for keyset pagination: `(millis-since-epoch, id)`,
/// ordered so that `(timestamp desc, id asc)` falls out of a plain
/// lexicographic comparison on `(Reverse(millis), id)`.
///
/// Tasks with a missing or unparseable timestamp sort as millis = 0 (the
/// oldest possible), which keeps pagination deterministic instead of
/// panicking on malformed data.
fn sort_key(task: &Task) -> (i64, &str) {
    let millis = task
        .status
        .timestamp
        .as_deref()
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0);
    (millis, task.id.as_str())
}

/// Render a task's pagination token as `"millis:id"`.
fn token_for(task: &Task) -> String {
    let (millis, id) = sort_key(task);
    format!("{millis}:{id}")
}

/// Parse a `"millis:id"` token back into its components.
///
/// The millis prefix is numeric and the id never contains `:` in either
/// reference store (UUIDs), so splitting on the first `:` is unambiguous.
fn parse_token(token: &str) -> Option<(i64, &str)> {
    let (millis_str, id) = token.split_once(':')?;
    let millis = millis_str.parse::<i64>().ok()?;
    Some((millis, id))
}

/// Shared pagination logic used by both reference [`TaskStore`] implementations.
///
/// Applies filters, sorts by `(status.timestamp desc, id asc)`, and slices
/// out the page starting strictly after `params.page_token` under that sort
/// order. `historyLength`/`includeArtifacts` are applied to the returned
/// tasks only — they never affect filtering or ordering.
pub(crate) fn paginate_tasks(mut tasks: Vec<Task>, params: &TaskListParams) -> TaskListResponse {
    if let Some(ref ctx_id) = params.context_id {
        tasks.retain(|t| &t.context_id == ctx_id);
    }
    if let Some(ref statuses) = params.status {
        tasks.retain(|t| statuses.contains(&t.status.state));
    }
    if let Some(ref after) = params.status_timestamp_after {
        if let Ok(after_dt) = chrono::DateTime::parse_from_rfc3339(after) {
            tasks.retain(|t| {
                t.status
                    .timestamp
                    .as_deref()
                    .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                    .is_some_and(|dt| dt > after_dt)
            });
        }
    }

    let total_count = tasks.len();

    // (timestamp desc, id asc): reverse-order the millis comparison, then
    // break ties ascending on id.
    tasks.sort_by(|a, b| {
        let (a_millis, a_id) = sort_key(a);
        let (b_millis, b_id) = sort_key(b);
        b_millis.cmp(&a_millis).then_with(|| a_id.cmp(b_id))
    });

    // `tasks` is already sorted in traversal order (timestamp desc, id asc).
    // The next page starts at the first element that sorts strictly after
    // the token under that same order — `partition_point` finds the count
    // of elements at-or-before the token, which is exactly that index.
    let start_idx = match params.page_token {
        Some(ref token) => match parse_token(token) {
            Some((tok_millis, tok_id)) => tasks.partition_point(|t| {
                let (millis, id) = sort_key(t);
                tok_millis.cmp(&millis).then_with(|| id.cmp(tok_id))
                    != std::cmp::Ordering::Greater
            }),
            None => {
                warn!(page_token = %token, "Invalid page token, starting from beginning");
                0
            }
        },
        None => 0,
    };

    let page_size = params.page_size.unwrap_or(usize::MAX);
    let mut page: Vec<Task> = tasks
        .into_iter()
        .skip(start_idx)
        .take(page_size)
        .collect();

    let next_page_token = if page.len() == page_size && !page.is_empty() {
        Some(token_for(page.last().unwrap()))
    } else {
        None
    };

    for task in &mut page {
        if let Some(max) = params.history_length {
            if let Some(ref mut history) = task.history {
                if history.len() > max {
                    let start = history.len() - max;
                    *history = history.split_off(start);
                }
            }
        }
        if params.include_artifacts == Some(false) {
            task.artifacts = None;
        }
    }

    TaskListResponse {
        tasks: page,
        next_page_token,
        total_count: Some(total_count),
    }
}

/// In-memory task store backed by a `HashMap`.
///
/// Suitable for development, testing, and short-lived server instances.
/// All task data is lost when the process exits.
///
/// Thread-safe via `tokio::sync::RwLock`.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskStore {
    /// Create a new empty in-memory task store.
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_with_origin(&self, task: Task, is_replicated: bool) -> A2AResult<()> {
        let task_id = task.id.clone();
        let mut tasks = self.tasks.write().await;
        let is_new = !tasks.contains_key(&task_id);
        tasks.insert(task_id.clone(), task);

        debug!(
            task_id = %task_id,
            is_new = is_new,
            is_replicated = is_replicated,
            "Task saved"
        );
        Ok(())
    }

    async fn get(&self, task_id: &str) -> A2AResult<Option<Task>> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(task_id).cloned();
        debug!(task_id = %task_id, found = task.is_some(), "Task lookup");
        Ok(task)
    }

    async fn delete(&self, task_id: &str) -> A2AResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.remove(task_id).is_some() {
            debug!(task_id = %task_id, "Task deleted");
        } else {
            warn!(task_id = %task_id, "Attempted to delete non-existent task");
        }
        Ok(())
    }

    async fn list(&self, params: &TaskListParams) -> A2AResult<TaskListResponse> {
        let tasks = self.tasks.read().await;
        let snapshot: Vec<Task> = tasks.values().cloned().collect();
        let response = paginate_tasks(snapshot, params);
        debug!(
            count = response.tasks.len(),
            has_more = response.next_page_token.is_some(),
            "Listed tasks"
        );
        Ok(response)
    }
}

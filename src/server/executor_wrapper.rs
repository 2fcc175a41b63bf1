//! Executor wrapper extensions — decorators over [`AgentExecutor`].
//!
//! A wrapper substitutes a fresh intermediate [`EventQueue`] for the wrapped
//! executor, relays each event the inner executor publishes through a
//! rewrite function, and forwards the rewritten event to the real queue.
//! Wrappers activate per-request: if the caller didn't request (or
//! pre-activate) the wrapper's extension URI, the inner executor runs
//! unmodified against the original queue — no relay overhead.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::A2AResult;
use crate::types::{StreamResponse, TaskState};

use super::agent_executor::{AgentExecutor, RequestContext};
use super::event_queue::EventQueue;

/// A decorator over [`AgentExecutor`] that rewrites events in flight.
///
/// Only active for requests that asked for (or already activated)
/// `extension_uri`; otherwise the inner executor runs directly against
/// the caller's queue.
pub struct RewritingExecutorWrapper {
    inner: Arc<dyn AgentExecutor>,
    extension_uri: String,
    rewrite: Arc<dyn Fn(StreamResponse) -> StreamResponse + Send + Sync>,
}

impl RewritingExecutorWrapper {
    /// Wrap `inner`, activating only when `extension_uri` is requested or
    /// pre-activated for the request, and rewriting every relayed event
    /// with `rewrite`.
    pub fn new(
        inner: Arc<dyn AgentExecutor>,
        extension_uri: impl Into<String>,
        rewrite: impl Fn(StreamResponse) -> StreamResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            extension_uri: extension_uri.into(),
            rewrite: Arc::new(rewrite),
        }
    }

    /// The extension URI this wrapper activates on.
    pub fn extension_uri(&self) -> &str {
        &self.extension_uri
    }

    fn is_active(&self, context: &RequestContext) -> bool {
        if context.requested_extensions().contains(&self.extension_uri) {
            return true;
        }
        context
            .call_context
            .as_ref()
            .map(|c| c.activated_extensions.contains(&self.extension_uri))
            .unwrap_or(false)
    }

    /// Same terminal-event detection `EventConsumer` uses: a `Message`,
    /// any status update flagged `final`, or a `Task` already in a final
    /// or input-required state.
    fn is_final_event(event: &StreamResponse) -> bool {
        match event {
            StreamResponse::StatusUpdate(update) => update.r#final,
            StreamResponse::Message(_) => true,
            StreamResponse::Task(task) => {
                task.status.state.is_final() || task.status.state == TaskState::InputRequired
            }
            StreamResponse::ArtifactUpdate(_) => false,
        }
    }

    async fn relay(
        &self,
        context: RequestContext,
        event_queue: EventQueue,
    ) -> A2AResult<()> {
        let inner_queue = EventQueue::with_default_capacity();
        let mut rx = inner_queue.subscribe();

        let mut exec_fut: Pin<Box<dyn Future<Output = A2AResult<()>> + Send>> =
            Box::pin(self.inner.execute(context, inner_queue));

        loop {
            tokio::select! {
                biased;

                event = rx.recv() => {
                    match event {
                        Ok(event) => {
                            let is_final = Self::is_final_event(&event);
                            event_queue.publish((self.rewrite)(event))?;
                            if is_final {
                                break exec_fut.await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "Executor wrapper relay lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break exec_fut.await,
                    }
                }
                result = &mut exec_fut => {
                    break result;
                }
            }
        }
    }
}

#[async_trait]
impl AgentExecutor for RewritingExecutorWrapper {
    async fn execute(&self, mut context: RequestContext, event_queue: EventQueue) -> A2AResult<()> {
        if !self.is_active(&context) {
            return self.inner.execute(context, event_queue).await;
        }

        context.add_activated_extension(self.extension_uri.clone());
        debug!(extension_uri = %self.extension_uri, task_id = %context.task_id, "Executor wrapper activated");
        self.relay(context, event_queue).await
    }

    async fn cancel(&self, mut context: RequestContext, event_queue: EventQueue) -> A2AResult<()> {
        if !self.is_active(&context) {
            return self.inner.cancel(context, event_queue).await;
        }

        context.add_activated_extension(self.extension_uri.clone());
        self.relay_cancel(context, event_queue).await
    }
}

impl RewritingExecutorWrapper {
    async fn relay_cancel(
        &self,
        context: RequestContext,
        event_queue: EventQueue,
    ) -> A2AResult<()> {
        let inner_queue = EventQueue::with_default_capacity();
        let mut rx = inner_queue.subscribe();

        let mut exec_fut: Pin<Box<dyn Future<Output = A2AResult<()>> + Send>> =
            Box::pin(self.inner.cancel(context, inner_queue));

        loop {
            tokio::select! {
                biased;

                event = rx.recv() => {
                    match event {
                        Ok(event) => {
                            let is_final = Self::is_final_event(&event);
                            event_queue.publish((self.rewrite)(event))?;
                            if is_final {
                                break exec_fut.await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "Executor wrapper cancel relay lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break exec_fut.await,
                    }
                }
                result = &mut exec_fut => {
                    break result;
                }
            }
        }
    }
}

/// A generalized trait for building custom executor decorators.
///
/// Most wrappers can use [`RewritingExecutorWrapper`] directly; implement
/// this trait when the wrapper needs state beyond a pure rewrite function
/// (e.g. buffering artifacts across events before forwarding them).
pub trait ExecutorWrapper: AgentExecutor {
    /// The extension URI this wrapper activates on.
    fn extension_uri(&self) -> &str;
}

impl ExecutorWrapper for RewritingExecutorWrapper {
    fn extension_uri(&self) -> &str {
        &self.extension_uri
    }
}

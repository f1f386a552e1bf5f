// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution contexts: the client-side handles correlating a running
//! workflow or activity invocation with its remote counterpart.
//!
//! A workflow context owns nested registries for the children,
//! activities, and queues it launches, each keyed by a per-context
//! monotonically increasing ID. Two workflow executions may reuse the
//! same small integers concurrently without collision because lookups
//! are always `(context_id, local_id)` pairs. The context's own workflow
//! logic and the connection's read loop both mutate these registries;
//! both paths go through the registry's lock, and no lock is held across
//! a suspension point.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as TokioMutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_protocol::envelope::keys;
use weft_protocol::{Envelope, IdGenerator, MessageKind};

use crate::error::{BridgeError, RemoteError, Result};
use crate::registry::EntityRegistry;
use crate::replay::{RecordedKind, RecordedResult, ReplayCursor};
use crate::slot::CompletionSlot;

/// Outcome of a nested activity or child-workflow execution.
pub type Outcome = std::result::Result<Bytes, RemoteError>;

/// Where a workflow context is in its lifecycle.
///
/// `Created -> Running -> Completing -> Closed`, with `Closed` reachable
/// from any state (disposal). Invalid transitions are rejected, never
/// silently ignored — silently losing a child registration would orphan
/// the child with no way to signal it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Context ID assigned and registered; no nested entities yet.
    Created,
    /// Workflow code is executing and may issue further requests.
    Running,
    /// The result has been computed locally but the proxy has not yet
    /// acknowledged it; new side effects are suppressed.
    Completing,
    /// Terminal. All nested waiters have been resolved with
    /// `ContextClosed`.
    Closed,
}

/// Seam between context-level operations and the request dispatcher.
///
/// The production implementation submits through the connection's
/// correlator; tests substitute an in-memory recorder.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Send a correlated request and await its reply.
    async fn submit(&self, envelope: Envelope) -> Result<Envelope>;

    /// Send a fire-and-forget notification.
    async fn notify(&self, envelope: Envelope) -> Result<()>;
}

// ---------------------------------------------------------------------
// Activity contexts
// ---------------------------------------------------------------------

/// One in-flight activity invocation pushed to us by the proxy.
pub struct ActivityContext {
    context_id: i64,
    activity_name: String,
    sink: Arc<dyn CommandSink>,
}

impl ActivityContext {
    pub fn new(context_id: i64, activity_name: impl Into<String>, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            context_id,
            activity_name: activity_name.into(),
            sink,
        }
    }

    pub fn context_id(&self) -> i64 {
        self.context_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Report liveness/progress for a long-running activity.
    pub async fn record_heartbeat(&self, details: impl Into<Bytes>) -> Result<()> {
        let envelope = Envelope::new(MessageKind::ActivityRecordHeartbeat)
            .with_i64(keys::CONTEXT_ID, self.context_id)
            .with_str(keys::ACTIVITY_NAME, self.activity_name.clone())
            .with_payload(details);
        self.sink.submit(envelope).await.map(|_| ())
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("context_id", &self.context_id)
            .field("activity_name", &self.activity_name)
            .finish()
    }
}

// ---------------------------------------------------------------------
// Workflow queues
// ---------------------------------------------------------------------

/// FIFO byte-message channel owned by a workflow context.
#[derive(Debug)]
pub struct WorkflowQueue {
    tx: mpsc::Sender<Bytes>,
    rx: TokioMutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
}

impl WorkflowQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: TokioMutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Append a message. Returns `false` once the queue is closed.
    pub async fn write(&self, data: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            sent = self.tx.send(data) => sent.is_ok(),
        }
    }

    /// Await the next message; `None` once the queue is closed.
    pub async fn read(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            message = rx.recv() => message,
        }
    }

    /// Non-blocking read of an already-buffered message.
    pub fn try_read(&self) -> Option<Bytes> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Caller-facing handle for a context queue.
#[derive(Clone, Debug)]
pub struct QueueHandle {
    context: WorkflowContext,
    queue_id: i64,
    queue: Arc<WorkflowQueue>,
}

impl QueueHandle {
    pub fn queue_id(&self) -> i64 {
        self.queue_id
    }

    /// Append a message. Outside replay the write is also reported to
    /// the proxy so it lands in history; during replay the recorded
    /// write is consumed instead and only the local queue is touched.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let inner = &self.context.inner;
        self.context.ensure_can_issue()?;

        if inner.replay.is_replaying() {
            inner.replay.take(RecordedKind::Queue, self.queue_id)??;
        } else {
            let envelope = Envelope::new(MessageKind::QueueWrite)
                .with_i64(keys::CONTEXT_ID, inner.context_id)
                .with_i64(keys::QUEUE_ID, self.queue_id)
                .with_payload(data.clone());
            inner.sink.submit(envelope).await?;
        }

        if self.queue.write(data).await {
            Ok(())
        } else {
            Err(BridgeError::ContextClosed {
                context_id: inner.context_id,
            })
        }
    }

    /// Await the next message; fails with `ContextClosed` once the
    /// owning context (or this queue) has been torn down.
    pub async fn read(&self) -> Result<Bytes> {
        self.queue
            .read()
            .await
            .ok_or(BridgeError::ContextClosed {
                context_id: self.context.inner.context_id,
            })
    }

    pub fn try_read(&self) -> Option<Bytes> {
        self.queue.try_read()
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

// ---------------------------------------------------------------------
// Pending nested executions
// ---------------------------------------------------------------------

/// Future result of an activity scheduled by a workflow context.
#[derive(Debug)]
pub struct PendingActivity {
    context_id: i64,
    activity_id: i64,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingActivity {
    pub fn activity_id(&self) -> i64 {
        self.activity_id
    }

    /// Suspend until the activity completes. A remote failure surfaces
    /// as `BridgeError::Remote`; context teardown as `ContextClosed`.
    pub async fn await_result(self) -> Result<Bytes> {
        match self.rx.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(remote)) => Err(BridgeError::Remote(remote)),
            Err(_) => Err(BridgeError::ContextClosed {
                context_id: self.context_id,
            }),
        }
    }
}

/// Future result of a child workflow started by a workflow context.
#[derive(Debug)]
pub struct PendingChild {
    context_id: i64,
    child_id: i64,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingChild {
    pub fn child_id(&self) -> i64 {
        self.child_id
    }

    pub async fn await_result(self) -> Result<Bytes> {
        match self.rx.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(remote)) => Err(BridgeError::Remote(remote)),
            Err(_) => Err(BridgeError::ContextClosed {
                context_id: self.context_id,
            }),
        }
    }
}

fn resolved_outcome(outcome: Outcome) -> oneshot::Receiver<Outcome> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(outcome);
    rx
}

// ---------------------------------------------------------------------
// Workflow contexts
// ---------------------------------------------------------------------

struct WorkflowContextInner {
    context_id: i64,
    workflow_name: String,
    state: StdMutex<ContextState>,
    cancel_handler: StdMutex<Option<Box<dyn Fn() + Send + Sync>>>,
    children: EntityRegistry<i64, Arc<CompletionSlot<Outcome>>>,
    activities: EntityRegistry<i64, Arc<CompletionSlot<Outcome>>>,
    queues: EntityRegistry<i64, Arc<WorkflowQueue>>,
    child_ids: IdGenerator,
    activity_ids: IdGenerator,
    queue_ids: IdGenerator,
    replay: ReplayCursor,
    sink: Arc<dyn CommandSink>,
}

/// One in-flight workflow invocation. Cheap to clone; all clones share
/// the same state.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<WorkflowContextInner>,
}

impl WorkflowContext {
    pub fn new(
        context_id: i64,
        workflow_name: impl Into<String>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkflowContextInner {
                context_id,
                workflow_name: workflow_name.into(),
                state: StdMutex::new(ContextState::Created),
                cancel_handler: StdMutex::new(None),
                children: EntityRegistry::new(),
                activities: EntityRegistry::new(),
                queues: EntityRegistry::new(),
                child_ids: IdGenerator::new(),
                activity_ids: IdGenerator::new(),
                queue_ids: IdGenerator::new(),
                replay: ReplayCursor::new(),
                sink,
            }),
        }
    }

    pub fn context_id(&self) -> i64 {
        self.inner.context_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.workflow_name
    }

    pub fn state(&self) -> ContextState {
        *self.inner.state.lock().expect("context state poisoned")
    }

    pub fn is_replaying(&self) -> bool {
        self.inner.replay.is_replaying()
    }

    /// Load recorded history before the workflow body runs.
    pub fn load_replay_history(&self, history: Vec<RecordedResult>) {
        self.inner.replay.load(history);
    }

    // ---- state machine ----

    fn transition(&self, from: ContextState, to: ContextState) -> Result<()> {
        let mut state = self.inner.state.lock().expect("context state poisoned");
        if *state != from {
            return Err(BridgeError::InvalidTransition { from: *state, to });
        }
        *state = to;
        Ok(())
    }

    /// `Created -> Running`; the workflow body is about to execute.
    pub fn mark_running(&self) -> Result<()> {
        self.transition(ContextState::Created, ContextState::Running)
    }

    /// `Running -> Completing`; the result is computed locally but the
    /// proxy has not yet acknowledged it.
    pub fn begin_completing(&self) -> Result<()> {
        self.transition(ContextState::Running, ContextState::Completing)
    }

    /// Terminal transition, reachable from any state and idempotent.
    ///
    /// Every pending nested waiter resolves with `ContextClosed`; all
    /// queues close so blocked readers wake.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("context state poisoned");
            if *state == ContextState::Closed {
                return;
            }
            *state = ContextState::Closed;
        }

        // Dropping the completion slots wakes their waiters with
        // ContextClosed.
        let activities = self.inner.activities.drain();
        let children = self.inner.children.drain();
        let queues = self.inner.queues.drain();
        for (_, queue) in &queues {
            queue.close();
        }

        debug!(
            context_id = self.inner.context_id,
            workflow = %self.inner.workflow_name,
            activities = activities.len(),
            children = children.len(),
            queues = queues.len(),
            "workflow context closed"
        );
    }

    /// Reject operations on a context that cannot issue new work:
    /// closed contexts are stale handles, completing contexts must not
    /// produce new side effects, and a context that has not started
    /// running yet has no workflow body to issue from.
    fn ensure_can_issue(&self) -> Result<()> {
        match self.state() {
            ContextState::Running => Ok(()),
            ContextState::Closed => Err(BridgeError::ContextClosed {
                context_id: self.inner.context_id,
            }),
            ContextState::Completing => Err(BridgeError::Rejected(
                "workflow result is awaiting acknowledgement; new side effects are suppressed"
                    .into(),
            )),
            ContextState::Created => {
                Err(BridgeError::Rejected("workflow context is not running yet".into()))
            }
        }
    }

    // ---- cancellation ----

    /// Install the callback that cancels this workflow's local
    /// execution (fired when the proxy requests cancellation).
    pub fn set_cancel_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        let mut slot = self
            .inner
            .cancel_handler
            .lock()
            .expect("cancel handler poisoned");
        *slot = Some(Box::new(handler));
    }

    /// Fire the installed cancel callback. Returns `false` if none was
    /// installed.
    pub fn fire_cancel_handler(&self) -> bool {
        let slot = self
            .inner
            .cancel_handler
            .lock()
            .expect("cancel handler poisoned");
        match slot.as_ref() {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    /// Ask the proxy to cancel the remote workflow execution. This is
    /// itself a correlated request with its own request ID.
    pub async fn request_cancel(&self) -> Result<()> {
        if self.state() == ContextState::Closed {
            return Err(BridgeError::ContextClosed {
                context_id: self.inner.context_id,
            });
        }
        let envelope = Envelope::new(MessageKind::WorkflowCancel)
            .with_i64(keys::CONTEXT_ID, self.inner.context_id);
        self.inner.sink.submit(envelope).await.map(|_| ())
    }

    // ---- nested executions ----

    /// Schedule an activity on behalf of this workflow. The returned
    /// handle resolves when the proxy reports completion.
    pub async fn schedule_activity(
        &self,
        activity_name: &str,
        args: impl Into<Bytes>,
    ) -> Result<PendingActivity> {
        self.ensure_can_issue()?;
        let activity_id = self.inner.activity_ids.next();

        if self.inner.replay.is_replaying() {
            let outcome = self.inner.replay.take(RecordedKind::Activity, activity_id)?;
            return Ok(PendingActivity {
                context_id: self.inner.context_id,
                activity_id,
                rx: resolved_outcome(outcome),
            });
        }

        let (slot, rx) = CompletionSlot::new();
        self.inner.activities.add(activity_id, slot);

        let envelope = Envelope::new(MessageKind::ActivityExecute)
            .with_i64(keys::CONTEXT_ID, self.inner.context_id)
            .with_i64(keys::ACTIVITY_ID, activity_id)
            .with_str(keys::ACTIVITY_NAME, activity_name)
            .with_payload(args.into());
        if let Err(e) = self.inner.sink.submit(envelope).await {
            self.inner.activities.remove(&activity_id);
            return Err(e);
        }

        Ok(PendingActivity {
            context_id: self.inner.context_id,
            activity_id,
            rx,
        })
    }

    /// Start a child workflow on behalf of this workflow.
    pub async fn start_child(
        &self,
        workflow_name: &str,
        args: impl Into<Bytes>,
    ) -> Result<PendingChild> {
        self.ensure_can_issue()?;
        let child_id = self.inner.child_ids.next();

        if self.inner.replay.is_replaying() {
            let outcome = self.inner.replay.take(RecordedKind::Child, child_id)?;
            return Ok(PendingChild {
                context_id: self.inner.context_id,
                child_id,
                rx: resolved_outcome(outcome),
            });
        }

        let (slot, rx) = CompletionSlot::new();
        self.inner.children.add(child_id, slot);

        let envelope = Envelope::new(MessageKind::ChildWorkflowStart)
            .with_i64(keys::CONTEXT_ID, self.inner.context_id)
            .with_i64(keys::CHILD_ID, child_id)
            .with_str(keys::WORKFLOW_NAME, workflow_name)
            .with_payload(args.into());
        if let Err(e) = self.inner.sink.submit(envelope).await {
            self.inner.children.remove(&child_id);
            return Err(e);
        }

        Ok(PendingChild {
            context_id: self.inner.context_id,
            child_id,
            rx,
        })
    }

    /// Create a FIFO queue scoped to this context. Outside replay the
    /// proxy is told about the queue so signals can be routed to it.
    pub async fn new_queue(&self, capacity: usize) -> Result<QueueHandle> {
        self.ensure_can_issue()?;
        let queue_id = self.inner.queue_ids.next();

        if !self.inner.replay.is_replaying() {
            let envelope = Envelope::new(MessageKind::QueueNew)
                .with_i64(keys::CONTEXT_ID, self.inner.context_id)
                .with_i64(keys::QUEUE_ID, queue_id)
                .with_i64(keys::CAPACITY, capacity as i64);
            self.inner.sink.submit(envelope).await?;
        }

        let queue = Arc::new(WorkflowQueue::new(capacity));
        self.inner.queues.add(queue_id, queue.clone());

        Ok(QueueHandle {
            context: self.clone(),
            queue_id,
            queue,
        })
    }

    // ---- read-loop delivery paths ----

    /// Resolve a pending activity with its outcome. A missing entry is
    /// an expected race between completion and cleanup, reported to the
    /// caller but never an error.
    pub fn complete_activity(&self, activity_id: i64, outcome: Outcome) -> bool {
        match self.inner.activities.remove(&activity_id) {
            Some(slot) => slot.complete(outcome),
            None => {
                debug!(
                    context_id = self.inner.context_id,
                    activity_id, "completion for unknown activity (already removed)"
                );
                false
            }
        }
    }

    /// Resolve a pending child workflow with its outcome.
    pub fn complete_child(&self, child_id: i64, outcome: Outcome) -> bool {
        match self.inner.children.remove(&child_id) {
            Some(slot) => slot.complete(outcome),
            None => {
                debug!(
                    context_id = self.inner.context_id,
                    child_id, "completion for unknown child (already removed)"
                );
                false
            }
        }
    }

    /// Deliver a signal payload into one of this context's queues.
    pub async fn push_signal(&self, queue_id: i64, data: Bytes) -> bool {
        match self.inner.queues.get(&queue_id) {
            Some(queue) => queue.write(data).await,
            None => {
                debug!(
                    context_id = self.inner.context_id,
                    queue_id, "signal for unknown queue (already removed)"
                );
                false
            }
        }
    }

    /// Look up a live queue handle.
    pub fn queue(&self, queue_id: i64) -> Option<QueueHandle> {
        let queue = self.inner.queues.get(&queue_id)?;
        Some(QueueHandle {
            context: self.clone(),
            queue_id,
            queue,
        })
    }

    // ---- introspection ----

    pub fn pending_activities(&self) -> usize {
        self.inner.activities.len()
    }

    pub fn pending_children(&self) -> usize {
        self.inner.children.len()
    }

    pub fn open_queues(&self) -> usize {
        self.inner.queues.len()
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("context_id", &self.inner.context_id)
            .field("workflow_name", &self.inner.workflow_name)
            .field("state", &self.state())
            .finish()
    }
}

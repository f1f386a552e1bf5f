// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The high-level bridge client.
//!
//! [`WeftClient`] drives workflow and activity execution hosted by the
//! out-of-process proxy: client-initiated operations (start, signal,
//! query, cancel, worker lifecycle) go out through the request
//! correlator, while proxy-initiated traffic (invoke requests, nested
//! completions, signals) arrives on the push channel and is handled by a
//! router task — off the connection's read loop, so one slow workflow
//! body can never stall delivery of unrelated replies.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use weft_protocol::envelope::keys;
use weft_protocol::{
    DispatchError, Envelope, HeartbeatMonitor, IdGenerator, MessageKind, RequestDispatcher,
};

use crate::config::BridgeConfig;
use crate::context::{ActivityContext, CommandSink, Outcome, WorkflowContext};
use crate::error::{BridgeError, RemoteError, Result};
use crate::events;
use crate::registry::EntityRegistry;
use crate::replay::RecordedResult;
use crate::worker::{WorkerHandle, WorkerLifecycle, WorkerMode, WorkerOptions};

/// Identifier pair for a workflow execution started on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub run_id: String,
}

type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Bytes, RemoteError>> + Send>>;
type WorkflowHandler = Arc<dyn Fn(WorkflowContext, Bytes) -> HandlerFuture + Send + Sync>;
type ActivityHandler = Arc<dyn Fn(Arc<ActivityContext>, Bytes) -> HandlerFuture + Send + Sync>;

/// Production [`CommandSink`]: submits through the correlator and lifts
/// the reply's `Error` property into a typed remote failure.
struct ClientSink {
    dispatcher: RequestDispatcher,
    timeout: Duration,
}

#[async_trait]
impl CommandSink for ClientSink {
    async fn submit(&self, envelope: Envelope) -> Result<Envelope> {
        let reply = self
            .dispatcher
            .send_with_timeout(envelope, self.timeout)
            .await?;
        match RemoteError::from_reply(&reply) {
            Some(remote) => Err(BridgeError::Remote(remote)),
            None => Ok(reply),
        }
    }

    async fn notify(&self, envelope: Envelope) -> Result<()> {
        self.dispatcher.notify(envelope).await?;
        Ok(())
    }
}

struct ClientInner {
    dispatcher: RequestDispatcher,
    sink: Arc<ClientSink>,
    config: BridgeConfig,
    contexts: EntityRegistry<i64, WorkflowContext>,
    activity_contexts: EntityRegistry<i64, Arc<ActivityContext>>,
    context_ids: IdGenerator,
    workers: WorkerLifecycle,
    workflows: StdMutex<HashMap<String, WorkflowHandler>>,
    activities: StdMutex<HashMap<String, ActivityHandler>>,
    heartbeat: StdMutex<Option<HeartbeatMonitor>>,
    router: StdMutex<Option<JoinHandle<()>>>,
}

/// High-level bridge to the weft proxy. Cheap to clone; all clones
/// share one connection.
///
/// # Example
///
/// ```ignore
/// use weft_sdk::{BridgeConfig, WeftClient};
///
/// let client = WeftClient::connect(BridgeConfig::localhost("orders")).await?;
///
/// client.register_workflow("ship-order", |ctx, args| async move {
///     let charged = ctx.schedule_activity("charge-card", args).await
///         .map_err(|e| weft_sdk::RemoteError::generic(e.to_string()))?
///         .await_result().await
///         .map_err(|e| weft_sdk::RemoteError::generic(e.to_string()))?;
///     Ok(charged)
/// }).await?;
///
/// let worker = client.start_worker(
///     weft_sdk::WorkerMode::Both, "orders", "default",
///     weft_sdk::WorkerOptions::default(),
/// ).await?;
///
/// let run = client.start_workflow("ship-order", &b"{...}"[..]).await?;
/// println!("started {}/{}", run.workflow_id, run.run_id);
///
/// client.stop_worker(&worker).await?;
/// client.terminate().await?;
/// ```
#[derive(Clone)]
pub struct WeftClient {
    inner: Arc<ClientInner>,
}

impl WeftClient {
    /// Dial the configured proxy addresses, perform the initialize
    /// handshake, and start heartbeats.
    #[instrument(skip(config), fields(domain = %config.default_domain))]
    pub async fn connect(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let stream = Self::dial(&config).await?;
        Self::establish(stream, config).await
    }

    /// Build a client over an already-connected duplex stream. Used by
    /// tests (in-memory pipes) and alternative transports; `connect` is
    /// the TCP front door.
    pub async fn establish<S>(stream: S, config: BridgeConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (dispatcher, pushes) = RequestDispatcher::connect(stream, config.request_timeout());
        let sink = Arc::new(ClientSink {
            dispatcher: dispatcher.clone(),
            timeout: config.request_timeout(),
        });

        let inner = Arc::new(ClientInner {
            dispatcher,
            sink: sink.clone(),
            workers: WorkerLifecycle::new(sink.clone()),
            config,
            contexts: EntityRegistry::new(),
            activity_contexts: EntityRegistry::new(),
            context_ids: IdGenerator::new(),
            workflows: StdMutex::new(HashMap::new()),
            activities: StdMutex::new(HashMap::new()),
            heartbeat: StdMutex::new(None),
            router: StdMutex::new(None),
        });

        // The router must be draining pushes before any traffic flows.
        let router = tokio::spawn(run_router(inner.clone(), pushes));
        *inner.router.lock().expect("router slot poisoned") = Some(router);

        // Initialize must be acknowledged before anything else is sent.
        let reply = inner
            .sink
            .submit(events::initialize_envelope(&inner.config))
            .await?;
        if let Some(proxy_version) = reply.str_prop(keys::LIBRARY_VERSION) {
            debug!(proxy_version, "initialize acknowledged");
        }

        if inner.config.heartbeat_interval_ms > 0 {
            let monitor = HeartbeatMonitor::start(
                inner.dispatcher.clone(),
                inner.config.heartbeat(),
                events::heartbeat_envelope,
            );
            *inner.heartbeat.lock().expect("heartbeat slot poisoned") = Some(monitor);
        }

        info!(domain = %inner.config.default_domain, "bridge connected");
        Ok(Self { inner })
    }

    async fn dial(config: &BridgeConfig) -> Result<TcpStream> {
        let mut last_error: Option<String> = None;
        for round in 0..=config.connect_retry_count {
            if round > 0 {
                tokio::time::sleep(Duration::from_millis(config.connect_retry_delay_ms)).await;
            }
            for addr in &config.proxy_addrs {
                match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr)).await
                {
                    Ok(Ok(stream)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "could not set TCP_NODELAY");
                        }
                        info!(%addr, "connected to proxy");
                        return Ok(stream);
                    }
                    Ok(Err(e)) => {
                        debug!(%addr, error = %e, "dial failed");
                        last_error = Some(format!("{addr}: {e}"));
                    }
                    Err(_) => {
                        debug!(%addr, "dial timed out");
                        last_error = Some(format!("{addr}: timed out"));
                    }
                }
            }
        }
        Err(BridgeError::Unreachable(
            last_error.unwrap_or_else(|| "no proxy addresses configured".to_string()),
        ))
    }

    // ========== Implementation registration ==========

    /// Register a workflow implementation under `name` and announce it
    /// to the proxy.
    pub async fn register_workflow<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(WorkflowContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, RemoteError>> + Send + 'static,
    {
        {
            let mut workflows = self.inner.workflows.lock().expect("workflow map poisoned");
            if workflows.contains_key(name) {
                return Err(BridgeError::AlreadyRegistered(name.to_owned()));
            }
            workflows.insert(
                name.to_owned(),
                Arc::new(move |ctx, args| Box::pin(handler(ctx, args)) as HandlerFuture),
            );
        }

        let announce = Envelope::new(MessageKind::WorkflowRegister)
            .with_str(keys::WORKFLOW_NAME, name)
            .with_str(keys::DOMAIN, self.inner.config.default_domain.clone());
        if let Err(e) = self.inner.sink.submit(announce).await {
            let mut workflows = self.inner.workflows.lock().expect("workflow map poisoned");
            workflows.remove(name);
            return Err(e);
        }
        info!(workflow = name, "workflow registered");
        Ok(())
    }

    /// Register an activity implementation under `name` and announce it
    /// to the proxy.
    pub async fn register_activity<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Arc<ActivityContext>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, RemoteError>> + Send + 'static,
    {
        {
            let mut activities = self.inner.activities.lock().expect("activity map poisoned");
            if activities.contains_key(name) {
                return Err(BridgeError::AlreadyRegistered(name.to_owned()));
            }
            activities.insert(
                name.to_owned(),
                Arc::new(move |ctx, args| Box::pin(handler(ctx, args)) as HandlerFuture),
            );
        }

        let announce = Envelope::new(MessageKind::ActivityRegister)
            .with_str(keys::ACTIVITY_NAME, name)
            .with_str(keys::DOMAIN, self.inner.config.default_domain.clone());
        if let Err(e) = self.inner.sink.submit(announce).await {
            let mut activities = self.inner.activities.lock().expect("activity map poisoned");
            activities.remove(name);
            return Err(e);
        }
        info!(activity = name, "activity registered");
        Ok(())
    }

    // ========== Workflow operations ==========

    /// Start a workflow on the default domain and task queue.
    #[instrument(skip(self, args))]
    pub async fn start_workflow(
        &self,
        workflow_name: &str,
        args: impl Into<Bytes>,
    ) -> Result<WorkflowRun> {
        let domain = self.inner.config.default_domain.clone();
        let task_queue = self.inner.config.default_task_queue.clone();
        self.start_workflow_on(&domain, &task_queue, workflow_name, args)
            .await
    }

    /// Start a workflow on an explicit domain and task queue.
    pub async fn start_workflow_on(
        &self,
        domain: &str,
        task_queue: &str,
        workflow_name: &str,
        args: impl Into<Bytes>,
    ) -> Result<WorkflowRun> {
        let envelope = Envelope::new(MessageKind::WorkflowExecute)
            .with_str(keys::DOMAIN, domain)
            .with_str(keys::TASK_QUEUE, task_queue)
            .with_str(keys::WORKFLOW_NAME, workflow_name)
            .with_payload(args.into());
        let reply = self.inner.sink.submit(envelope).await?;

        let workflow_id = reply
            .str_prop(keys::WORKFLOW_ID)
            .ok_or_else(|| BridgeError::UnexpectedReply("execute reply missing WorkflowId".into()))?
            .to_owned();
        let run_id = reply.str_prop(keys::RUN_ID).unwrap_or_default().to_owned();
        debug!(workflow_id, run_id, "workflow started");
        Ok(WorkflowRun {
            workflow_id,
            run_id,
        })
    }

    /// Deliver a signal to a running workflow execution.
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
        signal_name: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let mut envelope = Envelope::new(MessageKind::WorkflowSignal)
            .with_str(keys::WORKFLOW_ID, workflow_id)
            .with_str(keys::SIGNAL_NAME, signal_name)
            .with_payload(payload.into());
        if let Some(run_id) = run_id {
            envelope.set_str(keys::RUN_ID, run_id);
        }
        self.inner.sink.submit(envelope).await.map(|_| ())
    }

    /// Query a running workflow execution; returns the query result
    /// payload.
    #[instrument(skip(self, payload))]
    pub async fn query_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
        query_name: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes> {
        let mut envelope = Envelope::new(MessageKind::WorkflowQuery)
            .with_str(keys::WORKFLOW_ID, workflow_id)
            .with_str(keys::QUERY_NAME, query_name)
            .with_payload(payload.into());
        if let Some(run_id) = run_id {
            envelope.set_str(keys::RUN_ID, run_id);
        }
        let reply = self.inner.sink.submit(envelope).await?;
        Ok(reply.payload.unwrap_or_default())
    }

    /// Request cancellation of a workflow execution on the engine.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: &str, run_id: Option<&str>) -> Result<()> {
        let mut envelope =
            Envelope::new(MessageKind::WorkflowCancel).with_str(keys::WORKFLOW_ID, workflow_id);
        if let Some(run_id) = run_id {
            envelope.set_str(keys::RUN_ID, run_id);
        }
        self.inner.sink.submit(envelope).await.map(|_| ())
    }

    /// Execute an activity directly (outside any workflow context) and
    /// await its result.
    #[instrument(skip(self, args))]
    pub async fn execute_activity(
        &self,
        activity_name: &str,
        args: impl Into<Bytes>,
    ) -> Result<Bytes> {
        let envelope = Envelope::new(MessageKind::ActivityExecute)
            .with_str(keys::DOMAIN, self.inner.config.default_domain.clone())
            .with_str(keys::TASK_QUEUE, self.inner.config.default_task_queue.clone())
            .with_str(keys::ACTIVITY_NAME, activity_name)
            .with_payload(args.into());
        let reply = self.inner.sink.submit(envelope).await?;
        Ok(reply.payload.unwrap_or_default())
    }

    // ========== Worker lifecycle ==========

    /// Start (or join) a worker for `(mode, domain, task_queue)`. See
    /// [`WorkerLifecycle::start`] for the restart restriction.
    pub async fn start_worker(
        &self,
        mode: WorkerMode,
        domain: &str,
        task_queue: &str,
        options: WorkerOptions,
    ) -> Result<WorkerHandle> {
        self.inner.workers.start(mode, domain, task_queue, options).await
    }

    /// Release one reference to a worker registration.
    pub async fn stop_worker(&self, handle: &WorkerHandle) -> Result<()> {
        self.inner.workers.stop(handle).await
    }

    // ========== Session ==========

    /// Whether the peer currently passes heartbeats.
    pub fn is_healthy(&self) -> bool {
        self.inner.dispatcher.health().is_healthy()
    }

    /// Look up a live workflow context by ID.
    pub fn context(&self, context_id: i64) -> Option<WorkflowContext> {
        self.inner.contexts.get(&context_id)
    }

    /// Number of workflow contexts currently live.
    pub fn live_contexts(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Orderly shutdown: ask the proxy to terminate, then close the
    /// connection and tear down every live context. The proxy is
    /// expected to close its side after acknowledging; this client never
    /// kills the process itself.
    #[instrument(skip(self))]
    pub async fn terminate(&self) -> Result<()> {
        let result = self
            .inner
            .dispatcher
            .send_with_timeout(
                events::terminate_envelope(),
                self.inner.config.request_timeout(),
            )
            .await;
        self.close().await;
        match result {
            Ok(_) => Ok(()),
            // The proxy may close the transport right after the ack.
            Err(DispatchError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Tear the bridge down without the terminate handshake. Every
    /// pending nested waiter resolves with `ContextClosed`.
    pub async fn close(&self) {
        if let Some(monitor) = self
            .inner
            .heartbeat
            .lock()
            .expect("heartbeat slot poisoned")
            .take()
        {
            monitor.stop();
        }
        if let Some(router) = self.inner.router.lock().expect("router slot poisoned").take() {
            router.abort();
        }
        self.inner.dispatcher.close().await;
        for (_, ctx) in self.inner.contexts.drain() {
            ctx.close();
        }
        self.inner.activity_contexts.drain();
        info!("bridge closed");
    }
}

// ---------------------------------------------------------------------
// Push router
// ---------------------------------------------------------------------

async fn run_router(inner: Arc<ClientInner>, mut pushes: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = pushes.recv().await {
        route(&inner, envelope).await;
    }
    debug!("push channel closed; router exiting");
}

async fn route(inner: &Arc<ClientInner>, envelope: Envelope) {
    match envelope.kind {
        MessageKind::WorkflowInvoke => invoke_workflow(inner, envelope).await,
        MessageKind::ActivityInvoke => invoke_activity(inner, envelope).await,

        MessageKind::ActivityCompleted => {
            let (Some(context_id), Some(activity_id)) = (
                envelope.i64_prop(keys::CONTEXT_ID),
                envelope.i64_prop(keys::ACTIVITY_ID),
            ) else {
                warn!("activity completion missing ContextId/ActivityId");
                return;
            };
            match inner.contexts.get(&context_id) {
                Some(ctx) => {
                    ctx.complete_activity(activity_id, outcome_of(&envelope));
                }
                None => debug!(context_id, "completion for unknown context (already closed)"),
            }
        }

        MessageKind::ChildWorkflowCompleted => {
            let (Some(context_id), Some(child_id)) = (
                envelope.i64_prop(keys::CONTEXT_ID),
                envelope.i64_prop(keys::CHILD_ID),
            ) else {
                warn!("child completion missing ContextId/ChildId");
                return;
            };
            match inner.contexts.get(&context_id) {
                Some(ctx) => {
                    ctx.complete_child(child_id, outcome_of(&envelope));
                }
                None => debug!(context_id, "completion for unknown context (already closed)"),
            }
        }

        MessageKind::SignalReceived => {
            let (Some(context_id), Some(queue_id)) = (
                envelope.i64_prop(keys::CONTEXT_ID),
                envelope.i64_prop(keys::QUEUE_ID),
            ) else {
                warn!("signal missing ContextId/QueueId");
                return;
            };
            let payload = envelope.payload.clone().unwrap_or_default();
            match inner.contexts.get(&context_id) {
                Some(ctx) => {
                    ctx.push_signal(queue_id, payload).await;
                }
                None => debug!(context_id, "signal for unknown context (already closed)"),
            }
        }

        MessageKind::WorkflowCancel => {
            // Proxy-initiated: cancel the local execution of a context.
            let Some(context_id) = envelope.i64_prop(keys::CONTEXT_ID) else {
                warn!("cancel request missing ContextId");
                return;
            };
            if let Some(ctx) = inner.contexts.get(&context_id) {
                ctx.fire_cancel_handler();
            } else {
                debug!(context_id, "cancel for unknown context (already closed)");
            }
            if let Some(reply) = envelope.reply() {
                if let Err(e) = inner.dispatcher.reply(reply).await {
                    warn!(context_id, error = %e, "failed to acknowledge cancel");
                }
            }
        }

        other => {
            warn!(kind = ?other, request_id = envelope.request_id, "unhandled server message");
        }
    }
}

fn outcome_of(envelope: &Envelope) -> Outcome {
    match RemoteError::from_reply(envelope) {
        Some(remote) => Err(remote),
        None => Ok(envelope.payload.clone().unwrap_or_default()),
    }
}

async fn reply_failure(inner: &Arc<ClientInner>, request: &Envelope, error: RemoteError) {
    if let Some(reply) = events::invoke_failure_reply(request, &error) {
        if let Err(e) = inner.dispatcher.reply(reply).await {
            warn!(error = %e, "failed to send failure reply");
        }
    }
}

async fn invoke_workflow(inner: &Arc<ClientInner>, envelope: Envelope) {
    let Some(name) = envelope.str_prop(keys::WORKFLOW_NAME).map(str::to_owned) else {
        error!("workflow invoke missing WorkflowName");
        reply_failure(
            inner,
            &envelope,
            RemoteError::generic("invoke request missing WorkflowName"),
        )
        .await;
        return;
    };

    let handler = {
        let workflows = inner.workflows.lock().expect("workflow map poisoned");
        workflows.get(&name).cloned()
    };
    let Some(handler) = handler else {
        warn!(workflow = %name, "invoke for unregistered workflow");
        reply_failure(
            inner,
            &envelope,
            RemoteError::custom(format!("workflow {name:?} is not registered")),
        )
        .await;
        return;
    };

    // The context ID comes from the bridge's global generator the moment
    // the proxy notifies us that execution has begun.
    let context_id = inner.context_ids.next();
    let sink: Arc<dyn CommandSink> = inner.sink.clone();
    let ctx = WorkflowContext::new(context_id, name.clone(), sink);
    if let Some(history) = envelope.json_prop::<Vec<RecordedResult>>(keys::REPLAY_HISTORY) {
        ctx.load_replay_history(history);
    } else if envelope.bool_prop(keys::REPLAYING) == Some(true) {
        debug!(context_id, "replay flagged without history; running live");
    }
    inner.contexts.add(context_id, ctx.clone());
    if let Err(e) = ctx.mark_running() {
        error!(context_id, error = %e, "fresh context refused to run");
    }

    let args = envelope.payload.clone().unwrap_or_default();
    let inner = inner.clone();
    tokio::spawn(async move {
        debug!(context_id, workflow = %name, replaying = ctx.is_replaying(), "workflow invocation started");
        let result = handler(ctx.clone(), args).await;
        if let Err(e) = ctx.begin_completing() {
            debug!(context_id, error = %e, "context left the running state early");
        }

        let reply = match &result {
            Ok(output) => events::invoke_success_reply(&envelope, output.clone()),
            Err(remote) => events::invoke_failure_reply(&envelope, remote),
        };
        if let Some(reply) = reply {
            if let Err(e) = inner.dispatcher.reply(reply).await {
                warn!(context_id, error = %e, "failed to deliver workflow result");
            }
        }

        ctx.close();
        inner.contexts.remove(&context_id);
        debug!(context_id, ok = result.is_ok(), "workflow invocation finished");
    });
}

async fn invoke_activity(inner: &Arc<ClientInner>, envelope: Envelope) {
    let Some(name) = envelope.str_prop(keys::ACTIVITY_NAME).map(str::to_owned) else {
        error!("activity invoke missing ActivityName");
        reply_failure(
            inner,
            &envelope,
            RemoteError::generic("invoke request missing ActivityName"),
        )
        .await;
        return;
    };

    let handler = {
        let activities = inner.activities.lock().expect("activity map poisoned");
        activities.get(&name).cloned()
    };
    let Some(handler) = handler else {
        warn!(activity = %name, "invoke for unregistered activity");
        reply_failure(
            inner,
            &envelope,
            RemoteError::custom(format!("activity {name:?} is not registered")),
        )
        .await;
        return;
    };

    let context_id = inner.context_ids.next();
    let sink: Arc<dyn CommandSink> = inner.sink.clone();
    let actx = Arc::new(ActivityContext::new(context_id, name.clone(), sink));
    inner.activity_contexts.add(context_id, actx.clone());

    let args = envelope.payload.clone().unwrap_or_default();
    let inner = inner.clone();
    tokio::spawn(async move {
        debug!(context_id, activity = %name, "activity invocation started");
        let result = handler(actx, args).await;

        let reply = match &result {
            Ok(output) => events::invoke_success_reply(&envelope, output.clone()),
            Err(remote) => events::invoke_failure_reply(&envelope, remote),
        };
        if let Some(reply) = reply {
            if let Err(e) = inner.dispatcher.reply(reply).await {
                warn!(context_id, error = %e, "failed to deliver activity result");
            }
        }

        inner.activity_contexts.remove(&context_id);
        debug!(context_id, ok = result.is_ok(), "activity invocation finished");
    });
}

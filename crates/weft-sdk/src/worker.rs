// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reference-counted worker registrations.
//!
//! A worker is identified by its `(mode, domain, task_queue)` triple.
//! Repeated starts with identical parameters share one registration and
//! bump a reference count; the deregistration request goes out exactly
//! once, when the count reaches zero. A fully stopped triple can never
//! be restarted on the same connection — the external worker runtime
//! does not support re-registration, and the restriction is surfaced as
//! an explicit error instead of being papered over.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::{debug, info};
use weft_protocol::envelope::keys;
use weft_protocol::{Envelope, IdGenerator, MessageKind};

use crate::context::CommandSink;
use crate::error::{BridgeError, Result};

/// What kind of work a registration polls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerMode {
    Workflow,
    Activity,
    Both,
}

impl WorkerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerMode::Workflow => "workflow",
            WorkerMode::Activity => "activity",
            WorkerMode::Both => "both",
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration key: one worker per `(mode, domain, task_queue)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub mode: WorkerMode,
    pub domain: String,
    pub task_queue: String,
}

/// Tuning options forwarded with the registration request.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Worker identity reported to the engine (host/pid string).
    pub identity: Option<String>,
    /// Cap on concurrently executing tasks.
    pub max_concurrent_tasks: Option<i64>,
}

/// Handle returned by `start`; pass it back to `stop`.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    key: WorkerKey,
    worker_id: i64,
}

impl WorkerHandle {
    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }
}

struct WorkerEntry {
    worker_id: i64,
    ref_count: i64,
    stopped: bool,
}

enum StartAction {
    Reuse(i64),
    Register(i64),
}

/// Bookkeeping for worker registrations on one connection.
pub struct WorkerLifecycle {
    sink: Arc<dyn CommandSink>,
    entries: Mutex<HashMap<WorkerKey, WorkerEntry>>,
    ids: IdGenerator,
}

impl WorkerLifecycle {
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        Self {
            sink,
            entries: Mutex::new(HashMap::new()),
            ids: IdGenerator::new(),
        }
    }

    /// Start (or join) the worker for the given triple.
    ///
    /// Idempotent while the registration is live: an identical start
    /// returns the existing handle with the reference count bumped. A
    /// start against a stopped triple fails with
    /// [`BridgeError::AlreadyStoppedCannotRestart`].
    pub async fn start(
        &self,
        mode: WorkerMode,
        domain: &str,
        task_queue: &str,
        options: WorkerOptions,
    ) -> Result<WorkerHandle> {
        let key = WorkerKey {
            mode,
            domain: domain.to_owned(),
            task_queue: task_queue.to_owned(),
        };

        // Decide under the lock; send outside it.
        let action = {
            let mut entries = self.entries.lock().expect("worker table poisoned");
            match entries.get_mut(&key) {
                Some(entry) if entry.stopped => {
                    return Err(BridgeError::AlreadyStoppedCannotRestart {
                        domain: key.domain,
                        task_queue: key.task_queue,
                    });
                }
                Some(entry) => {
                    entry.ref_count += 1;
                    debug!(
                        worker_id = entry.worker_id,
                        ref_count = entry.ref_count,
                        %mode,
                        domain,
                        task_queue,
                        "joined existing worker registration"
                    );
                    StartAction::Reuse(entry.worker_id)
                }
                None => {
                    let worker_id = self.ids.next();
                    entries.insert(
                        key.clone(),
                        WorkerEntry {
                            worker_id,
                            ref_count: 1,
                            stopped: false,
                        },
                    );
                    StartAction::Register(worker_id)
                }
            }
        };

        let worker_id = match action {
            StartAction::Reuse(worker_id) => worker_id,
            StartAction::Register(worker_id) => {
                let mut envelope = Envelope::new(MessageKind::WorkerRegister)
                    .with_i64(keys::WORKER_ID, worker_id)
                    .with_str(keys::WORKER_MODE, mode.as_str())
                    .with_str(keys::DOMAIN, domain)
                    .with_str(keys::TASK_QUEUE, task_queue);
                if let Some(identity) = &options.identity {
                    envelope.set_str(keys::IDENTITY, identity.clone());
                }
                if let Some(max) = options.max_concurrent_tasks {
                    envelope.set_i64(keys::MAX_CONCURRENT_TASKS, max);
                }

                if let Err(e) = self.sink.submit(envelope).await {
                    // Registration never happened; forget the entry so a
                    // later start may try again.
                    let mut entries = self.entries.lock().expect("worker table poisoned");
                    entries.remove(&key);
                    return Err(e);
                }
                info!(worker_id, %mode, domain, task_queue, "worker registered");
                worker_id
            }
        };

        Ok(WorkerHandle { key, worker_id })
    }

    /// Release one reference to the worker. At zero the triple is
    /// tombstoned and exactly one deregistration request is sent.
    pub async fn stop(&self, handle: &WorkerHandle) -> Result<()> {
        let deregister = {
            let mut entries = self.entries.lock().expect("worker table poisoned");
            match entries.get_mut(&handle.key) {
                None => {
                    return Err(BridgeError::Rejected(format!(
                        "no registration for worker {}",
                        handle.worker_id
                    )));
                }
                Some(entry) if entry.stopped => {
                    return Err(BridgeError::Rejected(format!(
                        "worker {} is already stopped",
                        handle.worker_id
                    )));
                }
                Some(entry) => {
                    entry.ref_count -= 1;
                    if entry.ref_count <= 0 {
                        // Keep the tombstone for the life of the
                        // connection; the triple can never restart.
                        entry.stopped = true;
                        true
                    } else {
                        debug!(
                            worker_id = entry.worker_id,
                            ref_count = entry.ref_count,
                            "worker reference released"
                        );
                        false
                    }
                }
            }
        };

        if deregister {
            let envelope = Envelope::new(MessageKind::WorkerDeregister)
                .with_i64(keys::WORKER_ID, handle.worker_id)
                .with_str(keys::WORKER_MODE, handle.key.mode.as_str())
                .with_str(keys::DOMAIN, handle.key.domain.clone())
                .with_str(keys::TASK_QUEUE, handle.key.task_queue.clone());
            self.sink.submit(envelope).await?;
            info!(worker_id = handle.worker_id, "worker deregistered");
        }

        Ok(())
    }

    /// Current reference count for a triple; `None` if never started.
    pub fn ref_count(&self, mode: WorkerMode, domain: &str, task_queue: &str) -> Option<i64> {
        let entries = self.entries.lock().expect("worker table poisoned");
        entries
            .get(&WorkerKey {
                mode,
                domain: domain.to_owned(),
                task_queue: task_queue.to_owned(),
            })
            .map(|entry| entry.ref_count)
    }
}

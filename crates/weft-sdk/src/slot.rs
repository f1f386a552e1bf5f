// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-assignment completion slots.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// A completion slot fulfilled exactly once.
///
/// The slot half lives in a registry (shared, clonable through `Arc`);
/// the receiver half is held by the single waiter. Dropping the slot
/// unfulfilled wakes the waiter with a closed-channel error, which the
/// context layer maps to `ContextClosed`.
#[derive(Debug)]
pub struct CompletionSlot<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> CompletionSlot<T> {
    /// Create a slot and the receiver its waiter will await.
    pub fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Fulfil the slot. Returns `true` on the first call with a live
    /// waiter; later calls (or calls after the waiter gave up) return
    /// `false` and drop the value.
    pub fn complete(&self, value: T) -> bool {
        let sender = self.tx.lock().expect("slot lock poisoned").take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Whether the slot has already been fulfilled (or abandoned).
    pub fn is_done(&self) -> bool {
        self.tx.lock().expect("slot lock poisoned").is_none()
    }
}

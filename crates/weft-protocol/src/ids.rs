// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monotonic 64-bit identifier generation.

use std::sync::atomic::{AtomicI64, Ordering};

/// Thread-safe source of strictly increasing 64-bit IDs.
///
/// The first value handed out is 1; 0 is reserved everywhere in the
/// protocol to mean "no ID". Each logical scope owns its own instance:
/// the dispatcher's request IDs, the bridge's global context IDs, and a
/// workflow context's child/activity/queue IDs. Keeping the generator an
/// explicit value (instead of a module-level counter) also keeps tests
/// independent of each other.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicI64::new(0),
        }
    }

    /// Return the next ID in the sequence.
    ///
    /// Panics if the 63-bit space is ever exhausted; failing loudly is
    /// preferred over silently wrapping into already-issued IDs.
    pub fn next(&self) -> i64 {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(id > 0, "IdGenerator exhausted its 64-bit ID space");
        id
    }

    /// The most recently issued ID, or 0 if none has been issued yet.
    pub fn current(&self) -> i64 {
        self.counter.load(Ordering::Relaxed)
    }
}

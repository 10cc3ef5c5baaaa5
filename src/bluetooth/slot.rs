// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-instance holder for the long-lived workers.
//!
//! The slot stores the id of the current instance in an atomic; claiming is
//! a compare-and-set from empty, so of two racing starts exactly one wins.
//! A worker loop keeps running only while `is_current` holds for its id.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

const EMPTY: u64 = 0;

/// Proof of ownership handed to the worker that won the slot.
#[derive(Debug)]
pub struct SlotClaim {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Debug)]
pub struct SingletonSlot {
    name: &'static str,
    current: AtomicU64,
    stop: Mutex<Option<(u64, CancellationToken)>>,
}

impl SingletonSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            current: AtomicU64::new(EMPTY),
            stop: Mutex::new(None),
        }
    }

    /// Claim the empty slot. `None` if an instance is already live.
    pub fn try_claim(&self) -> Option<SlotClaim> {
        // the token is published under the same lock `stop` takes
        let mut stop = self.stop.lock();
        let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        self.current
            .compare_exchange(EMPTY, id, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let token = CancellationToken::new();
        *stop = Some((id, token.clone()));
        debug!("{}: instance {} claimed slot", self.name, id);
        Some(SlotClaim { id, token })
    }

    pub fn is_current(&self, id: u64) -> bool {
        self.current.load(Ordering::Acquire) == id
    }

    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::Acquire) != EMPTY
    }

    /// Clear the slot, then cancel the instance that held it. Clearing
    /// first means the woken loop sees it is stale and won't continue.
    pub fn stop(&self) -> bool {
        let mut stop = self.stop.lock();
        let id = self.current.swap(EMPTY, Ordering::AcqRel);
        if id == EMPTY {
            return false;
        }
        if let Some((_, token)) = stop.take() {
            token.cancel();
        }
        debug!("{}: stopped instance {}", self.name, id);
        true
    }

    /// Called by a worker on its way out. Only empties the slot if `id` is
    /// still the current instance.
    pub fn release(&self, id: u64) {
        let mut stop = self.stop.lock();
        match self
            .current
            .compare_exchange(id, EMPTY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                if matches!(stop.as_ref(), Some((owner, _)) if *owner == id) {
                    *stop = None;
                }
            }
            Err(EMPTY) => {}
            // stopped and restarted while this instance was winding down
            Err(other) => debug!(
                "{}: release by {} after instance {} took over",
                self.name, id, other
            ),
        }
    }
}

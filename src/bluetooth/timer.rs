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

//! Periodic retry timer.
//!
//! Fires with a growing interval so that idle devices re-open their
//! listeners and nudge queued Senders now and then. Any successful inbound
//! exchange shrinks the interval back to its floor.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::delegate::RetryScheduler;

pub const MIN_BACKOFF: Duration = Duration::from_secs(2 * 60);
pub const MAX_BACKOFF: Duration = Duration::from_secs(4 * 60 * 60);
const GROWTH: f64 = 1.5;

pub struct RetryTimer {
    interval: Mutex<Duration>,
    min: Duration,
    max: Duration,
    reset: Notify,
    token: CancellationToken,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self::with_bounds(MIN_BACKOFF, MAX_BACKOFF)
    }

    pub fn with_bounds(min: Duration, max: Duration) -> Self {
        Self {
            interval: Mutex::new(min),
            min,
            max,
            reset: Notify::new(),
            token: CancellationToken::new(),
        }
    }

    /// Interval until the next firing.
    pub fn interval(&self) -> Duration {
        *self.interval.lock()
    }

    fn grow(&self) {
        let mut interval = self.interval.lock();
        *interval = interval.mul_f64(GROWTH).min(self.max);
    }

    /// Run the timer, calling `on_fire` at each expiry until it returns
    /// false or the timer is stopped.
    pub fn spawn<F>(self: &Arc<Self>, runtime: &Handle, on_fire: F) -> JoinHandle<()>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let timer = self.clone();
        runtime.spawn(async move {
            loop {
                let wait = timer.interval();
                tokio::select! {
                    _ = timer.token.cancelled() => break,
                    _ = timer.reset.notified() => continue,
                    _ = tokio::time::sleep(wait) => {
                        debug!("Retry timer fired after {:?}", wait);
                        if !on_fire() {
                            break;
                        }
                        timer.grow();
                    }
                }
            }
            info!("Retry timer exiting");
        })
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Default for RetryTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryScheduler for RetryTimer {
    fn on_inbound_success(&self) {
        *self.interval.lock() = self.min;
        self.reset.notify_one();
    }
}

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

//! Reachability scan over bonded devices.
//!
//! Each candidate gets a throwaway Sender carrying a single game-less PING.
//! Whoever answers within the scan window is reported to the scan
//! listeners as it connects; when every ping has finished the listeners
//! are told the scan is done.

use futures::future::join_all;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::context::TransportContext;
use super::delegate::ScanListener;
use super::platform::{BtPlatform, RemoteDevice};
use super::sender::Sender;
use super::slot::{SingletonSlot, SlotClaim};

/// Registered scan observers.
#[derive(Default)]
pub struct ScanListeners {
    listeners: Mutex<Vec<Arc<dyn ScanListener>>>,
}

impl ScanListeners {
    pub fn add(&self, listener: Arc<dyn ScanListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove(&self, listener: &Arc<dyn ScanListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    // Listeners are called on a snapshot so they may add or remove
    // themselves from inside a callback.
    fn snapshot(&self) -> Vec<Arc<dyn ScanListener>> {
        self.listeners.lock().clone()
    }

    pub fn device_scanned(&self, device: &RemoteDevice) {
        debug!("device_scanned({})", device);
        for listener in self.snapshot() {
            listener.on_device_scanned(device);
        }
    }

    pub fn scan_done(&self) {
        for listener in self.snapshot() {
            listener.on_scan_done();
        }
    }
}

/// Bonded devices that might run the game.
pub async fn candidates(platform: &dyn BtPlatform) -> io::Result<Vec<RemoteDevice>> {
    let devices = platform.bonded_devices().await?;
    Ok(devices
        .into_iter()
        .filter(RemoteDevice::is_candidate)
        .collect())
}

/// Runs at most one scan at a time.
pub struct ScanOrchestrator {
    slot: SingletonSlot,
}

impl ScanOrchestrator {
    pub fn new() -> Self {
        Self {
            slot: SingletonSlot::new("scan"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_live()
    }

    /// Abandon a running scan. Pings already in flight run out their
    /// lifetime on their own.
    pub fn stop(&self) -> bool {
        self.slot.stop()
    }

    /// Ping `devices`, each for at most `timeout`. Returns false if a scan
    /// is already running.
    pub fn start_once(
        self: &Arc<Self>,
        ctx: &Arc<TransportContext>,
        devices: Vec<RemoteDevice>,
        timeout: Duration,
    ) -> bool {
        let Some(claim) = self.slot.try_claim() else {
            debug!("Scan already running");
            return false;
        };

        let scanner = self.clone();
        let ctx_clone = ctx.clone();
        ctx.runtime.spawn(async move {
            scanner.run(claim, ctx_clone, devices, timeout).await;
        });
        true
    }

    async fn run(
        &self,
        claim: SlotClaim,
        ctx: Arc<TransportContext>,
        devices: Vec<RemoteDevice>,
        timeout: Duration,
    ) {
        info!("Scanning {} devices for {:?}", devices.len(), timeout);

        let pings = devices.into_iter().map(|device| {
            let sender = Sender::with_connect_timeout(
                ctx.clone(),
                device.display_name(),
                Some(device.address.clone()),
                timeout,
            );
            sender.enqueue_ping(0);
            sender.mark_exit_when_empty().mark_lifetime(timeout);
            let handle = sender.spawn(None);
            async move { (device, handle.await) }
        });
        let pings = join_all(pings);

        tokio::select! {
            biased;
            _ = claim.token.cancelled() => {
                info!("Scan stopped");
                return;
            }
            results = pings => {
                for (device, result) in results {
                    match result {
                        Ok(responses) => debug!("Scan ping of {} got {} replies", device, responses),
                        Err(e) => error!("Scan ping of {} failed: {}", device, e),
                    }
                }
            }
        }

        self.slot.release(claim.id);
        info!("Scan done");
        ctx.scan_listeners.scan_done();
    }
}

impl Default for ScanOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::protocol::Reply;
    use crate::bluetooth::testutil::{test_context, FakePlatform, PeerScript, RecordingScanListener};

    fn pong() -> Vec<u8> {
        let mut out = Vec::new();
        Reply::Pong { game_absent: false }.encode_into(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_candidates_exclude_classes() {
        let platform = FakePlatform::new();
        platform.add_peer(
            RemoteDevice::new("Pixel", "11:22:33:44:55:66").with_class(0x5a020c),
            PeerScript::Silent,
        );
        platform.add_peer(
            RemoteDevice::new("Buds", "11:22:33:44:55:67").with_class(0x240404),
            PeerScript::Silent,
        );
        platform.add_peer(RemoteDevice::new("Laptop", "11:22:33:44:55:68"), PeerScript::Silent);

        let found = candidates(&platform).await.unwrap();
        let names: Vec<&str> = found.iter().map(RemoteDevice::display_name).collect();
        assert_eq!(names, vec!["Pixel", "Laptop"]);
    }

    #[tokio::test]
    async fn test_listener_registration() {
        let listeners = ScanListeners::default();
        let listener = Arc::new(RecordingScanListener::default());
        let as_dyn: Arc<dyn ScanListener> = listener.clone();

        listeners.add(as_dyn.clone());
        listeners.add(as_dyn.clone());
        assert_eq!(listeners.len(), 1);

        listeners.device_scanned(&RemoteDevice::new("Pixel", "11:22:33:44:55:66"));
        assert_eq!(listener.scanned(), vec!["Pixel".to_string()]);

        assert!(listeners.remove(&as_dyn));
        assert!(!listeners.remove(&as_dyn));
        assert!(listeners.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_reports_reachable_peers() {
        let platform = Arc::new(FakePlatform::new());
        platform.add_peer(RemoteDevice::new("Pixel", "11:22:33:44:55:66"), PeerScript::Reply(pong()));
        platform.add_peer(RemoteDevice::new("Tablet", "11:22:33:44:55:67"), PeerScript::Refuse);
        let (ctx, _fakes, _events) = test_context(platform.clone(), true);

        let listener = Arc::new(RecordingScanListener::default());
        ctx.scan_listeners.add(listener.clone());

        let devices = candidates(platform.as_ref()).await.unwrap();
        let scanner = Arc::new(ScanOrchestrator::new());
        let started = tokio::time::Instant::now();
        assert!(scanner.start_once(&ctx, devices.clone(), Duration::from_secs(15)));
        assert!(!scanner.start_once(&ctx, devices, Duration::from_secs(15)));

        listener.wait_done().await;
        assert!(started.elapsed() <= Duration::from_secs(20));
        assert_eq!(listener.scanned(), vec!["Pixel".to_string()]);
        assert_eq!(listener.done_count(), 1);
        assert!(!scanner.is_running());
    }
}

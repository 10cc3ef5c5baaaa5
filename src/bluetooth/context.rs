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

//! State and collaborators shared by every transport worker.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::delegate::{GameCore, KeyValueStore, RetryScheduler, StatusReporter};
use super::platform::{BtPlatform, ServiceRecord};
use super::scan::ScanListeners;

/// Service UUID both ends bind and dial.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x7be0b3d1_0b5f_4b2e_9a8c_41a53fd67a10);

/// Events posted to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Peer accepted a move message or game-gone notice.
    MessageAccepted { game_id: u32, peer: String },
    /// A game is gone on one side. `via_peer` names the remote device when
    /// the peer reported it.
    MessageNoGame { game_id: u32, via_peer: Option<String> },
    NewGameSuccess { game_id: u32 },
    NewGameDupRejected { peer: String },
    NewGameFailure { game_id: u32 },
    /// Peer speaks a protocol version we don't.
    BadProto { peer: String },
    /// A peer reported a local MAC different from the cached one.
    LocalMacConflict { cached: String, reported: String },
    /// The OS refused Bluetooth for this process.
    BackgroundRestricted,
}

/// Timing and service parameters.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub service: ServiceRecord,
    /// Overall bound on one connect call.
    pub connect_timeout: Duration,
    /// Delay between connect attempts.
    pub connect_retry: Duration,
    /// Watchdog bound on reading replies.
    pub reply_timeout: Duration,
    /// Bound on reading one inbound frame.
    pub inbound_timeout: Duration,
    pub scan_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            service: ServiceRecord {
                name: "GameLink".to_string(),
                uuid: SERVICE_UUID,
                channel: 3,
            },
            connect_timeout: Duration::from_millis(20_000),
            connect_retry: Duration::from_millis(2_500),
            reply_timeout: Duration::from_secs(30),
            inbound_timeout: Duration::from_secs(30),
            scan_timeout: Duration::from_millis(15_000),
        }
    }
}

/// Outcome of learning our own MAC address from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacUpdate {
    Adopted,
    Unchanged,
    Conflict { cached: String },
}

/// Process-wide transport flags.
#[derive(Debug, Default)]
pub struct TransportState {
    local_mac: RwLock<Option<String>>,
    background_restricted: AtomicBool,
    disabled: AtomicBool,
}

impl TransportState {
    pub fn local_mac(&self) -> Option<String> {
        self.local_mac.read().clone()
    }

    /// Seed from persistent storage.
    pub fn load_local_mac(&self, mac: Option<String>) {
        *self.local_mac.write() = mac;
    }

    /// Take `mac` as ours unless a different one is already known.
    pub fn adopt_local_mac(&self, mac: &str) -> MacUpdate {
        let mut current = self.local_mac.write();
        match current.as_deref() {
            None => {
                *current = Some(mac.to_string());
                MacUpdate::Adopted
            }
            Some(cached) if cached == mac => MacUpdate::Unchanged,
            Some(cached) => MacUpdate::Conflict {
                cached: cached.to_string(),
            },
        }
    }

    pub fn is_background_restricted(&self) -> bool {
        self.background_restricted.load(Ordering::Acquire)
    }

    pub fn set_background_restricted(&self, restricted: bool) {
        self.background_restricted.store(restricted, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }
}

/// The external collaborators the transport is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub game: Arc<dyn GameCore>,
    pub status: Arc<dyn StatusReporter>,
    pub store: Arc<dyn KeyValueStore>,
    pub retry: Arc<dyn RetryScheduler>,
}

/// Everything a Sender, Listener or the Reader needs.
pub struct TransportContext {
    pub(crate) platform: Arc<dyn BtPlatform>,
    pub(crate) game: Arc<dyn GameCore>,
    pub(crate) status: Arc<dyn StatusReporter>,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) retry: Arc<dyn RetryScheduler>,
    pub(crate) events: mpsc::UnboundedSender<TransportEvent>,
    pub(crate) settings: TransportSettings,
    pub(crate) state: TransportState,
    pub(crate) scan_listeners: ScanListeners,
    pub(crate) runtime: Handle,
}

impl TransportContext {
    pub fn new(
        platform: Arc<dyn BtPlatform>,
        collaborators: Collaborators,
        settings: TransportSettings,
        events: mpsc::UnboundedSender<TransportEvent>,
        runtime: Handle,
    ) -> Self {
        let Collaborators {
            game,
            status,
            store,
            retry,
        } = collaborators;
        Self {
            platform,
            game,
            status,
            store,
            retry,
            events,
            settings,
            state: TransportState::default(),
            scan_listeners: ScanListeners::default(),
            runtime,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn state(&self) -> &TransportState {
        &self.state
    }

    /// Whether new workers may be started at all.
    pub(crate) fn may_start(&self) -> bool {
        self.platform.is_available()
            && !self.state.is_disabled()
            && !self.state.is_background_restricted()
    }

    /// Whether running workers should keep going.
    pub(crate) async fn bluetooth_usable(&self) -> bool {
        self.may_start() && self.platform.has_permissions() && self.platform.is_enabled().await
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    pub(crate) fn set_background_restricted(&self) {
        if !self.state.is_background_restricted() {
            warn!("Bluetooth not permitted in background; disabling until foregrounded");
            self.state.set_background_restricted(true);
            self.emit(TransportEvent::BackgroundRestricted);
        }
    }

    /// Record a MAC reported by a peer. Persisted once; a contradicting
    /// report is flagged and ignored.
    pub(crate) fn adopt_local_mac(&self, mac: &str) {
        match self.state.adopt_local_mac(mac) {
            MacUpdate::Adopted => {
                info!("Got {} as my MAC address", mac);
                if let Err(e) = self.store.set_cached_local_mac(mac) {
                    error!("Failed to persist local MAC: {}", e);
                }
            }
            MacUpdate::Unchanged => debug!("Peer confirmed local MAC {}", mac),
            MacUpdate::Conflict { cached } => {
                error!(
                    "Peer reports local MAC {} but {} is cached; keeping cached value",
                    mac, cached
                );
                self.emit(TransportEvent::LocalMacConflict {
                    cached,
                    reported: mac.to_string(),
                });
            }
        }
    }
}

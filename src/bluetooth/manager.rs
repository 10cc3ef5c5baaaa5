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

//! Bluetooth transport manager.
//!
//! Owns every transport worker: the peer registry, both listener slots, the
//! reader and the scanner. Application code talks to the transport only
//! through this type.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::{Collaborators, TransportContext, TransportEvent, TransportSettings};
use super::delegate::{Invite, ScanListener};
use super::listener::Listener;
use super::platform::{is_bogus_addr, BtPlatform, PeerSocket, RemoteDevice, SecurityMode};
use super::reader::Reader;
use super::registry::PeerRegistry;
use super::scan::{self, ScanOrchestrator};
use super::sender::Sender;
use super::timer::RetryTimer;

pub struct TransportManager {
    ctx: Arc<TransportContext>,
    registry: Arc<PeerRegistry>,
    secure: Arc<Listener>,
    insecure: Arc<Listener>,
    reader: Arc<Reader>,
    scanner: Arc<ScanOrchestrator>,
}

impl TransportManager {
    pub fn new(
        platform: Arc<dyn BtPlatform>,
        collaborators: Collaborators,
        settings: TransportSettings,
        events: mpsc::UnboundedSender<TransportEvent>,
        runtime: Handle,
    ) -> Arc<Self> {
        let ctx = Arc::new(TransportContext::new(
            platform,
            collaborators,
            settings,
            events,
            runtime,
        ));
        Arc::new(Self {
            registry: PeerRegistry::new(ctx.clone()),
            secure: Arc::new(Listener::new(SecurityMode::Secure)),
            insecure: Arc::new(Listener::new(SecurityMode::Insecure)),
            reader: Arc::new(Reader::new()),
            scanner: Arc::new(ScanOrchestrator::new()),
            ctx,
        })
    }

    /// Load the cached local MAC and start listening.
    pub fn init(&self) {
        info!("Initializing Bluetooth transport");
        match self.ctx.store.cached_local_mac() {
            Ok(mac) => {
                debug!("Cached local MAC: {:?}", mac);
                self.ctx.state.load_local_mac(mac);
            }
            Err(e) => warn!("Failed to read cached local MAC: {}", e),
        }
        self.on_resume();
    }

    /// (Re)start both listeners and nudge every Sender. Safe to call
    /// repeatedly; live workers are left alone.
    pub fn on_resume(&self) {
        if !self.ctx.may_start() {
            debug!("on_resume(): Bluetooth unusable");
            return;
        }
        self.secure.start(&self.ctx, &self.reader);
        self.insecure.start(&self.ctx, &self.reader);
        if self.reader.pending() > 0 {
            self.reader.ensure_started(&self.ctx);
        }
        self.registry.wake_all();
    }

    /// Stop listening and reading. Senders run out on their own.
    pub fn stop(&self) {
        info!("Stopping Bluetooth transport");
        self.secure.stop();
        self.insecure.stop();
        self.reader.stop();
        self.scanner.stop();
    }

    /// Turn the transport on or off. Disabling also ends every Sender.
    pub fn set_enabled(&self, enabled: bool) {
        self.ctx.state.set_disabled(!enabled);
        if enabled {
            self.on_resume();
        } else {
            self.stop();
            self.registry.wake_all();
        }
    }

    /// The process is in the foreground again; lift a background
    /// restriction.
    pub fn set_am_foreground(&self) {
        if self.ctx.state.is_background_restricted() {
            info!("Foregrounded; Bluetooth allowed again");
        }
        self.ctx.state.set_background_restricted(false);
    }

    /// Run `timer` against this manager: every firing resumes the
    /// transport.
    pub fn attach_retry_timer(self: &Arc<Self>, timer: &Arc<RetryTimer>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        timer.spawn(&self.ctx.runtime, move || match manager.upgrade() {
            Some(manager) => {
                manager.on_resume();
                true
            }
            None => false,
        })
    }

    /// Queue a game message for `name`. Dropped unless `name` is a bonded
    /// candidate. Returns whether it was queued.
    pub async fn send_packet(
        &self,
        name: &str,
        addr: Option<&str>,
        game_id: u32,
        buf: &[u8],
        msg_id: Option<&str>,
    ) -> bool {
        debug!("send_packet(): name: {}; addr: {:?}", name, addr);
        if !self.ctx.bluetooth_usable().await {
            debug!("send_packet(): Bluetooth unusable; dropping");
            return false;
        }
        if !self.is_active_peer(name).await {
            debug!("send_packet(): addressee {} unknown so dropping", name);
            return false;
        }
        self.sender_for(name, addr)
            .await
            .enqueue_message(game_id, buf, msg_id)
    }

    /// Tell `name` that a game is gone on this side.
    pub async fn game_died(&self, name: &str, addr: Option<&str>, game_id: u32) -> bool {
        self.sender_for(name, addr).await.enqueue_game_gone(game_id)
    }

    /// Ask `name` whether it still has `game_id`.
    pub async fn ping_host(&self, name: &str, addr: Option<&str>, game_id: u32) -> bool {
        self.sender_for(name, addr).await.enqueue_ping(game_id)
    }

    pub async fn send_invite(&self, name: &str, addr: Option<&str>, invite: &Invite) -> bool {
        self.sender_for(name, addr).await.enqueue_invite(invite)
    }

    async fn sender_for(&self, name: &str, addr: Option<&str>) -> Arc<Sender> {
        let addr = self.registry.safe_addr(name, addr).await;
        self.registry.get_or_create(name, addr.as_deref())
    }

    async fn is_active_peer(&self, name: &str) -> bool {
        let result = self
            .candidates()
            .await
            .iter()
            .any(|device| device.name.as_deref() == Some(name));
        debug!("is_active_peer({}) => {}", name, result);
        result
    }

    /// Ping every candidate device. Returns how many are being pinged;
    /// a scan already running is left alone.
    pub async fn scan(&self, timeout: Option<Duration>) -> usize {
        let devices = self.candidates().await;
        let count = devices.len();
        if count > 0 {
            let timeout = timeout.unwrap_or(self.ctx.settings.scan_timeout);
            self.scanner.start_once(&self.ctx, devices, timeout);
        }
        count
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_running()
    }

    pub fn add_scan_listener(&self, listener: Arc<dyn ScanListener>) {
        self.ctx.scan_listeners.add(listener);
    }

    pub fn remove_scan_listener(&self, listener: &Arc<dyn ScanListener>) -> bool {
        self.ctx.scan_listeners.remove(listener)
    }

    /// Bonded devices that may run the game.
    pub async fn candidates(&self) -> Vec<RemoteDevice> {
        if !self.ctx.may_start() {
            return Vec::new();
        }
        match scan::candidates(self.ctx.platform.as_ref()).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to list bonded devices: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn name_for_addr(&self, addr: &str) -> Option<String> {
        match self.ctx.platform.remote_device(addr).await {
            Ok(device) => device.and_then(|d| d.name),
            Err(e) => {
                debug!("name_for_addr({}): {}", addr, e);
                None
            }
        }
    }

    /// Local adapter name and address. The address falls back to the one
    /// peers reported to us when the adapter hides it.
    pub fn local_name_and_address(&self) -> Option<(Option<String>, Option<String>)> {
        let platform = &self.ctx.platform;
        if !platform.is_available() {
            return None;
        }
        let addr = platform
            .adapter_address()
            .filter(|a| !is_bogus_addr(a))
            .or_else(|| self.ctx.state.local_mac());
        Some((platform.adapter_name(), addr))
    }

    /// Hand over a socket accepted outside the listeners.
    pub fn accept(&self, socket: PeerSocket) {
        self.reader.handle(&self.ctx, socket);
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn local_mac(&self) -> Option<String> {
        self.ctx.state.local_mac()
    }

    pub fn is_listening(&self) -> bool {
        self.secure.is_running() && self.insecure.is_running()
    }
}

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

//! In-memory adapter and collaborators for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};

use super::context::{Collaborators, TransportContext, TransportEvent, TransportSettings};
use super::delegate::{
    DeliveryOutcome, GameCore, InvitationOutcome, Invite, KeyValueStore, RetryScheduler,
    ScanListener, StatusReporter,
};
use super::platform::{
    BtPlatform, PeerSocket, RemoteDevice, RfcommAcceptor, SecurityMode, ServiceRecord,
};

pub(crate) const LOCAL_MAC: &str = "00:11:22:33:44:55";

/// How a scripted peer answers an outbound connection.
#[derive(Debug, Clone)]
pub(crate) enum PeerScript {
    /// Every connect attempt is refused.
    Refuse,
    /// Accepts and reads the frame, never answers.
    Silent,
    /// Reads the frame, writes these bytes and hangs up.
    Reply(Vec<u8>),
}

pub(crate) struct FakePlatform {
    enabled: AtomicBool,
    bonded: Mutex<Vec<RemoteDevice>>,
    scripts: Mutex<HashMap<String, PeerScript>>,
    connects: Mutex<Vec<(String, SecurityMode)>>,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    acceptors: Mutex<HashMap<SecurityMode, mpsc::UnboundedSender<PeerSocket>>>,
    listens: Mutex<HashMap<SecurityMode, usize>>,
    listen_error: Mutex<Option<io::ErrorKind>>,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            bonded: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            connects: Mutex::new(Vec::new()),
            frames: Arc::new(Mutex::new(Vec::new())),
            acceptors: Mutex::new(HashMap::new()),
            listens: Mutex::new(HashMap::new()),
            listen_error: Mutex::new(None),
        }
    }

    pub(crate) fn add_peer(&self, device: RemoteDevice, script: PeerScript) {
        self.scripts.lock().insert(device.address.clone(), script);
        self.bonded.lock().push(device);
    }

    pub(crate) fn set_script(&self, address: &str, script: PeerScript) {
        self.scripts.lock().insert(address.to_string(), script);
    }

    pub(crate) fn clear_peers(&self) {
        self.bonded.lock().clear();
        self.scripts.lock().clear();
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn set_listen_error(&self, kind: Option<io::ErrorKind>) {
        *self.listen_error.lock() = kind;
    }

    /// Frames written by outbound connections, in order.
    pub(crate) fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub(crate) fn connect_modes(&self) -> Vec<SecurityMode> {
        self.connects.lock().iter().map(|(_, mode)| *mode).collect()
    }

    pub(crate) fn listen_count(&self, mode: SecurityMode) -> usize {
        self.listens.lock().get(&mode).copied().unwrap_or(0)
    }

    /// Whether the most recent server channel for `mode` has been closed.
    pub(crate) fn acceptor_closed(&self, mode: SecurityMode) -> bool {
        self.acceptors
            .lock()
            .get(&mode)
            .map_or(true, |tx| tx.is_closed())
    }

    /// Connect to our own listener as `remote`; returns the caller's end.
    pub(crate) fn dial_in(&self, mode: SecurityMode, remote: RemoteDevice) -> io::Result<DuplexStream> {
        let acceptors = self.acceptors.lock();
        let tx = acceptors
            .get(&mode)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let (client, server) = duplex(8192);
        tx.send(PeerSocket::new(server, remote))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(client)
    }
}

/// Plays the remote end of one outbound connection.
async fn run_peer(mut stream: DuplexStream, script: PeerScript, frames: Arc<Mutex<Vec<Vec<u8>>>>) {
    let mut header = [0u8; 3];
    if stream.read_exact(&mut header).await.is_err() {
        return;
    }
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut payload = vec![0u8; len];
    if stream.read_exact(&mut payload).await.is_err() {
        return;
    }
    let mut frame = header.to_vec();
    frame.extend(payload);
    frames.lock().push(frame);

    match script {
        PeerScript::Reply(bytes) => {
            let _ = stream.write_all(&bytes).await;
            let _ = stream.flush().await;
        }
        _ => {
            // hold the connection until the sender gives up on it
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        }
    }
}

struct FakeAcceptor {
    rx: mpsc::UnboundedReceiver<PeerSocket>,
}

#[async_trait]
impl RfcommAcceptor for FakeAcceptor {
    async fn accept(&mut self) -> io::Result<PeerSocket> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

#[async_trait]
impl BtPlatform for FakePlatform {
    fn is_available(&self) -> bool {
        true
    }

    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn has_permissions(&self) -> bool {
        true
    }

    async fn bonded_devices(&self) -> io::Result<Vec<RemoteDevice>> {
        Ok(self.bonded.lock().clone())
    }

    async fn remote_device(&self, address: &str) -> io::Result<Option<RemoteDevice>> {
        Ok(self
            .bonded
            .lock()
            .iter()
            .find(|device| device.address == address)
            .cloned())
    }

    async fn connect(
        &self,
        device: &RemoteDevice,
        mode: SecurityMode,
        _service: &ServiceRecord,
    ) -> io::Result<PeerSocket> {
        self.connects.lock().push((device.address.clone(), mode));
        let script = self.scripts.lock().get(&device.address).cloned();
        match script {
            None | Some(PeerScript::Refuse) => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            Some(script) => {
                let (local, remote) = duplex(8192);
                tokio::spawn(run_peer(remote, script, self.frames.clone()));
                Ok(PeerSocket::new(local, device.clone()))
            }
        }
    }

    async fn listen(
        &self,
        mode: SecurityMode,
        _service: &ServiceRecord,
    ) -> io::Result<Box<dyn RfcommAcceptor>> {
        if let Some(kind) = *self.listen_error.lock() {
            return Err(io::Error::from(kind));
        }
        *self.listens.lock().entry(mode).or_insert(0) += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.acceptors.lock().insert(mode, tx);
        Ok(Box::new(FakeAcceptor { rx }))
    }

    fn adapter_name(&self) -> Option<String> {
        Some("fake-adapter".to_string())
    }
}

/// Game core keeping everything in memory. Invites travel as JSON.
#[derive(Default)]
pub(crate) struct RecordingGame {
    games: Mutex<HashSet<u32>>,
    messages: Mutex<Vec<(u32, Vec<u8>, String)>>,
    invites: Mutex<Vec<(Invite, String)>>,
}

impl RecordingGame {
    pub(crate) fn add_game(&self, game_id: u32) {
        self.games.lock().insert(game_id);
    }

    pub(crate) fn messages(&self) -> Vec<(u32, Vec<u8>, String)> {
        self.messages.lock().clone()
    }

    pub(crate) fn invites(&self) -> Vec<Invite> {
        self.invites.lock().iter().map(|(i, _)| i.clone()).collect()
    }
}

impl GameCore for RecordingGame {
    fn game_exists(&self, game_id: u32) -> bool {
        self.games.lock().contains(&game_id)
    }

    fn encode_invite(&self, invite: &Invite) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(invite)?)
    }

    fn decode_invite(&self, data: &[u8]) -> Result<Invite> {
        Ok(serde_json::from_slice(data)?)
    }

    fn parse_legacy_invite(&self, text: &str) -> Result<Invite> {
        Ok(serde_json::from_str(text)?)
    }

    fn deliver_message(&self, game_id: u32, body: &[u8], from: &RemoteDevice) -> DeliveryOutcome {
        if !self.game_exists(game_id) {
            return DeliveryOutcome::GameGone;
        }
        self.messages
            .lock()
            .push((game_id, body.to_vec(), from.address.clone()));
        DeliveryOutcome::Accepted
    }

    fn handle_invitation(&self, invite: &Invite, from: &RemoteDevice) -> InvitationOutcome {
        let mut invites = self.invites.lock();
        if invites
            .iter()
            .any(|(seen, addr)| seen.game_id == invite.game_id && *addr == from.address)
        {
            return InvitationOutcome::Duplicate;
        }
        invites.push((invite.clone(), from.address.clone()));
        self.games.lock().insert(invite.game_id);
        InvitationOutcome::Accepted
    }
}

#[derive(Default)]
pub(crate) struct RecordingStatus {
    inbound: Mutex<Vec<bool>>,
    outbound: Mutex<Vec<bool>>,
}

impl RecordingStatus {
    pub(crate) fn inbound(&self) -> Vec<bool> {
        self.inbound.lock().clone()
    }

    pub(crate) fn outbound(&self) -> Vec<bool> {
        self.outbound.lock().clone()
    }
}

impl StatusReporter for RecordingStatus {
    fn report_inbound(&self, success: bool) {
        self.inbound.lock().push(success);
    }

    fn report_outbound(&self, success: bool) {
        self.outbound.lock().push(success);
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    mac: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for MemoryStore {
    fn cached_local_mac(&self) -> Result<Option<String>> {
        Ok(self.mac.lock().clone())
    }

    fn set_cached_local_mac(&self, mac: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.mac.lock() = Some(mac.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct CountingRetry {
    count: AtomicUsize,
}

impl CountingRetry {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl RetryScheduler for CountingRetry {
    fn on_inbound_success(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct RecordingScanListener {
    scanned: Mutex<Vec<String>>,
    done: AtomicUsize,
    done_signal: Notify,
}

impl RecordingScanListener {
    pub(crate) fn scanned(&self) -> Vec<String> {
        self.scanned.lock().clone()
    }

    pub(crate) fn done_count(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_done(&self) {
        while self.done_count() == 0 {
            self.done_signal.notified().await;
        }
    }
}

impl ScanListener for RecordingScanListener {
    fn on_device_scanned(&self, device: &RemoteDevice) {
        self.scanned.lock().push(device.display_name().to_string());
    }

    fn on_scan_done(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
        self.done_signal.notify_one();
    }
}

pub(crate) struct Fakes {
    pub(crate) game: Arc<RecordingGame>,
    pub(crate) status: Arc<RecordingStatus>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) retry: Arc<CountingRetry>,
}

impl Fakes {
    pub(crate) fn new() -> Self {
        Self {
            game: Arc::new(RecordingGame::default()),
            status: Arc::new(RecordingStatus::default()),
            store: Arc::new(MemoryStore::default()),
            retry: Arc::new(CountingRetry::default()),
        }
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            game: self.game.clone(),
            status: self.status.clone(),
            store: self.store.clone(),
            retry: self.retry.clone(),
        }
    }
}

/// Context over `platform` on the current runtime. With `known_mac` the
/// local MAC is already learned, so new Senders don't queue a MAC_ASK.
pub(crate) fn test_context(
    platform: Arc<FakePlatform>,
    known_mac: bool,
) -> (
    Arc<TransportContext>,
    Fakes,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let fakes = Fakes::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ctx = TransportContext::new(
        platform,
        fakes.collaborators(),
        TransportSettings::default(),
        events_tx,
        Handle::current(),
    );
    if known_mac {
        ctx.state().load_local_mac(Some(LOCAL_MAC.to_string()));
    }
    (Arc::new(ctx), fakes, events_rx)
}

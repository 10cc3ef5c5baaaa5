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

//! Per-peer outbound worker.
//!
//! A Sender batches everything queued for one peer into a single frame,
//! dials the peer, writes the frame and reads one reply per message. Failed
//! connects back off quadratically; new data resets the backoff.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::context::{TransportContext, TransportEvent};
use super::delegate::Invite;
use super::error::{classify, ErrorClass, ProtocolError, TransportError};
use super::platform::{is_bogus_addr, PeerSocket, PeerStream, RemoteDevice, SecurityMode};
use super::protocol::{
    encode_frame, payload_digest, read_reply, Command, InvitePayload, Message, Reply,
    MAX_MESSAGES_PER_FRAME, MAX_PACKET_LEN, PAYLOAD_HEADER_LEN,
};
use super::registry::PeerRegistry;

/// Backoff after `fail_count` consecutive failures, less the time already
/// spent since the last one.
pub fn backoff_wait(fail_count: u32, since_last_fail: Duration) -> Duration {
    let fail_count = u64::from(fail_count);
    Duration::from_millis(1000u64.saturating_mul(fail_count.saturating_mul(fail_count)))
        .saturating_sub(since_last_fail)
}

/// What the run loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Exit,
    /// Sleep until woken, or at most the given duration.
    Wait(Option<Duration>),
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Enqueued {
    Queued,
    Duplicate,
    NoSpace,
    Closed,
}

/// One encoded command waiting for delivery.
#[derive(Debug, Clone)]
struct QueuedCommand {
    cmd: Command,
    game_id: u32,
    msg_id: Option<String>,
    /// `cmd | bodyLen | body`, exactly as written into a frame.
    data: Vec<u8>,
    stamp: Instant,
    local_id: u64,
}

impl QueuedCommand {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn is_same_as(&self, other: &QueuedCommand) -> bool {
        let same = self.cmd == other.cmd && self.game_id == other.game_id && self.data == other.data;
        if same {
            if let Some(msg_id) = &self.msg_id {
                if other.msg_id.as_ref() != Some(msg_id) {
                    debug!(
                        "Identical {} but msg ids differ: new {} vs old {:?}",
                        self.cmd.as_str(),
                        msg_id,
                        other.msg_id
                    );
                }
            }
        }
        same
    }
}

#[derive(Debug, Default)]
struct SenderQueue {
    elems: VecDeque<QueuedCommand>,
    length: usize,
    fail_count: u32,
    last_fail: Option<Instant>,
    counter: u64,
    exit_when_empty: bool,
    die_at: Option<Instant>,
    finished: bool,
}

impl SenderQueue {
    fn push(&mut self, mut elem: QueuedCommand) -> Enqueued {
        if self.finished {
            return Enqueued::Closed;
        }
        // whatever is queued must still fit one frame's payload
        if PAYLOAD_HEADER_LEN + self.length + elem.size() >= MAX_PACKET_LEN {
            return Enqueued::NoSpace;
        }

        // new data earns an immediate retry, even when it's a dupe
        self.fail_count = 0;

        if self.elems.iter().any(|queued| elem.is_same_as(queued)) {
            return Enqueued::Duplicate;
        }

        elem.local_id = self.counter;
        self.counter += 1;
        self.length += elem.size();
        self.elems.push_back(elem);
        Enqueued::Queued
    }

    fn unappend(&mut self, count: usize) {
        for elem in self.elems.drain(..count.min(self.elems.len())) {
            self.length -= elem.size();
        }
        self.fail_count = 0;
    }

    fn record_failure(&mut self, now: Instant) {
        self.fail_count += 1;
        self.last_fail = Some(now);
    }

    /// `None` means nothing to send; sleep until woken.
    fn figure_wait(&self, now: Instant) -> Option<Duration> {
        if self.elems.is_empty() {
            None
        } else if self.fail_count == 0 {
            Some(Duration::ZERO)
        } else {
            let since = self
                .last_fail
                .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
            Some(backoff_wait(self.fail_count, since))
        }
    }

    fn next_step(&self, now: Instant) -> Step {
        if self.exit_when_empty && self.elems.is_empty() {
            return Step::Exit;
        }
        if self.die_at.map_or(false, |at| now >= at) {
            return Step::Exit;
        }

        let wait = self.figure_wait(now);
        if wait == Some(Duration::ZERO) {
            return Step::Send;
        }

        // never sleep past the lifetime deadline
        match (wait, self.die_at) {
            (Some(wait), Some(at)) => Step::Wait(Some(wait.min(at - now))),
            (None, Some(at)) => Step::Wait(Some(at - now)),
            (wait, None) => Step::Wait(wait),
        }
    }
}

/// Outbound queue and connection loop for one peer.
pub struct Sender {
    name: String,
    addr: Option<String>,
    ctx: Arc<TransportContext>,
    queue: Mutex<SenderQueue>,
    wake: Notify,
    connect_timeout: Duration,
}

impl Sender {
    /// Create a Sender for `name`. If our own MAC is still unknown, the
    /// first frame asks the peer for it.
    pub fn new(ctx: Arc<TransportContext>, name: impl Into<String>, addr: Option<String>) -> Arc<Self> {
        let connect_timeout = ctx.settings.connect_timeout;
        Self::with_connect_timeout(ctx, name, addr, connect_timeout)
    }

    pub fn with_connect_timeout(
        ctx: Arc<TransportContext>,
        name: impl Into<String>,
        addr: Option<String>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let sender = Arc::new(Self {
            name: name.into(),
            addr,
            ctx,
            queue: Mutex::new(SenderQueue::default()),
            wake: Notify::new(),
            connect_timeout,
        });
        if sender.ctx.state.local_mac().is_none() {
            sender.append(Message::MacAsk, 0, None);
        }
        sender
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn enqueue_ping(&self, game_id: u32) -> bool {
        self.append(Message::Ping { game_id }, game_id, None)
    }

    pub fn enqueue_message(&self, game_id: u32, body: &[u8], msg_id: Option<&str>) -> bool {
        let message = Message::Send {
            game_id,
            data: body.to_vec(),
        };
        self.append(message, game_id, msg_id)
    }

    pub fn enqueue_game_gone(&self, game_id: u32) -> bool {
        self.append(Message::GameGone { game_id }, game_id, None)
    }

    pub fn enqueue_invite(&self, invite: &Invite) -> bool {
        match self.ctx.game.encode_invite(invite) {
            Ok(blob) => self.append(
                Message::Invite(InvitePayload::Binary(blob)),
                invite.game_id,
                None,
            ),
            Err(e) => {
                error!("Failed to encode invite for game {}: {}", invite.game_id, e);
                false
            }
        }
    }

    /// Exit as soon as the queue drains.
    pub fn mark_exit_when_empty(&self) -> &Self {
        self.queue.lock().exit_when_empty = true;
        self.wake.notify_one();
        self
    }

    /// Exit once `lifetime` has passed, whatever is still queued.
    pub fn mark_lifetime(&self, lifetime: Duration) -> &Self {
        self.queue.lock().die_at = Some(Instant::now() + lifetime);
        self.wake.notify_one();
        self
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().elems.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().length
    }

    pub fn fail_count(&self) -> u32 {
        self.queue.lock().fail_count
    }

    /// Whether the run loop has exited. A finished Sender accepts nothing.
    pub fn is_finished(&self) -> bool {
        self.queue.lock().finished
    }

    /// Decide the next loop action as of `now`.
    pub fn next_step(&self, now: Instant) -> Step {
        let mut queue = self.queue.lock();
        let step = queue.next_step(now);
        if step == Step::Exit {
            queue.finished = true;
        }
        step
    }

    fn append(&self, message: Message, game_id: u32, msg_id: Option<&str>) -> bool {
        let data = match message.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!("{}: can't encode {}: {}", self.name, message.command().as_str(), e);
                return false;
            }
        };
        let elem = QueuedCommand {
            cmd: message.command(),
            game_id,
            msg_id: msg_id.map(str::to_string),
            data,
            stamp: Instant::now(),
            local_id: 0,
        };

        let outcome = self.queue.lock().push(elem);
        match outcome {
            Enqueued::Queued => {
                self.wake.notify_one();
                true
            }
            Enqueued::Duplicate => {
                debug!("{}: dropping dupe {}", self.name, message.command().as_str());
                self.wake.notify_one();
                true
            }
            Enqueued::NoSpace => {
                warn!(
                    "{}: no room for {} ({} bytes queued)",
                    self.name,
                    message.command().as_str(),
                    self.queued_bytes()
                );
                false
            }
            Enqueued::Closed => {
                debug!("{}: already exited; rejecting {}", self.name, message.command().as_str());
                false
            }
        }
    }

    fn record_failure(&self) {
        self.queue.lock().record_failure(Instant::now());
    }

    fn unappend(&self, count: usize) {
        let mut queue = self.queue.lock();
        queue.unappend(count);
        debug!(
            "{}: removed {}, {} left for size {}",
            self.name,
            count,
            queue.elems.len(),
            queue.length
        );
    }

    /// Start the run loop. A registry-owned Sender removes itself from the
    /// registry on exit; transient ones pass `None`.
    pub fn spawn(self: &Arc<Self>, registry: Option<Weak<PeerRegistry>>) -> JoinHandle<usize> {
        let sender = self.clone();
        self.ctx.runtime.spawn(async move {
            let responses = sender.run().await;
            if let Some(registry) = registry.and_then(|r| r.upgrade()) {
                registry.remove(&sender);
            }
            responses
        })
    }

    async fn run(&self) -> usize {
        info!("Sender starting for {}", self);
        let mut responses = 0;

        loop {
            if !self.ctx.bluetooth_usable().await {
                self.queue.lock().finished = true;
                break;
            }
            match self.next_step(Instant::now()) {
                Step::Exit => break,
                Step::Wait(wait) => {
                    debug!("{}: waiting {:?}", self.name, wait);
                    self.sleep(wait).await;
                }
                Step::Send => responses += self.try_send().await,
            }
        }

        info!("Sender finishing for {} after {} replies", self, responses);
        responses
    }

    async fn sleep(&self, wait: Option<Duration>) {
        match wait {
            Some(wait) => {
                let _ = timeout(wait, self.wake.notified()).await;
            }
            None => self.wake.notified().await,
        }
    }

    /// One connect, write and read-replies cycle. Returns replies obtained.
    async fn try_send(&self) -> usize {
        let socket = match self.open_socket().await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{}: send failed: {}", self.name, e);
                self.record_failure();
                self.ctx.status.report_outbound(false);
                return 0;
            }
        };

        self.ctx.scan_listeners.device_scanned(&socket.remote);

        let done = self.write_and_check(socket).await;
        if done == 0 {
            self.record_failure();
            self.ctx.status.report_outbound(false);
        } else {
            self.unappend(done);
            self.ctx.status.report_outbound(true);
        }
        done
    }

    async fn open_socket(&self) -> Result<PeerSocket, TransportError> {
        let remote = self.resolve_device().await?;
        self.connect(&remote).await
    }

    /// Prefer the known address; fall back to a bonded device with our name.
    async fn resolve_device(&self) -> Result<RemoteDevice, TransportError> {
        let platform = &self.ctx.platform;
        if let Some(addr) = self.addr.as_deref().filter(|a| !a.is_empty() && !is_bogus_addr(a)) {
            match platform.remote_device(addr).await {
                Ok(Some(device)) => return Ok(device),
                Ok(None) => debug!("{}: adapter doesn't know {}", self.name, addr),
                Err(e) => debug!("{}: lookup of {} failed: {}", self.name, addr, e),
            }
        }

        platform
            .bonded_devices()
            .await?
            .into_iter()
            .find(|device| device.name.as_deref() == Some(self.name.as_str()))
            .ok_or_else(|| TransportError::UnknownPeer(self.name.clone()))
    }

    async fn connect(&self, remote: &RemoteDevice) -> Result<PeerSocket, TransportError> {
        let settings = &self.ctx.settings;
        let deadline = Instant::now() + self.connect_timeout;
        debug!("connect({}, timeout={:?}) starting", remote, self.connect_timeout);

        let mut attempts = 0u32;
        loop {
            let mode = SecurityMode::for_attempt(attempts);
            attempts += 1;

            let left = deadline.saturating_duration_since(Instant::now());
            match timeout(left, self.ctx.platform.connect(remote, mode, &settings.service)).await {
                Ok(Ok(socket)) => {
                    info!(
                        "connect({}) succeeded after {} tries ({})",
                        remote,
                        attempts,
                        mode.as_str()
                    );
                    return Ok(socket);
                }
                Ok(Err(e)) => match classify(&e) {
                    ErrorClass::Fatal => return Err(e.into()),
                    ErrorClass::Retryable | ErrorClass::BackgroundRestricted => {
                        debug!("connect({}) {} try {}: {}", remote, mode.as_str(), attempts, e)
                    }
                },
                Err(_) => debug!("connect({}) {} try {} timed out", remote, mode.as_str(), attempts),
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(TransportError::ConnectTimeout {
                    peer: remote.to_string(),
                    attempts,
                });
            }
            sleep(settings.connect_retry.min(left)).await;
        }
    }

    /// Write the queued batch and read its replies. Returns how many
    /// replies were obtained; the socket is closed on return.
    async fn write_and_check(&self, socket: PeerSocket) -> usize {
        let PeerSocket { mut stream, remote } = socket;

        let (sent, frame) = {
            let queue = self.queue.lock();
            let batch: Vec<&QueuedCommand> =
                queue.elems.iter().take(MAX_MESSAGES_PER_FRAME).collect();
            let sent: Vec<(Command, u32)> = batch.iter().map(|e| (e.cmd, e.game_id)).collect();
            (sent, encode_frame(batch.iter().map(|e| e.data.as_slice())))
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("{}: failed to build frame: {}", self.name, e);
                return 0;
            }
        };

        let written: std::io::Result<()> = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("{}: write to {} failed: {}", self.name, remote, e);
            return 0;
        }
        debug!(
            "Wrote {} msgs as {}-byte payload with sum {} (for {})",
            sent.len(),
            frame.len() - 3,
            payload_digest(&frame[3..]),
            self
        );

        let mut done = 0;
        let reply_phase = self.read_replies(&mut *stream, &remote, &sent, &mut done);
        match timeout(self.ctx.settings.reply_timeout, reply_phase).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: failed reading replies: {}", self.name, e),
            Err(_) => warn!(
                "{}: no replies from {} within {:?}; closing socket",
                self.name, remote, self.ctx.settings.reply_timeout
            ),
        }
        drop(stream);

        debug!("{}: write_and_check() => {}", self.name, done);
        done
    }

    async fn read_replies(
        &self,
        stream: &mut dyn PeerStream,
        remote: &RemoteDevice,
        sent: &[(Command, u32)],
        done: &mut usize,
    ) -> Result<(), ProtocolError> {
        for (index, &(cmd, game_id)) in sent.iter().enumerate() {
            let Some(reply) = read_reply(&mut *stream, cmd).await? else {
                break;
            };
            debug!(
                "{}: got {} to cmd[{}] {}",
                self.name,
                reply.command().as_str(),
                index,
                cmd.as_str()
            );
            self.handle_reply(cmd, game_id, reply, remote);
            *done += 1;
        }
        Ok(())
    }

    fn handle_reply(&self, sent: Command, game_id: u32, reply: Reply, remote: &RemoteDevice) {
        let event = match (sent, reply) {
            (_, Reply::BadProto) => Some(TransportEvent::BadProto {
                peer: remote.display_name().to_string(),
            }),
            (Command::MesgSend | Command::MesgGameGone, Reply::MessageAccepted) => {
                Some(TransportEvent::MessageAccepted {
                    game_id,
                    peer: self.name.clone(),
                })
            }
            (Command::MesgSend | Command::MesgGameGone, Reply::MessageGameGone) => {
                Some(TransportEvent::MessageNoGame {
                    game_id,
                    via_peer: Some(self.name.clone()),
                })
            }
            (Command::Invite, Reply::InviteAccepted) => {
                Some(TransportEvent::NewGameSuccess { game_id })
            }
            (Command::Invite, Reply::InviteDupId) => Some(TransportEvent::NewGameDupRejected {
                peer: self.name.clone(),
            }),
            (Command::Invite, _) => Some(TransportEvent::NewGameFailure { game_id }),
            (Command::Ping, Reply::Pong { game_absent: true }) => {
                Some(TransportEvent::MessageNoGame {
                    game_id,
                    via_peer: None,
                })
            }
            (Command::Ping, Reply::Pong { game_absent: false }) => None,
            (Command::MacAsk, Reply::MacReply(mac)) => {
                self.ctx.adopt_local_mac(&mac);
                None
            }
            (sent, reply) => {
                warn!(
                    "{}: unhandled reply {} to {}",
                    self.name,
                    reply.command().as_str(),
                    sent.as_str()
                );
                None
            }
        };

        if let Some(event) = event {
            self.ctx.emit(event);
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        write!(
            f,
            "{{name: {}, addr: {}, failCount: {}, len: {}",
            self.name,
            self.addr.as_deref().unwrap_or("<none>"),
            queue.fail_count,
            queue.length
        )?;

        if let (Some(first), Some(last)) = (queue.elems.front(), queue.elems.back()) {
            let cmds: Vec<&str> = queue.elems.iter().map(|e| e.cmd.as_str()).collect();
            write!(
                f,
                ", age: {}ms, ids: {}-{}, cmds: {}",
                first.stamp.elapsed().as_millis(),
                first.local_id,
                last.local_id,
                cmds.join(",")
            )?;
        }
        write!(f, "}}")
    }
}

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

//! Inbound frame handling.
//!
//! Accepted sockets are queued FIFO and handled one at a time by a single
//! task, so the game core never sees two inbound messages concurrently.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::context::{TransportContext, TransportEvent};
use super::delegate::{DeliveryOutcome, InvitationOutcome, Invite};
use super::error::{ProtocolError, TransportError};
use super::platform::{PeerSocket, PeerStream, RemoteDevice};
use super::protocol::{
    decode_payload, payload_digest, InvitePayload, Message, Reply, LEGACY_PROTOCOL_VERSION,
    MAX_PACKET_LEN, PROTOCOL_VERSION,
};
use super::slot::{SingletonSlot, SlotClaim};

/// Single consumer of accepted sockets.
pub struct Reader {
    slot: SingletonSlot,
    queue_tx: async_channel::Sender<PeerSocket>,
    queue_rx: async_channel::Receiver<PeerSocket>,
}

impl Reader {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        Self {
            slot: SingletonSlot::new("reader"),
            queue_tx,
            queue_rx,
        }
    }

    /// Queue an accepted socket, starting the Reader if needed.
    pub fn handle(self: &Arc<Self>, ctx: &Arc<TransportContext>, socket: PeerSocket) {
        debug!("Queueing socket from {}", socket.remote);
        if let Err(e) = self.queue_tx.try_send(socket) {
            error!("Failed to queue inbound socket: {}", e);
            return;
        }
        self.ensure_started(ctx);
    }

    pub fn ensure_started(self: &Arc<Self>, ctx: &Arc<TransportContext>) -> bool {
        let Some(claim) = self.slot.try_claim() else {
            return false;
        };
        let reader = self.clone();
        let ctx_clone = ctx.clone();
        ctx.runtime.spawn(async move {
            reader.run(claim, ctx_clone).await;
        });
        true
    }

    /// Stop the worker. Queued sockets stay queued for the next start.
    pub fn stop(&self) -> bool {
        self.slot.stop()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_live()
    }

    /// Sockets waiting to be read.
    pub fn pending(&self) -> usize {
        self.queue_rx.len()
    }

    async fn run(&self, claim: SlotClaim, ctx: Arc<TransportContext>) {
        info!("Reader starting");
        while self.slot.is_current(claim.id) {
            let socket = tokio::select! {
                biased;
                _ = claim.token.cancelled() => break,
                socket = self.queue_rx.recv() => match socket {
                    Ok(socket) => socket,
                    Err(_) => break,
                },
            };

            let remote = socket.remote.clone();
            if let Err(e) = process_socket(&ctx, socket).await {
                warn!("Failed handling connection from {}: {}", remote, e);
            }
            debug!("Closed connection from {}", remote);
        }
        self.slot.release(claim.id);
        info!("Reader exiting");
    }
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

async fn process_socket(ctx: &TransportContext, socket: PeerSocket) -> Result<(), TransportError> {
    let PeerSocket { mut stream, remote } = socket;
    let limit = ctx.settings.inbound_timeout;

    let version = timeout(limit, stream.read_u8())
        .await
        .map_err(|_| TransportError::Timeout("protocol version"))??;

    if version != PROTOCOL_VERSION && version != LEGACY_PROTOCOL_VERSION {
        warn!("{} speaks protocol {}; replying BAD_PROTO", remote, version);
        let mut out = Vec::new();
        Reply::BadProto.encode_into(&mut out)?;
        write_back(&mut *stream, &out).await?;
        return Ok(());
    }

    let payload = timeout(limit, read_payload(&mut *stream, version))
        .await
        .map_err(|_| TransportError::Timeout("frame payload"))??;

    ctx.scan_listeners.device_scanned(&remote);

    if let Some(payload) = payload {
        let messages = decode_payload(version, &payload)?;
        debug!(
            "Read {}-byte payload with sum {} containing {} messages",
            payload.len(),
            payload_digest(&payload),
            messages.len()
        );

        let mut out = Vec::new();
        for message in messages {
            let reply = dispatch(ctx, message, &remote, version == LEGACY_PROTOCOL_VERSION);
            reply.encode_into(&mut out)?;
        }
        write_back(&mut *stream, &out).await?;
    }

    ctx.status.report_inbound(true);
    ctx.retry.on_inbound_success();
    Ok(())
}

/// Frame body after the version byte. `None` for a frame that is dropped.
async fn read_payload(
    stream: &mut dyn PeerStream,
    version: u8,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    if version == LEGACY_PROTOCOL_VERSION {
        // old peers give no length: take whatever one read returns
        let mut buf = vec![0u8; MAX_PACKET_LEN];
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            error!("Legacy frame with empty payload");
            return Ok(None);
        }
        buf.truncate(read);
        return Ok(Some(buf));
    }

    let len = stream.read_u16().await? as usize;
    if len >= MAX_PACKET_LEN {
        error!("Packet too big ({} bytes); dropping", len);
        return Ok(None);
    }
    if len == 0 {
        error!("Bad packet? len == 0");
        return Ok(None);
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

fn dispatch(ctx: &TransportContext, message: Message, remote: &RemoteDevice, legacy: bool) -> Reply {
    debug!("Dispatching {} from {}", message.command().as_str(), remote);
    match message {
        Message::Ping { game_id } => {
            let game_absent = game_id != 0 && !ctx.game.game_exists(game_id);
            Reply::Pong { game_absent }
        }
        Message::Invite(payload) => receive_invitation(ctx, payload, remote, legacy),
        Message::Send { game_id, data } => match ctx.game.deliver_message(game_id, &data, remote) {
            DeliveryOutcome::Accepted => Reply::MessageAccepted,
            DeliveryOutcome::GameGone => Reply::MessageGameGone,
        },
        Message::GameGone { game_id } => {
            ctx.emit(TransportEvent::MessageNoGame {
                game_id,
                via_peer: Some(remote.display_name().to_string()),
            });
            Reply::MessageAccepted
        }
        Message::MacAsk => Reply::MacReply(remote.address.clone()),
    }
}

fn receive_invitation(
    ctx: &TransportContext,
    payload: InvitePayload,
    remote: &RemoteDevice,
    legacy: bool,
) -> Reply {
    let invite: anyhow::Result<Invite> = match &payload {
        InvitePayload::Binary(blob) => ctx.game.decode_invite(blob),
        InvitePayload::Legacy(text) => ctx.game.parse_legacy_invite(text),
    };

    let outcome = match invite {
        Ok(invite) => ctx.game.handle_invitation(&invite, remote),
        Err(e) => {
            warn!("Unreadable invitation from {} (legacy: {}): {}", remote, legacy, e);
            InvitationOutcome::Duplicate
        }
    };
    debug!("receive_invitation() => {:?}", outcome);

    match outcome {
        InvitationOutcome::Accepted => Reply::InviteAccepted,
        InvitationOutcome::Duplicate => Reply::InviteDupInvite,
    }
}

async fn write_back(stream: &mut dyn PeerStream, out: &[u8]) -> std::io::Result<()> {
    stream.write_all(out).await?;
    stream.flush().await?;
    if let Err(e) = stream.shutdown().await {
        debug!("shutdown after reply failed: {}", e);
    }
    Ok(())
}

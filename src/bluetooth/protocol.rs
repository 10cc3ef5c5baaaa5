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

//! Wire protocol: frame layout, command set and reply encoding.
//!
//! Current frames look like
//! `version:u8 | payloadLen:u16 | msgCount:u8 | msg1 .. msgN` where each
//! message is `cmd:u8 | bodyLen:u16 | body`. `payloadLen` covers the count
//! byte and every message. Replies travel unframed on the same socket, one
//! per request, in request order. All integers are big-endian.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::error::ProtocolError;

/// Protocol version written by this implementation (batched frames).
pub const PROTOCOL_VERSION: u8 = 2;

/// Single-message protocol spoken by old peers. Decoded, never produced.
pub const LEGACY_PROTOCOL_VERSION: u8 = 1;

/// Exclusive upper bound for a frame payload. Readers drop anything larger.
pub const MAX_PACKET_LEN: usize = 4 * 1024;

/// Payload bytes ahead of the messages: the one-byte message count.
pub const PAYLOAD_HEADER_LEN: usize = 1;

/// Most messages a single frame can carry (the count is one byte).
pub const MAX_MESSAGES_PER_FRAME: usize = u8::MAX as usize;

/// Command codes as they appear on the wire. Gaps are codes that are
/// reserved but never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    BadProto,
    Ping,
    Pong,
    Scan,
    Invite,
    InviteAccpt,
    InviteDupId,
    MesgSend,
    MesgAccpt,
    MesgGameGone,
    InviteDupInvite,
    MacAsk,
    MacReply,
}

impl Command {
    /// Code written on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::BadProto => 0,
            Self::Ping => 1,
            Self::Pong => 2,
            Self::Scan => 3,
            Self::Invite => 4,
            Self::InviteAccpt => 5,
            Self::InviteDupId => 7,
            Self::MesgSend => 9,
            Self::MesgAccpt => 10,
            Self::MesgGameGone => 12,
            Self::InviteDupInvite => 14,
            Self::MacAsk => 15,
            Self::MacReply => 16,
        }
    }

    /// Parse a wire code. Reserved and out-of-range codes yield `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::BadProto),
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            3 => Some(Self::Scan),
            4 => Some(Self::Invite),
            5 => Some(Self::InviteAccpt),
            7 => Some(Self::InviteDupId),
            9 => Some(Self::MesgSend),
            10 => Some(Self::MesgAccpt),
            12 => Some(Self::MesgGameGone),
            14 => Some(Self::InviteDupInvite),
            15 => Some(Self::MacAsk),
            16 => Some(Self::MacReply),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadProto => "BAD_PROTO",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Scan => "SCAN",
            Self::Invite => "INVITE",
            Self::InviteAccpt => "INVITE_ACCPT",
            Self::InviteDupId => "INVITE_DUPID",
            Self::MesgSend => "MESG_SEND",
            Self::MesgAccpt => "MESG_ACCPT",
            Self::MesgGameGone => "MESG_GAMEGONE",
            Self::InviteDupInvite => "INVITE_DUP_INVITE",
            Self::MacAsk => "MAC_ASK",
            Self::MacReply => "MAC_REPLY",
        }
    }
}

/// Legacy codes (`_INVITE_DECL`, `_INVITE_FAILED`, `_MESG_DECL`,
/// `_REMOVE_FOR`) a decoder skips over.
pub fn is_reserved_code(code: u8) -> bool {
    matches!(code, 6 | 8 | 11 | 13)
}

/// Invitation body. Old peers send a UTF-8 string, current ones a
/// length-prefixed binary blob produced by the game core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitePayload {
    Binary(Vec<u8>),
    Legacy(String),
}

/// A request carried inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping { game_id: u32 },
    Invite(InvitePayload),
    Send { game_id: u32, data: Vec<u8> },
    GameGone { game_id: u32 },
    MacAsk,
}

impl Message {
    /// Command code for this message.
    pub fn command(&self) -> Command {
        match self {
            Self::Ping { .. } => Command::Ping,
            Self::Invite(_) => Command::Invite,
            Self::Send { .. } => Command::MesgSend,
            Self::GameGone { .. } => Command::MesgGameGone,
            Self::MacAsk => Command::MacAsk,
        }
    }

    /// Game the message refers to; zero for game-less commands.
    pub fn game_id(&self) -> u32 {
        match self {
            Self::Ping { game_id } | Self::Send { game_id, .. } | Self::GameGone { game_id } => {
                *game_id
            }
            Self::Invite(_) | Self::MacAsk => 0,
        }
    }

    /// Serialize the body (without command byte or length prefix).
    pub fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();
        match self {
            Self::Ping { game_id } | Self::GameGone { game_id } => {
                body.extend_from_slice(&game_id.to_be_bytes());
            }
            Self::Send { game_id, data } => {
                body.extend_from_slice(&game_id.to_be_bytes());
                put_blob(&mut body, data)?;
            }
            Self::Invite(InvitePayload::Binary(data)) => put_blob(&mut body, data)?,
            Self::Invite(InvitePayload::Legacy(text)) => put_blob(&mut body, text.as_bytes())?,
            Self::MacAsk => {}
        }
        Ok(body)
    }

    /// Serialize as `cmd | bodyLen | body`, ready to be batched into a frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = self.encode_body()?;
        let mut out = Vec::with_capacity(body.len() + 3);
        out.push(self.command().code());
        put_blob(&mut out, &body)?;
        Ok(out)
    }

    /// Parse a body for a request command. `legacy` selects the old
    /// string-encoded invitation.
    pub fn decode_body(cmd: Command, body: &[u8], legacy: bool) -> Result<Self, ProtocolError> {
        let mut cursor = ByteCursor::new(body);
        let message = match cmd {
            Command::Ping => Self::Ping {
                game_id: cursor.read_u32()?,
            },
            Command::MesgGameGone => Self::GameGone {
                game_id: cursor.read_u32()?,
            },
            Command::MesgSend => {
                let game_id = cursor.read_u32()?;
                let data = cursor.read_blob()?.to_vec();
                Self::Send { game_id, data }
            }
            Command::Invite if legacy => {
                let text = String::from_utf8(cursor.read_blob()?.to_vec())?;
                Self::Invite(InvitePayload::Legacy(text))
            }
            Command::Invite => Self::Invite(InvitePayload::Binary(cursor.read_blob()?.to_vec())),
            Command::MacAsk => Self::MacAsk,
            other => return Err(ProtocolError::NotARequest(other)),
        };
        Ok(message)
    }
}

/// Build a current-protocol frame from already encoded messages.
pub fn encode_frame<'a, I>(messages: I) -> Result<Vec<u8>, ProtocolError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut payload = vec![0u8];
    let mut count = 0usize;
    for message in messages {
        payload.extend_from_slice(message);
        count += 1;
    }
    if count > MAX_MESSAGES_PER_FRAME {
        return Err(ProtocolError::TooManyMessages(count));
    }
    if payload.len() > u16::MAX as usize {
        return Err(ProtocolError::TooLarge {
            size: payload.len(),
            max: u16::MAX as usize,
        });
    }
    payload[0] = count as u8;

    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the bytes following the version byte.
///
/// Unknown and reserved commands are skipped using their declared length.
/// A length that overruns the payload ends decoding of this frame; whatever
/// was decoded before it is returned.
pub fn decode_payload(version: u8, payload: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    match version {
        PROTOCOL_VERSION => Ok(decode_batch(payload)),
        LEGACY_PROTOCOL_VERSION => decode_legacy(payload).map(|m| m.into_iter().collect()),
        other => Err(ProtocolError::BadVersion(other)),
    }
}

fn decode_batch(payload: &[u8]) -> Vec<Message> {
    let mut cursor = ByteCursor::new(payload);
    let mut messages = Vec::new();

    let count = match cursor.read_u8() {
        Ok(count) => count,
        Err(e) => {
            warn!("Frame without message count: {}", e);
            return messages;
        }
    };

    for index in 0..count {
        let (code, body) = match cursor.read_u8().and_then(|code| Ok((code, cursor.read_blob()?))) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Frame truncated at message {} of {}: {}", index, count, e);
                break;
            }
        };

        match Command::from_code(code) {
            Some(cmd) => match Message::decode_body(cmd, body, false) {
                Ok(message) => {
                    debug!("Decoded message {}: {}", index, cmd.as_str());
                    messages.push(message);
                }
                Err(e) => warn!("Skipping {} ({} bytes): {}", cmd.as_str(), body.len(), e),
            },
            None => {
                let kind = if is_reserved_code(code) { "reserved" } else { "unexpected" };
                warn!("{} command (code {}); skipping {} bytes", kind, code, body.len());
            }
        }
    }

    if cursor.remaining() > 0 {
        debug!("{} trailing bytes after {} messages", cursor.remaining(), count);
    }
    messages
}

fn decode_legacy(payload: &[u8]) -> Result<Option<Message>, ProtocolError> {
    let (&code, body) = payload.split_first().ok_or(ProtocolError::Empty)?;
    match Command::from_code(code) {
        Some(cmd) => Message::decode_body(cmd, body, true).map(Some),
        None => {
            warn!("Legacy frame with unknown command {}; dropping", code);
            Ok(None)
        }
    }
}

/// A response to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    BadProto,
    Pong { game_absent: bool },
    InviteAccepted,
    InviteDupId,
    InviteDupInvite,
    MessageAccepted,
    MessageGameGone,
    MacReply(String),
    /// A known code that is not a valid answer to what was sent.
    Unexpected(Command),
}

impl Reply {
    pub fn command(&self) -> Command {
        match self {
            Self::BadProto => Command::BadProto,
            Self::Pong { .. } => Command::Pong,
            Self::InviteAccepted => Command::InviteAccpt,
            Self::InviteDupId => Command::InviteDupId,
            Self::InviteDupInvite => Command::InviteDupInvite,
            Self::MessageAccepted => Command::MesgAccpt,
            Self::MessageGameGone => Command::MesgGameGone,
            Self::MacReply(_) => Command::MacReply,
            Self::Unexpected(cmd) => *cmd,
        }
    }

    /// Append the unframed wire form to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        out.push(self.command().code());
        match self {
            Self::Pong { game_absent } => out.push(u8::from(*game_absent)),
            Self::MacReply(addr) => put_blob(out, addr.as_bytes())?,
            _ => {}
        }
        Ok(())
    }
}

/// Read one reply to `sent` from the stream.
///
/// Returns `Ok(None)` for a code this side cannot interpret; the caller stops
/// reading since the rest of the stream can no longer be trusted.
pub async fn read_reply<R>(reader: &mut R, sent: Command) -> Result<Option<Reply>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let code = reader.read_u8().await?;
    let Some(cmd) = Command::from_code(code) else {
        warn!("Unreadable reply code {} to {}", code, sent.as_str());
        return Ok(None);
    };

    let reply = match cmd {
        Command::BadProto => Reply::BadProto,
        Command::Pong if sent == Command::Ping => Reply::Pong {
            game_absent: reader.read_u8().await? != 0,
        },
        Command::InviteAccpt => Reply::InviteAccepted,
        Command::InviteDupId => Reply::InviteDupId,
        Command::InviteDupInvite => Reply::InviteDupInvite,
        Command::MesgAccpt => Reply::MessageAccepted,
        Command::MesgGameGone => Reply::MessageGameGone,
        Command::MacReply if sent == Command::MacAsk => {
            let len = reader.read_u16().await? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            Reply::MacReply(String::from_utf8(buf)?)
        }
        other => Reply::Unexpected(other),
    };
    Ok(Some(reply))
}

/// Short SHA-256 digest of a payload, logged on both ends of a transfer.
pub fn payload_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}

fn put_blob(out: &mut Vec<u8>, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::TooLarge {
        size: data.len(),
        max: u16::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// Bounds-checked reader over an in-memory payload.
struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if n > self.remaining() {
            return Err(ProtocolError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_blob(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }
}

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

//! Bluetooth message transport.
//!
//! Per-peer Senders batch outbound commands into RFCOMM frames; two
//! listeners feed accepted sockets to a single Reader that dispatches
//! inbound commands to the game.

mod bluez;
mod context;
mod delegate;
mod error;
mod listener;
mod manager;
mod platform;
mod protocol;
mod reader;
mod registry;
mod scan;
mod sender;
mod slot;
mod timer;

#[cfg(test)]
pub(crate) mod testutil;

pub use bluez::BluezPlatform;
pub use context::{
    Collaborators, MacUpdate, TransportContext, TransportEvent, TransportSettings, TransportState,
    SERVICE_UUID,
};
pub use delegate::{
    DeliveryOutcome, GameCore, InvitationOutcome, Invite, KeyValueStore, RetryScheduler,
    ScanListener, StatusReporter,
};
pub use error::{classify, ErrorClass, ProtocolError, TransportError};
pub use listener::Listener;
pub use manager::TransportManager;
pub use platform::{
    is_bogus_addr, BtPlatform, MajorClass, PeerSocket, PeerStream, RemoteDevice, RfcommAcceptor,
    SecurityMode, ServiceRecord, BOGUS_ADDR,
};
pub use protocol::{
    decode_payload, encode_frame, payload_digest, read_reply, Command, InvitePayload, Message,
    Reply, LEGACY_PROTOCOL_VERSION, MAX_MESSAGES_PER_FRAME, MAX_PACKET_LEN, PAYLOAD_HEADER_LEN,
    PROTOCOL_VERSION,
};
pub use reader::Reader;
pub use registry::PeerRegistry;
pub use scan::{ScanListeners, ScanOrchestrator};
pub use sender::{backoff_wait, Sender, Step};
pub use slot::{SingletonSlot, SlotClaim};
pub use timer::{RetryTimer, MAX_BACKOFF, MIN_BACKOFF};

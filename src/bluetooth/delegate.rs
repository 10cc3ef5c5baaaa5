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

//! Interfaces the transport calls out to.
//!
//! Move validation, game storage, status display and persistence live
//! outside this crate's transport code; the manager is handed one
//! implementation of each trait at construction.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::platform::RemoteDevice;

/// Invitation to join a new game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    #[serde(rename = "gid")]
    pub game_id: u32,

    #[serde(rename = "nm")]
    pub game_name: String,

    #[serde(rename = "lang")]
    pub lang: String,

    #[serde(rename = "dict", skip_serializing_if = "Option::is_none", default)]
    pub dict: Option<String>,

    /// Total seats in the game.
    #[serde(rename = "np")]
    pub players_total: u8,

    /// Seats filled on the inviting device.
    #[serde(rename = "nh")]
    pub players_here: u8,
}

impl Invite {
    pub fn new(game_id: u32, game_name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            game_id,
            game_name: game_name.into(),
            lang: lang.into(),
            dict: None,
            players_total: 2,
            players_here: 1,
        }
    }

    pub fn with_dict(mut self, dict: impl Into<String>) -> Self {
        self.dict = Some(dict.into());
        self
    }
}

/// Result of handing an inbound move message to the game core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    GameGone,
}

/// Result of handing an inbound invitation to the game core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationOutcome {
    Accepted,
    Duplicate,
}

/// The game engine.
pub trait GameCore: Send + Sync {
    /// Whether a game with this id exists locally.
    fn game_exists(&self, game_id: u32) -> bool;

    /// Binary invitation format carried by current frames.
    fn encode_invite(&self, invite: &Invite) -> Result<Vec<u8>>;

    fn decode_invite(&self, data: &[u8]) -> Result<Invite>;

    /// String invitation format sent by old peers.
    fn parse_legacy_invite(&self, text: &str) -> Result<Invite>;

    fn deliver_message(&self, game_id: u32, body: &[u8], from: &RemoteDevice) -> DeliveryOutcome;

    fn handle_invitation(&self, invite: &Invite, from: &RemoteDevice) -> InvitationOutcome;
}

/// Connection status display.
pub trait StatusReporter: Send + Sync {
    fn report_inbound(&self, success: bool);
    fn report_outbound(&self, success: bool);
}

/// Persistent key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn cached_local_mac(&self) -> Result<Option<String>>;
    fn set_cached_local_mac(&self, mac: &str) -> Result<()>;
}

/// Periodic retry scheduler with its own backoff window.
pub trait RetryScheduler: Send + Sync {
    /// A peer reached us; shrink the retry window back to its floor.
    fn on_inbound_success(&self);
}

/// Observer of scan progress.
pub trait ScanListener: Send + Sync {
    fn on_device_scanned(&self, device: &RemoteDevice);
    fn on_scan_done(&self);
}

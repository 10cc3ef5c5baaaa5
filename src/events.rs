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

//! Event processing for transport notifications.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bluetooth::TransportEvent;
use crate::storage::Inbox;

/// Totals of what the transport reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub accepted: u64,
    pub games_gone: u64,
    pub invites_accepted: u64,
    pub invites_rejected: u64,
    pub protocol_errors: u64,
}

/// Consumes transport events.
pub struct EventProcessor {
    inbox: Option<Arc<Inbox>>,
    counts: EventCounts,
}

impl EventProcessor {
    pub fn new() -> Self {
        Self {
            inbox: None,
            counts: EventCounts::default(),
        }
    }

    /// Drop local games that peers report gone.
    pub fn with_inbox(inbox: Arc<Inbox>) -> Self {
        Self {
            inbox: Some(inbox),
            counts: EventCounts::default(),
        }
    }

    pub fn counts(&self) -> &EventCounts {
        &self.counts
    }

    /// Process a single event.
    pub fn process_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::MessageAccepted { game_id, peer } => {
                info!("{} accepted message for game {}", peer, game_id);
                self.counts.accepted += 1;
            }
            TransportEvent::MessageNoGame { game_id, via_peer } => {
                info!(
                    "Game {} gone ({})",
                    game_id,
                    via_peer.as_deref().unwrap_or("peer")
                );
                self.counts.games_gone += 1;
                if let Some(inbox) = &self.inbox {
                    inbox.remove_game(game_id)?;
                }
            }
            TransportEvent::NewGameSuccess { game_id } => {
                info!("Invitation for game {} accepted", game_id);
                self.counts.invites_accepted += 1;
            }
            TransportEvent::NewGameDupRejected { peer } => {
                info!("{} already had this invitation", peer);
                self.counts.invites_rejected += 1;
            }
            TransportEvent::NewGameFailure { game_id } => {
                warn!("Invitation for game {} failed", game_id);
                self.counts.invites_rejected += 1;
            }
            TransportEvent::BadProto { peer } => {
                warn!("{} speaks a different protocol version; upgrade needed", peer);
                self.counts.protocol_errors += 1;
            }
            TransportEvent::LocalMacConflict { cached, reported } => {
                error!(
                    "Local MAC conflict: cached {}, peer reported {}",
                    cached, reported
                );
            }
            TransportEvent::BackgroundRestricted => {
                warn!("Bluetooth disabled until the process is foregrounded");
            }
        }
        Ok(())
    }

    /// Process events until the channel closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> EventCounts {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.process_event(event) {
                error!("Error processing transport event: {}", e);
            }
        }
        self.counts
    }
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

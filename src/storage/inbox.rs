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

//! Games, received messages and invitations using SQLite.
//!
//! Stands in for the game engine when running as a daemon: it knows which
//! games exist and stores whatever peers send for them.

use anyhow::Result;
use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use crate::bluetooth::{DeliveryOutcome, GameCore, InvitationOutcome, Invite, RemoteDevice};

/// A move message received from a peer.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub game_id: u32,
    pub body: Vec<u8>,
    pub from_addr: String,
    pub received: DateTime<Local>,
}

/// An invitation received from a peer.
#[derive(Debug, Clone)]
pub struct ReceivedInvite {
    pub invite: Invite,
    pub from_addr: String,
    pub from_name: Option<String>,
    pub received: DateTime<Local>,
}

fn to_local(secs: i64) -> DateTime<Local> {
    Local
        .timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Local::now)
}

/// Inbox database manager.
#[derive(Clone)]
pub struct Inbox {
    conn: Arc<Mutex<Connection>>,
}

impl Inbox {
    /// Create or open the inbox database.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("inbox.db");
        info!("Opening inbox database: {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS games (
                game_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                created INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id INTEGER NOT NULL,
                body BLOB NOT NULL,
                from_addr TEXT NOT NULL,
                received INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_game ON messages(game_id);
            CREATE TABLE IF NOT EXISTS invites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id INTEGER NOT NULL,
                from_addr TEXT NOT NULL,
                from_name TEXT,
                payload TEXT NOT NULL,
                received INTEGER NOT NULL,
                UNIQUE(game_id, from_addr)
            );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Register a game created on this device.
    pub fn add_game(&self, game_id: u32, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO games (game_id, name, created) VALUES (?1, ?2, ?3)",
            params![game_id, name, Local::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn remove_game(&self, game_id: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM games WHERE game_id = ?1", [game_id])?;
        conn.execute("DELETE FROM messages WHERE game_id = ?1", [game_id])?;
        Ok(removed > 0)
    }

    pub fn has_game(&self, game_id: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM games WHERE game_id = ?1",
            [game_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Messages for `game_id`, oldest first.
    pub fn messages_for(&self, game_id: u32) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, game_id, body, from_addr, received
             FROM messages
             WHERE game_id = ?1
             ORDER BY id ASC",
        )?;

        let messages = stmt
            .query_map([game_id], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    game_id: row.get(1)?,
                    body: row.get(2)?,
                    from_addr: row.get(3)?,
                    received: to_local(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    /// Received invitations, newest first.
    pub fn invites(&self) -> Result<Vec<ReceivedInvite>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload, from_addr, from_name, received
             FROM invites
             ORDER BY id DESC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(payload, from_addr, from_name, received)| -> Result<ReceivedInvite> {
                Ok(ReceivedInvite {
                    invite: serde_json::from_str(&payload)?,
                    from_addr,
                    from_name,
                    received: to_local(received),
                })
            })
            .collect()
    }

    fn store_message(&self, game_id: u32, body: &[u8], from: &RemoteDevice) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (game_id, body, from_addr, received) VALUES (?1, ?2, ?3, ?4)",
            params![game_id, body, from.address, Local::now().timestamp()],
        )?;
        Ok(())
    }

    /// Record an invitation. Returns false if this peer already sent one
    /// for the same game.
    fn store_invite(&self, invite: &Invite, from: &RemoteDevice) -> Result<bool> {
        let payload = serde_json::to_string(invite)?;
        let now = Local::now().timestamp();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO invites (game_id, from_addr, from_name, payload, received)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![invite.game_id, from.address, from.name, payload, now],
        )?;
        if inserted > 0 {
            tx.execute(
                "INSERT OR IGNORE INTO games (game_id, name, created) VALUES (?1, ?2, ?3)",
                params![invite.game_id, invite.game_name, now],
            )?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }
}

impl GameCore for Inbox {
    fn game_exists(&self, game_id: u32) -> bool {
        self.has_game(game_id).unwrap_or_else(|e| {
            error!("Failed to look up game {}: {}", game_id, e);
            false
        })
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
            info!("Message for unknown game {} from {}", game_id, from);
            return DeliveryOutcome::GameGone;
        }
        // only a missing game may answer GAMEGONE
        if let Err(e) = self.store_message(game_id, body, from) {
            error!("Failed to store message for game {}: {}", game_id, e);
        }
        DeliveryOutcome::Accepted
    }

    fn handle_invitation(&self, invite: &Invite, from: &RemoteDevice) -> InvitationOutcome {
        match self.store_invite(invite, from) {
            Ok(true) => {
                info!("Invitation to game {} from {}", invite.game_id, from);
                InvitationOutcome::Accepted
            }
            Ok(false) => InvitationOutcome::Duplicate,
            Err(e) => {
                error!("Failed to store invitation from {}: {}", from, e);
                InvitationOutcome::Duplicate
            }
        }
    }
}

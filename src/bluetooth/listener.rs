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

//! RFCOMM accept loop.

use std::sync::Arc;
use tracing::{debug, error, info};

use super::context::TransportContext;
use super::error::{classify, ErrorClass};
use super::platform::SecurityMode;
use super::reader::Reader;
use super::slot::{SingletonSlot, SlotClaim};

/// Accepts inbound connections for one security mode and queues them on
/// the Reader. Never processes a socket itself.
pub struct Listener {
    mode: SecurityMode,
    slot: SingletonSlot,
}

impl Listener {
    pub fn new(mode: SecurityMode) -> Self {
        let name = match mode {
            SecurityMode::Secure => "secure listener",
            SecurityMode::Insecure => "insecure listener",
        };
        Self {
            mode,
            slot: SingletonSlot::new(name),
        }
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Start accepting unless an instance is already live. Returns whether
    /// this call started one.
    pub fn start(self: &Arc<Self>, ctx: &Arc<TransportContext>, reader: &Arc<Reader>) -> bool {
        if !ctx.may_start() {
            debug!("Not starting {} listener: Bluetooth unusable", self.mode.as_str());
            return false;
        }
        let Some(claim) = self.slot.try_claim() else {
            return false;
        };

        let listener = self.clone();
        let ctx_clone = ctx.clone();
        let reader = reader.clone();
        ctx.runtime.spawn(async move {
            listener.run(claim, ctx_clone, reader).await;
        });
        true
    }

    /// Clear the slot and close the server channel. The accept loop sees it
    /// is no longer current and exits.
    pub fn stop(&self) -> bool {
        self.slot.stop()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_live()
    }

    async fn run(&self, claim: SlotClaim, ctx: Arc<TransportContext>, reader: Arc<Reader>) {
        let service = &ctx.settings.service;
        let mut acceptor = match ctx.platform.listen(self.mode, service).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                match classify(&e) {
                    ErrorClass::BackgroundRestricted => ctx.set_background_restricted(),
                    _ => error!("Failed to open {} server channel: {}", self.mode.as_str(), e),
                }
                self.slot.release(claim.id);
                return;
            }
        };
        info!(
            "Listening ({}) for {} on channel {}",
            self.mode.as_str(),
            service.uuid,
            service.channel_for(self.mode)
        );

        while self.slot.is_current(claim.id) {
            let accepted = tokio::select! {
                biased;
                _ = claim.token.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };

            match accepted {
                Ok(socket) => {
                    debug!("{} accept() returned {}", self.mode.as_str(), socket.remote);
                    reader.handle(&ctx, socket);
                }
                Err(e) => {
                    error!("{} accept() failed: {}", self.mode.as_str(), e);
                    if classify(&e) == ErrorClass::BackgroundRestricted {
                        ctx.set_background_restricted();
                    }
                    break;
                }
            }
        }

        drop(acceptor);
        self.slot.release(claim.id);
        info!("{} listener exiting", self.mode.as_str());
    }
}

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

//! Peer name to Sender map.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use super::context::TransportContext;
use super::platform::is_bogus_addr;
use super::sender::Sender;

/// Holds at most one live Sender per peer name.
pub struct PeerRegistry {
    ctx: Arc<TransportContext>,
    senders: Mutex<HashMap<String, Arc<Sender>>>,
    names_to_addrs: Mutex<HashMap<String, String>>,
}

impl PeerRegistry {
    pub fn new(ctx: Arc<TransportContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            senders: Mutex::new(HashMap::new()),
            names_to_addrs: Mutex::new(HashMap::new()),
        })
    }

    /// The Sender for `name`, creating and starting one if there is none
    /// or the previous one has exited.
    pub fn get_or_create(self: &Arc<Self>, name: &str, addr: Option<&str>) -> Arc<Sender> {
        let (sender, created) = {
            let mut senders = self.senders.lock();
            match senders.get(name) {
                Some(sender) if !sender.is_finished() => (sender.clone(), false),
                _ => {
                    let sender = Sender::new(self.ctx.clone(), name, addr.map(str::to_string));
                    senders.insert(name.to_string(), sender.clone());
                    (sender, true)
                }
            }
        };

        if created {
            debug!("Created sender for {}", name);
            sender.spawn(Some(Arc::downgrade(self)));
        } else {
            sender.wake();
        }
        sender
    }

    pub fn get(&self, name: &str) -> Option<Arc<Sender>> {
        self.senders.lock().get(name).cloned()
    }

    /// Drop `sender` if it is still the registered one for its name.
    pub fn remove(&self, sender: &Arc<Sender>) {
        let mut senders = self.senders.lock();
        match senders.get(sender.name()) {
            Some(current) if Arc::ptr_eq(current, sender) => {
                senders.remove(sender.name());
                debug!("Removed sender for {}", sender.name());
            }
            Some(_) => error!("race? There's a different sender for {}", sender.name()),
            None => {}
        }
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.lock().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.senders.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Nudge every Sender to re-check its state.
    pub fn wake_all(&self) {
        let senders: Vec<Arc<Sender>> = self.senders.lock().values().cloned().collect();
        for sender in senders {
            sender.wake();
        }
    }

    /// A dialable address for `name`. Empty or bogus addresses are looked
    /// up among bonded devices and remembered.
    pub async fn safe_addr(&self, name: &str, addr: Option<&str>) -> Option<String> {
        if let Some(addr) = addr.filter(|a| !a.is_empty() && !is_bogus_addr(a)) {
            return Some(addr.to_string());
        }

        if let Some(cached) = self.names_to_addrs.lock().get(name) {
            return Some(cached.clone());
        }

        let found = match self.ctx.platform.bonded_devices().await {
            Ok(devices) => devices
                .into_iter()
                .find(|device| device.name.as_deref() == Some(name))
                .map(|device| device.address),
            Err(e) => {
                debug!("Failed to list bonded devices: {}", e);
                None
            }
        };

        if let Some(found) = &found {
            self.names_to_addrs
                .lock()
                .insert(name.to_string(), found.clone());
        }
        debug!("safe_addr({:?}) => {:?}", addr, found);
        found
    }
}

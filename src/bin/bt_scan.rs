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

//! Ping bonded devices for a running GameLink peer and print who answered.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use gamelink_bt::bluetooth::{
    BluezPlatform, Collaborators, RemoteDevice, RetryTimer, ScanListener, TransportManager,
};
use gamelink_bt::config::Config;
use gamelink_bt::state::StatusBoard;
use gamelink_bt::storage::{Inbox, KvStore};

#[derive(Default)]
struct Printer {
    found: Mutex<Vec<RemoteDevice>>,
    done: Notify,
}

impl ScanListener for Printer {
    fn on_device_scanned(&self, device: &RemoteDevice) {
        println!("  reachable: {}", device);
        self.found.lock().push(device.clone());
    }

    fn on_scan_done(&self) {
        self.done.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    gamelink_bt::init_logging(&config.logging.directive())?;

    let timeout = std::env::args()
        .nth(1)
        .map(|secs| secs.parse::<u64>())
        .transpose()?
        .map(Duration::from_secs);

    let platform = Arc::new(BluezPlatform::new(None).await?);
    let (event_tx, _event_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = TransportManager::new(
        platform,
        Collaborators {
            game: Arc::new(Inbox::new(&config.data_dir)?),
            status: StatusBoard::new(),
            store: Arc::new(KvStore::new(&config.data_dir)?),
            retry: Arc::new(RetryTimer::new()),
        },
        config.bluetooth.transport_settings(),
        event_tx,
        Handle::current(),
    );

    let printer = Arc::new(Printer::default());
    manager.add_scan_listener(printer.clone());

    let candidates = manager.candidates().await;
    println!("Probing {} bonded devices:", candidates.len());
    for device in &candidates {
        println!("  {}", device);
    }

    if manager.scan(timeout).await > 0 {
        printer.done.notified().await;
    }

    let found = printer.found.lock().len();
    println!("{} of {} devices answered", found, candidates.len());
    Ok(())
}

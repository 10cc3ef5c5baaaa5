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

//! GameLink Bluetooth transport daemon

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn};

use gamelink_bt::bluetooth::{BluezPlatform, Collaborators, RetryTimer, TransportManager};
use gamelink_bt::config::Config;
use gamelink_bt::events::EventProcessor;
use gamelink_bt::state::StatusBoard;
use gamelink_bt::storage::{Inbox, KvStore};

const STATUS_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    gamelink_bt::init_logging(&config.logging.directive())?;
    info!("Starting GameLink BT v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded");

    // Initialize storage
    let kv = Arc::new(KvStore::new(&config.data_dir)?);
    let inbox = Arc::new(Inbox::new(&config.data_dir)?);
    info!("Storage initialized");

    let alias = config
        .bluetooth
        .set_alias
        .then_some(config.bluetooth.app_name.as_str());
    let platform = Arc::new(BluezPlatform::new(alias).await?);

    let status = StatusBoard::new();
    let timer = Arc::new(RetryTimer::new());
    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();

    let manager = TransportManager::new(
        platform,
        Collaborators {
            game: inbox.clone(),
            status: status.clone(),
            store: kv,
            retry: timer.clone(),
        },
        config.bluetooth.transport_settings(),
        event_tx,
        Handle::current(),
    );

    let processor = EventProcessor::with_inbox(inbox);
    let events = tokio::spawn(processor.run(event_rx));

    if config.bluetooth.enabled {
        manager.init();
        manager.attach_retry_timer(&timer);
    } else {
        warn!("Bluetooth disabled in config; not listening");
        manager.set_enabled(false);
    }

    if let Some((name, addr)) = manager.local_name_and_address() {
        info!(
            "Ready as '{}' ({})",
            name.as_deref().unwrap_or("?"),
            addr.as_deref().unwrap_or("address unknown")
        );
    }

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    status_tick.tick().await;
    loop {
        tokio::select! {
            _ = status_tick.tick() => {
                info!("Link status:\n{}", status);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    timer.stop();
    manager.stop();
    drop(manager);
    events.abort();

    info!("GameLink BT stopped");
    Ok(())
}

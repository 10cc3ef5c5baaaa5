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

//! Connection status tracking.

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::bluetooth::StatusReporter;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

/// Last success and failure seen in one direction.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub last_success: Option<DateTime<Local>>,
    pub last_failure: Option<DateTime<Local>>,
    pub successes: u64,
    pub failures: u64,
    last_result: Option<bool>,
}

impl LinkStats {
    fn record(&mut self, success: bool) {
        let now = Local::now();
        self.last_result = Some(success);
        if success {
            self.last_success = Some(now);
            self.successes += 1;
        } else {
            self.last_failure = Some(now);
            self.failures += 1;
        }
    }

    /// Whether the most recent attempt succeeded.
    pub fn is_healthy(&self) -> bool {
        self.last_result == Some(true)
    }
}

/// Shared inbound/outbound status.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inbound: RwLock<LinkStats>,
    outbound: RwLock<LinkStats>,
}

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self, direction: Direction) -> LinkStats {
        match direction {
            Direction::Inbound => self.inbound.read().clone(),
            Direction::Outbound => self.outbound.read().clone(),
        }
    }

    fn record(&self, direction: Direction, success: bool) {
        debug!("status {}: {}", direction.as_str(), success);
        match direction {
            Direction::Inbound => self.inbound.write().record(success),
            Direction::Outbound => self.outbound.write().record(success),
        }
    }
}

impl StatusReporter for StatusBoard {
    fn report_inbound(&self, success: bool) {
        self.record(Direction::Inbound, success);
    }

    fn report_outbound(&self, success: bool) {
        self.record(Direction::Outbound, success);
    }
}

impl fmt::Display for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for direction in [Direction::Inbound, Direction::Outbound] {
            let stats = self.stats(direction);
            let last = stats
                .last_success
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string());
            writeln!(
                f,
                "{:>3}: {} ok, {} failed, last ok {}",
                direction.as_str(),
                stats.successes,
                stats.failures,
                last
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tracking() {
        let board = StatusBoard::new();
        assert!(!board.stats(Direction::Inbound).is_healthy());

        board.report_outbound(false);
        board.report_outbound(true);
        board.report_inbound(true);

        let out = board.stats(Direction::Outbound);
        assert_eq!((out.successes, out.failures), (1, 1));
        assert!(out.is_healthy());
        assert!(board.stats(Direction::Inbound).is_healthy());

        board.report_outbound(false);
        assert!(!board.stats(Direction::Outbound).is_healthy());
        assert!(board.to_string().contains("out: 1 ok, 2 failed"));
    }
}

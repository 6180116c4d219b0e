// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of ravelin.
//
// ravelin is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// ravelin is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with ravelin.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Rolling request metrics
//!
//! The tick driver rolls the dispatcher's transaction count into these metrics once per tick, and
//! the `getMetrics` method reads them back out. Because they're *served over RPC* rather than
//! scraped, this is a plain serializable roll-up, not an exporter: a bounded window of recent
//! per-tick rates plus a couple of lifetime aggregates.
//!
//! Nb. the count rolled in here is *logical requests*, not commit attempts: the dispatcher counts
//! each request once, however many times its transaction conflicts & retries.

use std::{collections::VecDeque, time::Duration};

use serde::{Deserialize, Serialize};

/// How many per-tick rate samples to retain
pub const RATE_WINDOW: usize = 60;

/// Rolling request metrics; see the module docs
#[derive(Debug)]
pub struct Metrics {
    rates: VecDeque<f64>,
    window: usize,
    total_tx: u64,
    peak_tx_per_sec: f64,
}

/// A point-in-time copy of the metrics, ready for serialization
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Snapshot {
    /// Requests dispatched over this front-end's lifetime
    pub total_tx: u64,
    /// The highest per-tick rate ever observed, in requests per second
    pub peak_tx_per_sec: f64,
    /// Mean rate over the retained window, in requests per second
    pub avg_tx_per_sec: f64,
    /// The retained per-tick rates, oldest first
    pub rates: Vec<f64>,
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new(RATE_WINDOW)
    }
}

impl Metrics {
    pub fn new(window: usize) -> Metrics {
        Metrics {
            rates: VecDeque::with_capacity(window),
            window,
            total_tx: 0,
            peak_tx_per_sec: 0.0,
        }
    }

    /// Roll one tick's transaction count into the window
    pub fn track_tx_rate(&mut self, elapsed: Duration, tx_count: u64) {
        self.total_tx += tx_count;
        let millis = elapsed.as_millis();
        // A zero-length tick carries no rate information
        let rate = if millis == 0 {
            0.0
        } else {
            tx_count as f64 * 1_000.0 / millis as f64
        };
        if self.rates.len() == self.window {
            self.rates.pop_front();
        }
        self.rates.push_back(rate);
        if rate > self.peak_tx_per_sec {
            self.peak_tx_per_sec = rate;
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let avg_tx_per_sec = if self.rates.is_empty() {
            0.0
        } else {
            self.rates.iter().sum::<f64>() / self.rates.len() as f64
        };
        Snapshot {
            total_tx: self.total_tx,
            peak_tx_per_sec: self.peak_tx_per_sec,
            avg_tx_per_sec,
            rates: self.rates.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod metrics_tests {
    use super::*;

    #[test]
    fn rates_roll_up() {
        let mut metrics = Metrics::default();
        metrics.track_tx_rate(Duration::from_millis(1_000), 10);
        metrics.track_tx_rate(Duration::from_millis(500), 10);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_tx, 20);
        assert_eq!(snapshot.rates, vec![10.0, 20.0]);
        assert_eq!(snapshot.peak_tx_per_sec, 20.0);
        assert_eq!(snapshot.avg_tx_per_sec, 15.0);
    }

    #[test]
    fn the_window_is_bounded_but_the_totals_are_not() {
        let mut metrics = Metrics::new(4);
        for _ in 0..10 {
            metrics.track_tx_rate(Duration::from_millis(1_000), 1);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rates.len(), 4);
        assert_eq!(snapshot.total_tx, 10);
    }

    #[test]
    fn a_zero_length_tick_does_not_panic() {
        let mut metrics = Metrics::default();
        metrics.track_tx_rate(Duration::ZERO, 5);
        assert_eq!(metrics.snapshot().rates, vec![0.0]);
        assert_eq!(metrics.snapshot().total_tx, 5);
    }
}

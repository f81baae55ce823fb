//! Feedback controller adjusting a connection's congestion windows from the
//! transport's counters.
//!
//! The transport only exposes process-global counters, so the loss signal is
//! shared between all pooled connections and any one lossy path shrinks
//! everybody's windows.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{Connection, CounterSource};

pub const MIN_WINDOW: usize = 128;
const TUNE_INTERVAL: Duration = Duration::from_secs(10);
const GROW_FACTOR: f64 = 1.5;
const SHRINK_FACTOR: f64 = 0.75;
/// Retransmission share above which the link is treated as congested.
const SHRINK_RETRANS_RATE: f64 = 0.05;

pub struct AutoTuner {
    conn: Arc<dyn Connection>,
    counters: Arc<dyn CounterSource>,
    max_snd: usize,
    max_rcv: usize,
    cur_snd: usize,
    cur_rcv: usize,
    last_sent: u64,
    last_recv: u64,
}

impl AutoTuner {
    /// Starts at half the configured maximum so there is room to move in both
    /// directions, and programs the connection with that starting point.
    pub fn new(
        conn: Arc<dyn Connection>,
        counters: Arc<dyn CounterSource>,
        max_snd: usize,
        max_rcv: usize,
    ) -> AutoTuner {
        let cur_snd = (max_snd / 2).max(MIN_WINDOW);
        let cur_rcv = (max_rcv / 2).max(MIN_WINDOW);
        conn.set_window_size(cur_snd, cur_rcv);

        AutoTuner {
            conn,
            counters,
            max_snd,
            max_rcv,
            cur_snd,
            cur_rcv,
            last_sent: 0,
            last_recv: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let snapshot = self.counters.snapshot();
        self.last_sent = snapshot.bytes_sent;
        self.last_recv = snapshot.bytes_received;

        let mut ticks = interval_at(Instant::now() + TUNE_INTERVAL, TUNE_INTERVAL);
        loop {
            select! {
                _ = cancel.cancelled() => return,
                _ = ticks.tick() => self.tune(),
            }
        }
    }

    fn tune(&mut self) {
        let snapshot = self.counters.snapshot();

        let sent_delta = snapshot.bytes_sent.saturating_sub(self.last_sent);
        let recv_delta = snapshot.bytes_received.saturating_sub(self.last_recv);
        self.last_sent = snapshot.bytes_sent;
        self.last_recv = snapshot.bytes_received;

        //TODO per-connection rate once the transport exposes per-connection counters
        let retrans_rate = if snapshot.out_segs > 0 {
            snapshot.retrans_segs as f64 / snapshot.out_segs as f64
        } else {
            0.0
        };

        let old_snd = self.cur_snd;
        let old_rcv = self.cur_rcv;

        if retrans_rate > SHRINK_RETRANS_RATE {
            self.cur_snd = (self.cur_snd as f64 * SHRINK_FACTOR) as usize;
            self.cur_rcv = (self.cur_rcv as f64 * SHRINK_FACTOR) as usize;
        } else if sent_delta + recv_delta > 0 {
            self.cur_snd = (self.cur_snd as f64 * GROW_FACTOR) as usize;
            self.cur_rcv = (self.cur_rcv as f64 * GROW_FACTOR) as usize;
        }
        // no traffic: leave the windows alone

        self.cur_snd = clamp_window(self.cur_snd, self.max_snd);
        self.cur_rcv = clamp_window(self.cur_rcv, self.max_rcv);

        if self.cur_snd != old_snd || self.cur_rcv != old_rcv {
            self.conn.set_window_size(self.cur_snd, self.cur_rcv);
            debug!(
                "autotune: window {}/{} -> {}/{} (retrans {:.1}%, bytes {})",
                old_snd,
                old_rcv,
                self.cur_snd,
                self.cur_rcv,
                retrans_rate * 100.0,
                sent_delta + recv_delta,
            );
        }
    }
}

/// The lower bound wins if the configured maximum is below it.
fn clamp_window(window: usize, max: usize) -> usize {
    if window < MIN_WINDOW {
        MIN_WINDOW
    } else if window > max {
        max
    } else {
        window
    }
}

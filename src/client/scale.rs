//! Elastic pool sizing between the configured minimum and twice that bound.
//!
//! Both directions move at most one connection per tick, which damps
//! oscillation under bursty load.

use std::time::Duration;

use tokio::select;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::pool::TimedConn;
use crate::client::Client;

pub(crate) const SCALE_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const MAX_STREAMS_PER_CONN: usize = 64;

pub(crate) async fn run_autoscaler(client: Client, cancel: CancellationToken) {
    let mut ticks = interval_at(Instant::now() + SCALE_INTERVAL, SCALE_INTERVAL);
    loop {
        select! {
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => client.scale_connections(&cancel).await,
        }
    }
}

impl Client {
    /// One autoscaler tick: add a connection when every live one is saturated,
    /// or retire one idle connection from the tail.
    pub(crate) async fn scale_connections(&self, cancel: &CancellationToken) {
        let mut pool = self.pool.lock().await;
        let num_conns = pool.items.len();

        let all_overloaded = pool
            .items
            .iter()
            .all(|tc| tc.num_streams().map_or(true, |n| n >= MAX_STREAMS_PER_CONN));

        if all_overloaded && num_conns < self.max_conns {
            match TimedConn::create(self.dialer.as_ref(), self.cfg.clone()).await {
                Ok(tc) => {
                    let conn = tc.conn();
                    pool.items.push(tc);
                    // the new member must be visible in the pool before its
                    // tuner starts programming it
                    if let Some(conn) = conn {
                        self.spawn_tuner(conn, cancel.clone());
                    }
                    info!(
                        "autoscale: added connection ({} -> {}), all had >={} streams",
                        num_conns,
                        pool.items.len(),
                        MAX_STREAMS_PER_CONN,
                    );
                }
                Err(e) => {
                    error!("autoscale: failed to create new connection: {e:#}");
                    return;
                }
            }
        }

        // Retire the youngest idle connection first; earlier members are
        // presumably warmer. The scan only covers members that existed at the
        // start of the tick.
        if num_conns > self.min_conns {
            for index in (self.min_conns..num_conns).rev() {
                if pool.items[index].num_streams() == Some(0) {
                    let mut tc = pool.items.remove(index);
                    tc.close().await;
                    info!(
                        "autoscale: removed idle connection ({} -> {})",
                        num_conns,
                        pool.items.len(),
                    );
                    break;
                }
            }
        }
    }
}

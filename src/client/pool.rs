//! Pool membership: timed connections, least-loaded selection and the
//! round-robin fallback.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::{write_frame, Frame, TcpFlagSet};
use crate::transport::{Connection, Dialer};

/// A connection is considered stale and eligible for reopen this long after
/// its last successful probe or (re-)creation.
const CONN_LIFETIME: Duration = Duration::from_secs(300);

/// One transport connection plus the expiry stamp and the configuration
/// needed to re-create it.
pub(crate) struct TimedConn {
    conn: Option<Arc<dyn Connection>>,
    expire: Instant,
    cfg: Arc<Config>,
}

impl TimedConn {
    pub(crate) async fn create(dialer: &dyn Dialer, cfg: Arc<Config>) -> anyhow::Result<TimedConn> {
        let conn = dialer.open(&cfg).await?;
        Ok(TimedConn {
            conn: Some(conn),
            expire: Instant::now() + CONN_LIFETIME,
            cfg,
        })
    }

    pub(crate) fn conn(&self) -> Option<Arc<dyn Connection>> {
        self.conn.clone()
    }

    #[cfg(test)]
    pub(crate) fn expire(&self) -> Instant {
        self.expire
    }

    pub(crate) fn num_streams(&self) -> Option<usize> {
        self.conn.as_ref().map(|c| c.num_streams())
    }

    pub(crate) async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// Liveness check with in-line replacement. A failed ping tears the
    /// connection down and re-dials exactly once; a failed re-dial leaves the
    /// slot empty until the next probe. Never surfaces an error.
    pub(crate) async fn probe(&mut self, dialer: &dyn Dialer) {
        if let Some(conn) = self.conn.clone() {
            match conn.ping(false).await {
                Ok(()) => {
                    self.expire = Instant::now() + CONN_LIFETIME;
                    return;
                }
                Err(e) => {
                    info!("connection lost, replacing: {e:#}");
                    conn.close().await;
                    self.conn = None;
                }
            }
        }
        match dialer.open(&self.cfg).await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.expire = Instant::now() + CONN_LIFETIME;
            }
            Err(e) => {
                warn!("failed to re-establish connection: {e:#}");
            }
        }
    }

    /// Fire-and-forget replay of the configured TCP flag combinations on a
    /// fresh stream. Auxiliary link characterization, so every error is
    /// swallowed.
    pub(crate) fn spawn_flag_replay(&self) {
        if self.cfg.tcp_flags.is_empty() {
            return;
        }
        let Some(conn) = self.conn.clone() else {
            return;
        };
        let flags = self.cfg.tcp_flags.clone();
        tokio::spawn(async move {
            if let Err(e) = send_flag_replay(conn, flags).await {
                debug!("tcp flag replay failed: {e:#}");
            }
        });
    }
}

async fn send_flag_replay(
    conn: Arc<dyn Connection>,
    flags: Vec<TcpFlagSet>,
) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut stream = conn.open_stream().await?;
    write_frame(&mut stream, &Frame::TcpFlags(flags)).await?;
    stream.shutdown().await?;
    Ok(())
}

pub(crate) struct Pool {
    pub(crate) items: Vec<TimedConn>,
    rr_cursor: usize,
}

impl Pool {
    pub(crate) fn new() -> Pool {
        Pool {
            items: Vec::new(),
            rr_cursor: 0,
        }
    }

    /// Index of the live connection with the fewest active streams, ties
    /// broken by first occurrence. Falls back to round-robin when no
    /// connection has a usable handle.
    pub(crate) fn pick(&mut self) -> Option<usize> {
        let least_loaded = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(i, tc)| tc.num_streams().map(|n| (i, n)))
            .min_by_key(|&(_, n)| n)
            .map(|(i, _)| i);

        least_loaded.or_else(|| self.next_round_robin())
    }

    fn next_round_robin(&mut self) -> Option<usize> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.rr_cursor % self.items.len();
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        Some(index)
    }
}

//! Connection acquisition and stream opening with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use thiserror::Error;
use tokio::time;
use tracing::debug;

use crate::client::Client;
use crate::transport::{Connection, TunnelStream};

const OPEN_STREAM_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DialError {
    /// Every attempt to open a stream failed; stream opening is interactive,
    /// so the retry budget is deliberately short (3.1 s worst case).
    #[error("failed to open stream after {attempts} attempts")]
    StreamExhausted { attempts: u32 },
}

impl Client {
    /// Picks the least-loaded pool member (round-robin when none has a live
    /// handle), probes it and returns its transport connection.
    ///
    /// A slot whose handle could not be re-established yields an error; the
    /// caller's retry loop treats that like any failed stream open.
    pub async fn acquire(&self) -> anyhow::Result<Arc<dyn Connection>> {
        let mut pool = self.pool.lock().await;
        let Some(index) = pool.pick() else {
            bail!("connection pool is empty");
        };

        let timed_conn = &mut pool.items[index];
        timed_conn.spawn_flag_replay();
        timed_conn.probe(self.dialer.as_ref()).await;

        match timed_conn.conn() {
            Some(conn) => Ok(conn),
            None => bail!("connection {} has no usable transport", index),
        }
    }

    /// Opens one logical stream inside the pool, retrying with exponential
    /// backoff (100 ms doubling per attempt) across pool members.
    pub async fn open_stream(&self) -> Result<Box<dyn TunnelStream>, DialError> {
        for attempt in 0..OPEN_STREAM_ATTEMPTS {
            let conn = match self.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(
                        "connection acquisition failed (attempt {}/{}), retrying: {e:#}",
                        attempt + 1,
                        OPEN_STREAM_ATTEMPTS,
                    );
                    backoff(attempt).await;
                    continue;
                }
            };
            match conn.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(
                        "failed to open stream (attempt {}/{}), retrying: {e:#}",
                        attempt + 1,
                        OPEN_STREAM_ATTEMPTS,
                    );
                    backoff(attempt).await;
                }
            }
        }
        Err(DialError::StreamExhausted {
            attempts: OPEN_STREAM_ATTEMPTS,
        })
    }
}

async fn backoff(attempt: u32) {
    time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
}

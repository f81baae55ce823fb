//! The client half of the tunnel: owns the connection pool and the periodic
//! workers that keep it healthy.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::protocol::{write_frame, Addr, Frame};
use crate::stats::{ConnStats, ConnStatsSource, RuntimeProbe, StatsReporter, TokioRuntimeProbe};
use crate::transport::autotune::AutoTuner;
use crate::transport::{Connection, CounterSource, Dialer, TunnelStream};

mod dial;
mod pool;
mod scale;
pub mod streams;

pub use dial::DialError;

use pool::{Pool, TimedConn};
use streams::StreamMap;

#[derive(Clone)]
pub struct Client {
    cfg: Arc<Config>,
    dialer: Arc<dyn Dialer>,
    counters: Arc<dyn CounterSource>,
    runtime_probe: Arc<dyn RuntimeProbe>,
    pool: Arc<Mutex<Pool>>,
    udp_streams: Arc<StreamMap>,
    min_conns: usize,
    max_conns: usize,
}

impl Client {
    pub fn new(cfg: Config, dialer: Arc<dyn Dialer>, counters: Arc<dyn CounterSource>) -> Client {
        let min_conns = cfg.min_conns();
        let max_conns = cfg.max_conns();
        Client {
            cfg: Arc::new(cfg),
            dialer,
            counters,
            runtime_probe: Arc::new(TokioRuntimeProbe),
            pool: Arc::new(Mutex::new(Pool::new())),
            udp_streams: Arc::new(StreamMap::new()),
            min_conns,
            max_conns,
        }
    }

    pub fn with_runtime_probe(mut self, probe: Arc<dyn RuntimeProbe>) -> Client {
        self.runtime_probe = probe;
        self
    }

    /// Fills the pool and launches the periodic workers. Only the initial
    /// pool fill may fail; everything after runs until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.cfg.validate()?;

        {
            let mut pool = self.pool.lock().await;
            for i in 0..self.cfg.transport.conn {
                let tc = match TimedConn::create(self.dialer.as_ref(), self.cfg.clone()).await {
                    Ok(tc) => tc,
                    Err(e) => {
                        error!("failed to create connection {}: {e:#}", i + 1);
                        return Err(e);
                    }
                };
                debug!("client connection {} created", i + 1);
                let conn = tc.conn();
                pool.items.push(tc);
                if let Some(conn) = conn {
                    self.spawn_tuner(conn, cancel.clone());
                }
            }
        }

        tokio::spawn(scale::run_autoscaler(self.clone(), cancel.clone()));

        let reporter = StatsReporter::new(
            self.counters.clone(),
            Arc::new(PoolStatsSource {
                pool: self.pool.clone(),
            }),
            self.runtime_probe.clone(),
        );
        tokio::spawn(reporter.run(cancel.clone()));

        let pool = self.pool.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            for tc in pool.lock().await.items.iter_mut() {
                tc.close().await;
            }
            info!("client shutdown complete");
        });

        info!(
            "client started: IPv4 {} IPv6 {} -> {} ({} connections)",
            self.cfg
                .network
                .ipv4
                .map_or_else(|| "<none>".to_string(), |a| a.to_string()),
            self.cfg
                .network
                .ipv6
                .map_or_else(|| "<none>".to_string(), |a| a.to_string()),
            self.cfg.server_addr,
            self.cfg.transport.conn,
        );
        Ok(())
    }

    /// Opens a stream and announces a TCP relay towards `target` on it.
    pub async fn open_tcp_stream(&self, target: Addr) -> anyhow::Result<Box<dyn TunnelStream>> {
        let mut stream = self.open_stream().await?;
        write_frame(&mut stream, &Frame::TcpConnect(Some(target))).await?;
        Ok(stream)
    }

    /// Opens a stream and announces a UDP relay towards `target` on it.
    pub async fn open_udp_stream(&self, target: Addr) -> anyhow::Result<Box<dyn TunnelStream>> {
        let mut stream = self.open_stream().await?;
        write_frame(&mut stream, &Frame::UdpConnect(Some(target))).await?;
        Ok(stream)
    }

    /// Registry of open UDP relay streams, keyed by flow.
    pub fn udp_streams(&self) -> &StreamMap {
        &self.udp_streams
    }

    fn spawn_tuner(&self, conn: Arc<dyn Connection>, cancel: CancellationToken) {
        let tuner = AutoTuner::new(
            conn,
            self.counters.clone(),
            self.cfg.transport.kcp.sndwnd,
            self.cfg.transport.kcp.rcvwnd,
        );
        tokio::spawn(tuner.run(cancel));
    }
}

struct PoolStatsSource {
    pool: Arc<Mutex<Pool>>,
}

#[async_trait]
impl ConnStatsSource for PoolStatsSource {
    async fn conn_stats(&self) -> Vec<ConnStats> {
        self.pool
            .lock()
            .await
            .items
            .iter()
            .filter_map(|tc| {
                tc.conn().map(|conn| ConnStats {
                    remote: conn.remote_addr(),
                    streams: conn.num_streams(),
                })
            })
            .collect()
    }
}

//! Scripted collaborators for unit tests: a transport whose failures are
//! injected per call, a counter source with settable snapshots, and fixed
//! stat providers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use tokio::io::DuplexStream;

use crate::config::Config;
use crate::stats::{ConnStats, ConnStatsSource, RuntimeProbe, RuntimeSnapshot};
use crate::transport::{Connection, CounterSource, Dialer, TransportCounters, TunnelStream};

pub struct MockConnection {
    remote: String,
    num_streams: AtomicUsize,
    failing_pings: AtomicUsize,
    failing_stream_opens: AtomicUsize,
    pings: AtomicUsize,
    opened_streams: AtomicUsize,
    closed: AtomicBool,
    last_window: Mutex<Option<(usize, usize)>>,
    window_calls: AtomicUsize,
    peer_streams: Mutex<VecDeque<DuplexStream>>,
}

impl MockConnection {
    pub fn new(remote: &str) -> MockConnection {
        MockConnection {
            remote: remote.to_string(),
            num_streams: AtomicUsize::new(0),
            failing_pings: AtomicUsize::new(0),
            failing_stream_opens: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            opened_streams: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            last_window: Mutex::new(None),
            window_calls: AtomicUsize::new(0),
            peer_streams: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_num_streams(&self, n: usize) {
        self.num_streams.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_pings(&self, n: usize) {
        self.failing_pings.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_stream_opens(&self, n: usize) {
        self.failing_stream_opens.store(n, Ordering::SeqCst);
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn opened_streams(&self) -> usize {
        self.opened_streams.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn last_window(&self) -> Option<(usize, usize)> {
        *self.last_window.lock().unwrap()
    }

    pub fn window_calls(&self) -> usize {
        self.window_calls.load(Ordering::SeqCst)
    }

    /// The far end of the most recently opened stream, for reading back what
    /// the client wrote.
    pub fn take_peer_stream(&self) -> Option<DuplexStream> {
        self.peer_streams.lock().unwrap().pop_front()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn ping(&self, _expect_pong: bool) -> anyhow::Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_pings) {
            bail!("scripted ping failure");
        }
        Ok(())
    }

    async fn open_stream(&self) -> anyhow::Result<Box<dyn TunnelStream>> {
        if self.is_closed() {
            bail!("connection is closed");
        }
        if Self::take_failure(&self.failing_stream_opens) {
            bail!("scripted stream open failure");
        }
        self.opened_streams.fetch_add(1, Ordering::SeqCst);
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.peer_streams.lock().unwrap().push_back(far);
        Ok(Box::new(near))
    }

    fn num_streams(&self) -> usize {
        self.num_streams.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    fn set_window_size(&self, snd: usize, rcv: usize) {
        *self.last_window.lock().unwrap() = Some((snd, rcv));
        self.window_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockDialer {
    queued: Mutex<VecDeque<Arc<MockConnection>>>,
    created: Mutex<Vec<Arc<MockConnection>>>,
    failing_opens: AtomicUsize,
    dials: AtomicUsize,
}

impl MockDialer {
    pub fn new() -> MockDialer {
        MockDialer::default()
    }

    /// The next dial hands out this connection instead of a fresh one.
    pub fn enqueue(&self, conn: Arc<MockConnection>) {
        self.queued.lock().unwrap().push_back(conn);
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last_created(&self) -> Option<Arc<MockConnection>> {
        self.created.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn open(&self, _cfg: &Config) -> anyhow::Result<Arc<dyn Connection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if MockConnection::take_failure(&self.failing_opens) {
            bail!("scripted dial failure");
        }
        let conn = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Arc::new(MockConnection::new("192.0.2.9:9999")));
        self.created.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

#[derive(Default)]
pub struct MockCounters {
    counters: Mutex<TransportCounters>,
}

impl MockCounters {
    pub fn update(&self, mutate: impl FnOnce(&mut TransportCounters)) {
        mutate(&mut self.counters.lock().unwrap());
    }
}

impl CounterSource for MockCounters {
    fn snapshot(&self) -> TransportCounters {
        *self.counters.lock().unwrap()
    }
}

pub struct FixedConnStats {
    stats: Vec<ConnStats>,
}

impl FixedConnStats {
    pub fn new(stats: Vec<ConnStats>) -> FixedConnStats {
        FixedConnStats { stats }
    }
}

#[async_trait]
impl ConnStatsSource for FixedConnStats {
    async fn conn_stats(&self) -> Vec<ConnStats> {
        self.stats.clone()
    }
}

pub struct FixedRuntimeProbe {
    snapshot: RuntimeSnapshot,
}

impl FixedRuntimeProbe {
    pub fn new(snapshot: RuntimeSnapshot) -> FixedRuntimeProbe {
        FixedRuntimeProbe { snapshot }
    }
}

impl RuntimeProbe for FixedRuntimeProbe {
    fn snapshot(&self) -> RuntimeSnapshot {
        self.snapshot
    }
}

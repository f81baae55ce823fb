//! Periodic transport telemetry with threshold-based bottleneck detection.
//!
//! Every tick diffs the transport's global counters against the previous
//! snapshot, logs one rate summary, and raises one warning per triggered
//! threshold rule. Every fifth tick adds a process runtime snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::select;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::transport::{CounterSource, TransportCounters};

pub const STATS_INTERVAL: Duration = Duration::from_secs(30);
const RUNTIME_SNAPSHOT_EVERY: u64 = 5;

/// Per-connection diagnostics collected from the pool.
#[derive(Debug, Clone)]
pub struct ConnStats {
    pub remote: String,
    pub streams: usize,
}

#[async_trait]
pub trait ConnStatsSource: Send + Sync {
    async fn conn_stats(&self) -> Vec<ConnStats>;
}

/// Process runtime diagnostics. Memory numbers are optional because no
/// portable source exists; hosts that track allocations can supply them
/// through their own probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeSnapshot {
    pub alive_tasks: usize,
    pub rss_bytes: Option<u64>,
    pub allocated_bytes: Option<u64>,
}

pub trait RuntimeProbe: Send + Sync {
    fn snapshot(&self) -> RuntimeSnapshot;
}

/// Default probe: task count from the ambient tokio runtime, no memory data.
pub struct TokioRuntimeProbe;

impl RuntimeProbe for TokioRuntimeProbe {
    fn snapshot(&self) -> RuntimeSnapshot {
        let alive_tasks = tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_alive_tasks())
            .unwrap_or(0);
        RuntimeSnapshot {
            alive_tasks,
            rss_bytes: None,
            allocated_bytes: None,
        }
    }
}

pub struct StatsReporter {
    counters: Arc<dyn CounterSource>,
    conn_source: Arc<dyn ConnStatsSource>,
    runtime: Arc<dyn RuntimeProbe>,
    tick: u64,
    prev: TransportCounters,
    prev_time: Instant,
    prev_tasks: usize,
}

impl StatsReporter {
    pub fn new(
        counters: Arc<dyn CounterSource>,
        conn_source: Arc<dyn ConnStatsSource>,
        runtime: Arc<dyn RuntimeProbe>,
    ) -> StatsReporter {
        let prev = counters.snapshot();
        let prev_tasks = runtime.snapshot().alive_tasks;
        StatsReporter {
            counters,
            conn_source,
            runtime,
            tick: 0,
            prev,
            prev_time: Instant::now(),
            prev_tasks,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticks = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
        loop {
            select! {
                _ = cancel.cancelled() => return,
                _ = ticks.tick() => self.report().await,
            }
        }
    }

    async fn report(&mut self) {
        self.tick += 1;
        let now = Instant::now();
        let elapsed = (now - self.prev_time).as_secs_f64().max(1.0);

        let current = self.counters.snapshot();
        let conns = self.conn_source.conn_stats().await;
        let stats = IntervalStats::compute(&self.prev, &current, elapsed, &conns);

        info!(
            "transport: up {}/s down {}/s | pkt up {}/s down {}/s | retrans {:.1}% ({}) | lost {} | err {} | sndQ {} rcvQ {} sndBuf {}",
            fmt_bytes(stats.out_bytes as f64 / elapsed),
            fmt_bytes(stats.in_bytes as f64 / elapsed),
            fmt_count(stats.out_pkts as f64 / elapsed),
            fmt_count(stats.in_pkts as f64 / elapsed),
            stats.retrans_rate_pct,
            stats.retrans,
            stats.lost,
            stats.in_errs,
            stats.snd_ring,
            stats.rcv_ring,
            stats.snd_buf_ring,
        );

        if stats.fec_parity > 0 {
            info!(
                "fec: recovered {} | errors {} | parity {}",
                stats.fec_recovered, stats.fec_errs, stats.fec_parity,
            );
        }

        if stats.num_conns > 0 {
            let per_conn = conns
                .iter()
                .map(|c| c.streams.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            info!(
                "conn: {} active | streams {} | [{}]",
                stats.num_conns, stats.total_streams, per_conn,
            );
        }

        for alert in detect_bottlenecks(&stats) {
            warn!("bottleneck {}: {}", alert.label, alert.detail);
        }

        let runtime = self.runtime.snapshot();
        if self.tick % RUNTIME_SNAPSHOT_EVERY == 0 {
            info!(
                "runtime: {} alive tasks | rss {} | allocated {}",
                runtime.alive_tasks,
                fmt_opt_bytes(runtime.rss_bytes),
                fmt_opt_bytes(runtime.allocated_bytes),
            );
        }
        if let Some(alert) = detect_task_leak(self.prev_tasks, runtime.alive_tasks) {
            warn!("bottleneck {}: {}", alert.label, alert.detail);
        }

        self.prev = current;
        self.prev_time = now;
        self.prev_tasks = runtime.alive_tasks;
    }
}

struct IntervalStats {
    in_bytes: u64,
    out_bytes: u64,
    in_pkts: u64,
    out_pkts: u64,
    retrans: u64,
    lost: u64,
    in_errs: u64,
    retrans_rate_pct: f64,
    /// Outbound bytes per second over the interval.
    out_rate: f64,
    snd_ring: u64,
    rcv_ring: u64,
    snd_buf_ring: u64,
    fec_recovered: u64,
    fec_errs: u64,
    fec_parity: u64,
    num_conns: usize,
    total_streams: usize,
}

impl IntervalStats {
    fn compute(
        prev: &TransportCounters,
        current: &TransportCounters,
        elapsed: f64,
        conns: &[ConnStats],
    ) -> IntervalStats {
        let retrans = current.retrans_segs.saturating_sub(prev.retrans_segs);
        let out_segs = current.out_segs.saturating_sub(prev.out_segs);
        let out_bytes = current.out_bytes.saturating_sub(prev.out_bytes);
        let retrans_rate_pct = if out_segs > 0 {
            retrans as f64 / out_segs as f64 * 100.0
        } else {
            0.0
        };

        IntervalStats {
            in_bytes: current.in_bytes.saturating_sub(prev.in_bytes),
            out_bytes,
            in_pkts: current.in_pkts.saturating_sub(prev.in_pkts),
            out_pkts: current.out_pkts.saturating_sub(prev.out_pkts),
            retrans,
            lost: current.lost_segs.saturating_sub(prev.lost_segs),
            in_errs: current.in_errs.saturating_sub(prev.in_errs),
            retrans_rate_pct,
            out_rate: out_bytes as f64 / elapsed,
            snd_ring: current.snd_ring,
            rcv_ring: current.rcv_ring,
            snd_buf_ring: current.snd_buf_ring,
            fec_recovered: current.fec_recovered.saturating_sub(prev.fec_recovered),
            fec_errs: current.fec_errs.saturating_sub(prev.fec_errs),
            fec_parity: current.fec_parity.saturating_sub(prev.fec_parity),
            num_conns: conns.len(),
            total_streams: conns.iter().map(|c| c.streams).sum(),
        }
    }
}

struct Alert {
    label: &'static str,
    detail: String,
}

fn detect_bottlenecks(stats: &IntervalStats) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if stats.retrans_rate_pct > 5.0 {
        alerts.push(Alert {
            label: "packet_loss",
            detail: format!(
                "{:.1}% retransmission (>5%), likely capture buffer overflow, network congestion or ISP throttling",
                stats.retrans_rate_pct,
            ),
        });
    }
    if stats.lost > 100 {
        alerts.push(Alert {
            label: "pcap_drops",
            detail: format!(
                "{} lost segments (>100), the capture buffer cannot keep up; try a larger sockbuf or fewer connections",
                stats.lost,
            ),
        });
    }
    if stats.snd_buf_ring > 512 {
        alerts.push(Alert {
            label: "send_saturated",
            detail: format!(
                "sndBuf={} (>512), the transport cannot push data fast enough; try a larger sndwnd or check the network",
                stats.snd_buf_ring,
            ),
        });
    }
    if stats.rcv_ring > 256 {
        alerts.push(Alert {
            label: "recv_saturated",
            detail: format!(
                "rcvQ={} (>256), the application is not reading fast enough",
                stats.rcv_ring,
            ),
        });
    }
    if stats.in_errs > 0 {
        alerts.push(Alert {
            label: "read_errors",
            detail: format!("{} socket read failures this interval", stats.in_errs),
        });
    }
    if stats.total_streams > 0 && stats.out_rate > 0.0 && stats.out_rate < 100.0 * 1024.0 {
        alerts.push(Alert {
            label: "throughput_collapse",
            detail: format!(
                "{}/s with {} active streams, traffic exists but barely moves",
                fmt_bytes(stats.out_rate),
                stats.total_streams,
            ),
        });
    }
    if stats.num_conns > 0 {
        let avg_streams = stats.total_streams as f64 / stats.num_conns as f64;
        if avg_streams > 32.0 {
            alerts.push(Alert {
                label: "stream_overload",
                detail: format!(
                    "{:.0} avg streams per connection (>32), try more connections",
                    avg_streams,
                ),
            });
        }
    }

    alerts
}

/// More than 20% task growth between intervals once the count is past 100.
fn detect_task_leak(prev_tasks: usize, alive_tasks: usize) -> Option<Alert> {
    if prev_tasks == 0 || alive_tasks <= 100 {
        return None;
    }
    let growth = (alive_tasks as f64 - prev_tasks as f64) / prev_tasks as f64 * 100.0;
    if growth > 20.0 {
        Some(Alert {
            label: "task_leak",
            detail: format!(
                "{} -> {} (+{:.0}%), task count growing fast",
                prev_tasks, alive_tasks, growth,
            ),
        })
    } else {
        None
    }
}

fn fmt_bytes(bytes: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * KIB;
    const GIB: f64 = 1024.0 * MIB;
    if bytes >= GIB {
        format!("{:.1}GB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.1}MB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.1}KB", bytes / KIB)
    } else {
        format!("{:.0}B", bytes)
    }
}

fn fmt_count(count: f64) -> String {
    if count >= 1_000_000.0 {
        format!("{:.1}M", count / 1_000_000.0)
    } else if count >= 1_000.0 {
        format!("{:.1}k", count / 1_000.0)
    } else {
        format!("{:.0}", count)
    }
}

fn fmt_opt_bytes(bytes: Option<u64>) -> String {
    bytes.map_or_else(|| "-".to_string(), |b| fmt_bytes(b as f64))
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::test_util::{FixedConnStats, FixedRuntimeProbe, MockCounters};

    use super::*;

    fn quiet_stats() -> IntervalStats {
        IntervalStats {
            in_bytes: 0,
            out_bytes: 0,
            in_pkts: 0,
            out_pkts: 0,
            retrans: 0,
            lost: 0,
            in_errs: 0,
            retrans_rate_pct: 0.0,
            out_rate: 0.0,
            snd_ring: 0,
            rcv_ring: 0,
            snd_buf_ring: 0,
            fec_recovered: 0,
            fec_errs: 0,
            fec_parity: 0,
            num_conns: 0,
            total_streams: 0,
        }
    }

    fn labels(stats: &IntervalStats) -> Vec<&'static str> {
        detect_bottlenecks(stats).iter().map(|a| a.label).collect()
    }

    #[test]
    fn test_quiet_interval_raises_nothing() {
        assert!(labels(&quiet_stats()).is_empty());
    }

    #[rstest]
    #[case::packet_loss(
        |s: &mut IntervalStats| s.retrans_rate_pct = 5.1,
        "packet_loss"
    )]
    #[case::pcap_drops(|s: &mut IntervalStats| s.lost = 101, "pcap_drops")]
    #[case::send_saturated(|s: &mut IntervalStats| s.snd_buf_ring = 513, "send_saturated")]
    #[case::recv_saturated(|s: &mut IntervalStats| s.rcv_ring = 257, "recv_saturated")]
    #[case::read_errors(|s: &mut IntervalStats| s.in_errs = 1, "read_errors")]
    #[case::throughput_collapse(
        |s: &mut IntervalStats| {
            s.total_streams = 4;
            s.num_conns = 1;
            s.out_rate = 50.0 * 1024.0;
        },
        "throughput_collapse"
    )]
    #[case::stream_overload(
        |s: &mut IntervalStats| {
            s.num_conns = 2;
            s.total_streams = 66;
        },
        "stream_overload"
    )]
    fn test_single_rule_triggers(
        #[case] mutate: fn(&mut IntervalStats),
        #[case] expected_label: &'static str,
    ) {
        let mut stats = quiet_stats();
        mutate(&mut stats);
        assert!(labels(&stats).contains(&expected_label));
    }

    #[rstest]
    #[case::at_threshold(|s: &mut IntervalStats| s.retrans_rate_pct = 5.0)]
    #[case::lost_at_threshold(|s: &mut IntervalStats| s.lost = 100)]
    #[case::snd_buf_at_threshold(|s: &mut IntervalStats| s.snd_buf_ring = 512)]
    #[case::rcv_at_threshold(|s: &mut IntervalStats| s.rcv_ring = 256)]
    #[case::healthy_throughput(
        |s: &mut IntervalStats| {
            s.total_streams = 4;
            s.out_rate = 200.0 * 1024.0;
        }
    )]
    #[case::idle_streams_no_collapse(|s: &mut IntervalStats| s.total_streams = 4)]
    #[case::streams_at_threshold(
        |s: &mut IntervalStats| {
            s.num_conns = 2;
            s.total_streams = 64;
        }
    )]
    fn test_thresholds_are_strict(#[case] mutate: fn(&mut IntervalStats)) {
        let mut stats = quiet_stats();
        mutate(&mut stats);
        assert!(labels(&stats).is_empty());
    }

    #[rstest]
    #[case::leak(150, 200, true)]
    #[case::growth_at_threshold(150, 180, false)]
    #[case::below_floor(50, 100, false)]
    #[case::no_previous(0, 500, false)]
    #[case::shrinking(200, 150, false)]
    fn test_task_leak_rule(#[case] prev: usize, #[case] current: usize, #[case] expect: bool) {
        assert_eq!(detect_task_leak(prev, current).is_some(), expect);
    }

    #[test]
    fn test_interval_stats_diffs_against_previous() {
        let prev = TransportCounters {
            out_bytes: 1_000,
            in_bytes: 500,
            retrans_segs: 10,
            out_segs: 100,
            lost_segs: 5,
            ..Default::default()
        };
        let current = TransportCounters {
            out_bytes: 11_000,
            in_bytes: 2_500,
            retrans_segs: 30,
            out_segs: 300,
            lost_segs: 7,
            snd_ring: 42,
            ..Default::default()
        };

        let stats = IntervalStats::compute(
            &prev,
            &current,
            10.0,
            &[
                ConnStats {
                    remote: "192.0.2.1:4000".to_string(),
                    streams: 3,
                },
                ConnStats {
                    remote: "192.0.2.2:4000".to_string(),
                    streams: 5,
                },
            ],
        );

        assert_eq!(stats.out_bytes, 10_000);
        assert_eq!(stats.in_bytes, 2_000);
        assert_eq!(stats.retrans, 20);
        assert_eq!(stats.lost, 2);
        assert!((stats.retrans_rate_pct - 10.0).abs() < f64::EPSILON);
        assert!((stats.out_rate - 1_000.0).abs() < f64::EPSILON);
        assert_eq!(stats.snd_ring, 42);
        assert_eq!(stats.num_conns, 2);
        assert_eq!(stats.total_streams, 8);
    }

    #[rstest]
    #[case::bytes(512.0, "512B")]
    #[case::kib(2.5 * 1024.0, "2.5KB")]
    #[case::mib(3.0 * 1024.0 * 1024.0, "3.0MB")]
    #[case::gib(1.5 * 1024.0 * 1024.0 * 1024.0, "1.5GB")]
    fn test_fmt_bytes(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(fmt_bytes(value), expected);
    }

    #[rstest]
    #[case::plain(999.0, "999")]
    #[case::thousands(1_500.0, "1.5k")]
    #[case::millions(2_400_000.0, "2.4M")]
    fn test_fmt_count(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(fmt_count(value), expected);
    }

    #[tokio::test]
    async fn test_report_rolls_the_baseline_forward() {
        let counters = Arc::new(MockCounters::default());
        counters.update(|c| c.out_bytes = 5_000);

        let mut reporter = StatsReporter::new(
            counters.clone(),
            Arc::new(FixedConnStats::new(vec![])),
            Arc::new(FixedRuntimeProbe::new(RuntimeSnapshot::default())),
        );
        assert_eq!(reporter.prev.out_bytes, 5_000);

        counters.update(|c| c.out_bytes = 9_000);
        reporter.report().await;
        assert_eq!(reporter.prev.out_bytes, 9_000);
        assert_eq!(reporter.tick, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancellation() {
        let reporter = StatsReporter::new(
            Arc::new(MockCounters::default()),
            Arc::new(FixedConnStats::new(vec![])),
            Arc::new(FixedRuntimeProbe::new(RuntimeSnapshot::default())),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reporter.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}

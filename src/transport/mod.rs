//! Seams towards the reliable-datagram transport and its stream multiplexer.
//!
//! The ARQ/FEC engine and the multiplexer are consumed as black boxes. This
//! module defines the traits the client core drives them through, the global
//! counter snapshot they expose, and the derivation of the per-session knobs
//! from configuration.

pub mod autotune;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{Config, KcpConfig, KcpMode};

/// One logical bidirectional byte channel multiplexed inside a connection.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// One live transport connection to the tunnel server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Liveness request. With `expect_pong` the call waits for the peer's
    /// answer; without it, only the local write has to succeed.
    async fn ping(&self, expect_pong: bool) -> anyhow::Result<()>;

    async fn open_stream(&self) -> anyhow::Result<Box<dyn TunnelStream>>;

    fn num_streams(&self) -> usize;

    async fn close(&self);

    fn remote_addr(&self) -> String;

    /// Programs the congestion windows, in packets.
    fn set_window_size(&self, snd: usize, rcv: usize);
}

/// Establishes transport connections according to a [`Config`].
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn open(&self, cfg: &Config) -> anyhow::Result<Arc<dyn Connection>>;
}

/// Read-only snapshot of the transport's process-global counters.
///
/// The transport library keeps a single counter set for the whole process,
/// so everything derived from these numbers mixes traffic of all pooled
/// connections.
pub trait CounterSource: Send + Sync {
    fn snapshot(&self) -> TransportCounters;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub in_pkts: u64,
    pub out_pkts: u64,
    pub retrans_segs: u64,
    pub out_segs: u64,
    pub lost_segs: u64,
    pub in_errs: u64,
    /// Depth of the outbound packet ring.
    pub snd_ring: u64,
    /// Depth of the inbound packet ring.
    pub rcv_ring: u64,
    /// Segments queued in the send buffer awaiting acknowledgement.
    pub snd_buf_ring: u64,
    pub fec_recovered: u64,
    pub fec_errs: u64,
    pub fec_parity: u64,
    /// Application-level payload bytes, as opposed to raw packet bytes.
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// ARQ knobs pushed into the transport when a connection is dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcpTuning {
    pub no_delay: u32,
    pub interval: u32,
    pub resend: u32,
    pub no_congestion: u32,
    pub write_delay: bool,
    pub ack_no_delay: bool,
}

impl KcpTuning {
    pub fn derive(cfg: &KcpConfig) -> KcpTuning {
        let (no_delay, interval, resend, no_congestion, write_delay, ack_no_delay) = match cfg.mode
        {
            KcpMode::Normal => (0, 40, 2, 1, true, false),
            KcpMode::Fast => (1, 30, 2, 1, true, false),
            KcpMode::Fast2 => (1, 20, 2, 1, false, true),
            KcpMode::Fast3 => (1, 15, 2, 1, false, true),
            KcpMode::Manual => (
                cfg.no_delay,
                cfg.interval,
                cfg.resend,
                cfg.no_congestion,
                cfg.write_delay,
                cfg.ack_no_delay,
            ),
        };
        KcpTuning {
            no_delay,
            interval,
            resend,
            no_congestion,
            write_delay,
            ack_no_delay,
        }
    }
}

/// OS-level socket buffer applied to each transport connection. Prevents
/// drops under load.
pub const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Everything the dialer programs into one transport session: multiplexer
/// settings, windows, MTU and socket buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub mux_version: u8,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub max_frame_size: usize,
    pub max_receive_buffer: usize,
    pub max_stream_buffer: usize,
    pub snd_wnd: usize,
    pub rcv_wnd: usize,
    pub mtu: usize,
    /// Coalesces small writes into larger packets. Matters for relay
    /// throughput with many concurrent streams.
    pub stream_mode: bool,
    pub socket_buffer: usize,
}

impl SessionSettings {
    pub fn derive(cfg: &KcpConfig) -> SessionSettings {
        SessionSettings {
            mux_version: 2,
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(90),
            max_frame_size: 16384,
            max_receive_buffer: cfg.smux_buf,
            max_stream_buffer: cfg.stream_buf,
            snd_wnd: cfg.sndwnd,
            rcv_wnd: cfg.rcvwnd,
            mtu: cfg.mtu,
            stream_mode: true,
            socket_buffer: SOCKET_BUFFER_SIZE,
        }
    }
}

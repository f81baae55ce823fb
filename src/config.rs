//! Configuration surface of the tunnel client.
//!
//! Parsing lives with the hosting process; this module only defines the
//! structs, role-based defaults and validation.

use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::bail;
use tracing::warn;

use crate::protocol::TcpFlagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    /// Remote tunnel server, `host:port`.
    pub server_addr: String,
    pub transport: TransportConfig,
    pub network: NetworkConfig,
    pub pcap: PcapConfig,
    /// TCP flag combinations replayed on every connection acquisition,
    /// best-effort.
    pub tcp_flags: Vec<TcpFlagSet>,
}

impl Config {
    pub fn new(role: Role, server_addr: impl Into<String>) -> Config {
        Config {
            role,
            server_addr: server_addr.into(),
            transport: TransportConfig::default(),
            network: NetworkConfig::default(),
            pcap: PcapConfig::for_role(role),
            tcp_flags: Vec::new(),
        }
    }

    /// Initial and minimum pool size.
    pub fn min_conns(&self) -> usize {
        self.transport.conn
    }

    /// The pool never grows beyond twice its configured size.
    pub fn max_conns(&self) -> usize {
        self.transport.conn * 2
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transport.conn == 0 {
            bail!("transport.conn must be at least 1");
        }
        if self.network.port == 0 {
            bail!("network.port must be set");
        }
        let kcp = &self.transport.kcp;
        if kcp.sndwnd == 0 || kcp.rcvwnd == 0 {
            bail!("kcp window sizes must be positive");
        }
        if kcp.mtu < 50 || kcp.mtu > 1500 {
            bail!("kcp mtu must be between 50 and 1500, got {}", kcp.mtu);
        }
        if self.tcp_flags.len() > u8::MAX as usize {
            bail!("at most 255 tcp flag sets can be replayed per frame");
        }
        self.pcap.validate()
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of transport connections dialed at startup; also the pool's
    /// lower bound when autoscaling.
    pub conn: usize,
    pub kcp: KcpConfig,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            conn: 2,
            kcp: KcpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KcpMode {
    Normal,
    Fast,
    Fast2,
    Fast3,
    /// Take the six tuning knobs verbatim from [`KcpConfig`].
    Manual,
}

#[derive(Debug, Clone)]
pub struct KcpConfig {
    pub mode: KcpMode,
    pub sndwnd: usize,
    pub rcvwnd: usize,
    pub mtu: usize,
    /// The six manual knobs below only apply with [`KcpMode::Manual`].
    pub no_delay: u32,
    pub interval: u32,
    pub resend: u32,
    pub no_congestion: u32,
    pub write_delay: bool,
    pub ack_no_delay: bool,
    /// Session-wide receive buffer of the stream multiplexer.
    pub smux_buf: usize,
    /// Per-stream buffer of the stream multiplexer.
    pub stream_buf: usize,
}

impl Default for KcpConfig {
    fn default() -> KcpConfig {
        KcpConfig {
            mode: KcpMode::Fast,
            sndwnd: 1024,
            rcvwnd: 1024,
            mtu: 1350,
            no_delay: 0,
            interval: 40,
            resend: 2,
            no_congestion: 1,
            write_delay: true,
            ack_no_delay: false,
            smux_buf: 4 * 1024 * 1024,
            stream_buf: 2 * 1024 * 1024,
        }
    }
}

/// Source binding hints. Only surfaced in log output by this crate; the
/// socket layer consumes them when dialing.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapConfig {
    pub sockbuf: usize,
    pub promisc: bool,
    pub snaplen: usize,
    pub dscp: u8,
}

impl PcapConfig {
    /// Servers handle many concurrent streams and get the larger capture
    /// buffer.
    pub fn for_role(role: Role) -> PcapConfig {
        PcapConfig {
            sockbuf: match role {
                Role::Server => 32 * 1024 * 1024,
                Role::Client => 16 * 1024 * 1024,
            },
            promisc: false,
            snaplen: 1600,
            dscp: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sockbuf < 1024 {
            bail!("pcap sockbuf must be at least 1024 bytes");
        }
        if self.sockbuf > 100 * 1024 * 1024 {
            bail!("pcap sockbuf too large (max 100MB)");
        }
        if !self.sockbuf.is_power_of_two() {
            warn!(
                "pcap sockbuf ({} bytes) is not a power of two, values like 4MB, 8MB or 16MB perform better",
                self.sockbuf
            );
        }
        if self.snaplen < 256 || self.snaplen > 65536 {
            bail!("pcap snaplen must be between 256 and 65536");
        }
        if self.dscp > 63 {
            bail!("pcap dscp must be between 0 and 63");
        }
        Ok(())
    }
}

//! Framed control protocol spoken as the first exchange on every tunnel stream.
//!
//! One frame is a single type byte followed by a type-specific body, all
//! integers big-endian. A PING is exactly one byte on the wire, which is the
//! whole point: the previous self-describing encoding spent tens of bytes on
//! the same information.

use std::fmt::{Display, Formatter};

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum FrameType {
    Ping = 0x01,
    Pong = 0x02,
    TcpFlags = 0x03,
    TcpConnect = 0x04,
    UdpConnect = 0x05,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated frame")]
    ShortRead,
    #[error("address host is not valid UTF-8")]
    InvalidHost,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Relay target address. `host` may be a literal IP or a DNS name; the wire
/// format caps it at 255 bytes, which the constructor enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    host: String,
    port: u16,
}

impl Addr {
    pub fn new(host: impl Into<String>, port: u16) -> anyhow::Result<Addr> {
        let host = host.into();
        if host.len() > u8::MAX as usize {
            bail!("host does not fit the wire format: {} bytes", host.len());
        }
        Ok(Addr { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn ser_opt(addr: &Option<Addr>, buf: &mut impl BufMut) {
        match addr {
            None => buf.put_u8(0),
            Some(addr) => {
                buf.put_u8(1);
                buf.put_u8(addr.host.len() as u8);
                buf.put_slice(addr.host.as_bytes());
                buf.put_u16(addr.port);
            }
        }
    }

    fn try_deser_opt(buf: &mut impl bytes::Buf) -> Result<Option<Addr>, FrameError> {
        let present = buf.try_get_u8().map_err(|_| FrameError::ShortRead)?;
        if present == 0 {
            return Ok(None);
        }
        let host_len = buf.try_get_u8().map_err(|_| FrameError::ShortRead)?;
        let mut host = Vec::with_capacity(host_len as usize);
        for _ in 0..host_len {
            host.push(buf.try_get_u8().map_err(|_| FrameError::ShortRead)?);
        }
        let host = String::from_utf8(host).map_err(|_| FrameError::InvalidHost)?;
        let port = buf.try_get_u16().map_err(|_| FrameError::ShortRead)?;
        Ok(Some(Addr { host, port }))
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The nine TCP header flags, packed LSB-first into bits 0..8 of a `u16` on
/// the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlagSet {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
}

impl TcpFlagSet {
    pub fn to_bits(self) -> u16 {
        let mut bits = 0u16;
        for (i, flag) in [
            self.fin, self.syn, self.rst, self.psh, self.ack, self.urg, self.ece, self.cwr,
            self.ns,
        ]
        .into_iter()
        .enumerate()
        {
            if flag {
                bits |= 1 << i;
            }
        }
        bits
    }

    pub fn from_bits(bits: u16) -> TcpFlagSet {
        TcpFlagSet {
            fin: bits & (1 << 0) != 0,
            syn: bits & (1 << 1) != 0,
            rst: bits & (1 << 2) != 0,
            psh: bits & (1 << 3) != 0,
            ack: bits & (1 << 4) != 0,
            urg: bits & (1 << 5) != 0,
            ece: bits & (1 << 6) != 0,
            cwr: bits & (1 << 7) != 0,
            ns: bits & (1 << 8) != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Pong,
    /// Replay of observed TCP flag combinations, for link characterization.
    TcpFlags(Vec<TcpFlagSet>),
    /// Open a TCP relay towards the given target.
    TcpConnect(Option<Addr>),
    /// Open a UDP relay towards the given target.
    UdpConnect(Option<Addr>),
}

impl Frame {
    fn frame_type(&self) -> FrameType {
        match self {
            Frame::Ping => FrameType::Ping,
            Frame::Pong => FrameType::Pong,
            Frame::TcpFlags(_) => FrameType::TcpFlags,
            Frame::TcpConnect(_) => FrameType::TcpConnect,
            Frame::UdpConnect(_) => FrameType::UdpConnect,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::Ping | Frame::Pong => 0,
            Frame::TcpFlags(flags) => 1 + 2 * flags.len(),
            Frame::TcpConnect(addr) | Frame::UdpConnect(addr) => match addr {
                None => 1,
                Some(addr) => 1 + 1 + addr.host.len() + 2,
            },
        }
    }

    /// Writes exactly `encoded_len()` bytes, nothing more.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.frame_type().into());
        match self {
            Frame::Ping | Frame::Pong => {}
            Frame::TcpFlags(flags) => {
                buf.put_u8(flags.len() as u8);
                for flag_set in flags {
                    buf.put_u16(flag_set.to_bits());
                }
            }
            Frame::TcpConnect(addr) | Frame::UdpConnect(addr) => {
                Addr::ser_opt(addr, buf);
            }
        }
    }

    /// Reads exactly one frame, never consuming past its last byte.
    pub fn decode(buf: &mut impl bytes::Buf) -> Result<Frame, FrameError> {
        let type_byte = buf.try_get_u8().map_err(|_| FrameError::ShortRead)?;
        let frame_type =
            FrameType::try_from(type_byte).map_err(|_| FrameError::UnknownType(type_byte))?;
        match frame_type {
            FrameType::Ping => Ok(Frame::Ping),
            FrameType::Pong => Ok(Frame::Pong),
            FrameType::TcpFlags => {
                let count = buf.try_get_u8().map_err(|_| FrameError::ShortRead)?;
                let mut flags = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let bits = buf.try_get_u16().map_err(|_| FrameError::ShortRead)?;
                    flags.push(TcpFlagSet::from_bits(bits));
                }
                Ok(Frame::TcpFlags(flags))
            }
            FrameType::TcpConnect => Ok(Frame::TcpConnect(Addr::try_deser_opt(buf)?)),
            FrameType::UdpConnect => Ok(Frame::UdpConnect(Addr::try_deser_opt(buf)?)),
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    frame.encode(&mut buf);
    writer.write_all(&buf).await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let type_byte = read_u8(reader).await?;
    let frame_type =
        FrameType::try_from(type_byte).map_err(|_| FrameError::UnknownType(type_byte))?;
    match frame_type {
        FrameType::Ping => Ok(Frame::Ping),
        FrameType::Pong => Ok(Frame::Pong),
        FrameType::TcpFlags => {
            let count = read_u8(reader).await?;
            let mut body = vec![0u8; 2 * count as usize];
            reader.read_exact(&mut body).await.map_err(map_eof)?;
            let flags = body
                .chunks_exact(2)
                .map(|c| TcpFlagSet::from_bits(u16::from_be_bytes([c[0], c[1]])))
                .collect();
            Ok(Frame::TcpFlags(flags))
        }
        FrameType::TcpConnect => Ok(Frame::TcpConnect(read_addr_opt(reader).await?)),
        FrameType::UdpConnect => Ok(Frame::UdpConnect(read_addr_opt(reader).await?)),
    }
}

async fn read_addr_opt<R>(reader: &mut R) -> Result<Option<Addr>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if read_u8(reader).await? == 0 {
        return Ok(None);
    }
    let host_len = read_u8(reader).await?;
    let mut host = vec![0u8; host_len as usize];
    reader.read_exact(&mut host).await.map_err(map_eof)?;
    let host = String::from_utf8(host).map_err(|_| FrameError::InvalidHost)?;
    let mut port = [0u8; 2];
    reader.read_exact(&mut port).await.map_err(map_eof)?;
    Ok(Some(Addr {
        host,
        port: u16::from_be_bytes(port),
    }))
}

async fn read_u8<R>(reader: &mut R) -> Result<u8, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await.map_err(map_eof)?;
    Ok(byte[0])
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ShortRead
    } else {
        FrameError::Io(e)
    }
}

//! ICMP socket wrapper.
//!
//! Prefers the unprivileged datagram variant (`SOCK_DGRAM` + `IPPROTO_ICMP`)
//! and falls back to a raw socket when the platform does not offer one. The
//! wrapper records which mode it holds because the two differ in whether
//! inbound IPv4 datagrams still carry the IP header and in whether the
//! kernel rewrites the identifier field of outgoing requests.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::packet::IpVersion;

/// Maximum datagram we accept from the wire.
const MAX_DATAGRAM: usize = 1500;

/// TTL applied when a target does not override it.
pub const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Unprivileged ICMP datagram socket. The kernel assigns the identifier
    /// on transmit and demultiplexes replies per socket.
    Datagram,
    /// Raw socket; requires privilege, delivers every ICMP datagram.
    Raw,
}

#[derive(Debug)]
pub struct IcmpSocket {
    inner: Socket,
    version: IpVersion,
    mode: SocketMode,
}

impl IcmpSocket {
    /// Open an ICMP socket for `version`, datagram first, raw as fallback.
    pub fn open(version: IpVersion) -> Result<Self> {
        let (domain, protocol) = match version {
            IpVersion::V4 => (Domain::IPV4, Protocol::ICMPV4),
            IpVersion::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };

        let (inner, mode) = match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => (socket, SocketMode::Datagram),
            Err(dgram_err) => {
                debug!(
                    "datagram ICMP socket unavailable ({}), trying raw",
                    dgram_err
                );
                match Socket::new(domain, Type::RAW, Some(protocol)) {
                    Ok(socket) => (socket, SocketMode::Raw),
                    Err(raw_err) if raw_err.kind() == std::io::ErrorKind::PermissionDenied => {
                        return Err(EngineError::PermissionDenied);
                    }
                    Err(raw_err) => return Err(raw_err.into()),
                }
            }
        };

        inner.set_nonblocking(true)?;

        debug!(
            "opened {} ICMP socket in {:?} mode",
            version.family_name(),
            mode
        );

        Ok(Self {
            inner,
            version,
            mode,
        })
    }

    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// Whether inbound datagrams start with an IP header that has to be
    /// stripped before the ICMP message.
    pub fn includes_ip_header(&self) -> bool {
        match (self.version, self.mode) {
            (IpVersion::V6, _) => false,
            (IpVersion::V4, SocketMode::Raw) => true,
            // macOS keeps the IPv4 header on datagram ICMP sockets; Linux
            // strips it.
            (IpVersion::V4, SocketMode::Datagram) => cfg!(target_os = "macos"),
        }
    }

    pub fn set_ttl(&self, ttl: u8) -> Result<()> {
        self.inner.set_ttl(u32::from(ttl))?;
        Ok(())
    }

    pub fn set_hop_limit(&self, limit: u8) -> Result<()> {
        self.inner.set_unicast_hops_v6(u32::from(limit))?;
        Ok(())
    }

    /// Apply a TTL/hop-limit according to the socket's family. Zero means
    /// "no override" and resets to the default, since the socket is reused
    /// across targets with differing values.
    pub fn apply_hops(&self, ttl: u8) -> Result<()> {
        let effective = if ttl == 0 { DEFAULT_TTL } else { ttl };
        match self.version {
            IpVersion::V4 => self.set_ttl(effective),
            IpVersion::V6 => self.set_hop_limit(effective),
        }
    }

    pub fn send_to(&self, packet: &[u8], destination: IpAddr) -> Result<usize> {
        let addr = SockAddr::from(SocketAddr::new(destination, 0));
        let written = self.inner.send_to(packet, &addr)?;
        Ok(written)
    }

    /// Wait up to `timeout` for a datagram. Returns `Ok(None)` when nothing
    /// arrived in time; transient conditions (EINTR, spurious wakeups) also
    /// surface as `Ok(None)` so callers simply loop.
    pub fn recv_from(&self, timeout: Duration) -> Result<Option<(Vec<u8>, IpAddr)>> {
        // Waits longer than u16::MAX milliseconds are capped; callers poll
        // in a loop against their own deadline anyway.
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let poll_timeout = PollTimeout::from(millis);
        let mut fds = [PollFd::new(self.inner.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(None),
            Err(errno) => return Err(std::io::Error::from(errno).into()),
        }

        let mut buffer = [MaybeUninit::<u8>::uninit(); MAX_DATAGRAM];
        match self.inner.recv_from(&mut buffer) {
            Ok((len, addr)) => {
                let data: Vec<u8> = buffer[..len]
                    .iter()
                    .map(|byte| unsafe { byte.assume_init() })
                    .collect();
                let source = match addr.as_socket() {
                    Some(socket_addr) => socket_addr.ip(),
                    None => return Ok(None),
                };
                Ok(Some((data, source)))
            }
            Err(err) if EngineError::is_transient(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Socket creation needs either root or an unprivileged-ICMP sysctl, so
    // these tests skip quietly where neither is available.
    fn open_or_skip(version: IpVersion) -> Option<IcmpSocket> {
        match IcmpSocket::open(version) {
            Ok(socket) => Some(socket),
            Err(EngineError::PermissionDenied) => None,
            Err(err) => panic!("unexpected socket error: {err}"),
        }
    }

    #[test]
    fn test_open_v4() {
        let Some(socket) = open_or_skip(IpVersion::V4) else {
            return;
        };
        assert_eq!(socket.version(), IpVersion::V4);
        socket.apply_hops(0).unwrap();
        socket.apply_hops(3).unwrap();
    }

    #[test]
    fn test_recv_times_out_quickly() {
        let Some(socket) = open_or_skip(IpVersion::V4) else {
            return;
        };
        let start = std::time::Instant::now();
        // A raw socket may see unrelated ICMP traffic, so only the bound on
        // the wait matters here.
        let _ = socket.recv_from(Duration::from_millis(20)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_ip_header_expectation_is_family_consistent() {
        let Some(socket) = open_or_skip(IpVersion::V6) else {
            return;
        };
        assert!(!socket.includes_ip_header());
    }
}

//! ICMP packet construction and parsing.
//!
//! Builds Echo Requests and decodes Echo Reply / Time Exceeded messages for
//! both IPv4 and IPv6, byte-exact on the wire. The kernel supplies the outer
//! IP header on transmit; on receive the caller tells us whether the inbound
//! datagram still carries one.

use std::net::{IpAddr, Ipv6Addr};

pub const ICMP_HEADER_LEN: usize = 8;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

pub const ECHO_REQUEST_V4: u8 = 8;
pub const ECHO_REPLY_V4: u8 = 0;
pub const TIME_EXCEEDED_V4: u8 = 11;

pub const ECHO_REQUEST_V6: u8 = 128;
pub const ECHO_REPLY_V6: u8 = 129;
pub const TIME_EXCEEDED_V6: u8 = 3;

const IPPROTO_ICMPV6: u8 = 58;

/// Leading bytes of every Echo Request payload: four magic bytes followed by
/// the identifier and sequence in network byte order. Echoed back verbatim by
/// the destination, which lets the receiver re-derive the probe key when a
/// datagram socket has rewritten the identifier field in the header.
pub const PAYLOAD_MAGIC: [u8; 4] = *b"pprb";
pub const PAYLOAD_MARKER_LEN: usize = 8;

/// Payload length used by the engine for outgoing probes.
pub const DEFAULT_PAYLOAD_LEN: usize = 52;

/// IP version selector; decides address family, socket family and which
/// checksum rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn matches(self, addr: IpAddr) -> bool {
        Self::of(addr) == self
    }

    pub fn family_name(self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
        }
    }
}

/// Whether the builder computes the ICMPv6 checksum itself or leaves it for
/// the kernel.
///
/// Kernel raw ICMPv6 sockets fill the checksum on most platforms; sockets
/// that transmit the message verbatim need the full pseudo-header sum, which
/// requires knowing both endpoint addresses.
#[derive(Debug, Clone, Copy)]
pub enum ChecksumMode {
    Kernel,
    Full {
        source: Ipv6Addr,
        destination: Ipv6Addr,
    },
}

/// Internet checksum: one's-complement sum of 16-bit words with end-around
/// carry, complemented. Words are read in little-endian order and the
/// complement is stored the same way, which lands the correct bytes on the
/// wire. A trailing odd byte does not contribute to the sum; builders keep
/// wire messages even-length.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks_exact(2) {
        sum += u32::from(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// True if `message` carries a checksum consistent with its content.
pub fn verify_checksum(message: &[u8]) -> bool {
    checksum(message) == 0
}

/// Validate an ICMPv6 message checksum against the RFC 4443 pseudo-header.
pub fn verify_checksum_v6(source: Ipv6Addr, destination: Ipv6Addr, message: &[u8]) -> bool {
    checksum(&pseudo_header_buffer(source, destination, message)) == 0
}

fn pseudo_header_buffer(source: Ipv6Addr, destination: Ipv6Addr, message: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(IPV6_HEADER_LEN + message.len());
    buffer.extend_from_slice(&source.octets());
    buffer.extend_from_slice(&destination.octets());
    buffer.extend_from_slice(&(message.len() as u32).to_be_bytes());
    buffer.extend_from_slice(&[0, 0, 0, IPPROTO_ICMPV6]);
    buffer.extend_from_slice(message);
    buffer
}

fn fill_payload(payload: &mut [u8], identifier: u16, sequence: u16) {
    if payload.len() >= PAYLOAD_MARKER_LEN {
        payload[..4].copy_from_slice(&PAYLOAD_MAGIC);
        payload[4..6].copy_from_slice(&identifier.to_be_bytes());
        payload[6..8].copy_from_slice(&sequence.to_be_bytes());
    }
    // Remaining payload bytes stay zero, so a request is reproducible from
    // (identifier, sequence, length) alone.
}

/// Build an ICMPv4 Echo Request. The output starts at the ICMP header; the
/// kernel prepends the IP header.
pub fn build_echo_request_v4(identifier: u16, sequence: u16, payload_len: usize) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + payload_len];
    packet[0] = ECHO_REQUEST_V4;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    fill_payload(&mut packet[ICMP_HEADER_LEN..], identifier, sequence);
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_le_bytes());
    packet
}

/// Build an ICMPv6 Echo Request.
///
/// With `ChecksumMode::Kernel` the checksum field is left zero for the
/// kernel to fill; with `ChecksumMode::Full` it is computed over the
/// pseudo-header and the message.
pub fn build_echo_request_v6(
    identifier: u16,
    sequence: u16,
    payload_len: usize,
    mode: ChecksumMode,
) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + payload_len];
    packet[0] = ECHO_REQUEST_V6;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    fill_payload(&mut packet[ICMP_HEADER_LEN..], identifier, sequence);
    if let ChecksumMode::Full {
        source,
        destination,
    } = mode
    {
        let sum = checksum(&pseudo_header_buffer(source, destination, &packet));
        packet[2..4].copy_from_slice(&sum.to_le_bytes());
    }
    packet
}

/// Convenience builder for the engine's transmit path.
pub fn build_echo_request(
    version: IpVersion,
    identifier: u16,
    sequence: u16,
    payload_len: usize,
) -> Vec<u8> {
    match version {
        IpVersion::V4 => build_echo_request_v4(identifier, sequence, payload_len),
        IpVersion::V6 => {
            build_echo_request_v6(identifier, sequence, payload_len, ChecksumMode::Kernel)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    EchoReply,
    TimeExceeded,
}

/// A successfully classified inbound ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedReply {
    pub kind: ReplyKind,
    pub identifier: u16,
    pub sequence: u16,
    /// `(identifier, sequence)` recovered from the echoed payload marker,
    /// when present. Differs from the header fields when the kernel has
    /// rewritten the identifier on a datagram socket.
    pub marker: Option<(u16, u16)>,
    /// Hop distance inferred from the inbound IP TTL, when the header was
    /// available.
    pub hops: Option<u16>,
}

/// Parse an inbound datagram into one of the recognised message kinds.
///
/// Returns `None` for anything else - unknown types, short buffers,
/// truncated embedded headers. The receiver counts and discards those.
pub fn parse_reply(version: IpVersion, datagram: &[u8], has_ip_header: bool) -> Option<ParsedReply> {
    match version {
        IpVersion::V4 => {
            if has_ip_header {
                if datagram.len() < IPV4_MIN_HEADER_LEN {
                    return None;
                }
                if datagram[0] >> 4 != 4 {
                    return None;
                }
                let header_len = usize::from(datagram[0] & 0x0f) * 4;
                if header_len < IPV4_MIN_HEADER_LEN || datagram.len() < header_len {
                    return None;
                }
                let hops = infer_hops(datagram[8]);
                parse_v4(&datagram[header_len..], Some(hops))
            } else {
                parse_v4(datagram, None)
            }
        }
        // Raw and datagram ICMPv6 sockets both deliver the message without
        // the IPv6 header.
        IpVersion::V6 => parse_v6(datagram),
    }
}

fn parse_v4(icmp: &[u8], hops: Option<u16>) -> Option<ParsedReply> {
    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }
    match icmp[0] {
        ECHO_REPLY_V4 if icmp[1] == 0 => Some(ParsedReply {
            kind: ReplyKind::EchoReply,
            identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
            sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
            marker: marker_key(&icmp[ICMP_HEADER_LEN..]),
            hops,
        }),
        TIME_EXCEEDED_V4 => {
            // Payload: original IP header plus at least the first eight
            // bytes of the ICMP header that triggered the error.
            let inner = &icmp[ICMP_HEADER_LEN..];
            if inner.len() < IPV4_MIN_HEADER_LEN || inner[0] >> 4 != 4 {
                return None;
            }
            let inner_header_len = usize::from(inner[0] & 0x0f) * 4;
            if inner_header_len < IPV4_MIN_HEADER_LEN {
                return None;
            }
            let embedded = inner.get(inner_header_len..)?;
            if embedded.len() < ICMP_HEADER_LEN || embedded[0] != ECHO_REQUEST_V4 {
                return None;
            }
            Some(ParsedReply {
                kind: ReplyKind::TimeExceeded,
                identifier: u16::from_be_bytes([embedded[4], embedded[5]]),
                sequence: u16::from_be_bytes([embedded[6], embedded[7]]),
                marker: None,
                hops,
            })
        }
        _ => None,
    }
}

fn parse_v6(icmp: &[u8]) -> Option<ParsedReply> {
    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }
    match icmp[0] {
        ECHO_REPLY_V6 if icmp[1] == 0 => Some(ParsedReply {
            kind: ReplyKind::EchoReply,
            identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
            sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
            marker: marker_key(&icmp[ICMP_HEADER_LEN..]),
            hops: None,
        }),
        TIME_EXCEEDED_V6 => {
            // Payload: the original IPv6 header (fixed 40 bytes) followed by
            // the original ICMPv6 header.
            let inner = &icmp[ICMP_HEADER_LEN..];
            if inner.len() < IPV6_HEADER_LEN + ICMP_HEADER_LEN {
                return None;
            }
            if inner[0] >> 4 != 6 || inner[6] != IPPROTO_ICMPV6 {
                return None;
            }
            let embedded = &inner[IPV6_HEADER_LEN..];
            if embedded[0] != ECHO_REQUEST_V6 {
                return None;
            }
            Some(ParsedReply {
                kind: ReplyKind::TimeExceeded,
                identifier: u16::from_be_bytes([embedded[4], embedded[5]]),
                sequence: u16::from_be_bytes([embedded[6], embedded[7]]),
                marker: None,
                hops: None,
            })
        }
        _ => None,
    }
}

fn marker_key(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() < PAYLOAD_MARKER_LEN || payload[..4] != PAYLOAD_MAGIC {
        return None;
    }
    Some((
        u16::from_be_bytes([payload[4], payload[5]]),
        u16::from_be_bytes([payload[6], payload[7]]),
    ))
}

/// Infer the hop count to a responder from the TTL its reply arrived with,
/// assuming one of the common initial values 64, 128 or 255.
pub fn infer_hops(reply_ttl: u8) -> u16 {
    let initial: u16 = if reply_ttl <= 64 {
        64
    } else if reply_ttl <= 128 {
        128
    } else {
        255
    };
    initial - u16::from(reply_ttl) + 1
}

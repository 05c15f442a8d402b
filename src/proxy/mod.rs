//! HAProxy PROXY protocol v1/v2 preamble parsing. See `spec.md` §4.2 and the
//! [PROXY protocol spec](https://www.haproxy.org/download/2.8/doc/proxy-protocol.txt).

use std::collections::HashMap;
use std::net::IpAddr;

use crate::model::{ProxyCommand, ProxyFamily, ProxyInfo, ProxyProtocolKind};

/// First 12 bytes of a PROXY v2 header.
const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";

/// Returns true if `head` (at least 5 bytes) looks like the start of a PROXY
/// v1 text header.
pub fn looks_like_v1(head: &[u8]) -> bool {
    head.len() >= 5 && &head[..5] == b"PROXY"
}

/// Returns true if `head` (at least 12 bytes) matches the PROXY v2 signature.
pub fn looks_like_v2(head: &[u8]) -> bool {
    head.len() >= 12 && head[..12] == V2_SIGNATURE
}

/// Parses a complete PROXY v1 line (without the trailing CRLF).
pub fn parse_v1(line: &str) -> ProxyInfo {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.first() != Some(&"PROXY") {
        return ProxyInfo::invalid("v1 header must start with 'PROXY'");
    }

    match fields.as_slice() {
        ["PROXY", "UNKNOWN", ..] => ProxyInfo {
            version: 1,
            command: ProxyCommand::Proxy,
            family: ProxyFamily::Unspec,
            protocol: ProxyProtocolKind::Unknown,
            src_addr: None,
            dst_addr: None,
            src_port: None,
            dst_port: None,
            rest_bytes: Vec::new(),
            tlv: HashMap::new(),
            valid: true,
            error: None,
        },
        ["PROXY", proto @ ("TCP4" | "TCP6"), src, dst, sport, dport] => {
            let family = if *proto == "TCP4" {
                ProxyFamily::Inet
            } else {
                ProxyFamily::Inet6
            };
            let src_addr = src.parse::<IpAddr>().ok();
            let dst_addr = dst.parse::<IpAddr>().ok();
            let src_port = sport.parse::<u16>().ok();
            let dst_port = dport.parse::<u16>().ok();

            if src_addr.is_none() || dst_addr.is_none() || src_port.is_none() || dst_port.is_none() {
                return ProxyInfo::invalid("v1 header has malformed address or port field");
            }

            ProxyInfo {
                version: 1,
                command: ProxyCommand::Proxy,
                family,
                protocol: ProxyProtocolKind::Stream,
                src_addr,
                dst_addr,
                src_port,
                dst_port,
                rest_bytes: Vec::new(),
                tlv: HashMap::new(),
                valid: true,
                error: None,
            }
        }
        _ => ProxyInfo::invalid("v1 header has the wrong number of fields or unknown protocol token"),
    }
}

/// Parses a complete PROXY v2 preamble: the fixed 16-octet header, the
/// address block, and any trailing TLVs.
pub fn parse_v2(data: &[u8]) -> ProxyInfo {
    if data.len() < 16 {
        return ProxyInfo::invalid("v2 header shorter than 16 octets");
    }
    if data[..12] != V2_SIGNATURE {
        return ProxyInfo::invalid("v2 signature mismatch");
    }

    let ver_cmd = data[12];
    let version = ver_cmd >> 4;
    if version != 2 {
        return ProxyInfo::invalid(format!("unsupported PROXY protocol version {}", version));
    }
    let command = match ver_cmd & 0x0F {
        0x0 => ProxyCommand::Local,
        0x1 => ProxyCommand::Proxy,
        other => return ProxyInfo::invalid(format!("unknown v2 command nibble {:#x}", other)),
    };

    let fam_proto = data[13];
    let family_nibble = fam_proto >> 4;
    let proto_nibble = fam_proto & 0x0F;

    let family = match family_nibble {
        0x0 => ProxyFamily::Unspec,
        0x1 => ProxyFamily::Inet,
        0x2 => ProxyFamily::Inet6,
        0x3 => ProxyFamily::Unix,
        other => return ProxyInfo::invalid(format!("unknown v2 address family {:#x}", other)),
    };
    let protocol = match proto_nibble {
        0x0 => ProxyProtocolKind::Unknown,
        0x1 => ProxyProtocolKind::Stream,
        0x2 => ProxyProtocolKind::Dgram,
        other => return ProxyInfo::invalid(format!("unknown v2 transport protocol {:#x}", other)),
    };

    let len = u16::from_be_bytes([data[14], data[15]]) as usize;
    if data.len() < 16 + len {
        return ProxyInfo::invalid("v2 header declares more address/TLV bytes than were sent");
    }
    let body = &data[16..16 + len];

    if matches!(command, ProxyCommand::Local) {
        return ProxyInfo {
            version: 2,
            command,
            family,
            protocol,
            src_addr: None,
            dst_addr: None,
            src_port: None,
            dst_port: None,
            rest_bytes: body.to_vec(),
            tlv: HashMap::new(),
            valid: true,
            error: None,
        };
    }

    let (src_addr, dst_addr, src_port, dst_port, tlv_start) = match family {
        ProxyFamily::Inet => {
            if body.len() < 12 {
                return ProxyInfo::invalid("v2 INET address block too short");
            }
            let src = IpAddr::from([body[0], body[1], body[2], body[3]]);
            let dst = IpAddr::from([body[4], body[5], body[6], body[7]]);
            let sport = u16::from_be_bytes([body[8], body[9]]);
            let dport = u16::from_be_bytes([body[10], body[11]]);
            (Some(src), Some(dst), Some(sport), Some(dport), 12)
        }
        ProxyFamily::Inet6 => {
            if body.len() < 36 {
                return ProxyInfo::invalid("v2 INET6 address block too short");
            }
            let mut src_octets = [0u8; 16];
            let mut dst_octets = [0u8; 16];
            src_octets.copy_from_slice(&body[0..16]);
            dst_octets.copy_from_slice(&body[16..32]);
            let sport = u16::from_be_bytes([body[32], body[33]]);
            let dport = u16::from_be_bytes([body[34], body[35]]);
            (
                Some(IpAddr::from(src_octets)),
                Some(IpAddr::from(dst_octets)),
                Some(sport),
                Some(dport),
                36,
            )
        }
        ProxyFamily::Unix | ProxyFamily::Unspec => (None, None, None, None, 0),
    };

    let tlv_bytes = body.get(tlv_start..).unwrap_or(&[]);
    let tlv = parse_tlvs(tlv_bytes);

    ProxyInfo {
        version: 2,
        command,
        family,
        protocol,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        rest_bytes: Vec::new(),
        tlv,
        valid: true,
        error: None,
    }
}

/// Standard PROXY v2 TLV type bytes we name instead of leaving as `xNN`.
fn tlv_type_name(ty: u8) -> String {
    match ty {
        0x01 => "ALPN".to_string(),
        0x02 => "AUTHORITY".to_string(),
        0x03 => "CRC32C".to_string(),
        0x04 => "NOOP".to_string(),
        0x05 => "UNIQUE_ID".to_string(),
        0x20 => "SSL".to_string(),
        0x21 => "SSL_VERSION".to_string(),
        0x22 => "SSL_CN".to_string(),
        0x23 => "SSL_CIPHER".to_string(),
        0x24 => "SSL_SIG_ALG".to_string(),
        0x25 => "SSL_KEY_ALG".to_string(),
        0x30 => "NETNS".to_string(),
        other => format!("x{:02X}", other),
    }
}

fn parse_tlvs(mut bytes: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut out = HashMap::new();
    while bytes.len() >= 3 {
        let ty = bytes[0];
        let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        let value_start = 3;
        if bytes.len() < value_start + len {
            break;
        }
        let value = bytes[value_start..value_start + len].to_vec();
        out.insert(tlv_type_name(ty), value);
        bytes = &bytes[value_start + len..];
    }
    out
}

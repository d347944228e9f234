//! ICMP echo probe with native sockets and a ping-command fallback.
//!
//! The native path runs blocking sockets in spawn_blocking for precise
//! timing; each request carries a unique (identifier, sequence) pair so
//! concurrent probes to the same host can tell their replies apart.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PingMode {
    /// Native ICMP sockets are usable (RAW or unprivileged DGRAM).
    Native,
    /// Only the ping command fallback is available.
    Command,
}

static PING_MODE: OnceLock<PingMode> = OnceLock::new();
static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_ping_mode() -> PingMode {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok()
        || Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok()
    {
        tracing::info!("probe: native ICMP available");
        PingMode::Native
    } else {
        tracing::info!("probe: native ICMP unavailable, using ping command fallback");
        PingMode::Command
    }
}

/// Send one echo request and wait for the matching reply, bounded by
/// `timeout`. Returns the round-trip time on success.
pub async fn ping_once(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let mode = *PING_MODE.get_or_init(detect_ping_mode);

    let result = match mode {
        PingMode::Native => {
            let outcome = tokio::task::spawn_blocking(move || icmp_echo(ip, timeout))
                .await
                .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;
            match outcome {
                Err(ProbeError::Network(msg)) if msg.contains("ermission") => {
                    tracing::warn!("probe: native ping denied for {}, trying command: {}", ip, msg);
                    ping_command(ip, timeout).await
                }
                other => other,
            }
        }
        PingMode::Command => ping_command(ip, timeout).await,
    };

    // A reply that arrived past the deadline counts as a timeout.
    match result {
        Ok(rtt) if rtt >= timeout => Err(ProbeError::Timeout(timeout)),
        other => other,
    }
}

fn icmp_echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let is_v4 = matches!(ip, IpAddr::V4(_));
    let (domain, protocol, request_type, reply_type) = if is_v4 {
        (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8)
    } else {
        (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8)
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Unreachable(format!("connect failed: {}", e)))?;

    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = echo_request(request_type, is_v4, identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::Network(format!("send failed: {}", e)))?;

    // Replies for other in-flight probes can land on this socket; keep
    // reading until ours shows up or the deadline passes.
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("recv failed: {}", e))
            }
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // SAFETY: recv initialized `len` bytes.
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        if let Some((id, seq)) = parse_echo_reply(data, reply_type) {
            if id == identifier && seq == sequence {
                return Ok(elapsed);
            }
        }
    }
}

/// Build an echo request (ICMP type 8 or ICMPv6 type 128, code 0) with a
/// 16-byte payload. The checksum is filled in for IPv4 only; the kernel
/// computes it for ICMPv6.
fn echo_request(request_type: u8, checksum: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 24];
    packet[0] = request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if checksum {
        let sum = rfc1071_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Extract (identifier, sequence) from an echo reply, skipping the IPv4
/// header when a RAW socket delivered it.
fn parse_echo_reply(data: &[u8], reply_type: u8) -> Option<(u16, u16)> {
    let offset = if reply_type == 0 && data.first().map(|b| b >> 4) == Some(4) {
        20
    } else {
        0
    };
    let icmp = data.get(offset..offset + 8)?;
    if icmp[0] != reply_type {
        return None;
    }
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((id, seq))
}

/// Internet checksum (RFC 1071).
fn rfc1071_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]]) as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum += word;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

async fn ping_command(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), &ip.to_string()])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        if stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Unreachable(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout).ok_or_else(|| {
        ProbeError::Command(format!("failed to parse ping output: {}", stdout.trim()))
    })
}

fn parse_ping_output(output: &str) -> Option<Duration> {
    // Per-packet line: "time=12.3 ms" (also "time<1 ms" on some platforms).
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet =
        PER_PACKET.get_or_init(|| Regex::new(r"time[=<]\s*(?P<ms>[0-9.]+)\s*ms").unwrap());

    if let Some(caps) = per_packet.captures(output) {
        if let Ok(ms) = caps["ms"].parse::<f64>() {
            return Some(Duration::from_secs_f64(ms / 1000.0));
        }
    }

    // Summary line: "rtt min/avg/max/mdev = a/b/c/d ms" (avg field).
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"min/avg/max[^=]*=\s*[0-9.]+/(?P<avg>[0-9.]+)/").unwrap()
    });

    summary
        .captures(output)
        .and_then(|caps| caps["avg"].parse::<f64>().ok())
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_layout() {
        let packet = echo_request(8, true, 0x1234, 0x0042);
        assert_eq!(packet.len(), 24);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x42]);
        // The checksum over a checksummed packet folds to zero.
        assert_eq!(rfc1071_checksum(&packet), 0);
    }

    #[test]
    fn test_parse_echo_reply_dgram_and_raw() {
        let mut reply = vec![0u8; 8];
        reply[0] = 0;
        reply[4..6].copy_from_slice(&0xbeefu16.to_be_bytes());
        reply[6..8].copy_from_slice(&7u16.to_be_bytes());
        assert_eq!(parse_echo_reply(&reply, 0), Some((0xbeef, 7)));

        // RAW sockets deliver the IPv4 header first.
        let mut raw = vec![0u8; 28];
        raw[0] = 0x45;
        raw[24..26].copy_from_slice(&0xbeefu16.to_be_bytes());
        raw[26..28].copy_from_slice(&7u16.to_be_bytes());
        assert_eq!(parse_echo_reply(&raw, 0), Some((0xbeef, 7)));

        // Wrong type is not our reply.
        reply[0] = 8;
        assert_eq!(parse_echo_reply(&reply, 0), None);
    }

    #[test]
    fn test_parse_ping_output_per_packet() {
        let out = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms";
        let rtt = parse_ping_output(out).unwrap();
        assert!((rtt.as_secs_f64() - 0.0123).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_summary() {
        let out = "--- host ping statistics ---\n\
                   1 packets transmitted, 1 received, 0% packet loss\n\
                   rtt min/avg/max/mdev = 17.906/18.120/18.334/0.214 ms";
        let rtt = parse_ping_output(out).unwrap();
        assert!((rtt.as_secs_f64() - 0.018120).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(parse_ping_output("no timing here").is_none());
    }
}

//! Network flow comparison over captured pcap files.
//!
//! Parses the legacy pcap container format directly (both byte orders,
//! Ethernet or raw-IP link layers) and extracts IPv4 TCP/UDP flows. A flow
//! is a unique address/port pair; the client is whoever sent the first
//! packet. Only packet payloads are compared, never timing.

use crate::config::ConfigError;
use crate::plugin::{Comparator, ComparisonResult, CrashResult, TraceHook, Value};
use crate::trace::Trace;
use serde::Deserialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn ip_number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct PcapConfig {
    /// Pcap filename, relative to the trace working directory.
    filename: PathBuf,
    protocol: Protocol,
    /// Keep packets with this source or destination port.
    port: u16,
    /// Keep packets with this source or destination address.
    #[serde(default)]
    address: Option<Ipv4Addr>,
    #[serde(default = "default_true")]
    compare_payload: bool,
    /// Whether the filtered flow is expected to exist in the capture.
    #[serde(default = "default_true")]
    exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Payload {
    origin: Origin,
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Flow {
    client: String,
    server: String,
    payloads: Vec<Payload>,
}

impl Flow {
    fn describe(&self) -> String {
        format!("{}->{}", self.client, self.server)
    }
}

/// One filtered packet: endpoints plus transport payload.
struct FlowPacket {
    source: String,
    dest: String,
    payload: Vec<u8>,
}

/// Compares TCP or UDP flows between the original and debloated packet
/// captures, filtered by protocol, port, and optionally address.
pub struct PcapComparator {
    config: PcapConfig,
}

pub fn pcap(config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
    let config: PcapConfig = serde_yaml::from_value(config.clone())
        .map_err(|err| ConfigError::invalid("pcap", err.to_string()))?;
    Ok(Box::new(PcapComparator { config }))
}

impl PcapComparator {
    fn pcap_filename(&self, trace: &Trace) -> PathBuf {
        if self.config.filename.is_absolute() {
            self.config.filename.clone()
        } else {
            trace.cwd.join(&self.config.filename)
        }
    }

    fn describe_filter(&self) -> String {
        let address = self
            .config
            .address
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "*".to_string());
        format!("{}/{}:{}", self.config.protocol, address, self.config.port)
    }

    fn flow_cache_key(&self) -> String {
        format!("{}_flows", self.describe_filter())
    }

    fn load_flows(&self, path: &Path) -> Result<Vec<Flow>, String> {
        let data = std::fs::read(path)
            .map_err(|err| format!("failed to read pcap {}: {err}", path.display()))?;
        let packets = parse_pcap(&data)?;
        Ok(extract_flows(self.filter(packets)))
    }

    fn filter(&self, packets: Vec<ParsedPacket>) -> Vec<FlowPacket> {
        packets
            .into_iter()
            .filter(|pkt| pkt.protocol == self.config.protocol.ip_number())
            .filter(|pkt| self.config.port == pkt.src_port || self.config.port == pkt.dst_port)
            .filter(|pkt| match self.config.address {
                Some(addr) => addr == pkt.src_addr || addr == pkt.dst_addr,
                None => true,
            })
            .map(|pkt| FlowPacket {
                source: format!("{}:{}", pkt.src_addr, pkt.src_port),
                dest: format!("{}:{}", pkt.dst_addr, pkt.dst_port),
                payload: pkt.payload,
            })
            .collect()
    }

    /// Flows from the original trace, memoized in the trace cache by
    /// `verify_original` so every debloated comparison parses the original
    /// capture once.
    fn original_flows(&self, original: &Trace) -> Result<Vec<Flow>, String> {
        if let Some(encoded) = original.cache_get(&self.flow_cache_key()) {
            return Ok(decode_flows(&encoded));
        }
        self.load_flows(&self.pcap_filename(original))
    }

    fn compare_flows(&self, original: &[Flow], debloated: &[Flow]) -> Option<String> {
        if original.len() != debloated.len() {
            let direction = if original.len() > debloated.len() {
                "more"
            } else {
                "less"
            };
            return Some(format!(
                "the original trace has {direction} flows than the debloated trace"
            ));
        }

        for (original_flow, debloated_flow) in original.iter().zip(debloated) {
            if original_flow.client != debloated_flow.client
                && original_flow.server != debloated_flow.server
            {
                return Some(format!(
                    "flows do not match: {} != {}",
                    original_flow.describe(),
                    debloated_flow.describe()
                ));
            }
            if !self.config.compare_payload {
                continue;
            }

            if original_flow.payloads.len() != debloated_flow.payloads.len() {
                let direction = if original_flow.payloads.len() > debloated_flow.payloads.len() {
                    "more"
                } else {
                    "less"
                };
                return Some(format!(
                    "the original flow has {direction} payloads than the debloated flow: {}",
                    original_flow.describe()
                ));
            }
            for (a, b) in original_flow.payloads.iter().zip(&debloated_flow.payloads) {
                if a != b {
                    return Some(format!(
                        "mismatch payload for flow {}",
                        original_flow.describe()
                    ));
                }
            }
        }
        None
    }
}

impl TraceHook for PcapComparator {}

impl Comparator for PcapComparator {
    fn id(&self) -> &str {
        "pcap"
    }

    fn verify_original(&self, original: &Trace) -> Option<CrashResult> {
        let filename = self.pcap_filename(original);
        if !filename.is_file() {
            return Some(CrashResult::with_comparator(
                original,
                format!("pcap file does not exist: {}", filename.display()),
                self.id(),
            ));
        }

        let flows = match self.load_flows(&filename) {
            Ok(flows) => flows,
            Err(err) => return Some(CrashResult::with_comparator(original, err, self.id())),
        };

        if !flows.is_empty() && !self.config.exists {
            return Some(CrashResult::with_comparator(
                original,
                format!("unexpected flow in pcap: {}", self.describe_filter()),
                self.id(),
            ));
        }
        if flows.is_empty() && self.config.exists {
            return Some(CrashResult::with_comparator(
                original,
                format!("flow does not exist in pcap: {}", self.describe_filter()),
                self.id(),
            ));
        }

        original.cache_put(self.flow_cache_key(), encode_flows(&flows));
        None
    }

    fn compare(&self, original: &Trace, debloated: &Trace) -> ComparisonResult {
        let filename = self.pcap_filename(debloated);
        if !filename.is_file() {
            return ComparisonResult::error(
                self.id(),
                debloated,
                format!("pcap file does not exist: {}", filename.display()),
            );
        }

        let debloated_flows = match self.load_flows(&filename) {
            Ok(flows) => flows,
            Err(err) => return ComparisonResult::error(self.id(), debloated, err),
        };

        if !self.config.exists {
            return if debloated_flows.is_empty() {
                ComparisonResult::success(self.id(), debloated)
            } else {
                ComparisonResult::error(
                    self.id(),
                    debloated,
                    format!("unexpected flow in pcap: {}", self.describe_filter()),
                )
            };
        }

        let original_flows = match self.original_flows(original) {
            Ok(flows) => flows,
            Err(err) => return ComparisonResult::error(self.id(), debloated, err),
        };
        match self.compare_flows(&original_flows, &debloated_flows) {
            Some(details) => ComparisonResult::error(self.id(), debloated, details),
            None => ComparisonResult::success(self.id(), debloated),
        }
    }
}

fn extract_flows(packets: Vec<FlowPacket>) -> Vec<Flow> {
    let mut flows: Vec<Flow> = Vec::new();
    for pkt in packets {
        let index = flows
            .iter()
            .position(|flow| {
                (flow.client == pkt.source && flow.server == pkt.dest)
                    || (flow.client == pkt.dest && flow.server == pkt.source)
            })
            .unwrap_or_else(|| {
                flows.push(Flow {
                    client: pkt.source.clone(),
                    server: pkt.dest.clone(),
                    payloads: Vec::new(),
                });
                flows.len() - 1
            });

        if pkt.payload.is_empty() {
            continue;
        }
        let origin = if flows[index].client == pkt.source {
            Origin::Client
        } else {
            Origin::Server
        };
        flows[index].payloads.push(Payload {
            origin,
            data: pkt.payload,
        });
    }
    flows
}

/// Flows encoded to a line-oriented string for the trace cache.
fn encode_flows(flows: &[Flow]) -> String {
    let mut out = String::new();
    for flow in flows {
        out.push_str(&format!("F {} {}\n", flow.client, flow.server));
        for payload in &flow.payloads {
            let origin = match payload.origin {
                Origin::Client => 'c',
                Origin::Server => 's',
            };
            let hex: String = payload.data.iter().map(|b| format!("{b:02x}")).collect();
            out.push_str(&format!("P {origin} {hex}\n"));
        }
    }
    out
}

fn decode_flows(encoded: &str) -> Vec<Flow> {
    let mut flows: Vec<Flow> = Vec::new();
    for line in encoded.lines() {
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("F"), Some(client), Some(server)) => flows.push(Flow {
                client: client.to_string(),
                server: server.to_string(),
                payloads: Vec::new(),
            }),
            (Some("P"), Some(origin), Some(hex)) => {
                let Some(flow) = flows.last_mut() else { continue };
                let data = (0..hex.len() / 2)
                    .filter_map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok())
                    .collect();
                flow.payloads.push(Payload {
                    origin: if origin == "c" {
                        Origin::Client
                    } else {
                        Origin::Server
                    },
                    data,
                });
            }
            _ => {}
        }
    }
    flows
}

struct ParsedPacket {
    protocol: u8,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
}

const MAGIC_LE: u32 = 0xa1b2c3d4;
const MAGIC_LE_NANO: u32 = 0xa1b23c4d;
const LINKTYPE_NULL: u32 = 0;
const LINKTYPE_ETHERNET: u32 = 1;
const LINKTYPE_RAW: u32 = 101;

/// Parse a legacy pcap file into IPv4 TCP/UDP packets. Non-IP and non-IPv4
/// frames are skipped, malformed headers fail the whole parse.
fn parse_pcap(data: &[u8]) -> Result<Vec<ParsedPacket>, String> {
    if data.len() < 24 {
        return Err("pcap file is truncated".to_string());
    }

    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let big_endian = match magic {
        MAGIC_LE | MAGIC_LE_NANO => false,
        _ if magic.swap_bytes() == MAGIC_LE || magic.swap_bytes() == MAGIC_LE_NANO => true,
        _ => return Err(format!("not a pcap file (magic {magic:#010x})")),
    };
    let read_u32 = |bytes: &[u8]| -> u32 {
        let bytes: [u8; 4] = bytes.try_into().unwrap();
        if big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    };
    let link_type = read_u32(&data[20..24]);

    let mut packets = Vec::new();
    let mut offset = 24;
    while offset + 16 <= data.len() {
        let captured = read_u32(&data[offset + 8..offset + 12]) as usize;
        offset += 16;
        if offset + captured > data.len() {
            return Err("pcap record is truncated".to_string());
        }
        let frame = &data[offset..offset + captured];
        offset += captured;

        let ip = match link_type {
            LINKTYPE_ETHERNET => {
                if frame.len() < 14 || u16::from_be_bytes([frame[12], frame[13]]) != 0x0800 {
                    continue;
                }
                &frame[14..]
            }
            LINKTYPE_RAW => frame,
            LINKTYPE_NULL => {
                if frame.len() < 4 {
                    continue;
                }
                &frame[4..]
            }
            other => return Err(format!("unsupported pcap link type: {other}")),
        };
        if let Some(packet) = parse_ipv4(ip) {
            packets.push(packet);
        }
    }
    Ok(packets)
}

fn parse_ipv4(data: &[u8]) -> Option<ParsedPacket> {
    if data.len() < 20 || data[0] >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(data[0] & 0x0f) * 4;
    let total_len = usize::from(u16::from_be_bytes([data[2], data[3]])).min(data.len());
    if header_len < 20 || total_len < header_len {
        return None;
    }
    let protocol = data[9];
    let src_addr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst_addr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let transport = &data[header_len..total_len];

    let (src_port, dst_port, payload) = match protocol {
        // TCP: data offset in the high nibble of byte 12.
        6 => {
            if transport.len() < 20 {
                return None;
            }
            let data_offset = usize::from(transport[12] >> 4) * 4;
            if transport.len() < data_offset {
                return None;
            }
            (
                u16::from_be_bytes([transport[0], transport[1]]),
                u16::from_be_bytes([transport[2], transport[3]]),
                transport[data_offset..].to_vec(),
            )
        }
        17 => {
            if transport.len() < 8 {
                return None;
            }
            (
                u16::from_be_bytes([transport[0], transport[1]]),
                u16::from_be_bytes([transport[2], transport[3]]),
                transport[8..].to_vec(),
            )
        }
        _ => return None,
    };

    Some(ParsedPacket {
        protocol,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ComparisonStatus;
    use crate::render::Template;
    use crate::trace::{StdinSource, TimeoutConstraint, TraceContext, TraceTemplate};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn trace(dir: &Path, engine: &str) -> Trace {
        let template = Arc::new(TraceTemplate {
            id: "t01".to_string(),
            name: "test".to_string(),
            summary: String::new(),
            arguments: Template::compile("").unwrap(),
            variables: Vec::new(),
            comparators: Vec::new(),
            expect_success: true,
            expect_signal: 0,
            timeout: TimeoutConstraint::default(),
            stdin: StdinSource::Empty,
            input_files: Vec::new(),
            setup: None,
            teardown: None,
            concurrent: None,
        });
        let context = Arc::new(TraceContext {
            template,
            id: "t01-001".to_string(),
            values: BTreeMap::new(),
            arguments: String::new(),
        });
        let cwd = dir.join(engine);
        std::fs::create_dir_all(&cwd).unwrap();
        Trace::new(cwd.join("binary"), context, cwd, engine)
    }

    fn tcp_packet(src: (&str, u16), dst: (&str, u16), payload: &[u8]) -> Vec<u8> {
        let src_addr: Ipv4Addr = src.0.parse().unwrap();
        let dst_addr: Ipv4Addr = dst.0.parse().unwrap();

        let mut tcp = Vec::new();
        tcp.extend_from_slice(&src.1.to_be_bytes());
        tcp.extend_from_slice(&dst.1.to_be_bytes());
        tcp.extend_from_slice(&[0; 8]); // seq + ack
        tcp.push(5 << 4); // data offset: 5 words
        tcp.extend_from_slice(&[0; 7]); // flags, window, checksum, urgent
        tcp.extend_from_slice(payload);

        let total_len = (20 + tcp.len()) as u16;
        let mut ip = vec![0x45, 0];
        ip.extend_from_slice(&total_len.to_be_bytes());
        ip.extend_from_slice(&[0; 5]); // id, frag offset, ttl
        ip.push(6); // protocol
        ip.extend_from_slice(&[0; 2]); // checksum
        ip.extend_from_slice(&src_addr.octets());
        ip.extend_from_slice(&dst_addr.octets());
        ip.extend_from_slice(&tcp);

        let mut frame = vec![0; 12];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&ip);
        frame
    }

    fn write_pcap(path: &Path, frames: &[Vec<u8>]) {
        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC_LE.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes()); // version major
        data.extend_from_slice(&4u16.to_le_bytes()); // version minor
        data.extend_from_slice(&[0; 8]); // thiszone, sigfigs
        data.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        data.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        for frame in frames {
            data.extend_from_slice(&[0; 8]); // timestamp
            data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            data.extend_from_slice(frame);
        }
        std::fs::write(path, data).unwrap();
    }

    fn exchange() -> Vec<Vec<u8>> {
        vec![
            tcp_packet(("10.0.0.1", 40000), ("10.0.0.2", 8080), b"ping"),
            tcp_packet(("10.0.0.2", 8080), ("10.0.0.1", 40000), b"pong"),
        ]
    }

    fn config(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn matching_flows_compare_equal() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig");
        let debloated = trace(dir.path(), "deb");
        write_pcap(&original.cwd.join("capture.pcap"), &exchange());
        write_pcap(&debloated.cwd.join("capture.pcap"), &exchange());

        let comparator =
            pcap(&config("{filename: capture.pcap, protocol: tcp, port: 8080}")).unwrap();
        assert!(comparator.verify_original(&original).is_none());
        assert!(comparator.compare(&original, &debloated).is_success());

        // verify_original memoized the original flows.
        assert!(original.cache_get("tcp/*:8080_flows").is_some());
    }

    #[test]
    fn differing_payloads_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig");
        let debloated = trace(dir.path(), "deb");
        write_pcap(&original.cwd.join("capture.pcap"), &exchange());
        write_pcap(
            &debloated.cwd.join("capture.pcap"),
            &[
                tcp_packet(("10.0.0.1", 40000), ("10.0.0.2", 8080), b"ping"),
                tcp_packet(("10.0.0.2", 8080), ("10.0.0.1", 40000), b"BOOM"),
            ],
        );

        let comparator =
            pcap(&config("{filename: capture.pcap, protocol: tcp, port: 8080}")).unwrap();
        let result = comparator.compare(&original, &debloated);
        assert_eq!(result.status, ComparisonStatus::Error);
        assert!(result.details.contains("mismatch payload"));
    }

    #[test]
    fn missing_payloads_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig");
        let debloated = trace(dir.path(), "deb");
        write_pcap(&original.cwd.join("capture.pcap"), &exchange());
        write_pcap(
            &debloated.cwd.join("capture.pcap"),
            &[tcp_packet(("10.0.0.1", 40000), ("10.0.0.2", 8080), b"ping")],
        );

        let comparator =
            pcap(&config("{filename: capture.pcap, protocol: tcp, port: 8080}")).unwrap();
        let result = comparator.compare(&original, &debloated);
        assert_eq!(result.status, ComparisonStatus::Error);
        assert!(result.details.contains("payloads"));
    }

    #[test]
    fn missing_flow_fails_baseline_verification() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig");
        write_pcap(&original.cwd.join("capture.pcap"), &exchange());

        // Filter port that matches no packet.
        let comparator =
            pcap(&config("{filename: capture.pcap, protocol: tcp, port: 9999}")).unwrap();
        let crash = comparator.verify_original(&original).unwrap();
        assert!(crash.details.contains("flow does not exist"));
    }

    #[test]
    fn exists_false_inverts_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig");
        let debloated = trace(dir.path(), "deb");
        write_pcap(&original.cwd.join("capture.pcap"), &[]);
        write_pcap(&debloated.cwd.join("capture.pcap"), &exchange());

        let comparator = pcap(&config(
            "{filename: capture.pcap, protocol: tcp, port: 8080, exists: false}",
        ))
        .unwrap();
        assert!(comparator.verify_original(&original).is_none());
        let result = comparator.compare(&original, &debloated);
        assert_eq!(result.status, ComparisonStatus::Error);
        assert!(result.details.contains("unexpected flow"));
    }

    #[test]
    fn missing_pcap_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig");

        let comparator =
            pcap(&config("{filename: capture.pcap, protocol: udp, port: 53}")).unwrap();
        let crash = comparator.verify_original(&original).unwrap();
        assert!(crash.details.contains("does not exist"));
    }

    #[test]
    fn flow_encoding_round_trips() {
        let flows = vec![Flow {
            client: "10.0.0.1:40000".to_string(),
            server: "10.0.0.2:8080".to_string(),
            payloads: vec![
                Payload {
                    origin: Origin::Client,
                    data: b"ping".to_vec(),
                },
                Payload {
                    origin: Origin::Server,
                    data: b"pong".to_vec(),
                },
            ],
        }];
        assert_eq!(decode_flows(&encode_flows(&flows)), flows);
    }

    #[test]
    fn address_filter_limits_flows() {
        let dir = tempfile::tempdir().unwrap();
        let original = trace(dir.path(), "orig");
        let mut frames = exchange();
        frames.push(tcp_packet(("172.16.0.9", 40001), ("10.0.0.2", 8080), b"x"));
        write_pcap(&original.cwd.join("capture.pcap"), &frames);

        let comparator = pcap(&config(
            "{filename: capture.pcap, protocol: tcp, port: 8080, address: 10.0.0.1}",
        ))
        .unwrap();
        assert!(comparator.verify_original(&original).is_none());
        let encoded = original.cache_get("tcp/10.0.0.1:8080_flows").unwrap();
        let flows = decode_flows(&encoded);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].client, "10.0.0.1:40000");
    }
}

//! Git packet-line framing.
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)

use tracing::{trace, warn};

/// Largest total length a data packet may declare.
const MAX_PKT_LEN: usize = 0xFFFF;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A single Git packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Vec<u8>),
    /// Flush packet (`0000`).
    Flush,
    /// Delimiter packet (`0001`), protocol v2 only.
    Delimiter,
    /// Response-end packet (`0002`), protocol v2 only.
    ResponseEnd,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a byte slice as a packet line.  Callers include any trailing
/// newline the protocol requires and keep `data` under 65516 bytes.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    debug_assert!(total_len <= MAX_PKT_LEN, "packet-line data too large");
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Encode a [`PktLine`] back into its wire representation.
pub fn encode_pkt(pkt: &PktLine) -> Vec<u8> {
    match pkt {
        PktLine::Data(data) => encode_pkt_line(data),
        PktLine::Flush => b"0000".to_vec(),
        PktLine::Delimiter => b"0001".to_vec(),
        PktLine::ResponseEnd => b"0002".to_vec(),
    }
}

/// Smart-HTTP preamble of a v0/v1 ref advertisement:
/// `# service=<service>\n` followed by a flush.
pub fn service_advertisement_header(service: &str) -> Vec<u8> {
    let mut out = encode_pkt_line(format!("# service={service}\n").as_bytes());
    out.extend_from_slice(&encode_pkt(&PktLine::Flush));
    out
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a sequence of packet lines from raw bytes.
///
/// Stops at the first malformed position and returns whatever was decoded
/// up to that point.
pub fn decode_pkt_lines(data: &[u8]) -> Vec<PktLine> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos + 4 <= data.len() {
        let len_hex = match std::str::from_utf8(&data[pos..pos + 4]) {
            Ok(s) => s,
            Err(_) => {
                warn!(offset = pos, "non-UTF-8 packet-line length prefix");
                break;
            }
        };

        let pkt_len = match usize::from_str_radix(len_hex, 16) {
            Ok(n) => n,
            Err(_) => {
                warn!(offset = pos, len_hex, "invalid packet-line length");
                break;
            }
        };

        match pkt_len {
            0 => packets.push(PktLine::Flush),
            1 => packets.push(PktLine::Delimiter),
            2 => packets.push(PktLine::ResponseEnd),
            3 => {
                warn!(offset = pos, "invalid packet-line length 0003");
                break;
            }
            n => {
                if pos + n > data.len() {
                    warn!(
                        offset = pos,
                        declared = n,
                        available = data.len() - pos,
                        "truncated packet-line"
                    );
                    break;
                }
                let payload = data[pos + 4..pos + n].to_vec();
                trace!(offset = pos, payload_len = payload.len(), "data packet");
                packets.push(PktLine::Data(payload));
                pos += n;
                continue;
            }
        }
        pos += 4;
    }

    packets
}

/// Objects and refs an upload-pack request asks for: the oid of every
/// `want` line and the ref name of every protocol v2 `want-ref` line, in
/// request order without duplicates.
pub fn requested_objects(request: &[u8]) -> Vec<String> {
    let mut wanted: Vec<String> = Vec::new();
    for pkt in decode_pkt_lines(request) {
        let PktLine::Data(data) = pkt else {
            continue;
        };
        let line = String::from_utf8_lossy(&data);
        let line = line.trim_end_matches('\n');

        let name = if let Some(rest) = line.strip_prefix("want-ref ") {
            rest.trim()
        } else if let Some(rest) = line.strip_prefix("want ") {
            // v0/v1 append capabilities to the first want.
            rest.split_whitespace().next().unwrap_or("")
        } else {
            continue;
        };

        if !name.is_empty() && !wanted.iter().any(|w| w == name) {
            wanted.push(name.to_string());
        }
    }
    wanted
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

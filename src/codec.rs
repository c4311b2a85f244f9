//! Wire codec for the RS-485 pump bus.
//!
//! A request frame is `STX | address | seq | payload | ETX | checksum` and
//! the answer mirrors it with the device status byte in third position:
//! `STX | 0x30 | status | payload | ETX | checksum`. The checksum is the XOR
//! parity of every preceding byte of the frame.

use crate::constants::*;
use crate::error::{PumpError, Result};
use crate::status::StatusByte;

/// Individual address of a device id (1..16)
pub fn individual_address(id: u8) -> Result<u8> {
    check_id(id)?;
    Ok(INDIVIDUAL_BASE + id)
}

/// Broadcast address shared by the id pair `{2k-1, 2k}`
pub fn pair_address(id: u8) -> Result<u8> {
    check_id(id)?;
    Ok(0x41 + 2 * ((id - 1) / 2))
}

/// Broadcast address shared by the id quad `{4k-3 .. 4k}`
pub fn quad_address(id: u8) -> Result<u8> {
    check_id(id)?;
    Ok(0x51 + 4 * ((id - 1) / 4))
}

fn check_id(id: u8) -> Result<()> {
    if (1..=MAX_DEVICES).contains(&id) {
        Ok(())
    } else {
        Err(PumpError::InvalidArgument(format!(
            "device id {} outside 1..{}",
            id, MAX_DEVICES
        )))
    }
}

/// True for addresses that reach more than one device and never answer
pub fn is_broadcast(address: u8) -> bool {
    !(0x31..=0x3F).contains(&address) && address != RESERVED_ADDRESS
}

/// Device id behind an individual address
pub fn device_id(address: u8) -> Option<u8> {
    match address {
        0x31..=0x40 => Some(address - INDIVIDUAL_BASE),
        _ => None,
    }
}

/// Device ids reached by an address, individual or broadcast
pub fn members(address: u8) -> Vec<u8> {
    if let Some(id) = device_id(address) {
        return vec![id];
    }
    match address {
        GLOBAL_ADDRESS => (1..=MAX_DEVICES).collect(),
        0x41..=0x4F if address % 2 == 1 => {
            let first = address - 0x41 + 1;
            vec![first, first + 1]
        }
        0x51 | 0x55 | 0x59 | 0x5D => {
            let first = address - 0x51 + 1;
            (first..first + 4).collect()
        }
        _ => Vec::new(),
    }
}

/// Smallest pair or quad broadcast reaching both ids
pub fn shared_address(a: u8, b: u8) -> Option<u8> {
    if a == b {
        return None;
    }
    let pair = pair_address(a).ok()?;
    if pair == pair_address(b).ok()? {
        return Some(pair);
    }
    let quad = quad_address(a).ok()?;
    if quad == quad_address(b).ok()? {
        return Some(quad);
    }
    None
}

/// XOR parity over the given bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Sequence byte for a rolling counter value, with the retry bit on repeats
pub fn sequence_byte(counter: u8, retry: bool) -> u8 {
    let mut seq = SEQUENCE_BASE | (counter & 0x07);
    if retry {
        seq |= RETRY_BIT;
    }
    seq
}

/// Build a request frame
pub fn encode_request(address: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(STX);
    frame.push(address);
    frame.push(seq);
    frame.extend_from_slice(payload);
    frame.push(ETX);
    frame.push(checksum(&frame));
    frame
}

/// Build an answer frame as a device would send it
pub fn encode_response(status: StatusByte, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(STX);
    frame.push(MASTER_ADDRESS);
    frame.push(status.raw());
    frame.extend_from_slice(payload);
    frame.push(ETX);
    frame.push(checksum(&frame));
    frame
}

/// Per-device rolling sequence counter (1..7)
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    counters: [u8; MAX_DEVICES as usize + 1],
}

impl SequenceCounter {
    pub fn new() -> Self {
        SequenceCounter {
            counters: [0; MAX_DEVICES as usize + 1],
        }
    }

    /// Advance the counter of the device behind `address`.
    ///
    /// Broadcasts do not advance any counter and always use 1.
    pub fn next(&mut self, address: u8) -> u8 {
        match device_id(address) {
            Some(id) => {
                let slot = &mut self.counters[id as usize];
                *slot = if *slot >= SEQUENCE_MAX { 1 } else { *slot + 1 };
                *slot
            }
            None => 1,
        }
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Second byte: target address on requests, master address on answers
    pub address: u8,
    /// Third byte: sequence on requests, status byte on answers
    pub control: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn status(&self) -> StatusByte {
        StatusByte(self.control)
    }

    /// Sequence counter value carried by a request
    pub fn sequence(&self) -> u8 {
        self.control & 0x07
    }

    pub fn is_retry(&self) -> bool {
        self.control & RETRY_BIT != 0
    }
}

/// Outcome of scanning a receive buffer for a frame
#[derive(Debug, PartialEq, Eq)]
pub enum Scan {
    /// More bytes are needed
    Incomplete,
    /// A frame was found; `consumed` bytes can be dropped from the buffer
    Complete { frame: Frame, consumed: usize },
    /// Markers present but the frame is corrupt
    Invalid { reason: String, consumed: usize },
}

/// Look for one frame in `buf`: scan for STX, read until ETX, then take the checksum byte
pub fn scan_frame(buf: &[u8]) -> Scan {
    let start = match buf.iter().position(|&b| b == STX) {
        Some(start) => start,
        None => return Scan::Incomplete,
    };
    let etx = match buf[start..].iter().position(|&b| b == ETX) {
        Some(offset) => start + offset,
        None => return Scan::Incomplete,
    };
    if etx + 1 >= buf.len() {
        return Scan::Incomplete;
    }
    let consumed = etx + 2;
    let body = &buf[start..=etx];
    if body.len() < 4 {
        return Scan::Invalid {
            reason: format!("frame too short ({} bytes)", body.len()),
            consumed,
        };
    }
    let expected = checksum(body);
    let actual = buf[etx + 1];
    if expected != actual {
        return Scan::Invalid {
            reason: format!(
                "checksum mismatch: expected {:#04x}, got {:#04x}",
                expected, actual
            ),
            consumed,
        };
    }
    Scan::Complete {
        frame: Frame {
            address: body[1],
            control: body[2],
            payload: body[3..body.len() - 1].to_vec(),
        },
        consumed,
    }
}

/// Parse a complete frame, failing on anything that is not exactly one valid frame
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    match scan_frame(bytes) {
        Scan::Complete { frame, .. } => Ok(frame),
        Scan::Incomplete => Err(PumpError::BusFraming("missing STX or ETX".to_string())),
        Scan::Invalid { reason, .. } => Err(PumpError::BusFraming(reason)),
    }
}

/// Interpret an ASCII payload as a signed integer
pub fn parse_numeric(payload: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}

/// Hex dump used by trace logging
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_encoding() {
        assert_eq!(individual_address(1).unwrap(), 0x31);
        assert_eq!(individual_address(16).unwrap(), 0x40);
        assert_eq!(pair_address(1).unwrap(), 0x41);
        assert_eq!(pair_address(2).unwrap(), 0x41);
        assert_eq!(pair_address(3).unwrap(), 0x43);
        assert_eq!(pair_address(16).unwrap(), 0x4F);
        assert_eq!(quad_address(4).unwrap(), 0x51);
        assert_eq!(quad_address(5).unwrap(), 0x55);
        assert_eq!(quad_address(13).unwrap(), 0x5D);
        assert!(individual_address(0).is_err());
        assert!(individual_address(17).is_err());
    }

    #[test]
    fn broadcast_classification() {
        for id in 1..=16 {
            assert!(!is_broadcast(individual_address(id).unwrap()));
            assert!(is_broadcast(pair_address(id).unwrap()));
            assert!(is_broadcast(quad_address(id).unwrap()));
        }
        assert!(is_broadcast(GLOBAL_ADDRESS));
        assert!(!is_broadcast(0x40));
    }

    #[test]
    fn broadcast_members() {
        assert_eq!(members(0x41), vec![1, 2]);
        assert_eq!(members(0x4F), vec![15, 16]);
        assert_eq!(members(0x55), vec![5, 6, 7, 8]);
        assert_eq!(members(0x33), vec![3]);
        assert_eq!(members(GLOBAL_ADDRESS).len(), 16);
    }

    #[test]
    fn shared_address_prefers_pair() {
        assert_eq!(shared_address(1, 2), Some(0x41));
        assert_eq!(shared_address(2, 4), Some(0x51));
        assert_eq!(shared_address(4, 5), None);
        assert_eq!(shared_address(3, 3), None);
    }

    #[test]
    fn request_frame_validates() {
        let frame = encode_request(0x31, sequence_byte(1, false), b"A12000R");
        assert_eq!(frame[0], STX);
        assert_eq!(frame[frame.len() - 2], ETX);
        assert_eq!(checksum(&frame[..frame.len() - 1]), frame[frame.len() - 1]);

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.address, 0x31);
        assert_eq!(decoded.sequence(), 1);
        assert!(!decoded.is_retry());
        assert_eq!(decoded.payload, b"A12000R");
    }

    #[test]
    fn retry_bit_survives_decode() {
        let frame = encode_request(0x32, sequence_byte(5, true), b"?");
        let decoded = decode_frame(&frame).unwrap();
        assert!(decoded.is_retry());
        assert_eq!(decoded.sequence(), 5);
    }

    #[test]
    fn scan_skips_leading_noise() {
        let mut buf = vec![0xFF, 0x00];
        buf.extend(encode_response(StatusByte(0x60), b"96000"));
        match scan_frame(&buf) {
            Scan::Complete { frame, consumed } => {
                assert_eq!(consumed, buf.len());
                assert_eq!(frame.status(), StatusByte(0x60));
                assert_eq!(parse_numeric(&frame.payload), Some(96000));
            }
            other => panic!("unexpected scan result {:?}", other),
        }
    }

    #[test]
    fn scan_rejects_bad_checksum() {
        let mut frame = encode_response(StatusByte(0x60), b"1");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(scan_frame(&frame), Scan::Invalid { .. }));
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn scan_waits_for_checksum_byte() {
        let frame = encode_response(StatusByte(0x40), b"");
        assert_eq!(scan_frame(&frame[..frame.len() - 1]), Scan::Incomplete);
        assert_eq!(scan_frame(&[0x02, 0x30, 0x60]), Scan::Incomplete);
    }

    #[test]
    fn sequence_counter_wraps_per_device() {
        let mut counter = SequenceCounter::new();
        let seen: Vec<u8> = (0..9).map(|_| counter.next(0x31)).collect();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 1, 2]);
        assert_eq!(counter.next(0x32), 1);
        assert_eq!(counter.next(0x41), 1);
        assert_eq!(counter.next(0x31), 3);
    }

    #[test]
    fn numeric_payloads() {
        assert_eq!(parse_numeric(b"0"), Some(0));
        assert_eq!(parse_numeric(b"-12"), Some(-12));
        assert_eq!(parse_numeric(b""), None);
        assert_eq!(parse_numeric(b"PSD/4 V1.0"), None);
    }
}

//! Stateless framing helpers shared by every codec: trailer checksums,
//! explicit-endian integer packing, repeating-key XOR and multi-packet
//! reassembly.

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::error::{Result, ScaleError};

/// Byte-wise sum modulo 256 over `len` bytes starting at `start`.
///
/// Bytes outside the buffer are ignored.
#[must_use]
pub fn sum_checksum(data: &[u8], start: usize, len: usize) -> u8 {
    data.iter()
        .skip(start)
        .take(len)
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Byte-wise XOR over `len` bytes starting at `start`.
#[must_use]
pub fn xor_checksum(data: &[u8], start: usize, len: usize) -> u8 {
    data.iter().skip(start).take(len).fold(0u8, |acc, b| acc ^ b)
}

/// Append the sum of everything from `start` to the end of the packet
pub fn append_sum_checksum(packet: &mut BytesMut, start: usize) {
    let checksum = sum_checksum(packet, start, packet.len().saturating_sub(start));
    packet.put_u8(checksum);
}

/// Append the XOR of everything from `start` to the end of the packet
pub fn append_xor_checksum(packet: &mut BytesMut, start: usize) {
    let checksum = xor_checksum(packet, start, packet.len().saturating_sub(start));
    packet.put_u8(checksum);
}

fn verify_trailer(packet: &[u8], start: usize, len: usize, expected: u8) -> Result<()> {
    let actual = *packet.get(start + len).ok_or_else(|| {
        ScaleError::MalformedPacket(format!(
            "checksum byte {} missing in {} byte packet",
            start + len,
            packet.len()
        ))
    })?;

    if actual == expected {
        Ok(())
    } else {
        Err(ScaleError::ChecksumMismatch { expected, actual })
    }
}

/// Check the byte following `start..start + len` against the sum of that range
///
/// # Errors
///
/// [`ScaleError::ChecksumMismatch`] on mismatch, [`ScaleError::MalformedPacket`]
/// when the trailer byte is missing.
pub fn verify_sum_checksum(packet: &[u8], start: usize, len: usize) -> Result<()> {
    verify_trailer(packet, start, len, sum_checksum(packet, start, len))
}

/// Check the byte following `start..start + len` against the XOR of that range
///
/// # Errors
///
/// [`ScaleError::ChecksumMismatch`] on mismatch, [`ScaleError::MalformedPacket`]
/// when the trailer byte is missing.
pub fn verify_xor_checksum(packet: &[u8], start: usize, len: usize) -> Result<()> {
    verify_trailer(packet, start, len, xor_checksum(packet, start, len))
}

/// Byte order of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Most significant byte first
    Big,
    /// Least significant byte first
    Little,
}

fn field(data: &[u8], offset: usize, width: usize) -> Result<&[u8]> {
    data.get(offset..offset + width).ok_or_else(|| {
        ScaleError::MalformedPacket(format!(
            "{width} byte field at offset {offset} exceeds {} byte packet",
            data.len()
        ))
    })
}

fn read_uint(data: &[u8], offset: usize, width: usize, endian: Endian) -> Result<u32> {
    let bytes = field(data, offset, width)?;
    let fold = |acc: u32, b: &u8| (acc << 8) | u32::from(*b);
    Ok(match endian {
        Endian::Big => bytes.iter().fold(0, fold),
        Endian::Little => bytes.iter().rev().fold(0, fold),
    })
}

/// Read an unsigned 16-bit field
///
/// # Errors
///
/// [`ScaleError::MalformedPacket`] if the field runs past the buffer.
pub fn read_u16(data: &[u8], offset: usize, endian: Endian) -> Result<u16> {
    // two bytes always fit
    read_uint(data, offset, 2, endian).map(|v| v as u16)
}

/// Read an unsigned 24-bit field
///
/// # Errors
///
/// [`ScaleError::MalformedPacket`] if the field runs past the buffer.
pub fn read_u24(data: &[u8], offset: usize, endian: Endian) -> Result<u32> {
    read_uint(data, offset, 3, endian)
}

/// Read an unsigned 32-bit field
///
/// # Errors
///
/// [`ScaleError::MalformedPacket`] if the field runs past the buffer.
pub fn read_u32(data: &[u8], offset: usize, endian: Endian) -> Result<u32> {
    read_uint(data, offset, 4, endian)
}

/// Write a 16-bit value
pub fn put_u16(buf: &mut BytesMut, value: u16, endian: Endian) {
    match endian {
        Endian::Big => buf.put_u16(value),
        Endian::Little => buf.put_u16_le(value),
    }
}

/// Write the low 24 bits of a value
pub fn put_u24(buf: &mut BytesMut, value: u32, endian: Endian) {
    match endian {
        Endian::Big => buf.put_uint(u64::from(value & 0x00FF_FFFF), 3),
        Endian::Little => buf.put_uint_le(u64::from(value & 0x00FF_FFFF), 3),
    }
}

/// Write a 32-bit value
pub fn put_u32(buf: &mut BytesMut, value: u32, endian: Endian) {
    match endian {
        Endian::Big => buf.put_u32(value),
        Endian::Little => buf.put_u32_le(value),
    }
}

/// Concatenate byte slices into one buffer
#[must_use]
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

/// XOR every byte against a repeating key. Applying it twice restores the input.
#[must_use]
pub fn xor_with_key(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

/// Result of feeding one part to a [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Part accepted, more parts outstanding
    Incomplete,
    /// Last part accepted, the concatenated payload
    Complete(Vec<u8>),
    /// Part ignored (out of order, duplicate or inconsistent)
    Discarded,
}

/// Collects numbered parts (`part` of `total`, 1-based) into one payload.
///
/// Parts must arrive in order starting at 1. A part seen before part 1, a
/// duplicate, or a part whose total disagrees with the running one is
/// dropped with a warning; part 1 always starts a fresh payload.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
    total: u8,
    next: u8,
}

impl Reassembler {
    /// Create an idle reassembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a payload is partially collected
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.next != 0
    }

    /// Drop any partially collected payload
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.total = 0;
        self.next = 0;
    }

    /// Feed one part
    pub fn push(&mut self, part: u8, total: u8, payload: &[u8]) -> Fragment {
        if part == 0 || total == 0 || part > total {
            warn!("Discarding invalid fragment {}/{}", part, total);
            return Fragment::Discarded;
        }

        if part == 1 {
            if self.is_active() {
                warn!(
                    "Restarting reassembly, {} of {} parts were collected",
                    self.next - 1,
                    self.total
                );
            }
            self.reset();
            self.total = total;
            self.next = 1;
        } else if !self.is_active() {
            warn!("Discarding fragment {}/{} received before the first part", part, total);
            return Fragment::Discarded;
        } else if part != self.next || total != self.total {
            warn!(
                "Discarding fragment {}/{}, expected {}/{}",
                part, total, self.next, self.total
            );
            return Fragment::Discarded;
        }

        self.buffer.extend_from_slice(payload);
        debug!("Collected fragment {}/{}", part, total);

        if part == self.total {
            let payload = self.buffer.split().to_vec();
            self.reset();
            Fragment::Complete(payload)
        } else {
            self.next += 1;
            Fragment::Incomplete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_checksums() {
        let data = [0x01, 0x02, 0xFF, 0x10];
        assert_eq!(sum_checksum(&data, 0, 4), 0x12);
        assert_eq!(xor_checksum(&data, 0, 4), 0xEC);
        assert_eq!(sum_checksum(&data, 1, 2), 0x01);
        // out-of-range bytes are ignored
        assert_eq!(sum_checksum(&data, 3, 10), 0x10);
    }

    #[test]
    fn test_checksum_excluding_mid_payload_bytes() {
        // sum over 0..2 and 4..6, skipping bytes 2 and 3
        let data = [0x10, 0x20, 0xAA, 0xBB, 0x01, 0x02];
        let checksum = sum_checksum(&data, 0, 2).wrapping_add(sum_checksum(&data, 4, 2));
        assert_eq!(checksum, 0x33);
    }

    #[test]
    fn test_missing_trailer() {
        let err = verify_sum_checksum(&[1, 2, 3], 0, 3).unwrap_err();
        assert!(matches!(err, ScaleError::MalformedPacket(_)));
    }

    #[test]
    fn test_endian_fields() {
        let data = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(read_u16(&data, 0, Endian::Big).unwrap(), 0x1234);
        assert_eq!(read_u16(&data, 0, Endian::Little).unwrap(), 0x3412);
        assert_eq!(read_u24(&data, 1, Endian::Big).unwrap(), 0x0034_5678);
        assert_eq!(read_u24(&data, 1, Endian::Little).unwrap(), 0x0078_5634);
        assert_eq!(read_u32(&data, 0, Endian::Little).unwrap(), 0x7856_3412);
        assert!(read_u32(&data, 1, Endian::Big).is_err());

        let mut buf = BytesMut::new();
        put_u16(&mut buf, 0x1234, Endian::Little);
        put_u24(&mut buf, 0x00AB_CDEF, Endian::Big);
        put_u32(&mut buf, 0x0102_0304, Endian::Little);
        assert_eq!(
            &buf[..],
            &[0x34, 0x12, 0xAB, 0xCD, 0xEF, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_xor_with_key_is_involution() {
        let key = [0xAA, 0xBB, 0xCC];
        let data = b"hello scale";
        let once = xor_with_key(data, &key);
        assert_ne!(&once[..], &data[..]);
        assert_eq!(xor_with_key(&once, &key), data.to_vec());
        assert_eq!(concat(&[&[1, 2], &[3]]), vec![1, 2, 3]);
    }

    #[test]
    fn test_reassembly_in_order() {
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(1, 2, &[1, 2]), Fragment::Incomplete);
        assert!(reassembler.is_active());
        assert_eq!(
            reassembler.push(2, 2, &[3]),
            Fragment::Complete(vec![1, 2, 3])
        );
        assert!(!reassembler.is_active());
    }

    #[test]
    fn test_reassembly_discards_anomalies() {
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(2, 2, &[9]), Fragment::Discarded);
        assert_eq!(reassembler.push(0, 2, &[9]), Fragment::Discarded);
        assert_eq!(reassembler.push(3, 2, &[9]), Fragment::Discarded);
        assert_eq!(reassembler.push(1, 3, &[1]), Fragment::Incomplete);
        assert_eq!(reassembler.push(3, 3, &[9]), Fragment::Discarded);
        assert_eq!(reassembler.push(2, 3, &[2]), Fragment::Incomplete);
        assert_eq!(reassembler.push(2, 3, &[2]), Fragment::Discarded);
        assert_eq!(
            reassembler.push(3, 3, &[3]),
            Fragment::Complete(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_single_part_payload() {
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(1, 1, &[7]), Fragment::Complete(vec![7]));
    }

    fn feed(reassembler: &mut Reassembler, parts: &[Vec<u8>]) -> Option<Vec<u8>> {
        let total = parts.len() as u8;
        let mut result = None;
        for (i, part) in parts.iter().enumerate() {
            if let Fragment::Complete(payload) = reassembler.push(i as u8 + 1, total, part) {
                result = Some(payload);
            }
        }
        result
    }

    proptest! {
        #[test]
        fn sum_checksum_round_trip(
            data in prop::collection::vec(any::<u8>(), 1..64),
            flip in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let mut packet = BytesMut::from(&data[..]);
            append_sum_checksum(&mut packet, 0);
            prop_assert!(verify_sum_checksum(&packet, 0, data.len()).is_ok());

            packet[flip.index(data.len())] ^= mask;
            prop_assert!(verify_sum_checksum(&packet, 0, data.len()).is_err());
        }

        #[test]
        fn xor_checksum_round_trip(
            data in prop::collection::vec(any::<u8>(), 2..64),
            flip in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            // header byte excluded from the range
            let mut packet = BytesMut::from(&data[..]);
            append_xor_checksum(&mut packet, 1);
            prop_assert!(verify_xor_checksum(&packet, 1, data.len() - 1).is_ok());

            packet[1 + flip.index(data.len() - 1)] ^= mask;
            prop_assert!(verify_xor_checksum(&packet, 1, data.len() - 1).is_err());
        }

        #[test]
        fn reassembly_ignores_early_parts(
            parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..20), 2..8),
            early in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let total = parts.len() as u8;

            let mut in_order = Reassembler::new();
            let expected = feed(&mut in_order, &parts);
            prop_assert_eq!(expected.clone(), Some(parts.concat()));

            let mut disturbed = Reassembler::new();
            for index in early {
                // any part other than the first
                let part = 2 + index.index(parts.len() - 1) as u8;
                prop_assert_eq!(
                    disturbed.push(part, total, &parts[part as usize - 1]),
                    Fragment::Discarded
                );
            }
            prop_assert_eq!(feed(&mut disturbed, &parts), expected);
        }
    }
}

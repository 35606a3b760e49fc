//! Packet Codec: builds and validates DCC packets per NMRA S-9.2.
//!
//! Packets never allocate: a [`Packet`] is a fixed-capacity byte buffer sized to
//! [`crate::DCC_MAX_PACKET_SIZE`], built incrementally and finalized with [`Packet::append_xor`].
use heapless::Vec;

use crate::{DCC_MAX_PACKET_SIZE, DccError};

/// A complete, XOR-terminated DCC packet: `address, 0..4 data bytes, XOR`.
///
/// Constructed exclusively through the `make_*` functions in this module or
/// [`Packet::from_bytes`] (used for host-supplied custom packets); both paths finalize with
/// [`Packet::append_xor`] so every live `Packet` satisfies the XOR-closure invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Packet {
    bytes: Vec<u8, DCC_MAX_PACKET_SIZE>,
}

impl Packet {
    fn new() -> Self {
        Packet { bytes: Vec::new() }
    }

    /// Build a packet from caller-supplied bytes (address + data, *without* the trailing XOR)
    /// and finalize it. Used by the RPC `command_station_load_packet` path.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DccError> {
        if data.is_empty() || data.len() >= DCC_MAX_PACKET_SIZE {
            return Err(DccError::InvalidArgument);
        }
        let mut p = Packet::new();
        for &b in data {
            p.bytes.push(b).map_err(|_| DccError::InvalidArgument)?;
        }
        p.append_xor();
        Ok(p)
    }

    fn push(&mut self, b: u8) -> Result<(), DccError> {
        self.bytes.push(b).map_err(|_| DccError::InvalidArgument)
    }

    /// Append the XOR error byte computed over every byte pushed so far, finalizing the packet.
    pub fn append_xor(&mut self) {
        let xor = self.bytes.iter().fold(0u8, |acc, &b| acc ^ b);
        // Capacity was sized with the XOR byte in mind; every `make_*` constructor leaves
        // exactly one free slot.
        let _ = self.bytes.push(xor);
    }

    /// The fully encoded byte sequence, including the trailing XOR byte.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `true` iff the final byte equals the XOR of all preceding bytes (always true for a
    /// `Packet` built through this module; exposed so the decoder can re-validate bytes
    /// recovered off the wire).
    pub fn xor_valid(&self) -> bool {
        if self.bytes.is_empty() {
            return false;
        }
        let (last, rest) = self.bytes.split_last().expect("checked non-empty above");
        rest.iter().fold(0u8, |acc, &b| acc ^ b) == *last
    }

    /// The well-formed idle packet (address `0xFF`, data `0x00`, XOR `0xFF`) the Timing Engine
    /// emits whenever the packet queue is empty.
    pub fn idle() -> Self {
        let mut p = Packet::new();
        p.push(0xFF).expect("fits in capacity");
        p.push(0x00).expect("fits in capacity");
        p.append_xor();
        p
    }

    /// Build a packet from bytes already including the trailing XOR byte, as recovered off the
    /// wire by the Decoder. Unlike [`Packet::from_bytes`], no XOR byte is computed or appended;
    /// callers that need to know whether the recovered bytes are actually well-formed should
    /// check [`Packet::xor_valid`].
    pub fn from_wire(bytes: &[u8]) -> Result<Self, DccError> {
        if bytes.len() < 2 || bytes.len() > DCC_MAX_PACKET_SIZE {
            return Err(DccError::InvalidArgument);
        }
        let mut p = Packet::new();
        for &b in bytes {
            p.push(b)?;
        }
        Ok(p)
    }
}

fn push_address(p: &mut Packet, addr: u16) -> Result<(), DccError> {
    match addr {
        1..=127 => p.push(addr as u8),
        128..=10239 => {
            // Extended (14-bit) address: 0b11AAAAAA AAAAAAAA, MSB-first.
            let hi = 0b1100_0000 | ((addr >> 8) as u8);
            p.push(hi)?;
            p.push((addr & 0xFF) as u8)
        }
        _ => Err(DccError::InvalidArgument),
    }
}

/// Build a 128-speed-step packet (NMRA S-9.2 "Advanced Operations Instruction").
///
/// `step` is signed: negative values select reverse, `0` is stop, magnitude `1..=126` selects
/// a speed step, and `127`/`-127` is reserved and rejected.
pub fn make_speed(addr: u16, step: i8) -> Result<Packet, DccError> {
    if !(1..=10239).contains(&addr) {
        return Err(DccError::InvalidArgument);
    }
    if step <= -127 || step >= 127 {
        return Err(DccError::InvalidArgument);
    }
    let mut p = Packet::new();
    push_address(&mut p, addr)?;
    p.push(0x3F)?; // 128 speed-step advanced operations instruction
    let forward = step >= 0;
    let magnitude = step.unsigned_abs();
    let data = (forward as u8) << 7 | magnitude;
    p.push(data)?;
    p.append_xor();
    Ok(p)
}

/// The three NMRA function groups addressable by [`make_function_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FunctionGroup {
    /// F0 (bit 4) and F1-F4 (bits 0-3).
    Group1,
    /// F5-F8 (bits 0-3).
    Group2,
    /// F9-F12 (bits 0-3).
    Group3,
}

/// Build a function-group packet. `bits` holds the function bits packed as described per
/// [`FunctionGroup`] variant; any bits above the group's width are rejected.
pub fn make_function_group(addr: u16, group: FunctionGroup, bits: u8) -> Result<Packet, DccError> {
    if !(1..=10239).contains(&addr) {
        return Err(DccError::InvalidArgument);
    }
    let (prefix, mask) = match group {
        FunctionGroup::Group1 => (0b1000_0000u8, 0b0001_1111u8),
        FunctionGroup::Group2 => (0b1011_0000u8, 0b0000_1111u8),
        FunctionGroup::Group3 => (0b1010_0000u8, 0b0000_1111u8),
    };
    if bits & !mask != 0 {
        return Err(DccError::InvalidArgument);
    }
    let mut p = Packet::new();
    push_address(&mut p, addr)?;
    p.push(prefix | (bits & mask))?;
    p.append_xor();
    Ok(p)
}

/// Build a short-form CV access write packet (NMRA "Configuration Variable Access - Long
/// Form", write-byte variant, addressed by the raw high/low CV-address halves the wire
/// protocol exposes).
///
/// `cv_hi` is the top 2 bits of `(CV number - 1)`; `cv_lo` is its low byte.
pub fn make_cv_access_short_write(
    addr: u16,
    cv_hi: u8,
    cv_lo: u8,
    value: u8,
) -> Result<Packet, DccError> {
    if !(1..=10239).contains(&addr) || cv_hi > 0b11 {
        return Err(DccError::InvalidArgument);
    }
    let mut p = Packet::new();
    push_address(&mut p, addr)?;
    // 1110_WWHH: WW = 11 (write byte), HH = top 2 bits of CV address.
    p.push(0b1110_1100 | cv_hi)?;
    p.push(cv_lo)?;
    p.push(value)?;
    p.append_xor();
    Ok(p)
}

/// Build the broadcast (address `0`) emergency-stop packet.
pub fn make_broadcast_emergency_stop() -> Packet {
    let mut p = Packet::new();
    p.push(0x00).expect("fits in capacity");
    // Basic speed-and-direction instruction, forward, emergency-stop speed code.
    p.push(0b0110_0001).expect("fits in capacity");
    p.append_xor();
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_of(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0, |a, &b| a ^ b)
    }

    #[test]
    fn xor_closure_speed() {
        for addr in [1u16, 3, 127, 128, 9999, 10239] {
            for step in [-126i8, -1, 0, 1, 42, 126] {
                let p = make_speed(addr, step).unwrap();
                assert_eq!(xor_of(p.as_bytes()), 0);
                assert!(p.xor_valid());
            }
        }
    }

    #[test]
    fn xor_closure_function_groups() {
        let p = make_function_group(3, FunctionGroup::Group1, 0b10101).unwrap();
        assert_eq!(xor_of(p.as_bytes()), 0);
        let p = make_function_group(3, FunctionGroup::Group2, 0b1111).unwrap();
        assert_eq!(xor_of(p.as_bytes()), 0);
    }

    #[test]
    fn xor_closure_cv_write() {
        let p = make_cv_access_short_write(3, 0, 28, 7).unwrap();
        assert_eq!(xor_of(p.as_bytes()), 0);
    }

    #[test]
    fn xor_closure_broadcast_estop() {
        let p = make_broadcast_emergency_stop();
        assert_eq!(xor_of(p.as_bytes()), 0);
        assert_eq!(p.as_bytes()[0], 0x00);
    }

    #[test]
    fn xor_closure_idle() {
        let p = Packet::idle();
        assert_eq!(xor_of(p.as_bytes()), 0);
        assert_eq!(p.as_bytes(), &[0xFF, 0x00, 0xFF]);
    }

    #[test]
    fn short_vs_extended_address() {
        let short = make_speed(3, 10).unwrap();
        assert_eq!(short.as_bytes()[0], 3);
        let ext = make_speed(1000, 10).unwrap();
        assert_eq!(ext.as_bytes()[0] & 0b1100_0000, 0b1100_0000);
    }

    #[test]
    fn rejects_out_of_range_address() {
        assert_eq!(make_speed(0, 0), Err(DccError::InvalidArgument));
        assert_eq!(make_speed(10240, 0), Err(DccError::InvalidArgument));
    }

    #[test]
    fn rejects_out_of_range_step() {
        assert_eq!(make_speed(3, 127), Err(DccError::InvalidArgument));
        assert_eq!(make_speed(3, -127), Err(DccError::InvalidArgument));
    }

    #[test]
    fn rejects_function_bits_outside_group_width() {
        assert_eq!(
            make_function_group(3, FunctionGroup::Group2, 0b1_0000),
            Err(DccError::InvalidArgument)
        );
    }

    #[test]
    fn from_bytes_matches_manual_xor() {
        let p = Packet::from_bytes(&[0x03, 0x3F, 0x2A]).unwrap();
        assert_eq!(p.len(), 4);
        assert_eq!(xor_of(p.as_bytes()), 0);
    }

    #[test]
    fn from_wire_preserves_bytes_without_recomputing_xor() {
        let p = Packet::from_wire(&[0x03, 0x3F, 0x2A, 0x00]).unwrap();
        assert_eq!(p.as_bytes(), &[0x03, 0x3F, 0x2A, 0x00]);
        assert!(!p.xor_valid());
        let good = Packet::from_wire(&[0x03, 0x3F, 0x2A, 0x16]).unwrap();
        assert!(good.xor_valid());
    }

    #[test]
    fn from_bytes_rejects_empty_and_oversized() {
        assert_eq!(Packet::from_bytes(&[]), Err(DccError::InvalidArgument));
        assert_eq!(
            Packet::from_bytes(&[0, 0, 0, 0, 0, 0]),
            Err(DccError::InvalidArgument)
        );
    }
}

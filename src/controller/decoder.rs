//! Decoder Controller Task (§4.F): owns the CV model and turns recovered packets into an
//! up-call capability set, rather than virtual dispatch.
use crate::DccError;
use crate::codec::Packet;
use crate::decoder::{BiDiDatagram, DecoderConfig, DecoderEngine, DecoderEvent};

use super::RunState;

/// Function groups a recovered packet's opcode can belong to, for [`DecoderCallbacks::on_function`].
pub use crate::codec::FunctionGroup;

/// Up-call capability set a board support package (or a test double) implements to observe
/// decoded traffic. Default methods no-op; real logging happens at the call site via `defmt`,
/// kept out of this trait so it stays test-friendly.
pub trait DecoderCallbacks {
    fn on_direction(&mut self, _addr: u16, _forward: bool) {}
    fn on_speed(&mut self, _addr: u16, _step: i8) {}
    fn on_function(&mut self, _addr: u16, _group: FunctionGroup, _bits: u8) {}
    fn on_cv_read(&mut self, _cv: u16) -> u8 {
        0
    }
    fn on_cv_write(&mut self, _cv: u16, _value: u8) {}
    fn on_bidi_tx(&mut self, _datagram: &BiDiDatagram) {}
}

/// No-op callbacks used where the system has nothing else to wire up (tests, or a decoder
/// running purely for its observability counters).
#[derive(Debug, Default)]
pub struct NullCallbacks;
impl DecoderCallbacks for NullCallbacks {}

const CV_TABLE_SIZE: usize = 1024;

/// `{cv_table, service_mode, last_packet, last_bidi_tx}` per §3's Data Model; owned exclusively
/// by this controller and the CV handlers it invokes.
pub struct DecoderState {
    cv_table: [u8; CV_TABLE_SIZE],
    pub service_mode: bool,
    pub last_packet: Option<Packet>,
    pub last_bidi_tx: BiDiDatagram,
}

impl DecoderState {
    fn new() -> Self {
        DecoderState {
            cv_table: [0; CV_TABLE_SIZE],
            service_mode: false,
            last_packet: None,
            last_bidi_tx: BiDiDatagram::default(),
        }
    }

    pub fn cv(&self, cv: u16) -> Option<u8> {
        self.cv_table.get(usize::from(cv.checked_sub(1)?)).copied()
    }

    pub fn set_cv(&mut self, cv: u16, value: u8) -> Result<(), DccError> {
        let idx = usize::from(cv.checked_sub(1).ok_or(DccError::InvalidArgument)?);
        *self
            .cv_table
            .get_mut(idx)
            .ok_or(DccError::InvalidArgument)? = value;
        Ok(())
    }
}

fn push_address(bytes: &[u8]) -> Option<(u16, usize)> {
    let first = *bytes.first()?;
    if first & 0b1100_0000 == 0b1100_0000 {
        let hi = u16::from(first & 0x3F);
        let lo = u16::from(*bytes.get(1)?);
        Some(((hi << 8) | lo, 2))
    } else if first != 0 && first != 0xFF {
        Some((u16::from(first), 1))
    } else {
        // Broadcast (0) or idle (0xFF): no addressed payload to interpret.
        None
    }
}

/// Interpret a recovered packet's opcode and invoke the matching up-call. Unrecognized opcodes
/// are silently ignored (the decoder never fails on a well-formed-but-uninteresting packet).
/// `track_quiet` gates `on_bidi_tx`: a BiDi reply is only attempted while the track is in the
/// cutout window, per NMRA S-9.3.2 (the booster must be silent for the decoder's transmission
/// to be detectable at all).
fn interpret(packet: &Packet, track_quiet: bool, state: &mut DecoderState, cb: &mut dyn DecoderCallbacks) {
    let bytes = packet.as_bytes();
    let Some((addr, opcode_idx)) = push_address(bytes) else {
        return;
    };
    let Some(&opcode) = bytes.get(opcode_idx) else {
        return;
    };

    if opcode == 0x3F {
        if let Some(&data) = bytes.get(opcode_idx + 1) {
            let forward = data & 0x80 != 0;
            let magnitude = (data & 0x7F) as i8;
            cb.on_direction(addr, forward);
            cb.on_speed(addr, if forward { magnitude } else { -magnitude });
        }
    } else if opcode & 0b1110_0000 == 0b1000_0000 {
        cb.on_function(addr, FunctionGroup::Group1, opcode & 0x1F);
    } else if opcode & 0b1111_0000 == 0b1011_0000 {
        cb.on_function(addr, FunctionGroup::Group2, opcode & 0x0F);
    } else if opcode & 0b1111_0000 == 0b1010_0000 {
        cb.on_function(addr, FunctionGroup::Group3, opcode & 0x0F);
    } else if opcode & 0b1111_1100 == 0b1110_1100 {
        // CV access, long form, write byte (WW = 11).
        if let (Some(&cv_lo), Some(&value)) = (bytes.get(opcode_idx + 1), bytes.get(opcode_idx + 2)) {
            let cv = (u16::from(opcode & 0x03) << 8 | u16::from(cv_lo)) + 1;
            if state.set_cv(cv, value).is_ok() {
                cb.on_cv_write(cv, value);
            }
        }
    } else if opcode & 0b1111_1100 == 0b1110_0100 {
        // CV access, long form, verify/read byte (WW = 01).
        if let Some(&cv_lo) = bytes.get(opcode_idx + 1) {
            let cv = (u16::from(opcode & 0x03) << 8 | u16::from(cv_lo)) + 1;
            let value = cb.on_cv_read(cv);
            if track_quiet {
                if let Some(datagram) = BiDiDatagram::from_bytes(&[value]) {
                    state.last_bidi_tx = datagram.clone();
                    cb.on_bidi_tx(&datagram);
                }
            }
        }
    } else if opcode & 0b1110_0001 == 0b0110_0001 {
        cb.on_speed(addr, 0);
    }
}

pub struct DecoderController {
    run_state: RunState,
    engine: DecoderEngine,
    state: DecoderState,
}

impl DecoderController {
    pub fn new(config: DecoderConfig) -> Self {
        DecoderController {
            run_state: RunState::Stopped,
            engine: DecoderEngine::new(config),
            state: DecoderState::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.run_state
    }

    pub fn config(&self) -> DecoderConfig {
        self.engine.config()
    }

    pub fn cv(&self, cv: u16) -> Option<u8> {
        self.state.cv(cv)
    }

    pub fn last_packet(&self) -> Option<&Packet> {
        self.state.last_packet.as_ref()
    }

    pub fn start(&mut self) -> Result<(), DccError> {
        if self.run_state.is_running() {
            return Err(DccError::Busy);
        }
        self.engine = DecoderEngine::new(self.engine.config());
        self.run_state = RunState::Running;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), DccError> {
        if !self.run_state.is_running() {
            return Err(DccError::Busy);
        }
        self.run_state = RunState::Stopped;
        Ok(())
    }

    /// Feed one captured half-period sample. Only active while running; samples are dropped
    /// (not queued) while stopped, matching a real input-capture ISR that is simply disabled.
    ///
    /// `track_quiet` reflects whether the track is currently in the BiDi cutout window (as seen
    /// by the CS timing engine); it gates any BiDi reply this edge's packet would trigger.
    pub fn on_edge(&mut self, half_period_us: u32, track_quiet: bool, cb: &mut dyn DecoderCallbacks) {
        if !self.run_state.is_running() {
            return;
        }
        if let DecoderEvent::Packet(packet) = self.engine.on_edge(half_period_us) {
            interpret(&packet, track_quiet, &mut self.state, cb);
            self.state.last_packet = Some(packet);
        }
    }

    pub fn framing_resyncs(&self) -> u32 {
        self.engine.framing_resyncs
    }

    pub fn xor_mismatches(&self) -> u32 {
        self.engine.xor_mismatches
    }

    pub fn capture_overflows(&self) -> u32 {
        self.engine.capture_overflows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::make_speed;
    use crate::timing::{OverrideMap, TimingConfig, TimingEngine, TrackState};

    #[derive(Default)]
    struct RecordingCallbacks {
        speeds: std::vec::Vec<(u16, i8)>,
        bidi_tx_count: u32,
    }
    impl DecoderCallbacks for RecordingCallbacks {
        fn on_speed(&mut self, addr: u16, step: i8) {
            self.speeds.push((addr, step));
        }
        fn on_cv_read(&mut self, _cv: u16) -> u8 {
            0xAB
        }
        fn on_bidi_tx(&mut self, _datagram: &BiDiDatagram) {
            self.bidi_tx_count += 1;
        }
    }

    fn cv_verify_read_packet(addr: u8, cv: u16) -> Packet {
        let cv_raw = cv - 1;
        let cv_hi = ((cv_raw >> 8) & 0x03) as u8;
        let cv_lo = (cv_raw & 0xFF) as u8;
        Packet::from_bytes(&[addr, 0b1110_0100 | cv_hi, cv_lo]).unwrap()
    }

    #[test]
    fn start_stop_is_idempotent() {
        let mut dc = DecoderController::new(DecoderConfig::defaults());
        assert_eq!(dc.start(), Ok(()));
        assert_eq!(dc.start(), Err(DccError::Busy));
        assert_eq!(dc.stop(), Ok(()));
        assert_eq!(dc.stop(), Err(DccError::Busy));
    }

    #[test]
    fn samples_dropped_while_stopped() {
        let mut dc = DecoderController::new(DecoderConfig::defaults());
        let mut cb = RecordingCallbacks::default();
        for _ in 0..100 {
            dc.on_edge(58, false, &mut cb);
        }
        assert!(dc.last_packet().is_none());
    }

    #[test]
    fn decodes_speed_packet_and_invokes_callback() {
        let cfg = TimingConfig {
            bidi_enable: false,
            ..TimingConfig::defaults()
        };
        let mut cs = TimingEngine::new(cfg);
        let overrides = OverrideMap::new();
        let packet = make_speed(3, 42).unwrap();
        let mut delivered = false;
        let mut next = || {
            if delivered {
                None
            } else {
                delivered = true;
                Some(packet.clone())
            }
        };

        let mut dc = DecoderController::new(DecoderConfig::defaults());
        dc.start().unwrap();
        let mut cb = RecordingCallbacks::default();
        for _ in 0..400 {
            let ev = cs.tick(&overrides, &mut next);
            if let TrackState::Drive(_) = ev.track {
                dc.on_edge(ev.period_us, ev.track == TrackState::Cutout, &mut cb);
            }
        }
        assert!(cb.speeds.contains(&(3, 42)));
    }

    #[test]
    fn bidi_reply_is_suppressed_unless_track_is_quiet() {
        let packet = cv_verify_read_packet(3, 5);
        let mut state = DecoderState::new();
        let mut cb = RecordingCallbacks::default();

        interpret(&packet, false, &mut state, &mut cb);
        assert_eq!(cb.bidi_tx_count, 0, "no reply while the track is still driven");

        interpret(&packet, true, &mut state, &mut cb);
        assert_eq!(cb.bidi_tx_count, 1, "reply allowed once the track is quiet");
    }

    #[test]
    fn cv_write_updates_table_and_is_bounds_checked() {
        let mut state = DecoderState::new();
        assert_eq!(state.set_cv(1, 7), Ok(()));
        assert_eq!(state.cv(1), Some(7));
        assert_eq!(state.set_cv(0, 1), Err(DccError::InvalidArgument));
        assert_eq!(state.set_cv(1025, 1), Err(DccError::InvalidArgument));
    }
}

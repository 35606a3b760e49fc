//! CS Controller Task (§4.E): life-cycle, test-loop packet generation, and custom-packet
//! transmission on top of the packet queue the Timing Engine drains.
use heapless::spsc::Producer;

use crate::CS_PACKET_QUEUE_DEPTH;
use crate::DccError;
use crate::codec::{self, FunctionGroup, Packet};
use crate::timing::queue::CustomPacket;

use super::RunState;

/// Forward/reverse speed ramp shared by loop modes 1 and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SpeedRamp {
    magnitude: i8,
    max: i8,
    ascending: bool,
    forward: bool,
}

impl SpeedRamp {
    fn new(max: i8) -> Self {
        SpeedRamp {
            magnitude: 0,
            max,
            ascending: true,
            forward: true,
        }
    }

    /// Advance one step and return the signed speed value to transmit next.
    fn step(&mut self) -> i8 {
        if self.ascending {
            self.magnitude += 1;
            if self.magnitude >= self.max {
                self.magnitude = self.max;
                self.ascending = false;
            }
        } else {
            self.magnitude -= 1;
            if self.magnitude <= 0 {
                self.magnitude = 0;
                self.ascending = true;
                self.forward = !self.forward;
            }
        }
        if self.forward {
            self.magnitude
        } else {
            -self.magnitude
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopStep {
    /// Mode 0: custom packets only, no auto-generation.
    Custom,
    /// Mode 1: F0 on/off plus a forward/reverse ramp to step 42, 2 s per step.
    Basic { ramp: SpeedRamp, f0_on: bool },
    /// Mode 2: headlight on, speed 60, broadcast e-stop, repeat.
    EstopExercise { phase: u8 },
    /// Mode 3: speed ramp 0..126..0, forward then reverse, 500 ms per step.
    Ramp { ramp: SpeedRamp },
}

impl LoopStep {
    fn for_mode(mode: u8) -> Result<Self, DccError> {
        Ok(match mode {
            0 => LoopStep::Custom,
            1 => LoopStep::Basic {
                ramp: SpeedRamp::new(42),
                f0_on: false,
            },
            2 => LoopStep::EstopExercise { phase: 0 },
            3 => LoopStep::Ramp {
                ramp: SpeedRamp::new(126),
            },
            _ => return Err(DccError::InvalidArgument),
        })
    }

    /// Period, in milliseconds, between successive auto-generated steps.
    fn period_ms(&self) -> u32 {
        match self {
            LoopStep::Custom => 0,
            LoopStep::Basic { .. } => 2000,
            LoopStep::EstopExercise { .. } => 2000,
            LoopStep::Ramp { .. } => 500,
        }
    }
}

/// Address test-loop packets target; not host-configurable (the test loops exercise a fixed
/// DUT address).
const TEST_LOOP_ADDR: u16 = 3;

pub struct CsController<'q> {
    run_state: RunState,
    loop_mode: u8,
    step: LoopStep,
    elapsed_ms: u32,
    custom: CustomPacket,
    custom_elapsed_ms: u32,
    /// Latched by a dropped custom-packet enqueue; cleared on read by
    /// [`Self::take_transmit_overflow`]. Test-loop drops are not latched here — only
    /// custom-packet mode gets caller-visible overflow reporting (§3 overflow policy).
    transmit_overflow: bool,
    producer: Producer<'q, Packet, CS_PACKET_QUEUE_DEPTH>,
}

impl<'q> CsController<'q> {
    pub fn new(producer: Producer<'q, Packet, CS_PACKET_QUEUE_DEPTH>) -> Self {
        CsController {
            run_state: RunState::Stopped,
            loop_mode: 0,
            step: LoopStep::Custom,
            elapsed_ms: 0,
            custom: CustomPacket::empty(),
            custom_elapsed_ms: 0,
            transmit_overflow: false,
            producer,
        }
    }

    pub fn state(&self) -> RunState {
        self.run_state
    }

    /// `command_station_start{loop}`. `false` (mapped by the caller to `DccError::Busy`) if
    /// already running.
    pub fn start(&mut self, mode: u8) -> Result<(), DccError> {
        if self.run_state.is_running() {
            return Err(DccError::Busy);
        }
        self.step = LoopStep::for_mode(mode)?;
        self.loop_mode = mode;
        self.elapsed_ms = 0;
        self.run_state = RunState::Running;
        Ok(())
    }

    /// `command_station_stop`. `Busy` if not running. The caller is responsible for clearing
    /// the shared `OverrideMap` on a successful stop (§3 invariant: cleared whenever CS stops).
    pub fn stop(&mut self) -> Result<(), DccError> {
        if !self.run_state.is_running() {
            return Err(DccError::Busy);
        }
        self.run_state = RunState::Stopped;
        self.custom = CustomPacket::empty();
        self.transmit_overflow = false;
        Ok(())
    }

    pub fn loop_mode(&self) -> u8 {
        self.loop_mode
    }

    /// `true` iff a custom packet was dropped because the queue was full since the last call,
    /// and clears the flag. Test-loop auto-generated packets are never latched here: only
    /// custom-packet mode gives the caller an explicit overflow signal (§3 overflow policy).
    pub fn take_transmit_overflow(&mut self) -> bool {
        core::mem::take(&mut self.transmit_overflow)
    }

    /// `command_station_load_packet`. Fills the custom-packet slot without arming it.
    pub fn load_packet(&mut self, bytes: &[u8]) -> Result<usize, DccError> {
        let packet = Packet::from_bytes(bytes)?;
        let len = packet.len();
        self.custom.packet = Some(packet);
        self.custom.remaining = None;
        Ok(len)
    }

    /// `command_station_transmit_packet`. Arms the loaded custom packet for `count` repeats
    /// (`0` means indefinitely), spaced at least `delay_ms` apart.
    pub fn transmit_packet(&mut self, count: u32, delay_ms: u32) -> Result<(), DccError> {
        if self.custom.packet.is_none() {
            return Err(DccError::InvalidArgument);
        }
        if delay_ms > u32::from(u16::MAX) {
            return Err(DccError::InvalidArgument);
        }
        self.custom.remaining = if count == 0 { None } else { Some(count) };
        self.custom.delay_ms = delay_ms as u16;
        self.custom_elapsed_ms = 0;
        Ok(())
    }

    /// Advance the controller by `dt_ms` of wall-clock time, generating and enqueuing whatever
    /// auto-generated or custom traffic is due. Called by the owning task at its own cadence;
    /// queue-full is silently dropped (policy: "newest-drops-when-full in test-loop mode").
    pub fn poll(&mut self, dt_ms: u32) {
        if !self.run_state.is_running() {
            return;
        }

        if self.custom.is_loaded() {
            self.custom_elapsed_ms += dt_ms;
            if self.custom_elapsed_ms >= u32::from(self.custom.delay_ms.max(1)) {
                self.custom_elapsed_ms = 0;
                if let Some(packet) = self.custom.take_one() {
                    if self.producer.enqueue(packet).is_err() {
                        self.transmit_overflow = true;
                    }
                }
            }
        }

        let period = self.step.period_ms();
        if period == 0 {
            return;
        }
        self.elapsed_ms += dt_ms;
        while self.elapsed_ms >= period {
            self.elapsed_ms -= period;
            self.emit_step();
        }
    }

    fn emit_step(&mut self) {
        match &mut self.step {
            LoopStep::Custom => {}
            LoopStep::Basic { ramp, f0_on } => {
                *f0_on = !*f0_on;
                if let Ok(p) =
                    codec::make_function_group(TEST_LOOP_ADDR, FunctionGroup::Group1, u8::from(*f0_on) << 4)
                {
                    let _ = self.producer.enqueue(p);
                }
                let step = ramp.step();
                if let Ok(p) = codec::make_speed(TEST_LOOP_ADDR, step) {
                    let _ = self.producer.enqueue(p);
                }
            }
            LoopStep::EstopExercise { phase } => {
                match *phase {
                    0 => {
                        if let Ok(p) =
                            codec::make_function_group(TEST_LOOP_ADDR, FunctionGroup::Group1, 1 << 4)
                        {
                            let _ = self.producer.enqueue(p);
                        }
                    }
                    1 => {
                        if let Ok(p) = codec::make_speed(TEST_LOOP_ADDR, 60) {
                            let _ = self.producer.enqueue(p);
                        }
                    }
                    _ => {
                        let _ = self.producer.enqueue(codec::make_broadcast_emergency_stop());
                    }
                }
                *phase = (*phase + 1) % 3;
            }
            LoopStep::Ramp { ramp } => {
                let step = ramp.step();
                if let Ok(p) = codec::make_speed(TEST_LOOP_ADDR, step) {
                    let _ = self.producer.enqueue(p);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::queue::PacketQueue;

    #[test]
    fn start_stop_is_idempotent() {
        let mut q = PacketQueue::new();
        let (prod, _cons) = q.split();
        let mut cs = CsController::new(prod);
        assert_eq!(cs.start(0), Ok(()));
        assert_eq!(cs.start(0), Err(DccError::Busy));
        assert_eq!(cs.stop(), Ok(()));
        assert_eq!(cs.stop(), Err(DccError::Busy));
    }

    #[test]
    fn rejects_unknown_loop_mode() {
        let mut q = PacketQueue::new();
        let (prod, _cons) = q.split();
        let mut cs = CsController::new(prod);
        assert_eq!(cs.start(4), Err(DccError::InvalidArgument));
        assert_eq!(cs.state(), RunState::Stopped);
    }

    #[test]
    fn mode1_emits_packets_every_period() {
        let mut q = PacketQueue::new();
        let (prod, mut cons) = q.split();
        let mut cs = CsController::new(prod);
        cs.start(1).unwrap();
        cs.poll(2000);
        assert!(cons.dequeue().is_some());
        assert!(cons.dequeue().is_some());
    }

    #[test]
    fn mode0_is_silent_without_a_loaded_custom_packet() {
        let mut q = PacketQueue::new();
        let (prod, mut cons) = q.split();
        let mut cs = CsController::new(prod);
        cs.start(0).unwrap();
        cs.poll(10_000);
        assert_eq!(cons.dequeue(), None);
    }

    #[test]
    fn custom_packet_transmits_requested_count() {
        let mut q = PacketQueue::new();
        let (prod, mut cons) = q.split();
        let mut cs = CsController::new(prod);
        cs.start(0).unwrap();
        cs.load_packet(&[0x03, 0x3F, 0x2A]).unwrap();
        cs.transmit_packet(2, 10).unwrap();
        cs.poll(10);
        cs.poll(10);
        cs.poll(10);
        let mut seen = 0;
        while cons.dequeue().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn custom_packet_overflow_is_latched_until_read() {
        let mut q = PacketQueue::new();
        let (prod, mut cons) = q.split();
        let mut cs = CsController::new(prod);
        cs.start(0).unwrap();
        cs.load_packet(&[0x03, 0x3F, 0x2A]).unwrap();
        cs.transmit_packet(0, 1).unwrap();

        // Drive enough polls to fill the queue and force at least one dropped enqueue; nothing
        // drains it in the meantime.
        for _ in 0..(CS_PACKET_QUEUE_DEPTH + 2) {
            cs.poll(1);
        }

        assert!(cs.take_transmit_overflow());
        assert!(!cs.take_transmit_overflow(), "flag clears once read");

        // The queue itself is unaffected by reading the flag; drain it out.
        let mut seen = 0;
        while cons.dequeue().is_some() {
            seen += 1;
        }
        assert!(seen > 0);
    }

    #[test]
    fn transmit_without_loaded_packet_is_invalid_argument() {
        let mut q = PacketQueue::new();
        let (prod, _cons) = q.split();
        let mut cs = CsController::new(prod);
        cs.start(0).unwrap();
        assert_eq!(cs.transmit_packet(1, 10), Err(DccError::InvalidArgument));
    }
}

//! Timing Engine (CS TX): the ISR state machine that emits the DCC waveform.
//!
//! [`TimingEngine::tick`] is called once per timer-update interrupt. It is wait-free: no
//! blocking primitives, no allocation, and the only shared mutable state it touches
//! ([`OverrideMap`]) is a set of atomics written by a controller task and read here.
use arbitrary_int::u12;
use portable_atomic::{AtomicI32, AtomicU64, Ordering};

use crate::DccError;
use crate::codec::Packet;

pub mod queue;

/// Minimum auto-reload (half-period, in microseconds) a bit must have before a per-bit
/// [`OverrideMap`] delta is allowed to apply to it; distinguishes logical `0` bits (long
/// half-period) from `1` bits (short half-period) without needing to thread the bit value
/// itself through the override check.
pub const DCC_TX_MIN_BIT_0_TIMING: u32 = 90;

/// Nominal NMRA S-9.3.2 BiDi cutout duration, driven as a single timer period immediately
/// after the stop bit. Fixed at the published default rather than host-configurable.
pub const BIDI_CUTOUT_US: u32 = 454;

/// Track output polarity. The waveform alternates every half-period regardless of bit value;
/// the bit value only changes how long each phase is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Positive,
    Negative,
}

impl Phase {
    fn flipped(self) -> Self {
        match self {
            Phase::Positive => Phase::Negative,
            Phase::Negative => Phase::Positive,
        }
    }
}

/// What the ISR should do with the track-output pins for the period it just armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrackState {
    /// Drive the rails normally with the given polarity.
    Drive(Phase),
    /// BiDi cutout: both outputs low, booster disabled.
    Cutout,
}

/// One programmed half-period, as computed by [`TimingEngine::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HalfBitEvent {
    /// Auto-reload value to arm for the *next* timer update, in microseconds.
    pub period_us: u32,
    pub track: TrackState,
    /// Set on the first half-period of a new logical bit; mirrored to a scope pin when
    /// [`TimingConfig::trigger_first_bit`] is set.
    pub first_bit: bool,
    /// Set while the cutout window (and the BiDi direction-control line) should be active.
    pub bidir_enable: bool,
}

/// Persistent (modulo Parameter Manager save/restore) timing configuration for the CS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingConfig {
    pub num_preamble: u8,
    pub bit1_duration_us: u8,
    pub bit0_duration_us: u8,
    pub bidi_enable: bool,
    pub trigger_first_bit: bool,
    pub bidi_dac: u12,
}

impl TimingConfig {
    /// Compiled factory defaults.
    pub const fn defaults() -> Self {
        TimingConfig {
            num_preamble: 16,
            bit1_duration_us: 58,
            bit0_duration_us: 100,
            bidi_enable: true,
            trigger_first_bit: false,
            bidi_dac: u12::new(0),
        }
    }

    /// Validate at activation time. The Engine itself never clamps or rejects a timing value
    /// once armed (that is the mechanism compliance tests rely on to push the waveform outside
    /// tolerance); this check only gates whether a config is allowed to reach the ISR at all.
    pub fn validate(&self) -> Result<(), DccError> {
        if self.num_preamble < 14 {
            return Err(DccError::InvalidArgument);
        }
        if !(55..=61).contains(&self.bit1_duration_us) {
            return Err(DccError::InvalidArgument);
        }
        if self.bit0_duration_us < 95 {
            return Err(DccError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

/// RAM-only per-bit timing override used by compliance tests, cleared whenever the CS stops.
///
/// Single-writer (a controller setter) / single-reader (the ISR); backed by atomics rather
/// than a lock so the ISR read is wait-free.
#[derive(Debug)]
pub struct OverrideMap {
    mask: AtomicU64,
    delta_p: AtomicI32,
    delta_n: AtomicI32,
}

impl OverrideMap {
    pub const fn new() -> Self {
        OverrideMap {
            mask: AtomicU64::new(0),
            delta_p: AtomicI32::new(0),
            delta_n: AtomicI32::new(0),
        }
    }

    pub fn set(&self, mask: u64, delta_p: i32, delta_n: i32) {
        self.delta_p.store(delta_p, Ordering::Release);
        self.delta_n.store(delta_n, Ordering::Release);
        self.mask.store(mask, Ordering::Release);
    }

    pub fn clear(&self) {
        self.mask.store(0, Ordering::Release);
        self.delta_p.store(0, Ordering::Release);
        self.delta_n.store(0, Ordering::Release);
    }

    pub fn snapshot(&self) -> (u64, i32, i32) {
        (
            self.mask.load(Ordering::Acquire),
            self.delta_p.load(Ordering::Acquire),
            self.delta_n.load(Ordering::Acquire),
        )
    }

    fn delta_for_bit(&self, bit_index: u8, phase: Phase) -> i32 {
        let (mask, delta_p, delta_n) = self.snapshot();
        if bit_index < 64 && (mask & (1u64 << bit_index)) != 0 {
            match phase {
                Phase::Positive => delta_p,
                Phase::Negative => delta_n,
            }
        } else {
            0
        }
    }
}

impl Default for OverrideMap {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    First,
    Second,
}

impl Half {
    fn flipped(self) -> Self {
        match self {
            Half::First => Half::Second,
            Half::Second => Half::First,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsState {
    Preamble { remaining_halves: u16 },
    StartBit { half: Half },
    Byte { byte_idx: u8, bit_idx: u8, half: Half },
    Separator { next_byte_idx: u8, half: Half },
    StopBit { half: Half },
    Cutout,
}

/// The CS TX ISR state machine described in §4.C.
pub struct TimingEngine {
    config: TimingConfig,
    pending_config: Option<TimingConfig>,
    state: CsState,
    phase: Phase,
    current_packet: Packet,
    stopping: bool,
    /// Set by [`Self::new`]/[`Self::enable`]; cleared the first time [`Self::tick`] runs,
    /// which dequeues the very first packet instead of transmitting a hardcoded idle cycle
    /// before the queue is ever consulted.
    needs_initial_fetch: bool,
}

impl TimingEngine {
    /// Construct an engine in the powered-off (Idle) state; call [`Self::enable`] to arm it.
    pub fn new(config: TimingConfig) -> Self {
        TimingEngine {
            config,
            pending_config: None,
            state: CsState::Preamble {
                remaining_halves: u16::from(config.num_preamble) * 2,
            },
            phase: Phase::Positive,
            current_packet: Packet::idle(),
            stopping: false,
            needs_initial_fetch: true,
        }
    }

    /// Snapshot the config and (re)start from a fresh preamble. Matches the Idle → Preamble
    /// transition: TimingConfig is latched here and not re-read until the next `enable`.
    pub fn enable(&mut self, config: TimingConfig) {
        self.config = config;
        self.pending_config = None;
        self.state = CsState::Preamble {
            remaining_halves: u16::from(config.num_preamble) * 2,
        };
        self.phase = Phase::Positive;
        self.stopping = false;
        self.needs_initial_fetch = true;
    }

    /// Apply a new [`TimingConfig`] at the next inter-packet boundary instead of immediately.
    pub fn request_config(&mut self, config: TimingConfig) {
        self.pending_config = Some(config);
    }

    /// Request the engine complete its current packet (and a final cutout, if configured) and
    /// then halt. [`Self::tick`] keeps returning events until [`Self::is_halted`].
    pub fn request_stop(&mut self) {
        self.stopping = true;
    }

    pub fn is_halted(&self) -> bool {
        self.stopping && matches!(self.state, CsState::Preamble { .. }) && self.at_packet_start()
    }

    fn at_packet_start(&self) -> bool {
        matches!(
            self.state,
            CsState::Preamble { remaining_halves } if remaining_halves == u16::from(self.config.num_preamble) * 2
        )
    }

    /// Advance the state machine by one half-period and report what the ISR should program
    /// and drive. `next_packet` is consulted only at an inter-packet (Gap) boundary; it must
    /// not block (it is a single SPSC-queue pop).
    pub fn tick(
        &mut self,
        overrides: &OverrideMap,
        next_packet: &mut dyn FnMut() -> Option<Packet>,
    ) -> HalfBitEvent {
        if self.needs_initial_fetch {
            self.needs_initial_fetch = false;
            self.current_packet = next_packet().unwrap_or_else(Packet::idle);
        }
        self.phase = self.phase.flipped();

        let (base_us, first_bit, bidir_enable, track, advance_stop) = match self.state {
            CsState::Cutout => {
                let us = BIDI_CUTOUT_US;
                self.begin_new_packet(next_packet);
                (us, false, true, TrackState::Cutout, false)
            }
            CsState::Preamble { remaining_halves } => {
                let first = remaining_halves == u16::from(self.config.num_preamble) * 2;
                if remaining_halves > 1 {
                    self.state = CsState::Preamble {
                        remaining_halves: remaining_halves - 1,
                    };
                } else {
                    self.state = CsState::StartBit { half: Half::First };
                }
                (
                    u32::from(self.config.bit1_duration_us),
                    first,
                    false,
                    TrackState::Drive(self.phase),
                    false,
                )
            }
            CsState::StartBit { half } => {
                let first = half == Half::First;
                self.state = match half {
                    Half::First => CsState::StartBit { half: Half::Second },
                    Half::Second => CsState::Byte {
                        byte_idx: 0,
                        bit_idx: 0,
                        half: Half::First,
                    },
                };
                (
                    u32::from(self.config.bit0_duration_us),
                    first,
                    false,
                    TrackState::Drive(self.phase),
                    false,
                )
            }
            CsState::Byte {
                byte_idx,
                bit_idx,
                half,
            } => {
                let byte = self.current_packet.as_bytes()[byte_idx as usize];
                let bit = (byte >> (7 - bit_idx)) & 1;
                let mut us = if bit == 1 {
                    u32::from(self.config.bit1_duration_us)
                } else {
                    u32::from(self.config.bit0_duration_us)
                };
                let global_bit = byte_idx * 8 + bit_idx;
                if us >= DCC_TX_MIN_BIT_0_TIMING {
                    let delta = overrides.delta_for_bit(global_bit, self.phase);
                    us = (us as i64 + i64::from(delta)).max(1) as u32;
                }
                let first = half == Half::First;
                self.state = match half {
                    Half::First => CsState::Byte {
                        byte_idx,
                        bit_idx,
                        half: Half::Second,
                    },
                    Half::Second => {
                        let last_bit_of_byte = bit_idx == 7;
                        let last_byte = (byte_idx as usize) == self.current_packet.len() - 1;
                        if !last_bit_of_byte {
                            CsState::Byte {
                                byte_idx,
                                bit_idx: bit_idx + 1,
                                half: Half::First,
                            }
                        } else if !last_byte {
                            CsState::Separator {
                                next_byte_idx: byte_idx + 1,
                                half: Half::First,
                            }
                        } else {
                            CsState::StopBit { half: Half::First }
                        }
                    }
                };
                (us, first, false, TrackState::Drive(self.phase), false)
            }
            CsState::Separator {
                next_byte_idx,
                half,
            } => {
                let first = half == Half::First;
                self.state = match half {
                    Half::First => CsState::Separator {
                        next_byte_idx,
                        half: Half::Second,
                    },
                    Half::Second => CsState::Byte {
                        byte_idx: next_byte_idx,
                        bit_idx: 0,
                        half: Half::First,
                    },
                };
                (
                    u32::from(self.config.bit0_duration_us),
                    first,
                    false,
                    TrackState::Drive(self.phase),
                    false,
                )
            }
            CsState::StopBit { half } => {
                let first = half == Half::First;
                let advance = half == Half::Second;
                self.state = match half {
                    Half::First => CsState::StopBit { half: Half::Second },
                    Half::Second => {
                        if self.config.bidi_enable {
                            CsState::Cutout
                        } else {
                            // No cutout: the Gap boundary collapses into this same tick.
                            CsState::Preamble {
                                remaining_halves: 0,
                            }
                        }
                    }
                };
                (
                    u32::from(self.config.bit1_duration_us),
                    first,
                    false,
                    TrackState::Drive(self.phase),
                    advance,
                )
            }
        };

        // No-cutout path: the Gap boundary logic still needs to run once, right after the
        // stop bit, so the *next* tick already starts a fresh preamble. This only updates
        // state; the event already computed above for the stop bit's own half-period is
        // still the one returned.
        if advance_stop && !self.config.bidi_enable {
            self.begin_new_packet(next_packet);
        }

        HalfBitEvent {
            period_us: base_us,
            track,
            first_bit,
            bidir_enable,
        }
    }

    /// Gap-boundary logic: latch any pending config change, clear to a fresh preamble, and
    /// pull the next packet (or the idle packet) off the queue.
    fn begin_new_packet(&mut self, next_packet: &mut dyn FnMut() -> Option<Packet>) {
        if let Some(pending) = self.pending_config.take() {
            self.config = pending;
        }
        self.current_packet = next_packet().unwrap_or_else(Packet::idle);
        self.state = CsState::Preamble {
            remaining_halves: u16::from(self.config.num_preamble) * 2,
        };
        if self.stopping {
            // Halted: report idle via `is_halted`, but keep ticking an idle packet so the
            // timer still has a period to arm (actual teardown/disable happens in the
            // controller once it observes `is_halted`).
        }
    }

    pub fn config(&self) -> TimingConfig {
        self.config
    }
}

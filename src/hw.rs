//! Hardware trait seams.
//!
//! Every owned hardware resource the core touches (timer, track driver pins, ADC, DAC, GPIO
//! bank, RTC, system reset) is expressed as a small trait here instead of a concrete register
//! driver: controllers and the RPC layer are generic over these traits and never assume a
//! specific MCU family. A board support package provides the concrete implementations; this
//! crate only depends on [`embedded_hal`] where that crate already defines the right shape.

/// Drives the two track output phases and the BiDi cutout control lines during the CS ISR.
///
/// Implemented by the board support package over whatever GPIO peripheral backs the H-bridge;
/// must be callable from interrupt context, so implementations may not block.
pub trait TrackDriver {
    /// Drive the `N` and `P` rail outputs. `(false, false)` is the safe/cutout state.
    fn set_outputs(&mut self, n: bool, p: bool);
    /// Enable or disable the BiDi direction-control line (`BIDIR_EN`).
    fn set_bidir_enable(&mut self, enable: bool);
    /// Drive or release the booster output stage (`BR_ENABLE`); low during cutout.
    fn set_br_enable(&mut self, enable: bool);
    /// Pulse the scope-trigger pin marking the first half-period of a new logical bit, when
    /// [`crate::timing::TimingConfig::trigger_first_bit`] is set.
    fn set_first_bit_trigger(&mut self, asserted: bool);
}

/// A free-running, interrupt-driven half-bit timer.
///
/// `arm_next_period_us` reprograms the timer's auto-reload for the *next* update interrupt; it
/// is always called from within the timer-update ISR itself and must be wait-free.
pub trait HalfBitTimer {
    fn arm_next_period_us(&mut self, period_us: u32);
    fn start(&mut self);
    fn stop(&mut self);
}

/// Transmits a single BiDi datagram over the dedicated RailCom UART.
///
/// Used by the Decoder in the cutout window, and by the CS controller in loop-test mode to
/// log what a DUT sent back.
pub trait BidiTransmitter {
    fn send(&mut self, data: &[u8]);
}

/// A single-shot analog input channel, read synchronously.
///
/// Uses the same `nb`-based non-blocking read shape as `embedded-hal-nb`'s serial traits,
/// rather than pulling in a full ADC HAL crate, since only a blocking single-sample read is
/// needed here.
pub trait AdcChannel {
    type Error;
    fn read_raw(&mut self) -> nb::Result<u16, Self::Error>;
}

/// The BiDi-threshold DAC output.
pub trait DacChannel {
    type Error;
    fn set_raw(&mut self, value: u16) -> Result<(), Self::Error>;
}

/// A bank of up to 16 numbered digital I/O pins, addressed the way the RPC surface addresses
/// them (`pin: 1..=16`).
pub trait GpioBank {
    /// Configure `pin` as a push-pull output.
    fn configure_output(&mut self, pin: u8);
    /// Drive `pin`, previously configured as an output, to `state`.
    fn set_output(&mut self, pin: u8, state: bool);
    /// Read the current logic level of `pin`.
    fn read_input(&self, pin: u8) -> bool;
    /// Read all 16 pins packed LSB-first (`bit0` = pin 1).
    fn read_all(&self) -> u16 {
        let mut value = 0u16;
        for pin in 1..=16u8 {
            if self.read_input(pin) {
                value |= 1 << (pin - 1);
            }
        }
        value
    }
}

/// Calendar date/time as exposed by `get_rtc_datetime`/`set_rtc_datetime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// The board real-time clock.
pub trait RealTimeClock {
    fn get(&self) -> DateTime;
    fn set(&mut self, dt: DateTime);
}

/// Terminates the firmware image, restarting the MCU. Diverges; the RPC response for
/// `system_reboot` must already be flushed to the transport before this is called.
pub trait SystemReset {
    fn reset(&mut self) -> !;
}

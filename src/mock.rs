//! Shared `#[cfg(test)]` hardware test doubles, implementing every trait in [`crate::hw`] plus
//! [`embedded_storage`]'s flash traits. Individual modules keep small ad hoc fakes where a single
//! behavior needs exercising; this module is for doubles reused across module boundaries (system-
//! and RPC-level tests).
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

use embedded_hal::delay::DelayNs;

use crate::hw::{AdcChannel, DacChannel, DateTime, GpioBank, RealTimeClock, SystemReset, TrackDriver};

/// A delay double that accumulates elapsed time instead of actually sleeping.
#[derive(Debug, Default)]
pub struct MockDelay {
    pub total_ms: u32,
}
impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ms += ns / 1_000_000;
    }
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += ms;
    }
}

#[derive(Debug, Default)]
pub struct MockTrackDriver {
    pub outputs: (bool, bool),
    pub bidir_enable: bool,
    pub br_enable: bool,
    pub first_bit_trigger: bool,
    pub set_outputs_calls: u32,
}
impl TrackDriver for MockTrackDriver {
    fn set_outputs(&mut self, n: bool, p: bool) {
        self.outputs = (n, p);
        self.set_outputs_calls += 1;
    }
    fn set_bidir_enable(&mut self, enable: bool) {
        self.bidir_enable = enable;
    }
    fn set_br_enable(&mut self, enable: bool) {
        self.br_enable = enable;
    }
    fn set_first_bit_trigger(&mut self, asserted: bool) {
        self.first_bit_trigger = asserted;
    }
}

#[derive(Debug, Default)]
pub struct MockAdc {
    pub samples: std::vec::Vec<u16>,
    next: usize,
}
impl MockAdc {
    pub fn with_samples(samples: &[u16]) -> Self {
        MockAdc {
            samples: samples.to_vec(),
            next: 0,
        }
    }
}
impl AdcChannel for MockAdc {
    type Error = ();
    fn read_raw(&mut self) -> nb::Result<u16, Self::Error> {
        if self.samples.is_empty() {
            return Err(nb::Error::Other(()));
        }
        let v = self.samples[self.next % self.samples.len()];
        self.next += 1;
        Ok(v)
    }
}

#[derive(Debug, Default)]
pub struct MockDac {
    pub last_raw: Option<u16>,
}
impl DacChannel for MockDac {
    type Error = ();
    fn set_raw(&mut self, value: u16) -> Result<(), Self::Error> {
        self.last_raw = Some(value);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockGpioBank {
    levels: [bool; 16],
    pub configured_outputs: [bool; 16],
}
impl GpioBank for MockGpioBank {
    fn configure_output(&mut self, pin: u8) {
        self.configured_outputs[(pin - 1) as usize] = true;
    }
    fn set_output(&mut self, pin: u8, state: bool) {
        self.levels[(pin - 1) as usize] = state;
    }
    fn read_input(&self, pin: u8) -> bool {
        self.levels[(pin - 1) as usize]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MockRtc {
    pub now: DateTime,
}
impl Default for MockRtc {
    fn default() -> Self {
        MockRtc {
            now: DateTime {
                year: 2026,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
            },
        }
    }
}
impl RealTimeClock for MockRtc {
    fn get(&self) -> DateTime {
        self.now
    }
    fn set(&mut self, dt: DateTime) {
        self.now = dt;
    }
}

/// A [`SystemReset`] that panics instead of actually resetting, so a test that accidentally
/// triggers a reboot fails loudly instead of tearing down the test process.
#[derive(Debug, Default)]
pub struct MockReset;
impl SystemReset for MockReset {
    fn reset(&mut self) -> ! {
        panic!("MockReset::reset called");
    }
}

#[derive(Debug)]
pub struct MockFlashError;
impl NorFlashError for MockFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

/// A flash device backed by a plain `Vec<u8>`, erased to `0xFF` like real NOR flash.
pub struct MockFlash {
    pub data: std::vec::Vec<u8>,
}
impl MockFlash {
    pub fn new(size: usize) -> Self {
        MockFlash {
            data: std::vec![0xFFu8; size],
        }
    }
}
impl ErrorType for MockFlash {
    type Error = MockFlashError;
}
impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 1;
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let o = offset as usize;
        bytes.copy_from_slice(&self.data[o..o + bytes.len()]);
        Ok(())
    }
    fn capacity(&self) -> usize {
        self.data.len()
    }
}
impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 512;
    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        for b in &mut self.data[from as usize..to as usize] {
            *b = 0xFF;
        }
        Ok(())
    }
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let o = offset as usize;
        self.data[o..o + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_gpio_bank_round_trips() {
        let mut bank = MockGpioBank::default();
        bank.configure_output(1);
        bank.set_output(1, true);
        assert!(bank.read_input(1));
        assert!(bank.configured_outputs[0]);
    }

    #[test]
    fn mock_flash_erases_to_0xff() {
        let mut flash = MockFlash::new(16);
        flash.write(0, &[1, 2, 3]).unwrap();
        flash.erase(0, 16).unwrap();
        assert!(flash.data.iter().all(|&b| b == 0xFF));
    }
}

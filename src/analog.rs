//! Analog Feedback (§4.H): on-demand averaged ADC reads for track voltage and current, behind a
//! mutex with a bounded acquire timeout.
//!
//! A single owned channel wrapped in `embassy_sync`'s blocking mutex flavor, since the ADC here
//! is a generic [`crate::hw::AdcChannel`] rather than a chip-specific register block.
use arbitrary_int::u12;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal::delay::DelayNs;

use crate::DccError;
use crate::hw::{AdcChannel, DacChannel};

/// Compile-time scale factors turning a raw ADC sample into a physical unit.
pub const ADC_VOLTAGE_SCALE_MV_PER_LSB: u32 = 24;
pub const ADC_CURRENT_SCALE_MA_PER_LSB: u32 = 8;

/// How long [`read_averaged`] polls for the ADC mutex before giving up.
const ADC_MUTEX_TIMEOUT_MS: u32 = 100;
const ADC_MUTEX_POLL_INTERVAL_MS: u32 = 1;

/// `num_samples`/`sample_delay_ms` as accepted by `get_voltage_feedback_mv` and
/// `get_current_feedback_ma`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AnalogReadConfig {
    pub num_samples: u16,
    pub sample_delay_ms: u32,
}

impl AnalogReadConfig {
    pub const fn defaults() -> Self {
        AnalogReadConfig {
            num_samples: 8,
            sample_delay_ms: 5,
        }
    }
}

impl Default for AnalogReadConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Acquire the shared ADC, average `cfg.num_samples` raw reads `cfg.sample_delay_ms` apart, and
/// scale the mean by `scale_per_lsb`. A mutex acquire that doesn't succeed within
/// [`ADC_MUTEX_TIMEOUT_MS`] returns [`DccError::HardwareFault`] rather than blocking forever.
pub fn read_averaged<A: AdcChannel>(
    adc: &Mutex<CriticalSectionRawMutex, A>,
    delay: &mut impl DelayNs,
    cfg: AnalogReadConfig,
    scale_per_lsb: u32,
) -> Result<u32, DccError> {
    let mut waited_ms = 0u32;
    let mut guard = loop {
        match adc.try_lock() {
            Ok(guard) => break guard,
            Err(_) => {
                if waited_ms >= ADC_MUTEX_TIMEOUT_MS {
                    return Err(DccError::HardwareFault);
                }
                delay.delay_ms(ADC_MUTEX_POLL_INTERVAL_MS);
                waited_ms += ADC_MUTEX_POLL_INTERVAL_MS;
            }
        }
    };

    let n = cfg.num_samples.max(1);
    let mut total: u64 = 0;
    for i in 0..n {
        let raw = nb::block!(guard.read_raw()).map_err(|_| DccError::HardwareFault)?;
        total += u64::from(raw);
        if i + 1 < n {
            delay.delay_ms(cfg.sample_delay_ms);
        }
    }
    let mean = (total / u64::from(n)) as u32;
    Ok(mean * scale_per_lsb)
}

pub fn get_voltage_feedback_mv<A: AdcChannel>(
    adc: &Mutex<CriticalSectionRawMutex, A>,
    delay: &mut impl DelayNs,
    cfg: AnalogReadConfig,
) -> Result<u32, DccError> {
    read_averaged(adc, delay, cfg, ADC_VOLTAGE_SCALE_MV_PER_LSB)
}

pub fn get_current_feedback_ma<A: AdcChannel>(
    adc: &Mutex<CriticalSectionRawMutex, A>,
    delay: &mut impl DelayNs,
    cfg: AnalogReadConfig,
) -> Result<u32, DccError> {
    read_averaged(adc, delay, cfg, ADC_CURRENT_SCALE_MA_PER_LSB)
}

/// Program the BiDi-threshold DAC from a [`crate::timing::TimingConfig::bidi_dac`] value.
pub fn set_bidi_threshold<D: DacChannel>(dac: &mut D, value: u12) -> Result<(), DccError> {
    dac.set_raw(value.value()).map_err(|_| DccError::HardwareFault)
}

//! Parameter Manager (§4.B): in-RAM shadow plus a CRC-guarded flash image of persistent
//! configuration (the Timing Engine's [`TimingConfig`], the Decoder's [`DecoderConfig`], and a
//! default test-loop mode).
use arbitrary_int::u12;
use crc::{CRC_32_ISO_HDLC, Crc};
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::DccError;
use crate::decoder::DecoderConfig;
use crate::timing::TimingConfig;

const MAGIC: u32 = 0x5041_5241;
const VERSION: u32 = 1;
const PAYLOAD_SIZE: usize = 32;
/// `magic(4) + version(4) + crc32(4) + data_size(4) + payload`.
const BLOCK_SIZE: usize = 16 + PAYLOAD_SIZE;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Everything the Parameter Manager persists, in one typed, versioned struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParameterData {
    pub timing: TimingConfig,
    pub decoder: DecoderConfig,
    pub default_loop_mode: u8,
}

impl ParameterData {
    pub const fn defaults() -> Self {
        ParameterData {
            timing: TimingConfig::defaults(),
            decoder: DecoderConfig::defaults(),
            default_loop_mode: 0,
        }
    }

    fn to_bytes(self) -> [u8; PAYLOAD_SIZE] {
        let mut buf = [0u8; PAYLOAD_SIZE];
        buf[0] = self.timing.num_preamble;
        buf[1] = self.timing.bit1_duration_us;
        buf[2] = self.timing.bit0_duration_us;
        buf[3] = u8::from(self.timing.bidi_enable);
        buf[4] = u8::from(self.timing.trigger_first_bit);
        buf[5..7].copy_from_slice(&self.timing.bidi_dac.value().to_le_bytes());
        buf[8..12].copy_from_slice(&self.decoder.one_bit_us.0.to_le_bytes());
        buf[12..16].copy_from_slice(&self.decoder.one_bit_us.1.to_le_bytes());
        buf[16..20].copy_from_slice(&self.decoder.zero_bit_us.0.to_le_bytes());
        buf[20..24].copy_from_slice(&self.decoder.zero_bit_us.1.to_le_bytes());
        buf[24] = self.default_loop_mode;
        buf
    }

    fn from_bytes(buf: &[u8; PAYLOAD_SIZE]) -> Result<Self, DccError> {
        let bidi_dac_raw = u16::from_le_bytes([buf[5], buf[6]]);
        if bidi_dac_raw > 0x0FFF {
            return Err(DccError::InvalidArgument);
        }
        let timing = TimingConfig {
            num_preamble: buf[0],
            bit1_duration_us: buf[1],
            bit0_duration_us: buf[2],
            bidi_enable: buf[3] != 0,
            trigger_first_bit: buf[4] != 0,
            bidi_dac: u12::new(bidi_dac_raw),
        };
        timing.validate()?;
        let decoder = DecoderConfig {
            one_bit_us: (
                u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
                u32::from_le_bytes(buf[12..16].try_into().expect("4 bytes")),
            ),
            zero_bit_us: (
                u32::from_le_bytes(buf[16..20].try_into().expect("4 bytes")),
                u32::from_le_bytes(buf[20..24].try_into().expect("4 bytes")),
            ),
        };
        Ok(ParameterData {
            timing,
            decoder,
            default_loop_mode: buf[24],
        })
    }
}

impl Default for ParameterData {
    fn default() -> Self {
        Self::defaults()
    }
}

/// `init(force_defaults)`, `save()`, `restore()`, `factory_reset()` plus a dirty flag; no
/// implicit auto-save (§4.B invariant: callers must invoke `save` explicitly).
pub struct ParameterManager<F> {
    flash: F,
    offset: u32,
    shadow: ParameterData,
    dirty: bool,
}

impl<F: NorFlash + ReadNorFlash> ParameterManager<F> {
    pub fn new(flash: F, offset: u32) -> Self {
        ParameterManager {
            flash,
            offset,
            shadow: ParameterData::defaults(),
            dirty: false,
        }
    }

    /// `init(false)` attempts `restore()`; on any failure, defaults are loaded and `init` still
    /// succeeds (§4.B invariant).
    pub fn init(&mut self, force_defaults: bool) -> ParameterData {
        if force_defaults || self.restore().is_err() {
            self.shadow = ParameterData::defaults();
            self.dirty = false;
        }
        self.shadow
    }

    pub fn get(&self) -> ParameterData {
        self.shadow
    }

    /// Write the in-RAM shadow. Validated against [`TimingConfig::validate`] before being
    /// accepted; marks dirty but does not touch flash.
    pub fn set(&mut self, data: ParameterData) -> Result<(), DccError> {
        data.timing.validate()?;
        self.shadow = data;
        self.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Erase the dedicated sector and write `{magic, version, crc32, data_size, payload}`.
    /// A crash between erase and write leaves `magic` unwritten, so the next `restore()` fails
    /// cleanly with [`DccError::MagicMismatch`] rather than returning corrupt data.
    pub fn save(&mut self) -> Result<(), DccError> {
        let payload = self.shadow.to_bytes();
        let crc = CRC32.checksum(&payload);

        let mut block = [0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        block[4..8].copy_from_slice(&VERSION.to_le_bytes());
        block[8..12].copy_from_slice(&crc.to_le_bytes());
        block[12..16].copy_from_slice(&(PAYLOAD_SIZE as u32).to_le_bytes());
        block[16..16 + PAYLOAD_SIZE].copy_from_slice(&payload);

        self.flash
            .erase(self.offset, self.offset + F::ERASE_SIZE as u32)
            .map_err(|_| DccError::HardwareFault)?;
        self.flash
            .write(self.offset, &block)
            .map_err(|_| DccError::HardwareFault)?;
        self.dirty = false;
        Ok(())
    }

    /// Re-hydrate the shadow from flash iff magic, version, data_size, and CRC all match.
    pub fn restore(&mut self) -> Result<(), DccError> {
        let mut block = [0u8; BLOCK_SIZE];
        self.flash
            .read(self.offset, &mut block)
            .map_err(|_| DccError::HardwareFault)?;

        let magic = u32::from_le_bytes(block[0..4].try_into().expect("4 bytes"));
        if magic != MAGIC {
            return Err(DccError::MagicMismatch);
        }
        let version = u32::from_le_bytes(block[4..8].try_into().expect("4 bytes"));
        if version != VERSION {
            return Err(DccError::VersionMismatch);
        }
        let stored_crc = u32::from_le_bytes(block[8..12].try_into().expect("4 bytes"));
        let data_size = u32::from_le_bytes(block[12..16].try_into().expect("4 bytes")) as usize;
        if data_size != PAYLOAD_SIZE {
            return Err(DccError::VersionMismatch);
        }
        let payload = &block[16..16 + PAYLOAD_SIZE];
        if CRC32.checksum(payload) != stored_crc {
            return Err(DccError::CrcMismatch);
        }
        let payload: [u8; PAYLOAD_SIZE] = payload.try_into().expect("exact size");
        self.shadow = ParameterData::from_bytes(&payload)?;
        self.dirty = false;
        Ok(())
    }

    /// Reset the shadow to compiled defaults and persist immediately.
    pub fn factory_reset(&mut self) -> Result<(), DccError> {
        self.shadow = ParameterData::defaults();
        self.dirty = true;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_storage::nor_flash::{ErrorType, NorFlashError, NorFlashErrorKind};

    #[derive(Debug)]
    struct FlashError;
    impl NorFlashError for FlashError {
        fn kind(&self) -> NorFlashErrorKind {
            NorFlashErrorKind::Other
        }
    }

    struct RamFlash {
        data: std::vec::Vec<u8>,
    }

    impl RamFlash {
        fn new() -> Self {
            RamFlash {
                data: std::vec![0xFFu8; 512],
            }
        }
    }

    impl ErrorType for RamFlash {
        type Error = FlashError;
    }

    impl ReadNorFlash for RamFlash {
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

    impl NorFlash for RamFlash {
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

    #[test]
    fn init_without_prior_save_loads_defaults() {
        let mut mgr = ParameterManager::new(RamFlash::new(), 0);
        let data = mgr.init(false);
        assert_eq!(data, ParameterData::defaults());
        assert!(!mgr.is_dirty());
    }

    #[test]
    fn round_trip_save_and_restore() {
        let mut mgr = ParameterManager::new(RamFlash::new(), 0);
        mgr.init(true);
        let mut data = ParameterData::defaults();
        data.timing.num_preamble = 20;
        mgr.set(data).unwrap();
        mgr.save().unwrap();

        let mut mgr2 = ParameterManager::new(RamFlash { data: mgr.flash.data.clone() }, 0);
        let restored = mgr2.init(false);
        assert_eq!(restored.timing.num_preamble, 20);
    }

    #[test]
    fn bit_flip_in_payload_is_rejected_by_crc() {
        let mut mgr = ParameterManager::new(RamFlash::new(), 0);
        mgr.init(true);
        mgr.save().unwrap();
        mgr.flash.data[20] ^= 0x01;
        assert_eq!(mgr.restore(), Err(DccError::CrcMismatch));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut mgr = ParameterManager::new(RamFlash::new(), 0);
        assert_eq!(mgr.restore(), Err(DccError::MagicMismatch));
    }

    #[test]
    fn factory_reset_restores_compiled_defaults() {
        let mut mgr = ParameterManager::new(RamFlash::new(), 0);
        mgr.init(true);
        let mut data = ParameterData::defaults();
        data.timing.num_preamble = 30;
        mgr.set(data).unwrap();
        mgr.save().unwrap();

        mgr.factory_reset().unwrap();
        assert_eq!(mgr.get(), ParameterData::defaults());
        mgr.restore().unwrap();
        assert_eq!(mgr.get(), ParameterData::defaults());
    }
}

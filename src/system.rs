//! System: the concrete aggregate wiring every component into one [`crate::rpc::RpcContext`]
//! implementation, owning the shared [`crate::timing::OverrideMap`] and the producer/consumer
//! halves of the CS packet queue.
//!
//! The packet queue itself is *not* owned here (`heapless::spsc::Queue::split` borrows it, which
//! would make this struct self-referential); the caller allocates the queue with `'static`
//! lifetime (e.g. as a top-level `static`) and passes the already-split producer/consumer in,
//! the same way an RTIC or Embassy app wires up its shared resources at `#[init]` time.
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal::delay::DelayNs;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use heapless::spsc::Consumer;
use portable_atomic::{AtomicBool, Ordering};

use crate::CS_PACKET_QUEUE_DEPTH;
use crate::DccError;
use crate::analog::{self, AnalogReadConfig};
use crate::codec::Packet;
use crate::controller::RunState;
use crate::controller::cs::CsController;
use crate::controller::decoder::{DecoderCallbacks, DecoderController};
use crate::hw::{AdcChannel, DacChannel, DateTime, GpioBank, RealTimeClock, SystemReset};
use crate::params::{ParameterData, ParameterManager};
use crate::rpc::{RpcContext, TimingConfigPatch};
use crate::timing::{HalfBitEvent, OverrideMap, TimingConfig, TimingEngine, TrackState};

/// Everything an RPC handler or the two waveform ISRs need, generic over the board's concrete
/// hardware types so this crate never names an MCU family.
pub struct System<'q, F, AV, AC, DAC, G, RTC, RST, DL> {
    timing: TimingEngine,
    overrides: OverrideMap,
    cs: CsController<'q>,
    queue_consumer: Consumer<'q, Packet, CS_PACKET_QUEUE_DEPTH>,
    /// Whether the track is currently in the BiDi cutout window, as last observed by
    /// [`Self::timing_tick`]. Written from the timer-update ISR, read from the independent
    /// input-capture ISR in [`Self::decoder_on_edge`]; an atomic since the two can preempt
    /// each other on a single core.
    track_quiet: AtomicBool,
    decoder: DecoderController,
    params: ParameterManager<F>,
    adc_voltage: Mutex<CriticalSectionRawMutex, AV>,
    adc_current: Mutex<CriticalSectionRawMutex, AC>,
    dac: DAC,
    gpio: G,
    rtc: RTC,
    reset: RST,
    delay: DL,
    reboot_requested: bool,
}

impl<'q, F, AV, AC, DAC, G, RTC, RST, DL> System<'q, F, AV, AC, DAC, G, RTC, RST, DL>
where
    F: NorFlash + ReadNorFlash,
    AV: AdcChannel,
    AC: AdcChannel,
    DAC: DacChannel,
    G: GpioBank,
    RTC: RealTimeClock,
    RST: SystemReset,
    DL: DelayNs,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cs: CsController<'q>,
        queue_consumer: Consumer<'q, Packet, CS_PACKET_QUEUE_DEPTH>,
        flash: F,
        flash_offset: u32,
        adc_voltage: AV,
        adc_current: AC,
        dac: DAC,
        gpio: G,
        rtc: RTC,
        reset: RST,
        delay: DL,
    ) -> Self {
        let mut params = ParameterManager::new(flash, flash_offset);
        let ParameterData { timing, decoder, .. } = params.init(false);
        System {
            timing: TimingEngine::new(timing),
            overrides: OverrideMap::new(),
            cs,
            queue_consumer,
            track_quiet: AtomicBool::new(false),
            decoder: DecoderController::new(decoder),
            params,
            adc_voltage: Mutex::new(adc_voltage),
            adc_current: Mutex::new(adc_current),
            dac,
            gpio,
            rtc,
            reset,
            delay,
            reboot_requested: false,
        }
    }

    /// Advance the CS waveform by one timer-update period. Called from the timer-update ISR.
    pub fn timing_tick(&mut self) -> HalfBitEvent {
        let overrides = &self.overrides;
        let consumer = &mut self.queue_consumer;
        let mut next_packet = || consumer.dequeue();
        let event = self.timing.tick(overrides, &mut next_packet);
        self.track_quiet.store(event.track == TrackState::Cutout, Ordering::Release);
        event
    }

    /// Feed one captured half-period sample into the decoder. Called from the input-capture ISR.
    ///
    /// Gates any BiDi reply on the track state last reported by [`Self::timing_tick`]: a
    /// decoder can only be heard while the CS booster is silent.
    pub fn decoder_on_edge(&mut self, half_period_us: u32, cb: &mut dyn DecoderCallbacks) {
        let track_quiet = self.track_quiet.load(Ordering::Acquire);
        self.decoder.on_edge(half_period_us, track_quiet, cb);
    }

    pub fn cs_state(&self) -> RunState {
        self.cs.state()
    }

    pub fn decoder_state(&self) -> RunState {
        self.decoder.state()
    }

    /// Program the BiDi-threshold DAC from the current `TimingConfig`. Call after
    /// `timing_apply_patch` or a successful `parameters_restore`/`factory_reset` so the DAC
    /// stays in sync with the shadow.
    pub fn sync_bidi_dac(&mut self) -> Result<(), DccError> {
        analog::set_bidi_threshold(&mut self.dac, self.timing.config().bidi_dac)
    }

    /// Consumed by the top-level run loop right after a response has been flushed to the
    /// transport; `true` means `system_reboot` was requested and `hw::SystemReset::reset` should
    /// now be called.
    pub fn take_reboot_request(&mut self) -> bool {
        core::mem::take(&mut self.reboot_requested)
    }

    pub fn reset_mut(&mut self) -> &mut RST {
        &mut self.reset
    }
}

impl<'q, F, AV, AC, DAC, G, RTC, RST, DL> RpcContext for System<'q, F, AV, AC, DAC, G, RTC, RST, DL>
where
    F: NorFlash + ReadNorFlash,
    AV: AdcChannel,
    AC: AdcChannel,
    DAC: DacChannel,
    G: GpioBank,
    RTC: RealTimeClock,
    RST: SystemReset,
    DL: DelayNs,
{
    fn cs_start(&mut self, loop_mode: u8) -> Result<(), DccError> {
        self.cs.start(loop_mode)
    }

    fn cs_stop(&mut self) -> Result<(), DccError> {
        self.cs.stop()?;
        // §3 invariant: the override map is cleared whenever the CS stops.
        self.overrides.clear();
        Ok(())
    }

    fn cs_load_packet(&mut self, bytes: &[u8]) -> Result<usize, DccError> {
        self.cs.load_packet(bytes)
    }

    fn cs_transmit_packet(&mut self, count: u32, delay_ms: u32) -> Result<(), DccError> {
        self.cs.transmit_packet(count, delay_ms)
    }

    fn cs_take_transmit_overflow(&mut self) -> bool {
        self.cs.take_transmit_overflow()
    }

    fn timing_get_config(&self) -> TimingConfig {
        self.timing.config()
    }

    fn timing_apply_patch(&mut self, patch: TimingConfigPatch) -> Result<(), DccError> {
        let patched = patch.apply_to(self.timing.config());
        patched.validate()?;
        // Takes effect at the next inter-packet boundary (§5 ordering guarantee), not
        // immediately, so a change can never land mid-packet.
        self.timing.request_config(patched);
        Ok(())
    }

    fn override_set(&mut self, mask: u64, delta_p_ns: i32, delta_n_ns: i32) {
        self.overrides.set(mask, delta_p_ns, delta_n_ns);
    }

    fn override_reset(&mut self) {
        self.overrides.clear();
    }

    fn override_snapshot(&self) -> (u64, i32, i32) {
        self.overrides.snapshot()
    }

    fn decoder_start(&mut self) -> Result<(), DccError> {
        self.decoder.start()
    }

    fn decoder_stop(&mut self) -> Result<(), DccError> {
        self.decoder.stop()
    }

    fn parameters_save(&mut self) -> Result<(), DccError> {
        self.params.set(ParameterData {
            timing: self.timing.config(),
            decoder: self.decoder.config(),
            default_loop_mode: self.cs.loop_mode(),
        })?;
        self.params.save()
    }

    fn parameters_restore(&mut self) -> Result<(), DccError> {
        self.params.restore()?;
        let data = self.params.get();
        self.timing.request_config(data.timing);
        Ok(())
    }

    fn parameters_factory_reset(&mut self) -> Result<(), DccError> {
        self.params.factory_reset()?;
        let data = self.params.get();
        self.timing.request_config(data.timing);
        Ok(())
    }

    fn voltage_feedback_mv(&mut self, num_samples: Option<u16>, sample_delay_ms: Option<u32>) -> Result<u32, DccError> {
        let cfg = resolve_analog_config(num_samples, sample_delay_ms);
        analog::get_voltage_feedback_mv(&self.adc_voltage, &mut self.delay, cfg)
    }

    fn current_feedback_ma(&mut self, num_samples: Option<u16>, sample_delay_ms: Option<u32>) -> Result<u32, DccError> {
        let cfg = resolve_analog_config(num_samples, sample_delay_ms);
        analog::get_current_feedback_ma(&self.adc_current, &mut self.delay, cfg)
    }

    fn gpio_configure_output(&mut self, pin: u8) -> Result<(), DccError> {
        self.gpio.configure_output(pin);
        Ok(())
    }

    fn gpio_set_output(&mut self, pin: u8, state: bool) -> Result<(), DccError> {
        self.gpio.set_output(pin, state);
        Ok(())
    }

    fn gpio_get_input(&self, pin: u8) -> Result<bool, DccError> {
        Ok(self.gpio.read_input(pin))
    }

    fn gpio_get_inputs(&self) -> u16 {
        self.gpio.read_all()
    }

    fn rtc_get(&self) -> DateTime {
        self.rtc.get()
    }

    fn rtc_set(&mut self, dt: DateTime) -> Result<(), DccError> {
        self.rtc.set(dt);
        Ok(())
    }

    fn request_reboot(&mut self) {
        self.reboot_requested = true;
    }
}

fn resolve_analog_config(num_samples: Option<u16>, sample_delay_ms: Option<u32>) -> AnalogReadConfig {
    let mut cfg = AnalogReadConfig::defaults();
    if let Some(n) = num_samples {
        cfg.num_samples = n;
    }
    if let Some(d) = sample_delay_ms {
        cfg.sample_delay_ms = d;
    }
    cfg
}

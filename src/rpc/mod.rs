//! RPC Dispatcher (§4.G): turns one line of request JSON into one line of response JSON against
//! a fixed, runtime-registered method table, generic over an [`RpcContext`] the concrete
//! [`crate::system::System`] implements.
pub mod json;
pub mod methods;

use heapless::String;

use crate::DccError;
use crate::hw::DateTime;
use crate::timing::TimingConfig;
use json::JsonWriter;

/// Upper bound on the length of a single response line, matching the transport's line buffer.
pub const RPC_RESPONSE_CAP: usize = 512;
/// Upper bound on the number of distinct methods the dispatch table can hold.
pub const MAX_METHODS: usize = 32;

pub type Response = JsonWriter<RPC_RESPONSE_CAP>;

/// A sparse patch over [`TimingConfig`]'s host-settable fields, as carried by
/// `command_station_params`. `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingConfigPatch {
    pub num_preamble: Option<u8>,
    pub bit1_duration_us: Option<u8>,
    pub bit0_duration_us: Option<u8>,
    pub bidi_enable: Option<bool>,
    pub trigger_first_bit: Option<bool>,
}

impl TimingConfigPatch {
    /// Apply the patch to `base`, returning the would-be result without mutating anything.
    pub fn apply_to(self, mut base: TimingConfig) -> TimingConfig {
        if let Some(v) = self.num_preamble {
            base.num_preamble = v;
        }
        if let Some(v) = self.bit1_duration_us {
            base.bit1_duration_us = v;
        }
        if let Some(v) = self.bit0_duration_us {
            base.bit0_duration_us = v;
        }
        if let Some(v) = self.bidi_enable {
            base.bidi_enable = v;
        }
        if let Some(v) = self.trigger_first_bit {
            base.trigger_first_bit = v;
        }
        base
    }
}

/// Everything a method handler needs from the rest of the firmware. Implemented exactly once, by
/// [`crate::system::System`]; a `#[cfg(test)]` double in `methods`' own test module stands in for
/// it in dispatcher unit tests, keeping the RPC layer itself decoupled from the concrete hardware
/// and controller types.
pub trait RpcContext {
    fn cs_start(&mut self, loop_mode: u8) -> Result<(), DccError>;
    fn cs_stop(&mut self) -> Result<(), DccError>;
    fn cs_load_packet(&mut self, bytes: &[u8]) -> Result<usize, DccError>;
    fn cs_transmit_packet(&mut self, count: u32, delay_ms: u32) -> Result<(), DccError>;
    /// `true` iff a custom packet was dropped for a full queue since the last call; clears on
    /// read. Custom-packet mode's overflow policy is caller-sees-error, unlike test-loop mode's
    /// silent newest-drops-when-full.
    fn cs_take_transmit_overflow(&mut self) -> bool;

    fn timing_get_config(&self) -> TimingConfig;
    fn timing_apply_patch(&mut self, patch: TimingConfigPatch) -> Result<(), DccError>;

    /// Apply a per-bit override delta. Mask bits select which logical bit positions (within a
    /// packet) are affected; see [`crate::timing::OverrideMap`].
    fn override_set(&mut self, mask: u64, delta_p_ns: i32, delta_n_ns: i32);
    fn override_reset(&mut self);
    fn override_snapshot(&self) -> (u64, i32, i32);

    fn decoder_start(&mut self) -> Result<(), DccError>;
    fn decoder_stop(&mut self) -> Result<(), DccError>;

    fn parameters_save(&mut self) -> Result<(), DccError>;
    fn parameters_restore(&mut self) -> Result<(), DccError>;
    fn parameters_factory_reset(&mut self) -> Result<(), DccError>;

    fn voltage_feedback_mv(&mut self, num_samples: Option<u16>, sample_delay_ms: Option<u32>) -> Result<u32, DccError>;
    fn current_feedback_ma(&mut self, num_samples: Option<u16>, sample_delay_ms: Option<u32>) -> Result<u32, DccError>;

    fn gpio_configure_output(&mut self, pin: u8) -> Result<(), DccError>;
    fn gpio_set_output(&mut self, pin: u8, state: bool) -> Result<(), DccError>;
    fn gpio_get_input(&self, pin: u8) -> Result<bool, DccError>;
    fn gpio_get_inputs(&self) -> u16;

    fn rtc_get(&self) -> DateTime;
    fn rtc_set(&mut self, dt: DateTime) -> Result<(), DccError>;

    /// Request a reboot. Must not reset synchronously: the dispatcher's caller is responsible
    /// for flushing the `status:"ok"` response to the transport first, then observing this flag
    /// and invoking [`crate::hw::SystemReset::reset`] itself.
    fn request_reboot(&mut self);
}

pub type Handler<C> = fn(&mut C, &str, &mut Response) -> Result<(), DccError>;

/// Fixed-size, runtime-populated method table. `register` overwrites an existing entry of the
/// same name rather than erroring, so a board support package can re-register a method (e.g. to
/// swap in a test stub) without restarting.
pub struct Dispatcher<C> {
    table: [Option<(String<32>, Handler<C>)>; MAX_METHODS],
    len: usize,
}

impl<C: RpcContext> Dispatcher<C> {
    pub fn new() -> Self {
        Dispatcher {
            table: core::array::from_fn(|_| None),
            len: 0,
        }
    }

    /// Register `name` -> `handler`. Fails with [`DccError::InvalidArgument`] only if the table
    /// is full and `name` is not already present; this is an init-time developer error, never
    /// triggered by untrusted RPC input.
    pub fn register(&mut self, name: &str, handler: Handler<C>) -> Result<(), DccError> {
        for slot in self.table.iter_mut().flatten() {
            if slot.0.as_str() == name {
                slot.1 = handler;
                return Ok(());
            }
        }
        if self.len >= MAX_METHODS {
            return Err(DccError::InvalidArgument);
        }
        let mut owned = String::new();
        owned.push_str(name).map_err(|_| DccError::InvalidArgument)?;
        for slot in self.table.iter_mut() {
            if slot.is_none() {
                *slot = Some((owned, handler));
                self.len += 1;
                return Ok(());
            }
        }
        unreachable!("len < MAX_METHODS implies a free slot exists")
    }

    fn find(&self, name: &str) -> Option<Handler<C>> {
        self.table
            .iter()
            .flatten()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, h)| *h)
    }

    /// Build a dispatcher with every built-in method from [`methods`] registered.
    pub fn with_builtin_methods() -> Self {
        let mut d = Self::new();
        methods::register_all(&mut d).expect("MAX_METHODS >= builtin method count");
        d
    }

    /// Parse and dispatch one request line, returning the exact bytes of the response line
    /// (without a trailing newline; the transport adapter appends framing).
    pub fn handle_line(&self, ctx: &mut C, line: &str) -> String<RPC_RESPONSE_CAP> {
        let env = match json::scan_envelope(line) {
            Ok(env) => env,
            Err(e) => return Response::error(e),
        };
        let Some(handler) = self.find(env.method) else {
            return Response::error(DccError::UnknownMethod);
        };
        let mut out = Response::ok();
        match handler(ctx, env.params, &mut out) {
            Ok(()) => out.finish(),
            Err(e) => Response::error(e),
        }
    }
}

impl<C: RpcContext> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingContext {
        starts: u32,
    }
    impl RpcContext for CountingContext {
        fn cs_start(&mut self, _loop_mode: u8) -> Result<(), DccError> {
            self.starts += 1;
            Ok(())
        }
        fn cs_stop(&mut self) -> Result<(), DccError> {
            Ok(())
        }
        fn cs_load_packet(&mut self, _bytes: &[u8]) -> Result<usize, DccError> {
            Ok(0)
        }
        fn cs_transmit_packet(&mut self, _count: u32, _delay_ms: u32) -> Result<(), DccError> {
            Ok(())
        }
        fn cs_take_transmit_overflow(&mut self) -> bool {
            false
        }
        fn timing_get_config(&self) -> TimingConfig {
            TimingConfig::defaults()
        }
        fn timing_apply_patch(&mut self, _patch: TimingConfigPatch) -> Result<(), DccError> {
            Ok(())
        }
        fn override_set(&mut self, _mask: u64, _delta_p_ns: i32, _delta_n_ns: i32) {}
        fn override_reset(&mut self) {}
        fn override_snapshot(&self) -> (u64, i32, i32) {
            (0, 0, 0)
        }
        fn decoder_start(&mut self) -> Result<(), DccError> {
            Ok(())
        }
        fn decoder_stop(&mut self) -> Result<(), DccError> {
            Ok(())
        }
        fn parameters_save(&mut self) -> Result<(), DccError> {
            Ok(())
        }
        fn parameters_restore(&mut self) -> Result<(), DccError> {
            Ok(())
        }
        fn parameters_factory_reset(&mut self) -> Result<(), DccError> {
            Ok(())
        }
        fn voltage_feedback_mv(&mut self, _n: Option<u16>, _d: Option<u32>) -> Result<u32, DccError> {
            Ok(14000)
        }
        fn current_feedback_ma(&mut self, _n: Option<u16>, _d: Option<u32>) -> Result<u32, DccError> {
            Ok(250)
        }
        fn gpio_configure_output(&mut self, _pin: u8) -> Result<(), DccError> {
            Ok(())
        }
        fn gpio_set_output(&mut self, _pin: u8, _state: bool) -> Result<(), DccError> {
            Ok(())
        }
        fn gpio_get_input(&self, _pin: u8) -> Result<bool, DccError> {
            Ok(true)
        }
        fn gpio_get_inputs(&self) -> u16 {
            0
        }
        fn rtc_get(&self) -> DateTime {
            DateTime {
                year: 2026,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
            }
        }
        fn rtc_set(&mut self, _dt: DateTime) -> Result<(), DccError> {
            Ok(())
        }
        fn request_reboot(&mut self) {}
    }

    #[test]
    fn unknown_method_is_reported() {
        let d = Dispatcher::<CountingContext>::with_builtin_methods();
        let mut ctx = CountingContext::default();
        let resp = d.handle_line(&mut ctx, r#"{"method":"nope","params":{}}"#);
        assert_eq!(resp.as_str(), r#"{"status":"error","message":"Unknown method"}"#);
    }

    #[test]
    fn malformed_json_is_reported_before_dispatch() {
        let d = Dispatcher::<CountingContext>::with_builtin_methods();
        let mut ctx = CountingContext::default();
        let resp = d.handle_line(&mut ctx, "not json");
        assert_eq!(resp.as_str(), r#"{"status":"error","message":"Invalid JSON"}"#);
    }

    #[test]
    fn echo_returns_params_verbatim() {
        let d = Dispatcher::<CountingContext>::with_builtin_methods();
        let mut ctx = CountingContext::default();
        let resp = d.handle_line(&mut ctx, r#"{"method":"echo","params":{"a":1}}"#);
        assert_eq!(resp.as_str(), r#"{"status":"ok","echo":{"a":1}}"#);
    }

    #[test]
    fn registering_same_name_twice_overwrites_not_duplicates() {
        let mut d = Dispatcher::<CountingContext>::new();
        fn h1<C: RpcContext>(_c: &mut C, _p: &str, _o: &mut Response) -> Result<(), DccError> {
            Ok(())
        }
        d.register("x", h1).unwrap();
        d.register("x", h1).unwrap();
        assert_eq!(d.len, 1);
    }

    #[test]
    fn cs_start_reaches_the_context() {
        let d = Dispatcher::<CountingContext>::with_builtin_methods();
        let mut ctx = CountingContext::default();
        let resp = d.handle_line(&mut ctx, r#"{"method":"command_station_start","params":{"loop":1}}"#);
        assert_eq!(resp.as_str(), r#"{"status":"ok"}"#);
        assert_eq!(ctx.starts, 1);
    }
}

//! Built-in method table (§4.G / §6): one typed `Params` struct plus one handler per RPC method,
//! registered into a [`Dispatcher`] by [`register_all`].
use serde::Deserialize;

use crate::DccError;
use crate::hw::DateTime;

use super::{Dispatcher, RPC_RESPONSE_CAP, Response, RpcContext, TimingConfigPatch};

fn parse<'a, T: Deserialize<'a>>(params: &'a str) -> Result<T, DccError> {
    serde_json_core::from_str::<T>(params)
        .map(|(v, _)| v)
        .map_err(|_| DccError::Malformed)
}

fn handle_echo<C: RpcContext>(_ctx: &mut C, params: &str, out: &mut Response) -> Result<(), DccError> {
    out.field_raw("echo", params)
}

#[derive(Deserialize)]
struct LoopParams {
    #[serde(rename = "loop")]
    loop_mode: u8,
}

fn handle_cs_start<C: RpcContext>(ctx: &mut C, params: &str, _out: &mut Response) -> Result<(), DccError> {
    let p: LoopParams = parse(params)?;
    ctx.cs_start(p.loop_mode)
}

fn handle_cs_stop<C: RpcContext>(ctx: &mut C, _params: &str, _out: &mut Response) -> Result<(), DccError> {
    ctx.cs_stop()
}

#[derive(Deserialize)]
struct LoadPacketParams {
    bytes: heapless::Vec<u8, 5>,
}

fn handle_cs_load_packet<C: RpcContext>(ctx: &mut C, params: &str, out: &mut Response) -> Result<(), DccError> {
    let p: LoadPacketParams = parse(params)?;
    if p.bytes.is_empty() {
        return Err(DccError::InvalidArgument);
    }
    let len = ctx.cs_load_packet(&p.bytes)?;
    out.field_u64("length", len as u64)
}

#[derive(Deserialize)]
struct TransmitPacketParams {
    #[serde(default = "default_count")]
    count: u32,
    #[serde(default = "default_delay_ms")]
    delay_ms: u32,
}
fn default_count() -> u32 {
    1
}
fn default_delay_ms() -> u32 {
    100
}

fn handle_cs_transmit_packet<C: RpcContext>(ctx: &mut C, params: &str, _out: &mut Response) -> Result<(), DccError> {
    let p: TransmitPacketParams = parse(params)?;
    ctx.cs_transmit_packet(p.count, p.delay_ms)
}

#[derive(Deserialize, Default)]
struct CsParamsPatch {
    #[serde(default)]
    num_preamble: Option<u8>,
    #[serde(default)]
    bit1_duration_us: Option<u8>,
    #[serde(default)]
    bit0_duration_us: Option<u8>,
    #[serde(default)]
    bidi_enable: Option<bool>,
    #[serde(default)]
    trigger_first_bit: Option<bool>,
}

impl From<CsParamsPatch> for TimingConfigPatch {
    fn from(p: CsParamsPatch) -> Self {
        TimingConfigPatch {
            num_preamble: p.num_preamble,
            bit1_duration_us: p.bit1_duration_us,
            bit0_duration_us: p.bit0_duration_us,
            bidi_enable: p.bidi_enable,
            trigger_first_bit: p.trigger_first_bit,
        }
    }
}

fn handle_cs_params<C: RpcContext>(ctx: &mut C, params: &str, _out: &mut Response) -> Result<(), DccError> {
    let p: CsParamsPatch = parse(params)?;
    ctx.timing_apply_patch(p.into())
}

fn handle_cs_get_params<C: RpcContext>(ctx: &mut C, _params: &str, out: &mut Response) -> Result<(), DccError> {
    let cfg = ctx.timing_get_config();
    let (mask, delta_p, delta_n) = ctx.override_snapshot();
    out.field_u64("num_preamble", u64::from(cfg.num_preamble))?;
    out.field_u64("bit1_duration_us", u64::from(cfg.bit1_duration_us))?;
    out.field_u64("bit0_duration_us", u64::from(cfg.bit0_duration_us))?;
    out.field_bool("bidi_enable", cfg.bidi_enable)?;
    out.field_bool("trigger_first_bit", cfg.trigger_first_bit)?;
    out.field_u64("bidi_dac", u64::from(cfg.bidi_dac.value()))?;
    out.field_u64("zerobit_override_mask", mask)?;
    out.field_i64("zerobit_deltaP", i64::from(delta_p))?;
    out.field_i64("zerobit_deltaN", i64::from(delta_n))?;
    out.field_bool("transmit_overflow", ctx.cs_take_transmit_overflow())?;
    Ok(())
}

#[derive(Deserialize)]
struct OverrideParams {
    zerobit_override_mask: u64,
    #[serde(rename = "zerobit_deltaP")]
    zerobit_delta_p: i32,
    #[serde(rename = "zerobit_deltaN")]
    zerobit_delta_n: i32,
}

fn handle_cs_packet_override<C: RpcContext>(ctx: &mut C, params: &str, _out: &mut Response) -> Result<(), DccError> {
    let p: OverrideParams = parse(params)?;
    ctx.override_set(p.zerobit_override_mask, p.zerobit_delta_p, p.zerobit_delta_n);
    Ok(())
}

fn handle_cs_packet_reset_override<C: RpcContext>(ctx: &mut C, _params: &str, _out: &mut Response) -> Result<(), DccError> {
    ctx.override_reset();
    Ok(())
}

fn handle_decoder_start<C: RpcContext>(ctx: &mut C, _params: &str, _out: &mut Response) -> Result<(), DccError> {
    ctx.decoder_start()
}

fn handle_decoder_stop<C: RpcContext>(ctx: &mut C, _params: &str, _out: &mut Response) -> Result<(), DccError> {
    ctx.decoder_stop()
}

fn handle_parameters_save<C: RpcContext>(ctx: &mut C, _params: &str, _out: &mut Response) -> Result<(), DccError> {
    ctx.parameters_save()
}

fn handle_parameters_restore<C: RpcContext>(ctx: &mut C, _params: &str, _out: &mut Response) -> Result<(), DccError> {
    ctx.parameters_restore()
}

fn handle_parameters_factory_reset<C: RpcContext>(ctx: &mut C, _params: &str, _out: &mut Response) -> Result<(), DccError> {
    ctx.parameters_factory_reset()
}

#[derive(Deserialize, Default)]
struct AnalogParams {
    #[serde(default)]
    num_samples: Option<u16>,
    #[serde(default)]
    sample_delay_ms: Option<u32>,
}

fn parse_analog(params: &str) -> Result<AnalogParams, DccError> {
    if params.trim() == "null" {
        return Ok(AnalogParams::default());
    }
    let p: AnalogParams = parse(params)?;
    if p.num_samples == Some(0) {
        return Err(DccError::InvalidArgument);
    }
    Ok(p)
}

fn handle_get_voltage_feedback_mv<C: RpcContext>(ctx: &mut C, params: &str, out: &mut Response) -> Result<(), DccError> {
    let p = parse_analog(params)?;
    let mv = ctx.voltage_feedback_mv(p.num_samples, p.sample_delay_ms)?;
    out.field_u64("value", u64::from(mv))
}

fn handle_get_current_feedback_ma<C: RpcContext>(ctx: &mut C, params: &str, out: &mut Response) -> Result<(), DccError> {
    let p = parse_analog(params)?;
    let ma = ctx.current_feedback_ma(p.num_samples, p.sample_delay_ms)?;
    out.field_u64("value", u64::from(ma))
}

#[derive(Deserialize)]
struct GpioPinParams {
    pin: u8,
}

fn check_pin(pin: u8) -> Result<(), DccError> {
    if (1..=16).contains(&pin) {
        Ok(())
    } else {
        Err(DccError::InvalidArgument)
    }
}

fn handle_get_gpio_input<C: RpcContext>(ctx: &mut C, params: &str, out: &mut Response) -> Result<(), DccError> {
    let p: GpioPinParams = parse(params)?;
    check_pin(p.pin)?;
    let value = ctx.gpio_get_input(p.pin)?;
    out.field_bool("value", value)
}

fn handle_get_gpio_inputs<C: RpcContext>(ctx: &mut C, _params: &str, out: &mut Response) -> Result<(), DccError> {
    out.field_u64("value", u64::from(ctx.gpio_get_inputs()))
}

fn handle_configure_gpio_output<C: RpcContext>(ctx: &mut C, params: &str, _out: &mut Response) -> Result<(), DccError> {
    let p: GpioPinParams = parse(params)?;
    check_pin(p.pin)?;
    ctx.gpio_configure_output(p.pin)
}

#[derive(Deserialize)]
struct GpioSetParams {
    pin: u8,
    state: u8,
}

fn handle_set_gpio_output<C: RpcContext>(ctx: &mut C, params: &str, _out: &mut Response) -> Result<(), DccError> {
    let p: GpioSetParams = parse(params)?;
    check_pin(p.pin)?;
    if p.state > 1 {
        return Err(DccError::InvalidArgument);
    }
    ctx.gpio_set_output(p.pin, p.state != 0)
}

fn handle_get_rtc_datetime<C: RpcContext>(ctx: &mut C, _params: &str, out: &mut Response) -> Result<(), DccError> {
    let dt = ctx.rtc_get();
    out.field_u64("year", u64::from(dt.year))?;
    out.field_u64("month", u64::from(dt.month))?;
    out.field_u64("day", u64::from(dt.day))?;
    out.field_u64("hour", u64::from(dt.hour))?;
    out.field_u64("minute", u64::from(dt.minute))?;
    out.field_u64("second", u64::from(dt.second))
}

#[derive(Deserialize)]
struct RtcSetParams {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
}

fn handle_set_rtc_datetime<C: RpcContext>(ctx: &mut C, params: &str, _out: &mut Response) -> Result<(), DccError> {
    let p: RtcSetParams = parse(params)?;
    if p.month == 0 || p.month > 12 || p.day == 0 || p.day > 31 || p.hour > 23 || p.minute > 59 || p.second > 59 {
        return Err(DccError::InvalidArgument);
    }
    ctx.rtc_set(DateTime {
        year: p.year,
        month: p.month,
        day: p.day,
        hour: p.hour,
        minute: p.minute,
        second: p.second,
    })
}

fn handle_system_reboot<C: RpcContext>(ctx: &mut C, _params: &str, _out: &mut Response) -> Result<(), DccError> {
    ctx.request_reboot();
    Ok(())
}

/// Register every built-in method name onto `d`.
pub(super) fn register_all<C: RpcContext>(d: &mut Dispatcher<C>) -> Result<(), DccError> {
    d.register("echo", handle_echo)?;
    d.register("command_station_start", handle_cs_start)?;
    d.register("command_station_stop", handle_cs_stop)?;
    d.register("command_station_load_packet", handle_cs_load_packet)?;
    d.register("command_station_transmit_packet", handle_cs_transmit_packet)?;
    d.register("command_station_params", handle_cs_params)?;
    d.register("command_station_get_params", handle_cs_get_params)?;
    d.register("command_station_packet_override", handle_cs_packet_override)?;
    d.register("command_station_packet_reset_override", handle_cs_packet_reset_override)?;
    d.register("decoder_start", handle_decoder_start)?;
    d.register("decoder_stop", handle_decoder_stop)?;
    d.register("parameters_save", handle_parameters_save)?;
    d.register("parameters_restore", handle_parameters_restore)?;
    d.register("parameters_factory_reset", handle_parameters_factory_reset)?;
    d.register("get_voltage_feedback_mv", handle_get_voltage_feedback_mv)?;
    d.register("get_current_feedback_ma", handle_get_current_feedback_ma)?;
    d.register("get_gpio_input", handle_get_gpio_input)?;
    d.register("get_gpio_inputs", handle_get_gpio_inputs)?;
    d.register("configure_gpio_output", handle_configure_gpio_output)?;
    d.register("set_gpio_output", handle_set_gpio_output)?;
    d.register("get_rtc_datetime", handle_get_rtc_datetime)?;
    d.register("set_rtc_datetime", handle_set_rtc_datetime)?;
    d.register("system_reboot", handle_system_reboot)?;
    Ok(())
}

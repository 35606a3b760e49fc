//! Transport Adapter (§4.I): frames an `embedded_io::Read + embedded_io::Write` byte stream into
//! RPC request/response lines.
//!
//! A thin wrapper around a single owned I/O handle, generic over `embedded_io` rather than a
//! chip-specific peripheral, so the same adapter runs over a real UART/USB-CDC link or the
//! loopback double in this module's tests.
use embedded_io::{Read, Write};
use heapless::Vec;

use crate::DccError;
use crate::rpc::{Dispatcher, RpcContext};

/// Hard cap on a single buffered request line, including its terminator.
pub const RPC_RX_BUFFER_SIZE: usize = 2048;

/// Buffers inbound bytes into lines and drives the RPC dispatcher over them.
///
/// Holds no reference to the dispatcher or context; those are passed to [`Self::poll`] each call
/// so one `Transport` can be reused across dispatcher swaps (e.g. test stubs) without re-wiring.
pub struct Transport<IO> {
    io: IO,
    rx: Vec<u8, RPC_RX_BUFFER_SIZE>,
    overflow_drops: u32,
}

impl<IO: Read + Write> Transport<IO> {
    pub fn new(io: IO) -> Self {
        Transport {
            io,
            rx: Vec::new(),
            overflow_drops: 0,
        }
    }

    /// Number of lines dropped for exceeding [`RPC_RX_BUFFER_SIZE`] before a terminator appeared.
    pub fn overflow_drops(&self) -> u32 {
        self.overflow_drops
    }

    /// Read whatever bytes are currently available, process any complete lines they form, and
    /// write back one response per line. Returns the number of requests handled.
    ///
    /// A read error is treated as "nothing available right now" (mirrors a non-blocking UART
    /// RX path) rather than propagated, since there is no request in flight to fail.
    pub fn poll<C: RpcContext>(&mut self, dispatcher: &Dispatcher<C>, ctx: &mut C) -> usize {
        let mut chunk = [0u8; 128];
        let n = match self.io.read(&mut chunk) {
            Ok(n) => n,
            Err(_) => 0,
        };
        let mut handled = 0;
        for &byte in &chunk[..n] {
            if byte == b'\n' {
                handled += self.handle_buffered_line(dispatcher, ctx);
                continue;
            }
            if byte == b'\r' {
                // Swallowed; the following `\n` (if any) ends the line. A bare `\r` with no
                // following `\n` is just part of the line like any other byte.
                continue;
            }
            if self.rx.push(byte).is_err() {
                self.overflow_drops += 1;
                self.rx.clear();
            }
        }
        handled
    }

    fn handle_buffered_line<C: RpcContext>(&mut self, dispatcher: &Dispatcher<C>, ctx: &mut C) -> usize {
        let line = core::str::from_utf8(&self.rx).unwrap_or("");
        let response = dispatcher.handle_line(ctx, line);
        self.rx.clear();
        let _ = self.io.write_all(response.as_bytes());
        let _ = self.io.write_all(b"\r\n");
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::DateTime;
    use crate::rpc::TimingConfigPatch;
    use crate::timing::TimingConfig;

    /// An in-memory `Read + Write` double: a fixed inbound byte source plus a growable outbound
    /// sink, standing in for a real UART/USB-CDC link.
    struct LoopbackIo {
        inbound: std::vec::Vec<u8>,
        cursor: usize,
        outbound: std::vec::Vec<u8>,
    }
    impl embedded_io::ErrorType for LoopbackIo {
        type Error = core::convert::Infallible;
    }
    impl Read for LoopbackIo {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let remaining = &self.inbound[self.cursor..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.cursor += n;
            Ok(n)
        }
    }
    impl Write for LoopbackIo {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct NullContext;
    impl RpcContext for NullContext {
        fn cs_start(&mut self, _loop_mode: u8) -> Result<(), DccError> {
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
            Ok(0)
        }
        fn current_feedback_ma(&mut self, _n: Option<u16>, _d: Option<u32>) -> Result<u32, DccError> {
            Ok(0)
        }
        fn gpio_configure_output(&mut self, _pin: u8) -> Result<(), DccError> {
            Ok(())
        }
        fn gpio_set_output(&mut self, _pin: u8, _state: bool) -> Result<(), DccError> {
            Ok(())
        }
        fn gpio_get_input(&self, _pin: u8) -> Result<bool, DccError> {
            Ok(false)
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
    fn bare_lf_frames_one_request() {
        let io = LoopbackIo {
            inbound: std::vec::Vec::from(*b"{\"method\":\"echo\",\"params\":1}\n"),
            cursor: 0,
            outbound: std::vec::Vec::new(),
        };
        let dispatcher = Dispatcher::<NullContext>::with_builtin_methods();
        let mut ctx = NullContext;
        let mut t = Transport::new(io);
        let handled = t.poll(&dispatcher, &mut ctx);
        assert_eq!(handled, 1);
        assert_eq!(t.io.outbound, b"{\"status\":\"ok\",\"echo\":1}\r\n");
    }

    #[test]
    fn crlf_is_treated_as_one_terminator() {
        let io = LoopbackIo {
            inbound: std::vec::Vec::from(*b"{\"method\":\"echo\",\"params\":2}\r\n"),
            cursor: 0,
            outbound: std::vec::Vec::new(),
        };
        let dispatcher = Dispatcher::<NullContext>::with_builtin_methods();
        let mut ctx = NullContext;
        let mut t = Transport::new(io);
        assert_eq!(t.poll(&dispatcher, &mut ctx), 1);
        assert_eq!(t.io.outbound, b"{\"status\":\"ok\",\"echo\":2}\r\n");
    }

    #[test]
    fn two_frames_in_one_chunk_both_dispatch() {
        let io = LoopbackIo {
            inbound: std::vec::Vec::from(
                *b"{\"method\":\"echo\",\"params\":1}\n{\"method\":\"echo\",\"params\":2}\n",
            ),
            cursor: 0,
            outbound: std::vec::Vec::new(),
        };
        let dispatcher = Dispatcher::<NullContext>::with_builtin_methods();
        let mut ctx = NullContext;
        let mut t = Transport::new(io);
        assert_eq!(t.poll(&dispatcher, &mut ctx), 2);
    }

    #[test]
    fn oversized_line_is_dropped_and_counted() {
        let total_len = RPC_RX_BUFFER_SIZE + 18;
        let mut inbound = std::vec::Vec::from(*b"{\"method\":\"echo\",\"params\":");
        inbound.extend(std::iter::repeat(b'1').take(RPC_RX_BUFFER_SIZE + 16));
        inbound.extend_from_slice(b"}\n");
        assert_eq!(inbound.len(), total_len);
        let io = LoopbackIo {
            inbound,
            cursor: 0,
            outbound: std::vec::Vec::new(),
        };
        let dispatcher = Dispatcher::<NullContext>::with_builtin_methods();
        let mut ctx = NullContext;
        let mut t = Transport::new(io);
        // Each poll() reads at most a 128-byte chunk; enough calls to drain everything.
        for _ in 0..(total_len / 128 + 2) {
            t.poll(&dispatcher, &mut ctx);
        }
        assert!(t.overflow_drops() >= 1);
    }
}

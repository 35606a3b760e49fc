//! Minimal JSON plumbing for the line-framed RPC protocol.
//!
//! `no_std` JSON with arbitrary passthrough (`echo`) doesn't fit a single typed `Value` without
//! an allocator, so request parsing is split in two: [`scan_envelope`] is a hand-rolled,
//! single-pass, string/brace/bracket-aware scanner that extracts the raw `method` and `params`
//! substrings from the top-level object without interpreting either; each method handler then
//! deserializes its own typed `Params` struct out of that substring with `serde_json_core`.
//! Responses are built incrementally with [`JsonWriter`] rather than through a `Value` tree.
use core::fmt::Write as _;

use crate::DccError;

/// The `method`/`params` substrings of one request line, not yet interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub method: &'a str,
    /// Exactly the bytes of the JSON value that followed `"params":`, unparsed.
    pub params: &'a str,
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && matches!(bytes[i], b' ' | b'\t' | b'\n' | b'\r') {
        i += 1;
    }
    i
}

/// Return the index one past the end of the JSON value starting at `bytes[start]` (which must
/// not be whitespace). Handles nested objects/arrays and quoted strings with escapes; does not
/// otherwise validate number/bool/null syntax.
fn scan_value_end(bytes: &[u8], start: usize) -> Result<usize, DccError> {
    if start >= bytes.len() {
        return Err(DccError::InvalidJson);
    }
    match bytes[start] {
        b'{' | b'[' => {
            let (open, close) = if bytes[start] == b'{' {
                (b'{', b'}')
            } else {
                (b'[', b']')
            };
            let mut i = start;
            let mut depth = 0i32;
            let mut in_str = false;
            let mut escaped = false;
            loop {
                if i >= bytes.len() {
                    return Err(DccError::InvalidJson);
                }
                let c = bytes[i];
                if in_str {
                    if escaped {
                        escaped = false;
                    } else if c == b'\\' {
                        escaped = true;
                    } else if c == b'"' {
                        in_str = false;
                    }
                } else if c == b'"' {
                    in_str = true;
                } else if c == open {
                    depth += 1;
                } else if c == close {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                i += 1;
            }
            Ok(i)
        }
        b'"' => {
            let mut i = start + 1;
            let mut escaped = false;
            loop {
                if i >= bytes.len() {
                    return Err(DccError::InvalidJson);
                }
                let c = bytes[i];
                if escaped {
                    escaped = false;
                } else if c == b'\\' {
                    escaped = true;
                } else if c == b'"' {
                    i += 1;
                    break;
                }
                i += 1;
            }
            Ok(i)
        }
        _ => {
            let mut i = start;
            while i < bytes.len() && !matches!(bytes[i], b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r') {
                i += 1;
            }
            if i == start {
                return Err(DccError::InvalidJson);
            }
            Ok(i)
        }
    }
}

/// Scan a top-level `{"method": ..., "params": ...}` object (key order and extra keys allowed)
/// and return the raw substrings of the `method` and `params` values.
pub fn scan_envelope(line: &str) -> Result<Envelope<'_>, DccError> {
    let bytes = line.as_bytes();
    let mut i = skip_ws(bytes, 0);
    if i >= bytes.len() || bytes[i] != b'{' {
        return Err(DccError::InvalidJson);
    }
    i += 1;

    let mut method: Option<&str> = None;
    let mut params: Option<&str> = None;

    loop {
        i = skip_ws(bytes, i);
        if i >= bytes.len() {
            return Err(DccError::InvalidJson);
        }
        if bytes[i] == b'}' {
            i += 1;
            break;
        }
        if bytes[i] != b'"' {
            return Err(DccError::InvalidJson);
        }
        let key_start = i;
        let key_end = scan_value_end(bytes, key_start)?;
        let key = &line[key_start + 1..key_end - 1];

        i = skip_ws(bytes, key_end);
        if i >= bytes.len() || bytes[i] != b':' {
            return Err(DccError::InvalidJson);
        }
        i = skip_ws(bytes, i + 1);
        let val_start = i;
        let val_end = scan_value_end(bytes, val_start)?;
        let value = &line[val_start..val_end];

        match key {
            "method" => method = Some(value),
            "params" => params = Some(value),
            _ => {}
        }

        i = skip_ws(bytes, val_end);
        match bytes.get(i) {
            Some(b',') => {
                i += 1;
            }
            Some(b'}') => {
                i += 1;
                break;
            }
            _ => return Err(DccError::InvalidJson),
        }
    }

    let method_raw = method.ok_or(DccError::Malformed)?;
    let params_raw = params.ok_or(DccError::Malformed)?;
    if method_raw.len() < 2 || !method_raw.starts_with('"') || !method_raw.ends_with('"') {
        return Err(DccError::MethodNotString);
    }
    Ok(Envelope {
        method: &method_raw[1..method_raw.len() - 1],
        params: params_raw,
    })
}

fn write_json_string<const N: usize>(buf: &mut heapless::String<N>, s: &str) -> Result<(), DccError> {
    buf.push('"').map_err(|_| DccError::InvalidArgument)?;
    for c in s.chars() {
        match c {
            '"' => buf.push_str("\\\"").map_err(|_| DccError::InvalidArgument)?,
            '\\' => buf.push_str("\\\\").map_err(|_| DccError::InvalidArgument)?,
            _ => buf.push(c).map_err(|_| DccError::InvalidArgument)?,
        }
    }
    buf.push('"').map_err(|_| DccError::InvalidArgument)
}

/// Incrementally builds one JSON response object into a fixed-capacity `heapless::String`.
pub struct JsonWriter<const N: usize> {
    buf: heapless::String<N>,
    wrote_field: bool,
}

impl<const N: usize> JsonWriter<N> {
    pub fn new() -> Self {
        let mut buf = heapless::String::new();
        let _ = buf.push('{');
        JsonWriter {
            buf,
            wrote_field: false,
        }
    }

    /// A response pre-seeded with `"status":"ok"`; handlers add their own fields and call
    /// [`Self::finish`].
    pub fn ok() -> Self {
        let mut w = Self::new();
        w.field_str("status", "ok").expect("fits: short literal");
        w
    }

    /// Build a complete `{"status":"error","message":"..."}` response in one call.
    pub fn error(err: DccError) -> heapless::String<N> {
        let mut w = Self::new();
        w.field_str("status", "error").expect("fits: short literal");
        w.field_str("message", err.message()).expect("fits: short literal");
        w.finish()
    }

    fn before_field(&mut self) -> Result<(), DccError> {
        if self.wrote_field {
            self.buf.push(',').map_err(|_| DccError::InvalidArgument)?;
        }
        self.wrote_field = true;
        Ok(())
    }

    pub fn field_str(&mut self, key: &str, value: &str) -> Result<(), DccError> {
        self.before_field()?;
        write_json_string(&mut self.buf, key)?;
        self.buf.push(':').map_err(|_| DccError::InvalidArgument)?;
        write_json_string(&mut self.buf, value)
    }

    pub fn field_bool(&mut self, key: &str, value: bool) -> Result<(), DccError> {
        self.before_field()?;
        write_json_string(&mut self.buf, key)?;
        self.buf.push(':').map_err(|_| DccError::InvalidArgument)?;
        self.buf
            .push_str(if value { "true" } else { "false" })
            .map_err(|_| DccError::InvalidArgument)
    }

    pub fn field_u64(&mut self, key: &str, value: u64) -> Result<(), DccError> {
        self.before_field()?;
        write_json_string(&mut self.buf, key)?;
        self.buf.push(':').map_err(|_| DccError::InvalidArgument)?;
        write!(self.buf, "{value}").map_err(|_| DccError::InvalidArgument)
    }

    pub fn field_i64(&mut self, key: &str, value: i64) -> Result<(), DccError> {
        self.before_field()?;
        write_json_string(&mut self.buf, key)?;
        self.buf.push(':').map_err(|_| DccError::InvalidArgument)?;
        write!(self.buf, "{value}").map_err(|_| DccError::InvalidArgument)
    }

    /// Write `key: <raw>` with `raw` copied verbatim (already-valid JSON), used for `echo`.
    pub fn field_raw(&mut self, key: &str, raw: &str) -> Result<(), DccError> {
        self.before_field()?;
        write_json_string(&mut self.buf, key)?;
        self.buf.push(':').map_err(|_| DccError::InvalidArgument)?;
        self.buf.push_str(raw).map_err(|_| DccError::InvalidArgument)
    }

    pub fn finish(mut self) -> heapless::String<N> {
        let _ = self.buf.push('}');
        self.buf
    }
}

impl<const N: usize> Default for JsonWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

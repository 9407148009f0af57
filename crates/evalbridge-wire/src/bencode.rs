//! Bencode: the length-prefixed binary encoding spoken on the wire.
//!
//! Four value kinds: byte-strings (`<len>:<bytes>`), integers (`i<n>e`),
//! lists (`l…e`) and dictionaries (`d…e`, byte-string keys). There is no
//! float and no null.
//!
//! The decoder is a single-pass reader with one byte of lookahead. It can run
//! over a partially received buffer: [`decode_prefix`] reports "need more
//! bytes" separately from a framing violation, which lets a socket reader
//! keep accumulating until a whole frame is present.

use crate::frame::WireError;
use std::collections::BTreeMap;
use std::fmt;

/// Deepest list/dict nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

/// Longest integer literal (sign included) accepted by the decoder.
const MAX_INT_DIGITS: usize = 20;

/// Longest string length prefix accepted by the decoder.
const MAX_LEN_DIGITS: usize = 19;

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WireValue {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<WireValue>),
    /// Keys are unique and kept sorted, which is also the encoding order.
    Dict(BTreeMap<Vec<u8>, WireValue>),
}

impl WireValue {
    /// Build a dict from string keys.
    pub fn dict<K, I>(entries: I) -> Self
    where
        K: Into<Vec<u8>>,
        I: IntoIterator<Item = (K, WireValue)>,
    {
        WireValue::Dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WireValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte-string contents, if they are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            WireValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, WireValue>> {
        match self {
            WireValue::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key when this value is a dict.
    pub fn get(&self, key: &str) -> Option<&WireValue> {
        self.as_dict().and_then(|m| m.get(key.as_bytes()))
    }

    /// Look up a key and read it as UTF-8 text.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(WireValue::as_str)
    }

    /// Whether `key` holds a list containing the string `token`.
    pub fn list_contains(&self, key: &str, token: &str) -> bool {
        self.get(key)
            .and_then(WireValue::as_list)
            .map(|items| items.iter().any(|v| v.as_bytes() == Some(token.as_bytes())))
            .unwrap_or(false)
    }

    /// Insert or replace a dict entry. No-op on non-dict values.
    pub fn insert(&mut self, key: &str, value: WireValue) {
        if let WireValue::Dict(map) = self {
            map.insert(key.as_bytes().to_vec(), value);
        }
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::Bytes(s.into_bytes())
    }
}

impl From<&[u8]> for WireValue {
    fn from(b: &[u8]) -> Self {
        WireValue::Bytes(b.to_vec())
    }
}

impl From<i64> for WireValue {
    fn from(n: i64) -> Self {
        WireValue::Int(n)
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(items: Vec<WireValue>) -> Self {
        WireValue::List(items)
    }
}

impl From<Vec<String>> for WireValue {
    fn from(items: Vec<String>) -> Self {
        WireValue::List(items.into_iter().map(WireValue::from).collect())
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            WireValue::Int(n) => write!(f, "{n}"),
            WireValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            WireValue::Dict(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}: {v}", String::from_utf8_lossy(k))?;
                }
                f.write_str("}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a value to bytes.
pub fn encode(value: &WireValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Append the encoding of `value` to `out`.
pub fn encode_into(value: &WireValue, out: &mut Vec<u8>) {
    match value {
        WireValue::Bytes(b) => encode_bytes(b, out),
        WireValue::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        WireValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        WireValue::Dict(map) => {
            out.push(b'd');
            for (key, item) in map {
                encode_bytes(key, out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Why a decode stopped.
#[derive(Debug)]
enum DecodeError {
    /// Input ended inside a value; more bytes may complete it.
    Incomplete(String),
    /// The input can never become a valid value.
    Malformed(String),
}

type DecodeResult<T> = Result<T, DecodeError>;

/// Single-pass reader over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            depth: 0,
        }
    }

    /// Look at the next byte without consuming it.
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn next_byte(&mut self, context: &str) -> DecodeResult<u8> {
        let b = self
            .peek()
            .ok_or_else(|| DecodeError::Incomplete(format!("input ended inside {context}")))?;
        self.pos += 1;
        Ok(b)
    }

    fn value(&mut self) -> DecodeResult<WireValue> {
        let tag = self
            .peek()
            .ok_or_else(|| DecodeError::Incomplete("input ended before a value".into()))?;
        match tag {
            b'i' => {
                self.pos += 1;
                self.integer().map(WireValue::Int)
            }
            b'l' => {
                self.pos += 1;
                self.enter()?;
                let mut items = Vec::new();
                while self.at_terminator("list")? {
                    items.push(self.value()?);
                }
                self.depth -= 1;
                Ok(WireValue::List(items))
            }
            b'd' => {
                self.pos += 1;
                self.enter()?;
                let mut map = BTreeMap::new();
                while self.at_terminator("dict")? {
                    let key_at = self.pos;
                    match self.peek() {
                        Some(b'0'..=b'9') => {}
                        Some(other) => {
                            return Err(DecodeError::Malformed(format!(
                                "dict key at offset {key_at} is not a byte-string (found 0x{other:02x})"
                            )))
                        }
                        None => unreachable!("at_terminator saw a byte"),
                    }
                    let key = self.bytes()?;
                    let item = self.value()?;
                    if map.insert(key, item).is_some() {
                        return Err(DecodeError::Malformed(format!(
                            "duplicate dict key at offset {key_at}"
                        )));
                    }
                }
                self.depth -= 1;
                Ok(WireValue::Dict(map))
            }
            b'0'..=b'9' => self.bytes().map(WireValue::Bytes),
            other => Err(DecodeError::Malformed(format!(
                "unexpected byte 0x{other:02x} at offset {}",
                self.pos
            ))),
        }
    }

    fn enter(&mut self) -> DecodeResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(DecodeError::Malformed(format!(
                "nesting deeper than {MAX_DEPTH}"
            )));
        }
        Ok(())
    }

    /// Consume an `e` terminator if one is next. Returns true while more
    /// items follow.
    fn at_terminator(&mut self, context: &str) -> DecodeResult<bool> {
        match self.peek() {
            Some(b'e') => {
                self.pos += 1;
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Err(DecodeError::Incomplete(format!(
                "input ended inside {context} (missing terminator)"
            ))),
        }
    }

    /// `i` already consumed; reads digits through the closing `e`.
    fn integer(&mut self) -> DecodeResult<i64> {
        let start = self.pos;
        loop {
            let b = self.next_byte("integer")?;
            match b {
                b'e' => break,
                b'-' if self.pos - 1 == start => {}
                b'0'..=b'9' => {}
                other => {
                    return Err(DecodeError::Malformed(format!(
                        "invalid byte 0x{other:02x} in integer at offset {}",
                        self.pos - 1
                    )))
                }
            }
            if self.pos - start > MAX_INT_DIGITS {
                return Err(DecodeError::Malformed(format!(
                    "integer at offset {start} is too long"
                )));
            }
        }
        let text = &self.buf[start..self.pos - 1];
        let digits = text.strip_prefix(b"-").unwrap_or(text);
        if digits.is_empty() {
            return Err(DecodeError::Malformed(format!(
                "empty integer at offset {start}"
            )));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(DecodeError::Malformed(format!(
                "integer with leading zero at offset {start}"
            )));
        }
        if text == b"-0" {
            return Err(DecodeError::Malformed(format!(
                "negative zero at offset {start}"
            )));
        }
        // Only ASCII digits and one leading '-' reach this point.
        let text = std::str::from_utf8(text).unwrap_or_default();
        text.parse::<i64>().map_err(|_| {
            DecodeError::Malformed(format!("integer at offset {start} overflows i64"))
        })
    }

    /// Reads `<len>:<bytes>`; the first byte is known to be a digit.
    fn bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            let b = self.next_byte("string length")?;
            match b {
                b':' => break,
                b'0'..=b'9' => {
                    if self.pos - start > MAX_LEN_DIGITS {
                        return Err(DecodeError::Malformed(format!(
                            "string length at offset {start} is too long"
                        )));
                    }
                    len = len * 10 + usize::from(b - b'0');
                }
                other => {
                    return Err(DecodeError::Malformed(format!(
                        "invalid byte 0x{other:02x} in string length at offset {}",
                        self.pos - 1
                    )))
                }
            }
        }
        let prefix = &self.buf[start..self.pos - 1];
        if prefix.len() > 1 && prefix[0] == b'0' {
            return Err(DecodeError::Malformed(format!(
                "string length with leading zero at offset {start}"
            )));
        }
        let remaining = self.buf.len() - self.pos;
        if len > remaining {
            return Err(DecodeError::Incomplete(format!(
                "declared length {len} at offset {start} exceeds remaining {remaining} bytes"
            )));
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }
}

/// Decode exactly one value occupying the whole of `buf`.
///
/// Truncated input, a missing terminator, an inconsistent declared length,
/// and trailing bytes all fail with [`WireError::MalformedFrame`].
pub fn decode(buf: &[u8]) -> Result<WireValue, WireError> {
    let mut reader = Reader::new(buf);
    let value = reader.value().map_err(|e| match e {
        DecodeError::Incomplete(msg) | DecodeError::Malformed(msg) => {
            WireError::MalformedFrame(msg)
        }
    })?;
    if reader.pos != buf.len() {
        return Err(WireError::MalformedFrame(format!(
            "{} trailing bytes after value",
            buf.len() - reader.pos
        )));
    }
    Ok(value)
}

/// Decode one value from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` holds only part of a value, or the decoded
/// value with the number of bytes it occupied. Bytes past the value are left
/// for the next call.
pub fn decode_prefix(buf: &[u8]) -> Result<Option<(WireValue, usize)>, WireError> {
    let mut reader = Reader::new(buf);
    match reader.value() {
        Ok(value) => Ok(Some((value, reader.pos))),
        Err(DecodeError::Incomplete(_)) => Ok(None),
        Err(DecodeError::Malformed(msg)) => Err(WireError::MalformedFrame(msg)),
    }
}

/// Locates the end of the first value in a buffer that grows between calls.
///
/// Each byte is examined once, however many reads it takes for the frame to
/// arrive. Only structure is checked here: tags, nesting, and string lengths
/// against `max_len`. The located span still goes through [`decode`].
#[derive(Debug)]
pub struct FrameScanner {
    pos: usize,
    depth: usize,
    state: ScanState,
    max_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Expecting a value, or `e` inside a container.
    Value,
    /// Inside `i…e`, with the number of bytes seen so far.
    Int(usize),
    /// Inside a length prefix: the length so far and its digit count.
    Len(usize, usize),
    /// Skipping string content.
    Body(usize),
}

impl FrameScanner {
    /// Scanner that rejects any string declared longer than `max_len`.
    pub fn new(max_len: usize) -> Self {
        Self {
            pos: 0,
            depth: 0,
            state: ScanState::Value,
            max_len,
        }
    }

    /// Forget progress; call after the located frame is removed.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.depth = 0;
        self.state = ScanState::Value;
    }

    /// Continue over the bytes of `buf` not seen yet.
    ///
    /// `buf` must hold the same leading bytes as on the previous call. Returns
    /// the length of the first complete value once it is present.
    pub fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>, WireError> {
        while self.pos < buf.len() {
            if let ScanState::Body(remaining) = self.state {
                let take = remaining.min(buf.len() - self.pos);
                self.pos += take;
                if take < remaining {
                    self.state = ScanState::Body(remaining - take);
                    return Ok(None);
                }
                if let Some(end) = self.finish_value() {
                    return Ok(Some(end));
                }
                continue;
            }

            let at = self.pos;
            let b = buf[at];
            self.pos += 1;
            match (self.state, b) {
                (ScanState::Value, b'i') => self.state = ScanState::Int(0),
                (ScanState::Value, b'l' | b'd') => {
                    self.depth += 1;
                    if self.depth > MAX_DEPTH {
                        return Err(WireError::MalformedFrame(format!(
                            "nesting deeper than {MAX_DEPTH}"
                        )));
                    }
                }
                (ScanState::Value, b'0'..=b'9') => {
                    self.state = ScanState::Len(usize::from(b - b'0'), 1);
                }
                (ScanState::Value, b'e') if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Ok(Some(self.pos));
                    }
                }
                (ScanState::Int(_), b'e') => {
                    if let Some(end) = self.finish_value() {
                        return Ok(Some(end));
                    }
                }
                (ScanState::Int(seen), b'-' | b'0'..=b'9') if seen < MAX_INT_DIGITS => {
                    self.state = ScanState::Int(seen + 1);
                }
                (ScanState::Len(len, _), b':') => {
                    if len > self.max_len {
                        return Err(WireError::MessageTooLarge {
                            size: len,
                            max: self.max_len,
                        });
                    }
                    if len == 0 {
                        if let Some(end) = self.finish_value() {
                            return Ok(Some(end));
                        }
                    } else {
                        self.state = ScanState::Body(len);
                    }
                }
                (ScanState::Len(len, digits), b'0'..=b'9') if digits < MAX_LEN_DIGITS => {
                    let len = len.saturating_mul(10).saturating_add(usize::from(b - b'0'));
                    if len > self.max_len {
                        return Err(WireError::MessageTooLarge {
                            size: len,
                            max: self.max_len,
                        });
                    }
                    self.state = ScanState::Len(len, digits + 1);
                }
                (_, other) => {
                    return Err(WireError::MalformedFrame(format!(
                        "unexpected byte 0x{other:02x} at offset {at}"
                    )))
                }
            }
        }
        Ok(None)
    }

    fn finish_value(&mut self) -> Option<usize> {
        self.state = ScanState::Value;
        (self.depth == 0).then_some(self.pos)
    }
}

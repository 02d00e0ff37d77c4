//! Encoding and decoding of element payloads and wire artifacts.
//!
//! The raw value codec is kept separate from the windowed form: only the
//! split path needs the full envelope, and downstream consumers within the
//! worker exchange typed values without ever serializing.

use std::marker::PhantomData;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;

use crate::element::{WindowSet, WindowedValue};
use crate::errors::Error;
use crate::time::Instant;
use crate::window::{PaneInfo, PaneTiming, Window};

/// Conversions between typed values and bytes.
pub trait Codec<T> {
    /// Appends the binary representation of `value` to `bytes`.
    fn encode(&self, value: &T, bytes: &mut Vec<u8>) -> Result<(), Error>;
    /// Recovers a value from the front of `bytes`, advancing the slice past
    /// the consumed representation.
    fn decode(&self, bytes: &mut &[u8]) -> Result<T, Error>;
}

/// The default codec for any serde-serializable value.
#[derive(Debug)]
pub struct SerdeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    /// Creates the codec.
    pub fn new() -> Self {
        SerdeCodec { _marker: PhantomData }
    }
}

impl<T> Default for SerdeCodec<T> {
    fn default() -> Self {
        SerdeCodec::new()
    }
}

impl<T> Clone for SerdeCodec<T> {
    fn clone(&self) -> Self {
        SerdeCodec::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for SerdeCodec<T> {
    fn encode(&self, value: &T, bytes: &mut Vec<u8>) -> Result<(), Error> {
        bincode::serialize_into(&mut *bytes, value).map_err(Error::codec)
    }

    fn decode(&self, bytes: &mut &[u8]) -> Result<T, Error> {
        bincode::deserialize_from(bytes).map_err(Error::codec)
    }
}

/// Encodes a serde value into a fresh buffer.
pub fn encode_to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    bincode::serialize(value).map_err(Error::codec)
}

/// Decodes a serde value from a complete buffer.
pub fn decode_from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    bincode::deserialize(bytes).map_err(Error::codec)
}

/// The full windowed envelope around an inner value codec.
///
/// The layout is a fixed big-endian header (timestamp, window list, pane)
/// followed by the inner codec's representation of the value. Split
/// primaries and residuals travel in this form.
#[derive(Clone, Debug, Default)]
pub struct WindowedCodec<C> {
    value: C,
}

impl<C> WindowedCodec<C> {
    /// Wraps an inner value codec.
    pub fn new(value: C) -> Self {
        WindowedCodec { value }
    }
}

const WINDOW_GLOBAL: u8 = 0;
const WINDOW_INTERVAL: u8 = 1;

const PANE_FIRST: u8 = 0b01;
const PANE_LAST: u8 = 0b10;

fn encode_window(window: &Window, bytes: &mut Vec<u8>) -> Result<(), Error> {
    match *window {
        Window::Global => bytes.write_u8(WINDOW_GLOBAL).map_err(Error::codec),
        Window::Interval { start, end } => {
            bytes.write_u8(WINDOW_INTERVAL).map_err(Error::codec)?;
            bytes.write_i64::<BigEndian>(start.millis()).map_err(Error::codec)?;
            bytes.write_i64::<BigEndian>(end.millis()).map_err(Error::codec)
        }
    }
}

fn decode_window(bytes: &mut &[u8]) -> Result<Window, Error> {
    match bytes.read_u8().map_err(Error::codec)? {
        WINDOW_GLOBAL => Ok(Window::Global),
        WINDOW_INTERVAL => {
            let start = Instant::from_millis(bytes.read_i64::<BigEndian>().map_err(Error::codec)?);
            let end = Instant::from_millis(bytes.read_i64::<BigEndian>().map_err(Error::codec)?);
            Ok(Window::Interval { start, end })
        }
        tag => Err(Error::Codec(format!("unknown window tag {}", tag))),
    }
}

fn pane_timing_tag(timing: PaneTiming) -> u8 {
    match timing {
        PaneTiming::Early => 0,
        PaneTiming::OnTime => 1,
        PaneTiming::Late => 2,
        PaneTiming::Unknown => 3,
    }
}

fn pane_timing_from(tag: u8) -> Result<PaneTiming, Error> {
    match tag {
        0 => Ok(PaneTiming::Early),
        1 => Ok(PaneTiming::OnTime),
        2 => Ok(PaneTiming::Late),
        3 => Ok(PaneTiming::Unknown),
        tag => Err(Error::Codec(format!("unknown pane timing tag {}", tag))),
    }
}

impl<T, C: Codec<T>> Codec<WindowedValue<T>> for WindowedCodec<C> {
    fn encode(&self, value: &WindowedValue<T>, bytes: &mut Vec<u8>) -> Result<(), Error> {
        bytes.write_i64::<BigEndian>(value.timestamp.millis()).map_err(Error::codec)?;
        bytes.write_u32::<BigEndian>(value.windows.len() as u32).map_err(Error::codec)?;
        for window in &value.windows {
            encode_window(window, bytes)?;
        }
        bytes.write_u8(pane_timing_tag(value.pane.timing)).map_err(Error::codec)?;
        bytes.write_i64::<BigEndian>(value.pane.index).map_err(Error::codec)?;
        let flags = (value.pane.is_first as u8 * PANE_FIRST) | (value.pane.is_last as u8 * PANE_LAST);
        bytes.write_u8(flags).map_err(Error::codec)?;
        self.value.encode(&value.value, bytes)
    }

    fn decode(&self, bytes: &mut &[u8]) -> Result<WindowedValue<T>, Error> {
        let timestamp = Instant::from_millis(bytes.read_i64::<BigEndian>().map_err(Error::codec)?);
        let count = bytes.read_u32::<BigEndian>().map_err(Error::codec)?;
        let mut windows: WindowSet = SmallVec::with_capacity(count as usize);
        for _ in 0..count {
            windows.push(decode_window(bytes)?);
        }
        let timing = pane_timing_from(bytes.read_u8().map_err(Error::codec)?)?;
        let index = bytes.read_i64::<BigEndian>().map_err(Error::codec)?;
        let flags = bytes.read_u8().map_err(Error::codec)?;
        let pane = PaneInfo {
            timing,
            index,
            is_first: flags & PANE_FIRST != 0,
            is_last: flags & PANE_LAST != 0,
        };
        let value = self.value.decode(bytes)?;
        Ok(WindowedValue { value, timestamp, windows, pane })
    }
}

/// Encodes a slice of doubles as a length-prefixed big-endian iterable.
///
/// This is the payload format of the work-completed and work-remaining
/// progress metrics: a `u32` element count followed by IEEE-754 doubles.
pub fn encode_double_iterable(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + values.len() * 8);
    // Writes to a Vec cannot fail.
    bytes.write_u32::<BigEndian>(values.len() as u32).expect("write to Vec");
    for value in values {
        bytes.write_f64::<BigEndian>(*value).expect("write to Vec");
    }
    bytes
}

/// Decodes a length-prefixed big-endian double iterable.
pub fn decode_double_iterable(bytes: &mut &[u8]) -> Result<Vec<f64>, Error> {
    let count = bytes.read_u32::<BigEndian>().map_err(Error::codec)?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(bytes.read_f64::<BigEndian>().map_err(Error::codec)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::element::Restricted;

    #[test]
    fn windowed_round_trip() {
        let codec = WindowedCodec::new(SerdeCodec::<Restricted<String, (i64, i64), u64>>::new());
        let value = WindowedValue::new(
            Restricted {
                element: "abc".to_owned(),
                restriction: (0, 10),
                state: 4u64,
            },
            Instant::from_millis(10),
            smallvec![Window::interval(Instant::from_millis(0), Instant::from_millis(100))],
            PaneInfo::NO_FIRING,
        );

        let mut bytes = Vec::new();
        codec.encode(&value, &mut bytes).unwrap();
        let mut slice = &bytes[..];
        let decoded = codec.decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded, value);
    }

    #[test]
    fn double_iterable_golden_bytes() {
        let bytes = encode_double_iterable(&[1.0]);
        assert_eq!(
            bytes,
            vec![0, 0, 0, 1, 0x3f, 0xf0, 0, 0, 0, 0, 0, 0],
        );
        let mut slice = &bytes[..];
        assert_eq!(decode_double_iterable(&mut slice).unwrap(), vec![1.0]);
    }
}

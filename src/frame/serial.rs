//! Text encoding of protocol messages.
//!
//! Every datagram is exactly one chunk long. The payload is an ASCII record followed by NUL
//! padding:
//!
//! ```text
//! REQUEST  res:<u32> lrf:<u32> fr:<u32>
//! DATA     fn:<u32> pn:<u32>
//! ```

use std::io::Write;

use super::*;
use crate::error::{Error, Result};

/// Largest payload a single UDP datagram can carry.
pub const DATAGRAM_SIZE_MAX: usize = 65_507;

/// Length of the longest possible record, `res:4294967295 lrf:4294967295 fr:4294967295`.
pub const MESSAGE_TEXT_SIZE_MAX: usize = 43;

/// Smallest chunk size accepted by configuration. Leaves room for any record.
pub const CHUNK_SIZE_MIN: usize = 64;

const REQUEST_TAGS: [&str; 3] = ["res:", "lrf:", "fr:"];
const DATA_TAGS: [&str; 2] = ["fn:", "pn:"];

/// Writes `message` into `dst`, zero-filling the remainder. Returns the encoded datagram, which
/// spans the whole of `dst`.
///
/// Panics if `dst` cannot hold the record; configuration validation rules this out.
pub fn write<'a>(message: &Message, dst: &'a mut [u8]) -> &'a [u8] {
    assert!(
        dst.len() >= MESSAGE_TEXT_SIZE_MAX,
        "chunk buffer too small for message record"
    );

    dst.fill(0);

    let mut cursor = &mut dst[..];

    let res = match message {
        Message::Request(frame) => write!(
            cursor,
            "res:{} lrf:{} fr:{}",
            frame.resolution, frame.last_received_frame, frame.consumption_rate
        ),
        Message::Data(frame) => write!(cursor, "fn:{} pn:{}", frame.frame_index, frame.chunk_index),
    };

    debug_assert!(res.is_ok());

    dst
}

/// Allocates a chunk-sized datagram containing `message`.
pub fn write_boxed(message: &Message, chunk_size: usize) -> Box<[u8]> {
    let mut buffer = vec![0u8; chunk_size].into_boxed_slice();
    write(message, &mut buffer);
    buffer
}

/// Decodes a received datagram. Trailing padding is ignored.
pub fn read(bytes: &[u8]) -> Result<Message> {
    let text_len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());

    let text = std::str::from_utf8(&bytes[..text_len])
        .map_err(|_| Error::MalformedMessage("record is not ASCII".into()))?;

    if text.starts_with(REQUEST_TAGS[0]) {
        let [resolution, last_received_frame, consumption_rate] =
            read_fields(text, REQUEST_TAGS)?;

        Ok(Message::Request(RequestFrame {
            resolution,
            last_received_frame,
            consumption_rate,
        }))
    } else if text.starts_with(DATA_TAGS[0]) {
        let [frame_index, chunk_index] = read_fields(text, DATA_TAGS)?;

        Ok(Message::Data(DataFrame {
            frame_index,
            chunk_index,
        }))
    } else {
        Err(Error::MalformedMessage(format!(
            "unknown record {:?}",
            truncate(text)
        )))
    }
}

fn read_fields<const N: usize>(text: &str, tags: [&str; N]) -> Result<[u32; N]> {
    let mut parts = text.split(' ');
    let mut values = [0u32; N];

    for (value, tag) in values.iter_mut().zip(tags) {
        let part = parts
            .next()
            .ok_or_else(|| Error::MalformedMessage(format!("missing field {}", tag)))?;

        let digits = part.strip_prefix(tag).ok_or_else(|| {
            Error::MalformedMessage(format!("expected {} in {:?}", tag, truncate(part)))
        })?;

        // u32::from_str accepts a leading '+', the wire format does not
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedMessage(format!(
                "invalid {} value {:?}",
                tag,
                truncate(digits)
            )));
        }

        *value = digits
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("{} value out of range", tag)))?;
    }

    if parts.next().is_some() {
        return Err(Error::MalformedMessage("trailing fields".into()));
    }

    Ok(values)
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(32) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

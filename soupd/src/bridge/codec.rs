//! Netstring framing codec for the worker channels.
//!
//! Frames are `<decimal length>:<bytes>,`. Works over any AsyncRead/AsyncWrite
//! through `FramedRead` / `FramedWrite`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame the worker emits: 4 MiB payload plus the length header.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024 + 4;

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Head,
    Data(usize),
}

/// Codec that frames raw byte payloads as netstrings.
#[derive(Debug, Clone)]
pub struct NetstringCodec {
    max_length: usize,
    max_digits: usize,
    state: DecodeState,
}

impl Default for NetstringCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl NetstringCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            max_digits: max_length.to_string().len(),
            state: DecodeState::Head,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> io::Result<Option<usize>> {
        let Some(colon) = src.iter().take(self.max_digits + 1).position(|b| *b == b':') else {
            if src.len() > self.max_digits {
                return Err(invalid("netstring length prefix too long"));
            }
            return Ok(None);
        };

        let digits = &src[..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(invalid("netstring length prefix is not a decimal number"));
        }

        // All ASCII digits and at most max_digits long, so this cannot overflow usize.
        let len = digits
            .iter()
            .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));
        if len > self.max_length {
            return Err(invalid(format!(
                "netstring frame of {} bytes exceeds limit of {}",
                len, self.max_length
            )));
        }

        src.advance(colon + 1);
        Ok(Some(len))
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl Decoder for NetstringCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.state {
            DecodeState::Data(len) => len,
            DecodeState::Head => match self.decode_head(src)? {
                Some(len) => {
                    self.state = DecodeState::Data(len);
                    len
                }
                None => return Ok(None),
            },
        };

        // Payload plus the trailing comma.
        if src.len() < len + 1 {
            src.reserve(len + 1 - src.len());
            return Ok(None);
        }

        let data = src.split_to(len).freeze();
        let trailer = src.get_u8();
        self.state = DecodeState::Head;
        if trailer != b',' {
            return Err(invalid(format!(
                "netstring frame terminated by {:#04x} instead of ','",
                trailer
            )));
        }

        tracing::trace!(frame_len = len, "Decoded frame");
        Ok(Some(data))
    }
}

impl Encoder<Bytes> for NetstringCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        if len > self.max_length {
            return Err(invalid(format!(
                "netstring frame of {} bytes exceeds limit of {}",
                len, self.max_length
            )));
        }

        let head = format!("{}:", len);
        dst.reserve(head.len() + len + 1);
        dst.put_slice(head.as_bytes());
        dst.put_slice(&item);
        dst.put_u8(b',');
        Ok(())
    }
}

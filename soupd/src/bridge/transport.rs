//! Framed duplex transport handed to the peer.
//!
//! Read and write halves are boxed so the peer is independent of the underlying
//! stream (socketpairs in production, in-memory pipes in tests).

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::NetstringCodec;

pub type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, NetstringCodec>;
pub type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, NetstringCodec>;

pub struct Transport {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Transport {
    pub fn new<R, W>(read: R, write: W, max_frame_length: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let read: Box<dyn AsyncRead + Send + Unpin> = Box::new(read);
        let write: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write);
        Self {
            reader: FramedRead::new(read, NetstringCodec::new(max_frame_length)),
            writer: FramedWrite::new(write, NetstringCodec::new(max_frame_length)),
        }
    }

    pub fn into_parts(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
    use futures::{SinkExt, StreamExt};
    use tokio_util::bytes::Bytes;

    #[tokio::test]
    async fn frames_cross_the_transport() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let (_, mut a_writer) = Transport::new(a_read, a_write, DEFAULT_MAX_FRAME_LENGTH).into_parts();
        let (mut b_reader, _) = Transport::new(b_read, b_write, DEFAULT_MAX_FRAME_LENGTH).into_parts();

        a_writer.send(Bytes::from_static(b"first")).await.unwrap();
        a_writer.send(Bytes::from_static(b"second")).await.unwrap();

        assert_eq!(&b_reader.next().await.unwrap().unwrap()[..], b"first");
        assert_eq!(&b_reader.next().await.unwrap().unwrap()[..], b"second");

        drop(a_writer);
        assert!(b_reader.next().await.is_none());
    }
}

//! Body type used on both ends of a control connection

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use std::error::Error as StdError;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

/// Streaming body of every exchange on a control connection
pub type TunnelBody = UnsyncBoxBody<Bytes, io::Error>;

pub fn empty() -> TunnelBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> TunnelBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Stream everything `reader` yields until EOF
pub fn from_reader<R>(reader: R) -> TunnelBody
where
    R: AsyncRead + Send + 'static,
{
    StreamBody::new(ReaderStream::new(reader).map_ok(Frame::data)).boxed_unsync()
}

/// Box any body whose error converts into `io::Error`
pub fn boxed<B>(body: B) -> TunnelBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    body.map_err(io::Error::other).boxed_unsync()
}

/// Read a body's data frames as a byte stream; trailers are dropped
pub fn into_reader<B>(body: B) -> impl AsyncRead + Send + Unpin + 'static
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reader_body_round_trip() {
        let body = from_reader(&b"hello tunnel"[..]);
        let mut reader = into_reader(body);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello tunnel");
    }

    #[tokio::test]
    async fn test_empty_and_full() {
        assert!(empty().is_end_stream());

        let bytes = full("abc").collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"abc");
    }
}

use std::io;

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{ProtocolError, Result};
use crate::protocol::{OPERATIONS, Request, Response};

/// Upper bound on a single frame. Large enough for a sample read of a full
/// table at the default capacity.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

pub type Transport<T> = Framed<T, LengthDelimitedCodec>;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn transport<T: AsyncRead + AsyncWrite>(io: T) -> Transport<T> {
    Framed::new(io, codec())
}

async fn next_frame<S>(stream: &mut S) -> Result<Option<BytesMut>>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    match stream.next().await {
        Some(frame) => Ok(Some(frame?)),
        None => Ok(None),
    }
}

/// Sends the operation name frame followed by the encoded request.
pub async fn send_request<S>(sink: &mut S, request: &Request) -> Result<()>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    let body = bincode::serialize(request)?;
    sink.feed(Bytes::from_static(request.op_name().as_bytes()))
        .await?;
    sink.send(Bytes::from(body)).await?;
    Ok(())
}

/// Reads one request. `Ok(None)` means the peer closed the connection
/// between requests.
pub async fn recv_request<S>(stream: &mut S) -> Result<Option<Request>>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    let Some(name) = next_frame(stream).await? else {
        return Ok(None);
    };
    let name = String::from_utf8_lossy(&name).into_owned();
    if !OPERATIONS.contains(&name.as_str()) {
        return Err(ProtocolError::UnknownOperation(name));
    }

    let body = next_frame(stream).await?.ok_or(ProtocolError::Closed)?;
    let request: Request = bincode::deserialize(&body)?;
    if request.op_name() != name {
        return Err(ProtocolError::OperationMismatch {
            announced: name,
            actual: request.op_name(),
        });
    }
    Ok(Some(request))
}

pub async fn send_response<S>(sink: &mut S, response: &Response) -> Result<()>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    let body = bincode::serialize(response)?;
    sink.send(Bytes::from(body)).await?;
    Ok(())
}

pub async fn recv_response<S>(stream: &mut S) -> Result<Option<Response>>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    match next_frame(stream).await? {
        Some(body) => Ok(Some(bincode::deserialize(&body)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OpenFlags, Status};

    #[tokio::test]
    async fn test_request_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = transport(a);
        let mut server = transport(b);

        let req = Request::OpenFile {
            pathname: "/tmp/x".into(),
            flags: OpenFlags::CREATE | OpenFlags::LOCK,
        };
        send_request(&mut client, &req).await.unwrap();
        assert_eq!(recv_request(&mut server).await.unwrap(), Some(req));

        let resp = Response::error(Status::NotFound, "/tmp/x");
        send_response(&mut server, &resp).await.unwrap();
        assert_eq!(recv_response(&mut client).await.unwrap(), Some(resp));

        drop(client);
        assert_eq!(recv_request(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mismatched_name_is_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = transport(a);
        let mut server = transport(b);

        let body = bincode::serialize(&Request::ReadNFiles { n: 3 }).unwrap();
        client.feed(Bytes::from_static(b"removeFile")).await.unwrap();
        client.send(Bytes::from(body)).await.unwrap();
        assert!(matches!(
            recv_request(&mut server).await,
            Err(ProtocolError::OperationMismatch { actual: "readNFiles", .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_name_is_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = transport(a);
        let mut server = transport(b);

        client.send(Bytes::from_static(b"format")).await.unwrap();
        assert!(matches!(
            recv_request(&mut server).await,
            Err(ProtocolError::UnknownOperation(name)) if name == "format"
        ));
    }
}

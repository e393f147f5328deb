//! Line-oriented codec for bridge-helper communication.
//!
//! Frames one JSON value per newline-terminated line and assembles the
//! multi-line request/reply messages on top. Works over any
//! AsyncRead/AsyncWrite (child pipes, in-process duplex streams).
//!
//! Every complete message ends with an explicit flush: the peer reads
//! the pipe line-by-line and nothing buffers for it.

use std::io;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::bridge::protocol::{Reply, ReplyStatus, Request, pack_args};

/// Codec that frames with newlines and serializes each line with JSON.
///
/// Wraps `LinesCodec` and adds serde_json on top. JSON strings escape
/// embedded newlines, so one value never spans lines.
#[derive(Debug, Default)]
pub struct JsonLineCodec {
    inner: LinesCodec,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
        }
    }
}

fn into_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line length limit exceeded")
        }
        LinesCodecError::Io(e) => e,
    }
}

impl Decoder for JsonLineCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(into_io)? {
            Some(line) => {
                let value = serde_json::from_str(&line).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid JSON line {:?}: {}", line, e),
                    )
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src).map_err(into_io)? {
            Some(line) => {
                let value = serde_json::from_str(&line).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid JSON line {:?}: {}", line, e),
                    )
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Value> for JsonLineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(line_bytes = json.len(), "encoding line");
        self.inner.encode(json, dst).map_err(into_io)
    }
}

/// Read the next JSON line, `None` on clean end-of-stream.
pub async fn next_value<R>(reader: &mut FramedRead<R, JsonLineCodec>) -> io::Result<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    reader.next().await.transpose()
}

async fn require_value<R>(
    reader: &mut FramedRead<R, JsonLineCodec>,
    what: &str,
) -> io::Result<Value>
where
    R: AsyncRead + Unpin,
{
    next_value(reader).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("pipe closed while waiting for {}", what),
        )
    })
}

fn status_from_value(value: Value) -> io::Result<Option<ReplyStatus>> {
    serde_json::from_value(value.clone()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("status line must be null or {{\"error\": …}}, got {}", value),
        )
    })
}

/// Write one request as three lines and flush.
pub async fn write_request<W>(
    writer: &mut FramedWrite<W, JsonLineCodec>,
    request: &Request,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.feed(Value::String(request.request_id.clone())).await?;
    writer.feed(Value::String(request.command.clone())).await?;
    writer.send(pack_args(&request.args)).await
}

/// Write one reply as three lines and flush.
pub async fn write_reply<W>(
    writer: &mut FramedWrite<W, JsonLineCodec>,
    reply: &Reply,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let request_id = reply.request_id.as_deref().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "reply is missing a request id")
    })?;
    writer.feed(Value::String(request_id.to_string())).await?;
    writer.feed(reply.value.clone()).await?;
    writer
        .send(serde_json::to_value(&reply.status).map_err(io::Error::other)?)
        .await
}

/// Write the startup handshake (status value plus reserved slot) and flush.
pub async fn write_handshake<W>(
    writer: &mut FramedWrite<W, JsonLineCodec>,
    status: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.feed(Value::String(status.to_string())).await?;
    writer.send(Value::Null).await
}

/// Read one ordinary reply (three lines, id first).
pub async fn read_reply<R>(reader: &mut FramedRead<R, JsonLineCodec>) -> io::Result<Reply>
where
    R: AsyncRead + Unpin,
{
    let id_value = require_value(reader, "reply id").await?;
    let request_id = id_value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply id must be a string, got {}", id_value),
            )
        })?;
    let value = require_value(reader, "reply value").await?;
    let status = status_from_value(require_value(reader, "reply status").await?)?;
    Ok(Reply {
        request_id: Some(request_id),
        value,
        status,
    })
}

/// Read the startup handshake: the one message that omits the request id.
pub async fn read_handshake<R>(reader: &mut FramedRead<R, JsonLineCodec>) -> io::Result<Reply>
where
    R: AsyncRead + Unpin,
{
    let value = require_value(reader, "handshake status").await?;
    // Reserved status slot; the helper always writes null here.
    let status = status_from_value(require_value(reader, "handshake status slot").await?)?;
    Ok(Reply {
        request_id: None,
        value,
        status,
    })
}

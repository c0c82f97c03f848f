//! Binary framing for the TCP broker transport.
//!
//! Every frame is `[u32 BE length][u8 kind][fields...]`. Strings carry a
//! `u16 BE` length prefix, larger payloads a `u32 BE` prefix, and all
//! integers are big-endian. Store request/response bodies are JSON text
//! produced by [`crate::store`].

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version exchanged in HELLO. Peers with a different version
/// are rejected during the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Hard cap on a single frame body. Events are bounded well below this;
/// anything larger is a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const KIND_HELLO: u8 = 0x01;
const KIND_SUB: u8 = 0x02;
const KIND_UNSUB: u8 = 0x03;
const KIND_PUB: u8 = 0x04;
const KIND_MSG: u8 = 0x05;
const KIND_REQ: u8 = 0x06;
const KIND_RESP: u8 = 0x07;
const KIND_PING: u8 = 0x08;
const KIND_PONG: u8 = 0x09;
const KIND_BYE: u8 = 0x0A;

/// One broker protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame on a connection, in both directions.
    Hello {
        protocol_version: u16,
        instance_id: String,
    },
    /// Subscribe the sending client to a topic.
    Sub { topic: String },
    /// Drop a topic subscription.
    Unsub { topic: String },
    /// Client → broker publish. The broker stamps the origin when it
    /// fans the message out.
    Pub { topic: String, payload: String },
    /// Broker → client fan-out of a published message.
    Msg {
        topic: String,
        origin: String,
        payload: String,
    },
    /// Store request with a client-chosen correlation ID.
    Req { id: u64, body: String },
    /// Store response carrying the request's correlation ID.
    Resp { id: u64, body: String },
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Orderly goodbye before closing the socket.
    Bye,
}

/// Codec for [`Frame`] over a byte stream.
#[derive(Debug, Default)]
pub struct BrokerCodec;

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn put_str(dst: &mut BytesMut, value: &str) -> io::Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| invalid_data("string field exceeds u16 length"))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_blob(dst: &mut BytesMut, value: &str) -> io::Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| invalid_data("payload exceeds u32 length"))?;
    dst.put_u32(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn take_str(body: &mut BytesMut) -> io::Result<String> {
    if body.remaining() < 2 {
        return Err(invalid_data("truncated string field"));
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(invalid_data("truncated string field"));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| invalid_data("string field is not utf-8"))
}

fn take_blob(body: &mut BytesMut) -> io::Result<String> {
    if body.remaining() < 4 {
        return Err(invalid_data("truncated payload field"));
    }
    let len = body.get_u32() as usize;
    if body.remaining() < len {
        return Err(invalid_data("truncated payload field"));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| invalid_data("payload is not utf-8"))
}

fn take_u16(body: &mut BytesMut) -> io::Result<u16> {
    if body.remaining() < 2 {
        return Err(invalid_data("truncated u16 field"));
    }
    Ok(body.get_u16())
}

fn take_u64(body: &mut BytesMut) -> io::Result<u64> {
    if body.remaining() < 8 {
        return Err(invalid_data("truncated u64 field"));
    }
    Ok(body.get_u64())
}

impl Encoder<Frame> for BrokerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let mut body = BytesMut::new();
        match item {
            Frame::Hello {
                protocol_version,
                instance_id,
            } => {
                body.put_u8(KIND_HELLO);
                body.put_u16(protocol_version);
                put_str(&mut body, &instance_id)?;
            }
            Frame::Sub { topic } => {
                body.put_u8(KIND_SUB);
                put_str(&mut body, &topic)?;
            }
            Frame::Unsub { topic } => {
                body.put_u8(KIND_UNSUB);
                put_str(&mut body, &topic)?;
            }
            Frame::Pub { topic, payload } => {
                body.put_u8(KIND_PUB);
                put_str(&mut body, &topic)?;
                put_blob(&mut body, &payload)?;
            }
            Frame::Msg {
                topic,
                origin,
                payload,
            } => {
                body.put_u8(KIND_MSG);
                put_str(&mut body, &topic)?;
                put_str(&mut body, &origin)?;
                put_blob(&mut body, &payload)?;
            }
            Frame::Req { id, body: req } => {
                body.put_u8(KIND_REQ);
                body.put_u64(id);
                put_blob(&mut body, &req)?;
            }
            Frame::Resp { id, body: resp } => {
                body.put_u8(KIND_RESP);
                body.put_u64(id);
                put_blob(&mut body, &resp)?;
            }
            Frame::Ping => body.put_u8(KIND_PING),
            Frame::Pong => body.put_u8(KIND_PONG),
            Frame::Bye => body.put_u8(KIND_BYE),
        }

        if body.len() > MAX_FRAME_SIZE {
            return Err(invalid_data("frame exceeds maximum size"));
        }
        let len = u32::try_from(body.len()).map_err(|_| invalid_data("frame exceeds u32"))?;
        dst.reserve(4 + body.len());
        dst.put_u32(len);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for BrokerCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(invalid_data("oversized frame length"));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(frame_len);

        if body.remaining() < 1 {
            return Err(invalid_data("empty frame body"));
        }
        let kind = body.get_u8();
        let frame = match kind {
            KIND_HELLO => Frame::Hello {
                protocol_version: take_u16(&mut body)?,
                instance_id: take_str(&mut body)?,
            },
            KIND_SUB => Frame::Sub {
                topic: take_str(&mut body)?,
            },
            KIND_UNSUB => Frame::Unsub {
                topic: take_str(&mut body)?,
            },
            KIND_PUB => Frame::Pub {
                topic: take_str(&mut body)?,
                payload: take_blob(&mut body)?,
            },
            KIND_MSG => Frame::Msg {
                topic: take_str(&mut body)?,
                origin: take_str(&mut body)?,
                payload: take_blob(&mut body)?,
            },
            KIND_REQ => Frame::Req {
                id: take_u64(&mut body)?,
                body: take_blob(&mut body)?,
            },
            KIND_RESP => Frame::Resp {
                id: take_u64(&mut body)?,
                body: take_blob(&mut body)?,
            },
            KIND_PING => Frame::Ping,
            KIND_PONG => Frame::Pong,
            KIND_BYE => Frame::Bye,
            other => return Err(invalid_data(format!("unknown frame kind {other:#04x}"))),
        };

        if !body.is_empty() {
            return Err(invalid_data("trailing bytes after frame body"));
        }
        Ok(Some(frame))
    }
}

//! Wire framing for stream transports.
//!
//! Every frame is a little-endian `u32` body length followed by a bincode
//! body holding the event tag and the payload. Message ids never travel on
//! the wire; the receiving side stamps its own peer id.

use super::message::{MqEvent, MqMsg};
use crate::error::{MqError, MqResult};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length prefix size.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound of the bincode overhead around the payload
/// (event tag, user tag and payload length).
pub const PACKET_OVERHEAD: usize = 16;

#[derive(Serialize)]
struct PacketRef<'a> {
    event: MqEvent,
    data: &'a [u8],
}

#[derive(Deserialize)]
struct Packet {
    event: MqEvent,
    data: Vec<u8>,
}

/// Reusable frame encoder.
#[derive(Debug)]
pub struct MsgPacker {
    buffer: Vec<u8>,
}

impl MsgPacker {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.max(FRAME_HEADER_SIZE + PACKET_OVERHEAD)),
        }
    }

    /// Encodes `msg` into a complete frame borrowed from the internal buffer.
    pub fn pack(&mut self, msg: &MqMsg) -> MqResult<&[u8]> {
        self.buffer.clear();
        self.buffer.extend_from_slice(&[0u8; FRAME_HEADER_SIZE]);
        bincode::serialize_into(
            &mut self.buffer,
            &PacketRef {
                event: msg.event,
                data: &msg.data,
            },
        )?;

        let body_len = self.buffer.len() - FRAME_HEADER_SIZE;
        let body_len = u32::try_from(body_len).map_err(|_| MqError::MessageTooLarge {
            size: body_len,
            limit: u32::MAX as usize,
        })?;
        self.buffer[..FRAME_HEADER_SIZE].copy_from_slice(&body_len.to_le_bytes());
        Ok(&self.buffer)
    }

    /// Decodes a frame body into `msg`, keeping `msg.id` untouched.
    pub fn unpack(body: &[u8], msg: &mut MqMsg) -> MqResult<()> {
        let packet: Packet = bincode::deserialize(body)?;
        msg.event = packet.event;
        msg.data = packet.data;
        Ok(())
    }
}

/// Reads length-prefixed frame bodies from a stream.
pub struct FrameReader<R> {
    reader: R,
    body: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `max_msg_size` bounds the payload; larger frames are an error.
    pub fn new(reader: R, max_msg_size: usize) -> Self {
        Self {
            reader,
            body: Vec::new(),
            limit: max_msg_size.saturating_add(PACKET_OVERHEAD),
        }
    }

    /// Next frame body, or `None` once the peer closed the stream.
    ///
    /// Not cancel safe: run it in a dedicated task.
    pub async fn read_frame(&mut self) -> io::Result<Option<&[u8]>> {
        let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
        match self.reader.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let body_len = u32::from_le_bytes(len_bytes) as usize;
        if body_len > self.limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes (limit {})", body_len, self.limit),
            ));
        }

        self.body.resize(body_len, 0);
        self.reader.read_exact(&mut self.body).await?;
        Ok(Some(&self.body))
    }
}

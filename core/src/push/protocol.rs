/// Wire protocol of the push channel
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Frames above this size are treated as a broken stream
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Messages exchanged with the push relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PushMessage {
    /// Announce our identity so the relay can route events to this connection
    #[serde(rename = "join")]
    Join { user_id: String, protocol_version: u8 },

    /// Relay acknowledgment of a join
    #[serde(rename = "joined")]
    Joined { user_id: String },

    /// Ask the relay to tell `receiver_id` that a message was sent
    #[serde(rename = "send_message")]
    SendMessage {
        sender_id: String,
        receiver_id: String,
        content: String,
    },

    /// A message was sent to us
    #[serde(rename = "receive_message")]
    ReceiveMessage {
        sender_id: String,
        receiver_id: String,
        content: String,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    /// Connection close notification
    #[serde(rename = "close")]
    Close { reason: String },
}

impl PushMessage {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            PushMessage::Join { .. } => "join",
            PushMessage::Joined { .. } => "joined",
            PushMessage::SendMessage { .. } => "send_message",
            PushMessage::ReceiveMessage { .. } => "receive_message",
            PushMessage::Ping { .. } => "ping",
            PushMessage::Pong { .. } => "pong",
            PushMessage::Close { .. } => "close",
        }
    }
}

impl fmt::Display for PushMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PushMessage({})", self.message_type())
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn from_message(message: &PushMessage) -> Result<Self, serde_json::Error> {
        let payload = message.to_bytes()?;
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Read one message. `Ok(None)` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> std::io::Result<Option<PushMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", length),
        ));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    PushMessage::from_bytes(&payload)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub async fn write_message<W>(writer: &mut W, message: &PushMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::from_message(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await
}

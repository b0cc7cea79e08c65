use serde::{Deserialize, Serialize};

/// Correlation handle carried by a message (a peer id on bound stream nodes).
pub type MqId = u64;

/// Id addressing every connected peer.
pub const BROADCAST_ID: MqId = 0;

/// Message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MqEvent {
    #[default]
    None,
    /// Regular payload.
    Msg,
    /// Close the node. Never written to the wire.
    Close,
    /// Shut down the write side of stream connections. Never written to the wire.
    Shutdown,
    /// Application defined tag.
    User(u32),
}

impl MqEvent {
    /// Control events are handled by the transport itself.
    pub fn is_control(self) -> bool {
        matches!(self, MqEvent::Close | MqEvent::Shutdown)
    }
}

/// Message envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MqMsg {
    pub event: MqEvent,
    pub id: MqId,
    pub data: Vec<u8>,
}

impl MqMsg {
    /// Regular message holding `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self::with_event(MqEvent::Msg, data)
    }

    pub fn with_event(event: MqEvent, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event,
            id: BROADCAST_ID,
            data: data.into(),
        }
    }

    /// Empty message with reserved payload capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            event: MqEvent::None,
            id: BROADCAST_ID,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn close() -> Self {
        Self::with_event(MqEvent::Close, Vec::new())
    }

    pub fn shutdown() -> Self {
        Self::with_event(MqEvent::Shutdown, Vec::new())
    }

    pub fn to_peer(mut self, id: MqId) -> Self {
        self.id = id;
        self
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Payload as UTF-8, if it is.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Resets the envelope, keeping the payload allocation.
    pub fn clear(&mut self) {
        self.event = MqEvent::None;
        self.id = BROADCAST_ID;
        self.data.clear();
    }

    /// Copies `other` into this buffer without reallocating when it fits.
    pub fn copy_from(&mut self, other: &MqMsg) {
        self.event = other.event;
        self.id = other.id;
        self.data.clear();
        self.data.extend_from_slice(&other.data);
    }
}

impl From<&str> for MqMsg {
    fn from(text: &str) -> Self {
        MqMsg::new(text.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = MqMsg::new(vec![1, 2, 3]).to_peer(7);
        assert_eq!(msg.event, MqEvent::Msg);
        assert_eq!(msg.id, 7);
        assert_eq!(msg.size(), 3);
        assert!(MqMsg::close().event.is_control());
        assert!(!MqEvent::User(3).is_control());
    }

    #[test]
    fn test_copy_from_keeps_capacity() {
        let mut slot = MqMsg::with_capacity(64);
        let source = MqMsg::from("hello").to_peer(2);
        slot.copy_from(&source);
        assert_eq!(slot, source);
        assert!(slot.data.capacity() >= 64);

        slot.clear();
        assert_eq!(slot.event, MqEvent::None);
        assert_eq!(slot.id, BROADCAST_ID);
        assert!(slot.data.is_empty());
        assert!(slot.data.capacity() >= 64);
    }
}

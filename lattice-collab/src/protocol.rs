//! Wire protocol for the live-update channel.
//!
//! Every edit event is one variant of [`ChannelEvent`] — a tagged union
//! matched exhaustively everywhere, so a missing handler is a compile
//! error rather than a silently ignored string. Events travel inside a
//! [`Frame`] envelope on the relay link, bincode-encoded.
//!
//! Channel names are deterministic per document:
//! `page:{page_id}:updates` for a page, `components:updates` for the
//! global component scope.

use lattice_core::{Component, Layer, LayerPatch};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Global channel carrying component lifecycle events.
pub const COMPONENTS_CHANNEL: &str = "components:updates";

/// Channel name for a page's update stream.
pub fn page_channel(page_id: Uuid) -> String {
    format!("page:{page_id}:updates")
}

/// Extract the page id from a `page:{id}:updates` channel name.
pub fn parse_page_channel(channel: &str) -> Option<Uuid> {
    let rest = channel.strip_prefix("page:")?;
    let id = rest.strip_suffix(":updates")?;
    Uuid::parse_str(id).ok()
}

/// Milliseconds since the Unix epoch. Informational only — events are
/// applied in receipt order, never timestamp order.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One edit or presence event on a channel.
///
/// Every variant carries the originating `user_id`, used by receivers
/// purely for echo suppression (not a security boundary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// Shallow patch merged into the addressed layer.
    LayerUpdate {
        page_id: Uuid,
        layer_id: Uuid,
        user_id: Uuid,
        changes: LayerPatch,
        timestamp: u64,
    },
    /// A new layer (with pre-minted id) under a parent, or at the root.
    LayerAdded {
        page_id: Uuid,
        parent_layer_id: Option<Uuid>,
        new_layer: Layer,
        user_id: Uuid,
        timestamp: u64,
    },
    LayerDeleted {
        page_id: Uuid,
        layer_id: Uuid,
        user_id: Uuid,
        timestamp: u64,
    },
    LayerMoved {
        page_id: Uuid,
        layer_id: Uuid,
        target_parent_id: Option<Uuid>,
        target_index: usize,
        user_id: Uuid,
        timestamp: u64,
    },
    /// "Who is editing what" — presence UI only, never correctness.
    UserActivity {
        user_id: Uuid,
        user_name: String,
        layer_id: Option<Uuid>,
        text_edit: bool,
        timestamp: u64,
    },
    /// Edit-lock grant/release on a layer.
    LockChange {
        page_id: Uuid,
        layer_id: Uuid,
        locked_by: Option<Uuid>,
        user_id: Uuid,
        timestamp: u64,
    },
    ComponentCreated {
        component: Component,
        user_id: Uuid,
        timestamp: u64,
    },
    /// Component metadata change (rename).
    ComponentUpdated {
        component_id: Uuid,
        name: Option<String>,
        user_id: Uuid,
        timestamp: u64,
    },
    ComponentDeleted {
        component_id: Uuid,
        user_id: Uuid,
        timestamp: u64,
    },
    /// Canonical layers of a component after a confirmed save.
    ComponentLayersUpdated {
        component_id: Uuid,
        layers: Vec<Layer>,
        user_id: Uuid,
        timestamp: u64,
    },
}

impl ChannelEvent {
    /// The originating user, for echo suppression.
    pub fn user_id(&self) -> Uuid {
        match self {
            ChannelEvent::LayerUpdate { user_id, .. }
            | ChannelEvent::LayerAdded { user_id, .. }
            | ChannelEvent::LayerDeleted { user_id, .. }
            | ChannelEvent::LayerMoved { user_id, .. }
            | ChannelEvent::UserActivity { user_id, .. }
            | ChannelEvent::LockChange { user_id, .. }
            | ChannelEvent::ComponentCreated { user_id, .. }
            | ChannelEvent::ComponentUpdated { user_id, .. }
            | ChannelEvent::ComponentDeleted { user_id, .. }
            | ChannelEvent::ComponentLayersUpdated { user_id, .. } => *user_id,
        }
    }

    /// The page this event targets, if page-scoped.
    pub fn page_id(&self) -> Option<Uuid> {
        match self {
            ChannelEvent::LayerUpdate { page_id, .. }
            | ChannelEvent::LayerAdded { page_id, .. }
            | ChannelEvent::LayerDeleted { page_id, .. }
            | ChannelEvent::LayerMoved { page_id, .. }
            | ChannelEvent::LockChange { page_id, .. } => Some(*page_id),
            ChannelEvent::UserActivity { .. }
            | ChannelEvent::ComponentCreated { .. }
            | ChannelEvent::ComponentUpdated { .. }
            | ChannelEvent::ComponentDeleted { .. }
            | ChannelEvent::ComponentLayersUpdated { .. } => None,
        }
    }

    /// Whether this is a presence-only event (no document mutation).
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            ChannelEvent::UserActivity { .. } | ChannelEvent::LockChange { .. }
        )
    }
}

/// Envelope on the relay WebSocket link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Client → relay: join a channel.
    Subscribe { channel: String },
    /// Client → relay: leave a channel.
    Unsubscribe { channel: String },
    /// Client → relay: publish an event to a channel.
    Publish { channel: String, event: ChannelEvent },
    /// Relay → client: an event published on a subscribed channel.
    Event { channel: String, event: ChannelEvent },
    /// Relay → client: current tree snapshot, sent once per subscribe.
    /// Doubles as the subscription acknowledgement.
    State { channel: String, layers: Vec<Layer> },
    /// Heartbeat.
    Ping,
    Pong,
}

impl Frame {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Serialization(e) => write!(f, "serialization error: {e}"),
            ProtocolError::Deserialization(e) => write!(f, "deserialization error: {e}"),
            ProtocolError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::Layer;

    #[test]
    fn test_channel_naming() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let channel = page_channel(id);
        assert_eq!(
            channel,
            "page:550e8400-e29b-41d4-a716-446655440000:updates"
        );
        assert_eq!(parse_page_channel(&channel), Some(id));
        assert_eq!(parse_page_channel(COMPONENTS_CHANNEL), None);
        assert_eq!(parse_page_channel("page:not-a-uuid:updates"), None);
    }

    #[test]
    fn test_layer_update_roundtrip() {
        let event = ChannelEvent::LayerUpdate {
            page_id: Uuid::new_v4(),
            layer_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            changes: LayerPatch::classes(vec!["p-4".to_string()]),
            timestamp: now_ms(),
        };
        let frame = Frame::Publish {
            channel: page_channel(Uuid::new_v4()),
            event: event.clone(),
        };
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        match decoded {
            Frame::Publish { event: e, .. } => assert_eq!(e, event),
            other => panic!("expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn test_state_frame_roundtrip() {
        let frame = Frame::State {
            channel: COMPONENTS_CHANNEL.to_string(),
            layers: vec![Layer::new("div"), Layer::new("img")],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_event_accessors() {
        let user = Uuid::new_v4();
        let page = Uuid::new_v4();
        let event = ChannelEvent::LayerDeleted {
            page_id: page,
            layer_id: Uuid::new_v4(),
            user_id: user,
            timestamp: 0,
        };
        assert_eq!(event.user_id(), user);
        assert_eq!(event.page_id(), Some(page));
        assert!(!event.is_presence());

        let activity = ChannelEvent::UserActivity {
            user_id: user,
            user_name: "Alice".to_string(),
            layer_id: None,
            text_edit: true,
            timestamp: 0,
        };
        assert_eq!(activity.page_id(), None);
        assert!(activity.is_presence());
    }

    #[test]
    fn test_decode_garbage_errors() {
        assert!(Frame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_small_update_stays_small() {
        let event = ChannelEvent::LayerUpdate {
            page_id: Uuid::new_v4(),
            layer_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            changes: LayerPatch::classes(vec!["p-4".to_string()]),
            timestamp: now_ms(),
        };
        let frame = Frame::Publish {
            channel: page_channel(Uuid::new_v4()),
            event,
        };
        let bytes = frame.encode().unwrap();
        // 3 uuids + channel name + one class token; anything past a few
        // hundred bytes means the envelope grew something it shouldn't.
        assert!(bytes.len() < 256, "frame unexpectedly large: {}", bytes.len());
    }
}

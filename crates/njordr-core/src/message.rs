//! Message serialization and the broker/worker protocol

use crate::error::ErrorCode;
use crate::item::{Assignment, ItemId, Outcome, WorkItem};
use crate::worker::WorkerId;
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Serialization format for frame bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    /// JSON format (human-readable, larger)
    Json,
    /// MessagePack format (binary, compact, fast)
    #[default]
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl Serializer {
    /// Tag byte written in front of every frame body
    pub fn tag(&self) -> u8 {
        match self {
            Serializer::Json => 1,
            Serializer::MessagePack => 2,
        }
    }

    /// Parse a frame tag byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Serializer::Json),
            2 => Some(Serializer::MessagePack),
            _ => None,
        }
    }

    /// Get the content type string for this serializer
    pub fn content_type(&self) -> &'static str {
        match self {
            Serializer::Json => "application/json",
            Serializer::MessagePack => "application/x-msgpack",
        }
    }

    /// Serialize a value
    ///
    /// MessagePack bodies use named fields so tagged enums decode unambiguously.
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        match self {
            Serializer::Json => {
                let data = serde_json::to_vec(value)?;
                Ok(Bytes::from(data))
            }
            Serializer::MessagePack => {
                let data = rmp_serde::to_vec_named(value)?;
                Ok(Bytes::from(data))
            }
        }
    }

    /// Deserialize a value
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        match self {
            Serializer::Json => {
                serde_json::from_slice(data).map_err(|e| Error::Deserialization(e.to_string()))
            }
            Serializer::MessagePack => Ok(rmp_serde::from_slice(data)?),
        }
    }
}

impl std::str::FromStr for Serializer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Serializer::Json),
            "msgpack" | "messagepack" => Ok(Serializer::MessagePack),
            _ => Err(format!("Unknown serializer: {}", s)),
        }
    }
}

/// Messages sent to the broker, by workers and by producers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Worker announces itself; binds the connection to `worker_id`
    Register { worker_id: WorkerId },

    /// Worker liveness signal
    Heartbeat { worker_id: WorkerId },

    /// Worker reports the outcome of an assignment
    Report {
        worker_id: WorkerId,
        item_id: ItemId,
        outcome: Outcome,
    },

    /// Producer admits new work
    Submit {
        job: String,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Producer asks for the current state of an item
    Status { item_id: ItemId },

    /// Operator cancels an item
    Abandon { item_id: ItemId },
}

/// How the broker handled a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum ReportDisposition {
    /// Item is now completed
    Completed,
    /// Attempt failed, item is pending again
    Requeued { attempts: u32 },
    /// Attempt failed and the retry limit was reached
    Failed { attempts: u32 },
    /// Stale, duplicate or abandoned; nothing changed
    Discarded,
}

/// Messages sent by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// Registration accepted
    Registered {
        worker_id: WorkerId,
        /// Interval the worker is expected to heartbeat at
        heartbeat_interval_ms: u64,
    },

    /// Work assigned to the receiving worker
    Dispatch { assignment: Assignment },

    /// Report was processed
    ReportAck {
        item_id: ItemId,
        disposition: ReportDisposition,
    },

    /// Item was admitted
    Submitted { item_id: ItemId },

    /// Current state of an item
    ItemStatus { item: Box<WorkItem> },

    /// Item was abandoned
    Abandoned { item_id: ItemId },

    /// Request was rejected
    Error {
        code: ErrorCode,
        /// Human-readable description
        message: String,
        /// Variant payload, see [`Error::from_wire`]
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl BrokerMessage {
    /// Build an error reply from a broker error
    pub fn error(err: &Error) -> Self {
        BrokerMessage::Error {
            code: err.code(),
            message: err.to_string(),
            detail: Some(err.detail()),
        }
    }

    /// The error an `Error` reply stands for
    pub fn as_error(&self) -> Option<Error> {
        match self {
            BrokerMessage::Error {
                code,
                message,
                detail,
            } => Some(Error::from_wire(
                *code,
                detail.clone().unwrap_or_else(|| message.clone()),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_json_shape() {
        let msg = ClientMessage::Heartbeat {
            worker_id: WorkerId::from("w1"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"type": "heartbeat", "worker_id": "w1"}));
    }

    #[test]
    fn test_report_survives_msgpack() {
        let msg = ClientMessage::Report {
            worker_id: WorkerId::from("w1"),
            item_id: ItemId::from("item-1"),
            outcome: Outcome::Failure("disk full".into()),
        };

        let bytes = Serializer::MessagePack.serialize(&msg).unwrap();
        let restored: ClientMessage = Serializer::MessagePack.deserialize(&bytes).unwrap();
        assert_eq!(restored, msg);
    }

    #[test]
    fn test_dispatch_carries_payload() {
        let item = WorkItem::new("echo", serde_json::json!({"text": "hi"}), 0);
        let msg = BrokerMessage::Dispatch {
            assignment: item.assignment(),
        };

        let bytes = Serializer::MessagePack.serialize(&msg).unwrap();
        match Serializer::MessagePack.deserialize::<BrokerMessage>(&bytes).unwrap() {
            BrokerMessage::Dispatch { assignment } => {
                assert_eq!(assignment.item_id, item.id);
                assert_eq!(assignment.payload["text"], "hi");
            }
            other => panic!("Expected Dispatch, got {:?}", other),
        }
    }

    #[test]
    fn test_error_reply_rebuilds_broker_error() {
        let reply = BrokerMessage::error(&Error::CapacityExceeded { capacity: 3 });
        let bytes = Serializer::MessagePack.serialize(&reply).unwrap();
        let restored: BrokerMessage = Serializer::MessagePack.deserialize(&bytes).unwrap();

        match restored.as_error() {
            Some(Error::CapacityExceeded { capacity }) => assert_eq!(capacity, 3),
            other => panic!("Expected CapacityExceeded, got {:?}", other),
        }

        // Frames without a detail fall back to the message
        let bare: BrokerMessage = serde_json::from_str(
            r#"{"type": "error", "code": "unknown_item", "message": "item-4"}"#,
        )
        .unwrap();
        assert!(matches!(bare.as_error(), Some(Error::UnknownItem(id)) if id == "item-4"));
    }

    #[test]
    fn test_submit_payload_defaults_to_null() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "submit", "job": "echo"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Submit {
                job: "echo".into(),
                payload: serde_json::Value::Null
            }
        );
    }

    #[test]
    fn test_serializer_tags() {
        for s in [Serializer::Json, Serializer::MessagePack] {
            assert_eq!(Serializer::from_tag(s.tag()), Some(s));
        }
        assert_eq!(Serializer::from_tag(0), None);
        assert_eq!("json".parse::<Serializer>(), Ok(Serializer::Json));
    }
}

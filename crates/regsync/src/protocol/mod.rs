use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::model::Table;

/// A change notification for one row of a mirrored table
///
/// The payload is the raw row as delivered by the remote service; typed
/// decoding happens when the change is applied to a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// A new row was inserted
    Insert { record: JsonValue },
    /// An existing row was rewritten
    Update { record: JsonValue },
    /// A row was deleted; the payload carries at least the primary key
    Delete { record: JsonValue },
}

impl Change {
    /// The row payload, regardless of kind.
    pub fn record(&self) -> &JsonValue {
        match self {
            Change::Insert { record } | Change::Update { record } | Change::Delete { record } => {
                record
            }
        }
    }
}

/// Messages sent from dashboard clients to the sync endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Subscribe to change events for a table
    Subscribe { table: Table },
    /// Unsubscribe from a table
    Unsubscribe { table: Table },
    /// Request the full current contents of a table
    GetSnapshot { table: Table },
}

/// Messages sent from the sync endpoint to dashboard clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Full contents of a table (sent on subscribe and on request)
    Snapshot { table: Table, rows: Vec<JsonValue> },
    /// A change was applied to a table (sent to all subscribers)
    TableChange { table: Table, change: Change },
    /// Error message
    Error { message: String },
    /// Acknowledgment of a request
    Ack { request_id: Option<String> },
}

/// Encode a message using lib0 format
pub fn encode_message<T: Serialize>(message: &T) -> crate::SyncResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from lib0 format
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> crate::SyncResult<T> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json =
        lib0::decoding::Read::read_string(&mut decoder).map_err(|e| crate::SyncError::Protocol {
            message: format!("failed to decode lib0 string: {}", e),
        })?;

    let message = serde_json::from_str(json)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_tags_are_stable() {
        let change = Change::Insert {
            record: json!({"guest_id": 1}),
        };
        let wire = serde_json::to_value(&change).unwrap();
        assert_eq!(wire["kind"], "insert");
        assert_eq!(wire["record"]["guest_id"], 1);
    }

    #[test]
    fn client_messages_survive_the_wire_framing() {
        let message = ClientMessage::Subscribe {
            table: Table::AttendanceLogs,
        };
        let encoded = encode_message(&message).unwrap();
        let decoded: ClientMessage = decode_message(&encoded).unwrap();
        assert!(matches!(
            decoded,
            ClientMessage::Subscribe {
                table: Table::AttendanceLogs
            }
        ));
    }

    #[test]
    fn garbage_frames_are_rejected_as_protocol_errors() {
        let result: crate::SyncResult<ClientMessage> = decode_message(&[0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }
}

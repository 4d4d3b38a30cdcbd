use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use common::CommandId;

use crate::metadata::MetaData;

/// A command envelope: an intent requesting a state change, routed to
/// exactly one handler by its `command_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Unique identifier for this command.
    pub command_id: CommandId,

    /// The type key used to resolve the handler.
    pub command_type: String,

    /// When the command was created.
    pub timestamp: DateTime<Utc>,

    /// The command payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the command.
    pub metadata: MetaData,
}

impl CommandMessage {
    /// Creates a new command message with a fresh identifier and the current time.
    pub fn new(command_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            command_id: CommandId::new(),
            command_type: command_type.into(),
            timestamp: Utc::now(),
            payload,
            metadata: MetaData::new(),
        }
    }

    /// Creates a command message by serializing a typed payload.
    pub fn from_payload<T: Serialize>(
        command_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(command_type, serde_json::to_value(payload)?))
    }

    /// Deserializes the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Returns a copy of this command carrying `metadata` instead of the
    /// current metadata.
    pub fn with_metadata(&self, metadata: MetaData) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    /// Returns a copy of this command with `additional` merged into the
    /// current metadata.
    pub fn and_metadata(&self, additional: &MetaData) -> Self {
        self.with_metadata(self.metadata.merged_with(additional))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct AddItem {
        sku: String,
        quantity: u32,
    }

    #[test]
    fn typed_payload_roundtrip() {
        let payload = AddItem {
            sku: "SKU-001".to_string(),
            quantity: 2,
        };
        let command = CommandMessage::from_payload("AddItem", &payload).unwrap();

        assert_eq!(command.command_type, "AddItem");
        assert_eq!(command.payload_as::<AddItem>().unwrap(), payload);
    }

    #[test]
    fn with_metadata_preserves_identity() {
        let command = CommandMessage::new("AddItem", serde_json::json!({}));
        let rewritten =
            command.with_metadata(MetaData::new().with_entry("user", serde_json::json!("alice")));

        assert_eq!(rewritten.command_id, command.command_id);
        assert!(rewritten.metadata.contains_key("user"));
    }
}

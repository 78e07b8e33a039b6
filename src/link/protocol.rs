//! Wire protocol for the hub link
//!
//! Frames are JSON objects tagged by `event`, with the payload under `data`.
//! Commands arrive with a flat envelope: the `id` and `type` sit next to the
//! command-specific fields. Status reports echo the id and type back with a
//! millisecond ISO-8601 `updatedAt` stamp.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::library::{Activity, Resource};

/// Client type announced on connect; the hub routes commands by it.
pub const AGENT_TYPE: &str = "sd";

/// Frames the hub sends to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerFrame {
    Command(CommandEnvelope),
    /// The hub dropped this agent from its room; credentials are stale.
    Kicked,
    RoomPresence(RoomPresence),
    UpgradeKey(UpgradeKeyPayload),
    Joined(JoinAck),
}

/// Frames the agent sends to the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    Iam(PresenceAnnounce),
    Join(JoinKey),
    CommandStatus(StatusEnvelope),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceAnnounce {
    #[serde(rename = "type")]
    pub client_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinKey {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAck {
    #[serde(default)]
    pub room: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeKeyPayload {
    pub key: String,
}

/// Room occupancy counts, sent whenever membership changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPresence {
    /// Connected browser clients
    #[serde(default)]
    pub client: u32,
    /// Connected agents
    #[serde(default)]
    pub sd: u32,
}

/// A remote command, as received off the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "resources:list")]
    ResourcesList,
    #[serde(rename = "resources:add")]
    ResourcesAdd { resource: Resource },
    #[serde(rename = "resources:remove")]
    ResourcesRemove { resource: RemovalTarget },
    #[serde(rename = "activities:list")]
    ActivitiesList,
    #[serde(rename = "activities:clear")]
    ActivitiesClear,
    #[serde(rename = "activities:cancel")]
    ActivitiesCancel,
    #[serde(rename = "image:txt2img")]
    TextToImage {
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Command types this agent does not implement
    #[serde(other)]
    Unknown,
}

/// Removal commands only need the hash; anything else the hub sends along is
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalTarget {
    pub hash: String,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::ResourcesList => "resources:list",
            Command::ResourcesAdd { .. } => "resources:add",
            Command::ResourcesRemove { .. } => "resources:remove",
            Command::ActivitiesList => "activities:list",
            Command::ActivitiesClear => "activities:clear",
            Command::ActivitiesCancel => "activities:cancel",
            Command::TextToImage { .. } => "image:txt2img",
            Command::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Processing,
    Success,
    Error,
    Canceled,
}

/// Status report for a command, echoed back with the original id and type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<Resource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activities: Option<Vec<Activity>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    /// Transfer completion, 0-100
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: String,
}

impl StatusEnvelope {
    pub fn processing(id: &str, command_type: &str) -> Self {
        Self::stamped(id, command_type, CommandStatus::Processing)
    }

    pub fn success(id: &str, command_type: &str) -> Self {
        Self::stamped(id, command_type, CommandStatus::Success)
    }

    pub fn canceled(id: &str, command_type: &str) -> Self {
        Self::stamped(id, command_type, CommandStatus::Canceled)
    }

    pub fn error(id: &str, command_type: &str, message: impl Into<String>) -> Self {
        let mut envelope = Self::stamped(id, command_type, CommandStatus::Error);
        envelope.error = Some(message.into());
        envelope
    }

    pub fn with_resources(mut self, resources: Vec<Resource>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_activities(mut self, activities: Vec<Activity>) -> Self {
        self.activities = Some(activities);
        self
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    fn stamped(id: &str, command_type: &str, status: CommandStatus) -> Self {
        Self {
            id: id.to_string(),
            command_type: command_type.to_string(),
            status,
            resources: None,
            activities: None,
            resource: None,
            progress: None,
            error: None,
            updated_at: now(),
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_add_command() {
        let raw = r#"{
            "event": "command",
            "data": {
                "id": "cmd-1",
                "type": "resources:add",
                "resource": {
                    "hash": "ABCDEF",
                    "name": "model.safetensors",
                    "modelName": "Test Model",
                    "modelVersionName": "v1.0",
                    "type": "model",
                    "url": "http://localhost/file",
                    "modelVersionId": 42
                }
            }
        }"#;

        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ServerFrame::Command(envelope) => {
                assert_eq!(envelope.id, "cmd-1");
                match envelope.command {
                    Command::ResourcesAdd { resource } => {
                        assert_eq!(resource.hash, "ABCDEF");
                        assert_eq!(resource.model_version_id, Some(42));
                    }
                    other => panic!("unexpected command: {other:?}"),
                }
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_command_type() {
        let raw = r#"{
            "event": "command",
            "data": {"id": "cmd-2", "type": "resources:defrag"}
        }"#;

        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ServerFrame::Command(envelope) => {
                assert!(matches!(envelope.command, Command::Unknown));
                assert_eq!(envelope.command.kind(), "unknown");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_decode_kicked_without_data() {
        let frame: ServerFrame = serde_json::from_str(r#"{"event": "kicked"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Kicked));
    }

    #[test]
    fn test_decode_room_presence() {
        let raw = r#"{"event": "roomPresence", "data": {"client": 1, "sd": 1}}"#;
        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ServerFrame::RoomPresence(presence) => {
                assert_eq!(presence.client, 1);
                assert_eq!(presence.sd, 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_status_envelope_wire_shape() {
        let envelope = StatusEnvelope::success("cmd-3", "resources:list").with_resources(vec![]);
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["id"], "cmd-3");
        assert_eq!(value["type"], "resources:list");
        assert_eq!(value["status"], "success");
        assert!(value["resources"].is_array());
        // Unset optionals stay off the wire
        assert!(value.get("error").is_none());
        assert!(value.get("progress").is_none());
        // ISO-8601 with millisecond precision and a Z suffix
        let updated_at = value["updatedAt"].as_str().unwrap();
        assert!(updated_at.ends_with('Z'));
        assert!(updated_at.contains('.'));
    }

    #[test]
    fn test_canceled_status_wire_name() {
        let envelope = StatusEnvelope::canceled("cmd-4", "resources:add");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["status"], "canceled");
    }

    #[test]
    fn test_join_frame_roundtrip() {
        let frame = ClientFrame::Join(JoinKey {
            key: "ABC123".to_string(),
        });
        let raw = serde_json::to_string(&frame).unwrap();
        assert!(raw.contains("\"event\":\"join\""));

        let parsed: ClientFrame = serde_json::from_str(&raw).unwrap();
        match parsed {
            ClientFrame::Join(join) => assert_eq!(join.key, "ABC123"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

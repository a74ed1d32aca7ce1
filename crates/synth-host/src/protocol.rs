//! JSON shapes shared by the HTTP server and the client side.

use serde::{Deserialize, Serialize};

use crate::buffer::{EventPayload, LogEvent};
use crate::session::{SessionId, SessionStatus};

/// One stream message. Sent as the `data` of an SSE event whose `id` is the
/// event's `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    Log {
        line: String,
    },
    Status {
        status: SessionStatus,
        #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl WireMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Status { status, .. } if status.is_terminal())
    }
}

impl From<&LogEvent> for WireMessage {
    fn from(event: &LogEvent) -> Self {
        match &event.payload {
            EventPayload::Log { line } => Self::Log { line: line.clone() },
            EventPayload::Status { status, exit_code } => Self::Status {
                status: *status,
                exit_code: *exit_code,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub input_dir: String,
    #[serde(default)]
    pub key_concepts_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: SessionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_message_shape() {
        let msg = WireMessage::Log { line: "hi".into() };
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"type":"log","line":"hi"}"#);
    }

    #[test]
    fn status_message_omits_unknown_exit_code() {
        let msg = WireMessage::Status {
            status: SessionStatus::Failed,
            exit_code: None,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"status","status":"failed"}"#
        );

        let parsed: WireMessage =
            serde_json::from_str(r#"{"type":"status","status":"succeeded","exitCode":0}"#).unwrap();
        assert_eq!(
            parsed,
            WireMessage::Status {
                status: SessionStatus::Succeeded,
                exit_code: Some(0)
            }
        );
        assert!(parsed.is_terminal());
    }

    #[test]
    fn start_request_tolerates_missing_fields() {
        let req: StartRequest = serde_json::from_str(r#"{"inputDir":"in"}"#).unwrap();
        assert_eq!(req.input_dir, "in");
        assert!(req.key_concepts_file.is_empty());
    }
}

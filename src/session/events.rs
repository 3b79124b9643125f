//! Messages that cross the client connection.
//!
//! Outbound `TranscriptEvent`s are JSON objects tagged by `type`; inbound text
//! frames are `ControlMessage`s. Field names follow the client contract
//! (`meetingId`, `is_final`), timestamps are Unix milliseconds.

use serde::{Deserialize, Serialize};

/// Placeholder used until a `start` message names the meeting or speaker.
pub const UNKNOWN: &str = "unknown";

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Per-session metadata, set by the first `start` control message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMeta {
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
    pub speaker: String,
}

impl Default for SessionMeta {
    fn default() -> Self {
        Self {
            meeting_id: UNKNOWN.to_string(),
            speaker: UNKNOWN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
    pub speaker: String,
    pub text: String,
    pub language: String,
    pub is_final: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
    pub speaker: String,
    pub message: String,
    pub is_final: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keepalive {
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
    pub speaker: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: u64,
}

/// Everything a session can send to its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TranscriptEvent {
    Transcription(Transcript),
    Error(Notice),
    Status(Notice),
    Keepalive(Keepalive),
    Ping(Ping),
}

impl TranscriptEvent {
    pub fn transcription(meta: &SessionMeta, text: String, language: String) -> Self {
        TranscriptEvent::Transcription(Transcript {
            meeting_id: meta.meeting_id.clone(),
            speaker: meta.speaker.clone(),
            text,
            language,
            is_final: false,
            timestamp: now_millis(),
        })
    }

    pub fn error(meta: &SessionMeta, message: impl Into<String>) -> Self {
        TranscriptEvent::Error(Self::notice(meta, message, false))
    }

    pub fn status(meta: &SessionMeta, message: impl Into<String>) -> Self {
        TranscriptEvent::Status(Self::notice(meta, message, false))
    }

    /// The last event a session produces.
    pub fn final_status(meta: &SessionMeta, message: impl Into<String>) -> Self {
        TranscriptEvent::Status(Self::notice(meta, message, true))
    }

    pub fn keepalive(meta: &SessionMeta) -> Self {
        TranscriptEvent::Keepalive(Keepalive {
            meeting_id: meta.meeting_id.clone(),
            speaker: meta.speaker.clone(),
            timestamp: now_millis(),
        })
    }

    pub fn ping() -> Self {
        TranscriptEvent::Ping(Ping {
            timestamp: now_millis(),
        })
    }

    fn notice(meta: &SessionMeta, message: impl Into<String>, is_final: bool) -> Notice {
        Notice {
            meeting_id: meta.meeting_id.clone(),
            speaker: meta.speaker.clone(),
            message: message.into(),
            is_final,
            timestamp: now_millis(),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TranscriptEvent::Status(notice) if notice.is_final)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptEvent::Transcription(_) => "transcription",
            TranscriptEvent::Error(_) => "error",
            TranscriptEvent::Status(_) => "status",
            TranscriptEvent::Keepalive(_) => "keepalive",
            TranscriptEvent::Ping(_) => "ping",
        }
    }
}

/// Text frames sent by the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Start {
        #[serde(rename = "meetingId", default)]
        meeting_id: Option<String>,
        #[serde(default, alias = "speakerId")]
        speaker: Option<String>,
    },
    End,
    Ping,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transcription_wire_format() {
        let meta = SessionMeta {
            meeting_id: "m-1".to_string(),
            speaker: "alex".to_string(),
        };
        let event = TranscriptEvent::transcription(&meta, "hello".to_string(), "en".to_string());
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "transcription");
        assert_eq!(value["meetingId"], "m-1");
        assert_eq!(value["speaker"], "alex");
        assert_eq!(value["text"], "hello");
        assert_eq!(value["language"], "en");
        assert_eq!(value["is_final"], false);
        assert!(value["timestamp"].as_u64().is_some());
    }

    #[test]
    fn test_error_and_final_status() {
        let meta = SessionMeta::default();
        let error = TranscriptEvent::error(&meta, "boom");
        assert_eq!(serde_json::to_value(&error).unwrap()["type"], "error");
        assert!(!error.is_final());

        let done = TranscriptEvent::final_status(&meta, "session ended");
        let value = serde_json::to_value(&done).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["meetingId"], "unknown");
        assert!(done.is_final());
    }

    #[test]
    fn test_control_message_parsing() {
        let start = ControlMessage::parse(
            &json!({"type": "start", "meetingId": "abc", "speaker": "sam"}).to_string(),
        )
        .unwrap();
        assert_eq!(
            start,
            ControlMessage::Start {
                meeting_id: Some("abc".to_string()),
                speaker: Some("sam".to_string())
            }
        );

        let bare = ControlMessage::parse(r#"{"type":"start"}"#).unwrap();
        assert_eq!(
            bare,
            ControlMessage::Start {
                meeting_id: None,
                speaker: None
            }
        );

        assert_eq!(ControlMessage::parse(r#"{"type":"end"}"#).unwrap(), ControlMessage::End);
        assert!(ControlMessage::parse(r#"{"type":"rewind"}"#).is_err());
        assert!(ControlMessage::parse("not json").is_err());
    }
}

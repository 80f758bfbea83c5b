//! Wire protocol types for the peer-facing WebSocket path `/streams`
//! (section 6). JSON text frames only, tagged on `event`.

use serde::{Deserialize, Serialize};

/// One event in either direction on the media stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected,
    Start {
        start: StartPayload,
    },
    Media {
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
        mark: MarkPayload,
    },
    Stop {
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPayload {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid", skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(rename = "accountSid", skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

impl StreamEvent {
    /// True if a `media` event should be handed to the VAD pipeline: no
    /// track, or an explicit `"inbound"` track. Agent-authored echo
    /// (`"outbound"`) is always ignored (open question (b)).
    pub fn is_inbound_media(&self) -> bool {
        match self {
            StreamEvent::Media { media, .. } => {
                matches!(media.track.as_deref(), None | Some("inbound"))
            }
            _ => false,
        }
    }

    pub fn media_outbound(stream_sid: &str, payload_b64: String) -> Self {
        StreamEvent::Media {
            stream_sid: Some(stream_sid.to_string()),
            media: MediaPayload {
                payload: payload_b64,
                track: None,
            },
        }
    }

    pub fn mark(stream_sid: &str, name: String) -> Self {
        StreamEvent::Mark {
            stream_sid: Some(stream_sid.to_string()),
            mark: MarkPayload { name },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_event() {
        let json = r#"{"event":"start","start":{"streamSid":"S1","callSid":"C1","accountSid":"A1"}}"#;
        let ev: StreamEvent = serde_json::from_str(json).unwrap();
        match ev {
            StreamEvent::Start { start } => {
                assert_eq!(start.stream_sid, "S1");
                assert_eq!(start.call_sid.as_deref(), Some("C1"));
            }
            _ => panic!("expected Start"),
        }
    }

    #[test]
    fn parses_connected_event() {
        let ev: StreamEvent = serde_json::from_str(r#"{"event":"connected"}"#).unwrap();
        assert!(matches!(ev, StreamEvent::Connected));
    }

    #[test]
    fn media_without_track_is_inbound() {
        let ev: StreamEvent =
            serde_json::from_str(r#"{"event":"media","streamSid":"S1","media":{"payload":"AA=="}}"#)
                .unwrap();
        assert!(ev.is_inbound_media());
    }

    #[test]
    fn media_outbound_track_is_ignored() {
        let ev: StreamEvent = serde_json::from_str(
            r#"{"event":"media","streamSid":"S1","media":{"payload":"AA==","track":"outbound"}}"#,
        )
        .unwrap();
        assert!(!ev.is_inbound_media());
    }

    #[test]
    fn outbound_media_serializes_without_track_field() {
        let ev = StreamEvent::media_outbound("S1", "AA==".to_string());
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("track"));
        assert!(json.contains(r#""event":"media""#));
    }

    #[test]
    fn mark_roundtrips() {
        let ev = StreamEvent::mark("S1", "reply-123".to_string());
        let json = serde_json::to_string(&ev).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        match back {
            StreamEvent::Mark { mark, .. } => assert_eq!(mark.name, "reply-123"),
            _ => panic!("expected Mark"),
        }
    }
}

use crate::error::Error;
use crate::peer::types::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// Message exchanged through the relay, one flat JSON object per frame:
///
/// ```json
/// {"type": "offer",  "sdp": {"type": "offer", "sdp": "v=0..."}}
/// {"type": "answer", "sdp": {"type": "answer", "sdp": "v=0..."}}
/// {"type": "ice",    "candidate": {"candidate": "candidate:...", "sdpMid": "0", "sdpMLineIndex": 0}}
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer { sdp: SessionDescription },
    Answer { sdp: SessionDescription },
    #[serde(rename = "ice")]
    IceCandidate { candidate: IceCandidate },
}

impl SignalingMessage {
    pub fn parse(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // a derived Serialize over String fields cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice",
        }
    }
}

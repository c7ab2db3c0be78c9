use serde::{Deserialize, Serialize};

/// Content of the notice sent to peers when a connection joins the hub.
pub const JOINED_NOTICE: &str = "new user connected";

/// Content of the notice sent to peers when a connection leaves the hub.
pub const LEFT_NOTICE: &str = "user disconnected";

/// The JSON envelope carried in every text frame.
///
/// Both fields are always written. On the way in they are optional and fall
/// back to an empty string, so `{}` is a valid (if useless) envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub content: String,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
        }
    }

    pub fn joined(sender: impl Into<String>) -> Self {
        Self::new(sender, JOINED_NOTICE)
    }

    pub fn left(sender: impl Into<String>) -> Self {
        Self::new(sender, LEFT_NOTICE)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

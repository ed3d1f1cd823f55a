// JSON application envelopes carried in data frames.
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{Error, Result};

/// Fixed vocabulary of the `option` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeOption {
    Login,
    Subscribe,
    Unsubscribe,
    Publish,
    Pong,
    Ping,
    Info,
    Error,
}

impl EnvelopeOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Pong => "pong",
            Self::Ping => "ping",
            Self::Info => "info",
            Self::Error => "error",
        }
    }

    pub fn parse(option: &str) -> Option<Self> {
        let parsed = match option {
            "login" => Self::Login,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "publish" => Self::Publish,
            "pong" => Self::Pong,
            "ping" => Self::Ping,
            "info" => Self::Info,
            "error" => Self::Error,
            _ => return None,
        };
        Some(parsed)
    }
}

/// `{"option": .., "data": ..}` as exchanged between clients and the hub.
///
/// ```
/// use simhub_wire::{Envelope, EnvelopeOption};
///
/// let envelope = Envelope::subscribe("room1");
/// let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
/// assert_eq!(decoded.kind(), Some(EnvelopeOption::Subscribe));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub option: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(option: EnvelopeOption, data: Option<Value>) -> Self {
        Self {
            option: option.as_str().to_string(),
            data,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EnvelopeOption::Info, Some(json!({ "msg": message.into() })))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            EnvelopeOption::Error,
            Some(json!({ "error": message.into() })),
        )
    }

    pub fn ping() -> Self {
        Self::new(EnvelopeOption::Ping, None)
    }

    pub fn pong() -> Self {
        Self::new(EnvelopeOption::Pong, None)
    }

    pub fn login(access_token: impl Into<String>) -> Self {
        Self::new(
            EnvelopeOption::Login,
            Some(json!({ "access_token": access_token.into() })),
        )
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self::new(
            EnvelopeOption::Subscribe,
            Some(json!({ "topic": topic.into() })),
        )
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self::new(
            EnvelopeOption::Unsubscribe,
            Some(json!({ "topic": topic.into() })),
        )
    }

    pub fn publish(topic: impl Into<String>, data: Value) -> Self {
        Self::new(
            EnvelopeOption::Publish,
            Some(json!({ "topic": topic.into(), "data": data })),
        )
    }

    pub fn kind(&self) -> Option<EnvelopeOption> {
        EnvelopeOption::parse(&self.option)
    }

    pub fn is(&self, option: EnvelopeOption) -> bool {
        self.option == option.as_str()
    }

    /// Typed view of `data`; missing or mismatched data yields `T::default()`.
    pub fn data_or_default<T: DeserializeOwned + Default>(&self) -> T {
        self.data
            .as_ref()
            .and_then(|value| T::deserialize(value).ok())
            .unwrap_or_default()
    }

    /// `data` as a JSON object, if it is one.
    pub fn data_object(&self) -> Option<&Map<String, Value>> {
        self.data.as_ref().and_then(Value::as_object)
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(Error::Serialize)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::Deserialize)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginData {
    #[serde(default)]
    pub access_token: String,
}

// `event` is what older simulation clients send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicData {
    #[serde(default, alias = "event")]
    pub topic: String,
}

/// Publish payload as delivered to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishData {
    #[serde(default, alias = "event")]
    pub topic: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user: Option<String>,
}

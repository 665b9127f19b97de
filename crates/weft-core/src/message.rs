use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::types::{ChatMessage, ExecutorId, MessageId};

/// Discriminator naming the runtime type of a payload.
///
/// Handlers are looked up by tag, so two Rust types sharing a tag are
/// interchangeable on the wire.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    pub const JSON: &'static str = "json";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The catch-all tag. A handler registered for it accepts any payload.
    pub fn json() -> Self {
        Self::new(Self::JSON)
    }

    pub fn list_of(inner: &TypeTag) -> Self {
        Self(format!("list<{}>", inner.0))
    }

    pub fn of<T: WorkflowMessage>() -> Self {
        T::type_tag()
    }

    pub fn is_json(&self) -> bool {
        self.0 == Self::JSON
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A type that can travel between executors.
pub trait WorkflowMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn type_tag() -> TypeTag;
}

impl WorkflowMessage for () {
    fn type_tag() -> TypeTag {
        TypeTag::new("unit")
    }
}

impl WorkflowMessage for String {
    fn type_tag() -> TypeTag {
        TypeTag::new("string")
    }
}

impl WorkflowMessage for bool {
    fn type_tag() -> TypeTag {
        TypeTag::new("bool")
    }
}

impl WorkflowMessage for i64 {
    fn type_tag() -> TypeTag {
        TypeTag::new("i64")
    }
}

impl WorkflowMessage for u64 {
    fn type_tag() -> TypeTag {
        TypeTag::new("u64")
    }
}

impl WorkflowMessage for f64 {
    fn type_tag() -> TypeTag {
        TypeTag::new("f64")
    }
}

impl WorkflowMessage for serde_json::Value {
    fn type_tag() -> TypeTag {
        TypeTag::json()
    }
}

impl WorkflowMessage for ChatMessage {
    fn type_tag() -> TypeTag {
        TypeTag::new("chat_message")
    }
}

impl<T: WorkflowMessage> WorkflowMessage for Vec<T> {
    fn type_tag() -> TypeTag {
        TypeTag::list_of(&T::type_tag())
    }
}

/// A tagged, JSON-encoded message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub tag: TypeTag,
    pub value: serde_json::Value,
}

impl Payload {
    pub fn new<T: WorkflowMessage>(value: &T) -> Result<Self> {
        Ok(Self {
            tag: T::type_tag(),
            value: serde_json::to_value(value)?,
        })
    }

    pub fn from_json(tag: TypeTag, value: serde_json::Value) -> Self {
        Self { tag, value }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Self {
            tag: String::type_tag(),
            value: serde_json::Value::String(s.into()),
        }
    }

    pub fn is<T: WorkflowMessage>(&self) -> bool {
        self.tag == T::type_tag()
    }

    /// Decode into `T`. The tag must match unless `T` is the catch-all JSON type.
    pub fn decode<T: WorkflowMessage>(&self) -> Result<T> {
        let expected = T::type_tag();
        if !expected.is_json() && expected != self.tag {
            return Err(WeftError::TypeMismatch {
                expected: expected.to_string(),
                actual: self.tag.to_string(),
            });
        }
        Ok(serde_json::from_value(self.value.clone())?)
    }

    /// Build the aggregate delivered by a fan-in join.
    ///
    /// The result is tagged `list<T>` when every part shares tag `T`,
    /// `list<json>` otherwise.
    pub fn list(parts: Vec<Payload>) -> Self {
        let inner = match parts.first() {
            Some(first) if parts.iter().all(|p| p.tag == first.tag) => first.tag.clone(),
            _ => TypeTag::json(),
        };
        Self {
            tag: TypeTag::list_of(&inner),
            value: serde_json::Value::Array(parts.into_iter().map(|p| p.value).collect()),
        }
    }
}

/// Routing and delivery metadata carried with every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ExecutorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ExecutorId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self {
            id: MessageId::new(),
            correlation_id: None,
            source: None,
            target: None,
            created_at: Utc::now(),
            priority: 0,
            timeout_ms: None,
            retries: 0,
            max_retries: 0,
        }
    }
}

/// A payload in flight between executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: Payload,
    pub meta: MessageMeta,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            meta: MessageMeta::default(),
        }
    }

    pub fn of<T: WorkflowMessage>(value: &T) -> Result<Self> {
        Ok(Self::new(Payload::new(value)?))
    }

    pub fn with_source(mut self, source: impl Into<ExecutorId>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<ExecutorId>) -> Self {
        self.meta.target = Some(target.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.meta.correlation_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.meta.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.meta.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.meta.max_retries = max_retries;
        self
    }

    /// The next delivery attempt of this message.
    ///
    /// Fails with `MaxRetriesExceeded` once `retries == max_retries`, so a
    /// message created with `max_retries = n` is retried at most `n` times.
    pub fn with_retry(&self) -> Result<Self> {
        if self.meta.retries >= self.meta.max_retries {
            return Err(WeftError::MaxRetriesExceeded {
                message_id: self.meta.id.to_string(),
                max_retries: self.meta.max_retries,
            });
        }
        let mut next = self.clone();
        next.meta.retries += 1;
        Ok(next)
    }

    pub fn tag(&self) -> &TypeTag {
        &self.payload.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: String,
    }

    impl WorkflowMessage for Order {
        fn type_tag() -> TypeTag {
            TypeTag::new("order")
        }
    }

    #[test]
    fn test_list_tags_nest() {
        assert_eq!(Vec::<String>::type_tag().as_str(), "list<string>");
        assert_eq!(Vec::<Vec<i64>>::type_tag().as_str(), "list<list<i64>>");
    }

    #[test]
    fn test_decode_checks_tag() {
        let p = Payload::new(&Order { id: "123".into() }).unwrap();
        assert!(p.is::<Order>());
        assert_eq!(p.decode::<Order>().unwrap().id, "123");

        let err = p.decode::<String>().unwrap_err();
        assert!(matches!(err, WeftError::TypeMismatch { .. }));

        // The JSON catch-all accepts anything.
        let v: serde_json::Value = p.decode().unwrap();
        assert_eq!(v["id"], "123");
    }

    #[test]
    fn test_fan_in_list_tagging() {
        let same = Payload::list(vec![Payload::text("a"), Payload::text("b")]);
        assert_eq!(same.tag.as_str(), "list<string>");
        assert_eq!(same.decode::<Vec<String>>().unwrap(), vec!["a", "b"]);

        let mixed = Payload::list(vec![Payload::text("a"), Payload::new(&1i64).unwrap()]);
        assert_eq!(mixed.tag.as_str(), "list<json>");
    }

    #[test]
    fn test_retry_budget() {
        let env = Envelope::new(Payload::text("x")).with_max_retries(2);
        let first = env.with_retry().unwrap();
        let second = first.with_retry().unwrap();
        assert_eq!(second.meta.retries, 2);
        assert_eq!(second.meta.id, env.meta.id);

        match second.with_retry() {
            Err(WeftError::MaxRetriesExceeded { max_retries, .. }) => assert_eq!(max_retries, 2),
            other => panic!("expected MaxRetriesExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_retry_budget_fails_immediately() {
        let env = Envelope::new(Payload::text("x"));
        assert!(env.with_retry().is_err());
    }

    #[test]
    fn test_envelope_serde() {
        let env = Envelope::new(Payload::text("hi"))
            .with_source("a")
            .with_target("b")
            .with_priority(5);
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}

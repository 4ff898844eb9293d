use bytes::Bytes;

use crate::error::MqError;

/// A single outbound message request.
///
/// Exactly one of `queue` and `topic` must be set. Optional headers are only
/// forwarded to the broker when they hold a non-default value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishInput {
    pub body: Bytes,
    pub content_type: String,
    pub queue: String,
    pub topic: String,
    /// Expiry in milliseconds (`0` = never)
    pub expires: u64,
    pub message_id: String,
    pub persistent: bool,
    /// Priority (`0` = broker default)
    pub priority: u8,
}

/// Validated destination selector of a [`PublishInput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination<'a> {
    Queue(&'a str),
    Topic(&'a str),
}

impl PublishInput {
    /// Message for `queue` with the given body.
    pub fn to_queue(queue: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            queue: queue.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Message for `topic` with the given body.
    pub fn to_topic(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn expires(mut self, millis: u64) -> Self {
        self.expires = millis;
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Resolve the destination selector.
    ///
    /// Fails with [`MqError::UnknownDestination`] when neither name is set and
    /// with [`MqError::AmbiguousDestination`] when both are.
    pub fn destination(&self) -> Result<Destination<'_>, MqError> {
        match (self.queue.is_empty(), self.topic.is_empty()) {
            (false, true) => Ok(Destination::Queue(&self.queue)),
            (true, false) => Ok(Destination::Topic(&self.topic)),
            (true, true) => Err(MqError::UnknownDestination),
            (false, false) => Err(MqError::AmbiguousDestination),
        }
    }
}

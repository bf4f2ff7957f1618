//! The `Message` trait binds a payload type to its topic and gives every payload a stable
//! idempotency key.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Opaque key/value headers published alongside a message.
pub type Headers = BTreeMap<String, String>;

/// A payload that can be published to a topic.
///
/// There is one topic per message type. The topic name is usually derived from the type name with
/// `#[derive(Message)]`, and the idempotency key from a field marked `#[message(key)]`.
///
/// ```ignore
/// use herald_derive::Message;
///
/// #[derive(serde::Serialize, serde::Deserialize, Message)]
/// struct OrderPlaced {
///     #[message(key)]
///     order_id: uuid::Uuid,
///     total: u64,
/// }
///
/// assert_eq!(OrderPlaced::topic_name(), "order-placed");
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The name of the topic this message type is published to.
    fn topic_name() -> &'static str;

    /// The natural identifier of this message. Publishing two messages with the same key to the
    /// same topic fails with a duplicate event error.
    fn idempotency_key(&self) -> String;
}

/// Serializes a message into the opaque bytes stored with an event.
pub fn encode_message<M: Message>(message: &M) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Deserializes the opaque bytes stored with an event back into a message.
pub fn decode_message<M: Message>(bytes: &[u8]) -> Result<M, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Serializes headers into their stored representation.
pub fn encode_headers(headers: &Headers) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(headers)
}

/// Deserializes stored headers. Empty bytes decode to empty headers.
pub fn decode_headers(bytes: &[u8]) -> Result<Headers, serde_json::Error> {
    if bytes.is_empty() {
        return Ok(Headers::new());
    }
    serde_json::from_slice(bytes)
}

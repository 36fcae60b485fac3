use serde_json::Value;

/// Message content: a JSON object.
///
/// Binary payloads travel as base64 strings (see the `"bytes"` key of
/// WebSocket frames); everything else is plain JSON.
pub type Content = serde_json::Map<String, Value>;

/// Key under which a message names the channel its responses go to.
pub const REPLY_CHANNEL_KEY: &str = "reply_channel";

/// Builds `Content` from a JSON value.
///
/// Non-object values are wrapped as `{"value": <value>}` so every payload
/// remains a mapping.
#[must_use]
pub fn content_from(value: Value) -> Content {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Content::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Top-level keys of `content`, in their stored order.
#[must_use]
pub fn content_keys(content: &Content) -> Vec<String> {
    content.keys().cloned().collect()
}

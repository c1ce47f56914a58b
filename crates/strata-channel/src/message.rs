use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::Arc,
};

use bytes::Bytes;
use strata_core::PropertyValue;

/// 消息属性：以字符串为键的类型擦除值集合。
///
/// 传输层用它附加远端地址、缓冲接收标记等元数据；同一键只保存一个值。
#[derive(Clone, Default)]
pub struct MessageProperties {
    entries: HashMap<String, PropertyValue>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    pub fn insert_value(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.entries.insert(key.into(), value);
    }

    /// 按键读取并向下转型；类型不符时返回 `None`。
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for MessageProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// 通道层传递的消息。
///
/// # 契约说明（What）
/// - `action` 标识操作，`message_id` 可选；
/// - `body` 为不透明载荷，通道层不解释其内容；
/// - 消息在队列中被视为可释放条目，丢弃即释放。
#[derive(Clone)]
pub struct Message {
    action: String,
    message_id: Option<String>,
    body: Bytes,
    properties: MessageProperties,
}

impl Message {
    pub fn new(action: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            action: action.into(),
            message_id: None,
            body: body.into(),
            properties: MessageProperties::new(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("action", &self.action)
            .field("message_id", &self.message_id)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_property_lookup() {
        let mut message = Message::new("urn:echo", Bytes::from_static(b"hi")).with_message_id("m-1");
        message.properties_mut().insert("remote", String::from("10.0.0.1:9000"));

        let remote = message
            .properties()
            .get::<String>("remote")
            .expect("属性应存在");
        assert_eq!(remote.as_str(), "10.0.0.1:9000");
        assert!(message.properties().get::<u32>("remote").is_none(), "类型不符应返回 None");
        assert_eq!(message.message_id(), Some("m-1"));
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error context information attached to a classified error
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub extension_id: Option<String>,
    pub context_id: Option<String>,
    pub user_id: Option<String>,
    pub additional: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension_id(mut self, extension_id: impl Into<String>) -> Self {
        self.extension_id = Some(extension_id.into());
        self
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn add_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.additional.insert(key.into(), value.into());
        self
    }

    /// Flatten into the string map carried by errors on the wire.
    /// Identity fields use the keys `extensionId`, `contextId` and `userId`.
    pub fn into_map(self) -> BTreeMap<String, String> {
        let mut map = self.additional;
        if let Some(extension_id) = self.extension_id {
            map.insert("extensionId".to_string(), extension_id);
        }
        if let Some(context_id) = self.context_id {
            map.insert("contextId".to_string(), context_id);
        }
        if let Some(user_id) = self.user_id {
            map.insert("userId".to_string(), user_id);
        }
        map
    }
}

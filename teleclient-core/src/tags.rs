//! Context tags attached to every telemetry item.
//!
//! `TelemetryTags` is a copy-on-write map: clones share storage until one side
//! writes, so a snapshot taken at Track time is never affected by later edits
//! to the client's defaults.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::TelemetryOperation;

/// Tag keys understood by the ingestion endpoint.
/// Keep these stable; changing them is a breaking change for dashboards.
pub mod keys {
    pub const APPLICATION_VERSION: &str = "ai.application.ver";
    pub const CLOUD_ROLE: &str = "ai.cloud.role";
    pub const CLOUD_ROLE_INSTANCE: &str = "ai.cloud.roleInstance";
    pub const INTERNAL_SDK_VERSION: &str = "ai.internal.sdkVersion";
    pub const LOCATION_IP: &str = "ai.location.ip";
    pub const OPERATION_ID: &str = "ai.operation.id";
    pub const OPERATION_NAME: &str = "ai.operation.name";
    pub const OPERATION_PARENT_ID: &str = "ai.operation.parentId";
    pub const SESSION_ID: &str = "ai.session.id";
    pub const USER_AUTH_USER_ID: &str = "ai.user.authUserId";
    pub const USER_ID: &str = "ai.user.id";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryTags {
    inner: Arc<BTreeMap<String, String>>,
}

impl TelemetryTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<BTreeMap<_, _>>();
        Self {
            inner: Arc::new(map),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set a tag in place. Other clones keep their old view.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        Arc::make_mut(&mut self.inner).insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        if !self.inner.contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut self.inner).remove(key)
    }

    /// Fluent variant of `insert`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns `self` overlaid with `overlay`; overlay values win on collision.
    pub fn merged(&self, overlay: &TelemetryTags) -> TelemetryTags {
        if overlay.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return overlay.clone();
        }
        let mut out = self.clone();
        let map = Arc::make_mut(&mut out.inner);
        for (k, v) in overlay.inner.iter() {
            map.insert(k.clone(), v.clone());
        }
        out
    }

    /// Overlay the non-empty fields of an operation as operation tags.
    pub fn with_operation(mut self, operation: &TelemetryOperation) -> Self {
        if !operation.id.is_empty() {
            self.insert(keys::OPERATION_ID, operation.id.clone());
        }
        if !operation.name.is_empty() {
            self.insert(keys::OPERATION_NAME, operation.name.clone());
        }
        if !operation.parent_id.is_empty() {
            self.insert(keys::OPERATION_PARENT_ID, operation.parent_id.clone());
        }
        self
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.inner.as_ref().clone()
    }

    // Typed shorthands for the well-known keys

    pub fn cloud_role(&self) -> Option<&str> {
        self.get(keys::CLOUD_ROLE)
    }
    pub fn set_cloud_role(&mut self, v: impl Into<String>) {
        self.insert(keys::CLOUD_ROLE, v);
    }
    pub fn cloud_role_instance(&self) -> Option<&str> {
        self.get(keys::CLOUD_ROLE_INSTANCE)
    }
    pub fn set_cloud_role_instance(&mut self, v: impl Into<String>) {
        self.insert(keys::CLOUD_ROLE_INSTANCE, v);
    }
    pub fn operation_id(&self) -> Option<&str> {
        self.get(keys::OPERATION_ID)
    }
    pub fn set_operation_id(&mut self, v: impl Into<String>) {
        self.insert(keys::OPERATION_ID, v);
    }
    pub fn operation_name(&self) -> Option<&str> {
        self.get(keys::OPERATION_NAME)
    }
    pub fn set_operation_name(&mut self, v: impl Into<String>) {
        self.insert(keys::OPERATION_NAME, v);
    }
    pub fn operation_parent_id(&self) -> Option<&str> {
        self.get(keys::OPERATION_PARENT_ID)
    }
    pub fn set_operation_parent_id(&mut self, v: impl Into<String>) {
        self.insert(keys::OPERATION_PARENT_ID, v);
    }
    pub fn user_id(&self) -> Option<&str> {
        self.get(keys::USER_ID)
    }
    pub fn set_user_id(&mut self, v: impl Into<String>) {
        self.insert(keys::USER_ID, v);
    }
    pub fn user_auth_user_id(&self) -> Option<&str> {
        self.get(keys::USER_AUTH_USER_ID)
    }
    pub fn set_user_auth_user_id(&mut self, v: impl Into<String>) {
        self.insert(keys::USER_AUTH_USER_ID, v);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TelemetryTags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

impl From<BTreeMap<String, String>> for TelemetryTags {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self {
            inner: Arc::new(map),
        }
    }
}

//! Resource keys, profiles and intensity vectors
//!
//! A profile fixes the closed set of keys a deployment understands. The business profile
//! (`processing`, `storage`, `traffic`, `orders`, `completions`) is the default; the legacy
//! profile keeps the older `cpu` / `memory` / `network` trio.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Highest accepted intensity level.
pub const MAX_LEVEL: u8 = 100;

/// Validation failures on incoming level vectors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid resource type: {key}")]
    UnknownResource { key: String },
    #[error("Invalid value for {key}: {value} (must be an integer between 0 and 100)")]
    InvalidLevel { key: String, value: String },
    #[error("levels must be a JSON object, got {0}")]
    NotAnObject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKey {
    Processing,
    Storage,
    Traffic,
    Orders,
    Completions,
    Cpu,
    Memory,
    Network,
}

/// What a key drives on the node side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRole {
    Cpu,
    Memory,
    Traffic,
    /// Drives the record workload and counts in the running-state sum
    Workload,
}

impl ResourceKey {
    pub const BUSINESS: [ResourceKey; 5] = [
        ResourceKey::Processing,
        ResourceKey::Storage,
        ResourceKey::Traffic,
        ResourceKey::Orders,
        ResourceKey::Completions,
    ];

    pub const LEGACY: [ResourceKey; 3] = [ResourceKey::Cpu, ResourceKey::Memory, ResourceKey::Network];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKey::Processing => "processing",
            ResourceKey::Storage => "storage",
            ResourceKey::Traffic => "traffic",
            ResourceKey::Orders => "orders",
            ResourceKey::Completions => "completions",
            ResourceKey::Cpu => "cpu",
            ResourceKey::Memory => "memory",
            ResourceKey::Network => "network",
        }
    }

    pub fn role(&self) -> ResourceRole {
        match self {
            ResourceKey::Processing | ResourceKey::Cpu => ResourceRole::Cpu,
            ResourceKey::Storage | ResourceKey::Memory => ResourceRole::Memory,
            ResourceKey::Traffic | ResourceKey::Network => ResourceRole::Traffic,
            ResourceKey::Orders | ResourceKey::Completions => ResourceRole::Workload,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKey::BUSINESS
            .iter()
            .chain(ResourceKey::LEGACY.iter())
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| ValidationError::UnknownResource { key: s.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceProfile {
    #[default]
    Business,
    Legacy,
}

impl ResourceProfile {
    pub fn keys(&self) -> &'static [ResourceKey] {
        match self {
            ResourceProfile::Business => &ResourceKey::BUSINESS,
            ResourceProfile::Legacy => &ResourceKey::LEGACY,
        }
    }

    pub fn recognizes(&self, key: ResourceKey) -> bool {
        self.keys().contains(&key)
    }

    /// Key carrying `role` in this profile, if any
    pub fn key_for(&self, role: ResourceRole) -> Option<ResourceKey> {
        self.keys().iter().find(|k| k.role() == role).copied()
    }
}

/// Map from resource key to a level in `0..=100`.
///
/// Deserializing goes through serde without range checks and is meant for trusted bodies
/// (node replies). Client input goes through [`IntensityVector::parse`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntensityVector(BTreeMap<ResourceKey, u8>);

impl IntensityVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key of the profile at level 0
    pub fn zeroed(profile: ResourceProfile) -> Self {
        Self(profile.keys().iter().map(|k| (*k, 0)).collect())
    }

    pub fn with(mut self, key: ResourceKey, level: u8) -> Self {
        self.set(key, level);
        self
    }

    pub fn set(&mut self, key: ResourceKey, level: u8) {
        self.0.insert(key, level.min(MAX_LEVEL));
    }

    /// Level of `key`, 0 when absent
    pub fn get(&self, key: ResourceKey) -> u8 {
        self.0.get(&key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: ResourceKey) -> bool {
        self.0.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKey, u8)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// Partial merge: keys present in `partial` overwrite, the others are left alone.
    pub fn merge(&mut self, partial: &IntensityVector) {
        for (key, level) in partial.iter() {
            self.0.insert(key, level);
        }
    }

    pub fn sum(&self) -> u32 {
        self.0.values().map(|v| u32::from(*v)).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.sum() == 0
    }

    /// Level of whichever key plays `role` under `profile`
    pub fn level_for(&self, profile: ResourceProfile, role: ResourceRole) -> u8 {
        profile.key_for(role).map(|k| self.get(k)).unwrap_or(0)
    }

    /// Copy holding only the keys listed in `keys`
    pub fn restricted_to(&self, keys: &[ResourceKey]) -> IntensityVector {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .map(|(k, v)| (*k, *v))
                .collect(),
        )
    }

    /// Validates a client-supplied JSON value against `profile`.
    pub fn parse(profile: ResourceProfile, value: &Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Self::from_map(profile, map),
            other => Err(ValidationError::NotAnObject(json_kind(other).to_string())),
        }
    }

    /// Range is checked before the key, so an out-of-range value is always reported with
    /// both its key and its value.
    pub fn from_map(profile: ResourceProfile, map: &Map<String, Value>) -> Result<Self, ValidationError> {
        let mut vector = IntensityVector::new();
        for (name, raw) in map {
            let level = raw
                .as_u64()
                .filter(|v| *v <= u64::from(MAX_LEVEL))
                .ok_or_else(|| ValidationError::InvalidLevel {
                    key: name.clone(),
                    value: raw.to_string(),
                })?;

            let key = name
                .parse::<ResourceKey>()
                .ok()
                .filter(|k| profile.recognizes(*k))
                .ok_or_else(|| ValidationError::UnknownResource { key: name.clone() })?;

            vector.0.insert(key, level as u8);
        }
        Ok(vector)
    }
}

impl FromIterator<(ResourceKey, u8)> for IntensityVector {
    fn from_iter<I: IntoIterator<Item = (ResourceKey, u8)>>(iter: I) -> Self {
        let mut vector = IntensityVector::new();
        for (key, level) in iter {
            vector.set(key, level);
        }
        vector
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_accepts_business_keys() {
        let v = IntensityVector::parse(
            ResourceProfile::Business,
            &json!({"processing": 80, "storage": 0, "completions": 100}),
        )
        .unwrap();
        assert_eq!(v.get(ResourceKey::Processing), 80);
        assert_eq!(v.get(ResourceKey::Completions), 100);
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn test_out_of_range_cites_key_and_value() {
        for profile in [ResourceProfile::Business, ResourceProfile::Legacy] {
            let err = IntensityVector::parse(profile, &json!({"cpu": 150})).unwrap_err();
            assert_eq!(
                err,
                ValidationError::InvalidLevel { key: "cpu".into(), value: "150".into() }
            );
            let msg = err.to_string();
            assert!(msg.contains("cpu") && msg.contains("150"), "{msg}");
        }
    }

    #[test]
    fn test_non_integer_values_rejected() {
        for bad in [json!(50.5), json!(-1), json!("50"), json!(null), json!(true)] {
            let err = IntensityVector::parse(ResourceProfile::Business, &json!({"storage": bad}))
                .unwrap_err();
            assert!(matches!(err, ValidationError::InvalidLevel { ref key, .. } if key == "storage"));
        }
    }

    #[test]
    fn test_unknown_key_depends_on_profile() {
        let err = IntensityVector::parse(ResourceProfile::Business, &json!({"cpu": 10})).unwrap_err();
        assert_eq!(err, ValidationError::UnknownResource { key: "cpu".into() });

        let err = IntensityVector::parse(ResourceProfile::Legacy, &json!({"orders": 10})).unwrap_err();
        assert_eq!(err.to_string(), "Invalid resource type: orders");

        let ok = IntensityVector::parse(ResourceProfile::Legacy, &json!({"cpu": 10})).unwrap();
        assert_eq!(ok.level_for(ResourceProfile::Legacy, ResourceRole::Cpu), 10);
    }

    #[test]
    fn test_parse_rejects_non_object() {
        let err = IntensityVector::parse(ResourceProfile::Business, &json!([1, 2])).unwrap_err();
        assert_eq!(err, ValidationError::NotAnObject("an array".into()));
    }

    #[test]
    fn test_merge_is_partial() {
        let mut current = IntensityVector::zeroed(ResourceProfile::Business)
            .with(ResourceKey::Storage, 40)
            .with(ResourceKey::Orders, 10);
        let partial = IntensityVector::new().with(ResourceKey::Processing, 80);

        current.merge(&partial);

        assert_eq!(current.get(ResourceKey::Processing), 80);
        assert_eq!(current.get(ResourceKey::Storage), 40);
        assert_eq!(current.get(ResourceKey::Orders), 10);
        assert_eq!(current.len(), 5);
        assert_eq!(current.sum(), 130);
    }

    #[test]
    fn test_restricted_to_keeps_only_subscribed_keys() {
        let v = IntensityVector::new()
            .with(ResourceKey::Cpu, 20)
            .with(ResourceKey::Memory, 30);
        let only_cpu = v.restricted_to(&[ResourceKey::Cpu]);
        assert_eq!(only_cpu.len(), 1);
        assert_eq!(only_cpu.get(ResourceKey::Cpu), 20);
        assert!(v.restricted_to(&[ResourceKey::Network]).is_empty());
    }

    #[test]
    fn test_serializes_as_flat_object() {
        let v = IntensityVector::new().with(ResourceKey::Traffic, 5);
        assert_eq!(serde_json::to_value(&v).unwrap(), json!({"traffic": 5}));
    }
}

//! Value types shared by the version store and the checking lock

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Semantic content of a version. Keys are kept sorted so that two versions
/// with the same pairs serialize identically.
pub type Version = BTreeMap<String, String>;

/// Metadata attached to a version by the check that discovered it
pub type Metadata = Vec<MetadataField>;

/// Name of a partition of a resource's version history
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Space(pub String);

impl Space {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Space {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A version as reported by a check, together with the space it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceVersion {
    pub space: Space,
    pub version: Version,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A custom resource type definition pinned to a version. Resource configs
/// built on top of a custom type are distinct per pinned version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub source: serde_json::Value,
    pub version: Version,
}

/// The pipeline resource a scope belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub team_name: String,
    pub pipeline_name: String,
    pub resource_name: String,
}

/// Build a `Version` from literal pairs
pub fn version<const N: usize>(pairs: [(&str, &str); N]) -> Version {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Canonical storage form of a version: JSON with sorted keys
pub(crate) fn encode_version(version: &Version) -> Result<String, serde_json::Error> {
    serde_json::to_string(version)
}

pub(crate) fn decode_version(raw: &str) -> Result<Version, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Deduplication key of a resource config.
///
/// Covers the base type, the source, and every custom type the base type
/// transitively resolves through, so that re-pinning any type in the chain
/// yields a new config.
pub(crate) fn resource_config_digest(
    base_type: &str,
    source: &serde_json::Value,
    resource_types: &[VersionedResourceType],
) -> Result<String, serde_json::Error> {
    let mut chain: Vec<&VersionedResourceType> = Vec::new();
    let mut current = base_type;
    loop {
        let parent = resource_types.iter().find(|t| t.name == current);
        match parent {
            Some(parent) if !chain.iter().any(|seen| seen.name == parent.name) => {
                chain.push(parent);
                current = &parent.type_;
            }
            _ => break,
        }
    }

    let identity = serde_json::json!({
        "type": base_type,
        "source": canonicalize(source),
        "resource_types": chain
            .iter()
            .map(|t| serde_json::json!({
                "name": t.name,
                "type": t.type_,
                "source": canonicalize(&t.source),
                "version": t.version,
            }))
            .collect::<Vec<_>>(),
    });

    let encoded = serde_json::to_vec(&identity)?;
    Ok(format!("{:x}", Sha256::digest(&encoded)))
}

/// Rebuild objects so that keys come out sorted regardless of how the
/// caller's map was ordered.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<_, _> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

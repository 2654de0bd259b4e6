//! Typed hand-off from the template collaborator.
//!
//! The template language and its parser live outside this workspace; what arrives
//! here is already resolved into plain values. A `TemplateSet` holds the instance
//! template and the table of volume definitions its attachments point into.

use crate::Tag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse template: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("template field '{0}' must not be empty")]
    MissingField(&'static str),
    #[error("attachment on {device} references unknown volume '{volume_ref}'")]
    UnknownVolume { device: String, volume_ref: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VolumeAttachment {
    pub device: String,
    pub volume_ref: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct VolumeSpec {
    pub size_gb: Option<u32>,
    pub iops: Option<u32>,
    pub snapshot_id: Option<String>,
    pub volume_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResourceTemplate {
    pub image_id: String,
    pub instance_type: String,
    pub availability_zone: Option<String>,
    pub private_ip_address: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeAttachment>,
    /// Raw startup script, appended verbatim after the bootstrap preamble.
    pub user_data: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl ResourceTemplate {
    pub fn new(image_id: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            instance_type: instance_type.into(),
            availability_zone: None,
            private_ip_address: None,
            security_group_ids: Vec::new(),
            security_groups: Vec::new(),
            key_name: None,
            volumes: Vec::new(),
            user_data: None,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TemplateSet {
    pub instance: ResourceTemplate,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeSpec>,
}

impl TemplateSet {
    pub fn new(instance: ResourceTemplate) -> Self {
        Self {
            instance,
            volumes: BTreeMap::new(),
        }
    }

    /// Bind `spec` under `volume_ref` and attach it on `device`.
    pub fn with_volume(mut self, device: &str, volume_ref: &str, spec: VolumeSpec) -> Self {
        self.instance.volumes.push(VolumeAttachment {
            device: device.to_string(),
            volume_ref: volume_ref.to_string(),
        });
        self.volumes.insert(volume_ref.to_string(), spec);
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, TemplateError> {
        let set: TemplateSet = serde_json::from_str(raw)?;
        set.validate()?;
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.instance.image_id.trim().is_empty() {
            return Err(TemplateError::MissingField("image_id"));
        }
        if self.instance.instance_type.trim().is_empty() {
            return Err(TemplateError::MissingField("instance_type"));
        }
        for attachment in &self.instance.volumes {
            if !self.volumes.contains_key(&attachment.volume_ref) {
                return Err(TemplateError::UnknownVolume {
                    device: attachment.device.clone(),
                    volume_ref: attachment.volume_ref.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn volume(&self, volume_ref: &str) -> Option<&VolumeSpec> {
        self.volumes.get(volume_ref)
    }

    /// Volume spec bound to the attachment declared on `device`, if any.
    pub fn volume_for_device(&self, device: &str) -> Option<(&VolumeAttachment, Option<&VolumeSpec>)> {
        self.instance
            .volumes
            .iter()
            .find(|a| a.device == device)
            .map(|a| (a, self.volumes.get(&a.volume_ref)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "instance": {
            "image_id": "ami-123",
            "instance_type": "m1.small",
            "availability_zone": "us-east-1a",
            "volumes": [{"device": "/dev/sdb", "volume_ref": "data"}],
            "tags": [{"key": "team", "value": "infra"}]
        },
        "volumes": {
            "data": {"size_gb": 20, "volume_type": "gp2", "tags": [{"key": "tier", "value": "data"}]}
        }
    }"#;

    #[test]
    fn parses_and_resolves_device() {
        let set = TemplateSet::from_json_str(SAMPLE).unwrap();
        assert_eq!(set.instance.image_id, "ami-123");
        let (attachment, spec) = set.volume_for_device("/dev/sdb").unwrap();
        assert_eq!(attachment.volume_ref, "data");
        assert_eq!(spec.unwrap().size_gb, Some(20));
        assert!(set.volume_for_device("/dev/sdc").is_none());
    }

    #[test]
    fn rejects_dangling_volume_reference() {
        let raw = SAMPLE.replace("\"volume_ref\": \"data\"", "\"volume_ref\": \"missing\"");
        let err = TemplateSet::from_json_str(&raw).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownVolume { .. }));
    }

    #[test]
    fn rejects_blank_instance_type() {
        let raw = SAMPLE.replace("m1.small", " ");
        assert!(matches!(
            TemplateSet::from_json_str(&raw),
            Err(TemplateError::MissingField("instance_type"))
        ));
    }
}

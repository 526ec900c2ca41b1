use anyhow::Result;
use hns_forest::{Gvk, SyncMode};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Worker counts and loop intervals (`[general]` section).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Parallel hierarchy reconciliations.
    pub hierarchy_workers: usize,
    /// Parallel object reconciliations per tracked kind.
    pub object_workers: usize,
    /// Seconds between drift patrols.
    pub patrol_interval_secs: u64,
    /// Seconds between metric reports.
    pub report_interval_secs: u64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            hierarchy_workers: 4,
            object_workers: 2,
            patrol_interval_secs: 60,
            report_interval_secs: 60,
        }
    }
}

/// Propagation behavior (`[propagation]` section).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationSettings {
    /// Leave user-edited copies alone instead of overwriting them.
    pub protect_overrides: bool,
    /// Namespaces the controller never touches.
    pub excluded_namespaces: Vec<String>,
}

/// One tracked kind (`[[resources]]` tables).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// API group; empty for the core group.
    pub group: String,
    /// API version.
    pub version: String,
    /// Kind name.
    pub kind: String,
    /// Synchronization mode.
    pub mode: SyncMode,
}

/// The controller configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker counts and intervals.
    pub general: GeneralSettings,
    /// Propagation behavior.
    pub propagation: PropagationSettings,
    /// Tracked kinds.
    pub resources: Vec<ResourceSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        let resource = |group: &str, version: &str, kind: &str| ResourceSettings {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            mode: SyncMode::Propagate,
        };
        Self {
            general: Default::default(),
            propagation: Default::default(),
            resources: vec![
                resource("rbac.authorization.k8s.io", "v1", "Role"),
                resource("rbac.authorization.k8s.io", "v1", "RoleBinding"),
                resource("", "v1", "Secret"),
            ],
        }
    }
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// The tracked kinds with their modes.
    pub fn tracked(&self) -> Vec<(Gvk, SyncMode)> {
        self.resources
            .iter()
            .map(|r| (Gvk::new(&r.group, &r.version, &r.kind), r.mode))
            .collect()
    }
}

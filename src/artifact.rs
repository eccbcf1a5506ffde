//! The immutable result of a successful build.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::BuildError;
use crate::state::BuildState;

/// A snapshot ready for use, with the regions that hold it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Artifact {
    /// Snapshot name.
    pub snapshot_name: String,
    /// Snapshot image id.
    pub snapshot_id: u64,
    /// Regions holding the snapshot, sorted.
    pub regions: Vec<String>,
    /// Build details: `droplet_name`, `droplet_size`, `build_region`,
    /// `source_image_id` and `transfers`.
    pub metadata: BTreeMap<String, Value>,
}

impl Artifact {
    /// Builds the artifact from the state of a build that finished without
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingState`] when the droplet or snapshot
    /// slot was never written.
    pub fn from_state(state: &BuildState) -> Result<Self, BuildError> {
        let droplet = state.require_droplet()?;
        let snapshot = state
            .snapshot
            .as_ref()
            .ok_or(BuildError::MissingState("snapshot"))?;
        let transfers = serde_json::to_value(&state.transfers).map_err(|err| BuildError::Io {
            path: String::from("<artifact>"),
            message: err.to_string(),
        })?;

        let metadata = BTreeMap::from([
            (String::from("droplet_name"), Value::from(droplet.name.clone())),
            (String::from("droplet_size"), Value::from(droplet.size.clone())),
            (String::from("build_region"), Value::from(droplet.region.clone())),
            (
                String::from("source_image_id"),
                Value::from(droplet.source_image_id),
            ),
            (String::from("transfers"), transfers),
        ]);

        let regions = if state.regions.is_empty() {
            vec![snapshot.origin_region.clone()]
        } else {
            state.regions.clone()
        };

        Ok(Self {
            snapshot_name: snapshot.name.clone(),
            snapshot_id: snapshot.id,
            regions,
            metadata,
        })
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "A snapshot was created: '{}' (ID: {}) in regions '{}'",
            self.snapshot_name,
            self.snapshot_id,
            self.regions.join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DropletRecord, SnapshotRecord, Transfer, TransferStatus};

    fn finished_state() -> BuildState {
        let mut state = BuildState::new();
        state.droplet = Some(DropletRecord {
            id: 7,
            name: String::from("dropsmith-build"),
            size: String::from("s-1vcpu-1gb"),
            region: String::from("nyc3"),
            source_image_id: Some(129_211_873),
        });
        state.snapshot = Some(SnapshotRecord {
            id: 99,
            name: String::from("golden"),
            origin_region: String::from("nyc3"),
        });
        state.regions = vec![String::from("nyc3"), String::from("sfo3")];
        state.transfers = vec![Transfer {
            region: String::from("sfo3"),
            status: TransferStatus::Completed,
            action_id: Some(5),
        }];
        state
    }

    #[test]
    fn artifact_carries_snapshot_and_metadata() {
        let artifact = Artifact::from_state(&finished_state())
            .unwrap_or_else(|err| panic!("artifact: {err}"));
        assert_eq!(artifact.snapshot_id, 99);
        assert_eq!(artifact.regions, vec!["nyc3", "sfo3"]);
        assert_eq!(
            artifact.metadata.get("build_region"),
            Some(&Value::from("nyc3"))
        );
        assert_eq!(
            artifact.metadata.get("source_image_id"),
            Some(&Value::from(129_211_873_u64))
        );
        assert_eq!(
            artifact.metadata.get("transfers"),
            Some(&serde_json::json!([
                { "region": "sfo3", "status": "completed", "action_id": 5 }
            ]))
        );
    }

    #[test]
    fn display_lists_regions() {
        let artifact = Artifact::from_state(&finished_state())
            .unwrap_or_else(|err| panic!("artifact: {err}"));
        assert_eq!(
            artifact.to_string(),
            "A snapshot was created: 'golden' (ID: 99) in regions 'nyc3,sfo3'"
        );
    }

    #[test]
    fn missing_snapshot_is_reported() {
        let mut state = finished_state();
        state.snapshot = None;
        assert_eq!(
            Artifact::from_state(&state),
            Err(BuildError::MissingState("snapshot"))
        );
    }
}

//! Upstream truth read from a JSON snapshot.
//!
//! ```json
//! {
//!   "tables":   { "raw.box_scores": { "2024-01-01": 250 } },
//!   "expected": { "analytics": { "2024-01-01": ["p1", "p2"] } }
//! }
//! ```
//!
//! The document is re-read on every call so an external loader can refresh
//! it between dates.

use async_trait::async_trait;
use chrono::NaiveDate;
use phaseflow::core::{EntityId, Phase};
use phaseflow::errors::{PhaseflowError, Result};
use phaseflow::store::UpstreamSource;
use phaseflow::utils::DateRange;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct Snapshot {
    #[serde(default)]
    tables: BTreeMap<String, BTreeMap<NaiveDate, u64>>,
    #[serde(default)]
    expected: BTreeMap<Phase, BTreeMap<NaiveDate, Vec<EntityId>>>,
}

/// Upstream source backed by a snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotUpstream {
    path: PathBuf,
}

impl SnapshotUpstream {
    /// Reads upstream truth from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<Snapshot> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PhaseflowError::configuration(format!(
                    "upstream snapshot {} not found",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| {
            PhaseflowError::Serialization(format!("invalid upstream snapshot {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl UpstreamSource for SnapshotUpstream {
    async fn count_rows(&self, table: &str, range: DateRange) -> Result<u64> {
        let snapshot = self.read().await?;
        let rows = snapshot
            .tables
            .get(table)
            .map_or(0, |by_date| by_date.range(range.start..=range.end).map(|(_, n)| n).sum());
        debug!(table, start = %range.start, end = %range.end, rows, "Counted snapshot rows");
        Ok(rows)
    }

    async fn list_expected_entities(&self, phase: Phase, date: NaiveDate) -> Result<Vec<EntityId>> {
        let mut snapshot = self.read().await?;
        Ok(snapshot
            .expected
            .remove(&phase)
            .and_then(|mut by_date| by_date.remove(&date))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    const SNAPSHOT: &str = r#"{
        "tables": {"raw.box_scores": {"2024-01-01": 200, "2024-01-02": 50, "2024-01-05": 7}},
        "expected": {"analytics": {"2024-01-02": ["p1", "p2"]}}
    }"#;

    #[tokio::test]
    async fn test_counts_and_expected_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upstream.json");
        std::fs::write(&path, SNAPSHOT).unwrap();
        let upstream = SnapshotUpstream::new(&path);

        let range = DateRange::new(d(1), d(2)).unwrap();
        assert_eq!(upstream.count_rows("raw.box_scores", range).await.unwrap(), 250);
        assert_eq!(upstream.count_rows("raw.box_scores", DateRange::single(d(3))).await.unwrap(), 0);
        assert_eq!(upstream.count_rows("raw.injuries", range).await.unwrap(), 0);

        let expected = upstream.list_expected_entities(Phase::Analytics, d(2)).await.unwrap();
        assert_eq!(expected, vec![EntityId::key("p1"), EntityId::key("p2")]);
        assert!(upstream
            .list_expected_entities(Phase::Features, d(2))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upstream.json");
        std::fs::write(&path, "{}").unwrap();
        let upstream = SnapshotUpstream::new(&path);
        let range = DateRange::single(d(1));
        assert_eq!(upstream.count_rows("raw.box_scores", range).await.unwrap(), 0);

        std::fs::write(&path, SNAPSHOT).unwrap();
        assert_eq!(upstream.count_rows("raw.box_scores", range).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = SnapshotUpstream::new(dir.path().join("absent.json"));
        let err = upstream.count_rows("t", DateRange::single(d(1))).await.unwrap_err();
        assert!(matches!(err, PhaseflowError::Configuration(_)));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = SnapshotUpstream::new(&path)
            .count_rows("t", DateRange::single(d(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseflowError::Serialization(_)));
    }
}

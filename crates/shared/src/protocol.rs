use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{DocumentKind, FileId, RootId, SyncMode, SyncStatus};

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|value| !value.is_empty()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub doc_id: String,
    pub source_id: FileId,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    pub name: String,
    pub path_text: String,
    pub parent_id: i64,
    pub modified_at: i64,
    pub created_at: i64,
    pub size: u64,
    pub sha1: String,
    pub in_trash: bool,
    pub is_deleted: bool,
    #[serde(default)]
    pub highlighted_name: String,
}

impl IndexDocument {
    /// Stable identity used to deduplicate result pages.
    pub fn key(&self) -> FileId {
        self.source_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub items: Vec<IndexDocument>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadUrlResponse {
    pub file_id: FileId,
    pub download_url: String,
}

impl DownloadUrlResponse {
    pub fn validate(&self) -> Result<(), String> {
        if self.download_url.is_empty() {
            return Err("download_url must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlStats {
    pub folders_visited: u64,
    pub files_indexed: u64,
    pub pages_fetched: u64,
    pub failed_requests: u64,
    pub started_at: i64,
    pub ended_at: i64,
    #[serde(default)]
    pub files_discovered: u64,
    #[serde(default)]
    pub skipped_files: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootProgress {
    pub root_folder_id: RootId,
    pub status: String,
    #[serde(default)]
    pub estimated_total_docs: Option<u64>,
    pub stats: CrawlStats,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalSyncStats {
    pub changes_fetched: u64,
    pub upserted: u64,
    pub deleted: u64,
    pub skipped_upserts: u64,
    pub skipped_deletes: u64,
    pub cursor_before: i64,
    pub cursor_after: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncVerification {
    pub meili_doc_count: u64,
    pub crawled_doc_count: u64,
    pub discovered_doc_count: u64,
    pub skipped_count: u64,
    pub verified: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Snapshot of the remote sync job as served by `/api/v1/admin/sync`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub status: SyncStatus,
    pub started_at: i64,
    pub updated_at: i64,
    pub roots: Vec<RootId>,
    #[serde(default)]
    pub root_names: BTreeMap<String, String>,
    pub completed_roots: Vec<RootId>,
    #[serde(default)]
    pub active_root: Option<RootId>,
    pub aggregate_stats: CrawlStats,
    pub root_progress: BTreeMap<String, RootProgress>,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub incremental_stats: Option<IncrementalSyncStats>,
    #[serde(
        default,
        deserialize_with = "empty_string_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_error: Option<String>,
    #[serde(default)]
    pub verification: Option<SyncVerification>,
}

impl SyncProgress {
    /// Placeholder shown when a job was accepted before any snapshot existed.
    pub fn optimistic(now_millis: i64, roots: &[RootId]) -> Self {
        Self {
            status: SyncStatus::Running,
            started_at: now_millis,
            updated_at: now_millis,
            roots: roots.to_vec(),
            ..Self::default()
        }
    }

    /// Forces the snapshot into the running state ahead of server confirmation.
    pub fn mark_running(&mut self, now_millis: i64) {
        self.status = SyncStatus::Running;
        self.last_error = None;
        self.updated_at = now_millis;
    }

    pub fn root_progress_for(&self, root: RootId) -> Option<&RootProgress> {
        self.root_progress.get(&root.0.to_string())
    }

    pub fn validate(&self) -> Result<(), String> {
        let roots: HashSet<RootId> = self.roots.iter().copied().collect();
        if let Some(stray) = self.completed_roots.iter().find(|root| !roots.contains(root)) {
            return Err(format!("completed root {stray} is not part of roots"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStartRequest {
    pub root_folder_ids: Vec<RootId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SyncMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_departments: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_progress: Option<bool>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn progress_json() -> serde_json::Value {
        json!({
            "status": "done",
            "startedAt": 1000,
            "updatedAt": 2000,
            "roots": [100, 200],
            "completedRoots": [100],
            "aggregateStats": {
                "foldersVisited": 3,
                "filesIndexed": 42,
                "pagesFetched": 5,
                "failedRequests": 0,
                "startedAt": 1000,
                "endedAt": 2000
            },
            "rootProgress": {
                "100": {
                    "rootFolderId": 100,
                    "status": "done",
                    "estimatedTotalDocs": null,
                    "stats": {
                        "foldersVisited": 3,
                        "filesIndexed": 42,
                        "pagesFetched": 5,
                        "failedRequests": 0,
                        "startedAt": 1000,
                        "endedAt": 2000
                    },
                    "updatedAt": 2000
                }
            },
            "lastError": ""
        })
    }

    #[test]
    fn sync_progress_fills_optional_fields_with_defaults() {
        let progress: SyncProgress = serde_json::from_value(progress_json()).expect("decode");
        assert_eq!(progress.status, SyncStatus::Done);
        assert_eq!(progress.aggregate_stats.files_discovered, 0);
        assert!(progress.root_names.is_empty());
        assert!(progress.active_root.is_none());
        assert!(progress.last_error.is_none());
        assert!(progress.verification.is_none());
        assert_eq!(
            progress
                .root_progress_for(RootId(100))
                .map(|root| root.stats.files_indexed),
            Some(42)
        );
        assert!(progress.validate().is_ok());
    }

    #[test]
    fn sync_progress_rejects_completed_roots_outside_roots() {
        let mut raw = progress_json();
        raw["completedRoots"] = json!([100, 300]);
        let progress: SyncProgress = serde_json::from_value(raw).expect("decode");
        let err = progress.validate().expect_err("should reject");
        assert!(err.contains("300"));
    }

    #[test]
    fn mark_running_overrides_terminal_snapshot() {
        let mut progress: SyncProgress = serde_json::from_value(progress_json()).expect("decode");
        progress.last_error = Some("boom".into());
        progress.mark_running(9000);
        assert_eq!(progress.status, SyncStatus::Running);
        assert_eq!(progress.updated_at, 9000);
        assert!(progress.last_error.is_none());
        assert_eq!(progress.aggregate_stats.files_indexed, 42);
    }

    #[test]
    fn index_document_defaults_highlighted_name() {
        let doc: IndexDocument = serde_json::from_value(json!({
            "doc_id": "file_7",
            "source_id": 7,
            "type": "file",
            "name": "report.pdf",
            "path_text": "/docs/report.pdf",
            "parent_id": 1,
            "modified_at": 1700000000,
            "created_at": 1600000000,
            "size": 2048,
            "sha1": "abc",
            "in_trash": false,
            "is_deleted": false
        }))
        .expect("decode");
        assert_eq!(doc.key(), FileId(7));
        assert_eq!(doc.kind, DocumentKind::File);
        assert!(doc.highlighted_name.is_empty());
    }

    #[test]
    fn start_request_omits_absent_options() {
        let request = SyncStartRequest {
            root_folder_ids: vec![RootId(5)],
            mode: Some(SyncMode::Auto),
            ..SyncStartRequest::default()
        };
        assert_eq!(
            serde_json::to_value(&request).expect("encode"),
            json!({ "root_folder_ids": [5], "mode": "auto" })
        );
    }
}

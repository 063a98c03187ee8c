//! Record types for restic's `--json` output and the streaming readers that
//! turn it into structured events.
//!
//! Streaming verbs (`backup`, `restore`, `ls`) emit one JSON object per line;
//! record kinds share one stream and are told apart by a discriminant field.

use super::error::ResticError;
use crate::oplog::SnapshotInfo;
use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupStatus {
    pub percent_done: f64,
    pub total_files: u64,
    pub files_done: u64,
    pub total_bytes: u64,
    pub bytes_done: u64,
    pub seconds_elapsed: u64,
    pub current_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSummary {
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub dirs_new: u64,
    pub dirs_changed: u64,
    pub dirs_unmodified: u64,
    pub data_blobs: i64,
    pub tree_blobs: i64,
    pub data_added: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
    pub total_duration: f64,
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    pub message: String,
}

/// Per-item failure reported in-band, e.g. an unreadable source file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ItemError {
    pub error: ErrorDetail,
    pub during: String,
    pub item: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VerboseStatus {
    pub action: String,
    pub item: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum BackupProgressEntry {
    Status(BackupStatus),
    Summary(BackupSummary),
    Error(ItemError),
    VerboseStatus(VerboseStatus),
}

/// Shared by restore status and summary records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreProgress {
    pub seconds_elapsed: u64,
    pub percent_done: f64,
    pub total_files: u64,
    pub files_restored: u64,
    pub files_skipped: u64,
    pub total_bytes: u64,
    pub bytes_restored: u64,
    pub bytes_skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum RestoreProgressEntry {
    Status(RestoreProgress),
    Summary(RestoreProgress),
    Error(ItemError),
    VerboseStatus(VerboseStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: String,
    #[serde(default)]
    pub tree: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

impl Snapshot {
    /// Sub-millisecond precision is truncated, not rounded.
    pub fn unix_time_ms(&self) -> Result<i64, ResticError> {
        DateTime::parse_from_rfc3339(&self.time)
            .map(|t| t.timestamp_millis())
            .map_err(|e| ResticError::parse(&self.time, format!("invalid snapshot time: {e}")))
    }

    pub fn to_snapshot_info(&self) -> Result<SnapshotInfo, ResticError> {
        Ok(SnapshotInfo {
            id: self.id.clone(),
            unix_time_ms: self.unix_time_ms()?,
            tree: self.tree.clone(),
            paths: self.paths.clone(),
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            tags: self.tags.clone(),
            parent: self.parent.clone().unwrap_or_default(),
        })
    }

    /// Plan that produced the snapshot, taken from its `plan:<id>` tag.
    pub fn plan_id(&self) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix("plan:"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LsEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub path: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub mtime: String,
    #[serde(default)]
    pub atime: String,
    #[serde(default)]
    pub ctime: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "struct_type", rename_all = "snake_case")]
enum LsRecord {
    Snapshot(Snapshot),
    Node(LsEntry),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ForgetGroup {
    pub tags: Option<Vec<String>>,
    pub host: String,
    pub paths: Option<Vec<String>>,
    pub keep: Option<Vec<Snapshot>>,
    pub remove: Option<Vec<Snapshot>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoStats {
    pub total_size: u64,
    pub total_uncompressed_size: u64,
    pub compression_ratio: f64,
    pub total_blob_count: u64,
    pub snapshots_count: u64,
}

/// Calls `handle` with every non-blank line decoded as `T`. Any line that
/// does not decode aborts the whole read.
async fn for_each_record<R, T, F>(reader: R, mut handle: F) -> Result<(), ResticError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
    F: FnMut(&str, T) -> Result<(), ResticError>,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str::<T>(line).map_err(|e| ResticError::parse(line, e))?;
        handle(line, record)?;
    }
    Ok(())
}

/// Reads a `backup --json` stream, calling `on_status` for every status
/// record and returning the summary record.
pub async fn read_backup_progress<R, F>(
    reader: R,
    mut on_status: F,
) -> Result<BackupSummary, ResticError>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&BackupStatus),
{
    let mut summary = None;
    for_each_record(reader, |line, entry: BackupProgressEntry| {
        match entry {
            BackupProgressEntry::Status(status) => on_status(&status),
            BackupProgressEntry::Summary(s) => {
                if summary.is_some() {
                    return Err(ResticError::parse(line, "duplicate summary record"));
                }
                summary = Some(s);
            }
            BackupProgressEntry::Error(e) => {
                warn!(
                    "restic backup error on {:?} during {}: {}",
                    e.item, e.during, e.error.message
                );
            }
            BackupProgressEntry::VerboseStatus(v) => debug!("restic {} {}", v.action, v.item),
        }
        Ok(())
    })
    .await?;
    summary.ok_or_else(|| ResticError::parse("", "stream ended without a summary record"))
}

/// Reads a `restore --json` stream, same contract as [`read_backup_progress`].
pub async fn read_restore_progress<R, F>(
    reader: R,
    mut on_status: F,
) -> Result<RestoreProgress, ResticError>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&RestoreProgress),
{
    let mut summary = None;
    for_each_record(reader, |line, entry: RestoreProgressEntry| {
        match entry {
            RestoreProgressEntry::Status(status) => on_status(&status),
            RestoreProgressEntry::Summary(s) => {
                if summary.is_some() {
                    return Err(ResticError::parse(line, "duplicate summary record"));
                }
                summary = Some(s);
            }
            RestoreProgressEntry::Error(e) => {
                warn!("restic restore error on {:?}: {}", e.item, e.error.message);
            }
            RestoreProgressEntry::VerboseStatus(v) => debug!("restic {} {}", v.action, v.item),
        }
        Ok(())
    })
    .await?;
    summary.ok_or_else(|| ResticError::parse("", "stream ended without a summary record"))
}

/// Reads an `ls --json` stream: one snapshot record followed by any number
/// of node records. Entries are returned in input order once the stream is
/// drained.
pub async fn read_ls<R>(reader: R) -> Result<(Snapshot, Vec<LsEntry>), ResticError>
where
    R: AsyncBufRead + Unpin,
{
    let mut snapshot = None;
    let mut entries = Vec::new();
    for_each_record(reader, |line, record: LsRecord| {
        match (record, snapshot.is_some()) {
            (LsRecord::Snapshot(s), false) => snapshot = Some(s),
            (LsRecord::Snapshot(_), true) => {
                return Err(ResticError::parse(line, "unexpected second snapshot record"));
            }
            (LsRecord::Node(_), false) => {
                return Err(ResticError::parse(line, "node record before snapshot record"));
            }
            (LsRecord::Node(entry), true) => entries.push(entry),
        }
        Ok(())
    })
    .await?;
    let snapshot =
        snapshot.ok_or_else(|| ResticError::parse("", "stream ended without a snapshot record"))?;
    Ok((snapshot, entries))
}

/// Reads a single JSON document (e.g. `snapshots --json`) spanning the whole
/// stream.
pub async fn read_json_document<R, T>(mut reader: R) -> Result<T, ResticError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut text = String::new();
    reader.read_to_string(&mut text).await?;
    let text = text.trim();
    serde_json::from_str(text).map_err(|e| ResticError::parse(text, e))
}

/// Reads the whole stream as text, for verbs without JSON output.
pub async fn read_text<R>(mut reader: R) -> Result<String, ResticError>
where
    R: AsyncBufRead + Unpin,
{
    let mut text = String::new();
    reader.read_to_string(&mut text).await?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKUP_STREAM: &str = r#"{"message_type":"status","percent_done":0,"total_files":1,"total_bytes":15}
	{"message_type":"summary","files_new":0,"files_changed":0,"files_unmodified":166,"dirs_new":0,"dirs_changed":0,"dirs_unmodified":128,"data_blobs":0,"tree_blobs":0,"data_added":0,"total_files_processed":166,"total_bytes_processed":16754463,"total_duration":0.235433378,"snapshot_id":"bca1043e"}"#;

    const LS_STREAM: &str = r#"{"time":"2023-11-10T19:14:17.053824063-08:00","tree":"3e2918b261948e69602ee9504b8f475bcc7cdc4dcec0b3f34ecdb014287d07b2","paths":["/resticui"],"hostname":"pop-os","username":"dontpanic","uid":1000,"gid":1000,"id":"db155169d788e6e432e320aedbdff5a54cc439653093bb56944a67682528aa52","short_id":"db155169","struct_type":"snapshot"}
	{"name":".git","type":"dir","path":"/.git","uid":1000,"gid":1000,"mode":2147484157,"mtime":"2023-11-10T18:32:38.156599473-08:00","atime":"2023-11-10T18:32:38.156599473-08:00","ctime":"2023-11-10T18:32:38.156599473-08:00","struct_type":"node"}
	{"name":".gitignore","type":"file","path":"/.gitignore","uid":1000,"gid":1000,"size":22,"mode":436,"mtime":"2023-11-10T00:41:26.611346634-08:00","atime":"2023-11-10T00:41:26.611346634-08:00","ctime":"2023-11-10T00:41:26.611346634-08:00","struct_type":"node"}
	{"name":"README.md","type":"file","path":"/README.md","uid":1000,"gid":1000,"size":762,"mode":436,"mtime":"2023-11-10T00:59:06.842538768-08:00","atime":"2023-11-10T00:59:06.842538768-08:00","ctime":"2023-11-10T00:59:06.842538768-08:00","struct_type":"node"}"#;

    #[tokio::test]
    async fn test_read_backup_progress() {
        let mut statuses = Vec::new();
        let summary = read_backup_progress(BACKUP_STREAM.as_bytes(), |s| statuses.push(s.clone()))
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].total_bytes, 15);
        assert_eq!(summary.total_files_processed, 166);
        assert_eq!(summary.files_unmodified, 166);
        assert_eq!(summary.snapshot_id.as_deref(), Some("bca1043e"));
    }

    #[tokio::test]
    async fn test_callback_count_matches_status_records() {
        let mut input = String::new();
        for i in 0..5 {
            input.push_str(&format!(
                "{{\"message_type\":\"status\",\"percent_done\":0.{i}}}\n\n"
            ));
        }
        input.push_str("{\"message_type\":\"error\",\"error\":{\"message\":\"denied\"},\"item\":\"/x\"}\n");
        input.push_str("{\"message_type\":\"summary\",\"snapshot_id\":\"ff\"}\n");

        let mut calls = 0;
        let summary = read_backup_progress(input.as_bytes(), |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(calls, 5);
        assert_eq!(summary.snapshot_id.as_deref(), Some("ff"));
    }

    #[tokio::test]
    async fn test_missing_summary_is_parse_error() {
        let input = "{\"message_type\":\"status\",\"percent_done\":0.5}\n";
        let err = read_backup_progress(input.as_bytes(), |_| {}).await.unwrap_err();
        assert!(matches!(err, ResticError::Parse { .. }));

        let err = read_backup_progress(&b""[..], |_| {}).await.unwrap_err();
        assert!(matches!(err, ResticError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_malformed_line_names_the_line() {
        let input = "{\"message_type\":\"status\"}\nrepository is already locked\n";
        let err = read_backup_progress(input.as_bytes(), |_| {}).await.unwrap_err();
        match err {
            ResticError::Parse { line, .. } => assert_eq!(line, "repository is already locked"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_read_restore_progress() {
        let input = concat!(
            "{\"message_type\":\"status\",\"percent_done\":0.5,\"files_restored\":1}\n",
            "{\"message_type\":\"summary\",\"total_files\":2,\"files_restored\":2,\"bytes_restored\":10}\n"
        );
        let mut calls = 0;
        let summary = read_restore_progress(input.as_bytes(), |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(summary.files_restored, 2);
        assert_eq!(summary.bytes_restored, 10);
    }

    #[tokio::test]
    async fn test_read_ls() {
        let (snapshot, entries) = read_ls(LS_STREAM.as_bytes()).await.unwrap();
        assert_eq!(
            snapshot.id,
            "db155169d788e6e432e320aedbdff5a54cc439653093bb56944a67682528aa52"
        );
        assert_eq!(entries.len(), 3);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".git", ".gitignore", "README.md"]);
        assert_eq!(entries[0].entry_type, "dir");
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[2].size, 762);
    }

    #[tokio::test]
    async fn test_read_ls_snapshot_only() {
        let first_line = LS_STREAM.lines().next().unwrap();
        let (snapshot, entries) = read_ls(first_line.as_bytes()).await.unwrap();
        assert_eq!(snapshot.short_id, "db155169");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_read_ls_rejects_bad_streams() {
        assert!(matches!(
            read_ls(&b""[..]).await.unwrap_err(),
            ResticError::Parse { .. }
        ));

        let node_first = LS_STREAM.lines().nth(1).unwrap();
        assert!(matches!(
            read_ls(node_first.as_bytes()).await.unwrap_err(),
            ResticError::Parse { .. }
        ));
    }

    #[test]
    fn test_snapshot_time_truncates_to_millis() {
        let snapshot = Snapshot {
            id: "db155169d788e6e432e320aedbdff5a54cc439653093bb56944a67682528aa52".to_string(),
            time: "2023-11-10T19:14:17.053824063-08:00".to_string(),
            tree: "3e2918b261948e69602ee9504b8f475bcc7cdc4dcec0b3f34ecdb014287d07b2".to_string(),
            paths: vec!["/resticui".to_string()],
            hostname: "pop-os".to_string(),
            username: "dontpanic".to_string(),
            ..Default::default()
        };

        let info = snapshot.to_snapshot_info().unwrap();
        assert_eq!(info.unix_time_ms, 1699672457053);
        assert_eq!(info.id, snapshot.id);
        assert_eq!(info.tree, snapshot.tree);
        assert_eq!(info.hostname, "pop-os");
        assert_eq!(info.username, "dontpanic");
        assert!(info.tags.is_empty());
        assert_eq!(info.parent, "");
    }

    #[test]
    fn test_plan_tag() {
        let snapshot = Snapshot {
            tags: vec!["manual".to_string(), "plan:home".to_string()],
            ..Default::default()
        };
        assert_eq!(snapshot.plan_id(), Some("home"));
        assert_eq!(Snapshot::default().plan_id(), None);
    }

    #[tokio::test]
    async fn test_read_forget_groups() {
        let input = r#"[{"tags":["plan:p1"],"host":"h","paths":["/data"],"keep":[{"id":"a","time":"2024-01-02T00:00:00Z"}],"remove":[{"id":"b","time":"2024-01-01T00:00:00Z"}],"reasons":[]}]"#;
        let groups: Vec<ForgetGroup> = read_json_document(input.as_bytes()).await.unwrap();
        assert_eq!(groups.len(), 1);
        let removed = groups[0].remove.as_ref().unwrap();
        assert_eq!(removed[0].id, "b");
    }
}

//! Fake restic binary
//!
//! Writes a `/bin/sh` script dispatching on the first argument. Every
//! invocation is appended to `invocations.log` in the state directory.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Canned verb bodies. Each body runs with `$STATE` set to the state dir.
pub mod verbs {
    use super::super::constants::*;

    pub fn backup_ok() -> String {
        format!(
            r#"echo '{{"message_type":"status","percent_done":0.5,"total_files":2,"files_done":1}}'
echo '{{"message_type":"summary","files_new":2,"total_files_processed":2,"snapshot_id":"{}"}}'"#,
            SNAPSHOT_ID
        )
    }

    pub fn snapshots() -> String {
        format!(
            r#"echo '[{{"id":"{}","short_id":"a1b2c3d4","time":"2023-11-09T10:00:00Z","tree":"t1","paths":["/data"],"hostname":"host","username":"user","tags":["plan:plan-b"]}},{{"id":"{}","short_id":"db155169","time":"2023-11-10T19:14:17.053824063-08:00","tree":"t2","paths":["/data"],"hostname":"host","username":"user","tags":["plan:plan-a"]}}]'"#,
            OLD_SNAPSHOT_ID, SNAPSHOT_ID
        )
    }

    pub fn forget() -> String {
        format!(
            r#"echo '[{{"tags":["plan:plan-a"],"host":"host","paths":["/data"],"keep":[],"remove":[{{"id":"{}","time":"2023-11-09T10:00:00Z","tree":"t1","paths":["/data"],"tags":["plan:plan-a"]}}]}}]'"#,
            OLD_SNAPSHOT_ID
        )
    }

    pub fn ls() -> String {
        format!(
            r#"echo '{{"struct_type":"snapshot","id":"{}","time":"2023-11-10T19:14:17.053824063-08:00","tree":"t2","paths":["/data"]}}'
echo '{{"struct_type":"node","name":"data","type":"dir","path":"/data","mode":2147484141}}'
echo '{{"struct_type":"node","name":"a.txt","type":"file","path":"/data/a.txt","size":12}}'"#,
            SNAPSHOT_ID
        )
    }

    pub fn restore() -> String {
        r#"echo '{"message_type":"status","percent_done":0.5,"total_files":2,"files_restored":1}'
echo '{"message_type":"summary","percent_done":1,"total_files":2,"files_restored":2,"total_bytes":24,"bytes_restored":24}'"#
            .to_string()
    }

    /// Every verb succeeds with plausible output.
    pub fn defaults() -> Vec<(&'static str, String)> {
        vec![
            ("backup", backup_ok()),
            ("snapshots", snapshots()),
            ("forget", forget()),
            ("ls", ls()),
            ("restore", restore()),
            ("prune", "echo 'loading indexes...'\necho 'this removes 0 B of unused data'".to_string()),
            ("unlock", "echo 'successfully removed 1 locks'".to_string()),
            ("stats", r#"echo '{"total_size":1024,"total_blob_count":4,"snapshots_count":2}'"#.to_string()),
        ]
    }

    /// `defaults()` with `verb` replaced by `body`.
    pub fn with(verb: &'static str, body: impl Into<String>) -> Vec<(&'static str, String)> {
        let mut verbs = defaults();
        verbs.retain(|(v, _)| *v != verb);
        verbs.push((verb, body.into()));
        verbs
    }
}

pub fn write_fake_restic(dir: &Path, state_dir: &Path, verbs: &[(&str, String)]) -> PathBuf {
    let mut script = format!(
        "#!/bin/sh\nSTATE=\"{}\"\necho \"$*\" >> \"$STATE/invocations.log\"\ncase \"$1\" in\n",
        state_dir.display()
    );
    for (verb, body) in verbs {
        script.push_str(&format!("{})\n{}\n;;\n", verb, body));
    }
    script.push_str("*)\necho \"unexpected verb $1\" >&2\nexit 1\n;;\nesac\n");

    let path = dir.join("restic");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::model::CommitRef;

/// Collects side-effect evidence: commits whose message contains the
/// `[claude]` marker, committed since `since` in `working_dir`. Failures of
/// the query (missing tool, not a repository) silently yield an empty list,
/// matching the original `_collect_commits` behaviour.
pub async fn collect_commits(working_dir: &str, since: DateTime<Utc>) -> Vec<CommitRef> {
    let since_iso = since.format("%Y-%m-%dT%H:%M:%S").to_string();

    let output = Command::new("git")
        .args([
            "log",
            &format!("--since={since_iso}"),
            "--grep=[claude]",
            "--oneline",
        ])
        .current_dir(working_dir)
        .output()
        .await;

    let output = match output {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.splitn(2, ' ');
            let sha = parts.next()?.to_string();
            let message = parts.next().unwrap_or("").to_string();
            Some(CommitRef { sha, message })
        })
        .collect()
}

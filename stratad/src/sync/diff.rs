//! Three-way comparison of the local tree, the remote listing and the
//! baseline recorded by the last successful transfer of each path.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::plan::join_key;
use crate::store::{EntryUpdate, JobKind, SyncDirection, SyncEntryRecord, SyncJobInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalItem {
    pub size: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub key: String,
    pub size: i64,
    pub etag: Option<String>,
    pub mtime: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

/// A path changed on both sides; the winner's version is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictNote {
    pub rel_path: String,
    pub winner: Side,
    pub discarded_size: Option<i64>,
    pub discarded_mtime: Option<i64>,
    pub discarded_etag: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    pub jobs: Vec<SyncJobInput>,
    pub conflicts: Vec<ConflictNote>,
    /// Baseline writes for paths already in agreement or gone from both sides.
    pub baseline: Vec<(String, EntryUpdate)>,
    pub scanned: i64,
}

pub struct DiffInput<'a> {
    pub local: &'a BTreeMap<String, LocalItem>,
    pub remote: &'a BTreeMap<String, RemoteItem>,
    pub baseline: &'a BTreeMap<String, SyncEntryRecord>,
    /// Paths present on both sides without a baseline whose contents hash equal.
    pub identical: &'a HashSet<String>,
    pub direction: SyncDirection,
    pub remote_prefix: &'a str,
}

fn local_changed(local: Option<&LocalItem>, base: Option<&SyncEntryRecord>) -> bool {
    match (local, base) {
        (Some(local), Some(base)) => {
            base.local_size != Some(local.size) || base.local_mtime != Some(local.mtime)
        }
        (Some(_), None) | (None, Some(_)) => true,
        (None, None) => false,
    }
}

fn remote_changed(remote: Option<&RemoteItem>, base: Option<&SyncEntryRecord>) -> bool {
    match (remote, base) {
        (Some(remote), Some(base)) => {
            if base.remote_size != Some(remote.size) {
                return true;
            }
            match (&base.remote_etag, &remote.etag) {
                (Some(seen), Some(now)) => seen != now,
                _ => base.remote_mtime != remote.mtime,
            }
        }
        (Some(_), None) | (None, Some(_)) => true,
        (None, None) => false,
    }
}

/// Decides the jobs that bring both sides in line. A side that changed alone
/// propagates; when both changed the later modification wins, a modification
/// beats a deletion and ties favour the configured source side.
pub fn diff(input: &DiffInput<'_>) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();
    let paths: BTreeSet<&String> = input
        .local
        .keys()
        .chain(input.remote.keys())
        .chain(input.baseline.keys())
        .collect();

    for rel_path in paths {
        let local = input.local.get(rel_path);
        let remote = input.remote.get(rel_path);
        let base = input.baseline.get(rel_path);
        if local.is_some() || remote.is_some() {
            outcome.scanned += 1;
        }
        let remote_key = remote
            .map(|item| item.key.clone())
            .or_else(|| base.map(|entry| entry.remote_key.clone()))
            .unwrap_or_else(|| join_key(input.remote_prefix, rel_path));

        match (
            local_changed(local, base),
            remote_changed(remote, base),
        ) {
            (false, false) => {}
            (true, false) => match local {
                Some(local) => {
                    if input.direction.allows_upload() {
                        outcome
                            .jobs
                            .push(upload(rel_path, &remote_key, local, remote));
                    }
                }
                None => match remote {
                    Some(remote) if input.direction.allows_upload() => {
                        outcome.jobs.push(delete_remote(rel_path, remote));
                    }
                    Some(_) => {}
                    None => outcome.baseline.push((rel_path.clone(), EntryUpdate::Remove)),
                },
            },
            (false, true) => match remote {
                Some(remote) => {
                    if input.direction.allows_download() {
                        outcome.jobs.push(download(rel_path, remote));
                    }
                }
                None => match local {
                    Some(_) if input.direction.allows_download() => {
                        outcome.jobs.push(delete_local(rel_path, &remote_key));
                    }
                    Some(_) => {}
                    None => outcome.baseline.push((rel_path.clone(), EntryUpdate::Remove)),
                },
            },
            (true, true) => both_changed(input, &mut outcome, rel_path, &remote_key, local, remote, base),
        }
    }
    outcome
}

fn both_changed(
    input: &DiffInput<'_>,
    outcome: &mut DiffOutcome,
    rel_path: &str,
    remote_key: &str,
    local: Option<&LocalItem>,
    remote: Option<&RemoteItem>,
    base: Option<&SyncEntryRecord>,
) {
    let direction = input.direction;
    let (winner, reason) = match (local, remote) {
        (None, None) => {
            outcome
                .baseline
                .push((rel_path.to_string(), EntryUpdate::Remove));
            return;
        }
        (Some(local), Some(remote)) => {
            if base.is_none() && input.identical.contains(rel_path) {
                outcome.baseline.push((
                    rel_path.to_string(),
                    EntryUpdate::Set(SyncEntryRecord {
                        rel_path: rel_path.to_string(),
                        remote_key: remote.key.clone(),
                        local_size: Some(local.size),
                        local_mtime: Some(local.mtime),
                        remote_size: Some(remote.size),
                        remote_etag: remote.etag.clone(),
                        remote_mtime: remote.mtime,
                        synced_at: 0,
                    }),
                ));
                return;
            }
            let remote_mtime = remote.mtime.unwrap_or(local.mtime);
            let winner = match local.mtime.cmp(&remote_mtime) {
                std::cmp::Ordering::Greater => Side::Local,
                std::cmp::Ordering::Less => Side::Remote,
                std::cmp::Ordering::Equal => match direction {
                    SyncDirection::DownloadOnly => Side::Remote,
                    SyncDirection::UploadOnly | SyncDirection::Bidirectional => Side::Local,
                },
            };
            (winner, "modified on both sides".to_string())
        }
        (Some(_), None) => (Side::Local, "modified locally, deleted remotely".to_string()),
        (None, Some(_)) => (Side::Remote, "modified remotely, deleted locally".to_string()),
    };

    let allowed = match winner {
        Side::Local => direction.allows_upload(),
        Side::Remote => direction.allows_download(),
    };
    if allowed {
        match (winner, local, remote) {
            (Side::Local, Some(local), _) => {
                outcome
                    .jobs
                    .push(upload(rel_path, remote_key, local, remote));
            }
            (Side::Remote, _, Some(remote)) => outcome.jobs.push(download(rel_path, remote)),
            _ => {}
        }
    }

    let (discarded_size, discarded_mtime, discarded_etag) = match winner {
        Side::Local => (
            remote.map(|item| item.size),
            remote.and_then(|item| item.mtime),
            remote.and_then(|item| item.etag.clone()),
        ),
        Side::Remote => (local.map(|item| item.size), local.map(|item| item.mtime), None),
    };
    outcome.conflicts.push(ConflictNote {
        rel_path: rel_path.to_string(),
        winner,
        discarded_size,
        discarded_mtime,
        discarded_etag,
        reason: if allowed {
            reason
        } else {
            format!("{reason}; not applied in {} mode", direction.as_str())
        },
    });
}

fn upload(
    rel_path: &str,
    remote_key: &str,
    local: &LocalItem,
    remote: Option<&RemoteItem>,
) -> SyncJobInput {
    SyncJobInput {
        kind: JobKind::Upload,
        rel_path: rel_path.to_string(),
        remote_key: remote_key.to_string(),
        size: local.size,
        expected_etag: remote.and_then(|item| item.etag.clone()),
        remote_mtime: None,
    }
}

fn download(rel_path: &str, remote: &RemoteItem) -> SyncJobInput {
    SyncJobInput {
        kind: JobKind::Download,
        rel_path: rel_path.to_string(),
        remote_key: remote.key.clone(),
        size: remote.size,
        expected_etag: remote.etag.clone(),
        remote_mtime: remote.mtime,
    }
}

fn delete_remote(rel_path: &str, remote: &RemoteItem) -> SyncJobInput {
    SyncJobInput {
        kind: JobKind::DeleteRemote,
        rel_path: rel_path.to_string(),
        remote_key: remote.key.clone(),
        size: 0,
        expected_etag: remote.etag.clone(),
        remote_mtime: None,
    }
}

fn delete_local(rel_path: &str, remote_key: &str) -> SyncJobInput {
    SyncJobInput {
        kind: JobKind::DeleteLocal,
        rel_path: rel_path.to_string(),
        remote_key: remote_key.to_string(),
        size: 0,
        expected_etag: None,
        remote_mtime: None,
    }
}

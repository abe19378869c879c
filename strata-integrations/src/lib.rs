pub mod ids;

use serde::{Deserialize, Serialize};

/// Coarse status of a failed control call, shared by the daemon and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    NotFound,
    ClientError,
    ServerError,
}

impl ErrorStatus {
    pub fn from_error_name(name: &str) -> Self {
        match name {
            ids::DBUS_ERROR_NOT_FOUND => ErrorStatus::NotFound,
            ids::DBUS_ERROR_INVALID_PATH | ids::DBUS_ERROR_VALIDATION | ids::DBUS_ERROR_CONFLICT => {
                ErrorStatus::ClientError
            }
            _ => ErrorStatus::ServerError,
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ErrorStatus::ClientError => 2,
            ErrorStatus::NotFound => 3,
            ErrorStatus::ServerError => 4,
        }
    }
}

/// Splits a `"<error-name>: <message>"` payload produced by the daemon.
pub fn split_error_payload(payload: &str) -> (Option<&str>, &str) {
    match payload.split_once(": ") {
        Some((name, message)) if name.starts_with(ids::APP_ID_BASE) => (Some(name), message),
        _ => (None, payload),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendView {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub region: Option<String>,
    pub bucket: String,
    pub use_ssl: bool,
    pub file_count: i64,
    pub total_bytes: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBackendRequest {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub region: Option<String>,
    pub bucket: String,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendUpdateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub use_ssl: Option<bool>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileView {
    pub backend_id: String,
    pub path: String,
    pub size: i64,
    pub etag: Option<String>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub modified_at: i64,
    pub is_dir: bool,
}

impl FileView {
    pub fn virtual_path(&self) -> String {
        format!("{}/{}", self.backend_id, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagView {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterView {
    /// Full virtual path including the filter namespace token.
    pub virtual_path: String,
    pub name: String,
    pub query: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRequest {
    pub virtual_path: String,
    #[serde(default)]
    pub name: Option<String>,
    pub query: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Backend,
    Filter,
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfsEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: Option<i64>,
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub backend_id: String,
    pub scanned: u64,
    pub created: u64,
    pub updated: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTagReport {
    pub files: u64,
    pub added: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfigRequest {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub direction: String,
    #[serde(default)]
    pub workers: Option<u32>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfigView {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub direction: String,
    pub enabled: bool,
    pub workers: u32,
    pub chunk_size: u64,
    pub interval_secs: u64,
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateView {
    pub config: String,
    pub backend_id: String,
    pub client_id: String,
    pub phase: String,
    pub last_sync_at: Option<i64>,
    pub cursor: Option<String>,
    pub files_scanned: i64,
    pub files_synced: i64,
    pub bytes_synced: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusView {
    pub configs: usize,
    pub enabled: usize,
    pub running: usize,
    pub errored: usize,
    pub states: Vec<SyncStateView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictView {
    pub config: String,
    pub path: String,
    pub winner: String,
    pub discarded_size: Option<i64>,
    pub discarded_mtime: Option<i64>,
    pub reason: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_names_to_exit_codes() {
        assert_eq!(
            ErrorStatus::from_error_name(ids::DBUS_ERROR_NOT_FOUND).exit_code(),
            3
        );
        assert_eq!(
            ErrorStatus::from_error_name(ids::DBUS_ERROR_VALIDATION).exit_code(),
            2
        );
        assert_eq!(
            ErrorStatus::from_error_name(ids::DBUS_ERROR_INVALID_PATH),
            ErrorStatus::ClientError
        );
        assert_eq!(
            ErrorStatus::from_error_name(ids::DBUS_ERROR_STORAGE).exit_code(),
            4
        );
        assert_eq!(
            ErrorStatus::from_error_name("org.freedesktop.DBus.Error.ServiceUnknown"),
            ErrorStatus::ServerError
        );
    }

    #[test]
    fn splits_named_error_payloads() {
        let payload = format!("{}: backend 'x' not found", ids::DBUS_ERROR_NOT_FOUND);
        assert_eq!(
            split_error_payload(&payload),
            (Some(ids::DBUS_ERROR_NOT_FOUND), "backend 'x' not found")
        );
        assert_eq!(split_error_payload("plain: failure"), (None, "plain: failure"));
    }

    #[test]
    fn backend_request_defaults_to_tls() {
        let request: NewBackendRequest = serde_json::from_str(
            r#"{"id":"b","name":"B","endpoint":"s3.local","bucket":"x","access_key":"a","secret_key":"s"}"#,
        )
        .unwrap();
        assert!(request.use_ssl);
        assert_eq!(request.region, None);
    }

    #[test]
    fn file_view_builds_virtual_path() {
        let file = FileView {
            backend_id: "selfhosted".into(),
            path: "pic.jpg".into(),
            size: 1,
            etag: None,
            md5: None,
            sha256: None,
            modified_at: 0,
            is_dir: false,
        };
        assert_eq!(file.virtual_path(), "selfhosted/pic.jpg");
    }
}

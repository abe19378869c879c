use strata_core::ConnectionInfo;

use super::StoreError;

pub const DEFAULT_WORKERS: u32 = 4;
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBackend {
    pub id: String,
    pub name: String,
    pub connection: ConnectionInfo,
    pub access_key_enc: String,
    pub secret_key_enc: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRecord {
    pub id: String,
    pub name: String,
    pub connection: ConnectionInfo,
    pub access_key_enc: String,
    pub secret_key_enc: String,
    pub file_count: i64,
    pub total_bytes: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    pub backend_id: String,
    pub path: String,
    pub size: i64,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub etag: Option<String>,
    pub modified_at: i64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub backend_id: String,
    pub path: String,
    pub size: i64,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub etag: Option<String>,
    pub modified_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_dir: bool,
    pub parent_id: Option<i64>,
}

impl FileRecord {
    pub fn same_content(&self, input: &FileInput) -> bool {
        self.size == input.size
            && self.etag == input.etag
            && self.md5 == input.md5
            && self.modified_at == input.modified_at
            && self.is_dir == input.is_dir
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub id: i64,
    pub file_id: i64,
    pub key: String,
    pub value: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFilter {
    pub virtual_path: String,
    pub name: String,
    pub query: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRecord {
    pub id: i64,
    pub virtual_path: String,
    pub name: String,
    pub query: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Bidirectional,
    UploadOnly,
    DownloadOnly,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Bidirectional => "bidirectional",
            SyncDirection::UploadOnly => "upload-only",
            SyncDirection::DownloadOnly => "download-only",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "bidirectional" => Ok(SyncDirection::Bidirectional),
            "upload-only" | "upload" => Ok(SyncDirection::UploadOnly),
            "download-only" | "download" => Ok(SyncDirection::DownloadOnly),
            other => Err(StoreError::InvalidValue {
                column: "direction",
                value: other.to_string(),
            }),
        }
    }

    pub fn allows_upload(&self) -> bool {
        !matches!(self, SyncDirection::DownloadOnly)
    }

    pub fn allows_download(&self) -> bool {
        !matches!(self, SyncDirection::UploadOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncConfig {
    pub name: String,
    pub source_path: String,
    pub dest_path: String,
    pub direction: SyncDirection,
    pub enabled: bool,
    pub interval_secs: u64,
    pub workers: u32,
    pub chunk_size: u64,
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfigRecord {
    pub id: i64,
    pub name: String,
    pub source_path: String,
    pub dest_path: String,
    pub direction: SyncDirection,
    pub enabled: bool,
    pub interval_secs: u64,
    pub workers: u32,
    pub chunk_size: u64,
    pub ignore_patterns: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Scanning,
    Syncing,
    Error,
    Paused,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Scanning => "scanning",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Error => "error",
            SyncPhase::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "idle" => Ok(SyncPhase::Idle),
            "scanning" => Ok(SyncPhase::Scanning),
            "syncing" => Ok(SyncPhase::Syncing),
            "error" => Ok(SyncPhase::Error),
            "paused" => Ok(SyncPhase::Paused),
            other => Err(StoreError::InvalidValue {
                column: "phase",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateRecord {
    pub id: i64,
    pub sync_config_id: i64,
    pub backend_id: String,
    pub client_id: String,
    pub phase: SyncPhase,
    pub last_sync_at: Option<i64>,
    pub cursor: Option<String>,
    pub change_cursor: i64,
    pub files_scanned: i64,
    pub files_synced: i64,
    pub bytes_synced: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    Rename,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Rename => "rename",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            "rename" => Ok(ChangeKind::Rename),
            other => Err(StoreError::InvalidValue {
                column: "kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeRecord {
    pub id: i64,
    pub file_id: Option<i64>,
    pub backend_id: String,
    pub path: String,
    pub kind: ChangeKind,
    pub occurred_at: i64,
    pub client_id: String,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Upload => "upload",
            JobKind::Download => "download",
            JobKind::DeleteLocal => "delete_local",
            JobKind::DeleteRemote => "delete_remote",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "upload" => Ok(JobKind::Upload),
            "download" => Ok(JobKind::Download),
            "delete_local" => Ok(JobKind::DeleteLocal),
            "delete_remote" => Ok(JobKind::DeleteRemote),
            other => Err(StoreError::InvalidValue {
                column: "kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StoreError::InvalidValue {
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJobInput {
    pub kind: JobKind,
    pub rel_path: String,
    pub remote_key: String,
    pub size: i64,
    /// Remote etag observed while scanning; an upload refuses to overwrite a
    /// different remote version.
    pub expected_etag: Option<String>,
    pub remote_mtime: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJobRecord {
    pub id: i64,
    pub sync_state_id: i64,
    pub batch: i64,
    pub kind: JobKind,
    pub rel_path: String,
    pub remote_key: String,
    pub size: i64,
    pub expected_etag: Option<String>,
    pub remote_mtime: Option<i64>,
    pub status: JobStatus,
    pub attempt: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntryRecord {
    pub rel_path: String,
    pub remote_key: String,
    pub local_size: Option<i64>,
    pub local_mtime: Option<i64>,
    pub remote_size: Option<i64>,
    pub remote_etag: Option<String>,
    pub remote_mtime: Option<i64>,
    pub synced_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInput {
    pub sync_config_id: i64,
    pub rel_path: String,
    pub winner: String,
    pub discarded_size: Option<i64>,
    pub discarded_mtime: Option<i64>,
    pub discarded_etag: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: i64,
    pub sync_config_id: i64,
    pub rel_path: String,
    pub winner: String,
    pub discarded_size: Option<i64>,
    pub discarded_mtime: Option<i64>,
    pub discarded_etag: Option<String>,
    pub reason: String,
    pub created_at: i64,
}

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use strata_integrations::ids::{
    DBUS_INTERFACE_CONTROL, DBUS_INTERFACE_VFS, DBUS_NAME_AGENT, DBUS_OBJECT_PATH_CONTROL,
    DBUS_OBJECT_PATH_VFS,
};
use strata_integrations::{
    AutoTagReport, BackendUpdateRequest, BackendView, ConflictView, FileView, FilterRequest,
    FilterView, NewBackendRequest, ScanReport, SyncConfigRequest, SyncConfigView, SyncStatusView,
    TagView, VfsEntry,
};
use zbus::blocking::{Connection, Proxy};

/// Blocking client of the agent's `Control1` and `Vfs1` objects. Structured
/// results travel as JSON strings and are decoded into the shared view types.
pub struct AgentClient {
    connection: Connection,
}

fn decode<T: DeserializeOwned>(method: &str, payload: String) -> Result<T> {
    serde_json::from_str(&payload).with_context(|| format!("{method} returned malformed JSON"))
}

fn encode<T: serde::Serialize>(request: &T) -> Result<String> {
    serde_json::to_string(request).context("failed to encode request")
}

impl AgentClient {
    pub fn connect() -> Result<Self> {
        let connection =
            Connection::session().context("failed to connect to session D-Bus for the agent")?;
        Ok(Self { connection })
    }

    pub fn status(&self) -> Result<SyncStatusView> {
        let payload: String = self
            .control()?
            .call("GetStatus", &())
            .context("GetStatus failed")?;
        decode("GetStatus", payload)
    }

    pub fn list_syncs(&self) -> Result<Vec<SyncConfigView>> {
        let payload: String = self
            .control()?
            .call("ListSyncs", &())
            .context("ListSyncs failed")?;
        decode("ListSyncs", payload)
    }

    pub fn create_sync(&self, request: &SyncConfigRequest) -> Result<SyncConfigView> {
        let payload: String = self
            .control()?
            .call("CreateSync", &(encode(request)?,))
            .context("CreateSync failed")?;
        decode("CreateSync", payload)
    }

    pub fn pause_sync(&self, name: &str) -> Result<()> {
        self.control()?
            .call::<_, _, ()>("PauseSync", &(name,))
            .context("PauseSync failed")
    }

    pub fn resume_sync(&self, name: &str) -> Result<()> {
        self.control()?
            .call::<_, _, ()>("ResumeSync", &(name,))
            .context("ResumeSync failed")
    }

    pub fn remove_sync(&self, name: &str) -> Result<()> {
        self.control()?
            .call::<_, _, ()>("RemoveSync", &(name,))
            .context("RemoveSync failed")
    }

    pub fn run_sync(&self, name: &str) -> Result<()> {
        self.control()?
            .call::<_, _, ()>("RunSync", &(name,))
            .context("RunSync failed")
    }

    /// An empty `name` lists the conflicts of every config.
    pub fn list_conflicts(&self, name: &str) -> Result<Vec<ConflictView>> {
        let payload: String = self
            .control()?
            .call("ListConflicts", &(name,))
            .context("ListConflicts failed")?;
        decode("ListConflicts", payload)
    }

    pub fn provision_backend(&self, request: &NewBackendRequest) -> Result<BackendView> {
        let payload: String = self
            .control()?
            .call("ProvisionBackend", &(encode(request)?,))
            .context("ProvisionBackend failed")?;
        decode("ProvisionBackend", payload)
    }

    pub fn list_backends(&self) -> Result<Vec<BackendView>> {
        let payload: String = self
            .control()?
            .call("ListBackends", &())
            .context("ListBackends failed")?;
        decode("ListBackends", payload)
    }

    pub fn show_backend(&self, id: &str) -> Result<BackendView> {
        let payload: String = self
            .control()?
            .call("ShowBackend", &(id,))
            .context("ShowBackend failed")?;
        decode("ShowBackend", payload)
    }

    pub fn update_backend(&self, id: &str, request: &BackendUpdateRequest) -> Result<BackendView> {
        let payload: String = self
            .control()?
            .call("UpdateBackend", &(id, encode(request)?))
            .context("UpdateBackend failed")?;
        decode("UpdateBackend", payload)
    }

    pub fn remove_backend(&self, id: &str) -> Result<()> {
        self.control()?
            .call::<_, _, ()>("RemoveBackend", &(id,))
            .context("RemoveBackend failed")
    }

    pub fn scan_backend(&self, id: &str) -> Result<ScanReport> {
        let payload: String = self
            .control()?
            .call("ScanBackend", &(id,))
            .context("ScanBackend failed")?;
        decode("ScanBackend", payload)
    }

    pub fn create_filter(&self, request: &FilterRequest) -> Result<FilterView> {
        let payload: String = self
            .control()?
            .call("CreateFilter", &(encode(request)?,))
            .context("CreateFilter failed")?;
        decode("CreateFilter", payload)
    }

    pub fn list_filters(&self) -> Result<Vec<FilterView>> {
        let payload: String = self
            .control()?
            .call("ListFilters", &())
            .context("ListFilters failed")?;
        decode("ListFilters", payload)
    }

    pub fn show_filter(&self, path: &str) -> Result<FilterView> {
        let payload: String = self
            .control()?
            .call("ShowFilter", &(path,))
            .context("ShowFilter failed")?;
        decode("ShowFilter", payload)
    }

    pub fn update_filter(&self, path: &str, request: &FilterRequest) -> Result<FilterView> {
        let payload: String = self
            .control()?
            .call("UpdateFilter", &(path, encode(request)?))
            .context("UpdateFilter failed")?;
        decode("UpdateFilter", payload)
    }

    pub fn delete_filter(&self, path: &str) -> Result<()> {
        self.control()?
            .call::<_, _, ()>("DeleteFilter", &(path,))
            .context("DeleteFilter failed")
    }

    pub fn test_filter(&self, query: &str) -> Result<Vec<FileView>> {
        let payload: String = self
            .control()?
            .call("TestFilter", &(query,))
            .context("TestFilter failed")?;
        decode("TestFilter", payload)
    }

    pub fn list(&self, path: &str) -> Result<Vec<VfsEntry>> {
        let payload: String = self
            .vfs()?
            .call("List", &(path,))
            .context("List failed")?;
        decode("List", payload)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.vfs()?
            .call("Exists", &(path,))
            .context("Exists failed")
    }

    pub fn touch(&self, path: &str) -> Result<FileView> {
        let payload: String = self
            .vfs()?
            .call("Touch", &(path,))
            .context("Touch failed")?;
        decode("Touch", payload)
    }

    pub fn remove(&self, path: &str, recursive: bool, confirm: bool) -> Result<u64> {
        self.vfs()?
            .call("Remove", &(path, recursive, confirm))
            .context("Remove failed")
    }

    pub fn mkdir(&self, path: &str) -> Result<FileView> {
        let payload: String = self
            .vfs()?
            .call("Mkdir", &(path,))
            .context("Mkdir failed")?;
        decode("Mkdir", payload)
    }

    pub fn tag_add(&self, path: &str, key: &str, value: &str) -> Result<bool> {
        self.vfs()?
            .call("TagAdd", &(path, key, value))
            .context("TagAdd failed")
    }

    pub fn tag_list(&self, path: &str) -> Result<Vec<TagView>> {
        let payload: String = self
            .vfs()?
            .call("TagList", &(path,))
            .context("TagList failed")?;
        decode("TagList", payload)
    }

    /// An empty `value` removes every value of `key`.
    pub fn tag_remove(&self, path: &str, key: &str, value: &str) -> Result<u64> {
        self.vfs()?
            .call("TagRemove", &(path, key, value))
            .context("TagRemove failed")
    }

    pub fn tag_search(&self, key: &str, value: &str) -> Result<Vec<FileView>> {
        let payload: String = self
            .vfs()?
            .call("TagSearch", &(key, value))
            .context("TagSearch failed")?;
        decode("TagSearch", payload)
    }

    pub fn auto_tag(&self, path: &str) -> Result<AutoTagReport> {
        let payload: String = self
            .vfs()?
            .call("AutoTag", &(path,))
            .context("AutoTag failed")?;
        decode("AutoTag", payload)
    }

    fn control(&self) -> Result<Proxy<'_>> {
        Proxy::new(
            &self.connection,
            DBUS_NAME_AGENT,
            DBUS_OBJECT_PATH_CONTROL,
            DBUS_INTERFACE_CONTROL,
        )
        .context("failed to create Control1 proxy")
    }

    fn vfs(&self) -> Result<Proxy<'_>> {
        Proxy::new(
            &self.connection,
            DBUS_NAME_AGENT,
            DBUS_OBJECT_PATH_VFS,
            DBUS_INTERFACE_VFS,
        )
        .context("failed to create Vfs1 proxy")
    }
}

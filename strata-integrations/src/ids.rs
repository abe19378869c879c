pub const APP_ID_BASE: &str = "io.strata";

pub const DBUS_NAME_AGENT: &str = "io.strata.Agent1";

pub const DBUS_INTERFACE_CONTROL: &str = "io.strata.Control1";
pub const DBUS_OBJECT_PATH_CONTROL: &str = "/io/strata/Control1";

pub const DBUS_INTERFACE_VFS: &str = "io.strata.Vfs1";
pub const DBUS_OBJECT_PATH_VFS: &str = "/io/strata/Vfs1";

pub const DBUS_ERROR_NOT_FOUND: &str = "io.strata.Error.NotFound";
pub const DBUS_ERROR_INVALID_PATH: &str = "io.strata.Error.InvalidPath";
pub const DBUS_ERROR_VALIDATION: &str = "io.strata.Error.Validation";
pub const DBUS_ERROR_CONFLICT: &str = "io.strata.Error.Conflict";
pub const DBUS_ERROR_STORAGE: &str = "io.strata.Error.Storage";
pub const DBUS_ERROR_PERSISTENCE: &str = "io.strata.Error.Persistence";
pub const DBUS_ERROR_CANCELLED: &str = "io.strata.Error.Cancelled";

pub const KEYRING_SERVICE: &str = APP_ID_BASE;
pub const KEYRING_MASTER_KEY_USER: &str = "master-key";

/// Reserved first path segment of the filter namespace.
pub const FILTER_NAMESPACE: &str = "filters";

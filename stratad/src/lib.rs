pub mod daemon;
pub mod dbus_api;
pub mod error;
pub mod filter;
pub mod registry;
pub mod resolver;
pub mod storage;
pub mod store;
pub mod sync;
pub mod vfs;

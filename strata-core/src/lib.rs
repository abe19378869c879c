mod client;
mod memory;

pub use client::{
    ConnectionInfo, Credentials, ErrorClass, ObjectBody, ObjectInfo, ObjectStore, S3Client,
    StorageError,
};
pub use memory::{InjectedFailure, MemoryObjectStore};

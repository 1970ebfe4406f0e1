//! Storage-protocol contract consumed by the transfer engine.
//!
//! The engine never talks to a concrete transport. Hosts implement
//! [`StorageClient`] on top of whatever S3-compatible SDK they use;
//! the `memory` feature provides an in-process backend for tests.

pub mod client;
pub mod error;
#[cfg(feature = "memory")]
pub mod memory;
pub mod types;

pub use client::StorageClient;
pub use error::StorageError;
#[cfg(feature = "memory")]
pub use memory::MemoryStorage;
pub use types::{InProgressUpload, ListPage, ObjectMeta, PartToken};

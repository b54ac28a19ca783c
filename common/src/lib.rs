//! Common utilities and abstractions for the testfan project.
//!
//! This crate provides the shared error taxonomy and the filesystem
//! primitives used for cross-process coordination: an advisory file lock
//! and atomically replaced JSON state files.

pub mod error;
pub mod lock;
pub mod state_file;

pub use error::{CommonError, ErrorContext, Result};
pub use lock::FileLock;

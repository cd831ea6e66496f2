//! netspace core - error and identifier types
//!
//! This crate provides the types shared by the netspace crates.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{NamespaceName, NsId, ProcessId, ThreadId};

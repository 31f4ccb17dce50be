//! # Weft Core
//!
//! Shared identifiers and the application-provided storage contract for the
//! Weft OMEMO session manager.
//!
//! This crate provides:
//! - Bare JID and device identifiers
//! - The opaque key-value storage trait the application implements
//! - Typed JSON helpers on top of it
//! - An in-memory storage implementation for tests

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
pub use storage::{KeyValueStore, KeyValueStoreExt, MemoryStore};
pub use types::{BareJid, DeviceId};

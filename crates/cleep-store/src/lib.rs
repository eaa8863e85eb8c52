//! # cleep-store
//!
//! Persistent configuration for the Cleep desktop application.
//!
//! Everything lives in a single JSON document: application flags, the
//! flashing tool section, proxy settings and the table of known devices.
//! The [`ConfigStore`] guards the document with one mutex and rewrites the
//! file atomically (temporary file + rename) on every change.

pub mod config;
pub mod devices;

mod error;

pub use config::{AppConfig, CleepSection, ConfigStore, ProxyMode, ProxySection, ToolSection};
pub use error::{Result, StoreError};

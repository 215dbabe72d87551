//! File-backed persistence of registered configurations.
//!
//! Responsibilities:
//! - Derive the plain and encrypted file locations of a configuration.
//! - Resolve and execute encryption-state migrations.
//! - Bind registered types to their files and keep both in sync.
//!
//! Does NOT handle:
//! - Backup archives (see `backup.rs`).
//! - Timers and manager lifetimes (see `manager.rs`).
//!
//! Invariants:
//! - A configuration's file path is derived from its name, never supplied.
//! - Every write goes through a temp sibling and a rename.

mod descriptor;
mod file;
pub mod migration;
mod path;
mod store;

pub use descriptor::{
    ConfigDescriptor, ConfigHandle, Configuration, Registration, RegistrationPolicy,
};
pub use migration::{MigrationDecision, resolve};
pub use path::{ConfigPaths, default_working_dir};
pub use store::{ConfigurationStore, StoreSettings};

pub(crate) use file::write_atomic;
pub(crate) use path::temp_path;

//! The configuration store.
//!
//! Responsibilities:
//! - Register configurations, resolving and executing their migration before
//!   the first load.
//! - Load, hand out and save runtime instances.
//! - Give the backup rotator locked access to the files the store owns.
//!
//! Does NOT handle:
//! - Archive creation or pruning (see `backup.rs`).
//! - Auto-save scheduling (see `manager.rs`).
//!
//! Invariants:
//! - Names and type tags are unique within a store.
//! - Registration, saves, migration, reload and backup access are serialized
//!   behind one mutex.
//! - A save writes to a temp sibling and renames it into place; the previous
//!   content survives any failure.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use secrecy::SecretString;

use super::descriptor::{
    ConfigDescriptor, ConfigHandle, Configuration, Registration, RegistrationPolicy, Slot,
    TypedSlot,
};
use super::file::{read_plain, write_atomic, write_encrypted_atomic};
use super::migration::{self, MigrationDecision, Placement};
use super::path::{ConfigPaths, validate_name};
use crate::encryption::CryptoCodec;
use crate::error::{Result, StoreError};
use crate::format::Format;

/// Settings fixed for the lifetime of a store.
#[derive(Debug, Default)]
pub struct StoreSettings {
    /// Serialization format of every configuration body.
    pub format: Format,
    /// Auto-save period; `None` disables the timer.
    pub auto_save_interval: Option<Duration>,
    /// Whether configurations are kept encrypted at rest.
    pub encryption_enabled: bool,
    /// Whether the manager keeps backup archives.
    pub backups_enabled: bool,
    /// Password for encrypting, and for decrypting files written while
    /// encryption was enabled.
    pub password: Option<SecretString>,
    /// Upper bound on implemented configurations.
    pub max_configurations: Option<usize>,
}

struct Entry {
    descriptor: ConfigDescriptor,
    slot: Box<dyn Slot>,
}

#[derive(Default)]
struct StoreState {
    entries: Vec<Entry>,
}

impl StoreState {
    /// Looks up an entry by name first, then by type tag.
    fn find(&self, key: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name == key)
            .or_else(|| self.entries.iter().find(|e| e.descriptor.type_tag == key))
    }
}

/// Typed, file-backed configuration store rooted at one working directory.
pub struct ConfigurationStore {
    working_dir: PathBuf,
    settings: StoreSettings,
    state: Mutex<StoreState>,
}

impl ConfigurationStore {
    /// Creates a store in `working_dir`, creating the directory if needed.
    pub fn new(working_dir: impl Into<PathBuf>, settings: StoreSettings) -> Result<Self> {
        if settings.encryption_enabled && settings.password.is_none() {
            return Err(StoreError::Validation(
                "encryption is enabled but no password was provided".to_string(),
            ));
        }

        let working_dir = working_dir.into();
        fs::create_dir_all(&working_dir).map_err(|e| StoreError::io(&working_dir, e))?;

        Ok(Self {
            working_dir,
            settings,
            state: Mutex::new(StoreState::default()),
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Registers a configuration, migrating and loading its file.
    ///
    /// Returns the descriptor of the now-registered configuration.
    pub fn implement<T: Configuration>(
        &self,
        registration: Registration<T>,
    ) -> Result<ConfigDescriptor> {
        validate_name(registration.name())?;
        if registration.type_tag().trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "type tag of configuration '{}' cannot be blank",
                registration.name()
            )));
        }

        let mut state = self.lock();

        if let Some(existing) = state.entries.iter().find(|e| {
            e.descriptor.name == registration.name()
                || e.descriptor.type_tag == registration.type_tag()
        }) {
            return Err(StoreError::Duplicate(existing.descriptor.name.clone()));
        }
        if let Some(limit) = self.settings.max_configurations
            && state.entries.len() >= limit
        {
            return Err(StoreError::Capacity { limit });
        }

        let (name, type_tag, slot) = registration.into_parts();
        let placement = self.settle(&name)?;
        let mut entry = Entry {
            descriptor: ConfigDescriptor {
                name,
                type_tag,
                file_path: placement.path.clone(),
                encrypted: placement.encrypted,
                format: self.settings.format,
            },
            slot: Box::new(slot),
        };
        self.apply(&mut entry, &placement, false)?;

        tracing::info!(
            name = %entry.descriptor.name,
            type_tag = %entry.descriptor.type_tag,
            ty = entry.slot.type_name(),
            path = %entry.descriptor.file_path.display(),
            encrypted = entry.descriptor.encrypted,
            "Implemented configuration"
        );

        let descriptor = entry.descriptor.clone();
        state.entries.push(entry);
        Ok(descriptor)
    }

    /// Registers a configuration under an explicit error policy.
    ///
    /// Under [`RegistrationPolicy::Lenient`], validation and duplicate errors
    /// are logged and `Ok(None)` is returned.
    pub fn implement_with<T: Configuration>(
        &self,
        registration: Registration<T>,
        policy: RegistrationPolicy,
    ) -> Result<Option<ConfigDescriptor>> {
        let name = registration.name().to_string();
        match self.implement(registration) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(e) if policy == RegistrationPolicy::Lenient && e.is_registration_error() => {
                tracing::warn!(name = %name, error = %e, "Skipping configuration registration");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the shared instance registered under `key` (a name or type tag).
    pub fn get<T: Configuration>(&self, key: &str) -> Result<ConfigHandle<T>> {
        let state = self.lock();
        let entry = state
            .find(key)
            .ok_or_else(|| StoreError::ConfigNotFound(key.to_string()))?;

        entry
            .slot
            .as_any()
            .downcast_ref::<TypedSlot<T>>()
            .map(TypedSlot::<T>::handle)
            .ok_or_else(|| StoreError::TypeMismatch {
                name: entry.descriptor.name.clone(),
                requested: std::any::type_name::<T>().to_string(),
            })
    }

    /// Writes the configuration registered under `key` to disk.
    pub fn save(&self, key: &str) -> Result<()> {
        let state = self.lock();
        let entry = state
            .find(key)
            .ok_or_else(|| StoreError::ConfigNotFound(key.to_string()))?;
        self.write_entry(entry)
    }

    /// Writes every configuration to disk.
    ///
    /// Every configuration is attempted; the first error is returned.
    pub fn save_all(&self) -> Result<()> {
        let state = self.lock();
        self.write_all(&state)
    }

    /// Like [`save_all`](Self::save_all), but returns `Ok(false)` without
    /// saving if the store is busy.
    pub fn try_save_all(&self) -> Result<bool> {
        let state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };
        self.write_all(&state)?;
        Ok(true)
    }

    /// Returns true if a configuration with `type_tag` is registered.
    pub fn has(&self, type_tag: &str) -> bool {
        self.lock()
            .entries
            .iter()
            .any(|e| e.descriptor.type_tag == type_tag)
    }

    /// Descriptors of every registered configuration, in registration order.
    pub fn descriptors(&self) -> Vec<ConfigDescriptor> {
        self.lock()
            .entries
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Descriptor of the configuration registered under `key`.
    pub fn descriptor(&self, key: &str) -> Option<ConfigDescriptor> {
        self.lock().find(key).map(|e| e.descriptor.clone())
    }

    /// Runs `f` over the owned file paths while holding the store lock.
    pub(crate) fn with_owned_files<R>(&self, f: impl FnOnce(&[PathBuf]) -> Result<R>) -> Result<R> {
        let state = self.lock();
        let paths: Vec<PathBuf> = state
            .entries
            .iter()
            .map(|e| e.descriptor.file_path.clone())
            .collect();
        f(&paths)
    }

    /// Runs `restore` against the working directory while holding the store
    /// lock, then reloads every configuration from disk.
    ///
    /// `restore` returns the paths it wrote. A restored file in the other
    /// encryption state is migrated onto the current state, replacing the
    /// current file, before the configuration is reloaded.
    pub(crate) fn restore_with(
        &self,
        restore: impl FnOnce(&Path) -> Result<Vec<PathBuf>>,
    ) -> Result<()> {
        let mut state = self.lock();
        let restored = restore(&self.working_dir)?;

        for entry in &mut state.entries {
            let placement = self.settle_restored(&entry.descriptor.name, &restored)?;
            self.apply(entry, &placement, true)?;
        }
        tracing::info!(
            count = state.entries.len(),
            dir = %self.working_dir.display(),
            "Reloaded configurations"
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves and executes the migration for `name`.
    fn settle(&self, name: &str) -> Result<Placement> {
        let paths = ConfigPaths::new(&self.working_dir, name);
        let decision = migration::resolve(
            paths.plain.exists(),
            paths.encrypted.exists(),
            self.settings.encryption_enabled,
        );
        self.execute(name, decision, &paths)
    }

    /// Like [`settle`](Self::settle), but a file in `restored` wins over the
    /// file already in place, whichever encryption state it is in.
    fn settle_restored(&self, name: &str, restored: &[PathBuf]) -> Result<Placement> {
        let paths = ConfigPaths::new(&self.working_dir, name);
        let enabled = self.settings.encryption_enabled;

        let decision = match (
            restored.contains(&paths.plain),
            restored.contains(&paths.encrypted),
        ) {
            (true, false) if enabled => MigrationDecision::EncryptExisting,
            (false, true) if !enabled => MigrationDecision::DecryptExisting,
            _ => migration::resolve(paths.plain.exists(), paths.encrypted.exists(), enabled),
        };
        self.execute(name, decision, &paths)
    }

    fn execute(
        &self,
        name: &str,
        decision: MigrationDecision,
        paths: &ConfigPaths,
    ) -> Result<Placement> {
        tracing::debug!(name = %name, ?decision, "Resolved migration");
        migration::execute(
            decision,
            paths,
            self.settings.encryption_enabled,
            self.settings.password.as_ref(),
        )
    }

    /// Points `entry` at `placement` and brings its instance in line with disk.
    ///
    /// A fresh placement gets a default body, unless `keep_instance` asks for
    /// the current instance to be written instead.
    fn apply(&self, entry: &mut Entry, placement: &Placement, keep_instance: bool) -> Result<()> {
        entry.descriptor.file_path = placement.path.clone();
        entry.descriptor.encrypted = placement.encrypted;

        if placement.fresh {
            if !keep_instance {
                entry.slot.reset();
            }
            self.write_entry(entry)
        } else {
            self.load_entry(entry)
        }
    }

    fn load_entry(&self, entry: &Entry) -> Result<()> {
        let descriptor = &entry.descriptor;
        let mut bytes = read_plain(&descriptor.file_path)?;

        if descriptor.encrypted && !bytes.is_empty() {
            let mut plaintext = Vec::new();
            CryptoCodec::decrypt_stream(bytes.as_slice(), &mut plaintext, self.password()?)?;
            bytes = plaintext;
        }

        if bytes.is_empty() {
            entry.slot.reset();
            return Ok(());
        }

        entry
            .slot
            .load(descriptor.format, &bytes)
            .map_err(|source| StoreError::InvalidConfigFile {
                path: descriptor.file_path.clone(),
                source,
            })
    }

    fn write_entry(&self, entry: &Entry) -> Result<()> {
        let descriptor = &entry.descriptor;
        let bytes = entry.slot.encode(descriptor.format)?;

        if descriptor.encrypted {
            write_encrypted_atomic(&descriptor.file_path, &bytes, self.password()?)?;
        } else {
            write_atomic(&descriptor.file_path, &bytes)?;
        }

        tracing::debug!(
            name = %descriptor.name,
            path = %descriptor.file_path.display(),
            "Saved configuration"
        );
        Ok(())
    }

    fn write_all(&self, state: &StoreState) -> Result<()> {
        let mut first_error = None;
        for entry in &state.entries {
            if let Err(e) = self.write_entry(entry) {
                tracing::warn!(
                    name = %entry.descriptor.name,
                    error = %e,
                    "Failed to save configuration"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn password(&self) -> Result<&SecretString> {
        self.settings
            .password
            .as_ref()
            .ok_or(StoreError::MissingPassword)
    }
}

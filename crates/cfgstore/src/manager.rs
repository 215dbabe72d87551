//! Persistence managers and their registry.
//!
//! Responsibilities:
//! - Build a store, an optional backup rotator and an optional auto-save
//!   timer from one set of settings.
//! - Expose the application-facing operations of the store.
//! - Keep managers addressable by a caller-chosen identifier.
//!
//! Does NOT handle:
//! - File formats, encryption or migration (see `persistence`).
//! - Archive layout (see `backup.rs`).
//!
//! Invariants:
//! - A manager's settings never change after `build`.
//! - At most one auto-save thread runs per manager; it is stopped and joined
//!   on `terminate` or drop.
//! - An auto-save tick never waits for a busy store; it is skipped.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use secrecy::SecretString;

use crate::backup::{BackupRecord, BackupRotator};
use crate::constants::BACKUP_DIR_NAME;
use crate::error::{Result, StoreError};
use crate::format::Format;
use crate::persistence::{
    ConfigDescriptor, ConfigHandle, Configuration, ConfigurationStore, Registration,
    RegistrationPolicy, StoreSettings, default_working_dir,
};

/// Builder for [`PersistenceManager`].
///
/// ```rust,ignore
/// let manager = PersistenceManager::builder("app", "/var/lib/app")
///     .format(Format::Binary)
///     .auto_save_every(Duration::from_secs(30))
///     .backups(true)
///     .build()?;
/// ```
#[derive(Debug)]
pub struct PersistenceManagerBuilder {
    identifier: String,
    working_dir: PathBuf,
    settings: StoreSettings,
}

impl PersistenceManagerBuilder {
    pub fn new(identifier: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            working_dir: working_dir.into(),
            settings: StoreSettings::default(),
        }
    }

    /// Starts a builder rooted at the platform configuration directory for
    /// `identifier`.
    pub fn with_default_dir(identifier: impl Into<String>) -> Result<Self> {
        let identifier = identifier.into();
        let working_dir = default_working_dir(&identifier)?;
        Ok(Self::new(identifier, working_dir))
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn format(mut self, format: Format) -> Self {
        self.settings.format = format;
        self
    }

    /// Saves every configuration each `interval`.
    ///
    /// A zero or `Duration::MAX` interval disables the timer.
    pub fn auto_save_every(mut self, interval: Duration) -> Self {
        self.settings.auto_save_interval =
            (!interval.is_zero() && interval != Duration::MAX).then_some(interval);
        self
    }

    /// Keeps configurations encrypted with `password`.
    pub fn encrypt(mut self, password: SecretString) -> Self {
        self.settings.encryption_enabled = true;
        self.settings.password = Some(password);
        self
    }

    /// Sets the password without enabling encryption, so files encrypted
    /// earlier can be decrypted back to plain files.
    pub fn password(mut self, password: SecretString) -> Self {
        self.settings.password = Some(password);
        self
    }

    pub fn backups(mut self, enabled: bool) -> Self {
        self.settings.backups_enabled = enabled;
        self
    }

    pub fn max_configurations(mut self, limit: usize) -> Self {
        self.settings.max_configurations = Some(limit);
        self
    }

    /// Creates the store, the rotator (if backups are enabled) and starts the
    /// auto-save timer (if an interval is set).
    pub fn build(self) -> Result<PersistenceManager> {
        if self.identifier.trim().is_empty() {
            return Err(StoreError::Validation(
                "manager identifier cannot be blank".to_string(),
            ));
        }

        let store = Arc::new(ConfigurationStore::new(self.working_dir, self.settings)?);
        let settings = store.settings();

        let rotator = if settings.backups_enabled {
            let directory = store.working_dir().join(BACKUP_DIR_NAME);
            Some(BackupRotator::configure(Arc::clone(&store), directory)?)
        } else {
            None
        };

        let auto_save = match settings.auto_save_interval {
            Some(interval) => Some(AutoSave::start(&self.identifier, Arc::clone(&store), interval)?),
            None => None,
        };

        tracing::info!(
            identifier = %self.identifier,
            dir = %store.working_dir().display(),
            format = %settings.format,
            encrypted = settings.encryption_enabled,
            backups = settings.backups_enabled,
            auto_save = ?settings.auto_save_interval,
            "Built persistence manager"
        );

        Ok(PersistenceManager {
            identifier: self.identifier,
            store,
            rotator,
            auto_save: Mutex::new(auto_save),
        })
    }
}

/// Application-facing handle over one configuration store.
pub struct PersistenceManager {
    identifier: String,
    store: Arc<ConfigurationStore>,
    rotator: Option<BackupRotator>,
    auto_save: Mutex<Option<AutoSave>>,
}

impl PersistenceManager {
    pub fn builder(
        identifier: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> PersistenceManagerBuilder {
        PersistenceManagerBuilder::new(identifier, working_dir)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn store(&self) -> &ConfigurationStore {
        &self.store
    }

    pub fn implement<T: Configuration>(
        &self,
        registration: Registration<T>,
    ) -> Result<ConfigDescriptor> {
        self.store.implement(registration)
    }

    pub fn implement_with<T: Configuration>(
        &self,
        registration: Registration<T>,
        policy: RegistrationPolicy,
    ) -> Result<Option<ConfigDescriptor>> {
        self.store.implement_with(registration, policy)
    }

    pub fn get<T: Configuration>(&self, key: &str) -> Result<ConfigHandle<T>> {
        self.store.get(key)
    }

    pub fn has(&self, type_tag: &str) -> bool {
        self.store.has(type_tag)
    }

    pub fn save(&self, key: &str) -> Result<()> {
        self.store.save(key)
    }

    pub fn save_all(&self) -> Result<()> {
        self.store.save_all()
    }

    pub fn descriptors(&self) -> Vec<ConfigDescriptor> {
        self.store.descriptors()
    }

    /// Archives the current configuration files.
    pub fn create_backup(&self) -> Result<BackupRecord> {
        self.rotator()?.create_backup()
    }

    /// Restores the most recent backup and reloads every configuration.
    pub fn restore_latest_backup(&self) -> Result<BackupRecord> {
        self.rotator()?.restore_latest()
    }

    /// Known backups, oldest first. Empty when backups are disabled.
    pub fn backups(&self) -> Vec<BackupRecord> {
        self.rotator
            .as_ref()
            .map(BackupRotator::records)
            .unwrap_or_default()
    }

    /// Stops the auto-save timer, saves every configuration and takes a
    /// backup if backups are enabled.
    pub fn terminate(&self) -> Result<()> {
        if let Some(auto_save) = self.lock_auto_save().take() {
            auto_save.stop();
        }

        self.store.save_all()?;
        if let Some(rotator) = &self.rotator {
            rotator.create_backup()?;
        }

        tracing::info!(identifier = %self.identifier, "Terminated persistence manager");
        Ok(())
    }

    fn rotator(&self) -> Result<&BackupRotator> {
        self.rotator.as_ref().ok_or(StoreError::BackupsDisabled)
    }

    fn lock_auto_save(&self) -> MutexGuard<'_, Option<AutoSave>> {
        self.auto_save.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background thread saving a store on a fixed period.
struct AutoSave {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl AutoSave {
    fn start(identifier: &str, store: Arc<ConfigurationStore>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let working_dir = store.working_dir().to_path_buf();

        let handle = thread::Builder::new()
            .name(format!("autosave-{identifier}"))
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(&store),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| StoreError::io(working_dir, e))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("Auto-save thread panicked");
        }
    }
}

impl Drop for AutoSave {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn tick(store: &ConfigurationStore) {
    match store.try_save_all() {
        Ok(true) => tracing::debug!("Auto-saved configurations"),
        Ok(false) => tracing::debug!("Store busy; skipping auto-save tick"),
        Err(e) => tracing::warn!(error = %e, "Auto-save failed"),
    }
}

/// Persistence managers addressable by identifier.
#[derive(Default)]
pub struct ManagerRegistry {
    managers: Mutex<BTreeMap<String, Arc<PersistenceManager>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a manager and registers it under the builder's identifier.
    ///
    /// Nothing is built if the identifier is already taken.
    pub fn build(&self, builder: PersistenceManagerBuilder) -> Result<Arc<PersistenceManager>> {
        let mut managers = self.lock();
        if managers.contains_key(builder.identifier()) {
            return Err(StoreError::DuplicateManager(builder.identifier().to_string()));
        }

        let manager = Arc::new(builder.build()?);
        managers.insert(manager.identifier().to_string(), Arc::clone(&manager));
        Ok(manager)
    }

    pub fn get(&self, identifier: &str) -> Result<Arc<PersistenceManager>> {
        self.lock()
            .get(identifier)
            .cloned()
            .ok_or_else(|| StoreError::ManagerNotFound(identifier.to_string()))
    }

    /// Registered identifiers, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Unregisters and terminates one manager.
    pub fn terminate(&self, identifier: &str) -> Result<()> {
        let manager = self
            .lock()
            .remove(identifier)
            .ok_or_else(|| StoreError::ManagerNotFound(identifier.to_string()))?;
        manager.terminate()
    }

    /// Unregisters and terminates every manager.
    ///
    /// Every manager is terminated; the first error is returned.
    pub fn terminate_all(&self) -> Result<()> {
        let managers = std::mem::take(&mut *self.lock());

        let mut first_error = None;
        for (identifier, manager) in managers {
            if let Err(e) = manager.terminate() {
                tracing::warn!(identifier = %identifier, error = %e, "Failed to terminate manager");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<PersistenceManager>>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Settings {
        test: String,
    }

    fn read_settings(path: &std::path::Path) -> Settings {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_zero_and_unbounded_intervals_disable_auto_save() {
        let dir = tempfile::tempdir().unwrap();

        let zero = PersistenceManager::builder("zero", dir.path()).auto_save_every(Duration::ZERO);
        assert_eq!(zero.settings.auto_save_interval, None);

        let max = PersistenceManager::builder("max", dir.path()).auto_save_every(Duration::MAX);
        assert_eq!(max.settings.auto_save_interval, None);

        let manager = zero.build().unwrap();
        assert!(manager.lock_auto_save().is_none());
    }

    #[test]
    fn test_blank_identifier_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = PersistenceManager::builder("  ", dir.path()).build();
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_auto_save_writes_changes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::builder("auto", dir.path())
            .auto_save_every(Duration::from_millis(20))
            .build()
            .unwrap();
        let descriptor = manager
            .implement(Registration::<Settings>::new("settings"))
            .unwrap();

        manager.get::<Settings>("settings").unwrap().write().unwrap().test =
            "background".to_string();

        let deadline = Instant::now() + Duration::from_secs(5);
        while read_settings(&descriptor.file_path).test != "background" {
            assert!(Instant::now() < deadline, "auto-save never ran");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_terminate_saves_backs_up_and_stops_timer() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::builder("term", dir.path())
            .auto_save_every(Duration::from_secs(3600))
            .backups(true)
            .build()
            .unwrap();
        let descriptor = manager
            .implement(Registration::<Settings>::new("settings"))
            .unwrap();
        manager.get::<Settings>("settings").unwrap().write().unwrap().test = "final".to_string();

        // The hour-long timer must not delay termination.
        let started = Instant::now();
        manager.terminate().unwrap();
        assert!(started.elapsed() < Duration::from_secs(60));

        assert!(manager.lock_auto_save().is_none());
        assert_eq!(read_settings(&descriptor.file_path).test, "final");
        assert_eq!(manager.backups().len(), 1);
        assert!(dir.path().join("Backups").is_dir());
    }

    #[test]
    fn test_backup_operations_require_backups() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::builder("plain", dir.path())
            .build()
            .unwrap();

        assert!(matches!(
            manager.restore_latest_backup(),
            Err(StoreError::BackupsDisabled)
        ));
        assert!(matches!(manager.create_backup(), Err(StoreError::BackupsDisabled)));
        assert!(manager.backups().is_empty());
        assert!(!dir.path().join("Backups").exists());
    }

    #[test]
    fn test_password_without_encryption_decrypts_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let password = || SecretString::new("manager-tests".to_string().into());

        {
            let encrypted = PersistenceManager::builder("enc", dir.path())
                .encrypt(password())
                .build()
                .unwrap();
            encrypted
                .implement(Registration::<Settings>::new("settings"))
                .unwrap();
            encrypted.get::<Settings>("settings").unwrap().write().unwrap().test =
                "secret".to_string();
            encrypted.terminate().unwrap();
        }

        let plain = PersistenceManager::builder("dec", dir.path())
            .password(password())
            .build()
            .unwrap();
        let descriptor = plain
            .implement(Registration::<Settings>::new("settings"))
            .unwrap();

        assert!(!descriptor.encrypted);
        assert!(!dir.path().join("settings.bccfg").exists());
        assert_eq!(read_settings(&descriptor.file_path).test, "secret");
    }

    #[test]
    fn test_registry_rejects_duplicate_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ManagerRegistry::new();

        registry
            .build(PersistenceManager::builder("app", dir.path().join("a")))
            .unwrap();
        let err = registry
            .build(PersistenceManager::builder("app", dir.path().join("b")))
            .err()
            .unwrap();

        assert!(matches!(err, StoreError::DuplicateManager(ref id) if id == "app"));
        assert!(!dir.path().join("b").exists(), "duplicate must not build a store");
    }

    #[test]
    fn test_registry_lookup_and_termination() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ManagerRegistry::new();
        for id in ["beta", "alpha"] {
            registry
                .build(PersistenceManager::builder(id, dir.path().join(id)))
                .unwrap();
        }

        assert_eq!(registry.identifiers(), vec!["alpha", "beta"]);
        assert_eq!(registry.get("alpha").unwrap().identifier(), "alpha");
        assert!(matches!(
            registry.get("gamma"),
            Err(StoreError::ManagerNotFound(_))
        ));

        registry.terminate("alpha").unwrap();
        assert!(matches!(
            registry.terminate("alpha"),
            Err(StoreError::ManagerNotFound(_))
        ));

        registry.terminate_all().unwrap();
        assert!(registry.identifiers().is_empty());
    }
}

//! Typed, file-backed configuration storage.
//!
//! Applications register plain serde types as named configurations. The store
//! keeps each one in a file in its working directory, optionally encrypted
//! with a password, and a persistence manager can save them on a timer and
//! keep rotating backup archives.
//!
//! ```rust,ignore
//! let manager = PersistenceManager::builder("app", working_dir)
//!     .format(Format::Json)
//!     .encrypt(password)
//!     .backups(true)
//!     .build()?;
//! manager.implement(Registration::<AppSettings>::new("settings"))?;
//! let settings = manager.get::<AppSettings>("settings")?;
//! ```

pub mod backup;
pub mod constants;
pub mod encryption;
pub mod error;
pub mod format;
pub mod manager;
pub mod persistence;

pub use backup::{BackupRecord, BackupRotator};
pub use encryption::{CryptoCodec, CryptoError, PasswordBuffer};
pub use error::{Result, StoreError};
pub use format::{Format, FormatError};
pub use manager::{ManagerRegistry, PersistenceManager, PersistenceManagerBuilder};
pub use persistence::{
    ConfigDescriptor, ConfigHandle, Configuration, ConfigurationStore, MigrationDecision,
    Registration, RegistrationPolicy, StoreSettings,
};

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{Arc, Mutex, OnceLock, PoisonError};

    pub fn global_test_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    /// Keeps the `message` field of each event. Spans are ignored.
    struct MessageCollector {
        messages: Arc<Mutex<Vec<String>>>,
    }

    struct MessageField(Option<String>);

    impl tracing::field::Visit for MessageField {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    impl tracing::Subscriber for MessageCollector {
        fn enabled(&self, _metadata: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _attrs: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }

        fn record(&self, _span: &tracing::span::Id, _values: &tracing::span::Record<'_>) {}

        fn record_follows_from(&self, _span: &tracing::span::Id, _follows: &tracing::span::Id) {}

        fn event(&self, event: &tracing::Event<'_>) {
            let mut field = MessageField(None);
            event.record(&mut field);
            if let Some(message) = field.0 {
                self.messages
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(message);
            }
        }

        fn enter(&self, _span: &tracing::span::Id) {}

        fn exit(&self, _span: &tracing::span::Id) {}
    }

    /// Runs `f` with a subscriber installed on this thread and returns the
    /// messages of every event it emitted.
    pub fn capture_messages<F: FnOnce()>(f: F) -> Vec<String> {
        let _guard = global_test_lock()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let messages = Arc::new(Mutex::new(Vec::new()));
        let dispatch = tracing::Dispatch::new(MessageCollector {
            messages: Arc::clone(&messages),
        });
        tracing::dispatcher::with_default(&dispatch, f);
        std::mem::take(&mut *messages.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

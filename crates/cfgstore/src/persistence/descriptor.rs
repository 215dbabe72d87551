//! Configuration descriptors and registrations.
//!
//! Responsibilities:
//! - Define `ConfigDescriptor`, the record binding a name to its type tag,
//!   file location and encryption state.
//! - Define `Registration<T>`, the explicit input used to implement a type.
//! - Hold each runtime instance behind a type-erased slot so the store can
//!   encode, decode and reset it without knowing `T`.
//!
//! Invariants:
//! - A slot's instance is replaced wholesale on load or reset, never merged.
//! - A decode failure leaves the current instance untouched.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::format::{Format, FormatError};

/// Types that can be stored as configurations.
pub trait Configuration: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Configuration for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Shared handle to a configuration's runtime instance.
///
/// The store hands out the same handle it saves from. Mutating the instance
/// while a save runs on another thread is safe but the save may observe
/// either the old or the new value.
pub type ConfigHandle<T> = Arc<RwLock<T>>;

/// Whether registration errors abort or are downgraded to warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationPolicy {
    /// Validation and duplicate errors are returned to the caller.
    #[default]
    Strict,
    /// Validation and duplicate errors are logged and the call is a no-op.
    /// Migration, crypto and I/O errors are still returned.
    Lenient,
}

/// Binding between a configuration name and its on-disk representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    /// Unique name within the store; also the file stem.
    pub name: String,
    /// Registrant-chosen tag identifying the configuration's type.
    pub type_tag: String,
    /// Absolute path of the file currently backing the configuration.
    pub file_path: PathBuf,
    /// Whether `file_path` holds encrypted content.
    pub encrypted: bool,
    /// Serialization format of the body.
    pub format: Format,
}

type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Explicit registration of a configuration type.
///
/// ```rust,ignore
/// let registration = Registration::<AppSettings>::new("settings").with_type_tag("app.settings");
/// manager.implement(registration)?;
/// ```
pub struct Registration<T> {
    name: String,
    type_tag: Option<String>,
    factory: Factory<T>,
}

impl<T: Configuration + Default> Registration<T> {
    /// Registers `T` under `name`, using `T::default()` for fresh instances.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_factory(name, T::default)
    }
}

impl<T: Configuration> Registration<T> {
    /// Registers `T` under `name` with a custom factory for fresh instances.
    pub fn with_factory<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            type_tag: None,
            factory: Arc::new(factory),
        }
    }

    /// Sets the type tag. Defaults to the configuration name.
    pub fn with_type_tag(mut self, type_tag: impl Into<String>) -> Self {
        self.type_tag = Some(type_tag.into());
        self
    }

    /// The configuration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type tag, falling back to the name.
    pub fn type_tag(&self) -> &str {
        self.type_tag.as_deref().unwrap_or(&self.name)
    }

    pub(crate) fn into_parts(self) -> (String, String, TypedSlot<T>) {
        let type_tag = self.type_tag.unwrap_or_else(|| self.name.clone());
        let slot = TypedSlot {
            value: Arc::new(RwLock::new((self.factory)())),
            factory: self.factory,
        };
        (self.name, type_tag, slot)
    }
}

impl<T> fmt::Debug for Registration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

/// Type-erased access to a runtime instance.
pub(crate) trait Slot: Send + Sync {
    fn encode(&self, format: Format) -> Result<Vec<u8>, FormatError>;
    fn load(&self, format: Format, bytes: &[u8]) -> Result<(), FormatError>;
    fn reset(&self);
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

pub(crate) struct TypedSlot<T> {
    value: ConfigHandle<T>,
    factory: Factory<T>,
}

impl<T: Configuration> TypedSlot<T> {
    pub(crate) fn handle(&self) -> ConfigHandle<T> {
        Arc::clone(&self.value)
    }
}

impl<T: Configuration> Slot for TypedSlot<T> {
    fn encode(&self, format: Format) -> Result<Vec<u8>, FormatError> {
        let guard = self.value.read().unwrap_or_else(PoisonError::into_inner);
        format.encode(&*guard)
    }

    fn load(&self, format: Format, bytes: &[u8]) -> Result<(), FormatError> {
        let fresh: T = format.decode(bytes)?;
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    fn reset(&self) {
        let fresh = (self.factory)();
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

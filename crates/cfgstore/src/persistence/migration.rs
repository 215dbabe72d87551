//! Encryption-state migration.
//!
//! Responsibilities:
//! - Decide, from what exists on disk and whether encryption is wanted, the one
//!   action a configuration needs before first use.
//! - Execute that action atomically (encrypt or decrypt an existing file).
//!
//! Does NOT handle:
//! - Loading or decoding the configuration body (see `store.rs`).
//! - Writing fresh default bodies (the store does that for `CreateFresh`).
//!
//! Invariants:
//! - `resolve` is pure and total; rules are evaluated in table order, so an
//!   existing encrypted file always decides the outcome.
//! - A migration either fully succeeds (new file in place, old file removed)
//!   or leaves the old file untouched and no new file behind.

use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;

use super::file::{read_decrypted, read_plain, write_atomic, write_encrypted_atomic};
use super::path::ConfigPaths;
use crate::error::{Result, StoreError};

/// The action required to reconcile on-disk state with the desired encryption state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDecision {
    /// Use the existing file as-is.
    NoAction,
    /// Decrypt the encrypted file and use the plain file from now on.
    DecryptExisting,
    /// Encrypt the plain file and use the encrypted file from now on.
    EncryptExisting,
    /// No file exists; write a default instance under the desired state.
    CreateFresh,
    /// Both files exist in a state the rules do not cover.
    Ambiguous,
}

/// Resolves the migration decision.
///
/// | plain | encrypted | enabled | decision        |
/// |-------|-----------|---------|-----------------|
/// | any   | yes       | yes     | NoAction        |
/// | any   | yes       | no      | DecryptExisting |
/// | yes   | no        | no      | NoAction        |
/// | yes   | no        | yes     | EncryptExisting |
/// | no    | no        | any     | CreateFresh     |
///
/// `Ambiguous` is never returned: the first two rules already cover every
/// case where both files exist.
pub fn resolve(
    plain_exists: bool,
    encrypted_exists: bool,
    encryption_enabled: bool,
) -> MigrationDecision {
    match (plain_exists, encrypted_exists, encryption_enabled) {
        (_, true, true) => MigrationDecision::NoAction,
        (_, true, false) => MigrationDecision::DecryptExisting,
        (true, false, false) => MigrationDecision::NoAction,
        (true, false, true) => MigrationDecision::EncryptExisting,
        (false, false, _) => MigrationDecision::CreateFresh,
    }
}

/// Where a configuration lives after its migration ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placement {
    pub path: PathBuf,
    pub encrypted: bool,
    /// True when no file existed and the caller must write a default body.
    pub fresh: bool,
}

/// Executes `decision` against the candidate `paths`.
pub(crate) fn execute(
    decision: MigrationDecision,
    paths: &ConfigPaths,
    encryption_enabled: bool,
    password: Option<&SecretString>,
) -> Result<Placement> {
    match decision {
        MigrationDecision::NoAction => Ok(Placement {
            path: paths.for_state(encryption_enabled).to_path_buf(),
            encrypted: encryption_enabled,
            fresh: false,
        }),
        MigrationDecision::CreateFresh => Ok(Placement {
            path: paths.for_state(encryption_enabled).to_path_buf(),
            encrypted: encryption_enabled,
            fresh: true,
        }),
        MigrationDecision::EncryptExisting => {
            let password = password.ok_or(StoreError::MissingPassword)?;
            let plaintext = read_plain(&paths.plain)?;
            replace_file(&paths.plain, &paths.encrypted, |target| {
                write_encrypted_atomic(target, &plaintext, password)
            })?;
            tracing::info!(
                from = %paths.plain.display(),
                to = %paths.encrypted.display(),
                "Encrypted existing configuration file"
            );
            Ok(Placement {
                path: paths.encrypted.clone(),
                encrypted: true,
                fresh: false,
            })
        }
        MigrationDecision::DecryptExisting => {
            let password = password.ok_or(StoreError::MissingPassword)?;
            let plaintext = read_decrypted(&paths.encrypted, password)?;
            replace_file(&paths.encrypted, &paths.plain, |target| {
                write_atomic(target, &plaintext)
            })?;
            tracing::info!(
                from = %paths.encrypted.display(),
                to = %paths.plain.display(),
                "Decrypted existing configuration file"
            );
            Ok(Placement {
                path: paths.plain.clone(),
                encrypted: false,
                fresh: false,
            })
        }
        MigrationDecision::Ambiguous => Err(StoreError::AmbiguousMigrationState {
            plain: paths.plain.clone(),
            encrypted: paths.encrypted.clone(),
        }),
    }
}

/// Writes `new` with `write`, then removes `old`.
///
/// If `old` cannot be removed, a freshly created `new` is removed again so the
/// directory is left as it was.
fn replace_file<F>(old: &Path, new: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let new_existed = new.exists();
    write(new)?;

    if let Err(e) = fs::remove_file(old) {
        if !new_existed && let Err(cleanup) = fs::remove_file(new) {
            tracing::warn!(
                path = %new.display(),
                error = %cleanup,
                "Could not roll back migrated configuration file"
            );
        }
        return Err(StoreError::io(old, e));
    }
    Ok(())
}

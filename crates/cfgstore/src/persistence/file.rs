//! File I/O helpers for configuration files.
//!
//! Responsibilities:
//! - Atomic writes (temp file + rename) of plain and encrypted bodies.
//! - Reading plain and encrypted bodies back into memory.
//!
//! Invariants:
//! - A failed write never touches the target path; the temp file is removed.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use secrecy::SecretString;

use super::path::temp_path;
use crate::encryption::CryptoCodec;
use crate::error::{Result, StoreError};

/// Writes `bytes` to `path` via a temporary sibling and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_via_temp(path, |writer, temp| {
        writer
            .write_all(bytes)
            .map_err(|e| StoreError::io(temp, e))
    })
}

/// Encrypts `plaintext` and writes it to `path` via a temporary sibling and a rename.
pub(crate) fn write_encrypted_atomic(
    path: &Path,
    plaintext: &[u8],
    password: &SecretString,
) -> Result<()> {
    write_via_temp(path, |writer, _| {
        CryptoCodec::encrypt_stream(plaintext, writer, password)?;
        Ok(())
    })
}

fn write_via_temp<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>, &Path) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let temp = temp_path(path);
    let result: Result<_> = (|| {
        let file = File::create(&temp).map_err(|e| StoreError::io(&temp, e))?;
        let mut writer = BufWriter::new(file);
        write(&mut writer, &temp)?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::io(&temp, e.into_error()))?;
        file.sync_all().map_err(|e| StoreError::io(&temp, e))?;
        fs::rename(&temp, path).map_err(|e| StoreError::io(path, e))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Reads a plain body.
pub(crate) fn read_plain(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| StoreError::io(path, e))
}

/// Reads and decrypts an encrypted body.
pub(crate) fn read_decrypted(path: &Path, password: &SecretString) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let mut plaintext = Vec::new();
    CryptoCodec::decrypt_stream(BufReader::new(file), &mut plaintext, password)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password() -> SecretString {
        SecretString::new("file-tests".to_string().into())
    }

    #[test]
    fn test_write_atomic_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bucfg");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(read_plain(&path).unwrap(), b"second");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_write_atomic_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("settings.bucfg");

        write_atomic(&path, b"{}").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_failed_write_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bucfg");
        write_atomic(&path, b"original").unwrap();

        // A directory squatting on the temp path makes File::create fail.
        std::fs::create_dir(temp_path(&path)).unwrap();
        let err = write_atomic(&path, b"replacement").unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));

        assert_eq!(read_plain(&path).unwrap(), b"original");
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bccfg");

        write_encrypted_atomic(&path, b"{\"x\":1}", &password()).unwrap();
        assert_ne!(read_plain(&path).unwrap(), b"{\"x\":1}");
        assert_eq!(read_decrypted(&path, &password()).unwrap(), b"{\"x\":1}");
    }
}

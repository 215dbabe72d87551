//! Backup archives of a store's configuration files.
//!
//! Responsibilities:
//! - Snapshot every file a store owns into a Deflate zip archive.
//! - Enumerate existing archives by decoding their timestamped names.
//! - Restore the most recent archive and prune all archives afterwards.
//!
//! Does NOT handle:
//! - Deciding when backups are taken (see `manager.rs`).
//! - Re-reading restored files into instances (the store reloads itself).
//!
//! Invariants:
//! - Archive names are `base64(created_at)` + `.bkp`, and `created_at` is
//!   strictly increasing across the records of one rotator.
//! - Snapshots and restores hold the store lock, so no save interleaves.
//! - Archives are pruned only after a restore fully succeeded.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::constants::{BACKUP_EXTENSION, BACKUP_TIMESTAMP_FORMAT};
use crate::error::{Result, StoreError};
use crate::persistence::{ConfigurationStore, temp_path, write_atomic};

/// A backup archive known to the rotator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub archive_path: PathBuf,
    /// Local time the archive was taken, at second precision.
    pub created_at: NaiveDateTime,
}

/// Creates, enumerates and restores backup archives for one store.
pub struct BackupRotator {
    store: Arc<ConfigurationStore>,
    directory: PathBuf,
    /// Oldest first.
    records: Mutex<Vec<BackupRecord>>,
}

impl BackupRotator {
    /// Prepares `directory` and loads the archives already in it.
    ///
    /// Archives whose names do not decode to a timestamp are skipped.
    pub fn configure(store: Arc<ConfigurationStore>, directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| StoreError::io(&directory, e))?;

        let records = scan(&directory)?;
        tracing::info!(
            dir = %directory.display(),
            count = records.len(),
            "Configured backup rotator"
        );

        Ok(Self {
            store,
            directory,
            records: Mutex::new(records),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Known archives, oldest first.
    pub fn records(&self) -> Vec<BackupRecord> {
        self.lock_records().clone()
    }

    /// Archives every file the store owns.
    pub fn create_backup(&self) -> Result<BackupRecord> {
        let mut records = self.lock_records();

        let created_at = next_timestamp(records.last().map(|r| r.created_at), now());
        let archive_path = self
            .directory
            .join(format!("{}.{BACKUP_EXTENSION}", archive_name(created_at)));

        let count = self
            .store
            .with_owned_files(|files| write_archive(&archive_path, files))?;

        tracing::info!(
            path = %archive_path.display(),
            files = count,
            "Created configuration backup"
        );

        let record = BackupRecord {
            archive_path,
            created_at,
        };
        records.push(record.clone());
        Ok(record)
    }

    /// Restores the most recent archive into the store's working directory.
    ///
    /// On success every known archive is deleted. A failure part-way through
    /// leaves already-extracted files in place and prunes nothing.
    pub fn restore_latest(&self) -> Result<BackupRecord> {
        let mut records = self.lock_records();
        let latest = records
            .iter()
            .max_by_key(|r| r.created_at)
            .cloned()
            .ok_or(StoreError::NoBackups)?;

        self.store.restore_with(|working_dir| {
            let restored = extract_archive(&latest.archive_path, working_dir)?;
            tracing::info!(
                path = %latest.archive_path.display(),
                files = restored.len(),
                "Restored configuration backup"
            );
            Ok(restored)
        })?;

        for record in records.drain(..) {
            if let Err(e) = fs::remove_file(&record.archive_path) {
                tracing::warn!(
                    path = %record.archive_path.display(),
                    error = %e,
                    "Failed to delete backup archive"
                );
            }
        }
        Ok(latest)
    }

    fn lock_records(&self) -> MutexGuard<'_, Vec<BackupRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Encodes a timestamp as an archive file stem.
pub fn archive_name(created_at: NaiveDateTime) -> String {
    URL_SAFE.encode(created_at.format(BACKUP_TIMESTAMP_FORMAT).to_string())
}

/// Decodes an archive file stem back into its timestamp.
///
/// Both the URL-safe and the standard base64 alphabets are accepted.
pub fn parse_archive_name(stem: &str) -> Option<NaiveDateTime> {
    let bytes = URL_SAFE.decode(stem).or_else(|_| STANDARD.decode(stem)).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    NaiveDateTime::parse_from_str(&text, BACKUP_TIMESTAMP_FORMAT).ok()
}

fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Keeps timestamps strictly increasing at second precision.
fn next_timestamp(latest: Option<NaiveDateTime>, now: NaiveDateTime) -> NaiveDateTime {
    match latest {
        Some(latest) if now <= latest => latest + TimeDelta::seconds(1),
        _ => now,
    }
}

fn scan(directory: &Path) -> Result<Vec<BackupRecord>> {
    let mut records = Vec::new();

    for entry in fs::read_dir(directory).map_err(|e| StoreError::io(directory, e))? {
        let path = entry.map_err(|e| StoreError::io(directory, e))?.path();
        if !path.is_file() || path.extension().and_then(OsStr::to_str) != Some(BACKUP_EXTENSION) {
            continue;
        }

        match path
            .file_stem()
            .and_then(OsStr::to_str)
            .and_then(parse_archive_name)
        {
            Some(created_at) => records.push(BackupRecord {
                archive_path: path,
                created_at,
            }),
            None => tracing::warn!(
                path = %path.display(),
                "Skipping backup archive with an unrecognized name"
            ),
        }
    }

    records.sort_by_key(|r| r.created_at);
    Ok(records)
}

/// Writes `files` into a new archive at `archive_path`, one entry per file
/// named after its base name.
fn write_archive(archive_path: &Path, files: &[PathBuf]) -> Result<usize> {
    let temp = temp_path(archive_path);

    let result: Result<_> = (|| {
        let file = File::create(&temp).map_err(|e| StoreError::io(&temp, e))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options: SimpleFileOptions =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for path in files {
            let Some(entry_name) = path.file_name() else {
                continue;
            };
            let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
            zip.start_file(entry_name.to_string_lossy().into_owned(), options)?;
            zip.write_all(&bytes).map_err(|e| StoreError::io(&temp, e))?;
        }

        let file = zip
            .finish()?
            .into_inner()
            .map_err(|e| StoreError::io(&temp, e.into_error()))?;
        file.sync_all().map_err(|e| StoreError::io(&temp, e))?;
        fs::rename(&temp, archive_path).map_err(|e| StoreError::io(archive_path, e))?;
        Ok(files.len())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Extracts every entry of `archive_path` into `target_dir` by base name,
/// overwriting existing files. Returns the paths written.
fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive_path).map_err(|e| StoreError::io(archive_path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let mut restored = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|path| path.file_name().map(ToOwned::to_owned))
        else {
            tracing::warn!(
                entry = entry.name(),
                archive = %archive_path.display(),
                "Skipping backup entry with an unsafe name"
            );
            continue;
        };

        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| StoreError::io(archive_path, e))?;
        let target = target_dir.join(file_name);
        write_atomic(&target, &bytes)?;
        restored.push(target);
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Registration, StoreSettings};
    use crate::test_util::capture_messages;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Settings {
        test: String,
    }

    fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn setup() -> (TempDir, Arc<ConfigurationStore>, BackupRotator) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(ConfigurationStore::new(dir.path(), StoreSettings::default()).unwrap());
        store
            .implement(Registration::<Settings>::new("settings"))
            .unwrap();
        let rotator = BackupRotator::configure(Arc::clone(&store), dir.path().join("Backups"))
            .unwrap();
        (dir, store, rotator)
    }

    fn set_value(store: &ConfigurationStore, value: &str) {
        store
            .get::<Settings>("settings")
            .unwrap()
            .write()
            .unwrap()
            .test = value.to_string();
        store.save("settings").unwrap();
    }

    fn value(store: &ConfigurationStore) -> String {
        store
            .get::<Settings>("settings")
            .unwrap()
            .read()
            .unwrap()
            .test
            .clone()
    }

    #[test]
    fn test_archive_names_decode_in_both_alphabets() {
        let created_at = at(13, 5, 59);
        let name = archive_name(created_at);
        assert!(!name.contains('/'));
        assert_eq!(parse_archive_name(&name), Some(created_at));

        let standard = STANDARD.encode("09-03-2024 13:05:59");
        assert_eq!(parse_archive_name(&standard), Some(created_at));

        assert_eq!(parse_archive_name("not base64!"), None);
        assert_eq!(parse_archive_name(&URL_SAFE.encode("yesterday")), None);
    }

    #[test]
    fn test_timestamps_are_bumped_past_the_latest_record() {
        let latest = at(10, 0, 0);
        assert_eq!(next_timestamp(None, latest), latest);
        assert_eq!(next_timestamp(Some(latest), latest), at(10, 0, 1));
        assert_eq!(next_timestamp(Some(at(10, 0, 5)), latest), at(10, 0, 6));
        assert_eq!(next_timestamp(Some(latest), at(11, 0, 0)), at(11, 0, 0));
    }

    #[test]
    fn test_create_backup_archives_owned_files_by_base_name() {
        let (_dir, _store, rotator) = setup();

        let record = rotator.create_backup().unwrap();
        assert_eq!(
            record.archive_path.extension().and_then(OsStr::to_str),
            Some("bkp")
        );

        let mut archive = ZipArchive::new(File::open(&record.archive_path).unwrap()).unwrap();
        let names: Vec<_> = archive.file_names().map(str::to_string).collect();
        assert_eq!(names, vec!["settings.bucfg".to_string()]);

        let mut body = String::new();
        archive
            .by_name("settings.bucfg")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert!(body.contains("\"test\""));
    }

    #[test]
    fn test_rapid_backups_get_unique_names() {
        let (_dir, _store, rotator) = setup();

        let first = rotator.create_backup().unwrap();
        let second = rotator.create_backup().unwrap();
        let third = rotator.create_backup().unwrap();

        assert!(first.created_at < second.created_at);
        assert!(second.created_at < third.created_at);
        assert_eq!(rotator.records().len(), 3);
        assert!(first.archive_path.exists() && third.archive_path.exists());
    }

    #[test]
    fn test_configure_skips_unrecognized_archives() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("Backups");
        std::fs::create_dir_all(&backups).unwrap();
        std::fs::write(backups.join("garbage.bkp"), b"").unwrap();
        std::fs::write(backups.join("notes.txt"), b"").unwrap();
        let valid = backups.join(format!("{}.bkp", archive_name(at(8, 0, 0))));
        std::fs::write(&valid, b"").unwrap();

        let store =
            Arc::new(ConfigurationStore::new(dir.path(), StoreSettings::default()).unwrap());
        let mut rotator = None;
        let messages = capture_messages(|| {
            rotator = Some(BackupRotator::configure(store, &backups).unwrap());
        });

        let records = rotator.unwrap().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].archive_path, valid);
        assert!(
            messages
                .iter()
                .any(|m| m.contains("Skipping backup archive with an unrecognized name")),
            "expected a skip warning; got: {messages:?}"
        );
    }

    #[test]
    fn test_restore_picks_most_recent_archive_and_prunes() {
        let (dir, store, rotator) = setup();
        let backups = dir.path().join("Backups");

        // Archives with fixed timestamps, written oldest first.
        let settings_file = dir.path().join("settings.bucfg");
        for (created_at, value) in [(at(9, 0, 0), "older"), (at(21, 0, 0), "newest")] {
            std::fs::write(&settings_file, format!(r#"{{"test":"{value}"}}"#)).unwrap();
            let archive = backups.join(format!("{}.bkp", archive_name(created_at)));
            write_archive(&archive, std::slice::from_ref(&settings_file)).unwrap();
        }
        let rotator = {
            drop(rotator);
            BackupRotator::configure(Arc::clone(&store), &backups).unwrap()
        };
        assert_eq!(rotator.records().len(), 2);

        set_value(&store, "current");
        let restored = rotator.restore_latest().unwrap();

        assert_eq!(restored.created_at, at(21, 0, 0));
        assert_eq!(value(&store), "newest");
        assert!(rotator.records().is_empty());
        assert_eq!(std::fs::read_dir(&backups).unwrap().count(), 0);
        assert!(matches!(rotator.restore_latest(), Err(StoreError::NoBackups)));
    }

    #[test]
    fn test_restore_round_trip_through_create_backup() {
        let (_dir, store, rotator) = setup();
        set_value(&store, "snapshot");
        rotator.create_backup().unwrap();

        set_value(&store, "changed");
        rotator.restore_latest().unwrap();
        assert_eq!(value(&store), "snapshot");
    }

    #[test]
    fn test_failed_restore_prunes_nothing() {
        let (_dir, _store, rotator) = setup();
        let record = rotator.create_backup().unwrap();
        std::fs::write(&record.archive_path, b"not a zip archive").unwrap();

        let err = rotator.restore_latest().unwrap_err();
        assert!(matches!(err, StoreError::Archive(_)));
        assert_eq!(rotator.records(), vec![record.clone()]);
        assert!(record.archive_path.exists());
    }
}

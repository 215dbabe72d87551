//! Centralized constants for the configuration store.
//!
//! File layout, naming conventions and crypto parameters live here so the
//! resolver, the codecs and the backup rotator agree on them.

// =============================================================================
// File Naming
// =============================================================================

/// Extension of plain (unencrypted) configuration files.
pub const PLAIN_EXTENSION: &str = "bucfg";

/// Extension of encrypted configuration files.
pub const ENCRYPTED_EXTENSION: &str = "bccfg";

/// Extension of backup archives.
pub const BACKUP_EXTENSION: &str = "bkp";

/// Suffix appended to a target path while it is being written.
pub const TEMP_SUFFIX: &str = "tmp";

/// Name of the backup directory inside a manager's working directory.
pub const BACKUP_DIR_NAME: &str = "Backups";

/// `chrono` format string used to name backup archives (`dd-MM-yyyy HH:mm:ss`).
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

// =============================================================================
// Binary File Header
// =============================================================================

/// Magic string at the start of every binary-format configuration file.
pub const HEADER_MAGIC: &[u8; 25] = b"cfgConfig-ValidConfigFile";

/// Version marker stored at bytes 26..30 of the header.
pub const HEADER_VERSION: [u8; 4] = [0x02, 0x00, 0x00, 0x00];

/// Total header length: magic, one reserved byte, version marker.
pub const HEADER_LEN: usize = 30;

// =============================================================================
// Crypto Parameters
// =============================================================================

/// Length of the random salt prefixed to every encrypted payload.
pub const SALT_LEN: usize = 32;

/// AES block size, which is also the CBC IV length.
pub const BLOCK_LEN: usize = 16;

/// AES-256 key length.
pub const KEY_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Chunk size for streaming encryption and decryption (1 MiB).
pub const STREAM_CHUNK_SIZE: usize = 1024 * 1024;

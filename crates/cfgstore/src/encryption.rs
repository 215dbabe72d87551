//! Encryption utilities for configuration at rest.
//!
//! Responsibilities:
//! - Provide AES-256-CBC encryption and decryption of buffers, streams and files.
//! - Derive key and IV material from a password using PBKDF2-HMAC-SHA256.
//! - Frame encrypted payloads so they carry their own salt (and IV for buffers).
//!
//! Does NOT handle:
//! - Deciding when a file must be encrypted (see `persistence::migration`).
//! - Where the password comes from (see `manager`).
//!
//! Invariants:
//! - Stream/file framing is `salt (32) || ciphertext`; the IV is derived.
//! - Buffer framing is `salt (32) || iv (16) || ciphertext`; both are random.
//! - Password bytes live in a `PasswordBuffer` that is zeroed as soon as key
//!   derivation returns, whichever way the surrounding call exits.
//! - File outputs go through a `.tmp` sibling and are renamed into place.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::constants::{BLOCK_LEN, KEY_LEN, PBKDF2_ITERATIONS, SALT_LEN, STREAM_CHUNK_SIZE};
use crate::persistence::temp_path;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Errors that can occur during encryption operations.
///
/// A decryption failure does not reliably mean the password was wrong: a bad
/// password and corrupted ciphertext both usually surface as `InvalidPadding`.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("I/O error during crypto operation: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encrypted payload is truncated or misaligned")]
    Truncated,

    #[error("Invalid padding in decrypted payload (wrong password or corrupted data)")]
    InvalidPadding,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Scoped copy of a password's bytes.
///
/// The bytes are overwritten with zeros when the buffer is dropped. Key
/// derivation takes the buffer by value, so it is dropped (and wiped) before
/// the derivation function returns.
pub struct PasswordBuffer {
    bytes: Zeroizing<Vec<u8>>,
}

impl PasswordBuffer {
    /// Copies the password into a fresh zeroize-on-drop buffer.
    pub fn acquire(password: &SecretString) -> Self {
        Self {
            bytes: Zeroizing::new(password.expose_secret().as_bytes().to_vec()),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl ZeroizeOnDrop for PasswordBuffer {}

/// Key and IV derived for the streaming format.
struct StreamKey {
    material: Zeroizing<[u8; KEY_LEN + BLOCK_LEN]>,
}

impl StreamKey {
    fn derive(password: PasswordBuffer, salt: &[u8]) -> Self {
        let mut material = Zeroizing::new([0u8; KEY_LEN + BLOCK_LEN]);
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut material[..]);
        Self { material }
    }

    fn key(&self) -> &[u8] {
        &self.material[..KEY_LEN]
    }

    fn iv(&self) -> &[u8] {
        &self.material[KEY_LEN..]
    }
}

fn derive_buffer_key(password: PasswordBuffer, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key[..]);
    key
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    bytes
}

/// Reads until `buf` is full or the input is exhausted.
fn read_chunk<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Password-based AES-256-CBC codec.
pub struct CryptoCodec;

impl CryptoCodec {
    /// Encrypts `input` into `output`, streaming in bounded chunks.
    ///
    /// A fresh 32-byte salt is written first; key and IV are derived from it.
    pub fn encrypt_stream<R: Read, W: Write>(
        mut input: R,
        mut output: W,
        password: &SecretString,
    ) -> Result<()> {
        let salt: [u8; SALT_LEN] = random_bytes();
        let derived = StreamKey::derive(PasswordBuffer::acquire(password), &salt);
        let mut cipher = Aes256CbcEnc::new(
            GenericArray::from_slice(derived.key()),
            GenericArray::from_slice(derived.iv()),
        );

        output.write_all(&salt)?;

        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        let mut pending: Vec<u8> = Vec::with_capacity(STREAM_CHUNK_SIZE + BLOCK_LEN);
        loop {
            let read = read_chunk(&mut input, &mut chunk)?;
            if read == 0 {
                break;
            }
            pending.extend_from_slice(&chunk[..read]);

            let ready = pending.len() - pending.len() % BLOCK_LEN;
            for block in pending[..ready].chunks_exact_mut(BLOCK_LEN) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            output.write_all(&pending[..ready])?;
            pending.drain(..ready);
        }

        // Fewer than one block remains; PKCS#7 always emits exactly one more block.
        let tail_len = pending.len();
        pending.resize(BLOCK_LEN, 0);
        let last = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut pending, tail_len)
            .map_err(|_| CryptoError::InvalidPadding)?;
        output.write_all(last)?;
        output.flush()?;
        Ok(())
    }

    /// Decrypts a stream produced by [`CryptoCodec::encrypt_stream`].
    pub fn decrypt_stream<R: Read, W: Write>(
        mut input: R,
        mut output: W,
        password: &SecretString,
    ) -> Result<()> {
        let mut salt = [0u8; SALT_LEN];
        input.read_exact(&mut salt).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                CryptoError::Truncated
            } else {
                CryptoError::Io(e)
            }
        })?;
        let derived = StreamKey::derive(PasswordBuffer::acquire(password), &salt);
        let mut cipher = Aes256CbcDec::new(
            GenericArray::from_slice(derived.key()),
            GenericArray::from_slice(derived.iv()),
        );

        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        let mut pending: Vec<u8> = Vec::with_capacity(STREAM_CHUNK_SIZE + BLOCK_LEN);
        loop {
            let read = read_chunk(&mut input, &mut chunk)?;
            if read == 0 {
                break;
            }
            pending.extend_from_slice(&chunk[..read]);

            // Hold back the final block: it carries the padding.
            let keep = match pending.len() % BLOCK_LEN {
                0 => BLOCK_LEN.min(pending.len()),
                rem => rem,
            };
            let ready = pending.len() - keep;
            for block in pending[..ready].chunks_exact_mut(BLOCK_LEN) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            output.write_all(&pending[..ready])?;
            pending.drain(..ready);
        }

        if pending.len() != BLOCK_LEN {
            return Err(CryptoError::Truncated);
        }
        let last = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut pending)
            .map_err(|_| CryptoError::InvalidPadding)?;
        output.write_all(last)?;
        output.flush()?;
        Ok(())
    }

    /// Encrypts a short in-memory payload as `salt || iv || ciphertext`.
    pub fn encrypt_buffer(plaintext: &[u8], password: &SecretString) -> Vec<u8> {
        let salt: [u8; SALT_LEN] = random_bytes();
        let iv: [u8; BLOCK_LEN] = random_bytes();
        let key = derive_buffer_key(PasswordBuffer::acquire(password), &salt);

        let ciphertext = Aes256CbcEnc::new(
            GenericArray::from_slice(&key[..]),
            GenericArray::from_slice(&iv),
        )
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut framed = Vec::with_capacity(SALT_LEN + BLOCK_LEN + ciphertext.len());
        framed.extend_from_slice(&salt);
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        framed
    }

    /// Decrypts a payload produced by [`CryptoCodec::encrypt_buffer`].
    pub fn decrypt_buffer(framed: &[u8], password: &SecretString) -> Result<Vec<u8>> {
        let header_len = SALT_LEN + BLOCK_LEN;
        if framed.len() < header_len + BLOCK_LEN || (framed.len() - header_len) % BLOCK_LEN != 0
        {
            return Err(CryptoError::Truncated);
        }
        let (salt, rest) = framed.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(BLOCK_LEN);
        let key = derive_buffer_key(PasswordBuffer::acquire(password), salt);

        Aes256CbcDec::new(
            GenericArray::from_slice(&key[..]),
            GenericArray::from_slice(iv),
        )
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::InvalidPadding)
    }

    /// Encrypts the file at `input` into `output`.
    ///
    /// `output` is replaced only once the whole ciphertext is on disk.
    pub fn encrypt_file(input: &Path, output: &Path, password: &SecretString) -> Result<()> {
        let reader = BufReader::new(File::open(input)?);
        write_through_temp(output, |writer| Self::encrypt_stream(reader, writer, password))
    }

    /// Decrypts the file at `input` into `output`.
    ///
    /// On a wrong password or a truncated input `output` is left untouched.
    pub fn decrypt_file(input: &Path, output: &Path, password: &SecretString) -> Result<()> {
        let reader = BufReader::new(File::open(input)?);
        write_through_temp(output, |writer| Self::decrypt_stream(reader, writer, password))
    }
}

fn write_through_temp(
    output: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
) -> Result<()> {
    let temp = temp_path(output);
    let result: Result<()> = (|| {
        let mut writer = BufWriter::new(File::create(&temp)?);
        write(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&temp, output)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

//! Directory-backed example store and the reproducible blob codec
//!
//! "A cache you never invalidate": a corrupted or unreadable entry simply
//! fails to reproduce the original failure (classifying as `VALID` or
//! `OVERRUN`) and the engine discards it — it can never cause a test to pass
//! or fail *incorrectly*. The directory layout below is bit-exact, matching
//! what another implementation of this same store would produce on disk.

#![forbid(unsafe_code)]

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;

use crate::error::DatabaseError;

/// Default root, relative to the working directory, when neither
/// `EngineConfig::database_path` nor `HYPOTHESIS_DATABASE_FILE` is set.
pub const DEFAULT_ROOT: &str = ".hypothesis/examples";

const BLOB_VERSION: u8 = 1;

/// A keyed store of failing buffers persisting across runs.
///
/// Subdirectories are named by a 32-character hex prefix of `SHA-1(test_key)`;
/// entries within a subdirectory are named by a 40-character hex `SHA-1` of
/// their own bytes, stored raw with no header or framing.
pub struct Database {
    root: PathBuf,
}

impl Database {
    /// `root` takes precedence over the `HYPOTHESIS_DATABASE_FILE`
    /// environment override, which takes precedence over [`DEFAULT_ROOT`].
    pub fn new(root: Option<PathBuf>) -> Self {
        let root = root
            .or_else(|| std::env::var_os("HYPOTHESIS_DATABASE_FILE").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        Self { root }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn key_dir(&self, test_key: &str) -> PathBuf {
        self.root.join(hex_digest(test_key.as_bytes(), 32))
    }

    fn entry_path(&self, test_key: &str, buffer: &[u8]) -> PathBuf {
        self.key_dir(test_key).join(hex_digest(buffer, 40))
    }

    /// List every entry under `test_key`. A missing subdirectory yields no
    /// entries rather than an error; an unreadable file within it is skipped
    /// rather than failing the whole fetch, since a partially-written file
    /// left by a crashed concurrent writer must be tolerated, not surfaced.
    pub fn fetch(&self, test_key: &str) -> Result<Vec<Vec<u8>>, DatabaseError> {
        let dir = self.key_dir(test_key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(DatabaseError::Io { path: dir, source }),
        };
        let mut out = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            if let Ok(bytes) = fs::read(entry.path()) {
                out.push(bytes);
            }
        }
        Ok(out)
    }

    /// Write `buffer` atomically: a tempfile in the same directory, then a
    /// rename, so a concurrent reader never observes a partial write.
    pub fn save(&self, test_key: &str, buffer: &[u8]) -> Result<(), DatabaseError> {
        let dir = self.key_dir(test_key);
        fs::create_dir_all(&dir).map_err(|source| DatabaseError::Io { path: dir.clone(), source })?;
        let dest = self.entry_path(test_key, buffer);
        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|source| DatabaseError::Io { path: dir.clone(), source })?;
        tmp.write_all(buffer).map_err(|source| DatabaseError::Io { path: dest.clone(), source })?;
        tmp.persist(&dest).map_err(|e| DatabaseError::Io { path: dest, source: e.error })?;
        Ok(())
    }

    /// Remove one entry. An already-absent file is not an error.
    pub fn delete(&self, test_key: &str, buffer: &[u8]) -> Result<(), DatabaseError> {
        let path = self.entry_path(test_key, buffer);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DatabaseError::Io { path, source }),
        }
    }

    /// Convenience for renaming a test: save under `dst_key`, then delete
    /// from `src_key`.
    pub fn move_entry(&self, src_key: &str, dst_key: &str, buffer: &[u8]) -> Result<(), DatabaseError> {
        self.save(dst_key, buffer)?;
        self.delete(src_key, buffer)
    }
}

fn hex_digest(bytes: &[u8], hex_len: usize) -> String {
    let digest = Sha1::digest(bytes);
    hex::encode(digest)[..hex_len].to_string()
}

/// Encode a buffer as a self-describing, shareable string: `base64(zlib(
/// VERSION || LENGTH || BYTES))`.
pub fn encode_reproducible_blob(buffer: &[u8]) -> String {
    let mut framed = Vec::with_capacity(buffer.len() + 5);
    framed.push(BLOB_VERSION);
    framed.extend_from_slice(&(buffer.len() as u32).to_be_bytes());
    framed.extend_from_slice(buffer);

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&framed).expect("writing to an in-memory Vec cannot fail");
    let compressed = encoder.finish().expect("zlib finish on an in-memory Vec cannot fail");

    base64::engine::general_purpose::STANDARD.encode(compressed)
}

/// Decode a reproducible blob back into its buffer bytes. A version mismatch
/// is its own error rather than a malformed-data error, since the blob may be
/// perfectly well-formed under a schema this build doesn't speak.
pub fn decode_reproducible_blob(blob: &str) -> Result<Vec<u8>, DatabaseError> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|e| DatabaseError::BlobMalformed(e.to_string()))?;

    let mut framed = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut framed)
        .map_err(|e| DatabaseError::BlobMalformed(e.to_string()))?;

    if framed.len() < 5 {
        return Err(DatabaseError::BlobMalformed("blob shorter than the fixed header".into()));
    }
    let version = framed[0];
    if version != BLOB_VERSION {
        return Err(DatabaseError::BlobVersionMismatch { expected: BLOB_VERSION, found: version });
    }
    let length = u32::from_be_bytes(framed[1..5].try_into().unwrap()) as usize;
    let bytes = &framed[5..];
    if bytes.len() != length {
        return Err(DatabaseError::BlobMalformed(format!(
            "length field says {length} bytes, frame carries {}",
            bytes.len()
        )));
    }
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_fetch_round_trips() {
        let dir = tempdir().unwrap();
        let db = Database::new(Some(dir.path().to_path_buf()));
        db.save("my-test", &[1, 2, 3]).unwrap();
        assert_eq!(db.fetch("my-test").unwrap(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn delete_removes_the_entry() {
        let dir = tempdir().unwrap();
        let db = Database::new(Some(dir.path().to_path_buf()));
        db.save("my-test", &[9, 9]).unwrap();
        db.delete("my-test", &[9, 9]).unwrap();
        assert!(db.fetch("my-test").unwrap().is_empty());
    }

    #[test]
    fn delete_of_absent_entry_is_not_an_error() {
        let dir = tempdir().unwrap();
        let db = Database::new(Some(dir.path().to_path_buf()));
        assert!(db.delete("nope", &[1]).is_ok());
    }

    #[test]
    fn fetch_of_missing_test_key_is_empty() {
        let dir = tempdir().unwrap();
        let db = Database::new(Some(dir.path().to_path_buf()));
        assert!(db.fetch("never-seen").unwrap().is_empty());
    }

    #[test]
    fn directory_layout_matches_the_bit_exact_spec() {
        let dir = tempdir().unwrap();
        let db = Database::new(Some(dir.path().to_path_buf()));
        db.save("my-test", &[5, 6, 7]).unwrap();
        let sub = hex_digest(b"my-test", 32);
        let file_name = hex_digest(&[5, 6, 7], 40);
        assert_eq!(sub.len(), 32);
        assert_eq!(file_name.len(), 40);
        let path = dir.path().join(sub).join(file_name);
        assert_eq!(fs::read(path).unwrap(), vec![5, 6, 7]);
    }

    #[test]
    fn move_entry_relocates_between_test_keys() {
        let dir = tempdir().unwrap();
        let db = Database::new(Some(dir.path().to_path_buf()));
        db.save("old-key", &[1, 2]).unwrap();
        db.move_entry("old-key", "new-key", &[1, 2]).unwrap();
        assert!(db.fetch("old-key").unwrap().is_empty());
        assert_eq!(db.fetch("new-key").unwrap(), vec![vec![1, 2]]);
    }

    #[test]
    fn reproducible_blob_round_trips() {
        let buf = vec![10u8, 20, 30, 255, 0, 0, 128];
        let blob = encode_reproducible_blob(&buf);
        assert_eq!(decode_reproducible_blob(&blob).unwrap(), buf);
    }

    #[test]
    fn reproducible_blob_rejects_version_mismatch() {
        let buf = vec![1u8, 2, 3];
        let mut framed = vec![7u8]; // schema version this build doesn't speak
        framed.extend_from_slice(&(buf.len() as u32).to_be_bytes());
        framed.extend_from_slice(&buf);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&framed).unwrap();
        let compressed = encoder.finish().unwrap();
        let blob = base64::engine::general_purpose::STANDARD.encode(compressed);

        let err = decode_reproducible_blob(&blob).unwrap_err();
        assert!(matches!(err, DatabaseError::BlobVersionMismatch { found: 7, .. }));
    }
}

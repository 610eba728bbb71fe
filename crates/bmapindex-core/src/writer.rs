//! Block writer — appends documents to per-height NDJSON files and seals them.
//!
//! A block file is `<data_dir>/<height>.json`. While writable it belongs to
//! the crawler; [`BlockWriter::finalize`] removes every write bit, which hands
//! the file to the ingestion side. A read-only file is never appended to.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::document::SanitizedDocument;
use crate::error::IndexerError;

/// Result of sealing a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The file was marked read-only and is ready for ingestion.
    Sealed(PathBuf),
    /// No file exists for this height (zero transactions written).
    Empty,
}

/// Serializes appends to block files under one lock so every line lands
/// whole, even with concurrent callers.
pub struct BlockWriter {
    data_dir: PathBuf,
    lock: Mutex<()>,
}

impl BlockWriter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the file for `height`.
    pub fn block_path(&self, height: u32) -> PathBuf {
        block_path(&self.data_dir, height)
    }

    /// Append one document as a line to the block's file.
    ///
    /// Fails with [`IndexerError::BlockFinalized`] if the file was already
    /// sealed.
    pub fn append(&self, height: u32, doc: &SanitizedDocument) -> Result<(), IndexerError> {
        let mut line = doc
            .to_line()
            .map_err(|e| IndexerError::Other(format!("serialize {}: {e}", doc.id)))?;
        line.push('\n');

        let path = self.block_path(height);
        let _guard = self.lock.lock();

        fs::create_dir_all(&self.data_dir).map_err(|e| IndexerError::fs(&self.data_dir, e))?;
        match fs::metadata(&path) {
            Ok(meta) if is_read_only(&meta) => {
                return Err(IndexerError::BlockFinalized { height });
            }
            _ => {}
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| IndexerError::fs(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| IndexerError::fs(&path, e))?;

        debug!(height, id = %doc.id, "document appended");
        Ok(())
    }

    /// Seal the block's file by removing all write permission.
    pub fn finalize(&self, height: u32) -> Result<FinalizeOutcome, IndexerError> {
        let path = self.block_path(height);
        let _guard = self.lock.lock();

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FinalizeOutcome::Empty);
            }
            Err(e) => return Err(IndexerError::fs(&path, e)),
        };
        let mut perms = meta.permissions();
        clear_write_bits(&mut perms);
        fs::set_permissions(&path, perms).map_err(|e| IndexerError::fs(&path, e))?;
        Ok(FinalizeOutcome::Sealed(path))
    }

    /// Remove the unsealed file of an abandoned block. Sealed files are left
    /// for ingestion. Returns `true` if a file was removed.
    pub fn discard(&self, height: u32) -> Result<bool, IndexerError> {
        let path = self.block_path(height);
        let _guard = self.lock.lock();

        match fs::metadata(&path) {
            Ok(meta) if is_read_only(&meta) => Ok(false),
            Ok(_) => {
                fs::remove_file(&path).map_err(|e| IndexerError::fs(&path, e))?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(IndexerError::fs(&path, e)),
        }
    }
}

/// `<data_dir>/<height>.json`
pub fn block_path(data_dir: &Path, height: u32) -> PathBuf {
    data_dir.join(format!("{height}.json"))
}

/// Height encoded in a block file name, if `path` names one.
pub fn block_height(path: &Path) -> Option<u32> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// A file with no write bit set (for anyone) is sealed.
#[cfg(unix)]
pub fn is_read_only(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o222 == 0
}

#[cfg(not(unix))]
pub fn is_read_only(meta: &fs::Metadata) -> bool {
    meta.permissions().readonly()
}

#[cfg(unix)]
fn clear_write_bits(perms: &mut fs::Permissions) {
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(perms.mode() & !0o222);
}

#[cfg(not(unix))]
fn clear_write_bits(perms: &mut fs::Permissions) {
    perms.set_readonly(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::TxCore;
    use crate::document::BlockRef;
    use std::sync::Arc;

    fn doc(id: &str, height: u32) -> SanitizedDocument {
        SanitizedDocument {
            id: id.into(),
            collection: "post".into(),
            tx: TxCore { h: id.into() },
            blk: BlockRef { i: height, t: 0 },
            timestamp: 0,
            inputs: vec![],
            outputs: vec![],
            overlays: Default::default(),
        }
    }

    #[test]
    fn append_then_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BlockWriter::new(dir.path().join("data"));

        writer.append(574287, &doc("a", 574287)).unwrap();
        writer.append(574287, &doc("b", 574287)).unwrap();

        let path = writer.block_path(574287);
        let body = fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.ends_with('\n'));

        assert_eq!(
            writer.finalize(574287).unwrap(),
            FinalizeOutcome::Sealed(path.clone())
        );
        assert!(is_read_only(&fs::metadata(&path).unwrap()));
    }

    #[test]
    fn sealed_file_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BlockWriter::new(dir.path());
        writer.append(9, &doc("a", 9)).unwrap();
        writer.finalize(9).unwrap();

        let err = writer.append(9, &doc("b", 9)).unwrap_err();
        assert!(matches!(err, IndexerError::BlockFinalized { height: 9 }));
        let body = fs::read_to_string(writer.block_path(9)).unwrap();
        assert_eq!(body.lines().count(), 1);
    }

    #[test]
    fn finalize_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BlockWriter::new(dir.path());
        assert_eq!(writer.finalize(12).unwrap(), FinalizeOutcome::Empty);
        assert!(!writer.block_path(12).exists());
    }

    #[test]
    fn discard_removes_only_unsealed_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BlockWriter::new(dir.path());
        writer.append(3, &doc("a", 3)).unwrap();
        writer.append(4, &doc("b", 4)).unwrap();
        writer.finalize(4).unwrap();

        assert!(writer.discard(3).unwrap());
        assert!(!writer.block_path(3).exists());
        assert!(!writer.discard(4).unwrap());
        assert!(writer.block_path(4).exists());
        assert!(!writer.discard(5).unwrap());
    }

    #[test]
    fn concurrent_appends_keep_lines_whole() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(BlockWriter::new(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        writer.append(1, &doc(&format!("{t}-{i}"), 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let body = fs::read_to_string(writer.block_path(1)).unwrap();
        assert_eq!(body.lines().count(), 400);
        for line in body.lines() {
            serde_json::from_str::<SanitizedDocument>(line).unwrap();
        }
    }

    #[test]
    fn parses_block_heights() {
        assert_eq!(block_height(Path::new("data/574287.json")), Some(574287));
        assert_eq!(block_height(Path::new("data/574287.tmp")), None);
        assert_eq!(block_height(Path::new("data/notes.json")), None);
    }
}

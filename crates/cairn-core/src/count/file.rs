//! On-disk count database: a binary digest -> count table.
//!
//! Layout: a 4-byte magic, then one record per entry in ascending digest
//! order: a 1-byte digest length, the digest bytes, and the count as a
//! little-endian i64. Strictly increasing digests are enforced on read, so
//! a truncated or shuffled file is rejected rather than silently merged.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use cairn_types::{Digest, DIGEST_BASE_LEN, DIGEST_MAX_LEN};

use crate::count::CountMap;
use crate::error::{CairnError, Result};

const MAGIC: [u8; 4] = *b"CPc1";

fn corrupt(path: &Path, reason: impl Into<String>) -> CairnError {
    CairnError::CorruptCountFile {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

impl CountMap {
    /// Read a count database. Missing files are an `Io` error; callers
    /// stat-guard paths that may legitimately be absent.
    pub fn read(path: &Path) -> Result<CountMap> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| corrupt(path, "short magic"))?;
        if magic != MAGIC {
            return Err(corrupt(path, "bad magic"));
        }

        let mut map = CountMap::new();
        let mut prev: Option<Digest> = None;
        loop {
            let mut len_byte = [0u8; 1];
            match reader.read_exact(&mut len_byte) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = len_byte[0] as usize;
            if !(DIGEST_BASE_LEN..=DIGEST_MAX_LEN).contains(&len) {
                return Err(corrupt(path, format!("bad digest length {len}")));
            }
            let mut digest_bytes = vec![0u8; len];
            reader
                .read_exact(&mut digest_bytes)
                .map_err(|_| corrupt(path, "truncated digest"))?;
            let mut count_bytes = [0u8; 8];
            reader
                .read_exact(&mut count_bytes)
                .map_err(|_| corrupt(path, "truncated count"))?;

            let digest = Digest::from_bytes(&digest_bytes);
            if let Some(ref p) = prev {
                if *p >= digest {
                    return Err(corrupt(path, "digests out of order"));
                }
            }
            map.set(&digest, i64::from_le_bytes(count_bytes));
            prev = Some(digest);
        }
        Ok(map)
    }

    /// Write the table to `path`, creating or truncating it in place.
    pub fn write(&self, path: &Path) -> Result<()> {
        let write_failed = |source: std::io::Error| CairnError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };

        let file = File::create(path).map_err(write_failed)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&MAGIC).map_err(write_failed)?;
        for (digest, count) in self.iter() {
            writer
                .write_all(&[digest.len() as u8])
                .map_err(write_failed)?;
            writer.write_all(digest.as_bytes()).map_err(write_failed)?;
            writer
                .write_all(&count.to_le_bytes())
                .map_err(write_failed)?;
        }
        writer.flush().map_err(write_failed)?;
        Ok(())
    }

    /// Atomically replace `path`: write to `<path>.<pid>`, then rename over.
    pub fn write_replace(&self, path: &Path) -> Result<()> {
        let staged = staging_path(path);
        self.write(&staged)?;
        if let Err(source) = std::fs::rename(&staged, path) {
            let _ = std::fs::remove_file(&staged);
            return Err(CairnError::RenameFailed {
                from: staged,
                to: path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}", std::process::id()));
    path.with_file_name(name)
}

/// True if `name` looks like an orphaned staging file for `base` (left by a
/// crashed writer): `<base>.<digits>`.
pub fn is_stale_staging(name: &str, base: &str) -> bool {
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
}

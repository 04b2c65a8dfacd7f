//! Backup tree walking for host rebuilds.
//!
//! A rebuild re-derives a host's reference counts from its surviving
//! backups instead of trusting the incremental state. The walk itself is a
//! seam: the reconciler only needs something that emits
//! `(digest, delta, class)` per referenced pool object.

use std::path::{Path, PathBuf};

use cairn_types::Digest;

use crate::count::CountMap;
use crate::error::Result;
use crate::pool::CompressClass;

/// Emits the pool references of one backup.
pub trait BackupWalker {
    fn walk_backup(
        &self,
        backup_dir: &Path,
        emit: &mut dyn FnMut(&Digest, i64, CompressClass) -> Result<()>,
    ) -> Result<()>;
}

/// List a host's backups that carry their own reference counts, in backup
/// number order. Backups without a `refCnt` subdirectory predate per-backup
/// counting and take no part in rebuilds.
pub fn countable_backups(host_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut backups: Vec<(u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(host_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok(num) = name.parse::<u64>() else {
            continue;
        };
        if entry.path().join("refCnt").is_dir() {
            backups.push((num, entry.path()));
        }
    }
    backups.sort();
    Ok(backups.into_iter().map(|(_, p)| p).collect())
}

/// The production walker: reads the per-backup count databases written at
/// dump time under `<backup>/refCnt/` and re-emits their entries.
#[derive(Debug, Default)]
pub struct BackupRefScanner;

impl BackupWalker for BackupRefScanner {
    fn walk_backup(
        &self,
        backup_dir: &Path,
        emit: &mut dyn FnMut(&Digest, i64, CompressClass) -> Result<()>,
    ) -> Result<()> {
        let refcnt = backup_dir.join("refCnt");
        let mut files: Vec<(PathBuf, CompressClass)> = Vec::new();
        for entry in std::fs::read_dir(&refcnt)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(class) = parse_count_name(name) {
                files.push((entry.path(), class));
            }
        }
        files.sort();

        for (path, class) in files {
            let map = CountMap::read(&path)?;
            for (digest, count) in map.iter() {
                if count <= 0 {
                    continue;
                }
                emit(digest, count, class)?;
            }
        }
        Ok(())
    }
}

/// Parse `poolCnt.<c>.<ss>` into its compression class.
fn parse_count_name(name: &str) -> Option<CompressClass> {
    let rest = name.strip_prefix("poolCnt.")?;
    let mut chars = rest.chars();
    let class = CompressClass::from_tag(chars.next()?)?;
    match chars.next() {
        Some('.') => Some(class),
        _ => None,
    }
}
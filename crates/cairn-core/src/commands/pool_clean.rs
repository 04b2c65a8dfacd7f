//! Pool reclamation: a two-phase mark/sweep over objects whose
//! authoritative count is zero.
//!
//! The first pass that sees an unreferenced object only marks it (mode
//! `0445`); reclamation happens on a later pass if the count is still
//! zero, giving concurrent backups one full cycle to re-reference it.
//! The shard lock serializes that decision against backups.

use std::fs::{OpenOptions, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use cairn_types::Digest;

use crate::context::MaintenanceContext;
use crate::count::CountMap;
use crate::error::{CairnError, Result};
use crate::lock;
use crate::pool::{self, shard_dir, CompressClass, MODE_CHAIN_HOLE, MODE_MARKED};
use crate::stats::PoolShardStats;

/// Mark or sweep every zero-count object of one shard, adjusting the
/// shard's stats for what was reclaimed.
pub fn clean_shard(
    ctx: &mut MaintenanceContext<'_>,
    class: CompressClass,
    shard: u8,
    shard_stats: &mut PoolShardStats,
) {
    let pool_root = ctx.config.pool_root(class);
    let top_dir = shard_dir(&pool_root, shard);
    let cnt_path = top_dir.join("poolCnt");
    if !cnt_path.is_file() {
        return;
    }

    // Excludes backups racing us on the mark/sweep decision.
    let _lock = match lock::acquire(&top_dir.join("LOCK")) {
        Ok(guard) => guard,
        Err(e) => {
            ctx.record(e);
            return;
        }
    };

    let mut counts = match CountMap::read(&cnt_path) {
        Ok(m) => m,
        Err(e) => {
            ctx.record(e);
            return;
        }
    };

    let mut removed: Vec<Digest> = Vec::new();
    for (digest, count) in counts.iter() {
        if count != 0 {
            continue;
        }
        let path = digest.path_in(&pool_root);
        let Ok(md) = std::fs::metadata(&path) else {
            continue;
        };
        if md.len() == 0 {
            continue;
        }

        if pool::is_marked(md.mode()) {
            // Marked on an earlier pass and still unreferenced: reclaim.
            let next = digest.with_ext(digest.ext() + 1);
            if next.path_in(&pool_root).exists() {
                // A later chain slot exists; a hole would end lookup scans
                // early. Keep a zero-length placeholder instead.
                if let Err(e) = hollow_object(&path) {
                    ctx.record(e);
                    continue;
                }
            } else if let Err(e) = std::fs::remove_file(&path) {
                ctx.record(CairnError::UnlinkFailed {
                    path: path.clone(),
                    source: e,
                });
                continue;
            }
            removed.push(digest.clone());
            let blocks = pool::object_blocks(&md);
            shard_stats.file_cnt -= 1;
            shard_stats.blk_cnt -= blocks;
            shard_stats.file_cnt_rm += 1;
            shard_stats.blk_cnt_rm += blocks;
        } else if let Err(e) =
            std::fs::set_permissions(&path, Permissions::from_mode(MODE_MARKED))
        {
            ctx.record(CairnError::ChmodFailed { path, source: e });
        }
    }

    if !removed.is_empty() {
        for digest in &removed {
            counts.delete(digest);
        }
        if let Err(e) = counts.write_replace(&cnt_path) {
            ctx.record(e);
        }
    }
}

/// Truncate a chained object to zero bytes, leaving a placeholder the
/// lookup scan steps over (`st_size == 0` distinguishes it from a live
/// object).
fn hollow_object(path: &Path) -> Result<()> {
    std::fs::set_permissions(path, Permissions::from_mode(MODE_CHAIN_HOLE)).map_err(|e| {
        CairnError::ChmodFailed {
            path: path.to_path_buf(),
            source: e,
        }
    })?;
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| CairnError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(())
}

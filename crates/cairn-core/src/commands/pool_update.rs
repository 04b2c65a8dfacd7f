//! Pool aggregation: sum every host's shard databases into the
//! authoritative per-shard pool count, reconcile it against the objects
//! actually on disk, and publish it atomically.
//!
//! The aggregator takes no lock. Host databases are consistent once the
//! host passes finished, and the two-phase delete mark keeps races with
//! concurrent backups benign: a reference that arrives late is picked up
//! next pass, and a marked object is never reclaimed in the pass that
//! marked it.

use std::fs::Permissions;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use cairn_types::Digest;

use crate::context::MaintenanceContext;
use crate::count::file::is_stale_staging;
use crate::count::CountMap;
use crate::error::CairnError;
use crate::pool::{
    self, count_file_name, shard_dir, CompressClass, PoolEntry, MODE_LIVE, SHARD_COUNT,
};
use crate::stats::{self, PoolShardStats};

use super::pool_clean;

/// Authoritative per-shard pool database file name.
const POOL_COUNT_FILE: &str = "poolCnt";

#[derive(Debug, Clone)]
pub struct PoolUpdateOptions {
    /// Inclusive top-shard range to process.
    pub shard_start: u8,
    pub shard_end: u8,
    /// Full-scan phase selector (0-15).
    pub phase: u32,
    /// Reclaim unreferenced objects after counting.
    pub clean: bool,
    /// Emit one accounting record per shard.
    pub emit_stats: bool,
}

impl Default for PoolUpdateOptions {
    fn default() -> Self {
        PoolUpdateOptions {
            shard_start: 0,
            shard_end: SHARD_COUNT - 1,
            phase: 0,
            clean: false,
            emit_stats: false,
        }
    }
}

/// Whole-pass totals across both pools and the shard range.
#[derive(Debug, Default)]
pub struct PoolPassTotals {
    pub file_cnt: i64,
    pub blk_cnt: i64,
    pub file_cnt_rm: i64,
    pub blk_cnt_rm: i64,
    pub file_link_total: i64,
}

/// Aggregate (and optionally clean) every shard in the range, for both
/// pools. The caller must not invoke this when a preceding host pass
/// reported errors: summing inconsistent host databases is worse than
/// skipping a night.
pub fn run(
    ctx: &mut MaintenanceContext<'_>,
    hosts: &[String],
    opts: &PoolUpdateOptions,
) -> PoolPassTotals {
    let mut totals = PoolPassTotals::default();
    let total = (opts.shard_end - opts.shard_start) as usize + 1;
    for class in CompressClass::ALL {
        ctx.progress.state(&format!("{} count", class.pool_name()));
        for (i, shard) in (opts.shard_start..=opts.shard_end).enumerate() {
            ctx.progress.file_count(i + 1, total);
            let mut shard_stats = PoolShardStats::default();
            aggregate_shard(ctx, hosts, class, shard, opts.phase, &mut shard_stats);
            if opts.clean {
                pool_clean::clean_shard(ctx, class, shard, &mut shard_stats);
            }
            if opts.emit_stats {
                stats::emit(class, shard, &shard_stats);
            }
            totals.file_cnt += shard_stats.file_cnt;
            totals.blk_cnt += shard_stats.blk_cnt;
            totals.file_cnt_rm += shard_stats.file_cnt_rm;
            totals.blk_cnt_rm += shard_stats.blk_cnt_rm;
            totals.file_link_total += shard_stats.file_link_total;
        }
    }
    totals
}

/// Rebuild one shard's authoritative count from the host databases and the
/// filesystem.
pub fn aggregate_shard(
    ctx: &mut MaintenanceContext<'_>,
    hosts: &[String],
    class: CompressClass,
    shard: u8,
    phase: u32,
    shard_stats: &mut PoolShardStats,
) {
    let pool_root = ctx.config.pool_root(class);
    let top_dir = shard_dir(&pool_root, shard);
    let top_byte = shard << 1;
    let cnt_path = top_dir.join(POOL_COUNT_FILE);

    // Directory census; also drop any staging file a crashed pass orphaned.
    let mut sub_bytes: Vec<u8> = Vec::new();
    if top_dir.is_dir() {
        shard_stats.dir_cnt += 1;
        match std::fs::read_dir(&top_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if is_stale_staging(name, POOL_COUNT_FILE) {
                        let _ = std::fs::remove_file(entry.path());
                        continue;
                    }
                    if let Some(sub) = parse_sub_dir_name(name) {
                        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                            shard_stats.dir_cnt += 1;
                            sub_bytes.push(sub);
                        }
                    }
                }
            }
            Err(e) => ctx.record(e.into()),
        }
        sub_bytes.sort_unstable();
    }

    let mut c_curr = if cnt_path.is_file() {
        match CountMap::read(&cnt_path) {
            Ok(m) => m,
            Err(e) => {
                ctx.record(e);
                CountMap::new()
            }
        }
    } else {
        CountMap::new()
    };

    // Sum host contributions. `c_copy` tracks which summed digests were
    // seen on disk; `c_curr` is updated as we go so "new digest" triggers
    // once across hosts.
    let mut c_new = CountMap::new();
    let mut c_copy = CountMap::new();
    for host in hosts {
        let host_path = ctx
            .config
            .host_dir(host)
            .join("refCnt")
            .join(count_file_name(POOL_COUNT_FILE, class, shard));
        if !host_path.is_file() {
            continue;
        }
        let host_map = match CountMap::read(&host_path) {
            Ok(m) => m,
            Err(e) => {
                ctx.record(e);
                continue;
            }
        };
        for (digest, count) in host_map.iter() {
            let path = digest.path_in(&pool_root);
            match c_curr.get(digest) {
                None => {
                    if let Ok(md) = std::fs::metadata(&path) {
                        shard_stats.blk_cnt += pool::object_blocks(&md);
                        if count > 0 {
                            clear_delete_mark(ctx, md.mode(), &path);
                        }
                    }
                }
                Some(0) if count > 0 => {
                    // Re-referenced before the sweep: lift the mark.
                    if let Ok(md) = std::fs::metadata(&path) {
                        clear_delete_mark(ctx, md.mode(), &path);
                    }
                }
                Some(_) => {}
            }
            c_new.incr(digest, count);
            c_copy.incr(digest, count);
            c_curr.incr(digest, count);
        }
    }

    // Objects counted last pass but referenced by no host now keep a zero
    // entry: the file still exists and the cleaner needs to know.
    for digest in c_curr.digests() {
        if !c_new.contains(&digest) {
            c_new.set(&digest, 0);
            c_copy.set(&digest, 0);
        }
    }

    reconcile_filesystem(
        ctx,
        &top_dir,
        top_byte,
        &sub_bytes,
        &mut c_new,
        &mut c_copy,
        shard_stats,
    );

    // Periodically re-measure the whole shard instead of trusting the
    // incremental block deltas.
    let period = ctx.config.pool_size_nightly_update_period;
    let full_scan = period > 0 && ((shard as u32) / 8) % period == phase % period;
    if full_scan {
        let mut blocks = 0i64;
        for (digest, _) in c_new.iter() {
            if let Ok(md) = std::fs::metadata(digest.path_in(&pool_root)) {
                blocks += pool::object_blocks(&md);
            }
        }
        shard_stats.blk_cnt = blocks;
    }

    for (digest, count) in c_new.iter() {
        shard_stats.file_cnt += 1;
        shard_stats.file_link_total += count;
        if !digest.is_empty_object() && count > shard_stats.file_link_max {
            shard_stats.file_link_max = count;
        }
        if digest.is_chained() {
            shard_stats.file_cnt_rep += 1;
            shard_stats.file_rep_max = shard_stats.file_rep_max.max(digest.ext());
        }
    }

    // Whatever survived in `c_copy` was never matched on disk.
    let mut gone: Vec<Digest> = Vec::new();
    for (digest, count) in c_copy.iter() {
        if count == 0 {
            gone.push(digest.clone());
        } else if !digest.is_empty_object() {
            ctx.record(CairnError::MissingPoolObject {
                digest: digest.to_hex(),
                count,
            });
        }
    }
    for digest in &gone {
        c_new.delete(digest);
    }

    for digest in c_new.digests() {
        let count = c_new.get(&digest).unwrap_or(0);
        if count < 0 {
            ctx.record(CairnError::CountUnderflow {
                digest: digest.to_hex(),
                count,
            });
            c_new.set(&digest, 0);
        }
    }

    if c_new.is_empty() && !cnt_path.exists() {
        return;
    }
    if !top_dir.is_dir() {
        if let Err(e) = std::fs::create_dir_all(&top_dir) {
            ctx.record(CairnError::WriteFailed {
                path: top_dir.clone(),
                source: e,
            });
            return;
        }
    }
    // A failure here leaves the previous database in place untouched.
    if let Err(e) = c_new.write_replace(&cnt_path) {
        ctx.record(e);
    }
}

/// Walk the shard's sub-directories: remove files that do not belong,
/// absorb unreferenced objects as zero entries, and mark summed digests as
/// seen on disk.
fn reconcile_filesystem(
    ctx: &mut MaintenanceContext<'_>,
    top_dir: &Path,
    top_byte: u8,
    sub_bytes: &[u8],
    c_new: &mut CountMap,
    c_copy: &mut CountMap,
    shard_stats: &mut PoolShardStats,
) {
    for &sub in sub_bytes {
        let dir = top_dir.join(format!("{sub:02x}"));
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                ctx.record(e.into());
                continue;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let path = entry.path();
            match pool::classify_entry(name, top_byte, sub) {
                PoolEntry::Lock => {}
                PoolEntry::Unknown => {
                    remove_entry(&path);
                    ctx.record(CairnError::UnknownPoolObject(path));
                }
                PoolEntry::Misplaced(_) => {
                    remove_entry(&path);
                    ctx.record(CairnError::UnexpectedPoolObject(path));
                }
                PoolEntry::Object(digest) => {
                    if !c_new.contains(&digest) {
                        c_new.set(&digest, 0);
                        if let Ok(md) = entry.metadata() {
                            shard_stats.blk_cnt += pool::object_blocks(&md);
                        }
                    } else {
                        c_copy.delete(&digest);
                    }
                }
            }
        }
    }
}

fn remove_entry(path: &Path) {
    if path.is_dir() {
        let _ = std::fs::remove_dir_all(path);
    } else {
        let _ = std::fs::remove_file(path);
    }
}

/// Clear a pending-delete mark on a re-referenced object.
fn clear_delete_mark(ctx: &mut MaintenanceContext<'_>, mode: u32, path: &Path) {
    if !pool::is_marked(mode) {
        return;
    }
    if let Err(e) = std::fs::set_permissions(path, Permissions::from_mode(MODE_LIVE)) {
        ctx.record(CairnError::ChmodFailed {
            path: path.to_path_buf(),
            source: e,
        });
    }
}

/// Sub-shard directory names: two lowercase hex digits with the low bit
/// clear.
fn parse_sub_dir_name(name: &str) -> Option<u8> {
    let bytes = name.as_bytes();
    if bytes.len() != 2
        || !bytes
            .iter()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return None;
    }
    let value = u8::from_str_radix(name, 16).ok()?;
    (value & 1 == 0).then_some(value)
}

//! Host reconciliation: fold pending deltas into a host's durable shard
//! count databases, or rebuild those databases from the host's backups.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::context::MaintenanceContext;
use crate::count::{delta_files, CountMap, DeltaFile, DeltaWriter};
use crate::error::CairnError;
use crate::lock;
use crate::pool::{count_file_name, CompressClass, SHARD_COUNT};
use crate::walker::{countable_backups, BackupWalker};

/// Marker created before an incremental merge; its survival after a crash
/// upgrades the next pass to a full rebuild.
pub const FSCK_UPDATE_MARKER: &str = "needFsck.refCountUpdate";

const FSCK_PREFIX: &str = "needFsck";
const SHARD_FILE: &str = "poolCnt";
const SHARD_FILE_NEW: &str = "poolCntNew";

#[derive(Debug, Default, Clone)]
pub struct HostUpdateOptions {
    /// Rebuild the host's counts from its backups instead of folding deltas.
    pub force_rebuild: bool,
    /// With a rebuild: diff the rebuilt counts against the existing ones and
    /// report every per-digest discrepancy.
    pub check_host_pool: bool,
}

#[derive(Debug, Default)]
pub struct HostUpdateStats {
    pub deltas_applied: u64,
    pub shards_published: u64,
    /// Errors this host contributed to the pass total.
    pub errors: u64,
}

/// Reconcile one host. Never returns an error: failures are logged, counted
/// in the context, and reflected in the returned stats; the host is left
/// unmutated or recoverable (markers force a rebuild next pass).
pub fn run(
    ctx: &mut MaintenanceContext<'_>,
    host: &str,
    walker: &dyn BackupWalker,
    opts: &HostUpdateOptions,
) -> HostUpdateStats {
    let mut stats = HostUpdateStats::default();
    let errors_before = ctx.errors();

    let host_dir = ctx.config.host_dir(host);
    let refcnt_dir = host_dir.join("refCnt");
    if let Err(e) = std::fs::create_dir_all(&refcnt_dir) {
        ctx.record(CairnError::WriteFailed {
            path: refcnt_dir.clone(),
            source: e,
        });
        stats.errors = ctx.errors() - errors_before;
        return stats;
    }

    // Excludes concurrent dumps writing deltas for this host.
    let _lock = match lock::acquire(&refcnt_dir.join("LOCK")) {
        Ok(guard) => guard,
        Err(e) => {
            ctx.record(e);
            stats.errors = ctx.errors() - errors_before;
            return stats;
        }
    };

    ctx.progress.state(&format!("refCnt #{host}"));

    // Entry scan: collect fsck requests, drop staging files a crashed pass
    // left behind.
    let mut fsck_markers: Vec<PathBuf> = Vec::new();
    match std::fs::read_dir(&refcnt_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(FSCK_PREFIX) {
                    fsck_markers.push(entry.path());
                } else if name.starts_with("poolCntNew.") {
                    debug!("removing stale {}", entry.path().display());
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        ctx.record(CairnError::UnlinkFailed {
                            path: entry.path(),
                            source: e,
                        });
                    }
                }
            }
        }
        Err(e) => {
            ctx.record(e.into());
            stats.errors = ctx.errors() - errors_before;
            return stats;
        }
    }

    let force_rebuild = opts.force_rebuild || !fsck_markers.is_empty();
    if force_rebuild && !opts.force_rebuild {
        info!("host {host}: fsck requested, upgrading to a full rebuild");
    }

    let mut created_marker: Option<PathBuf> = None;
    if force_rebuild {
        if !rebuild_deltas(ctx, host, &host_dir, &refcnt_dir, walker) {
            stats.errors = ctx.errors() - errors_before;
            return stats;
        }
    } else {
        // A crash between here and finalization must trigger a rebuild.
        let marker = refcnt_dir.join(FSCK_UPDATE_MARKER);
        if let Err(e) = std::fs::write(&marker, b"") {
            ctx.record(CairnError::WriteFailed {
                path: marker,
                source: e,
            });
            stats.errors = ctx.errors() - errors_before;
            return stats;
        }
        created_marker = Some(marker);
    }
    // After a rebuild the old shard files are superseded, not folded into.
    let accumulate_current = !force_rebuild;

    let deltas = match delta_files(&refcnt_dir) {
        Ok(d) => d,
        Err(e) => {
            ctx.record(e);
            Vec::new()
        }
    };
    let total = deltas.len();
    for (i, delta) in deltas.iter().enumerate() {
        ctx.progress.file_count(i + 1, total);
        apply_delta(ctx, &refcnt_dir, delta, accumulate_current);
        stats.deltas_applied += 1;
    }

    publish_shards(ctx, &refcnt_dir, force_rebuild, opts, &mut stats);

    if force_rebuild {
        for marker in &fsck_markers {
            if let Err(e) = std::fs::remove_file(marker) {
                ctx.record(CairnError::UnlinkFailed {
                    path: marker.clone(),
                    source: e,
                });
            }
        }
    } else if ctx.errors() == errors_before {
        if let Some(marker) = created_marker {
            if let Err(e) = std::fs::remove_file(&marker) {
                ctx.record(CairnError::UnlinkFailed {
                    path: marker,
                    source: e,
                });
            }
        }
    }

    stats.errors = ctx.errors() - errors_before;
    stats
}

/// Rebuild path: discard pending deltas and re-derive them by walking every
/// countable backup. Returns false if the walk failed; the host is then
/// treated as failed and nothing is published for it.
fn rebuild_deltas(
    ctx: &mut MaintenanceContext<'_>,
    host: &str,
    host_dir: &Path,
    refcnt_dir: &Path,
    walker: &dyn BackupWalker,
) -> bool {
    match delta_files(refcnt_dir) {
        Ok(old) => {
            for delta in old {
                if let Err(e) = std::fs::remove_file(&delta.path) {
                    ctx.record(CairnError::UnlinkFailed {
                        path: delta.path,
                        source: e,
                    });
                }
            }
        }
        Err(e) => {
            ctx.record(e);
            return false;
        }
    }

    let backups = match countable_backups(host_dir) {
        Ok(b) => b,
        Err(e) => {
            ctx.record(e);
            return false;
        }
    };

    let mut writer = DeltaWriter::new(refcnt_dir);
    let total = backups.len();
    for (i, backup) in backups.iter().enumerate() {
        ctx.progress.file_count(i + 1, total);
        let result = walker.walk_backup(backup, &mut |digest, delta, class| {
            writer.incr(class, digest, delta)
        });
        if let Err(e) = result {
            info!(
                "host {host}: backup walk failed in {}, skipping host",
                backup.display()
            );
            ctx.record(e);
            return false;
        }
    }
    if let Err(e) = writer.flush() {
        ctx.record(e);
        return false;
    }
    true
}

/// Fold one delta file into the affected shards' working databases.
///
/// With `accumulate_current` the delta adds to the durable counts; without
/// it (rebuild) the durable positive counts are discarded first, keeping
/// only zero entries; they record that an unreferenced object file exists,
/// which the cleaner must not forget.
fn apply_delta(
    ctx: &mut MaintenanceContext<'_>,
    refcnt_dir: &Path,
    delta: &DeltaFile,
    accumulate_current: bool,
) {
    let delta_map = match CountMap::read(&delta.path) {
        Ok(m) => m,
        Err(e) => {
            // Leave the file: the retained fsck marker forces a rebuild
            // which supersedes it.
            ctx.record(e);
            return;
        }
    };

    let mut buckets: Vec<CountMap> = vec![CountMap::new(); SHARD_COUNT as usize];
    for (digest, count) in delta_map.iter() {
        buckets[digest.top_shard() as usize].incr(digest, count);
    }

    let pool_root = ctx.config.pool_root(delta.class);
    let mut had_error = false;

    for shard in 0..SHARD_COUNT {
        let bucket = &buckets[shard as usize];
        let new_path = refcnt_dir.join(count_file_name(SHARD_FILE_NEW, delta.class, shard));
        let cur_path = refcnt_dir.join(count_file_name(SHARD_FILE, delta.class, shard));
        let have_new = new_path.is_file();
        let have_cur = cur_path.is_file();
        if bucket.is_empty() && !have_new && !have_cur {
            continue;
        }

        let mut working = if have_new {
            match CountMap::read(&new_path) {
                Ok(m) => m,
                Err(e) => {
                    ctx.record(e);
                    had_error = true;
                    continue;
                }
            }
        } else if have_cur {
            match CountMap::read(&cur_path) {
                Ok(mut m) => {
                    if !accumulate_current {
                        for digest in m.digests() {
                            if m.get(&digest).unwrap_or(0) != 0 {
                                m.delete(&digest);
                            }
                        }
                    }
                    m
                }
                Err(e) => {
                    ctx.record(e);
                    had_error = true;
                    continue;
                }
            }
        } else {
            CountMap::new()
        };

        for (digest, count) in bucket.iter() {
            working.incr(digest, count);
        }

        // Negative totals never become durable.
        for digest in working.digests() {
            let count = working.get(&digest).unwrap_or(0);
            if count < 0 {
                ctx.record(CairnError::CountUnderflow {
                    digest: digest.to_hex(),
                    count,
                });
                had_error = true;
                working.set(&digest, 0);
            }
        }

        // A zero entry is only kept while the object file still exists.
        for digest in working.digests() {
            if working.get(&digest) == Some(0) && !digest.path_in(&pool_root).exists() {
                working.delete(&digest);
            }
        }

        if let Err(e) = working.write(&new_path) {
            ctx.record(e);
            had_error = true;
            let _ = std::fs::remove_file(&new_path);
        }
    }

    if had_error {
        debug!(
            "keeping {} after errors; next pass rebuilds",
            delta.path.display()
        );
        return;
    }
    if let Err(e) = std::fs::remove_file(&delta.path) {
        ctx.record(CairnError::UnlinkFailed {
            path: delta.path.clone(),
            source: e,
        });
    }
}

/// Publish every staged shard database by renaming it over the durable one.
fn publish_shards(
    ctx: &mut MaintenanceContext<'_>,
    refcnt_dir: &Path,
    force_rebuild: bool,
    opts: &HostUpdateOptions,
    stats: &mut HostUpdateStats,
) {
    for class in CompressClass::ALL {
        for shard in 0..SHARD_COUNT {
            let new_path = refcnt_dir.join(count_file_name(SHARD_FILE_NEW, class, shard));
            let cur_path = refcnt_dir.join(count_file_name(SHARD_FILE, class, shard));

            if new_path.is_file() {
                if force_rebuild && opts.check_host_pool && cur_path.is_file() {
                    compare_counts(ctx, &new_path, &cur_path);
                }
                if let Err(e) = std::fs::rename(&new_path, &cur_path) {
                    ctx.record(CairnError::RenameFailed {
                        from: new_path.clone(),
                        to: cur_path,
                        source: e,
                    });
                    let _ = std::fs::remove_file(&new_path);
                    continue;
                }
                stats.shards_published += 1;
            } else if force_rebuild && cur_path.is_file() {
                // The rebuild produced nothing for this shard: the host no
                // longer references it.
                if let Err(e) = std::fs::remove_file(&cur_path) {
                    ctx.record(CairnError::UnlinkFailed {
                        path: cur_path,
                        source: e,
                    });
                }
            }
        }
    }
}

/// Report every per-digest difference between a rebuilt shard database and
/// the durable one it is about to replace.
fn compare_counts(ctx: &mut MaintenanceContext<'_>, new_path: &Path, cur_path: &Path) {
    let rebuilt = match CountMap::read(new_path) {
        Ok(m) => m,
        Err(e) => {
            ctx.record(e);
            return;
        }
    };
    let existing = match CountMap::read(cur_path) {
        Ok(m) => m,
        Err(e) => {
            ctx.record(e);
            return;
        }
    };

    let fmt = |v: Option<i64>| v.map_or_else(|| "absent".to_string(), |c| c.to_string());
    let mut digests = rebuilt.digests();
    digests.extend(existing.digests());
    digests.sort();
    digests.dedup();
    for digest in digests {
        let new_count = rebuilt.get(&digest);
        let old_count = existing.get(&digest);
        if new_count != old_count {
            ctx.record(CairnError::CountMismatch {
                digest: digest.to_hex(),
                rebuilt: fmt(new_count),
                existing: fmt(old_count),
            });
        }
    }
}

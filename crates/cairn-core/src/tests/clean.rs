use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;

use crate::commands::pool_clean;
use crate::context::MaintenanceContext;
use crate::count::CountMap;
use crate::pool::{CompressClass, MODE_LIVE, MODE_MARKED};
use crate::progress::SilentProgress;
use crate::stats::PoolShardStats;
use crate::testutil::{file_mode, PoolFixture};

use cairn_types::Digest;

fn clean(fx: &PoolFixture, shard: u8, stats: &mut PoolShardStats) -> u64 {
    let mut progress = SilentProgress;
    let mut ctx = MaintenanceContext::new(&fx.config, &mut progress);
    pool_clean::clean_shard(&mut ctx, CompressClass::Pool, shard, stats);
    ctx.errors()
}

/// Write a shard's authoritative counts directly.
fn write_pool_counts(fx: &PoolFixture, shard: u8, entries: &[(Digest, i64)]) {
    let path = fx.pool_shard_count_path(CompressClass::Pool, shard);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut map = CountMap::new();
    for (digest, count) in entries {
        map.incr(digest, *count);
    }
    map.write(&path).unwrap();
}

#[test]
fn first_pass_marks_but_does_not_remove() {
    let fx = PoolFixture::new();
    let a = PoolFixture::digest(0x10, 0x20);
    let path = fx.add_pool_object(CompressClass::Pool, &a, b"doomed");
    write_pool_counts(&fx, a.top_shard(), &[(a.clone(), 0)]);

    let mut stats = PoolShardStats::default();
    let errors = clean(&fx, a.top_shard(), &mut stats);

    assert_eq!(errors, 0);
    assert!(path.exists());
    assert_eq!(file_mode(&path), MODE_MARKED);
    assert_eq!(stats.file_cnt_rm, 0);
    // the zero entry stays: the sweep decision belongs to the next pass
    let counts = fx
        .read_pool_shard(CompressClass::Pool, a.top_shard())
        .unwrap();
    assert_eq!(counts.get(&a), Some(0));
}

#[test]
fn second_pass_sweeps_marked_objects() {
    let fx = PoolFixture::new();
    let a = PoolFixture::digest(0x10, 0x20);
    let path = fx.add_pool_object(CompressClass::Pool, &a, b"doomed");
    write_pool_counts(&fx, a.top_shard(), &[(a.clone(), 0)]);

    let mut stats = PoolShardStats::default();
    clean(&fx, a.top_shard(), &mut stats);
    let errors = clean(&fx, a.top_shard(), &mut stats);

    assert_eq!(errors, 0);
    assert!(!path.exists());
    assert_eq!(stats.file_cnt_rm, 1);
    assert!(stats.blk_cnt_rm > 0);
    let counts = fx
        .read_pool_shard(CompressClass::Pool, a.top_shard())
        .unwrap();
    assert!(!counts.contains(&a));
}

#[test]
fn chained_objects_are_hollowed_not_unlinked() {
    let fx = PoolFixture::new();
    let base = PoolFixture::digest(0x10, 0x20);
    let next = base.with_ext(1);
    let base_path = fx.add_pool_object(CompressClass::Pool, &base, b"chain head");
    fx.add_pool_object(CompressClass::Pool, &next, b"chain tail");
    write_pool_counts(&fx, base.top_shard(), &[(base.clone(), 0), (next.clone(), 5)]);

    let mut stats = PoolShardStats::default();
    clean(&fx, base.top_shard(), &mut stats);
    let errors = clean(&fx, base.top_shard(), &mut stats);

    assert_eq!(errors, 0);
    // the slot survives as a zero-length placeholder so lookups still scan
    // past it to the live tail
    assert!(base_path.exists());
    assert_eq!(std::fs::metadata(&base_path).unwrap().len(), 0);
    assert_eq!(file_mode(&base_path), 0o644);
    assert_eq!(stats.file_cnt_rm, 1);

    let counts = fx
        .read_pool_shard(CompressClass::Pool, base.top_shard())
        .unwrap();
    assert!(!counts.contains(&base));
    assert_eq!(counts.get(&next), Some(5));
}

#[test]
fn positive_counts_are_left_alone() {
    let fx = PoolFixture::new();
    let a = PoolFixture::digest(0x10, 0x20);
    let path = fx.add_pool_object(CompressClass::Pool, &a, b"live");
    write_pool_counts(&fx, a.top_shard(), &[(a.clone(), 3)]);

    let mut stats = PoolShardStats::default();
    let errors = clean(&fx, a.top_shard(), &mut stats);

    assert_eq!(errors, 0);
    assert_eq!(file_mode(&path), MODE_LIVE);
    assert_eq!(stats.file_cnt_rm, 0);
}

#[test]
fn absent_and_hollow_objects_are_skipped_silently() {
    let fx = PoolFixture::new();
    let gone = PoolFixture::digest(0x10, 0x20);
    let hollow = PoolFixture::digest(0x10, 0x60);
    let hollow_path = fx.add_pool_object(CompressClass::Pool, &hollow, b"");
    std::fs::set_permissions(&hollow_path, Permissions::from_mode(0o644)).unwrap();
    write_pool_counts(
        &fx,
        gone.top_shard(),
        &[(gone.clone(), 0), (hollow.clone(), 0)],
    );

    let mut stats = PoolShardStats::default();
    let errors = clean(&fx, gone.top_shard(), &mut stats);

    assert_eq!(errors, 0);
    assert!(hollow_path.exists());
    assert_eq!(stats.file_cnt_rm, 0);
    // entries stay: the aggregator, not the cleaner, retires them
    let counts = fx
        .read_pool_shard(CompressClass::Pool, gone.top_shard())
        .unwrap();
    assert!(counts.contains(&gone));
    assert!(counts.contains(&hollow));
}

#[test]
fn marked_object_rereferenced_before_sweep_is_not_reclaimed() {
    let fx = PoolFixture::new();
    let a = PoolFixture::digest(0x10, 0x20);
    let path = fx.add_pool_object(CompressClass::Pool, &a, b"saved");
    write_pool_counts(&fx, a.top_shard(), &[(a.clone(), 0)]);

    let mut stats = PoolShardStats::default();
    clean(&fx, a.top_shard(), &mut stats);
    assert_eq!(file_mode(&path), MODE_MARKED);

    // a backup re-references it before the next clean
    write_pool_counts(&fx, a.top_shard(), &[(a.clone(), 1)]);
    let errors = clean(&fx, a.top_shard(), &mut stats);

    assert_eq!(errors, 0);
    assert!(path.exists());
    assert_eq!(stats.file_cnt_rm, 0);
}

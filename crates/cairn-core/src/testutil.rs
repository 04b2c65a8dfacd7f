use std::cell::Cell;
use std::fs::Permissions;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use cairn_types::Digest;

use crate::config::CairnConfig;
use crate::count::CountMap;
use crate::error::Result;
use crate::pool::{count_file_name, shard_dir_name, CompressClass, MODE_LIVE};
use crate::progress::ProgressSink;
use crate::walker::BackupWalker;

/// Progress sink that records everything for assertions.
#[derive(Debug, Default)]
pub struct CaptureProgress {
    pub states: Vec<String>,
    pub counts: Vec<(usize, usize)>,
}

impl ProgressSink for CaptureProgress {
    fn state(&mut self, label: &str) {
        self.states.push(label.to_string());
    }

    fn file_count(&mut self, current: usize, total: usize) {
        self.counts.push((current, total));
    }
}

/// A store rooted in a temp dir: `pc/` for hosts, `pool/` and `cpool/`.
pub struct PoolFixture {
    _dir: TempDir,
    pub config: CairnConfig,
    delta_seq: Cell<u32>,
}

impl PoolFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create fixture dir");
        let top = dir.path().to_path_buf();
        for sub in ["pc", "pool", "cpool"] {
            std::fs::create_dir_all(top.join(sub)).unwrap();
        }
        let config = CairnConfig {
            top_dir: top,
            pool_dir: None,
            cpool_dir: None,
            pool_size_nightly_update_period: 16,
            xfer_log_level: 1,
        };
        PoolFixture {
            _dir: dir,
            config,
            delta_seq: Cell::new(0),
        }
    }

    /// A deterministic 16-byte digest: first two bytes chosen, rest fill.
    pub fn digest(b0: u8, b1: u8) -> Digest {
        let mut bytes = [0x5au8; 16];
        bytes[0] = b0;
        bytes[1] = b1;
        Digest::from_bytes(&bytes)
    }

    pub fn refcnt_dir(&self, host: &str) -> PathBuf {
        let dir = self.config.host_dir(host).join("refCnt");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write a host's durable shard databases from a flat entry list.
    pub fn write_host_counts(&self, host: &str, class: CompressClass, entries: &[(Digest, i64)]) {
        let dir = self.refcnt_dir(host);
        for (shard, map) in bucket_by_shard(entries) {
            map.write(&dir.join(count_file_name("poolCnt", class, shard)))
                .unwrap();
        }
    }

    /// Write one backup's own count databases (what the dump deposits).
    pub fn write_backup_counts(
        &self,
        host: &str,
        num: u32,
        class: CompressClass,
        entries: &[(Digest, i64)],
    ) {
        let dir = self
            .config
            .host_dir(host)
            .join(num.to_string())
            .join("refCnt");
        std::fs::create_dir_all(&dir).unwrap();
        for (shard, map) in bucket_by_shard(entries) {
            map.write(&dir.join(count_file_name("poolCnt", class, shard)))
                .unwrap();
        }
    }

    /// Deposit a pending delta file, as a backup run would.
    pub fn write_delta(&self, host: &str, class: CompressClass, entries: &[(Digest, i64)]) {
        let mut map = CountMap::new();
        for (digest, count) in entries {
            map.incr(digest, *count);
        }
        let seq = self.delta_seq.get();
        self.delta_seq.set(seq + 1);
        let name = format!("poolCntDelta_{}_9999_{seq}", class.tag());
        map.write(&self.refcnt_dir(host).join(name)).unwrap();
    }

    pub fn pool_object_path(&self, class: CompressClass, digest: &Digest) -> PathBuf {
        digest.path_in(&self.config.pool_root(class))
    }

    /// Create a live pool object file for `digest`.
    pub fn add_pool_object(&self, class: CompressClass, digest: &Digest, data: &[u8]) -> PathBuf {
        let path = self.pool_object_path(class, digest);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(MODE_LIVE)).unwrap();
        path
    }

    pub fn read_host_shard(
        &self,
        host: &str,
        class: CompressClass,
        shard: u8,
    ) -> Result<CountMap> {
        CountMap::read(
            &self
                .config
                .host_dir(host)
                .join("refCnt")
                .join(count_file_name("poolCnt", class, shard)),
        )
    }

    pub fn pool_shard_count_path(&self, class: CompressClass, shard: u8) -> PathBuf {
        self.config
            .pool_root(class)
            .join(shard_dir_name(shard))
            .join("poolCnt")
    }

    pub fn read_pool_shard(&self, class: CompressClass, shard: u8) -> Result<CountMap> {
        CountMap::read(&self.pool_shard_count_path(class, shard))
    }
}

pub fn bucket_by_shard(entries: &[(Digest, i64)]) -> Vec<(u8, CountMap)> {
    let mut buckets: std::collections::BTreeMap<u8, CountMap> = Default::default();
    for (digest, count) in entries {
        buckets
            .entry(digest.top_shard())
            .or_default()
            .incr(digest, *count);
    }
    buckets.into_iter().collect()
}

pub fn file_mode(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().mode() & 0o7777
}

/// Walker emitting a fixed reference list for every backup it is handed.
pub struct StaticWalker(pub Vec<(Digest, i64, CompressClass)>);

impl BackupWalker for StaticWalker {
    fn walk_backup(
        &self,
        _backup_dir: &Path,
        emit: &mut dyn FnMut(&Digest, i64, CompressClass) -> Result<()>,
    ) -> Result<()> {
        for (digest, count, class) in &self.0 {
            emit(digest, *count, *class)?;
        }
        Ok(())
    }
}

/// Walker that always fails, for host-failure paths.
pub struct FailingWalker;

impl BackupWalker for FailingWalker {
    fn walk_backup(
        &self,
        backup_dir: &Path,
        _emit: &mut dyn FnMut(&Digest, i64, CompressClass) -> Result<()>,
    ) -> Result<()> {
        Err(std::io::Error::other(format!("walk failed in {}", backup_dir.display())).into())
    }
}

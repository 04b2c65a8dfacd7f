use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use cairn_types::Digest;

/// Number of top-level shards (and of sub-shards under each).
pub const SHARD_COUNT: u8 = 128;

/// Mode of a live pool object.
pub const MODE_LIVE: u32 = 0o444;

/// Mode of an object marked for deletion on the next cleaning pass.
pub const MODE_MARKED: u32 = 0o445;

/// Mode of a zero-length placeholder keeping a digest chain contiguous.
pub const MODE_CHAIN_HOLE: u32 = 0o644;

/// The two on-disk object namespaces. A digest may exist in both with
/// independent counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompressClass {
    /// Uncompressed objects (class 0).
    Pool,
    /// Compressed objects (class 1).
    Cpool,
}

impl CompressClass {
    pub const ALL: [CompressClass; 2] = [CompressClass::Pool, CompressClass::Cpool];

    /// Single-character tag used in count and delta file names.
    pub fn tag(self) -> char {
        match self {
            CompressClass::Pool => '0',
            CompressClass::Cpool => '1',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            '0' => Some(CompressClass::Pool),
            '1' => Some(CompressClass::Cpool),
            _ => None,
        }
    }

    pub fn pool_name(self) -> &'static str {
        match self {
            CompressClass::Pool => "pool",
            CompressClass::Cpool => "cpool",
        }
    }
}

/// Directory name of a top or sub shard: the shard index shifted back up
/// into a directory byte, in two-digit hex (`00`, `02`, ... `fe`).
pub fn shard_dir_name(shard: u8) -> String {
    format!("{:02x}", (shard as u32) << 1)
}

/// Name of a per-host (or per-backup) count database file for one shard.
pub fn count_file_name(prefix: &str, class: CompressClass, shard: u8) -> String {
    format!("{prefix}.{}.{}", class.tag(), shard_dir_name(shard))
}

/// Top shard directory under a pool root.
pub fn shard_dir(pool_root: &Path, shard: u8) -> PathBuf {
    pool_root.join(shard_dir_name(shard))
}

/// Allocated 512-byte blocks of an object, the unit of pool size stats.
pub fn object_blocks(md: &Metadata) -> i64 {
    md.blocks() as i64
}

/// True if the pending-delete mark (the world-execute bit) is set.
pub fn is_marked(mode: u32) -> bool {
    mode & (libc::S_IXOTH as u32) != 0
}

/// Classification of one directory entry found during a pool walk.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolEntry {
    /// A well-formed digest filed under its correct directory pair.
    Object(Digest),
    /// A well-formed digest filed under the wrong directory.
    Misplaced(Digest),
    /// A lock file; left alone.
    Lock,
    /// Anything else.
    Unknown,
}

/// Classify a file name found in sub-shard directory `(top, sub)`.
pub fn classify_entry(name: &str, top: u8, sub: u8) -> PoolEntry {
    if name == "LOCK" {
        return PoolEntry::Lock;
    }
    match Digest::from_hex(name) {
        Some(digest) => {
            if digest.dir_bytes() == (top, sub) {
                PoolEntry::Object(digest)
            } else {
                PoolEntry::Misplaced(digest)
            }
        }
        None => PoolEntry::Unknown,
    }
}

//! Pending reference-count deltas.
//!
//! Backup runs (and rebuild walks) deposit `poolCntDelta_<class>_<pid>_<seq>`
//! files in a host's `refCnt` directory. Each is a count database holding the
//! net signed change per digest. They are read-once inputs to the host
//! reconciler, which deletes each file only after the host's new shard files
//! were written without error.

use std::path::{Path, PathBuf};

use cairn_types::Digest;

use crate::count::CountMap;
use crate::error::Result;
use crate::pool::CompressClass;

const DELTA_PREFIX: &str = "poolCntDelta_";

/// Flush threshold: keeps a long walk from holding every digest in memory.
const MAX_PENDING_ENTRIES: usize = 1 << 20;

/// A pending delta file, class parsed from its name.
#[derive(Debug, Clone)]
pub struct DeltaFile {
    pub path: PathBuf,
    pub class: CompressClass,
}

/// Parse `poolCntDelta_<c>_...` into its compression class.
fn parse_delta_name(name: &str) -> Option<CompressClass> {
    let rest = name.strip_prefix(DELTA_PREFIX)?;
    let mut chars = rest.chars();
    let class = CompressClass::from_tag(chars.next()?)?;
    match chars.next() {
        Some('_') => Some(class),
        _ => None,
    }
}

/// List the pending delta files in a host's `refCnt` directory, sorted by
/// name. Ordering only affects progress reporting; application commutes.
pub fn delta_files(dir: &Path) -> Result<Vec<DeltaFile>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(class) = parse_delta_name(name) {
            found.push(DeltaFile {
                path: entry.path(),
                class,
            });
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

/// Writer half of the delta collaborator: accumulates per-class counts and
/// flushes them as fresh delta files.
pub struct DeltaWriter {
    dir: PathBuf,
    seq: u32,
    pending: [CountMap; 2],
}

impl DeltaWriter {
    pub fn new(dir: &Path) -> Self {
        DeltaWriter {
            dir: dir.to_path_buf(),
            seq: 0,
            pending: [CountMap::new(), CountMap::new()],
        }
    }

    pub fn incr(&mut self, class: CompressClass, digest: &Digest, delta: i64) -> Result<()> {
        let map = &mut self.pending[class as usize];
        map.incr(digest, delta);
        if map.len() >= MAX_PENDING_ENTRIES {
            self.flush_class(class)?;
        }
        Ok(())
    }

    /// Write out all non-empty pending maps.
    pub fn flush(&mut self) -> Result<()> {
        for class in CompressClass::ALL {
            self.flush_class(class)?;
        }
        Ok(())
    }

    fn flush_class(&mut self, class: CompressClass) -> Result<()> {
        let map = std::mem::take(&mut self.pending[class as usize]);
        if map.is_empty() {
            return Ok(());
        }
        let name = format!(
            "{DELTA_PREFIX}{}_{}_{}",
            class.tag(),
            std::process::id(),
            self.seq
        );
        self.seq += 1;
        map.write(&self.dir.join(name))
    }
}

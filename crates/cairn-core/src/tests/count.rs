use tempfile::TempDir;

use crate::count::file::is_stale_staging;
use crate::count::CountMap;
use crate::error::CairnError;
use crate::testutil::PoolFixture;

#[test]
fn incr_defines_missing_key() {
    let mut map = CountMap::new();
    let d = PoolFixture::digest(0x10, 0x20);
    map.incr(&d, -3);
    assert_eq!(map.get(&d), Some(-3));
    map.incr(&d, 5);
    assert_eq!(map.get(&d), Some(2));
}

#[test]
fn zero_is_distinct_from_absent() {
    let mut map = CountMap::new();
    let d = PoolFixture::digest(0x10, 0x20);
    assert_eq!(map.get(&d), None);
    map.incr(&d, 0);
    assert_eq!(map.get(&d), Some(0));
    assert!(map.contains(&d));
    assert_eq!(map.delete(&d), Some(0));
    assert_eq!(map.get(&d), None);
}

#[test]
fn iteration_is_digest_ordered() {
    let mut map = CountMap::new();
    let a = PoolFixture::digest(0x01, 0x00);
    let b = PoolFixture::digest(0x02, 0x00);
    let b1 = b.with_ext(1);
    map.incr(&b1, 3);
    map.incr(&b, 2);
    map.incr(&a, 1);
    let order: Vec<_> = map.iter().map(|(d, _)| d.clone()).collect();
    assert_eq!(order, vec![a, b, b1]);
}

#[test]
fn file_roundtrip_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let mut map = CountMap::new();
    map.incr(&PoolFixture::digest(0xab, 0x01), 7);
    map.incr(&PoolFixture::digest(0x02, 0xfe), -1);
    map.incr(&PoolFixture::digest(0x02, 0xfe).with_ext(2), 0);

    let first = dir.path().join("poolCnt.0.00");
    map.write(&first).unwrap();
    let loaded = CountMap::read(&first).unwrap();
    assert_eq!(loaded, map);

    let second = dir.path().join("copy");
    loaded.write(&second).unwrap();
    assert_eq!(
        std::fs::read(&first).unwrap(),
        std::fs::read(&second).unwrap()
    );
}

#[test]
fn empty_map_roundtrips() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty");
    CountMap::new().write(&path).unwrap();
    assert!(CountMap::read(&path).unwrap().is_empty());
}

#[test]
fn read_rejects_bad_magic() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad");
    std::fs::write(&path, b"XXXX").unwrap();
    assert!(matches!(
        CountMap::read(&path),
        Err(CairnError::CorruptCountFile { .. })
    ));
}

#[test]
fn read_rejects_truncation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trunc");
    let mut map = CountMap::new();
    map.incr(&PoolFixture::digest(0x10, 0x20), 1);
    map.write(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
    assert!(matches!(
        CountMap::read(&path),
        Err(CairnError::CorruptCountFile { .. })
    ));
}

#[test]
fn read_rejects_out_of_order_entries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ooo");
    let a = PoolFixture::digest(0x01, 0x00);
    let b = PoolFixture::digest(0x02, 0x00);

    let mut bytes = b"CPc1".to_vec();
    for digest in [&b, &a] {
        bytes.push(digest.len() as u8);
        bytes.extend_from_slice(digest.as_bytes());
        bytes.extend_from_slice(&1i64.to_le_bytes());
    }
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        CountMap::read(&path),
        Err(CairnError::CorruptCountFile { .. })
    ));
}

#[test]
fn write_replace_is_atomic_and_cleans_staging() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("poolCnt");

    let mut old = CountMap::new();
    old.incr(&PoolFixture::digest(0x10, 0x20), 1);
    old.write(&path).unwrap();

    let mut new = CountMap::new();
    new.incr(&PoolFixture::digest(0x10, 0x20), 2);
    new.write_replace(&path).unwrap();

    assert_eq!(CountMap::read(&path).unwrap(), new);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(leftovers, vec!["poolCnt".to_string()]);
}

#[test]
fn stale_staging_names() {
    assert!(is_stale_staging("poolCnt.1234", "poolCnt"));
    assert!(!is_stale_staging("poolCnt", "poolCnt"));
    assert!(!is_stale_staging("poolCnt.", "poolCnt"));
    assert!(!is_stale_staging("poolCnt.12a4", "poolCnt"));
    assert!(!is_stale_staging("poolCntNew.0.00", "poolCnt"));
}

use crate::pool::CompressClass;
use crate::stats::{kilobytes, stats_line, PoolShardStats};

#[test]
fn kilobytes_round_half_away_from_zero() {
    assert_eq!(kilobytes(0), 0);
    assert_eq!(kilobytes(1), 1); // 0.5 KB rounds up
    assert_eq!(kilobytes(2), 1);
    assert_eq!(kilobytes(3), 2); // 1.5 KB rounds up
    assert_eq!(kilobytes(-1), -1); // -0.5 KB rounds down
    assert_eq!(kilobytes(-2), -1);
    assert_eq!(kilobytes(-3), -2); // -1.5 KB rounds down
}

#[test]
fn stats_line_field_order() {
    let stats = PoolShardStats {
        file_cnt: 3,
        dir_cnt: 129,
        blk_cnt: 7,
        blk_cnt_rm: 2,
        file_cnt_rm: 1,
        file_cnt_rep: 2,
        file_rep_max: 4,
        file_link_max: 9,
        file_link_total: 12,
    };
    assert_eq!(
        stats_line(CompressClass::Cpool, 61, &stats),
        "BackupPC_stats4 61 = cpool,3,129,4,1,1,2,4,9,12"
    );
}

#[test]
fn stats_line_defaults_are_all_zero() {
    assert_eq!(
        stats_line(CompressClass::Pool, 0, &PoolShardStats::default()),
        "BackupPC_stats4 0 = pool,0,0,0,0,0,0,0,0,0"
    );
}

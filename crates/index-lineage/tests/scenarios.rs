use std::collections::BTreeSet;

use index_lineage::config::EngineConfig;
use index_lineage::indexdb::{self, IndexDbKind};
use index_lineage::{
    BackupLevel, BrowseQuery, CancelToken, CheckpointId, CycleId, IndexLineage, Job, JobId,
    Provenance, ResolvedSegment, VersionEvent,
};

/// Cycle `c` is a full (job 2c-1) at c*1000 plus an incremental (job 2c)
/// 100 later; every job runs for 50.
fn ingest_cycle(e: &IndexLineage, c: u64) {
    let base = c as i64 * 1000;
    e.notify_job_completed(
        Job::new(2 * c - 1, BackupLevel::Full, base, base + 50),
        &[
            VersionEvent::write(format!("/data/full{c}"), c, base),
            VersionEvent::write("/data/common", c, base),
        ],
    )
    .expect("ingest full");
    e.notify_job_completed(
        Job::new(2 * c, BackupLevel::Incremental, base + 100, base + 150),
        &[VersionEvent::write(format!("/data/inc{c}"), c, base + 100)],
    )
    .expect("ingest incremental");
}

fn cycles_range(first: u64, last: u64) -> BrowseQuery {
    BrowseQuery::Range {
        from: first as i64 * 1000,
        to: last as i64 * 1000 + 150,
    }
}

fn covered(e: &IndexLineage, id: u64) -> Vec<u64> {
    e.checkpoints()
        .expect("checkpoints")
        .into_iter()
        .find(|r| r.id == CheckpointId::new(id))
        .expect("checkpoint present")
        .covered_cycles
        .iter()
        .map(|c| c.get())
        .collect()
}

fn seg_cycles(s: &ResolvedSegment) -> Vec<u64> {
    s.sub_range.cycles.iter().map(|c| c.get()).collect()
}

fn provenances(segs: &[ResolvedSegment]) -> Vec<Provenance> {
    segs.iter().map(|s| s.provenance).collect()
}

/// Six cycles, retain 2, pruned after cycles 2, 3 and 6.
fn scenario_a() -> (tempfile::TempDir, IndexLineage) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut cfg = EngineConfig::new(tmp.path().join("cache"));
    cfg.retention.cycles_to_retain = 2;
    cfg.retention.auto_prune = false;
    let e = IndexLineage::open(cfg, "vm-sc1").expect("open");

    ingest_cycle(&e, 1);
    ingest_cycle(&e, 2);
    e.run_prune().expect("prune after cycle 2");
    ingest_cycle(&e, 3);
    e.run_prune().expect("prune after cycle 3");
    for c in 4..=6 {
        ingest_cycle(&e, c);
    }
    e.run_prune().expect("prune after cycle 6");
    (tmp, e)
}

#[test]
fn scenario_a_checkpoint_growth_and_main_retention() {
    let (_tmp, e) = scenario_a();
    assert_eq!(e.checkpoints().expect("checkpoints").len(), 3);
    assert_eq!(covered(&e, 1), vec![1, 2]);
    assert_eq!(covered(&e, 2), vec![1, 2, 3]);
    assert_eq!(covered(&e, 3), vec![2, 3, 4, 5, 6]);

    let status = e.status().expect("status");
    assert_eq!(status.main_cycles, vec![CycleId::new(5), CycleId::new(6)]);
    assert!(status.coverage_holds());
}

#[test]
fn scenario_a_browse_prefers_latest_checkpoint() {
    let (_tmp, e) = scenario_a();
    let segs = e
        .browse(cycles_range(1, 4), false, &CancelToken::new())
        .expect("browse");
    // Checkpoint 3 ends latest and serves cycles 2-4; cycle 1 is outside it
    // and falls to the newest checkpoint that still covers it.
    assert_eq!(
        provenances(&segs),
        vec![
            Provenance::Checkpoint(CheckpointId::new(2)),
            Provenance::Checkpoint(CheckpointId::new(3)),
        ]
    );
    assert_eq!(seg_cycles(&segs[0]), vec![1]);
    assert_eq!(seg_cycles(&segs[1]), vec![2, 3, 4]);
    assert!(segs.iter().all(|s| s.handle.kind == IndexDbKind::RestoredCheckpoint));

    let items = index_lineage::browse::merge_items(&segs).expect("items");
    let paths: BTreeSet<&str> = items.iter().map(|i| i.path.as_str()).collect();
    assert!(paths.contains("/data/full1"));
    assert!(paths.contains("/data/inc4"));
    assert!(!paths.contains("/data/full5"));
    let common = items
        .iter()
        .find(|i| i.path == "/data/common")
        .expect("common");
    assert_eq!(common.size, 4);
}

#[test]
fn scenario_b_invalidated_history_replays_into_temp() {
    let (_tmp, e) = scenario_a();
    assert!(e.invalidate_checkpoint(CheckpointId::new(1)).expect("invalidate 1"));
    assert!(e.invalidate_checkpoint(CheckpointId::new(2)).expect("invalidate 2"));
    assert!(!e.invalidate_checkpoint(CheckpointId::new(2)).expect("idempotent"));

    let segs = e
        .browse(cycles_range(1, 1), false, &CancelToken::new())
        .expect("browse");
    assert_eq!(provenances(&segs), vec![Provenance::Temp]);
    let db = indexdb::IndexDb::open(&segs[0].handle.path).expect("open temp");
    assert_eq!(db.job_ids(), &[JobId::new(1), JobId::new(2)]);
    assert_eq!(segs[0].handle.kind, IndexDbKind::Temp);
}

#[test]
fn scenario_c_cache_loss_resolves_from_checkpoint_and_playback() {
    let (_tmp, e) = scenario_a();
    e.invalidate_checkpoint(CheckpointId::new(1)).expect("invalidate 1");
    e.invalidate_checkpoint(CheckpointId::new(2)).expect("invalidate 2");
    e.purge_cache(&[
        IndexDbKind::Main,
        IndexDbKind::RestoredCheckpoint,
        IndexDbKind::Temp,
    ])
    .expect("purge");
    assert!(e.main_handle().expect("main").is_none());

    let segs = e
        .browse(cycles_range(1, 6), false, &CancelToken::new())
        .expect("browse");
    assert_eq!(
        provenances(&segs),
        vec![
            Provenance::Temp,
            Provenance::Checkpoint(CheckpointId::new(3)),
        ]
    );
    assert_eq!(seg_cycles(&segs[0]), vec![1]);
    assert_eq!(seg_cycles(&segs[1]), vec![2, 3, 4, 5, 6]);

    // Rebuilding Main brings back the retained cycles plus the uncovered one.
    let report = e.rebuild_main(&CancelToken::new()).expect("rebuild");
    assert_eq!(
        report.cycles,
        vec![CycleId::new(1), CycleId::new(5), CycleId::new(6)]
    );
    let segs = e
        .browse(cycles_range(1, 6), false, &CancelToken::new())
        .expect("browse after rebuild");
    assert_eq!(
        provenances(&segs),
        vec![
            Provenance::Main,
            Provenance::Checkpoint(CheckpointId::new(3)),
            Provenance::Main,
        ]
    );
}

#[test]
fn scenario_d_job_browse_goes_straight_to_checkpoint() {
    let (_tmp, e) = scenario_a();
    let segs = e
        .browse(BrowseQuery::Job(JobId::new(4)), false, &CancelToken::new())
        .expect("browse");
    assert_eq!(
        provenances(&segs),
        vec![Provenance::Checkpoint(CheckpointId::new(3))]
    );
    assert_eq!(segs[0].sub_range.jobs, vec![JobId::new(3), JobId::new(4)]);

    let items = segs[0].items().expect("items");
    let paths: Vec<&str> = items.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(paths, vec!["/data/common", "/data/full2", "/data/inc2"]);
}

#[test]
fn browse_in_main_needs_no_materialization() {
    let (_tmp, e) = scenario_a();
    let segs = e
        .browse(cycles_range(5, 6), false, &CancelToken::new())
        .expect("browse");
    assert_eq!(provenances(&segs), vec![Provenance::Main]);
    assert_eq!(seg_cycles(&segs[0]), vec![5, 6]);
    let restored = std::fs::read_dir(e.layout().restored_dir())
        .expect("restored dir")
        .count();
    assert_eq!(restored, 0);
}

use runtracker_core::{
    InsertOutcome, LocationSample, LocationSource, ManualLocationSource, ReplayLocationSource,
    Result, Run, RunManager, RunStore, SessionMarker, StoragePaths, TrackerConfig,
    TrackerError,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn open_manager(paths: &StoragePaths, source: Arc<dyn LocationSource>) -> Arc<RunManager> {
    let config = TrackerConfig::load(&paths.config_file()).expect("Failed to load config");
    let store = RunStore::open(paths.database_file()).expect("Failed to open store");
    let marker = SessionMarker::new(paths.marker_file());
    RunManager::open(store, marker, source, &config).expect("Failed to open manager")
}

fn sample(lat: f64, lon: f64, timestamp: i64) -> LocationSample {
    LocationSample::new(lat, lon, 0.0, timestamp, "gps")
}

fn collect_runs(manager: &RunManager) -> Vec<Run> {
    manager
        .query_runs()
        .collect::<Result<Vec<_>>>()
        .expect("Failed to list runs")
}

#[test]
fn single_run_records_and_reports_last_location() {
    let temp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::with_root(temp.path().to_path_buf());
    let manager = open_manager(&paths, Arc::new(ManualLocationSource::new("gps")));

    let run = manager.start_new_run().expect("start run");
    assert_eq!(run.id, 1);
    let t0 = run.start_date;

    assert!(matches!(
        manager.insert_location(sample(1.0, 1.0, t0 + 1)),
        InsertOutcome::Stored(_)
    ));
    assert!(matches!(
        manager.insert_location(sample(2.0, 2.0, t0 + 5)),
        InsertOutcome::Stored(_)
    ));

    let last = manager
        .get_last_location_for_run(1)
        .expect("query last location")
        .expect("last location");
    assert_eq!(last.timestamp, t0 + 5);
    assert_eq!(last.latitude, 2.0);
    assert_eq!(last.longitude, 2.0);

    manager.stop_run().expect("stop run");
    assert!(!manager.is_tracking_run());
    assert_eq!(collect_runs(&manager), vec![run]);
}

#[test]
fn session_survives_restart_and_stops_cleanly() {
    let temp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::with_root(temp.path().to_path_buf());
    let source = Arc::new(ManualLocationSource::new("gps"));

    let run = {
        let manager = open_manager(&paths, source.clone());
        let run = manager.start_new_run().expect("start run");
        assert!(matches!(
            manager.insert_location(sample(1.0, 1.0, run.start_date + 1)),
            InsertOutcome::Stored(_)
        ));
        run
    };

    let manager = open_manager(&paths, source.clone());
    assert!(manager.is_tracking_run());
    assert!(manager.is_tracking(&run));
    assert!(manager.is_delivering());

    assert!(source.push(sample(2.0, 2.0, run.start_date + 2)));
    manager.stop_run().expect("stop run");

    assert_eq!(
        manager.store().count_locations(Some(run.id)).expect("count"),
        2
    );

    drop(manager);
    let reopened = open_manager(&paths, source);
    assert!(!reopened.is_tracking_run());
    assert!(reopened.get_current_run().expect("current run").is_none());
}

#[test]
fn idle_samples_do_not_change_location_count() {
    let temp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::with_root(temp.path().to_path_buf());
    let manager = open_manager(&paths, Arc::new(ManualLocationSource::new("gps")));

    let run = manager.start_new_run().expect("start run");
    manager.insert_location(sample(1.0, 1.0, run.start_date));
    manager.stop_run().expect("stop run");

    let before = manager.store().count_locations(None).expect("count");
    assert_eq!(
        manager.insert_location(sample(3.0, 3.0, run.start_date + 10)),
        InsertOutcome::Discarded
    );
    assert_eq!(manager.store().count_locations(None).expect("count"), before);
}

#[test]
fn runs_are_listed_by_start_date() {
    let temp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::with_root(temp.path().to_path_buf());
    let manager = open_manager(&paths, Arc::new(ManualLocationSource::new("gps")));

    for start_date in [500, 100, 300, 100, 200] {
        manager
            .store()
            .insert_run(&Run::with_start_date(start_date))
            .expect("insert run");
    }
    let current = manager.start_new_run().expect("start run");

    let runs = collect_runs(&manager);
    assert_eq!(runs.len(), 6);
    assert!(runs
        .windows(2)
        .all(|pair| pair[0].start_date <= pair[1].start_date));
    assert_eq!(runs.last().map(|run| run.id), Some(current.id));
}

#[test]
fn second_start_is_rejected_while_tracking() {
    let temp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::with_root(temp.path().to_path_buf());
    let manager = open_manager(&paths, Arc::new(ManualLocationSource::new("gps")));

    let run = manager.start_new_run().expect("start run");
    let err = manager.start_new_run().expect_err("second start");
    assert!(matches!(err, TrackerError::AlreadyTracking { run_id } if run_id == run.id));

    manager.stop_run().expect("stop run");
    let next = manager.start_new_run().expect("start after stop");
    assert_ne!(next.id, run.id);
}

#[test]
fn stale_marker_is_dropped_on_open() {
    let temp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::with_root(temp.path().to_path_buf());
    SessionMarker::new(paths.marker_file())
        .store(17)
        .expect("write marker");

    let manager = open_manager(&paths, Arc::new(ManualLocationSource::new("gps")));
    assert!(!manager.is_tracking_run());
    assert_eq!(
        SessionMarker::new(paths.marker_file()).load().expect("load marker"),
        None
    );
}

#[test]
fn replayed_track_is_stored_in_order() {
    let temp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::with_root(temp.path().to_path_buf());
    fs_err::create_dir_all(paths.root()).expect("create root");
    fs_err::write(
        paths.config_file(),
        "[session]\nseed_from_last_known = false\n",
    )
    .expect("write config");

    let track = (1..=10)
        .map(|i| sample(f64::from(i), f64::from(i), i64::from(i) * 1_000))
        .collect();
    let source = Arc::new(
        ReplayLocationSource::from_samples(track, "gps").with_interval(Duration::from_millis(1)),
    );
    let manager = open_manager(&paths, source.clone());

    let run = manager.start_new_run().expect("start run");
    source.wait();
    manager.stop_run().expect("stop run");

    assert_eq!(
        manager.store().count_locations(Some(run.id)).expect("count"),
        10
    );
    let last = manager
        .get_last_location_for_run(run.id)
        .expect("query")
        .expect("last");
    assert_eq!(last.timestamp, 10_000);
    assert_eq!(last.run_id, Some(run.id));
}

#[test]
fn replay_longer_than_queue_keeps_every_sample() {
    let temp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::with_root(temp.path().to_path_buf());
    fs_err::create_dir_all(paths.root()).expect("create root");
    fs_err::write(
        paths.config_file(),
        "[session]\nseed_from_last_known = false\n\n[delivery]\nqueue_capacity = 4\n",
    )
    .expect("write config");

    let track = (1..=600)
        .map(|i| sample(f64::from(i) / 1_000.0, 0.0, i64::from(i)))
        .collect();
    let source = Arc::new(
        ReplayLocationSource::from_samples(track, "gps").with_interval(Duration::ZERO),
    );
    let manager = open_manager(&paths, source.clone());

    let run = manager.start_new_run().expect("start run");
    source.wait();
    manager.stop_run().expect("stop run");

    assert_eq!(
        manager.store().count_locations(Some(run.id)).expect("count"),
        600
    );
    let last = manager
        .get_last_location_for_run(run.id)
        .expect("query")
        .expect("last");
    assert_eq!(last.timestamp, 600);
}

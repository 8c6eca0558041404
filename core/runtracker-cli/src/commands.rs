//! Subcommand implementations. Output goes to the writer passed in, as text or
//! (with `--json`) as pretty-printed JSON.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use runtracker_core::{
    format_signed_duration, now_millis, InsertOutcome, LocationSample, LocationSource,
    ManualLocationSource, ProviderPolicy, ReplayLocationSource, Run, RunManager, RunStore,
    SessionMarker, StoragePaths, TrackerConfig, TrackerError,
};

use crate::Commands;

const NONE_LABEL: &str = "<<NONE>>";
const TRACKING_PREFIX: &str = "[Tracking] ";

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Location was not stored")]
    LocationNotStored,

    #[error("Failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;

/// Paths and configuration shared by every command.
pub struct Context {
    pub paths: StoragePaths,
    pub config: TrackerConfig,
    /// Why `config.toml` was ignored, if it was.
    pub config_error: Option<TrackerError>,
}

impl Context {
    pub fn load() -> Result<Self, TrackerError> {
        Ok(Self::for_paths(StoragePaths::resolve()?))
    }

    pub fn for_paths(paths: StoragePaths) -> Self {
        let (config, config_error) = match TrackerConfig::load(&paths.config_file()) {
            Ok(config) => (config, None),
            Err(err) => (TrackerConfig::default(), Some(err)),
        };
        let paths = paths.apply_config(&config);
        Self {
            paths,
            config,
            config_error,
        }
    }

    fn manual_source(&self) -> Arc<ManualLocationSource> {
        Arc::new(ManualLocationSource::new(self.config.provider.default.clone()))
    }

    /// A replayed track stands in for the test provider when one is preferred.
    fn replay_provider(&self) -> String {
        let policy = ProviderPolicy::from_config(&self.config.provider);
        policy.select(|name| name == policy.test_provider)
    }

    fn open_manager(&self, source: Arc<dyn LocationSource>) -> CliResult<Arc<RunManager>> {
        // Nothing delivers between invocations, so there is no subscription to
        // resume; replay in particular must not start playing into an old run.
        let mut config = self.config.clone();
        config.session.resume_on_start = false;

        let store = RunStore::open(self.paths.database_file())?;
        let marker = SessionMarker::new(self.paths.marker_file());
        Ok(RunManager::open(store, marker, source, &config)?)
    }
}

pub fn run(context: &Context, command: Commands, json: bool, out: &mut dyn Write) -> CliResult<()> {
    match command {
        Commands::Start { lat, lon, alt } => start(context, lat.zip(lon), alt, json, out),
        Commands::Stop => stop(context, json, out),
        Commands::Status => status(context, json, out),
        Commands::Record {
            lat,
            lon,
            alt,
            provider,
            timestamp,
        } => {
            let provider = provider.unwrap_or_else(|| context.config.provider.default.clone());
            let timestamp = timestamp.unwrap_or_else(now_millis);
            let sample = LocationSample::new(lat, lon, alt, timestamp, provider);
            record(context, sample, json, out)
        }
        Commands::List => list(context, json, out),
        Commands::Show { id } => show(context, id, json, out),
        Commands::Replay { file, interval_ms } => {
            replay(context, &file, Duration::from_millis(interval_ms), json, out)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Views
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RunView {
    id: i64,
    start_date: i64,
    start_time: Option<String>,
    tracking: bool,
}

impl RunView {
    fn new(run: &Run, tracking: bool) -> Self {
        Self {
            id: run.id,
            start_date: run.start_date,
            start_time: run.start_time().map(|time| time.to_rfc3339()),
            tracking,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunDetail {
    #[serde(flatten)]
    run: RunView,
    duration_seconds: i64,
    duration: String,
    sample_count: u64,
    last_location: Option<LocationSample>,
}

#[derive(Debug, Serialize)]
struct RecordResult {
    outcome: &'static str,
    run_id: Option<i64>,
    location_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ReplayResult {
    run_id: i64,
    samples: usize,
    stored: u64,
}

fn write_json(out: &mut dyn Write, value: &impl Serialize) -> CliResult<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|time| {
        time.with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    })
    .unwrap_or_else(|| NONE_LABEL.to_string())
}

fn list_line(run: &Run, tracking: bool) -> String {
    let prefix = if tracking { TRACKING_PREFIX } else { "" };
    format!("{prefix}Run {} started {}", run.id, format_time(run.start_time()))
}

fn location_line(sample: &LocationSample) -> String {
    format!(
        "{:.6}, {:.6} (alt {:.1} m, {}) at {}",
        sample.latitude,
        sample.longitude,
        sample.altitude,
        sample.provider,
        format_time(sample.time())
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn start(
    context: &Context,
    fix: Option<(f64, f64)>,
    alt: Option<f64>,
    json: bool,
    out: &mut dyn Write,
) -> CliResult<()> {
    let source = context.manual_source();
    if let Some((lat, lon)) = fix {
        let provider = source.provider();
        source.set_last_known(Some(LocationSample::new(
            lat,
            lon,
            alt.unwrap_or(0.0),
            now_millis(),
            provider,
        )));
    }

    let manager = context.open_manager(source)?;
    let run = manager.start_new_run()?;

    if json {
        write_json(out, &RunView::new(&run, true))
    } else {
        writeln!(
            out,
            "Started run {} at {}",
            run.id,
            format_time(run.start_time())
        )?;
        Ok(())
    }
}

fn stop(context: &Context, json: bool, out: &mut dyn Write) -> CliResult<()> {
    let manager = context.open_manager(context.manual_source())?;
    let previous = manager.current_run_id();
    manager.stop_run()?;

    if json {
        return write_json(out, &serde_json::json!({ "stopped_run_id": previous }));
    }
    match previous {
        Some(run_id) => writeln!(out, "Stopped run {run_id}")?,
        None => writeln!(out, "No run in progress")?,
    }
    Ok(())
}

fn status(context: &Context, json: bool, out: &mut dyn Write) -> CliResult<()> {
    let manager = context.open_manager(context.manual_source())?;
    let status = manager.status()?;

    if json {
        return write_json(out, &status);
    }
    match &status.current_run {
        Some(run) => writeln!(
            out,
            "Current run: {} (started {})",
            run.id,
            format_time(run.start_time())
        )?,
        None => writeln!(out, "Current run: {NONE_LABEL}")?,
    }
    let state = if status.tracking { "started" } else { "stopped" };
    writeln!(out, "Tracking: {state}")?;
    Ok(())
}

fn record(context: &Context, sample: LocationSample, json: bool, out: &mut dyn Write) -> CliResult<()> {
    let manager = context.open_manager(context.manual_source())?;
    let run_id = manager.current_run_id();
    let outcome = manager.insert_location(sample);

    let result = match outcome {
        InsertOutcome::Stored(location_id) => RecordResult {
            outcome: "stored",
            run_id,
            location_id: Some(location_id),
        },
        InsertOutcome::Discarded => RecordResult {
            outcome: "discarded",
            run_id: None,
            location_id: None,
        },
        InsertOutcome::Failed => return Err(CliError::LocationNotStored),
    };

    if json {
        return write_json(out, &result);
    }
    match (result.run_id, result.location_id) {
        (Some(run_id), Some(location_id)) => {
            writeln!(out, "Recorded location {location_id} for run {run_id}")?
        }
        _ => writeln!(out, "No run in progress; location discarded")?,
    }
    Ok(())
}

fn list(context: &Context, json: bool, out: &mut dyn Write) -> CliResult<()> {
    let manager = context.open_manager(context.manual_source())?;
    let current = manager.current_run_id();

    let mut views = Vec::new();
    for run in manager.query_runs() {
        // Rows already written stay written; the error ends the listing.
        let run = run?;
        let tracking = current == Some(run.id);
        if json {
            views.push(RunView::new(&run, tracking));
        } else {
            writeln!(out, "{}", list_line(&run, tracking))?;
        }
    }

    if json {
        write_json(out, &views)
    } else {
        Ok(())
    }
}

fn show(context: &Context, id: i64, json: bool, out: &mut dyn Write) -> CliResult<()> {
    let manager = context.open_manager(context.manual_source())?;
    let run = manager.get_run(id)?.ok_or(TrackerError::RunNotFound(id))?;
    let tracking = manager.is_tracking(&run);
    let sample_count = manager.store().count_locations(Some(run.id))?;
    let last_location = manager.get_last_location_for_run(run.id)?;
    let duration_seconds = run.duration_seconds(now_millis());

    let detail = RunDetail {
        run: RunView::new(&run, tracking),
        duration_seconds,
        duration: format_signed_duration(duration_seconds),
        sample_count,
        last_location,
    };

    if json {
        return write_json(out, &detail);
    }

    let suffix = if tracking { " [Tracking]" } else { "" };
    writeln!(out, "Run {}{suffix}", run.id)?;
    writeln!(out, "  Started:   {}", format_time(run.start_time()))?;
    writeln!(out, "  Duration:  {}", detail.duration)?;
    writeln!(out, "  Samples:   {}", detail.sample_count)?;
    match &detail.last_location {
        Some(sample) => writeln!(out, "  Last fix:  {}", location_line(sample))?,
        None => writeln!(out, "  Last fix:  {NONE_LABEL}")?,
    }
    Ok(())
}

fn replay(
    context: &Context,
    file: &Path,
    interval: Duration,
    json: bool,
    out: &mut dyn Write,
) -> CliResult<()> {
    let source = Arc::new(
        ReplayLocationSource::from_file(file, context.replay_provider())?.with_interval(interval),
    );
    if source.is_empty() {
        tracing::warn!(file = %file.display(), "Track file has no samples");
    }

    let manager = context.open_manager(source.clone())?;
    let run = manager.start_new_run()?;
    source.wait();
    manager.stop_run()?;

    let result = ReplayResult {
        run_id: run.id,
        samples: source.len(),
        stored: manager.store().count_locations(Some(run.id))?,
    };

    if json {
        return write_json(out, &result);
    }
    writeln!(
        out,
        "Replayed {} samples into run {} ({} stored)",
        result.samples, result.run_id, result.stored
    )?;
    Ok(())
}

//! `objfusion` CLI: scenario runs, replay evaluation, a live threaded run and
//! config inspection.

mod sink;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fusion_core::{
    config::EngineConfig,
    engine::{MemorySink, ObjectSink, TrackerEngine},
    runtime::{self, event_channel, Clock, MonotonicClock},
    transform::TransformBuffer,
};
use sim::{
    playback::{play, PlaybackOptions, PlaybackReport},
    replay::{load_replay, save_replay, ReplayLog},
    scenarios::{Scenario, ScenarioKind},
};
use sink::JsonLinesSink;
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    thread,
    time::Duration,
};

#[derive(Parser)]
#[command(name = "objfusion", about = "Multi-channel object fusion CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a named scenario, track it offline and report metrics.
    RunScenario {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Engine configuration (TOML); defaults otherwise
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Write every published track set as JSON lines
        #[arg(long)]
        tracks: Option<PathBuf>,
        /// Also save the full replay log
        #[arg(long)]
        save_replay: Option<PathBuf>,
    },
    /// Load and replay a previously recorded scenario log.
    Replay {
        /// Path to replay JSON file
        input: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        tracks: Option<PathBuf>,
    },
    /// Stream a scenario in real time through the threaded engine loop.
    Live {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSON-lines output; stdout if omitted
        #[arg(long)]
        tracks: Option<PathBuf>,
    },
    /// Print the effective engine configuration as TOML.
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::RunScenario {
            scenario,
            seed,
            config,
            output,
            tracks,
            save_replay: save_path,
        } => {
            let base = load_config(config.as_deref())?;
            run_scenario(scenario, seed, base, output.as_deref(), tracks.as_deref(), save_path.as_deref())?;
        }
        Commands::Replay {
            input,
            config,
            output,
            tracks,
        } => {
            let base = load_config(config.as_deref())?;
            run_replay(&input, base, output.as_deref(), tracks.as_deref())?;
        }
        Commands::Live {
            scenario,
            seed,
            config,
            tracks,
        } => {
            let base = load_config(config.as_deref())?;
            run_live(scenario, seed, base, tracks.as_deref())?;
        }
        Commands::PrintConfig { config } => {
            let config = load_config(config.as_deref())?;
            // channel tables are filled per scenario, so an empty set is fine here
            if let Err(e) = config.validate() {
                tracing::warn!(error = %e, "configuration is incomplete");
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading engine config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn run_scenario(
    kind: ScenarioKind,
    seed: u64,
    base: EngineConfig,
    output_path: Option<&Path>,
    tracks_path: Option<&Path>,
    replay_path: Option<&Path>,
) -> Result<()> {
    let scenario = Scenario::build(kind, seed);
    println!(
        "Running scenario '{}' (seed={}, duration={:.0}s, {} sensors)...",
        scenario.name,
        seed,
        scenario.duration,
        scenario.sensors.len()
    );

    let log = ReplayLog::record(&scenario);
    if let Some(rpath) = replay_path {
        save_replay(&log, rpath)?;
        println!("Replay saved to {}", rpath.display());
    }
    evaluate(&log, base, output_path, tracks_path)
}

fn run_replay(
    input: &Path,
    base: EngineConfig,
    output_path: Option<&Path>,
    tracks_path: Option<&Path>,
) -> Result<()> {
    let log = load_replay(input)?;
    println!(
        "Replaying '{}' ({} batches)...",
        log.scenario_name,
        log.batches.len()
    );
    evaluate(&log, base, output_path, tracks_path)
}

fn evaluate(
    log: &ReplayLog,
    base: EngineConfig,
    output_path: Option<&Path>,
    tracks_path: Option<&Path>,
) -> Result<()> {
    let start = std::time::Instant::now();
    let report = play(log, base, &PlaybackOptions::default())?;
    let elapsed = start.elapsed();
    print_report(&report, elapsed);

    if let Some(tpath) = tracks_path {
        let mut sink = JsonLinesSink::new(BufWriter::new(File::create(tpath)?));
        for output in &report.outputs {
            sink.publish(output);
        }
        sink.flush()?;
        println!("Tracks saved to {}", tpath.display());
    }

    if let Some(opath) = output_path {
        let json = serde_json::json!({
            "report": report,
            "elapsed_s": elapsed.as_secs_f64(),
            "rmse_position": report.metrics.rmse_position(),
            "rmse_speed": report.metrics.rmse_speed(),
            "precision": report.metrics.precision(),
            "recall": report.metrics.recall(),
            "class_accuracy": report.metrics.class_accuracy(),
        });
        std::fs::write(opath, serde_json::to_string_pretty(&json)?)?;
        println!("Metrics saved to {}", opath.display());
    }
    Ok(())
}

fn print_report(report: &PlaybackReport, elapsed: Duration) {
    let m = &report.metrics;
    println!(
        "Done: {} batches processed ({} skipped), {} published frames, {} tracks alive, elapsed={:.2}s",
        report.stats.batches_processed,
        report.stats.batches_skipped,
        report.published_frames,
        report.final_track_count,
        elapsed.as_secs_f64(),
    );
    println!(
        "Tracks: {} spawned, {} confirmed, {} pruned",
        report.stats.tracks_spawned, report.stats.tracks_confirmed, report.stats.tracks_pruned,
    );
    println!(
        "Metrics: RMSE pos={:.3}m speed={:.3}m/s  precision={:.3} recall={:.3}  class acc={:.3}  ID switches={}",
        m.rmse_position(),
        m.rmse_speed(),
        m.precision(),
        m.recall(),
        m.class_accuracy(),
        m.id_switches,
    );
}

/// Producer thread replays the recorded batches on the wall clock while the
/// engine runs its event loop on this thread.
fn run_live(kind: ScenarioKind, seed: u64, base: EngineConfig, tracks_path: Option<&Path>) -> Result<()> {
    let scenario = Scenario::build(kind, seed);
    let log = ReplayLog::record(&scenario);
    let config = log.engine_config(base);

    let mut tf = TransformBuffer::new(2.0);
    for spec in &log.sensors {
        tf.set_static(&log.ego_frame_id, &spec.frame_id, spec.mount);
    }
    let transforms = Arc::new(RwLock::new(tf));

    let sink: Box<dyn ObjectSink> = match tracks_path {
        Some(path) => Box::new(JsonLinesSink::new(BufWriter::new(File::create(path)?))),
        None => Box::new(JsonLinesSink::new(std::io::stdout())),
    };
    let tentative = MemorySink::with_subscribers(usize::from(config.publish_tentative_objects));
    let tentative_frames = tentative.handle();
    let mut engine =
        TrackerEngine::new(config, Arc::clone(&transforms), sink)?.with_tentative_sink(Box::new(tentative));

    eprintln!(
        "Streaming scenario '{}' for {:.0}s...",
        log.scenario_name, log.duration
    );
    let (handle, events) = event_channel();
    let clock = MonotonicClock::new();
    let producer = thread::spawn(move || -> Result<()> {
        let mut poses = log.ego_poses.iter().peekable();
        for timed in &log.batches {
            let wait = timed.arrival - clock.now();
            if wait > 0.0 {
                thread::sleep(Duration::from_secs_f64(wait));
            }
            {
                let mut tf = transforms
                    .write()
                    .map_err(|_| anyhow!("transform buffer poisoned"))?;
                while let Some((t, pose)) = poses.next_if(|(t, _)| *t <= timed.arrival) {
                    tf.set_transform(&log.world_frame_id, &log.ego_frame_id, *t, *pose);
                }
            }
            handle.send_detections(timed.channel, timed.batch.clone())?;
        }
        handle.shutdown()?;
        Ok(())
    });

    runtime::run(&mut engine, &clock, &events);
    producer
        .join()
        .map_err(|_| anyhow!("producer thread panicked"))??;

    let stats = engine.stats();
    let tentative_count = tentative_frames.lock().map(|f| f.len()).unwrap_or(0);
    eprintln!(
        "Done: {} cycles, {} batches processed, {} published ({} tentative sets), last cycle {}µs",
        stats.cycles, stats.batches_processed, stats.publishes, tentative_count, stats.last_cycle_us,
    );
    Ok(())
}

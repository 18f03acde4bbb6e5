use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::Parser;
use flate2::read::GzDecoder;
use serde::Serialize;

use accident_detector_rs::synthetic::{RecordedEvent, Scenario};
use accident_detector_rs::{DetectorConfig, GapPolicy, Pattern, PatternScorer, SampleAligner};

/// Run recorded or synthetic sensor events through the detector offline
#[derive(Parser, Debug)]
struct Args {
    /// Path to a JSON[.gz] array of recorded sensor/location events
    #[arg(long, conflicts_with = "scenario")]
    log: Option<PathBuf>,

    /// Replay one synthetic scenario
    #[arg(long, value_enum)]
    scenario: Option<Scenario>,

    /// Replay every synthetic scenario and print one result each
    #[arg(long, default_value_t = false, conflicts_with_all = ["log", "scenario"])]
    all_scenarios: bool,

    /// Score above which an alert is raised
    #[arg(long, default_value = "0.5")]
    threshold: f64,

    /// Alignment tolerance between accel and gyro samples (ms)
    #[arg(long, default_value = "25")]
    tolerance_ms: u64,

    #[arg(long, value_enum, default_value = "zero-pad")]
    gap_policy: GapPolicy,

    /// Write the results as JSON instead of only printing them
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct ReplayAlert {
    at_ms: u64,
    score: f64,
    patterns: Vec<Pattern>,
    max_accel_spike: f64,
    max_gyro: f64,
    speed_drop_kmh: f64,
    final_stillness: f64,
}

#[derive(Serialize)]
struct ReplayResult {
    source: String,
    sensor_samples: usize,
    location_fixes: usize,
    stale_samples: u64,
    evaluations: usize,
    peak_score: f64,
    alerts: Vec<ReplayAlert>,
}

fn load_log(path: &Path) -> anyhow::Result<Vec<RecordedEvent>> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        let reader = BufReader::new(gz);
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn run_once(source: String, events: &[RecordedEvent], config: &DetectorConfig) -> ReplayResult {
    let mut aligner = SampleAligner::from_config(config);
    let scorer = PatternScorer::new();
    let mut result = ReplayResult {
        source,
        sensor_samples: 0,
        location_fixes: 0,
        stale_samples: 0,
        evaluations: 0,
        peak_score: 0.0,
        alerts: Vec::new(),
    };

    for event in events {
        match event {
            RecordedEvent::Location(fix) => {
                result.location_fixes += 1;
                if let Some(speed) = fix.speed_mps {
                    aligner.set_speed_kmh(speed * 3.6);
                }
            }
            RecordedEvent::Sensor(sample) => {
                result.sensor_samples += 1;
                if aligner.ingest(sample).is_err() || !aligner.is_full() {
                    continue;
                }
                let Some(window) = aligner.snapshot() else {
                    continue;
                };

                let assessment = scorer.assess(&window);
                result.evaluations += 1;
                result.peak_score = result.peak_score.max(assessment.score);

                if assessment.exceeds(config.alert_threshold) {
                    println!(
                        "  ALERT at {}ms: score {:.2} {:?}",
                        sample.timestamp_ms, assessment.score, assessment.fired
                    );
                    result.alerts.push(ReplayAlert {
                        at_ms: sample.timestamp_ms,
                        score: assessment.score,
                        patterns: assessment.fired,
                        max_accel_spike: assessment.metrics.max_accel_spike,
                        max_gyro: assessment.metrics.max_gyro,
                        speed_drop_kmh: assessment.metrics.speed_drop,
                        final_stillness: assessment.metrics.final_stillness,
                    });
                    // A live session stops sampling while the alert is pending
                    aligner.clear();
                }
            }
        }
    }

    result.stale_samples = aligner.stale_samples();
    result
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = DetectorConfig {
        alert_threshold: args.threshold,
        align_tolerance_ms: args.tolerance_ms,
        gap_policy: args.gap_policy,
        ..DetectorConfig::default()
    };
    config.validate()?;

    let mut inputs = Vec::new();
    if args.all_scenarios {
        for scenario in Scenario::all() {
            inputs.push((format!("{:?}", scenario), scenario.events(0)));
        }
    } else if let Some(scenario) = args.scenario {
        inputs.push((format!("{:?}", scenario), scenario.events(0)));
    } else if let Some(log) = args.log.as_ref() {
        inputs.push((log.display().to_string(), load_log(log)?));
    } else {
        anyhow::bail!("Provide --log, --scenario or --all-scenarios");
    }

    let mut results = Vec::new();
    for (source, events) in inputs {
        println!("Replaying {} ({} events)", source, events.len());
        let result = run_once(source, &events, &config);
        println!(
            "  {} evaluations, peak score {:.2}, {} alert(s)",
            result.evaluations,
            result.peak_score,
            result.alerts.len()
        );
        results.push(result);
    }

    let json = serde_json::to_string_pretty(&results)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, json)?;
            println!("Results written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

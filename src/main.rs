use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::warn;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, sleep, MissedTickBehavior};

use accident_detector_rs::collaborators::{
    ContactResolver, HttpReportingSink, JsonContactStore, LogMessageSink, LogNotifier, NotificationSink,
    TokioBackgroundScheduler,
};
use accident_detector_rs::sensors::{DriveScript, SimulatedSensors};
use accident_detector_rs::synthetic::Scenario;
use accident_detector_rs::{Collaborators, DetectionEngine, DetectorConfig, DetectorError, DetectorState};

#[derive(Parser, Debug)]
#[command(name = "accident_detector")]
#[command(about = "Rust accident detector - crash pattern scoring with emergency escalation", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file (missing fields use defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON contact book with emergency contacts and medical info
    #[arg(long)]
    contacts: Option<PathBuf>,

    /// Override the incident report endpoint
    #[arg(long)]
    report_url: Option<String>,

    /// Override the user id sent with reports
    #[arg(long)]
    user_id: Option<String>,

    /// Play a synthetic scenario into the simulated sensors
    #[arg(long, value_enum)]
    scenario: Option<Scenario>,

    /// Seconds of cruising before the scenario starts
    #[arg(long, default_value = "10")]
    inject_after: u64,

    /// Read real sensors through termux-sensor when available
    #[arg(long)]
    device: bool,

    /// Do not keep a background monitor running
    #[arg(long)]
    no_background: bool,

    /// Output directory
    #[arg(long, default_value = "accident_detector_sessions")]
    output_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DetectorConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => DetectorConfig::default(),
    };
    if let Some(url) = &args.report_url {
        config.report_url = url.clone();
    }
    if let Some(user_id) = &args.user_id {
        config.user_id = user_id.clone();
    }
    if let Some(path) = &args.contacts {
        config.contacts_path = Some(path.clone());
    }
    config.validate()?;

    println!("[{}] Accident Detector RS Starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Sampling: {} Hz, threshold {:.2}", config.sampling_rate_hz, config.alert_threshold);
    println!("  Gap Policy: {:?}", config.gap_policy);
    println!("  Scenario: {:?} after {}s", args.scenario, args.inject_after);
    println!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)?;

    let engine = build_engine(&config, &args)?;
    match engine.start_monitoring().await {
        Ok(()) => {}
        Err(DetectorError::NoEmergencyContacts) => {
            eprintln!("No emergency contacts configured. Pass --contacts <book.json> with at least one contact.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }
    if args.no_background {
        engine.disable_background();
    }

    println!("[{}] Monitoring. Commands: ok | help | restart | stop", ts_now());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status_timer = interval(Duration::from_secs(2));
    status_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let status_path = Path::new(&args.output_dir).join("live_status.json");

    let deadline = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(&engine, line.trim()).await? {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = status_timer.tick() => {
                let status = engine.status();
                if let Err(e) = status.save(&status_path) {
                    warn!("[ENGINE] Could not write {}: {}", status_path.display(), e);
                }
                if let Some(remaining) = status.countdown_remaining {
                    println!("[{}] ALERT #{} - escalating in {}s (type 'ok' to cancel)",
                             ts_now(), status.active_alert_id.unwrap_or_default(), remaining);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
            _ = &mut deadline => {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
        }
    }

    engine.stop();
    let final_status = engine.status();
    let final_path = Path::new(&args.output_dir).join("live_status_final.json");
    final_status.save(&final_path)?;

    println!("\n=== Final Stats ===");
    println!("Accel samples: {}", final_status.accel_samples);
    println!("Gyro samples: {}", final_status.gyro_samples);
    println!("Location fixes: {}", final_status.location_fixes);
    println!("Evaluations: {} ({} skipped)", final_status.evaluations, final_status.skipped_evaluations);
    println!("Alerts: {} raised, {} resolved, {} escalated",
             final_status.alerts_raised, final_status.resolutions, final_status.escalations);
    println!("Reports: {} sent, {} failed", final_status.reporting.reports_sent, final_status.reporting.reports_failed);
    println!("Peak G-force: {:.2}G", final_status.max_g_force);
    println!("Status written to {}", final_path.display());

    Ok(())
}

fn build_engine(config: &DetectorConfig, args: &Args) -> Result<DetectionEngine> {
    let script = match args.scenario {
        Some(scenario) => DriveScript::with_scenario(scenario, args.inject_after * 1000),
        None => DriveScript::cruise(),
    };
    let sensors = Arc::new(if args.device {
        SimulatedSensors::with_device(script)?
    } else {
        SimulatedSensors::new(script)?
    });

    let contacts: Arc<dyn ContactResolver> = match &config.contacts_path {
        Some(path) => Arc::new(
            JsonContactStore::load(path).with_context(|| format!("loading contacts from {}", path.display()))?,
        ),
        None => Arc::new(JsonContactStore::default()),
    };

    let notifier: Arc<dyn NotificationSink> = Arc::new(LogNotifier);
    let background = Arc::new(TokioBackgroundScheduler::new(
        Duration::from_millis(config.background_tick_ms),
        config.notification_every_ticks,
        notifier.clone(),
    ));

    let collaborators = Collaborators {
        sensors: sensors.clone(),
        location: sensors,
        reporter: Arc::new(HttpReportingSink::new(
            config.report_url.clone(),
            Duration::from_secs(config.report_timeout_secs),
        )),
        messages: Arc::new(LogMessageSink),
        contacts,
        notifier,
        background,
    };
    Ok(DetectionEngine::new(config.clone(), collaborators)?)
}

/// Returns false when the session should end
async fn handle_command(engine: &DetectionEngine, command: &str) -> Result<bool> {
    match command {
        "" => {}
        "ok" | "ack" => {
            if engine.acknowledge() {
                println!("[{}] Alert cancelled, you are safe", ts_now());
            } else {
                println!("[{}] No active alert", ts_now());
            }
        }
        "help" => match engine.request_help().await {
            Some(prompt) => println!("[{}] Call {} at {}", ts_now(), prompt.name, prompt.tel_uri),
            None => println!("[{}] No active alert", ts_now()),
        },
        "restart" => match engine.restart() {
            Ok(()) => println!("[{}] Monitoring resumed", ts_now()),
            Err(e) if e.is_recoverable() => println!("[{}] Cannot restart from {:?}: {}", ts_now(), engine.state(), e),
            Err(e) => return Err(e.into()),
        },
        "stop" | "quit" => return Ok(false),
        "status" => {
            let status = engine.status();
            println!("[{}] {:?} | frames {} | last score {:.2} | {:.2}G",
                     ts_now(), status.state, status.frames_buffered, status.last_score, status.g_force);
        }
        other => println!("Unknown command '{}'", other),
    }
    Ok(engine.state() != DetectorState::Idle)
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

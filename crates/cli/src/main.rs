use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use controller::{
    ControlConfig, Event, EventSink, MachineController, SinkError,
};
use hazard::HazardPolicy;
use perception::{
    PerceptionSnapshot, SensorFault, SimulatedSensor, TemperatureSensor,
};

#[derive(Clone, Debug, ValueEnum)]
enum Scenario {
    /// Geared worker, nominal temperature.
    Normal,
    /// Worker loses their helmet, then leaves the station.
    MissingGear,
    /// Temperature sensor pinned over threshold with nobody present.
    OverTemp,
    /// A second hazard lands while the restart countdown is running.
    HazardMidCountdown,
    /// Intermittent sensor dropout with a fully geared worker.
    SensorDropout,
    /// Operator stop and restart, including a repeated (no-op) stop.
    ManualOverride,
}

#[derive(Parser, Debug)]
#[command(
    name = "vision-guard",
    version,
    about = "Workstation hazard monitoring and machine-control simulation"
)]
struct Args {
    #[arg(value_enum, long, default_value = "normal")]
    scenario: Scenario,

    /// Number of frames to process (one frame per simulated second)
    #[arg(long, default_value_t = 40)]
    frames: u64,

    /// Temperature threshold (°C) above which a hazard is raised
    #[arg(long, default_value_t = 45.0)]
    temp_threshold: f64,

    /// Seconds of safe observation before auto-restart
    #[arg(long, default_value_t = 10)]
    restart_delay: u32,

    /// Minimum seconds between repeated hazard alerts
    #[arg(long, default_value_t = 3)]
    alert_cooldown: u64,

    /// RNG seed for deterministic runs
    #[arg(long, default_value_t = 12345)]
    seed: u64,
}

/// JSONL audit trace on stdout, one record per line, keyed by an
/// auto-incrementing id.
struct JsonlSink {
    seq: u64,
}

#[derive(serde::Serialize)]
struct Row<'a> {
    id: u64,
    #[serde(flatten)]
    event: &'a Event,
}

impl EventSink for JsonlSink {
    fn emit(&mut self, event: Event) -> Result<(), SinkError> {
        self.seq += 1;
        let row = Row {
            id: self.seq,
            event: &event,
        };
        let line = serde_json::to_string(&row).map_err(|e| SinkError {
            reason: e.to_string(),
        })?;
        println!("{line}");
        Ok(())
    }
}

/// Coil-write stand-in; a real deployment points this at the PLC link.
struct LoggingActuator;

impl controller::Actuator for LoggingActuator {
    fn set_running(&mut self, running: bool) -> Result<(), controller::ActuatorError> {
        tracing::info!(running, "actuator coil write");
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let policy = HazardPolicy {
        temperature_threshold_c: args.temp_threshold,
        ..Default::default()
    };
    let cfg = ControlConfig {
        restart_delay_s: args.restart_delay,
        alert_cooldown: Duration::from_secs(args.alert_cooldown),
    };

    // InvalidPolicy is the only fatal startup error.
    let mut ctl = MachineController::new(policy, cfg, LoggingActuator, JsonlSink { seq: 0 })?;

    let mut sensor = SimulatedSensor::new(args.seed);
    sensor.swing_c = 10.0;

    let start = Instant::now();
    ctl.begin_session();

    for frame in 1..=args.frames {
        let now = start + Duration::from_secs(frame);

        apply_scenario_frame(&args.scenario, frame, &mut sensor);
        let labels = scenario_labels(&args.scenario, frame);
        let snapshot =
            PerceptionSnapshot::from_labels(frame, labels, sensor.read_temperature());

        ctl.on_snapshot(&snapshot, now);

        if let Scenario::ManualOverride = args.scenario {
            match frame {
                10 => {
                    let outcome = ctl.manual_stop(now);
                    tracing::info!(?outcome, "operator stop");
                }
                12 => {
                    // Repeated stop: reported no-op.
                    let outcome = ctl.manual_stop(now);
                    tracing::info!(?outcome, "operator stop (again)");
                }
                25 => {
                    let outcome = ctl.manual_start(now);
                    tracing::info!(?outcome, "operator start");
                }
                _ => {}
            }
        }

        // One frame per second, so the countdown ticks once per frame.
        ctl.tick_restart(now);
    }

    ctl.end_session(start + Duration::from_secs(args.frames + 1));
    Ok(())
}

/// Raw detector labels for the frame; synonym folding happens in `perception`.
fn scenario_labels(scenario: &Scenario, frame: u64) -> Vec<&'static str> {
    const GEARED: &[&str] = &["person", "hard_hat", "gloves", "goggles", "safety vest"];
    const NO_HELMET: &[&str] = &["person", "gloves", "goggles", "vest"];
    const EMPTY: &[&str] = &[];

    let labels: &[&str] = match scenario {
        Scenario::Normal | Scenario::SensorDropout | Scenario::ManualOverride => GEARED,
        Scenario::MissingGear => {
            if (5..15).contains(&frame) {
                NO_HELMET
            } else if frame < 5 {
                GEARED
            } else {
                EMPTY
            }
        }
        Scenario::OverTemp => EMPTY,
        Scenario::HazardMidCountdown => {
            if (5..10).contains(&frame) {
                NO_HELMET
            } else if frame < 5 {
                GEARED
            } else {
                EMPTY
            }
        }
    };
    labels.to_vec()
}

fn apply_scenario_frame(scenario: &Scenario, frame: u64, sensor: &mut SimulatedSensor) {
    match scenario {
        Scenario::OverTemp => {
            // Pin the sensor over threshold for a window, then release.
            sensor.fault = if (10..20).contains(&frame) {
                SensorFault::Stuck { value: 55.0 }
            } else {
                SensorFault::None
            };
        }
        Scenario::HazardMidCountdown => {
            // Over-temperature spike lands while the countdown is running.
            sensor.fault = if (16..18).contains(&frame) {
                SensorFault::Stuck { value: 52.0 }
            } else {
                SensorFault::None
            };
        }
        Scenario::SensorDropout => {
            sensor.fault = SensorFault::DropoutEvery { n: 3 };
        }
        _ => {}
    }
}

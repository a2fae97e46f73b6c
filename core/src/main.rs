//! ROTORNAV: attitude and navigation filter simulation and replay tool.
//!
//! Three modes:
//!
//! - `ahrs-sim`: fly the rigid-body truth model, sample it through noisy
//!   synthetic sensors, and run the 7-state attitude filter against it.
//! - `ins-sim`: same harness, driving the 14-state GPS-aided filter with a
//!   1 Hz GPS fix and a 5 Hz compass on top of the IMU stream.
//! - `replay`: push a recorded sensor log (one `$GP..` sentence per line)
//!   through the fusion scheduler and the GPS-aided filter.
//!
//! Each mode writes a per-step CSV record of truth (where available) and
//! estimate for offline analysis, and can optionally stream the estimated
//! state to a ground station over UDP.

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use rotornav::ahrs::{Ahrs, AhrsConfig};
use rotornav::fusion::{Fusion, FusionConfig, LogSource, SourceStats};
use rotornav::ins::{Ins, InsConfig};
use rotornav::sixdof::{MassProperties, NoiseParams, SensorSuite, SixDof};
use rotornav::telemetry::{Packet, StateLink};
use rotornav::GRAVITY;

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Attitude and navigation filter simulation and replay tool."
)]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the 7-state attitude filter against the simulated truth model
    AhrsSim(SimArgs),
    /// Run the 14-state GPS-aided filter against the simulated truth model
    InsSim(SimArgs),
    /// Replay a recorded sensor log through the fusion scheduler
    Replay(ReplayArgs),
}

#[derive(Args)]
struct SimArgs {
    /// Simulation parameters as JSON; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated flight duration, seconds
    #[arg(short, long, default_value_t = 60.0)]
    duration: f64,

    /// Output CSV path
    #[arg(short, long)]
    output: PathBuf,

    /// Random seed for the sensor noise
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Stream estimated state to this UDP address (host:port)
    #[arg(long)]
    telemetry: Option<String>,
}

#[derive(Args)]
struct ReplayArgs {
    /// Sensor log, one sentence per line
    #[arg(short, long)]
    input: PathBuf,

    /// Output CSV path
    #[arg(short, long)]
    output: PathBuf,

    /// IMU sample interval in the log, seconds
    #[arg(long, default_value_t = 0.01)]
    dt: f64,

    /// Pace the replay against the wall clock
    #[arg(long)]
    real_time: bool,

    /// Stream estimated state to this UDP address (host:port)
    #[arg(long)]
    telemetry: Option<String>,
}

/// Simulation parameters: airframe mass properties, sensor noise, and the
/// integration step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SimConfig {
    dt: f64,
    mass: f64,
    ixx: f64,
    iyy: f64,
    izz: f64,
    ixz: f64,
    accel_sigma: f64,
    gyro_sigma: f64,
    gyro_bias: [f64; 3],
    gps_position_sigma: f64,
    gps_velocity_sigma: f64,
    heading_sigma: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            dt: 0.01,
            mass: 8.0,
            ixx: 0.3,
            iyy: 0.6,
            izz: 0.7,
            ixz: 0.02,
            accel_sigma: 0.05,
            gyro_sigma: 0.005,
            gyro_bias: [0.01, -0.005, 0.002],
            gps_position_sigma: 0.4,
            gps_velocity_sigma: 0.1,
            heading_sigma: 0.02,
        }
    }
}

impl SimConfig {
    fn load(path: Option<&PathBuf>) -> Result<Self, Box<dyn Error>> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&text)?)
            }
            None => Ok(SimConfig::default()),
        }
    }

    fn mass_properties(&self) -> MassProperties {
        MassProperties {
            mass: self.mass,
            ixx: self.ixx,
            iyy: self.iyy,
            izz: self.izz,
            ixz: self.ixz,
        }
    }

    fn noise_params(&self) -> NoiseParams {
        NoiseParams {
            accel_sigma: self.accel_sigma,
            gyro_sigma: self.gyro_sigma,
            gyro_bias: Vector3::from(self.gyro_bias),
            gps_position_sigma: self.gps_position_sigma,
            gps_velocity_sigma: self.gps_velocity_sigma,
            heading_sigma: self.heading_sigma,
        }
    }
}

/// One output row of the attitude simulation.
#[derive(Debug, Serialize)]
struct AhrsRecord {
    time: f64,
    true_roll: f64,
    true_pitch: f64,
    true_yaw: f64,
    est_roll: f64,
    est_pitch: f64,
    est_yaw: f64,
    bias_p: f64,
    bias_q: f64,
    bias_r: f64,
    covariance_trace: f64,
}

/// One output row of the navigation simulation.
#[derive(Debug, Serialize)]
struct InsRecord {
    time: f64,
    true_north: f64,
    true_east: f64,
    true_down: f64,
    est_north: f64,
    est_east: f64,
    est_down: f64,
    true_yaw: f64,
    est_yaw: f64,
    est_gravity: f64,
    covariance_trace: f64,
}

/// One output row of a log replay.
#[derive(Debug, Serialize)]
struct ReplayRecord {
    time: f64,
    north: f64,
    east: f64,
    down: f64,
    roll: f64,
    pitch: f64,
    yaw: f64,
    covariance_trace: f64,
}

fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{log_level}', defaulting to 'info'");
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn open_telemetry(target: Option<&String>) -> Result<Option<StateLink>, Box<dyn Error>> {
    match target {
        Some(peer) => Ok(Some(StateLink::bind("0.0.0.0:0", peer.as_str())?)),
        None => Ok(None),
    }
}

fn send_state(
    link: &mut Option<StateLink>,
    time: f64,
    attitude: &Vector3<f64>,
    position: Option<&Vector3<f64>>,
) {
    let Some(link) = link else { return };
    let micros = (time * 1e6) as u64;

    // Transport failures mark the link not-ready; the sim keeps running.
    let _ = link.send(micros, &Packet::Attitude(*attitude));
    if let Some(position) = position {
        let _ = link.send(micros, &Packet::Position(*position));
    }
}

/// Hover with a gentle sinusoidal yaw excitation so the filters see real
/// rates without risking the pitch gimbal region.
fn flight_moment(time: f64) -> Vector3<f64> {
    Vector3::new(0.0, 0.0, 0.02 * (0.4 * time).sin())
}

fn run_ahrs_sim(args: &SimArgs) -> Result<(), Box<dyn Error>> {
    let config = SimConfig::load(args.config.as_ref())?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut truth = SixDof::new(config.mass_properties())?;
    let suite = SensorSuite::new(config.noise_params());
    let mut link = open_telemetry(args.telemetry.as_ref())?;

    let mut ahrs = Ahrs::new(
        AhrsConfig::default(),
        &truth.imu_accel(),
        &truth.pqr,
        truth.theta[2],
    );

    let mut writer = csv::Writer::from_path(&args.output)?;
    let steps = (args.duration / config.dt).round() as usize;
    info!("ahrs-sim: {steps} steps at dt={}", config.dt);

    for i in 0..steps {
        let time = i as f64 * config.dt;
        let lift = truth.hover_force(GRAVITY);
        truth.step(config.dt, GRAVITY, &lift, &flight_moment(time));

        let accel = suite.accel(&mut rng, &truth);
        let gyro = suite.gyro(&mut rng, &truth);
        ahrs.imu_propagate(&gyro, config.dt);
        let _ = ahrs.accel_correct(&accel);

        // 5 Hz compass
        if i % 20 == 0 {
            let _ = ahrs.compass_correct(suite.compass(&mut rng, &truth));
        }

        let est = ahrs.theta();
        let bias = ahrs.bias();
        writer.serialize(AhrsRecord {
            time,
            true_roll: truth.theta[0],
            true_pitch: truth.theta[1],
            true_yaw: truth.theta[2],
            est_roll: est[0],
            est_pitch: est[1],
            est_yaw: est[2],
            bias_p: bias[0],
            bias_q: bias[1],
            bias_r: bias[2],
            covariance_trace: ahrs.covariance_trace(),
        })?;
        send_state(&mut link, time, &est, None);
    }

    writer.flush()?;
    info!(
        "ahrs-sim finished: {} corrections skipped",
        ahrs.skipped_corrections()
    );
    Ok(())
}

fn run_ins_sim(args: &SimArgs) -> Result<(), Box<dyn Error>> {
    let config = SimConfig::load(args.config.as_ref())?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut truth = SixDof::new(config.mass_properties())?;
    let suite = SensorSuite::new(config.noise_params());
    let mut link = open_telemetry(args.telemetry.as_ref())?;

    let first_gyro = suite.gyro(&mut rng, &truth);
    let mut ins = Ins::new(
        InsConfig::default(),
        &truth.xyz,
        &truth.uvw,
        &truth.imu_accel(),
        &first_gyro,
        truth.theta[2],
    );

    let mut writer = csv::Writer::from_path(&args.output)?;
    let steps = (args.duration / config.dt).round() as usize;
    let compass_every = (0.2 / config.dt).round() as usize;
    let gps_every = (1.0 / config.dt).round() as usize;
    info!("ins-sim: {steps} steps at dt={}", config.dt);

    for i in 0..steps {
        let time = i as f64 * config.dt;
        let lift = truth.hover_force(GRAVITY);
        truth.step(config.dt, GRAVITY, &lift, &flight_moment(time));

        let accel = suite.accel(&mut rng, &truth);
        let gyro = suite.gyro(&mut rng, &truth);
        ins.imu_propagate(&accel, &gyro, config.dt);
        let _ = ins.accel_correct(&accel);

        if i % compass_every == 0 {
            let _ = ins.compass_correct(suite.compass(&mut rng, &truth));
        }
        if i % gps_every == 0 {
            let (position, velocity) = suite.gps(&mut rng, &truth);
            let _ = ins.gps_correct(&position, &velocity);
        }

        let est_position = ins.position();
        let est = ins.theta();
        writer.serialize(InsRecord {
            time,
            true_north: truth.xyz[0],
            true_east: truth.xyz[1],
            true_down: truth.xyz[2],
            est_north: est_position[0],
            est_east: est_position[1],
            est_down: est_position[2],
            true_yaw: truth.theta[2],
            est_yaw: est[2],
            est_gravity: ins.gravity(),
            covariance_trace: ins.covariance_trace(),
        })?;
        send_state(&mut link, time, &est, Some(&est_position));
    }

    writer.flush()?;
    info!(
        "ins-sim finished: {} corrections skipped",
        ins.skipped_corrections()
    );
    Ok(())
}

fn run_replay(args: &ReplayArgs) -> Result<(), Box<dyn Error>> {
    let mut link = open_telemetry(args.telemetry.as_ref())?;

    // Stationary start at the log origin; the first GPS fix anchors the
    // tangent plane.
    let ins = Ins::new(
        InsConfig::default(),
        &Vector3::zeros(),
        &Vector3::zeros(),
        &Vector3::new(0.0, 0.0, -GRAVITY),
        &Vector3::zeros(),
        0.0,
    );

    let mut fusion = Fusion::new(
        ins,
        FusionConfig {
            dt: args.dt,
            real_time: args.real_time,
        },
    );
    let source = fusion.add_source(Box::new(LogSource::open(&args.input, args.dt)?));

    let mut writer = csv::Writer::from_path(&args.output)?;
    info!("replaying {}", args.input.display());

    let mut stats = SourceStats::default();
    loop {
        let serviced = fusion.step_batch();
        if serviced == 0 {
            break;
        }
        // the source is deregistered once the log drains, so keep the last
        // counters we saw
        if let Some(current) = fusion.stats(source) {
            stats = current;
        }

        let position = fusion.nav().position();
        let attitude = fusion.nav().theta();
        let time = fusion.time();
        writer.serialize(ReplayRecord {
            time,
            north: position[0],
            east: position[1],
            down: position[2],
            roll: attitude[0],
            pitch: attitude[1],
            yaw: attitude[2],
            covariance_trace: fusion.nav().covariance_trace(),
        })?;
        send_state(&mut link, time, &attitude, Some(&position));
    }

    writer.flush()?;
    info!(
        "replay finished: {} accepted, {} rejected, {} stale",
        stats.accepted, stats.rejected, stats.stale
    );
    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::AhrsSim(args) => run_ahrs_sim(args),
        Command::InsSim(args) => run_ins_sim(args),
        Command::Replay(args) => run_replay(args),
    }
}

fn main() {
    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}

//! Multi-rate sensor fusion scheduler.
//!
//! Sensor data arrives as ASCII lines from heterogeneous sources at wildly
//! different cadences: IMU samples at the filter rate, compass headings a few
//! times a second, GPS fixes at 1 Hz, radio frames whenever the transmitter
//! is on. [`Fusion`] owns a registry of [`LineSource`]s, polls them for ready
//! lines, decodes each line, and steps the estimator in arrival order on one
//! logical thread. There is no cross-source ordering guarantee beyond
//! observation order, so every sample carries a source timestamp and stale
//! samples (older than the last accepted one from the same source) are
//! discarded instead of applying a backward-in-time correction.
//!
//! The IMU stream drives the filter timeline: each accepted IMU sample
//! advances filter time by the configured `dt`, and in real-time mode the
//! scheduler sleeps against a monotonic stopwatch to hold that cadence. In
//! batch (replay) mode it runs as fast as lines are available.
//!
//! Sources can be added and removed while a step is in flight; registry
//! mutations are queued and applied between steps so they never invalidate
//! the polling iteration.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nalgebra::Vector3;
use nav_types::WGS84;

use crate::ahrs::Ahrs;
use crate::frames::geodetic_to_tangent;
use crate::ins::Ins;
use crate::kalman::KalmanError;
use crate::sensors::{
    decode_gpgga, decode_gpvtg, decode_heading, sentence_kind, GpsFix, GpsTrack, ImuDecoder,
    RadioCommand, RadioDecoder, SentenceKind,
};

const KNOTS_TO_MS: f64 = 0.514444;

/// Opaque handle identifying a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

/// One sensor line with the source's timestamp, seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedLine {
    pub time: f64,
    pub line: String,
}

/// A non-blocking producer of sensor lines.
///
/// `poll_line` returns `Ok(None)` when no line is ready; an `Err` marks the
/// source failed and causes its removal from the registry.
pub trait LineSource {
    fn poll_line(&mut self) -> io::Result<Option<TimedLine>>;
}

/// Replays a recorded sensor log, one line per poll, with synthetic
/// timestamps spaced `dt` apart.
pub struct LogSource<R: BufRead> {
    lines: io::Lines<R>,
    time: f64,
    dt: f64,
}

impl LogSource<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P, dt: f64) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), dt))
    }
}

impl<R: BufRead> LogSource<R> {
    pub fn new(reader: R, dt: f64) -> Self {
        LogSource {
            lines: reader.lines(),
            time: 0.0,
            dt,
        }
    }
}

impl<R: BufRead> LineSource for LogSource<R> {
    fn poll_line(&mut self) -> io::Result<Option<TimedLine>> {
        match self.lines.next() {
            Some(Ok(line)) => {
                self.time += self.dt;
                Ok(Some(TimedLine {
                    time: self.time,
                    line,
                }))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The estimator interface the scheduler drives.
///
/// Both the attitude-only and the GPS-aided filters sit behind this trait;
/// sources that an estimator cannot use (GPS for the AHRS) default to a
/// no-op so the same sensor stream can feed either.
pub trait Navigator {
    fn imu_propagate(&mut self, accel: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64);
    fn accel_correct(&mut self, accel: &Vector3<f64>) -> Result<(), KalmanError>;
    fn compass_correct(&mut self, heading: f64) -> Result<(), KalmanError>;
    fn gps_correct(
        &mut self,
        _ned_position: &Vector3<f64>,
        _ned_velocity: &Vector3<f64>,
    ) -> Result<(), KalmanError> {
        Ok(())
    }
}

impl Navigator for Ahrs {
    fn imu_propagate(&mut self, _accel: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64) {
        Ahrs::imu_propagate(self, gyro, dt);
    }

    fn accel_correct(&mut self, accel: &Vector3<f64>) -> Result<(), KalmanError> {
        Ahrs::accel_correct(self, accel)
    }

    fn compass_correct(&mut self, heading: f64) -> Result<(), KalmanError> {
        Ahrs::compass_correct(self, heading)
    }
}

impl Navigator for Ins {
    fn imu_propagate(&mut self, accel: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64) {
        Ins::imu_propagate(self, accel, gyro, dt);
    }

    fn accel_correct(&mut self, accel: &Vector3<f64>) -> Result<(), KalmanError> {
        Ins::accel_correct(self, accel)
    }

    fn compass_correct(&mut self, heading: f64) -> Result<(), KalmanError> {
        Ins::compass_correct(self, heading)
    }

    fn gps_correct(
        &mut self,
        ned_position: &Vector3<f64>,
        ned_velocity: &Vector3<f64>,
    ) -> Result<(), KalmanError> {
        Ins::gps_correct(self, ned_position, ned_velocity)
    }
}

/// Per-source sample accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Lines decoded and applied.
    pub accepted: u64,
    /// Lines that failed to parse.
    pub rejected: u64,
    /// Lines discarded for carrying a timestamp older than the last
    /// accepted sample from the same source.
    pub stale: u64,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Filter propagation interval implied by one IMU line, seconds.
    pub dt: f64,
    /// Pace IMU servicing against the wall clock instead of free-running.
    pub real_time: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            dt: 0.01,
            real_time: false,
        }
    }
}

struct Registration {
    source: Box<dyn LineSource>,
    stats: SourceStats,
    last_time: f64,
}

/// The fusion scheduler: source registry, line router, filter timeline.
pub struct Fusion<Nav: Navigator> {
    nav: Nav,
    config: FusionConfig,

    sources: BTreeMap<SourceId, Registration>,
    pending_add: Vec<(SourceId, Box<dyn LineSource>)>,
    pending_remove: Vec<SourceId>,
    next_id: u64,

    imu_decoder: ImuDecoder,
    radio_decoder: RadioDecoder,
    latest_radio: Option<RadioCommand>,
    latest_fix: Option<GpsFix>,
    latest_track: GpsTrack,
    tangent_origin: Option<WGS84<f64>>,

    /// Filter time, advanced by dt per accepted IMU sample.
    time: f64,
    epoch: Instant,
}

impl<Nav: Navigator> Fusion<Nav> {
    pub fn new(nav: Nav, config: FusionConfig) -> Self {
        Fusion {
            nav,
            config,
            sources: BTreeMap::new(),
            pending_add: Vec::new(),
            pending_remove: Vec::new(),
            next_id: 0,
            imu_decoder: ImuDecoder::default(),
            radio_decoder: RadioDecoder::default(),
            latest_radio: None,
            latest_fix: None,
            latest_track: GpsTrack::default(),
            tangent_origin: None,
            time: 0.0,
            epoch: Instant::now(),
        }
    }

    /// Register a source. Takes effect at the next `step_once` boundary.
    pub fn add_source(&mut self, source: Box<dyn LineSource>) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        self.pending_add.push((id, source));
        id
    }

    /// Deregister a source. Takes effect at the next `step_once` boundary;
    /// unknown ids are ignored.
    pub fn remove_source(&mut self, id: SourceId) {
        self.pending_remove.push(id);
    }

    fn apply_registry_changes(&mut self) {
        for (id, source) in self.pending_add.drain(..) {
            self.sources.insert(
                id,
                Registration {
                    source,
                    stats: SourceStats::default(),
                    last_time: f64::NEG_INFINITY,
                },
            );
        }
        for id in self.pending_remove.drain(..) {
            self.sources.remove(&id);
        }
    }

    /// Service every source that has a line ready, waiting until at least one
    /// does. Returns the number of lines applied, or `Ok(0)` once no sources
    /// remain registered.
    pub fn step_once(&mut self) -> io::Result<usize> {
        loop {
            self.apply_registry_changes();
            if self.sources.is_empty() {
                return Ok(0);
            }

            let mut serviced = 0;
            let mut failed: Vec<SourceId> = Vec::new();

            let ids: Vec<SourceId> = self.sources.keys().copied().collect();
            for id in ids {
                let polled = match self.sources.get_mut(&id) {
                    Some(reg) => reg.source.poll_line(),
                    None => continue,
                };
                match polled {
                    Ok(Some(timed)) => {
                        self.handle_line(id, &timed);
                        serviced += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("source {id:?} failed, removing: {e}");
                        failed.push(id);
                    }
                }
            }

            for id in failed {
                self.sources.remove(&id);
            }

            if serviced > 0 {
                return Ok(serviced);
            }
            if self.sources.is_empty() {
                return Ok(0);
            }
            // Nothing ready; yield briefly rather than spinning.
            std::thread::sleep(Duration::from_micros(500));
        }
    }

    /// One non-waiting pass over the registry for batch replay. Unlike
    /// `step_once`, a source with nothing ready is taken as exhausted and
    /// deregistered. Returns the number of lines applied; 0 once every
    /// source has drained.
    pub fn step_batch(&mut self) -> usize {
        self.apply_registry_changes();

        let mut serviced = 0;
        let mut done: Vec<SourceId> = Vec::new();

        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in ids {
            let polled = match self.sources.get_mut(&id) {
                Some(reg) => reg.source.poll_line(),
                None => continue,
            };
            match polled {
                Ok(Some(timed)) => {
                    self.handle_line(id, &timed);
                    serviced += 1;
                }
                Ok(None) => done.push(id),
                Err(e) => {
                    warn!("source {id:?} failed, removing: {e}");
                    done.push(id);
                }
            }
        }

        for id in done {
            self.sources.remove(&id);
        }
        serviced
    }

    /// Drain every registered source to exhaustion (batch replay).
    pub fn run_to_end(&mut self) {
        loop {
            let serviced = self.step_batch();
            if serviced == 0 && self.sources.is_empty() && self.pending_add.is_empty() {
                return;
            }
        }
    }

    fn handle_line(&mut self, id: SourceId, timed: &TimedLine) {
        // Stale check before any decode work.
        if let Some(reg) = self.sources.get_mut(&id) {
            if timed.time < reg.last_time {
                reg.stats.stale += 1;
                debug!("discarding stale line from {id:?}");
                return;
            }
        }

        let outcome = self.route_line(&timed.line);
        if let Some(reg) = self.sources.get_mut(&id) {
            match outcome {
                Ok(()) => {
                    reg.stats.accepted += 1;
                    reg.last_time = timed.time;
                }
                Err(e) => {
                    reg.stats.rejected += 1;
                    warn!("bad line from {id:?}: {e}: {:?}", timed.line);
                }
            }
        }
    }

    fn route_line(&mut self, line: &str) -> Result<(), crate::sensors::ParseError> {
        match sentence_kind(line) {
            Some(SentenceKind::Adc) => {
                let sample = self.imu_decoder.decode(line)?;
                self.nav
                    .imu_propagate(&sample.accel, &sample.gyro, self.config.dt);
                // Tilt aiding runs at the IMU rate; a skipped update already
                // logged itself.
                let _ = self.nav.accel_correct(&sample.accel);
                self.advance_clock();
                Ok(())
            }
            Some(SentenceKind::Heading) => {
                let heading = decode_heading(line)?;
                let _ = self.nav.compass_correct(heading);
                Ok(())
            }
            Some(SentenceKind::GpsFix) => {
                let fix = decode_gpgga(line)?;
                self.apply_fix(fix);
                Ok(())
            }
            Some(SentenceKind::GpsTrack) => {
                self.latest_track = decode_gpvtg(line)?;
                Ok(())
            }
            Some(SentenceKind::Ppm) => {
                self.latest_radio = Some(self.radio_decoder.decode(line)?);
                Ok(())
            }
            None => Err(crate::sensors::ParseError::UnknownSentence),
        }
    }

    fn apply_fix(&mut self, fix: GpsFix) {
        self.latest_fix = Some(fix);
        if fix.quality == 0 {
            debug!("GPS fix without quality, not correcting");
            return;
        }

        let point = WGS84::from_degrees_and_meters(fix.latitude, fix.longitude, fix.altitude);
        let origin = *self.tangent_origin.get_or_insert(point);

        let ned_position = geodetic_to_tangent(&origin, &point).into_inner();

        // NED velocity from the last track made good; GPS receivers report
        // no vertical speed, so down is zero.
        let speed = self.latest_track.speed_knots * KNOTS_TO_MS;
        let course = self.latest_track.track_true.to_radians();
        let ned_velocity = Vector3::new(speed * course.cos(), speed * course.sin(), 0.0);

        let _ = self.nav.gps_correct(&ned_position, &ned_velocity);
    }

    fn advance_clock(&mut self) {
        self.time += self.config.dt;
        if self.config.real_time {
            let target = self.epoch + Duration::from_secs_f64(self.time);
            let now = Instant::now();
            if target > now {
                std::thread::sleep(target - now);
            }
        }
    }

    /// Filter time in seconds, advanced by dt per accepted IMU sample.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// The estimator being driven.
    pub fn nav(&self) -> &Nav {
        &self.nav
    }

    pub fn nav_mut(&mut self) -> &mut Nav {
        &mut self.nav
    }

    /// Most recent radio command, if any frame has arrived.
    pub fn radio(&self) -> Option<RadioCommand> {
        self.latest_radio
    }

    /// Most recent GPS fix, if any has arrived.
    pub fn gps_fix(&self) -> Option<GpsFix> {
        self.latest_fix
    }

    /// Counters for a registered source.
    pub fn stats(&self, id: SourceId) -> Option<SourceStats> {
        self.sources.get(&id).map(|reg| reg.stats)
    }
}

//! Data loading, measurement assembly and result export for pedestrian dead-reckoning runs.
//!
//! This module provides:
//! - [SensorRecord] and [WaypointRecord] for reading phone sensor logs and ground-truth fixes
//!   from CSV
//! - helpers that turn those records into what the filter consumes: time steps, a waypoint per
//!   sensor sample, the heading rate table, the linear acceleration history and the measurement
//!   vectors
//! - [run_ukf], a complete forward pass with an optional smoothing pass
//! - [NavigationResult] for storing and exporting an estimated track
use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use chrono::DateTime;
use log::{info, warn};
use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::attitude::{gravity_in_body, heading_rate, quaternion_from_components};
use crate::config::FilterConfig;
use crate::kalman::{InitialBelief, Trajectory, run_forward};
use crate::measurements::PedestrianMeasurement;
use crate::motion::{
    AccelerationHistory, OrientationKind, POSITION, PedestrianModel, TurnRateTable,
};
use crate::sigma::SigmaWeights;
use crate::smoother::rts_smooth;

/// One row of a phone sensor log.
///
/// Accelerometer output includes gravity. The orientation is the Android style rotation vector,
/// the vector part of the device quaternion; `rv_w` is optional since many loggers omit it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Acceleration along the device x-axis in m/s^2
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    /// Rotation rate around the device x-axis in rad/s
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub rv_x: f64,
    pub rv_y: f64,
    pub rv_z: f64,
    #[serde(default)]
    pub rv_w: Option<f64>,
}

impl SensorRecord {
    /// Reads a CSV file and returns a vector of `SensorRecord` structs.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use deadreckon::sim::SensorRecord;
    ///
    /// let records = SensorRecord::from_csv("./data/sensors.csv").expect("Failed to read sensor log");
    /// println!("Loaded {} records", records.len());
    /// ```
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    /// Writes records to a CSV file with a header row
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Timestamp in seconds
    pub fn time_s(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }
    pub fn acceleration(&self) -> Vector3<f64> {
        Vector3::new(self.acc_x, self.acc_y, self.acc_z)
    }
    pub fn gyro(&self) -> Vector3<f64> {
        Vector3::new(self.gyro_x, self.gyro_y, self.gyro_z)
    }
    /// Device orientation, recovering the scalar part when the log does not carry it
    pub fn orientation(&self) -> UnitQuaternion<f64> {
        let vector = Vector3::new(self.rv_x, self.rv_y, self.rv_z);
        match self.rv_w {
            Some(w) => quaternion_from_components(w, self.rv_x, self.rv_y, self.rv_z),
            None => quaternion_from_rotation_vector(&vector),
        }
    }
}

/// A ground-truth position fix in the local plane, metres
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaypointRecord {
    pub timestamp_ms: i64,
    pub x: f64,
    pub y: f64,
}

impl WaypointRecord {
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    pub fn time_s(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }
}

/// Step lengths in seconds: the first difference of `times_s`, with the first step repeated so
/// that every sample has one. A single sample gets a zero step.
pub fn timestep_deltas(times_s: &[f64]) -> Vec<f64> {
    match times_s.len() {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => {
            let mut deltas: Vec<f64> = times_s.windows(2).map(|w| w[1] - w[0]).collect();
            deltas.insert(0, deltas[0]);
            deltas
        }
    }
}

/// Assign a waypoint to every sensor sample.
///
/// Each waypoint lands on the sample nearest in time; later waypoints win when several land on the
/// same sample. Samples between fixes hold the previous fix and samples before the first fix take
/// the first one.
pub fn resample_waypoints(
    sample_times: &[f64],
    waypoints: &[WaypointRecord],
) -> Result<Vec<[f64; 2]>, &'static str> {
    if waypoints.is_empty() {
        return Err("resample_waypoints: no waypoints");
    }
    if sample_times.is_empty() {
        return Ok(Vec::new());
    }
    let mut placed: Vec<Option<[f64; 2]>> = vec![None; sample_times.len()];
    for waypoint in waypoints {
        let t = waypoint.time_s();
        let nearest = sample_times
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| (*a - t).abs().total_cmp(&(*b - t).abs()))
            .map(|(i, _)| i)
            .ok_or("resample_waypoints: no samples")?;
        placed[nearest] = Some([waypoint.x, waypoint.y]);
    }
    let first = placed
        .iter()
        .flatten()
        .next()
        .copied()
        .ok_or("resample_waypoints: no waypoint placed")?;
    let mut current = first;
    Ok(placed
        .into_iter()
        .map(|slot| {
            if let Some(position) = slot {
                current = position;
            }
            current
        })
        .collect())
}

/// Unit quaternion from the vector part of a rotation vector, `w = sqrt(max(0, 1 - |v|^2))`
pub fn quaternion_from_rotation_vector(vector: &Vector3<f64>) -> UnitQuaternion<f64> {
    let w = (1.0 - vector.norm_squared()).max(0.0).sqrt();
    quaternion_from_components(w, vector[0], vector[1], vector[2])
}

/// Heading rate table from the gyro and orientation of every record
pub fn turn_rates(records: &[SensorRecord]) -> TurnRateTable {
    TurnRateTable::new(
        records
            .iter()
            .map(|r| (r.time_s(), heading_rate(&r.orientation(), &r.gyro()))),
    )
}

/// Linear acceleration of every record, the accelerometer output less the gravity reaction
pub fn linear_accelerations(records: &[SensorRecord]) -> AccelerationHistory {
    AccelerationHistory::new(
        records
            .iter()
            .map(|r| (r.time_s(), r.acceleration() - gravity_in_body(&r.orientation()))),
    )
}

/// Measurement vectors of a run.
///
/// Sample `k` closes the interval that started at sample `k - 1`, so its position channel is the
/// waypoint of that sample; the first sample uses its own.
///
/// # Panics
/// When `waypoints` does not have one entry per record.
pub fn build_measurements(
    records: &[SensorRecord],
    waypoints: &[[f64; 2]],
    kind: OrientationKind,
) -> Vec<DVector<f64>> {
    assert_eq!(
        records.len(),
        waypoints.len(),
        "build_measurements: one waypoint per record required"
    );
    records
        .iter()
        .enumerate()
        .map(|(k, record)| {
            PedestrianMeasurement {
                position: waypoints[k.saturating_sub(1)],
                acceleration: record.acceleration(),
                orientation: record.orientation(),
            }
            .get_vector(kind)
        })
        .collect()
}

/// Estimated track of a filter run
#[derive(Clone, Debug, PartialEq)]
pub struct NavigationResult {
    pub name: String,
    /// Seconds since the Unix epoch
    pub timestamps: Vec<f64>,
    pub means: Vec<DVector<f64>>,
    pub covariances: Vec<DMatrix<f64>>,
}

impl NavigationResult {
    pub fn from_trajectory(name: &str, trajectory: Trajectory) -> Self {
        NavigationResult {
            name: name.to_string(),
            timestamps: trajectory.timestamps,
            means: trajectory.means,
            covariances: trajectory.covariances,
        }
    }
    pub fn len(&self) -> usize {
        self.means.len()
    }
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
    pub fn positions(&self) -> Vec<[f64; 2]> {
        self.means
            .iter()
            .map(|m| [m[POSITION], m[POSITION + 1]])
            .collect()
    }
    /// Writes the planar track and its standard deviations to a CSV file.
    ///
    /// Columns: `time,x_m,y_m,sigma_x_m,sigma_y_m`, with the time as RFC 3339.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        writeln!(file, "time,x_m,y_m,sigma_x_m,sigma_y_m")?;
        let rows = self.timestamps.iter().zip(&self.means).zip(&self.covariances);
        for ((t, mean), covariance) in rows {
            let time = DateTime::from_timestamp_millis((t * 1000.0).round() as i64)
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| t.to_string());
            writeln!(
                file,
                "{},{:.6},{:.6},{:.6},{:.6}",
                time,
                mean[POSITION],
                mean[POSITION + 1],
                covariance[(POSITION, POSITION)].max(0.0).sqrt(),
                covariance[(POSITION + 1, POSITION + 1)].max(0.0).sqrt()
            )?;
        }
        Ok(())
    }
}

/// Run the filter over a sensor log and its waypoints, optionally followed by the smoother.
///
/// # Example
///
/// ```no_run
/// use deadreckon::config::FilterConfig;
/// use deadreckon::kalman::InitialBelief;
/// use deadreckon::motion::OrientationKind;
/// use deadreckon::sim::{SensorRecord, WaypointRecord, run_ukf};
/// use nalgebra::Vector3;
///
/// let records = SensorRecord::from_csv("./data/sensors.csv").unwrap();
/// let waypoints = WaypointRecord::from_csv("./data/waypoints.csv").unwrap();
/// let first = &records[0];
/// let belief = InitialBelief::from_components(
///     [waypoints[0].x, waypoints[0].y],
///     Vector3::zeros(),
///     &first.orientation(),
///     OrientationKind::Quaternion,
///     &[1.0, 1.0, 0.1, 0.1, 0.1, 1e-3, 1e-3, 1e-3, 1e-3],
/// )
/// .unwrap();
/// let result = run_ukf(&records, &waypoints, &belief, &FilterConfig::default(), true).unwrap();
/// result.to_csv("track.csv").unwrap();
/// ```
pub fn run_ukf(
    records: &[SensorRecord],
    waypoints: &[WaypointRecord],
    belief: &InitialBelief,
    config: &FilterConfig,
    smooth: bool,
) -> Result<NavigationResult, Box<dyn Error>> {
    config.validate()?;
    let times: Vec<f64> = records.iter().map(SensorRecord::time_s).collect();
    let dt = timestep_deltas(&times);
    if dt.iter().any(|&step| step < 0.0) {
        warn!("run_ukf: sensor timestamps are not monotonic");
    }
    let resampled = resample_waypoints(&times, waypoints)?;
    let measurements = build_measurements(records, &resampled, config.orientation);
    let model = PedestrianModel::from_config(config)
        .with_turn_rates(turn_rates(records))
        .with_acceleration_history(linear_accelerations(records));
    info!(
        "run_ukf: {} samples, {} waypoints, {:?} orientation",
        records.len(),
        waypoints.len(),
        config.orientation
    );
    let forward = run_forward(&model, belief, &measurements, &times, &dt, config)?;
    if !smooth {
        return Ok(NavigationResult::from_trajectory("UKF", forward));
    }
    let weights = SigmaWeights::from_parameters(&config.sigma, config.state_dimension());
    let process_noise = config.process_noise()?;
    let smoothed = rts_smooth(&forward, &model, process_noise.base(), &dt, &weights);
    Ok(NavigationResult::from_trajectory("UKF-RTS", smoothed.trajectory))
}

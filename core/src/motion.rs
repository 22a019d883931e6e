//! Pedestrian motion model
//!
//! [PedestrianModel] is the state transition ("fx") of the filter. One step:
//!
//! 1. splits the state into linear acceleration and orientation,
//! 2. low-pass filters the acceleration with [LowPassFir], running the window over the logged
//!    [AccelerationHistory] around the end of the step with the state's value at the centre tap,
//! 3. double integrates its magnitude over the step into a forward distance
//!    $d = \lVert a \rVert \Delta t^2$,
//! 4. reads the heading $\psi_0$ off the orientation and the turn $\Delta\psi$ over the step off the
//!    [TurnRateTable],
//! 5. walks $d$ along the circular arc from $\psi_0$ to $\psi_1 = \psi_0 + \Delta\psi$ (or along a
//!    straight line when the turn vanishes or [PathModel::Straight] is selected),
//! 6. rotates the orientation by $\Delta\psi$ about the vertical.
//!
//! Heading is measured counter-clockwise from the navigation y axis, so a device with zero heading
//! walks towards +y and a heading of π/2 walks towards -x.
use std::cmp::Ordering;

use log::debug;
use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::attitude::{self, heading};
use crate::config::FilterConfig;
use crate::layout::VectorLayout;
use crate::signal::LowPassFir;
use crate::{StateTransition, wrap_to_pi};

/// Index of the x position in the state
pub const POSITION: usize = 0;
/// Index of the first linear acceleration component
pub const ACCELERATION: usize = 2;
/// Index of the first orientation component
pub const ORIENTATION: usize = 5;
/// Turns smaller than this (radians) use the straight-line limit of the arc
pub const STRAIGHT_TURN_EPS: f64 = 1e-9;

/// How the orientation is carried in the state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrientationKind {
    /// `[qw, qx, qy, qz]`, n = 9
    #[default]
    Quaternion,
    /// `[yaw, pitch, roll]`, n = 8
    Euler,
}

impl OrientationKind {
    pub fn state_dimension(self) -> usize {
        match self {
            OrientationKind::Quaternion => 9,
            OrientationKind::Euler => 8,
        }
    }
    /// Measurements have the same dimension as the state
    pub fn measurement_dimension(self) -> usize {
        self.state_dimension()
    }
    pub fn state_layout(self) -> VectorLayout {
        let layout = VectorLayout::linear(self.state_dimension());
        match self {
            OrientationKind::Quaternion => layout.with_quaternion(ORIENTATION),
            OrientationKind::Euler => {
                layout.with_angles(&[ORIENTATION, ORIENTATION + 1, ORIENTATION + 2])
            }
        }
    }
    /// `[x, y, acc_x, acc_y, acc_z, rotation vector]` or
    /// `[x, y, acc_x, acc_y, acc_z, yaw, pitch, roll]`
    pub fn measurement_layout(self) -> VectorLayout {
        // The rotation vector is stored [qx, qy, qz, qw]; sign alignment and renormalisation do not
        // depend on the component order, so it shares the quaternion treatment.
        self.state_layout()
    }
}

/// Path integration between two headings
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathModel {
    /// Circular arc following the turn over the step
    #[default]
    Curved,
    /// Straight line along the heading at the start of the step
    Straight,
}

/// Navigation-frame heading rate samples, linearly interpolated in time
///
/// Outside the sampled range the nearest rate is held. An empty table means "no turning".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnRateTable {
    times: Vec<f64>,
    rates: Vec<f64>,
}

impl TurnRateTable {
    /// Build a table from `(time_s, rate_rad_per_s)` samples
    ///
    /// Samples with a non-finite time are dropped; the rest are sorted by time.
    pub fn new(samples: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut samples: Vec<(f64, f64)> = samples
            .into_iter()
            .filter(|(t, _)| t.is_finite())
            .collect();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (times, rates) = samples.into_iter().unzip();
        TurnRateTable { times, rates }
    }
    pub fn len(&self) -> usize {
        self.times.len()
    }
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
    /// Interpolated rate at time `t`
    pub fn rate_at(&self, t: f64) -> f64 {
        let n = self.times.len();
        if n == 0 {
            return 0.0;
        }
        let i = self.times.partition_point(|&s| s <= t);
        if i == 0 {
            self.rates[0]
        } else if i == n {
            self.rates[n - 1]
        } else {
            let (t0, t1) = (self.times[i - 1], self.times[i]);
            let (r0, r1) = (self.rates[i - 1], self.rates[i]);
            r0 + (r1 - r0) * (t - t0) / (t1 - t0)
        }
    }
    /// Heading change over `(start, end]`, the trapezoidal integral of the interpolated rate
    ///
    /// Exact for the piecewise linear interpolant. Zero for an empty table or an empty interval.
    pub fn turn_over(&self, start: f64, end: f64) -> f64 {
        if self.times.is_empty() || end.partial_cmp(&start) != Some(Ordering::Greater) {
            return 0.0;
        }
        let first = self.times.partition_point(|&t| t <= start);
        let last = self.times.partition_point(|&t| t < end);
        let mut total = 0.0;
        let (mut t0, mut r0) = (start, self.rate_at(start));
        for i in first..last {
            let (t1, r1) = (self.times[i], self.rates[i]);
            total += 0.5 * (r0 + r1) * (t1 - t0);
            (t0, r0) = (t1, r1);
        }
        total + 0.5 * (r0 + self.rate_at(end)) * (end - t0)
    }
}

/// Linear acceleration samples of the sensor log, one series per body axis
///
/// Gives the motion model's low-pass filter the neighbourhood of the sample a step ends on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccelerationHistory {
    times: Vec<f64>,
    channels: [Vec<f64>; 3],
}

impl AccelerationHistory {
    /// Build a history from `(time_s, linear acceleration)` samples
    ///
    /// Samples with a non-finite time are dropped; the rest are sorted by time.
    pub fn new(samples: impl IntoIterator<Item = (f64, Vector3<f64>)>) -> Self {
        let mut samples: Vec<(f64, Vector3<f64>)> = samples
            .into_iter()
            .filter(|(t, _)| t.is_finite())
            .collect();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut history = AccelerationHistory::default();
        for (t, a) in samples {
            history.times.push(t);
            for (channel, value) in history.channels.iter_mut().zip(a.iter()) {
                channel.push(*value);
            }
        }
        history
    }
    pub fn len(&self) -> usize {
        self.times.len()
    }
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
    /// Index of the sample closest to `t`, `None` for an empty history or a non-finite time
    pub fn nearest(&self, t: f64) -> Option<usize> {
        if self.times.is_empty() || !t.is_finite() {
            return None;
        }
        let i = self.times.partition_point(|&s| s < t);
        if i == 0 {
            Some(0)
        } else if i == self.times.len() || t - self.times[i - 1] <= self.times[i] - t {
            Some(i - 1)
        } else {
            Some(i)
        }
    }
    pub fn channel(&self, axis: usize) -> &[f64] {
        &self.channels[axis]
    }
}

/// Planar displacement over one step
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Displacement {
    pub dx: f64,
    pub dy: f64,
    pub distance: f64,
    pub turn: f64,
}

/// Forward distance travelled over `dt` at constant acceleration magnitude, `‖a‖ dt²`
pub fn forward_distance(acceleration: &Vector3<f64>, dt: f64) -> f64 {
    let speed = acceleration.norm() * dt;
    speed * dt
}

/// Displacement of a walk of `distance` starting at `heading_start` and turning by `turn`
pub fn arc_displacement(distance: f64, heading_start: f64, turn: f64) -> (f64, f64) {
    if turn.abs() < STRAIGHT_TURN_EPS {
        return straight_displacement(distance, heading_start);
    }
    let heading_end = heading_start + turn;
    let radius = distance / turn;
    (
        radius * (heading_end.cos() - heading_start.cos()),
        radius * (heading_end.sin() - heading_start.sin()),
    )
}

/// Displacement of a straight walk of `distance` along `heading`
pub fn straight_displacement(distance: f64, heading: f64) -> (f64, f64) {
    (-distance * heading.sin(), distance * heading.cos())
}

/// Dead-reckoning model of a walking pedestrian carrying an inertial sensor
#[derive(Clone, Debug)]
pub struct PedestrianModel {
    orientation: OrientationKind,
    path: PathModel,
    fir: LowPassFir,
    turn_rates: TurnRateTable,
    acceleration_history: AccelerationHistory,
    state_layout: VectorLayout,
    measurement_layout: VectorLayout,
}

impl PedestrianModel {
    pub fn new(orientation: OrientationKind) -> Self {
        PedestrianModel {
            orientation,
            path: PathModel::default(),
            fir: LowPassFir::default(),
            turn_rates: TurnRateTable::default(),
            acceleration_history: AccelerationHistory::default(),
            state_layout: orientation.state_layout(),
            measurement_layout: orientation.measurement_layout(),
        }
    }
    pub fn from_config(config: &FilterConfig) -> Self {
        PedestrianModel::new(config.orientation)
            .with_path(config.path)
            .with_fir(LowPassFir::from_config(&config.fir))
    }
    pub fn with_path(mut self, path: PathModel) -> Self {
        self.path = path;
        self
    }
    pub fn with_fir(mut self, fir: LowPassFir) -> Self {
        self.fir = fir;
        self
    }
    pub fn with_turn_rates(mut self, turn_rates: TurnRateTable) -> Self {
        debug!("PedestrianModel: {} turn rate samples", turn_rates.len());
        self.turn_rates = turn_rates;
        self
    }
    pub fn with_acceleration_history(mut self, history: AccelerationHistory) -> Self {
        debug!("PedestrianModel: {} acceleration samples", history.len());
        self.acceleration_history = history;
        self
    }
    pub fn orientation(&self) -> OrientationKind {
        self.orientation
    }
    pub fn path(&self) -> PathModel {
        self.path
    }
    pub fn fir(&self) -> &LowPassFir {
        &self.fir
    }
    pub fn turn_rates(&self) -> &TurnRateTable {
        &self.turn_rates
    }
    pub fn acceleration_history(&self) -> &AccelerationHistory {
        &self.acceleration_history
    }
    pub(crate) fn measurement_layout_ref(&self) -> &VectorLayout {
        &self.measurement_layout
    }
    /// Low-pass filtered linear acceleration of a state at the end of a step
    ///
    /// The state's acceleration takes the place of the logged sample nearest `timestamp` and the
    /// filter window runs over the logged neighbours. Without a history the acceleration is held
    /// over the window.
    pub fn filtered_acceleration(&self, state: &DVector<f64>, timestamp: f64) -> Vector3<f64> {
        let raw = state.fixed_rows::<3>(ACCELERATION);
        let index = self.acceleration_history.nearest(timestamp);
        Vector3::from_fn(|axis, _| match index {
            Some(i) => self
                .fir
                .response_at(self.acceleration_history.channel(axis), i, raw[axis]),
            None => self.fir.hold_response(raw[axis]),
        })
    }
    /// Body-to-navigation rotation of a state
    pub fn attitude(&self, state: &DVector<f64>) -> UnitQuaternion<f64> {
        let o = ORIENTATION;
        match self.orientation {
            OrientationKind::Quaternion => attitude::quaternion_from_components(
                state[o],
                state[o + 1],
                state[o + 2],
                state[o + 3],
            ),
            OrientationKind::Euler => {
                attitude::quaternion_from_euler(state[o], state[o + 1], state[o + 2])
            }
        }
    }
    /// Heading change over the step ending at `timestamp`
    pub fn turn(&self, dt: f64, timestamp: f64) -> f64 {
        self.turn_rates.turn_over(timestamp - dt, timestamp)
    }
    /// Planar displacement honouring the configured [PathModel]
    pub fn displacement(&self, distance: f64, heading_start: f64, turn: f64) -> (f64, f64) {
        match self.path {
            PathModel::Curved => arc_displacement(distance, heading_start, turn),
            PathModel::Straight => straight_displacement(distance, heading_start),
        }
    }
    /// Displacement produced by [StateTransition::transition] from `state`
    pub fn step(&self, state: &DVector<f64>, dt: f64, timestamp: f64) -> Displacement {
        let distance = forward_distance(&self.filtered_acceleration(state, timestamp), dt);
        let turn = self.turn(dt, timestamp);
        let (dx, dy) = self.displacement(distance, heading(&self.attitude(state)), turn);
        Displacement {
            dx,
            dy,
            distance,
            turn,
        }
    }
    fn rotate_orientation(&self, state: &mut DVector<f64>, turn: f64) {
        let o = ORIENTATION;
        match self.orientation {
            OrientationKind::Quaternion => {
                // Rotate the raw components so an unnormalised sigma point keeps its scale.
                let yaw = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), turn);
                let q = Quaternion::new(state[o], state[o + 1], state[o + 2], state[o + 3]);
                let rotated = yaw.quaternion() * q;
                state[o] = rotated.w;
                state[o + 1] = rotated.i;
                state[o + 2] = rotated.j;
                state[o + 3] = rotated.k;
            }
            OrientationKind::Euler => {
                state[o] = wrap_to_pi(state[o] + turn);
                state[o + 1] = wrap_to_pi(state[o + 1]);
                state[o + 2] = wrap_to_pi(state[o + 2]);
            }
        }
    }
}

impl Default for PedestrianModel {
    fn default() -> Self {
        PedestrianModel::new(OrientationKind::default())
    }
}

impl StateTransition for PedestrianModel {
    fn state_layout(&self) -> &VectorLayout {
        &self.state_layout
    }
    fn transition(&self, state: &DVector<f64>, dt: f64, timestamp: f64) -> DVector<f64> {
        assert_eq!(
            state.len(),
            self.state_layout.dimension(),
            "PedestrianModel::transition: state dimension mismatch"
        );
        let acceleration = self.filtered_acceleration(state, timestamp);
        let step = self.step(state, dt, timestamp);
        let mut next = state.clone();
        next[POSITION] += step.dx;
        next[POSITION + 1] += step.dy;
        next.fixed_rows_mut::<3>(ACCELERATION).copy_from(&acceleration);
        self.rotate_orientation(&mut next, step.turn);
        next
    }
}

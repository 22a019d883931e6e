//! Filter configuration
//!
//! [FilterConfig] gathers every tunable of the filter: the state variant, the sigma point scaling
//! parameters for the first and the later steps, the covariance update form, the path model, the
//! accelerometer low-pass filter, and the process and measurement noise. It serializes to JSON, YAML
//! or TOML and is checked by [FilterConfig::validate] before a filter is built, so numerical code never
//! sees out-of-range parameters.
//!
//! Documented ranges:
//! - `alpha` in (0, 1], `beta` >= 0, and `n + λ > 0` (equivalently `n + κ > 0`),
//! - noise matrices are `n x n`, finite, symmetric, with a non-negative diagonal,
//! - FIR order even and positive, cutoff in (0, π) radians per sample,
//! - jitter standard deviation finite and non-negative.
//!
//! ## Example
//!
//! ```
//! use deadreckon::config::FilterConfig;
//! use deadreckon::motion::OrientationKind;
//!
//! let config = FilterConfig::for_orientation(OrientationKind::Euler);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.state_dimension(), 8);
//! ```
use std::f64::consts::PI;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::motion::{OrientationKind, PathModel};
use crate::signal::FirConfig;
use crate::sigma::SigmaParameters;

/// Relative tolerance used when checking symmetry of configured matrices
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("sigma parameter `{name}` = {value} is out of range: {reason}")]
    SigmaParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    #[error("sigma point spread n + lambda = {spread} must be positive (n = {n})")]
    Spread { n: usize, spread: f64 },
    #[error("{what} has dimension {found}, expected {expected}")]
    Dimension {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{what}: entry {index} = {value} must be finite and non-negative")]
    InvalidVariance {
        what: &'static str,
        index: usize,
        value: f64,
    },
    #[error("{what} contains non-finite values")]
    NonFinite { what: &'static str },
    #[error("{what} is not symmetric")]
    NotSymmetric { what: &'static str },
    #[error("FIR filter: {reason}")]
    Fir { reason: &'static str },
    #[error("noise jitter standard deviation {value} must be finite and non-negative")]
    Jitter { value: f64 },
}

/// Form of the posterior covariance update
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceUpdate {
    /// `P - K Pxzᵀ - Pxz Kᵀ + K S Kᵀ`, symmetric by construction
    #[default]
    Joseph,
    /// `P - K S Kᵀ`
    Subtractive,
}

/// Noise covariance, diagonal or full
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseMatrix {
    Diagonal { values: Vec<f64> },
    Full { rows: Vec<Vec<f64>> },
}

impl NoiseMatrix {
    /// Build and check the `n x n` matrix
    pub fn to_matrix(&self, n: usize, what: &'static str) -> Result<DMatrix<f64>, ConfigError> {
        match self {
            NoiseMatrix::Diagonal { values } => {
                if values.len() != n {
                    return Err(ConfigError::Dimension {
                        what,
                        expected: n,
                        found: values.len(),
                    });
                }
                check_variances(values.iter().copied(), what)?;
                Ok(DMatrix::from_diagonal(&DVector::from_column_slice(values)))
            }
            NoiseMatrix::Full { rows } => {
                if rows.len() != n {
                    return Err(ConfigError::Dimension {
                        what,
                        expected: n,
                        found: rows.len(),
                    });
                }
                if let Some(row) = rows.iter().find(|row| row.len() != n) {
                    return Err(ConfigError::Dimension {
                        what,
                        expected: n,
                        found: row.len(),
                    });
                }
                let matrix = DMatrix::from_fn(n, n, |i, j| rows[i][j]);
                if !matrix.iter().all(|v| v.is_finite()) {
                    return Err(ConfigError::NonFinite { what });
                }
                check_variances(matrix.diagonal().iter().copied(), what)?;
                let scale = matrix.amax().max(1.0);
                if (&matrix - matrix.transpose()).amax() > SYMMETRY_TOLERANCE * scale {
                    return Err(ConfigError::NotSymmetric { what });
                }
                Ok(matrix)
            }
        }
    }
    pub fn dimension(&self) -> usize {
        match self {
            NoiseMatrix::Diagonal { values } => values.len(),
            NoiseMatrix::Full { rows } => rows.len(),
        }
    }
}

fn check_variances(
    values: impl Iterator<Item = f64>,
    what: &'static str,
) -> Result<(), ConfigError> {
    for (index, value) in values.enumerate() {
        if !(value.is_finite() && value >= 0.0) {
            return Err(ConfigError::InvalidVariance { what, index, value });
        }
    }
    Ok(())
}

/// Default seed value for reproducible noise jitter
fn default_seed() -> u64 {
    42
}

/// Per-step random scaling of the process noise diagonal
///
/// Each diagonal entry is multiplied by `|1 + N(0, relative_std)|`, drawn from a `StdRng` seeded with
/// `seed` so that runs are reproducible.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseJitter {
    pub relative_std: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Noise configuration: a matrix and an optional jitter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    pub matrix: NoiseMatrix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<NoiseJitter>,
}

impl NoiseConfig {
    pub fn diagonal(values: Vec<f64>) -> Self {
        NoiseConfig {
            matrix: NoiseMatrix::Diagonal { values },
            jitter: None,
        }
    }
    pub fn with_jitter(mut self, relative_std: f64, seed: u64) -> Self {
        self.jitter = Some(NoiseJitter { relative_std, seed });
        self
    }
    fn validate(&self, n: usize, what: &'static str) -> Result<(), ConfigError> {
        self.matrix.to_matrix(n, what)?;
        if let Some(jitter) = &self.jitter {
            if !(jitter.relative_std.is_finite() && jitter.relative_std >= 0.0) {
                return Err(ConfigError::Jitter {
                    value: jitter.relative_std,
                });
            }
        }
        Ok(())
    }
}

/// Source of the per-step process noise matrix
#[derive(Clone, Debug)]
pub struct ProcessNoise {
    base: DMatrix<f64>,
    jitter: Option<(Normal<f64>, StdRng)>,
}

impl ProcessNoise {
    /// Constant process noise
    pub fn fixed(base: DMatrix<f64>) -> Self {
        ProcessNoise { base, jitter: None }
    }
    pub fn from_config(config: &NoiseConfig, n: usize) -> Result<Self, ConfigError> {
        config.validate(n, "process noise")?;
        let base = config.matrix.to_matrix(n, "process noise")?;
        let jitter = match config.jitter {
            Some(NoiseJitter { relative_std, seed }) => {
                let normal = Normal::new(0.0, relative_std)
                    .map_err(|_| ConfigError::Jitter { value: relative_std })?;
                Some((normal, StdRng::seed_from_u64(seed)))
            }
            None => None,
        };
        Ok(ProcessNoise { base, jitter })
    }
    pub fn base(&self) -> &DMatrix<f64> {
        &self.base
    }
    pub fn is_jittered(&self) -> bool {
        self.jitter.is_some()
    }
    /// Process noise for the next step
    ///
    /// With jitter, returns `D Q D` where `D = diag(sqrt(|1 + e_i|))`, which scales the diagonal by
    /// `|1 + e_i|` while keeping the matrix symmetric and positive semi-definite.
    pub fn next_matrix(&mut self) -> DMatrix<f64> {
        match &mut self.jitter {
            None => self.base.clone(),
            Some((normal, rng)) => {
                let n = self.base.nrows();
                let d = DVector::from_iterator(
                    n,
                    (0..n).map(|_| (1.0 + normal.sample(rng)).abs().sqrt()),
                );
                let d = DMatrix::from_diagonal(&d);
                &d * &self.base * &d
            }
        }
    }
}

/// Complete filter configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// State variant: quaternion (n = 9) or Euler angles (n = 8)
    pub orientation: OrientationKind,
    /// Path integration between headings
    pub path: PathModel,
    /// Sigma point parameters of the first step
    pub initial_sigma: SigmaParameters,
    /// Sigma point parameters of every later step and of the smoother
    pub sigma: SigmaParameters,
    pub covariance_update: CovarianceUpdate,
    pub fir: FirConfig,
    pub process_noise: NoiseConfig,
    pub measurement_noise: NoiseConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig::for_orientation(OrientationKind::Quaternion)
    }
}

impl FilterConfig {
    /// Defaults for the given state variant
    ///
    /// The acceleration variances stay small: the spread of the sigma points across the walking
    /// direction inflates the mean of `‖a‖`, and with it the predicted step length.
    pub fn for_orientation(orientation: OrientationKind) -> Self {
        let (process, measurement) = match orientation {
            OrientationKind::Quaternion => (
                vec![0.05, 0.05, 1e-3, 1e-3, 1e-3, 1e-4, 1e-4, 1e-4, 1e-4],
                vec![0.25, 0.25, 1e-2, 1e-2, 1e-2, 1e-3, 1e-3, 1e-3, 1e-3],
            ),
            OrientationKind::Euler => (
                vec![0.05, 0.05, 1e-3, 1e-3, 1e-3, 1e-3, 1e-3, 1e-3],
                vec![0.25, 0.25, 1e-2, 1e-2, 1e-2, 1e-2, 1e-2, 1e-2],
            ),
        };
        FilterConfig {
            orientation,
            path: PathModel::default(),
            initial_sigma: SigmaParameters::initial(),
            sigma: SigmaParameters::steady(),
            covariance_update: CovarianceUpdate::default(),
            fir: FirConfig::default(),
            process_noise: NoiseConfig::diagonal(process),
            measurement_noise: NoiseConfig::diagonal(measurement),
        }
    }
    pub fn state_dimension(&self) -> usize {
        self.orientation.state_dimension()
    }
    /// Check every documented range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.state_dimension();
        validate_sigma(&self.initial_sigma, n)?;
        validate_sigma(&self.sigma, n)?;
        if self.fir.order == 0 || self.fir.order % 2 != 0 {
            return Err(ConfigError::Fir {
                reason: "order must be even and positive",
            });
        }
        if !(self.fir.cutoff > 0.0 && self.fir.cutoff < PI) {
            return Err(ConfigError::Fir {
                reason: "cutoff must be in (0, pi) radians per sample",
            });
        }
        self.process_noise.validate(n, "process noise")?;
        self.measurement_noise
            .validate(self.orientation.measurement_dimension(), "measurement noise")?;
        Ok(())
    }
    pub fn measurement_noise_matrix(&self) -> Result<DMatrix<f64>, ConfigError> {
        self.measurement_noise
            .matrix
            .to_matrix(self.orientation.measurement_dimension(), "measurement noise")
    }
    pub fn process_noise(&self) -> Result<ProcessNoise, ConfigError> {
        ProcessNoise::from_config(&self.process_noise, self.state_dimension())
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn validate_sigma(parameters: &SigmaParameters, n: usize) -> Result<(), ConfigError> {
    let SigmaParameters { alpha, beta, kappa } = *parameters;
    if !(alpha > 0.0 && alpha <= 1.0) {
        return Err(ConfigError::SigmaParameter {
            name: "alpha",
            value: alpha,
            reason: "must be in (0, 1]",
        });
    }
    if !(beta.is_finite() && beta >= 0.0) {
        return Err(ConfigError::SigmaParameter {
            name: "beta",
            value: beta,
            reason: "must be finite and non-negative",
        });
    }
    if let Some(kappa) = kappa {
        if !kappa.is_finite() {
            return Err(ConfigError::SigmaParameter {
                name: "kappa",
                value: kappa,
                reason: "must be finite",
            });
        }
    }
    let spread = n as f64 + parameters.lambda_for(n);
    if !(spread > 0.0) {
        return Err(ConfigError::Spread { n, spread });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::env::temp_dir;

    #[test]
    fn defaults_are_valid() {
        for kind in [OrientationKind::Quaternion, OrientationKind::Euler] {
            let config = FilterConfig::for_orientation(kind);
            assert!(config.validate().is_ok());
            assert_eq!(
                config.measurement_noise_matrix().unwrap().nrows(),
                kind.measurement_dimension()
            );
        }
        let config = FilterConfig::default();
        assert_eq!(config.initial_sigma, SigmaParameters::new(0.6, 2.0, Some(-3.0)));
        assert_eq!(config.sigma, SigmaParameters::new(0.3, 2.0, None));
        assert_eq!(config.covariance_update, CovarianceUpdate::Joseph);
        assert_eq!(config.fir.order, 30);
    }

    #[test]
    fn rejects_bad_alpha() {
        let mut config = FilterConfig::default();
        config.sigma.alpha = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SigmaParameter { name: "alpha", .. })
        ));
        config.sigma.alpha = 1.5;
        assert!(config.validate().is_err());
        config.sigma.alpha = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_beta() {
        let mut config = FilterConfig::default();
        config.initial_sigma.beta = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SigmaParameter { name: "beta", .. })
        ));
    }

    #[test]
    fn rejects_collapsed_spread() {
        let mut config = FilterConfig::default();
        config.sigma.kappa = Some(-9.0);
        assert!(matches!(config.validate(), Err(ConfigError::Spread { n: 9, .. })));
    }

    #[test]
    fn rejects_noise_dimension_mismatch() {
        let mut config = FilterConfig::default();
        config.orientation = OrientationKind::Euler;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Dimension {
                what: "process noise",
                expected: 8,
                found: 9
            })
        );
    }

    #[test]
    fn rejects_negative_variance() {
        let mut config = FilterConfig::default();
        config.measurement_noise =
            NoiseConfig::diagonal(vec![1.0, -1.0, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidVariance { index: 1, .. })
        ));
    }

    #[test]
    fn full_noise_matrix() {
        let rows = vec![vec![2.0, 0.5], vec![0.5, 1.0]];
        let noise = NoiseMatrix::Full { rows };
        let m = noise.to_matrix(2, "test").unwrap();
        assert_eq!(m[(0, 1)], 0.5);
        assert_eq!(noise.dimension(), 2);
        let asymmetric = NoiseMatrix::Full {
            rows: vec![vec![2.0, 0.5], vec![0.4, 1.0]],
        };
        assert_eq!(
            asymmetric.to_matrix(2, "test"),
            Err(ConfigError::NotSymmetric { what: "test" })
        );
        let ragged = NoiseMatrix::Full {
            rows: vec![vec![2.0, 0.5], vec![0.5]],
        };
        assert!(ragged.to_matrix(2, "test").is_err());
    }

    #[test]
    fn rejects_bad_fir() {
        let mut config = FilterConfig::default();
        config.fir.order = 7;
        assert!(matches!(config.validate(), Err(ConfigError::Fir { .. })));
        config.fir.order = 30;
        config.fir.cutoff = 4.0;
        assert!(matches!(config.validate(), Err(ConfigError::Fir { .. })));
    }

    #[test]
    fn rejects_bad_jitter() {
        let mut config = FilterConfig::default();
        config.process_noise = config.process_noise.clone().with_jitter(-0.1, 1);
        assert!(matches!(config.validate(), Err(ConfigError::Jitter { .. })));
    }

    #[test]
    fn error_messages() {
        let err = ConfigError::Dimension {
            what: "process noise",
            expected: 9,
            found: 8,
        };
        assert_eq!(err.to_string(), "process noise has dimension 8, expected 9");
    }

    #[test]
    fn file_round_trips() {
        let mut config = FilterConfig::for_orientation(OrientationKind::Euler);
        config.path = PathModel::Straight;
        config.covariance_update = CovarianceUpdate::Subtractive;
        config.process_noise = config.process_noise.clone().with_jitter(0.1, 7);
        config.measurement_noise = NoiseConfig {
            matrix: NoiseMatrix::Full {
                rows: (0..8)
                    .map(|i| (0..8).map(|j| if i == j { 0.5 } else { 0.0 }).collect())
                    .collect(),
            },
            jitter: None,
        };
        let dir = temp_dir();
        for ext in ["json", "yaml", "yml", "toml"] {
            let path = dir.join(format!("deadreckon_config_round_trip.{ext}"));
            config.to_file(&path).unwrap();
            let read = FilterConfig::from_file(&path).unwrap();
            assert_eq!(read, config, "round trip through .{ext}");
            std::fs::remove_file(&path).ok();
        }
    }

    #[test]
    fn unsupported_extension() {
        let path = temp_dir().join("deadreckon_config.txt");
        let err = FilterConfig::default().to_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(FilterConfig::from_file(&path).is_err());
    }

    #[test]
    fn partial_config_uses_defaults() {
        let path = temp_dir().join("deadreckon_partial_config.json");
        std::fs::write(&path, r#"{ "sigma": { "alpha": 0.5, "beta": 2.0 } }"#).unwrap();
        let config = FilterConfig::from_json(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.sigma, SigmaParameters::new(0.5, 2.0, None));
        assert_eq!(config.orientation, OrientationKind::Quaternion);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fixed_process_noise() {
        let base = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 2.0]));
        let mut noise = ProcessNoise::fixed(base.clone());
        assert!(!noise.is_jittered());
        assert_eq!(noise.next_matrix(), base);
        assert_eq!(noise.next_matrix(), base);
    }

    #[test]
    fn jitter_is_seeded() {
        let config = NoiseConfig::diagonal(vec![1.0, 2.0, 3.0]).with_jitter(0.2, 11);
        let mut a = ProcessNoise::from_config(&config, 3).unwrap();
        let mut b = ProcessNoise::from_config(&config, 3).unwrap();
        let first = a.next_matrix();
        assert_eq!(first, b.next_matrix());
        assert_ne!(first, a.next_matrix());
        let other = NoiseConfig::diagonal(vec![1.0, 2.0, 3.0]).with_jitter(0.2, 12);
        let mut c = ProcessNoise::from_config(&other, 3).unwrap();
        assert_ne!(first, c.next_matrix());
    }

    #[test]
    fn jitter_keeps_symmetry() {
        let config = NoiseConfig {
            matrix: NoiseMatrix::Full {
                rows: vec![vec![1.0, 0.3], vec![0.3, 2.0]],
            },
            jitter: Some(NoiseJitter {
                relative_std: 0.5,
                seed: 3,
            }),
        };
        let mut noise = ProcessNoise::from_config(&config, 2).unwrap();
        for _ in 0..20 {
            let q = noise.next_matrix();
            assert_approx_eq!(q[(0, 1)], q[(1, 0)], 1e-15);
            assert!(q[(0, 0)] >= 0.0 && q[(1, 1)] >= 0.0);
            // Congruence keeps the determinant non-negative
            assert!(q.determinant() >= -1e-12);
        }
    }

    #[test]
    fn zero_jitter_is_base() {
        let config = NoiseConfig::diagonal(vec![1.0, 2.0]).with_jitter(0.0, 1);
        let mut noise = ProcessNoise::from_config(&config, 2).unwrap();
        assert!(noise.is_jittered());
        assert_eq!(noise.next_matrix(), *noise.base());
    }
}

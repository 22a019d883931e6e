//! Zero-lag low-pass FIR filtering of accelerometer data
//!
//! The filter is a Hamming-windowed sinc of even order $M$ centred on the current sample:
//!
//! $$
//! h[k] = \frac{\sin(\omega_c k)}{\pi k}\left(0.54 + 0.46 \cos\frac{2 \pi k}{M}\right), \quad
//! k = -M/2, \dots, M/2
//! $$
//!
//! with $h[0] = \omega_c / \pi$, normalised so that the taps sum to one (unit DC gain). Because the
//! taps are symmetric about the centre the filter introduces no group delay.
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Default filter order
pub const DEFAULT_ORDER: usize = 30;
/// Default cutoff in radians per sample
pub const DEFAULT_CUTOFF: f64 = 2.0;

/// Filter design parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FirConfig {
    pub order: usize,
    /// Cutoff in radians per sample, in (0, π)
    pub cutoff: f64,
}

impl Default for FirConfig {
    fn default() -> Self {
        FirConfig {
            order: DEFAULT_ORDER,
            cutoff: DEFAULT_CUTOFF,
        }
    }
}

/// Hamming-windowed zero-lag low-pass FIR filter
#[derive(Clone, Debug, PartialEq)]
pub struct LowPassFir {
    taps: Vec<f64>,
}

impl Default for LowPassFir {
    fn default() -> Self {
        LowPassFir::hamming(DEFAULT_ORDER, DEFAULT_CUTOFF)
    }
}

impl LowPassFir {
    /// Design the filter
    ///
    /// # Panics
    /// When `order` is zero or odd (an odd order has no centre tap), or `cutoff` is outside (0, π).
    pub fn hamming(order: usize, cutoff: f64) -> Self {
        assert!(
            order > 0 && order % 2 == 0,
            "LowPassFir::hamming: order must be even and positive"
        );
        assert!(
            cutoff > 0.0 && cutoff < PI,
            "LowPassFir::hamming: cutoff must be in (0, pi)"
        );
        let half = (order / 2) as i64;
        let mut taps: Vec<f64> = (-half..=half)
            .map(|k| {
                let k = k as f64;
                let ideal = if k == 0.0 {
                    cutoff / PI
                } else {
                    (cutoff * k).sin() / (PI * k)
                };
                let window = 0.54 + 0.46 * (2.0 * PI * k / order as f64).cos();
                ideal * window
            })
            .collect();
        let gain: f64 = taps.iter().sum();
        taps.iter_mut().for_each(|t| *t /= gain);
        LowPassFir { taps }
    }
    pub fn from_config(config: &FirConfig) -> Self {
        LowPassFir::hamming(config.order, config.cutoff)
    }
    pub fn taps(&self) -> &[f64] {
        &self.taps
    }
    pub fn order(&self) -> usize {
        self.taps.len() - 1
    }
    /// Sum of the taps (one up to round-off)
    pub fn dc_gain(&self) -> f64 {
        self.taps.iter().sum()
    }
    /// Response to a signal held constant at `value` over the whole filter support
    ///
    /// Equal to `value` up to round-off, since the taps sum to one.
    pub fn hold_response(&self, value: f64) -> f64 {
        self.taps.iter().map(|t| t * value).sum()
    }
    /// Zero-lag output at `index` of `signal`, with the sample at `index` replaced by `value`
    ///
    /// Neighbours beyond either end repeat the first or last sample. An empty signal gives the
    /// [LowPassFir::hold_response] of `value`.
    pub fn response_at(&self, signal: &[f64], index: usize, value: f64) -> f64 {
        if signal.is_empty() {
            return self.hold_response(value);
        }
        let last = signal.len() - 1;
        let index = index.min(last);
        self.window_sum(index as isize, last as isize, |i| {
            if i == index { value } else { signal[i] }
        })
    }
    /// Filter a whole time series without lag
    ///
    /// The ends are padded by repeating the first and last samples.
    pub fn apply(&self, signal: &[f64]) -> Vec<f64> {
        if signal.is_empty() {
            return Vec::new();
        }
        let last = signal.len() as isize - 1;
        (0..signal.len() as isize)
            .map(|i| self.window_sum(i, last, |j| signal[j]))
            .collect()
    }
    fn window_sum(&self, centre: isize, last: isize, sample: impl Fn(usize) -> f64) -> f64 {
        let half = (self.taps.len() / 2) as isize;
        self.taps
            .iter()
            .enumerate()
            .map(|(j, t)| t * sample((centre + j as isize - half).clamp(0, last) as usize))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn default_design() {
        let fir = LowPassFir::default();
        assert_eq!(fir.taps().len(), DEFAULT_ORDER + 1);
        assert_eq!(fir.order(), DEFAULT_ORDER);
        assert_approx_eq!(fir.dc_gain(), 1.0, 1e-12);
    }

    #[test]
    fn taps_are_symmetric() {
        let fir = LowPassFir::hamming(20, 1.0);
        let taps = fir.taps();
        for k in 0..taps.len() {
            assert_approx_eq!(taps[k], taps[taps.len() - 1 - k], 1e-15);
        }
        let centre = taps[taps.len() / 2];
        assert!(taps.iter().all(|&t| t <= centre));
    }

    #[test]
    fn hold_response_preserves_constant() {
        let fir = LowPassFir::default();
        assert_approx_eq!(fir.hold_response(3.5), 3.5, 1e-12);
        assert_approx_eq!(fir.hold_response(-0.25), -0.25, 1e-12);
    }

    #[test]
    fn constant_series_passes_unchanged() {
        let fir = LowPassFir::default();
        let signal = vec![1.25; 50];
        for value in fir.apply(&signal) {
            assert_approx_eq!(value, 1.25, 1e-12);
        }
    }

    #[test]
    fn nyquist_is_attenuated() {
        let fir = LowPassFir::default();
        let signal: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let filtered = fir.apply(&signal);
        for value in &filtered[20..80] {
            assert!(value.abs() < 0.05, "residual {value}");
        }
    }

    #[test]
    fn no_group_delay() {
        let fir = LowPassFir::hamming(30, 0.5);
        let signal: Vec<f64> = (0..101)
            .map(|i| match i {
                0..50 => 0.0,
                50 => 0.5,
                _ => 1.0,
            })
            .collect();
        let filtered = fir.apply(&signal);
        assert_approx_eq!(filtered[50], 0.5, 1e-12);
        assert!(filtered[45] < 0.5 && filtered[55] > 0.5);
    }

    #[test]
    fn response_at_matches_series_filtering() {
        let fir = LowPassFir::hamming(10, 0.8);
        let signal: Vec<f64> = (0..40).map(|i| (0.7 * i as f64).sin()).collect();
        let filtered = fir.apply(&signal);
        for index in [0, 3, 20, 39] {
            let response = fir.response_at(&signal, index, signal[index]);
            assert_approx_eq!(response, filtered[index], 1e-12);
        }
    }

    #[test]
    fn response_at_depends_on_cutoff_and_centre() {
        let signal: Vec<f64> = (0..21).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let narrow = LowPassFir::hamming(10, 0.3).response_at(&signal, 10, 1.0);
        let wide = LowPassFir::hamming(10, 2.5).response_at(&signal, 10, 1.0);
        assert!(narrow.abs() < 0.5, "narrow band left {narrow}");
        assert!((wide - narrow).abs() > 0.1);
        let fir = LowPassFir::hamming(10, 1.0);
        let centre = fir.taps()[5];
        let shifted = fir.response_at(&signal, 10, 2.0) - fir.response_at(&signal, 10, 1.0);
        assert_approx_eq!(shifted, centre, 1e-12);
        assert_approx_eq!(fir.response_at(&[], 0, 0.75), 0.75, 1e-12);
    }

    #[test]
    fn empty_series() {
        assert!(LowPassFir::default().apply(&[]).is_empty());
    }

    #[test]
    #[should_panic(expected = "order must be even and positive")]
    fn odd_order_panics() {
        let _ = LowPassFir::hamming(7, 1.0);
    }
}

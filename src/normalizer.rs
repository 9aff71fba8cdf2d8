//! Maps every slice of every series into a shared [0, 1] intensity range.

use log::{debug, info};
use rayon::prelude::*;

use crate::slice::SliceSeries;

/// Upper bound on intensities sampled from one series.
pub const MAX_SAMPLES_PER_SERIES: usize = 100_000;
/// Quantile levels used for cross-series histogram matching.
pub const MATCH_QUANTILES: [f64; 9] = [0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99];

const LOW_PERCENTILE: f64 = 0.01;
const HIGH_PERCENTILE: f64 = 0.99;
const MIN_WINDOW_WIDTH: f32 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntensityWindow {
    pub low: f32,
    pub high: f32,
}

impl IntensityWindow {
    #[inline]
    pub fn apply(&self, v: f32) -> f32 {
        ((v - self.low) / (self.high - self.low)).clamp(0.0, 1.0)
    }
}

pub struct IntensityNormalizer {
    pub histogram_match: bool,
    pub max_samples_per_series: usize,
}

impl Default for IntensityNormalizer {
    fn default() -> Self {
        Self {
            histogram_match: false,
            max_samples_per_series: MAX_SAMPLES_PER_SERIES,
        }
    }
}

impl IntensityNormalizer {
    pub fn new(histogram_match: bool) -> Self {
        Self {
            histogram_match,
            ..Self::default()
        }
    }

    /// Rewrites every slice in place and returns the window used.
    pub fn normalize(&self, series: &mut [SliceSeries]) -> IntensityWindow {
        if self.histogram_match && series.len() > 1 {
            self.match_histograms(series);
        }

        let pooled = self.pooled_samples(series);
        let window = Self::robust_window(&pooled);
        info!(
            "Intensity window [{:.4}, {:.4}] from {} samples",
            window.low,
            window.high,
            pooled.len()
        );

        for s in series.iter_mut() {
            s.slices.par_iter_mut().for_each(|slice| {
                slice.pixels.mapv_inplace(|v| window.apply(v));
            });
        }
        window
    }

    /// Deterministic strided sample of one series' pixels.
    pub fn sample_series(&self, series: &SliceSeries) -> Vec<f32> {
        let total = series.pixel_count();
        if total == 0 {
            return Vec::new();
        }
        let stride = total.div_ceil(self.max_samples_per_series.max(1)).max(1);
        series
            .slices
            .iter()
            .flat_map(|s| s.pixels.iter().copied())
            .step_by(stride)
            .collect()
    }

    fn pooled_samples(&self, series: &[SliceSeries]) -> Vec<f32> {
        let mut pooled: Vec<f32> = series.iter().flat_map(|s| self.sample_series(s)).collect();
        pooled.sort_by(f32::total_cmp);
        pooled
    }

    /// 1st/99th percentile of a sorted sample, or its min/max when that
    /// window collapses.
    pub fn robust_window(sorted: &[f32]) -> IntensityWindow {
        let (Some(&min), Some(&max)) = (sorted.first(), sorted.last()) else {
            return IntensityWindow { low: 0.0, high: 1.0 };
        };
        let low = quantile(sorted, LOW_PERCENTILE);
        let high = quantile(sorted, HIGH_PERCENTILE);
        if high - low > MIN_WINDOW_WIDTH {
            return IntensityWindow { low, high };
        }
        if max - min > MIN_WINDOW_WIDTH {
            debug!("Degenerate percentile window, using min/max");
            return IntensityWindow { low: min, high: max };
        }
        // Constant data maps to 1 unless it is all zero.
        if min > 0.0 {
            IntensityWindow { low: 0.0, high: min }
        } else {
            IntensityWindow { low: min, high: min + 1.0 }
        }
    }

    fn match_histograms(&self, series: &mut [SliceSeries]) {
        let pooled = self.pooled_samples(series);
        if pooled.is_empty() {
            return;
        }
        let reference: Vec<f32> = MATCH_QUANTILES.iter().map(|q| quantile(&pooled, *q)).collect();

        for s in series.iter_mut() {
            let mut sample = self.sample_series(s);
            if sample.is_empty() {
                continue;
            }
            sample.sort_by(f32::total_cmp);
            let own: Vec<f32> = MATCH_QUANTILES.iter().map(|q| quantile(&sample, *q)).collect();
            let Some(map) = QuantileMap::new(&own, &reference) else {
                debug!("Series {} has a flat histogram, not matched", s.series_uid);
                continue;
            };
            s.slices.par_iter_mut().for_each(|slice| {
                slice.pixels.mapv_inplace(|v| map.apply(v));
            });
            debug!("Histogram matched series {}", s.series_uid);
        }
    }
}

/// Nearest-rank quantile of a sorted sample.
pub fn quantile(sorted: &[f32], q: f64) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx]
}

/// Piecewise-linear map through (source, target) knots, extrapolating
/// with the end segments.
struct QuantileMap {
    knots: Vec<(f32, f32)>,
}

impl QuantileMap {
    fn new(source: &[f32], target: &[f32]) -> Option<Self> {
        let mut knots: Vec<(f32, f32)> = Vec::with_capacity(source.len());
        for (&s, &t) in source.iter().zip(target) {
            match knots.last() {
                Some(&(ls, _)) if s - ls <= MIN_WINDOW_WIDTH => {}
                _ => knots.push((s, t)),
            }
        }
        (knots.len() >= 2).then_some(Self { knots })
    }

    fn apply(&self, v: f32) -> f32 {
        let k = &self.knots;
        let seg = match k.iter().position(|(s, _)| v < *s) {
            Some(0) => 0,
            Some(i) => i - 1,
            None => k.len() - 2,
        }
        .min(k.len() - 2);
        let (s0, t0) = k[seg];
        let (s1, t1) = k[seg + 1];
        t0 + (v - s0) * (t1 - t0) / (s1 - s0)
    }
}

//! Quality auto-tuning.
//!
//! Bisects a codec's quality option until the encode/decode round trip lands
//! close to a target perceptual distance, or the round budget runs out.

use serde_json::{Map, Value};
use std::future::Future;
use tracing::debug;

use crate::codec::{merge_options, Bitmap, Codec, DistanceMetric};
use crate::error::JobError;
use crate::job::Attempt;

/// How close to the target a round must land to stop early.
pub const DEFAULT_TOLERANCE: f64 = 0.1;

/// Significant digits kept in the reported quality.
pub const REPORTED_DIGITS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub min: f64,
    pub max: f64,
    pub target: f64,
    pub max_rounds: u32,
    pub tolerance: f64,
}

impl SearchParams {
    pub fn new(min: f64, max: f64, target: f64, max_rounds: u32) -> Self {
        Self {
            min,
            max,
            target,
            max_rounds,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// One probed quality and the distance it produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
    pub quality: f64,
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub struct Optimized {
    /// Unrounded quality of the winning round.
    pub quality: f64,
    pub attempt: Attempt,
    /// Every round in the order it ran.
    pub probes: Vec<Probe>,
}

impl Optimized {
    pub fn resolved_quality(&self) -> f64 {
        round_significant(self.quality, REPORTED_DIGITS)
    }

    pub fn rounds(&self) -> usize {
        self.probes.len()
    }
}

/// Bisect `[min, max]` for the quality whose round trip is closest to the
/// target distance.
///
/// `trial(quality)` encodes, decodes and measures. The winner is the closest
/// round overall, not the last one, because distortion is only monotonic in
/// quality in expectation. A zero round budget still runs one round.
pub async fn auto_optimize<F, Fut>(
    params: &SearchParams,
    mut trial: F,
) -> Result<Optimized, JobError>
where
    F: FnMut(f64) -> Fut,
    Fut: Future<Output = Result<Attempt, JobError>>,
{
    if !(params.min <= params.max) || !params.target.is_finite() {
        return Err(JobError::Codec(format!(
            "invalid search: range [{}, {}], target {}",
            params.min, params.max, params.target
        )));
    }

    let (mut lo, mut hi) = (params.min, params.max);
    let mut probes = Vec::new();
    let mut best: Option<(f64, Attempt)> = None;

    for round in 1..=params.max_rounds.max(1) {
        let quality = (lo + hi) / 2.0;
        let attempt = trial(quality).await?;
        let distance = attempt.distance;
        let miss = (distance - params.target).abs();
        debug!(round, quality, distance, "optimizer round");
        probes.push(Probe { quality, distance });

        let improves = match &best {
            Some((_, current)) => miss < (current.distance - params.target).abs(),
            None => true,
        };
        if improves {
            best = Some((quality, attempt));
        }

        if miss <= params.tolerance {
            break;
        }
        if distance > params.target {
            lo = quality;
        } else {
            hi = quality;
        }
    }

    let (quality, attempt) =
        best.ok_or_else(|| JobError::Codec("optimizer ran no rounds".into()))?;
    Ok(Optimized {
        quality,
        attempt,
        probes,
    })
}

/// One synchronous round: encode `original` at `quality`, decode, measure.
pub fn round_trip(
    codec: &dyn Codec,
    metric: &dyn DistanceMetric,
    original: &Bitmap,
    quality: f64,
) -> Result<Attempt, JobError> {
    let auto = codec.auto_optimize().ok_or_else(|| {
        JobError::Unsupported(format!("{} has no auto-optimizable option", codec.name()))
    })?;
    let options = merge_options(&codec.default_options(), &quality_option(auto.option, quality));
    let binary = codec.encode(original, &options)?;
    let bitmap = codec.decode(&binary)?;
    let distance = metric.distance(original, &bitmap)?;
    Ok(Attempt {
        binary,
        bitmap,
        distance,
    })
}

/// `{"<option>": quality}` as an options object.
pub fn quality_option(option: &str, quality: f64) -> Value {
    let mut map = Map::new();
    map.insert(option.to_string(), Value::from(quality));
    Value::Object(map)
}

/// Annotation shown next to an auto-tuned output, e.g.
/// ` using --jpeg '{"quality":71.875}'`.
pub fn info_text(codec: &str, option: &str, resolved: f64) -> String {
    format!(" using --{codec} '{}'", quality_option(option, resolved))
}

pub fn round_significant(value: f64, digits: u32) -> f64 {
    if value == 0.0 || !value.is_finite() || digits == 0 {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let factor = 10f64.powi(digits as i32 - 1 - magnitude);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn pixel() -> Bitmap {
        Bitmap::new(1, 1, vec![0, 0, 0, 255]).unwrap()
    }

    fn attempt(distance: f64) -> Attempt {
        Attempt {
            binary: distance.to_le_bytes().to_vec(),
            bitmap: pixel(),
            distance,
        }
    }

    /// Monotonic curve: 0 at quality 100, 10 at quality 0.
    fn linear(quality: f64) -> f64 {
        (100.0 - quality) / 10.0
    }

    #[tokio::test]
    async fn test_converges_on_monotonic_curve() {
        let params = SearchParams::new(0.0, 100.0, 5.0, 8);
        let calls = RefCell::new(0);
        let result = auto_optimize(&params, |q| {
            *calls.borrow_mut() += 1;
            async move { Ok(attempt(linear(q))) }
        })
        .await
        .unwrap();

        // Midpoint already hits the target exactly.
        assert_eq!(result.quality, 50.0);
        assert_eq!(result.rounds(), 1);
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test]
    async fn test_stays_within_round_budget_and_returns_closest() {
        let params = SearchParams::new(0.0, 100.0, 5.0, 8).with_tolerance(0.0);
        let curve = |q: f64| (100.0 - q).powf(1.3) / 20.0;
        let result = auto_optimize(&params, |q| async move { Ok(attempt(curve(q))) })
            .await
            .unwrap();

        assert!(result.rounds() <= 8);
        let best_miss = result
            .probes
            .iter()
            .map(|p| (p.distance - 5.0).abs())
            .fold(f64::INFINITY, f64::min);
        assert_eq!((result.attempt.distance - 5.0).abs(), best_miss);
    }

    #[tokio::test]
    async fn test_best_round_need_not_be_the_last() {
        // Non-monotonic codec: only quality 75 lands near the target.
        let params = SearchParams::new(0.0, 100.0, 2.0, 4).with_tolerance(0.0);
        let noisy = |q: f64| if q == 75.0 { 2.05 } else { 9.0 };
        let result = auto_optimize(&params, |q| async move { Ok(attempt(noisy(q))) })
            .await
            .unwrap();

        assert_eq!(result.rounds(), 4);
        assert_eq!(result.quality, 75.0);
        assert_ne!(result.probes.last().unwrap().quality, 75.0);
    }

    #[tokio::test]
    async fn test_flat_response_terminates() {
        let params = SearchParams::new(0.0, 100.0, 1.0, 6);
        let result = auto_optimize(&params, |_| async { Ok(attempt(3.0)) })
            .await
            .unwrap();
        assert_eq!(result.rounds(), 6);
        // Ties keep the first round.
        assert_eq!(result.quality, 50.0);
    }

    #[tokio::test]
    async fn test_is_deterministic() {
        let params = SearchParams::new(0.0, 100.0, 1.4, 8);
        let curve = |q: f64| 8.0 * (-(q / 30.0)).exp();
        let a = auto_optimize(&params, |q| async move { Ok(attempt(curve(q))) })
            .await
            .unwrap();
        let b = auto_optimize(&params, |q| async move { Ok(attempt(curve(q))) })
            .await
            .unwrap();
        assert_eq!(a.resolved_quality(), b.resolved_quality());
        assert_eq!(a.probes, b.probes);
    }

    #[tokio::test]
    async fn test_zero_rounds_still_probes_once() {
        let params = SearchParams::new(0.0, 100.0, 5.0, 0);
        let result = auto_optimize(&params, |q| async move { Ok(attempt(linear(q) + 1.0)) })
            .await
            .unwrap();
        assert_eq!(result.rounds(), 1);
    }

    #[tokio::test]
    async fn test_round_errors_propagate() {
        let params = SearchParams::new(0.0, 100.0, 5.0, 8);
        let err = auto_optimize(&params, |_| async { Err(JobError::Codec("boom".into())) })
            .await
            .unwrap_err();
        assert_eq!(err, JobError::Codec("boom".into()));
    }

    #[tokio::test]
    async fn test_rejects_inverted_range() {
        let params = SearchParams::new(10.0, 0.0, 5.0, 8);
        assert!(auto_optimize(&params, |_| async { Ok(attempt(1.0)) })
            .await
            .is_err());
    }

    #[test]
    fn test_round_significant() {
        assert_eq!(round_significant(71.875, 5), 71.875);
        assert_eq!(round_significant(71.8754321, 5), 71.875);
        assert_eq!(round_significant(0.123456, 5), 0.12346);
        assert_eq!(round_significant(0.0, 5), 0.0);
    }

    #[test]
    fn test_info_text() {
        assert_eq!(
            info_text("jpeg", "quality", 71.875),
            " using --jpeg '{\"quality\":71.875}'"
        );
    }
}

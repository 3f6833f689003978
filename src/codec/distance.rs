use anyhow::{anyhow, Result};

use super::{Bitmap, DistanceMetric};

// Rec. 601 luma weights; alpha counts like a fourth channel.
const WEIGHTS: [f64; 4] = [0.299, 0.587, 0.114, 0.25];

/// Weighted root-mean-square pixel difference, divided by `scale`.
///
/// With the default scale a distance of about 1.0 is a small but visible
/// difference, similar in magnitude to butteraugli scores.
#[derive(Debug, Clone)]
pub struct RmsDistance {
    pub scale: f64,
}

impl Default for RmsDistance {
    fn default() -> Self {
        Self { scale: 2.0 }
    }
}

impl DistanceMetric for RmsDistance {
    fn name(&self) -> &'static str {
        "rms"
    }

    fn distance(&self, original: &Bitmap, reconstructed: &Bitmap) -> Result<f64> {
        if (original.width, original.height) != (reconstructed.width, reconstructed.height) {
            return Err(anyhow!(
                "cannot compare {}x{} with {}x{}",
                original.width,
                original.height,
                reconstructed.width,
                reconstructed.height
            ));
        }
        if original.pixel_count() == 0 {
            return Ok(0.0);
        }

        let weight_sum: f64 = WEIGHTS.iter().sum();
        let sum: f64 = original
            .data()
            .chunks_exact(4)
            .zip(reconstructed.data().chunks_exact(4))
            .map(|(a, b)| {
                (0..4)
                    .map(|c| {
                        let d = a[c] as f64 - b[c] as f64;
                        WEIGHTS[c] * d * d
                    })
                    .sum::<f64>()
            })
            .sum();

        let mse = sum / (original.pixel_count() as f64 * weight_sum);
        Ok(mse.sqrt() / self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_bitmaps_have_zero_distance() {
        let a = Bitmap::new(2, 1, vec![10, 20, 30, 255, 40, 50, 60, 255]).unwrap();
        assert_eq!(RmsDistance::default().distance(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn test_uniform_offset() {
        let a = Bitmap::new(1, 1, vec![100, 100, 100, 255]).unwrap();
        let b = Bitmap::new(1, 1, vec![104, 104, 104, 255]).unwrap();
        let metric = RmsDistance { scale: 1.0 };
        let d = metric.distance(&a, &b).unwrap();
        let expected = (16.0 * 1.0 / 1.25f64).sqrt();
        assert!((d - expected).abs() < 1e-9);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let a = Bitmap::new(1, 1, vec![0; 4]).unwrap();
        let b = Bitmap::new(1, 2, vec![0; 8]).unwrap();
        assert!(RmsDistance::default().distance(&a, &b).is_err());
    }
}

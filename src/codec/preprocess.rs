use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use serde_json::{json, Value};

use super::{Bitmap, Preprocessor};

/// Resize to `width` and/or `height`. With only one side given the other is
/// derived from the aspect ratio.
pub struct Resize;

impl Resize {
    fn filter(options: &Value) -> Result<FilterType> {
        match options.get("method").and_then(Value::as_str) {
            None | Some("lanczos3") => Ok(FilterType::Lanczos3),
            Some("nearest") => Ok(FilterType::Nearest),
            Some("triangle") => Ok(FilterType::Triangle),
            Some("catrom") => Ok(FilterType::CatmullRom),
            Some("gaussian") => Ok(FilterType::Gaussian),
            Some(other) => Err(anyhow!("unknown resize method: {other}")),
        }
    }

    fn target_size(bitmap: &Bitmap, options: &Value) -> Result<(u32, u32)> {
        let dim = |key: &str| -> Result<Option<u32>> {
            match options.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => v
                    .as_u64()
                    .filter(|&n| n > 0 && n <= u32::MAX as u64)
                    .map(|n| Some(n as u32))
                    .ok_or_else(|| anyhow!("resize {key} must be a positive integer, got {v}")),
            }
        };

        let aspect = bitmap.width as f64 / bitmap.height.max(1) as f64;
        match (dim("width")?, dim("height")?) {
            (Some(w), Some(h)) => Ok((w, h)),
            (Some(w), None) => Ok((w, ((w as f64 / aspect).round() as u32).max(1))),
            (None, Some(h)) => Ok((((h as f64 * aspect).round() as u32).max(1), h)),
            (None, None) => Err(anyhow!("resize needs a width or a height")),
        }
    }
}

impl Preprocessor for Resize {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn default_options(&self) -> Value {
        json!({ "width": null, "height": null, "method": "lanczos3" })
    }

    fn process(&self, bitmap: &Bitmap, options: &Value) -> Result<Bitmap> {
        let (width, height) = Self::target_size(bitmap, options)?;
        let filter = Self::filter(options)?;
        let img = bitmap.to_rgba_image()?;
        Ok(imageops::resize(&img, width, height, filter).into())
    }
}

/// Rotate by `numRotations` quarter turns clockwise.
pub struct Rotate;

impl Preprocessor for Rotate {
    fn name(&self) -> &'static str {
        "rotate"
    }

    fn default_options(&self) -> Value {
        json!({ "numRotations": 0 })
    }

    fn process(&self, bitmap: &Bitmap, options: &Value) -> Result<Bitmap> {
        let turns = match options.get("numRotations") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| anyhow!("numRotations must be an integer, got {v}"))?,
        };
        let img = bitmap.to_rgba_image()?;
        let rotated = match turns.rem_euclid(4) {
            1 => imageops::rotate90(&img),
            2 => imageops::rotate180(&img),
            3 => imageops::rotate270(&img),
            _ => img,
        };
        Ok(rotated.into())
    }
}

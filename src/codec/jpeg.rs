use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageFormat};
use serde_json::{json, Value};

use super::{AutoOptimize, Bitmap, Codec};

/// Baseline JPEG through the `image` crate.
///
/// Options: `quality` (0-100, fractional values are rounded). Alpha is
/// composited over white since JPEG has no alpha channel.
pub struct JpegCodec;

impl JpegCodec {
    fn quality(options: &Value) -> Result<u8> {
        let quality = match options.get("quality") {
            None | Some(Value::Null) => 75.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| anyhow!("jpeg quality must be a number, got {v}"))?,
        };
        Ok(quality.round().clamp(1.0, 100.0) as u8)
    }
}

impl Codec for JpegCodec {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn extension(&self) -> &'static str {
        "jpg"
    }

    fn detect(&self, header: &[u8]) -> bool {
        header.starts_with(&[0xFF, 0xD8, 0xFF])
    }

    fn default_options(&self) -> Value {
        json!({ "quality": 75 })
    }

    fn auto_optimize(&self) -> Option<AutoOptimize> {
        Some(AutoOptimize {
            option: "quality",
            min: 0.0,
            max: 100.0,
        })
    }

    fn decode(&self, data: &[u8]) -> Result<Bitmap> {
        let img = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .context("failed to decode jpeg")?;
        Ok(img.into_rgba8().into())
    }

    fn encode(&self, bitmap: &Bitmap, options: &Value) -> Result<Vec<u8>> {
        let quality = Self::quality(options)?;

        let mut rgb = Vec::with_capacity(bitmap.pixel_count() * 3);
        for px in bitmap.data().chunks_exact(4) {
            let alpha = px[3] as u32;
            for &c in &px[..3] {
                rgb.push(((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8);
            }
        }

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&rgb, bitmap.width, bitmap.height, ColorType::Rgb8)
            .context("failed to encode jpeg")?;
        Ok(out)
    }
}

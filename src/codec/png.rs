use anyhow::{anyhow, Context, Result};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, ImageEncoder, ImageFormat};
use serde_json::{json, Value};

use super::{Bitmap, Codec};

/// Lossless PNG. Options: `compression` (`"fast"`, `"default"` or `"best"`).
pub struct PngCodec;

const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

impl PngCodec {
    fn compression(options: &Value) -> Result<CompressionType> {
        match options.get("compression").and_then(Value::as_str) {
            None | Some("default") => Ok(CompressionType::Default),
            Some("fast") => Ok(CompressionType::Fast),
            Some("best") => Ok(CompressionType::Best),
            Some(other) => Err(anyhow!("unknown png compression level: {other}")),
        }
    }
}

impl Codec for PngCodec {
    fn name(&self) -> &'static str {
        "png"
    }

    fn extension(&self) -> &'static str {
        "png"
    }

    fn detect(&self, header: &[u8]) -> bool {
        header.starts_with(&PNG_MAGIC)
    }

    fn default_options(&self) -> Value {
        json!({ "compression": "default" })
    }

    fn decode(&self, data: &[u8]) -> Result<Bitmap> {
        let img = image::load_from_memory_with_format(data, ImageFormat::Png)
            .context("failed to decode png")?;
        Ok(img.into_rgba8().into())
    }

    fn encode(&self, bitmap: &Bitmap, options: &Value) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        PngEncoder::new_with_quality(&mut out, Self::compression(options)?, FilterType::Adaptive)
            .write_image(bitmap.data(), bitmap.width, bitmap.height, ColorType::Rgba8)
            .context("failed to encode png")?;
        Ok(out)
    }
}

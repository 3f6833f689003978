//! Codec collaborators: the pixel buffer that flows between jobs and the
//! traits that decoders, encoders, preprocessors and distance metrics
//! implement. Built-in implementations live in the submodules.

use anyhow::{anyhow, Result};
use image::RgbaImage;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

mod distance;
mod jpeg;
mod png;
mod preprocess;

pub use distance::RmsDistance;
pub use jpeg::JpegCodec;
pub use png::PngCodec;
pub use preprocess::{Resize, Rotate};

/// Number of leading bytes handed to codec detectors.
pub const DETECT_HEADER_LEN: usize = 16;

/// Decoded image: width, height and packed RGBA bytes.
///
/// The pixel data is shared and never mutated; preprocessing produces a new
/// bitmap instead of editing this one.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    data: Arc<[u8]>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(anyhow!(
                "RGBA buffer for {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data: data.into(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn to_rgba_image(&self) -> Result<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.data.to_vec())
            .ok_or_else(|| anyhow!("bitmap buffer does not match its dimensions"))
    }
}

impl From<RgbaImage> for Bitmap {
    fn from(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw().into(),
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Which encoder option the auto-optimizer tunes and over what range.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoOptimize {
    pub option: &'static str,
    pub min: f64,
    pub max: f64,
}

/// An image format that can be detected, decoded and encoded.
///
/// Higher values of the auto-optimized option must mean less distortion in
/// expectation.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn extension(&self) -> &'static str;
    fn detect(&self, header: &[u8]) -> bool;
    fn default_options(&self) -> Value;
    fn auto_optimize(&self) -> Option<AutoOptimize> {
        None
    }
    fn decode(&self, data: &[u8]) -> Result<Bitmap>;
    fn encode(&self, bitmap: &Bitmap, options: &Value) -> Result<Vec<u8>>;
}

/// A bitmap-to-bitmap pass applied before encoding.
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn default_options(&self) -> Value;
    fn process(&self, bitmap: &Bitmap, options: &Value) -> Result<Bitmap>;
}

/// Perceptual distance between an original and a reconstructed bitmap.
/// Zero means identical; larger means more visible difference.
pub trait DistanceMetric: Send + Sync {
    fn name(&self) -> &'static str;
    fn distance(&self, original: &Bitmap, reconstructed: &Bitmap) -> Result<f64>;
}

/// Shallow merge of an options object over a codec's defaults.
///
/// Non-object overrides (`true`, `null`) leave the defaults untouched.
pub fn merge_options(defaults: &Value, overrides: &Value) -> Value {
    let mut merged = match defaults {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(over) = overrides {
        for (key, value) in over {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Ordered set of codecs and preprocessors plus the distance metric.
///
/// Registration order is the order in which preprocessing passes run and
/// encode jobs are dispatched.
#[derive(Clone)]
pub struct Registry {
    codecs: Vec<Arc<dyn Codec>>,
    preprocessors: Vec<Arc<dyn Preprocessor>>,
    metric: Arc<dyn DistanceMetric>,
}

impl Registry {
    pub fn new(metric: impl DistanceMetric + 'static) -> Self {
        Self {
            codecs: Vec::new(),
            preprocessors: Vec::new(),
            metric: Arc::new(metric),
        }
    }

    /// The codecs and passes that ship with pixpress.
    pub fn builtin() -> Self {
        Self::new(RmsDistance::default())
            .with_preprocessor(Resize)
            .with_preprocessor(Rotate)
            .with_codec(JpegCodec)
            .with_codec(PngCodec)
    }

    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codecs.push(Arc::new(codec));
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: impl Preprocessor + 'static) -> Self {
        self.preprocessors.push(Arc::new(preprocessor));
        self
    }

    pub fn codecs(&self) -> impl Iterator<Item = &dyn Codec> {
        self.codecs.iter().map(|c| c.as_ref())
    }

    pub fn preprocessors(&self) -> impl Iterator<Item = &dyn Preprocessor> {
        self.preprocessors.iter().map(|p| p.as_ref())
    }

    pub fn codec(&self, name: &str) -> Option<&dyn Codec> {
        self.codecs().find(|c| c.name() == name)
    }

    pub fn preprocessor(&self, name: &str) -> Option<&dyn Preprocessor> {
        self.preprocessors().find(|p| p.name() == name)
    }

    pub fn metric(&self) -> &dyn DistanceMetric {
        self.metric.as_ref()
    }

    /// Find the codec whose detector accepts the leading bytes of `data`.
    pub fn detect(&self, data: &[u8]) -> Option<&dyn Codec> {
        let header = &data[..data.len().min(DETECT_HEADER_LEN)];
        self.codecs().find(|c| c.detect(header))
    }
}

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::codec::Bitmap;

/// A named input blob, as handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFile {
    pub name: String,
    pub data: Arc<[u8]>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Output name for this input: `output_dir/<stem><suffix>.<extension>`.
    pub fn output_name(&self, output_dir: &str, suffix: &str, extension: &str) -> String {
        let stem = Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone());
        let file_name = format!("{stem}{suffix}.{extension}");
        if output_dir.is_empty() {
            file_name
        } else {
            Path::new(output_dir)
                .join(file_name)
                .to_string_lossy()
                .into_owned()
        }
    }
}

/// Result of a decode job; the bitmap is replaced by every preprocess pass.
#[derive(Debug, Clone)]
pub struct DecodedFile {
    pub file: InputFile,
    pub bitmap: Bitmap,
    pub size: usize,
}

/// How an encode job picks its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeConfig {
    /// Options merged over the codec defaults.
    Fixed(Value),
    /// Search for the quality that meets the distance target.
    Auto { target: f64, max_rounds: u32 },
}

#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub file: DecodedFile,
    pub codec: String,
    pub config: EncodeConfig,
    pub output_file: String,
}

/// A unit of codec work for one worker.
#[derive(Debug, Clone)]
pub enum Job {
    Decode {
        file: InputFile,
    },
    Preprocess {
        file: DecodedFile,
        preprocessor: String,
        options: Value,
    },
    Encode(EncodeJob),
    /// One auto-optimizer round: encode at `quality`, decode, measure.
    Trial {
        bitmap: Bitmap,
        codec: String,
        quality: f64,
    },
}

impl Job {
    pub fn operation(&self) -> &'static str {
        match self {
            Job::Decode { .. } => "decode",
            Job::Preprocess { .. } => "preprocess",
            Job::Encode(_) => "encode",
            Job::Trial { .. } => "trial",
        }
    }
}

/// One codec output for one input file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_text: Option<String>,
    pub input_size: usize,
    pub input_file: String,
    pub output_file: String,
    pub codec: String,
    #[serde(skip)]
    pub out: Vec<u8>,
    pub output_size: usize,
}

/// Binary, reconstruction and distance of one optimizer round.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub binary: Vec<u8>,
    pub bitmap: Bitmap,
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub enum JobOutput {
    Decoded(DecodedFile),
    Preprocessed(DecodedFile),
    Encoded(EncodeOutput),
    Trial(Attempt),
}

/// Per-file progress through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Decode,
    Preprocess,
    Encode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_name_uses_stem_suffix_and_dir() {
        let file = InputFile::new("photos/cat.large.png", vec![1, 2, 3]);
        assert_eq!(file.size(), 3);
        assert_eq!(file.output_name("", "", "jpg"), "cat.large.jpg");
        assert_eq!(
            file.output_name("out", "-min", "png"),
            Path::new("out").join("cat.large-min.png").to_string_lossy()
        );
    }

    #[test]
    fn test_job_operation_names() {
        let file = InputFile::new("a.png", Vec::new());
        assert_eq!(Job::Decode { file }.operation(), "decode");
    }
}

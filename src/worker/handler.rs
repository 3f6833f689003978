use tracing::{debug, trace};

use super::JobHandler;
use crate::codec::{merge_options, Codec, Registry};
use crate::error::JobError;
use crate::job::{DecodedFile, EncodeConfig, EncodeJob, EncodeOutput, InputFile, Job, JobOutput};
use crate::optimizer::{self, SearchParams};

/// Runs codec jobs with the worker's own codec instances.
pub struct CodecHandler {
    registry: Registry,
}

impl CodecHandler {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    fn codec(&self, name: &str) -> Result<&dyn Codec, JobError> {
        self.registry
            .codec(name)
            .ok_or_else(|| JobError::Unsupported(format!("unknown codec: {name}")))
    }

    fn decode(&self, file: InputFile) -> Result<DecodedFile, JobError> {
        let codec = self.registry.detect(&file.data).ok_or_else(|| {
            JobError::Unsupported(format!("{} has an unsupported format", file.name))
        })?;
        trace!(file = %file.name, codec = codec.name(), "decoding");
        let bitmap = codec.decode(&file.data)?;
        Ok(DecodedFile {
            size: file.size(),
            file,
            bitmap,
        })
    }

    fn encode(&self, job: EncodeJob) -> Result<EncodeOutput, JobError> {
        let EncodeJob {
            file,
            codec: codec_name,
            config,
            output_file,
        } = job;
        let codec = self.codec(&codec_name)?;

        let (out, info_text) = match config {
            EncodeConfig::Fixed(options) => {
                let options = merge_options(&codec.default_options(), &options);
                (codec.encode(&file.bitmap, &options)?, None)
            }
            EncodeConfig::Auto { target, max_rounds } => {
                let auto = codec.auto_optimize().ok_or_else(|| {
                    JobError::Unsupported(format!("{codec_name} cannot be auto-optimized"))
                })?;
                let params = SearchParams::new(auto.min, auto.max, target, max_rounds);
                let metric = self.registry.metric();
                let bitmap = &file.bitmap;

                // Inline search: every round runs on this worker.
                let search = optimizer::auto_optimize(&params, |q| {
                    futures::future::ready(optimizer::round_trip(codec, metric, bitmap, q))
                });
                let optimized = futures::executor::block_on(search)?;
                let resolved = optimized.resolved_quality();
                debug!(
                    file = %file.file.name,
                    codec = %codec_name,
                    quality = resolved,
                    rounds = optimized.rounds(),
                    "auto-optimized"
                );
                (
                    optimized.attempt.binary,
                    Some(optimizer::info_text(&codec_name, auto.option, resolved)),
                )
            }
        };

        Ok(EncodeOutput {
            info_text,
            input_size: file.size,
            input_file: file.file.name,
            output_file,
            codec: codec_name,
            output_size: out.len(),
            out,
        })
    }
}

impl JobHandler for CodecHandler {
    type Job = Job;
    type Output = JobOutput;

    fn handle(&mut self, job: Job) -> Result<JobOutput, JobError> {
        trace!(operation = job.operation(), "handling job");
        match job {
            Job::Decode { file } => self.decode(file).map(JobOutput::Decoded),
            Job::Preprocess {
                mut file,
                preprocessor,
                options,
            } => {
                let pass = self.registry.preprocessor(&preprocessor).ok_or_else(|| {
                    JobError::Unsupported(format!("unknown preprocessor: {preprocessor}"))
                })?;
                file.bitmap = pass.process(&file.bitmap, &options)?;
                Ok(JobOutput::Preprocessed(file))
            }
            Job::Encode(job) => self.encode(job).map(JobOutput::Encoded),
            Job::Trial {
                bitmap,
                codec,
                quality,
            } => {
                let codec = self.codec(&codec)?;
                optimizer::round_trip(codec, self.registry.metric(), &bitmap, quality)
                    .map(JobOutput::Trial)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Bitmap, JpegCodec, PngCodec};
    use serde_json::json;

    fn image_file(name: &str) -> (InputFile, Bitmap) {
        let mut data = Vec::new();
        for y in 0..16u32 {
            for x in 0..16u32 {
                data.extend_from_slice(&[
                    (x * 15) as u8,
                    (y * 15) as u8,
                    ((x + y) * 7) as u8,
                    255,
                ]);
            }
        }
        let bitmap = Bitmap::new(16, 16, data).unwrap();
        let png = PngCodec.encode(&bitmap, &json!({})).unwrap();
        (InputFile::new(name, png), bitmap)
    }

    #[test]
    fn test_decode_detects_format() {
        let mut handler = CodecHandler::new(Registry::builtin());
        let (file, bitmap) = image_file("a.png");
        let size = file.size();

        match handler.handle(Job::Decode { file }).unwrap() {
            JobOutput::Decoded(decoded) => {
                assert_eq!(decoded.bitmap, bitmap);
                assert_eq!(decoded.size, size);
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_bytes() {
        let mut handler = CodecHandler::new(Registry::builtin());
        let file = InputFile::new("notes.txt", b"just some text".to_vec());
        let err = handler.handle(Job::Decode { file }).unwrap_err();
        assert_eq!(
            err,
            JobError::Unsupported("notes.txt has an unsupported format".into())
        );
    }

    #[test]
    fn test_preprocess_replaces_bitmap() {
        let mut handler = CodecHandler::new(Registry::builtin());
        let (file, bitmap) = image_file("a.png");
        let decoded = DecodedFile {
            size: file.size(),
            file,
            bitmap,
        };
        let job = Job::Preprocess {
            file: decoded,
            preprocessor: "rotate".into(),
            options: json!({"numRotations": 2}),
        };
        match handler.handle(job).unwrap() {
            JobOutput::Preprocessed(out) => {
                assert_eq!((out.bitmap.width, out.bitmap.height), (16, 16))
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_fixed_encode_is_idempotent() {
        let mut handler = CodecHandler::new(Registry::builtin());
        let (file, bitmap) = image_file("a.png");
        let job = EncodeJob {
            file: DecodedFile {
                size: file.size(),
                file,
                bitmap,
            },
            codec: "jpeg".into(),
            config: EncodeConfig::Fixed(json!({"quality": 60})),
            output_file: "a.jpg".into(),
        };

        let first = handler.handle(Job::Encode(job.clone())).unwrap();
        let second = handler.handle(Job::Encode(job)).unwrap();
        match (first, second) {
            (JobOutput::Encoded(a), JobOutput::Encoded(b)) => {
                assert_eq!(a.out, b.out);
                assert_eq!(a.output_size, a.out.len());
                assert!(a.info_text.is_none());
                assert_eq!(a.output_file, "a.jpg");
            }
            other => panic!("unexpected outputs: {other:?}"),
        }
    }

    #[test]
    fn test_auto_encode_runs_inline_search() {
        let mut handler = CodecHandler::new(Registry::builtin());
        let (file, bitmap) = image_file("a.png");
        let job = EncodeJob {
            file: DecodedFile {
                size: file.size(),
                file,
                bitmap,
            },
            codec: "jpeg".into(),
            config: EncodeConfig::Auto {
                target: 1.5,
                max_rounds: 5,
            },
            output_file: "a.jpg".into(),
        };

        match handler.handle(Job::Encode(job)).unwrap() {
            JobOutput::Encoded(out) => {
                let info = out.info_text.unwrap();
                assert!(info.starts_with(" using --jpeg '{\"quality\":"), "{info}");
                assert!(JpegCodec.detect(&out.out));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn test_auto_encode_needs_tunable_codec() {
        let mut handler = CodecHandler::new(Registry::builtin());
        let (file, bitmap) = image_file("a.png");
        let job = EncodeJob {
            file: DecodedFile {
                size: file.size(),
                file,
                bitmap,
            },
            codec: "png".into(),
            config: EncodeConfig::Auto {
                target: 1.5,
                max_rounds: 5,
            },
            output_file: "a.png".into(),
        };
        assert!(matches!(
            handler.handle(Job::Encode(job)),
            Err(JobError::Unsupported(_))
        ));
    }

    #[test]
    fn test_trial_measures_distance() {
        let mut handler = CodecHandler::new(Registry::builtin());
        let (_, bitmap) = image_file("a.png");
        let job = Job::Trial {
            bitmap,
            codec: "jpeg".into(),
            quality: 90.0,
        };
        match handler.handle(job).unwrap() {
            JobOutput::Trial(attempt) => {
                assert!(attempt.distance >= 0.0);
                assert_eq!((attempt.bitmap.width, attempt.bitmap.height), (16, 16));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }
}

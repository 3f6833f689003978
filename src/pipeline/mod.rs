//! Batch orchestration: decode every file once, run the enabled
//! preprocessing passes in order, then fan out one encode per enabled codec.
//!
//! Failures stay local to the file (decode, preprocess) or to the file and
//! codec (encode) they happen in; only pool start-up failures abort a batch.

use anyhow::{anyhow, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::codec::{AutoOptimize, Registry};
use crate::config::{EncoderSetting, RunConfig};
use crate::error::JobError;
use crate::job::{
    Attempt, DecodedFile, EncodeConfig, EncodeJob, EncodeOutput, Job, JobOutput, Stage,
};
use crate::optimizer::{self, SearchParams};
use crate::pool::{PoolConfig, WorkerPool};
use crate::worker::{CodecHandler, HandlerFactory};

/// Which part of the batch is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Decoding,
    Preprocessing(String),
    Encoding,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Decoding => write!(f, "Decoding"),
            Phase::Preprocessing(name) => write!(f, "Preprocessing ({name})"),
            Phase::Encoding => write!(f, "Encoding"),
        }
    }
}

/// Counters for the current phase. Both only grow until the phase changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub phase: Phase,
    pub done: usize,
    pub total: usize,
}

/// Receives progress as jobs settle.
pub trait ProgressSink: Send + Sync {
    fn update(&self, state: &ProgressState);

    fn finish(&self, _records: &BTreeMap<String, ResultRecord>) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _state: &ProgressState) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFailure {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    pub message: String,
}

/// Everything produced for one input file. Outputs are in completion order.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub input_size: usize,
    pub outputs: Vec<EncodeOutput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<OutputFailure>,
}

impl ResultRecord {
    fn new(input_size: usize) -> Self {
        Self {
            input_size,
            ..Self::default()
        }
    }

    fn fail(&mut self, stage: Stage, codec: Option<&str>, err: &JobError) {
        self.failures.push(OutputFailure {
            stage,
            codec: codec.map(str::to_string),
            message: err.to_string(),
        });
    }
}

struct Tracker<'a> {
    sink: &'a dyn ProgressSink,
    state: ProgressState,
}

impl<'a> Tracker<'a> {
    fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            state: ProgressState {
                phase: Phase::Decoding,
                done: 0,
                total: 0,
            },
        }
    }

    fn start(&mut self, phase: Phase, total: usize) {
        self.state = ProgressState {
            phase,
            done: 0,
            total,
        };
        self.sink.update(&self.state);
    }

    fn tick(&mut self) {
        self.state.done += 1;
        self.sink.update(&self.state);
    }
}

struct EncodeTask {
    job: EncodeJob,
    auto: Option<AutoOptimize>,
}

type RegistryFactory = Arc<dyn Fn() -> Registry + Send + Sync>;

/// Drives batches through a [`WorkerPool`] of [`CodecHandler`]s.
pub struct Orchestrator {
    registry: Registry,
    registry_factory: RegistryFactory,
    progress: Arc<dyn ProgressSink>,
}

impl Orchestrator {
    /// `registry_factory` is called once here and once per worker, so every
    /// worker owns its codec instances.
    pub fn new(registry_factory: impl Fn() -> Registry + Send + Sync + 'static) -> Self {
        let registry_factory: RegistryFactory = Arc::new(registry_factory);
        Self {
            registry: registry_factory(),
            registry_factory,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn builtin() -> Self {
        Self::new(Registry::builtin)
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn handler_factory(&self) -> HandlerFactory<CodecHandler> {
        let registry_factory = Arc::clone(&self.registry_factory);
        Arc::new(move |_| CodecHandler::new(registry_factory()))
    }

    /// Run a batch on a pool owned by this call: construct, dispatch, drain.
    pub async fn process_files(
        &self,
        config: &RunConfig,
        pool_config: &PoolConfig,
    ) -> Result<BTreeMap<String, ResultRecord>> {
        let pool = WorkerPool::new(pool_config, self.handler_factory())?;
        let records = self.run(&pool, config).await;
        let report = pool.drain().await?;
        debug!(jobs = report.jobs_dispatched, "batch used {} workers", report.workers.len());
        records
    }

    /// Run a batch on an existing pool. Resolves once every file is finalized.
    pub async fn run(
        &self,
        pool: &WorkerPool<CodecHandler>,
        config: &RunConfig,
    ) -> Result<BTreeMap<String, ResultRecord>> {
        config.validate(&self.registry)?;
        let mut seen = HashSet::new();
        if let Some(dup) = config.files.iter().find(|f| !seen.insert(f.name.as_str())) {
            return Err(anyhow!("duplicate input file name: {}", dup.name));
        }

        let mut records = BTreeMap::new();
        let mut tracker = Tracker::new(self.progress.as_ref());

        let decoded = self.decode_all(pool, config, &mut records, &mut tracker).await;
        let preprocessed = self
            .preprocess_all(pool, config, decoded, &mut records, &mut tracker)
            .await?;
        self.encode_all(pool, config, preprocessed, &mut records, &mut tracker)
            .await?;

        self.progress.finish(&records);
        info!("✅ Finished {} files", records.len());
        Ok(records)
    }

    async fn decode_all(
        &self,
        pool: &WorkerPool<CodecHandler>,
        config: &RunConfig,
        records: &mut BTreeMap<String, ResultRecord>,
        tracker: &mut Tracker<'_>,
    ) -> Vec<DecodedFile> {
        info!("🔎 Decoding {} files", config.files.len());
        tracker.start(Phase::Decoding, config.files.len());

        let mut pending: FuturesUnordered<_> = config
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| async move {
                let result = pool.dispatch(Job::Decode { file: file.clone() }).await;
                (index, file, result)
            })
            .collect();

        let mut decoded = Vec::new();
        while let Some((index, file, result)) = pending.next().await {
            let record = records
                .entry(file.name.clone())
                .or_insert_with(|| ResultRecord::new(file.size()));
            match result.and_then(expect_decoded) {
                Ok(file) => decoded.push((index, file)),
                Err(err) => {
                    warn!("⚠️ Skipping {}: {}", file.name, err);
                    record.fail(Stage::Decode, None, &err);
                }
            }
            tracker.tick();
        }

        decoded.sort_by_key(|(index, _)| *index);
        decoded.into_iter().map(|(_, file)| file).collect()
    }

    async fn preprocess_all(
        &self,
        pool: &WorkerPool<CodecHandler>,
        config: &RunConfig,
        mut files: Vec<DecodedFile>,
        records: &mut BTreeMap<String, ResultRecord>,
        tracker: &mut Tracker<'_>,
    ) -> Result<Vec<DecodedFile>> {
        for pass in self.registry.preprocessors() {
            let Some(options) = config.preprocessor_options(pass.name(), &pass.default_options())?
            else {
                continue;
            };
            info!("Running {} on {} files", pass.name(), files.len());
            tracker.start(Phase::Preprocessing(pass.name().to_string()), files.len());

            let mut pending: FuturesUnordered<_> = files
                .into_iter()
                .enumerate()
                .map(|(index, file)| {
                    let name = file.file.name.clone();
                    let job = Job::Preprocess {
                        file,
                        preprocessor: pass.name().to_string(),
                        options: options.clone(),
                    };
                    async move { (index, name, pool.dispatch(job).await) }
                })
                .collect();

            let mut survivors = Vec::new();
            while let Some((index, name, result)) = pending.next().await {
                match result.and_then(expect_preprocessed) {
                    Ok(file) => survivors.push((index, file)),
                    Err(err) => {
                        warn!("⚠️ {} failed for {}: {}", pass.name(), name, err);
                        if let Some(record) = records.get_mut(&name) {
                            record.fail(Stage::Preprocess, None, &err);
                        }
                    }
                }
                tracker.tick();
            }

            survivors.sort_by_key(|(index, _)| *index);
            files = survivors.into_iter().map(|(_, file)| file).collect();
        }
        Ok(files)
    }

    async fn encode_all(
        &self,
        pool: &WorkerPool<CodecHandler>,
        config: &RunConfig,
        files: Vec<DecodedFile>,
        records: &mut BTreeMap<String, ResultRecord>,
        tracker: &mut Tracker<'_>,
    ) -> Result<()> {
        let tasks = self.plan_encodes(config, &files)?;
        info!(
            "🚀 Encoding {} outputs ({} workers)",
            tasks.len(),
            pool.size()
        );
        tracker.start(Phase::Encoding, tasks.len());

        let mut pending: FuturesUnordered<_> = tasks
            .into_iter()
            .map(|task| self.encode(pool, task))
            .collect();

        while let Some((name, codec, result)) = pending.next().await {
            let Some(record) = records.get_mut(&name) else {
                continue;
            };
            match result {
                Ok(output) => {
                    debug!(file = %name, codec = %codec, size = output.output_size, "encoded");
                    record.outputs.push(output);
                }
                Err(err) => {
                    warn!("❌ {} failed for {}: {}", codec, name, err);
                    record.fail(Stage::Encode, Some(&codec), &err);
                }
            }
            tracker.tick();
        }
        Ok(())
    }

    /// One encode task per file and enabled codec, in registry order.
    fn plan_encodes(&self, config: &RunConfig, files: &[DecodedFile]) -> Result<Vec<EncodeTask>> {
        let target = config.optimizer_target();
        let mut codecs = Vec::new();
        for codec in self.registry.codecs() {
            let Some(setting) = config.encoder_setting(codec.name())? else {
                continue;
            };
            let (encode_config, auto) = match (setting, target, codec.auto_optimize()) {
                (EncoderSetting::Fixed(options), _, _) => (EncodeConfig::Fixed(options), None),
                (EncoderSetting::Auto, Some(target), Some(auto)) => (
                    EncodeConfig::Auto {
                        target,
                        max_rounds: config.max_optimizer_rounds,
                    },
                    Some(auto),
                ),
                (EncoderSetting::Auto, None, _) => {
                    warn!(
                        "{} set to auto without an optimizer target, using defaults",
                        codec.name()
                    );
                    (EncodeConfig::Fixed(serde_json::json!({})), None)
                }
                (EncoderSetting::Auto, Some(_), None) => {
                    warn!("{} cannot be auto-optimized, using defaults", codec.name());
                    (EncodeConfig::Fixed(serde_json::json!({})), None)
                }
            };
            codecs.push((codec, encode_config, auto));
        }

        let mut tasks = Vec::with_capacity(files.len() * codecs.len());
        for file in files {
            for (codec, encode_config, auto) in &codecs {
                tasks.push(EncodeTask {
                    job: EncodeJob {
                        file: file.clone(),
                        codec: codec.name().to_string(),
                        config: encode_config.clone(),
                        output_file: file.file.output_name(
                            &config.output_dir,
                            &config.suffix,
                            codec.extension(),
                        ),
                    },
                    auto: auto.clone(),
                });
            }
        }
        Ok(tasks)
    }

    async fn encode(
        &self,
        pool: &WorkerPool<CodecHandler>,
        task: EncodeTask,
    ) -> (String, String, Result<EncodeOutput, JobError>) {
        let name = task.job.file.file.name.clone();
        let codec = task.job.codec.clone();

        // With several workers each round is its own job, so searches for
        // different images interleave across the pool.
        let search = match (&task.job.config, &task.auto) {
            (EncodeConfig::Auto { target, max_rounds }, Some(auto)) if pool.size() > 1 => Some((
                SearchParams::new(auto.min, auto.max, *target, *max_rounds),
                auto.option,
            )),
            _ => None,
        };

        let result = match search {
            Some((params, option)) => optimize_on_pool(pool, task.job, &params, option).await,
            None => pool
                .dispatch(Job::Encode(task.job))
                .await
                .and_then(expect_encoded),
        };
        (name, codec, result)
    }
}

async fn optimize_on_pool(
    pool: &WorkerPool<CodecHandler>,
    job: EncodeJob,
    params: &SearchParams,
    option: &str,
) -> Result<EncodeOutput, JobError> {
    let optimized = optimizer::auto_optimize(params, |quality| {
        let trial = Job::Trial {
            bitmap: job.file.bitmap.clone(),
            codec: job.codec.clone(),
            quality,
        };
        async move { pool.dispatch(trial).await.and_then(expect_trial) }
    })
    .await?;

    let resolved = optimized.resolved_quality();
    debug!(
        file = %job.file.file.name,
        codec = %job.codec,
        quality = resolved,
        rounds = optimized.rounds(),
        "auto-optimized on pool"
    );
    let out = optimized.attempt.binary;
    Ok(EncodeOutput {
        info_text: Some(optimizer::info_text(&job.codec, option, resolved)),
        input_size: job.file.size,
        input_file: job.file.file.name,
        output_file: job.output_file,
        codec: job.codec,
        output_size: out.len(),
        out,
    })
}

fn unexpected(expected: &str, output: &JobOutput) -> JobError {
    let got = match output {
        JobOutput::Decoded(_) => "decoded",
        JobOutput::Preprocessed(_) => "preprocessed",
        JobOutput::Encoded(_) => "encoded",
        JobOutput::Trial(_) => "trial",
    };
    JobError::Codec(format!("expected {expected} output, worker returned {got}"))
}

fn expect_decoded(output: JobOutput) -> Result<DecodedFile, JobError> {
    match output {
        JobOutput::Decoded(file) => Ok(file),
        other => Err(unexpected("decoded", &other)),
    }
}

fn expect_preprocessed(output: JobOutput) -> Result<DecodedFile, JobError> {
    match output {
        JobOutput::Preprocessed(file) => Ok(file),
        other => Err(unexpected("preprocessed", &other)),
    }
}

fn expect_encoded(output: JobOutput) -> Result<EncodeOutput, JobError> {
    match output {
        JobOutput::Encoded(out) => Ok(out),
        other => Err(unexpected("encoded", &other)),
    }
}

fn expect_trial(output: JobOutput) -> Result<Attempt, JobError> {
    match output {
        JobOutput::Trial(attempt) => Ok(attempt),
        other => Err(unexpected("trial", &other)),
    }
}

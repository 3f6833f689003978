use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::codec::Registry;
use crate::config::{Config, RunConfig, Setting};
use crate::job::{InputFile, Stage};
use crate::pipeline::{Orchestrator, ProgressSink, ProgressState, ResultRecord};
use crate::pool::PoolConfig;

/// Options for the compress command, as parsed from the CLI
#[derive(Debug, Clone, Default)]
pub struct CompressOptions {
    pub inputs: Vec<String>,
    pub suffix: String,
    pub output_dir: PathBuf,
    pub workers: Option<usize>,
    pub max_optimizer_rounds: Option<u32>,
    pub optimizer_target: Option<f64>,
    pub job_timeout_secs: Option<u64>,
    /// Codec and preprocessor flags: name -> `"auto"` or a JSON object
    pub settings: BTreeMap<String, String>,
    pub json: bool,
}

/// Command to compress a batch of images into every requested format
pub struct CompressCommand {
    options: CompressOptions,
}

impl CompressCommand {
    pub fn new(options: CompressOptions) -> Self {
        Self { options }
    }

    pub async fn execute(&self) -> Result<()> {
        let paths = collect_inputs(&self.options.inputs)?;
        if paths.is_empty() {
            return Err(anyhow!("No input files found in {:?}", self.options.inputs));
        }
        let registry = Registry::builtin();
        if !self.options.settings.keys().any(|name| registry.codec(name).is_some()) {
            return Err(anyhow!("No codec selected, pass at least one of --jpeg or --png"));
        }

        check_output_collisions(&paths)?;

        let files = read_inputs(&paths)?;
        let env_config = Config::from_env();
        let run_config = self.run_config(files, &env_config);
        let pool_config = self.pool_config(&env_config);

        info!(
            "🗜️ Compressing {} files with {} workers",
            run_config.files.len(),
            pool_config.workers
        );

        let progress = Arc::new(BarProgress::new());
        let records = Orchestrator::builtin()
            .with_progress(progress)
            .process_files(&run_config, &pool_config)
            .await?;

        self.write_outputs(&records).await?;

        if self.options.json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else {
            print!("{}", render_summary(&records, &self.options.suffix));
        }

        let failures: usize = records.values().map(|r| r.failures.len()).sum();
        if failures > 0 {
            return Err(anyhow!("{failures} outputs failed"));
        }
        Ok(())
    }

    fn run_config(&self, files: Vec<InputFile>, env_config: &Config) -> RunConfig {
        let mut config = RunConfig::new(files);
        config.suffix = self.options.suffix.clone();
        config.output_dir = self.options.output_dir.to_string_lossy().into_owned();
        config.max_optimizer_rounds = self
            .options
            .max_optimizer_rounds
            .unwrap_or(env_config.max_optimizer_rounds);
        config.optimizer_butteraugli_target =
            self.options.optimizer_target.or(env_config.optimizer_target);
        for (name, value) in &self.options.settings {
            config
                .settings
                .insert(name.clone(), Setting::Text(value.clone()));
        }
        config
    }

    fn pool_config(&self, env_config: &Config) -> PoolConfig {
        let mut pool_config = PoolConfig::from(env_config);
        if let Some(workers) = self.options.workers {
            pool_config.workers = workers;
        }
        if let Some(secs) = self.options.job_timeout_secs {
            pool_config.job_timeout = Some(std::time::Duration::from_secs(secs));
        }
        pool_config
    }

    async fn write_outputs(&self, records: &BTreeMap<String, ResultRecord>) -> Result<()> {
        tokio::fs::create_dir_all(&self.options.output_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.options.output_dir))?;

        for output in records.values().flat_map(|r| &r.outputs) {
            tokio::fs::write(&output.output_file, &output.out)
                .await
                .with_context(|| format!("Failed to write {}", output.output_file))?;
            debug!("Wrote {} ({} bytes)", output.output_file, output.output_size);
        }
        Ok(())
    }
}

/// Expand files, directories and glob patterns into a sorted file list
fn collect_inputs(inputs: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for input in inputs {
        let path = Path::new(input);
        if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() {
                    paths.push(entry.into_path());
                }
            }
        } else if path.is_file() {
            paths.push(path.to_path_buf());
        } else {
            let matches = glob::glob(input).with_context(|| format!("Invalid pattern: {input}"))?;
            let before = paths.len();
            paths.extend(matches.filter_map(|m| m.ok()).filter(|p| p.is_file()));
            if paths.len() == before {
                warn!("⚠️ Nothing matched: {}", input);
            }
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Outputs are named after the input stem, so two inputs sharing a stem
/// would overwrite each other.
fn check_output_collisions(paths: &[PathBuf]) -> Result<()> {
    let mut stems: HashMap<String, &PathBuf> = HashMap::new();
    for path in paths {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        if let Some(first) = stems.insert(stem, path) {
            return Err(anyhow!("{first:?} and {path:?} would write to the same output files"));
        }
    }
    Ok(())
}

/// Read every input in parallel
fn read_inputs(paths: &[PathBuf]) -> Result<Vec<InputFile>> {
    paths
        .par_iter()
        .map(|path| {
            let data = std::fs::read(path).with_context(|| format!("Failed to read {path:?}"))?;
            Ok::<_, anyhow::Error>(InputFile::new(path.to_string_lossy(), data))
        })
        .collect()
}

const SIZE_UNITS: [&str; 3] = ["B", "KB", "MB"];

pub fn pretty_print_size(size: usize) -> String {
    let index = if size == 0 {
        0
    } else {
        ((size as f64).log2() / 10.0).floor().clamp(0.0, 2.0) as usize
    };
    format!(
        "{:.2}{}",
        size as f64 / 2f64.powi(10 * index as i32),
        SIZE_UNITS[index]
    )
}

pub fn render_summary(records: &BTreeMap<String, ResultRecord>, suffix: &str) -> String {
    let mut out = String::new();
    for (name, record) in records {
        out.push_str(&format!("{}: {}\n", name, pretty_print_size(record.input_size)));
        for output in &record.outputs {
            let extension = Path::new(&output.output_file)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let percent = if record.input_size == 0 {
                0.0
            } else {
                output.output_size as f64 / record.input_size as f64 * 100.0
            };
            out.push_str(&format!(
                "  └ {:<5} → {} ({:.1}%){}\n",
                format!("{suffix}{extension}"),
                pretty_print_size(output.output_size),
                percent,
                output.info_text.as_deref().unwrap_or("")
            ));
        }
        for failure in &record.failures {
            let label = match (&failure.codec, failure.stage) {
                (Some(codec), _) => codec.as_str(),
                (None, Stage::Preprocess) => "preprocess",
                (None, _) => "decode",
            };
            out.push_str(&format!("  ✗ {}: {}\n", label, failure.message));
        }
    }
    out
}

/// Renders batch progress as a terminal progress bar
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg:<24} [{bar:30}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("▨▨╌"),
        );
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn update(&self, state: &ProgressState) {
        self.bar.set_message(state.phase.to_string());
        self.bar.set_length(state.total as u64);
        self.bar.set_position(state.done as u64);
    }

    fn finish(&self, _records: &BTreeMap<String, ResultRecord>) {
        self.bar.finish_and_clear();
    }
}

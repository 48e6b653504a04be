use std::fs::File;
use std::io::{self, BufRead, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use langid::{
    ConfusableGroups, CorpusConfig, EvalReport, FeatureExtractor, FilterReport, LinearModel,
    PrepareReport, Scorer, TrainStats, Trainer, TrainerConfig, create_epoch_file, evaluate,
    filter_pool, prepare_corpus, quantize, read_labeled_file, read_model_file,
    write_model_file,
};

#[derive(Parser)]
#[command(name = "langid", version, about = "Hashed n-gram language identifier")]
struct Cli {
    /// Log per-checkpoint detail.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full two-pass pipeline: prepare, train, filter, retrain,
    /// quantize, write the model.
    Train {
        /// Directory of per-language subdirectories of rowid<TAB>text files.
        corpus_dir: PathBuf,
        /// Where the INT8 model is written.
        model_out: PathBuf,
        /// Feature-space width; must be a power of two.
        #[arg(long, default_value_t = 8192)]
        buckets: usize,
        /// Sentences per epoch file across all languages.
        #[arg(long, default_value_t = 5_000_000)]
        target: u64,
        /// Working directory for pool, dev, test and epoch files.
        #[arg(long)]
        work_dir: Option<PathBuf>,
        /// SGD worker count; defaults to the hardware parallelism.
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Classify argument text, or stdin lines when none is given.
    Predict {
        model: PathBuf,
        text: Vec<String>,
        /// Show the k most probable labels per input.
        #[arg(long, default_value_t = 1)]
        top: usize,
    },
    /// Score a lang<TAB>text file of raw sentences.
    Eval { model: PathBuf, test_file: PathBuf },
}

/// Meta information about a training run, serialized next to the model.
#[derive(Serialize)]
struct TrainInfo {
    corpus: String,
    output: String,
    n_threads: usize,
    start_datetime: String,
    end_datetime: Option<String>,
}

impl TrainInfo {
    fn new(corpus: &Path, output: &Path, n_threads: usize) -> Self {
        let start: DateTime<Local> = Local::now();
        TrainInfo {
            corpus: corpus.display().to_string(),
            output: output.display().to_string(),
            n_threads,
            start_datetime: start.format("%Y-%m-%d %H:%M:%S").to_string(),
            end_datetime: None,
        }
    }

    fn set_end(&mut self) {
        let end: DateTime<Local> = Local::now();
        self.end_datetime = Some(end.format("%Y-%m-%d %H:%M:%S").to_string());
    }
}

#[derive(Serialize)]
struct RunReport {
    info: TrainInfo,
    config: TrainerConfig,
    labels: Vec<String>,
    prepare: PrepareReport,
    pass1: TrainStats,
    filter: Vec<FilterReport>,
    pass2: TrainStats,
    test: EvalReport,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Train {
            corpus_dir,
            model_out,
            buckets,
            target,
            work_dir,
            threads,
        } => run_train(
            &corpus_dir,
            &model_out,
            buckets,
            target,
            work_dir,
            threads,
            cli.verbose,
        ),
        Command::Predict { model, text, top } => run_predict(&model, &text, top),
        Command::Eval { model, test_file } => run_eval(&model, &test_file),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_train(
    corpus_dir: &Path,
    model_out: &Path,
    buckets: usize,
    target: u64,
    work_dir: Option<PathBuf>,
    threads: Option<usize>,
    verbose: bool,
) -> Result<()> {
    let n_threads = threads.unwrap_or_else(num_cpus::get);
    let config = TrainerConfig {
        num_buckets: buckets,
        sgd_threads: n_threads,
        verbose,
        ..TrainerConfig::default()
    };
    let work_dir = work_dir.unwrap_or_else(|| {
        model_out
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join("langid-work")
    });
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("cannot create work dir {}", work_dir.display()))?;

    let mut info = TrainInfo::new(corpus_dir, model_out, n_threads);
    let groups = ConfusableGroups::new();

    let corpus_config = CorpusConfig {
        seed: config.seed,
        ..CorpusConfig::default()
    };
    let (paths, prepare) = prepare_corpus(corpus_dir, &work_dir, &corpus_config)
        .context("corpus preparation failed")?;
    let dev = read_labeled_file(&paths.dev_file).context("cannot read dev set")?;

    let trainer = Trainer::new(config.clone())?;

    // Pass 1: train on the raw pool.
    let epoch1 = work_dir.join("epoch.pass1.txt");
    create_epoch_file(&paths.pool_dir, &epoch1, target, config.seed, 0)
        .context("cannot build pass-1 epoch file")?;
    let (dense1, pass1) = trainer.train(&epoch1, &dev).context("pass-1 training failed")?;
    info!(dev_f1 = pass1.final_dev_f1, "pass 1 done");

    // Filter the pool with the pass-1 model, then retrain from scratch.
    let filtered_dir = work_dir.join("pool_filtered");
    let filter = filter_pool(
        &dense1,
        trainer.extractor(),
        &groups,
        &paths.pool_dir,
        &filtered_dir,
    )
    .context("filter pass failed")?;
    for report in &filter {
        info!(
            lang = %report.lang,
            kept = report.kept,
            total = report.total,
            "filtered"
        );
    }
    drop(dense1);

    let epoch2 = work_dir.join("epoch.pass2.txt");
    create_epoch_file(&filtered_dir, &epoch2, target, config.seed, 1)
        .context("cannot build pass-2 epoch file")?;
    let (dense2, pass2) = trainer.train(&epoch2, &dev).context("pass-2 training failed")?;
    info!(dev_f1 = pass2.final_dev_f1, "pass 2 done");

    // Quantize and ship; the model file is written only after pass 2
    // succeeded end-to-end.
    let model = quantize(&dense2)?;
    write_model_file(model_out, &model)
        .with_context(|| format!("cannot write model to {}", model_out.display()))?;

    let test = read_labeled_file(&paths.test_file).context("cannot read test set")?;
    let test_report = evaluate(&model, trainer.extractor(), &test, &groups, false);
    info!(
        accuracy = test_report.accuracy,
        macro_f1 = test_report.macro_f1,
        group_accuracy = test_report.group_accuracy,
        "test evaluation"
    );

    info.set_end();
    let labels = model.labels().to_vec();
    let report = RunReport {
        info,
        config,
        labels,
        prepare,
        pass1,
        filter,
        pass2,
        test: test_report,
    };
    let meta_path = meta_path_for(model_out);
    let writer = BufWriter::new(File::create(&meta_path)?);
    serde_json::to_writer_pretty(writer, &report)
        .with_context(|| format!("cannot write {}", meta_path.display()))?;

    println!(
        "model written to {} ({} languages, {} buckets)",
        model_out.display(),
        report.labels.len(),
        buckets
    );
    println!(
        "test accuracy {:.4}, macro F1 {:.4}, group accuracy {:.4}",
        report.test.accuracy, report.test.macro_f1, report.test.group_accuracy
    );
    Ok(())
}

fn meta_path_for(model_out: &Path) -> PathBuf {
    let mut name = model_out.as_os_str().to_os_string();
    name.push(".meta.json");
    PathBuf::from(name)
}

fn run_predict(model_path: &Path, texts: &[String], top: usize) -> Result<()> {
    let model = load(model_path)?;
    if texts.is_empty() {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            print_prediction(&model, &line, top);
        }
    } else {
        for text in texts {
            print_prediction(&model, text, top);
        }
    }
    Ok(())
}

fn print_prediction(model: &LinearModel, text: &str, top: usize) {
    if top <= 1 {
        let (label, prob) = model.predict(text);
        println!("{label}\t{prob:.4}\t{text}");
    } else {
        let ranked: Vec<String> = model
            .predict_top_k(text, top)
            .into_iter()
            .map(|(label, prob)| format!("{label}:{prob:.4}"))
            .collect();
        println!("{}\t{text}", ranked.join(" "));
    }
}

fn run_eval(model_path: &Path, test_file: &Path) -> Result<()> {
    let model = load(model_path)?;
    let extractor = FeatureExtractor::new(model.num_buckets())?;
    let samples = read_labeled_file(test_file)
        .with_context(|| format!("cannot read {}", test_file.display()))?;
    let groups = ConfusableGroups::new();
    let report = evaluate(&model, &extractor, &samples, &groups, false);
    println!(
        "evaluated {} sentences over {} classes ({} skipped)",
        report.evaluated, report.classes_with_support, report.skipped
    );
    println!("accuracy        {:.4}", report.accuracy);
    println!("macro F1        {:.4}", report.macro_f1);
    println!("group accuracy  {:.4}", report.group_accuracy);
    Ok(())
}

fn load(model_path: &Path) -> Result<LinearModel> {
    read_model_file(model_path)
        .with_context(|| format!("cannot load model {}", model_path.display()))
}

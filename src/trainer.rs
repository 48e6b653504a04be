//! Streaming parallel trainer.
//!
//! One pass over the training file records label set, line count and chunk
//! byte offsets; afterwards every epoch seeks chunks in a freshly shuffled
//! order, shuffles each chunk in place, and fans I/O batches out to workers.
//! The first `adam_epochs` epochs run mini-batch Adam, the rest run online
//! SGD with Hogwild workers racing on the shared weight matrix. Early
//! stopping operates at two levels: a rolling window of checkpoint dev-F1
//! values inside an epoch, and a patience counter across epochs.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use fnv::{FnvHashMap, FnvHashSet};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::TrainerConfig;
use crate::corpus::LabeledSentence;
use crate::error::{Error, Result};
use crate::eval::{self, EvalReport};
use crate::features::FeatureExtractor;
use crate::hogwild::Hogwild;
use crate::languages::ConfusableGroups;
use crate::model::{DenseModel, Scorer, dense_score_into, softmax_in_place};
use crate::preprocess::preprocess;
use crate::util::derive_seed;

const SEED_ROLE_CHUNK_ORDER: u64 = 0x10;
const SEED_ROLE_CHUNK_SHUFFLE: u64 = 0x11;
const SEED_ROLE_DEV_SUBSAMPLE: u64 = 0x12;

pub struct Trainer {
    config: TrainerConfig,
    extractor: FeatureExtractor,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainStats {
    pub epochs_run: usize,
    pub best_dev_f1: f64,
    pub final_dev_f1: f64,
    /// Average training loss at the end of each epoch run.
    pub epoch_losses: Vec<f64>,
    pub lines_processed: u64,
    pub skipped_lines: u64,
    /// Epochs cut short by the rolling-window plateau check.
    pub early_stopped_epochs: usize,
    pub stopped_by_patience: bool,
}

/// Frozen result of the scan phase.
struct ScanResult {
    labels: Vec<String>,
    label_index: FnvHashMap<String, u32>,
    total_lines: u64,
    /// Byte offset of every `chunk_size`-th line boundary; first is 0.
    chunk_offsets: Vec<u64>,
}

enum EpochMode {
    Adam,
    Sgd { lr: f32 },
}

struct EpochOutcome {
    samples: u64,
    skipped: u64,
    early_stopped: bool,
    avg_loss: f64,
}

/// Per-worker reusable buffers; live as long as the worker does.
struct Scratch {
    counts: Vec<u32>,
    nz: Vec<u32>,
    logits: Vec<f32>,
}

impl Scratch {
    fn new(num_buckets: usize, num_classes: usize) -> Self {
        Scratch {
            counts: vec![0u32; num_buckets],
            nz: Vec::with_capacity(512),
            logits: vec![0f32; num_classes],
        }
    }
}

#[derive(Clone, Copy)]
struct AdamParams {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    lambda: f32,
    mini_batch: usize,
    num_buckets: usize,
    num_classes: usize,
    preprocess_input: bool,
}

/// Borrowed FP32 weights exposed through the scoring seam for dev
/// evaluation mid-training.
struct DenseView<'a> {
    num_buckets: usize,
    labels: &'a [String],
    weights: &'a [f32],
    biases: &'a [f32],
}

impl Scorer for DenseView<'_> {
    fn labels(&self) -> &[String] {
        self.labels
    }

    fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    fn score_into(&self, counts: &[u32], nz: &[u32], logits: &mut [f32]) {
        dense_score_into(self.weights, self.biases, counts, nz, logits);
    }
}

/// Sparse forward pass and gradient. On return `scratch.logits` holds
/// `prob - onehot(target)`; the caller consumes `scratch.nz`/`counts` for
/// its update and then resets them. Returns `None` for featureless text.
fn forward_grad(
    extractor: &FeatureExtractor,
    weights: &[f32],
    biases: &[f32],
    text: &str,
    target: usize,
    preprocess_input: bool,
    scratch: &mut Scratch,
) -> Option<f32> {
    let owned;
    let canonical = if preprocess_input {
        owned = preprocess(text);
        owned.as_str()
    } else {
        text
    };
    extractor.extract_into(canonical, &mut scratch.counts, &mut scratch.nz);
    if scratch.nz.is_empty() {
        return None;
    }
    dense_score_into(weights, biases, &scratch.counts, &scratch.nz, &mut scratch.logits);
    softmax_in_place(&mut scratch.logits);
    let loss = -(scratch.logits[target].max(1e-10)).ln();
    scratch.logits[target] -= 1.0;
    Some(loss)
}

/// Hogwild SGD over one worker slice: unsynchronized updates straight into
/// the shared matrix, decoupled L2 folded into the step.
#[allow(clippy::too_many_arguments)]
fn sgd_slice(
    extractor: &FeatureExtractor,
    texts: &[String],
    labels: &[u32],
    weights: &mut Hogwild<Vec<f32>>,
    biases: &mut Hogwild<Vec<f32>>,
    num_classes: usize,
    lr: f32,
    lambda: f32,
    preprocess_input: bool,
    scratch: &mut Scratch,
) -> (f64, u64) {
    let mut loss_sum = 0f64;
    let mut trained = 0u64;
    for (text, &label) in texts.iter().zip(labels) {
        let loss = forward_grad(
            extractor,
            weights.as_slice(),
            biases.as_slice(),
            text,
            label as usize,
            preprocess_input,
            scratch,
        );
        if let Some(loss) = loss {
            loss_sum += loss as f64;
            trained += 1;

            let w = weights.as_mut_slice();
            for &bucket in &scratch.nz {
                let count = scratch.counts[bucket as usize] as f32;
                let row = bucket as usize * num_classes;
                for (class, &grad) in scratch.logits.iter().enumerate() {
                    let idx = row + class;
                    w[idx] -= lr * (grad * count + lambda * w[idx]);
                }
            }
            let b = biases.as_mut_slice();
            for (class, &grad) in scratch.logits.iter().enumerate() {
                b[class] -= lr * grad;
            }
        }
        extractor.reset(&mut scratch.counts, &mut scratch.nz);
    }
    (loss_sum, trained)
}

/// Mini-batch Adam state for one worker. Moments and the gradient
/// accumulator are owned per worker and never merged; the step counter is
/// the shared atomic only in single-worker mode.
struct AdamWorker {
    m: Vec<f32>,
    v: Vec<f32>,
    m_bias: Vec<f32>,
    v_bias: Vec<f32>,
    acc: Vec<f32>,
    acc_bias: Vec<f32>,
    pending: usize,
    local_step: u64,
    shared_step: Option<Arc<AtomicU64>>,
    scratch: Scratch,
}

impl AdamWorker {
    fn new(num_buckets: usize, num_classes: usize, shared_step: Option<Arc<AtomicU64>>) -> Self {
        AdamWorker {
            m: vec![0f32; num_buckets * num_classes],
            v: vec![0f32; num_buckets * num_classes],
            m_bias: vec![0f32; num_classes],
            v_bias: vec![0f32; num_classes],
            acc: vec![0f32; num_buckets * num_classes],
            acc_bias: vec![0f32; num_classes],
            pending: 0,
            local_step: 0,
            shared_step,
            scratch: Scratch::new(num_buckets, num_classes),
        }
    }

    fn next_step(&mut self) -> u64 {
        match &self.shared_step {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed) + 1,
            None => {
                self.local_step += 1;
                self.local_step
            }
        }
    }

    fn process_slice(
        &mut self,
        extractor: &FeatureExtractor,
        texts: &[String],
        labels: &[u32],
        weights: &mut Hogwild<Vec<f32>>,
        biases: &mut Hogwild<Vec<f32>>,
        params: &AdamParams,
    ) -> (f64, u64) {
        let mut loss_sum = 0f64;
        let mut trained = 0u64;
        for (text, &label) in texts.iter().zip(labels) {
            let loss = forward_grad(
                extractor,
                weights.as_slice(),
                biases.as_slice(),
                text,
                label as usize,
                params.preprocess_input,
                &mut self.scratch,
            );
            if let Some(loss) = loss {
                loss_sum += loss as f64;
                trained += 1;

                for &bucket in &self.scratch.nz {
                    let count = self.scratch.counts[bucket as usize] as f32;
                    let row = bucket as usize * params.num_classes;
                    for (class, &grad) in self.scratch.logits.iter().enumerate() {
                        self.acc[row + class] += grad * count;
                    }
                }
                for (class, &grad) in self.scratch.logits.iter().enumerate() {
                    self.acc_bias[class] += grad;
                }
                self.pending += 1;
                if self.pending >= params.mini_batch {
                    self.apply(weights.as_mut_slice(), biases.as_mut_slice(), params);
                }
            }
            extractor.reset(&mut self.scratch.counts, &mut self.scratch.nz);
        }
        (loss_sum, trained)
    }

    /// One Adam update from the accumulated mini-batch. Rows whose
    /// accumulator stayed all-zero are skipped and the consumed rows are
    /// zeroed in place.
    fn apply(&mut self, weights: &mut [f32], biases: &mut [f32], params: &AdamParams) {
        if self.pending == 0 {
            return;
        }
        let step = self.next_step().min(i32::MAX as u64) as i32;
        let bc1 = 1.0 - params.beta1.powi(step);
        let bc2 = 1.0 - params.beta2.powi(step);
        let mb = self.pending as f32;
        let num_classes = params.num_classes;

        for bucket in 0..params.num_buckets {
            let row = bucket * num_classes;
            if self.acc[row..row + num_classes].iter().all(|&g| g == 0.0) {
                continue;
            }
            for class in 0..num_classes {
                let idx = row + class;
                let grad = self.acc[idx] / mb;
                let m = params.beta1 * self.m[idx] + (1.0 - params.beta1) * grad;
                let v = params.beta2 * self.v[idx] + (1.0 - params.beta2) * grad * grad;
                self.m[idx] = m;
                self.v[idx] = v;
                weights[idx] -= params.lr * (m / bc1) / ((v / bc2).sqrt() + params.eps);
                weights[idx] -= params.lr * params.lambda * weights[idx];
                self.acc[idx] = 0.0;
            }
        }
        for class in 0..num_classes {
            let grad = self.acc_bias[class] / mb;
            let m = params.beta1 * self.m_bias[class] + (1.0 - params.beta1) * grad;
            let v = params.beta2 * self.v_bias[class] + (1.0 - params.beta2) * grad * grad;
            self.m_bias[class] = m;
            self.v_bias[class] = v;
            biases[class] -= params.lr * (m / bc1) / ((v / bc2).sqrt() + params.eps);
            self.acc_bias[class] = 0.0;
        }
        self.pending = 0;
    }
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let extractor = FeatureExtractor::new(config.num_buckets)?;
        Ok(Trainer {
            config,
            extractor,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Cooperative cancellation handle; polled at chunk and batch
    /// boundaries. Cancelling aborts the run with [`Error::Cancelled`].
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run one full training pass over `train_file` and return the FP32
    /// model plus run statistics. `dev` drives both early-stopping levels;
    /// an empty dev set disables them.
    pub fn train(
        &self,
        train_file: &Path,
        dev: &[LabeledSentence],
    ) -> Result<(DenseModel, TrainStats)> {
        let started = Instant::now();
        let scan = self.scan(train_file)?;
        let num_classes = scan.labels.len();
        if num_classes < 2 {
            return Err(Error::corpus(format!(
                "need at least two labels to train, found {num_classes}"
            )));
        }
        info!(
            classes = num_classes,
            lines = scan.total_lines,
            chunks = scan.chunk_offsets.len(),
            "scan complete"
        );

        let num_buckets = self.config.num_buckets;
        let weights = Hogwild::new(vec![0f32; num_buckets * num_classes]);
        let biases = Hogwild::new(vec![0f32; num_classes]);
        let shared_step = Arc::new(AtomicU64::new(0));
        let groups = ConfusableGroups::new();

        let dev_subsample = self.subsample_dev(dev);
        let mut reader = BufReader::new(File::open(train_file)?);

        // Adam moments persist across the Adam epochs and are freed once
        // the SGD phase begins. A lone worker shares the atomic step
        // counter; parallel workers each count their own steps.
        let adam_shared = if self.config.adam_threads == 1 {
            Some(shared_step.clone())
        } else {
            None
        };
        let adam_worker_count = if self.config.adam_epochs > 0 {
            self.config.adam_threads
        } else {
            0
        };
        let mut adam_workers: Vec<AdamWorker> = (0..adam_worker_count)
            .map(|_| AdamWorker::new(num_buckets, num_classes, adam_shared.clone()))
            .collect();

        let mut stats = TrainStats::default();
        let mut best_f1 = 0f64;
        let mut stale_epochs = 0usize;
        let sgd_total = self.config.max_epochs - self.config.adam_epochs;

        for epoch in 0..self.config.max_epochs {
            let mode = if epoch < self.config.adam_epochs {
                EpochMode::Adam
            } else {
                let sgd_epoch = epoch - self.config.adam_epochs;
                let frac = sgd_epoch as f32 / sgd_total.saturating_sub(1).max(1) as f32;
                EpochMode::Sgd {
                    lr: self.config.sgd_lr_start
                        + frac * (self.config.sgd_lr_end - self.config.sgd_lr_start),
                }
            };
            if matches!(mode, EpochMode::Sgd { .. }) && !adam_workers.is_empty() {
                adam_workers.clear();
                adam_workers.shrink_to_fit();
            }

            let outcome = self.run_epoch(
                &mut reader,
                &scan,
                &weights,
                &biases,
                &mode,
                epoch,
                &dev_subsample,
                &groups,
                &mut adam_workers,
            )?;
            stats.lines_processed += outcome.samples;
            stats.skipped_lines += outcome.skipped;
            stats.epoch_losses.push(outcome.avg_loss);
            if outcome.early_stopped {
                stats.early_stopped_epochs += 1;
            }
            stats.epochs_run = epoch + 1;

            if dev.is_empty() {
                info!(epoch, avg_loss = outcome.avg_loss, "epoch complete (no dev set)");
                continue;
            }
            let report = self.eval_dense(&scan.labels, &weights, &biases, dev, &groups);
            info!(
                epoch,
                avg_loss = outcome.avg_loss,
                dev_f1 = report.macro_f1,
                dev_classes = report.classes_with_support,
                "epoch complete"
            );
            stats.final_dev_f1 = report.macro_f1;
            if report.macro_f1 > best_f1 + self.config.across_epoch_threshold {
                best_f1 = report.macro_f1;
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
                if stale_epochs >= self.config.patience {
                    info!(epoch, "stopping: dev F1 stopped improving");
                    stats.stopped_by_patience = true;
                    break;
                }
            }
        }
        stats.best_dev_f1 = best_f1.max(stats.final_dev_f1);
        drop(adam_workers);

        let weights = weights
            .into_inner()
            .ok_or_else(|| Error::Worker("weight buffer still aliased after training".into()))?;
        let biases = biases
            .into_inner()
            .ok_or_else(|| Error::Worker("bias buffer still aliased after training".into()))?;
        let model = DenseModel::from_parts(num_buckets, scan.labels, weights, biases);
        info!(elapsed_s = started.elapsed().as_secs_f64(), "training pass finished");
        Ok((model, stats))
    }

    /// Single sequential read: discover labels, count lines, record chunk
    /// byte offsets for later random-access shuffling.
    fn scan(&self, path: &Path) -> Result<ScanResult> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut seen: FnvHashSet<String> = FnvHashSet::default();
        let mut discovered: Vec<String> = Vec::new();
        let mut offsets = vec![0u64];
        let mut pos = 0u64;
        let mut lines = 0u64;
        let mut buf = String::new();
        loop {
            buf.clear();
            let read = reader.read_line(&mut buf)?;
            if read == 0 {
                break;
            }
            pos += read as u64;
            lines += 1;
            if let Some((lang, _)) = buf.split_once('\t') {
                if !lang.is_empty() && !seen.contains(lang) {
                    seen.insert(lang.to_string());
                    discovered.push(lang.to_string());
                }
            }
            if lines % self.config.chunk_size as u64 == 0 {
                offsets.push(pos);
            }
        }
        if lines == 0 {
            return Err(Error::corpus(format!(
                "training file {} is empty",
                path.display()
            )));
        }
        // A boundary recorded exactly at EOF starts no chunk.
        if offsets.len() > 1 && offsets.last() == Some(&pos) {
            offsets.pop();
        }

        let mut labels = discovered;
        labels.sort();
        let label_index = labels
            .iter()
            .enumerate()
            .map(|(idx, label)| (label.clone(), idx as u32))
            .collect();
        Ok(ScanResult {
            labels,
            label_index,
            total_lines: lines,
            chunk_offsets: offsets,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_epoch(
        &self,
        reader: &mut BufReader<File>,
        scan: &ScanResult,
        weights: &Hogwild<Vec<f32>>,
        biases: &Hogwild<Vec<f32>>,
        mode: &EpochMode,
        epoch: usize,
        dev_subsample: &[LabeledSentence],
        groups: &ConfusableGroups,
        adam_workers: &mut Vec<AdamWorker>,
    ) -> Result<EpochOutcome> {
        let num_classes = scan.labels.len();
        let params = AdamParams {
            lr: self.config.adam_lr,
            beta1: self.config.adam_beta1,
            beta2: self.config.adam_beta2,
            eps: self.config.adam_epsilon,
            lambda: self.config.l2_lambda,
            mini_batch: self.config.mini_batch_size,
            num_buckets: self.config.num_buckets,
            num_classes,
            preprocess_input: !self.config.preprocessed,
        };

        let mut chunk_order: Vec<usize> = (0..scan.chunk_offsets.len()).collect();
        chunk_order.shuffle(&mut StdRng::seed_from_u64(derive_seed(
            self.config.seed,
            SEED_ROLE_CHUNK_ORDER,
            epoch as u64,
        )));

        let sgd_threads = self.config.sgd_threads;
        let mut sgd_scratch: Vec<Scratch> = match mode {
            EpochMode::Sgd { .. } => (0..sgd_threads)
                .map(|_| Scratch::new(self.config.num_buckets, num_classes))
                .collect(),
            EpochMode::Adam => Vec::new(),
        };

        let mut texts: Vec<String> = Vec::new();
        let mut label_ids: Vec<u32> = Vec::new();
        let mut window: VecDeque<f64> = VecDeque::with_capacity(self.config.rolling_window);
        let mut since_checkpoint = 0u64;
        let mut ckpt_loss = 0f64;
        let mut ckpt_samples = 0u64;
        let mut epoch_loss = 0f64;
        let mut epoch_samples = 0u64;
        let mut samples = 0u64;
        let mut skipped = 0u64;
        let mut early_stopped = false;

        'chunks: for &chunk_idx in &chunk_order {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            self.read_chunk(
                reader,
                scan.chunk_offsets[chunk_idx],
                &scan.label_index,
                &mut texts,
                &mut label_ids,
                &mut skipped,
            )?;
            shuffle_parallel(
                &mut texts,
                &mut label_ids,
                StdRng::seed_from_u64(derive_seed(
                    self.config.seed,
                    SEED_ROLE_CHUNK_SHUFFLE,
                    ((epoch as u64) << 32) | chunk_idx as u64,
                )),
            );

            let mut batch_start = 0usize;
            while batch_start < texts.len() {
                if self.cancel.load(Ordering::Relaxed) {
                    return Err(Error::Cancelled);
                }
                let batch_end = (batch_start + self.config.batch_size).min(texts.len());
                let batch_texts = &texts[batch_start..batch_end];
                let batch_labels = &label_ids[batch_start..batch_end];

                let (loss, trained) = match mode {
                    EpochMode::Adam => self.dispatch_adam(
                        batch_texts,
                        batch_labels,
                        adam_workers,
                        weights,
                        biases,
                        &params,
                    )?,
                    EpochMode::Sgd { lr } => self.dispatch_sgd(
                        batch_texts,
                        batch_labels,
                        &mut sgd_scratch,
                        weights,
                        biases,
                        num_classes,
                        *lr,
                    )?,
                };
                ckpt_loss += loss;
                ckpt_samples += trained;
                epoch_loss += loss;
                epoch_samples += trained;
                let batch_lines = (batch_end - batch_start) as u64;
                samples += batch_lines;
                since_checkpoint += batch_lines;
                batch_start = batch_end;

                if !dev_subsample.is_empty()
                    && since_checkpoint >= self.config.checkpoint_interval
                {
                    since_checkpoint = 0;
                    self.verify_finite(weights, ckpt_loss, ckpt_samples)?;
                    ckpt_loss = 0.0;
                    ckpt_samples = 0;

                    let report =
                        self.eval_dense(&scan.labels, weights, biases, dev_subsample, groups);
                    if self.config.verbose {
                        debug!(epoch, samples, checkpoint_f1 = report.macro_f1, "checkpoint");
                    }
                    if window.len() == self.config.rolling_window {
                        window.pop_front();
                    }
                    window.push_back(report.macro_f1);
                    if window.len() == self.config.rolling_window {
                        let max = window.iter().copied().fold(f64::MIN, f64::max);
                        let min = window.iter().copied().fold(f64::MAX, f64::min);
                        if max - min < self.config.within_epoch_threshold {
                            info!(epoch, f1 = report.macro_f1, "dev F1 plateaued within epoch");
                            early_stopped = true;
                            break 'chunks;
                        }
                    }
                }
            }

            // Trailing partial mini-batches flush at chunk end.
            if matches!(mode, EpochMode::Adam) {
                let mut wh = weights.clone();
                let mut bh = biases.clone();
                for worker in adam_workers.iter_mut() {
                    worker.apply(wh.as_mut_slice(), bh.as_mut_slice(), &params);
                }
            }
        }

        Ok(EpochOutcome {
            samples,
            skipped,
            early_stopped,
            avg_loss: if epoch_samples > 0 {
                epoch_loss / epoch_samples as f64
            } else {
                0.0
            },
        })
    }

    /// Seek to a chunk and read up to `chunk_size` lines, keeping only
    /// well-formed ones with a known label.
    fn read_chunk(
        &self,
        reader: &mut BufReader<File>,
        offset: u64,
        label_index: &FnvHashMap<String, u32>,
        texts: &mut Vec<String>,
        label_ids: &mut Vec<u32>,
        skipped: &mut u64,
    ) -> Result<()> {
        reader.seek(SeekFrom::Start(offset))?;
        texts.clear();
        label_ids.clear();
        let mut buf = String::new();
        for _ in 0..self.config.chunk_size {
            buf.clear();
            let read = reader.read_line(&mut buf)?;
            if read == 0 {
                break;
            }
            let line = buf.trim_end_matches('\n').trim_end_matches('\r');
            match line.split_once('\t') {
                Some((lang, text)) if !text.is_empty() => match label_index.get(lang) {
                    Some(&idx) => {
                        texts.push(text.to_string());
                        label_ids.push(idx);
                    }
                    None => *skipped += 1,
                },
                _ => *skipped += 1,
            }
        }
        Ok(())
    }

    fn dispatch_adam(
        &self,
        texts: &[String],
        labels: &[u32],
        workers: &mut [AdamWorker],
        weights: &Hogwild<Vec<f32>>,
        biases: &Hogwild<Vec<f32>>,
        params: &AdamParams,
    ) -> Result<(f64, u64)> {
        if texts.is_empty() {
            return Ok((0.0, 0));
        }
        if workers.len() == 1 {
            let mut wh = weights.clone();
            let mut bh = biases.clone();
            return Ok(workers[0].process_slice(&self.extractor, texts, labels, &mut wh, &mut bh, params));
        }
        let slice_len = texts.len().div_ceil(workers.len()).max(1);
        let extractor = &self.extractor;
        let results = thread::scope(|scope| {
            let mut handles = Vec::new();
            for (worker, (text_slice, label_slice)) in workers
                .iter_mut()
                .zip(texts.chunks(slice_len).zip(labels.chunks(slice_len)))
            {
                let mut wh = weights.clone();
                let mut bh = biases.clone();
                handles.push(scope.spawn(move || {
                    worker.process_slice(extractor, text_slice, label_slice, &mut wh, &mut bh, params)
                }));
            }
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| Error::Worker("adam worker panicked".into()))
                })
                .collect::<Result<Vec<(f64, u64)>>>()
        })?;
        Ok(results
            .into_iter()
            .fold((0.0, 0), |(ls, n), (l, c)| (ls + l, n + c)))
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_sgd(
        &self,
        texts: &[String],
        labels: &[u32],
        scratch: &mut [Scratch],
        weights: &Hogwild<Vec<f32>>,
        biases: &Hogwild<Vec<f32>>,
        num_classes: usize,
        lr: f32,
    ) -> Result<(f64, u64)> {
        if texts.is_empty() {
            return Ok((0.0, 0));
        }
        let lambda = self.config.l2_lambda;
        let preprocess_input = !self.config.preprocessed;
        if scratch.len() == 1 {
            let mut wh = weights.clone();
            let mut bh = biases.clone();
            return Ok(sgd_slice(
                &self.extractor,
                texts,
                labels,
                &mut wh,
                &mut bh,
                num_classes,
                lr,
                lambda,
                preprocess_input,
                &mut scratch[0],
            ));
        }
        let slice_len = texts.len().div_ceil(scratch.len()).max(1);
        let extractor = &self.extractor;
        let results = thread::scope(|scope| {
            let mut handles = Vec::new();
            for (worker_scratch, (text_slice, label_slice)) in scratch
                .iter_mut()
                .zip(texts.chunks(slice_len).zip(labels.chunks(slice_len)))
            {
                let mut wh = weights.clone();
                let mut bh = biases.clone();
                handles.push(scope.spawn(move || {
                    sgd_slice(
                        extractor,
                        text_slice,
                        label_slice,
                        &mut wh,
                        &mut bh,
                        num_classes,
                        lr,
                        lambda,
                        preprocess_input,
                        worker_scratch,
                    )
                }));
            }
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| Error::Worker("sgd worker panicked".into()))
                })
                .collect::<Result<Vec<(f64, u64)>>>()
        })?;
        Ok(results
            .into_iter()
            .fold((0.0, 0), |(ls, n), (l, c)| (ls + l, n + c)))
    }

    /// Checkpoint health check: recent loss and every weight must be
    /// finite, otherwise abort with norm diagnostics.
    fn verify_finite(
        &self,
        weights: &Hogwild<Vec<f32>>,
        loss_sum: f64,
        loss_samples: u64,
    ) -> Result<()> {
        let mut norm_sq = 0f64;
        let mut max_abs = 0f32;
        let mut weights_finite = true;
        for &w in weights.iter() {
            if w.is_finite() {
                norm_sq += (w as f64) * (w as f64);
                max_abs = max_abs.max(w.abs());
            } else {
                weights_finite = false;
            }
        }
        let w_norm = norm_sq.sqrt();
        let avg_loss = if loss_samples > 0 {
            loss_sum / loss_samples as f64
        } else {
            0.0
        };
        if !weights_finite || !avg_loss.is_finite() {
            return Err(Error::Numeric(format!(
                "non-finite state at checkpoint: avg_loss={avg_loss}, \
                 w_norm={w_norm:.6}, max_abs_weight={max_abs:.6}"
            )));
        }
        Ok(())
    }

    fn eval_dense(
        &self,
        labels: &[String],
        weights: &Hogwild<Vec<f32>>,
        biases: &Hogwild<Vec<f32>>,
        samples: &[LabeledSentence],
        groups: &ConfusableGroups,
    ) -> EvalReport {
        let view = DenseView {
            num_buckets: self.config.num_buckets,
            labels,
            weights: weights.as_slice(),
            biases: biases.as_slice(),
        };
        eval::evaluate(&view, &self.extractor, samples, groups, true)
    }

    fn subsample_dev(&self, dev: &[LabeledSentence]) -> Vec<LabeledSentence> {
        if dev.len() <= self.config.dev_subsample_size {
            return dev.to_vec();
        }
        let mut indices: Vec<usize> = (0..dev.len()).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(derive_seed(
            self.config.seed,
            SEED_ROLE_DEV_SUBSAMPLE,
            0,
        )));
        indices.truncate(self.config.dev_subsample_size);
        indices.sort_unstable();
        indices.into_iter().map(|idx| dev[idx].clone()).collect()
    }
}

/// Fisher-Yates over two parallel arrays, swapping in lockstep.
fn shuffle_parallel(texts: &mut [String], labels: &mut [u32], mut rng: StdRng) {
    debug_assert_eq!(texts.len(), labels.len());
    for i in (1..texts.len()).rev() {
        let j = rng.random_range(0..=i);
        texts.swap(i, j);
        labels.swap(i, j);
    }
}

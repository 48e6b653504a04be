//! Linear models: the FP32 training-time model and the INT8 ship-time model.
//!
//! Layouts differ on purpose. The dense model is bucket-major (`[B][C]`) so
//! a training step touches one contiguous row per active bucket; the
//! quantized model is class-major (`[C][B]`) so a single-sample inference
//! dot-product walks each class row over the active buckets.

use crate::error::{Error, Result};
use crate::features::FeatureExtractor;
use crate::preprocess::preprocess;

/// Scoring seam shared by the FP32 and INT8 models; the evaluator and the
/// filter pass work against this instead of a concrete model.
pub trait Scorer {
    /// Class labels, unique and sorted lexicographically.
    fn labels(&self) -> &[String];

    fn num_buckets(&self) -> usize;

    /// Fill `logits` (length `labels().len()`) from a sparse count vector.
    fn score_into(&self, counts: &[u32], nz: &[u32], logits: &mut [f32]);
}

/// Numerically stable in-place softmax: subtract the max before
/// exponentiating; if everything underflows to zero, fall back to the
/// uniform distribution.
pub fn softmax_in_place(logits: &mut [f32]) {
    if logits.is_empty() {
        return;
    }
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0f32;
    for logit in logits.iter_mut() {
        *logit = (*logit - max).exp();
        sum += *logit;
    }
    if sum > 0.0 {
        for logit in logits.iter_mut() {
            *logit /= sum;
        }
    } else {
        let uniform = 1.0 / logits.len() as f32;
        logits.fill(uniform);
    }
}

pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &val) in values.iter().enumerate() {
        if val > best_val {
            best_val = val;
            best = idx;
        }
    }
    best
}

/// FP32 model under training. Owned by the trainer until quantization.
#[derive(Debug, Clone)]
pub struct DenseModel {
    num_buckets: usize,
    labels: Vec<String>,
    /// Bucket-major `[num_buckets * num_classes]`.
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl DenseModel {
    pub fn new(num_buckets: usize, labels: Vec<String>) -> Self {
        let num_classes = labels.len();
        DenseModel {
            num_buckets,
            labels,
            weights: vec![0f32; num_buckets * num_classes],
            biases: vec![0f32; num_classes],
        }
    }

    pub(crate) fn from_parts(
        num_buckets: usize,
        labels: Vec<String>,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Self {
        debug_assert_eq!(weights.len(), num_buckets * labels.len());
        debug_assert_eq!(biases.len(), labels.len());
        DenseModel {
            num_buckets,
            labels,
            weights,
            biases,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }
}

impl Scorer for DenseModel {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    fn score_into(&self, counts: &[u32], nz: &[u32], logits: &mut [f32]) {
        dense_score_into(&self.weights, &self.biases, counts, nz, logits);
    }
}

/// Bucket-major scoring shared with the trainer's borrowed weight views.
pub(crate) fn dense_score_into(
    weights: &[f32],
    biases: &[f32],
    counts: &[u32],
    nz: &[u32],
    logits: &mut [f32],
) {
    let num_classes = biases.len();
    logits.copy_from_slice(biases);
    for &bucket in nz {
        let count = counts[bucket as usize] as f32;
        let row = bucket as usize * num_classes;
        for (class, logit) in logits.iter_mut().enumerate() {
            *logit += weights[row + class] * count;
        }
    }
}

/// Reusable per-thread inference buffers. Threads sharing one
/// [`LinearModel`] each keep their own scratch and classify concurrently
/// without allocation.
#[derive(Debug, Clone)]
pub struct InferenceScratch {
    counts: Vec<u32>,
    nz: Vec<u32>,
    probs: Vec<f32>,
}

impl InferenceScratch {
    pub fn for_model(model: &LinearModel) -> Self {
        InferenceScratch {
            counts: vec![0u32; model.num_buckets()],
            nz: Vec::with_capacity(512),
            probs: vec![0f32; model.num_classes()],
        }
    }
}

/// Quantized INT8 model as shipped. Immutable and safe to share across
/// threads; every `predict` call uses its own scratch.
#[derive(Debug, Clone)]
pub struct LinearModel {
    extractor: FeatureExtractor,
    labels: Vec<String>,
    /// Per-class dequantization factor.
    scales: Vec<f32>,
    biases: Vec<f32>,
    /// Class-major `[num_classes * num_buckets]`, each value in [-127, 127].
    weights: Vec<i8>,
}

impl PartialEq for LinearModel {
    fn eq(&self, other: &Self) -> bool {
        self.num_buckets() == other.num_buckets()
            && self.labels == other.labels
            && self.scales == other.scales
            && self.biases == other.biases
            && self.weights == other.weights
    }
}

impl LinearModel {
    pub fn new(
        num_buckets: usize,
        labels: Vec<String>,
        scales: Vec<f32>,
        biases: Vec<f32>,
        weights: Vec<i8>,
    ) -> Result<Self> {
        if num_buckets == 0 || !num_buckets.is_power_of_two() {
            return Err(Error::invalid_model(format!(
                "bucket count {num_buckets} is not a power of two"
            )));
        }
        let num_classes = labels.len();
        if num_classes == 0 {
            return Err(Error::invalid_model("model has no classes"));
        }
        if !labels.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::invalid_model("labels must be unique and sorted"));
        }
        if scales.len() != num_classes || biases.len() != num_classes {
            return Err(Error::invalid_model(format!(
                "expected {num_classes} scales and biases, got {} and {}",
                scales.len(),
                biases.len()
            )));
        }
        if weights.len() != num_classes * num_buckets {
            return Err(Error::invalid_model(format!(
                "expected {} weights, got {}",
                num_classes * num_buckets,
                weights.len()
            )));
        }
        Ok(LinearModel {
            extractor: FeatureExtractor::new(num_buckets)?,
            labels,
            scales,
            biases,
            weights,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn label(&self, idx: usize) -> &str {
        &self.labels[idx]
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub fn weights(&self) -> &[i8] {
        &self.weights
    }

    pub fn num_buckets(&self) -> usize {
        self.extractor.num_buckets()
    }

    /// Class probabilities for a sparse count vector.
    pub fn predict_counts(&self, counts: &[u32], nz: &[u32]) -> Vec<f32> {
        let mut logits = vec![0f32; self.num_classes()];
        self.score_into(counts, nz, &mut logits);
        softmax_in_place(&mut logits);
        logits
    }

    /// Classify raw text: preprocess, extract, score. Returns the winning
    /// label and its softmax probability.
    pub fn predict(&self, text: &str) -> (&str, f32) {
        let mut scratch = InferenceScratch::for_model(self);
        self.predict_with(text, &mut scratch)
    }

    /// `predict` against caller-owned buffers; the hot-path entry point for
    /// callers classifying many texts.
    pub fn predict_with<'a>(&'a self, text: &str, scratch: &mut InferenceScratch) -> (&'a str, f32) {
        self.predict_text(text, scratch);
        let best = argmax(&scratch.probs);
        (&self.labels[best], scratch.probs[best])
    }

    /// The `k` most probable labels, most probable first.
    pub fn predict_top_k(&self, text: &str, k: usize) -> Vec<(&str, f32)> {
        let mut scratch = InferenceScratch::for_model(self);
        self.predict_text(text, &mut scratch);
        let mut pairs: Vec<(usize, f32)> = scratch.probs.iter().copied().enumerate().collect();
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        pairs
            .into_iter()
            .take(k)
            .map(|(idx, p)| (self.labels[idx].as_str(), p))
            .collect()
    }

    fn predict_text(&self, text: &str, scratch: &mut InferenceScratch) {
        // The extractor config is the build-time default; num_buckets is the
        // only parameter carried by the model file.
        let canonical = preprocess(text);
        self.extractor
            .extract_into(&canonical, &mut scratch.counts, &mut scratch.nz);
        self.score_into(&scratch.counts, &scratch.nz, &mut scratch.probs);
        softmax_in_place(&mut scratch.probs);
        self.extractor.reset(&mut scratch.counts, &mut scratch.nz);
    }
}

impl Scorer for LinearModel {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn num_buckets(&self) -> usize {
        self.extractor.num_buckets()
    }

    fn score_into(&self, counts: &[u32], nz: &[u32], logits: &mut [f32]) {
        let num_buckets = self.extractor.num_buckets();
        for (class, logit) in logits.iter_mut().enumerate() {
            let row = class * num_buckets;
            let mut acc = 0f32;
            for &bucket in nz {
                acc += self.weights[row + bucket as usize] as f32
                    * counts[bucket as usize] as f32;
            }
            *logit = self.biases[class] + self.scales[class] * acc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_class_model() -> LinearModel {
        // weights[0][0] = 127, weights[1][1] = 127, unit scales, zero biases.
        let mut weights = vec![0i8; 8];
        weights[0] = 127;
        weights[4 + 1] = 127;
        LinearModel::new(
            4,
            vec!["deu".into(), "eng".into()],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
            weights,
        )
        .unwrap()
    }

    #[test]
    fn softmax_sums_to_one_on_extreme_logits() {
        let mut logits = vec![1000.0, 1001.0, 999.0];
        softmax_in_place(&mut logits);
        assert!(logits.iter().all(|p| p.is_finite()));
        let sum: f32 = logits.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(logits[1] > logits[0]);
        assert!(logits[0] > logits[2]);
    }

    #[test]
    fn softmax_is_shift_invariant() {
        let mut a = vec![0.5f32, -1.0, 2.0];
        let mut b = vec![100.5f32, 99.0, 102.0];
        softmax_in_place(&mut a);
        softmax_in_place(&mut b);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn softmax_preserves_argmax() {
        let original = vec![0.3f32, -2.0, 7.5, 7.4];
        let mut probs = original.clone();
        softmax_in_place(&mut probs);
        assert_eq!(argmax(&original), argmax(&probs));
    }

    #[test]
    fn softmax_underflow_yields_uniform() {
        let mut logits = vec![f32::NEG_INFINITY; 4];
        softmax_in_place(&mut logits);
        for p in &logits {
            assert!((p - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn predict_counts_picks_the_hot_bucket() {
        let model = two_class_model();
        let probs = model.predict_counts(&[10, 0, 0, 0], &[0]);
        assert_eq!(argmax(&probs), 0);
        let probs = model.predict_counts(&[0, 10, 0, 0], &[1]);
        assert_eq!(argmax(&probs), 1);
    }

    #[test]
    fn scales_weight_the_dot_product() {
        let mut weights = vec![0i8; 8];
        weights[0] = 100;
        weights[4] = 100;
        // Same integer weights; class 1's larger scale must win bucket 0.
        let model = LinearModel::new(
            4,
            vec!["a".into(), "b".into()],
            vec![0.01, 0.02],
            vec![0.0, 0.0],
            weights,
        )
        .unwrap();
        let probs = model.predict_counts(&[5, 0, 0, 0], &[0]);
        assert_eq!(argmax(&probs), 1);
    }

    #[test]
    fn rejects_inconsistent_shapes() {
        assert!(LinearModel::new(4, vec!["a".into()], vec![1.0], vec![0.0], vec![0i8; 3]).is_err());
        assert!(LinearModel::new(3, vec!["a".into()], vec![1.0], vec![0.0], vec![0i8; 3]).is_err());
        assert!(LinearModel::new(4, vec![], vec![], vec![], vec![]).is_err());
        assert!(
            LinearModel::new(
                4,
                vec!["b".into(), "a".into()],
                vec![1.0, 1.0],
                vec![0.0, 0.0],
                vec![0i8; 8],
            )
            .is_err()
        );
    }

    #[test]
    fn dense_and_scorer_agree_on_layout() {
        let mut dense = DenseModel::new(4, vec!["a".into(), "b".into()]);
        dense.weights[0 * 2 + 0] = 1.0; // bucket 0, class 0
        dense.weights[1 * 2 + 1] = 2.0; // bucket 1, class 1
        dense.biases[0] = 0.5;
        let mut logits = vec![0f32; 2];
        dense.score_into(&[3, 2, 0, 0], &[0, 1], &mut logits);
        assert!((logits[0] - 3.5).abs() < 1e-6);
        assert!((logits[1] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn top_k_orders_by_probability() {
        let model = two_class_model();
        let top = model.predict_top_k("aaaa", 2);
        assert_eq!(top.len(), 2);
        assert!(top[0].1 >= top[1].1);
        let sum: f32 = top.iter().map(|(_, p)| p).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn scratch_reuse_matches_fresh_buffers() {
        let model = two_class_model();
        let mut scratch = InferenceScratch::for_model(&model);
        for text in ["aaaa", "bb cc", "aaaa"] {
            let (label, prob) = model.predict_with(text, &mut scratch);
            let (fresh_label, fresh_prob) = model.predict(text);
            assert_eq!(label, fresh_label);
            assert!((prob - fresh_prob).abs() < 1e-7);
        }
    }

    #[test]
    fn concurrent_predict_with_thread_local_scratch() {
        let model = two_class_model();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let model = &model;
                scope.spawn(move || {
                    let mut scratch = InferenceScratch::for_model(model);
                    for _ in 0..50 {
                        let (_, prob) = model.predict_with("some text", &mut scratch);
                        assert!(prob.is_finite());
                    }
                });
            }
        });
    }
}

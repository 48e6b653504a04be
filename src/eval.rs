//! Classification metrics: per-class tallies, macro F1, accuracy and
//! confusable-group accuracy.

use serde::Serialize;

use crate::corpus::LabeledSentence;
use crate::features::FeatureExtractor;
use crate::languages::ConfusableGroups;
use crate::model::{Scorer, argmax};
use crate::preprocess::preprocess;

/// Per-class TP/FP/FN counters.
#[derive(Debug, Clone)]
pub struct Tallies {
    tp: Vec<u64>,
    fp: Vec<u64>,
    missed: Vec<u64>,
}

impl Tallies {
    pub fn new(num_classes: usize) -> Self {
        Tallies {
            tp: vec![0; num_classes],
            fp: vec![0; num_classes],
            missed: vec![0; num_classes],
        }
    }

    pub fn record(&mut self, truth: usize, predicted: usize) {
        if truth == predicted {
            self.tp[truth] += 1;
        } else {
            self.fp[predicted] += 1;
            self.missed[truth] += 1;
        }
    }

    /// Unweighted mean F1 over classes with support, and how many classes
    /// contributed. Precision and recall each fall to zero when their
    /// denominator is zero.
    pub fn macro_f1(&self) -> (f64, usize) {
        let mut sum = 0f64;
        let mut supported = 0usize;
        for class in 0..self.tp.len() {
            let tp = self.tp[class] as f64;
            let fp = self.fp[class] as f64;
            let missed = self.missed[class] as f64;
            if tp + missed == 0.0 {
                continue;
            }
            supported += 1;
            let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
            let recall = tp / (tp + missed);
            if precision + recall > 0.0 {
                sum += 2.0 * precision * recall / (precision + recall);
            }
        }
        if supported == 0 {
            (0.0, 0)
        } else {
            (sum / supported as f64, supported)
        }
    }

    pub fn accuracy(&self) -> f64 {
        let correct: u64 = self.tp.iter().sum();
        let total: u64 = correct + self.missed.iter().sum::<u64>();
        if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub macro_f1: f64,
    pub accuracy: f64,
    pub group_accuracy: f64,
    pub classes_with_support: usize,
    pub evaluated: u64,
    /// Samples whose label the model does not know.
    pub skipped: u64,
}

/// Score every sentence and tally argmax predictions.
///
/// `preprocessed` says whether the sentences are already canonical; raw test
/// sets pass `false`. Sentences with labels outside the model are skipped
/// and counted.
pub fn evaluate<S: Scorer>(
    model: &S,
    extractor: &FeatureExtractor,
    samples: &[LabeledSentence],
    groups: &ConfusableGroups,
    preprocessed: bool,
) -> EvalReport {
    let labels = model.labels();
    let num_classes = labels.len();
    let mut tallies = Tallies::new(num_classes);
    let mut group_hits = 0u64;
    let mut evaluated = 0u64;
    let mut skipped = 0u64;

    let mut counts = vec![0u32; extractor.num_buckets()];
    let mut nz: Vec<u32> = Vec::new();
    let mut logits = vec![0f32; num_classes];

    for sample in samples {
        let truth = match labels.binary_search(&sample.lang) {
            Ok(idx) => idx,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let owned;
        let canonical = if preprocessed {
            sample.text.as_str()
        } else {
            owned = preprocess(&sample.text);
            owned.as_str()
        };
        extractor.extract_into(canonical, &mut counts, &mut nz);
        model.score_into(&counts, &nz, &mut logits);
        extractor.reset(&mut counts, &mut nz);

        let predicted = argmax(&logits);
        tallies.record(truth, predicted);
        if groups.same_group(&labels[predicted], &labels[truth]) {
            group_hits += 1;
        }
        evaluated += 1;
    }

    let (macro_f1, classes_with_support) = tallies.macro_f1();
    EvalReport {
        macro_f1,
        accuracy: tallies.accuracy(),
        group_accuracy: if evaluated == 0 {
            0.0
        } else {
            group_hits as f64 / evaluated as f64
        },
        classes_with_support,
        evaluated,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::LinearModel;

    #[test]
    fn macro_f1_matches_closed_form() {
        let mut tallies = Tallies::new(3);
        // c0: tp=2 fp=1 fn=0; c1: tp=1 fp=0 fn=1; c2: tp=0 fp=1 fn=1.
        tallies.record(0, 0);
        tallies.record(0, 0);
        tallies.record(2, 0);
        tallies.record(1, 1);
        tallies.record(1, 2);

        let f1_c0 = 2.0 * (2.0 / 3.0) * 1.0 / (2.0 / 3.0 + 1.0);
        let f1_c1 = 2.0 * 1.0 * 0.5 / (1.0 + 0.5);
        let expected = (f1_c0 + f1_c1 + 0.0) / 3.0;

        let (macro_f1, supported) = tallies.macro_f1();
        assert_eq!(supported, 3);
        assert!((macro_f1 - expected).abs() < 1e-12);
        assert!((tallies.accuracy() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn unsupported_classes_are_ignored() {
        let mut tallies = Tallies::new(3);
        // Class 2 never appears as truth; a false positive there must not
        // drag the mean down.
        tallies.record(0, 0);
        tallies.record(1, 2);
        let (_, supported) = tallies.macro_f1();
        assert_eq!(supported, 2);
    }

    #[test]
    fn empty_tallies_are_zero() {
        let tallies = Tallies::new(4);
        assert_eq!(tallies.macro_f1(), (0.0, 0));
        assert_eq!(tallies.accuracy(), 0.0);
    }

    fn charset_model() -> (LinearModel, FeatureExtractor) {
        // Two classes keyed to single hot buckets via hand-set weights is
        // brittle against hashing; instead train-free: weight every bucket
        // touched by the class's alphabet.
        let extractor = FeatureExtractor::new(512).unwrap();
        let num_buckets = 512;
        let mut weights = vec![0i8; 2 * num_buckets];
        for (class, alphabet) in ["abcd", "wxyz"].iter().enumerate() {
            let counts = extractor.extract_counts(alphabet);
            for (bucket, &count) in counts.iter().enumerate() {
                if count > 0 {
                    weights[class * num_buckets + bucket] = 100;
                }
            }
        }
        let model = LinearModel::new(
            num_buckets,
            vec!["aaa".into(), "zzz".into()],
            vec![0.01, 0.01],
            vec![0.0, 0.0],
            weights,
        )
        .unwrap();
        (model, extractor)
    }

    #[test]
    fn evaluate_tallies_and_skips() {
        let (model, extractor) = charset_model();
        let groups = ConfusableGroups::new();
        let samples = vec![
            LabeledSentence::new("aaa", "abcd abcd"),
            LabeledSentence::new("zzz", "wxyz wxyz"),
            LabeledSentence::new("unknown", "whatever"),
        ];
        let report = evaluate(&model, &extractor, &samples, &groups, true);
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.skipped, 1);
        assert!((report.accuracy - 1.0).abs() < 1e-9);
        assert!((report.macro_f1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn group_accuracy_counts_confusables() {
        // hrv and srp share a confusable group; a cross-prediction counts
        // for group accuracy but not plain accuracy.
        let extractor = FeatureExtractor::new(512).unwrap();
        let num_buckets = 512;
        let mut weights = vec![0i8; 2 * num_buckets];
        // Both alphabets score only under class 0 ("hrv").
        for alphabet in ["abcd", "wxyz"] {
            let counts = extractor.extract_counts(alphabet);
            for (bucket, &count) in counts.iter().enumerate() {
                if count > 0 {
                    weights[bucket] = 100;
                }
            }
        }
        let model = LinearModel::new(
            num_buckets,
            vec!["hrv".into(), "srp".into()],
            vec![0.01, 0.01],
            vec![0.0, 0.0],
            weights,
        )
        .unwrap();
        let groups = ConfusableGroups::new();
        let samples = vec![
            LabeledSentence::new("hrv", "abcd"),
            LabeledSentence::new("srp", "wxyz"),
        ];
        let report = evaluate(&model, &extractor, &samples, &groups, true);
        assert!((report.accuracy - 0.5).abs() < 1e-9);
        assert!((report.group_accuracy - 1.0).abs() < 1e-9);
    }
}

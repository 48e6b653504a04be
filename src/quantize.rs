//! FP32 → INT8 conversion, per class row.
//!
//! Each class keeps its own scale so a class with small weights does not
//! lose precision to a class with large ones. The layout flips from the
//! trainer's bucket-major to the scorer's class-major here.

use crate::error::Result;
use crate::model::{DenseModel, LinearModel, Scorer};

/// Quantize every class row to `round(w / scale)` with
/// `scale = max_abs / 127` (1.0 for an all-zero row), clamped to
/// [-127, 127]. Biases and labels carry over verbatim.
pub fn quantize(dense: &DenseModel) -> Result<LinearModel> {
    let num_buckets = dense.num_buckets();
    let num_classes = dense.num_classes();
    let weights = dense.weights();

    let mut scales = vec![0f32; num_classes];
    let mut quantized = vec![0i8; num_classes * num_buckets];

    for class in 0..num_classes {
        let mut max_abs = 0f32;
        for bucket in 0..num_buckets {
            max_abs = max_abs.max(weights[bucket * num_classes + class].abs());
        }
        let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
        scales[class] = scale;

        let row = class * num_buckets;
        for bucket in 0..num_buckets {
            let q = (weights[bucket * num_classes + class] / scale).round();
            quantized[row + bucket] = q.clamp(-127.0, 127.0) as i8;
        }
    }

    LinearModel::new(
        num_buckets,
        dense.labels().to_vec(),
        scales,
        dense.biases().to_vec(),
        quantized,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::model::DenseModel;

    fn random_dense(num_buckets: usize, labels: &[&str], seed: u64) -> DenseModel {
        let mut rng = StdRng::seed_from_u64(seed);
        let num_classes = labels.len();
        let weights: Vec<f32> = (0..num_buckets * num_classes)
            .map(|_| rng.random_range(-0.3f32..0.3f32))
            .collect();
        let biases: Vec<f32> = (0..num_classes).map(|_| rng.random_range(-0.1f32..0.1)).collect();
        DenseModel::from_parts(
            num_buckets,
            labels.iter().map(|s| s.to_string()).collect(),
            weights,
            biases,
        )
    }

    fn dense_weight(dense: &DenseModel, bucket: usize, class: usize) -> f32 {
        dense.weights()[bucket * dense.num_classes() + class]
    }

    #[test]
    fn scale_tracks_the_row_maximum() {
        let base = random_dense(64, &["aaa", "bbb", "ccc"], 7);
        // Random weights stay inside (-0.3, 0.3); force class 2's max-abs.
        let num_classes = base.num_classes();
        let mut weights = base.weights().to_vec();
        weights[5 * num_classes + 2] = -0.37;
        let dense =
            DenseModel::from_parts(64, base.labels().to_vec(), weights, base.biases().to_vec());

        let model = quantize(&dense).unwrap();
        let scale = model.scales()[2];
        assert!(scale > 0.00291 && scale < 0.00292, "scale was {scale}");
    }

    #[test]
    fn dequantization_error_is_bounded_by_scale() {
        let dense = random_dense(128, &["deu", "eng"], 99);
        let model = quantize(&dense).unwrap();
        for class in 0..2 {
            let scale = model.scales()[class];
            for bucket in 0..128 {
                let original = dense_weight(&dense, bucket, class);
                let restored = model.weights()[class * 128 + bucket] as f32 * scale;
                assert!(
                    (restored - original).abs() <= scale,
                    "class {class} bucket {bucket}: |{restored} - {original}| > {scale}"
                );
            }
        }
    }

    #[test]
    fn zero_row_gets_unit_scale() {
        let dense = DenseModel::new(32, vec!["aaa".into(), "bbb".into()]);
        let model = quantize(&dense).unwrap();
        assert_eq!(model.scales(), &[1.0, 1.0]);
        assert!(model.weights().iter().all(|&w| w == 0));
    }

    #[test]
    fn extreme_weight_maps_to_extreme_int() {
        let mut weights = vec![0f32; 32 * 2];
        weights[0 * 2 + 0] = 0.5; // the row max for class 0
        weights[3 * 2 + 0] = -0.25;
        let dense = DenseModel::from_parts(
            32,
            vec!["aaa".into(), "bbb".into()],
            weights,
            vec![0.0, 0.0],
        );
        let model = quantize(&dense).unwrap();
        assert_eq!(model.weights()[0], 127);
        assert_eq!(model.weights()[3], -64); // round(-0.25 / (0.5/127))
    }

    #[test]
    fn biases_and_labels_carry_over() {
        let dense = DenseModel::from_parts(
            16,
            vec!["aaa".into(), "bbb".into()],
            vec![0.1f32; 32],
            vec![0.25, -0.5],
        );
        let model = quantize(&dense).unwrap();
        assert_eq!(model.biases(), &[0.25, -0.5]);
        assert_eq!(model.labels(), dense.labels());
    }
}

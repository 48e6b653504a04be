//! End-to-end pipeline: prepare a synthetic corpus, train two passes with
//! the mislabel filter in between, quantize, round-trip the model file and
//! score the held-out test set.

use std::fs;
use std::io::Write;
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::Rng;

use langid::{
    ConfusableGroups, CorpusConfig, Scorer, Trainer, TrainerConfig, create_epoch_file, evaluate,
    filter_pool, prepare_corpus, quantize, read_labeled_file, read_model_file, write_model_file,
};

// Three disjoint scripts make the classes trivially separable.
const LANGS: [(&str, &str); 3] = [
    ("ell", "αβγδεζ"),
    ("lat", "abcdef"),
    ("rus", "бвгдеж"),
];

fn synthetic_sentence(charset: &str, rng: &mut StdRng) -> String {
    let chars: Vec<char> = charset.chars().collect();
    let words = rng.random_range(4..9);
    let mut sentence = String::new();
    for w in 0..words {
        if w > 0 {
            sentence.push(' ');
        }
        for _ in 0..rng.random_range(3..7) {
            sentence.push(chars[rng.random_range(0..chars.len())]);
        }
    }
    sentence
}

fn write_corpus(corpus_dir: &Path, per_lang: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for (lang, charset) in LANGS {
        let lang_dir = corpus_dir.join(lang);
        fs::create_dir_all(&lang_dir).unwrap();
        let mut writer = fs::File::create(lang_dir.join("sentences.tsv")).unwrap();
        for row in 0..per_lang {
            writeln!(writer, "{row}\t{}", synthetic_sentence(charset, &mut rng)).unwrap();
        }
    }
}

fn micro_config() -> TrainerConfig {
    TrainerConfig {
        num_buckets: 1024,
        adam_epochs: 2,
        max_epochs: 4,
        mini_batch_size: 32,
        batch_size: 256,
        chunk_size: 512,
        checkpoint_interval: 1_000_000,
        dev_subsample_size: 300,
        sgd_threads: 2,
        adam_threads: 1,
        patience: 5,
        seed: 42,
        ..TrainerConfig::default()
    }
}

#[test]
fn two_pass_pipeline_ships_an_accurate_model() {
    let corpus = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), 1000, 7);

    let corpus_config = CorpusConfig {
        min_per_lang: 100,
        max_test_per_lang: 100,
        max_dev_per_lang: 100,
        seed: 42,
    };
    let (paths, prepare) =
        prepare_corpus(corpus.path(), work.path(), &corpus_config).unwrap();
    assert_eq!(prepare.languages.len(), 3);

    let dev = read_labeled_file(&paths.dev_file).unwrap();
    assert!(!dev.is_empty());

    let trainer = Trainer::new(micro_config()).unwrap();
    let groups = ConfusableGroups::new();

    // Pass 1.
    let epoch1 = work.path().join("epoch.pass1.txt");
    create_epoch_file(&paths.pool_dir, &epoch1, 2400, 42, 0).unwrap();
    let (dense1, stats1) = trainer.train(&epoch1, &dev).unwrap();
    assert!(stats1.final_dev_f1 > 0.9, "pass-1 dev F1 {}", stats1.final_dev_f1);

    // Filter: separable data means nearly everything survives.
    let filtered_dir = work.path().join("pool_filtered");
    let filter_reports = filter_pool(
        &dense1,
        trainer.extractor(),
        &groups,
        &paths.pool_dir,
        &filtered_dir,
    )
    .unwrap();
    let kept: u64 = filter_reports.iter().map(|r| r.kept).sum();
    let total: u64 = filter_reports.iter().map(|r| r.total).sum();
    assert!(kept as f64 >= total as f64 * 0.9, "kept {kept} of {total}");

    // Pass 2 over the filtered pool.
    let epoch2 = work.path().join("epoch.pass2.txt");
    create_epoch_file(&filtered_dir, &epoch2, 2400, 42, 1).unwrap();
    let (dense2, _) = trainer.train(&epoch2, &dev).unwrap();

    // Quantize, write, reload.
    let model = quantize(&dense2).unwrap();
    let model_path = work.path().join("model.bin");
    write_model_file(&model_path, &model).unwrap();
    let restored = read_model_file(&model_path).unwrap();
    assert_eq!(model, restored);
    assert_eq!(restored.labels(), &["ell", "lat", "rus"]);

    // Held-out raw test set through the INT8 model.
    let test = read_labeled_file(&paths.test_file).unwrap();
    assert!(test.len() >= 297, "test set has {} sentences", test.len());
    let report = evaluate(&restored, trainer.extractor(), &test, &groups, false);
    assert!(report.accuracy >= 0.99, "test accuracy {}", report.accuracy);
    assert!(report.macro_f1 >= 0.99, "test macro F1 {}", report.macro_f1);
    assert!(report.group_accuracy >= report.accuracy);

    // Single-sentence inference API.
    let (label, prob) = restored.predict("abc fed cab def");
    assert_eq!(label, "lat");
    assert!(prob > 0.5);

    let top = restored.predict_top_k("αβγ δεζ βγα", 3);
    assert_eq!(top.len(), 3);
    assert_eq!(top[0].0, "ell");
    assert!(top[0].1 >= top[1].1 && top[1].1 >= top[2].1);
    let mass: f32 = top.iter().map(|(_, p)| p).sum();
    assert!((mass - 1.0).abs() < 1e-4);
}

#[test]
fn pipeline_is_reproducible() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), 400, 11);
    let corpus_config = CorpusConfig {
        min_per_lang: 50,
        max_test_per_lang: 40,
        max_dev_per_lang: 40,
        seed: 42,
    };

    let mut model_bytes = Vec::new();
    for _ in 0..2 {
        let work = tempfile::tempdir().unwrap();
        let (paths, _) = prepare_corpus(corpus.path(), work.path(), &corpus_config).unwrap();
        let dev = read_labeled_file(&paths.dev_file).unwrap();
        let config = TrainerConfig {
            sgd_threads: 1, // Hogwild nondeterminism is the one seam; pin it.
            ..micro_config()
        };
        let trainer = Trainer::new(config).unwrap();
        let epoch = work.path().join("epoch.txt");
        create_epoch_file(&paths.pool_dir, &epoch, 1000, 42, 0).unwrap();
        let (dense, _) = trainer.train(&epoch, &dev).unwrap();
        let model = quantize(&dense).unwrap();
        let path = work.path().join("model.bin");
        write_model_file(&path, &model).unwrap();
        model_bytes.push(fs::read(&path).unwrap());
    }
    assert_eq!(model_bytes[0], model_bytes[1]);
}

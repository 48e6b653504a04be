//! Language identification over hashed character n-grams.
//!
//! The crate trains a multinomial logistic regression classifier in a
//! two-pass self-cleaning pipeline (train, filter mislabeled pool
//! sentences, retrain), quantizes it to INT8 per class, and serves
//! inference from the compact binary model. Preprocessing and feature
//! hashing are bit-identical between training and inference; that shared
//! path lives in [`preprocess`] and [`features`].

pub mod config;
pub mod corpus;
pub mod error;
pub mod eval;
pub mod features;
pub mod filter;
mod hogwild;
pub mod io;
pub mod languages;
pub mod model;
pub mod preprocess;
pub mod quantize;
pub mod sampler;
pub mod trainer;
pub(crate) mod util;

pub use config::TrainerConfig;
pub use corpus::{CorpusConfig, CorpusPaths, LabeledSentence, PrepareReport, prepare_corpus, read_labeled_file};
pub use error::{Error, Result};
pub use eval::{EvalReport, evaluate};
pub use features::{FeatureConfig, FeatureExtractor};
pub use filter::{FilterReport, filter_pool};
pub use io::{load_model, read_model_file, save_model, write_model_file};
pub use languages::ConfusableGroups;
pub use model::{DenseModel, InferenceScratch, LinearModel, Scorer};
pub use preprocess::preprocess;
pub use quantize::quantize;
pub use sampler::{EpochFileStats, create_epoch_file, flat_cap};
pub use trainer::{TrainStats, Trainer};

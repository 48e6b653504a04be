//! Corpus preparation: merge, exclude, dedup, split.
//!
//! Input is a directory of per-language subdirectories holding tab-delimited
//! `rowid<TAB>text` files. Output is the training pool (one preprocessed
//! file per language, label = filename), a preprocessed dev set and a raw
//! test set. Everything is deterministic for a fixed seed: languages are
//! visited in sorted order and every shuffle is seeded from the language
//! code.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use fnv::FnvHashMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::languages;
use crate::preprocess::preprocess;
use crate::util::fnv64;

/// One labeled training sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSentence {
    pub lang: String,
    pub text: String,
}

impl LabeledSentence {
    pub fn new<L: Into<String>, T: Into<String>>(lang: L, text: T) -> Self {
        LabeledSentence {
            lang: lang.into(),
            text: text.into(),
        }
    }
}

/// Read a `lang<TAB>text` file into memory, skipping malformed lines.
pub fn read_labeled_file(path: &Path) -> Result<Vec<LabeledSentence>> {
    let reader = BufReader::new(File::open(path)?);
    let mut sentences = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Some((lang, text)) = line.split_once('\t') {
            if !lang.is_empty() && !text.is_empty() {
                sentences.push(LabeledSentence::new(lang, text));
            }
        }
    }
    Ok(sentences)
}

#[derive(Debug, Clone)]
pub struct CorpusConfig {
    /// Languages below this sentence count after merge+dedup are dropped.
    pub min_per_lang: usize,
    pub max_test_per_lang: usize,
    pub max_dev_per_lang: usize,
    pub seed: u64,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        CorpusConfig {
            min_per_lang: 10_000,
            max_test_per_lang: 10_000,
            max_dev_per_lang: 5_000,
            seed: 42,
        }
    }
}

/// Artifacts of a prepared corpus.
#[derive(Debug, Clone)]
pub struct CorpusPaths {
    pub pool_dir: PathBuf,
    pub dev_file: PathBuf,
    pub test_file: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct LanguageCounts {
    pub lang: String,
    pub pool: usize,
    pub dev: usize,
    pub test: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrepareReport {
    pub languages: Vec<LanguageCounts>,
    pub excluded: Vec<String>,
    pub dropped_small: Vec<(String, usize)>,
    pub malformed_rows: u64,
}

struct LanguageSplit {
    counts: LanguageCounts,
    dev_lines: Vec<String>,
    test_lines: Vec<String>,
}

enum LanguageOutcome {
    Kept(LanguageSplit),
    TooSmall { lang: String, sentences: usize },
}

/// Build `pool/<lang>`, `dev.txt` and `test_raw.txt` under `work_dir`.
pub fn prepare_corpus(
    corpus_dir: &Path,
    work_dir: &Path,
    config: &CorpusConfig,
) -> Result<(CorpusPaths, PrepareReport)> {
    if !corpus_dir.is_dir() {
        return Err(Error::corpus(format!(
            "corpus directory {} does not exist",
            corpus_dir.display()
        )));
    }
    let pool_dir = work_dir.join("pool");
    fs::create_dir_all(&pool_dir)?;

    // Group source directories by canonical code; excluded codes drop here.
    let mut sources: FnvHashMap<String, Vec<PathBuf>> = FnvHashMap::default();
    let mut excluded = Vec::new();
    for entry in sorted_entries(corpus_dir)? {
        if !entry.is_dir() {
            continue;
        }
        let code = match entry.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if languages::is_excluded(&code) {
            excluded.push(code);
            continue;
        }
        let canonical = languages::canonical(&code).to_string();
        sources.entry(canonical).or_default().push(entry);
    }
    excluded.sort();
    if sources.is_empty() {
        return Err(Error::corpus(format!(
            "no language subdirectories under {}",
            corpus_dir.display()
        )));
    }

    let mut langs: Vec<(String, Vec<PathBuf>)> = sources.into_iter().collect();
    langs.sort_by(|a, b| a.0.cmp(&b.0));

    let outcomes: Vec<(LanguageOutcome, u64)> = langs
        .par_iter()
        .map(|(lang, dirs)| split_language(lang, dirs, &pool_dir, config))
        .collect::<Result<Vec<_>>>()?;

    let dev_file = work_dir.join("dev.txt");
    let test_file = work_dir.join("test_raw.txt");
    let mut dev_writer = BufWriter::new(File::create(&dev_file)?);
    let mut test_writer = BufWriter::new(File::create(&test_file)?);

    let mut report = PrepareReport {
        excluded,
        ..PrepareReport::default()
    };
    for (outcome, malformed) in outcomes {
        report.malformed_rows += malformed;
        match outcome {
            LanguageOutcome::Kept(split) => {
                for line in &split.dev_lines {
                    writeln!(dev_writer, "{}\t{}", split.counts.lang, line)?;
                }
                for line in &split.test_lines {
                    writeln!(test_writer, "{}\t{}", split.counts.lang, line)?;
                }
                report.languages.push(split.counts);
            }
            LanguageOutcome::TooSmall { lang, sentences } => {
                warn!(lang = %lang, sentences, "dropping language below minimum size");
                report.dropped_small.push((lang, sentences));
            }
        }
    }
    dev_writer.flush()?;
    test_writer.flush()?;

    if report.languages.is_empty() {
        return Err(Error::corpus("no language survived preparation"));
    }
    info!(
        kept = report.languages.len(),
        excluded = report.excluded.len(),
        dropped = report.dropped_small.len(),
        "corpus prepared"
    );

    Ok((
        CorpusPaths {
            pool_dir,
            dev_file,
            test_file,
        },
        report,
    ))
}

/// Dedup, shuffle and split one canonical language, writing its pool file.
fn split_language(
    lang: &str,
    dirs: &[PathBuf],
    pool_dir: &Path,
    config: &CorpusConfig,
) -> Result<(LanguageOutcome, u64)> {
    let mut sentences: Vec<String> = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();
    let mut duplicates = 0usize;
    let mut malformed = 0u64;

    for dir in dirs {
        for file in sorted_entries(dir)? {
            if !file.is_file() {
                continue;
            }
            let reader = BufReader::new(File::open(&file)?);
            for line in reader.lines() {
                let line = line?;
                match line.split_once('\t') {
                    Some((_, text)) if !text.is_empty() => {
                        if seen.insert(fnv64(text.as_bytes())) {
                            sentences.push(text.to_string());
                        } else {
                            duplicates += 1;
                        }
                    }
                    _ => malformed += 1,
                }
            }
        }
    }

    if sentences.len() < config.min_per_lang {
        return Ok((
            LanguageOutcome::TooSmall {
                lang: lang.to_string(),
                sentences: sentences.len(),
            },
            malformed,
        ));
    }

    let mut rng = StdRng::seed_from_u64(fnv64(lang.as_bytes()).wrapping_add(config.seed));
    sentences.shuffle(&mut rng);

    let test_n = (sentences.len() / 10).min(config.max_test_per_lang);
    let remainder = sentences.len() - test_n;
    let dev_n = (remainder / 10).min(config.max_dev_per_lang);

    let test_lines: Vec<String> = sentences[..test_n].to_vec();
    let dev_lines: Vec<String> = sentences[test_n..test_n + dev_n]
        .iter()
        .map(|s| preprocess(s))
        .filter(|s| !s.is_empty())
        .collect();

    let pool_path = pool_dir.join(lang);
    let mut pool_writer = BufWriter::new(File::create(&pool_path)?);
    let mut pool_n = 0usize;
    for sentence in &sentences[test_n + dev_n..] {
        let canonical = preprocess(sentence);
        if canonical.is_empty() {
            continue;
        }
        writeln!(pool_writer, "{canonical}")?;
        pool_n += 1;
    }
    pool_writer.flush()?;

    Ok((
        LanguageOutcome::Kept(LanguageSplit {
            counts: LanguageCounts {
                lang: lang.to_string(),
                pool: pool_n,
                dev: dev_lines.len(),
                test: test_lines.len(),
                duplicates,
            },
            dev_lines,
            test_lines,
        }),
        malformed,
    ))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();
    Ok(entries)
}

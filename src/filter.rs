//! Mislabel filtering between the two training passes.
//!
//! The pass-1 model rereads the whole pool and keeps a sentence only when
//! its prediction agrees with the pool label, or disagrees within the
//! label's confusable group. Agreement within a group is kept on purpose:
//! for near-identical language pairs the pass-1 model's cross-predictions
//! say more about the pair than about the sentence.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::features::FeatureExtractor;
use crate::languages::ConfusableGroups;
use crate::model::{Scorer, argmax};

#[derive(Debug, Clone, Serialize)]
pub struct FilterReport {
    pub lang: String,
    pub kept: u64,
    pub total: u64,
}

/// Filter every `pool_dir/<lang>` into `out_dir/<lang>`, one parallel task
/// per language. Pool text is already canonical, so no preprocessing runs
/// here.
pub fn filter_pool<S: Scorer + Sync>(
    model: &S,
    extractor: &FeatureExtractor,
    groups: &ConfusableGroups,
    pool_dir: &Path,
    out_dir: &Path,
) -> Result<Vec<FilterReport>> {
    fs::create_dir_all(out_dir)?;
    let mut pool_files: Vec<PathBuf> = fs::read_dir(pool_dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    pool_files.sort();
    if pool_files.is_empty() {
        return Err(Error::corpus(format!(
            "no pool files under {}",
            pool_dir.display()
        )));
    }

    let reports: Vec<FilterReport> = pool_files
        .par_iter()
        .map(|path| filter_language(model, extractor, groups, path, out_dir))
        .collect::<Result<Vec<_>>>()?;

    let kept: u64 = reports.iter().map(|r| r.kept).sum();
    let total: u64 = reports.iter().map(|r| r.total).sum();
    info!(kept, total, "pool filtered");
    Ok(reports)
}

fn filter_language<S: Scorer + Sync>(
    model: &S,
    extractor: &FeatureExtractor,
    groups: &ConfusableGroups,
    pool_path: &Path,
    out_dir: &Path,
) -> Result<FilterReport> {
    let lang = pool_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::corpus(format!("unusable pool filename {}", pool_path.display())))?
        .to_string();

    let labels = model.labels();
    let reader = BufReader::new(File::open(pool_path)?);
    let mut writer = BufWriter::new(File::create(out_dir.join(&lang))?);

    let mut counts = vec![0u32; extractor.num_buckets()];
    let mut nz: Vec<u32> = Vec::new();
    let mut logits = vec![0f32; labels.len()];

    let mut kept = 0u64;
    let mut total = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        total += 1;

        extractor.extract_into(&line, &mut counts, &mut nz);
        model.score_into(&counts, &nz, &mut logits);
        extractor.reset(&mut counts, &mut nz);

        let predicted = labels[argmax(&logits)].as_str();
        if groups.same_group(predicted, &lang) {
            writeln!(writer, "{line}")?;
            kept += 1;
        }
    }
    writer.flush()?;

    Ok(FilterReport { lang, kept, total })
}

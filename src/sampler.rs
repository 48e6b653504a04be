//! Balanced epoch files.
//!
//! Each training pass gets one epoch file built from the pool: every
//! language contributes `min(pool_size, cap)` sentences, where the flat cap
//! is binary-searched so the total lands on the configured target. Each
//! language's share is reservoir-sampled into a temp file (so only one
//! reservoir is ever resident) and the temp files are interleaved by uniform
//! random pick, which keeps languages mixed at every scale of the file.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::util::derive_seed;

const SEED_ROLE_RESERVOIR: u64 = 0x45;
const SEED_ROLE_INTERLEAVE: u64 = 0x49;

/// Smallest cap whose per-language coverage `Σ min(n, cap)` reaches
/// `target`; the largest pool size when the whole corpus is smaller than
/// the target.
pub fn flat_cap(pool_sizes: &[u64], target: u64) -> u64 {
    let max = pool_sizes.iter().copied().max().unwrap_or(0);
    let total: u64 = pool_sizes.iter().sum();
    if total <= target {
        return max;
    }
    let mut lo = 0u64;
    let mut hi = max;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let covered: u64 = pool_sizes.iter().map(|&n| n.min(mid)).sum();
        if covered < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochFileStats {
    pub lines: u64,
    pub cap: u64,
    pub per_language: Vec<(String, u64)>,
}

/// Build one shuffled, balanced `lang<TAB>text` epoch file from
/// `pool_dir`.
pub fn create_epoch_file(
    pool_dir: &Path,
    out_path: &Path,
    target_total: u64,
    seed: u64,
    epoch: usize,
) -> Result<EpochFileStats> {
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

    let mut langs = Vec::with_capacity(pool_files.len());
    let mut sizes = Vec::with_capacity(pool_files.len());
    for path in &pool_files {
        let lang = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::corpus(format!("unusable pool filename {}", path.display())))?
            .to_string();
        sizes.push(count_lines(path)?);
        langs.push(lang);
    }

    let cap = flat_cap(&sizes, target_total);
    debug!(cap, target_total, languages = langs.len(), "computed flat cap");

    // Reservoir-sample each language into its own temp file. The TempDir
    // guard removes them on success, error and panic alike.
    let temp_dir = tempfile::tempdir()?;
    let mut temp_files = Vec::with_capacity(langs.len());
    let mut per_language = Vec::with_capacity(langs.len());
    for (idx, (lang, path)) in langs.iter().zip(&pool_files).enumerate() {
        let take = sizes[idx].min(cap);
        let mut rng = StdRng::seed_from_u64(derive_seed(
            seed,
            SEED_ROLE_RESERVOIR.wrapping_add((epoch as u64) << 8),
            idx as u64,
        ));
        let reservoir = reservoir_sample(path, take as usize, &mut rng)?;
        let temp_path = temp_dir.path().join(format!("{idx}.txt"));
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        for line in &reservoir {
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        per_language.push((lang.clone(), reservoir.len() as u64));
        temp_files.push(temp_path);
    }

    // Multi-way interleave by uniform random pick over the still-open
    // files; round-robin would clump languages at the tail.
    struct OpenReservoir {
        lang: String,
        reader: BufReader<File>,
    }
    let mut open: Vec<OpenReservoir> = langs
        .iter()
        .zip(&temp_files)
        .map(|(lang, path)| -> Result<OpenReservoir> {
            Ok(OpenReservoir {
                lang: lang.clone(),
                reader: BufReader::new(File::open(path)?),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut rng = StdRng::seed_from_u64(derive_seed(seed, SEED_ROLE_INTERLEAVE, epoch as u64));
    let mut writer = BufWriter::new(File::create(out_path)?);
    let mut lines = 0u64;
    let mut buf = String::new();
    while !open.is_empty() {
        let pick = rng.random_range(0..open.len());
        buf.clear();
        let read = open[pick].reader.read_line(&mut buf)?;
        if read == 0 {
            open.swap_remove(pick);
            continue;
        }
        let text = buf.trim_end_matches('\n');
        writeln!(writer, "{}\t{}", open[pick].lang, text)?;
        lines += 1;
    }
    writer.flush()?;

    info!(
        lines,
        cap,
        languages = per_language.len(),
        out = %out_path.display(),
        "epoch file written"
    );
    Ok(EpochFileStats {
        lines,
        cap,
        per_language,
    })
}

/// Algorithm R over the lines of a file.
fn reservoir_sample(path: &Path, k: usize, rng: &mut StdRng) -> Result<Vec<String>> {
    let mut reservoir: Vec<String> = Vec::with_capacity(k);
    if k == 0 {
        return Ok(reservoir);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut seen = 0usize;
    for line in reader.lines() {
        let line = line?;
        if reservoir.len() < k {
            reservoir.push(line);
        } else {
            let slot = rng.random_range(0..=seen);
            if slot < k {
                reservoir[slot] = line;
            }
        }
        seen += 1;
    }
    Ok(reservoir)
}

fn count_lines(path: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut lines = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        lines += 1;
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn write_pool(dir: &Path, lang: &str, n: usize) {
        let mut writer = BufWriter::new(File::create(dir.join(lang)).unwrap());
        for i in 0..n {
            writeln!(writer, "{lang} sentence {i}").unwrap();
        }
        writer.flush().unwrap();
    }

    #[test]
    fn flat_cap_hits_the_target() {
        // cap 100 covers 50 + 100 + 100 = 250.
        assert_eq!(flat_cap(&[50, 100, 200], 250), 100);
        // One short of coverage forces the next cap up.
        assert_eq!(flat_cap(&[50, 100, 200], 251), 101);
        // Target above the corpus returns the largest pool.
        assert_eq!(flat_cap(&[50, 100, 200], 1_000), 200);
        assert_eq!(flat_cap(&[], 100), 0);
    }

    #[test]
    fn epoch_counts_match_min_pool_cap() {
        let pool = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_pool(pool.path(), "aaa", 50);
        write_pool(pool.path(), "bbb", 100);
        write_pool(pool.path(), "ccc", 200);

        let epoch_path = out.path().join("epoch.txt");
        let stats = create_epoch_file(pool.path(), &epoch_path, 250, 42, 0).unwrap();
        assert_eq!(stats.cap, 100);
        assert_eq!(stats.lines, 250);

        let mut counts: HashMap<String, u64> = HashMap::new();
        for line in fs::read_to_string(&epoch_path).unwrap().lines() {
            let (lang, _) = line.split_once('\t').unwrap();
            *counts.entry(lang.to_string()).or_default() += 1;
        }
        assert_eq!(counts["aaa"], 50);
        assert_eq!(counts["bbb"], 100);
        assert_eq!(counts["ccc"], 100);
    }

    #[test]
    fn epoch_file_is_deterministic_per_seed_and_epoch() {
        let pool = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_pool(pool.path(), "aaa", 30);
        write_pool(pool.path(), "bbb", 30);

        let path_a = out.path().join("a.txt");
        let path_b = out.path().join("b.txt");
        let path_c = out.path().join("c.txt");
        create_epoch_file(pool.path(), &path_a, 40, 7, 0).unwrap();
        create_epoch_file(pool.path(), &path_b, 40, 7, 0).unwrap();
        create_epoch_file(pool.path(), &path_c, 40, 7, 1).unwrap();

        let a = fs::read(&path_a).unwrap();
        assert_eq!(a, fs::read(&path_b).unwrap());
        assert_ne!(a, fs::read(&path_c).unwrap());
    }

    #[test]
    fn interleave_mixes_languages() {
        let pool = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_pool(pool.path(), "aaa", 100);
        write_pool(pool.path(), "bbb", 100);

        let epoch_path = out.path().join("epoch.txt");
        create_epoch_file(pool.path(), &epoch_path, 200, 42, 0).unwrap();

        // The first half must not be a single language block.
        let content = fs::read_to_string(&epoch_path).unwrap();
        let first_half: Vec<&str> = content
            .lines()
            .take(100)
            .map(|l| l.split_once('\t').unwrap().0)
            .collect();
        assert!(first_half.contains(&"aaa"));
        assert!(first_half.contains(&"bbb"));
    }

    #[test]
    fn reservoir_keeps_everything_when_small() {
        let pool = tempfile::tempdir().unwrap();
        write_pool(pool.path(), "aaa", 10);
        let mut rng = StdRng::seed_from_u64(1);
        let sample = reservoir_sample(&pool.path().join("aaa"), 20, &mut rng).unwrap();
        assert_eq!(sample.len(), 10);
        let mut rng = StdRng::seed_from_u64(1);
        let sample = reservoir_sample(&pool.path().join("aaa"), 4, &mut rng).unwrap();
        assert_eq!(sample.len(), 4);
    }

    #[test]
    fn empty_pool_dir_errors() {
        let pool = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        assert!(create_epoch_file(pool.path(), &out.path().join("e.txt"), 10, 1, 0).is_err());
    }
}

//! Hashed character n-gram features.
//!
//! Every feature family emits typed tokens through a listener closure; a
//! one-byte family tag is hashed ahead of the token bytes so families can
//! never collide in hash space. Bucketing is FNV-1a 64 over the tag plus the
//! UTF-8 bytes of the token characters, masked down to the configured
//! power-of-two width. The same input yields the same buckets on every
//! platform, run and process.

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::Serialize;

use crate::error::{Error, Result};

const TAG_CHAR_BIGRAM: u8 = 0x01;
const TAG_CHAR_TRIGRAM: u8 = 0x02;
const TAG_CJK_UNIGRAM: u8 = 0x03;

// Ideographic and kana blocks that get per-character evidence: CJK
// punctuation, hiragana, katakana, unified ideographs, halfwidth katakana.
const CJK_RANGES: &[(u32, u32)] = &[
    (0x3000, 0x303f),
    (0x3040, 0x309f),
    (0x30a0, 0x30ff),
    (0x4e00, 0x9fff),
    (0xff61, 0xff90),
];

#[inline]
fn is_cjk(ch: char) -> bool {
    let code = ch as u32;
    CJK_RANGES
        .iter()
        .any(|&(lo, hi)| code >= lo && code <= hi)
}

/// One typed feature token.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Feature {
    CharBigram(char, char),
    CharTrigram(char, char, char),
    CjkUnigram(char),
}

impl Feature {
    /// Bit-exact 64-bit hash of the token. The family tag byte goes in
    /// first; characters are fed as their UTF-8 bytes, never as
    /// native-endian integers.
    #[inline(always)]
    pub fn to_hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        let mut buf = [0u8; 4];
        match *self {
            Feature::CharBigram(a, b) => {
                hasher.write(&[TAG_CHAR_BIGRAM]);
                hasher.write(a.encode_utf8(&mut buf).as_bytes());
                hasher.write(b.encode_utf8(&mut buf).as_bytes());
            }
            Feature::CharTrigram(a, b, c) => {
                hasher.write(&[TAG_CHAR_TRIGRAM]);
                hasher.write(a.encode_utf8(&mut buf).as_bytes());
                hasher.write(b.encode_utf8(&mut buf).as_bytes());
                hasher.write(c.encode_utf8(&mut buf).as_bytes());
            }
            Feature::CjkUnigram(ch) => {
                hasher.write(&[TAG_CJK_UNIGRAM]);
                hasher.write(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
        hasher.finish()
    }
}

/// Which feature families the extractor emits. Part of the model-build-time
/// contract: inference must run with the same configuration that trained the
/// weights.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FeatureConfig {
    /// Adjacent character triples. Off in the production model.
    pub char_trigrams: bool,

    /// Per-character evidence for ideographic scripts.
    pub cjk_unigrams: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            char_trigrams: false,
            cjk_unigrams: true,
        }
    }
}

/// Walk the canonical text and hand every feature token to `listener`.
///
/// Bigrams lead with a single space sentinel so the first character is a
/// feature on its own; trigrams start only once two real characters have
/// been seen. Token count is linear in the text length.
pub fn emit_tokens(text: &str, config: &FeatureConfig, mut listener: impl FnMut(Feature)) {
    let mut prev = ' ';
    let mut before_prev = ' ';
    let mut seen = 0usize;
    for ch in text.chars() {
        listener(Feature::CharBigram(prev, ch));
        if config.char_trigrams && seen >= 2 {
            listener(Feature::CharTrigram(before_prev, prev, ch));
        }
        if config.cjk_unigrams && is_cjk(ch) {
            listener(Feature::CjkUnigram(ch));
        }
        before_prev = prev;
        prev = ch;
        seen += 1;
    }
}

/// Maps canonical text to a sparse count vector over `[0, num_buckets)`.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    num_buckets: usize,
    mask: u64,
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(num_buckets: usize) -> Result<Self> {
        Self::with_config(num_buckets, FeatureConfig::default())
    }

    pub fn with_config(num_buckets: usize, config: FeatureConfig) -> Result<Self> {
        if num_buckets == 0 || !num_buckets.is_power_of_two() {
            return Err(Error::config(format!(
                "num_buckets must be a power of two, got {num_buckets}"
            )));
        }
        Ok(FeatureExtractor {
            num_buckets,
            mask: num_buckets as u64 - 1,
            config,
        })
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Accumulate bucket counts for `canonical` into `counts`, pushing every
    /// first-touched bucket onto `nz`. Returns the number of nonzero
    /// buckets.
    ///
    /// `counts` must be `num_buckets` long and zeroed (or reset via
    /// [`FeatureExtractor::reset`]); the caller owns both buffers so the hot
    /// path never allocates.
    pub fn extract_into(&self, canonical: &str, counts: &mut [u32], nz: &mut Vec<u32>) -> usize {
        debug_assert_eq!(counts.len(), self.num_buckets);
        emit_tokens(canonical, &self.config, |feature| {
            let bucket = (feature.to_hash() & self.mask) as usize;
            if counts[bucket] == 0 {
                nz.push(bucket as u32);
            }
            counts[bucket] = counts[bucket].saturating_add(1);
        });
        nz.len()
    }

    /// Zero exactly the buckets touched by the previous extraction and clear
    /// the nonzero list, leaving both buffers ready for the next sample.
    pub fn reset(&self, counts: &mut [u32], nz: &mut Vec<u32>) {
        for &bucket in nz.iter() {
            counts[bucket as usize] = 0;
        }
        nz.clear();
    }

    /// Allocating convenience for cold paths and tests.
    pub fn extract_counts(&self, canonical: &str) -> Vec<u32> {
        let mut counts = vec![0u32; self.num_buckets];
        let mut nz = Vec::new();
        self.extract_into(canonical, &mut counts, &mut nz);
        counts
    }
}

//! Fixed language-code tables: merges, exclusions and confusable groups.
//!
//! All three are empirical constants. Codes are ISO 639-3 by convention but
//! the rest of the crate treats them as opaque strings.

use fnv::FnvHashMap;

/// Variant codes collapsed to a canonical code before splitting.
pub const MERGE_MAP: &[(&str, &str)] = &[
    ("arb", "ara"),
    ("azj", "aze"),
    ("cmn", "zho"),
    ("ekk", "est"),
    ("khk", "mon"),
    ("lvs", "lav"),
    ("nob", "nor"),
    ("ory", "ori"),
    ("pes", "fas"),
    ("plt", "mlg"),
    ("pnb", "pan"),
    ("uzn", "uzb"),
    ("zsm", "msa"),
];

/// Codes dropped from training entirely. Either their own accuracy stayed
/// below the quality bar or their presence measurably hurt a neighbor.
pub const EXCLUDED: &[&str] = &[
    "bar", "cbk", "gsw", "ile", "ina", "lfn", "nds", "pms", "vol",
];

/// Disjoint sets of codes treated as interchangeable when filtering
/// mislabeled sentences and when reporting group accuracy.
pub const CONFUSABLE_GROUPS: &[&[&str]] = &[
    &["bos", "hrv", "srp"],
    &["dan", "nno", "nor"],
    &["ind", "msa"],
    &["ces", "slk"],
    &["bul", "mkd"],
    &["glg", "por"],
    &["rus", "ukr"],
];

/// Map a corpus code to its canonical training code.
pub fn canonical(code: &str) -> &str {
    MERGE_MAP
        .iter()
        .find(|(variant, _)| *variant == code)
        .map(|(_, canon)| *canon)
        .unwrap_or(code)
}

pub fn is_excluded(code: &str) -> bool {
    EXCLUDED.contains(&code)
}

/// Group-membership lookup over [`CONFUSABLE_GROUPS`].
#[derive(Debug, Clone)]
pub struct ConfusableGroups {
    index: FnvHashMap<&'static str, usize>,
}

impl ConfusableGroups {
    pub fn new() -> Self {
        let mut index = FnvHashMap::default();
        for (group_id, group) in CONFUSABLE_GROUPS.iter().enumerate() {
            for code in group.iter() {
                index.insert(*code, group_id);
            }
        }
        ConfusableGroups { index }
    }

    /// True when the two codes are equal or share a confusable group.
    pub fn same_group(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        match (self.index.get(a), self.index.get(b)) {
            (Some(ga), Some(gb)) => ga == gb,
            _ => false,
        }
    }
}

impl Default for ConfusableGroups {
    fn default() -> Self {
        Self::new()
    }
}

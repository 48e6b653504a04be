//! Canonical text form shared by training and inference.
//!
//! The exact byte output matters: features are hashed from this string, so
//! any divergence between the trainer's and the classifier's preprocessing
//! silently destroys accuracy. Every step is idempotent and the pipeline as
//! a whole is too.

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Characters kept after normalization. Sentences carry enough n-gram
/// evidence well before this point; longer inputs only add cost.
pub const MAX_CHARS: usize = 256;

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:https?://|www\.)[^\s]+").unwrap()
    })
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[0-9A-Za-z._%+-]+@[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)+\b").unwrap()
    })
}

/// Normalize to NFC, blank out URLs and email addresses, collapse whitespace
/// runs to single spaces, and truncate to [`MAX_CHARS`] characters.
///
/// Script and case are preserved.
pub fn preprocess(text: &str) -> String {
    let normalized: String = text.nfc().collect();
    let stripped = url_pattern().replace_all(&normalized, " ");
    let stripped = email_pattern().replace_all(&stripped, " ");

    let mut out = String::with_capacity(stripped.len().min(MAX_CHARS * 4));
    let mut remaining = MAX_CHARS;
    'words: for word in stripped.split_whitespace() {
        if !out.is_empty() {
            // A separator only makes sense if at least one more character
            // fits after it; a trailing space would break idempotence.
            if remaining < 2 {
                break;
            }
            out.push(' ');
            remaining -= 1;
        }
        for ch in word.chars() {
            if remaining == 0 {
                break 'words;
            }
            out.push(ch);
            remaining -= 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace() {
        assert_eq!(preprocess("a  b\t\tc\nd"), "a b c d");
        assert_eq!(preprocess("  padded  "), "padded");
    }

    #[test]
    fn collapses_non_ascii_whitespace() {
        assert_eq!(preprocess("a\u{a0} \u{a0}b"), "a b");
    }

    #[test]
    fn strips_urls_and_emails() {
        assert_eq!(preprocess("see https://example.com/x?q=1 now"), "see now");
        assert_eq!(preprocess("visit www.example.com today"), "visit today");
        assert_eq!(preprocess("mail me@example.co.uk please"), "mail please");
    }

    #[test]
    fn applies_nfc() {
        // e + combining acute composes to a single code point.
        assert_eq!(preprocess("cafe\u{301}"), "caf\u{e9}");
    }

    #[test]
    fn truncates_at_char_boundary() {
        let long: String = "é".repeat(MAX_CHARS + 50);
        let out = preprocess(&long);
        assert_eq!(out.chars().count(), MAX_CHARS);
    }

    #[test]
    fn preserves_case_and_script() {
        assert_eq!(preprocess("Ich BIN hier"), "Ich BIN hier");
        assert_eq!(preprocess("Привет мир"), "Привет мир");
    }

    #[test]
    fn idempotent() {
        let cases = [
            "Visit https://example.com NOW!\u{a0} \u{a0}already normalized",
            "plain text",
            "tabs\tand\nnewlines",
            "ドイツ語 მესამე",
            "",
            "   ",
        ];
        for case in cases {
            let once = preprocess(case);
            assert_eq!(preprocess(&once), once, "not idempotent for {case:?}");
        }
    }

    #[test]
    fn idempotent_at_truncation_edge() {
        // A word straddling the cutoff must truncate the same way twice.
        let long = format!("{} tail", "x".repeat(MAX_CHARS - 1));
        let once = preprocess(&long);
        assert_eq!(preprocess(&once), once);
        let exact = "y".repeat(MAX_CHARS + 3);
        let once = preprocess(&exact);
        assert_eq!(once.chars().count(), MAX_CHARS);
        assert_eq!(preprocess(&once), once);
    }
}

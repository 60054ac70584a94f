//! Record fingerprints.
//!
//! A record is reduced to three SHA-256 digests:
//!
//! 1. **url hash** - identity of the post
//! 2. **content hash** - normalized text plus author handle, catches the same
//!    post re-shared under a different url
//! 3. **text hash** - normalized text alone, catches copy-pasted text from
//!    different accounts
//!
//! Normalization is Unicode NFC, lowercase, whitespace collapsed to single
//! spaces and trimmed.

use ring::digest::{self, SHA256};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::model::Record;

/// The three digests derived from a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub url_hash: String,
    pub content_hash: String,
    pub text_hash: String,
}

impl Fingerprint {
    /// Compute the fingerprint of a record. Deterministic.
    #[must_use]
    pub fn of(record: &Record) -> Self {
        let text = normalize_text(&record.text);
        let content = format!("{text}\u{1f}{}", record.author_handle.trim());
        Self {
            url_hash: sha256_hex(&record.url),
            content_hash: sha256_hex(&content),
            text_hash: sha256_hex(&text),
        }
    }
}

/// NFC, lowercase, collapse whitespace runs, trim.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    let nfc: String = text.nfc().collect();
    let lower = nfc.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    for word in lower.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// SHA-256 of the UTF-8 bytes, hex encoded.
#[must_use]
pub fn sha256_hex(text: &str) -> String {
    let digest = digest::digest(&SHA256, text.as_bytes());
    hex_encode(digest.as_ref())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Levenshtein edit distance over chars.
#[must_use]
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let a_len = a_chars.len();
    let b_len = b_chars.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev_row: Vec<usize> = (0..=b_len).collect();
    let mut curr_row: Vec<usize> = vec![0; b_len + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        curr_row[0] = i + 1;

        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            curr_row[j + 1] = (prev_row[j + 1] + 1)
                .min(curr_row[j] + 1)
                .min(prev_row[j] + cost);
        }

        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_len]
}

/// Similarity in `[0.0, 1.0]` between two already-normalized texts:
/// `1 - distance / max_len`. Two empty strings are identical.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(a, b) as f64 / max_len as f64
}

/// Cheapest possible upper bound on [`similarity_ratio`], from lengths only.
/// Used to prefilter candidates before the quadratic comparison.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn length_bound(len_a: usize, len_b: usize) -> f64 {
    let max_len = len_a.max(len_b);
    if max_len == 0 {
        return 1.0;
    }
    len_a.min(len_b) as f64 / max_len as f64
}

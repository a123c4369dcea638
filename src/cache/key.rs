//! Canonical cache key generation.
//!
//! Two queries that differ only in whitespace or label-selector order
//! must hit the same cache slot, so the query text is normalized before
//! keying: whitespace collapsed, padding inside brackets stripped,
//! selector contents sorted. Over-long normalized queries are replaced
//! by a truncated SHA-256 digest to bound key length; collision
//! resistance only needs to be good enough for a cache, not for crypto.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::client::TimeParams;

/// Longest normalized query carried verbatim in a key.
const MAX_INLINE_QUERY_LEN: usize = 100;

/// Instant timestamps round down to this many seconds, trading a small
/// staleness window for hits on near-simultaneous requests.
const INSTANT_BUCKET_SECS: i64 = 60;

/// The operation a key is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Instant,
    Range,
    Series,
    Labels,
}

impl QueryKind {
    fn discriminant(self) -> &'static str {
        match self {
            QueryKind::Instant => "i",
            QueryKind::Range => "r",
            QueryKind::Series => "s",
            QueryKind::Labels => "l",
        }
    }
}

/// Generate the canonical cache key for a query and its time parameters.
///
/// Pure and deterministic: equal inputs always produce equal keys, and
/// semantically identical queries differing only in whitespace or
/// selector order produce equal keys.
pub fn generate(kind: QueryKind, query: &str, params: &TimeParams) -> String {
    let normalized = normalize_query(query);

    let query_part = if normalized.len() > MAX_INLINE_QUERY_LEN {
        let digest = Sha256::digest(normalized.as_bytes());
        let mut hashed = String::with_capacity(21);
        hashed.push_str("hash_");
        for byte in &digest[..8] {
            let _ = write!(hashed, "{:02x}", byte);
        }
        hashed
    } else {
        normalized
    };

    match *params {
        TimeParams::Instant { at } => {
            format!(
                "{}|{}|{}",
                kind.discriminant(),
                query_part,
                bucket_timestamp(at)
            )
        }
        TimeParams::Range { start, end, step } => {
            format!(
                "{}|{}|{}_{}|{}",
                kind.discriminant(),
                query_part,
                start.timestamp(),
                end.timestamp(),
                step.as_secs()
            )
        }
    }
}

fn bucket_timestamp(at: DateTime<Utc>) -> i64 {
    let ts = at.timestamp();
    ts - ts.rem_euclid(INSTANT_BUCKET_SECS)
}

/// Normalize a query string into its canonical form.
pub fn normalize_query(query: &str) -> String {
    let collapsed: String = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let tightened = strip_bracket_padding(&collapsed);
    sort_selector_blocks(&tightened)
}

/// Drop the single spaces left by collapsing that sit just inside
/// `[...]`, `(...)`, `{...}`, or between a metric name and its opening
/// brace or bracket.
fn strip_bracket_padding(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());

    for (i, &c) in chars.iter().enumerate() {
        if c == ' ' {
            let prev = if i > 0 { Some(chars[i - 1]) } else { None };
            let next = chars.get(i + 1).copied();

            let after_opener = matches!(prev, Some('[') | Some('(') | Some('{'));
            let before_closer = matches!(next, Some(']') | Some(')') | Some('}'));
            let before_opener = matches!(next, Some('{') | Some('['));

            if after_opener || before_closer || before_opener {
                continue;
            }
        }
        out.push(c);
    }

    out
}

/// Sort the comma-separated matchers inside every `{...}` block so that
/// selector order no longer affects the key. Splitting is quote-aware:
/// commas inside label values stay put.
fn sort_selector_blocks(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = find_unquoted(rest, '{') {
        let (head, tail) = rest.split_at(open);
        out.push_str(head);

        let after_open = &tail[1..];
        let Some(close) = find_unquoted(after_open, '}') else {
            // Unbalanced braces: leave the remainder untouched.
            out.push_str(tail);
            return out;
        };

        let inner = &after_open[..close];
        let mut matchers: Vec<&str> = split_quoted_commas(inner)
            .into_iter()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .collect();
        matchers.sort_unstable();

        out.push('{');
        out.push_str(&matchers.join(","));
        out.push('}');

        rest = &after_open[close + 1..];
    }

    out.push_str(rest);
    out
}

/// Byte offset of the first `needle` outside double quotes.
fn find_unquoted(input: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            _ if c == needle && !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

/// Split on commas that sit outside double quotes.
fn split_quoted_commas(input: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                pieces.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&input[start..]);
    pieces
}

//! Response decoder
//!
//! Recovers per-item `id → stance` pairs from the model's raw text. The
//! expected shape is one `id|LABEL` line per item, but the response is not
//! trusted to be well-formed: an ordered cascade of independent strategies is
//! applied, accepting the first that maps at least one item. Decoding is
//! total — every expected id gets an entry, and nothing here panics on
//! hostile input.

use std::collections::HashSet;
use std::str::FromStr;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{DecodeStatus, Stance};

/// Raw per-item result: the decoded stance (when a strategy recovered one)
/// and the strategy that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelResult {
    pub raw: Option<Stance>,
    pub strategy: DecodeStatus,
}

type StrategyFn = fn(&str, &HashSet<u64>) -> IndexMap<u64, Stance>;

/// Applies the cascade. Every id in `expected` receives an entry; ids the
/// accepted strategy could not map become placeholders.
pub fn decode(raw: &str, expected: &[u64]) -> IndexMap<u64, LabelResult> {
    let expected_set: HashSet<u64> = expected.iter().copied().collect();

    let strategies: [(DecodeStatus, StrategyFn); 4] = [
        (DecodeStatus::Strict, strict),
        (DecodeStatus::Repaired, repair),
        (DecodeStatus::PatternRebuilt, pattern_rebuild),
        (DecodeStatus::SegmentRebuilt, segment_rebuild),
    ];

    let (mapped, status) = strategies
        .iter()
        .find_map(|(status, strategy)| {
            let mapped = strategy(raw, &expected_set);
            (!mapped.is_empty()).then_some((mapped, *status))
        })
        .unwrap_or((IndexMap::new(), DecodeStatus::Placeholder));

    expected
        .iter()
        .map(|&id| {
            let result = match mapped.get(&id) {
                Some(&stance) => LabelResult {
                    raw: Some(stance),
                    strategy: status,
                },
                None => LabelResult {
                    raw: None,
                    strategy: DecodeStatus::Placeholder,
                },
            };
            (id, result)
        })
        .collect()
}

static STRICT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*[|,]\s*(ANTI|PRO|UNRELATED)\s*$").unwrap());

/// Strategy 1: the response is exactly the expected block. Every non-empty
/// line must be a record, every id must be expected, every label valid —
/// anything else fails the whole strategy and defers to the repairs below.
fn strict(raw: &str, expected: &HashSet<u64>) -> IndexMap<u64, Stance> {
    let mut out = IndexMap::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(caps) = STRICT_LINE.captures(line) else {
            return IndexMap::new();
        };
        let Ok(id) = caps[1].parse::<u64>() else {
            return IndexMap::new();
        };
        if !expected.contains(&id) {
            return IndexMap::new();
        }
        let Ok(stance) = Stance::from_str(&caps[2]) else {
            return IndexMap::new();
        };
        out.entry(id).or_insert(stance);
    }
    out
}

static RECORD_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+").unwrap());
static LENIENT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+)\s*[|,:\s]?\s*(ANTI|PRO|UNRELATED)\s*$").unwrap());

/// Strategy 2: normalize common corruptions — code fences, stray quotes, a
/// record split across lines by an unescaped newline, a missing separator
/// between id and label — then line-parse leniently, skipping what still
/// fails.
fn repair(raw: &str, expected: &HashSet<u64>) -> IndexMap<u64, Stance> {
    let cleaned = raw.replace(['"', '\u{201c}', '\u{201d}'], "");

    let mut records: Vec<String> = Vec::new();
    for line in cleaned.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("```") {
            continue;
        }
        if RECORD_START.is_match(line) || records.is_empty() {
            records.push(line.to_string());
        } else if let Some(last) = records.last_mut() {
            last.push(' ');
            last.push_str(line);
        }
    }

    let mut out = IndexMap::new();
    for record in &records {
        let Some(caps) = LENIENT_LINE.captures(record) else {
            continue;
        };
        let Ok(id) = caps[1].parse::<u64>() else {
            continue;
        };
        if !expected.contains(&id) {
            continue;
        }
        if let Ok(stance) = Stance::from_str(&caps[2].to_uppercase()) {
            out.entry(id).or_insert(stance);
        }
    }
    out
}

static PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d+)\b\D{0,12}?\b(ANTI|PRO|UNRELATED)\b").unwrap());

/// Strategy 3: ignore structure entirely and pull `(id, label)` pairs out of
/// the text wherever an expected id sits near a label token.
fn pattern_rebuild(raw: &str, expected: &HashSet<u64>) -> IndexMap<u64, Stance> {
    let mut out = IndexMap::new();
    for caps in PAIR.captures_iter(raw) {
        let Ok(id) = caps[1].parse::<u64>() else {
            continue;
        };
        if !expected.contains(&id) {
            continue;
        }
        if let Ok(stance) = Stance::from_str(&caps[2].to_uppercase()) {
            out.entry(id).or_insert(stance);
        }
    }
    out
}

static LABEL_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(ANTI|PRO|UNRELATED)\b").unwrap());

/// Strategy 4: split the text on expected-id markers and look for a label
/// token anywhere inside each id's segment. Catches prose answers where the
/// label sits a sentence away from its id.
fn segment_rebuild(raw: &str, expected: &HashSet<u64>) -> IndexMap<u64, Stance> {
    let bytes = raw.as_bytes();
    let mut markers: Vec<(usize, u64)> = Vec::new();

    for &id in expected {
        let needle = id.to_string();
        for (pos, _) in raw.match_indices(&needle) {
            let before_ok = pos == 0 || !bytes[pos - 1].is_ascii_digit();
            let end = pos + needle.len();
            let after_ok = end >= bytes.len() || !bytes[end].is_ascii_digit();
            if before_ok && after_ok {
                markers.push((pos, id));
                break;
            }
        }
    }
    markers.sort_unstable();

    let mut out = IndexMap::new();
    for (i, &(pos, id)) in markers.iter().enumerate() {
        let end = markers.get(i + 1).map_or(raw.len(), |&(next, _)| next);
        let segment = &raw[pos..end];
        if let Some(caps) = LABEL_TOKEN.captures(segment) {
            if let Ok(stance) = Stance::from_str(&caps[1].to_uppercase()) {
                out.entry(id).or_insert(stance);
            }
        }
    }
    out
}

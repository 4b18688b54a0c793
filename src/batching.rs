//! Batch scheduler
//!
//! Packs a group's items into token-bounded batches and recovers from
//! provider-side size rejections. The token estimate is a cheap heuristic and
//! advisory only: the provider's verdict is ground truth, and rejection is
//! answered by splitting, never by trusting the estimate.

use crate::model::CommentRecord;

/// Tokens charged per item on top of its text, covering the id and separator.
const PER_ITEM_OVERHEAD_TOKENS: usize = 4;

/// ≈4 chars per token holds roughly for both English and diacritic-heavy text.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Ephemeral ordered subset of one group's items. Replaced, never mutated,
/// when split.
#[derive(Debug, Clone)]
pub struct Batch {
    pub items: Vec<CommentRecord>,
    pub estimated_tokens: usize,
    /// Set once an item's text has been cut head+tail; a truncated singleton
    /// rejected again is out of options.
    pub truncated: bool,
}

pub enum SplitOutcome {
    Halves(Batch, Batch),
    Truncated(Batch),
    /// Already a truncated singleton; the caller degrades its item instead of
    /// dropping it silently.
    Exhausted(Batch),
}

fn batch_estimate(items: &[CommentRecord], prompt_overhead: usize) -> usize {
    prompt_overhead
        + items
            .iter()
            .map(|i| estimate_tokens(&i.text) + PER_ITEM_OVERHEAD_TOKENS)
            .sum::<usize>()
}

/// Keeps the head and tail of an overlong text, cutting the middle.
pub fn truncate_head_tail(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let head = max_chars * 2 / 3;
    let tail = max_chars.saturating_sub(head + 3);
    format!(
        "{} … {}",
        chars[..head].iter().collect::<String>(),
        chars[chars.len() - tail..].iter().collect::<String>()
    )
}

/// Greedily fills batches up to `budget` estimated tokens. An item too large
/// to fit a batch on its own is truncated at build time, so every produced
/// batch satisfies the budget invariant.
pub fn build_batches(
    items: &[CommentRecord],
    budget: usize,
    prompt_overhead: usize,
) -> Vec<Batch> {
    debug_assert!(budget > prompt_overhead + PER_ITEM_OVERHEAD_TOKENS);

    let mut batches = Vec::new();
    let mut current: Vec<CommentRecord> = Vec::new();
    let mut current_cost = prompt_overhead;
    let mut current_truncated = false;

    for item in items {
        let mut item = item.clone();
        let mut truncated = false;

        let lone_cost =
            prompt_overhead + estimate_tokens(&item.text) + PER_ITEM_OVERHEAD_TOKENS;
        if lone_cost > budget {
            let max_text_tokens = budget - prompt_overhead - PER_ITEM_OVERHEAD_TOKENS;
            item.text = truncate_head_tail(&item.text, max_text_tokens * 4);
            truncated = true;
        }

        let item_cost = estimate_tokens(&item.text) + PER_ITEM_OVERHEAD_TOKENS;
        if !current.is_empty() && current_cost + item_cost > budget {
            batches.push(Batch {
                items: std::mem::take(&mut current),
                estimated_tokens: current_cost,
                truncated: current_truncated,
            });
            current_cost = prompt_overhead;
            current_truncated = false;
        }
        current.push(item);
        current_cost += item_cost;
        current_truncated |= truncated;
    }

    if !current.is_empty() {
        batches.push(Batch {
            items: current,
            estimated_tokens: current_cost,
            truncated: current_truncated,
        });
    }

    batches
}

/// Recovery for a provider-side size rejection. Halves multi-item batches;
/// a singleton gets one head+tail truncation pass before the scheduler gives
/// up on it.
pub fn split_on_reject(batch: Batch, prompt_overhead: usize) -> SplitOutcome {
    if batch.items.len() >= 2 {
        let mid = batch.items.len() / 2;
        let (left, right) = batch.items.split_at(mid);
        let make = |items: &[CommentRecord]| Batch {
            estimated_tokens: batch_estimate(items, prompt_overhead),
            items: items.to_vec(),
            truncated: batch.truncated,
        };
        return SplitOutcome::Halves(make(left), make(right));
    }

    if batch.truncated {
        return SplitOutcome::Exhausted(batch);
    }

    let mut item = batch.items.into_iter().next().expect("non-empty batch");
    let keep = (item.text.chars().count() / 2).max(8);
    item.text = truncate_head_tail(&item.text, keep);
    let items = vec![item];
    SplitOutcome::Truncated(Batch {
        estimated_tokens: batch_estimate(&items, prompt_overhead),
        items,
        truncated: true,
    })
}

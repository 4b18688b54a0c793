use indoc::formatdoc;

use crate::{
    batching::{estimate_tokens, truncate_head_tail},
    model::{CommentRecord, Stance},
};

/// Shared context is advisory; keep it from crowding out the comments.
const CONTEXT_LIMIT_CHARS: usize = 800;

/// Tokens charged for the instruction frame around the comment lines.
const FRAME_OVERHEAD_TOKENS: usize = 48;

pub fn system_prompt() -> String {
    let labels = Stance::ALL.map(|s| s.to_string()).join(", ");
    formatdoc! {r#"
        You are an expert in social-media content moderation and political stance analysis.
        You classify short comments by their stance toward the governing party and state, using one of the labels inside the square brackets below.
        [{labels}]
        ANTI: the comment attacks or undermines the government, the ruling party, or its ideology.
        PRO: the comment defends the government or attacks and mocks its opponents.
        UNRELATED: the comment has no political content.
        When a comment carries both pro- and anti-government elements, choose the stronger sentiment.
        You will respond with exactly one line per comment in the format id|LABEL. Do not explain and do not add any other text."#,
    labels = labels}
}

/// Builds the user prompt for one batch: optional shared context followed by
/// one `id|text` line per comment.
pub fn batch_prompt(context: Option<&str>, items: &[CommentRecord]) -> String {
    let context_block = match context {
        Some(ctx) => format!(
            "CONTEXT (the post these comments reply to):\n{}\n\n",
            truncate_head_tail(ctx, CONTEXT_LIMIT_CHARS)
        ),
        None => String::new(),
    };

    let lines = items
        .iter()
        .map(|item| {
            let flat = item
                .text
                .replace(['|', '\n', '\r'], " ");
            format!("{}|{}", item.id, flat.trim())
        })
        .collect::<Vec<_>>()
        .join("\n");

    formatdoc! {r#"
        {context_block}COMMENTS TO CLASSIFY:
        {lines}

        Return ONLY one line per comment, formatted id|LABEL."#}
}

/// Estimated token cost of everything in a batch request except the comment
/// lines themselves.
pub fn prompt_overhead(context: Option<&str>) -> usize {
    let context_tokens = context
        .map(|c| estimate_tokens(&truncate_head_tail(c, CONTEXT_LIMIT_CHARS)))
        .unwrap_or(0);
    estimate_tokens(&system_prompt()) + context_tokens + FRAME_OVERHEAD_TOKENS
}

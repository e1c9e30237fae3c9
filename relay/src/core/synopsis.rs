//! Token budget enforcement for synopses and builder summaries.
//!
//! Summarization itself is delegated to collaborators; holding the budget
//! is not. Anything over the ceiling is truncated to a token slice before
//! it is persisted or handed to the next sprint, so context can never grow
//! back into an unbounded history.

use anyhow::{Context, Result};
use tiktoken_rs::cl100k_base;

/// A synopsis after budget enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClampedSynopsis {
    pub text: String,
    pub tokens: usize,
    pub truncated: bool,
}

/// Token count of `text` under the `cl100k_base` encoding.
pub fn count_tokens(text: &str) -> Result<usize> {
    let bpe = cl100k_base().context("load cl100k_base tokenizer")?;
    Ok(bpe.encode_with_special_tokens(text).len())
}

/// Enforce `max_tokens` on `text`, truncating on a token boundary when the
/// input is over budget.
pub fn clamp_to_budget(text: &str, max_tokens: usize) -> Result<ClampedSynopsis> {
    let bpe = cl100k_base().context("load cl100k_base tokenizer")?;
    let tokens = bpe.encode_with_special_tokens(text);
    if tokens.len() <= max_tokens {
        return Ok(ClampedSynopsis {
            text: text.to_string(),
            tokens: tokens.len(),
            truncated: false,
        });
    }
    let mut cut = max_tokens;
    loop {
        match bpe.decode(tokens[..cut].to_vec()) {
            Ok(text) => {
                return Ok(ClampedSynopsis {
                    text,
                    tokens: cut,
                    truncated: true,
                });
            }
            Err(err) => {
                // A cut can land inside a multi-byte character; back off
                // until the slice decodes cleanly.
                if cut == 0 {
                    return Err(err).context("decode truncated synopsis");
                }
                cut -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_is_stable_and_nonzero() {
        let first = count_tokens("Fresh start.").expect("count");
        let second = count_tokens("Fresh start.").expect("count");
        assert_eq!(first, second);
        assert!(first > 0);
    }

    #[test]
    fn under_budget_text_is_untouched() {
        let clamped = clamp_to_budget("short summary", 50).expect("clamp");
        assert_eq!(clamped.text, "short summary");
        assert!(!clamped.truncated);
    }

    #[test]
    fn over_budget_text_is_cut_to_the_ceiling() {
        let long = "word ".repeat(200);
        let clamped = clamp_to_budget(&long, 10).expect("clamp");
        assert!(clamped.truncated);
        assert_eq!(clamped.tokens, 10);
        assert!(clamped.text.len() < long.len());
        let recount = count_tokens(&clamped.text).expect("count");
        assert!(recount <= 10);
    }

    #[test]
    fn clamping_is_idempotent() {
        let long = "alpha beta gamma delta ".repeat(40);
        let once = clamp_to_budget(&long, 12).expect("clamp");
        let twice = clamp_to_budget(&once.text, 12).expect("clamp");
        assert!(!twice.truncated);
        assert_eq!(once.text, twice.text);
    }
}

//! Token counting.
//!
//! Counts tokens with the shared o200k_base BPE. This is a heuristic used
//! only for billing fallback when an upstream does not report usage; it does
//! not account for tool schemas or multipart attachments.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

static O200K_BASE: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::o200k_base().expect("o200k_base tokenizer is embedded"));

/// Count tokens in `text`. The `model` parameter is accepted for future
/// per-model encoders; every model currently maps to o200k_base.
pub fn count_tokens(text: &str, _model: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    O200K_BASE.encode_with_special_tokens(text).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text() {
        assert_eq!(count_tokens("", "gpt-4o-mini"), 0);
    }

    #[test]
    fn test_simple_text() {
        let n = count_tokens("Hello, world!", "gpt-4o-mini");
        assert!(n > 0 && n < 10);
    }

    #[test]
    fn test_longer_text_counts_more() {
        let short = count_tokens("hi", "gpt-4o-mini");
        let long = count_tokens(&"hi ".repeat(100), "gpt-4o-mini");
        assert!(long > short);
    }
}

use std::sync::{Arc, OnceLock};

/// Something that can count BPE tokens.
pub trait Tokenizer: Send + Sync {
    /// Returns `None` when this particular text could not be encoded.
    fn count_tokens(&self, text: &str) -> Option<usize>;
}

pub type TokenizerLoader =
    Box<dyn Fn() -> Result<Box<dyn Tokenizer>, String> + Send + Sync + 'static>;

enum TokenizerState {
    Ready(Box<dyn Tokenizer>),
    Heuristic,
}

/// Approximate token counter with a lazily loaded tokenizer.
///
/// The loader runs at most once. If it fails, the estimator stays on the
/// word/character heuristic for the rest of the process; a failure to encode a
/// single text only falls back for that call.
pub struct TokenEstimator {
    loader: TokenizerLoader,
    state: OnceLock<TokenizerState>,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self::with_loader(load_default_tokenizer)
    }

    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Tokenizer>, String> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            state: OnceLock::new(),
        }
    }

    pub fn heuristic_only() -> Self {
        Self::with_loader(|| Err("tokenizer disabled".to_string()))
    }

    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        match self.state() {
            TokenizerState::Ready(tokenizer) => match tokenizer.count_tokens(text) {
                Some(count) => count.max(1),
                None => {
                    tracing::trace!(
                        text_len = text.len(),
                        "tokenizer failed on fragment; using heuristic for this call"
                    );
                    heuristic_count(text)
                }
            },
            TokenizerState::Heuristic => heuristic_count(text),
        }
    }

    /// Whether a real tokenizer is in use. Forces initialization.
    pub fn uses_tokenizer(&self) -> bool {
        matches!(self.state(), TokenizerState::Ready(_))
    }

    fn state(&self) -> &TokenizerState {
        self.state.get_or_init(|| match (self.loader)() {
            Ok(tokenizer) => {
                tracing::debug!("tokenizer initialized");
                TokenizerState::Ready(tokenizer)
            }
            Err(reason) => {
                tracing::info!(
                    reason = %reason,
                    "tokenizer unavailable; estimating tokens from words and characters"
                );
                TokenizerState::Heuristic
            }
        })
    }
}

/// Word count when the text has words, otherwise one token per four characters (min 1).
pub fn heuristic_count(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let words = text.split_whitespace().count();
    if words > 0 {
        words
    } else {
        (text.chars().count() / 4).max(1)
    }
}

static SHARED_ESTIMATOR: OnceLock<Arc<TokenEstimator>> = OnceLock::new();

pub fn shared_estimator() -> Arc<TokenEstimator> {
    SHARED_ESTIMATOR
        .get_or_init(|| Arc::new(TokenEstimator::new()))
        .clone()
}

#[cfg(feature = "tiktoken")]
struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> Option<usize> {
        Some(self.bpe.encode_ordinary(text).len())
    }
}

#[cfg(feature = "tiktoken")]
fn load_default_tokenizer() -> Result<Box<dyn Tokenizer>, String> {
    let bpe = tiktoken_rs::cl100k_base().map_err(|error| error.to_string())?;
    Ok(Box::new(TiktokenTokenizer { bpe }))
}

#[cfg(not(feature = "tiktoken"))]
fn load_default_tokenizer() -> Result<Box<dyn Tokenizer>, String> {
    Err("built without the `tiktoken` feature".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakyTokenizer;

    impl Tokenizer for FlakyTokenizer {
        fn count_tokens(&self, text: &str) -> Option<usize> {
            if text.contains("boom") {
                None
            } else {
                Some(text.len())
            }
        }
    }

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(TokenEstimator::heuristic_only().estimate(""), 0);
        assert_eq!(heuristic_count(""), 0);
    }

    #[test]
    fn heuristic_counts_words_then_characters() {
        assert_eq!(heuristic_count("Hel"), 1);
        assert_eq!(heuristic_count("lo, "), 1);
        assert_eq!(heuristic_count("hello big world"), 3);
        assert_eq!(heuristic_count("   "), 1);
        assert_eq!(heuristic_count("\n\n\n\n\n\n\n\n"), 2);
    }

    #[test]
    fn non_empty_text_is_at_least_one_token() {
        let estimator = TokenEstimator::heuristic_only();
        for text in [" ", "a", "\t\t", "👋", "a b c"] {
            assert!(estimator.estimate(text) >= 1, "{text:?}");
        }
    }

    #[test]
    fn failed_initialization_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let estimator = TokenEstimator::with_loader(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("no encoding".to_string())
        });

        assert_eq!(estimator.estimate("one two"), 2);
        assert_eq!(estimator.estimate("three"), 1);
        assert!(!estimator.uses_tokenizer());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn initialization_waits_for_first_real_call() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let estimator = TokenEstimator::with_loader(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyTokenizer) as Box<dyn Tokenizer>)
        });

        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(estimator.estimate("abcd"), 4);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn encode_failure_falls_back_for_that_call_only() {
        let estimator =
            TokenEstimator::with_loader(|| Ok(Box::new(FlakyTokenizer) as Box<dyn Tokenizer>));

        assert_eq!(estimator.estimate("boom boom"), 2);
        assert!(estimator.uses_tokenizer());
        assert_eq!(estimator.estimate("abcdef"), 6);
    }

    #[cfg(feature = "tiktoken")]
    #[test]
    fn tiktoken_backend_counts_tokens() {
        let estimator = TokenEstimator::new();
        if estimator.uses_tokenizer() {
            assert!(estimator.estimate("Hello, world!") >= 1);
        }
    }
}

//! Token counting and the token-budget configuration.
//!
//! Counting is a seam: the gateway only needs totals good enough to steer
//! padding, so the default is a heuristic counter. A model-accurate
//! tokenizer can be dropped in behind the same trait.

use std::sync::Arc;

use crate::error::{GatewayError, Result};

/// Trait for token counting implementations.
pub trait TokenCounter: Send + Sync {
    /// Count tokens in a plain text string.
    fn count_text(&self, text: &str) -> u32;
}

/// Arc-wrapped token counter for easy sharing.
pub type SharedTokenCounter = Arc<dyn TokenCounter>;

/// Heuristic token counter using character-based estimation.
///
/// tokens ≈ characters / 4, with a safety margin so padding never
/// overshoots the upstream context window.
#[derive(Debug, Clone)]
pub struct HeuristicTokenCounter {
    chars_per_token: f64,
    safety_margin: f64,
}

impl HeuristicTokenCounter {
    pub fn new(chars_per_token: f64, safety_margin: f64) -> Self {
        Self {
            chars_per_token,
            safety_margin,
        }
    }
}

impl Default for HeuristicTokenCounter {
    fn default() -> Self {
        Self::new(4.0, 1.1)
    }
}

impl TokenCounter for HeuristicTokenCounter {
    fn count_text(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count() as f64;
        ((chars / self.chars_per_token) * self.safety_margin).ceil() as u32
    }
}

/// Padding limits parsed from the single `padtxt` configuration string.
///
/// The string reads right-to-left: `"min,extra,max"`. A bare `"15000"` is
/// just a maximum; `"1000,15000"` adds the extra-limit margin; the full
/// three-field form adds the minimum floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub max_tokens: u32,
    pub extra_limit: u32,
    pub min_limit: u32,
}

impl TokenBudget {
    pub fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split(',').map(|f| f.trim()).collect();
        let mut rev = fields.iter().rev();
        let max_tokens = rev
            .next()
            .and_then(|f| f.parse::<u32>().ok())
            .ok_or_else(|| GatewayError::config(format!("invalid padtxt limits: {raw:?}")))?;
        let extra_limit = rev.next().and_then(|f| f.parse::<u32>().ok()).unwrap_or(1000);
        let min_limit = rev.next().and_then(|f| f.parse::<u32>().ok()).unwrap_or(0);
        Ok(Self {
            max_tokens,
            extra_limit,
            min_limit,
        })
    }

    /// How many tokens of filler a prompt of `tokens` tokens still needs.
    ///
    /// Below the extra-limit margin the prompt fills to the maximum. Inside
    /// the margin the target drops to the minimum floor (or the margin
    /// itself when no floor is configured). Filler never pushes past the
    /// maximum, so padding an already-full prompt is a no-op.
    pub fn fill_amount(&self, tokens: u32) -> u32 {
        if tokens >= self.max_tokens {
            return 0;
        }
        let headroom = self.max_tokens - tokens;
        if tokens <= self.max_tokens.saturating_sub(self.extra_limit) {
            headroom
        } else {
            let floor = if self.min_limit > 0 {
                self.min_limit
            } else {
                self.extra_limit
            };
            floor.min(headroom)
        }
    }

    /// Whether a prompt of `tokens` tokens is already past the slack margin,
    /// selecting the alternate placeholder.
    pub fn past_margin(&self, tokens: u32) -> bool {
        tokens > self.max_tokens.saturating_sub(self.extra_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_counter_counts_text() {
        let counter = HeuristicTokenCounter::default();
        // 13 chars -> 13/4 * 1.1 ≈ 3.6 -> 4 tokens
        assert_eq!(counter.count_text("Hello, world!"), 4);
        assert_eq!(counter.count_text(""), 0);
    }

    #[test]
    fn budget_parses_right_to_left() {
        let b = TokenBudget::parse("1000,1000,15000").unwrap();
        assert_eq!(b.max_tokens, 15000);
        assert_eq!(b.extra_limit, 1000);
        assert_eq!(b.min_limit, 1000);

        let b = TokenBudget::parse("15000").unwrap();
        assert_eq!(b.max_tokens, 15000);
        assert_eq!(b.extra_limit, 1000);
        assert_eq!(b.min_limit, 0);
    }

    #[test]
    fn budget_rejects_garbage() {
        assert!(TokenBudget::parse("lots").is_err());
    }

    #[test]
    fn fill_amount_uses_margin_then_floor() {
        let b = TokenBudget::parse("500,1000,10000").unwrap();
        // Plenty of headroom: fill to max.
        assert_eq!(b.fill_amount(2000), 8000);
        // Inside the margin: only the floor.
        assert!(b.past_margin(9500));
        assert_eq!(b.fill_amount(9500), 500);

        // No floor configured: the margin, capped at the headroom.
        let b = TokenBudget::parse("1000,10000").unwrap();
        assert_eq!(b.fill_amount(9500), 500);
        assert_eq!(b.fill_amount(8500), 1000);
    }

    #[test]
    fn full_prompts_need_no_filler() {
        let b = TokenBudget::parse("500,1000,10000").unwrap();
        assert_eq!(b.fill_amount(10000), 0);
        assert_eq!(b.fill_amount(12000), 0);
    }
}

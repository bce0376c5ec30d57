//! Per-model pricing → monetary cost from token usage (§3.4, §4.1 step 5).
//!
//! Provider adapters call [`accumulate`] every time a stream delivers a usage
//! delta (prompt tokens confirmed at `start`, completion tokens confirmed at
//! `done`, cache read/write counts when the provider reports them). The
//! accumulator only ever adds tokens, so `usage.cost.total` is monotonically
//! non-decreasing across the life of one assistant message (§8 cost
//! monotonicity property) as long as callers only pass deltas, never
//! already-accumulated totals.

use crate::model::CostRates;
use crate::types::{Usage, UsageCost};

/// A token-count delta to fold into a running [`Usage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

/// Dollar cost of `tokens` million-tokens at `rate_per_mtok`.
fn cost_of(tokens: u64, rate_per_mtok: f64) -> f64 {
    (tokens as f64 / 1_000_000.0) * rate_per_mtok
}

/// Folds `delta` into `usage`, recomputing `usage.cost` from the new totals.
///
/// Because token counts only ever grow, `usage.cost.total` after this call is
/// always `>=` its value before the call.
pub fn accumulate(usage: &mut Usage, delta: UsageDelta, rates: &CostRates) {
    usage.input += delta.input;
    usage.output += delta.output;
    usage.cache_read += delta.cache_read;
    usage.cache_write += delta.cache_write;
    usage.cost = cost_for_totals(usage, rates);
}

/// Computes the cost breakdown for the current totals in `usage`, without
/// mutating it. Used when a provider reports absolute usage rather than a
/// delta (e.g. a single non-streaming usage block at `done`).
pub fn cost_for_totals(usage: &Usage, rates: &CostRates) -> UsageCost {
    let input = cost_of(usage.input, rates.input);
    let output = cost_of(usage.output, rates.output);
    let cache_read = cost_of(usage.cache_read, rates.cache_read);
    let cache_write = cost_of(usage.cache_write, rates.cache_write);
    UsageCost {
        input,
        output,
        cache_read,
        cache_write,
        total: input + output + cache_read + cache_write,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates() -> CostRates {
        CostRates {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        }
    }

    #[test]
    fn test_accumulate_computes_cost() {
        let mut usage = Usage::default();
        accumulate(
            &mut usage,
            UsageDelta {
                input: 1_000_000,
                output: 0,
                cache_read: 0,
                cache_write: 0,
            },
            &rates(),
        );
        assert_eq!(usage.cost.input, 3.0);
        assert_eq!(usage.cost.total, 3.0);
    }

    #[test]
    fn test_accumulate_is_monotonic() {
        let mut usage = Usage::default();
        let rates = rates();
        let mut last_total = 0.0;
        for _ in 0..5 {
            accumulate(
                &mut usage,
                UsageDelta {
                    input: 10_000,
                    output: 5_000,
                    cache_read: 0,
                    cache_write: 0,
                },
                &rates,
            );
            assert!(usage.cost.total >= last_total);
            last_total = usage.cost.total;
        }
    }

    #[test]
    fn test_zero_rates_yield_zero_cost() {
        let mut usage = Usage::default();
        accumulate(
            &mut usage,
            UsageDelta {
                input: 1_000_000,
                output: 1_000_000,
                cache_read: 1_000_000,
                cache_write: 1_000_000,
            },
            &CostRates::default(),
        );
        assert_eq!(usage.cost.total, 0.0);
    }
}

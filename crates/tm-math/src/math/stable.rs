//! Numerically stable primitives for log-domain probability arithmetic.
//!
//! The decoding engines keep Viterbi messages in the natural-log domain and
//! the online filter keeps sequence scores in base-10 logs; the conversions
//! here are the only sanctioned way to cross between domains. Zero linear
//! probability and negative-infinite log probability are the same value on
//! either side of every conversion, and the accumulators below honor that:
//! an impossible branch contributes nothing, and a message whose every score
//! is impossible totals to no mass at all.

/// Log-domain total of a set of scores.
///
/// Returns the natural log of the summed linear masses without ever
/// materializing them, so a message of underflow-scale scores keeps its
/// mass and an all-impossible message (every score -inf, or no scores at
/// all) totals -inf instead of rounding through zero. A NaN score poisons
/// the total.
pub fn log_sum_exp(scores: &[f64]) -> f64 {
    let mut anchor = f64::NEG_INFINITY;
    for score in scores {
        if score.is_nan() {
            return f64::NAN;
        }
        anchor = anchor.max(*score);
    }
    if anchor.is_infinite() {
        // No finite anchor to shift by: either no mass at all (empty or all
        // -inf) or a certainty-scale +inf that dominates outright.
        return anchor;
    }
    let mass: f64 = scores.iter().map(|score| (score - anchor).exp()).sum();
    anchor + mass.ln()
}

/// Log-domain sum of two scores: ln(e^a + e^b) without leaving the log
/// domain.
///
/// The smaller score is folded into the larger through `ln_1p`, so combining
/// a candidate's score with an underflow-scale alternative returns the
/// candidate's score unchanged. NaN in either operand poisons the result.
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    let (larger, smaller) = if a >= b { (a, b) } else { (b, a) };
    if smaller == f64::NEG_INFINITY {
        // An impossible branch is the additive identity.
        return larger;
    }
    if larger == f64::INFINITY {
        return f64::INFINITY;
    }
    larger + (smaller - larger).exp().ln_1p()
}

/// Linear-domain value of a natural-log probability; -inf maps to 0.
pub fn log_to_linear(log_probability: f64) -> f64 {
    if log_probability == f64::NEG_INFINITY {
        0.0
    } else {
        log_probability.exp()
    }
}

/// Natural-log value of a linear probability; 0 maps to -inf.
pub fn linear_to_log(probability: f64) -> f64 {
    if probability == 0.0 {
        f64::NEG_INFINITY
    } else {
        probability.ln()
    }
}

/// Base-10 log of a linear probability; 0 maps to -inf.
///
/// The online filter accumulates sequence scores in base 10.
pub fn linear_to_log10(probability: f64) -> f64 {
    if probability == 0.0 {
        f64::NEG_INFINITY
    } else {
        probability.log10()
    }
}

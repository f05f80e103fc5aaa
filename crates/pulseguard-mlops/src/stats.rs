//! Two-sample Kolmogorov–Smirnov test.
//!
//! Computed in-crate: the statistic is the maximum distance between the two
//! empirical CDFs (two `O(N log N)` sorts plus one merge walk), and the
//! p-value is the classic asymptotic Kolmogorov series with the
//! small-sample correction from Numerical Recipes
//! (`λ = (√n_e + 0.12 + 0.11/√n_e)·D`).  Accurate enough for drift gating;
//! this is not a general statistics library.

/// Outcome of [`ks_two_sample`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KsResult {
    /// Maximum distance between the two empirical CDFs, in `[0, 1]`.
    pub statistic: f64,
    /// Two-sided asymptotic p-value, in `[0, 1]`.
    pub p_value: f64,
}

/// Run the test on two samples.  Returns `None` when either sample is empty.
///
/// Identical samples yield `statistic = 0`, `p_value = 1`.  Constant-valued
/// samples are ordinary inputs and never error.
pub fn ks_two_sample(a: &[f64], b: &[f64]) -> Option<KsResult> {
    if a.is_empty() || b.is_empty() {
        return None;
    }

    let mut a_sorted = a.to_vec();
    let mut b_sorted = b.to_vec();
    a_sorted.sort_by(|x, y| x.total_cmp(y));
    b_sorted.sort_by(|x, y| x.total_cmp(y));

    let n_a = a_sorted.len() as f64;
    let n_b = b_sorted.len() as f64;

    // Merge walk over both sorted samples, tracking the CDF gap.
    let (mut i, mut j) = (0usize, 0usize);
    let mut statistic: f64 = 0.0;
    while i < a_sorted.len() && j < b_sorted.len() {
        let xa = a_sorted[i];
        let xb = b_sorted[j];
        let x = xa.min(xb);
        while i < a_sorted.len() && a_sorted[i] <= x {
            i += 1;
        }
        while j < b_sorted.len() && b_sorted[j] <= x {
            j += 1;
        }
        let gap = (i as f64 / n_a - j as f64 / n_b).abs();
        statistic = statistic.max(gap);
    }

    let effective = (n_a * n_b) / (n_a + n_b);
    let p_value = kolmogorov_survival((effective.sqrt() + 0.12 + 0.11 / effective.sqrt()) * statistic);

    Some(KsResult { statistic, p_value })
}

/// Q_KS(λ) = 2 Σ_{k≥1} (−1)^{k−1} e^{−2k²λ²}, clamped to `[0, 1]`.
///
/// The alternating series does not converge for λ near zero; the
/// distribution value there is 1 (no evidence against the null).
fn kolmogorov_survival(lambda: f64) -> f64 {
    if lambda < 1e-3 {
        return 1.0;
    }
    let mut sum = 0.0;
    let mut sign = 1.0;
    for k in 1..=100 {
        let k = f64::from(k);
        let term = sign * (-2.0 * k * k * lambda * lambda).exp();
        sum += term;
        if term.abs() < 1e-10 {
            break;
        }
        sign = -sign;
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

//! Cumulative risk statistics over daily returns series.
//!
//! All annualization uses 252 trading days. Statistics that need at least
//! two observations return NaN until they have them.

const ANNUALIZATION_FACTOR: f64 = 252.0;

fn valid(returns: &[f64]) -> impl Iterator<Item = f64> + '_ {
    returns.iter().copied().filter(|r| !r.is_nan())
}

/// Compounded return over the period.
pub fn cumulative_return(returns: &[f64]) -> f64 {
    valid(returns).fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

fn mean(returns: &[f64]) -> f64 {
    let (sum, count) = valid(returns).fold((0.0, 0usize), |(s, c), r| (s + r, c + 1));
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

/// Sample standard deviation (ddof = 1).
fn std_dev(returns: &[f64]) -> f64 {
    let values: Vec<f64> = valid(returns).collect();
    if values.len() < 2 {
        return f64::NAN;
    }
    let mu = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|r| (r - mu).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Annualized volatility of a daily returns series.
pub fn annual_volatility(returns: &[f64]) -> f64 {
    std_dev(returns) * ANNUALIZATION_FACTOR.sqrt()
}

/// Annualized Sharpe ratio against a zero risk-free rate.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    let sigma = std_dev(returns);
    if sigma.is_nan() || sigma == 0.0 {
        return f64::NAN;
    }
    mean(returns) / sigma * ANNUALIZATION_FACTOR.sqrt()
}

/// Annualized Sortino ratio: mean return over downside deviation.
pub fn sortino_ratio(returns: &[f64]) -> f64 {
    let values: Vec<f64> = valid(returns).collect();
    if values.len() < 2 {
        return f64::NAN;
    }
    let downside_var =
        values.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / values.len() as f64;
    let downside = downside_var.sqrt();
    if downside == 0.0 {
        return f64::NAN;
    }
    mean(&values) / downside * ANNUALIZATION_FACTOR.sqrt()
}

/// Largest peak-to-trough loss of the compounded series. Zero or negative.
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut cumulative = 1.0;
    let mut peak: f64 = 1.0;
    let mut worst = 0.0f64;
    for r in valid(returns) {
        cumulative *= 1.0 + r;
        peak = peak.max(cumulative);
        worst = worst.min(cumulative / peak - 1.0);
    }
    worst
}

/// Regression of algorithm returns on benchmark returns.
///
/// Beta is the covariance over the benchmark variance; alpha is the
/// annualized mean residual. NaN-padded slots in either series drop the
/// pair.
pub fn alpha_beta(algo: &[f64], benchmark: &[f64]) -> (f64, f64) {
    let pairs: Vec<(f64, f64)> = algo
        .iter()
        .zip(benchmark)
        .filter(|(a, b)| !a.is_nan() && !b.is_nan())
        .map(|(&a, &b)| (a, b))
        .collect();
    if pairs.len() < 2 {
        return (f64::NAN, f64::NAN);
    }

    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|(a, _)| a).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|(_, b)| b).sum::<f64>() / n;
    let cov = pairs
        .iter()
        .map(|(a, b)| (a - mean_a) * (b - mean_b))
        .sum::<f64>()
        / n;
    let var_b = pairs.iter().map(|(_, b)| (b - mean_b).powi(2)).sum::<f64>() / n;
    if var_b == 0.0 {
        return (f64::NAN, f64::NAN);
    }

    let beta = cov / var_b;
    let alpha = (mean_a - beta * mean_b) * ANNUALIZATION_FACTOR;
    (alpha, beta)
}

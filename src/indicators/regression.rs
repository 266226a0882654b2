/// Weighted least-squares fit of `y = intercept + slope * x`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionFit {
    pub slope: f64,
    pub intercept: f64,
    /// Weighted coefficient of determination (centered)
    pub r_squared: f64,
}

/// Fit a single-regressor weighted linear regression
///
/// Weights are normalised internally; pass `None` for ordinary least squares.
/// Returns None when the inputs have mismatched lengths, fewer than two points,
/// non-positive total weight, non-finite values, or zero variance in x or y.
pub fn weighted_linear_regression(x: &[f64], y: &[f64], weights: Option<&[f64]>) -> Option<RegressionFit> {
    let n = x.len();
    if n < 2 || y.len() != n {
        return None;
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return None;
    }

    let uniform = vec![1.0; n];
    let w = match weights {
        Some(w) if w.len() == n => w,
        Some(_) => return None,
        None => &uniform,
    };
    if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return None;
    }

    let w_sum: f64 = w.iter().sum();
    if w_sum <= 0.0 {
        return None;
    }

    let x_mean = x.iter().zip(w).map(|(xi, wi)| xi * wi).sum::<f64>() / w_sum;
    let y_mean = y.iter().zip(w).map(|(yi, wi)| yi * wi).sum::<f64>() / w_sum;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for i in 0..n {
        let dx = x[i] - x_mean;
        let dy = y[i] - y_mean;
        sxx += w[i] * dx * dx;
        sxy += w[i] * dx * dy;
        syy += w[i] * dy * dy;
    }

    if sxx <= f64::EPSILON || syy <= f64::EPSILON {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;

    let ssr: f64 = (0..n)
        .map(|i| {
            let residual = y[i] - (intercept + slope * x[i]);
            w[i] * residual * residual
        })
        .sum();

    Some(RegressionFit {
        slope,
        intercept,
        r_squared: 1.0 - ssr / syy,
    })
}

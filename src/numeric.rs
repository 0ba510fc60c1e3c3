//! Log-domain numeric primitives shared by the message and gradient kernels.
//!
//! All reductions follow the max-shifted log-sum-exp pattern: subtract the
//! maximum before exponentiating, so intermediate exponentials never
//! overflow. A temperature of zero always means a plain maximum with ties
//! resolved toward the lowest index.

/// Stand-in for log(0). Kept finite so that kernels never emit NaN when two
/// impossible configurations meet (-inf - -inf).
pub(crate) const LOG_ZERO: f64 = -1e30;

/// Temperature-smoothed maximum of two log-domain values:
/// `T * log(exp(a / T) + exp(b / T))`, or `max(a, b)` at `T == 0`.
pub(crate) fn smooth_max2(a: f64, b: f64, temperature: f64) -> f64 {
    let m = a.max(b);
    if temperature == 0.0 || m <= LOG_ZERO {
        return m;
    }
    m + temperature
        * (((a - m) / temperature).exp() + ((b - m) / temperature).exp()).ln()
}

/// Temperature-smoothed maximum of a slice.
pub(crate) fn smooth_max_slice(xs: &[f64], temperature: f64) -> f64 {
    let m = xs.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if temperature == 0.0 || m <= LOG_ZERO {
        return m;
    }
    let s: f64 = xs.iter().map(|&x| ((x - m) / temperature).exp()).sum();
    m + temperature * s.ln()
}

/// `T * log(1 + exp(x / T))`, the smoothed positive part. `max(x, 0)` at
/// `T == 0`. Stable for arbitrarily large `|x| / T`.
pub(crate) fn softplus(x: f64, temperature: f64) -> f64 {
    if temperature == 0.0 {
        return x.max(0.0);
    }
    x.max(0.0) + temperature * (-(x.abs() / temperature)).exp().ln_1p()
}

/// `T * log(exp(s / T) - 1)` for `s >= 0`. This is the exact log-mass of
/// "at least one of" given the total softplus mass `s`; it saturates to
/// [`LOG_ZERO`] as `s -> 0` (no admissible configuration left).
pub(crate) fn logexpm1(s: f64, temperature: f64) -> f64 {
    debug_assert!(temperature > 0.0);
    let x = s / temperature;
    if x > 33.0 {
        // exp(-x) below 1e-14: log(e^x - 1) = x + log(1 - e^-x)
        s + temperature * (-(-x).exp()).ln_1p()
    } else if x > 1e-13 {
        temperature * x.exp_m1().ln()
    } else {
        LOG_ZERO
    }
}

/// Index of the maximum, ties resolved toward the lowest index.
pub(crate) fn argmax(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, &x) in xs.iter().enumerate().skip(1) {
        if x > xs[best] {
            best = i;
        }
    }
    best
}

/// Writes the temperature-`T` softmax of `xs` into `out`. At `T == 0` the
/// result is the one-hot indicator of [`argmax`].
pub(crate) fn softmax_into(xs: &[f64], temperature: f64, out: &mut [f64]) {
    debug_assert_eq!(xs.len(), out.len());
    if temperature == 0.0 {
        out.fill(0.0);
        out[argmax(xs)] = 1.0;
        return;
    }
    let m = xs.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let mut z = 0.0;
    for (o, &x) in out.iter_mut().zip(xs) {
        *o = ((x - m) / temperature).exp();
        z += *o;
    }
    for o in out.iter_mut() {
        *o /= z;
    }
}

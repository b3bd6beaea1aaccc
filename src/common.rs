use ndarray::{Array1, Array2, Axis};
use ndarray_stats::interpolate::Linear;
use ndarray_stats::{Quantile1dExt, QuantileExt};
use noisy_float::types::{n32, n64, N32};

/// Softmax over a single logit vector. `epsilon` keeps the denominator positive.
pub fn softmax(input: &Array1<f32>, epsilon: f32) -> Array1<f32> {
    if input.is_empty() {
        return Array1::zeros(0);
    }
    let max_val = *input.max().unwrap_or(&0.0);
    let exp_values = input.mapv(|x| (x - max_val).exp());
    let sum_exp_values = exp_values.sum() + epsilon;
    exp_values / sum_exp_values
}

/// Row-wise softmax of an `L × V` logit matrix.
pub fn softmax_rows(logits: &Array2<f32>, epsilon: f32) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max_val = *row.max().unwrap_or(&0.0);
        row.mapv_inplace(|x| (x - max_val).exp());
        let denom = row.sum() + epsilon;
        row.mapv_inplace(|x| x / denom);
    }
    probs
}

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn swish(x: f32) -> f32 {
    x * sigmoid(x)
}

/// d/dx swish(x), written as `sig(x) + swish(x) * (1 - sig(x))`.
pub fn swish_grad(x: f32) -> f32 {
    let s = sigmoid(x);
    s + x * s * (1.0 - s)
}

/// Sinusoidal encoding for positions `0..len`, alternating sin/cos across the
/// hidden dimension with frequency `1 / 10000^(2i/H)`.
pub fn positional_encoding(len: usize, hidden: usize) -> Array2<f32> {
    Array2::from_shape_fn((len, hidden), |(pos, j)| {
        let pair = (j / 2 * 2) as f32;
        let angle = pos as f32 / 10000f32.powf(pair / hidden as f32);
        if j % 2 == 0 {
            angle.sin()
        } else {
            angle.cos()
        }
    })
}

/// Number of rows averaged into position `i` by a causal window of width `k`.
pub fn window_divisor(i: usize, k: usize) -> f32 {
    (i + 1).min(k) as f32
}

/// Causal mean pooling: row `i` of the result is the mean of rows
/// `max(0, i-k+1)..=i` of `x`. Computed with prefix sums.
pub fn causal_mean_pool(x: &Array2<f32>, k: usize) -> Array2<f32> {
    let (len, width) = x.dim();
    let prefix = prefix_sums(x);
    let mut pooled = Array2::<f32>::zeros((len, width));
    for i in 0..len {
        let start = (i + 1).saturating_sub(k);
        let window = &prefix.row(i + 1) - &prefix.row(start);
        pooled.row_mut(i).assign(&(window / window_divisor(i, k)));
    }
    pooled
}

/// Adjoint of [`causal_mean_pool`]: distributes each row of `grad` back over
/// the window it averaged. Row `t` of the result is
/// `sum_{i=t}^{min(t+k,L)-1} grad[i] / min(i+1, k)`.
pub fn causal_mean_unpool(grad: &Array2<f32>, k: usize) -> Array2<f32> {
    let (len, width) = grad.dim();
    let mut scaled = grad.clone();
    for (i, mut row) in scaled.axis_iter_mut(Axis(0)).enumerate() {
        let div = window_divisor(i, k);
        row.mapv_inplace(|g| g / div);
    }
    let prefix = prefix_sums(&scaled);
    let mut unpooled = Array2::<f32>::zeros((len, width));
    for t in 0..len {
        let end = (t + k).min(len);
        let window = &prefix.row(end) - &prefix.row(t);
        unpooled.row_mut(t).assign(&window);
    }
    unpooled
}

fn prefix_sums(x: &Array2<f32>) -> Array2<f32> {
    let (len, width) = x.dim();
    let mut prefix = Array2::<f32>::zeros((len + 1, width));
    for i in 0..len {
        let next = &prefix.row(i) + &x.row(i);
        prefix.row_mut(i + 1).assign(&next);
    }
    prefix
}

/// Percentile `q` in [0, 100] with linear interpolation between closest ranks.
/// NaNs are ignored. Returns 0.0 when nothing is left.
pub fn percentile(values: &[f32], q: f32) -> f32 {
    let mut data: Array1<N32> = values.iter().filter(|v| !v.is_nan()).map(|&v| n32(v)).collect();
    let q = n64(f64::from(q.clamp(0.0, 100.0)) / 100.0);
    data.quantile_mut(q, &Linear).map(|v| v.raw()).unwrap_or(0.0)
}

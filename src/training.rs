use ndarray::{Array2, Zip};

use crate::config::NetConfig;
use crate::params::{Moments, ParameterStore};

/// Adam with bias-corrected moments. One instance is shared by all tensors of
/// a network; the step counter lives with the network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamOptimizer {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl AdamOptimizer {
    pub fn from_config(config: &NetConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
        }
    }

    /// Updates `param` in place from `grad`. `step` is the 1-based global step.
    pub fn apply(&self, param: &mut Array2<f32>, grad: &Array2<f32>, moments: &mut Moments, step: u64) {
        let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.learning_rate);
        let exponent = step.min(i32::MAX as u64) as i32;
        let bias1 = 1.0 - b1.powi(exponent) + eps;
        let bias2 = 1.0 - b2.powi(exponent) + eps;

        Zip::from(param)
            .and(grad)
            .and(&mut moments.m)
            .and(&mut moments.v)
            .for_each(|p, &g, m, v| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }

    /// Applies one step to all four tensors of `params`.
    pub fn step(&self, params: &mut ParameterStore, grads: &Gradients, step: u64) {
        self.apply(&mut params.w_embed, &grads.w_embed, &mut params.adam_w_embed, step);
        self.apply(&mut params.w_out, &grads.w_out, &mut params.adam_w_out, step);
        self.apply(&mut params.b_hidden, &grads.b_hidden, &mut params.adam_b_hidden, step);
        self.apply(&mut params.b_out, &grads.b_out, &mut params.adam_b_out, step);
    }
}

/// Gradients of the mean cross-entropy loss, one per trainable tensor.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub w_embed: Array2<f32>,
    pub w_out: Array2<f32>,
    pub b_hidden: Array2<f32>,
    pub b_out: Array2<f32>,
}

/// Mean negative log-likelihood of `targets` under row-wise `probs`.
pub fn cross_entropy_loss(probs: &Array2<f32>, targets: &[usize], epsilon: f32) -> f32 {
    if targets.is_empty() {
        return 0.0;
    }
    let total: f32 = targets
        .iter()
        .enumerate()
        .map(|(row, &t)| -(probs[[row, t]] + epsilon).ln())
        .sum();
    total / targets.len() as f32
}

/// Gradient of the mean cross-entropy with respect to the logits:
/// `(probs - onehot(targets)) / L`.
pub fn cross_entropy_grad(probs: &Array2<f32>, targets: &[usize]) -> Array2<f32> {
    let mut grad = probs.clone();
    for (row, &t) in targets.iter().enumerate() {
        grad[[row, t]] -= 1.0;
    }
    let len = targets.len().max(1) as f32;
    grad.mapv_inplace(|g| g / len);
    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let opt = AdamOptimizer::from_config(&NetConfig::default());
        let mut param = array![[1.0f32, -1.0]];
        let grad = array![[0.5f32, -2.0]];
        let mut moments = Moments::zeros((1, 2));

        opt.apply(&mut param, &grad, &mut moments, 1);

        // With bias correction the first step is ~lr * sign(g).
        assert_abs_diff_eq!(param[[0, 0]], 1.0 - 0.001, epsilon = 1e-5);
        assert_abs_diff_eq!(param[[0, 1]], -1.0 + 0.001, epsilon = 1e-5);
        assert_abs_diff_eq!(moments.m[[0, 0]], 0.05, epsilon = 1e-6);
        assert_abs_diff_eq!(moments.v[[0, 1]], 0.004, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_gradient_leaves_param_untouched() {
        let opt = AdamOptimizer::from_config(&NetConfig::default());
        let mut param = array![[0.3f32]];
        let mut moments = Moments::zeros((1, 1));
        opt.apply(&mut param, &array![[0.0f32]], &mut moments, 7);
        assert_eq!(param[[0, 0]], 0.3);
    }

    #[test]
    fn test_cross_entropy_grad_rows_sum_to_zero() {
        let probs = array![[0.2f32, 0.5, 0.3], [0.1, 0.1, 0.8]];
        let grad = cross_entropy_grad(&probs, &[1, 2]);
        assert_abs_diff_eq!(grad[[0, 1]], (0.5 - 1.0) / 2.0, epsilon = 1e-6);
        for row in grad.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_cross_entropy_loss_value() {
        let probs = array![[0.5f32, 0.5], [0.25, 0.75]];
        let loss = cross_entropy_loss(&probs, &[0, 1], 0.0);
        let expected = -(0.5f32.ln() + 0.75f32.ln()) / 2.0;
        assert_abs_diff_eq!(loss, expected, epsilon = 1e-6);
    }
}

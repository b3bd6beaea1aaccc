use ndarray::{s, Array2};
use rand::Rng;
use rand_distr::StandardNormal;

/// First and second Adam moment estimates for one parameter tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    pub m: Array2<f32>,
    pub v: Array2<f32>,
}

impl Moments {
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            m: Array2::zeros(shape),
            v: Array2::zeros(shape),
        }
    }

    fn pad_rows(&mut self, extra: usize) {
        self.m = pad_rows(&self.m, extra);
        self.v = pad_rows(&self.v, extra);
    }

    fn pad_cols(&mut self, extra: usize) {
        self.m = pad_cols(&self.m, extra);
        self.v = pad_cols(&self.v, extra);
    }
}

/// All trainable tensors of a network together with their Adam moments.
///
/// Shapes, with `V` the vocabulary size and `H` the hidden width:
/// `w_embed` V×H, `w_out` H×V, `b_hidden` 1×H, `b_out` 1×V. Each moment pair
/// matches its tensor. The only way to change `V` or `H` is through
/// [`ParameterStore::push_vocab_entry`] and [`ParameterStore::grow_hidden`],
/// which resize every tensor in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterStore {
    pub w_embed: Array2<f32>,
    pub w_out: Array2<f32>,
    pub b_hidden: Array2<f32>,
    pub b_out: Array2<f32>,
    pub adam_w_embed: Moments,
    pub adam_w_out: Moments,
    pub adam_b_hidden: Moments,
    pub adam_b_out: Moments,
}

impl ParameterStore {
    /// Random weights scaled by `sqrt(1/fan_in)`, zero biases and zero moments.
    pub fn new<R: Rng + ?Sized>(vocab_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        let w_embed = random_matrix(vocab_size, hidden_size, fan_in_scale(vocab_size), rng);
        let w_out = random_matrix(hidden_size, vocab_size, fan_in_scale(hidden_size), rng);
        Self::from_weights(
            w_embed,
            w_out,
            Array2::zeros((1, hidden_size)),
            Array2::zeros((1, vocab_size)),
        )
    }

    /// Wraps existing tensors with fresh zero moments.
    pub fn from_weights(
        w_embed: Array2<f32>,
        w_out: Array2<f32>,
        b_hidden: Array2<f32>,
        b_out: Array2<f32>,
    ) -> Self {
        let store = Self {
            adam_w_embed: Moments::zeros(w_embed.dim()),
            adam_w_out: Moments::zeros(w_out.dim()),
            adam_b_hidden: Moments::zeros(b_hidden.dim()),
            adam_b_out: Moments::zeros(b_out.dim()),
            w_embed,
            w_out,
            b_hidden,
            b_out,
        };
        store.assert_consistent();
        store
    }

    pub fn vocab_size(&self) -> usize {
        self.w_embed.nrows()
    }

    pub fn hidden_size(&self) -> usize {
        self.w_embed.ncols()
    }

    /// Describes the first shape mismatch, if any.
    pub fn shape_mismatch(&self) -> Option<String> {
        let v = self.vocab_size();
        let h = self.hidden_size();
        let expected = [
            ("w_out", self.w_out.dim(), (h, v)),
            ("b_hidden", self.b_hidden.dim(), (1, h)),
            ("b_out", self.b_out.dim(), (1, v)),
            ("adam_w_embed.m", self.adam_w_embed.m.dim(), (v, h)),
            ("adam_w_embed.v", self.adam_w_embed.v.dim(), (v, h)),
            ("adam_w_out.m", self.adam_w_out.m.dim(), (h, v)),
            ("adam_w_out.v", self.adam_w_out.v.dim(), (h, v)),
            ("adam_b_hidden.m", self.adam_b_hidden.m.dim(), (1, h)),
            ("adam_b_hidden.v", self.adam_b_hidden.v.dim(), (1, h)),
            ("adam_b_out.m", self.adam_b_out.m.dim(), (1, v)),
            ("adam_b_out.v", self.adam_b_out.v.dim(), (1, v)),
        ];
        expected
            .iter()
            .find(|(_, actual, want)| actual != want)
            .map(|(name, actual, want)| {
                format!("{} has shape {:?}, expected {:?} (V={}, H={})", name, actual, want, v, h)
            })
    }

    /// Panics when any tensor disagrees with `(V, H)`. A mismatch here is a
    /// bug in a resize path, never a user error.
    pub fn assert_consistent(&self) {
        if let Some(problem) = self.shape_mismatch() {
            panic!("parameter store out of shape: {}", problem);
        }
    }

    /// Adds one vocabulary entry: a new embedding row, a new output column
    /// (both drawn with variance `1/H`), a zero output bias and zero moments.
    pub fn push_vocab_entry<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let h = self.hidden_size();
        let v = self.vocab_size();
        let scale = fan_in_scale(h);

        let mut w_embed = pad_rows(&self.w_embed, 1);
        w_embed
            .row_mut(v)
            .assign(&random_matrix(1, h, scale, rng).row(0));
        let mut w_out = pad_cols(&self.w_out, 1);
        w_out
            .column_mut(v)
            .assign(&random_matrix(h, 1, scale, rng).column(0));

        self.w_embed = w_embed;
        self.w_out = w_out;
        self.b_out = pad_cols(&self.b_out, 1);
        self.adam_w_embed.pad_rows(1);
        self.adam_w_out.pad_cols(1);
        self.adam_b_out.pad_cols(1);
        self.assert_consistent();
    }

    /// Widens the hidden layer by `increment`. Fresh random matrices are drawn
    /// at the new width and the old weights are copied into their top-left
    /// block; biases and moments are zero-padded.
    pub fn grow_hidden<R: Rng + ?Sized>(&mut self, increment: usize, rng: &mut R) {
        if increment == 0 {
            return;
        }
        let v = self.vocab_size();
        let old_h = self.hidden_size();
        let new_h = old_h + increment;

        let mut w_embed = random_matrix(v, new_h, fan_in_scale(v), rng);
        w_embed.slice_mut(s![.., ..old_h]).assign(&self.w_embed);
        let mut w_out = random_matrix(new_h, v, fan_in_scale(new_h), rng);
        w_out.slice_mut(s![..old_h, ..]).assign(&self.w_out);

        self.w_embed = w_embed;
        self.w_out = w_out;
        self.b_hidden = pad_cols(&self.b_hidden, increment);
        self.adam_w_embed.pad_cols(increment);
        self.adam_w_out.pad_rows(increment);
        self.adam_b_hidden.pad_cols(increment);
        self.assert_consistent();
    }

    pub fn weight_matrices(&self) -> [&Array2<f32>; 2] {
        [&self.w_embed, &self.w_out]
    }

    /// Count of weight-matrix entries that are not exactly zero.
    pub fn active_weights(&self) -> usize {
        self.weight_matrices()
            .iter()
            .map(|w| w.iter().filter(|x| **x != 0.0).count())
            .sum()
    }

    pub fn total_parameters(&self) -> usize {
        self.w_embed.len() + self.w_out.len() + self.b_hidden.len() + self.b_out.len()
    }
}

fn fan_in_scale(fan_in: usize) -> f32 {
    (1.0 / fan_in.max(1) as f32).sqrt()
}

fn random_matrix<R: Rng + ?Sized>(rows: usize, cols: usize, scale: f32, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_simple_fn((rows, cols), || rng.sample::<f32, _>(StandardNormal) * scale)
}

fn pad_rows(a: &Array2<f32>, extra: usize) -> Array2<f32> {
    let (rows, cols) = a.dim();
    let mut out = Array2::zeros((rows + extra, cols));
    out.slice_mut(s![..rows, ..]).assign(a);
    out
}

fn pad_cols(a: &Array2<f32>, extra: usize) -> Array2<f32> {
    let (rows, cols) = a.dim();
    let mut out = Array2::zeros((rows, cols + extra));
    out.slice_mut(s![.., ..cols]).assign(a);
    out
}

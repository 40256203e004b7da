//! Minimal inference layers over `ndarray`.
//!
//! Parameters are plain arrays so they serialize straight into model files.
//! Every layer has a `check` that model constructors call with the expected
//! dimensions; a mismatch is reported as `ModelLoad` naming the parameter.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn relu_inplace<D: ndarray::Dimension>(x: &mut ndarray::Array<f32, D>) {
    x.mapv_inplace(|v| v.max(0.0));
}

pub(crate) fn l2_normalize(x: &mut Array1<f32>) {
    let norm = x.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        x.mapv_inplace(|v| v / norm);
    }
}

fn shape_error(name: &str, expected: &[usize], found: &[usize]) -> VoiceError {
    VoiceError::model_load(format!(
        "parameter '{}' has shape {:?}, expected {:?}",
        name, found, expected
    ))
}

fn check_shape(name: &str, found: &[usize], expected: &[usize]) -> Result<()> {
    if found != expected {
        return Err(shape_error(name, expected, found));
    }
    Ok(())
}

fn uniform<R: Rng>(rng: &mut R, bound: f32) -> f32 {
    rng.gen_range(-bound..=bound)
}

/// Dense layer, `y = W x + b` with `W: (out, in)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn random<R: Rng>(rng: &mut R, in_dim: usize, out_dim: usize) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        Self {
            weight: Array2::from_shape_fn((out_dim, in_dim), |_| uniform(rng, bound)),
            bias: Array1::from_shape_fn(out_dim, |_| uniform(rng, bound)),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn check(&self, name: &str, in_dim: usize, out_dim: usize) -> Result<()> {
        check_shape(&format!("{}.weight", name), self.weight.shape(), &[out_dim, in_dim])?;
        check_shape(&format!("{}.bias", name), self.bias.shape(), &[out_dim])
    }

    pub fn forward(&self, x: ArrayView1<'_, f32>) -> Array1<f32> {
        self.weight.dot(&x) + &self.bias
    }

    /// Row-wise forward over a `(T, in)` matrix.
    pub fn forward_rows(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }
}

/// Token id -> vector lookup table of shape `(vocab, dim)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub table: Array2<f32>,
}

impl Embedding {
    pub fn random<R: Rng>(rng: &mut R, vocab: usize, dim: usize) -> Self {
        Self {
            table: Array2::from_shape_fn((vocab, dim), |_| uniform(rng, 0.5)),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    pub fn check(&self, name: &str, vocab: usize, dim: usize) -> Result<()> {
        check_shape(&format!("{}.table", name), self.table.shape(), &[vocab, dim])
    }

    /// Ids must already be validated against the vocabulary.
    pub fn lookup(&self, ids: &[u32]) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((ids.len(), self.dim()));
        for (mut row, &id) in out.rows_mut().into_iter().zip(ids) {
            row.assign(&self.table.row(id as usize));
        }
        out
    }
}

/// 1-D convolution over time with zero "same" padding. `weight: (out, in, kernel)`,
/// kernel width must be odd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv1d {
    pub weight: Array3<f32>,
    pub bias: Array1<f32>,
}

impl Conv1d {
    pub fn random<R: Rng>(rng: &mut R, in_ch: usize, out_ch: usize, kernel: usize) -> Self {
        let bound = 1.0 / ((in_ch * kernel).max(1) as f32).sqrt();
        Self {
            weight: Array3::from_shape_fn((out_ch, in_ch, kernel), |_| uniform(rng, bound)),
            bias: Array1::from_shape_fn(out_ch, |_| uniform(rng, bound)),
        }
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.len_of(Axis(2))
    }

    pub fn out_channels(&self) -> usize {
        self.weight.len_of(Axis(0))
    }

    /// Frames on each side that influence one output position.
    pub fn radius(&self) -> usize {
        self.kernel_size() / 2
    }

    pub fn check(&self, name: &str, in_ch: usize, out_ch: usize, kernel: usize) -> Result<()> {
        if kernel % 2 == 0 {
            return Err(VoiceError::model_load(format!(
                "'{}' kernel width {} must be odd",
                name, kernel
            )));
        }
        check_shape(&format!("{}.weight", name), self.weight.shape(), &[out_ch, in_ch, kernel])?;
        check_shape(&format!("{}.bias", name), self.bias.shape(), &[out_ch])
    }

    /// `x: (T, in)` -> `(T, out)`.
    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let t_len = x.nrows() as isize;
        let pad = self.radius() as isize;
        let mut out = Array2::<f32>::zeros((x.nrows(), self.out_channels()));
        out += &self.bias;

        for k in 0..self.kernel_size() {
            let offset = k as isize - pad;
            let t0 = (-offset).max(0);
            let t1 = (t_len - offset).min(t_len);
            if t0 >= t1 {
                continue;
            }
            let tap = self.weight.index_axis(Axis(2), k);
            let src = x.slice(s![t0 + offset..t1 + offset, ..]);
            let mut dst = out.slice_mut(s![t0..t1, ..]);
            dst += &src.dot(&tap.t());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LstmState {
    pub h: Array1<f32>,
    pub c: Array1<f32>,
}

impl LstmState {
    pub fn zeros(hidden: usize) -> Self {
        Self {
            h: Array1::zeros(hidden),
            c: Array1::zeros(hidden),
        }
    }
}

/// Single LSTM cell. Gate order along the `4 * hidden` axis is input, forget,
/// cell, output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmCell {
    pub w_ih: Array2<f32>,
    pub w_hh: Array2<f32>,
    pub bias: Array1<f32>,
}

impl LstmCell {
    pub fn random<R: Rng>(rng: &mut R, input: usize, hidden: usize) -> Self {
        let bound = 1.0 / (hidden.max(1) as f32).sqrt();
        Self {
            w_ih: Array2::from_shape_fn((4 * hidden, input), |_| uniform(rng, bound)),
            w_hh: Array2::from_shape_fn((4 * hidden, hidden), |_| uniform(rng, bound)),
            bias: Array1::from_shape_fn(4 * hidden, |_| uniform(rng, bound)),
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.w_hh.ncols()
    }

    pub fn check(&self, name: &str, input: usize, hidden: usize) -> Result<()> {
        check_shape(&format!("{}.w_ih", name), self.w_ih.shape(), &[4 * hidden, input])?;
        check_shape(&format!("{}.w_hh", name), self.w_hh.shape(), &[4 * hidden, hidden])?;
        check_shape(&format!("{}.bias", name), self.bias.shape(), &[4 * hidden])
    }

    pub fn step(&self, x: ArrayView1<'_, f32>, state: &LstmState) -> LstmState {
        let hidden = self.hidden_size();
        let gates = self.w_ih.dot(&x) + self.w_hh.dot(&state.h) + &self.bias;

        let i = gates.slice(s![0..hidden]).mapv(sigmoid);
        let f = gates.slice(s![hidden..2 * hidden]).mapv(sigmoid);
        let g = gates.slice(s![2 * hidden..3 * hidden]).mapv(f32::tanh);
        let o = gates.slice(s![3 * hidden..4 * hidden]).mapv(sigmoid);

        let c = &f * &state.c + &i * &g;
        let h = &o * &c.mapv(f32::tanh);
        LstmState { h, c }
    }

    /// Runs the cell over every row of `x: (T, in)` from a zero state.
    pub fn run(&self, x: ArrayView2<'_, f32>) -> (Array2<f32>, LstmState) {
        let mut state = LstmState::zeros(self.hidden_size());
        let mut outputs = Array2::<f32>::zeros((x.nrows(), self.hidden_size()));
        for (row, mut out) in x.rows().into_iter().zip(outputs.rows_mut()) {
            state = self.step(row, &state);
            out.assign(&state.h);
        }
        (outputs, state)
    }
}

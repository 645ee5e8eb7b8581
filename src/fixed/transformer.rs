//! Transformer step (spec.md §4.5 "Transformer step (inference engine)"):
//! given a token id and a loaded model, produce logits. Single-threaded per
//! step, built entirely out of the primitives in [`super::ops`] so there is
//! one place ([`super::simd::Backend`]) that ever picks a vectorized path.
//!
//! Tensor names follow the llama.cpp/GGUF naming convention (`token_embd`,
//! `blk.<i>.attn_q`, …) since neither model format in `spec.md` §6 specifies
//! one; this is the convention the weight files this kernel actually reads
//! are written against.

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use super::ops::{elem_add, elem_mul, matvec, rms_norm, softmax, vec_dot, FixedError};
use super::simd::Backend;
use super::types::Fixed;
use crate::weights::{dequant, ModelImage, WeightError};

/// Static topology parameters (spec.md §1 Non-goals: "dynamic model graphs"
/// are out of scope, so every dimension here is fixed for the lifetime of a
/// loaded [`Model`]).
#[derive(Clone, Copy, Debug)]
pub struct TransformerConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub ffn_hidden: usize,
}

struct LayerWeights {
    attn_norm: Vec<Fixed>,
    wq: Vec<Fixed>,
    wk: Vec<Fixed>,
    wv: Vec<Fixed>,
    wo: Vec<Fixed>,
    ffn_norm: Vec<Fixed>,
    w_gate: Vec<Fixed>,
    w_up: Vec<Fixed>,
    w_down: Vec<Fixed>,
}

pub struct Model {
    config: TransformerConfig,
    token_embedding: Vec<Fixed>,
    layers: Vec<LayerWeights>,
    final_norm: Vec<Fixed>,
    output_proj: Vec<Fixed>,
}

fn load_tensor(image: &ModelImage<'_>, name: &str) -> Result<Vec<Fixed>, WeightError> {
    let (desc, raw) = image.get_tensor(name).ok_or_else(|| WeightError::NoSuchTensor {
        name: alloc::string::String::from(name),
    })?;
    dequant::dequantize(desc, raw)
}

impl Model {
    /// Materializes every weight tensor named by `config`'s topology out of
    /// `image`, dequantizing each to Q16.16 up front (spec.md §4.4
    /// "Dequantization" is on-demand per tensor; a single pass at load time
    /// is the natural choice here since every tensor is read exactly once
    /// per step anyway).
    pub fn load(image: &ModelImage<'_>, config: TransformerConfig) -> Result<Model, WeightError> {
        let token_embedding = load_tensor(image, "token_embd.weight")?;
        let mut layers = Vec::new();
        layers.try_reserve(config.n_layers).map_err(|_| WeightError::Alloc)?;
        for i in 0..config.n_layers {
            layers.push(LayerWeights {
                attn_norm: load_tensor(image, &format!("blk.{i}.attn_norm.weight"))?,
                wq: load_tensor(image, &format!("blk.{i}.attn_q.weight"))?,
                wk: load_tensor(image, &format!("blk.{i}.attn_k.weight"))?,
                wv: load_tensor(image, &format!("blk.{i}.attn_v.weight"))?,
                wo: load_tensor(image, &format!("blk.{i}.attn_output.weight"))?,
                ffn_norm: load_tensor(image, &format!("blk.{i}.ffn_norm.weight"))?,
                w_gate: load_tensor(image, &format!("blk.{i}.ffn_gate.weight"))?,
                w_up: load_tensor(image, &format!("blk.{i}.ffn_up.weight"))?,
                w_down: load_tensor(image, &format!("blk.{i}.ffn_down.weight"))?,
            });
        }
        let final_norm = load_tensor(image, "output_norm.weight")?;
        let output_proj = load_tensor(image, "output.weight")?;
        Ok(Model {
            config,
            token_embedding,
            layers,
            final_norm,
            output_proj,
        })
    }
}

/// Per-layer key/value history for causal self-attention. Grows by one
/// position per [`step`] call; nothing here bounds sequence length since
/// that policy belongs to the caller (boot-param model selection, not this
/// module).
pub struct KvCache {
    keys: Vec<Vec<Fixed>>,
    values: Vec<Vec<Fixed>>,
}

impl KvCache {
    pub fn new(n_layers: usize) -> Self {
        KvCache {
            keys: (0..n_layers).map(|_| Vec::new()).collect(),
            values: (0..n_layers).map(|_| Vec::new()).collect(),
        }
    }
}

/// Runs one forward step: embedding lookup, per-layer {RMSNorm, Q/K/V
/// projections, attention, output projection, RMSNorm, FFN}, final
/// projection to logits (spec.md §4.5).
pub fn step(
    backend: &Backend,
    model: &Model,
    cache: &mut KvCache,
    token_id: usize,
) -> Result<Vec<Fixed>, FixedError> {
    let hidden = model.config.hidden_size;
    if token_id >= model.config.vocab_size {
        return Err(FixedError::DimensionMismatch {
            expected: model.config.vocab_size,
            got: token_id,
        });
    }

    let mut x: Vec<Fixed> =
        model.token_embedding[token_id * hidden..(token_id + 1) * hidden].to_vec();

    for (li, layer) in model.layers.iter().enumerate() {
        let mut normed = vec![Fixed::ZERO; hidden];
        rms_norm(&mut normed, &x, &layer.attn_norm, hidden)?;

        let mut q = vec![Fixed::ZERO; hidden];
        let mut k = vec![Fixed::ZERO; hidden];
        let mut v = vec![Fixed::ZERO; hidden];
        matvec(backend, &layer.wq, hidden, hidden, &normed, &mut q)?;
        matvec(backend, &layer.wk, hidden, hidden, &normed, &mut k)?;
        matvec(backend, &layer.wv, hidden, hidden, &normed, &mut v)?;

        cache.keys[li].extend_from_slice(&k);
        cache.values[li].extend_from_slice(&v);

        let attn_out = attention(
            backend,
            &q,
            &cache.keys[li],
            &cache.values[li],
            model.config.n_heads,
            model.config.head_dim,
            hidden,
        )?;

        let mut proj = vec![Fixed::ZERO; hidden];
        matvec(backend, &layer.wo, hidden, hidden, &attn_out, &mut proj)?;

        let mut resid1 = vec![Fixed::ZERO; hidden];
        elem_add(&x, &proj, &mut resid1)?;

        let mut normed2 = vec![Fixed::ZERO; hidden];
        rms_norm(&mut normed2, &resid1, &layer.ffn_norm, hidden)?;

        let ffn_hidden = model.config.ffn_hidden;
        let mut gate = vec![Fixed::ZERO; ffn_hidden];
        let mut up = vec![Fixed::ZERO; ffn_hidden];
        matvec(backend, &layer.w_gate, ffn_hidden, hidden, &normed2, &mut gate)?;
        matvec(backend, &layer.w_up, ffn_hidden, hidden, &normed2, &mut up)?;

        // Gated-linear FFN activation: ReLU gate rather than a second
        // transcendental approximation beyond softmax's exp_approx, keeping
        // every nonlinearity in this kernel piecewise-linear in Q16.16.
        for g in gate.iter_mut() {
            if g.raw() < 0 {
                *g = Fixed::ZERO;
            }
        }
        let mut ffn_mid = vec![Fixed::ZERO; ffn_hidden];
        elem_mul(&gate, &up, &mut ffn_mid)?;

        let mut ffn_out = vec![Fixed::ZERO; hidden];
        matvec(backend, &layer.w_down, hidden, ffn_hidden, &ffn_mid, &mut ffn_out)?;

        let mut resid2 = vec![Fixed::ZERO; hidden];
        elem_add(&resid1, &ffn_out, &mut resid2)?;
        x = resid2;
    }

    let mut final_normed = vec![Fixed::ZERO; hidden];
    rms_norm(&mut final_normed, &x, &model.final_norm, hidden)?;

    let mut logits = vec![Fixed::ZERO; model.config.vocab_size];
    matvec(
        backend,
        &model.output_proj,
        model.config.vocab_size,
        hidden,
        &final_normed,
        &mut logits,
    )?;
    Ok(logits)
}

/// Multi-head scaled dot-product attention over the full key/value history
/// accumulated so far (causal: every cached position is in the past or the
/// current step by construction of [`KvCache`]).
fn attention(
    backend: &Backend,
    q: &[Fixed],
    keys: &[Fixed],
    values: &[Fixed],
    n_heads: usize,
    head_dim: usize,
    hidden: usize,
) -> Result<Vec<Fixed>, FixedError> {
    let seq_len = keys.len() / hidden;
    let mut out = vec![Fixed::ZERO; hidden];
    let scale = Fixed::from_f32(1.0 / (head_dim as f32).sqrt());

    for h in 0..n_heads {
        let q_h = &q[h * head_dim..(h + 1) * head_dim];
        let mut scores = vec![Fixed::ZERO; seq_len.max(1)];
        for t in 0..seq_len {
            let k_h = &keys[t * hidden + h * head_dim..t * hidden + (h + 1) * head_dim];
            scores[t] = vec_dot(backend, q_h, k_h)?.mul(scale);
        }
        let mut probs = vec![Fixed::ZERO; seq_len.max(1)];
        softmax(&scores, &mut probs, seq_len.max(1))?;

        let mut out_h = vec![Fixed::ZERO; head_dim];
        for t in 0..seq_len {
            let v_h = &values[t * hidden + h * head_dim..t * hidden + (h + 1) * head_dim];
            for d in 0..head_dim {
                out_h[d] = out_h[d].add(probs[t].mul(v_h[d]));
            }
        }
        out[h * head_dim..(h + 1) * head_dim].copy_from_slice(&out_h);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::simd::ScalarBackend;

    fn backend() -> Backend {
        Backend::Scalar(ScalarBackend)
    }

    fn tiny_model() -> Model {
        // 1 layer, hidden=2, heads=1, head_dim=2, ffn_hidden=2, vocab=2.
        let config = TransformerConfig {
            vocab_size: 2,
            hidden_size: 2,
            n_layers: 1,
            n_heads: 1,
            head_dim: 2,
            ffn_hidden: 2,
        };
        let ident = vec![Fixed::ONE, Fixed::ZERO, Fixed::ZERO, Fixed::ONE];
        let ones_vec = vec![Fixed::ONE, Fixed::ONE];
        Model {
            config,
            token_embedding: vec![Fixed::ONE, Fixed::ZERO, Fixed::ZERO, Fixed::ONE],
            layers: vec![LayerWeights {
                attn_norm: ones_vec.clone(),
                wq: ident.clone(),
                wk: ident.clone(),
                wv: ident.clone(),
                wo: ident.clone(),
                ffn_norm: ones_vec.clone(),
                w_gate: ident.clone(),
                w_up: ident.clone(),
                w_down: ident.clone(),
            }],
            final_norm: ones_vec,
            output_proj: ident,
        }
    }

    #[test]
    fn step_produces_one_logit_per_vocab_entry() {
        let model = tiny_model();
        let mut cache = KvCache::new(1);
        let logits = step(&backend(), &model, &mut cache, 0).unwrap();
        assert_eq!(logits.len(), 2);
    }

    #[test]
    fn out_of_range_token_is_rejected() {
        let model = tiny_model();
        let mut cache = KvCache::new(1);
        assert!(step(&backend(), &model, &mut cache, 5).is_err());
    }

    #[test]
    fn cache_accumulates_one_position_per_step() {
        let model = tiny_model();
        let mut cache = KvCache::new(1);
        step(&backend(), &model, &mut cache, 0).unwrap();
        step(&backend(), &model, &mut cache, 1).unwrap();
        assert_eq!(cache.keys[0].len(), 2 * model.config.hidden_size);
    }
}

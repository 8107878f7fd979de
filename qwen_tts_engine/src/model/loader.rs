//! Load-time quantization policy and the quantized cache in front of it.
//!
//! | matrices                                   | encoding |
//! |--------------------------------------------|----------|
//! | talker fused QKV, fused gate/up            | q4_k     |
//! | talker output and down projections         | int8-row |
//! | every code predictor layer matrix          | q4_k     |
//! | talker codec head                          | bf16     |
//! | text projection, predictor input projection and heads | int8-row |
//!
//! Norm vectors and biases are small and always read straight from the store
//! as f32. Embedding tables are never copied; rows are read from the mapping.

use std::collections::HashMap;
use std::time::Instant;

use rayon::prelude::*;

use crate::config::{CodePredictorConfig, Config, TalkerConfig};
use crate::error::{CacheError, LoadError};
use crate::io::qcache::{self, CacheKey};
use crate::io::{EmbeddingTable, MatrixSpec, ModelPaths, WeightStore};
use crate::model::options::LoadOptions;
use crate::nn::attention::AttentionShape;
use crate::nn::code_predictor::InputProjection;
use crate::nn::decoder_layer::{LayerDims, LayerWeights};
use crate::nn::talker::TextProjection;
use crate::nn::{CodePredictor, Talker, Transformer};
use crate::quant::{Encoding, KernelPool, QuantMatrix};

const TALKER_PREFIX: &str = "talker.model";
const PREDICTOR_PREFIX: &str = "talker.code_predictor";
const INPUT_PROJ: &str = "talker.code_predictor.small_to_mtp_projection";

const TALKER_FUSED: Encoding = Encoding::Q4K;
const TALKER_OUTPUT: Encoding = Encoding::Int8;
const PREDICTOR_LAYERS: Encoding = Encoding::Q4K;
const CODEC_HEAD: Encoding = Encoding::Bf16;
const PROJECTIONS: Encoding = Encoding::Int8;

/// A matrix the loader needs, with the source tensors it is built from.
#[derive(Debug, Clone)]
pub struct PlannedMatrix {
    pub spec: MatrixSpec,
    /// `(tensor name, rows)`; more than one part means the rows are stacked
    pub parts: Vec<(String, usize)>,
}

impl PlannedMatrix {
    fn single(name: String, encoding: Encoding, rows: usize, cols: usize) -> Self {
        Self {
            spec: MatrixSpec::new(name.clone(), encoding, rows, cols),
            parts: vec![(name, rows)],
        }
    }

    fn fused(name: String, encoding: Encoding, parts: Vec<(String, usize)>, cols: usize) -> Self {
        let rows = parts.iter().map(|(_, r)| r).sum();
        Self {
            spec: MatrixSpec::new(name, encoding, rows, cols),
            parts,
        }
    }

    fn quantize(&self, store: &WeightStore) -> Result<QuantMatrix, LoadError> {
        let spec = &self.spec;
        match self.parts.as_slice() {
            [(name, rows)] => store.load_matrix(name, *rows, spec.cols, spec.encoding),
            parts => {
                let parts: Vec<(&str, usize)> = parts.iter().map(|(n, r)| (n.as_str(), *r)).collect();
                store.load_fused(&parts, spec.cols, spec.encoding)
            }
        }
    }
}

pub fn talker_dims(t: &TalkerConfig) -> LayerDims {
    LayerDims {
        hidden: t.hidden_size,
        intermediate: t.intermediate_size,
        attention: AttentionShape {
            num_heads: t.num_attention_heads,
            num_kv_heads: t.num_key_value_heads,
            head_dim: t.head_dim(),
            window: None,
        },
        eps: t.rms_norm_eps as f32,
    }
}

/// The code predictor shares the talker's norm epsilon.
pub fn predictor_dims(cp: &CodePredictorConfig, eps: f64) -> LayerDims {
    LayerDims {
        hidden: cp.hidden_size,
        intermediate: cp.intermediate_size,
        attention: AttentionShape {
            num_heads: cp.num_attention_heads,
            num_kv_heads: cp.num_key_value_heads,
            head_dim: cp.head_dim,
            window: None,
        },
        eps: eps as f32,
    }
}

fn qkv_name(prefix: &str) -> String {
    format!("{prefix}.self_attn.qkv_proj.weight")
}

fn gate_up_name(prefix: &str) -> String {
    format!("{prefix}.mlp.gate_up_proj.weight")
}

fn plan_layer(out: &mut Vec<PlannedMatrix>, prefix: &str, dims: &LayerDims, fused: Encoding, output: Encoding) {
    let (h, inter) = (dims.hidden, dims.intermediate);
    let (q_dim, kv_dim) = (dims.attention.q_dim(), dims.attention.kv_dim());
    let part = |s: &str, rows: usize| (format!("{prefix}.{s}"), rows);
    out.push(PlannedMatrix::fused(
        qkv_name(prefix),
        fused,
        vec![
            part("self_attn.q_proj.weight", q_dim),
            part("self_attn.k_proj.weight", kv_dim),
            part("self_attn.v_proj.weight", kv_dim),
        ],
        h,
    ));
    out.push(PlannedMatrix::single(format!("{prefix}.self_attn.o_proj.weight"), output, h, q_dim));
    out.push(PlannedMatrix::fused(
        gate_up_name(prefix),
        fused,
        vec![part("mlp.gate_proj.weight", inter), part("mlp.up_proj.weight", inter)],
        h,
    ));
    out.push(PlannedMatrix::single(format!("{prefix}.mlp.down_proj.weight"), output, h, inter));
}

/// Every quantized matrix in cache order.
pub fn plan(config: &Config, has_input_proj: bool) -> Vec<PlannedMatrix> {
    let t = &config.talker_config;
    let cp = &t.code_predictor_config;
    let mut out = Vec::new();

    let dims = talker_dims(t);
    for i in 0..t.num_hidden_layers {
        plan_layer(&mut out, &format!("{TALKER_PREFIX}.layers.{i}"), &dims, TALKER_FUSED, TALKER_OUTPUT);
    }
    out.push(PlannedMatrix::single(
        "talker.codec_head.weight".to_string(),
        CODEC_HEAD,
        t.vocab_size,
        t.hidden_size,
    ));
    out.push(PlannedMatrix::single(
        "talker.text_projection.linear_fc1.weight".to_string(),
        PROJECTIONS,
        t.text_hidden_size,
        t.text_hidden_size,
    ));
    out.push(PlannedMatrix::single(
        "talker.text_projection.linear_fc2.weight".to_string(),
        PROJECTIONS,
        t.hidden_size,
        t.text_hidden_size,
    ));

    let dims = predictor_dims(cp, t.rms_norm_eps);
    for i in 0..cp.num_hidden_layers {
        plan_layer(
            &mut out,
            &format!("{PREDICTOR_PREFIX}.model.layers.{i}"),
            &dims,
            PREDICTOR_LAYERS,
            PREDICTOR_LAYERS,
        );
    }
    if has_input_proj {
        out.push(PlannedMatrix::single(
            format!("{INPUT_PROJ}.weight"),
            PROJECTIONS,
            cp.hidden_size,
            t.hidden_size,
        ));
    }
    for g in 0..t.num_code_groups - 1 {
        out.push(PlannedMatrix::single(
            format!("{PREDICTOR_PREFIX}.lm_head.{g}.weight"),
            PROJECTIONS,
            cp.vocab_size,
            cp.hidden_size,
        ));
    }
    out
}

/// Quantized matrices keyed by name, consumed while assembling the model.
struct Matrices(HashMap<String, QuantMatrix>);

impl Matrices {
    fn take(&mut self, name: &str) -> Result<QuantMatrix, LoadError> {
        self.0
            .remove(name)
            .ok_or_else(|| LoadError::MissingTensor(name.to_string()))
    }
}

/// Read the planned matrices from the cache, or quantize them and write a
/// fresh cache. Cache problems are logged and never fail the load.
fn obtain(
    store: &WeightStore,
    pool: &KernelPool,
    paths: &ModelPaths,
    options: &LoadOptions,
    key: &CacheKey,
    plan: &[PlannedMatrix],
) -> Result<HashMap<String, QuantMatrix>, LoadError> {
    let manifest: Vec<MatrixSpec> = plan.iter().map(|p| p.spec.clone()).collect();
    let cache_file = paths.cache_file();

    if options.use_cache {
        match qcache::read(&cache_file, key, &manifest) {
            Ok(matrices) => {
                tracing::info!(path = %cache_file.display(), matrices = matrices.len(), "quantized cache hit");
                return Ok(matrices);
            }
            Err(CacheError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %cache_file.display(), "no quantized cache");
            }
            Err(err) => {
                tracing::warn!(path = %cache_file.display(), %err, "quantized cache rejected, re-quantizing");
            }
        }
    }

    let started = Instant::now();
    let matrices = pool.install(|| {
        plan.par_iter()
            .map(|p| Ok((p.spec.name.clone(), p.quantize(store)?)))
            .collect::<Result<HashMap<_, _>, LoadError>>()
    })?;
    tracing::info!(
        matrices = matrices.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "quantized weights"
    );

    if options.use_cache {
        match qcache::write(&cache_file, key, &manifest, &matrices) {
            Ok(()) => tracing::info!(path = %cache_file.display(), "wrote quantized cache"),
            Err(err) => tracing::warn!(path = %cache_file.display(), %err, "failed to write quantized cache"),
        }
    }
    Ok(matrices)
}

fn load_layer(store: &WeightStore, m: &mut Matrices, prefix: &str, dims: &LayerDims) -> Result<LayerWeights, LoadError> {
    let (h, head_dim) = (dims.hidden, dims.attention.head_dim);
    let name = |s: &str| format!("{prefix}.{s}");
    Ok(LayerWeights {
        input_norm: store.load_f32(&name("input_layernorm.weight"), &[h])?,
        post_attention_norm: store.load_f32(&name("post_attention_layernorm.weight"), &[h])?,
        q_norm: Some(store.load_f32(&name("self_attn.q_norm.weight"), &[head_dim])?),
        k_norm: Some(store.load_f32(&name("self_attn.k_norm.weight"), &[head_dim])?),
        wqkv: m.take(&qkv_name(prefix))?,
        wo: m.take(&name("self_attn.o_proj.weight"))?,
        gate_up: m.take(&gate_up_name(prefix))?,
        down: m.take(&name("mlp.down_proj.weight"))?,
        attn_layer_scale: None,
        mlp_layer_scale: None,
    })
}

fn load_talker(store: &WeightStore, config: &Config, m: &mut Matrices) -> Result<Talker, LoadError> {
    let t = &config.talker_config;
    let dims = talker_dims(t);
    let layers = (0..t.num_hidden_layers)
        .map(|i| load_layer(store, m, &format!("{TALKER_PREFIX}.layers.{i}"), &dims))
        .collect::<Result<Vec<_>, _>>()?;

    let text_projection = TextProjection {
        fc1: m.take("talker.text_projection.linear_fc1.weight")?,
        fc1_bias: store.load_f32("talker.text_projection.linear_fc1.bias", &[t.text_hidden_size])?,
        fc2: m.take("talker.text_projection.linear_fc2.weight")?,
        fc2_bias: store.load_f32("talker.text_projection.linear_fc2.bias", &[t.hidden_size])?,
    };

    Ok(Talker {
        transformer: Transformer {
            dims,
            layers,
            norm: Some(store.load_f32(&format!("{TALKER_PREFIX}.norm.weight"), &[t.hidden_size])?),
        },
        text_embedding: EmbeddingTable::bind(
            store,
            &format!("{TALKER_PREFIX}.text_embedding.weight"),
            t.text_vocab_size,
            t.text_hidden_size,
        )?,
        codec_embedding: EmbeddingTable::bind(
            store,
            &format!("{TALKER_PREFIX}.codec_embedding.weight"),
            t.vocab_size,
            t.hidden_size,
        )?,
        text_projection,
        codec_head: m.take("talker.codec_head.weight")?,
    })
}

fn load_predictor(store: &WeightStore, config: &Config, m: &mut Matrices) -> Result<CodePredictor, LoadError> {
    let t = &config.talker_config;
    let cp = &t.code_predictor_config;
    let dims = predictor_dims(cp, t.rms_norm_eps);
    let layers = (0..cp.num_hidden_layers)
        .map(|i| load_layer(store, m, &format!("{PREDICTOR_PREFIX}.model.layers.{i}"), &dims))
        .collect::<Result<Vec<_>, _>>()?;

    let input_proj = if store.contains(&format!("{INPUT_PROJ}.weight")) {
        Some(InputProjection {
            weight: m.take(&format!("{INPUT_PROJ}.weight"))?,
            bias: store.load_f32(&format!("{INPUT_PROJ}.bias"), &[cp.hidden_size])?,
        })
    } else {
        if cp.hidden_size != t.hidden_size {
            tracing::warn!(
                talker_hidden = t.hidden_size,
                predictor_hidden = cp.hidden_size,
                "no input projection between differing widths; inputs are truncated or zero-padded"
            );
        }
        None
    };

    let groups = t.num_code_groups;
    let embeddings = (0..groups - 1)
        .map(|g| {
            EmbeddingTable::bind(
                store,
                &format!("{PREDICTOR_PREFIX}.model.codec_embedding.{g}.weight"),
                cp.vocab_size,
                t.hidden_size,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    let lm_heads = (0..groups - 1)
        .map(|g| m.take(&format!("{PREDICTOR_PREFIX}.lm_head.{g}.weight")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CodePredictor {
        transformer: Transformer {
            dims,
            layers,
            norm: Some(store.load_f32(&format!("{PREDICTOR_PREFIX}.model.norm.weight"), &[cp.hidden_size])?),
        },
        input_proj,
        embeddings,
        lm_heads,
    })
}

/// Build the talker and code predictor from `store`, going through the
/// quantized cache when `options.use_cache` is set.
pub fn load_weights(
    store: &WeightStore,
    pool: &KernelPool,
    config: &Config,
    paths: &ModelPaths,
    options: &LoadOptions,
) -> Result<(Talker, CodePredictor), LoadError> {
    let t = &config.talker_config;
    let plan = plan(config, store.contains(&format!("{INPUT_PROJ}.weight")));
    tracing::debug!(
        matrices = plan.len(),
        talker_fused = %TALKER_FUSED,
        talker_output = %TALKER_OUTPUT,
        predictor = %PREDICTOR_LAYERS,
        codec_head = %CODEC_HEAD,
        projections = %PROJECTIONS,
        "quantization policy"
    );
    let key = CacheKey {
        fingerprint: store.fingerprint(),
        layers: (
            t.num_hidden_layers as u32,
            t.code_predictor_config.num_hidden_layers as u32,
            t.num_code_groups as u32,
        ),
    };
    let mut matrices = Matrices(obtain(store, pool, paths, options, &key, &plan)?);
    let talker = load_talker(store, config, &mut matrices)?;
    let code_predictor = load_predictor(store, config, &mut matrices)?;
    tracing::debug!(
        talker_layers = talker.transformer.layers.len(),
        predictor_layers = code_predictor.transformer.layers.len(),
        groups = code_predictor.num_groups(),
        "talker and code predictor assembled"
    );
    Ok((talker, code_predictor))
}

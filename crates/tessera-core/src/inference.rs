//! Sharded forward pass over a whole chunk.
//!
//! [`infer`] is the per-device program: it embeds the tokens, runs a layer function over every layer, normalizes the
//! final activations, and projects them onto the vocabulary. [`InferenceEngine`] owns the distributed weights of a
//! model and runs [`infer`] on every device of its mesh for each call to [`InferenceEngine::forward`].

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::array::HostArray;
use crate::chunk::{Chunk, FullChunkResult, OutputMode};
use crate::errors::Error;
use crate::hparams::HParams;
use crate::kv_cache::KVCache;
use crate::layers::{allgather_layernorm, transformer_layer_weight_stationary, LayerContext, LayerFn};
use crate::parameters::Parameterized;
use crate::partitioning::{build_rules, residual_logical_axes, AttnAllToAll, RuleTable, LAYERS, MESH_X, MESH_Y, MESH_Z};
use crate::resolver::{assemble, check_divisible, distribute, local_shape, resolve};
use crate::runtime::{Collectives, HostRuntime};
use crate::sharding::Mesh;
use crate::types::DataType;
use crate::weights::{Layer, Weights};

/// Batch dimension of activations.
const BATCH: usize = 0;

/// Time dimension of activations.
const TIME: usize = 1;

/// Embedding dimension of activations.
const EMBED: usize = 2;

/// Knobs selecting how a forward pass is partitioned.
///
/// Every combination computes the same function of the inputs (up to floating-point reassociation); they only change
/// which collectives are issued and how activations are laid out between them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferenceOptions {
    /// Assignment of the mesh axes to the `M`, `H1`, and `H2` roles.
    #[serde(alias = "attention_strategy")]
    pub attn_all_to_all: AttnAllToAll,

    /// Replicates the batch instead of sharding it. Attention then runs head-sharded on every row.
    pub batch_unsharded: bool,

    /// Replaces reduce-scatters of the residual stream by fewer, larger all-reduces followed by local slicing.
    pub latency_collectives: bool,

    /// Shards the residual stream along time instead of batch.
    pub shard_seqlen_vs_batch: bool,

    /// Data type activations are rounded through after every projection.
    pub intermediate_dtype: DataType,

    /// Whether forward calls return logits or final activations.
    pub output_mode: OutputMode,
}

impl InferenceOptions {
    /// Dimension of the residual stream sharded over the `R` mesh axis, if any: time when
    /// `shard_seqlen_vs_batch` is set, otherwise batch unless `batch_unsharded` is set.
    pub fn outer_dimension(&self) -> Option<usize> {
        if self.shard_seqlen_vs_batch {
            Some(TIME)
        } else if self.batch_unsharded {
            None
        } else {
            Some(BATCH)
        }
    }

    /// Partitioning rules implied by these options.
    pub fn rules(&self) -> Result<RuleTable, Error> {
        build_rules(self.attn_all_to_all, self.batch_unsharded)
    }
}

// ---------------------------------------------------------------------------
// Per-device program
// ---------------------------------------------------------------------------

/// Runs the forward pass of one device.
///
/// `weights`, `kv_caches`, and `chunk` are the local shards of the device running this program, as produced by
/// [`distribute`]. Returns the local shards of the result and of the extended caches.
#[allow(clippy::too_many_arguments)]
pub fn infer<L: LayerFn + ?Sized>(
    collectives: &dyn Collectives,
    mesh: &Mesh,
    hparams: &HParams,
    layer_fn: &L,
    weights: &Weights<HostArray>,
    kv_caches: &[KVCache<HostArray>],
    chunk: &Chunk<HostArray<u32>>,
    rules: &RuleTable,
    options: &InferenceOptions,
) -> Result<(FullChunkResult<HostArray>, Vec<KVCache<HostArray>>), Error> {
    if kv_caches.len() != hparams.layers() {
        return Err(Error::ShapeMismatch {
            tensor: "kv_caches".to_string(),
            logical_axis: LAYERS.to_string(),
            expected: hparams.layers(),
            actual: kv_caches.len(),
        });
    }

    let lengths = chunk.row_lengths()?;
    let ctx = LayerContext {
        collectives,
        mesh,
        hparams,
        rules,
        roles: options.attn_all_to_all.roles(),
        options,
        lengths: &lengths,
        seq_len: chunk.seq_len(),
        sin: &weights.sin,
        cos: &weights.cos,
    };

    let mut x = embed(&ctx, &weights.embedding, &chunk.tokens)?;
    let mut caches = Vec::with_capacity(kv_caches.len());
    for (index, cache) in kv_caches.iter().enumerate() {
        let layer = layer_weights(&weights.layer, index)?;
        let (output, cache) = layer_fn(&ctx, &layer, cache, &x)?;
        trace!(layer = index, "applied layer");
        x = output;
        caches.push(cache);
    }

    let xnorm = allgather_layernorm(&ctx, &x)?;
    let logits = match options.output_mode {
        OutputMode::Activations => xnorm,
        OutputMode::Logits => {
            let (rows, time, embed_local) = (xnorm.dim(BATCH)?, xnorm.dim(TIME)?, xnorm.dim(EMBED)?);
            let vocab_local = weights.embedding.dim(0)?;
            let projection = weights.embedding.permute(&[1, 0])?;
            let logits = xnorm.reshape(vec![rows * time, embed_local])?.matmul(&projection)?;
            let logits = ctx.round(logits.reshape(vec![rows, time, vocab_local])?)?;
            let m = ctx.roles.embed;
            if options.batch_unsharded {
                collectives.psum(&logits, &[m])?
            } else {
                collectives.psum_scatter(&logits, &[m], 0)?
            }
        }
    };
    Ok((FullChunkResult { logits }, caches))
}

/// Looks up the embeddings of `tokens` `[batch, seq_len]` and returns the local shard of the residual stream.
///
/// Every device looks up the tokens that fall into its vocabulary block (all other positions are zero), the lookups
/// are summed over `(H1, H2)`, and the sum is sliced down to the residual layout.
fn embed(ctx: &LayerContext<'_>, embedding: &HostArray, tokens: &HostArray<u32>) -> Result<HostArray, Error> {
    let (h1, h2) = (ctx.roles.heads_major(), ctx.roles.heads_minor());
    let collectives = ctx.collectives;
    let (vocab_local, embed_local) = (embedding.dim(0)?, embedding.dim(1)?);
    let first_token = collectives.axis_index(&[h1, h2])? * vocab_local;

    let local = tokens
        .to_vec()?
        .into_iter()
        .map(|token| (token as usize).checked_sub(first_token).filter(|row| *row < vocab_local))
        .collect::<Vec<_>>();
    let rows = local.iter().map(|row| row.unwrap_or(0) as u32).collect::<Vec<_>>();
    let found = local.iter().map(|row| if row.is_some() { 1.0f32 } else { 0.0 }).collect::<Vec<_>>();
    let device = embedding.tensor().device();
    let rows = Tensor::from_vec(rows, local.len(), device)?;
    let found = Tensor::from_vec(found, (local.len(), 1), device)?;
    let lookup = embedding.tensor().index_select(&rows, 0)?.broadcast_mul(&found)?;

    let mut shape = tokens.shape().to_vec();
    shape.push(embed_local);
    let x = collectives.psum(&HostArray::from_tensor(lookup)?.reshape(shape)?, &[h1, h2])?;

    let x = x.chunk(EMBED, collectives.axis_size(&[h1])?, collectives.axis_index(&[h1])?)?;
    Ok(match ctx.options.outer_dimension() {
        Some(dimension) => x.chunk(dimension, collectives.axis_size(&[h2])?, collectives.axis_index(&[h2])?)?,
        None => x,
    })
}

/// Weights of layer `index`, sliced out of the stacked weights.
fn layer_weights(stacked: &Layer<HostArray>, index: usize) -> Result<Layer<HostArray>, Error> {
    stacked.try_map_params_ref(|weight| {
        let weight = weight.slice_axis(0, index, 1)?;
        let shape = weight.shape()[1..].to_vec();
        Ok(weight.reshape(shape)?)
    })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the distributed weights of a model on a mesh and runs forward passes over it.
///
/// Weights are validated, partitioned, and distributed once, in [`InferenceEngine::new`]. KV caches are owned by the
/// caller: [`InferenceEngine::forward`] takes the caches of every layer and returns extended copies, leaving its
/// inputs untouched. A failed call therefore never leaves a cache half-updated.
///
/// ```rust
/// # use tessera_core::chunk::Chunk;
/// # use tessera_core::hparams::HParams;
/// # use tessera_core::inference::{InferenceEngine, InferenceOptions};
/// # use tessera_core::kv_cache::KVCache;
/// # use tessera_core::sharding::Mesh;
/// # use tessera_core::weights::Weights;
/// let hparams = HParams::new(1, 16, 32, 4, 8, 32, 64).unwrap();
/// let mesh = Mesh::grid(&[("x", 2), ("y", 1), ("z", 2)]).unwrap();
/// let weights = Weights::random(&hparams, 0).unwrap();
/// let engine = InferenceEngine::new(mesh, hparams, &weights, InferenceOptions::default()).unwrap();
///
/// let chunk = Chunk::from_sequences(&[vec![1, 2, 3], vec![4, 5], vec![6], vec![7, 8, 9, 10]], 4).unwrap();
/// let caches = KVCache::empty_layers(1, 4, 8).unwrap();
/// let (result, caches) = engine.forward(&chunk, &caches).unwrap();
/// assert_eq!(result.logits.shape(), &[4, 4, 64]);
/// assert_eq!(caches[0].valid_lengths(), Ok(vec![3, 2, 1, 4]));
/// ```
#[derive(Clone, Debug)]
pub struct InferenceEngine {
    mesh: Mesh,
    hparams: HParams,
    options: InferenceOptions,
    rules: RuleTable,
    weight_shards: Vec<Weights<HostArray>>,
}

impl InferenceEngine {
    /// Validates `weights` against `hparams` and distributes them over `mesh`, which must have the axes `x`, `y`,
    /// and `z` (in that order).
    pub fn new(
        mesh: Mesh,
        hparams: HParams,
        weights: &Weights<HostArray>,
        options: InferenceOptions,
    ) -> Result<Self, Error> {
        let axis_names = mesh.axis_names_3d()?;
        if axis_names != (MESH_X, MESH_Y, MESH_Z) {
            return Err(Error::Config {
                message: format!("the mesh axes must be named (x, y, z), but got {axis_names:?}"),
            });
        }
        weights.validate(&hparams)?;

        let rules = options.rules()?;
        let logical_axes = Weights::logical_axes();
        let shapes = Weights::shapes(&hparams, DataType::Float32);
        for (shape, axes) in shapes.params().into_iter().zip(logical_axes.params()) {
            local_shape(&shape.shape, axes, &rules, &mesh)?;
        }
        let partition_specs = resolve(&logical_axes, &rules)?;
        let weight_shards = distribute(weights, &partition_specs, &mesh)?;

        let (x, y, z) = mesh.shape()?;
        info!(x, y, z, strategy = %options.attn_all_to_all, "distributed weights over the mesh");
        Ok(Self { mesh, hparams, options, rules, weight_shards })
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    pub fn options(&self) -> &InferenceOptions {
        &self.options
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Local weight shards, in row-major device order.
    pub fn weight_shards(&self) -> &[Weights<HostArray>] {
        &self.weight_shards
    }

    /// Runs [`transformer_layer_weight_stationary`] over every layer of `chunk`, given the caches of every layer.
    /// Returns the result and the extended caches.
    pub fn forward(
        &self,
        chunk: &Chunk<HostArray<u32>>,
        kv_caches: &[KVCache<HostArray>],
    ) -> Result<(FullChunkResult<HostArray>, Vec<KVCache<HostArray>>), Error> {
        self.forward_with(&transformer_layer_weight_stationary, chunk, kv_caches)
    }

    /// Same as [`InferenceEngine::forward`], but runs `layer_fn` for every layer.
    pub fn forward_with<L: LayerFn>(
        &self,
        layer_fn: &L,
        chunk: &Chunk<HostArray<u32>>,
        kv_caches: &[KVCache<HostArray>],
    ) -> Result<(FullChunkResult<HostArray>, Vec<KVCache<HostArray>>), Error> {
        self.validate_inputs(chunk, kv_caches)?;
        let (batch, seq_len) = (chunk.batch_size(), chunk.seq_len());
        debug!(batch, seq_len, cache_len = kv_caches.first().map_or(0, |cache| cache.cache_len()), "forward");

        let chunk_specs = resolve(&Chunk::logical_axes(), &self.rules)?;
        let cache_specs = resolve(&vec![KVCache::logical_axes(); kv_caches.len()], &self.rules)?;
        let result_specs = resolve(&FullChunkResult::logical_axes(self.options.output_mode), &self.rules)?;
        let chunk_shards = distribute(chunk, &chunk_specs, &self.mesh)?;
        let cache_shards = distribute(&kv_caches.to_vec(), &cache_specs, &self.mesh)?;

        let outputs = HostRuntime::new(&self.mesh).run(|device| {
            let index = device.device_index();
            infer(
                device,
                &self.mesh,
                &self.hparams,
                layer_fn,
                &self.weight_shards[index],
                &cache_shards[index],
                &chunk_shards[index],
                &self.rules,
                &self.options,
            )
        })?;

        let (results, caches): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
        Ok((assemble(results, &result_specs, &self.mesh)?, assemble(caches, &cache_specs, &self.mesh)?))
    }

    /// Checks the chunk and caches, and that every sharded dimension divides evenly, before any device starts.
    fn validate_inputs(&self, chunk: &Chunk<HostArray<u32>>, kv_caches: &[KVCache<HostArray>]) -> Result<(), Error> {
        let hparams = &self.hparams;
        chunk.validate()?;
        chunk.validate_tokens(hparams.vocab())?;
        let (batch, seq_len) = (chunk.batch_size(), chunk.seq_len());
        if kv_caches.len() != hparams.layers() {
            return Err(Error::ShapeMismatch {
                tensor: "kv_caches".to_string(),
                logical_axis: LAYERS.to_string(),
                expected: hparams.layers(),
                actual: kv_caches.len(),
            });
        }
        for cache in kv_caches {
            cache.validate(batch, hparams.qkv())?;
        }
        let cache_len = kv_caches.first().map_or(0, |cache| cache.cache_len());
        if let Some(cache) = kv_caches.iter().find(|cache| cache.cache_len() != cache_len) {
            return Err(Error::ShapeMismatch {
                tensor: "kv_cache.mask".to_string(),
                logical_axis: crate::partitioning::TIME.to_string(),
                expected: cache_len,
                actual: cache.cache_len(),
            });
        }
        if cache_len + seq_len > hparams.max_len() {
            return Err(Error::CacheOverflow { cache_len, seq_len, max_len: hparams.max_len() });
        }

        let residual_axes = residual_logical_axes(self.options.shard_seqlen_vs_batch);
        local_shape(&[batch, seq_len, hparams.embed()], &residual_axes, &self.rules, &self.mesh)?;
        let cache_axes = KVCache::logical_axes();
        local_shape(&[batch, cache_len + seq_len, hparams.qkv()], &cache_axes.k, &self.rules, &self.mesh)?;
        let result_axes = FullChunkResult::logical_axes(self.options.output_mode);
        let result_shape = FullChunkResult::shapes(hparams, batch, seq_len, self.options.output_mode);
        local_shape(&result_shape.logits.shape, &result_axes.logits, &self.rules, &self.mesh)?;
        if self.options.outer_dimension() == Some(TIME) {
            let embed_axis_size = self.mesh.axes_size(&[self.options.attn_all_to_all.roles().embed])?;
            check_divisible(&residual_axes.to_string(), crate::partitioning::TIME, seq_len, embed_axis_size)?;
        }
        Ok(())
    }
}

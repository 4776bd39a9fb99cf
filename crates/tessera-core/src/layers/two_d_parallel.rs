//! Weight-stationary 2D-parallel transformer layer.
//!
//! Weights never move: every device holds a `[heads / (nH1 * nH2), embed / nM]` block of each projection and the
//! activations travel instead. Each layer runs the following steps on every device, where `M`, `H1`, and `H2` are the
//! mesh axes selected by [`AttnAllToAll`](crate::partitioning::AttnAllToAll) and `od` is the outer dimension of the
//! residual stream (batch, time, or none when the batch is unsharded):
//!
//! | Step              | Collectives                                               | Result                         |
//! | ----------------- | --------------------------------------------------------- | ------------------------------ |
//! | layer norm        | `all_gather(H2, od)`, `all_gather(H1, embed)`, `psum(M)`  | `[B, T, E / nM]`               |
//! | projections       | `psum_scatter(M, od)`                                     | `[B, T, H / nH, Q + 2F]` (*)   |
//! | attention         | `all_to_all(H1 H2)` on queries, `psum_scatter(M)` on keys | `[B / (nM nH), T, H, Q]`       |
//! | feed-forward      | `all_gather(M, od)`                                       | `[B, T, H / nH, O]`            |
//! | output projection | `psum_scatter(H1, embed)`, `psum_scatter(H2, od)`         | `[B / nH2, T, E / (nM nH1)]`   |
//!
//! (*) The outer dimension `od` of every intermediate is divided by the number of devices along the axis it was
//! scattered over. With `latency_collectives`, the layer norm gathers the full embedding over `(M, H1)` and the output
//! projection is reduced with a single `psum` over `(H1, H2)` followed by local slicing.

use tracing::trace;

use crate::array::HostArray;
use crate::errors::Error;
use crate::kv_cache::KVCache;
use crate::layers::kernels::{self, AttentionBlock};
use crate::layers::{LayerContext, LayerOutput};
use crate::partitioning::residual_logical_axes;
use crate::resolver::local_shape;
use crate::weights::{check_shape, Layer};

/// Batch dimension of activations.
const BATCH: usize = 0;

/// Time dimension of activations.
const TIME: usize = 1;

/// Embedding dimension of activations.
const EMBED: usize = 2;

/// Head dimension of per-head projections.
const HEADS: usize = 2;

/// Feature dimension of per-head projections.
const FEATURES: usize = 3;

/// Runs one transformer layer on the local shard `x` of the residual stream.
///
/// `x` has the local shape of `[batch, seq_len, embed]` under the residual annotation, `layer` holds the local shards
/// of one layer's weights (with the `layers` axis removed), and `cache` the local shard of that layer's KV cache.
/// The shapes of `x` and `cache` and the cache capacity are checked before any collective is issued, so failures are
/// reported identically on every device.
pub fn transformer_layer_weight_stationary(
    ctx: &LayerContext<'_>,
    layer: &Layer<HostArray>,
    cache: &KVCache<HostArray>,
    x: &HostArray,
) -> LayerOutput {
    let hparams = ctx.hparams;
    let roles = ctx.roles;
    let (m, h1, h2) = (roles.embed, roles.heads_major(), roles.heads_minor());
    let outer = ctx.options.outer_dimension();
    let (batch, seq_len) = (ctx.batch_size(), ctx.seq_len);
    validate_inputs(ctx, cache, x)?;

    let xnorm = allgather_layernorm(ctx, x)?;
    let (rows, time, embed_local) = (xnorm.dim(BATCH)?, xnorm.dim(TIME)?, xnorm.dim(EMBED)?);
    let flat = xnorm.reshape(vec![rows * time, embed_local])?;

    let heads_local = layer.q_wi.dim(0)?;
    let q_wi_width = hparams.q_wi_per_head();
    let q_wi = layer.q_wi.permute(&[1, 0, 2])?.reshape(vec![embed_local, heads_local * q_wi_width])?;
    let projection = flat.matmul(&q_wi)?.reshape(vec![rows, time, heads_local, q_wi_width])?;
    let projection = ctx.round(projection)?;
    let kv = layer.kv.clone().reshape(vec![embed_local, 2 * hparams.qkv()])?;
    let kv = ctx.round(flat.matmul(&kv)?.reshape(vec![rows, time, 2 * hparams.qkv()])?)?;

    let projection = match outer {
        Some(dimension) => ctx.collectives.psum_scatter(&projection, &[m], dimension)?,
        None => ctx.collectives.psum(&projection, &[m])?,
    };
    let (qkv, ff) = (hparams.qkv(), hparams.ff_per_head());
    let q = projection.slice_axis(FEATURES, 0, qkv)?;
    let wi0 = projection.slice_axis(FEATURES, qkv, ff)?;
    let wi1 = projection.slice_axis(FEATURES, qkv + ff, ff)?;

    let (y_att, cache) = if ctx.options.batch_unsharded {
        attention_heads_sharded(ctx, &q, &kv, cache)?
    } else {
        attention_batch_sharded(ctx, &q, &kv, cache)?
    };

    let y_mlp = kernels::swish_gate(&wi0, &wi1)?;
    let y = HostArray::concat(&[y_att, y_mlp], FEATURES)?;
    let y = match outer {
        Some(dimension) => ctx.collectives.all_gather(&y, &[m], dimension)?,
        None => y,
    };
    let (rows, time) = (y.dim(BATCH)?, y.dim(TIME)?);
    let o_wo_width = hparams.o_wo_per_head();
    let o_wo = layer.o_wo.clone().reshape(vec![heads_local * o_wo_width, embed_local])?;
    let output = y.reshape(vec![rows * time, heads_local * o_wo_width])?.matmul(&o_wo)?;
    let output = ctx.round(output.reshape(vec![rows, time, embed_local])?)?;

    let output = if ctx.options.latency_collectives {
        let output = ctx.collectives.psum(&output, &[h1, h2])?;
        let output = output.chunk(EMBED, ctx.collectives.axis_size(&[h1])?, ctx.collectives.axis_index(&[h1])?)?;
        match outer {
            Some(dimension) => {
                output.chunk(dimension, ctx.collectives.axis_size(&[h2])?, ctx.collectives.axis_index(&[h2])?)?
            }
            None => output,
        }
    } else {
        let output = ctx.collectives.psum_scatter(&output, &[h1], EMBED)?;
        match outer {
            Some(dimension) => ctx.collectives.psum_scatter(&output, &[h2], dimension)?,
            None => ctx.collectives.psum(&output, &[h2])?,
        }
    };

    trace!(batch, seq_len, cache_len = cache.cache_len(), "finished transformer layer");
    Ok((x.add(&output)?, cache))
}

/// Checks the local shapes of the residual stream and the cache, and the cache capacity.
fn validate_inputs(ctx: &LayerContext<'_>, cache: &KVCache<HostArray>, x: &HostArray) -> Result<(), Error> {
    let hparams = ctx.hparams;
    let (batch, seq_len) = (ctx.batch_size(), ctx.seq_len);
    let residual_axes = residual_logical_axes(ctx.options.shard_seqlen_vs_batch);
    let expected = local_shape(&[batch, seq_len, hparams.embed()], &residual_axes, ctx.rules, ctx.mesh)?;
    check_shape("residual", x.shape(), &expected, &residual_axes)?;

    let cache_len = cache.cache_len();
    let cache_axes = KVCache::logical_axes();
    let expected_k = local_shape(&[batch, cache_len, hparams.qkv()], &cache_axes.k, ctx.rules, ctx.mesh)?;
    let expected_mask = local_shape(&[batch, cache_len], &cache_axes.mask, ctx.rules, ctx.mesh)?;
    check_shape("kv_cache.k", cache.k.shape(), &expected_k, &cache_axes.k)?;
    check_shape("kv_cache.v", cache.v.shape(), &expected_k, &cache_axes.v)?;
    check_shape("kv_cache.mask", cache.mask.shape(), &expected_mask, &cache_axes.mask)?;

    if cache_len + seq_len > hparams.max_len() {
        return Err(Error::CacheOverflow { cache_len, seq_len, max_len: hparams.max_len() });
    }
    Ok(())
}

/// Layer norm of the local residual shard `x`, returning normalized activations `[B, T, E / nM]` for the full batch
/// and sequence, sharded along the embedding over `M` only.
///
/// The norm statistics are computed from partial sums over the local embedding block and reduced over `M`, so the
/// full embedding is never materialized unless `latency_collectives` is set.
pub fn allgather_layernorm(ctx: &LayerContext<'_>, x: &HostArray) -> Result<HostArray, Error> {
    let roles = ctx.roles;
    let (m, h1, residual) = (roles.embed, roles.heads_major(), roles.residual());
    let x = match ctx.options.outer_dimension() {
        Some(dimension) => ctx.collectives.all_gather(x, &[residual], dimension)?,
        None => x.clone(),
    };
    if ctx.options.latency_collectives {
        let x = ctx.collectives.all_gather(&x, &[m, h1], EMBED)?;
        let normed = kernels::layer_norm(&x)?;
        return Ok(normed.chunk(EMBED, ctx.collectives.axis_size(&[m])?, ctx.collectives.axis_index(&[m])?)?);
    }
    let x = ctx.collectives.all_gather(&x, &[h1], EMBED)?;
    let sums = ctx.collectives.psum(&kernels::moment_sums(&x)?, &[m])?;
    Ok(kernels::normalize(&x, &sums, ctx.hparams.embed())?)
}

/// Attention with the batch sharded over all devices.
///
/// Queries are moved from head-sharded to batch-sharded with all-to-alls, the single key/value head is
/// reduce-scattered over `M` and sliced locally, and the context is moved back to head-sharded afterwards. The local
/// rows are the `iM * nH + iH`-th block of the global batch.
fn attention_batch_sharded(
    ctx: &LayerContext<'_>,
    q: &HostArray,
    kv: &HostArray,
    cache: &KVCache<HostArray>,
) -> Result<(HostArray, KVCache<HostArray>), Error> {
    let collectives = ctx.collectives;
    let roles = ctx.roles;
    let (m, h1, h2) = (roles.embed, roles.heads_major(), roles.heads_minor());
    let sequence_sharded = ctx.options.outer_dimension() == Some(TIME);

    let q = if sequence_sharded { collectives.all_to_all(q, &[m], BATCH, TIME)? } else { q.clone() };
    let q = collectives.all_to_all(&q, &[h1, h2], BATCH, HEADS)?;

    let head_count = collectives.axis_size(&[h1, h2])?;
    let head_index = collectives.axis_index(&[h1, h2])?;
    let kv = collectives.psum_scatter(kv, &[m], BATCH)?.chunk(BATCH, head_count, head_index)?;
    let rows = kv.dim(BATCH)?;
    let first_row = (collectives.axis_index(&[m])? * head_count + head_index) * rows;
    let lengths = &ctx.lengths[first_row..first_row + rows];

    let (context, cache) = attend(ctx, &q, &kv, cache, lengths, 0)?;
    let context = collectives.all_to_all(&context, &[h1, h2], HEADS, BATCH)?;
    let context = if sequence_sharded { collectives.all_to_all(&context, &[m], TIME, BATCH)? } else { context };
    Ok((context, cache))
}

/// Attention with the batch replicated and the heads sharded over `(H1, H2)`.
///
/// The key/value projection is summed over `M` and every device attends for its own heads and every row. When the
/// sequence is sharded over `M`, the local queries start at chunk position `iM * T / nM`.
fn attention_heads_sharded(
    ctx: &LayerContext<'_>,
    q: &HostArray,
    kv: &HostArray,
    cache: &KVCache<HostArray>,
) -> Result<(HostArray, KVCache<HostArray>), Error> {
    let m = ctx.roles.embed;
    let kv = ctx.collectives.psum(kv, &[m])?;
    let query_offset = match ctx.options.outer_dimension() {
        Some(TIME) => ctx.collectives.axis_index(&[m])? * q.dim(TIME)?,
        _ => 0,
    };
    attend(ctx, q, &kv, cache, ctx.lengths, query_offset)
}

/// Attends for a block of rows and appends the new keys and values of those rows to their cache.
fn attend(
    ctx: &LayerContext<'_>,
    q: &HostArray,
    kv: &HostArray,
    cache: &KVCache<HostArray>,
    lengths: &[usize],
    query_offset: usize,
) -> Result<(HostArray, KVCache<HostArray>), Error> {
    let qkv = ctx.hparams.qkv();
    let k = kv.slice_axis(EMBED, 0, qkv)?;
    let v = kv.slice_axis(EMBED, qkv, qkv)?;
    let block = AttentionBlock { q, k: &k, v: &v, cache, lengths, query_offset, sin: ctx.sin, cos: ctx.cos };
    let (context, k) = kernels::multi_query_attention(&block)?;
    let mask = kernels::new_slot_mask(lengths, ctx.seq_len)?;
    let cache = cache.append(&k, &v, &mask, ctx.hparams.max_len())?;
    Ok((ctx.round(context)?, cache))
}

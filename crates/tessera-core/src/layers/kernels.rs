//! Device-local numeric kernels used by the layer functions. None of these communicate.

use candle_core::{DType, Tensor, D};

use crate::array::{ArrayError, HostArray};
use crate::errors::Error;
use crate::kv_cache::{KVCache, VALID_SLOT_THRESHOLD};

/// Epsilon added to the variance before normalizing.
pub const LAYER_NORM_EPSILON: f32 = 1e-6;

/// Score given to keys a query may not attend to. Finite, so that rows without valid keys stay finite.
const MASKED_SCORE: f64 = -1e30;

/// `swish(gate) * linear`, elementwise.
pub fn swish_gate(gate: &HostArray, linear: &HostArray) -> Result<HostArray, ArrayError> {
    HostArray::from_tensor(candle_nn::ops::silu(gate.tensor())?.mul(linear.tensor())?)
}

/// Per-position partial statistics `[batch, time, 2]` of a `[batch, time, embed]` activation: the sum and the sum
/// of squares over the (local) embedding dimension.
pub fn moment_sums(x: &HostArray) -> Result<HostArray, ArrayError> {
    let x = x.tensor();
    let sums = Tensor::cat(&[x.sum_keepdim(D::Minus1)?, x.sqr()?.sum_keepdim(D::Minus1)?], D::Minus1)?;
    HostArray::from_tensor(sums)
}

/// Normalizes every position of `x` `[batch, time, embed_local]` to zero mean and unit variance, given the moment
/// sums of the full embedding (of size `embed`) as computed by [`moment_sums`] and summed over all embedding shards.
pub fn normalize(x: &HostArray, sums: &HostArray, embed: usize) -> Result<HostArray, ArrayError> {
    let embed = embed as f64;
    let mean = (sums.tensor().narrow(D::Minus1, 0, 1)? / embed)?;
    let mean_square = (sums.tensor().narrow(D::Minus1, 1, 1)? / embed)?;
    let variance = (mean_square - mean.sqr()?)?.relu()?;
    let denominator = (variance + LAYER_NORM_EPSILON as f64)?.sqrt()?;
    HostArray::from_tensor(x.tensor().broadcast_sub(&mean)?.broadcast_div(&denominator)?)
}

/// Layer norm over the last dimension of a `[batch, time, embed]` activation that is not sharded along `embed`.
pub fn layer_norm(x: &HostArray) -> Result<HostArray, ArrayError> {
    let x = x.tensor();
    let embed = x.dim(D::Minus1)?;
    let scale = Tensor::ones(embed, DType::F32, x.device())?;
    let bias = Tensor::zeros(embed, DType::F32, x.device())?;
    HostArray::from_tensor(candle_nn::ops::layer_norm(x, &scale, &bias, LAYER_NORM_EPSILON)?)
}

/// Rotates the two halves of the last dimension of `x` (rotate-half convention). `sin` and `cos` hold one angle per
/// pair and must broadcast against either half of `x`.
fn rotate(x: &Tensor, sin: &Tensor, cos: &Tensor) -> candle_core::Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let first = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
    let second = (x2.broadcast_mul(cos)? + x1.broadcast_mul(sin)?)?;
    Tensor::cat(&[&first, &second], D::Minus1)
}

/// Rows of the rotary tables `[max_len, qkv / 2]` at `positions`, reshaped to `shape`.
fn angles(
    sin: &HostArray,
    cos: &HostArray,
    positions: &[usize],
    shape: &[usize],
) -> Result<(Tensor, Tensor), ArrayError> {
    let max_len = sin.dim(0)?;
    if let Some(position) = positions.iter().find(|position| **position >= max_len) {
        return Err(ArrayError::RegionOutOfBounds {
            offsets: vec![*position, 0],
            region_shape: vec![1, sin.dim(1)?],
            shape: sin.shape().to_vec(),
        });
    }
    let index = positions.iter().map(|position| *position as u32).collect::<Vec<_>>();
    let index = Tensor::from_vec(index, positions.len(), sin.tensor().device())?;
    let lookup = |table: &HostArray| table.tensor().index_select(&index, 0)?.reshape(shape);
    Ok((lookup(sin)?, lookup(cos)?))
}

/// Absolute positions of `count` consecutive chunk positions starting at `offset`, for every row whose cache holds
/// `starts[row]` valid slots.
fn positions(starts: &[usize], offset: usize, count: usize) -> Vec<usize> {
    starts.iter().flat_map(|start| (0..count).map(move |j| start + offset + j)).collect()
}

/// Inputs of [`multi_query_attention`] for a block of batch rows.
pub struct AttentionBlock<'a> {
    /// Queries `[rows, query_len, heads, qkv]`, not yet rotated.
    pub q: &'a HostArray,

    /// New keys `[rows, seq_len, qkv]` for every position of the chunk, not yet rotated.
    pub k: &'a HostArray,

    /// New values `[rows, seq_len, qkv]`.
    pub v: &'a HostArray,

    /// Cache rows `[rows, cache_len, ...]` matching `q`. Cached keys are already rotated.
    pub cache: &'a KVCache<HostArray>,

    /// Number of real tokens of every row of the chunk.
    pub lengths: &'a [usize],

    /// Chunk position of the first query.
    pub query_offset: usize,

    pub sin: &'a HostArray,
    pub cos: &'a HostArray,
}

/// Multi-query attention of a block of rows over their cache and the new keys of the chunk.
///
/// Tokens are positioned after the valid slots of their row's cache. A query at chunk position `t` attends to valid
/// cache slots and to new positions `j <= t` with `j < length`. Rows with nothing to attend to produce zeros.
///
/// Returns the attention context `[rows, query_len, heads, qkv]` and the rotated new keys `[rows, seq_len, qkv]`.
pub fn multi_query_attention(block: &AttentionBlock<'_>) -> Result<(HostArray, HostArray), Error> {
    let (rows, query_len, heads, qkv) = (block.q.dim(0)?, block.q.dim(1)?, block.q.dim(2)?, block.q.dim(3)?);
    let seq_len = block.k.dim(1)?;
    let cache_len = block.cache.cache_len();
    let starts = block.cache.valid_lengths()?;
    let half = qkv / 2;

    let (sin, cos) = angles(block.sin, block.cos, &positions(&starts, 0, seq_len), &[rows, seq_len, half])?;
    let k = rotate(block.k.tensor(), &sin, &cos)?;
    let query_positions = positions(&starts, block.query_offset, query_len);
    let (sin, cos) = angles(block.sin, block.cos, &query_positions, &[rows, query_len, 1, half])?;
    let q = rotate(block.q.tensor(), &sin, &cos)?.reshape((rows, query_len * heads, qkv))?;

    let (keys, values) = if cache_len == 0 {
        (k.clone(), block.v.tensor().clone())
    } else {
        (
            Tensor::cat(&[block.cache.k.tensor(), &k], 1)?,
            Tensor::cat(&[block.cache.v.tensor(), block.v.tensor()], 1)?,
        )
    };
    let scores = (q.matmul(&keys.t()?.contiguous()?)? * (1.0 / (qkv as f64).sqrt()))?;

    let cache_mask = block.cache.mask.to_vec()?;
    let visible = HostArray::<u8>::from_fn(vec![rows, query_len * heads, cache_len + seq_len], |index| {
        let (row, slot) = (index[0], index[2]);
        let visible = match slot.checked_sub(cache_len) {
            None => f64::from(cache_mask[row * cache_len + slot]) > VALID_SLOT_THRESHOLD,
            Some(j) => j <= block.query_offset + index[1] / heads && j < block.lengths[row],
        };
        u8::from(visible)
    })?;
    let visible = visible.tensor();
    let scores = visible.where_cond(&scores, &(scores.ones_like()? * MASKED_SCORE)?)?;
    let weights = (candle_nn::ops::softmax_last_dim(&scores)? * visible.to_dtype(DType::F32)?)?;
    let context = weights.matmul(&values)?.reshape((rows, query_len, heads, qkv))?;
    Ok((HostArray::from_tensor(context)?, HostArray::from_tensor(k)?))
}

/// Validity mask `[rows, seq_len]` of the new cache slots of a block of rows.
pub fn new_slot_mask(lengths: &[usize], seq_len: usize) -> Result<HostArray, ArrayError> {
    HostArray::from_fn(vec![lengths.len(), seq_len], |index| if index[1] < lengths[index[0]] { 1.0 } else { 0.0 })
}

//! Per-device transformer layers.
//!
//! A layer function receives a [`LayerContext`], the local shard of one layer's weights, the local shard of that
//! layer's KV cache, and the local shard of the residual stream. It returns the updated residual shard and the
//! extended cache shard. All communication happens through [`LayerContext::collectives`].

pub mod kernels;
pub mod two_d_parallel;

pub use two_d_parallel::{allgather_layernorm, transformer_layer_weight_stationary};

use crate::array::HostArray;
use crate::errors::Error;
use crate::hparams::HParams;
use crate::inference::InferenceOptions;
use crate::kv_cache::KVCache;
use crate::partitioning::{MeshRoles, RuleTable};
use crate::runtime::Collectives;
use crate::sharding::Mesh;
use crate::weights::Layer;

/// Result of a layer function: the updated residual shard and the extended KV cache shard.
pub type LayerOutput = Result<(HostArray, KVCache<HostArray>), Error>;

/// Everything a layer function needs besides its weights, cache, and activations.
#[derive(Copy, Clone)]
pub struct LayerContext<'a> {
    pub collectives: &'a dyn Collectives,
    pub mesh: &'a Mesh,
    pub hparams: &'a HParams,
    pub rules: &'a RuleTable,
    pub roles: MeshRoles,
    pub options: &'a InferenceOptions,

    /// Number of real tokens of every row of the (global) chunk.
    pub lengths: &'a [usize],

    /// Number of positions of every row of the chunk, padding included.
    pub seq_len: usize,

    /// Rotary tables `[max_len, qkv / 2]`, replicated on every device.
    pub sin: &'a HostArray,
    pub cos: &'a HostArray,
}

impl LayerContext<'_> {
    /// Global batch size of the chunk.
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Rounds `x` through the intermediate data type.
    pub fn round(&self, x: HostArray) -> Result<HostArray, Error> {
        match self.options.intermediate_dtype {
            crate::types::DataType::Float32 => Ok(x),
            data_type => Ok(x.round_to(data_type)?),
        }
    }
}

/// Signature shared by all layer functions, e.g. [`transformer_layer_weight_stationary`].
pub trait LayerFn: Fn(&LayerContext<'_>, &Layer<HostArray>, &KVCache<HostArray>, &HostArray) -> LayerOutput + Sync {}

impl<F> LayerFn for F where
    F: Fn(&LayerContext<'_>, &Layer<HostArray>, &KVCache<HostArray>, &HostArray) -> LayerOutput + Sync
{
}

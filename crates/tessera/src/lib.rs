pub use tessera_core as core;

pub use tessera_core::array::HostArray;
pub use tessera_core::chunk::{Chunk, FullChunkResult, OutputMode};
pub use tessera_core::config::{Config, MeshConfig};
pub use tessera_core::errors::Error;
pub use tessera_core::export::{ProgramSignature, ProgramValue};
pub use tessera_core::hparams::HParams;
pub use tessera_core::inference::{infer, InferenceEngine, InferenceOptions};
pub use tessera_core::kv_cache::KVCache;
pub use tessera_core::layers::{transformer_layer_weight_stationary, LayerContext, LayerFn};
pub use tessera_core::parameters::{Parameter, Parameterized, Placeholder};
pub use tessera_core::partitioning::{build_rules, AttnAllToAll, LogicalAxes, MeshRoles, RuleTable};
pub use tessera_core::resolver::{assemble, distribute, local_shape, resolve};
pub use tessera_core::sharding::Mesh;
pub use tessera_core::types::DataType;
pub use tessera_core::weights::{Layer, Weights};

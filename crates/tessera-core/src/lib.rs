pub mod array;
pub mod chunk;
pub mod config;
pub mod errors;
pub mod export;
pub mod hparams;
pub mod inference;
pub mod kv_cache;
pub mod layers;
pub mod parameters;
pub mod partitioning;
pub mod resolver;
pub mod runtime;
pub mod sharding;
pub mod types;
pub mod weights;

//! TOML configuration of a model, its execution policy, and its mesh.
//!
//! ```toml
//! [model]
//! layers = 8
//! embed = 16
//! ff = 32
//! heads = 16
//! qkv = 4
//! max_len = 256
//! vocab = 1024
//!
//! [inference]
//! attn_all_to_all = "axes_yzx"
//! latency_collectives = true
//! intermediate_dtype = "bf16"
//!
//! [mesh]
//! x = 2
//! y = 2
//! z = 2
//! ```
//!
//! Only `[model]` is required. Every [`InferenceOptions`] field defaults to its [`Default`] value and the mesh
//! defaults to a single device.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::array::HostArray;
use crate::errors::Error;
use crate::hparams::HParams;
use crate::inference::{InferenceEngine, InferenceOptions};
use crate::partitioning::{MESH_X, MESH_Y, MESH_Z};
use crate::sharding::Mesh;
use crate::weights::Weights;

/// Sizes of the `x`, `y`, and `z` mesh axes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

impl MeshConfig {
    /// Builds a single-process mesh with these axis sizes.
    pub fn build(&self) -> Result<Mesh, Error> {
        Ok(Mesh::grid(&[(MESH_X, self.x), (MESH_Y, self.y), (MESH_Z, self.z)])?)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub model: HParams,

    #[serde(default)]
    pub inference: InferenceOptions,

    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self, Error> {
        let config = toml::from_str::<Self>(source).map_err(|error| Error::Config { message: error.to_string() })?;
        debug!(?config, "parsed configuration");
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|error| Error::Config { message: format!("failed to read '{}': {error}", path.display()) })?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string(self).map_err(|error| Error::Config { message: error.to_string() })
    }

    /// Builds the configured mesh and distributes `weights` over it.
    pub fn engine(&self, weights: &Weights<HostArray>) -> Result<InferenceEngine, Error> {
        InferenceEngine::new(self.mesh.build()?, self.model, weights, self.inference)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::chunk::OutputMode;
    use crate::partitioning::AttnAllToAll;
    use crate::types::DataType;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(indoc! {"
            [model]
            layers = 2
            embed = 16
            ff = 32
            heads = 4
            qkv = 8
            max_len = 64
            vocab = 128
        "})
        .unwrap();
        assert_eq!(config.model, HParams::new(2, 16, 32, 4, 8, 64, 128).unwrap());
        assert_eq!(config.inference, InferenceOptions::default());
        assert_eq!(config.inference.attn_all_to_all, AttnAllToAll::AxesXYZ);
        assert_eq!(config.inference.intermediate_dtype, DataType::Float32);
        assert_eq!(config.inference.output_mode, OutputMode::Logits);
        assert_eq!(config.mesh.build().unwrap().shape().unwrap(), (1, 1, 1));
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(indoc! {r#"
            [model]
            layers = 8
            embed = 16
            ff = 32
            heads = 16
            qkv = 4
            max_len = 256
            vocab = 1024

            [inference]
            attention_strategy = "axes_zyx"
            batch_unsharded = true
            shard_seqlen_vs_batch = true
            intermediate_dtype = "bf16"
            output_mode = "activations"

            [mesh]
            x = 2
            z = 4
        "#})
        .unwrap();
        assert_eq!(config.inference.attn_all_to_all, AttnAllToAll::AxesZYX);
        assert!(config.inference.batch_unsharded && config.inference.shard_seqlen_vs_batch);
        assert!(!config.inference.latency_collectives);
        assert_eq!(config.inference.intermediate_dtype, DataType::BFloat16);
        assert_eq!(config.inference.output_mode, OutputMode::Activations);
        assert_eq!(config.mesh, MeshConfig { x: 2, y: 1, z: 4 });
        assert_eq!(Config::from_toml_str(&config.to_toml_string().unwrap()).unwrap(), config);
    }

    #[test]
    fn test_invalid_configs() {
        let invalid_model = indoc! {"
            [model]
            layers = 2
            embed = 16
            ff = 30
            heads = 4
            qkv = 8
            max_len = 64
            vocab = 128
        "};
        assert!(matches!(
            Config::from_toml_str(invalid_model),
            Err(Error::Config { message }) if message.contains("divisible"),
        ));

        let unknown_field = indoc! {r#"
            [model]
            layers = 2
            embed = 16
            ff = 32
            heads = 4
            qkv = 8
            max_len = 64
            vocab = 128

            [inference]
            attn_all_to_all = "axes_xyz"
            pipeline = true
        "#};
        assert!(matches!(
            Config::from_toml_str(unknown_field),
            Err(Error::Config { message }) if message.contains("pipeline"),
        ));
        assert!(matches!(
            Config::from_toml_str("[mesh]\nx = 2\n"),
            Err(Error::Config { message }) if message.contains("model"),
        ));
        assert!(matches!(Config::from_file("/nonexistent/tessera.toml"), Err(Error::Config { .. })));
    }
}

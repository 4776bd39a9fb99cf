//! Program signatures for external staging tooling.
//!
//! A [`ProgramSignature`] lists every argument and result of one of the two programs of the inference stack, `init`
//! (which produces the weights and an input chunk) and `forward` (which consumes weights, caches, and a chunk), with
//! its global [`ArrayType`] and resolved [`NamedSharding`]. Signatures render as MLIR function signatures whose
//! arguments and results carry Shardy `#sdy.sharding` attributes:
//!
//! ```text
//! sdy.mesh @mesh = <["x"=2, "y"=2, "z"=2]>
//! func.func @forward(
//!     %arg0: tensor<8x16x16x8xf32> {sdy.sharding = #sdy.sharding<@mesh, [{}, {"y", "z"}, {"x"}, {}]>, ...},
//!     ...
//! ) -> (...)
//! ```

use crate::chunk::{Chunk, FullChunkResult};
use crate::errors::Error;
use crate::hparams::HParams;
use crate::inference::InferenceOptions;
use crate::kv_cache::KVCache;
use crate::parameters::Parameterized;
use crate::partitioning::{LogicalAxes, RuleTable};
use crate::resolver::{local_shape, named_shardings, resolve};
use crate::sharding::{Mesh, NamedSharding};
use crate::types::{ArrayType, DataType};
use crate::weights::Weights;

/// One argument or result of a program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramValue {
    /// Path of the value in its container (e.g., `weights.layer.q_wi` or `kv_caches[3].mask`).
    pub name: String,
    pub array_type: ArrayType,
    pub sharding: NamedSharding,
}

impl ProgramValue {
    /// MLIR tensor type of this value (e.g., `tensor<8x16xf32>`).
    pub fn mlir_type(&self) -> String {
        let ArrayType { data_type, shape } = &self.array_type;
        let dimensions = shape.iter().map(|size| format!("{size}x")).collect::<String>();
        format!("tensor<{dimensions}{}>", mlir_element_type(*data_type))
    }

    fn render(&self, mesh_symbol_name: &str) -> Result<String, Error> {
        let sharding = self.sharding.to_shardy_tensor_sharding_attribute(mesh_symbol_name)?;
        Ok(format!("{} {{sdy.sharding = {sharding}, tessera.name = \"{}\"}}", self.mlir_type(), self.name))
    }
}

fn mlir_element_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::UInt32 => "ui32",
        DataType::BFloat16 => "bf16",
        DataType::Float16 => "f16",
        DataType::Float32 => "f32",
    }
}

/// Arguments and results of one program, with their global types and shardings over one mesh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramSignature {
    pub name: String,
    pub mesh: Mesh,
    pub arguments: Vec<ProgramValue>,
    pub results: Vec<ProgramValue>,
}

impl ProgramSignature {
    /// Signature of the program that initializes the weights and an input chunk of `batch` rows of `seq_len` tokens.
    pub fn init(
        mesh: &Mesh,
        hparams: &HParams,
        options: &InferenceOptions,
        batch: usize,
        seq_len: usize,
    ) -> Result<Self, Error> {
        let rules = options.rules()?;
        let mut results = weight_values(mesh, hparams, options, &rules)?;
        results.extend(chunk_values(mesh, &rules, batch, seq_len)?);
        Ok(Self { name: "init".to_string(), mesh: mesh.clone(), arguments: Vec::new(), results })
    }

    /// Signature of the forward program for `batch` rows of `seq_len` tokens given caches holding `cache_len` slots.
    ///
    /// Fails with [`Error::CacheOverflow`] if the caches cannot hold the chunk, and with [`Error::ShapeMismatch`] if
    /// a sharded dimension of any argument or result does not divide evenly.
    pub fn forward(
        mesh: &Mesh,
        hparams: &HParams,
        options: &InferenceOptions,
        batch: usize,
        seq_len: usize,
        cache_len: usize,
    ) -> Result<Self, Error> {
        if cache_len + seq_len > hparams.max_len() {
            return Err(Error::CacheOverflow { cache_len, seq_len, max_len: hparams.max_len() });
        }
        let rules = options.rules()?;
        let mut arguments = weight_values(mesh, hparams, options, &rules)?;
        arguments.extend(cache_values(mesh, hparams, &rules, batch, cache_len)?);
        arguments.extend(chunk_values(mesh, &rules, batch, seq_len)?);

        let output_mode = options.output_mode;
        let result = FullChunkResult::shapes(hparams, batch, seq_len, output_mode);
        let result_axes = FullChunkResult::logical_axes(output_mode);
        let mut results = values(mesh, &rules, &["result.logits"], &result, &result_axes)?;
        results.extend(cache_values(mesh, hparams, &rules, batch, cache_len + seq_len)?);
        Ok(Self { name: "forward".to_string(), mesh: mesh.clone(), arguments, results })
    }

    /// Renders the mesh declaration and the function signature of this program.
    pub fn to_mlir(&self, mesh_symbol_name: &str) -> Result<String, Error> {
        let mut rendered = self.mesh.to_shardy_mesh_operation(mesh_symbol_name)?;
        rendered.push_str(&format!("\nfunc.func @{}(", self.name));
        for (index, argument) in self.arguments.iter().enumerate() {
            rendered.push_str(&format!("\n    %arg{index}: {},", argument.render(mesh_symbol_name)?));
        }
        if !self.arguments.is_empty() {
            rendered.push('\n');
        }
        rendered.push_str(") -> (");
        for result in &self.results {
            rendered.push_str(&format!("\n    {},", result.render(mesh_symbol_name)?));
        }
        rendered.push_str("\n)");
        Ok(rendered)
    }
}

/// Program values for the leaves of a container, named by `names` in traversal order.
fn values<C: Parameterized<LogicalAxes>>(
    mesh: &Mesh,
    rules: &RuleTable,
    names: &[&str],
    array_types: &C::To<ArrayType>,
    logical_axes: &C,
) -> Result<Vec<ProgramValue>, Error> {
    let leaves = logical_axes.params();
    for ((name, array_type), axes) in names.iter().zip(array_types.params()).zip(&leaves) {
        rules.check_conflicts(name, axes)?;
        local_shape(&array_type.shape, axes, rules, mesh)?;
    }
    let shardings = named_shardings(&resolve(logical_axes, rules)?, mesh)?;
    Ok(names
        .iter()
        .zip(array_types.params())
        .zip(shardings.into_params())
        .map(|((name, array_type), sharding)| ProgramValue {
            name: name.to_string(),
            array_type: array_type.clone(),
            sharding,
        })
        .collect())
}

fn weight_values(
    mesh: &Mesh,
    hparams: &HParams,
    options: &InferenceOptions,
    rules: &RuleTable,
) -> Result<Vec<ProgramValue>, Error> {
    let names = [
        "weights.layer.q_wi",
        "weights.layer.kv",
        "weights.layer.o_wo",
        "weights.sin",
        "weights.cos",
        "weights.embedding",
    ];
    let weights = Weights::shapes(hparams, options.intermediate_dtype);
    values(mesh, rules, &names, &weights, &Weights::logical_axes())
}

fn chunk_values(mesh: &Mesh, rules: &RuleTable, batch: usize, seq_len: usize) -> Result<Vec<ProgramValue>, Error> {
    let chunk = Chunk::shapes(batch, seq_len);
    values(mesh, rules, &["chunk.tokens", "chunk.lengths"], &chunk, &Chunk::logical_axes())
}

fn cache_values(
    mesh: &Mesh,
    hparams: &HParams,
    rules: &RuleTable,
    batch: usize,
    cache_len: usize,
) -> Result<Vec<ProgramValue>, Error> {
    let cache = KVCache::shapes(batch, cache_len, hparams.qkv());
    let axes = KVCache::logical_axes();
    let mut cache_values = Vec::with_capacity(3 * hparams.layers());
    for layer in 0..hparams.layers() {
        let names = ["k", "v", "mask"].map(|field| format!("kv_caches[{layer}].{field}"));
        let names = names.iter().map(String::as_str).collect::<Vec<_>>();
        cache_values.extend(values(mesh, rules, &names, &cache, &axes)?);
    }
    Ok(cache_values)
}

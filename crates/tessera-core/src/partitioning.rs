//! Logical-to-physical partitioning rules.
//!
//! Tensors are annotated with _logical_ axis names (e.g., `params_heads`, `residual_embed`) that say what a dimension
//! means, not where it lives. A [`RuleTable`] maps every logical axis name onto zero or more _mesh_ axes, and the
//! [resolver](crate::resolver) applies it to whole containers of annotations.
//!
//! The rule table used for 2D weight-stationary inference is produced by [`build_rules`] from an [`AttnAllToAll`]
//! strategy. The strategy is first resolved into [`MeshRoles`], which assign each of the three mesh axes one of the
//! following roles:
//!
//! | Role | Mesh axis | Shards |
//! |---|---|---|
//! | `M` ([`MeshRoles::embed`]) | `p0` | the embedding dimension of the weights |
//! | `H1`, `H2` ([`MeshRoles::heads`]) | `p1`, `p2` | the head and vocabulary dimensions of the weights |
//!
//! The resulting rules are:
//!
//! | Logical axis | Mesh axes | With `batch_unsharded` |
//! |---|---|---|
//! | [`LAYERS`], [`QKV`], [`TIME`] | replicated | |
//! | [`PARAMS_HEADS`], [`PARAMS_VOCAB`], [`HEADS`], [`VOCAB`] | `(H1, H2)` | |
//! | [`PARAMS_EMBED`], [`PARAMS_KV_EMBED`], [`EMBEDDING_EMBED`] | `M` | |
//! | [`RESIDUAL_BATCH`] | `H2` | replicated |
//! | [`RESIDUAL_TIME`] | `H2` | |
//! | [`RESIDUAL_EMBED`] | `(M, H1)` | |
//! | [`ATTN_BATCH`] | `(M, H1, H2)` | replicated |
//! | [`LOGIT_BATCH`] | `M` | replicated |

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::{Chunk, FullChunkResult, OutputMode};
use crate::errors::Error;
use crate::kv_cache::KVCache;
use crate::parameters::Parameter;
use crate::sharding::{PartitionDimension, PartitionSpec};
use crate::weights::Weights;

/// Conventional name of the first mesh axis.
pub const MESH_X: &str = "x";

/// Conventional name of the second mesh axis.
pub const MESH_Y: &str = "y";

/// Conventional name of the third mesh axis.
pub const MESH_Z: &str = "z";

pub const LAYERS: &str = "layers";
pub const PARAMS_HEADS: &str = "params_heads";
pub const PARAMS_EMBED: &str = "params_embed";
pub const PARAMS_KV_EMBED: &str = "params_kv_embed";
pub const PARAMS_VOCAB: &str = "params_vocab";
pub const EMBEDDING_EMBED: &str = "embedding_embed";
pub const HEADS: &str = "heads";
pub const QKV: &str = "qkv";
pub const TIME: &str = "time";
pub const RESIDUAL_BATCH: &str = "residual_batch";
pub const RESIDUAL_TIME: &str = "residual_time";
pub const RESIDUAL_EMBED: &str = "residual_embed";
pub const ATTN_BATCH: &str = "attn_batch";
pub const LOGIT_BATCH: &str = "logit_batch";
pub const VOCAB: &str = "vocab";

// ---------------------------------------------------------------------------
// Strategies and roles
// ---------------------------------------------------------------------------

/// Order of the mesh axes over which the attention batch is sharded after the query all-to-all.
///
/// The first axis of the permutation shards the embedding dimension of the weights and the remaining two shard the
/// heads (see [`AttnAllToAll::roles`]).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttnAllToAll {
    #[default]
    #[serde(rename = "axes_xyz")]
    AxesXYZ,
    #[serde(rename = "axes_xzy")]
    AxesXZY,
    #[serde(rename = "axes_yxz")]
    AxesYXZ,
    #[serde(rename = "axes_yzx")]
    AxesYZX,
    #[serde(rename = "axes_zxy")]
    AxesZXY,
    #[serde(rename = "axes_zyx")]
    AxesZYX,
}

impl AttnAllToAll {
    /// All six strategies.
    pub const ALL: [AttnAllToAll; 6] = [
        AttnAllToAll::AxesXYZ,
        AttnAllToAll::AxesXZY,
        AttnAllToAll::AxesYXZ,
        AttnAllToAll::AxesYZX,
        AttnAllToAll::AxesZXY,
        AttnAllToAll::AxesZYX,
    ];

    /// Mesh axes named by this strategy, in order.
    pub fn axes(&self) -> [&'static str; 3] {
        match self {
            AttnAllToAll::AxesXYZ => [MESH_X, MESH_Y, MESH_Z],
            AttnAllToAll::AxesXZY => [MESH_X, MESH_Z, MESH_Y],
            AttnAllToAll::AxesYXZ => [MESH_Y, MESH_X, MESH_Z],
            AttnAllToAll::AxesYZX => [MESH_Y, MESH_Z, MESH_X],
            AttnAllToAll::AxesZXY => [MESH_Z, MESH_X, MESH_Y],
            AttnAllToAll::AxesZYX => [MESH_Z, MESH_Y, MESH_X],
        }
    }

    /// Resolves this strategy into the roles played by each mesh axis.
    pub fn roles(&self) -> MeshRoles {
        let [embed, heads_major, heads_minor] = self.axes();
        MeshRoles { embed, heads: (heads_major, heads_minor) }
    }
}

impl Display for AttnAllToAll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.axes().concat();
        write!(f, "axes_{name}")
    }
}

/// Roles of the three mesh axes under an [`AttnAllToAll`] strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshRoles {
    /// Axis `M`, which shards the embedding dimension of the weights. Partial sums over it are reduce-scattered.
    pub embed: &'static str,

    /// Axes `(H1, H2)`, which shard the head and vocabulary dimensions of the weights (major to minor).
    pub heads: (&'static str, &'static str),
}

impl MeshRoles {
    /// Axis `H1`.
    pub fn heads_major(&self) -> &'static str {
        self.heads.0
    }

    /// Axis `H2`.
    pub fn heads_minor(&self) -> &'static str {
        self.heads.1
    }

    /// Axes `(H1, H2)`.
    pub fn head_axes(&self) -> [&'static str; 2] {
        [self.heads.0, self.heads.1]
    }

    /// Axis `R` sharding the batch (or time) dimension of residual activations.
    pub fn residual(&self) -> &'static str {
        self.heads.1
    }

    /// Axes `(M, H1)` sharding the embedding dimension of residual activations.
    pub fn residual_embed(&self) -> [&'static str; 2] {
        [self.embed, self.heads.0]
    }

    /// Axes `(M, H1, H2)` sharding the batch dimension of the attention computation.
    pub fn attn_batch(&self) -> [&'static str; 3] {
        [self.embed, self.heads.0, self.heads.1]
    }
}

// ---------------------------------------------------------------------------
// Logical axes
// ---------------------------------------------------------------------------

/// Logical axis annotation of one tensor: one optional logical axis name per dimension. `None` dimensions are
/// always replicated.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogicalAxes(Vec<Option<String>>);

impl LogicalAxes {
    /// Creates an annotation from per-dimension logical axis names.
    ///
    /// ```rust
    /// # use tessera_core::partitioning::{LogicalAxes, LAYERS};
    /// let axes = LogicalAxes::new(&[Some(LAYERS), None]);
    /// assert_eq!(axes.to_string(), "P('layers', None)");
    /// ```
    pub fn new(axes: &[Option<&str>]) -> Self {
        Self(axes.iter().map(|axis| axis.map(str::to_string)).collect())
    }

    /// Creates an annotation for a tensor of rank `rank` whose dimensions are all replicated.
    pub fn replicated(rank: usize) -> Self {
        Self(vec![None; rank])
    }

    /// Rank of the annotated tensor.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Logical axis name of each dimension.
    pub fn names(&self) -> impl Iterator<Item = Option<&str>> + '_ {
        self.0.iter().map(|axis| axis.as_deref())
    }

    /// Logical axis name of dimension `dimension`, or [`None`] if the dimension is replicated or out of range.
    pub fn name(&self, dimension: usize) -> Option<&str> {
        self.0.get(dimension).and_then(|axis| axis.as_deref())
    }

    /// Label used in error messages for dimension `dimension`.
    pub(crate) fn label(&self, dimension: usize) -> String {
        self.name(dimension).map(str::to_string).unwrap_or_else(|| format!("<dimension {dimension}>"))
    }
}

impl Parameter for LogicalAxes {}

impl Display for LogicalAxes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let axes = self
            .names()
            .map(|axis| axis.map(|name| format!("'{name}'")).unwrap_or_else(|| "None".to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "P({axes})")
    }
}

// ---------------------------------------------------------------------------
// Rule tables
// ---------------------------------------------------------------------------

/// Immutable mapping from logical axis names to physical [`PartitionDimension`]s.
///
/// Rule tables are validated at construction: every tensor annotation known to the inference stack (see
/// [`known_annotations`]) must resolve without referencing an unknown logical axis, and without two distinct logical
/// axes of the same tensor landing on the same mesh axis.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleTable {
    rules: BTreeMap<String, PartitionDimension>,
}

impl RuleTable {
    /// Creates a validated rule table from `(logical_axis, partition_dimension)` pairs. Later pairs override earlier
    /// ones for the same logical axis.
    pub fn from_rules<I, N>(rules: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (N, PartitionDimension)>,
        N: Into<String>,
    {
        let table = Self { rules: rules.into_iter().map(|(name, dimension)| (name.into(), dimension)).collect() };
        for (tensor, axes) in known_annotations() {
            table.check_conflicts(tensor, &axes)?;
        }
        Ok(table)
    }

    /// Returns the rule for `logical_axis`, if any.
    pub fn get(&self, logical_axis: &str) -> Option<&PartitionDimension> {
        self.rules.get(logical_axis)
    }

    /// Iterates over all rules in logical axis name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PartitionDimension)> {
        self.rules.iter().map(|(name, dimension)| (name.as_str(), dimension))
    }

    /// Number of rules in this table.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if this table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Mesh axes that `logical_axis` is sharded over. `None` resolves to no mesh axes.
    pub fn mesh_axes(&self, logical_axis: Option<&str>) -> Result<&[String], Error> {
        match logical_axis {
            None => Ok(&[]),
            Some(name) => self
                .rules
                .get(name)
                .map(PartitionDimension::mesh_axes)
                .ok_or_else(|| Error::UnknownLogicalAxis { axis_name: name.to_string() }),
        }
    }

    /// Resolves one tensor annotation into its [`PartitionSpec`].
    pub fn partition_spec(&self, axes: &LogicalAxes) -> Result<PartitionSpec, Error> {
        let dimensions = axes
            .names()
            .map(|axis| self.mesh_axes(axis).map(|mesh_axes| PartitionDimension::sharded_by(mesh_axes.iter().cloned())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PartitionSpec::new(dimensions))
    }

    /// Checks that no two distinct logical axes of `axes` resolve onto the same mesh axis.
    pub fn check_conflicts(&self, tensor: &str, axes: &LogicalAxes) -> Result<(), Error> {
        let mut owners = BTreeMap::<&str, &str>::new();
        for logical_axis in axes.names().flatten() {
            for mesh_axis in self.mesh_axes(Some(logical_axis))? {
                match owners.get(mesh_axis.as_str()) {
                    Some(owner) if *owner != logical_axis => {
                        return Err(Error::PartitioningConflict {
                            tensor: tensor.to_string(),
                            mesh_axis: mesh_axis.clone(),
                            first_logical_axis: owner.to_string(),
                            second_logical_axis: logical_axis.to_string(),
                        });
                    }
                    _ => {
                        owners.insert(mesh_axis.as_str(), logical_axis);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Builds the rule table for 2D weight-stationary inference under `strategy`. When `batch_unsharded` is set, every
/// batch-like logical axis is replicated.
pub fn build_rules(strategy: AttnAllToAll, batch_unsharded: bool) -> Result<RuleTable, Error> {
    let roles = strategy.roles();
    let batch = |axes: &[&str]| {
        if batch_unsharded {
            PartitionDimension::Unsharded
        } else {
            PartitionDimension::sharded_by(axes.iter().copied())
        }
    };
    let rules = [
        (LAYERS, PartitionDimension::Unsharded),
        (PARAMS_HEADS, PartitionDimension::sharded_by(roles.head_axes())),
        (PARAMS_EMBED, PartitionDimension::sharded(roles.embed)),
        (PARAMS_KV_EMBED, PartitionDimension::sharded(roles.embed)),
        (PARAMS_VOCAB, PartitionDimension::sharded_by(roles.head_axes())),
        (EMBEDDING_EMBED, PartitionDimension::sharded(roles.embed)),
        (HEADS, PartitionDimension::sharded_by(roles.head_axes())),
        (QKV, PartitionDimension::Unsharded),
        (TIME, PartitionDimension::Unsharded),
        (RESIDUAL_BATCH, batch(&[roles.residual()])),
        (RESIDUAL_TIME, PartitionDimension::sharded(roles.residual())),
        (RESIDUAL_EMBED, PartitionDimension::sharded_by(roles.residual_embed())),
        (ATTN_BATCH, batch(&roles.attn_batch())),
        (LOGIT_BATCH, batch(&[roles.embed])),
        (VOCAB, PartitionDimension::sharded_by(roles.head_axes())),
    ];
    let table = RuleTable::from_rules(rules)?;
    debug!(%strategy, batch_unsharded, rule_count = table.len(), "built partitioning rules");
    Ok(table)
}

/// Logical annotation of residual activations `[batch, time, embed]`. With `shard_seqlen_vs_batch` the time dimension
/// is sharded instead of the batch dimension.
pub fn residual_logical_axes(shard_seqlen_vs_batch: bool) -> LogicalAxes {
    if shard_seqlen_vs_batch {
        LogicalAxes::new(&[None, Some(RESIDUAL_TIME), Some(RESIDUAL_EMBED)])
    } else {
        LogicalAxes::new(&[Some(RESIDUAL_BATCH), Some(TIME), Some(RESIDUAL_EMBED)])
    }
}

/// Every tensor annotation used by the inference stack, labeled with the tensor it annotates.
pub fn known_annotations() -> Vec<(&'static str, LogicalAxes)> {
    let weights = Weights::logical_axes();
    let chunk = Chunk::logical_axes();
    let cache = KVCache::logical_axes();
    vec![
        ("weights.layer.q_wi", weights.layer.q_wi),
        ("weights.layer.kv", weights.layer.kv),
        ("weights.layer.o_wo", weights.layer.o_wo),
        ("weights.sin", weights.sin),
        ("weights.cos", weights.cos),
        ("weights.embedding", weights.embedding),
        ("chunk.tokens", chunk.tokens),
        ("chunk.lengths", chunk.lengths),
        ("result.logits", FullChunkResult::logical_axes(OutputMode::Logits).logits),
        ("result.activations", FullChunkResult::logical_axes(OutputMode::Activations).logits),
        ("kv_cache.k", cache.k),
        ("kv_cache.v", cache.v),
        ("kv_cache.mask", cache.mask),
        ("residual", residual_logical_axes(false)),
        ("residual.sequence_sharded", residual_logical_axes(true)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_roles() {
        let roles = AttnAllToAll::AxesXYZ.roles();
        assert_eq!(roles, MeshRoles { embed: "x", heads: ("y", "z") });
        assert_eq!(roles.residual(), "z");
        assert_eq!(roles.residual_embed(), ["x", "y"]);
        assert_eq!(roles.attn_batch(), ["x", "y", "z"]);
        assert_eq!(AttnAllToAll::AxesZXY.roles(), MeshRoles { embed: "z", heads: ("x", "y") });
        assert_eq!(AttnAllToAll::AxesYZX.to_string(), "axes_yzx");
    }

    #[test]
    fn test_default_rules() {
        let rules = build_rules(AttnAllToAll::AxesXYZ, false).unwrap();
        assert_eq!(rules.len(), 15);
        assert_eq!(rules.get(LAYERS), Some(&PartitionDimension::Unsharded));
        assert_eq!(rules.get(PARAMS_HEADS), Some(&PartitionDimension::sharded_by(["y", "z"])));
        assert_eq!(rules.get(PARAMS_EMBED), Some(&PartitionDimension::sharded("x")));
        assert_eq!(rules.get(RESIDUAL_BATCH), Some(&PartitionDimension::sharded("z")));
        assert_eq!(rules.get(RESIDUAL_EMBED), Some(&PartitionDimension::sharded_by(["x", "y"])));
        assert_eq!(rules.get(ATTN_BATCH), Some(&PartitionDimension::sharded_by(["x", "y", "z"])));
        assert_eq!(rules.get(LOGIT_BATCH), Some(&PartitionDimension::sharded("x")));
    }

    #[test]
    fn test_batch_unsharded_rules() {
        let rules = build_rules(AttnAllToAll::AxesYZX, true).unwrap();
        for axis in [RESIDUAL_BATCH, ATTN_BATCH, LOGIT_BATCH] {
            assert_eq!(rules.get(axis), Some(&PartitionDimension::Unsharded));
        }
        assert_eq!(rules.get(RESIDUAL_TIME), Some(&PartitionDimension::sharded("x")));
        assert_eq!(rules.get(VOCAB), Some(&PartitionDimension::sharded_by(["z", "x"])));
    }

    #[test]
    fn test_every_strategy_is_conflict_free_and_deterministic() {
        for strategy in AttnAllToAll::ALL {
            for batch_unsharded in [false, true] {
                let rules = build_rules(strategy, batch_unsharded).unwrap();
                assert_eq!(build_rules(strategy, batch_unsharded).unwrap(), rules);
                for (tensor, axes) in known_annotations() {
                    assert!(rules.check_conflicts(tensor, &axes).is_ok());
                    let spec = rules.partition_spec(&axes).unwrap();
                    assert_eq!(spec.rank(), axes.rank());
                }
            }
        }
    }

    #[test]
    fn test_conflicting_rules_are_rejected() {
        let mut rules = build_rules(AttnAllToAll::AxesXYZ, false).unwrap().rules;
        rules.insert(TIME.to_string(), PartitionDimension::sharded("z"));
        assert!(matches!(
            RuleTable::from_rules(rules),
            Err(Error::PartitioningConflict { tensor, mesh_axis, first_logical_axis, second_logical_axis })
                if tensor == "result.logits"
                    && mesh_axis == "z"
                    && first_logical_axis == TIME
                    && second_logical_axis == VOCAB
        ));
    }

    #[test]
    fn test_unknown_logical_axes() {
        let rules = build_rules(AttnAllToAll::AxesXYZ, false).unwrap();
        assert!(matches!(
            rules.partition_spec(&LogicalAxes::new(&[Some("sequence")])),
            Err(Error::UnknownLogicalAxis { axis_name }) if axis_name == "sequence",
        ));
        assert!(matches!(
            RuleTable::from_rules([(LAYERS, PartitionDimension::Unsharded)]),
            Err(Error::UnknownLogicalAxis { .. }),
        ));
    }

    #[test]
    fn test_logical_axes_display() {
        assert_eq!(residual_logical_axes(false).to_string(), "P('residual_batch', 'time', 'residual_embed')");
        assert_eq!(LogicalAxes::replicated(2).to_string(), "P(None, None)");
        assert_eq!(residual_logical_axes(true).label(0), "<dimension 0>");
    }
}

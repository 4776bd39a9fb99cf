//! Device meshes and physical shardings.
//!
//! A [`Mesh`] organizes devices into a named grid. The inference stack runs on a 3D mesh whose axes are
//! conventionally called `x`, `y`, and `z`, but nothing in this module assumes a particular rank: the rank-3
//! requirement is enforced by [`Mesh::shape`], which is what the partitioning and layer code consume.
//!
//! A [`PartitionSpec`] describes, per tensor dimension, which mesh axes that dimension is split across. The
//! [`PartitionSpec`]s used by the inference stack are never written by hand. They are produced by resolving logical
//! axis annotations through a [`RuleTable`](crate::partitioning::RuleTable) (see [`crate::resolver`]).
//!
//! | Type | Meaning | Shardy representation |
//! |---|---|---|
//! | [`MeshAxis`] | Named mesh dimension with a size | `"x"=2` inside `sdy.mesh` |
//! | [`Mesh`] | Axes over row-major device indices | `sdy.mesh @mesh = <["x"=2, "y"=2, "z"=2]>` |
//! | [`PartitionDimension`] | Sharding of one tensor dimension | `{}` or `{"x", "y"}` |
//! | [`PartitionSpec`] | Sharding of every tensor dimension | `[{"x"}, {}]` |
//! | [`NamedSharding`] | Mesh plus validated [`PartitionSpec`] | `#sdy.sharding<@mesh, [{"x"}, {}]>` |
//! | [`ShardRegion`] | Block of a global array held by one device | (host metadata only) |
//!
//! When a dimension is sharded over multiple mesh axes, the axes are listed from major to minor: the partition
//! index of a device is the mixed-radix number formed by its coordinates along those axes. For example, with a
//! `2x2x2` mesh and `Sharded(["y", "z"])`, the device at coordinate `(x, y, z)` holds partition `y * 2 + z` of 4.

use std::collections::HashSet;

use thiserror::Error;

use crate::parameters::Parameter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for mesh and sharding definitions.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardingError {
    #[error("mesh axis names must be non-empty")]
    EmptyMeshAxisName,

    #[error("mesh axis '{axis_name}' must have size > 0")]
    InvalidMeshAxisSize { axis_name: String },

    #[error("mesh axis '{axis_name}' appears more than once")]
    DuplicateMeshAxisName { axis_name: String },

    /// Error returned when a 3D mesh is required but the mesh has a different number of axes.
    #[error("expected a mesh with 3 axes, but got {rank} axis/axes")]
    MeshRankMismatch { rank: usize },

    #[error("unknown mesh axis '{axis_name}'")]
    UnknownMeshAxis { axis_name: String },

    #[error("device index {device_index} is out of range for a mesh with {device_count} device(s)")]
    InvalidDeviceIndex { device_index: usize, device_count: usize },

    /// Error returned when a sharded dimension lists no mesh axes.
    #[error("partition specification dimension #{dimension} has an empty mesh-axis list")]
    EmptyPartitionAxisList { dimension: usize },

    /// Error returned when a mesh axis is used more than once by the same partition specification or collective.
    #[error("mesh axis '{axis_name}' is used more than once")]
    DuplicatePartitionAxis { axis_name: String },

    #[error("invalid mesh symbol name '{mesh_symbol_name}'")]
    InvalidMeshSymbolName { mesh_symbol_name: String },

    #[error("partition specification rank {partition_rank} does not match array rank {array_rank}")]
    RankMismatch { partition_rank: usize, array_rank: usize },
}

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

/// A named axis of a [`Mesh`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    pub fn new<N: Into<String>>(name: N, size: usize) -> Result<Self, ShardingError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ShardingError::EmptyMeshAxisName);
        }
        if size == 0 {
            return Err(ShardingError::InvalidMeshAxisSize { axis_name: name });
        }
        Ok(Self { name, size })
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Grid of devices with named axes.
///
/// Devices are identified by their **row-major index** with respect to the axis list: for a mesh with axes
/// `("x"=2, "y"=2, "z"=2)`, the device at coordinate `(i, j, k)` has index `i * 4 + j * 2 + k`. Shards, collective
/// groups, and per-device results are all ordered by this index.
///
/// A mesh is built once and then shared read-only. It is always passed explicitly; there is no ambient
/// "current mesh".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mesh {
    axes: Vec<MeshAxis>,
}

impl Mesh {
    pub fn new(axes: Vec<MeshAxis>) -> Result<Self, ShardingError> {
        let mut names = HashSet::with_capacity(axes.len());
        for axis in &axes {
            if !names.insert(axis.name()) {
                return Err(ShardingError::DuplicateMeshAxisName { axis_name: axis.name.clone() });
            }
        }
        Ok(Self { axes })
    }

    /// Creates a mesh from `(axis_name, axis_size)` pairs.
    ///
    /// ```rust
    /// # use tessera_core::sharding::Mesh;
    /// let mesh = Mesh::grid(&[("x", 2), ("y", 2), ("z", 2)]).unwrap();
    /// assert_eq!(mesh.shape().unwrap(), (2, 2, 2));
    /// assert_eq!(mesh.device_count(), 8);
    /// ```
    pub fn grid<N: AsRef<str>>(axes: &[(N, usize)]) -> Result<Self, ShardingError> {
        Self::new(axes.iter().map(|(name, size)| MeshAxis::new(name.as_ref(), *size)).collect::<Result<_, _>>()?)
    }

    pub fn axes(&self) -> &[MeshAxis] {
        self.axes.as_slice()
    }

    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(MeshAxis::name).collect()
    }

    /// Returns the sizes of the three axes of a 3D mesh, or [`ShardingError::MeshRankMismatch`].
    pub fn shape(&self) -> Result<(usize, usize, usize), ShardingError> {
        match self.axes.as_slice() {
            [x, y, z] => Ok((x.size, y.size, z.size)),
            axes => Err(ShardingError::MeshRankMismatch { rank: axes.len() }),
        }
    }

    /// Returns the names of the three axes of a 3D mesh, or [`ShardingError::MeshRankMismatch`].
    pub fn axis_names_3d(&self) -> Result<(&str, &str, &str), ShardingError> {
        match self.axes.as_slice() {
            [x, y, z] => Ok((x.name(), y.name(), z.name())),
            axes => Err(ShardingError::MeshRankMismatch { rank: axes.len() }),
        }
    }

    pub fn device_count(&self) -> usize {
        self.axes.iter().map(MeshAxis::size).product()
    }

    pub fn axis_index<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.axes.iter().position(|axis| axis.name == axis_name.as_ref())
    }

    pub fn axis_size<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.axis_index(axis_name).map(|axis_index| self.axes[axis_index].size)
    }

    /// Returns the product of the sizes of `axis_names`.
    pub fn axes_size<S: AsRef<str>>(&self, axis_names: &[S]) -> Result<usize, ShardingError> {
        Ok(self.axis_positions(axis_names)?.iter().map(|axis| self.axes[*axis].size).product())
    }

    /// Returns the mesh coordinate of the device at `device_index`.
    pub fn coordinate(&self, device_index: usize) -> Result<Vec<usize>, ShardingError> {
        let device_count = self.device_count();
        if device_index >= device_count {
            return Err(ShardingError::InvalidDeviceIndex { device_index, device_count });
        }
        let mut coordinate = vec![0; self.axes.len()];
        let mut rest = device_index;
        for (axis, value) in self.axes.iter().zip(coordinate.iter_mut()).rev() {
            *value = rest % axis.size;
            rest /= axis.size;
        }
        Ok(coordinate)
    }

    /// Returns `(partition_index, partition_count)` of the device at `device_index` along `axis_names` (major to
    /// minor). This is both the block a device holds of a dimension sharded over `axis_names` and the rank of the
    /// device in a collective over `axis_names`.
    pub fn partition_index<S: AsRef<str>>(
        &self,
        device_index: usize,
        axis_names: &[S],
    ) -> Result<(usize, usize), ShardingError> {
        let coordinate = self.coordinate(device_index)?;
        Ok(self.axis_positions(axis_names)?.into_iter().fold((0, 1), |(index, count), axis| {
            let size = self.axes[axis].size;
            (index * size + coordinate[axis], count * size)
        }))
    }

    /// Returns the devices that share every coordinate of the device at `device_index` outside of `axis_names`,
    /// ordered by their [`partition_index`](Self::partition_index) along `axis_names`.
    ///
    /// This is the participant group of a collective over `axis_names` issued by that device.
    pub fn device_group<S: AsRef<str>>(
        &self,
        device_index: usize,
        axis_names: &[S],
    ) -> Result<Vec<usize>, ShardingError> {
        let coordinate = self.coordinate(device_index)?;
        let axes = self.axis_positions(axis_names)?;
        let count = axes.iter().map(|axis| self.axes[*axis].size).product::<usize>();
        let group = (0..count)
            .map(|rank| {
                let mut member = coordinate.clone();
                let mut rest = rank;
                for axis in axes.iter().rev() {
                    member[*axis] = rest % self.axes[*axis].size;
                    rest /= self.axes[*axis].size;
                }
                self.axes.iter().zip(member).fold(0, |index, (axis, value)| index * axis.size + value)
            })
            .collect();
        Ok(group)
    }

    /// Renders a Shardy `sdy.mesh` declaration (e.g., `sdy.mesh @mesh = <["x"=2, "y"=2]>`).
    pub fn to_shardy_mesh_operation<S: AsRef<str>>(&self, mesh_symbol_name: S) -> Result<String, ShardingError> {
        let mesh_symbol_name = normalize_mesh_symbol_name(mesh_symbol_name.as_ref())?;
        let axes = self
            .axes
            .iter()
            .map(|axis| format!("\"{}\"={}", escape_shardy_string(axis.name()), axis.size()))
            .collect::<Vec<_>>();
        Ok(format!("sdy.mesh @{mesh_symbol_name} = <[{}]>", axes.join(", ")))
    }

    /// Positions of `axis_names` in this mesh, rejecting unknown and repeated names.
    fn axis_positions<S: AsRef<str>>(&self, axis_names: &[S]) -> Result<Vec<usize>, ShardingError> {
        let mut positions = Vec::with_capacity(axis_names.len());
        for axis_name in axis_names {
            let axis_name = axis_name.as_ref();
            let position = self
                .axis_index(axis_name)
                .ok_or_else(|| ShardingError::UnknownMeshAxis { axis_name: axis_name.to_string() })?;
            if positions.contains(&position) {
                return Err(ShardingError::DuplicatePartitionAxis { axis_name: axis_name.to_string() });
            }
            positions.push(position);
        }
        Ok(positions)
    }
}

// ---------------------------------------------------------------------------
// Partition specification
// ---------------------------------------------------------------------------

/// Physical sharding of one tensor dimension.
///
/// | `PartitionSpec` element in JAX | `PartitionDimension` |
/// |---|---|
/// | `None` | [`Unsharded`][PartitionDimension::Unsharded] |
/// | `'x'` | [`sharded("x")`][PartitionDimension::sharded] |
/// | `('y', 'z')` | [`sharded_by(["y", "z"])`][PartitionDimension::sharded_by] |
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionDimension {
    /// Every device holds the full extent of the dimension.
    Unsharded,

    /// Dimension is split over the listed mesh axes, major to minor.
    Sharded(Vec<String>),
}

impl PartitionDimension {
    pub fn unsharded() -> Self {
        Self::Unsharded
    }

    pub fn sharded<N: Into<String>>(axis_name: N) -> Self {
        Self::Sharded(vec![axis_name.into()])
    }

    /// Creates a dimension sharded over `axis_names` (major to minor). No axes means
    /// [`Unsharded`][PartitionDimension::Unsharded].
    pub fn sharded_by<I, N>(axis_names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let axis_names = axis_names.into_iter().map(Into::into).collect::<Vec<_>>();
        if axis_names.is_empty() { Self::Unsharded } else { Self::Sharded(axis_names) }
    }

    /// Mesh axes this dimension is split over (empty if it is unsharded).
    pub fn mesh_axes(&self) -> &[String] {
        match self {
            Self::Sharded(axis_names) => axis_names.as_slice(),
            Self::Unsharded => &[],
        }
    }
}

/// Physical sharding of every dimension of a tensor. A mesh axis may appear at most once across all dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionSpec {
    dimensions: Vec<PartitionDimension>,
}

impl PartitionSpec {
    pub fn new(dimensions: Vec<PartitionDimension>) -> Self {
        Self { dimensions }
    }

    pub fn replicated(rank: usize) -> Self {
        Self { dimensions: vec![PartitionDimension::Unsharded; rank] }
    }

    pub fn dimensions(&self) -> &[PartitionDimension] {
        self.dimensions.as_slice()
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_replicated(&self) -> bool {
        self.dimensions.iter().all(|dimension| matches!(dimension, PartitionDimension::Unsharded))
    }

    /// Number of blocks each dimension is split into on `mesh`.
    pub fn partition_counts(&self, mesh: &Mesh) -> Result<Vec<usize>, ShardingError> {
        self.dimensions.iter().map(|dimension| mesh.axes_size(dimension.mesh_axes())).collect()
    }

    /// Returns the region of a `global_shape` array held by every device of `mesh`, in device index order.
    ///
    /// A dimension that does not divide evenly gives one extra element to each of its leading blocks. The inference
    /// stack rejects such shardings up front (see [`local_shape`](crate::resolver::local_shape)).
    pub fn shard_regions(&self, mesh: &Mesh, global_shape: &[usize]) -> Result<Vec<ShardRegion>, ShardingError> {
        self.validate(mesh)?;
        if self.rank() != global_shape.len() {
            return Err(ShardingError::RankMismatch { partition_rank: self.rank(), array_rank: global_shape.len() });
        }
        (0..mesh.device_count())
            .map(|device_index| {
                let mut region = ShardRegion { offsets: Vec::new(), shape: Vec::new() };
                for (dimension, size) in self.dimensions.iter().zip(global_shape.iter().copied()) {
                    let (index, count) = mesh.partition_index(device_index, dimension.mesh_axes())?;
                    let (base, remainder) = (size / count, size % count);
                    region.offsets.push(index * base + index.min(remainder));
                    region.shape.push(base + usize::from(index < remainder));
                }
                Ok(region)
            })
            .collect()
    }

    /// Renders this specification as a closed Shardy dimension list (e.g., `[{"x"}, {}]`).
    pub fn to_shardy_dimension_shardings_literal(&self) -> String {
        let dimensions = self
            .dimensions
            .iter()
            .map(|dimension| {
                let axes = dimension.mesh_axes().iter().map(|axis| format!("\"{}\"", escape_shardy_string(axis)));
                format!("{{{}}}", axes.collect::<Vec<_>>().join(", "))
            })
            .collect::<Vec<_>>();
        format!("[{}]", dimensions.join(", "))
    }

    fn validate(&self, mesh: &Mesh) -> Result<(), ShardingError> {
        let mut used = HashSet::new();
        for (dimension, partition) in self.dimensions.iter().enumerate() {
            if matches!(partition, PartitionDimension::Sharded(axes) if axes.is_empty()) {
                return Err(ShardingError::EmptyPartitionAxisList { dimension });
            }
            for axis_name in partition.mesh_axes() {
                if mesh.axis_index(axis_name).is_none() {
                    return Err(ShardingError::UnknownMeshAxis { axis_name: axis_name.clone() });
                }
                if !used.insert(axis_name.as_str()) {
                    return Err(ShardingError::DuplicatePartitionAxis { axis_name: axis_name.clone() });
                }
            }
        }
        Ok(())
    }
}

impl Parameter for PartitionSpec {}

/// Block of a global array held by one device.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardRegion {
    pub offsets: Vec<usize>,
    pub shape: Vec<usize>,
}

// ---------------------------------------------------------------------------
// Named sharding
// ---------------------------------------------------------------------------

/// A [`PartitionSpec`] validated against a [`Mesh`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedSharding {
    mesh: Mesh,
    partition_spec: PartitionSpec,
}

impl NamedSharding {
    pub fn new(mesh: Mesh, partition_spec: PartitionSpec) -> Result<Self, ShardingError> {
        partition_spec.validate(&mesh)?;
        Ok(Self { mesh, partition_spec })
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn partition_spec(&self) -> &PartitionSpec {
        &self.partition_spec
    }

    /// Renders this sharding as a Shardy tensor sharding attribute (e.g., `#sdy.sharding<@mesh, [{"x"}, {}]>`).
    /// `mesh_symbol_name` may be given with or without its leading `'@'`.
    pub fn to_shardy_tensor_sharding_attribute<S: AsRef<str>>(
        &self,
        mesh_symbol_name: S,
    ) -> Result<String, ShardingError> {
        let mesh_symbol_name = normalize_mesh_symbol_name(mesh_symbol_name.as_ref())?;
        let dimension_shardings = self.partition_spec.to_shardy_dimension_shardings_literal();
        Ok(format!("#sdy.sharding<@{mesh_symbol_name}, {dimension_shardings}>"))
    }
}

impl Parameter for NamedSharding {}

fn normalize_mesh_symbol_name(mesh_symbol_name: &str) -> Result<&str, ShardingError> {
    let trimmed = mesh_symbol_name.trim();
    let name = trimmed.strip_prefix('@').unwrap_or(trimmed);
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ShardingError::InvalidMeshSymbolName { mesh_symbol_name: mesh_symbol_name.to_string() });
    }
    Ok(name)
}

fn escape_shardy_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

//! Structure-preserving resolution of logical annotations into physical shardings, and the host-side movement of
//! global arrays into per-device shards and back.
//!
//! All functions here are generic over [`Parameterized`] containers, so the same code handles [`Weights`], chunks,
//! results, and lists of KV caches:
//!
//! ```rust
//! # use tessera_core::partitioning::{build_rules, AttnAllToAll};
//! # use tessera_core::resolver::resolve;
//! # use tessera_core::sharding::PartitionDimension;
//! # use tessera_core::weights::Weights;
//! let rules = build_rules(AttnAllToAll::AxesXYZ, false).unwrap();
//! let shardings = resolve(&Weights::logical_axes(), &rules).unwrap();
//! assert_eq!(shardings.embedding.dimensions()[0], PartitionDimension::sharded_by(["y", "z"]));
//! ```
//!
//! [`Weights`]: crate::weights::Weights

use candle_core::WithDType;

use crate::array::HostArray;
use crate::errors::Error;
use crate::parameters::Parameterized;
use crate::partitioning::{LogicalAxes, RuleTable};
use crate::sharding::{Mesh, NamedSharding, PartitionSpec};

/// Resolves every [`LogicalAxes`] leaf of `logical_axes` into a [`PartitionSpec`] using `rules`.
///
/// Dimensions annotated with `None` are replicated. Fails with [`Error::UnknownLogicalAxis`] if an annotation uses a
/// name that `rules` does not define, and with [`Error::PartitioningConflict`] if two distinct logical axes of the
/// same leaf map to the same mesh axis.
pub fn resolve<C: Parameterized<LogicalAxes>>(
    logical_axes: &C,
    rules: &RuleTable,
) -> Result<C::To<PartitionSpec>, Error> {
    logical_axes.try_map_params_ref(|axes| {
        rules.check_conflicts(&axes.to_string(), axes)?;
        rules.partition_spec(axes)
    })
}

/// Binds every [`PartitionSpec`] leaf of `partition_specs` to `mesh`, validating it against the mesh axes.
pub fn named_shardings<C: Parameterized<PartitionSpec>>(
    partition_specs: &C,
    mesh: &Mesh,
) -> Result<C::To<NamedSharding>, Error> {
    partition_specs.try_map_params_ref(|spec| Ok(NamedSharding::new(mesh.clone(), spec.clone())?))
}

/// Shape of the shard of a tensor with shape `global_shape` and annotation `logical_axes` held by every device.
///
/// Fails with [`Error::ShapeMismatch`], naming the logical axis, if a dimension is not divisible by the number of
/// partitions its mesh axes induce. The reported expected size is the next larger divisible size.
pub fn local_shape(
    global_shape: &[usize],
    logical_axes: &LogicalAxes,
    rules: &RuleTable,
    mesh: &Mesh,
) -> Result<Vec<usize>, Error> {
    if global_shape.len() != logical_axes.rank() {
        return Err(Error::RankMismatch {
            tensor: logical_axes.to_string(),
            expected: logical_axes.rank(),
            actual: global_shape.len(),
        });
    }
    global_shape
        .iter()
        .enumerate()
        .map(|(dimension, size)| {
            let partitions = mesh.axes_size(rules.mesh_axes(logical_axes.name(dimension))?)?;
            check_divisible(&logical_axes.to_string(), &logical_axes.label(dimension), *size, partitions)?;
            Ok(size / partitions)
        })
        .collect()
}

/// Checks that `size` is divisible by `partitions`, reporting a [`Error::ShapeMismatch`] for `logical_axis`
/// otherwise.
pub fn check_divisible(tensor: &str, logical_axis: &str, size: usize, partitions: usize) -> Result<(), Error> {
    if partitions == 0 || size % partitions != 0 {
        return Err(Error::ShapeMismatch {
            tensor: tensor.to_string(),
            logical_axis: logical_axis.to_string(),
            expected: size.div_ceil(partitions.max(1)) * partitions.max(1),
            actual: size,
        });
    }
    Ok(())
}

/// Splits the global arrays of `value` into one container of shards per device of `mesh`, in row-major device
/// order.
pub fn distribute<E, C>(value: &C, partition_specs: &C::To<PartitionSpec>, mesh: &Mesh) -> Result<Vec<C>, Error>
where
    E: WithDType,
    C: Parameterized<HostArray<E>>,
{
    let arrays = value.params();
    let specs = partition_specs.params();
    if arrays.len() != specs.len() {
        return Err(Error::InsufficientParams { expected_count: arrays.len().max(specs.len()) });
    }

    let mut shards_by_device = (0..mesh.device_count()).map(|_| Vec::with_capacity(arrays.len())).collect::<Vec<_>>();
    for (array, spec) in arrays.into_iter().zip(specs) {
        let regions = spec.shard_regions(mesh, array.shape())?;
        for (shards, region) in shards_by_device.iter_mut().zip(regions) {
            shards.push(array.region(&region.offsets, &region.shape)?);
        }
    }

    shards_by_device.into_iter().map(|shards| C::from_params(value.param_structure(), shards)).collect()
}

/// Inverse of [`distribute`]: reassembles global arrays from one container of shards per device of `mesh`.
///
/// Replicated dimensions are taken from whichever device wrote them last. Every device must hold identical data for
/// them, which the inference stack guarantees.
pub fn assemble<E, C>(shards: Vec<C>, partition_specs: &C::To<PartitionSpec>, mesh: &Mesh) -> Result<C, Error>
where
    E: WithDType,
    C: Parameterized<HostArray<E>>,
{
    if shards.len() != mesh.device_count() {
        return Err(Error::InsufficientParams { expected_count: mesh.device_count() });
    }
    let specs = partition_specs.params();
    let structure = shards.first().ok_or(Error::InsufficientParams { expected_count: 1 })?.param_structure();
    let shards = shards.into_iter().map(|shard| shard.into_params()).collect::<Vec<_>>();

    let mut arrays = Vec::with_capacity(specs.len());
    for (leaf, spec) in specs.into_iter().enumerate() {
        let first = shards[0].get(leaf).ok_or(Error::InsufficientParams { expected_count: leaf + 1 })?;
        let counts = spec.partition_counts(mesh)?;
        if counts.len() != first.rank() {
            return Err(Error::RankMismatch {
                tensor: format!("leaf {leaf}"),
                expected: counts.len(),
                actual: first.rank(),
            });
        }
        let global_shape = first.shape().iter().zip(&counts).map(|(size, count)| size * count).collect::<Vec<_>>();
        let regions = spec.shard_regions(mesh, &global_shape)?;
        let mut array = HostArray::zeros(global_shape)?;
        for (device_shards, region) in shards.iter().zip(regions) {
            let shard = device_shards.get(leaf).ok_or(Error::InsufficientParams { expected_count: leaf + 1 })?;
            array.write_region(&region.offsets, shard)?;
        }
        arrays.push(array);
    }
    C::from_params(structure, arrays)
}

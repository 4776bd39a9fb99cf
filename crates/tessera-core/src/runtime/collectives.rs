use std::fmt::Display;

use thiserror::Error;

use crate::array::{ArrayError, HostArray};
use crate::sharding::ShardingError;

/// Error type for collective operations.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CollectiveError {
    /// Devices of the same group issued different collectives at the same point of their programs.
    #[error("device {device_index} issued {actual} as collective #{sequence}, but its group issued {expected}")]
    Mismatch { device_index: usize, sequence: u64, expected: String, actual: String },

    /// A device finished its program while other devices of its group were waiting for it in a collective.
    #[error("device {exited_device_index} exited before joining collective #{sequence}")]
    DeviceExited { exited_device_index: usize, sequence: u64 },

    /// Another device failed, so the program was aborted on this device.
    #[error("device {device_index} was aborted because another device failed")]
    Aborted { device_index: usize },

    #[error("device {device_index} panicked")]
    DevicePanicked { device_index: usize },

    #[error("the rendezvous state was poisoned by a panicking device")]
    Poisoned,

    #[error(transparent)]
    Sharding(#[from] ShardingError),

    #[error(transparent)]
    Array(#[from] ArrayError),
}

/// Identity of a collective operation: what it does, over which mesh axes, and along which dimensions. All devices
/// of a group must issue collectives of the same kind in the same order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    AllGather { axes: Vec<String>, dimension: usize },
    Psum { axes: Vec<String> },
    PsumScatter { axes: Vec<String>, dimension: usize },
    AllToAll { axes: Vec<String>, split_dimension: usize, concat_dimension: usize },
}

impl CollectiveKind {
    pub fn axes(&self) -> &[String] {
        match self {
            CollectiveKind::AllGather { axes, .. }
            | CollectiveKind::Psum { axes }
            | CollectiveKind::PsumScatter { axes, .. }
            | CollectiveKind::AllToAll { axes, .. } => axes.as_slice(),
        }
    }

    /// Computes the result of this collective for the participant with rank `rank`, given the contributions of all
    /// participants in rank order.
    pub fn apply(&self, contributions: &[HostArray], rank: usize) -> Result<HostArray, ArrayError> {
        let count = contributions.len();
        match self {
            CollectiveKind::AllGather { dimension, .. } => HostArray::concat(contributions, *dimension),
            CollectiveKind::Psum { .. } => sum(contributions),
            CollectiveKind::PsumScatter { dimension, .. } => sum(contributions)?.chunk(*dimension, count, rank),
            CollectiveKind::AllToAll { split_dimension, concat_dimension, .. } => {
                let parts = contributions
                    .iter()
                    .map(|contribution| contribution.chunk(*split_dimension, count, rank))
                    .collect::<Result<Vec<_>, _>>()?;
                HostArray::concat(&parts, *concat_dimension)
            }
        }
    }
}

impl Display for CollectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectiveKind::AllGather { axes, dimension } => write!(f, "all_gather({axes:?}, dimension={dimension})"),
            CollectiveKind::Psum { axes } => write!(f, "psum({axes:?})"),
            CollectiveKind::PsumScatter { axes, dimension } => {
                write!(f, "psum_scatter({axes:?}, dimension={dimension})")
            }
            CollectiveKind::AllToAll { axes, split_dimension, concat_dimension } => {
                write!(f, "all_to_all({axes:?}, split={split_dimension}, concat={concat_dimension})")
            }
        }
    }
}

fn sum(contributions: &[HostArray]) -> Result<HostArray, ArrayError> {
    let (first, rest) = contributions.split_first().ok_or(ArrayError::EmptyConcatenation)?;
    rest.iter().try_fold(first.clone(), |total, contribution| total.add(contribution))
}

/// Collective primitives available to a device program.
///
/// Every method takes the mesh axes it operates over. The participants of a collective are the devices that share
/// the calling device's coordinates along all other mesh axes, ranked by their (mixed-radix, major-to-minor)
/// coordinates along `axes`. An empty `axes` list makes every collective the identity.
///
/// Collectives are barriers: every participant must issue the same collective, in the same order.
pub trait Collectives {
    /// Rank of this device among the devices that differ from it only along `axes`.
    fn axis_index(&self, axes: &[&str]) -> Result<usize, CollectiveError>;

    /// Number of devices that differ from this device only along `axes`.
    fn axis_size(&self, axes: &[&str]) -> Result<usize, CollectiveError>;

    /// Concatenates the contributions of all participants along `dimension`, in rank order.
    fn all_gather(&self, x: &HostArray, axes: &[&str], dimension: usize) -> Result<HostArray, CollectiveError>;

    /// Sums the contributions of all participants.
    fn psum(&self, x: &HostArray, axes: &[&str]) -> Result<HostArray, CollectiveError>;

    /// Sums the contributions of all participants and returns the `rank`-th of `size` equal blocks of the sum along
    /// `dimension`.
    fn psum_scatter(&self, x: &HostArray, axes: &[&str], dimension: usize) -> Result<HostArray, CollectiveError>;

    /// Splits every contribution into `size` blocks along `split_dimension` and returns the `rank`-th block of
    /// every participant, concatenated in rank order along `concat_dimension`.
    fn all_to_all(
        &self,
        x: &HostArray,
        axes: &[&str],
        split_dimension: usize,
        concat_dimension: usize,
    ) -> Result<HostArray, CollectiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contributions() -> Vec<HostArray> {
        (0..2)
            .map(|rank| HostArray::from_fn(vec![2, 2], |index| (rank * 10 + index[0] * 2 + index[1]) as f32).unwrap())
            .collect()
    }

    #[test]
    fn test_collective_semantics() {
        let contributions = contributions();
        let axes = vec!["x".to_string()];

        let all_gather = CollectiveKind::AllGather { axes: axes.clone(), dimension: 1 };
        let gathered = all_gather.apply(&contributions, 0).unwrap();
        assert_eq!(gathered.to_vec().unwrap(), [0.0, 1.0, 10.0, 11.0, 2.0, 3.0, 12.0, 13.0]);

        let summed = CollectiveKind::Psum { axes: axes.clone() }.apply(&contributions, 1).unwrap();
        assert_eq!(summed.to_vec().unwrap(), [10.0, 12.0, 14.0, 16.0]);

        let scattered = CollectiveKind::PsumScatter { axes: axes.clone(), dimension: 0 };
        assert_eq!(scattered.apply(&contributions, 1).unwrap().to_vec().unwrap(), [14.0, 16.0]);

        let all_to_all = CollectiveKind::AllToAll { axes, split_dimension: 0, concat_dimension: 1 };
        let result = all_to_all.apply(&contributions, 1).unwrap();
        assert_eq!(result.shape(), &[1, 4]);
        assert_eq!(result.to_vec().unwrap(), [2.0, 3.0, 12.0, 13.0]);
    }

    #[test]
    fn test_collective_kind_display() {
        let axes = vec!["y".to_string(), "z".to_string()];
        let kind = CollectiveKind::AllToAll { axes, split_dimension: 0, concat_dimension: 2 };
        assert_eq!(kind.to_string(), "all_to_all([\"y\", \"z\"], split=0, concat=2)");
        assert_eq!(kind.axes(), ["y", "z"]);
    }
}

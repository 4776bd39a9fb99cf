use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::array::HostArray;
use crate::errors::Error;
use crate::sharding::Mesh;

use super::collectives::{CollectiveError, CollectiveKind, Collectives};

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Runs SPMD programs on a simulated mesh, one scoped thread per device.
///
/// Collectives are exchanged through a shared rendezvous. Programs that diverge are detected rather than left to
/// deadlock:
///
/// - Two devices issuing different collectives at the same point of their programs fail with
///   [`CollectiveError::Mismatch`].
/// - A device finishing while its group still waits for it fails the group with [`CollectiveError::DeviceExited`].
/// - A device returning an error aborts every device blocked in a collective with [`CollectiveError::Aborted`].
///
/// [`HostRuntime::run`] reports the root cause of a failure rather than the aborts it triggered.
#[derive(Copy, Clone, Debug)]
pub struct HostRuntime<'m> {
    mesh: &'m Mesh,
}

impl<'m> HostRuntime<'m> {
    pub fn new(mesh: &'m Mesh) -> Self {
        Self { mesh }
    }

    pub fn mesh(&self) -> &'m Mesh {
        self.mesh
    }

    /// Runs `program` once per device and returns the per-device results in row-major device order.
    pub fn run<T, F>(&self, program: F) -> Result<Vec<T>, Error>
    where
        T: Send,
        F: Fn(&DeviceContext<'_>) -> Result<T, Error> + Sync,
    {
        let device_count = self.mesh.device_count();
        debug!(device_count, "running program on the host mesh");
        let rendezvous = Rendezvous::new(device_count);
        let results = std::thread::scope(|scope| {
            let handles = (0..device_count)
                .map(|device_index| {
                    let rendezvous = &rendezvous;
                    let program = &program;
                    let mesh = self.mesh;
                    scope.spawn(move || {
                        let mut guard = ExitGuard { rendezvous, device_index, failed: true };
                        let context = DeviceContext { mesh, device_index, rendezvous, sequence: Cell::new(0) };
                        let result = program(&context);
                        guard.failed = result.is_err();
                        result
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .enumerate()
                .map(|(device_index, handle)| {
                    handle.join().unwrap_or_else(|_| Err(CollectiveError::DevicePanicked { device_index }.into()))
                })
                .collect::<Vec<_>>()
        });

        let mut values = Vec::with_capacity(device_count);
        let mut root_cause = None;
        let mut first_abort = None;
        for (device_index, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(error) if error.is_abort() => {
                    first_abort.get_or_insert(error);
                }
                Err(error) => {
                    if root_cause.is_none() {
                        warn!(device_index, %error, "device program failed");
                        root_cause = Some(error);
                    }
                }
            }
        }
        match root_cause.or(first_abort) {
            Some(error) => Err(error),
            None => Ok(values),
        }
    }
}

/// Marks a device as exited when its thread finishes, including by panicking.
struct ExitGuard<'r> {
    rendezvous: &'r Rendezvous,
    device_index: usize,
    failed: bool,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.rendezvous.finish(self.device_index, self.failed || std::thread::panicking());
    }
}

// ---------------------------------------------------------------------------
// Device context
// ---------------------------------------------------------------------------

/// Handle through which the program running on one device issues collectives.
pub struct DeviceContext<'r> {
    mesh: &'r Mesh,
    device_index: usize,
    rendezvous: &'r Rendezvous,
    sequence: Cell<u64>,
}

impl<'r> DeviceContext<'r> {
    /// Row-major index of this device in the mesh.
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn mesh(&self) -> &'r Mesh {
        self.mesh
    }

    fn collective(&self, kind: CollectiveKind, x: &HostArray) -> Result<HostArray, CollectiveError> {
        let sequence = self.sequence.get();
        self.sequence.set(sequence + 1);
        let group = self.mesh.device_group(self.device_index, kind.axes())?;
        let (rank, _) = self.mesh.partition_index(self.device_index, kind.axes())?;
        trace!(device_index = self.device_index, sequence, %kind, group_size = group.len(), "collective");
        if group.len() == 1 {
            return Ok(kind.apply(std::slice::from_ref(x), 0)?);
        }
        self.rendezvous.exchange(self.device_index, sequence, kind, &group, rank, x.clone())
    }
}

impl Collectives for DeviceContext<'_> {
    fn axis_index(&self, axes: &[&str]) -> Result<usize, CollectiveError> {
        Ok(self.mesh.partition_index(self.device_index, axes)?.0)
    }

    fn axis_size(&self, axes: &[&str]) -> Result<usize, CollectiveError> {
        Ok(self.mesh.axes_size(axes)?)
    }

    fn all_gather(&self, x: &HostArray, axes: &[&str], dimension: usize) -> Result<HostArray, CollectiveError> {
        self.collective(CollectiveKind::AllGather { axes: owned(axes), dimension }, x)
    }

    fn psum(&self, x: &HostArray, axes: &[&str]) -> Result<HostArray, CollectiveError> {
        self.collective(CollectiveKind::Psum { axes: owned(axes) }, x)
    }

    fn psum_scatter(&self, x: &HostArray, axes: &[&str], dimension: usize) -> Result<HostArray, CollectiveError> {
        self.collective(CollectiveKind::PsumScatter { axes: owned(axes), dimension }, x)
    }

    fn all_to_all(
        &self,
        x: &HostArray,
        axes: &[&str],
        split_dimension: usize,
        concat_dimension: usize,
    ) -> Result<HostArray, CollectiveError> {
        self.collective(CollectiveKind::AllToAll { axes: owned(axes), split_dimension, concat_dimension }, x)
    }
}

fn owned(axes: &[&str]) -> Vec<String> {
    axes.iter().map(|axis| axis.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Rendezvous
// ---------------------------------------------------------------------------

/// Pending collective of one device group.
struct Slot {
    kind: CollectiveKind,
    participants: Vec<usize>,
    contributions: Vec<Option<HostArray>>,
    consumed: usize,
}

struct State {
    /// Pending collectives keyed by `(sequence number, smallest device index of the group)`.
    slots: HashMap<(u64, usize), Slot>,
    exited: Vec<bool>,
    aborted: bool,
}

pub(crate) struct Rendezvous {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Rendezvous {
    fn new(device_count: usize) -> Self {
        Self {
            state: Mutex::new(State { slots: HashMap::new(), exited: vec![false; device_count], aborted: false }),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, CollectiveError> {
        self.state.lock().map_err(|_| CollectiveError::Poisoned)
    }

    /// Contributes `x` to the collective `kind` of `group` and blocks until every participant has contributed.
    fn exchange(
        &self,
        device_index: usize,
        sequence: u64,
        kind: CollectiveKind,
        group: &[usize],
        rank: usize,
        x: HostArray,
    ) -> Result<HostArray, CollectiveError> {
        let key = (sequence, group.iter().copied().min().unwrap_or(device_index));
        let mut state = self.lock()?;
        if state.aborted {
            return Err(CollectiveError::Aborted { device_index });
        }
        let slot = state.slots.entry(key).or_insert_with(|| Slot {
            kind: kind.clone(),
            participants: group.to_vec(),
            contributions: vec![None; group.len()],
            consumed: 0,
        });
        if slot.kind != kind || slot.participants != group {
            return Err(CollectiveError::Mismatch {
                device_index,
                sequence,
                expected: slot.kind.to_string(),
                actual: kind.to_string(),
            });
        }
        slot.contributions[rank] = Some(x);
        self.condvar.notify_all();

        loop {
            let slot = state.slots.get(&key).ok_or(CollectiveError::Poisoned)?;
            if slot.contributions.iter().all(Option::is_some) {
                break;
            }
            if state.aborted {
                return Err(CollectiveError::Aborted { device_index });
            }
            let exited = slot
                .participants
                .iter()
                .zip(&slot.contributions)
                .find(|(participant, contribution)| contribution.is_none() && state.exited[**participant]);
            if let Some((exited_device_index, _)) = exited {
                return Err(CollectiveError::DeviceExited { exited_device_index: *exited_device_index, sequence });
            }
            state = self.condvar.wait(state).map_err(|_| CollectiveError::Poisoned)?;
        }

        let slot = state.slots.get_mut(&key).ok_or(CollectiveError::Poisoned)?;
        let contributions = slot.contributions.iter().flatten().cloned().collect::<Vec<_>>();
        slot.consumed += 1;
        if slot.consumed == slot.participants.len() {
            state.slots.remove(&key);
        }
        drop(state);
        Ok(kind.apply(&contributions, rank)?)
    }

    /// Records that `device_index` finished its program. A failed device aborts every pending collective.
    fn finish(&self, device_index: usize, failed: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.exited[device_index] = true;
        state.aborted |= failed;
        self.condvar.notify_all();
    }
}

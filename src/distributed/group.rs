//! [`ProcessGroup`] over a numr [`Communicator`]
//!
//! Single-worker runs use [`NoOpCommunicator`]; multi-worker runs bootstrap a
//! nexar mesh over loopback QUIC and hand one member to each worker thread.
//! nexar's all-reduce is a ring: every chunk is reduced by one owner and then
//! copied, so all ranks end with bit-identical buffers.

use std::sync::Arc;

use crate::distributed::ProcessGroup;
use crate::distributed::comm::{all_reduce_slice, barrier};
use crate::error::{Error, Result};
use numr::runtime::{Communicator, NexarNetCommunicator, NoOpCommunicator, ReduceOp};

/// One worker's handle on the group.
#[derive(Clone)]
pub struct CommProcessGroup {
    comm: Arc<dyn Communicator>,
    /// Every member of a bootstrapped mesh. The mesh's I/O runs on rank 0's
    /// runtime, so no member's transport may drop before the last worker's.
    _mesh: Arc<[Arc<dyn Communicator>]>,
}

impl CommProcessGroup {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self {
            comm,
            _mesh: Vec::new().into(),
        }
    }

    /// Group of one, for single-worker runs.
    pub fn single() -> Self {
        Self::new(Arc::new(NoOpCommunicator))
    }

    /// Create the `world_size` members of one in-process group. Member `i`
    /// has rank `i`; hand each to its own thread.
    pub fn bootstrap_local(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "world_size",
                reason: "process group needs at least one worker".into(),
            });
        }
        if world_size == 1 {
            return Ok(vec![Self::single()]);
        }
        let world = u32::try_from(world_size).map_err(|_| Error::InvalidArgument {
            arg: "world_size",
            reason: format!("{world_size} workers exceeds the transport's rank space"),
        })?;

        let adapter = Arc::new(nexar::CpuAdapter::new());
        let clients = nexar::SyncClient::bootstrap_local(world, adapter).map_err(|e| Error::DistributedError {
            reason: format!("nexar bootstrap failed: {e}"),
        })?;
        let mut comms: Vec<Arc<dyn Communicator>> = clients
            .into_iter()
            .map(|client| Arc::new(NexarNetCommunicator::new(client)) as Arc<dyn Communicator>)
            .collect();
        comms.sort_by_key(|c| c.rank());
        let mesh: Arc<[Arc<dyn Communicator>]> = comms.clone().into();
        Ok(comms
            .into_iter()
            .map(|comm| Self {
                comm,
                _mesh: Arc::clone(&mesh),
            })
            .collect())
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }
}

impl ProcessGroup for CommProcessGroup {
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        let world = self.world_size();
        if world == 1 {
            return Ok(());
        }
        all_reduce_slice(self.comm.as_ref(), buf, ReduceOp::Sum)?;
        let scale = world as f32;
        for v in buf.iter_mut() {
            *v /= scale;
        }
        Ok(())
    }

    fn reduce_mean_to_leader(&self, value: f64) -> Result<Option<f64>> {
        let mut cell = [value];
        all_reduce_slice(self.comm.as_ref(), &mut cell, ReduceOp::Sum)?;
        let mean = cell[0] / self.world_size() as f64;
        Ok(self.is_leader().then_some(mean))
    }

    fn barrier(&self) -> Result<()> {
        barrier(self.comm.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<T: Send + 'static>(
        world_size: usize,
        f: impl Fn(CommProcessGroup) -> T + Send + Sync + Copy + 'static,
    ) -> Vec<T> {
        let handles: Vec<_> = CommProcessGroup::bootstrap_local(world_size)
            .unwrap()
            .into_iter()
            .map(|pg| thread::spawn(move || f(pg)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_bootstrap_assigns_ranks_in_order() {
        let groups = CommProcessGroup::bootstrap_local(3).unwrap();
        let ranks: Vec<_> = groups.iter().map(|g| (g.rank(), g.world_size())).collect();
        assert_eq!(ranks, vec![(0, 3), (1, 3), (2, 3)]);
        assert!(groups[0].is_leader());
        assert!(!groups[2].is_leader());
    }

    #[test]
    fn test_all_reduce_mean_four_ranks() {
        let results = run_group(4, |pg| {
            let mut buf = vec![(pg.rank() + 1) as f32; 10];
            pg.all_reduce_mean(&mut buf).unwrap();
            buf
        });
        for buf in results {
            assert!(buf.iter().all(|&v| (v - 2.5).abs() < 1e-6));
        }
    }

    #[test]
    fn test_all_reduce_shorter_than_world() {
        let results = run_group(3, |pg| {
            let mut buf = vec![pg.rank() as f32 * 3.0];
            pg.all_reduce_mean(&mut buf).unwrap();
            buf
        });
        for buf in results {
            assert_eq!(buf, vec![3.0]);
        }
    }

    #[test]
    fn test_all_reduce_results_bit_identical() {
        let results = run_group(3, |pg| {
            let mut buf: Vec<f32> = (0..17).map(|i| 0.1 * (i + pg.rank()) as f32 + 1e-3).collect();
            pg.all_reduce_mean(&mut buf).unwrap();
            buf
        });
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[test]
    fn test_reduce_to_leader_only() {
        let results = run_group(2, |pg| {
            let v = if pg.rank() == 0 { 1.0 } else { 3.0 };
            let mean = pg.reduce_mean_to_leader(v).unwrap();
            pg.barrier().unwrap();
            mean
        });
        assert_eq!(results[0], Some(2.0));
        assert_eq!(results[1], None);
    }

    #[test]
    fn test_single_is_identity() {
        let pg = CommProcessGroup::single();
        let mut buf = vec![1.5f32, -2.0];
        pg.all_reduce_mean(&mut buf).unwrap();
        assert_eq!(buf, vec![1.5, -2.0]);
        assert_eq!(pg.reduce_mean_to_leader(4.0).unwrap(), Some(4.0));
        pg.barrier().unwrap();
        assert!(pg.is_leader());
    }

    #[test]
    fn test_zero_world_rejected() {
        assert!(CommProcessGroup::bootstrap_local(0).is_err());
    }
}

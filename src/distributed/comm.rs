//! Safe wrappers around the raw-pointer `Communicator` trait.
//!
//! Host-slice helpers so the process group doesn't repeat the
//! extract-pointer → unsafe-call → sync pattern.

use crate::error::{Error, Result};
use numr::dtype::Element;
use numr::runtime::{Communicator, ReduceOp};

/// All-reduce a host buffer in place with the given reduction op.
///
/// The element type fixes the wire dtype, so count and dtype always describe
/// exactly the borrowed buffer.
pub fn all_reduce_slice<T: Element>(comm: &dyn Communicator, buf: &mut [T], op: ReduceOp) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }

    let ptr = buf.as_mut_ptr() as u64;
    let count = buf.len();

    // Safety: ptr is a live, exclusively borrowed host buffer of `count` elements of `T::DTYPE`
    unsafe {
        comm.all_reduce(ptr, count, T::DTYPE, op)
            .map_err(|e| Error::DistributedError {
                reason: format!("all_reduce failed: {e}"),
            })?;
    }

    comm.sync().map_err(|e| Error::DistributedError {
        reason: format!("sync after all_reduce failed: {e}"),
    })
}

/// Block until every rank reaches this point.
pub fn barrier(comm: &dyn Communicator) -> Result<()> {
    comm.barrier().map_err(|e| Error::DistributedError {
        reason: format!("barrier failed: {e}"),
    })
}

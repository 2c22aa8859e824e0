//! Safe tensor-level wrappers around numr's raw-pointer `Communicator`.
//!
//! Every collective here follows the same pattern: check contiguity, extract
//! the device pointer, make the unsafe communicator call. Synchronization is
//! the caller's business — collectives launched through these helpers stay in
//! flight until `Communicator::sync` is invoked, which is what lets the
//! sharded optimizer overlap bucket reduction with backward compute.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp, Runtime};
use numr::tensor::Tensor;

fn contiguous_ptr<R: Runtime<DType = DType>>(tensor: &Tensor<R>, what: &str) -> Result<u64> {
    if !tensor.is_contiguous() {
        return Err(Error::Distributed {
            reason: format!("{what} requires a contiguous tensor"),
        });
    }
    Ok(tensor.ptr())
}

/// All-reduce a tensor in place with the given reduction op.
pub fn all_reduce_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    op: ReduceOp,
) -> Result<()> {
    let ptr = contiguous_ptr(tensor, "all_reduce")?;

    // Safety: tensor is contiguous, ptr is a valid device pointer with
    // `numel()` elements of `dtype()`
    unsafe {
        comm.all_reduce(ptr, tensor.numel(), tensor.dtype(), op)
            .map_err(|e| Error::Distributed {
                reason: format!("all_reduce failed: {e}"),
            })?;
    }

    Ok(())
}

/// Broadcast a tensor in place from `root` to all ranks.
pub fn broadcast_tensor<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    root: usize,
) -> Result<()> {
    let ptr = contiguous_ptr(tensor, "broadcast")?;

    // Safety: tensor is contiguous, ptr is a valid device pointer
    unsafe {
        comm.broadcast(ptr, tensor.numel(), tensor.dtype(), root)
            .map_err(|e| Error::Distributed {
                reason: format!("broadcast from rank {root} failed: {e}"),
            })?;
    }

    Ok(())
}

/// Send a tensor to `dest` preceded by a shape/dtype header.
///
/// Protocol: `[ndim, dim0, …, dtype_id]` as a u64 array on `tag`, then the
/// tensor data on `tag + 1`. The receiving side must use [`recv_tensor_with_metadata`].
pub fn send_tensor_with_metadata<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    tensor: &Tensor<R>,
    dest: usize,
    tag: u32,
) -> Result<()> {
    let ptr = contiguous_ptr(tensor, "send")?;
    let dtype = tensor.dtype();

    let mut header: Vec<u64> = Vec::with_capacity(tensor.shape().len() + 2);
    header.push(tensor.shape().len() as u64);
    header.extend(tensor.shape().iter().map(|&d| d as u64));
    header.push((dtype as u8) as u64);

    // Safety: header is a live contiguous u64 slice for the duration of the call
    unsafe {
        comm.send(header.as_ptr() as u64, header.len(), DType::U64, dest, tag)
            .map_err(|e| Error::Distributed {
                reason: format!("send header to rank {dest} failed: {e}"),
            })?;
    }
    sync(comm, "header send")?;

    // Safety: tensor is contiguous, ptr is a valid device pointer
    unsafe {
        comm.send(ptr, tensor.numel(), dtype, dest, tag + 1)
            .map_err(|e| Error::Distributed {
                reason: format!("send data to rank {dest} failed: {e}"),
            })?;
    }
    sync(comm, "data send")
}

/// Receive a tensor from `src`, allocating from the transmitted shape/dtype header.
pub fn recv_tensor_with_metadata<R: Runtime<DType = DType>>(
    comm: &dyn Communicator,
    src: usize,
    tag: u32,
    device: &R::Device,
) -> Result<Tensor<R>> {
    // 8 dims + ndim + dtype
    const MAX_HEADER: usize = 10;
    let mut header = [0u64; MAX_HEADER];

    // Safety: header is a live contiguous u64 buffer of MAX_HEADER elements
    unsafe {
        comm.recv(header.as_mut_ptr() as u64, MAX_HEADER, DType::U64, src, tag)
            .map_err(|e| Error::Distributed {
                reason: format!("recv header from rank {src} failed: {e}"),
            })?;
    }
    sync(comm, "header recv")?;

    let ndim = header[0] as usize;
    if ndim == 0 || ndim + 2 > MAX_HEADER {
        return Err(Error::Distributed {
            reason: format!("invalid ndim {ndim} in recv header (max 8 dims)"),
        });
    }
    let shape: Vec<usize> = header[1..=ndim].iter().map(|&d| d as usize).collect();
    let dtype = dtype_from_discriminant(header[ndim + 1])?;

    let buffer = Tensor::<R>::zeros(&shape, dtype, device);

    // Safety: buffer is freshly allocated, contiguous, `numel()` elements of `dtype`
    unsafe {
        comm.recv(buffer.ptr(), buffer.numel(), dtype, src, tag + 1)
            .map_err(|e| Error::Distributed {
                reason: format!("recv data from rank {src} failed: {e}"),
            })?;
    }
    sync(comm, "data recv")?;

    Ok(buffer)
}

/// Wait for all in-flight communicator operations.
pub fn sync(comm: &dyn Communicator, context: &str) -> Result<()> {
    comm.sync().map_err(|e| Error::Distributed {
        reason: format!("sync after {context} failed: {e}"),
    })
}

/// Recover a DType from its stable `repr(u8)` discriminant.
fn dtype_from_discriminant(val: u64) -> Result<DType> {
    match val {
        0 => Ok(DType::F64),
        1 => Ok(DType::F32),
        2 => Ok(DType::F16),
        3 => Ok(DType::BF16),
        4 => Ok(DType::FP8E4M3),
        5 => Ok(DType::FP8E5M2),
        10 => Ok(DType::I64),
        11 => Ok(DType::I32),
        12 => Ok(DType::I16),
        13 => Ok(DType::I8),
        20 => Ok(DType::U64),
        21 => Ok(DType::U32),
        22 => Ok(DType::U16),
        23 => Ok(DType::U8),
        30 => Ok(DType::Bool),
        40 => Ok(DType::Complex64),
        41 => Ok(DType::Complex128),
        _ => Err(Error::Distributed {
            reason: format!("unknown dtype discriminant {val} in recv header"),
        }),
    }
}

use log::info;
use ndarray::{Axis, Slice, concatenate};

use crate::{
    error::{PipeError, Result},
    value::{Tensor, Value},
};

/// Sizes of the `chunks` slices of a dimension of length `dim`.
///
/// The first `chunks - 1` slices get `dim / chunks` elements and the last one
/// takes whatever remains, so it is never smaller than the others.
///
/// # Returns
/// The slice sizes or a `Config` error if `chunks` is zero.
pub fn split_sizes(chunks: usize, dim: usize) -> Result<Vec<usize>> {
    if chunks == 0 {
        return Err(PipeError::Config("chunks must be at least 1".into()));
    }

    let base = dim / chunks;
    let mut sizes = vec![base; chunks - 1];
    sizes.push(dim - base * (chunks - 1));
    Ok(sizes)
}

/// Turns slice sizes into `(start, end)` ranges.
pub fn split_offsets(sizes: &[usize]) -> Vec<(usize, usize)> {
    let mut start = 0;
    sizes
        .iter()
        .map(|size| {
            let range = (start, start + size);
            start += size;
            range
        })
        .collect()
}

/// An input argument after splitting.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitArg {
    /// One value per microbatch.
    Chunks(Vec<Value>),
    /// Shared unchanged by every microbatch.
    Whole(Value),
}

/// A batch of arguments split into microbatches.
#[derive(Debug, Clone)]
pub struct MicrobatchSplit {
    chunks: usize,
    args: Vec<SplitArg>,
    offsets: Option<Vec<(usize, usize)>>,
}

impl MicrobatchSplit {
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn args(&self) -> &[SplitArg] {
        &self.args
    }

    /// The `(start, end)` range of every microbatch, only recorded in masking mode.
    pub fn offsets(&self) -> Option<&[(usize, usize)]> {
        self.offsets.as_deref()
    }

    /// The argument list of microbatch `id`.
    ///
    /// # Panics
    /// If `id` is not below `chunks`.
    pub fn microbatch(&self, id: usize) -> Vec<Value> {
        assert!(id < self.chunks, "microbatch {id} out of {}", self.chunks);
        self.args
            .iter()
            .map(|arg| match arg {
                SplitArg::Chunks(chunks) => chunks[id].clone(),
                SplitArg::Whole(value) => value.clone(),
            })
            .collect()
    }
}

/// Splits every tensor argument into `chunks` contiguous slices along its batch dimension.
///
/// In masking mode every slice keeps the full shape of its tensor, zero-filled
/// outside the slice's range, and the ranges are recorded so outputs can be cut
/// back down before reassembly.
///
/// # Arguments
/// * `args` - The batch's arguments.
/// * `chunks` - The amount of microbatches.
/// * `batch_dims` - One entry per argument, `None` for arguments that are not split.
/// * `mask` - Whether to produce masked full-shape slices.
///
/// # Returns
/// The split arguments or a `Config` error if a tensor has no usable batch dimension.
pub fn split_args(
    args: Vec<Value>,
    chunks: usize,
    batch_dims: &[Option<usize>],
    mask: bool,
) -> Result<MicrobatchSplit> {
    if args.len() != batch_dims.len() {
        return Err(PipeError::Config(format!(
            "got {} batch dimensions for {} arguments",
            batch_dims.len(),
            args.len()
        )));
    }

    let mut offsets = None;
    let mut split = Vec::with_capacity(args.len());

    for (i, (arg, &batch_dim)) in args.into_iter().zip(batch_dims).enumerate() {
        let Value::Tensor(tensor) = arg else {
            split.push(SplitArg::Whole(arg));
            continue;
        };

        let axis = batch_axis(i, &tensor, batch_dim)?;
        let sizes = split_sizes(chunks, tensor.len_of(axis))?;
        let ranges = split_offsets(&sizes);

        let pieces: Vec<Tensor> = ranges
            .iter()
            .map(|&(start, end)| {
                let range = Slice::from(start..end);
                if mask {
                    let mut masked = Tensor::zeros(tensor.raw_dim());
                    masked
                        .slice_axis_mut(axis, range)
                        .assign(&tensor.slice_axis(axis, range));
                    masked
                } else {
                    tensor.slice_axis(axis, range).to_owned()
                }
            })
            .collect();

        info!(
            "split tensor argument {i} into {chunks} chunks of shapes {:?}",
            pieces.iter().map(|p| p.shape().to_vec()).collect::<Vec<_>>()
        );

        if mask && offsets.is_none() {
            offsets = Some(ranges);
        }

        split.push(SplitArg::Chunks(pieces.into_iter().map(Value::Tensor).collect()));
    }

    Ok(MicrobatchSplit {
        chunks,
        args: split,
        offsets,
    })
}

fn batch_axis(arg: usize, tensor: &Tensor, batch_dim: Option<usize>) -> Result<Axis> {
    let Some(dim) = batch_dim else {
        return Err(PipeError::Config(format!(
            "batch dimension not specified for arg {arg}"
        )));
    };

    if dim >= tensor.ndim() {
        return Err(PipeError::Config(format!(
            "batch dimension {dim} out of range for arg {arg} with {} dimensions",
            tensor.ndim()
        )));
    }

    Ok(Axis(dim))
}

/// Concatenates per-microbatch outputs along axis 0, in microbatch order.
///
/// With `offsets` (masking mode) each output is first cut down to its
/// microbatch's `(start, end)` range.
pub fn reassemble(outputs: &[Tensor], offsets: Option<&[(usize, usize)]>) -> Result<Tensor> {
    if outputs.is_empty() {
        return Err(PipeError::Config("no microbatch outputs to reassemble".into()));
    }

    if outputs.iter().any(|out| out.ndim() == 0) {
        return Err(PipeError::Config(
            "microbatch outputs must have a batch dimension".into(),
        ));
    }

    let views = match offsets {
        None => outputs.iter().map(|out| out.view()).collect::<Vec<_>>(),
        Some(offsets) => {
            if offsets.len() != outputs.len() {
                return Err(PipeError::Config(format!(
                    "recorded {} offsets for {} outputs",
                    offsets.len(),
                    outputs.len()
                )));
            }

            let mut views = Vec::with_capacity(outputs.len());
            for (out, &(start, end)) in outputs.iter().zip(offsets) {
                let len = out.len_of(Axis(0));
                if end > len {
                    return Err(PipeError::ShapeMismatch {
                        arg: 0,
                        expected: end,
                        got: len,
                    });
                }
                views.push(out.slice_axis(Axis(0), Slice::from(start..end)));
            }
            views
        }
    };

    concatenate(Axis(0), &views)
        .map_err(|e| PipeError::Config(format!("cannot concatenate microbatch outputs: {e}")))
}

//! Fixed sinusoidal position encodings.
//!
//! Tables are laid out as `(seq_len, dim)` with sine on even columns and
//! cosine on odd columns. Nothing here is trainable.

use candle_core::{DType, Device, Error, Result, Tensor};

const BASE: f64 = 10_000.0;

/// Build the `(seq_len, dim)` encoding table on `device`.
pub fn sinusoidal_table(seq_len: usize, dim: usize, device: &Device) -> Result<Tensor> {
    if dim == 0 {
        return Err(Error::Msg("positional dim must be greater than zero".into()));
    }
    let mut data = vec![0f32; seq_len * dim];
    for pos in 0..seq_len {
        let row = &mut data[pos * dim..(pos + 1) * dim];
        for pair in 0..dim.div_ceil(2) {
            let exponent = (2 * pair) as f64 / dim as f64;
            let angle = pos as f64 / BASE.powf(exponent);
            row[2 * pair] = angle.sin() as f32;
            if 2 * pair + 1 < dim {
                row[2 * pair + 1] = angle.cos() as f32;
            }
        }
    }
    Tensor::from_vec(data, (seq_len, dim), device)
}

/// Add position encodings to a `(batch, seq, dim)` tensor.
pub fn add_positions(hidden: &Tensor) -> Result<Tensor> {
    let (_batch, seq_len, dim) = hidden.dims3()?;
    let table = sinusoidal_table(seq_len, dim, hidden.device())?;
    let table = if hidden.dtype() == DType::F32 {
        table
    } else {
        table.to_dtype(hidden.dtype())?
    };
    hidden.broadcast_add(&table.unsqueeze(0)?)
}

//! Planar I420 to packed RGBA conversion
//!
//! BT.601 limited range, integer arithmetic. Output bytes are `R, G, B, A` with
//! alpha always 255. Pure and stateless: safe to call from any number of threads
//! with independent buffers.

use crate::error::{Error, Result};

/// Borrowed three-plane I420 image
#[derive(Debug, Clone, Copy)]
pub struct I420<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub stride_y: usize,
    pub stride_u: usize,
    pub stride_v: usize,
}

/// Chroma plane dimensions for a luma size (rounded up for odd sizes)
pub fn chroma_dimensions(width: usize, height: usize) -> (usize, usize) {
    (width.div_ceil(2), height.div_ceil(2))
}

/// Tightly packed RGBA stride for `width`. Saturates, so a width no buffer
/// could hold fails the capacity checks instead of wrapping.
pub fn rgba_stride(width: usize) -> usize {
    width.saturating_mul(4)
}

/// Bytes a plane needs to hold `rows` rows of `row_len` with `stride`, or
/// `None` if that overflows `usize`
pub(crate) fn plane_len(stride: usize, row_len: usize, rows: usize) -> Option<usize> {
    match rows.checked_sub(1) {
        None => Some(0),
        Some(last) => stride.checked_mul(last)?.checked_add(row_len),
    }
}

/// Convert `src` into `dst`.
///
/// Fails with [`Error::InvalidArgument`] when either dimension is zero, a stride
/// is shorter than its row, or a source plane or `dst` is too small for the
/// given geometry.
pub fn i420_to_rgba(
    src: &I420<'_>,
    width: usize,
    height: usize,
    dst: &mut [u8],
    dst_stride: usize,
) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidArgument(format!(
            "invalid dimensions {}x{}",
            width, height
        )));
    }
    let (cw, ch) = chroma_dimensions(width, height);

    check_plane("y", src.y.len(), src.stride_y, width, height)?;
    check_plane("u", src.u.len(), src.stride_u, cw, ch)?;
    check_plane("v", src.v.len(), src.stride_v, cw, ch)?;
    check_plane("rgba", dst.len(), dst_stride, rgba_stride(width), height)?;

    for row in 0..height {
        let y_row = &src.y[row * src.stride_y..row * src.stride_y + width];
        let u_row = &src.u[(row / 2) * src.stride_u..(row / 2) * src.stride_u + cw];
        let v_row = &src.v[(row / 2) * src.stride_v..(row / 2) * src.stride_v + cw];
        let out = &mut dst[row * dst_stride..row * dst_stride + rgba_stride(width)];

        for (col, px) in out.chunks_exact_mut(4).enumerate() {
            let (r, g, b) = yuv_to_rgb(y_row[col], u_row[col / 2], v_row[col / 2]);
            px[0] = r;
            px[1] = g;
            px[2] = b;
            px[3] = 255;
        }
    }

    Ok(())
}

fn check_plane(name: &str, len: usize, stride: usize, row_len: usize, rows: usize) -> Result<()> {
    if stride < row_len {
        return Err(Error::InvalidArgument(format!(
            "{} stride {} shorter than row of {} bytes",
            name, stride, row_len
        )));
    }
    let Some(needed) = plane_len(stride, row_len, rows) else {
        return Err(Error::InvalidArgument(format!(
            "{} stride {} overflows over {} rows",
            name, stride, rows
        )));
    };
    if len < needed {
        return Err(Error::InvalidArgument(format!(
            "{} plane too small: need {} bytes, have {}",
            name, needed, len
        )));
    }
    Ok(())
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    (clamp(r), clamp(g), clamp(b))
}

#[inline]
fn clamp(x: i32) -> u8 {
    x.clamp(0, 255) as u8
}

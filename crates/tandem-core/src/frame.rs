//! Media units delivered to observers
//!
//! Both types are handed to observer callbacks by reference and are only valid
//! for the duration of the callback. Clone what needs to be kept.

use bytes::Bytes;

use crate::convert::{self, chroma_dimensions, plane_len, rgba_stride, I420};
use crate::error::{Error, Result};

/// A decoded video frame in I420 layout
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
    pub stride_y: usize,
    pub stride_u: usize,
    pub stride_v: usize,
    pub width: usize,
    pub height: usize,
    /// Capture time (microseconds)
    pub timestamp_us: i64,
}

impl VideoFrame {
    /// Frame with tightly packed planes
    pub fn packed(
        y: Bytes,
        u: Bytes,
        v: Bytes,
        width: usize,
        height: usize,
        timestamp_us: i64,
    ) -> Self {
        let (cw, _) = chroma_dimensions(width, height);
        Self {
            y,
            u,
            v,
            stride_y: width,
            stride_u: cw,
            stride_v: cw,
            width,
            height,
            timestamp_us,
        }
    }

    /// Single-colour frame, mostly useful for tests and probes
    pub fn solid(width: usize, height: usize, yuv: (u8, u8, u8), timestamp_us: i64) -> Self {
        let (cw, ch) = chroma_dimensions(width, height);
        Self::packed(
            Bytes::from(vec![yuv.0; width * height]),
            Bytes::from(vec![yuv.1; cw * ch]),
            Bytes::from(vec![yuv.2; cw * ch]),
            width,
            height,
            timestamp_us,
        )
    }

    pub fn planes(&self) -> I420<'_> {
        I420 {
            y: &self.y,
            u: &self.u,
            v: &self.v,
            stride_y: self.stride_y,
            stride_u: self.stride_u,
            stride_v: self.stride_v,
        }
    }

    /// Check the planes can hold the declared geometry
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid dimensions {}x{}",
                self.width, self.height
            )));
        }
        let (cw, ch) = chroma_dimensions(self.width, self.height);
        let planes = [
            ("y", self.y.len(), self.stride_y, self.width, self.height),
            ("u", self.u.len(), self.stride_u, cw, ch),
            ("v", self.v.len(), self.stride_v, cw, ch),
        ];
        for (name, len, stride, row, rows) in planes {
            let covered = plane_len(stride, row, rows).is_some_and(|needed| len >= needed);
            if stride < row || !covered {
                return Err(Error::InvalidArgument(format!(
                    "{} plane does not cover {}x{}",
                    name, self.width, self.height
                )));
            }
        }
        Ok(())
    }

    /// Convert into a freshly allocated, tightly packed RGBA buffer.
    ///
    /// Returns the buffer and its stride.
    pub fn to_rgba(&self) -> Result<(Vec<u8>, usize)> {
        self.validate()?;
        let stride = rgba_stride(self.width);
        let len = stride.checked_mul(self.height).ok_or_else(|| {
            Error::InvalidArgument(format!("{}x{} frame too large", self.width, self.height))
        })?;
        let mut rgba = vec![0u8; len];
        convert::i420_to_rgba(&self.planes(), self.width, self.height, &mut rgba, stride)?;
        Ok((rgba, stride))
    }
}

/// An encoded audio packet as received off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioPacket {
    pub payload: Bytes,
    pub rtp_timestamp: u32,
    pub sequence_number: u16,
}

impl EncodedAudioPacket {
    pub fn new(payload: Bytes, rtp_timestamp: u32, sequence_number: u16) -> Self {
        Self {
            payload,
            rtp_timestamp,
            sequence_number,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.payload.is_empty() {
            return Err(Error::InvalidArgument("empty audio payload".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_plane_is_rejected() {
        let mut frame = VideoFrame::solid(16, 16, (235, 128, 128), 0);
        assert!(frame.validate().is_ok());
        frame.u = frame.u.slice(..10);
        assert!(frame.validate().is_err());
    }

    #[test]
    fn empty_audio_is_rejected() {
        assert!(EncodedAudioPacket::new(Bytes::new(), 0, 0).validate().is_err());
        assert!(EncodedAudioPacket::new(Bytes::from_static(&[0xfc]), 960, 1)
            .validate()
            .is_ok());
    }
}

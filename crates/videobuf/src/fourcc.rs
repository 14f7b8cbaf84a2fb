// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{fmt, str::FromStr};

/// Four character pixel format code, stored in the byte order it is
/// written in (`b"YUYV"`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const YUYV: FourCC = FourCC(*b"YUYV");
    pub const UYVY: FourCC = FourCC(*b"UYVY");
    pub const GREY: FourCC = FourCC(*b"GREY");
    pub const RGB3: FourCC = FourCC(*b"RGB3");
    pub const BGR3: FourCC = FourCC(*b"BGR3");
    pub const RGBA: FourCC = FourCC(*b"RGBA");
    pub const NV12: FourCC = FourCC(*b"NV12");

    /// Packed bytes per pixel of the first plane, `None` for formats this
    /// crate does not know the layout of.
    pub fn bytes_per_pixel(&self) -> Option<u32> {
        match *self {
            FourCC::GREY | FourCC::NV12 => Some(1),
            FourCC::YUYV | FourCC::UYVY => Some(2),
            FourCC::RGB3 | FourCC::BGR3 => Some(3),
            FourCC::RGBA => Some(4),
            _ => None,
        }
    }

    /// Stride of the first plane for a frame `width` pixels wide.
    pub fn bytesperline(&self, width: u32) -> Option<u32> {
        self.bytes_per_pixel()?.checked_mul(width)
    }

    /// Total payload size of one frame, chroma planes included.
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let luma = self.bytesperline(width)? as usize * height as usize;
        match *self {
            // half resolution interleaved CbCr plane
            FourCC::NV12 => Some(luma + luma / 2),
            _ => Some(luma),
        }
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(code: [u8; 4]) -> FourCC {
        FourCC(code)
    }
}

impl From<u32> for FourCC {
    /// V4L2 encoding: first character in the least significant byte.
    fn from(val: u32) -> FourCC {
        FourCC(val.to_le_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(val: FourCC) -> Self {
        u32::from_le_bytes(val.0)
    }
}

/// Error returned when a string is not a four character code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFourCCError(String);

impl fmt::Display for ParseFourCCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a four character code", self.0)
    }
}

impl std::error::Error for ParseFourCCError {}

impl FromStr for FourCC {
    type Err = ParseFourCCError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| ParseFourCCError(s.to_string()))?;
        if !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(ParseFourCCError(s.to_string()));
        }
        Ok(FourCC(bytes.map(|b| b.to_ascii_uppercase())))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            // never fail formatting, format!() would panic
            Err(_) => self
                .0
                .iter()
                .try_for_each(|&b| write!(f, "{}", std::ascii::escape_default(b))),
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

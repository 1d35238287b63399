//! Core value types for the graphics subsystem.
//!
//! These are the vocabulary shared between the protocol parser, the
//! payload loader, and the [`GraphicsManager`](crate::GraphicsManager):
//! pixel formats, transmission media, grid geometry, and scroll regions.

use serde::{Deserialize, Serialize};

/// Pixel format of transmitted image data.
///
/// The wire encoding uses the bits-per-pixel value for raw formats
/// (`f=24`, `f=32`) and `100` for PNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 3 bytes per pixel: Red, Green, Blue. Always opaque.
    Rgb,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba,
    /// PNG-encoded data; dimensions and pixels come from the decoder.
    Png,
}

impl PixelFormat {
    /// Decode the wire value. `0` selects the protocol default (RGBA).
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 | 32 => Some(Self::Rgba),
            24 => Some(Self::Rgb),
            100 => Some(Self::Png),
            _ => None,
        }
    }

    /// Bytes per decoded pixel. PNG decodes to RGBA.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgba | Self::Png => 4,
        }
    }
}

/// How image payload bytes reach the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionMedium {
    /// Payload bytes arrive inline with the command, possibly chunked.
    Direct,
    /// Payload is a filename; the file is mapped read-only.
    File,
    /// As [`File`](Self::File), but the file is deleted after mapping.
    TempFile,
    /// Payload is a POSIX shared-memory name, unlinked after mapping.
    SharedMemory,
}

impl TransmissionMedium {
    /// Decode the wire byte. `0` selects the protocol default (direct).
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 | b'd' => Some(Self::Direct),
            b'f' => Some(Self::File),
            b't' => Some(Self::TempFile),
            b's' => Some(Self::SharedMemory),
            _ => None,
        }
    }
}

/// Compression applied to the transmitted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// Payload is uncompressed.
    None,
    /// RFC 1950 zlib/DEFLATE stream.
    Zlib,
}

impl Compression {
    /// Decode the wire byte (`o=z`).
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            b'z' => Some(Self::Zlib),
            _ => None,
        }
    }
}

/// Pixel dimensions of one character cell of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSize {
    /// Cell width in pixels.
    pub width: u32,
    /// Cell height in pixels.
    pub height: u32,
}

impl CellSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Grid position of the cursor, in cells.
///
/// The manager reads it to anchor placements and advances it past a
/// freshly placed image; keeping it within screen bounds is the screen's
/// job, not ours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// Column (0-indexed).
    pub x: u32,
    /// Row (0-indexed).
    pub y: u32,
}

impl CursorPosition {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// How a command refers to an existing image.
///
/// A nonzero client id always wins; a client number selects the newest
/// image carrying that number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageKey {
    ClientId(u32),
    ClientNumber(u32),
}

impl std::fmt::Display for ImageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientId(id) => write!(f, "id: {id}"),
            Self::ClientNumber(number) => write!(f, "number: {number}"),
        }
    }
}

/// An axis-aligned rectangle in either UV space ([0, 1], origin at the
/// image's top-left) or NDC ([-1, 1], y-up).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// Parameters of a scroll event applied to placements.
#[derive(Debug, Clone, Copy)]
pub struct ScrollData {
    /// Rows to add to every affected placement's `start_row`.
    pub amt: i32,
    /// Placements whose bottom ends up at or above this row are dropped.
    /// Only consulted when there are no margins.
    pub limit: i32,
    /// When true, only placements fully inside the margin band move, and
    /// movement clips them against the band.
    pub has_margins: bool,
    /// Top row of the scroll region (inclusive).
    pub margin_top: u32,
    /// Bottom row of the scroll region (exclusive for placement bottoms).
    pub margin_bottom: u32,
}

impl ScrollData {
    /// Scroll with no margin band; `limit` bounds survivorship.
    pub fn unbounded(amt: i32, limit: i32) -> Self {
        Self {
            amt,
            limit,
            has_margins: false,
            margin_top: 0,
            margin_bottom: 0,
        }
    }

    /// Scroll confined to the `[margin_top, margin_bottom]` band.
    pub fn with_margins(amt: i32, margin_top: u32, margin_bottom: u32) -> Self {
        Self {
            amt,
            limit: 0,
            has_margins: true,
            margin_top,
            margin_bottom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_wire_values() {
        assert_eq!(PixelFormat::from_wire(0), Some(PixelFormat::Rgba));
        assert_eq!(PixelFormat::from_wire(24), Some(PixelFormat::Rgb));
        assert_eq!(PixelFormat::from_wire(32), Some(PixelFormat::Rgba));
        assert_eq!(PixelFormat::from_wire(100), Some(PixelFormat::Png));
        assert_eq!(PixelFormat::from_wire(16), None);
    }

    #[test]
    fn test_pixel_format_bpp() {
        assert_eq!(PixelFormat::Rgb.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Rgba.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Png.bytes_per_pixel(), 4);
    }

    #[test]
    fn test_transmission_medium_default_is_direct() {
        assert_eq!(
            TransmissionMedium::from_wire(0),
            Some(TransmissionMedium::Direct)
        );
        assert_eq!(
            TransmissionMedium::from_wire(b'd'),
            Some(TransmissionMedium::Direct)
        );
        assert_eq!(TransmissionMedium::from_wire(b'x'), None);
    }

    #[test]
    fn test_compression_wire_values() {
        assert_eq!(Compression::from_wire(0), Some(Compression::None));
        assert_eq!(Compression::from_wire(b'z'), Some(Compression::Zlib));
        assert_eq!(Compression::from_wire(b'g'), None);
    }
}

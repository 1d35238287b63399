//! Payload decoding: zlib inflation and PNG decoding.
//!
//! Both run synchronously on the terminal thread. The zlib path enforces
//! the protocol's exact-size contract: the sender declares the decoded
//! size up front and any mismatch rejects the image. The PNG path is the
//! one place where image dimensions come from the payload instead of the
//! command.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::error::GraphicsError;

/// Result of decoding a PNG payload. Pixels are always RGBA.
#[derive(Debug)]
pub struct DecodedPng {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Inflate an RFC 1950 zlib stream whose decompressed length must equal
/// `expected_size` exactly.
pub fn inflate_payload(data: &[u8], expected_size: usize) -> Result<Vec<u8>, GraphicsError> {
    let mut out = Vec::with_capacity(expected_size);
    // Read one byte past the expected size so an oversized stream is
    // detected without inflating it in full.
    let mut decoder = ZlibDecoder::new(data).take(expected_size as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| GraphicsError::Invalid(format!("failed to inflate image data: {e}")))?;
    if out.len() != expected_size {
        return Err(GraphicsError::Invalid(
            "image data size post inflation does not match expected size".to_string(),
        ));
    }
    Ok(out)
}

/// Decode a PNG payload to RGBA pixels.
///
/// Grayscale and RGB color types are expanded to RGBA; indexed color is
/// rejected.
pub fn decode_png(data: &[u8]) -> Result<DecodedPng, GraphicsError> {
    let decoder = png::Decoder::new(std::io::Cursor::new(data));
    let mut reader = decoder
        .read_info()
        .map_err(|e| GraphicsError::Invalid(format!("PNG decode error: {e}")))?;

    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| GraphicsError::Invalid(format!("PNG frame error: {e}")))?;
    buf.truncate(info.buffer_size());

    let rgba = match info.color_type {
        png::ColorType::Rgba => buf,
        png::ColorType::Rgb => rgb_to_rgba(&buf),
        png::ColorType::GrayscaleAlpha => {
            let mut rgba = Vec::with_capacity(buf.len() * 2);
            for chunk in buf.chunks_exact(2) {
                let (gray, alpha) = (chunk[0], chunk[1]);
                rgba.extend_from_slice(&[gray, gray, gray, alpha]);
            }
            rgba
        }
        png::ColorType::Grayscale => {
            let mut rgba = Vec::with_capacity(buf.len() * 4);
            for &gray in &buf {
                rgba.extend_from_slice(&[gray, gray, gray, 255]);
            }
            rgba
        }
        png::ColorType::Indexed => {
            return Err(GraphicsError::Invalid(
                "PNG indexed color not supported".to_string(),
            ));
        }
    };

    Ok(DecodedPng {
        data: rgba,
        width: info.width,
        height: info.height,
    })
}

/// Expand tightly packed RGB triples to RGBA with alpha=255.
pub fn rgb_to_rgba(rgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for chunk in rgb.chunks_exact(3) {
        rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
    }
    rgba
}

//! Texture upload seam.
//!
//! The manager never talks to a graphics API directly; it hands decoded
//! pixels to a [`GpuBackend`] and keeps only the opaque texture id. The
//! renderer installs its real backend, while tests and headless
//! operation use [`SoftwareGpu`].

/// Texture coordinate wrapping requested at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    /// Clamp sampling to the edge texels.
    ClampToEdge,
    /// Repeat the texture.
    Repeat,
}

/// Owner of GPU textures.
///
/// `send_image_to_gpu` returns a nonzero texture id; `free_texture`
/// returns ownership of that id. Pixel rows are tightly packed; when
/// `is_4byte_aligned` is false the backend must set a 1-byte unpack
/// alignment.
pub trait GpuBackend {
    #[allow(clippy::too_many_arguments)]
    fn send_image_to_gpu(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        is_opaque: bool,
        is_4byte_aligned: bool,
        linear_filter: bool,
        wrap: WrapMode,
    ) -> u32;

    fn free_texture(&mut self, texture_id: u32);
}

/// Backend that allocates ids without touching a GPU.
///
/// Used in tests and when the manager runs ahead of renderer
/// initialization; quota accounting and placement behavior are identical
/// to the real backend.
#[derive(Debug, Default)]
pub struct SoftwareGpu {
    next_texture_id: u32,
    live: u32,
}

impl SoftwareGpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of textures currently allocated and not freed.
    pub fn live_textures(&self) -> u32 {
        self.live
    }
}

impl GpuBackend for SoftwareGpu {
    fn send_image_to_gpu(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
        _is_opaque: bool,
        _is_4byte_aligned: bool,
        _linear_filter: bool,
        _wrap: WrapMode,
    ) -> u32 {
        self.next_texture_id += 1;
        self.live += 1;
        self.next_texture_id
    }

    fn free_texture(&mut self, texture_id: u32) {
        if texture_id != 0 {
            self.live = self.live.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_gpu_allocates_sequential_ids() {
        let mut gpu = SoftwareGpu::new();
        let a = gpu.send_image_to_gpu(&[], 1, 1, false, true, false, WrapMode::ClampToEdge);
        let b = gpu.send_image_to_gpu(&[], 1, 1, false, true, false, WrapMode::ClampToEdge);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(gpu.live_textures(), 2);

        gpu.free_texture(a);
        assert_eq!(gpu.live_textures(), 1);
        gpu.free_texture(0); // no-op
        assert_eq!(gpu.live_textures(), 1);
    }
}

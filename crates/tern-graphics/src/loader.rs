//! Payload acquisition and staging.
//!
//! Image bytes arrive either inline (possibly chunked across commands)
//! or through the filesystem: a regular file, a temp file, or a POSIX
//! shared-memory object. Inline bytes accumulate in a growth-capped
//! buffer; filesystem sources are memory-mapped read-shared. A
//! [`LoadState`] owns whichever staging form is active and is dropped
//! wholesale once pixels reach the GPU.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::ffi::OsStrExt;

use crate::error::GraphicsError;

/// Ceiling on bytes transmitted for a single image (direct payloads and
/// PNG files alike).
pub const MAX_TRANSMITTED_BYTES: usize = 400_000_000;

/// Ceiling on filename / shm-name length in bytes.
pub const MAX_FILENAME_BYTES: usize = 2048;

/// A read-only shared mapping of a payload source.
pub struct MappedRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MappedRegion {
    /// Map `len` bytes of `file` starting at `offset`, read-only and
    /// shared. The offset is handed to `mmap` as-is, so non-page-aligned
    /// offsets fail the same way they would in the kernel.
    pub fn map(file: &File, len: usize, offset: u64) -> std::io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl std::ops::Deref for MappedRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion").field("len", &self.len).finish()
    }
}

/// Transient staging for an image between its first chunk and GPU
/// upload.
///
/// Exactly one of the inline buffer or the mapping holds the payload at
/// the moment it is consumed; [`LoadState::data`] resolves the view.
#[derive(Debug, Default)]
pub struct LoadState {
    buf: Vec<u8>,
    /// Inline accumulation cap; appending past it is an error unless the
    /// caller allows growth (PNG payloads of undeclared size).
    buf_limit: usize,
    mapped: Option<MappedRegion>,
    /// Expected decoded byte count (`width·height·bpp` for raw formats,
    /// sender-declared or decoder-set for PNG).
    pub expected_size: usize,
    pub is_4byte_aligned: bool,
    pub is_opaque: bool,
}

impl LoadState {
    /// Prepare the inline buffer for `capacity` bytes of accumulation.
    pub fn reserve(&mut self, capacity: usize) {
        self.buf = Vec::with_capacity(capacity.min(MAX_TRANSMITTED_BYTES));
        self.buf_limit = capacity.min(MAX_TRANSMITTED_BYTES);
    }

    /// Append an inline chunk.
    ///
    /// Appending past the reserved cap fails with `EFBIG` unless
    /// `allow_growth` is set and the total stays under
    /// [`MAX_TRANSMITTED_BYTES`]; then the cap doubles as needed.
    pub fn append(&mut self, chunk: &[u8], allow_growth: bool) -> Result<(), GraphicsError> {
        let needed = self.buf.len() + chunk.len();
        if needed > self.buf_limit {
            if !allow_growth || needed > MAX_TRANSMITTED_BYTES {
                return Err(GraphicsError::TooMuchData);
            }
            self.buf_limit = (self.buf_limit * 2).max(needed).min(MAX_TRANSMITTED_BYTES);
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Attach a mapped payload source.
    pub fn attach_mapping(&mut self, mapping: MappedRegion) {
        self.mapped = Some(mapping);
    }

    /// Replace the staged bytes with a decoded buffer.
    pub fn replace_buf(&mut self, decoded: Vec<u8>) {
        self.buf_limit = decoded.len();
        self.buf = decoded;
    }

    /// Release the mapping, keeping any inline buffer.
    pub fn drop_mapping(&mut self) {
        self.mapped = None;
    }

    /// The staged payload: the inline buffer when it holds bytes, else
    /// the mapping, else empty.
    pub fn data(&self) -> &[u8] {
        if self.buf.is_empty() {
            if let Some(mapped) = &self.mapped {
                return mapped;
            }
        }
        &self.buf
    }

    pub fn buf_len(&self) -> usize {
        self.buf.len()
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped.as_ref().map_or(0, |m| m.len())
    }

    /// Drop all staging buffers and mappings.
    pub fn free(&mut self) {
        self.buf = Vec::new();
        self.buf_limit = 0;
        self.mapped = None;
    }
}

/// Open a regular or temp file payload source read-only.
///
/// The name arrives as raw payload bytes; it is interpreted as a native
/// path without UTF-8 validation. Rust opens with close-on-exec.
pub fn open_source_file(name: &[u8]) -> Result<File, GraphicsError> {
    let path = std::path::Path::new(std::ffi::OsStr::from_bytes(name));
    File::open(path).map_err(|e| {
        GraphicsError::PayloadSource(format!(
            "failed to open file for graphics transmission: {e}"
        ))
    })
}

/// Open a POSIX shared-memory object read-only.
pub fn open_shared_memory(name: &[u8]) -> Result<File, GraphicsError> {
    let c_name = std::ffi::CString::new(name).map_err(|_| {
        GraphicsError::PayloadSource("shared memory name contains NUL".to_string())
    })?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
    if fd < 0 {
        return Err(GraphicsError::PayloadSource(format!(
            "failed to open shared memory for graphics transmission: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Unlink a POSIX shared-memory name. Best effort: the mapping keeps the
/// pages alive, so a failure only delays kernel reclamation.
pub fn unlink_shared_memory(name: &[u8]) {
    let Ok(c_name) = std::ffi::CString::new(name) else {
        return;
    };
    let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if ret != 0 {
        log::warn!(
            "failed to unlink shared memory object: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_append_within_reservation() {
        let mut load = LoadState::default();
        load.reserve(8);
        load.append(b"abcd", false).unwrap();
        load.append(b"efgh", false).unwrap();
        assert_eq!(load.data(), b"abcdefgh");
    }

    #[test]
    fn test_append_past_reservation_is_efbig() {
        let mut load = LoadState::default();
        load.reserve(4);
        load.append(b"abcd", false).unwrap();
        let err = load.append(b"e", false).unwrap_err();
        assert_eq!(err.code(), "EFBIG");
    }

    #[test]
    fn test_append_growth_allowed_for_png() {
        let mut load = LoadState::default();
        load.reserve(4);
        load.append(b"abcd", true).unwrap();
        load.append(b"efghij", true).unwrap();
        assert_eq!(load.data(), b"abcdefghij");
    }

    #[test]
    fn test_replace_buf_after_decode() {
        let mut load = LoadState::default();
        load.reserve(4);
        load.append(b"zzzz", false).unwrap();
        load.replace_buf(vec![1, 2, 3]);
        assert_eq!(load.data(), &[1, 2, 3]);
        assert_eq!(load.buf_len(), 3);
    }

    #[test]
    fn test_free_clears_everything() {
        let mut load = LoadState::default();
        load.reserve(4);
        load.append(b"abcd", false).unwrap();
        load.free();
        assert_eq!(load.buf_len(), 0);
        assert_eq!(load.mapped_len(), 0);
        assert!(load.data().is_empty());
    }

    #[test]
    fn test_map_whole_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"pixel data here").unwrap();
        tmp.flush().unwrap();

        let file = open_source_file(tmp.path().as_os_str().as_bytes()).unwrap();
        let len = file.metadata().unwrap().len() as usize;
        let mapping = MappedRegion::map(&file, len, 0).unwrap();
        assert_eq!(&*mapping, b"pixel data here");
    }

    #[test]
    fn test_map_prefix_of_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let file = open_source_file(tmp.path().as_os_str().as_bytes()).unwrap();
        let mapping = MappedRegion::map(&file, 4, 0).unwrap();
        assert_eq!(&*mapping, b"0123");
    }

    #[test]
    fn test_map_unaligned_offset_fails() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 8192]).unwrap();
        tmp.flush().unwrap();

        let file = open_source_file(tmp.path().as_os_str().as_bytes()).unwrap();
        assert!(MappedRegion::map(&file, 16, 3).is_err());
    }

    #[test]
    fn test_open_missing_file_is_ebadf() {
        let err = open_source_file(b"/definitely/not/a/real/path.rgba").unwrap_err();
        assert_eq!(err.code(), "EBADF");
    }

    #[test]
    fn test_open_missing_shm_is_ebadf() {
        let err = open_shared_memory(b"/tern-graphics-test-missing").unwrap_err();
        assert_eq!(err.code(), "EBADF");
    }

    #[test]
    fn test_shm_round_trip() {
        // Create, write, reopen read-only, map, unlink. Skipped where the
        // environment forbids shm (some sandboxes).
        let name = format!("/tern-gfx-{}", std::process::id());
        let c_name = std::ffi::CString::new(name.as_bytes()).unwrap();
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        if fd < 0 {
            return;
        }
        let mut writer = unsafe { File::from_raw_fd(fd) };
        writer.set_len(8).unwrap();
        writer.write_all(b"abcdefgh").unwrap();
        drop(writer);

        let file = open_shared_memory(name.as_bytes()).unwrap();
        let mapping = MappedRegion::map(&file, 8, 0).unwrap();
        assert_eq!(&*mapping, b"abcdefgh");
        unlink_shared_memory(name.as_bytes());
        assert!(open_shared_memory(name.as_bytes()).is_err());
    }
}

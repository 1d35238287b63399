//! Inline-graphics support for the tern terminal emulator.
//!
//! This crate is the image manager behind the terminal's graphics
//! protocol: it receives parsed command records that transmit, place,
//! query, scroll, and delete pixel images on the character grid, and on
//! demand produces a z-ordered render list of textured quads in
//! normalized device coordinates.
//!
//! # Architecture
//!
//! ```text
//! PTY byte stream
//!     │
//!     ▼
//! scanner::ApcScanner                       ← extract APC sequences
//!     │
//!     ▼
//! protocol::kitty::parse_graphics_command   ← parse into command records
//!     │
//!     ▼
//! GraphicsManager::handle_command           ← stage, decode, store, place
//!     │
//!     ▼
//! GraphicsManager::update_layers            ← per-frame render list
//! ```
//!
//! # Memory management
//!
//! Decoded pixels count against a 320 MiB budget. After every add the
//! manager drops images that never loaded or have no placements, then
//! evicts by last access time until back under budget. Payload staging
//! (inline buffers or file/shm mappings) lives only between the first
//! chunk and GPU upload.
//!
//! # Threading
//!
//! Single-threaded cooperative: all state belongs to the terminal
//! thread and command handlers run to completion with synchronous I/O.

pub mod decode;
pub mod error;
pub mod gpu;
pub mod loader;
pub mod manager;
pub mod protocol;
pub mod render;
pub mod scanner;
pub mod types;

// Re-export primary types for convenience.
pub use error::GraphicsError;
pub use gpu::{GpuBackend, SoftwareGpu, WrapMode};
pub use manager::{
    CommandOutcome, GraphicsManager, Image, ImageRef, RefBandCounts, STORAGE_LIMIT,
};
pub use protocol::kitty::{parse_graphics_command, GraphicsCommand};
pub use render::ImageRenderData;
pub use scanner::ApcScanner;
pub use types::{
    CellSize, Compression, CursorPosition, ImageKey, PixelFormat, Rect, ScrollData,
    TransmissionMedium,
};

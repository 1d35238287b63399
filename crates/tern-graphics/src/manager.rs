//! Image storage and lifecycle management.
//!
//! The [`GraphicsManager`] owns every image transmitted through the
//! graphics protocol: it stages and decodes payloads, uploads pixels
//! through the [`GpuBackend`] seam, tracks on-screen placements, applies
//! scroll and delete commands, enforces the storage quota, and builds
//! the per-frame render list.
//!
//! All state belongs to the owning terminal thread; command handlers run
//! to completion with synchronous I/O and there is no locking. The
//! renderer may call [`update_layers`](GraphicsManager::update_layers)
//! from its own context only under an external mutual-exclusion
//! contract with command handling.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Instant;

use crate::decode::{decode_png, inflate_payload};
use crate::error::GraphicsError;
use crate::gpu::{GpuBackend, SoftwareGpu, WrapMode};
use crate::loader::{
    open_shared_memory, open_source_file, unlink_shared_memory, LoadState, MappedRegion,
    MAX_FILENAME_BYTES, MAX_TRANSMITTED_BYTES,
};
use crate::protocol::kitty::GraphicsCommand;
use crate::render::{self, ImageRenderData};
use crate::types::{
    CellSize, Compression, CursorPosition, ImageKey, PixelFormat, Rect, ScrollData,
    TransmissionMedium,
};

/// Storage budget for decoded image data: 320 MiB.
pub const STORAGE_LIMIT: usize = 320 * 1024 * 1024;

/// Maximum image dimension per side, in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 10_000;

/// Staging reservation for PNG payloads of undeclared size.
const PNG_STAGING_RESERVATION: usize = 100 * 1024;

/// One on-screen appearance of an image: grid anchor, source
/// sub-rectangle, fine cell offsets, and layering.
#[derive(Debug, Clone, Default)]
pub struct ImageRef {
    /// Placement id, scoped within the owning image (0 = anonymous).
    pub client_id: u32,
    /// Anchor row; negative once scrolled above the viewport.
    pub start_row: i32,
    /// Anchor column.
    pub start_column: i32,
    /// Source sub-rectangle of the image, in pixels.
    pub src_x: u32,
    pub src_y: u32,
    pub src_width: u32,
    pub src_height: u32,
    /// Sub-cell pixel offset of the anchor, clamped below the cell size.
    pub cell_x_offset: u32,
    pub cell_y_offset: u32,
    /// Requested cell span; 0 means derived from the source size.
    pub num_cols: u32,
    pub num_rows: u32,
    /// Resolved span used for hit tests and layer math.
    pub effective_num_cols: u32,
    pub effective_num_rows: u32,
    /// Layering; values below `i32::MIN / 2` draw under the text layer.
    pub z_index: i32,
    /// Normalized [0, 1] UV rectangle derived from the source rect.
    pub src_rect: Rect,
}

impl ImageRef {
    /// Recompute the UV rectangle from the pixel source rect.
    fn update_src_rect(&mut self, img_width: u32, img_height: u32) {
        self.src_rect.left = self.src_x as f32 / img_width as f32;
        self.src_rect.right = (self.src_x + self.src_width) as f32 / img_width as f32;
        self.src_rect.top = self.src_y as f32 / img_height as f32;
        self.src_rect.bottom = (self.src_y + self.src_height) as f32 / img_height as f32;
    }

    /// Resolve the effective cell span. A zero request derives the span
    /// from the source size plus the sub-cell offset, rounded up.
    fn update_dest_rect(&mut self, num_cols: u32, num_rows: u32, cell: CellSize) {
        let num_cols = if num_cols == 0 {
            let t = self.src_width + self.cell_x_offset;
            (t / cell.width + u32::from(t % cell.width != 0)).max(1)
        } else {
            num_cols
        };
        let num_rows = if num_rows == 0 {
            let t = self.src_height + self.cell_y_offset;
            (t / cell.height + u32::from(t % cell.height != 0)).max(1)
        } else {
            num_rows
        };
        self.effective_num_cols = num_cols;
        self.effective_num_rows = num_rows;
    }
}

/// A decoded bitmap held by the manager, optionally resident on the GPU.
#[derive(Debug)]
pub struct Image {
    internal_id: u64,
    client_id: u32,
    client_number: u32,
    width: u32,
    height: u32,
    texture_id: u32,
    atime: Instant,
    used_storage: usize,
    data_loaded: bool,
    load: LoadState,
    refs: Vec<ImageRef>,
}

impl Image {
    fn new() -> Self {
        Self {
            internal_id: 0,
            client_id: 0,
            client_number: 0,
            width: 0,
            height: 0,
            texture_id: 0,
            atime: Instant::now(),
            used_storage: 0,
            data_loaded: false,
            load: LoadState::default(),
            refs: Vec::new(),
        }
    }

    /// Process-unique id assigned at creation.
    pub fn internal_id(&self) -> u64 {
        self.internal_id
    }

    /// Protocol-level id chosen by the sender; 0 when unset.
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Protocol-level number; 0 when unset.
    pub fn client_number(&self) -> u32 {
        self.client_number
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Opaque GPU handle; 0 before upload.
    pub fn texture_id(&self) -> u32 {
        self.texture_id
    }

    /// True once the payload has been fully assembled and validated.
    pub fn data_loaded(&self) -> bool {
        self.data_loaded
    }

    /// Bytes counted against the storage quota.
    pub fn used_storage(&self) -> usize {
        self.used_storage
    }

    /// Current placements of this image.
    pub fn refs(&self) -> &[ImageRef] {
        &self.refs
    }
}

/// Result of one command: an optional response string for the client and
/// whether the screen needs redrawing.
#[derive(Debug, Default)]
pub struct CommandOutcome {
    /// `G<k=v,…>;<OK|CODE:message>` or `None` when suppressed.
    pub response: Option<String>,
    /// True when the command changed visible state.
    pub screen_dirty: bool,
}

/// Counts of visible placements per z band, from the last layer build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefBandCounts {
    /// Placements drawn below the text layer (`z < i32::MIN / 2`).
    pub below: usize,
    /// Placements with negative z above the below band.
    pub negative: usize,
    /// Placements with non-negative z.
    pub positive: usize,
}

enum AddOutcome {
    /// More chunks expected; no response yet.
    Pending,
    /// Image fully loaded and uploaded; carries its internal id.
    Loaded(u64),
}

/// Effective transmission parameters for one add step. Follow-on chunks
/// resurrect these from the remembered init command.
struct TransmitParams {
    tt: u8,
    format_raw: u32,
    compressed: u8,
    more: bool,
    data_sz: u64,
    data_offset: u64,
}

impl TransmitParams {
    fn of(g: &GraphicsCommand) -> Self {
        Self {
            tt: if g.transmission_type == 0 {
                b'd'
            } else {
                g.transmission_type
            },
            format_raw: if g.format == 0 { 32 } else { g.format },
            compressed: g.compressed,
            more: g.more,
            data_sz: g.data_sz,
            data_offset: g.data_offset,
        }
    }

    fn format(&self) -> Result<PixelFormat, GraphicsError> {
        PixelFormat::from_wire(self.format_raw).ok_or_else(|| {
            GraphicsError::Invalid(format!("unknown image format: {}", self.format_raw))
        })
    }
}

/// Manages image storage, placements, quota enforcement, and the render
/// list for one terminal screen.
pub struct GraphicsManager {
    /// Append-only while a command runs; removal preserves order so
    /// client-number lookups stay newest-first.
    images: Vec<Image>,
    render_data: Vec<ImageRenderData>,
    used_storage: usize,
    storage_limit: usize,
    /// Internal id of the image receiving direct chunks, or 0.
    loading_image: u64,
    /// Init command of the transmission in progress; follow-on chunks
    /// carry only payload and re-use these parameters.
    last_init_command: GraphicsCommand,
    layers_dirty: bool,
    last_scrolled_by: u32,
    band_counts: RefBandCounts,
    internal_id_counter: u64,
    gpu: Box<dyn GpuBackend>,
    /// Host hook for deleting transmitted temp files; falls back to
    /// immediate unlink.
    temp_file_hook: Option<Box<dyn FnMut(&Path)>>,
}

impl Default for GraphicsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphicsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsManager")
            .field("image_count", &self.images.len())
            .field("used_storage", &self.used_storage)
            .field("loading_image", &self.loading_image)
            .field("layers_dirty", &self.layers_dirty)
            .finish_non_exhaustive()
    }
}

impl GraphicsManager {
    /// Create a manager with the default storage limit (320 MiB) and a
    /// software texture backend.
    pub fn new() -> Self {
        Self::with_gpu(Box::new(SoftwareGpu::new()))
    }

    /// Create a manager backed by the given texture owner.
    pub fn with_gpu(gpu: Box<dyn GpuBackend>) -> Self {
        Self {
            images: Vec::new(),
            render_data: Vec::new(),
            used_storage: 0,
            storage_limit: STORAGE_LIMIT,
            loading_image: 0,
            last_init_command: GraphicsCommand::default(),
            layers_dirty: false,
            last_scrolled_by: 0,
            band_counts: RefBandCounts::default(),
            internal_id_counter: 0,
            gpu,
            temp_file_hook: None,
        }
    }

    /// Create a manager with a custom storage limit (tests, constrained
    /// hosts).
    pub fn with_storage_limit(limit: usize) -> Self {
        Self {
            storage_limit: limit,
            ..Self::new()
        }
    }

    /// Install the host's delete-after-close hook for temp files.
    pub fn set_temp_file_hook(&mut self, hook: Box<dyn FnMut(&Path)>) {
        self.temp_file_hook = Some(hook);
    }

    /// Number of resident images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Total bytes counted against the quota.
    pub fn used_storage(&self) -> usize {
        self.used_storage
    }

    /// The configured storage budget.
    pub fn storage_limit(&self) -> usize {
        self.storage_limit
    }

    /// True while a chunked direct transmission is in progress.
    pub fn is_loading(&self) -> bool {
        self.loading_image != 0
    }

    /// Render list from the last [`update_layers`](Self::update_layers)
    /// pass, in draw order.
    pub fn render_data(&self) -> &[ImageRenderData] {
        &self.render_data
    }

    /// Per-band visible placement counts from the last layer build.
    pub fn band_counts(&self) -> RefBandCounts {
        self.band_counts
    }

    /// Look up an image by its protocol id.
    pub fn image_for_client_id(&self, client_id: u32) -> Option<&Image> {
        self.images.iter().find(|img| img.client_id == client_id)
    }

    /// Look up the newest image with the given protocol number.
    pub fn image_for_client_number(&self, number: u32) -> Option<&Image> {
        self.images
            .iter()
            .rev()
            .find(|img| img.client_number == number)
    }

    // --- Command dispatch ---

    /// Process one parsed command record with its decoded payload.
    ///
    /// The cursor is read to anchor placements and advanced past them.
    pub fn handle_command(
        &mut self,
        g: &GraphicsCommand,
        payload: &[u8],
        cursor: &mut CursorPosition,
        cell: CellSize,
    ) -> CommandOutcome {
        let mut dirty = false;

        if g.id != 0 && g.image_number != 0 {
            let err =
                GraphicsError::Invalid("must not specify both image id and image number".into());
            return CommandOutcome {
                response: finish_response(g, false, g.id, g.placement_id, g.image_number, Some(&err)),
                screen_dirty: false,
            };
        }

        let response = match g.action {
            0 | b't' | b'T' | b'q' => {
                let is_query = g.action == b'q';
                let q_iid = g.id;
                if is_query && q_iid == 0 {
                    log::error!("query graphics command without image id");
                    None
                } else {
                    let iid = if is_query { 0 } else { g.id };
                    let result = self.handle_add_command(g, payload, iid, &mut dirty);
                    let (loaded_id, err) = match &result {
                        Ok(AddOutcome::Loaded(id)) => (Some(*id), None),
                        Ok(AddOutcome::Pending) => (None, None),
                        Err(e) => (None, Some(e)),
                    };
                    let response = if is_query {
                        finish_response(g, loaded_id.is_some(), q_iid, 0, 0, err)
                    } else {
                        finish_response(
                            g,
                            loaded_id.is_some(),
                            self.last_init_command.id,
                            self.last_init_command.placement_id,
                            self.last_init_command.image_number,
                            err,
                        )
                    };
                    if self.last_init_command.action == b'T' {
                        if let Some(internal_id) = loaded_id {
                            let init = self.last_init_command.clone();
                            let _ = self.handle_put_command(
                                &init,
                                cursor,
                                Some(internal_id),
                                cell,
                                &mut dirty,
                            );
                        }
                    }
                    if is_query {
                        self.remove_images_if(
                            |img| !img.data_loaded || (img.client_id == 0 && img.refs.is_empty()),
                            0,
                        );
                    }
                    if self.used_storage > self.storage_limit {
                        self.apply_storage_quota(self.storage_limit, loaded_id.unwrap_or(0));
                    }
                    response
                }
            }
            b'p' => {
                if g.id == 0 && g.image_number == 0 {
                    log::error!("put graphics command without image id or number");
                    None
                } else {
                    match self.handle_put_command(g, cursor, None, cell, &mut dirty) {
                        Ok(client_id) => {
                            finish_response(g, true, client_id, g.placement_id, g.image_number, None)
                        }
                        Err(err) => {
                            let iid = match &err {
                                GraphicsError::ImageNotLoaded(client_id) => *client_id,
                                _ => g.id,
                            };
                            finish_response(
                                g,
                                true,
                                iid,
                                g.placement_id,
                                g.image_number,
                                Some(&err),
                            )
                        }
                    }
                }
            }
            b'd' => match self.handle_delete_command(g, cursor, cell, &mut dirty) {
                Ok(()) => None,
                Err(err) => {
                    finish_response(g, false, g.id, g.placement_id, g.image_number, Some(&err))
                }
            },
            other => {
                log::error!("unknown graphics command action: {}", other as char);
                let err =
                    GraphicsError::Invalid(format!("unknown graphics action: {}", other as char));
                finish_response(g, false, g.id, g.placement_id, g.image_number, Some(&err))
            }
        };

        CommandOutcome {
            response,
            screen_dirty: dirty,
        }
    }

    // --- Add path ---

    fn handle_add_command(
        &mut self,
        g: &GraphicsCommand,
        payload: &[u8],
        iid: u32,
        is_dirty: &mut bool,
    ) -> Result<AddOutcome, GraphicsError> {
        let mut current = None;
        match self.add_image(g, payload, iid, is_dirty, &mut current) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // A failed add aborts only its image: staging is freed
                // and the image stays behind, unloaded, for the next
                // trim pass to collect.
                self.loading_image = 0;
                if let Some(internal_id) = current {
                    if let Some(idx) = self.image_index_by_internal_id(internal_id) {
                        let img = &mut self.images[idx];
                        img.data_loaded = false;
                        img.load.free();
                    }
                }
                Err(err)
            }
        }
    }

    fn add_image(
        &mut self,
        g: &GraphicsCommand,
        payload: &[u8],
        iid: u32,
        is_dirty: &mut bool,
        current: &mut Option<u64>,
    ) -> Result<AddOutcome, GraphicsError> {
        let incoming = TransmitParams::of(g);
        let init_img = !(incoming.tt == b'd' && self.loading_image != 0);

        let idx;
        let params;
        if init_img {
            let mut remembered = g.clone();
            remembered.payload = Vec::new();
            remembered.id = iid;
            self.last_init_command = remembered;
            self.loading_image = 0;

            if g.data_width > MAX_IMAGE_DIMENSION || g.data_height > MAX_IMAGE_DIMENSION {
                return Err(GraphicsError::Invalid("image too large".into()));
            }
            self.remove_images_if(
                |img| !img.data_loaded || (img.client_id == 0 && img.refs.is_empty()),
                0,
            );

            let (slot, existing) = self.find_or_create_image(iid);
            idx = slot;
            let internal_id = self.next_internal_id();
            if existing {
                // Replacing in place: release everything the old
                // incarnation held, keep the client id and number.
                let old_texture = self.images[idx].texture_id;
                if old_texture != 0 {
                    self.gpu.free_texture(old_texture);
                }
                self.used_storage = self
                    .used_storage
                    .saturating_sub(self.images[idx].used_storage);
                let img = &mut self.images[idx];
                img.texture_id = 0;
                img.load.free();
                img.data_loaded = false;
                img.refs.clear();
                img.internal_id = internal_id;
                *is_dirty = true;
                self.layers_dirty = true;
            } else {
                let client_id = if iid == 0 && g.image_number != 0 {
                    let assigned = self.get_free_client_id();
                    self.last_init_command.id = assigned;
                    assigned
                } else {
                    iid
                };
                let img = &mut self.images[idx];
                img.internal_id = internal_id;
                img.client_id = client_id;
                img.client_number = g.image_number;
            }
            *current = Some(self.images[idx].internal_id);

            {
                let img = &mut self.images[idx];
                img.atime = Instant::now();
                img.used_storage = 0;
                img.width = g.data_width;
                img.height = g.data_height;
            }

            let format = incoming.format()?;
            match format {
                PixelFormat::Png => {
                    if g.data_sz > MAX_TRANSMITTED_BYTES as u64 {
                        return Err(GraphicsError::Invalid("PNG data size too large".into()));
                    }
                    let img = &mut self.images[idx];
                    img.load.is_4byte_aligned = true;
                    img.load.is_opaque = false;
                    img.load.expected_size = if g.data_sz > 0 {
                        g.data_sz as usize
                    } else {
                        PNG_STAGING_RESERVATION
                    };
                }
                PixelFormat::Rgb | PixelFormat::Rgba => {
                    let expected = g.data_width as usize
                        * g.data_height as usize
                        * format.bytes_per_pixel();
                    if expected == 0 {
                        return Err(GraphicsError::Invalid(
                            "zero width/height not allowed".into(),
                        ));
                    }
                    let img = &mut self.images[idx];
                    img.load.expected_size = expected;
                    img.load.is_4byte_aligned =
                        format == PixelFormat::Rgba || g.data_width % 4 == 0;
                    img.load.is_opaque = format == PixelFormat::Rgb;
                }
            }

            if incoming.tt == b'd' {
                if g.more {
                    self.loading_image = self.images[idx].internal_id;
                }
                let headroom = if g.compressed != 0 { 1024 } else { 10 };
                let img = &mut self.images[idx];
                let capacity = img.load.expected_size + headroom;
                img.load.reserve(capacity);
            }
            params = incoming;
        } else {
            self.last_init_command.more = g.more;
            self.last_init_command.payload_sz = payload.len() as u32;
            params = TransmitParams::of(&self.last_init_command);
            match self.image_index_by_internal_id(self.loading_image) {
                Some(slot) => {
                    idx = slot;
                    *current = Some(self.loading_image);
                }
                None => {
                    self.loading_image = 0;
                    return Err(GraphicsError::OrphanChunk);
                }
            }
        }

        // Acquire the payload.
        let format = params.format()?;
        match TransmissionMedium::from_wire(params.tt) {
            Some(TransmissionMedium::Direct) => {
                let img = &mut self.images[idx];
                img.load.append(payload, format == PixelFormat::Png)?;
                if !params.more {
                    img.data_loaded = true;
                    self.loading_image = 0;
                }
            }
            Some(medium) => {
                if payload.len() > MAX_FILENAME_BYTES {
                    return Err(GraphicsError::Invalid("filename too long".into()));
                }
                let file = match medium {
                    TransmissionMedium::SharedMemory => open_shared_memory(payload)?,
                    _ => open_source_file(payload)?,
                };
                let len = if params.data_sz > 0 {
                    params.data_sz as usize
                } else {
                    file.metadata()
                        .map_err(|e| {
                            GraphicsError::PayloadSource(format!(
                                "failed to stat payload file: {e}"
                            ))
                        })?
                        .len() as usize
                };
                let mapping = MappedRegion::map(&file, len, params.data_offset);
                drop(file);
                // The source is transient: the temp file goes away and
                // the shm name is unlinked whether or not mapping
                // succeeded; the mapping keeps the pages alive.
                match medium {
                    TransmissionMedium::TempFile => self.dispose_temp_file(payload),
                    TransmissionMedium::SharedMemory => unlink_shared_memory(payload),
                    _ => {}
                }
                let mapping = mapping.map_err(|e| {
                    GraphicsError::PayloadSource(format!("failed to map image file: {e}"))
                })?;
                let img = &mut self.images[idx];
                img.load.attach_mapping(mapping);
                img.data_loaded = true;
            }
            None => {
                return Err(GraphicsError::Invalid(format!(
                    "unknown transmission type: {}",
                    params.tt as char
                )));
            }
        }

        if !self.images[idx].data_loaded {
            return Ok(AddOutcome::Pending);
        }
        self.loading_image = 0;

        // Decode and validate.
        let compression = Compression::from_wire(params.compressed).ok_or_else(|| {
            GraphicsError::Invalid(format!(
                "unknown image compression: {}",
                params.compressed as char
            ))
        })?;
        let needs_processing = compression == Compression::Zlib || format == PixelFormat::Png;
        if compression == Compression::Zlib {
            let img = &mut self.images[idx];
            let decoded = inflate_payload(img.load.data(), img.load.expected_size)?;
            img.load.replace_buf(decoded);
        }
        if format == PixelFormat::Png {
            let img = &mut self.images[idx];
            let decoded = decode_png(img.load.data())?;
            img.width = decoded.width;
            img.height = decoded.height;
            img.load.expected_size = decoded.data.len();
            img.load.replace_buf(decoded.data);
        }

        {
            let img = &mut self.images[idx];
            if needs_processing {
                if img.load.buf_len() < img.load.expected_size {
                    return Err(GraphicsError::ShortData {
                        actual: img.load.buf_len(),
                        expected: img.load.expected_size,
                    });
                }
                img.load.drop_mapping();
            } else if params.tt == b'd' {
                if img.load.buf_len() < img.load.expected_size {
                    return Err(GraphicsError::ShortData {
                        actual: img.load.buf_len(),
                        expected: img.load.expected_size,
                    });
                }
            } else if img.load.mapped_len() < img.load.expected_size {
                return Err(GraphicsError::ShortData {
                    actual: img.load.mapped_len(),
                    expected: img.load.expected_size,
                });
            }
        }

        let img = &self.images[idx];
        let required = (if img.load.is_opaque { 3 } else { 4 })
            * img.width as usize
            * img.height as usize;
        if img.load.expected_size != required {
            return Err(GraphicsError::Invalid(format!(
                "image dimensions: {}x{} do not match data size: {}, expected size: {}",
                img.width, img.height, img.load.expected_size, required
            )));
        }

        // Upload and release staging.
        let Self {
            images,
            gpu,
            used_storage,
            ..
        } = self;
        let img = &mut images[idx];
        img.texture_id = gpu.send_image_to_gpu(
            img.load.data(),
            img.width,
            img.height,
            img.load.is_opaque,
            img.load.is_4byte_aligned,
            false,
            WrapMode::ClampToEdge,
        );
        img.load.free();
        *used_storage += required;
        img.used_storage = required;
        Ok(AddOutcome::Loaded(img.internal_id))
    }

    // --- Put path ---

    fn handle_put_command(
        &mut self,
        g: &GraphicsCommand,
        cursor: &mut CursorPosition,
        target: Option<u64>,
        cell: CellSize,
        is_dirty: &mut bool,
    ) -> Result<u32, GraphicsError> {
        let idx = match target {
            Some(internal_id) => self.image_index_by_internal_id(internal_id),
            None => {
                if g.id != 0 {
                    self.image_index_by_client_id(g.id)
                } else if g.image_number != 0 {
                    self.image_index_by_client_number(g.image_number)
                } else {
                    None
                }
            }
        };
        let Some(idx) = idx else {
            let key = if g.id != 0 {
                ImageKey::ClientId(g.id)
            } else {
                ImageKey::ClientNumber(g.image_number)
            };
            return Err(GraphicsError::NoSuchImage(key));
        };
        if !self.images[idx].data_loaded {
            return Err(GraphicsError::ImageNotLoaded(self.images[idx].client_id));
        }

        *is_dirty = true;
        self.layers_dirty = true;

        let img = &mut self.images[idx];
        img.atime = Instant::now();
        let (img_width, img_height, img_client_id) = (img.width, img.height, img.client_id);

        let existing = if g.placement_id != 0 && img_client_id != 0 {
            img.refs.iter().position(|r| r.client_id == g.placement_id)
        } else {
            None
        };
        let ref_idx = match existing {
            Some(i) => i,
            None => {
                img.refs.push(ImageRef::default());
                img.refs.len() - 1
            }
        };

        let r = &mut img.refs[ref_idx];
        r.src_x = g.x_offset;
        r.src_y = g.y_offset;
        r.src_width = if g.width != 0 { g.width } else { img_width };
        r.src_height = if g.height != 0 { g.height } else { img_height };
        r.src_width = r.src_width.min(img_width - g.x_offset.min(img_width));
        r.src_height = r.src_height.min(img_height - g.y_offset.min(img_height));
        r.z_index = g.z_index;
        r.start_row = cursor.y as i32;
        r.start_column = cursor.x as i32;
        r.cell_x_offset = g.cell_x_offset.min(cell.width.saturating_sub(1));
        r.cell_y_offset = g.cell_y_offset.min(cell.height.saturating_sub(1));
        r.num_cols = g.num_cells;
        r.num_rows = g.num_lines;
        if img_client_id != 0 {
            r.client_id = g.placement_id;
        }
        r.update_src_rect(img_width, img_height);
        r.update_dest_rect(g.num_cells, g.num_lines, cell);

        // Advance the cursor; the screen clamps it to its bounds.
        cursor.x += r.effective_num_cols;
        cursor.y += r.effective_num_rows - 1;
        Ok(img_client_id)
    }

    // --- Delete path ---

    fn handle_delete_command(
        &mut self,
        g: &GraphicsCommand,
        cursor: &CursorPosition,
        _cell: CellSize,
        is_dirty: &mut bool,
    ) -> Result<(), GraphicsError> {
        let action = g.delete_action;
        let free_images = action.is_ascii_uppercase();
        match action {
            0 | b'a' | b'A' => {
                self.filter_refs(free_images, false, |_, _| true);
            }
            b'i' | b'I' => {
                let (id, placement) = (g.id, g.placement_id);
                self.filter_refs(free_images, false, move |r, img| {
                    id != 0 && img.client_id == id && (placement == 0 || r.client_id == placement)
                });
            }
            b'n' | b'N' => {
                let (number, placement) = (g.image_number, g.placement_id);
                self.filter_refs(free_images, true, move |r, img| {
                    number != 0
                        && img.client_number == number
                        && (placement == 0 || r.client_id == placement)
                });
            }
            b'p' | b'P' => {
                let (x, y) = (g.x_offset as i32 - 1, g.y_offset as i32 - 1);
                self.filter_refs(free_images, false, move |r, _| {
                    ref_covers_cell(r, x, y)
                });
            }
            b'q' | b'Q' => {
                let (x, y, z) = (g.x_offset as i32 - 1, g.y_offset as i32 - 1, g.z_index);
                self.filter_refs(free_images, false, move |r, _| {
                    r.z_index == z && ref_covers_cell(r, x, y)
                });
            }
            b'x' | b'X' => {
                let x = g.x_offset as i32 - 1;
                self.filter_refs(free_images, false, move |r, _| col_span_contains(r, x));
            }
            b'y' | b'Y' => {
                let y = g.y_offset as i32 - 1;
                self.filter_refs(free_images, false, move |r, _| row_span_contains(r, y));
            }
            b'z' | b'Z' => {
                let z = g.z_index;
                self.filter_refs(free_images, false, move |r, _| r.z_index == z);
            }
            b'c' | b'C' => {
                let (x, y) = (cursor.x as i32, cursor.y as i32);
                self.filter_refs(free_images, false, move |r, _| {
                    ref_covers_cell(r, x, y)
                });
            }
            other => {
                log::error!(
                    "unknown graphics command delete action: {}",
                    other as char
                );
                return Err(GraphicsError::Invalid(format!(
                    "unknown delete action: {}",
                    other as char
                )));
            }
        }
        // Even a no-match delete invalidates the screen.
        *is_dirty = true;
        if self.images.is_empty() {
            self.render_data.clear();
        }
        Ok(())
    }

    /// Remove every ref matched by `filter`, newest image first. Images
    /// left without refs are removed when `free_images` is set or when
    /// they carry no client id. With `only_first_image`, stop after the
    /// first image with a match.
    fn filter_refs<F>(&mut self, free_images: bool, only_first_image: bool, filter: F)
    where
        F: Fn(&ImageRef, &Image) -> bool,
    {
        let mut matched = false;
        for i in (0..self.images.len()).rev() {
            let mut refs = std::mem::take(&mut self.images[i].refs);
            let before = refs.len();
            {
                let img = &self.images[i];
                refs.retain(|r| !filter(r, img));
            }
            if refs.len() != before {
                matched = true;
                self.layers_dirty = true;
            }
            self.images[i].refs = refs;
            if self.images[i].refs.is_empty()
                && (free_images || self.images[i].client_id == 0)
            {
                self.remove_image(i);
            }
            if only_first_image && matched {
                break;
            }
        }
    }

    /// Mutate every ref, removing those for which `mutate` returns true.
    fn modify_refs<F>(&mut self, free_images: bool, mut mutate: F)
    where
        F: FnMut(&mut ImageRef, u32, u32) -> bool,
    {
        for i in (0..self.images.len()).rev() {
            let (width, height) = (self.images[i].width, self.images[i].height);
            self.images[i].refs.retain_mut(|r| !mutate(r, width, height));
            if self.images[i].refs.is_empty()
                && (free_images || self.images[i].client_id == 0)
            {
                self.remove_image(i);
            }
        }
    }

    // --- Scroll / clear / rescale ---

    /// Apply a scroll delta to every placement (or, with margins, to
    /// those fully inside the margin band, clipping them against it).
    pub fn scroll_images(&mut self, data: &ScrollData, cell: CellSize) {
        if self.images.is_empty() {
            return;
        }
        self.layers_dirty = true;
        let d = *data;
        if d.has_margins {
            self.modify_refs(true, move |r, width, height| {
                scroll_with_margins(r, width, height, &d, cell)
            });
        } else {
            self.modify_refs(true, move |r, _, _| {
                r.start_row += d.amt;
                r.start_row as i64 + r.effective_num_rows as i64 <= d.limit as i64
            });
        }
    }

    /// Remove placements: all of them, or only those scrolled entirely
    /// above the top of the screen.
    pub fn clear(&mut self, all: bool) {
        if all {
            self.filter_refs(true, false, |_, _| true);
        } else {
            self.filter_refs(true, false, |r, _| {
                r.start_row as i64 + r.effective_num_rows as i64 <= 0
            });
        }
    }

    /// The grid was resized; layers must be rebuilt.
    pub fn resize(&mut self) {
        self.layers_dirty = true;
    }

    /// The cell pixel size changed (font or DPI change). Re-clamps cell
    /// offsets and recomputes effective spans. Must run before the next
    /// [`update_layers`](Self::update_layers).
    pub fn rescale(&mut self, cell: CellSize) {
        self.layers_dirty = true;
        for img in &mut self.images {
            for r in &mut img.refs {
                r.cell_x_offset = r.cell_x_offset.min(cell.width.saturating_sub(1));
                r.cell_y_offset = r.cell_y_offset.min(cell.height.saturating_sub(1));
                let (num_cols, num_rows) = (r.num_cols, r.num_rows);
                r.update_dest_rect(num_cols, num_rows, cell);
            }
        }
    }

    // --- Layer building ---

    /// Rebuild the render list if anything changed since the last call.
    ///
    /// `screen_left`/`screen_top` position the grid origin in NDC;
    /// `dx`/`dy` are the per-cell NDC deltas. Free-floating placements
    /// (no requested span) are sized against the screen pixel dimensions
    /// captured here, so call [`rescale`](Self::rescale) on DPI changes
    /// first. Returns true when the render list was rebuilt and is
    /// non-empty.
    #[allow(clippy::too_many_arguments)]
    pub fn update_layers(
        &mut self,
        scrolled_by: u32,
        screen_left: f32,
        screen_top: f32,
        dx: f32,
        dy: f32,
        num_cols: u32,
        num_rows: u32,
        cell: CellSize,
    ) -> bool {
        if self.last_scrolled_by != scrolled_by {
            self.layers_dirty = true;
        }
        self.last_scrolled_by = scrolled_by;
        if !self.layers_dirty {
            return false;
        }
        self.layers_dirty = false;

        self.band_counts = RefBandCounts::default();
        let screen_width = dx * num_cols as f32;
        let screen_height = dy * num_rows as f32;
        let screen_bottom = screen_top - screen_height;
        let screen_width_px = (num_cols * cell.width) as f32;
        let screen_height_px = (num_rows * cell.height) as f32;
        let y0 = screen_top - dy * scrolled_by as f32;

        self.render_data.clear();
        for img in &self.images {
            for r in &img.refs {
                let top = y0
                    - r.start_row as f32 * dy
                    - dy * r.cell_y_offset as f32 / cell.height as f32;
                let bottom = if r.num_rows > 0 {
                    y0 - (r.start_row + r.num_rows as i32) as f32 * dy
                } else {
                    top - screen_height * r.src_height as f32 / screen_height_px
                };
                if top <= screen_bottom || bottom >= screen_top {
                    continue; // not visible
                }

                let left = screen_left
                    + r.start_column as f32 * dx
                    + dx * r.cell_x_offset as f32 / cell.width as f32;
                let right = if r.num_cols > 0 {
                    screen_left + (r.start_column + r.num_cols as i32) as f32 * dx
                } else {
                    left + screen_width * r.src_width as f32 / screen_width_px
                };

                if r.z_index < i32::MIN / 2 {
                    self.band_counts.below += 1;
                } else if r.z_index < 0 {
                    self.band_counts.negative += 1;
                } else {
                    self.band_counts.positive += 1;
                }

                let dest = Rect {
                    left,
                    top,
                    right,
                    bottom,
                };
                self.render_data.push(ImageRenderData {
                    vertices: render::vertex_quad(&r.src_rect, &dest),
                    z_index: r.z_index,
                    image_id: img.internal_id,
                    texture_id: img.texture_id,
                    group_count: 0,
                });
            }
        }
        if self.render_data.is_empty() {
            return false;
        }
        render::sort_for_draw_order(&mut self.render_data);
        render::assign_group_counts(&mut self.render_data);
        true
    }

    // --- Store internals ---

    fn next_internal_id(&mut self) -> u64 {
        self.internal_id_counter += 1;
        self.internal_id_counter
    }

    fn image_index_by_internal_id(&self, internal_id: u64) -> Option<usize> {
        self.images
            .iter()
            .position(|img| img.internal_id == internal_id)
    }

    fn image_index_by_client_id(&self, client_id: u32) -> Option<usize> {
        self.images.iter().position(|img| img.client_id == client_id)
    }

    /// Newest match wins, so scan from the end.
    fn image_index_by_client_number(&self, number: u32) -> Option<usize> {
        self.images
            .iter()
            .rposition(|img| img.client_number == number)
    }

    fn find_or_create_image(&mut self, client_id: u32) -> (usize, bool) {
        if client_id != 0 {
            if let Some(idx) = self.image_index_by_client_id(client_id) {
                return (idx, true);
            }
        }
        self.images.push(Image::new());
        (self.images.len() - 1, false)
    }

    /// Smallest positive client id not currently in use.
    fn get_free_client_id(&self) -> u32 {
        let mut ids: Vec<u32> = self
            .images
            .iter()
            .map(|img| img.client_id)
            .filter(|&id| id != 0)
            .collect();
        if ids.is_empty() {
            return 1;
        }
        ids.sort_unstable();
        ids.dedup();
        let mut candidate = 1;
        for id in ids {
            if id == candidate {
                candidate += 1;
            } else {
                break;
            }
        }
        candidate
    }

    fn remove_image(&mut self, idx: usize) {
        let img = self.images.remove(idx);
        if img.texture_id != 0 {
            self.gpu.free_texture(img.texture_id);
        }
        self.used_storage = self.used_storage.saturating_sub(img.used_storage);
        self.layers_dirty = true;
        log::debug!(
            "removed image {} ({} bytes), total now {} bytes",
            img.internal_id,
            img.used_storage,
            self.used_storage
        );
    }

    fn remove_images_if<F>(&mut self, predicate: F, skip_internal_id: u64)
    where
        F: Fn(&Image) -> bool,
    {
        for i in (0..self.images.len()).rev() {
            if self.images[i].internal_id != skip_internal_id && predicate(&self.images[i]) {
                self.remove_image(i);
            }
        }
    }

    /// Two-phase quota enforcement: drop images that never loaded or
    /// have no placements (except the one just added), then evict by
    /// last access time, oldest first, until under budget.
    fn apply_storage_quota(&mut self, limit: usize, currently_added: u64) {
        self.remove_images_if(
            |img| !img.data_loaded || img.refs.is_empty(),
            currently_added,
        );
        if self.used_storage < limit {
            return;
        }
        self.images.sort_by(|a, b| b.atime.cmp(&a.atime)); // oldest last
        while self.used_storage > limit && !self.images.is_empty() {
            self.remove_image(self.images.len() - 1);
        }
        if self.images.is_empty() {
            self.used_storage = 0;
        }
    }

    fn dispose_temp_file(&mut self, name: &[u8]) {
        let path = Path::new(std::ffi::OsStr::from_bytes(name));
        if let Some(hook) = self.temp_file_hook.as_mut() {
            hook(path);
        } else if let Err(e) = std::fs::remove_file(path) {
            log::warn!("failed to delete temp file after graphics transmission: {e}");
        }
    }
}

/// True when the ref's column span contains `col` (0-indexed).
fn col_span_contains(r: &ImageRef, col: i32) -> bool {
    r.start_column <= col && (col as i64) < r.start_column as i64 + r.effective_num_cols as i64
}

/// True when the ref's row span contains `row` (0-indexed).
fn row_span_contains(r: &ImageRef, row: i32) -> bool {
    r.start_row <= row && (row as i64) < r.start_row as i64 + r.effective_num_rows as i64
}

fn ref_covers_cell(r: &ImageRef, col: i32, row: i32) -> bool {
    col_span_contains(r, col) && row_span_contains(r, row)
}

fn ref_within_region(r: &ImageRef, margin_top: u32, margin_bottom: u32) -> bool {
    r.start_row >= margin_top as i32
        && r.start_row as i64 + r.effective_num_rows as i64 <= margin_bottom as i64
}

fn ref_outside_region(r: &ImageRef, margin_top: u32, margin_bottom: u32) -> bool {
    r.start_row as i64 + r.effective_num_rows as i64 <= margin_top as i64
        || r.start_row as i64 > margin_bottom as i64
}

/// Move one ref by the scroll amount, clipping it against the margin
/// band. Returns true when the ref must be removed.
fn scroll_with_margins(
    r: &mut ImageRef,
    img_width: u32,
    img_height: u32,
    d: &ScrollData,
    cell: CellSize,
) -> bool {
    if !ref_within_region(r, d.margin_top, d.margin_bottom) {
        return false;
    }
    r.start_row += d.amt;
    if ref_outside_region(r, d.margin_top, d.margin_bottom) {
        return true;
    }
    if r.start_row < d.margin_top as i32 {
        // Moved up: clip the top of the source.
        let clipped_rows = (d.margin_top as i32 - r.start_row) as u32;
        let clip_amt = cell.height * clipped_rows;
        if r.src_height <= clip_amt {
            return true;
        }
        r.src_y += clip_amt;
        r.src_height -= clip_amt;
        r.effective_num_rows -= clipped_rows;
        r.update_src_rect(img_width, img_height);
        r.start_row += clipped_rows as i32;
    } else if r.start_row as i64 + r.effective_num_rows as i64 > d.margin_bottom as i64 {
        // Moved down: clip the bottom of the source.
        let clipped_rows =
            (r.start_row as i64 + r.effective_num_rows as i64 - d.margin_bottom as i64) as u32;
        let clip_amt = cell.height * clipped_rows;
        if r.src_height <= clip_amt {
            return true;
        }
        r.src_height -= clip_amt;
        r.effective_num_rows -= clipped_rows;
        r.update_src_rect(img_width, img_height);
    }
    ref_outside_region(r, d.margin_top, d.margin_bottom)
}

/// Format a command response, or `None` when suppressed.
///
/// Quiet level 1 drops success responses, level 2 drops everything; a
/// command carrying neither id nor number never gets a response, and a
/// successful add stays silent until its last chunk lands.
fn finish_response(
    g: &GraphicsCommand,
    data_loaded: bool,
    iid: u32,
    placement_id: u32,
    image_number: u32,
    error: Option<&GraphicsError>,
) -> Option<String> {
    let is_ok = error.is_none();
    if g.quiet >= 1 && (is_ok || g.quiet > 1) {
        return None;
    }
    if iid == 0 && image_number == 0 {
        return None;
    }
    if is_ok && !data_loaded {
        return None;
    }

    let mut keys = Vec::with_capacity(3);
    if iid != 0 {
        keys.push(format!("i={iid}"));
    }
    if image_number != 0 {
        keys.push(format!("I={image_number}"));
    }
    if placement_id != 0 {
        keys.push(format!("p={placement_id}"));
    }
    let status = match error {
        None => "OK".to_string(),
        Some(err) => format!("{}:{}", err.code(), err),
    };
    Some(format!("G{};{}", keys.join(","), status))
}

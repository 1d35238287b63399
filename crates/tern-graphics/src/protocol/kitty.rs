//! Kitty graphics protocol parser.
//!
//! The Kitty graphics protocol uses APC (Application Program Command)
//! escape sequences to transmit images. The format is:
//!
//! ```text
//! APC G <key>=<value>,<key>=<value>,...;<base64-data> ST
//! ```
//!
//! Where APC = `\x1b_` and ST = `\x1b\\`.
//!
//! Parsing is deliberately permissive: unknown keys are ignored for
//! forward compatibility, and semantic validation (dimension limits,
//! format support, transmission types) is the
//! [`GraphicsManager`](crate::GraphicsManager)'s job, since command
//! records may also be constructed directly by embedders.
//!
//! Reference: <https://sw.kovidgoyal.net/kitty/graphics-protocol/>

use base64::Engine;

use crate::error::GraphicsError;

/// A parsed graphics command record.
///
/// Field names follow the protocol's semantics rather than its
/// single-letter keys; see the key table in [`parse_graphics_command`].
/// Raw wire bytes (`action`, `transmission_type`, `compressed`,
/// `delete_action`, `format`) are kept unvalidated so the dispatcher can
/// apply the protocol's defaulting and rejection rules itself.
#[derive(Debug, Clone, Default)]
pub struct GraphicsCommand {
    /// Command action: `0` (add), `t`, `T`, `q`, `p`, `d`.
    pub action: u8,
    /// Delete selector letter (only meaningful when `action == b'd'`).
    pub delete_action: u8,
    /// Transmission medium byte: `0`/`d`, `f`, `t`, `s`.
    pub transmission_type: u8,
    /// Pixel format: 0 (default RGBA), 24, 32, or 100 (PNG).
    pub format: u32,
    /// Compression byte: `0` (none) or `z` (zlib).
    pub compressed: u8,
    /// More chunks follow in a direct transmission.
    pub more: bool,
    /// Response suppression: 0 all, 1 errors only, 2 none.
    pub quiet: u8,
    /// Client-chosen image id (0 = unset).
    pub id: u32,
    /// Client-chosen image number (0 = unset).
    pub image_number: u32,
    /// Placement id, scoped within an image (0 = unset).
    pub placement_id: u32,
    /// Expected payload size in bytes (file length / decoded size).
    pub data_sz: u64,
    /// Byte offset into a file/shm payload source.
    pub data_offset: u64,
    /// Transmitted image width in pixels.
    pub data_width: u32,
    /// Transmitted image height in pixels.
    pub data_height: u32,
    /// Source sub-rectangle x origin (put) or column selector (delete).
    pub x_offset: u32,
    /// Source sub-rectangle y origin (put) or row selector (delete).
    pub y_offset: u32,
    /// Source sub-rectangle width (0 = full image).
    pub width: u32,
    /// Source sub-rectangle height (0 = full image).
    pub height: u32,
    /// Cell columns to cover (0 = derived from source size).
    pub num_cells: u32,
    /// Cell rows to cover (0 = derived from source size).
    pub num_lines: u32,
    /// Pixel offset within the anchor cell, x.
    pub cell_x_offset: u32,
    /// Pixel offset within the anchor cell, y.
    pub cell_y_offset: u32,
    /// Z-index for layering; very negative values go below text.
    pub z_index: i32,
    /// Decoded payload size of this chunk; maintained by the dispatcher
    /// across multi-chunk transmissions.
    pub payload_sz: u32,
    /// Raw base64 payload bytes as transmitted.
    pub payload: Vec<u8>,
}

impl GraphicsCommand {
    /// Decode the base64 payload into raw bytes.
    pub fn decode_payload(&self) -> Result<Vec<u8>, GraphicsError> {
        if self.payload.is_empty() {
            return Ok(Vec::new());
        }
        let engine = base64::engine::general_purpose::STANDARD;
        engine
            .decode(&self.payload)
            .map_err(GraphicsError::Base64)
    }
}

/// Parse a graphics command from the content between APC `G` and ST.
///
/// The input is the raw bytes after `\x1b_G` and before `\x1b\\`.
/// Format: `key=value,key=value,...;base64data`.
///
/// | key | field | | key | field |
/// |-----|-------|-|-----|-------|
/// | `a` | action | | `x` | x_offset |
/// | `d` | delete_action | | `y` | y_offset |
/// | `t` | transmission_type | | `w` | width |
/// | `f` | format | | `h` | height |
/// | `o` | compressed | | `c` | num_cells |
/// | `m` | more | | `r` | num_lines |
/// | `q` | quiet | | `X` | cell_x_offset |
/// | `i` | id | | `Y` | cell_y_offset |
/// | `I` | image_number | | `z` | z_index |
/// | `p` | placement_id | | `S` | data_sz |
/// | `s` | data_width | | `O` | data_offset |
/// | `v` | data_height | | | |
///
/// # Errors
///
/// Returns [`GraphicsError::Parse`] on non-UTF-8 input, a pair without
/// `=`, or an unparsable numeric value.
pub fn parse_graphics_command(input: &[u8]) -> Result<GraphicsCommand, GraphicsError> {
    let input_str = std::str::from_utf8(input)
        .map_err(|e| GraphicsError::Parse(format!("invalid UTF-8: {e}")))?;

    let mut cmd = GraphicsCommand::default();

    // Split on ';' to separate key-value pairs from payload
    let (params_str, payload_str) = match input_str.find(';') {
        Some(pos) => (&input_str[..pos], &input_str[pos + 1..]),
        None => (input_str, ""),
    };

    if !payload_str.is_empty() {
        cmd.payload = payload_str.as_bytes().to_vec();
    }

    for pair in params_str.split(',') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.find('=') {
            Some(pos) => (&pair[..pos], &pair[pos + 1..]),
            None => {
                return Err(GraphicsError::Parse(format!(
                    "invalid key-value pair: {pair}"
                )));
            }
        };

        match key {
            "a" => cmd.action = first_byte(value),
            "d" => cmd.delete_action = first_byte(value),
            "t" => cmd.transmission_type = first_byte(value),
            "f" => cmd.format = parse_u32(value, "format")?,
            "o" => cmd.compressed = first_byte(value),
            "m" => cmd.more = value == "1",
            "q" => {
                cmd.quiet = value
                    .parse::<u8>()
                    .map_err(|e| GraphicsError::Parse(format!("invalid quiet: {e}")))?;
            }
            "i" => cmd.id = parse_u32(value, "image id")?,
            "I" => cmd.image_number = parse_u32(value, "image number")?,
            "p" => cmd.placement_id = parse_u32(value, "placement id")?,
            "S" => cmd.data_sz = parse_u64(value, "data size")?,
            "O" => cmd.data_offset = parse_u64(value, "data offset")?,
            "s" => cmd.data_width = parse_u32(value, "data width")?,
            "v" => cmd.data_height = parse_u32(value, "data height")?,
            "x" => cmd.x_offset = parse_u32(value, "x offset")?,
            "y" => cmd.y_offset = parse_u32(value, "y offset")?,
            "w" => cmd.width = parse_u32(value, "source width")?,
            "h" => cmd.height = parse_u32(value, "source height")?,
            "c" => cmd.num_cells = parse_u32(value, "columns")?,
            "r" => cmd.num_lines = parse_u32(value, "rows")?,
            "X" => cmd.cell_x_offset = parse_u32(value, "cell x offset")?,
            "Y" => cmd.cell_y_offset = parse_u32(value, "cell y offset")?,
            "z" => {
                cmd.z_index = value
                    .parse::<i32>()
                    .map_err(|e| GraphicsError::Parse(format!("invalid z-index: {e}")))?;
            }
            // Ignore unknown keys for forward compatibility
            _ => {
                log::trace!("ignoring unknown graphics key: {key}={value}");
            }
        }
    }

    Ok(cmd)
}

/// First byte of the value, or 0 when empty.
fn first_byte(value: &str) -> u8 {
    value.as_bytes().first().copied().unwrap_or(0)
}

/// Parse a string as u32, providing a contextual error message.
fn parse_u32(value: &str, context: &str) -> Result<u32, GraphicsError> {
    value
        .parse::<u32>()
        .map_err(|e| GraphicsError::Parse(format!("invalid {context}: {e}")))
}

/// Parse a string as u64, providing a contextual error message.
fn parse_u64(value: &str, context: &str) -> Result<u64, GraphicsError> {
    value
        .parse::<u64>()
        .map_err(|e| GraphicsError::Parse(format!("invalid {context}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_transmit() {
        let input = b"a=t,f=32,s=100,v=50,i=1;AAAA";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.action, b't');
        assert_eq!(cmd.format, 32);
        assert_eq!(cmd.data_width, 100);
        assert_eq!(cmd.data_height, 50);
        assert_eq!(cmd.id, 1);
        assert_eq!(cmd.payload, b"AAAA");
    }

    #[test]
    fn test_parse_transmit_and_display() {
        let input = b"a=T,f=24,s=200,v=100,i=5;AQID";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.action, b'T');
        assert_eq!(cmd.format, 24);
        assert_eq!(cmd.data_width, 200);
        assert_eq!(cmd.data_height, 100);
        assert_eq!(cmd.id, 5);
    }

    #[test]
    fn test_parse_put() {
        let input = b"a=p,i=3,p=1,c=10,r=5,x=2,y=4,w=64,h=32,X=3,Y=7,z=-1";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.action, b'p');
        assert_eq!(cmd.id, 3);
        assert_eq!(cmd.placement_id, 1);
        assert_eq!(cmd.num_cells, 10);
        assert_eq!(cmd.num_lines, 5);
        assert_eq!(cmd.x_offset, 2);
        assert_eq!(cmd.y_offset, 4);
        assert_eq!(cmd.width, 64);
        assert_eq!(cmd.height, 32);
        assert_eq!(cmd.cell_x_offset, 3);
        assert_eq!(cmd.cell_y_offset, 7);
        assert_eq!(cmd.z_index, -1);
    }

    #[test]
    fn test_parse_delete() {
        let input = b"a=d,d=a";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.action, b'd');
        assert_eq!(cmd.delete_action, b'a');
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn test_parse_delete_by_point() {
        let input = b"a=d,d=P,x=3,y=1";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.delete_action, b'P');
        assert_eq!(cmd.x_offset, 3);
        assert_eq!(cmd.y_offset, 1);
    }

    #[test]
    fn test_parse_chunked_transfer() {
        let chunk1 = b"a=t,f=32,s=100,v=50,i=1,m=1;AAAA";
        let cmd1 = parse_graphics_command(chunk1).unwrap();
        assert!(cmd1.more);

        let chunk2 = b"m=0;BBBB";
        let cmd2 = parse_graphics_command(chunk2).unwrap();
        assert!(!cmd2.more);
    }

    #[test]
    fn test_parse_file_transmission() {
        let input = b"a=t,t=f,S=1024,O=512,i=1;L3RtcC9pbWFnZS5wbmc=";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.transmission_type, b'f');
        assert_eq!(cmd.data_sz, 1024);
        assert_eq!(cmd.data_offset, 512);
    }

    #[test]
    fn test_parse_zlib_compression() {
        let input = b"a=t,o=z,f=32,s=10,v=10,i=1;AAAA";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.compressed, b'z');
    }

    #[test]
    fn test_parse_query() {
        let input = b"a=q,i=1,s=1,v=1,f=32;AAAA";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.action, b'q');
    }

    #[test]
    fn test_parse_quiet_mode() {
        let input = b"a=t,q=2,i=1;AAAA";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.quiet, 2);
    }

    #[test]
    fn test_parse_image_number() {
        let input = b"a=t,I=44,f=32,s=1,v=1;AAAA";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.image_number, 44);
        assert_eq!(cmd.id, 0);
    }

    #[test]
    fn test_decode_payload() {
        let input = b"a=t,f=32,s=1,v=1,i=1;AQID";
        let cmd = parse_graphics_command(input).unwrap();
        let decoded = cmd.decode_payload().unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_empty_payload() {
        let input = b"a=d,d=a";
        let cmd = parse_graphics_command(input).unwrap();
        let decoded = cmd.decode_payload().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_invalid_key_value_pair() {
        let input = b"invalid";
        let result = parse_graphics_command(input);
        assert!(result.is_err());
    }

    #[test]
    fn test_negative_z_index() {
        let input = b"a=t,z=-10,i=1;AAAA";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.z_index, -10);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let input = b"a=t,i=1,Q=9,zz=1;AAAA";
        let cmd = parse_graphics_command(input).unwrap();
        assert_eq!(cmd.id, 1);
    }

    // --- Property-based tests ---

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parser_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..1000)) {
                let _ = parse_graphics_command(&bytes);
            }

            #[test]
            fn parser_handles_valid_transmit(
                width in 1u32..4096,
                height in 1u32..4096,
                image_id in 1u32..65535,
            ) {
                let input = format!("a=t,f=32,s={},v={},i={};AQID", width, height, image_id);
                let cmd = parse_graphics_command(input.as_bytes()).unwrap();
                prop_assert_eq!(cmd.action, b't');
                prop_assert_eq!(cmd.data_width, width);
                prop_assert_eq!(cmd.data_height, height);
                prop_assert_eq!(cmd.id, image_id);
            }

            #[test]
            fn parser_handles_put_params(
                cols in 1u32..200,
                rows in 1u32..100,
                z_index in -100i32..100,
            ) {
                let input = format!("a=p,i=1,c={},r={},z={}", cols, rows, z_index);
                let cmd = parse_graphics_command(input.as_bytes()).unwrap();
                prop_assert_eq!(cmd.num_cells, cols);
                prop_assert_eq!(cmd.num_lines, rows);
                prop_assert_eq!(cmd.z_index, z_index);
            }

            #[test]
            fn parser_roundtrips_base64_payload(
                data in prop::collection::vec(any::<u8>(), 0..100)
            ) {
                let engine = base64::engine::general_purpose::STANDARD;
                let encoded = engine.encode(&data);
                let input = format!("a=t,f=32,s=10,v=10,i=1;{}", encoded);
                let cmd = parse_graphics_command(input.as_bytes()).unwrap();
                let decoded = cmd.decode_payload().unwrap();
                prop_assert_eq!(decoded, data);
            }

            #[test]
            fn parser_accepts_utf8_strings(input_str in ".{0,100}") {
                // Any UTF-8 string should not panic the parser
                let _ = parse_graphics_command(input_str.as_bytes());
            }
        }
    }
}

//! Hard limits and grid geometry.

use crate::model::Coord;

/// Side length of the square canvas, in cells.
pub const GRID_SIZE: Coord = 1000;

/// Side length of one spatial-index chunk, in cells.
pub const CHUNK_SIZE: Coord = 100;

/// Chunks per row (and per column).
pub const CHUNKS_PER_ROW: Coord = GRID_SIZE / CHUNK_SIZE;

pub const MAX_SPOTS_PER_CANVAS: usize = 1_000_000;
pub const MAX_WALLET_LEN: usize = 128;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_SIGNATURE_LEN: usize = 256;

pub const MAX_CANVASES: usize = 1024;
pub const MAX_CANVAS_NAME_LEN: usize = 128;

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

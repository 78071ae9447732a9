use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Grid coordinate or extent, in cells.
pub type Coord = i64;

/// Unix milliseconds.
pub type Ms = i64;

/// Inclusive axis-aligned rectangle on the cell grid.
///
/// Occupies every cell `(cx, cy)` with `x <= cx <= max_x()` and `y <= cy <= max_y()`.
/// `width` and `height` are always positive; validation happens before construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: Coord,
    pub y: Coord,
    pub width: Coord,
    pub height: Coord,
}

impl Rect {
    pub fn new(x: Coord, y: Coord, width: Coord, height: Coord) -> Self {
        debug_assert!(width > 0 && height > 0, "Rect must cover at least one cell");
        Self { x, y, width, height }
    }

    /// Build from inclusive corners. Caller guarantees `min <= max` on both axes.
    pub fn from_corners(min_x: Coord, min_y: Coord, max_x: Coord, max_y: Coord) -> Self {
        Self::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
    }

    pub fn max_x(&self) -> Coord {
        self.x + self.width - 1
    }

    pub fn max_y(&self) -> Coord {
        self.y + self.height - 1
    }

    pub fn cells(&self) -> u64 {
        (self.width as u64) * (self.height as u64)
    }

    /// Separating-axis test on inclusive bounds. A shared boundary cell counts as overlap.
    pub fn overlaps(&self, other: &Rect) -> bool {
        let separated = self.max_x() < other.x
            || self.x > other.max_x()
            || self.max_y() < other.y
            || self.y > other.max_y();
        !separated
    }

    #[cfg(test)]
    pub fn contains_cell(&self, cx: Coord, cy: Coord) -> bool {
        self.x <= cx && cx <= self.max_x() && self.y <= cy && cy <= self.max_y()
    }
}

/// A drag selection as the client reports it: corners in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start_x: Coord,
    pub start_y: Coord,
    pub end_x: Coord,
    pub end_y: Coord,
}

impl Selection {
    pub fn new(start_x: Coord, start_y: Coord, end_x: Coord, end_y: Coord) -> Self {
        Self { start_x, start_y, end_x, end_y }
    }

    /// Order the corners. Never clamps; bounds are checked by the caller.
    pub fn normalize(&self) -> Bounds {
        Bounds {
            min_x: self.start_x.min(self.end_x),
            min_y: self.start_y.min(self.end_y),
            max_x: self.start_x.max(self.end_x),
            max_y: self.start_y.max(self.end_y),
        }
    }
}

/// Normalized selection corners, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: Coord,
    pub min_y: Coord,
    pub max_x: Coord,
    pub max_y: Coord,
}

impl Bounds {
    pub fn width(&self) -> u64 {
        self.max_x.abs_diff(self.min_x).saturating_add(1)
    }

    pub fn height(&self) -> u64 {
        self.max_y.abs_diff(self.min_y).saturating_add(1)
    }

    pub fn total_cells(&self) -> u64 {
        self.width().saturating_mul(self.height())
    }

    pub fn to_rect(&self) -> Rect {
        Rect::from_corners(self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// What a spot shows on the canvas. At most one payload is ever set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visual {
    #[default]
    None,
    Image(String),
    Color(String),
}

impl Visual {
    pub fn image_url(&self) -> Option<&str> {
        match self {
            Visual::Image(url) => Some(url),
            _ => None,
        }
    }

    pub fn color_hex(&self) -> Option<&str> {
        match self {
            Visual::Color(hex) => Some(hex),
            _ => None,
        }
    }
}

/// A claimed rectangle. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spot {
    pub id: Ulid,
    pub x: Coord,
    pub y: Coord,
    pub width: Coord,
    pub height: Coord,
    pub visual: Visual,
    pub link_url: Option<String>,
    pub owner_wallet: String,
    pub tx_signature: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Spot {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn cells(&self) -> u64 {
        self.rect().cells()
    }
}

/// Caller-supplied claim, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSpot {
    pub x: Coord,
    pub y: Coord,
    pub width: Coord,
    pub height: Coord,
    pub owner_wallet: String,
    pub image_url: Option<String>,
    pub color_hex: Option<String>,
    pub link_url: Option<String>,
    pub tx_signature: Option<String>,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpotClaimed { spot: Spot },
    AllowanceGranted { wallet: String, allowance: u32 },
    WhitelistRevoked { wallet: String },
    AllowanceConsumed { wallet: String, amount: u32 },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: bool,
    pub has_collision: bool,
    pub conflicting_spots: Vec<Spot>,
}

impl Availability {
    pub fn from_conflicts(conflicting_spots: Vec<Spot>) -> Self {
        Self {
            available: conflicting_spots.is_empty(),
            has_collision: !conflicting_spots.is_empty(),
            conflicting_spots,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_pixels_sold: u64,
    pub total_spots: usize,
    pub unique_owners: usize,
    pub last_updated: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerSummary {
    pub owner_wallet: String,
    pub spots: usize,
    pub pixels: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub owner_wallet: String,
    pub spots: usize,
    pub pixels: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WhitelistStatus {
    pub wallet: String,
    pub is_whitelisted: bool,
    pub allowance: u32,
}

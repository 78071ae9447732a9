use std::collections::BTreeSet;
use std::ops::Deref;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::Chunk;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Normalize a selection and require every corner to lie inside the grid.
pub(crate) fn validate_selection(selection: &Selection) -> Result<Rect, EngineError> {
    let b = selection.normalize();
    let in_grid = |c: Coord| (0..GRID_SIZE).contains(&c);
    if !(in_grid(b.min_x) && in_grid(b.min_y) && in_grid(b.max_x) && in_grid(b.max_y)) {
        return Err(EngineError::OutOfBounds {
            min_x: b.min_x,
            min_y: b.min_y,
            max_x: b.max_x,
            max_y: b.max_y,
        });
    }
    Ok(b.to_rect())
}

/// A claim that passed validation: in-grid rectangle, trimmed owner, one visual.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ValidClaim {
    pub rect: Rect,
    pub owner_wallet: String,
    pub visual: Visual,
    pub link_url: Option<String>,
    pub tx_signature: Option<String>,
}

pub(crate) fn validate_claim(input: NewSpot) -> Result<ValidClaim, EngineError> {
    if input.width <= 0 || input.height <= 0 {
        return Err(EngineError::InvalidInput(format!(
            "width and height must be positive, got {}x{}",
            input.width, input.height
        )));
    }
    let out_of_bounds = || EngineError::OutOfBounds {
        min_x: input.x,
        min_y: input.y,
        max_x: input.x.saturating_add(input.width - 1),
        max_y: input.y.saturating_add(input.height - 1),
    };
    if input.x < 0 || input.y < 0 {
        return Err(out_of_bounds());
    }
    match (input.x.checked_add(input.width), input.y.checked_add(input.height)) {
        (Some(right), Some(bottom)) if right <= GRID_SIZE && bottom <= GRID_SIZE => {}
        _ => return Err(out_of_bounds()),
    }

    let owner_wallet = input.owner_wallet.trim().to_string();
    if owner_wallet.is_empty() {
        return Err(EngineError::InvalidInput("owner_wallet is required".into()));
    }
    if owner_wallet.len() > MAX_WALLET_LEN {
        return Err(EngineError::LimitExceeded("owner_wallet too long"));
    }

    let visual = match (non_empty(input.image_url), non_empty(input.color_hex)) {
        (Some(_), Some(_)) => {
            return Err(EngineError::InvalidInput(
                "set image_url or color_hex, not both".into(),
            ));
        }
        (Some(url), None) => {
            if url.len() > MAX_URL_LEN {
                return Err(EngineError::LimitExceeded("image_url too long"));
            }
            Visual::Image(url)
        }
        (None, Some(hex)) => {
            if !is_color_hex(&hex) {
                return Err(EngineError::InvalidInput(format!(
                    "color_hex must look like #RGB or #RRGGBB, got {hex:?}"
                )));
            }
            Visual::Color(hex)
        }
        (None, None) => Visual::None,
    };

    let link_url = non_empty(input.link_url);
    if link_url.as_ref().is_some_and(|l| l.len() > MAX_URL_LEN) {
        return Err(EngineError::LimitExceeded("link_url too long"));
    }
    let tx_signature = non_empty(input.tx_signature);
    if tx_signature.as_ref().is_some_and(|s| s.len() > MAX_SIGNATURE_LEN) {
        return Err(EngineError::LimitExceeded("tx_signature too long"));
    }

    Ok(ValidClaim {
        rect: Rect::new(input.x, input.y, input.width, input.height),
        owner_wallet,
        visual,
        link_url,
        tx_signature,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn is_color_hex(s: &str) -> bool {
    let Some(digits) = s.strip_prefix('#') else {
        return false;
    };
    matches!(digits.len(), 3 | 6) && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Trim a wallet address the way every whitelist lookup does.
pub(crate) fn normalize_wallet(wallet: &str) -> Result<String, EngineError> {
    let wallet = wallet.trim();
    if wallet.is_empty() {
        return Err(EngineError::InvalidInput("wallet address is required".into()));
    }
    if wallet.len() > MAX_WALLET_LEN {
        return Err(EngineError::LimitExceeded("wallet too long"));
    }
    Ok(wallet.to_string())
}

/// Reject `rect` if any indexed spot overlaps it. Caller holds the chunk locks.
pub(crate) fn check_no_overlap<G>(guards: &[G], rect: &Rect) -> Result<(), EngineError>
where
    G: Deref<Target = Chunk>,
{
    let conflicts = collect_conflicts(guards, rect);
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(EngineError::OverlapConflict(conflicts))
    }
}

// ── Collision search ──────────────────────────────────────────────

/// Ids of indexed spots overlapping `rect`, ascending.
///
/// `guards` are the chunks `rect` touches. A spot spanning several of them is
/// reported once.
pub fn collect_conflicts<G>(guards: &[G], rect: &Rect) -> Vec<Ulid>
where
    G: Deref<Target = Chunk>,
{
    let mut ids = BTreeSet::new();
    for guard in guards {
        for footprint in guard.overlapping(rect) {
            ids.insert(footprint.id);
        }
    }
    ids.into_iter().collect()
}

/// Brute-force search over every spot. The chunk index must agree with this.
pub fn scan_conflicts<'a>(spots: impl IntoIterator<Item = &'a Spot>, rect: &Rect) -> Vec<Ulid> {
    let mut ids: Vec<Ulid> = spots
        .into_iter()
        .filter(|s| s.rect().overlaps(rect))
        .map(|s| s.id)
        .collect();
    ids.sort();
    ids
}

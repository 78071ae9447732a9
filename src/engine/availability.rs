use std::ops::Deref;

use crate::model::*;

use super::conflict::collect_conflicts;
use super::store::{Chunk, SpotStore};

/// Availability of `rect`, with every overlapping spot resolved to its record.
///
/// `guards` must cover every chunk `rect` touches; the caller holds them so the
/// answer is a consistent snapshot of those chunks.
pub fn availability<G>(store: &SpotStore, guards: &[G], rect: &Rect) -> Availability
where
    G: Deref<Target = Chunk>,
{
    let conflicting = collect_conflicts(guards, rect)
        .iter()
        .filter_map(|id| store.get_spot(id))
        .collect();
    Availability::from_conflicts(conflicting)
}

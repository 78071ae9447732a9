use std::collections::{BTreeMap, HashSet};

use ulid::Ulid;

use crate::model::*;

use super::availability::availability;
use super::conflict::{normalize_wallet, validate_selection};
use super::store::chunks_for;
use super::{Engine, EngineError};

impl Engine {
    /// Spots overlapping the selection, read under the touched chunks' read locks.
    pub async fn check_availability(&self, selection: &Selection) -> Result<Availability, EngineError> {
        let rect = validate_selection(selection)?;
        let mut guards = Vec::new();
        for id in chunks_for(&rect) {
            guards.push(self.store.chunk(id).read_owned().await);
        }
        Ok(availability(&self.store, &guards, &rect))
    }

    pub fn selection_info(&self, selection: &Selection) -> Bounds {
        selection.normalize()
    }

    /// Every spot, newest first.
    pub fn list_spots(&self) -> Vec<Spot> {
        let mut spots = self.store.all_spots();
        sort_newest_first(&mut spots);
        spots
    }

    pub fn get_spot(&self, id: &Ulid) -> Result<Spot, EngineError> {
        self.store
            .get_spot(id)
            .ok_or_else(|| EngineError::NotFound(format!("spot {id}")))
    }

    pub fn spots_by_owner(&self, wallet: &str) -> Result<Vec<Spot>, EngineError> {
        let wallet = normalize_wallet(wallet)?;
        let mut spots: Vec<Spot> = self
            .store
            .spots
            .iter()
            .filter(|e| e.value().owner_wallet == wallet)
            .map(|e| e.value().clone())
            .collect();
        sort_newest_first(&mut spots);
        Ok(spots)
    }

    pub fn owner_summary(&self, wallet: &str) -> Result<OwnerSummary, EngineError> {
        let wallet = normalize_wallet(wallet)?;
        let mut summary = OwnerSummary {
            owner_wallet: wallet,
            spots: 0,
            pixels: 0,
        };
        for entry in self.store.spots.iter() {
            if entry.value().owner_wallet == summary.owner_wallet {
                summary.spots += 1;
                summary.pixels = summary.pixels.saturating_add(entry.value().cells());
            }
        }
        Ok(summary)
    }

    /// Recomputed from scratch on every call.
    pub fn get_stats(&self) -> Stats {
        let mut owners = HashSet::new();
        let mut stats = Stats {
            total_pixels_sold: 0,
            total_spots: 0,
            unique_owners: 0,
            last_updated: None,
        };
        for entry in self.store.spots.iter() {
            let spot = entry.value();
            stats.total_spots += 1;
            stats.total_pixels_sold = stats.total_pixels_sold.saturating_add(spot.cells());
            stats.last_updated = stats.last_updated.max(Some(spot.updated_at));
            owners.insert(spot.owner_wallet.clone());
        }
        stats.unique_owners = owners.len();
        stats
    }

    /// Owners by pixels desc, then spot count desc, then wallet asc. Ranks start at 1.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let mut totals: BTreeMap<String, (usize, u64)> = BTreeMap::new();
        for entry in self.store.spots.iter() {
            let spot = entry.value();
            let t = totals.entry(spot.owner_wallet.clone()).or_default();
            t.0 += 1;
            t.1 = t.1.saturating_add(spot.cells());
        }
        let mut rows: Vec<(String, usize, u64)> = totals
            .into_iter()
            .map(|(wallet, (spots, pixels))| (wallet, spots, pixels))
            .collect();
        rows.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)).then(a.0.cmp(&b.0)));
        rows.into_iter()
            .enumerate()
            .map(|(i, (owner_wallet, spots, pixels))| LeaderboardEntry {
                rank: i + 1,
                owner_wallet,
                spots,
                pixels,
            })
            .collect()
    }

    pub async fn whitelist_status(&self, wallet: &str) -> Result<WhitelistStatus, EngineError> {
        let wallet = normalize_wallet(wallet)?;
        let allowance = self.store.whitelist.read().await.get(&wallet).copied();
        Ok(WhitelistStatus {
            is_whitelisted: allowance.is_some(),
            allowance: allowance.unwrap_or(0),
            wallet,
        })
    }
}

/// Newest first: `created_at` descending, ties broken by id descending.
pub fn sort_newest_first(spots: &mut [Spot]) {
    spots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

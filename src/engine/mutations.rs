use std::collections::HashMap;

use tokio::sync::{OwnedRwLockWriteGuard, oneshot};
use tokio::task::JoinError;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_overlap, normalize_wallet, now_ms, validate_claim};
use super::store::{apply_whitelist, chunks_for};
use super::{Engine, EngineError, WalCommand, append_event, publish_claim};

type WhitelistGuard = OwnedRwLockWriteGuard<HashMap<String, u32>>;

fn commit_task_failed(e: JoinError) -> EngineError {
    EngineError::StoreUnavailable(format!("commit task failed: {e}"))
}

impl Engine {
    /// Validate, re-check overlap and record a claim in one critical section.
    ///
    /// Holds the write locks of every chunk the rectangle touches, in ascending
    /// order, from the overlap check until the claim is durable and indexed.
    /// Two overlapping rectangles always share a chunk, so at most one of two
    /// racing claims can pass the check.
    ///
    /// Once the check passes, the append and the index update run in their own
    /// task. A caller that stops waiting cannot leave a durable claim unindexed.
    pub async fn create_spot(&self, input: NewSpot) -> Result<Spot, EngineError> {
        let claim = validate_claim(input)?;
        if self.store.spot_count() >= MAX_SPOTS_PER_CANVAS {
            return Err(EngineError::LimitExceeded("too many spots on canvas"));
        }

        let chunk_ids = chunks_for(&claim.rect);
        let mut guards = Vec::with_capacity(chunk_ids.len());
        for id in &chunk_ids {
            guards.push(self.store.chunk(*id).write_owned().await);
        }

        if let Err(e) = check_no_overlap(&guards, &claim.rect) {
            metrics::counter!(crate::observability::OVERLAP_CONFLICTS_TOTAL).increment(1);
            debug!("claim {:?} by {} rejected: {e}", claim.rect, claim.owner_wallet);
            return Err(e);
        }

        let now = now_ms();
        let spot = Spot {
            id: Ulid::new(),
            x: claim.rect.x,
            y: claim.rect.y,
            width: claim.rect.width,
            height: claim.rect.height,
            visual: claim.visual,
            link_url: claim.link_url,
            owner_wallet: claim.owner_wallet,
            tx_signature: claim.tx_signature,
            created_at: now,
            updated_at: now,
        };

        let store = self.store.clone();
        let wal_tx = self.wal_tx.clone();
        let notify = self.notify.clone();
        let commit = tokio::spawn(async move {
            let event = Event::SpotClaimed { spot: spot.clone() };
            append_event(&wal_tx, &event).await?;
            store.apply_claim(&mut guards, spot.clone());
            drop(guards);

            metrics::counter!(crate::observability::SPOTS_CLAIMED_TOTAL).increment(1);
            info!(
                "spot {} claimed by {} at ({}, {}) {}x{}",
                spot.id, spot.owner_wallet, spot.x, spot.y, spot.width, spot.height
            );
            publish_claim(&notify, &chunk_ids, &event);
            Ok::<_, EngineError>(spot)
        });
        commit.await.map_err(commit_task_failed)?
    }

    /// Append `event` and apply it to the locked whitelist in a task of its own,
    /// so the table never falls behind the log. Returns `wallet`'s allowance after.
    async fn commit_whitelist(
        &self,
        mut table: WhitelistGuard,
        event: Event,
        wallet: String,
    ) -> Result<Option<u32>, EngineError> {
        let wal_tx = self.wal_tx.clone();
        let commit = tokio::spawn(async move {
            append_event(&wal_tx, &event).await?;
            apply_whitelist(&mut table, &event);
            Ok::<_, EngineError>(table.get(&wallet).copied())
        });
        commit.await.map_err(commit_task_failed)?
    }

    async fn lock_whitelist(&self) -> WhitelistGuard {
        self.store.whitelist.clone().write_owned().await
    }

    /// Whitelist a wallet with `allowance` free spots, replacing any previous allowance.
    pub async fn grant_allowance(&self, wallet: &str, allowance: u32) -> Result<WhitelistStatus, EngineError> {
        let wallet = normalize_wallet(wallet)?;
        let table = self.lock_whitelist().await;
        let event = Event::AllowanceGranted { wallet: wallet.clone(), allowance };
        self.commit_whitelist(table, event, wallet.clone()).await?;
        Ok(WhitelistStatus { wallet, is_whitelisted: true, allowance })
    }

    pub async fn revoke_whitelist(&self, wallet: &str) -> Result<(), EngineError> {
        let wallet = normalize_wallet(wallet)?;
        let table = self.lock_whitelist().await;
        if !table.contains_key(&wallet) {
            return Err(EngineError::NotFound(format!("whitelisted wallet {wallet}")));
        }
        let event = Event::WhitelistRevoked { wallet: wallet.clone() };
        self.commit_whitelist(table, event, wallet).await?;
        Ok(())
    }

    /// Spend `amount` of a wallet's free allowance. Never drops below zero.
    pub async fn consume_allowance(&self, wallet: &str, amount: u32) -> Result<WhitelistStatus, EngineError> {
        let wallet = normalize_wallet(wallet)?;
        let table = self.lock_whitelist().await;
        if !table.contains_key(&wallet) {
            return Err(EngineError::NotFound(format!("whitelisted wallet {wallet}")));
        }
        let event = Event::AllowanceConsumed { wallet: wallet.clone(), amount };
        let allowance = self
            .commit_whitelist(table, event, wallet.clone())
            .await?
            .unwrap_or(0);
        Ok(WhitelistStatus { wallet, is_whitelisted: true, allowance })
    }

    /// Rewrite the WAL as one event per spot plus one per whitelisted wallet.
    ///
    /// Holds the whitelist lock and every chunk read lock until the new log is
    /// in place, so no write can land in the old file after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let table = self.store.whitelist.read().await;
        let mut chunk_guards = Vec::with_capacity(self.store.chunks.len());
        for chunk in &self.store.chunks {
            chunk_guards.push(chunk.read().await);
        }

        let mut spots = self.store.all_spots();
        spots.sort_by_key(|s| s.id);
        let mut wallets: Vec<(&String, &u32)> = table.iter().collect();
        wallets.sort();

        let mut events: Vec<Event> = spots
            .into_iter()
            .map(|spot| Event::SpotClaimed { spot })
            .collect();
        events.extend(wallets.into_iter().map(|(wallet, allowance)| Event::AllowanceGranted {
            wallet: wallet.clone(),
            allowance: *allowance,
        }));
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Snapshot of the whitelist table, for tests and admin tooling.
    pub async fn whitelist_entries(&self) -> HashMap<String, u32> {
        self.store.whitelist.read().await.clone()
    }
}

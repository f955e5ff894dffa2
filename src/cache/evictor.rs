//! Cleanup sweep: expiry, generation invalidation and capacity eviction.
//!
//! All three passes run inside the caller's write transaction and only walk
//! indexes forward:
//! - expiry walks the timestamp index and stops at the first live record
//! - generation deletes the tag ranges strictly below and above the current tag
//! - capacity walks the timestamp index oldest-first and drops whole items

use std::collections::HashSet;
use std::ops::ControlFlow;

use tracing::debug;

use crate::store::record::{base_key_of, is_expired};
use crate::store::sqlite::{GenerationRange, StoreError, StoreTxn};

/// Inputs of one sweep.
#[derive(Debug, Clone)]
pub struct SweepPolicy {
    /// Current time, epoch milliseconds.
    pub now: i64,
    /// Generation tag that survives.
    pub generation_tag: String,
    /// Hard bound on stored chunk records.
    pub max_total_chunks: Option<u64>,
}

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub busted: usize,
    pub evicted_items: usize,
    pub evicted_chunks: usize,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.expired + self.busted + self.evicted_chunks
    }
}

/// Run every pass and report what was removed.
pub fn sweep(txn: &StoreTxn<'_>, policy: &SweepPolicy) -> Result<SweepReport, StoreError> {
    let mut report = SweepReport {
        expired: remove_expired(txn, policy.now)?,
        busted: remove_stale_generations(txn, &policy.generation_tag)?,
        ..Default::default()
    };

    if let Some(limit) = policy.max_total_chunks {
        let (items, chunks) = enforce_capacity(txn, limit)?;
        report.evicted_items = items;
        report.evicted_chunks = chunks;
    }

    debug!(
        expired = report.expired,
        busted = report.busted,
        evicted_items = report.evicted_items,
        evicted_chunks = report.evicted_chunks,
        "Sweep complete"
    );
    Ok(report)
}

/// Delete records whose expiry instant has passed.
pub fn remove_expired(txn: &StoreTxn<'_>, now: i64) -> Result<usize, StoreError> {
    let mut expired = Vec::new();
    txn.scan_by_timestamp(|key, timestamp| {
        if is_expired(timestamp, now) {
            expired.push(key.to_string());
            Ok(ControlFlow::Continue(()))
        } else {
            Ok(ControlFlow::Break(()))
        }
    })?;

    for key in &expired {
        txn.delete(key)?;
    }
    Ok(expired.len())
}

/// Delete records written under any other generation tag.
pub fn remove_stale_generations(txn: &StoreTxn<'_>, current: &str) -> Result<usize, StoreError> {
    let below = txn.delete_generation_range(current, GenerationRange::Below)?;
    let above = txn.delete_generation_range(current, GenerationRange::Above)?;
    Ok(below + above)
}

/// Evict whole items, oldest first, until at most `limit` records remain.
///
/// Returns `(items, chunks)` removed.
pub fn enforce_capacity(txn: &StoreTxn<'_>, limit: u64) -> Result<(usize, usize), StoreError> {
    let total = txn.count()?;
    if total <= limit {
        return Ok((0, 0));
    }
    let mut excess = (total - limit) as i64;

    let mut seen: HashSet<String> = HashSet::new();
    let mut victims: Vec<Vec<String>> = Vec::new();
    txn.scan_by_timestamp(|key, _| {
        let Some(base) = base_key_of(key) else {
            // Unparseable key: drop the record itself.
            victims.push(vec![key.to_string()]);
            excess -= 1;
            return Ok(if excess > 0 {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            });
        };
        if !seen.insert(base.to_string()) {
            return Ok(ControlFlow::Continue(()));
        }
        let keys = txn.chunk_keys(base)?;
        excess -= keys.len() as i64;
        victims.push(keys);
        Ok(if excess > 0 {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        })
    })?;

    let items = victims.len();
    let mut chunks = 0;
    for keys in &victims {
        for key in keys {
            if txn.delete(key)? {
                chunks += 1;
            }
        }
    }
    Ok((items, chunks))
}

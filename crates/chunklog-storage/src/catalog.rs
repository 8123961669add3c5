//! Node-wide registry of backup ranges
//!
//! Maps an owner and range ID to the range's secondary log buffer (and,
//! through it, the log). Per owner the ranges live in a vector indexed by
//! range ID that grows in fixed steps.

use crate::secondary::{SecondaryLog, SecondaryLogBuffer};
use chunklog_common::{Error, NodeId, RangeId, RangeKey, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Growth step of the per-owner range vector
const CATALOG_GROWTH: usize = 16;

/// Registry of all backup ranges stored on this node
#[derive(Default)]
pub struct LogCatalog {
    owners: RwLock<HashMap<NodeId, Vec<Option<Arc<SecondaryLogBuffer>>>>>,
}

impl LogCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a range
    pub fn insert_range(&self, key: RangeKey, buffer: Arc<SecondaryLogBuffer>) -> Result<()> {
        let mut owners = self.owners.write();
        let ranges = owners.entry(key.owner).or_default();
        let idx = usize::from(key.range);
        if idx >= ranges.len() {
            let len = (idx / CATALOG_GROWTH + 1) * CATALOG_GROWTH;
            ranges.resize(len, None);
        }
        if ranges[idx].is_some() {
            return Err(Error::RangeAlreadyExists {
                owner: key.owner,
                range: key.range,
            });
        }
        ranges[idx] = Some(buffer);
        debug!("Registered backup range {}", key);
        Ok(())
    }

    pub fn contains(&self, owner: NodeId, range: RangeId) -> bool {
        self.lookup(owner, range).is_some()
    }

    fn lookup(&self, owner: NodeId, range: RangeId) -> Option<Arc<SecondaryLogBuffer>> {
        self.owners
            .read()
            .get(&owner)
            .and_then(|ranges| ranges.get(usize::from(range)))
            .and_then(Clone::clone)
    }

    /// Secondary log buffer of a range
    pub fn get_buffer(&self, owner: NodeId, range: RangeId) -> Result<Arc<SecondaryLogBuffer>> {
        self.lookup(owner, range)
            .ok_or(Error::RangeNotFound { owner, range })
    }

    /// Secondary log of a range
    pub fn get_log(&self, owner: NodeId, range: RangeId) -> Result<Arc<SecondaryLog>> {
        self.get_buffer(owner, range).map(|buffer| buffer.log().clone())
    }

    /// Unregister a range and hand back its buffer; the log stays open
    pub fn remove_buffer_and_log(&self, owner: NodeId, range: RangeId) -> Result<Arc<SecondaryLogBuffer>> {
        let mut owners = self.owners.write();
        let removed = owners
            .get_mut(&owner)
            .and_then(|ranges| ranges.get_mut(usize::from(range)))
            .and_then(Option::take)
            .ok_or(Error::RangeNotFound { owner, range })?;

        if owners.get(&owner).is_some_and(|ranges| ranges.iter().all(Option::is_none)) {
            owners.remove(&owner);
        }
        Ok(removed)
    }

    /// Unregister a range, then close and delete its log
    pub fn remove_and_close_buffer_and_log(&self, owner: NodeId, range: RangeId) -> Result<()> {
        let buffer = self.remove_buffer_and_log(owner, range)?;
        buffer.log().close_and_remove()?;
        info!("Removed backup range {}", RangeKey::new(owner, range));
        Ok(())
    }

    /// Snapshot of all registered buffers, ordered by owner and range
    pub fn buffers(&self) -> Vec<(RangeKey, Arc<SecondaryLogBuffer>)> {
        let owners = self.owners.read();
        let mut all: Vec<_> = owners
            .iter()
            .flat_map(|(owner, ranges)| {
                ranges.iter().enumerate().filter_map(move |(idx, buffer)| {
                    buffer
                        .as_ref()
                        .map(|b| (RangeKey::new(*owner, idx as RangeId), b.clone()))
                })
            })
            .collect();
        all.sort_by_key(|(key, _)| *key);
        all
    }

    /// Snapshot of all registered logs
    pub fn logs(&self) -> Vec<Arc<SecondaryLog>> {
        self.buffers()
            .into_iter()
            .map(|(_, buffer)| buffer.log().clone())
            .collect()
    }

    /// Number of registered ranges
    pub fn len(&self) -> usize {
        self.owners
            .read()
            .values()
            .map(|ranges| ranges.iter().filter(|r| r.is_some()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    fn buffer(ctx: &Arc<crate::context::LogContext>, owner: NodeId, range: RangeId) -> Arc<SecondaryLogBuffer> {
        let log = SecondaryLog::create(ctx.clone(), owner, range, owner, false).unwrap();
        Arc::new(SecondaryLogBuffer::new(Arc::new(log), 1024))
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let catalog = LogCatalog::new();

        catalog.insert_range(RangeKey::new(2, 0), buffer(&ctx, 2, 0)).unwrap();
        catalog.insert_range(RangeKey::new(2, 17), buffer(&ctx, 2, 17)).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get_log(2, 17).unwrap().range(), 17);

        let err = catalog.get_log(2, 3).unwrap_err();
        assert!(err.is_not_found());
        assert!(catalog.get_buffer(9, 0).is_err());

        let dup = catalog.insert_range(RangeKey::new(2, 0), buffer(&ctx, 3, 0));
        assert!(matches!(dup, Err(Error::RangeAlreadyExists { owner: 2, range: 0 })));
    }

    #[test]
    fn test_remove_closes_log() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let catalog = LogCatalog::new();
        let b = buffer(&ctx, 4, 1);
        let name = b.log().file_name();
        catalog.insert_range(RangeKey::new(4, 1), b).unwrap();

        catalog.remove_and_close_buffer_and_log(4, 1).unwrap();
        assert!(catalog.is_empty());
        assert!(!ctx.access().exists(&name));
        assert!(catalog.remove_and_close_buffer_and_log(4, 1).is_err());
    }

    #[test]
    fn test_buffers_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let catalog = LogCatalog::new();
        for (owner, range) in [(3, 2), (1, 5), (3, 0)] {
            catalog
                .insert_range(RangeKey::new(owner, range), buffer(&ctx, owner, range))
                .unwrap();
        }
        let keys: Vec<_> = catalog.buffers().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![RangeKey::new(1, 5), RangeKey::new(3, 0), RangeKey::new(3, 2)]
        );
    }
}

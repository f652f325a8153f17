//! # redb-backed Reference Storage
//!
//! A disk-backed storage collaborator using the redb embedded database.
//!
//! Stored images are encoded references keyed by (site, identity key), so
//! the same entity stored at two sites occupies two rows. Store and purge
//! counters live in a metadata table and survive reopening.

use super::{StorageGateway, StorageTarget, residence_site};
use crate::formats::{LinkReference, reference_from_bytes, reference_to_bytes};
use crate::types::{LinkError, LinkResult};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;

/// Table for images: (site, identity key) -> encoded reference bytes
const IMAGES: TableDefinition<(u32, &[u8]), &[u8]> = TableDefinition::new("images");

/// Table for metadata: key string -> counter
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const STORES: &str = "stores";
const PURGES: &str = "purges";

fn io(e: impl std::fmt::Display) -> LinkError {
    LinkError::Io(e.to_string())
}

pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("images", &self.image_count().unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> LinkResult<Self> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        // create tables up front so readers never see them missing
        {
            let write_txn = db.begin_write().map_err(io)?;
            let _ = write_txn.open_table(IMAGES).map_err(io)?;
            let _ = write_txn.open_table(METADATA).map_err(io)?;
            write_txn.commit().map_err(io)?;
        }

        tracing::debug!(path = %path.as_ref().display(), "redb store opened");
        Ok(Self { db })
    }

    /// Number of stored images.
    pub fn image_count(&self) -> LinkResult<u64> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(IMAGES).map_err(io)?;
        table.len().map_err(io)
    }

    /// Total stores performed over the lifetime of the database.
    pub fn store_count(&self) -> LinkResult<u64> {
        self.counter(STORES)
    }

    /// Total successful purges over the lifetime of the database.
    pub fn purge_count(&self) -> LinkResult<u64> {
        self.counter(PURGES)
    }

    /// Every stored image, ordered by (site, identity key).
    pub fn images(&self) -> LinkResult<Vec<LinkReference>> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(IMAGES).map_err(io)?;

        let mut out = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (_key, value) = entry.map_err(io)?;
            out.push(reference_from_bytes(value.value())?);
        }
        Ok(out)
    }

    fn counter(&self, name: &str) -> LinkResult<u64> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(METADATA).map_err(io)?;
        Ok(table.get(name).map_err(io)?.map(|v| v.value()).unwrap_or(0))
    }
}

fn bump(table: &mut redb::Table<'_, &'static str, u64>, name: &str) -> LinkResult<()> {
    let current = table.get(name).map_err(io)?.map(|v| v.value()).unwrap_or(0);
    table.insert(name, current.saturating_add(1)).map_err(io)?;
    Ok(())
}

impl StorageGateway for RedbStore {
    fn store(&self, reference: &LinkReference, target: StorageTarget) -> LinkResult<()> {
        let identity = reference.identity_key()?;
        let bytes = reference_to_bytes(reference)?;

        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut images = write_txn.open_table(IMAGES).map_err(io)?;
            images
                .insert((target.site.0, identity.as_slice()), bytes.as_slice())
                .map_err(io)?;
            let mut meta = write_txn.open_table(METADATA).map_err(io)?;
            bump(&mut meta, STORES)?;
        }
        write_txn.commit().map_err(io)?;

        tracing::debug!(site = %target.site, "image stored");
        Ok(())
    }

    fn fetch(&self, reference: &LinkReference) -> LinkResult<Option<LinkReference>> {
        let site = residence_site(reference)?;
        let identity = reference.identity_key()?;

        let read_txn = self.db.begin_read().map_err(io)?;
        let images = read_txn.open_table(IMAGES).map_err(io)?;
        match images
            .get((site.0, identity.as_slice()))
            .map_err(io)?
        {
            Some(data) => Ok(Some(reference_from_bytes(data.value())?)),
            None => Ok(None),
        }
    }

    fn purge_primary(&self, reference: &LinkReference) -> LinkResult<()> {
        let site = residence_site(reference)?;
        let identity = reference.identity_key()?;

        let write_txn = self.db.begin_write().map_err(io)?;
        let removed = {
            let mut images = write_txn.open_table(IMAGES).map_err(io)?;
            let removed = images
                .remove((site.0, identity.as_slice()))
                .map_err(io)?
                .is_some();
            if removed {
                let mut meta = write_txn.open_table(METADATA).map_err(io)?;
                bump(&mut meta, PURGES)?;
            }
            removed
        };

        if !removed {
            write_txn.abort().map_err(io)?;
            return Err(LinkError::AlreadyPurged(format!("no image at {site}")));
        }
        write_txn.commit().map_err(io)?;
        tracing::debug!(site = %site, "image purged");
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

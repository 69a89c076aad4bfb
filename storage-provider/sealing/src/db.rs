use std::{path::Path, sync::Mutex};

use primitives_proofs::SectorNumber;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options as DBOptions,
    WriteBatch, WriteOptions, DB as RocksDB,
};

use crate::pipeline::{events::SectorEvent, types::SectorInfo};

#[derive(Debug, thiserror::Error)]
pub enum DBError {
    #[error(transparent)]
    RocksDB(#[from] rocksdb::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("column family {0} is missing")]
    MissingColumnFamily(&'static str),

    #[error("malformed key {0:?} in column family {1}")]
    MalformedKey(Box<[u8]>, &'static str),
}

/// Durable sector checkpoints and event logs.
///
/// A transition that returned `Ok` survives a crash.
pub trait SectorStore: Send + Sync {
    fn get_sector(&self, sector_number: SectorNumber) -> Result<Option<SectorInfo>, DBError>;

    fn list_sectors(&self) -> Result<Vec<SectorInfo>, DBError>;

    /// Allocates a new sector number, numbers are never handed out twice.
    fn next_sector_number(&self) -> Result<SectorNumber, DBError>;

    /// Appends `event` to the sector's log and stores `sector` as its checkpoint, atomically.
    fn commit_transition(&self, sector: &SectorInfo, event: &SectorEvent) -> Result<(), DBError>;

    /// The sector's event log, oldest first.
    fn sector_events(&self, sector_number: SectorNumber) -> Result<Vec<SectorEvent>, DBError>;
}

const SECTORS_CF: &str = "sectors";
const SECTOR_EVENTS_CF: &str = "sector_events";
const COUNTERS_CF: &str = "counters";

const COLUMN_FAMILIES: [&str; 3] = [SECTORS_CF, SECTOR_EVENTS_CF, COUNTERS_CF];

const NEXT_SECTOR_NUMBER_KEY: &[u8] = b"next_sector_number";

pub struct SectorDB {
    database: RocksDB,
    /// Serializes sector number allocation.
    counter_lock: Mutex<()>,
}

impl SectorDB {
    pub fn new<P>(path: P) -> Result<Self, DBError>
    where
        P: AsRef<Path>,
    {
        let mut opts = DBOptions::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = COLUMN_FAMILIES
            .into_iter()
            .map(|cf_name| ColumnFamilyDescriptor::new(cf_name, DBOptions::default()));

        Ok(Self {
            database: RocksDB::open_cf_descriptors(&opts, path, cfs)?,
            counter_lock: Mutex::new(()),
        })
    }

    fn cf_handle(&self, name: &'static str) -> Result<&ColumnFamily, DBError> {
        self.database
            .cf_handle(name)
            .ok_or(DBError::MissingColumnFamily(name))
    }

    fn sync_write(&self, batch: WriteBatch) -> Result<(), DBError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        Ok(self.database.write_opt(batch, &opts)?)
    }

    /// Index the next event of the sector will be stored at.
    fn next_event_index(&self, sector_number: SectorNumber) -> Result<u64, DBError> {
        let cf = self.cf_handle(SECTOR_EVENTS_CF)?;
        let last_key = event_key(sector_number, u64::MAX);

        let mut iter = self
            .database
            .iterator_cf(cf, IteratorMode::From(&last_key, Direction::Reverse));
        let Some(entry) = iter.next() else {
            return Ok(0);
        };
        let (key, _) = entry?;

        match split_event_key(&key) {
            Some((number, index)) if number == sector_number => Ok(index + 1),
            Some(_) => Ok(0),
            None => Err(DBError::MalformedKey(key, SECTOR_EVENTS_CF)),
        }
    }
}

/// Events are keyed by sector number and index, big endian so they sort in log order.
fn event_key(sector_number: SectorNumber, index: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&sector_number.to_be_bytes());
    key[8..].copy_from_slice(&index.to_be_bytes());
    key
}

fn split_event_key(key: &[u8]) -> Option<(SectorNumber, u64)> {
    let number = key.get(..8)?.try_into().ok()?;
    let index = key.get(8..16)?.try_into().ok()?;
    Some((u64::from_be_bytes(number), u64::from_be_bytes(index)))
}

impl SectorStore for SectorDB {
    fn get_sector(&self, sector_number: SectorNumber) -> Result<Option<SectorInfo>, DBError> {
        let Some(sector_slice) = self
            .database
            .get_pinned_cf(self.cf_handle(SECTORS_CF)?, sector_number.to_be_bytes())?
        else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_slice(&sector_slice)?))
    }

    fn list_sectors(&self) -> Result<Vec<SectorInfo>, DBError> {
        self.database
            .iterator_cf(self.cf_handle(SECTORS_CF)?, IteratorMode::Start)
            .map(|entry| -> Result<SectorInfo, DBError> {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    fn next_sector_number(&self) -> Result<SectorNumber, DBError> {
        let _guard = self
            .counter_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let cf = self.cf_handle(COUNTERS_CF)?;

        let next = match self.database.get_pinned_cf(cf, NEXT_SECTOR_NUMBER_KEY)? {
            Some(value) => {
                let bytes = value.as_ref().try_into().map_err(|_| {
                    DBError::MalformedKey(NEXT_SECTOR_NUMBER_KEY.into(), COUNTERS_CF)
                })?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, NEXT_SECTOR_NUMBER_KEY, (next + 1).to_be_bytes());
        self.sync_write(batch)?;

        Ok(next)
    }

    fn commit_transition(&self, sector: &SectorInfo, event: &SectorEvent) -> Result<(), DBError> {
        let index = self.next_event_index(sector.sector_number)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(SECTOR_EVENTS_CF)?,
            event_key(sector.sector_number, index),
            serde_json::to_vec(event)?,
        );
        batch.put_cf(
            self.cf_handle(SECTORS_CF)?,
            sector.sector_number.to_be_bytes(),
            serde_json::to_vec(sector)?,
        );
        self.sync_write(batch)
    }

    fn sector_events(&self, sector_number: SectorNumber) -> Result<Vec<SectorEvent>, DBError> {
        let first_key = event_key(sector_number, 0);
        let mut events = vec![];

        for entry in self.database.iterator_cf(
            self.cf_handle(SECTOR_EVENTS_CF)?,
            IteratorMode::From(&first_key, Direction::Forward),
        ) {
            let (key, value) = entry?;
            match split_event_key(&key) {
                Some((number, _)) if number == sector_number => {
                    events.push(serde_json::from_slice(&value)?)
                }
                Some(_) => break,
                None => return Err(DBError::MalformedKey(key, SECTOR_EVENTS_CF)),
            }
        }

        Ok(events)
    }
}

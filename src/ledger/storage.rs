use std::path::Path;

use log::debug;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::block::Block;

const LATEST_BLOCK_HASH: &str = "latest_block_hash";
const BLOCK_HEIGHT: &str = "block_height";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Storage corrupted: {0}")]
    Corrupted(String),
}

/// Durable storage for ledger blocks
///
/// Blocks live in the `blocks` tree keyed by their big-endian index, so a
/// plain iteration yields them in chain order. Each value is the JSON record
/// `{index, timestamp, data, previousHash, hash}`; JSON is used rather than
/// bincode because the payload is a self-describing value.
pub struct LedgerStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks
    blocks: Tree,

    /// Tree for metadata
    metadata: Tree,
}

impl std::fmt::Debug for LedgerStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStorage")
            .finish()
    }
}

impl LedgerStorage {
    /// Opens (or creates) the ledger storage
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            metadata,
        })
    }

    /// Saves a block to the database and moves the chain head to it
    ///
    /// The block record and both head keys are written in one transaction, so
    /// the store never holds a block the head metadata does not point at.
    /// Call [`LedgerStorage::flush`] afterwards to make the write durable.
    pub fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let key = block.index().to_be_bytes();
        let value = serde_json::to_vec(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let height_bytes = bincode::serialize(&block.index())
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        (&self.blocks, &self.metadata)
            .transaction(|(blocks, metadata)| {
                blocks.insert(&key[..], value.as_slice())?;
                metadata.insert(LATEST_BLOCK_HASH, block.hash().as_bytes())?;
                metadata.insert(BLOCK_HEIGHT, height_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StorageError::DatabaseError(e),
                TransactionError::Abort(()) => {
                    StorageError::Corrupted(format!("write of block {} aborted", block.index()))
                }
            })?;

        debug!("Stored block {} ({})", block.index(), block.hash());
        Ok(())
    }

    /// Gets a block by its index
    pub fn get_block(&self, index: u64) -> Result<Block, StorageError> {
        match self.blocks.get(index.to_be_bytes())? {
            Some(value) => decode_block(&value),
            None => Err(StorageError::NotFound(format!("Block {} not found", index))),
        }
    }

    /// Gets all blocks in chain order
    ///
    /// Unlike a cache, an audit trail cannot drop records it fails to read,
    /// so the first undecodable block aborts the load.
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();

        for result in self.blocks.iter() {
            let (key, value) = result?;
            let block = decode_block(&value).map_err(|e| {
                StorageError::DeserializationError(format!(
                    "block key {}: {}",
                    hex::encode(&key),
                    e
                ))
            })?;

            if key[..] != block.index().to_be_bytes()[..] {
                return Err(StorageError::Corrupted(format!(
                    "block {} stored under key {}",
                    block.index(),
                    hex::encode(&key)
                )));
            }

            blocks.push(block);
        }

        Ok(blocks)
    }

    /// Gets the hash of the latest stored block
    pub fn get_latest_block_hash(&self) -> Result<String, StorageError> {
        if let Some(value) = self.metadata.get(LATEST_BLOCK_HASH)? {
            Ok(String::from_utf8_lossy(&value).to_string())
        } else {
            Err(StorageError::NotFound("Latest block hash not found".to_string()))
        }
    }

    /// Gets the index of the latest stored block
    pub fn get_block_height(&self) -> Result<u64, StorageError> {
        if let Some(value) = self.metadata.get(BLOCK_HEIGHT)? {
            let height: u64 = bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string()))?;

            Ok(height)
        } else {
            Err(StorageError::NotFound("Block height not found".to_string()))
        }
    }

    /// Loads the stored chain and checks it against the head metadata
    ///
    /// Returns an empty vector for a fresh store.
    pub fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let blocks = self.get_all_blocks()?;

        let last = match blocks.last() {
            Some(last) => last,
            None => return Ok(blocks),
        };

        let height = self.get_block_height()?;
        let latest_hash = self.get_latest_block_hash()?;

        if height != last.index() || latest_hash != last.hash() {
            return Err(StorageError::Corrupted(format!(
                "head metadata points at block {} ({}) but the last stored block is {} ({})",
                height,
                latest_hash,
                last.index(),
                last.hash()
            )));
        }

        Ok(blocks)
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_block(value: &[u8]) -> Result<Block, StorageError> {
    serde_json::from_slice(value).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;

use super::block::{Block, BlockError};
use super::storage::{LedgerStorage, StorageError};

/// Reasons an append is refused
///
/// Nothing is applied when an append fails with one of these. The caller
/// should discard the block, read the latest block again and rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkageError {
    #[error("Block index {got} does not follow the chain (expected {expected})")]
    IndexMismatch { expected: u64, got: u64 },

    #[error("Block {index} links to {got}, but the latest block hash is {expected}")]
    PreviousHashMismatch {
        index: u64,
        expected: String,
        got: String,
    },

    #[error("Block {index} carries hash {stored}, but its contents hash to {computed}")]
    HashMismatch {
        index: u64,
        stored: String,
        computed: String,
    },
}

/// First inconsistency found by a verification pass
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("Chain is empty")]
    Empty,

    #[error("Block 0 is not the genesis block")]
    Genesis,

    #[error("Block at position {position} has index {found}")]
    IndexOutOfSequence { position: u64, found: u64 },

    #[error("Block {index} has been altered: stored hash {stored}, computed {computed}")]
    HashMismatch {
        index: u64,
        stored: String,
        computed: String,
    },

    #[error("Block {index} links to {found}, but block {} has hash {expected}", .index - 1)]
    LinkMismatch {
        index: u64,
        expected: String,
        found: String,
    },
}

impl VerificationError {
    /// Position of the offending block, if any
    pub fn index(&self) -> Option<u64> {
        match self {
            VerificationError::Empty => None,
            VerificationError::Genesis => Some(0),
            VerificationError::IndexOutOfSequence { position, .. } => Some(*position),
            VerificationError::HashMismatch { index, .. } => Some(*index),
            VerificationError::LinkMismatch { index, .. } => Some(*index),
        }
    }
}

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Linkage error: {0}")]
    Linkage(#[from] LinkageError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Storage failed to flush block {index}; reopen the ledger before appending")]
    Unsynced { index: u64 },

    #[error("System error: {0}")]
    SystemError(String),
}

/// Append-only, hash-linked chain of blocks
///
/// Cloning a `Ledger` yields another handle onto the same chain. Reads share
/// the lock; appends hold it exclusively for the whole
/// read-latest/validate/persist/push sequence.
#[derive(Debug, Clone)]
pub struct Ledger {
    /// The chain of blocks
    chain: Arc<RwLock<Vec<Block>>>,

    /// Storage for ledger data
    storage: Option<Arc<LedgerStorage>>,

    /// Set when a stored block could not be flushed; memory and disk may
    /// disagree until the ledger is reopened from storage
    unsynced: Arc<AtomicBool>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// Creates an in-memory ledger holding only the genesis block
    pub fn new() -> Self {
        Ledger {
            chain: Arc::new(RwLock::new(vec![Block::genesis()])),
            storage: None,
            unsynced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens a ledger backed by persistent storage
    ///
    /// A fresh store is seeded with the genesis block. An existing chain is
    /// loaded and verified; a chain that fails verification is refused
    /// rather than repaired.
    ///
    /// # Arguments
    ///
    /// * `storage_path` - The path to the storage directory
    pub fn with_storage<P: AsRef<Path>>(storage_path: P) -> Result<Self, LedgerError> {
        let storage = LedgerStorage::new(storage_path)?;
        let mut blocks = storage.load_chain()?;

        if blocks.is_empty() {
            info!("No existing ledger found in storage, creating genesis block");
            let genesis = Block::genesis();
            storage.save_block(&genesis)?;
            storage.flush()?;
            blocks.push(genesis);
        } else {
            if let Err(err) = verify_blocks(&blocks) {
                error!("Stored ledger failed verification: {}", err);
                return Err(err.into());
            }
            info!("Loaded {} blocks from storage", blocks.len());
        }

        Ok(Ledger {
            chain: Arc::new(RwLock::new(blocks)),
            storage: Some(Arc::new(storage)),
            unsynced: Arc::new(AtomicBool::new(false)),
        })
    }

    fn read_chain(&self) -> Result<RwLockReadGuard<'_, Vec<Block>>, LedgerError> {
        self.chain
            .read()
            .map_err(|_| LedgerError::SystemError("ledger lock poisoned".to_string()))
    }

    fn write_chain(&self) -> Result<RwLockWriteGuard<'_, Vec<Block>>, LedgerError> {
        self.chain
            .write()
            .map_err(|_| LedgerError::SystemError("ledger lock poisoned".to_string()))
    }

    /// Gets the last block in the chain
    pub fn latest_block(&self) -> Result<Block, LedgerError> {
        let chain = self.read_chain()?;
        chain
            .last()
            .cloned()
            .ok_or_else(|| LedgerError::SystemError("ledger has no genesis block".to_string()))
    }

    /// Gets the block at `index`, if the chain is that long
    pub fn block(&self, index: u64) -> Result<Option<Block>, LedgerError> {
        let chain = self.read_chain()?;
        Ok(usize::try_from(index).ok().and_then(|i| chain.get(i)).cloned())
    }

    /// Gets a snapshot of the entire chain
    pub fn chain(&self) -> Result<Vec<Block>, LedgerError> {
        Ok(self.read_chain()?.clone())
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.read_chain()?.len())
    }

    /// Appends a block built by the caller
    ///
    /// The block must carry the next index, link to the current latest block
    /// and hash to its own contents. Otherwise it is rejected with a
    /// [`LinkageError`] and the chain is left untouched.
    pub fn add_block(&self, candidate: Block) -> Result<Block, LedgerError> {
        let mut chain = self.write_chain()?;
        self.push_block(&mut chain, candidate)
    }

    /// Records `payload` in a new block stamped with the current time
    ///
    /// Reading the latest block, building the new one and appending it happen
    /// under one lock, so concurrent callers never race on a stale link.
    pub fn append<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Block, LedgerError> {
        self.append_at(Utc::now().timestamp_millis().to_string(), payload)
    }

    /// Like [`Ledger::append`] with a caller-supplied timestamp
    pub fn append_at<T: Serialize + ?Sized>(
        &self,
        timestamp: impl Into<String>,
        payload: &T,
    ) -> Result<Block, LedgerError> {
        let mut chain = self.write_chain()?;

        let (index, previous_hash) = match chain.last() {
            Some(last) => (last.index() + 1, last.hash().to_string()),
            None => return Err(LedgerError::SystemError("ledger has no genesis block".to_string())),
        };

        let block = Block::from_payload(index, timestamp, payload, previous_hash)?;
        self.push_block(&mut chain, block)
    }

    fn push_block(&self, chain: &mut Vec<Block>, candidate: Block) -> Result<Block, LedgerError> {
        if self.unsynced.load(Ordering::SeqCst) {
            return Err(LedgerError::Unsynced {
                index: chain.len() as u64,
            });
        }

        if let Err(err) = check_linkage(chain, &candidate) {
            warn!("Rejected block: {}", err);
            return Err(err.into());
        }

        // Durable before visible.
        if let Some(storage) = &self.storage {
            storage.save_block(&candidate)?;

            // The block is committed in sled but may or may not reach disk.
            // Whether it survives is decided on the next reopen.
            if let Err(err) = storage.flush() {
                error!("Failed to flush block {}: {}", candidate.index(), err);
                self.unsynced.store(true, Ordering::SeqCst);
                return Err(LedgerError::Unsynced {
                    index: candidate.index(),
                });
            }
        }

        info!("Appended block {} ({})", candidate.index(), candidate.hash());
        chain.push(candidate.clone());

        Ok(candidate)
    }

    /// Verifies the whole chain, reporting the first offending block
    pub fn verify(&self) -> Result<(), VerificationError> {
        let chain = match self.chain.read() {
            Ok(chain) => chain,
            // The chain only changes through a single push, so it is whole.
            Err(poisoned) => poisoned.into_inner(),
        };

        verify_blocks(&chain)
    }

    /// Direct access to the blocks, for tests that need to tamper with them
    #[cfg(test)]
    pub(crate) fn with_chain_mut<R>(&self, f: impl FnOnce(&mut Vec<Block>) -> R) -> R {
        let mut chain = self.chain.write().unwrap();
        f(&mut chain)
    }

    /// Validates the blockchain
    ///
    /// # Returns
    ///
    /// true if the chain is intact, false otherwise
    pub fn is_valid(&self) -> bool {
        match self.verify() {
            Ok(()) => true,
            Err(err) => {
                error!("Ledger verification failed: {}", err);
                false
            }
        }
    }
}

fn check_linkage(chain: &[Block], candidate: &Block) -> Result<(), LinkageError> {
    let expected = chain.len() as u64;
    if candidate.index() != expected {
        return Err(LinkageError::IndexMismatch {
            expected,
            got: candidate.index(),
        });
    }

    if let Some(latest) = chain.last() {
        if candidate.previous_hash() != latest.hash() {
            return Err(LinkageError::PreviousHashMismatch {
                index: candidate.index(),
                expected: latest.hash().to_string(),
                got: candidate.previous_hash().to_string(),
            });
        }
    }

    let computed = candidate.calculate_hash();
    if candidate.hash() != computed {
        return Err(LinkageError::HashMismatch {
            index: candidate.index(),
            stored: candidate.hash().to_string(),
            computed,
        });
    }

    Ok(())
}

/// Checks genesis, then index sequence, self-hash and backward link of every
/// later block
pub fn verify_blocks(blocks: &[Block]) -> Result<(), VerificationError> {
    let genesis = blocks.first().ok_or(VerificationError::Empty)?;
    if *genesis != Block::genesis() {
        return Err(VerificationError::Genesis);
    }

    for (position, pair) in blocks.windows(2).enumerate() {
        let (previous, current) = (&pair[0], &pair[1]);
        let position = position as u64 + 1;

        if current.index() != position {
            return Err(VerificationError::IndexOutOfSequence {
                position,
                found: current.index(),
            });
        }

        let computed = current.calculate_hash();
        if current.hash() != computed {
            return Err(VerificationError::HashMismatch {
                index: position,
                stored: current.hash().to_string(),
                computed,
            });
        }

        if current.previous_hash() != previous.hash() {
            return Err(VerificationError::LinkMismatch {
                index: position,
                expected: previous.hash().to_string(),
                found: current.previous_hash().to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;

    fn vote(voter: &str, candidate: &str) -> serde_json::Value {
        json!({ "voterId": voter, "candidate": candidate, "electionId": "E1" })
    }

    fn next_block(ledger: &Ledger, data: serde_json::Value) -> Block {
        let latest = ledger.latest_block().unwrap();
        Block::new(latest.index() + 1, "1700000000000", data, latest.hash())
    }

    #[test]
    fn test_new_ledger() {
        let ledger = Ledger::new();
        let chain = ledger.chain().unwrap();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].index(), 0);
        assert_eq!(chain[0].previous_hash(), "0");
        assert_eq!(ledger.latest_block().unwrap(), Block::genesis());
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_add_block() {
        let ledger = Ledger::new();
        let genesis = ledger.latest_block().unwrap();

        let block = Block::new(1, "1700000000000", vote("V1", "Alice"), genesis.hash());
        ledger.add_block(block.clone()).unwrap();

        let chain = ledger.chain().unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], block);
        assert_eq!(chain[1].previous_hash(), chain[0].hash());
    }

    #[test]
    fn test_chain_properties_after_appends() {
        let ledger = Ledger::new();

        for i in 0..10 {
            let block = next_block(&ledger, vote(&format!("V{}", i), "Alice"));
            ledger.add_block(block).unwrap();
        }

        let chain = ledger.chain().unwrap();
        assert_eq!(chain.len(), 11);
        for (i, block) in chain.iter().enumerate() {
            assert_eq!(block.index(), i as u64);
            assert!(block.is_self_consistent());
            if i > 0 {
                assert_eq!(block.previous_hash(), chain[i - 1].hash());
            }
        }
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_stale_previous_hash_is_rejected() {
        let ledger = Ledger::new();
        let genesis = ledger.latest_block().unwrap();

        let a = Block::new(1, "1", vote("V1", "Alice"), genesis.hash());
        ledger.add_block(a).unwrap();

        // Built against genesis, which is no longer the latest block.
        let b = Block::new(2, "2", vote("V2", "Bob"), genesis.hash());
        let err = ledger.add_block(b).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::Linkage(LinkageError::PreviousHashMismatch { index: 2, .. })
        ));
        assert_eq!(ledger.len().unwrap(), 2);
    }

    #[test]
    fn test_wrong_index_is_rejected() {
        let ledger = Ledger::new();
        let genesis = ledger.latest_block().unwrap();

        let block = Block::new(5, "1", vote("V1", "Alice"), genesis.hash());
        let err = ledger.add_block(block).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::Linkage(LinkageError::IndexMismatch { expected: 1, got: 5 })
        ));
        assert_eq!(ledger.len().unwrap(), 1);
    }

    #[test]
    fn test_forged_hash_is_rejected() {
        let ledger = Ledger::new();
        let mut block = next_block(&ledger, vote("V1", "Alice"));
        block.data = vote("V1", "Mallory");

        let err = ledger.add_block(block).unwrap_err();

        assert!(matches!(err, LedgerError::Linkage(LinkageError::HashMismatch { index: 1, .. })));
        assert_eq!(ledger.len().unwrap(), 1);
    }

    #[test]
    fn test_append_links_to_latest() {
        let ledger = Ledger::new();

        let first = ledger.append(&vote("V1", "Alice")).unwrap();
        let second = ledger
            .append_at("1700000000000", &json!({ "type": "dispute_created", "disputeId": "D1" }))
            .unwrap();

        assert_eq!(first.index(), 1);
        assert_eq!(second.index(), 2);
        assert_eq!(second.timestamp(), "1700000000000");
        assert_eq!(second.previous_hash(), first.hash());
        assert!(first.timestamp().parse::<i64>().is_ok());
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_block_lookup() {
        let ledger = Ledger::new();
        let appended = ledger.append(&vote("V1", "Alice")).unwrap();

        assert_eq!(ledger.block(1).unwrap(), Some(appended));
        assert_eq!(ledger.block(2).unwrap(), None);
        assert_eq!(ledger.block(u64::MAX).unwrap(), None);
    }

    #[test]
    fn test_tampered_data_is_detected() {
        let ledger = Ledger::new();
        for i in 0..4 {
            ledger.append(&vote(&format!("V{}", i), "Alice")).unwrap();
        }

        ledger.chain.write().unwrap()[2].data = vote("V1", "Mallory");

        let err = ledger.verify().unwrap_err();
        assert!(matches!(err, VerificationError::HashMismatch { index: 2, .. }));
        assert_eq!(err.index(), Some(2));
        assert!(!ledger.is_valid());
    }

    #[test]
    fn test_rehashed_block_breaks_next_link() {
        let ledger = Ledger::new();
        for i in 0..4 {
            ledger.append(&vote(&format!("V{}", i), "Alice")).unwrap();
        }

        {
            let mut chain = ledger.chain.write().unwrap();
            let original = &chain[2];
            let forged = Block::new(
                2,
                original.timestamp(),
                vote("V1", "Mallory"),
                original.previous_hash(),
            );
            chain[2] = forged;
        }

        let err = ledger.verify().unwrap_err();
        assert!(matches!(err, VerificationError::LinkMismatch { index: 3, .. }));
    }

    #[test]
    fn test_deleted_block_is_detected() {
        let ledger = Ledger::new();
        for i in 0..3 {
            ledger.append(&vote(&format!("V{}", i), "Alice")).unwrap();
        }

        ledger.chain.write().unwrap().remove(1);

        let err = ledger.verify().unwrap_err();
        assert_eq!(
            err,
            VerificationError::IndexOutOfSequence { position: 1, found: 2 }
        );
    }

    #[test]
    fn test_replaced_genesis_is_detected() {
        let blocks = vec![Block::new(0, "123", json!({ "genesis": true }), "0")];

        assert_eq!(verify_blocks(&blocks), Err(VerificationError::Genesis));
        assert_eq!(verify_blocks(&[]), Err(VerificationError::Empty));
    }

    #[test]
    fn test_concurrent_stale_appends() {
        let ledger = Ledger::new();
        ledger.append(&vote("V0", "Alice")).unwrap();
        let before = ledger.len().unwrap();

        let stale = ledger.latest_block().unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["Alice", "Bob"]
            .into_iter()
            .enumerate()
            .map(|(i, candidate)| {
                let ledger = ledger.clone();
                let stale = stale.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let data = vote(&format!("V{}", i + 1), candidate);
                    let block = Block::new(stale.index() + 1, "1", data.clone(), stale.hash());
                    barrier.wait();

                    match ledger.add_block(block) {
                        Ok(_) => false,
                        Err(LedgerError::Linkage(_)) => {
                            // Retry against the new latest block.
                            let latest = ledger.latest_block().unwrap();
                            let retry = Block::new(latest.index() + 1, "2", data, latest.hash());
                            ledger.add_block(retry).unwrap();
                            true
                        }
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                })
            })
            .collect();

        let retried: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(retried.iter().filter(|r| **r).count(), 1);
        assert_eq!(ledger.len().unwrap(), before + 2);
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_concurrent_appends_never_fork() {
        let ledger = Ledger::new();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        ledger.append(&vote(&format!("V{}-{}", t, i), "Alice")).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.len().unwrap(), 1 + 8 * 25);
        assert!(ledger.verify().is_ok());
    }

    #[test]
    fn test_ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let tip = {
            let ledger = Ledger::with_storage(dir.path()).unwrap();
            assert_eq!(ledger.len().unwrap(), 1);
            ledger.append(&vote("V1", "Alice")).unwrap();
            ledger.append(&vote("V2", "Bob")).unwrap()
        };

        let reopened = Ledger::with_storage(dir.path()).unwrap();
        assert_eq!(reopened.len().unwrap(), 3);
        assert_eq!(reopened.latest_block().unwrap(), tip);
        assert!(reopened.is_valid());

        let next = reopened.append(&vote("V3", "Alice")).unwrap();
        assert_eq!(next.previous_hash(), tip.hash());
    }

    #[test]
    fn test_rejected_append_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();

        {
            let ledger = Ledger::with_storage(dir.path()).unwrap();
            let bogus = Block::new(1, "1", vote("V1", "Alice"), "not-the-genesis-hash");
            assert!(ledger.add_block(bogus).is_err());
        }

        let reopened = Ledger::with_storage(dir.path()).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
    }

    #[test]
    fn test_unsynced_ledger_refuses_appends() {
        let ledger = Ledger::new();
        ledger.append(&vote("V1", "Alice")).unwrap();

        ledger.unsynced.store(true, Ordering::SeqCst);

        let err = ledger.append(&vote("V2", "Bob")).unwrap_err();
        assert!(matches!(err, LedgerError::Unsynced { index: 2 }));

        let block = next_block(&ledger, vote("V2", "Bob"));
        assert!(matches!(ledger.add_block(block), Err(LedgerError::Unsynced { .. })));
        assert_eq!(ledger.len().unwrap(), 2);
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_float_payload_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let payloads = [
            json!({ "amount": 100.52800965291519 }),
            json!({ "turnout": 0.1 + 0.2, "margin": [1e-7, -2.5e300, 123456789.12345679] }),
        ];

        let stored = {
            let ledger = Ledger::with_storage(dir.path()).unwrap();
            for payload in &payloads {
                ledger.append(payload).unwrap();
            }
            ledger.chain().unwrap()
        };

        let reopened = Ledger::with_storage(dir.path()).unwrap();
        assert_eq!(reopened.chain().unwrap(), stored);
        assert!(reopened.is_valid());
    }

    #[test]
    fn test_tampered_storage_is_refused() {
        let dir = tempfile::tempdir().unwrap();

        {
            let ledger = Ledger::with_storage(dir.path()).unwrap();
            ledger.append(&vote("V1", "Alice")).unwrap();
            ledger.append(&vote("V2", "Bob")).unwrap();
        }

        {
            // Rewrite block 1 in place, keeping its stored hash.
            let storage = LedgerStorage::new(dir.path()).unwrap();
            let mut block = storage.get_block(1).unwrap();
            block.data = vote("V1", "Mallory");
            storage.save_block(&block).unwrap();
            storage.save_block(&storage.get_block(2).unwrap()).unwrap();
            storage.flush().unwrap();
        }

        let err = Ledger::with_storage(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Verification(VerificationError::HashMismatch { index: 1, .. })
        ));
    }
}

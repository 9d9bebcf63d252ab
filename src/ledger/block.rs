use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;

/// Previous-hash sentinel carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Timestamp of the genesis block
pub const GENESIS_TIMESTAMP: &str = "0";

/// Errors that can occur while building a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Serialization error: payload cannot be canonically encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One immutable entry of the ledger
///
/// The `hash` is a pure function of the four other fields, see
/// [`Block::calculate_hash`]. Fields are only readable from outside the
/// crate so a block cannot be altered after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Position of the block in the chain, 0 for genesis
    pub(crate) index: u64,

    /// Creation time as supplied by the caller
    #[schema(example = "1700000000000")]
    pub(crate) timestamp: String,

    /// Opaque payload, hashed and stored but never interpreted
    #[schema(value_type = Object)]
    pub(crate) data: Value,

    /// Hash of the block preceding this one
    pub(crate) previous_hash: String,

    /// Hash of this block
    pub(crate) hash: String,
}

impl Block {
    /// Creates a new block and computes its hash
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `timestamp` - The creation time of the block
    /// * `data` - The payload recorded by the block
    /// * `previous_hash` - The hash of the previous block
    ///
    /// # Returns
    ///
    /// A new Block instance
    pub fn new(
        index: u64,
        timestamp: impl Into<String>,
        data: Value,
        previous_hash: impl Into<String>,
    ) -> Self {
        let block = Block {
            index,
            timestamp: timestamp.into(),
            data,
            previous_hash: previous_hash.into(),
            hash: String::new(),
        };

        let hash = block.calculate_hash();

        Block {
            hash,
            ..block
        }
    }

    /// Creates a new block from any serializable payload
    ///
    /// The payload is converted to a JSON value first. Payloads that have no
    /// JSON representation (maps with non-string keys, failing `Serialize`
    /// impls) are rejected here rather than hashed.
    pub fn from_payload<T: Serialize + ?Sized>(
        index: u64,
        timestamp: impl Into<String>,
        payload: &T,
        previous_hash: impl Into<String>,
    ) -> Result<Self, BlockError> {
        let data = serde_json::to_value(payload)?;
        Ok(Block::new(index, timestamp, data, previous_hash))
    }

    /// The fixed first block of every ledger
    pub fn genesis() -> Self {
        Block::new(
            0,
            GENESIS_TIMESTAMP,
            serde_json::json!({ "genesis": true }),
            GENESIS_PREVIOUS_HASH,
        )
    }

    /// Calculates the hash of the block
    ///
    /// The digest input is the compact JSON encoding of
    /// `{data, index, previousHash, timestamp}`. `serde_json` objects are
    /// backed by a `BTreeMap`, so keys come out sorted at every nesting level
    /// and two logically identical payloads always encode to the same bytes.
    /// Floats are written in shortest round-trip form and parsed back exactly
    /// (`float_roundtrip`), so a decoded block hashes as it did when written.
    ///
    /// # Returns
    ///
    /// The SHA-256 hash of the block as a hexadecimal string
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();

        let block_data = serde_json::json!({
            "index": self.index,
            "timestamp": self.timestamp,
            "data": self.data,
            "previousHash": self.previous_hash,
        });

        // Writing a Value into a Vec cannot fail.
        hasher.update(block_data.to_string().as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Whether the stored hash matches the block's contents
    pub fn is_self_consistent(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

// Ledger module
//
// This module contains the tamper-evident audit ledger:
// - Block structure and hashing
// - Append-only chain with linkage checks and verification
// - Durable storage
// - Audit event payloads

pub mod block;
pub mod chain;
pub mod event;
pub mod storage;

// Re-export main components for easier access
pub use block::{Block, BlockError};
pub use chain::{Ledger, LedgerError, LinkageError, VerificationError};
pub use event::{AuditEvent, DisputeStatus};
pub use storage::{LedgerStorage, StorageError};

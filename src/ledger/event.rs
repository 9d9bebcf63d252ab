use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Outcome recorded when a dispute is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum DisputeStatus {
    Resolved,
    Rejected,
}

/// Audit events the voting service writes to the ledger
///
/// These only give the payload a fixed shape; the ledger itself hashes and
/// stores them without looking inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A ballot was accepted for a candidate
    #[serde(rename_all = "camelCase")]
    VoteCast {
        voter_id: String,
        candidate: String,
        election_id: String,
    },

    /// A voter raised a dispute about an election
    #[serde(rename_all = "camelCase")]
    DisputeCreated {
        dispute_id: String,
        voter_id: String,
        election_id: String,
    },

    /// An administrator closed a dispute
    #[serde(rename_all = "camelCase")]
    DisputeResolved {
        dispute_id: String,
        status: DisputeStatus,
    },
}

impl AuditEvent {
    pub fn vote_cast(
        voter_id: impl Into<String>,
        candidate: impl Into<String>,
        election_id: impl Into<String>,
    ) -> Self {
        AuditEvent::VoteCast {
            voter_id: voter_id.into(),
            candidate: candidate.into(),
            election_id: election_id.into(),
        }
    }

    pub fn dispute_created(
        dispute_id: impl Into<String>,
        voter_id: impl Into<String>,
        election_id: impl Into<String>,
    ) -> Self {
        AuditEvent::DisputeCreated {
            dispute_id: dispute_id.into(),
            voter_id: voter_id.into(),
            election_id: election_id.into(),
        }
    }

    pub fn dispute_resolved(dispute_id: impl Into<String>, status: DisputeStatus) -> Self {
        AuditEvent::DisputeResolved {
            dispute_id: dispute_id.into(),
            status,
        }
    }

    /// Reads an event back out of a block payload
    pub fn from_data(data: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

use actix_web::{web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

use crate::ledger::{AuditEvent, Block, Ledger, LedgerError};

/// Shared ledger handle
pub type LedgerData = web::Data<Ledger>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    /// Whether every block passed verification
    pub valid: bool,

    /// Index of the first block that failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid_index: Option<u64>,

    /// What was wrong with it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Request for the blocks endpoint, a block built by the caller
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequest {
    pub index: u64,

    /// Epoch milliseconds or any string; numbers are stored (and hashed) as
    /// their decimal string
    #[serde(deserialize_with = "timestamp_string")]
    #[schema(value_type = String, example = "1700000000000")]
    pub timestamp: String,

    #[schema(value_type = Object)]
    pub data: serde_json::Value,

    pub previous_hash: String,

    /// Hash claimed by the caller; computed when omitted
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Number(serde_json::Number),
}

fn timestamp_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Text(text) => text,
        RawTimestamp::Number(number) => number.to_string(),
    })
}

fn error_response(err: LedgerError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });

    match err {
        LedgerError::Linkage(_) => HttpResponse::Conflict().json(body),
        LedgerError::Block(_) => HttpResponse::BadRequest().json(body),
        LedgerError::Unsynced { .. } => HttpResponse::ServiceUnavailable().json(body),
        _ => {
            error!("Ledger operation failed: {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

/// Get the full ledger
///
/// Returns every block in append order and the chain's validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Ledger retrieved successfully", body = ChainResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_chain(ledger: LedgerData) -> impl Responder {
    let chain = match ledger.chain() {
        Ok(chain) => chain,
        Err(err) => return error_response(err),
    };
    let is_valid = ledger.is_valid();

    let response = ChainResponse {
        length: chain.len(),
        chain,
        is_valid,
    };

    HttpResponse::Ok().json(response)
}

/// Get the latest block
///
/// Callers building their own block link it to this block's hash
#[utoipa::path(
    get,
    path = "/api/v1/chain/latest",
    responses(
        (status = 200, description = "Latest block", body = Block),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_latest_block(ledger: LedgerData) -> impl Responder {
    match ledger.latest_block() {
        Ok(block) => HttpResponse::Ok().json(block),
        Err(err) => error_response(err),
    }
}

/// Get a block by index
#[utoipa::path(
    get,
    path = "/api/v1/chain/{index}",
    params(
        ("index" = u64, Path, description = "Block index")
    ),
    responses(
        (status = 200, description = "Block found", body = Block),
        (status = 404, description = "No block at this index"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_block(ledger: LedgerData, index: web::Path<u64>) -> impl Responder {
    let index = index.into_inner();

    match ledger.block(index) {
        Ok(Some(block)) => HttpResponse::Ok().json(block),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("Block {} not found", index)
        })),
        Err(err) => error_response(err),
    }
}

/// Verify the ledger
///
/// Recomputes every hash and link and reports the first broken block
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Ledger verification report", body = ValidationResponse)
    )
)]
pub async fn validate_chain(ledger: LedgerData) -> impl Responder {
    let response = match ledger.verify() {
        Ok(()) => ValidationResponse {
            valid: true,
            first_invalid_index: None,
            reason: None,
        },
        Err(err) => {
            error!("Ledger verification failed: {}", err);
            ValidationResponse {
                valid: false,
                first_invalid_index: err.index(),
                reason: Some(err.to_string()),
            }
        }
    };

    HttpResponse::Ok().json(response)
}

/// Append a caller-built block
///
/// The block must link to the current latest block. A stale or malformed
/// block is rejected with 409; re-read the latest block and rebuild.
#[utoipa::path(
    post,
    path = "/api/v1/blocks",
    request_body = BlockRequest,
    responses(
        (status = 201, description = "Block appended", body = Block),
        (status = 409, description = "Block does not link to the latest block"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn add_block(ledger: LedgerData, block_req: web::Json<BlockRequest>) -> impl Responder {
    let req = block_req.into_inner();
    let mut block = Block::new(req.index, req.timestamp, req.data, req.previous_hash);

    if let Some(hash) = req.hash {
        block.hash = hash;
    }

    match web::block(move || ledger.add_block(block)).await {
        Ok(Ok(block)) => HttpResponse::Created().json(block),
        Ok(Err(err)) => error_response(err),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": format!("Append task failed: {}", err)
        })),
    }
}

/// Record an audit event
///
/// Builds the next block from the event and appends it in one step
#[utoipa::path(
    post,
    path = "/api/v1/events",
    request_body = AuditEvent,
    responses(
        (status = 201, description = "Event recorded", body = Block),
        (status = 400, description = "Invalid event"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn record_event(ledger: LedgerData, event: web::Json<AuditEvent>) -> impl Responder {
    let event = event.into_inner();

    match web::block(move || ledger.append(&event)).await {
        Ok(Ok(block)) => HttpResponse::Created().json(block),
        Ok(Err(err)) => error_response(err),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": format!("Append task failed: {}", err)
        })),
    }
}

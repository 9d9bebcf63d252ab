use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/chain/latest", web::get().to(handlers::get_latest_block))
            .route("/chain/{index}", web::get().to(handlers::get_block))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/blocks", web::post().to(handlers::add_block))
            .route("/events", web::post().to(handlers::record_event))
    );
}

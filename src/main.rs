use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use votechain::api;
use votechain::config::Config;
use votechain::ledger::{self, Ledger};

// Open the ledger, from storage unless configured in-memory
fn initialize_ledger(config: &Config) -> anyhow::Result<Ledger> {
    if config.in_memory {
        info!("Using in-memory ledger; it will not survive a restart");
        return Ok(Ledger::new());
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    // A tampered or unreadable ledger must stop the server, not be replaced.
    let ledger = Ledger::with_storage(&config.data_dir)
        .with_context(|| format!("opening ledger at {}", config.data_dir.display()))?;

    info!(
        "Loaded ledger from storage at {} ({} blocks)",
        config.data_dir.display(),
        ledger.len()?
    );

    Ok(ledger)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_latest_block,
        api::handlers::get_block,
        api::handlers::validate_chain,
        api::handlers::add_block,
        api::handlers::record_event
    ),
    components(
        schemas(
            ledger::Block,
            ledger::AuditEvent,
            ledger::DisputeStatus,
            api::handlers::ChainResponse,
            api::handlers::ValidationResponse,
            api::handlers::BlockRequest
        )
    ),
    tags(
        (name = "ledger", description = "Audit ledger API endpoints")
    ),
    info(
        title = "VoteChain Ledger API",
        version = "1.0.0",
        description = "Tamper-evident audit ledger for votes and disputes",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::parse();

    let ledger = web::Data::new(initialize_ledger(&config)?);

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(ledger.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}

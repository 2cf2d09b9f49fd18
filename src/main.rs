use std::process::ExitCode;
use std::sync::Arc;

use applyd::auth::TokenAuthenticator;
use applyd::config::Config;
use applyd::middleware::SessionStage;
use applyd::profiling::ProfilingSession;
use applyd::service::InfraApplyService;
use applyd::store::MemoryStore;
use applyd::{Chain, Error, Server};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let path = Config::path_from_env();
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("applyd: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = applyd::logging::init(&config.log) {
        eprintln!("applyd: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("applyd: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Error> {
    info!(project = %config.project_name, "starting");

    if !config.mysql.dsn.is_empty() {
        warn!(
            active = config.mysql.active,
            idle = config.mysql.idle,
            "MySQL.DSN is set but no SQL backend is compiled in, using the in-memory store"
        );
    }
    let store = Arc::new(MemoryStore::new());

    let authenticator = TokenAuthenticator::new(config.identify.auth_secret.as_bytes());
    let chain = Chain::standard(SessionStage::new(authenticator, config.session_config()));
    let router = InfraApplyService::new(store.clone()).into_router();

    let mut server = Server::new(chain, router)
        .with_store(store)
        .with_drain_grace(config.drain_grace());
    if config.log.is_pprof {
        server = server.with_profiling(ProfilingSession::start(&config.log.path_pprof)?);
    }

    server.start(&config.grpc_srv.address).await
}

use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use labrunner::config::{CliArgs, Config};
use labrunner::database::{self as db, RecordStore};
use labrunner::engine::Engine;
use labrunner::janitor::janitor;
use labrunner::web_server::build_server;

const JANITOR_PERIOD: Duration = Duration::from_secs(60);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config: Config = cli.to_config().expect("Failed to load configuration");

    let db_path = config.storage.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create local data dir");
    }
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let store = RecordStore::open(&db_path, config.retry.clone())
        .await
        .expect("Failed to initialize database");

    let engine = Arc::new(Engine::new(&config, Arc::new(store)).expect("Failed to prepare storage roots"));
    let max_age = config.storage.session_max_age();
    match engine.sessions().sweep_stale(max_age) {
        Ok(n) => log::info!("Startup sweep removed {n} stale session(s)"),
        Err(e) => log::warn!("Startup sweep failed: {e}"),
    }

    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let janitor_task = tokio::spawn(janitor(
        engine.clone(),
        max_age,
        JANITOR_PERIOD,
        shutdown_token.clone(),
    ));

    let server = build_server(config.server.clone(), web::Data::from(engine))
        .expect("Failed to build server");
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    server_handle.stop(true).await;

    shutdown_token.cancel();
    match janitor_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Janitor finished with error: {e:?}"),
        Err(e) => log::error!("Janitor handle panicked: {e:?}"),
    }

    log::info!("Shutdown complete");
    Ok(())
}

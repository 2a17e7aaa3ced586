use log::{error, info};
use std::process;
use tokio_util::sync::CancellationToken;

use boardcore::aggregate::AggregateExecutor;
use boardcore::auth::Authentication;
use boardcore::config::{AuthConfig, Config, PostgresConfig};
use boardcore::data_store::local::LocalAggregateBackend;
use boardcore::data_store::postgres::PostgresAggregateBackend;
use boardcore::semantic_model::local_store::LocalSemanticModelStore;
use boardcore::semantic_model::postgres_store::PostgresSemanticModelStore;
use boardcore::{AppState, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::new().map_err(|e| {
        error!("Failed to initialize config: {}", e);
        e
    })?;

    let auth_config = AuthConfig::new().map_err(|e| {
        error!("Failed to initialize auth config: {}", e);
        e
    })?;
    let auth = Authentication::from_config(&auth_config);
    let shutdown = CancellationToken::new();

    match config.backend.as_str() {
        "local" => {
            info!("Using local semantic model store and aggregate backend");
            let models = LocalSemanticModelStore::mock();
            let backend = LocalAggregateBackend::mock_with_store(models.clone());
            let state = AppState {
                auth,
                models,
                executor: AggregateExecutor::new(backend),
                shutdown,
            };
            Server::new(config, state).run().await?;
        }
        "postgres" => {
            info!("Using Postgres semantic model store and aggregate backend");
            let postgres_config = PostgresConfig::new().map_err(|e| {
                error!("Failed to initialize Postgres config: {}", e);
                e
            })?;
            let models = PostgresSemanticModelStore::new(&postgres_config)
                .await
                .map_err(|e| {
                    error!("Failed to create Postgres semantic model store: {}", e);
                    e
                })?;
            let backend = PostgresAggregateBackend::new(&postgres_config)
                .await
                .map_err(|e| {
                    error!("Failed to create Postgres aggregate backend: {}", e);
                    e
                })?;
            let state = AppState {
                auth,
                models,
                executor: AggregateExecutor::new(backend),
                shutdown,
            };
            Server::new(config, state).run().await?;
        }
        other => {
            error!("Incorrect backend type: {}", other);
            process::exit(1);
        }
    }

    Ok(())
}

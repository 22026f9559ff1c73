use std::net::TcpListener;
use std::sync::Arc;

use binlayout::auth::SessionIssuer;
use binlayout::configuration::get_configuration;
use binlayout::startup::run;
use binlayout::store::PgStore;
use binlayout::telemetry::init_telemetry;
use sqlx::postgres::PgPoolOptions;

fn startup_error(kind: std::io::ErrorKind, message: &'static str) -> std::io::Error {
    std::io::Error::new(kind, message)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();

    tracing::info!("Starting application");

    let configuration = get_configuration().map_err(|e| {
        tracing::error!("Failed to read configuration: {}", e);
        startup_error(std::io::ErrorKind::InvalidInput, "Configuration error")
    })?;

    tracing::info!("Attempting to connect to database");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&configuration.database.connection_string())
        .await
        .map_err(|e| {
            tracing::error!("Failed to create connection pool: {}", e);
            startup_error(std::io::ErrorKind::ConnectionRefused, "Database connection error")
        })?;

    let store = Arc::new(PgStore::new(pool));
    store.migrate().await.map_err(|e| {
        tracing::error!("Failed to migrate database: {}", e);
        startup_error(std::io::ErrorKind::Other, "Database migration error")
    })?;

    let issuer = SessionIssuer::from_settings(store.clone(), store, &configuration).map_err(|e| {
        tracing::error!("Failed to build session issuer: {}", e);
        startup_error(std::io::ErrorKind::InvalidInput, "Configuration error")
    })?;

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener = TcpListener::bind(&address)?;
    tracing::info!("Server listening on: {}", address);

    run(listener, issuer)?.await
}

//! Demo binary: registers a sample job, runs migrations, starts the worker
//! loop and the HTTP surface on top of a SQLite-backed `Durably` instance.
//!
//! This is a runnable demonstration of the engine, not part of the library
//! surface consumed by `durably-core`/`durably-sqlite`/`durably-http`.

use std::net::SocketAddr;
use std::sync::Arc;

use durably_core::{define_job, Durably, SerdeValidator, WorkerConfig};
use durably_sqlite::{SqliteStorage, CONFIG};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Deserialize)]
struct DoubleInput {
    n: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DoubleOutput {
    r: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "durably=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting durably demo");

    let storage = Arc::new(SqliteStorage::connect(&CONFIG).await?);
    let durably = Durably::new(storage, WorkerConfig::default());

    let double_job = define_job(
        "double",
        SerdeValidator::<DoubleInput>::new(),
        Some(Arc::new(SerdeValidator::<DoubleOutput>::new())),
        |ctx, input: DoubleInput| async move {
            let r = ctx
                .run("x", || async move { Ok::<_, durably_core::DurablyError>(input.n * 2) })
                .await?;
            Ok(DoubleOutput { r })
        },
    );
    durably.register_job("double", double_job)?;

    durably.init().await?;
    tracing::info!("migrations applied, worker started");

    let router = durably_http::build_router(durably.clone());
    let addr = std::env::var("DURABLY_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = addr.parse()?;

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

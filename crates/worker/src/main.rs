//! Saga worker entry point.

use std::collections::BTreeMap;
use std::sync::Arc;

use lock::InMemoryLocker;
use saga_store::InMemoryStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::services::ReservationItem;
use worker::{InMemoryFulfillment, OrderRequest, WorkerConfig};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, cancelling in-flight steps");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, cancelling in-flight steps");
        }
    }
}

fn demo_order() -> OrderRequest {
    OrderRequest {
        order_id: format!("ORD-{}", uuid::Uuid::new_v4().simple()),
        customer_id: "CUST-0042".to_string(),
        amount_cents: 12_990,
        items: vec![
            ReservationItem {
                sku: "SKU-KEYBOARD".to_string(),
                quantity: 1,
            },
            ReservationItem {
                sku: "SKU-CABLE".to_string(),
                quantity: 2,
            },
        ],
        address: "221B Baker Street, London".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Wire services, storage and locking
    let fulfillment = InMemoryFulfillment::new();
    fulfillment.shipping.set_transient_failures(1);
    if let Some(step) = &config.fail_step
        && !fulfillment.fail_step(step)
    {
        tracing::warn!(%step, "SAGA_FAIL_STEP names no fulfillment step, ignoring");
    }
    let driver = worker::create_driver(
        &config,
        &fulfillment.services(),
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryLocker::new()),
    );

    // 4. Start the saga and drive it, cancelling in-flight steps on shutdown
    let order = demo_order();
    let mut metadata = BTreeMap::new();
    metadata.insert("order_id".to_string(), order.order_id.clone());
    let saga_id = driver.coordinator().start(order.into_input()?, metadata).await?;
    tracing::info!(%saga_id, ?config, "driving order fulfillment saga");

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let outcome = driver.drive(&saga_id, &shutdown).await;
    signal_task.abort();

    match &outcome {
        Ok(instance) => {
            for step in &instance.steps {
                tracing::info!(
                    step = %step.name,
                    status = %step.status,
                    attempts = step.attempt,
                    error = %step.error_msg,
                    "step outcome"
                );
            }
            tracing::info!(%saga_id, status = %instance.status, "saga finished");
        }
        Err(e) => tracing::error!(%saga_id, error = %e, "saga did not finish"),
    }

    println!("{}", metrics_handle.render());
    outcome.map(|_| ()).map_err(Into::into)
}

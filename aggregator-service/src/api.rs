use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use meter_client::domain::{DailyUsage, NetFlow, Totals};
use serde::{Deserialize, Serialize};

use crate::{aggregator::Aggregator, metrics_server};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalsResponse {
    #[serde(flatten)]
    pub totals: Totals,
    pub net_flow: NetFlow,
}

impl From<Totals> for TotalsResponse {
    fn from(totals: Totals) -> Self {
        Self {
            net_flow: totals.net_flow(),
            totals,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub devices: Vec<String>,
}

/// Read-only query surface over an [`Aggregator`].
pub fn router(aggregator: Arc<Aggregator>) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/:device_id/totals", get(device_totals))
        .route("/devices/:device_id/usage", get(device_usage))
        .route("/metrics", get(metrics_handler))
        .with_state(aggregator)
}

/// Binds `bind_addr` and serves [`router`] in the background.
pub fn spawn(
    bind_addr: &str,
    aggregator: Arc<Aggregator>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api bind addr '{bind_addr}': {e}"))?;
    let app = router(aggregator);

    Ok(tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "query API listening");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "query API server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind query API listener");
            }
        }
    }))
}

async fn device_totals(
    State(aggregator): State<Arc<Aggregator>>,
    Path(device_id): Path<String>,
) -> Json<TotalsResponse> {
    metrics::counter!("api_queries_total", "route" => "totals").increment(1);
    Json(aggregator.query(&device_id).into())
}

async fn device_usage(
    State(aggregator): State<Arc<Aggregator>>,
    Path(device_id): Path<String>,
) -> Json<DailyUsage> {
    metrics::counter!("api_queries_total", "route" => "usage").increment(1);
    Json(aggregator.daily_usage(&device_id))
}

async fn list_devices(State(aggregator): State<Arc<Aggregator>>) -> Json<DevicesResponse> {
    Json(DevicesResponse {
        devices: aggregator.devices(),
    })
}

async fn metrics_handler() -> Result<String, StatusCode> {
    metrics_server::render().ok_or(StatusCode::NOT_FOUND)
}

use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures::StreamExt;
use meter_client::domain::DeviceReading;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<DeviceReading>>,
    max_request_records: usize,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IngestResponse {
    pub accepted: usize,
}

/// Push endpoint for telemetry records: `POST /ingest/readings` with a JSON
/// array of `{ "deviceId": ..., "payload": { ... } }`.
#[derive(Clone)]
pub struct HttpJsonSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<DeviceReading>>>>>,
}

fn ingest_router(shared: SharedSender) -> Router {
    Router::new()
        .route("/ingest/readings", post(ingest_readings))
        .with_state(shared)
}

impl HttpJsonSource {
    pub async fn new(
        bind_addr: &str,
        channel_capacity: usize,
        max_request_records: usize,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let app = ingest_router(SharedSender {
            tx,
            max_request_records,
        });

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;

        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    tracing::info!(%addr, "HTTP ingest listening");
                    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                        tracing::error!(error = %e, "HTTP JSON source server error");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to bind HTTP JSON source listener");
                }
            }
        });

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        })
    }
}

#[async_trait::async_trait]
impl Source<DeviceReading> for HttpJsonSource {
    async fn stream(&self) -> Result<EnvelopeStream<DeviceReading>, PipelineError> {
        let rx = self.receiver.lock().await.take().ok_or_else(|| {
            PipelineError::Source(
                "HttpJsonSource stream already taken; only one consumer supported".to_string(),
            )
        })?;

        Ok(Box::pin(ReceiverStream::new(rx).map(Ok)))
    }
}

async fn ingest_readings(
    State(sender): State<SharedSender>,
    Json(payload): Json<Vec<DeviceReading>>,
) -> Result<(StatusCode, Json<IngestResponse>), StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    if payload.len() > sender.max_request_records {
        metrics::counter!("http_ingest_rejected_total").increment(1);
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let accepted = payload.len();
    for record in payload {
        if sender.tx.send(Envelope::received_now(record)).await.is_err() {
            // Channel closed; treat as server error
            metrics::counter!("http_ingest_failed_total").increment(1);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    Ok((StatusCode::ACCEPTED, Json(IngestResponse { accepted })))
}

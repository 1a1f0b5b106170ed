//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use kube::api::{Api, ListParams};
use tracing::{error, instrument};

use crate::controller::{ControllerState, DriverReadiness};
use crate::crd::Gateway;

use super::dto::{ErrorResponse, GatewayListResponse, GatewaySummary, HealthResponse};

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    let drivers = state.engine.drivers().readiness();
    Json(HealthResponse {
        status: health_status(drivers).to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_name: state.config.node_name.clone(),
        drivers,
        queue_depth: state.engine.queue().len().await,
    })
}

fn health_status(drivers: DriverReadiness) -> &'static str {
    match drivers {
        DriverReadiness::Ready => "healthy",
        DriverReadiness::Uninitialized | DriverReadiness::RoutePartial => "starting",
        DriverReadiness::ShutDown => "stopping",
    }
}

/// List all Gateways with their NAT info
#[instrument(skip(state))]
pub async fn list_gateways(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<GatewayListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let api: Api<Gateway> = Api::all(state.client.clone());

    match api.list(&ListParams::default()).await {
        Ok(gateways) => {
            let items: Vec<GatewaySummary> = gateways
                .items
                .iter()
                .map(|gw| GatewaySummary::new(gw, &state.config.node_name))
                .collect();
            let total = items.len();
            Ok(Json(GatewayListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list gateways: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

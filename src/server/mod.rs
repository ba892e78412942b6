// HTTP server for the control API

//! # Control Server
//!
//! Wraps the control API router in an axum HTTP server with CORS, built
//! through [`ControlServerBuilder`]. The server layer owns nothing but
//! network plumbing; construct the orchestrator and pipeline engine first
//! and hand them in.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{control_router, ApiState};
use crate::engine::{Orchestrator, PipelineEngine};
use crate::{OrchestratorError, Result};

/// Builder for the control-plane HTTP server.
pub struct ControlServerBuilder {
    orchestrator: Arc<Orchestrator>,
    address: Option<String>,
    cors: bool,
}

impl ControlServerBuilder {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        ControlServerBuilder {
            orchestrator,
            address: None,
            cors: true,
        }
    }

    /// Override the bind address from configuration.
    pub fn address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn without_cors(mut self) -> Self {
        self.cors = false;
        self
    }

    /// Build the router without binding; used by tests.
    pub fn router(&self) -> Router {
        let state = ApiState {
            orchestrator: self.orchestrator.clone(),
            pipelines: Arc::new(PipelineEngine::new(self.orchestrator.clone())),
        };
        let router = control_router(state);
        if self.cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Bind and serve until the process exits.
    pub async fn serve(self) -> Result<()> {
        let address = self
            .address
            .clone()
            .unwrap_or_else(|| self.orchestrator.config().server_address());
        let addr: std::net::SocketAddr = address
            .parse()
            .map_err(|e| OrchestratorError::Configuration(format!("bad bind address '{}': {}", address, e)))?;
        let router = self.router();
        info!(%addr, "control server listening");
        axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))
    }
}

//! HTTP host: shared state, router assembly and the authentication middleware.
//!
//! Layers, outermost first: TraceLayer, CORS, then the request pipeline
//! (authentication followed by authorization) ahead of every handler.

pub mod routes;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::obo::OboExchanger;
use crate::auth::provider::OnBehalfOfProvider;
use crate::auth::token_cache::TokenCache;
use crate::authz::PolicySet;
use crate::config::Config;
use crate::error::AppError;
use crate::graph::{GraphApiService, GraphClient};
use crate::health::HealthChecker;
use crate::hub::ValuesHub;
use crate::identity::jwt::TokenValidator;
use crate::identity::CallerContext;
use crate::pipeline::{AuthenticationStage, AuthorizationStage, Pipeline, RequestContext};

/// Services shared by every request. Built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub exchanger: Arc<OboExchanger>,
    pub token_cache: Option<Arc<TokenCache>>,
    pub graph: Arc<GraphClient>,
    pub graph_resource: Arc<str>,
    pub hub: Arc<ValuesHub>,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    /// Wire up all services from configuration.
    pub fn new(config: &Config, validator: Arc<dyn TokenValidator>) -> Result<Self, AppError> {
        let pipeline = Pipeline::new()
            .stage(AuthenticationStage::new(validator))
            .stage(AuthorizationStage::new(
                Arc::new(routes::route_table()),
                PolicySet::new(&config.azure_ad.roles),
            ));

        let exchanger = OboExchanger::from_config(config)?;
        let token_cache = config
            .token
            .cache_enabled
            .then(|| Arc::new(TokenCache::new(config.token.refresh_before_expiry_seconds)));

        let health = HealthChecker::new(&config.health).map_err(|e| {
            crate::error::ConfigError::Invalid {
                field: "health".into(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            pipeline: Arc::new(pipeline),
            exchanger: Arc::new(exchanger),
            token_cache,
            graph: Arc::new(GraphClient::new(&config.graph.base_url)?),
            graph_resource: Arc::from(config.graph.resource.as_str()),
            hub: Arc::new(ValuesHub::default()),
            health: Arc::new(health),
        })
    }

    /// Graph lookups authenticated as `caller`.
    pub fn graph_service(&self, caller: &CallerContext) -> GraphApiService {
        let provider = OnBehalfOfProvider::for_caller(
            Arc::clone(&self.exchanger),
            self.token_cache.clone(),
            caller,
            self.graph_resource.as_ref(),
        );
        GraphApiService::new(Arc::clone(&self.graph), Box::new(provider))
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    routes::api_routes()
        .layer(middleware::from_fn_with_state(state.clone(), run_pipeline))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Browser clients of any origin, with credentials.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Run the pipeline and hand the authenticated caller to handlers.
async fn run_pipeline(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let ctx = RequestContext::new(
        request.method().clone(),
        request.uri().path(),
        request.uri().query(),
        request.headers().clone(),
    );

    match state.pipeline.run(ctx).await {
        Ok(ctx) => {
            if let Some(caller) = ctx.caller() {
                request.extensions_mut().insert(caller);
            }
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Serve `app` on `bind_address` until Ctrl-C.
pub async fn serve(bind_address: &str, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;

    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        // Never resolve; keep serving
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

//! Application startup and lifecycle management.
//!
//! Wires the stores, directory and transports into an [`AccessService`],
//! serves it over HTTP, and runs the expiry sweeper and notification retry
//! worker alongside the server until shutdown.

use axum::{
    http::{header, HeaderName, Method},
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware, REQUEST_ID_HEADER};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{AccessConfig, StoreBackend};
use crate::handlers;
use crate::models::Channel;
use crate::services::directory::{Directory, StaticDirectory};
use crate::services::store::{AccessDb, AuditStore, DeliveryLog, HoldStore, MemoryStore, RequestStore};
use crate::services::transports::{
    FcmTransport, MockTransport, Msg91Transport, SmtpTransport, Transport,
};
use crate::services::{
    AccessRequestMachine, AccessService, ExpirySweeper, HoldLedger, NotificationDispatcher,
    TokenCodec,
};

/// Backend probed by `/health` and `/ready`.
#[derive(Clone)]
pub enum StoreHealth {
    Memory,
    Mongo(AccessDb),
}

impl StoreHealth {
    pub async fn check(&self) -> Result<(), AppError> {
        match self {
            StoreHealth::Memory => Ok(()),
            StoreHealth::Mongo(db) => db.health_check().await,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub access: Arc<AccessService>,
    pub store_health: StoreHealth,
}

/// Assemble the service graph over a store that backs every persistence seam.
pub fn assemble_service<S>(
    config: &AccessConfig,
    store: Arc<S>,
    directory: Arc<dyn Directory>,
    transports: Vec<Arc<dyn Transport>>,
) -> Arc<AccessService>
where
    S: HoldStore + RequestStore + AuditStore + DeliveryLog + 'static,
{
    let codec = TokenCodec::new(&config.token.signing_secret);
    let ledger = HoldLedger::new(store.clone() as Arc<dyn HoldStore>);

    let machine = Arc::new(AccessRequestMachine::new(
        store.clone() as Arc<dyn RequestStore>,
        store.clone() as Arc<dyn AuditStore>,
        ledger.clone(),
        codec.clone(),
        directory.clone(),
        config.token.clone(),
    ));

    let dispatcher = Arc::new(NotificationDispatcher::new(
        directory.clone(),
        store as Arc<dyn DeliveryLog>,
        transports,
        config.dispatch.clone(),
    ));

    let sweeper = Arc::new(ExpirySweeper::new(
        ledger.clone(),
        machine.clone(),
        dispatcher.clone(),
        config.sweep.clone(),
    ));

    Arc::new(AccessService::new(
        machine,
        ledger,
        codec,
        directory,
        dispatcher,
        sweeper,
        config.token.max_ttl_minutes,
        config.operation_timeout(),
    ))
}

fn load_directory(config: &AccessConfig) -> Result<Arc<dyn Directory>, AppError> {
    match &config.directory_path {
        Some(path) => {
            let directory = StaticDirectory::from_file(path).map_err(|e| {
                tracing::error!("Failed to load directory from {}: {}", path, e);
                AppError::ConfigError(anyhow::anyhow!("directory {}: {}", path, e))
            })?;
            Ok(Arc::new(directory))
        }
        None => {
            tracing::warn!("DIRECTORY_PATH not set, starting with an empty site directory");
            Ok(Arc::new(StaticDirectory::default()))
        }
    }
}

fn build_transports(config: &AccessConfig) -> Vec<Arc<dyn Transport>> {
    let email: Arc<dyn Transport> = if config.smtp.enabled {
        match SmtpTransport::new(config.smtp.clone()) {
            Ok(transport) => {
                tracing::info!("SMTP email transport initialized");
                Arc::new(transport)
            }
            Err(e) => {
                tracing::warn!("Failed to initialize SMTP transport: {}. Using mock.", e);
                Arc::new(MockTransport::new(Channel::Email))
            }
        }
    } else {
        tracing::info!("SMTP transport disabled, using mock email transport");
        Arc::new(MockTransport::new(Channel::Email))
    };

    let sms: Arc<dyn Transport> = if config.msg91.enabled {
        tracing::info!("Msg91 SMS transport initialized");
        Arc::new(Msg91Transport::new(config.msg91.clone()))
    } else {
        tracing::info!("Msg91 transport disabled, using mock SMS transport");
        Arc::new(MockTransport::new(Channel::Sms))
    };

    let push: Arc<dyn Transport> = if config.fcm.enabled {
        tracing::info!("FCM push transport initialized");
        Arc::new(FcmTransport::new(config.fcm.clone()))
    } else {
        tracing::info!("FCM transport disabled, using mock push transport");
        Arc::new(MockTransport::new(Channel::Push))
    };

    vec![push, email, sms]
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/v1/access-requests", post(handlers::submit_access_request))
        .route("/v1/access-requests/:id", get(handlers::get_access_request))
        .route(
            "/v1/access-requests/:id/decision",
            post(handlers::decide_access_request),
        )
        .route("/v1/tokens/validate", post(handlers::validate_token))
        .route("/v1/holds/:id", get(handlers::get_hold))
        .route("/v1/holds/:id/extend", post(handlers::extend_hold))
        .route("/v1/holds/:id/revoke", post(handlers::revoke_hold))
        .route("/v1/sweeps", post(handlers::run_sweep))
        .route("/v1/notifications", post(handlers::dispatch_notification))
        .route("/v1/notifications/batch", post(handlers::batch_send))
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    HeaderName::from_static(REQUEST_ID_HEADER),
                ]),
        )
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application from configuration: store backend, directory
    /// file and transports.
    pub async fn build(config: AccessConfig) -> Result<Self, AppError> {
        let directory = load_directory(&config)?;
        let transports = build_transports(&config);
        for transport in &transports {
            if let Err(e) = transport.health_check().await {
                tracing::warn!(channel = %transport.channel(), error = %e, "Transport health check failed");
            }
        }

        let state = match config.store {
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; state is lost on restart");
                let store = Arc::new(MemoryStore::new());
                AppState {
                    access: assemble_service(&config, store, directory, transports),
                    store_health: StoreHealth::Memory,
                }
            }
            StoreBackend::Mongodb => {
                let db = AccessDb::connect(&config.mongodb.uri, &config.mongodb.database)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect to MongoDB: {}", e);
                        e
                    })?;
                db.initialize_indexes().await.map_err(|e| {
                    tracing::error!("Failed to initialize database indexes: {}", e);
                    e
                })?;
                AppState {
                    access: assemble_service(&config, Arc::new(db.clone()), directory, transports),
                    store_health: StoreHealth::Mongo(db),
                }
            }
        };

        Self::build_with(&config, state).await
    }

    /// Bind a listener for an already assembled state.
    pub async fn build_with(config: &AccessConfig, state: AppState) -> Result<Self, AppError> {
        // Port 0 binds a random port for testing
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();

        tracing::info!("Access service listening on port {}", http_port);

        Ok(Self {
            http_port,
            listener,
            state,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until the process is killed.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves, then stop the background workers and
    /// wait for them to finish.
    pub async fn run_with_shutdown<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sweeper = self
            .state
            .access
            .sweeper()
            .clone()
            .spawn(shutdown_rx.clone());
        let retry_worker = self
            .state
            .access
            .dispatcher()
            .clone()
            .spawn_retry_worker(shutdown_rx);

        let router = build_router(self.state);
        let served = axum::serve(self.listener, router)
            .with_graceful_shutdown(signal)
            .await;

        let _ = shutdown_tx.send(true);
        for (name, handle) in [("sweeper", sweeper), ("retry worker", retry_worker)] {
            if let Err(e) = handle.await {
                tracing::error!(worker = name, error = %e, "Background worker panicked");
            }
        }

        served.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

//! Server host: owns the listener, the router and the manager task.

mod actor;

pub use actor::{spawn_manager, Command, ManagerHandle, ManagerStopped};

use crate::api::{create_ws_router, WsAppState};
use crate::config::ServerConfig;
use crate::engine::{ErrorFormatter, Executor, SchemaNotFound, SchemaRegistry};
use crate::subscription::{ConnectionRegistry, FilterTable, InitHook, SubscriptionManager};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Schema(#[from] SchemaNotFound),
}

/// Assembles a subscription server.
pub struct ServerBuilder {
    executor: Arc<dyn Executor>,
    config: ServerConfig,
    filters: FilterTable,
    context: Value,
    error_formatter: Option<ErrorFormatter>,
    init_hook: Option<InitHook>,
}

impl ServerBuilder {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            config: ServerConfig::default(),
            filters: FilterTable::new(),
            context: Value::Null,
            error_formatter: None,
            init_hook: None,
        }
    }

    /// Use the registry's default schema.
    pub fn from_registry(
        schemas: &SchemaRegistry,
        config: ServerConfig,
    ) -> Result<Self, StartupError> {
        Ok(Self::new(schemas.default_schema()?).config(config))
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn filters(mut self, filters: FilterTable) -> Self {
        self.filters = filters;
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn error_formatter(mut self, formatter: ErrorFormatter) -> Self {
        self.error_formatter = Some(formatter);
        self
    }

    pub fn init_hook(mut self, hook: InitHook) -> Self {
        self.init_hook = Some(hook);
        self
    }

    /// Bind the listener and start serving. Port 0 picks a free port.
    pub async fn bind(self) -> Result<RunningServer, StartupError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;

        let registry = Arc::new(ConnectionRegistry::new());
        let mut manager = SubscriptionManager::new(self.executor, Arc::clone(&registry))
            .with_filters(self.filters)
            .with_context(self.context);
        if let Some(formatter) = self.error_formatter {
            manager = manager.with_error_formatter(formatter);
        }
        if let Some(hook) = self.init_hook {
            manager = manager.with_init_hook(hook);
        }

        let (handle, manager_task) = spawn_manager(manager, self.config.command_buffer);

        let state = Arc::new(WsAppState {
            manager: handle.clone(),
            registry: Arc::clone(&registry),
            control_token: self.config.control_token.clone(),
        });
        let app = create_ws_router(state, &self.config.path);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Server error");
            }
        });

        info!(addr = %local_addr, path = %self.config.path, "Subscription server listening");

        Ok(RunningServer {
            local_addr,
            handle,
            registry,
            shutdown: Some(shutdown_tx),
            serve_task,
            manager_task,
        })
    }
}

/// A bound, serving subscription server.
pub struct RunningServer {
    local_addr: SocketAddr,
    handle: ManagerHandle,
    registry: Arc<ConnectionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    serve_task: JoinHandle<()>,
    manager_task: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for publishing events in-process.
    pub fn handle(&self) -> &ManagerHandle {
        &self.handle
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stop accepting connections and stop the manager.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        // Open sockets keep graceful shutdown waiting; don't hang on them
        self.serve_task.abort();
        let _ = self.serve_task.await;
        self.manager_task.abort();
        let _ = self.manager_task.await;
        info!("Subscription server stopped");
    }
}

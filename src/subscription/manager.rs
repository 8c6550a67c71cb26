use crate::engine::{
    default_error_formatter, subscription_target, DocumentError, ErrorFormatter, ExecutionRequest,
    ExecutionResult, Executor, GraphQlError,
};
use crate::subscription::filter::{self, FilterTable};
use crate::subscription::protocol::{self, ClientMessage, DataPayload, ServerMessage};
use crate::subscription::registry::{ConnectionId, ConnectionRegistry, RegistryError, Subscription};
use futures::future::join_all;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};


/// What the manager asks a connection's transport to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(ServerMessage),
    Close,
}

/// Sending half of a connection's outgoing queue
pub type Outbound = mpsc::UnboundedSender<Outgoing>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Uninitialized,
    Initialized,
}

/// Returned by an init hook to refuse a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct InitRejection {
    pub error: String,
    /// Close the transport after sending `init_fail`
    pub close: bool,
}

impl InitRejection {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            close: false,
        }
    }

    pub fn and_close(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Decides whether a connection may initialize, given its `init` payload.
pub type InitHook =
    Arc<dyn Fn(ConnectionId, Option<&Value>) -> Result<(), InitRejection> + Send + Sync>;

/// Why a `subscription_start` was refused
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistrationError {
    #[error("connection not initialized")]
    NotInitialized,
    #[error(transparent)]
    InvalidDocument(#[from] DocumentError),
    #[error("unknown subscription field '{0}'")]
    UnknownField(String),
    #[error("{}", join_messages(.0))]
    Validation(Vec<GraphQlError>),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RegistrationError {
    /// Entries for the `errors` list of `subscription_fail`.
    pub fn messages(&self) -> Vec<String> {
        match self {
            RegistrationError::Validation(errors) => {
                errors.iter().map(|e| e.message.clone()).collect()
            }
            other => vec![other.to_string()],
        }
    }
}

fn join_messages(errors: &[GraphQlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

struct ConnectionState {
    phase: ConnectionPhase,
    outbound: Outbound,
}

/// Protocol state machine for every live connection, plus event fan-out.
///
/// Runs on a single task: every handler takes the manager by reference and
/// the server host serializes calls through its command channel.
pub struct SubscriptionManager {
    executor: Arc<dyn Executor>,
    registry: Arc<ConnectionRegistry>,
    filters: FilterTable,
    context: Value,
    error_formatter: ErrorFormatter,
    init_hook: Option<InitHook>,
    connections: HashMap<ConnectionId, ConnectionState>,
}

impl SubscriptionManager {
    pub fn new(executor: Arc<dyn Executor>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            executor,
            registry,
            filters: FilterTable::new(),
            context: Value::Null,
            error_formatter: default_error_formatter(),
            init_hook: None,
            connections: HashMap::new(),
        }
    }

    pub fn with_filters(mut self, filters: FilterTable) -> Self {
        self.filters = filters;
        self
    }

    /// Server-level context handed to every filter and resolver.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_error_formatter(mut self, formatter: ErrorFormatter) -> Self {
        self.error_formatter = formatter;
        self
    }

    pub fn with_init_hook(mut self, hook: InitHook) -> Self {
        self.init_hook = Some(hook);
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn phase(&self, connection: ConnectionId) -> Option<ConnectionPhase> {
        self.connections.get(&connection).map(|state| state.phase)
    }

    /// A transport connection was accepted.
    pub fn handle_open(&mut self, connection: ConnectionId, outbound: Outbound) {
        self.registry.register(connection);
        self.connections.insert(
            connection,
            ConnectionState {
                phase: ConnectionPhase::Uninitialized,
                outbound,
            },
        );
        debug!(connection = %connection, "Connection opened");
    }

    /// Dispatch one raw client frame. Invalid frames are dropped.
    pub async fn handle_frame(&mut self, connection: ConnectionId, text: &str) {
        if !self.connections.contains_key(&connection) {
            warn!(connection = %connection, "Frame for unknown connection dropped");
            return;
        }

        match protocol::parse_client_frame(text) {
            Ok(ClientMessage::Init { payload }) => self.handle_init(connection, payload),
            Ok(ClientMessage::Start {
                id,
                query,
                variables,
                operation_name,
            }) => {
                let result = self
                    .handle_start(
                        connection,
                        id,
                        query,
                        variables.unwrap_or_default(),
                        operation_name,
                    )
                    .await;
                // subscription_fail was already pushed to the client
                if let Err(e) = result {
                    debug!(connection = %connection, error = %e, "Subscription start rejected");
                }
            }
            Ok(ClientMessage::Stop { id }) => self.handle_stop(connection, &id),
            Err(e) => {
                debug!(connection = %connection, error = %e, "Dropping invalid client frame");
            }
        }
    }

    pub fn handle_init(&mut self, connection: ConnectionId, payload: Option<Value>) {
        let Some(phase) = self.phase(connection) else {
            warn!(connection = %connection, "Init for unknown connection ignored");
            return;
        };

        if phase == ConnectionPhase::Initialized {
            self.push(
                connection,
                ServerMessage::InitFail {
                    error: "connection already initialized".to_string(),
                },
            );
            return;
        }

        let decision = match &self.init_hook {
            Some(hook) => hook(connection, payload.as_ref()),
            None => Ok(()),
        };

        match decision {
            Ok(()) => {
                if let Some(state) = self.connections.get_mut(&connection) {
                    state.phase = ConnectionPhase::Initialized;
                }
                info!(connection = %connection, "Connection initialized");
                self.push(connection, ServerMessage::InitSuccess);
            }
            Err(rejection) => {
                info!(connection = %connection, error = %rejection.error, "Connection init rejected");
                self.push(
                    connection,
                    ServerMessage::InitFail {
                        error: rejection.error,
                    },
                );
                if rejection.close {
                    self.send(connection, Outgoing::Close);
                }
            }
        }
    }

    /// Validate and register a subscription, acknowledging it either way.
    pub async fn handle_start(
        &self,
        connection: ConnectionId,
        id: String,
        query: String,
        variables: Map<String, Value>,
        operation_name: Option<String>,
    ) -> Result<(), RegistrationError> {
        let result = self
            .register(connection, &id, query, variables, operation_name)
            .await;

        match &result {
            Ok(name) => {
                info!(connection = %connection, id = %id, subscription = %name, "Subscription started");
                self.push(connection, ServerMessage::SubscriptionSuccess { id });
            }
            Err(e) => {
                debug!(connection = %connection, id = %id, error = %e, "Subscription rejected");
                self.push(
                    connection,
                    ServerMessage::SubscriptionFail {
                        id,
                        errors: e.messages(),
                    },
                );
            }
        }

        result.map(|_| ())
    }

    async fn register(
        &self,
        connection: ConnectionId,
        id: &str,
        query: String,
        variables: Map<String, Value>,
        operation_name: Option<String>,
    ) -> Result<String, RegistrationError> {
        if self.phase(connection) != Some(ConnectionPhase::Initialized) {
            return Err(RegistrationError::NotInitialized);
        }

        let name = subscription_target(&query, operation_name.as_deref())?;
        if !self.executor.has_subscription_field(&name) {
            return Err(RegistrationError::UnknownField(name));
        }
        self.executor
            .validate(&query, &variables, operation_name.as_deref())
            .await
            .map_err(RegistrationError::Validation)?;

        self.registry.add_subscription(
            connection,
            Subscription {
                id: id.to_string(),
                subscription_name: name.clone(),
                query,
                variables,
                operation_name,
                filter: self.filters.get(&name),
            },
        )?;

        Ok(name)
    }

    /// Unregister a subscription. Unknown ids are ignored.
    pub fn handle_stop(&self, connection: ConnectionId, id: &str) {
        if self.registry.remove_subscription(connection, id).is_some() {
            info!(connection = %connection, id = %id, "Subscription stopped");
        } else {
            debug!(connection = %connection, id = %id, "Stop for unknown subscription ignored");
        }
    }

    /// The transport closed: cancel everything the connection owned.
    pub fn handle_close(&mut self, connection: ConnectionId) {
        self.connections.remove(&connection);
        let removed = self.registry.unregister(connection);
        info!(connection = %connection, removed = removed, "Connection closed");
    }

    /// Fan one published event out to the matching subscribers.
    ///
    /// Returns the number of `subscription_data` frames handed to transports.
    pub async fn handle_event(&self, subscription_name: &str, payload: Value) -> usize {
        let candidates = self.registry.matching(subscription_name);
        if candidates.is_empty() {
            debug!(subscription = %subscription_name, "No subscribers for event");
            return 0;
        }

        let selected: Vec<(ConnectionId, Arc<Subscription>)> = candidates
            .into_iter()
            .filter(|(_, subscription)| match &subscription.filter {
                Some(f) => filter::accepts(f, &payload, &subscription.variables, &self.context),
                None => true,
            })
            .collect();

        debug!(
            subscription = %subscription_name,
            selected = selected.len(),
            "Dispatching event"
        );

        let executions = selected.into_iter().map(|(connection, subscription)| {
            let executor = Arc::clone(&self.executor);
            let request = ExecutionRequest {
                query: subscription.query.clone(),
                root_value: payload.clone(),
                context: self.context.clone(),
                variables: subscription.variables.clone(),
                operation_name: subscription.operation_name.clone(),
            };
            async move {
                let result = AssertUnwindSafe(executor.execute(request))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        ExecutionResult::error("internal error while resolving subscription")
                    });
                (connection, subscription, result)
            }
        });

        let mut delivered = 0;
        for (connection, subscription, result) in join_all(executions).await {
            // Stopped or closed while the pass was running
            let still_live = self
                .registry
                .get(connection, &subscription.id)
                .is_some_and(|live| Arc::ptr_eq(&live, &subscription));
            if !still_live {
                debug!(connection = %connection, id = %subscription.id, "Discarding result for cancelled subscription");
                continue;
            }

            if !result.errors.is_empty() {
                debug!(
                    connection = %connection,
                    id = %subscription.id,
                    errors = result.errors.len(),
                    "Subscription resolver reported errors"
                );
            }

            let payload = DataPayload {
                data: result.data,
                errors: result
                    .errors
                    .iter()
                    .map(|e| (self.error_formatter)(e))
                    .collect(),
            };
            let message = ServerMessage::SubscriptionData {
                id: subscription.id.clone(),
                payload,
            };
            if self.push(connection, message) {
                delivered += 1;
            }
        }

        delivered
    }

    fn push(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        self.send(connection, Outgoing::Frame(message))
    }

    fn send(&self, connection: ConnectionId, outgoing: Outgoing) -> bool {
        match self.connections.get(&connection) {
            Some(state) => {
                if state.outbound.send(outgoing).is_err() {
                    debug!(connection = %connection, "Transport gone, dropping outgoing frame");
                    return false;
                }
                true
            }
            None => {
                debug!(connection = %connection, "Connection closed, dropping outgoing frame");
                false
            }
        }
    }
}

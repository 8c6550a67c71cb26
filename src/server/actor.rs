use crate::subscription::{ConnectionId, Outbound, SubscriptionManager};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Work item for the manager task
#[derive(Debug)]
pub enum Command {
    Open {
        connection: ConnectionId,
        outbound: Outbound,
    },
    Frame {
        connection: ConnectionId,
        text: String,
    },
    Close {
        connection: ConnectionId,
    },
    Publish {
        subscription: String,
        payload: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subscription manager has stopped")]
pub struct ManagerStopped;

/// Cloneable handle feeding the manager task.
///
/// Commands from one handle are processed in the order they were sent, which
/// is what keeps per-connection frames and per-publisher events ordered.
#[derive(Clone, Debug)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
}

impl ManagerHandle {
    pub async fn open(
        &self,
        connection: ConnectionId,
        outbound: Outbound,
    ) -> Result<(), ManagerStopped> {
        self.send(Command::Open {
            connection,
            outbound,
        })
        .await
    }

    pub async fn frame(
        &self,
        connection: ConnectionId,
        text: String,
    ) -> Result<(), ManagerStopped> {
        self.send(Command::Frame { connection, text }).await
    }

    pub async fn close(&self, connection: ConnectionId) -> Result<(), ManagerStopped> {
        self.send(Command::Close { connection }).await
    }

    /// Inject an event without going through a control connection.
    pub async fn publish(
        &self,
        subscription: impl Into<String>,
        payload: Value,
    ) -> Result<(), ManagerStopped> {
        self.send(Command::Publish {
            subscription: subscription.into(),
            payload,
        })
        .await
    }

    async fn send(&self, command: Command) -> Result<(), ManagerStopped> {
        self.commands.send(command).await.map_err(|_| ManagerStopped)
    }
}

/// Move the manager onto its own task. All protocol handling and fan-out
/// for the server happens there, one command at a time.
pub fn spawn_manager(
    manager: SubscriptionManager,
    buffer: usize,
) -> (ManagerHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(buffer.max(1));
    let task = tokio::spawn(run_manager(manager, rx));
    (ManagerHandle { commands }, task)
}

async fn run_manager(mut manager: SubscriptionManager, mut commands: mpsc::Receiver<Command>) {
    info!("Subscription manager started");

    while let Some(command) = commands.recv().await {
        match command {
            Command::Open {
                connection,
                outbound,
            } => manager.handle_open(connection, outbound),
            Command::Frame { connection, text } => {
                manager.handle_frame(connection, &text).await
            }
            Command::Close { connection } => manager.handle_close(connection),
            Command::Publish {
                subscription,
                payload,
            } => {
                let delivered = manager.handle_event(&subscription, payload).await;
                debug!(subscription = %subscription, delivered = delivered, "Event fan-out complete");
            }
        }
    }

    info!("Subscription manager stopped");
}

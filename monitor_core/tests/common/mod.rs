// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! In-process cluster: one server node and N client nodes over
//! `MemoryTransport`, each running its own loop on the test runtime.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use monitor_core::{
    AppliedTransaction, ClientNode, MemoryTransport, MonitorConfig, NodeId, ServerNode,
};
use monitor_store::{MemoryPersistor, MemorySequence};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.lock_manager.timer_tick_ms = 5;
    config.sequencer.lwm_cleanup_interval_ms = 10;
    config.client.request_timeout_ms = 2_000;
    config.handoff.reconnect_window_ms = 2_000;
    config
}

pub struct Client {
    pub node: Arc<ClientNode>,
    pub transport: Arc<MemoryTransport>,
    pub applied: mpsc::UnboundedReceiver<AppliedTransaction>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Client {
    /// Stop the loop; the node says goodbye to its server first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

pub struct Cluster {
    pub server: Arc<ServerNode>,
    pub server_transport: Arc<MemoryTransport>,
    pub persistor: Arc<MemoryPersistor>,
    pub clients: Vec<Client>,
    server_shutdown: broadcast::Sender<()>,
    server_task: Option<JoinHandle<()>>,
}

pub fn spawn_server(server: Arc<ServerNode>) -> (broadcast::Sender<()>, JoinHandle<()>) {
    let (shutdown, rx) = broadcast::channel(1);
    let task = tokio::spawn(async move {
        let _ = server.run(rx).await;
    });
    (shutdown, task)
}

pub fn spawn_client(
    transport: Arc<MemoryTransport>,
    server: NodeId,
    config: &MonitorConfig,
) -> Client {
    let (node, applied) = ClientNode::new(transport.clone(), server, config.client.clone());
    let node = Arc::new(node);
    let (shutdown, rx) = broadcast::channel(1);
    let runner = node.clone();
    let task = tokio::spawn(async move {
        let _ = runner.run(rx).await;
    });
    Client {
        node,
        transport,
        applied,
        shutdown,
        task,
    }
}

impl Cluster {
    pub async fn start(clients: usize) -> Self {
        Self::start_with(clients, config()).await
    }

    pub async fn start_with(clients: usize, config: MonitorConfig) -> Self {
        init_tracing();
        let server_id = NodeId::new("server-1");
        let server_transport = Arc::new(MemoryTransport::new(server_id.clone()));
        let client_transports: Vec<Arc<MemoryTransport>> = (0..clients)
            .map(|i| Arc::new(MemoryTransport::new(NodeId::new(format!("client-{i}")))))
            .collect();
        for transport in &client_transports {
            MemoryTransport::link(&server_transport, transport);
        }

        let persistor = Arc::new(MemoryPersistor::new());
        let server = Arc::new(
            ServerNode::open(
                server_transport.clone(),
                persistor.clone(),
                Arc::new(MemorySequence::new()),
                config.clone(),
            )
            .unwrap(),
        );
        let (server_shutdown, server_task) = spawn_server(server.clone());
        let clients = client_transports
            .into_iter()
            .map(|t| spawn_client(t, server_id.clone(), &config))
            .collect();

        Self {
            server,
            server_transport,
            persistor,
            clients,
            server_shutdown,
            server_task: Some(server_task),
        }
    }

    pub fn client(&self, i: usize) -> &Arc<ClientNode> {
        &self.clients[i].node
    }

    /// Stop the server loop without telling anyone, as a crash would.
    pub async fn kill_server(&mut self) {
        let _ = self.server_shutdown.send(());
        if let Some(task) = self.server_task.take() {
            let _ = task.await;
        }
    }
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run a blocking lock call off the async workers.
pub fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> JoinHandle<T> {
    tokio::task::spawn_blocking(f)
}

pub async fn join<T>(handle: JoinHandle<T>) -> T {
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("blocking call did not finish")
        .expect("blocking call panicked")
}

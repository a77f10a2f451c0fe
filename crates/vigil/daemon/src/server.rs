//! Server setup and lifecycle management

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vigil_control::{
    DesiredStateProvider, HealthManager, InMemoryBus, InMemoryDesiredStateProvider, MessageBus,
};
use vigil_types::Timestamp;

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::bulk::BulkDesiredStateProvider;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};

/// Vigil daemon: the engine plus its HTTP surface
pub struct Server {
    config: DaemonConfig,
    bus: Arc<InMemoryBus>,
    manager: HealthManager,
}

impl Server {
    /// Create a new server with the given configuration
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let bus = Arc::new(InMemoryBus::new());
        let provider = build_provider(&config, bus.clone())?;

        let manager = if config.virtual_time {
            HealthManager::virtual_time(config.manager.clone(), bus.clone(), provider, Timestamp::now())
        } else {
            HealthManager::realtime(config.manager.clone(), bus.clone(), provider)
        };

        Ok(Self {
            config,
            bus,
            manager,
        })
    }

    /// In-process bus the engine is attached to
    pub fn bus(&self) -> Arc<InMemoryBus> {
        self.bus.clone()
    }

    /// Run the server until a shutdown signal arrives
    pub async fn run(mut self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        self.manager.attach_bus()?;
        let bus: Arc<dyn MessageBus> = self.bus.clone();
        let state = AppState::new(
            bus,
            self.manager.snapshots(),
            self.config.server.bus_request_timeout(),
        );
        let app = create_router(state, self.config.server.enable_cors);

        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, virtual_time = self.config.virtual_time, "Vigil daemon listening");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let engine = tokio::spawn(self.manager.run(async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        }));

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()));

        info!("Vigil daemon shutting down");
        let _ = stop_tx.send(true);
        match engine.await {
            Ok(result) => result?,
            Err(err) => warn!(error = %err, "Engine task ended abnormally"),
        }
        self.bus.close();

        served
    }
}

fn build_provider(
    config: &DaemonConfig,
    bus: Arc<InMemoryBus>,
) -> DaemonResult<Arc<dyn DesiredStateProvider>> {
    match &config.bulk.api_url {
        Some(url) => Ok(Arc::new(BulkDesiredStateProvider::new(
            url.as_str(),
            config.bulk.clone(),
            bus,
            config.manager.topics.credentials.as_str(),
        )?)),
        None => {
            warn!("No bulk API configured, desired state will stay empty");
            Ok(Arc::new(InMemoryDesiredStateProvider::new()))
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

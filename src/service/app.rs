//! Main application state and service coordination
//!
//! This module contains the AppState that wires every dispatch component
//! together, runs the realtime and health servers, and owns the background
//! tasks (expiry sweeper, health metrics).

use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::config::{validate_config, AppConfig};
use crate::dispatch::{MessageDispatcher, RequestFanOut};
use crate::geo::{MatchingConfig, RadiusMatcher};
use crate::hub::{ConnectionHub, RealtimeServer, RealtimeServerConfig, RealtimeState};
use crate::lifecycle::{LifecycleConfig, RequestLifecycleManager};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::notify::{LoggingPushNotifier, Notifier, PushNotifier};
use crate::service::health::HealthCheck;
use crate::store::{InMemoryRequestStore, RequestStore};
use crate::sweeper::ExpirySweeper;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// External collaborators the service is built around
pub struct Collaborators {
    pub store: Arc<dyn RequestStore>,
    pub push: Arc<dyn PushNotifier>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Collaborators {
    /// In-memory store, logging push provider and the configured token table
    pub fn from_config(config: &AppConfig) -> Self {
        if config.realtime.auth_tokens.is_empty() {
            warn!("No auth tokens configured - every socket upgrade will be rejected");
        }
        Self {
            store: Arc::new(InMemoryRequestStore::new()),
            push: Arc::new(LoggingPushNotifier),
            authenticator: Arc::new(StaticTokenAuthenticator::new(
                config.realtime.auth_tokens.clone(),
            )),
        }
    }
}

/// Main application state containing all service components
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    /// Metrics service for monitoring and health checks
    metrics_service: Arc<MetricsService>,

    /// Core dispatch components
    hub: Arc<ConnectionHub>,
    store: Arc<dyn RequestStore>,
    notifier: Arc<Notifier>,
    lifecycle: Arc<RequestLifecycleManager>,
    dispatcher: Arc<MessageDispatcher>,
    sweeper: Arc<ExpirySweeper>,
    authenticator: Arc<dyn Authenticator>,
    realtime_server: Arc<RealtimeServer>,

    /// Background task handles
    background_tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Fired once on shutdown; every background loop watches it
    shutdown_token: CancellationToken,

    /// Service status
    is_running: Arc<RwLock<bool>>,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Initialize the application with its default collaborators
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        let collaborators = Collaborators::from_config(&config);
        Self::with_collaborators(config, collaborators).await
    }

    /// Initialize the application around the given collaborators
    pub async fn with_collaborators(
        config: AppConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ServiceError> {
        info!("Initializing dispatch service");
        validate_config(&config).map_err(|e| ServiceError::Configuration {
            message: e.to_string(),
        })?;
        info!(
            "Configuration: service={}, realtime_port={}, metrics_port={}",
            config.service.name, config.service.http_port, config.service.metrics_port
        );

        let metrics_service = Self::initialize_metrics(&config)?;
        let metrics = metrics_service.collector();

        let Collaborators {
            store,
            push,
            authenticator,
        } = collaborators;

        let hub = Arc::new(ConnectionHub::new(
            config.realtime.outbound_queue_capacity,
            metrics.clone(),
        ));
        let notifier = Arc::new(Notifier::new(hub.clone(), push, metrics.clone()));

        let matching = MatchingConfig::from(&config.matching);
        let lifecycle = Arc::new(RequestLifecycleManager::new(
            store.clone(),
            notifier.clone(),
            matching.clone(),
            LifecycleConfig {
                broadcast_deadline: config.broadcast_deadline(),
            },
            metrics.clone(),
        ));
        let fan_out = Arc::new(RequestFanOut::new(
            store.clone(),
            Arc::new(RadiusMatcher::new(matching)),
            lifecycle.clone(),
            notifier.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            hub.clone(),
            lifecycle.clone(),
            fan_out.clone(),
            notifier.clone(),
            metrics.clone(),
        ));
        let sweeper = Arc::new(ExpirySweeper::new(
            store.clone(),
            lifecycle.clone(),
            fan_out,
            metrics,
            config.sweep_interval(),
        ));

        let realtime_state = RealtimeState {
            hub: hub.clone(),
            dispatcher: dispatcher.clone(),
            authenticator: authenticator.clone(),
            keepalive: config.keepalive_interval(),
        };
        let realtime_server = Arc::new(RealtimeServer::new(
            RealtimeServerConfig {
                port: config.service.http_port,
                host: "0.0.0.0".to_string(),
                keepalive: config.keepalive_interval(),
            },
            realtime_state,
        ));

        Ok(Self {
            config,
            metrics_service,
            hub,
            store,
            notifier,
            lifecycle,
            dispatcher,
            sweeper,
            authenticator,
            realtime_server,
            background_tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            is_running: Arc::new(RwLock::new(false)),
            started_at: Utc::now(),
        })
    }

    /// Start the servers and background tasks
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting dispatch service");

        if self.shutdown_token.is_cancelled() {
            return Err(ServiceError::Initialization {
                message: "service was already shut down".to_string(),
            });
        }
        *self.is_running.write().await = true;

        let mut tasks = self.background_tasks.lock().await;
        tasks.push(self.spawn_metrics_server());
        tasks.push(self.spawn_realtime_server());
        tasks.push(self.spawn_sweeper());
        tasks.push(self.spawn_health_metrics());

        info!(
            "✅ Dispatch service started - {} background tasks",
            tasks.len()
        );
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of dispatch service");

        *self.is_running.write().await = false;
        self.shutdown_token.cancel();

        if let Err(e) = self.realtime_server.stop().await {
            warn!("Failed to stop realtime server: {}", e);
        }
        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        }

        match self.hub.shutdown() {
            Ok(closed) => info!("Closed {} live connections", closed),
            Err(e) => warn!("Failed to close live connections: {}", e),
        }

        self.stop_background_tasks().await;

        if tokio::time::timeout(self.config.shutdown_timeout(), self.notifier.flush_pushes())
            .await
            .is_err()
        {
            warn!("⚠️  Pending push notifications did not finish before the shutdown timeout");
        }

        let final_stats = self
            .hub
            .stats()
            .map_err(|e| ServiceError::BackgroundTask {
                message: format!("Failed to get final stats: {}", e),
            })?;
        info!("Final hub statistics: {:?}", final_stats);
        info!("✅ Dispatch service shutdown completed");
        Ok(())
    }

    /// Get service configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Check if service is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    pub fn hub(&self) -> Arc<ConnectionHub> {
        self.hub.clone()
    }

    pub fn store(&self) -> Arc<dyn RequestStore> {
        self.store.clone()
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub fn lifecycle(&self) -> Arc<RequestLifecycleManager> {
        self.lifecycle.clone()
    }

    pub fn dispatcher(&self) -> Arc<MessageDispatcher> {
        self.dispatcher.clone()
    }

    pub fn sweeper(&self) -> Arc<ExpirySweeper> {
        self.sweeper.clone()
    }

    /// State for mounting the socket endpoint on another router
    pub fn realtime_state(&self) -> RealtimeState {
        RealtimeState {
            hub: self.hub.clone(),
            dispatcher: self.dispatcher.clone(),
            authenticator: self.authenticator.clone(),
            keepalive: self.config.keepalive_interval(),
        }
    }

    /// Get metrics service
    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    fn initialize_metrics(config: &AppConfig) -> Result<Arc<MetricsService>, ServiceError> {
        info!(
            "Initializing metrics service on port {}",
            config.service.metrics_port
        );

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let health_config = HealthServerConfig {
            port: config.service.metrics_port,
            host: "0.0.0.0".to_string(),
            service_name: config.service.name.clone(),
        };

        let health_server = Arc::new(HealthServer::new(health_config, metrics_collector.clone()));
        Ok(Arc::new(MetricsService::new(
            metrics_collector,
            health_server,
        )))
    }

    fn spawn_metrics_server(self: &Arc<Self>) -> JoinHandle<()> {
        let metrics_service = self.metrics_service.clone();
        let app_state = self.clone();

        tokio::spawn(async move {
            if let Err(e) = metrics_service.start(Some(app_state)).await {
                error!("Metrics service failed: {}", e);
            } else {
                info!("Metrics service task completed");
            }
        })
    }

    fn spawn_realtime_server(&self) -> JoinHandle<()> {
        let server = self.realtime_server.clone();

        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Realtime server failed: {}", e);
            }
        })
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sweeper = self.sweeper.clone();
        let shutdown = self.shutdown_token.child_token();

        tokio::spawn(async move { sweeper.run(shutdown).await })
    }

    fn spawn_health_metrics(self: &Arc<Self>) -> JoinHandle<()> {
        let app_state = self.clone();
        let shutdown = self.shutdown_token.child_token();

        tokio::spawn(async move {
            let metrics_collector = app_state.metrics_service.collector();
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            info!("Health metrics task started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                metrics_collector
                    .service()
                    .uptime_seconds
                    .set(app_state.uptime().num_seconds());

                match HealthCheck::check(app_state.clone()).await {
                    Ok(health) => {
                        metrics_collector.update_health_status(health.status.as_gauge());
                        for check in &health.checks {
                            metrics_collector.update_component_health(
                                &check.name,
                                check.status != crate::service::health::HealthStatus::Unhealthy,
                            );
                        }
                        debug!(
                            "Updated health metrics - status: {}, connections: {}",
                            health.status, health.stats.connections
                        );
                    }
                    Err(e) => warn!("Health metrics update failed: {}", e),
                }
            }

            info!("Health metrics task stopped");
        })
    }

    /// Wait for background tasks, aborting any that outlive the timeout
    async fn stop_background_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().await.drain(..).collect();
        if tasks.is_empty() {
            debug!("No background tasks to stop");
            return;
        }

        let task_count = tasks.len();
        info!("Stopping {} background tasks...", task_count);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        for (i, mut task) in tasks.into_iter().enumerate() {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("Background task {}/{} did not stop in time, aborting", i + 1, task_count);
                task.abort();
            }
        }

        info!("✅ All {} background tasks stopped", task_count);
    }
}

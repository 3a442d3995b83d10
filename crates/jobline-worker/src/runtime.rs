//! Worker runtime.
//!
//! Owns one consumer per registered queue and the process lifecycle around
//! them: health check, resolver installation, startup hook, signal handling
//! and graceful shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use jobline_jobs::Registry;
use jobline_queue::{Broker, QueueHandle, WorkerEvent};

use crate::config::WorkerConfig;
use crate::consumer::Consumer;
use crate::error::{WorkerError, WorkerResult};
use crate::health::HealthCheck;
use crate::listener::spawn_listener;
use crate::logging::init_tracing;
use crate::metrics;
use crate::retry::{retry_async, RetryConfig};

const EVENT_CAPACITY: usize = 1024;

type StartupHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Long-lived worker process consuming every queue the registry knows.
pub struct WorkerRuntime<D> {
    config: WorkerConfig,
    registry: Registry<D>,
    broker: Arc<dyn Broker>,
    data: Arc<D>,
    startup: Option<StartupHook>,
    events: broadcast::Sender<WorkerEvent>,
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Worker panicked: {}", info);
        default_hook(info);
        std::process::exit(1);
    }));
}

impl<D: HealthCheck + Send + Sync + 'static> WorkerRuntime<D> {
    pub fn new(config: WorkerConfig, registry: Registry<D>, broker: Arc<dyn Broker>, data: Arc<D>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            registry,
            broker,
            data,
            startup: None,
            events,
        }
    }

    /// Run `hook` after queues are resolvable and before consumers start,
    /// typically to register schedulers. A failing hook aborts startup.
    pub fn with_startup_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.startup = Some(Box::new(move || hook().boxed()));
        self
    }

    /// Receive every event the consumers emit.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Run until SIGINT/SIGTERM and map the outcome to a process exit code.
    /// Installs the tracing subscriber unless the host already did.
    pub async fn serve(self) -> ExitCode {
        init_tracing();
        // Managed Redis endpoints need a TLS provider; a host may have set one.
        let _ = rustls::crypto::ring::default_provider().install_default();
        install_panic_hook();
        match self.run(shutdown_signal()).await {
            Ok(()) => {
                info!("Worker shutdown complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Worker stopped: {}", e);
                ExitCode::FAILURE
            }
        }
    }

    async fn health_check(&self) -> WorkerResult<()> {
        let retry = RetryConfig::new("broker ping").with_max_retries(self.config.startup_retries);
        retry_async(&retry, || self.broker.ping())
            .await
            .map_err(|e| WorkerError::health_check(format!("broker unreachable: {}", e)))?;

        self.data
            .health_check()
            .await
            .map_err(|e| WorkerError::health_check(format!("data context: {:#}", e)))?;

        info!("Health check passed");
        Ok(())
    }

    /// Start every consumer and run until `shutdown` resolves.
    pub async fn run<S>(mut self, shutdown: S) -> WorkerResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.health_check().await?;

        if self.config.metrics_enabled {
            metrics::init_metrics(self.config.metrics_port)?;
            info!("Prometheus metrics enabled on port {}", self.config.metrics_port);
        }

        let handles: HashMap<String, QueueHandle> = self
            .registry
            .bindings()
            .into_iter()
            .map(|binding| {
                let name = binding.name().to_string();
                (name, QueueHandle::new(binding, self.broker.clone()))
            })
            .collect();
        let resolver_handles = handles.clone();
        self.registry
            .set_queue_resolver(move |_job_id, queue| resolver_handles.get(queue).cloned());

        if let Some(hook) = self.startup.take() {
            hook().await.map_err(WorkerError::Startup)?;
        }

        let listener = spawn_listener(self.events.subscribe());
        let config = Arc::new(self.config.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut consumers = JoinSet::new();
        let mut queue_names: Vec<String> = handles.keys().cloned().collect();
        queue_names.sort();
        for (queue, handle) in handles {
            let consumer = Arc::new(Consumer::new(
                handle,
                self.registry.clone(),
                self.data.clone(),
                config.clone(),
                self.events.clone(),
            ));
            let shutdown_rx = shutdown_rx.clone();
            consumers.spawn(async move { (queue, consumer.run(shutdown_rx).await) });
        }
        info!("Worker started with {} queues: {}", queue_names.len(), queue_names.join(", "));

        tokio::pin!(shutdown);
        let crashed = tokio::select! {
            _ = &mut shutdown => None,
            Some(joined) = consumers.join_next() => Some(match joined {
                Ok((queue, Ok(()))) => WorkerError::consumer_stopped(queue, "exited before shutdown"),
                Ok((_, Err(e))) => e,
                Err(e) if e.is_panic() => WorkerError::consumer_stopped("unknown", "consumer task panicked"),
                Err(e) => WorkerError::consumer_stopped("unknown", e.to_string()),
            }),
        };
        if let Some(e) = &crashed {
            error!("Consumer crashed: {}", e);
        }

        info!("Shutting down worker");
        let _ = shutdown_tx.send(true);
        for queue in &queue_names {
            let _ = self.events.send(WorkerEvent::Closing { queue: queue.clone() });
        }

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = consumers.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((queue, Err(e))) => error!("Consumer for queue {} stopped with error: {}", queue, e),
                    Err(e) => error!("Consumer task failed: {}", e),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "In-flight jobs did not finish within {:?}; their locks will expire",
                self.config.shutdown_timeout
            );
            consumers.abort_all();
        }

        if let Err(e) = self.broker.close().await {
            error!("Failed to close broker connection: {}", e);
        }
        self.registry.close_external_queues().await;

        for queue in queue_names {
            let _ = self.events.send(WorkerEvent::Closed { queue });
        }
        drop(self.events);
        let _ = tokio::time::timeout(Duration::from_secs(1), listener).await;

        match crashed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

//! Scheduler registry.
//!
//! Pushes recurring triggers into the broker with idempotent upsert. Static
//! schedulers are registered once per startup; dynamic ones are registered
//! and removed per account at runtime. The tracking maps here only answer
//! "what did this process register"; the broker's scheduler store is the
//! source of truth and is rebuilt by re-running registration on restart.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use jobline_jobs::Registry;
use jobline_models::{JobOptions, RepeatOptions, SchedulerEntry, SchedulerSpec};
use jobline_queue::QueueHandle;

use crate::config::{
    scheduler_key, DynamicSchedulerRequest, DynamicSchedulerTemplate, StaticSchedulerConfig,
};
use crate::error::{SchedulerError, SchedulerResult};

/// Result of a dynamic registration.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerRegistration {
    /// The scheduler was upserted into the broker
    Registered(SchedulerEntry),
    /// This process already registered the job key; nothing was sent
    AlreadyRegistered,
}

#[derive(Default)]
struct Tracked {
    statics: BTreeMap<String, QueueHandle>,
    dynamics: BTreeMap<String, QueueHandle>,
}

pub struct SchedulerRegistry<D> {
    registry: Registry<D>,
    statics: BTreeMap<String, StaticSchedulerConfig>,
    templates: HashMap<String, DynamicSchedulerTemplate>,
    tracked: Mutex<Tracked>,
}

impl<D> std::fmt::Debug for SchedulerRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("statics", &self.statics.keys().collect::<Vec<_>>())
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<D: Send + Sync + 'static> SchedulerRegistry<D> {
    pub fn new(registry: Registry<D>) -> Self {
        Self {
            registry,
            statics: BTreeMap::new(),
            templates: HashMap::new(),
            tracked: Mutex::new(Tracked::default()),
        }
    }

    /// Declare a static scheduler. A later config with the same name
    /// replaces the earlier one.
    pub fn with_static(mut self, config: StaticSchedulerConfig) -> Self {
        if let Some(previous) = self.statics.insert(config.name.clone(), config) {
            warn!("Static scheduler '{}' declared twice; keeping the last", previous.name);
        }
        self
    }

    pub fn with_template(mut self, template: DynamicSchedulerTemplate) -> Self {
        if self
            .templates
            .insert(template.id().to_string(), template)
            .is_some()
        {
            warn!("Scheduler template declared twice; keeping the last");
        }
        self
    }

    pub fn template(&self, id: &str) -> Option<&DynamicSchedulerTemplate> {
        self.templates.get(id)
    }

    fn spec(
        &self,
        job_name: &str,
        queue: &str,
        repeat: RepeatOptions,
        data: Value,
        options: &JobOptions,
    ) -> SchedulerSpec {
        let mut opts = self.registry.effective_options(job_name, queue, options);
        opts.repeat = None;
        opts.job_id = None;
        SchedulerSpec {
            repeat,
            job_name: job_name.to_string(),
            data,
            opts,
        }
    }

    async fn upsert(
        &self,
        key: &str,
        job_name: &str,
        queue: &str,
        spec: SchedulerSpec,
    ) -> SchedulerResult<(QueueHandle, SchedulerEntry)> {
        let handle = self
            .registry
            .queue(job_name, queue)
            .map_err(|e| SchedulerError::registration(key, e))?;
        let entry = handle
            .upsert_scheduler(key, spec)
            .await
            .map_err(|e| SchedulerError::registration(key, e))?;
        Ok((handle, entry))
    }

    /// Upsert every static scheduler. Stops at the first failure, which is
    /// logged and returned.
    pub async fn register_static_schedulers(&self) -> SchedulerResult<usize> {
        for config in self.statics.values() {
            let key = config.key();
            let spec = self.spec(
                &config.job_name,
                &config.queue,
                config.repeat(),
                config.payload.clone(),
                &config.options,
            );

            match self.upsert(&key, &config.job_name, &config.queue, spec).await {
                Ok((handle, entry)) => {
                    debug!(
                        "Static scheduler '{}' on queue {} next fires at {:?}",
                        config.name, config.queue, entry.next_millis
                    );
                    self.tracked.lock().await.statics.insert(config.name.clone(), handle);
                }
                Err(e) => {
                    error!(
                        scheduler = %config.name,
                        queue = %config.queue,
                        error = %e,
                        "Failed to register static scheduler"
                    );
                    return Err(e);
                }
            }
        }

        info!("Registered {} static schedulers", self.statics.len());
        Ok(self.statics.len())
    }

    /// Schedule one account under a template, unless this process already
    /// did.
    pub async fn register_dynamic_scheduler(
        &self,
        request: DynamicSchedulerRequest,
    ) -> SchedulerResult<SchedulerRegistration> {
        let template = self
            .templates
            .get(&request.template)
            .ok_or_else(|| SchedulerError::unknown_template(&request.template))?;
        let job_key = template.job_key(&request.account_id);

        // Held across the upsert so concurrent requests for one key send
        // a single upsert.
        let mut tracked = self.tracked.lock().await;
        if tracked.dynamics.contains_key(&job_key) {
            warn!(
                "Dynamic scheduler '{}' already registered for account {}; skipping",
                job_key, request.account_id
            );
            return Ok(SchedulerRegistration::AlreadyRegistered);
        }

        let pattern = request
            .cron_pattern
            .unwrap_or_else(|| template.cron_for(&request.account_id));
        let repeat = RepeatOptions::cron(pattern).with_tz(template.tz());
        let spec = self.spec(
            template.job_name(),
            template.queue(),
            repeat,
            template.payload_for(&request.account_id),
            template.options(),
        );

        let key = scheduler_key(&job_key);
        match self.upsert(&key, template.job_name(), template.queue(), spec).await {
            Ok((handle, entry)) => {
                info!(
                    "Registered dynamic scheduler '{}' ({}) on queue {}",
                    job_key,
                    entry.spec.repeat.pattern,
                    template.queue()
                );
                tracked.dynamics.insert(job_key, handle);
                Ok(SchedulerRegistration::Registered(entry))
            }
            Err(e) => {
                error!(
                    scheduler = %job_key,
                    account = %request.account_id,
                    error = %e,
                    "Failed to register dynamic scheduler"
                );
                Err(e)
            }
        }
    }

    /// Remove an account's scheduler. Returns `Ok(false)` when this process
    /// never registered it.
    pub async fn unregister_dynamic_scheduler(
        &self,
        template: &str,
        account_id: &str,
    ) -> SchedulerResult<bool> {
        let template = self
            .templates
            .get(template)
            .ok_or_else(|| SchedulerError::unknown_template(template))?;
        let job_key = template.job_key(account_id);

        let mut tracked = self.tracked.lock().await;
        let Some(handle) = tracked.dynamics.get(&job_key).cloned() else {
            warn!("Dynamic scheduler '{}' is not registered; nothing to remove", job_key);
            return Ok(false);
        };

        let key = scheduler_key(&job_key);
        match handle.remove_scheduler(&key).await {
            Ok(existed) => {
                if !existed {
                    debug!("Scheduler {} was already gone from the broker", key);
                }
                tracked.dynamics.remove(&job_key);
                info!("Unregistered dynamic scheduler '{}'", job_key);
                Ok(true)
            }
            Err(e) => {
                error!(scheduler = %job_key, error = %e, "Failed to unregister dynamic scheduler");
                Err(SchedulerError::removal(key, e))
            }
        }
    }

    /// Job keys of the dynamic schedulers registered by this process.
    pub async fn registered_dynamic_schedulers(&self) -> Vec<String> {
        self.tracked.lock().await.dynamics.keys().cloned().collect()
    }

    /// Names of the static schedulers registered by this process.
    pub async fn registered_static_schedulers(&self) -> Vec<String> {
        self.tracked.lock().await.statics.keys().cloned().collect()
    }
}

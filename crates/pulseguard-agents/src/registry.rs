//! [`AgentRegistry`] – registration, bus wiring, and lifecycle orchestration.
//!
//! `register` wires each of the agent's subscriptions to the event bus
//! through an adapter that also feeds the health bookkeeping.  `start_all`
//! brings agents up with bounded parallelism; the first failure aborts the
//! startup and rolls back (stops) everything already started.  The set of
//! registered agents is fixed once `start_all` returns.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use pulseguard_bus::{EventBus, EventHandler, HandlerError, SubscribeOptions, SubscriptionId};
use pulseguard_types::Event;

use crate::agent::{Agent, AgentHealth, HealthState};
use crate::AgentError;

/// Bus adapter: delegates deliveries to the agent and records the outcome.
struct AgentHandler {
    agent: Arc<dyn Agent>,
    health: Arc<HealthState>,
}

#[async_trait]
impl EventHandler for AgentHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        match self.agent.handle(event).await {
            Ok(()) => {
                self.health.record_success();
                Ok(())
            }
            Err(e) => {
                self.health.record_failure(&e);
                Err(e)
            }
        }
    }
}

struct Entry {
    agent: Arc<dyn Agent>,
    health: Arc<HealthState>,
    subscription_ids: Vec<SubscriptionId>,
}

/// Owner of every agent in the process.
pub struct AgentRegistry {
    bus: EventBus,
    entries: Mutex<Vec<Arc<Entry>>>,
    sealed: AtomicBool,
    start_parallelism: usize,
    delivery_defaults: Option<SubscribeOptions>,
}

impl AgentRegistry {
    /// Default bound on concurrent agent starts.
    pub const DEFAULT_START_PARALLELISM: usize = 4;

    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            entries: Mutex::new(Vec::new()),
            sealed: AtomicBool::new(false),
            start_parallelism: Self::DEFAULT_START_PARALLELISM,
            delivery_defaults: None,
        }
    }

    /// Override the retry budget and backoff of every subscription wired
    /// through this registry (configuration-driven delivery defaults).  Each
    /// agent keeps its own `parallelism` and `dlq_on_exhaust` choices.
    pub fn with_delivery_defaults(mut self, defaults: SubscribeOptions) -> Self {
        self.delivery_defaults = Some(defaults);
        self
    }

    fn effective_options(&self, agent_options: SubscribeOptions) -> SubscribeOptions {
        match &self.delivery_defaults {
            None => agent_options,
            Some(d) => SubscribeOptions {
                max_attempts: d.max_attempts,
                backoff_min: d.backoff_min,
                backoff_max: d.backoff_max,
                ..agent_options
            },
        }
    }

    /// Record `agent` and wire its subscriptions to the bus.
    ///
    /// # Errors
    ///
    /// [`AgentError::RegistrationClosed`] once `start_all` has returned —
    /// runtime re-registration is not supported.
    pub fn register(&self, agent: Arc<dyn Agent>) -> Result<(), AgentError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(AgentError::RegistrationClosed);
        }
        let health = Arc::new(HealthState::default());
        let mut subscription_ids = Vec::new();
        for (event_type, options) in agent.subscriptions() {
            let handler = Arc::new(AgentHandler {
                agent: Arc::clone(&agent),
                health: Arc::clone(&health),
            });
            let options = self.effective_options(options);
            let id = self
                .bus
                .subscribe(event_type, agent.name(), handler, options);
            subscription_ids.push(id);
        }
        info!(agent = %agent.name(), subscriptions = subscription_ids.len(), "registered agent");
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(Entry {
                agent,
                health,
                subscription_ids,
            }));
        Ok(())
    }

    /// Start every registered agent with bounded parallelism.
    ///
    /// On the first failure the startup aborts, all agents that had already
    /// started are stopped again, and the failure is returned.  On success
    /// the registry is sealed.
    pub async fn start_all(&self) -> Result<(), AgentError> {
        let entries: Vec<Arc<Entry>> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let semaphore = Arc::new(Semaphore::new(self.start_parallelism.max(1)));
        let mut join_set = JoinSet::new();
        for entry in &entries {
            let entry = Arc::clone(entry);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                // Semaphore bounds concurrent starts; closed-semaphore error
                // cannot happen while the set is running.
                let _permit = semaphore.acquire().await;
                let result = entry.agent.start().await;
                if result.is_ok() {
                    entry.health.mark_started();
                }
                (entry, result)
            });
        }

        let mut started: Vec<Arc<Entry>> = Vec::new();
        let mut failure: Option<AgentError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((entry, Ok(()))) => started.push(entry),
                Ok((entry, Err(e))) => {
                    error!(agent = %entry.agent.name(), error = %e, "agent start failed");
                    failure.get_or_insert(AgentError::StartFailed {
                        name: entry.agent.name().to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(join_err) => {
                    failure.get_or_insert(AgentError::StartFailed {
                        name: "<unknown>".to_string(),
                        reason: format!("start task panicked: {join_err}"),
                    });
                }
            }
        }

        if let Some(err) = failure {
            warn!(rolled_back = started.len(), "rolling back started agents");
            for entry in started.iter().rev() {
                if let Err(stop_err) = entry.agent.stop().await {
                    error!(agent = %entry.agent.name(), error = %stop_err, "rollback stop failed");
                }
                entry.health.mark_stopped();
            }
            return Err(err);
        }

        self.sealed.store(true, Ordering::SeqCst);
        info!(agents = entries.len(), "all agents started");
        Ok(())
    }

    /// Stop every agent (reverse registration order) and unsubscribe it.
    /// Stop failures are logged and do not prevent the remaining agents from
    /// stopping.
    pub async fn stop_all(&self) {
        let entries: Vec<Arc<Entry>> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for entry in entries.iter().rev() {
            for id in &entry.subscription_ids {
                self.bus.unsubscribe(*id);
            }
            if let Err(e) = entry.agent.stop().await {
                error!(agent = %entry.agent.name(), error = %e, "agent stop failed");
            }
            entry.health.mark_stopped();
        }
        info!(agents = entries.len(), "all agents stopped");
    }

    /// Health snapshot, keyed by agent name.
    pub fn health(&self) -> BTreeMap<String, AgentHealth> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| (entry.agent.name().to_string(), entry.health.snapshot()))
            .collect()
    }
}

//! The WorkerPool state machine (spec.md §4.5).
//!
//! One ticker drives SCAN; each tenant gets its own task, admitted through a
//! semaphore of size `worker_count`; within a tenant, entries are processed
//! sequentially. This mirrors the teacher's own `run_worker_loop` — a single
//! polling task fanning work out over bounded concurrency — generalized from
//! one flat job table to per-tenant queues with rate limiting and circuit
//! breaking layered in front of the send.

use std::sync::Arc;

use chrono::Utc;
use relaycore_breaker::CircuitBreakerManager;
use relaycore_core::{
    classify, EmailQueueEntry, HistoryOutcome, HistoryUpsert, MessageHistoryStore,
    ProgressCallbacks, QueueStore, RetryPolicy, SendEmailProviderRequest, Sender, StoreError,
    Tenant, TenantRegistry, WorkerConfig,
};
use relaycore_ratelimit::RateLimiter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Ties every collaborator spec.md §6 names into one runnable pool.
pub struct WorkerPool<Q, H, R, S, C> {
    config: WorkerConfig,
    queue: Arc<Q>,
    history: Arc<H>,
    registry: Arc<R>,
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerManager>,
    sender: Arc<S>,
    retry_policy: Arc<dyn RetryPolicy + Send + Sync>,
    callbacks: Arc<C>,
}

impl<Q, H, R, S, C> WorkerPool<Q, H, R, S, C>
where
    Q: QueueStore + 'static,
    H: MessageHistoryStore + 'static,
    R: TenantRegistry + 'static,
    S: Sender + 'static,
    C: ProgressCallbacks + 'static,
{
    pub fn new(
        config: WorkerConfig,
        queue: Arc<Q>,
        history: Arc<H>,
        registry: Arc<R>,
        sender: Arc<S>,
        retry_policy: Arc<dyn RetryPolicy + Send + Sync>,
        callbacks: Arc<C>,
    ) -> Self {
        WorkerPool {
            rate_limiter: Arc::new(RateLimiter::new()),
            breakers: Arc::new(CircuitBreakerManager::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_cooldown,
            )),
            config,
            queue,
            history,
            registry,
            sender,
            retry_policy,
            callbacks,
        }
    }

    #[cfg(test)]
    pub(crate) fn breaker_is_open(&self, integration_id: &str) -> bool {
        self.breakers.is_open(integration_id)
    }

    /// Snapshot of every integration's rate-limiter bucket (spec.md §6
    /// `get_stats`), for an external metrics endpoint to expose.
    pub fn rate_limiter_stats(&self) -> std::collections::HashMap<String, relaycore_ratelimit::RateLimiterStats> {
        self.rate_limiter.stats()
    }

    /// Snapshot of every integration's circuit breaker (spec.md §6
    /// `get_circuit_breaker_stats`).
    pub fn circuit_breaker_stats(&self) -> std::collections::HashMap<String, relaycore_breaker::BreakerStats> {
        self.breakers.stats()
    }

    /// Reset any row stuck in `Processing` since before the configured
    /// recovery age, across every tenant. Intended to run once at startup.
    pub async fn recover_stale_processing(&self) {
        let tenants = match self.registry.list().await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "failed to list tenants during recovery sweep");
                return;
            }
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.processing_recovery_age)
                .unwrap_or(chrono::Duration::minutes(5));
        for tenant in tenants {
            match self.queue.recover_stale_processing(tenant.id, cutoff).await {
                Ok(0) => {}
                Ok(n) => info!(tenant_id = %tenant.id, count = n, "reset stale processing rows"),
                Err(e) => error!(tenant_id = %tenant.id, error = %e, "recovery sweep failed"),
            }
        }
    }

    /// Run the poll loop until `cancel` fires, then drain in-flight tenant
    /// tasks before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.recover_stale_processing().await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("worker pool shutdown requested, draining tenant tasks");
                    break;
                }
                _ = ticker.tick() => {
                    let tenants = match self.registry.list().await {
                        Ok(t) => t,
                        Err(e) => {
                            error!(error = %e, "failed to list tenants");
                            continue;
                        }
                    };
                    for tenant in tenants {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        let this = self.clone();
                        let cancel = cancel.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            this.process_tenant(&tenant, &cancel).await;
                        });
                    }
                }
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        error!(error = %e, "tenant task panicked");
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
    }

    pub(crate) async fn process_tenant(&self, tenant: &Tenant, cancel: &CancellationToken) {
        let min_rate = tenant.min_email_rate_per_minute();
        let effective_batch = self.config.effective_batch(min_rate);

        let entries = match self.queue.fetch_pending(tenant.id, effective_batch).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(tenant_id = %tenant.id, error = %e, "failed to fetch pending entries");
                return;
            }
        };

        for entry in entries {
            if cancel.is_cancelled() {
                return;
            }
            self.process_entry(tenant, entry, cancel).await;
        }
    }

    pub(crate) async fn process_entry(&self, tenant: &Tenant, mut entry: EmailQueueEntry, cancel: &CancellationToken) {
        let Some(integration) = tenant.integration_by_id(&entry.integration_id) else {
            match self.queue.mark_processing(tenant.id, entry.id).await {
                Ok(()) => {}
                Err(StoreError::AlreadyClaimed) => return,
                Err(e) => {
                    error!(entry_id = %entry.id, error = %e, "mark_processing failed");
                    return;
                }
            }
            entry.attempts += 1;
            self.failure_path(tenant, entry, "integration not found", None).await;
            return;
        };

        if self.breakers.is_open(&entry.integration_id) {
            let retry_at = Utc::now()
                + chrono::Duration::from_std(self.config.circuit_breaker_cooldown)
                    .unwrap_or(chrono::Duration::seconds(60));
            if let Err(e) = self.queue.set_next_retry(tenant.id, entry.id, retry_at).await {
                error!(entry_id = %entry.id, error = %e, "set_next_retry failed while circuit open");
            }
            return;
        }

        match self.queue.mark_processing(tenant.id, entry.id).await {
            Ok(()) => {}
            Err(StoreError::AlreadyClaimed) => return,
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "mark_processing failed");
                return;
            }
        }
        entry.attempts += 1;

        let rate_per_minute = entry
            .payload
            .rate_limit_per_minute
            .or_else(|| integration.email_provider.as_ref().and_then(|p| p.rate_limit_per_minute))
            .unwrap_or(60);

        if self
            .rate_limiter
            .wait(cancel, &entry.integration_id, rate_per_minute)
            .await
            .is_err()
        {
            // Cancelled: row stays Processing, reclaimed by the recovery sweep.
            return;
        }

        let Some(provider) = integration.email_provider.clone() else {
            self.failure_path(tenant, entry, "integration has no email provider", None).await;
            return;
        };

        let from_name = entry
            .payload
            .email_options
            .as_ref()
            .and_then(|o| o.from_name_override.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| provider.default_from_name.clone());

        let request = SendEmailProviderRequest {
            tenant_id: tenant.id,
            integration_id: entry.integration_id.clone(),
            message_id: entry.message_id.clone(),
            from_address: entry.payload.from_address.clone(),
            from_name,
            to: entry.contact_email.clone(),
            subject: entry.payload.subject.clone(),
            html_content: entry.payload.html_content.clone(),
            provider: provider.clone(),
            email_options: entry.payload.email_options.clone(),
        };

        match self.sender.send(request).await {
            Ok(()) => {
                self.breakers.record_success(&entry.integration_id);
                if let Err(e) = self.queue.mark_sent(tenant.id, entry.id).await {
                    warn!(entry_id = %entry.id, error = %e, "mark_sent failed after successful send");
                }
                let upsert = HistoryUpsert {
                    message_id: entry.message_id.clone(),
                    contact_email: entry.contact_email.clone(),
                    template_id: entry.template_id.clone(),
                    template_version: entry.payload.template_version,
                    message_data: serde_json::json!({
                        "subject": entry.payload.subject,
                        "html_content": entry.payload.html_content,
                    }),
                    sent_at: entry.created_at,
                    source_type: entry.source_type,
                    source_id: entry.source_id.clone(),
                    list_id: entry.payload.list_id.clone(),
                    outcome: HistoryOutcome::Success,
                };
                if let Err(e) = self.history.upsert(tenant.id, &tenant.secret_key, upsert).await {
                    warn!(entry_id = %entry.id, error = %e, "history upsert failed after successful send");
                }
                self.callbacks.on_email_sent(
                    tenant.id,
                    entry.source_type,
                    &entry.source_id,
                    &entry.message_id,
                );
            }
            Err(err) => {
                let classified = classify(Some(err.0.as_str()), provider.kind);
                self.breakers.record_failure(&entry.integration_id, classified.as_ref());
                self.failure_path(tenant, entry, &err.0, classified).await;
            }
        }
    }

    async fn failure_path(
        &self,
        tenant: &Tenant,
        entry: EmailQueueEntry,
        err: &str,
        classified: Option<relaycore_core::ClassifiedError>,
    ) {
        let is_permanent = entry.attempts >= entry.max_attempts
            || classified.as_ref().is_some_and(|c| !c.retryable);

        let upsert = HistoryUpsert {
            message_id: entry.message_id.clone(),
            contact_email: entry.contact_email.clone(),
            template_id: entry.template_id.clone(),
            template_version: entry.payload.template_version,
            message_data: serde_json::json!({
                "subject": entry.payload.subject,
                "html_content": entry.payload.html_content,
            }),
            sent_at: entry.created_at,
            source_type: entry.source_type,
            source_id: entry.source_id.clone(),
            list_id: entry.payload.list_id.clone(),
            outcome: HistoryOutcome::Failure {
                status_info: err.to_string(),
            },
        };
        if let Err(e) = self.history.upsert(tenant.id, &tenant.secret_key, upsert).await {
            warn!(entry_id = %entry.id, error = %e, "history upsert failed after failed send");
        }

        if is_permanent {
            if let Err(e) = self.queue.delete(tenant.id, entry.id).await {
                warn!(entry_id = %entry.id, error = %e, "delete failed after permanent failure");
            }
            self.callbacks.on_email_failed(
                tenant.id,
                entry.source_type,
                &entry.source_id,
                &entry.message_id,
                err,
                true,
            );
        } else {
            let next_retry = self.retry_policy.next(entry.attempts, Utc::now());
            if let Err(e) = self.queue.mark_failed(tenant.id, entry.id, err, next_retry).await {
                warn!(entry_id = %entry.id, error = %e, "mark_failed failed after retryable failure");
            }
            self.callbacks.on_email_failed(
                tenant.id,
                entry.source_type,
                &entry.source_id,
                &entry.message_id,
                err,
                false,
            );
        }
    }
}

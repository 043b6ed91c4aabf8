use crate::accounts::AccountRegistry;
use crate::audit_log::AuditLogger;
use crate::config::{Config, TenantConfig};
use crate::metrics::Metrics;
use crate::passthrough::PassthroughRules;
use crate::slots::SlotLedger;
use crate::sticky::StickySessions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub stream_client: reqwest::Client,
    pub config: Config,
    pub tenants: Arc<HashMap<String, TenantConfig>>,
    pub accounts: Arc<AccountRegistry>,
    pub user_slots: Arc<SlotLedger>,
    pub account_slots: Arc<SlotLedger>,
    pub sticky: Arc<StickySessions>,
    pub passthrough: Arc<PassthroughRules>,
    pub inflight_count: Arc<AtomicU64>,
    pub metrics: Metrics,
    pub audit_logger: Option<AuditLogger>,
    pub _tracer_provider: opentelemetry_sdk::trace::SdkTracerProvider,
}

/// Feeds the in-flight gauge; decrements once on drop, on any exit path.
pub struct RequestGuard {
    counter: Arc<AtomicU64>,
}

impl RequestGuard {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

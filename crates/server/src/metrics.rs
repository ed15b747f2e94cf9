#![cfg(feature = "metrics")]

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub admission_rejections_total: IntCounter,
    pub messages_echoed_total: IntCounterVec,
    pub persistence_failures_total: IntCounter,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "nkata_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let admission_rejections_total = IntCounter::new(
            "nkata_admission_rejections_total",
            "Requests rejected because the client exhausted its quota",
        )?;
        registry.register(Box::new(admission_rejections_total.clone()))?;

        let messages_echoed_total = IntCounterVec::new(
            Opts::new(
                "nkata_messages_echoed_total",
                "Envelopes echoed to streaming peers, labeled by inbound frame kind",
            ),
            &["frame"],
        )?;
        registry.register(Box::new(messages_echoed_total.clone()))?;

        let persistence_failures_total = IntCounter::new(
            "nkata_persistence_failures_total",
            "Echoed envelopes that could not be persisted",
        )?;
        registry.register(Box::new(persistence_failures_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            admission_rejections_total,
            messages_echoed_total,
            persistence_failures_total,
        }))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_counters() {
        let metrics = MetricsContext::init().expect("metrics init");
        metrics.admission_rejections_total.inc();
        metrics
            .messages_echoed_total
            .with_label_values(&["text"])
            .inc();

        let body = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(body.contains("nkata_admission_rejections_total 1"));
        assert!(body.contains("nkata_messages_echoed_total{frame=\"text\"} 1"));
    }
}

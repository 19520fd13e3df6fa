//! Prometheus export. Every metric reads its own counter.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;

use crate::context::SyncContext;

const METRICS: &[(&str, &str)] = &[
    ("scanned", "Scanned objects"),
    ("excluded", "Excluded objects"),
    ("excluded_bytes", "Excluded bytes"),
    ("extra", "Extra objects"),
    ("extra_bytes", "Extra bytes"),
    ("handled", "Handled objects"),
    ("pending", "Pending objects"),
    ("copied", "Copied objects"),
    ("copied_bytes", "Copied bytes"),
    ("skipped", "Skipped objects"),
    ("skipped_bytes", "Skipped bytes"),
    ("failed", "Failed objects"),
    ("deleted", "Deleted objects"),
    ("checked", "Checked objects"),
    ("checked_bytes", "Checked bytes"),
    ("Prefix", "listed prefix"),
];

pub(crate) fn register(registry: &prometheus::Registry, ctx: &Arc<SyncContext>) -> Result<()> {
    registry
        .register(Box::new(SyncCollector::new(ctx.clone())?))
        .context("register sync metrics")
}

struct SyncCollector {
    ctx: Arc<SyncContext>,
    descs: Vec<Desc>,
}

impl SyncCollector {
    fn new(ctx: Arc<SyncContext>) -> Result<Self> {
        let descs = METRICS
            .iter()
            .map(|(name, help)| {
                Desc::new(
                    name.to_string(),
                    help.to_string(),
                    Vec::new(),
                    std::collections::HashMap::new(),
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("build metric descriptors")?;
        Ok(Self { ctx, descs })
    }
}

fn counter(name: &str, help: &str, value: u64) -> Vec<MetricFamily> {
    let counter = prometheus::IntCounter::new(name, help).unwrap();
    counter.inc_by(value);
    counter.collect()
}

fn gauge(name: &str, help: &str, value: i64) -> Vec<MetricFamily> {
    let gauge = prometheus::IntGauge::new(name, help).unwrap();
    gauge.set(value);
    gauge.collect()
}

impl Collector for SyncCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let c = &self.ctx.counters;
        let mut out = Vec::with_capacity(METRICS.len());
        out.extend(counter("scanned", "Scanned objects", c.scanned()));
        out.extend(counter("excluded", "Excluded objects", c.excluded.get()));
        out.extend(counter(
            "excluded_bytes",
            "Excluded bytes",
            c.excluded_bytes.get(),
        ));
        out.extend(counter("extra", "Extra objects", c.extra.get()));
        out.extend(counter("extra_bytes", "Extra bytes", c.extra_bytes.get()));
        out.extend(counter("handled", "Handled objects", c.handled.get()));
        out.extend(gauge(
            "pending",
            "Pending objects",
            c.pending.load(std::sync::atomic::Ordering::Relaxed),
        ));
        out.extend(counter("copied", "Copied objects", c.copied.get()));
        out.extend(counter("copied_bytes", "Copied bytes", c.copied_bytes.get()));
        out.extend(counter("skipped", "Skipped objects", c.skipped.get()));
        out.extend(counter(
            "skipped_bytes",
            "Skipped bytes",
            c.skipped_bytes.get(),
        ));
        out.extend(counter("failed", "Failed objects", c.failed.get()));
        out.extend(counter("deleted", "Deleted objects", c.deleted.get()));
        out.extend(counter("checked", "Checked objects", c.checked.get()));
        out.extend(counter(
            "checked_bytes",
            "Checked bytes",
            c.checked_bytes.get(),
        ));
        out.extend(counter("Prefix", "listed prefix", c.listed_prefix.get()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mem::MemStore;

    #[tokio::test]
    async fn metrics_read_their_own_counters() -> Result<()> {
        let registry = prometheus::Registry::new();
        let ctx = SyncContext::new(
            Arc::new(MemStore::new("s")),
            Arc::new(MemStore::new("d")),
            Config::default(),
        );
        register(&registry, &ctx)?;
        ctx.counters.excluded_bytes.add(77);
        ctx.counters.copied.add(3);
        let families = registry.gather();
        let value = |name: &str| {
            families
                .iter()
                .find(|f| f.get_name() == name)
                .map(|f| {
                    let metric = &f.get_metric()[0];
                    if metric.has_counter() {
                        metric.get_counter().get_value()
                    } else {
                        metric.get_gauge().get_value()
                    }
                })
                .unwrap()
        };
        assert_eq!(value("excluded_bytes"), 77.0);
        assert_eq!(value("copied"), 3.0);
        assert_eq!(value("extra"), 0.0);
        Ok(())
    }
}

use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

/// Kind of inbound protocol exchange.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CommandType {
    /// `GET .../info/refs` ref discovery.
    InfoRefs,
    /// `POST .../git-upload-pack` negotiation and pack transfer.
    UploadPack,
    /// `POST .../git-receive-pack` push, forwarded to the origin.
    ReceivePack,
}

/// Whether a command was answered from the mirror as-is.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheState {
    /// Served from the mirror without refreshing it.
    Hit,
    /// The command performed or joined a mirror refresh.
    Miss,
    /// The mirror was not involved (forwarded to the origin).
    Bypass,
}

/// Final outcome classification of a command.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CanonicalStatus {
    Ok,
    ClientError,
    UpstreamError,
    InternalError,
}

/// Commands the proxy itself issues against the origin.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OutboundCommand {
    /// First fetch into an empty mirror.
    InitialFetch,
    /// Update of a mirror that has been fetched before.
    IncrementalFetch,
    /// A push relayed to the origin.
    ReceivePack,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InboundLabels {
    pub command_type: CommandType,
    pub canonical_status: CanonicalStatus,
    pub cache_state: CacheState,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutboundLabels {
    pub command_type: OutboundCommand,
    pub canonical_status: CanonicalStatus,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// 100ms .. ~1.8h, doubling.
fn latency_buckets() -> Histogram {
    Histogram::new(exponential_buckets(0.1, 2.0, 17))
}

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- inbound --
    pub inbound_commands: Family<InboundLabels, Counter>,
    pub inbound_command_latency_seconds: Family<InboundLabels, Histogram>,

    // -- outbound --
    pub outbound_commands: Family<OutboundLabels, Counter>,
    pub outbound_command_latency_seconds: Family<OutboundLabels, Histogram>,

    // -- single-flight --
    pub upstream_fetch_blocking_seconds: Histogram,

    // -- gauges --
    pub mirrors: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let inbound_commands = Family::<InboundLabels, Counter>::default();
        registry.register(
            "mirrorcache_inbound_commands",
            "Inbound command count",
            inbound_commands.clone(),
        );

        let inbound_command_latency_seconds =
            Family::<InboundLabels, Histogram>::new_with_constructor(latency_buckets);
        registry.register(
            "mirrorcache_inbound_command_latency_seconds",
            "Inbound command latency from request receipt to last response byte",
            inbound_command_latency_seconds.clone(),
        );

        let outbound_commands = Family::<OutboundLabels, Counter>::default();
        registry.register(
            "mirrorcache_outbound_commands",
            "Outbound command count",
            outbound_commands.clone(),
        );

        let outbound_command_latency_seconds =
            Family::<OutboundLabels, Histogram>::new_with_constructor(latency_buckets);
        registry.register(
            "mirrorcache_outbound_command_latency_seconds",
            "Outbound command latency",
            outbound_command_latency_seconds.clone(),
        );

        let upstream_fetch_blocking_seconds = latency_buckets();
        registry.register(
            "mirrorcache_upstream_fetch_blocking_seconds",
            "Time requests spent waiting for a mirror refresh started by another request",
            upstream_fetch_blocking_seconds.clone(),
        );

        let mirrors: Gauge = Gauge::default();
        registry.register(
            "mirrorcache_mirrors",
            "Number of mirror entries known to this process",
            mirrors.clone(),
        );

        Self {
            inbound_commands,
            inbound_command_latency_seconds,
            outbound_commands,
            outbound_command_latency_seconds,
            upstream_fetch_blocking_seconds,
            mirrors,
        }
    }

    /// Record one finished inbound command.
    pub fn record_inbound(&self, labels: &InboundLabels, latency: Duration) {
        self.inbound_commands.get_or_create(labels).inc();
        self.inbound_command_latency_seconds
            .get_or_create(labels)
            .observe(latency.as_secs_f64());
    }

    /// Record one command issued against the origin.
    pub fn record_outbound(&self, labels: &OutboundLabels, latency: Duration) {
        self.outbound_commands.get_or_create(labels).inc();
        self.outbound_command_latency_seconds
            .get_or_create(labels)
            .observe(latency.as_secs_f64());
    }

    /// Record time a caller spent joined to somebody else's refresh.
    pub fn record_upstream_wait(&self, waited: Duration) {
        self.upstream_fetch_blocking_seconds
            .observe(waited.as_secs_f64());
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

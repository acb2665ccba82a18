use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use crate::crd::{ConfigSource, MetricsProviderKind, RightSizerConfigSpec};
use crate::resources::{QuantityError, parse_cpu, parse_memory};

/* ============================= SETTINGS ============================= */

/// Effective operator configuration, in internal units.
///
/// Built from defaults and partial `RightSizerConfig` specs delivered by an
/// external controller. Readers take a snapshot; nothing holds the lock
/// across I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    // sizing factors
    pub cpu_request_multiplier: f64,
    pub memory_request_multiplier: f64,
    pub cpu_limit_multiplier: f64,
    pub memory_limit_multiplier: f64,
    pub cpu_request_addition_milli: u64,
    pub memory_request_addition_mib: u64,
    pub cpu_limit_addition_milli: u64,
    pub memory_limit_addition_mib: u64,

    // floors and caps
    pub min_cpu_request_milli: u64,
    pub min_memory_request_mib: u64,
    pub max_cpu_limit_milli: u64,
    pub max_memory_limit_mib: u64,

    // reconcile loop
    pub resize_interval: Duration,
    pub dry_run: bool,
    pub safety_threshold: f64,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub qps: f32,
    pub burst: u32,
    pub max_concurrent_reconciles: u32,
    pub batch_size: u32,
    pub delay_between_batches: Duration,
    pub delay_between_pods: Duration,
    pub safety_timeout: Duration,

    // namespace filtering
    pub namespace_include: Vec<String>,
    pub namespace_exclude: Vec<String>,
    pub system_namespace_exclude: Vec<String>,

    // metrics
    pub metrics_provider: MetricsProviderKind,
    pub prometheus_url: String,
    pub metrics_cache_ttl: Duration,

    // thresholds
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub min_change_threshold: f64,
    pub cooldown: Duration,

    // QoS / feature flags
    pub preserve_guaranteed_qos: bool,
    pub enable_in_place_resize: bool,

    // predictive monitor
    pub check_interval: Duration,
    pub alert_threshold: f64,

    // recommendations
    pub max_recommendations: u32,
    pub cleanup_interval: Duration,

    // observability
    pub log_level: String,
    pub metrics_port: u16,

    // leader election
    pub leader_election_lease: Duration,
    pub leader_election_renew: Duration,

    pub config_source: ConfigSource,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cpu_request_multiplier: 1.2,
            memory_request_multiplier: 1.2,
            cpu_limit_multiplier: 2.0,
            memory_limit_multiplier: 2.0,
            cpu_request_addition_milli: 0,
            memory_request_addition_mib: 0,
            cpu_limit_addition_milli: 0,
            memory_limit_addition_mib: 0,

            min_cpu_request_milli: 10,
            min_memory_request_mib: 64,
            max_cpu_limit_milli: 16_000,
            max_memory_limit_mib: 32_768,

            resize_interval: Duration::from_secs(60),
            dry_run: false,
            safety_threshold: 0.5,
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
            qps: 20.0,
            burst: 30,
            max_concurrent_reconciles: 3,
            batch_size: 10,
            delay_between_batches: Duration::from_secs(1),
            delay_between_pods: Duration::from_millis(100),
            safety_timeout: Duration::from_secs(30),

            namespace_include: Vec::new(),
            namespace_exclude: Vec::new(),
            system_namespace_exclude: vec![
                "kube-system".to_string(),
                "kube-public".to_string(),
                "kube-node-lease".to_string(),
            ],

            metrics_provider: MetricsProviderKind::MetricsServer,
            prometheus_url: "http://prometheus.monitoring.svc:9090".to_string(),
            metrics_cache_ttl: Duration::from_secs(30),

            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            min_change_threshold: 0.05,
            cooldown: Duration::from_secs(300),

            preserve_guaranteed_qos: true,
            enable_in_place_resize: true,

            check_interval: Duration::from_secs(30),
            alert_threshold: 0.7,

            max_recommendations: 1000,
            cleanup_interval: Duration::from_secs(300),

            log_level: "info".to_string(),
            metrics_port: 9090,

            leader_election_lease: Duration::from_secs(15),
            leader_election_renew: Duration::from_secs(10),

            config_source: ConfigSource::Default,
        }
    }
}

impl Settings {
    /// Validate internal invariants, collecting every violation.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, v) in [
            ("cpuRequestMultiplier", self.cpu_request_multiplier),
            ("memoryRequestMultiplier", self.memory_request_multiplier),
            ("cpuLimitMultiplier", self.cpu_limit_multiplier),
            ("memoryLimitMultiplier", self.memory_limit_multiplier),
        ] {
            if v <= 0.0 {
                errors.push(format!("{name} must be > 0, got {v}"));
            }
        }

        if self.max_cpu_limit_milli <= self.min_cpu_request_milli {
            errors.push(format!(
                "maxCpuLimit ({}) must exceed minCpuRequest ({})",
                self.max_cpu_limit_milli, self.min_cpu_request_milli
            ));
        }
        if self.max_memory_limit_mib <= self.min_memory_request_mib {
            errors.push(format!(
                "maxMemoryLimit ({}) must exceed minMemoryRequest ({})",
                self.max_memory_limit_mib, self.min_memory_request_mib
            ));
        }

        if !(0.0..=1.0).contains(&self.safety_threshold) {
            errors.push(format!(
                "safetyThreshold must be within 0..1, got {}",
                self.safety_threshold
            ));
        }

        if self.scale_down_threshold >= self.scale_up_threshold {
            errors.push(format!(
                "scaleDownThreshold ({}) must be below scaleUpThreshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            ));
        }
        for (name, v) in [
            ("scaleUpThreshold", self.scale_up_threshold),
            ("scaleDownThreshold", self.scale_down_threshold),
            ("alertThreshold", self.alert_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                errors.push(format!("{name} must be within 0..1, got {v}"));
            }
        }

        if self.metrics_port == 0 {
            errors.push("metricsPort must be within 1..65535".to_string());
        }

        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            errors.push(format!(
                "logLevel must be one of debug|info|warn|error, got '{}'",
                self.log_level
            ));
        }

        errors
    }

    /// Namespace admission: system excludes always win, then the include
    /// list (when non-empty) must contain the namespace, then the exclude
    /// list (when non-empty) must not.
    pub fn is_namespace_included(&self, ns: &str) -> bool {
        if self.system_namespace_exclude.iter().any(|s| s == ns) {
            return false;
        }
        if !self.namespace_include.is_empty()
            && !self.namespace_include.iter().any(|s| s == ns)
        {
            return false;
        }
        if self.namespace_exclude.iter().any(|s| s == ns) {
            return false;
        }
        true
    }

    /// Safety gate on the change ratio `|new - current| / current`.
    ///
    /// A zero current value permits any change (no ratio is defined).
    /// The threshold is inclusive.
    pub fn is_change_within_safety(&self, current: u64, proposed: u64) -> bool {
        if current == 0 {
            return true;
        }
        let ratio = (proposed as f64 - current as f64).abs() / current as f64;
        ratio <= self.safety_threshold
    }

    /// Merge a partial config spec over this one.
    ///
    /// Zero-valued scalars and empty lists are treated as "unchanged";
    /// booleans always overwrite when present; the source tag is always
    /// set to `Crd`. Quantity strings that fail the strict subset abort
    /// the merge without partial application of the failing field.
    pub fn update_from_source(&mut self, spec: &RightSizerConfigSpec) -> Result<(), QuantityError> {
        fn scalar_f64(target: &mut f64, source: Option<f64>) {
            if let Some(v) = source
                && v != 0.0
            {
                *target = v;
            }
        }
        fn scalar_u32(target: &mut u32, source: Option<u32>) {
            if let Some(v) = source
                && v != 0
            {
                *target = v;
            }
        }
        fn secs(target: &mut Duration, source: Option<u64>) {
            if let Some(v) = source
                && v != 0
            {
                *target = Duration::from_secs(v);
            }
        }

        scalar_f64(&mut self.cpu_request_multiplier, spec.cpu_request_multiplier);
        scalar_f64(
            &mut self.memory_request_multiplier,
            spec.memory_request_multiplier,
        );
        scalar_f64(&mut self.cpu_limit_multiplier, spec.cpu_limit_multiplier);
        scalar_f64(&mut self.memory_limit_multiplier, spec.memory_limit_multiplier);

        if let Some(q) = non_empty(&spec.cpu_request_addition) {
            self.cpu_request_addition_milli = parse_cpu(q)?;
        }
        if let Some(q) = non_empty(&spec.memory_request_addition) {
            self.memory_request_addition_mib = parse_memory(q)?;
        }
        if let Some(q) = non_empty(&spec.cpu_limit_addition) {
            self.cpu_limit_addition_milli = parse_cpu(q)?;
        }
        if let Some(q) = non_empty(&spec.memory_limit_addition) {
            self.memory_limit_addition_mib = parse_memory(q)?;
        }

        if let Some(q) = non_empty(&spec.min_cpu_request) {
            self.min_cpu_request_milli = parse_cpu(q)?;
        }
        if let Some(q) = non_empty(&spec.min_memory_request) {
            self.min_memory_request_mib = parse_memory(q)?;
        }
        if let Some(q) = non_empty(&spec.max_cpu_limit) {
            self.max_cpu_limit_milli = parse_cpu(q)?;
        }
        if let Some(q) = non_empty(&spec.max_memory_limit) {
            self.max_memory_limit_mib = parse_memory(q)?;
        }

        secs(&mut self.resize_interval, spec.resize_interval_seconds);
        scalar_f64(&mut self.safety_threshold, spec.safety_threshold);
        scalar_u32(&mut self.max_retries, spec.max_retries);
        secs(&mut self.retry_interval, spec.retry_interval_seconds);
        if let Some(v) = spec.qps
            && v != 0.0
        {
            self.qps = v;
        }
        scalar_u32(&mut self.burst, spec.burst);
        scalar_u32(
            &mut self.max_concurrent_reconciles,
            spec.max_concurrent_reconciles,
        );
        scalar_u32(&mut self.batch_size, spec.batch_size);
        secs(
            &mut self.delay_between_batches,
            spec.delay_between_batches_seconds,
        );
        if let Some(v) = spec.delay_between_pods_millis
            && v != 0
        {
            self.delay_between_pods = Duration::from_millis(v);
        }
        secs(&mut self.safety_timeout, spec.safety_timeout_seconds);

        if let Some(list) = &spec.namespace_include
            && !list.is_empty()
        {
            self.namespace_include = list.clone();
        }
        if let Some(list) = &spec.namespace_exclude
            && !list.is_empty()
        {
            self.namespace_exclude = list.clone();
        }

        if let Some(provider) = &spec.metrics_provider {
            self.metrics_provider = provider.clone();
        }
        if let Some(url) = non_empty(&spec.prometheus_url) {
            self.prometheus_url = url.to_string();
        }
        secs(&mut self.metrics_cache_ttl, spec.metrics_cache_ttl_seconds);

        scalar_f64(&mut self.scale_up_threshold, spec.scale_up_threshold);
        scalar_f64(&mut self.scale_down_threshold, spec.scale_down_threshold);
        scalar_f64(&mut self.min_change_threshold, spec.min_change_threshold);
        secs(&mut self.cooldown, spec.cooldown_seconds);

        if let Some(b) = spec.dry_run {
            self.dry_run = b;
        }
        if let Some(b) = spec.preserve_guaranteed_qos {
            self.preserve_guaranteed_qos = b;
        }
        if let Some(b) = spec.enable_in_place_resize {
            self.enable_in_place_resize = b;
        }

        secs(&mut self.check_interval, spec.check_interval_seconds);
        scalar_f64(&mut self.alert_threshold, spec.alert_threshold);

        scalar_u32(&mut self.max_recommendations, spec.max_recommendations);
        secs(&mut self.cleanup_interval, spec.cleanup_interval_seconds);

        if let Some(level) = non_empty(&spec.log_level) {
            self.log_level = level.to_string();
        }
        if let Some(port) = spec.metrics_port
            && port != 0
        {
            self.metrics_port = port;
        }

        secs(
            &mut self.leader_election_lease,
            spec.leader_election_lease_seconds,
        );
        secs(
            &mut self.leader_election_renew,
            spec.leader_election_renew_seconds,
        );

        self.config_source = ConfigSource::Crd;
        Ok(())
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

/* ============================= STORE ============================= */

/// Thread-safe holder for the effective configuration.
///
/// Readers call `snapshot()` and work off the copy; writers take the
/// exclusive lock briefly. The lock is never held across I/O.
#[derive(Debug, Default)]
pub struct ConfigStore {
    inner: RwLock<Settings>,
}

impl ConfigStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().expect("config lock poisoned").clone()
    }

    pub fn update_from_source(&self, spec: &RightSizerConfigSpec) -> Result<(), QuantityError> {
        let mut guard = self.inner.write().expect("config lock poisoned");
        // Merge into a scratch copy first so a parse error leaves the
        // stored settings untouched.
        let mut merged = guard.clone();
        merged.update_from_source(spec)?;
        *guard = merged;
        Ok(())
    }

    pub fn reset_to_defaults(&self) {
        *self.inner.write().expect("config lock poisoned") = Settings::default();
    }

    pub fn validate(&self) -> Vec<String> {
        self.inner.read().expect("config lock poisoned").validate()
    }
}

/// Process-wide store, initialized on first use. Components receive an
/// `Arc<ConfigStore>` by constructor; this accessor exists for the binary
/// entry points.
pub fn global() -> Arc<ConfigStore> {
    static STORE: LazyLock<Arc<ConfigStore>> = LazyLock::new(|| Arc::new(ConfigStore::default()));
    STORE.clone()
}

/* ============================= TESTS ============================= */

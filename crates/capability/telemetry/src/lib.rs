//! 追踪初始化、关联 ID 生成与进程内计数器。
//!
//! 计数器只在进程内累加，导出（Prometheus 等）由外部完成。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 计数器快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub operations_ok: u64,
    pub operations_failed: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub reconnect_attempts: u64,
    pub links_established: u64,
    pub subscription_notifications: u64,
    pub operation_latency_ms_total: u64,
    pub operation_latency_ms_count: u64,
}

/// 网关计数器。
pub struct GatewayMetrics {
    operations_ok: AtomicU64,
    operations_failed: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    reconnect_attempts: AtomicU64,
    links_established: AtomicU64,
    subscription_notifications: AtomicU64,
    operation_latency_ms_total: AtomicU64,
    operation_latency_ms_count: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            operations_ok: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            links_established: AtomicU64::new(0),
            subscription_notifications: AtomicU64::new(0),
            operation_latency_ms_total: AtomicU64::new(0),
            operation_latency_ms_count: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_ok: self.operations_ok.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            links_established: self.links_established.load(Ordering::Relaxed),
            subscription_notifications: self.subscription_notifications.load(Ordering::Relaxed),
            operation_latency_ms_total: self.operation_latency_ms_total.load(Ordering::Relaxed),
            operation_latency_ms_count: self.operation_latency_ms_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();

/// 获取全局计数器实例。
pub fn metrics() -> &'static GatewayMetrics {
    METRICS.get_or_init(GatewayMetrics::new)
}

/// 初始化 tracing（默认 info，可通过 RUST_LOG 覆盖）。
///
/// 工作区内的库 crate 都不调用它，只输出事件；由宿主进程在启动时调用一次。
/// 已有全局 subscriber 时静默跳过，重复调用无副作用。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的操作关联 ID。
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录操作成功次数与耗时。
pub fn record_operation_ok(latency_ms: u64) {
    let metrics = metrics();
    metrics.operations_ok.fetch_add(1, Ordering::Relaxed);
    metrics
        .operation_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .operation_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录操作最终失败次数。
pub fn record_operation_failed() {
    metrics().operations_failed.fetch_add(1, Ordering::Relaxed);
}

/// 记录重试次数。
pub fn record_retry() {
    metrics().retries.fetch_add(1, Ordering::Relaxed);
}

/// 记录单次尝试超时次数。
pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

/// 记录重连尝试次数（握手尝试，不含首次连接）。
pub fn record_reconnect_attempt() {
    metrics().reconnect_attempts.fetch_add(1, Ordering::Relaxed);
}

/// 记录链路建立次数。
pub fn record_link_established() {
    metrics().links_established.fetch_add(1, Ordering::Relaxed);
}

/// 记录订阅推送次数。
pub fn record_subscription_notification() {
    metrics()
        .subscription_notifications
        .fetch_add(1, Ordering::Relaxed);
}

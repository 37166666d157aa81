//! 设备连接
//!
//! 一个已注册设备对应一个连接。后台监督任务负责握手、退避与重连，
//! 调用方只通过 [`DeviceConnection::perform`] 发起线上操作。

use crate::error::OperationError;
use crate::policy::ConnectionPolicy;
use crate::state::{ConnectionState, LinkStatus};
use async_trait::async_trait;
use domain::DeviceId;
use imcp_protocol::Transport;
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// 连接控制面（不关心协议类型）
///
/// 注册表通过它管理生命周期与健康快照。
#[async_trait]
pub trait LinkControl: Send + Sync {
    fn device_id(&self) -> &str;

    fn status(&self) -> LinkStatus;

    fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// 进入 Connecting 并启动后台监督任务
    fn start(&self);

    /// 人工复位 Unreachable 连接，返回是否生效
    fn reset(&self) -> bool;

    fn subscribe_status(&self) -> watch::Receiver<LinkStatus>;

    /// 排空在途操作后释放传输
    async fn close(&self);
}

/// 设备连接
pub struct DeviceConnection<T: ?Sized + Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: ?Sized + Transport> Clone for DeviceConnection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: ?Sized> {
    device_id: DeviceId,
    transport: Arc<T>,
    policy: ConnectionPolicy,
    status: watch::Sender<LinkStatus>,
    permits: Arc<Semaphore>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: ?Sized + Transport> DeviceConnection<T> {
    pub fn new(device_id: impl Into<DeviceId>, transport: Arc<T>, policy: ConnectionPolicy) -> Self {
        let (status, _) = watch::channel(LinkStatus::new());
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.into(),
                transport,
                permits: Arc::new(Semaphore::new(policy.concurrency)),
                policy,
                status,
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.inner.policy
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// 进入 Connecting 并启动后台监督任务（重复调用无效果）
    pub fn start(&self) {
        let mut slot = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }
        if !self.inner.transition(ConnectionState::Connecting) {
            return;
        }
        *slot = Some(tokio::spawn(supervise(Arc::clone(&self.inner))));
    }

    /// 人工复位：Unreachable → Connecting，清零失败计数并立即重试
    pub fn reset(&self) -> bool {
        let reset = self.inner.status.send_if_modified(|status| {
            if status.state != ConnectionState::Unreachable {
                return false;
            }
            status.state = ConnectionState::Connecting;
            status.consecutive_failures = 0;
            true
        });
        if reset {
            info!(
                target: "imcp.connection",
                device_id = %self.inner.device_id,
                "connection_manual_reset"
            );
        }
        reset
    }

    /// 执行一次线上操作。
    ///
    /// 非 Connected 状态立即失败；按到达顺序排队等待并发许可。线上调用在
    /// 独立任务中执行并持有许可，调用方放弃等待不会打断已发出的事务。
    pub async fn perform(&self, request: T::Request) -> Result<T::Response, OperationError> {
        self.inner.ensure_connected()?;
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| OperationError::NotConnected(ConnectionState::Closed))?;
        // 排队期间链路可能已断开
        self.inner.ensure_connected()?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _permit = permit;
            inner.execute(request).await
        });
        task.await
            .map_err(|err| OperationError::Transport(format!("operation task failed: {}", err)))?
    }

    /// 关闭连接：进入 Closed、停止监督任务、等待在途操作结束、释放传输
    pub async fn close(&self) {
        let first = self.inner.transition(ConnectionState::Closed);

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        let limit = u32::try_from(self.inner.policy.concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = self.inner.permits.acquire_many(limit).await {
            drop(all);
        }
        self.inner.permits.close();

        if first {
            self.inner.transport.close().await;
            info!(
                target: "imcp.connection",
                device_id = %self.inner.device_id,
                "connection_closed"
            );
        }
    }
}

impl<T: ?Sized + Transport> Inner<T> {
    /// 校验并执行状态迁移
    fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = next;
        let changed = self.status.send_if_modified(|status| {
            if !status.state.can_transition_to(next) {
                return false;
            }
            previous = status.state;
            status.state = next;
            true
        });
        if changed {
            info!(
                target: "imcp.connection",
                device_id = %self.device_id,
                from = %previous,
                to = %next,
                "connection_state_changed"
            );
        }
        changed
    }

    fn ensure_connected(&self) -> Result<(), OperationError> {
        match self.status.borrow().state {
            ConnectionState::Connected => Ok(()),
            other => Err(OperationError::NotConnected(other)),
        }
    }

    async fn execute(&self, request: T::Request) -> Result<T::Response, OperationError> {
        let io_timeout = self.policy.io_timeout;
        match timeout(io_timeout, self.transport.call(request)).await {
            Ok(Ok(response)) => {
                self.record_success();
                Ok(response)
            }
            Ok(Err(err)) if err.is_link_failure() => {
                self.mark_link_lost(&err.to_string());
                Err(OperationError::Transport(err.to_string()))
            }
            Ok(Err(err)) => {
                debug!(
                    target: "imcp.connection",
                    device_id = %self.device_id,
                    error = %err,
                    "device_fault"
                );
                Err(OperationError::ProtocolFault(err.to_string()))
            }
            Err(_) => {
                self.mark_link_lost("io timeout");
                Err(OperationError::Timeout(io_timeout))
            }
        }
    }

    fn record_success(&self) {
        self.status.send_if_modified(|status| {
            if status.state != ConnectionState::Connected {
                return false;
            }
            status.consecutive_failures = 0;
            status.last_success = Some(Instant::now());
            true
        });
    }

    /// Connected 期间的链路失败：计入失败次数并交给监督任务重连
    fn mark_link_lost(&self, reason: &str) {
        let threshold = self.policy.failure_threshold;
        let mut next = ConnectionState::Reconnecting;
        let changed = self.status.send_if_modified(|status| {
            if status.state != ConnectionState::Connected {
                return false;
            }
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            if status.consecutive_failures >= threshold {
                next = ConnectionState::Unreachable;
            }
            status.state = next;
            true
        });
        if changed {
            warn!(
                target: "imcp.connection",
                device_id = %self.device_id,
                reason = %reason,
                to = %next,
                "connection_link_lost"
            );
        }
    }

    /// 握手失败：累加失败次数，达到阈值进入 Unreachable
    fn record_connect_failure(&self, reason: &str) -> LinkStatus {
        let threshold = self.policy.failure_threshold;
        let mut previous = ConnectionState::Connecting;
        self.status.send_if_modified(|status| {
            if status.state == ConnectionState::Closed {
                return false;
            }
            previous = status.state;
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            let next = if status.consecutive_failures >= threshold {
                ConnectionState::Unreachable
            } else {
                ConnectionState::Reconnecting
            };
            if status.state.can_transition_to(next) {
                status.state = next;
            }
            true
        });
        let status = *self.status.borrow();
        warn!(
            target: "imcp.connection",
            device_id = %self.device_id,
            reason = %reason,
            failures = status.consecutive_failures,
            from = %previous,
            to = %status.state,
            "connection_attempt_failed"
        );
        status
    }

    fn record_connected(&self) -> bool {
        let connected = self.status.send_if_modified(|status| {
            if !status.state.can_transition_to(ConnectionState::Connected) {
                return false;
            }
            status.state = ConnectionState::Connected;
            status.consecutive_failures = 0;
            status.last_success = Some(Instant::now());
            true
        });
        if connected {
            imcp_telemetry::record_link_established();
            info!(
                target: "imcp.connection",
                device_id = %self.device_id,
                "connection_established"
            );
        }
        connected
    }
}

/// 等待连接关闭
async fn closed(status: &mut watch::Receiver<LinkStatus>) {
    let _ = status
        .wait_for(|status| status.state == ConnectionState::Closed)
        .await;
}

/// 等待关闭或人工复位，发送端已释放时返回 `None`
async fn woken(status: &mut watch::Receiver<LinkStatus>) -> Option<ConnectionState> {
    status
        .wait_for(|status| {
            matches!(status.state, ConnectionState::Closed | ConnectionState::Connecting)
        })
        .await
        .ok()
        .map(|status| status.state)
}

/// 后台监督任务：握手 → 保持 → 重连，直到 Closed
async fn supervise<T: ?Sized + Transport>(inner: Arc<Inner<T>>) {
    let mut watcher = inner.status.subscribe();
    let mut attempts: u64 = 0;

    loop {
        if attempts > 0 {
            imcp_telemetry::record_reconnect_attempt();
        }
        attempts += 1;

        let handshake = tokio::select! {
            result = timeout(inner.policy.connect_timeout, inner.transport.open()) => result,
            _ = closed(&mut watcher) => return,
        };

        let status = match handshake {
            Ok(Ok(())) => {
                if !inner.record_connected() {
                    // 握手期间被关闭
                    inner.transport.close().await;
                    return;
                }
                let lost = watcher
                    .wait_for(|status| status.state != ConnectionState::Connected)
                    .await
                    .map(|status| *status);
                match lost {
                    Ok(status) if status.state != ConnectionState::Closed => {
                        // 丢弃失效会话，下一轮重新握手
                        inner.transport.close().await;
                        status
                    }
                    _ => return,
                }
            }
            Ok(Err(err)) => inner.record_connect_failure(&err.to_string()),
            Err(_) => inner.record_connect_failure("handshake timed out"),
        };

        if status.state == ConnectionState::Closed {
            return;
        }

        let unreachable = status.state == ConnectionState::Unreachable;
        let delay = inner
            .policy
            .next_delay(status.consecutive_failures, unreachable);
        debug!(
            target: "imcp.connection",
            device_id = %inner.device_id,
            delay_ms = delay.as_millis() as u64,
            state = %status.state,
            "connection_backoff"
        );

        // 退避期间允许关闭或人工复位打断
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            woke = woken(&mut watcher) => {
                if matches!(woke, Some(ConnectionState::Closed) | None) {
                    return;
                }
            }
        }

        // Unreachable 下的后台重试不改变状态
        if inner.status.borrow().state == ConnectionState::Reconnecting {
            inner.transition(ConnectionState::Connecting);
        }
    }
}

#[async_trait]
impl<T: ?Sized + Transport> LinkControl for DeviceConnection<T> {
    fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    fn status(&self) -> LinkStatus {
        DeviceConnection::status(self)
    }

    fn start(&self) {
        DeviceConnection::start(self)
    }

    fn reset(&self) -> bool {
        DeviceConnection::reset(self)
    }

    fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        DeviceConnection::subscribe_status(self)
    }

    async fn close(&self) {
        DeviceConnection::close(self).await
    }
}

//! 请求分发器
//!
//! 每次尝试都重新向注册表查找设备，不持有连接句柄。并发受两级许可约束：
//! 先取单设备许可再取全局许可，慢设备最多占用单设备上限个全局许可。
//! 排队等待许可的时间计入单次尝试超时。

use crate::error::DispatchError;
use crate::options::{ExecuteOptions, OperationOutcome};
use domain::{DeviceId, Operation, OperationKind};
use imcp_adapter::{AdapterError, SubscriptionHandle};
use imcp_config::DispatchConfig;
use imcp_registry::Registry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, sleep, timeout};
use tracing::{Instrument, debug, info_span, warn};

/// 单次尝试的失败
enum Failure {
    /// 不重试
    Fatal(DispatchError),
    Adapter(AdapterError),
}

/// 请求分发器（克隆共享同一组许可）
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    global: Arc<Semaphore>,
    max_in_flight: usize,
    per_device_limit: usize,
    devices: Arc<Mutex<HashMap<DeviceId, Arc<Semaphore>>>>,
    defaults: ExecuteOptions,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, max_in_flight: usize, max_in_flight_per_device: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            registry,
            global: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            per_device_limit: max_in_flight_per_device.max(1),
            devices: Arc::new(Mutex::new(HashMap::new())),
            defaults: ExecuteOptions::default(),
        }
    }

    pub fn from_config(registry: Arc<Registry>, config: &DispatchConfig) -> Self {
        let mut dispatcher = Self::new(
            registry,
            config.max_in_flight,
            config.max_in_flight_per_device,
        );
        dispatcher.defaults = ExecuteOptions::from_config(config);
        dispatcher
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// 配置给出的默认调用参数
    pub fn default_options(&self) -> ExecuteOptions {
        self.defaults
    }

    /// 当前持有全局许可的尝试数
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.global.available_permits()
    }

    /// 执行单个操作。
    ///
    /// 仅 `Timeout` / `NotConnected` 按线性退避重试，其余适配器错误立即返回。
    pub async fn execute(
        &self,
        op: Operation,
        options: ExecuteOptions,
    ) -> Result<OperationOutcome, DispatchError> {
        let correlation_id = if op.correlation_id.is_empty() {
            imcp_telemetry::new_correlation_id()
        } else {
            op.correlation_id.clone()
        };
        let span = info_span!(
            "dispatch",
            correlation_id = %correlation_id,
            device_id = %op.device_id,
            tag = %op.tag,
            kind = op.kind.name()
        );

        let started = Instant::now();
        let mut attempts = 0u32;
        let result = match options.deadline {
            Some(deadline) => {
                let bounded = timeout(deadline, self.run(&op, &options, &mut attempts))
                    .instrument(span.clone())
                    .await;
                match bounded {
                    Ok(result) => result,
                    Err(_) => {
                        imcp_telemetry::record_timeout();
                        Err(DispatchError::Adapter {
                            device_id: op.device_id.clone(),
                            attempts,
                            source: AdapterError::Timeout,
                        })
                    }
                }
            }
            None => {
                self.run(&op, &options, &mut attempts)
                    .instrument(span.clone())
                    .await
            }
        };

        let _entered = span.enter();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                imcp_telemetry::record_operation_ok(elapsed_ms);
                debug!(
                    target: "imcp.dispatch",
                    attempts,
                    elapsed_ms,
                    "operation_completed"
                );
            }
            Err(err) => {
                imcp_telemetry::record_operation_failed();
                warn!(
                    target: "imcp.dispatch",
                    attempts,
                    elapsed_ms,
                    error = %err,
                    "operation_failed"
                );
            }
        }
        result
    }

    /// 执行一批操作，结果与输入按位置对齐。
    ///
    /// 各操作独立执行，单个失败（包括任务异常终止）不影响其他操作。调用方
    /// 放弃等待时，尚未被连接接受的操作随之取消，不会再发出线上请求。
    pub async fn execute_batch(
        &self,
        ops: Vec<Operation>,
        options: ExecuteOptions,
    ) -> Vec<Result<OperationOutcome, DispatchError>> {
        let handles: Vec<JoinHandle<_>> = ops
            .into_iter()
            .map(|op| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.execute(op, options).await })
            })
            .collect();
        let _abandon = AbortOnDrop(handles.iter().map(JoinHandle::abort_handle).collect());

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle
                .await
                .unwrap_or_else(|err| Err(DispatchError::Aborted(err.to_string())));
            results.push(result);
        }
        results
    }

    /// 取消订阅（幂等）；设备已注销时直接停止推送任务
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        match self.registry.lookup(handle.device_id()) {
            Ok(entry) => entry.adapter.unsubscribe(handle),
            Err(_) => handle.cancel(),
        }
    }

    async fn run(
        &self,
        op: &Operation,
        options: &ExecuteOptions,
        attempts: &mut u32,
    ) -> Result<OperationOutcome, DispatchError> {
        loop {
            *attempts += 1;
            let attempt = *attempts;
            let error = match self.attempt(op, options).await {
                Ok(outcome) => return Ok(outcome),
                Err(Failure::Fatal(err)) => return Err(err),
                Err(Failure::Adapter(err)) => err,
            };

            if !error.is_transient() || attempt > options.max_retries {
                return Err(DispatchError::Adapter {
                    device_id: op.device_id.clone(),
                    attempts: attempt,
                    source: error,
                });
            }

            let backoff = options.backoff_after(attempt);
            imcp_telemetry::record_retry();
            debug!(
                target: "imcp.dispatch",
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "operation_retry_scheduled"
            );
            sleep(backoff).await;
        }
    }

    /// 单次尝试：排队取许可、解析设备、适配器调用，整体受 `attempt_timeout` 约束
    async fn attempt(
        &self,
        op: &Operation,
        options: &ExecuteOptions,
    ) -> Result<OperationOutcome, Failure> {
        match timeout(options.attempt_timeout, self.call(op)).await {
            Ok(result) => result,
            Err(_) => {
                imcp_telemetry::record_timeout();
                Err(Failure::Adapter(AdapterError::Timeout))
            }
        }
    }

    async fn call(&self, op: &Operation) -> Result<OperationOutcome, Failure> {
        let _device_permit = acquire(self.device_gate(&op.device_id)).await?;
        let _global_permit = acquire(Arc::clone(&self.global)).await?;

        let adapter = match self.registry.lookup(&op.device_id) {
            Ok(entry) => entry.adapter,
            Err(err) => return Err(Failure::Fatal(DispatchError::DeviceNotFound(err.device_id))),
        };
        let outcome = match &op.kind {
            OperationKind::Read => adapter.read(&op.tag).await.map(OperationOutcome::Value),
            OperationKind::Write(value) => adapter
                .write(&op.tag, value.clone())
                .await
                .map(|()| OperationOutcome::Written),
            OperationKind::Subscribe(on_change) => adapter
                .subscribe(&op.tag, Arc::clone(on_change))
                .await
                .map(OperationOutcome::Subscribed),
        };
        outcome.map_err(Failure::Adapter)
    }

    fn device_gate(&self, device_id: &str) -> Arc<Semaphore> {
        let mut devices = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(gate) = devices.get(device_id) {
            return Arc::clone(gate);
        }
        // 顺带清理无人使用的许可（设备已注销或空闲）
        devices.retain(|_, gate| Arc::strong_count(gate) > 1);
        let gate = Arc::new(Semaphore::new(self.per_device_limit));
        devices.insert(device_id.to_string(), Arc::clone(&gate));
        gate
    }
}

/// 批量调用被放弃时中止仍在运行的操作任务
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

async fn acquire(semaphore: Arc<Semaphore>) -> Result<OwnedSemaphorePermit, Failure> {
    semaphore
        .acquire_owned()
        .await
        .map_err(|_| Failure::Fatal(DispatchError::Aborted("dispatcher closed".to_string())))
}

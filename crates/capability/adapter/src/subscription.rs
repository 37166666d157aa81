//! 订阅句柄
//!
//! 每个订阅对应一个后台任务，句柄只持有任务的中止句柄。取消是幂等的：
//! 重复取消、取消已结束的任务都不会出错。

use domain::{ChangeCallback, DeviceId, TagChange, TagValue};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// 订阅句柄
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    device_id: DeviceId,
    tag: String,
    abort: AbortHandle,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// 停止推送（幂等）
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.abort.is_finished()
    }
}

/// 适配器持有的订阅任务集合
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    tasks: Mutex<HashMap<String, AbortHandle>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记后台任务并返回句柄
    pub fn track(&self, device_id: &str, tag: &str, task: JoinHandle<()>) -> SubscriptionHandle {
        let handle = SubscriptionHandle {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            tag: tag.to_string(),
            abort: task.abort_handle(),
        };
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|_, abort| !abort.is_finished());
        tasks.insert(handle.id.clone(), handle.abort.clone());
        handle
    }

    pub fn remove(&self, handle: &SubscriptionHandle) {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&handle.id);
        handle.cancel();
        if removed.is_some() {
            debug!(
                target: "imcp.adapter",
                device_id = %handle.device_id,
                tag = %handle.tag,
                subscription_id = %handle.id,
                "subscription_cancelled"
            );
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<AbortHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, abort)| abort)
            .collect();
        for abort in &drained {
            abort.abort();
        }
        drained.len()
    }

    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|abort| !abort.is_finished())
            .count()
    }
}

/// 变化检测：只放行与上一次不同的值
///
/// 比较使用 `PartialEq`，NaN 与自身不相等，因此 NaN 每次都会放行。
#[derive(Debug, Default)]
pub(crate) struct ChangeFilter {
    last: Option<TagValue>,
}

impl ChangeFilter {
    pub(crate) fn changed(&mut self, value: &TagValue) -> bool {
        if self.last.as_ref() == Some(value) {
            return false;
        }
        self.last = Some(value.clone());
        true
    }
}

/// 调用变化回调
pub(crate) fn notify(on_change: &ChangeCallback, device_id: &str, tag: &str, value: TagValue) {
    imcp_telemetry::record_subscription_notification();
    on_change(TagChange {
        device_id: device_id.to_string(),
        tag: tag.to_string(),
        value,
        observed_at_ms: domain::now_epoch_ms(),
    });
}

//! 链路探针：内存传输共用的开合控制、注入故障与调用记录

use crate::error::TransportError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// 注入到下一次调用的故障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// 链路断开：调用失败且会话失效
    Link,
    /// 设备异常应答：链路保持可用
    Fault,
}

/// 一次线上调用的起止时刻
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct ProbeState {
    open: bool,
    fail_opens: u32,
    fail_all_opens: bool,
    open_attempts: u32,
    open_attempted_at: Vec<Instant>,
    latency: Duration,
    scripted: VecDeque<ScriptedFailure>,
    calls: Vec<CallRecord>,
    in_flight: usize,
    max_in_flight: usize,
    closes: u32,
    closed_at: Option<Instant>,
}

/// 内存链路探针
#[derive(Debug, Default)]
pub struct LinkProbe {
    state: Mutex<ProbeState>,
}

impl LinkProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut ProbeState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// 接下来 `count` 次握手失败
    pub fn fail_next_opens(&self, count: u32) {
        self.with(|state| state.fail_opens = count);
    }

    /// 所有握手失败，直到 [`LinkProbe::heal`]
    pub fn fail_all_opens(&self) {
        self.with(|state| state.fail_all_opens = true);
    }

    pub fn heal(&self) {
        self.with(|state| {
            state.fail_all_opens = false;
            state.fail_opens = 0;
        });
    }

    /// 每次调用的线上耗时
    pub fn set_latency(&self, latency: Duration) {
        self.with(|state| state.latency = latency);
    }

    pub fn fail_next_call(&self, failure: ScriptedFailure) {
        self.with(|state| state.scripted.push_back(failure));
    }

    /// 模拟对端断开
    pub fn drop_link(&self) {
        self.with(|state| state.open = false);
    }

    pub fn is_open(&self) -> bool {
        self.with(|state| state.open)
    }

    pub fn open_attempts(&self) -> u32 {
        self.with(|state| state.open_attempts)
    }

    /// 每次握手尝试的时刻
    pub fn open_attempted_at(&self) -> Vec<Instant> {
        self.with(|state| state.open_attempted_at.clone())
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.with(|state| state.calls.clone())
    }

    pub fn call_count(&self) -> usize {
        self.with(|state| state.calls.len())
    }

    pub fn in_flight(&self) -> usize {
        self.with(|state| state.in_flight)
    }

    pub fn max_in_flight(&self) -> usize {
        self.with(|state| state.max_in_flight)
    }

    pub fn close_count(&self) -> u32 {
        self.with(|state| state.closes)
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.with(|state| state.closed_at)
    }

    pub(crate) async fn open(&self) -> Result<(), TransportError> {
        self.with(|state| {
            state.open_attempts += 1;
            state.open_attempted_at.push(Instant::now());
            if state.fail_all_opens {
                return Err(TransportError::Connection("connection refused".to_string()));
            }
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(TransportError::Connection("connection refused".to_string()));
            }
            state.open = true;
            Ok(())
        })
    }

    pub(crate) fn close(&self) {
        self.with(|state| {
            state.open = false;
            state.closes += 1;
            state.closed_at = Some(Instant::now());
        });
    }

    /// 包裹一次线上调用：检查会话、计入在途数、模拟耗时、应用注入故障
    pub(crate) async fn call<R>(
        &self,
        apply: impl FnOnce() -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let (latency, scripted) = self.with(|state| {
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            Ok((state.latency, state.scripted.pop_front()))
        })?;

        let guard = InFlight {
            probe: self,
            started: Instant::now(),
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        drop(guard);

        match scripted {
            Some(ScriptedFailure::Link) => {
                self.drop_link();
                Err(TransportError::Connection("connection reset by peer".to_string()))
            }
            Some(ScriptedFailure::Fault) => {
                Err(TransportError::Fault("device rejected request".to_string()))
            }
            None => apply(),
        }
    }
}

/// 在途计数守卫，调用被取消时同样会记录结束
struct InFlight<'a> {
    probe: &'a LinkProbe,
    started: Instant,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let started = self.started;
        self.probe.with(|state| {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.calls.push(CallRecord {
                started,
                finished: Instant::now(),
            });
        });
    }
}

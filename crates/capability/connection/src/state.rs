//! 连接状态与合法迁移

use std::fmt;
use tokio::time::Instant;

/// 连接状态
///
/// ```text
/// Disconnected ─► Connecting ─► Connected ─► Reconnecting ─► Connecting
///                     │             │              │
///                     └─────────────┴──────────────┴─► Unreachable ─► Connected / Connecting
/// 任意状态 ─► Closed（终态）
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Unreachable,
    Closed,
}

impl ConnectionState {
    /// 所有状态迁移都经过这里校验
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Reconnecting | Unreachable) => true,
            (Connected, Reconnecting | Unreachable) => true,
            (Reconnecting, Connecting | Unreachable) => true,
            // 后台重试成功，或人工复位
            (Unreachable, Connected | Connecting) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Unreachable => "unreachable",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接运行期快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
}

impl LinkStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            last_success: None,
        }
    }
}

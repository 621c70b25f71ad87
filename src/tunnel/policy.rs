/// 隧道重连策略
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 一次 `connect` 结束后是否以及何时再次尝试
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// 只尝试一次（默认）
    #[default]
    Once,
    /// 指数退避重连，`max_attempts` 为 0 表示不限次数
    Backoff {
        initial: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

/// 配置文件中的重连模式名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectMode {
    #[default]
    Once,
    Backoff,
}

impl std::fmt::Display for ReconnectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectMode::Once => write!(f, "once"),
            ReconnectMode::Backoff => write!(f, "backoff"),
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次（从 1 开始）失败后的等待时间；`None` 表示不再重试
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Once => None,
            ReconnectPolicy::Backoff {
                initial,
                max,
                max_attempts,
            } => {
                if *max_attempts != 0 && attempt >= *max_attempts {
                    return None;
                }
                let shift = attempt.saturating_sub(1).min(31);
                let delay = initial.saturating_mul(1u32 << shift);
                Some(delay.min(*max))
            }
        }
    }
}

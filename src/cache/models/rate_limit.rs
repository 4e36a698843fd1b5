use serde::Serialize;

/// 超出限额时返回给客户端的信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRejection {
    pub limit: u32,
    pub current: u64,
    pub remaining: u32,
    /// 秒
    pub retry_after: u64,
}

/// 放行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitAdmission {
    pub limit: u32,
    pub remaining: u32,
    /// 窗口重置时间（Unix 毫秒）
    pub reset_at_ms: i64,
    /// 存储不可用时按放行处理
    pub degraded: bool,
}

/// 限流判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Admitted(RateLimitAdmission),
    Rejected(RateLimitRejection),
}

impl RateLimitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, RateLimitDecision::Admitted(_))
    }

    pub fn remaining(&self) -> u32 {
        match self {
            RateLimitDecision::Admitted(admission) => admission.remaining,
            RateLimitDecision::Rejected(rejection) => rejection.remaining,
        }
    }
}

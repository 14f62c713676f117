//! 运行进度通知与取消

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 校验运行过程中的进度事件（仅通知，不影响控制流）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        building_id: String,
        rule_sets: usize,
    },
    RuleSetStarted {
        rule_set_id: String,
        rules: usize,
    },
    RuleSetFinished {
        rule_set_id: String,
        passed_rules: usize,
        total_rules: usize,
        violations: usize,
    },
    RuleSetSkipped {
        source: String,
        reason: String,
    },
    RunFinished {
        compliance_score: f64,
        cancelled: bool,
    },
}

/// 进度监听器
pub trait ProgressListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// 协作式取消令牌，在规则集之间检查
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

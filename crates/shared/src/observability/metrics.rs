//! 规则引擎指标模块
//!
//! 基于 metrics crate 的门面宏记录指标。核心库不安装导出器，
//! 未安装 recorder 时所有记录均为空操作。

/// 注册规则引擎指标描述
///
/// 这些描述会出现在导出端点的 HELP 注释中。
pub fn describe_engine_metrics() {
    metrics::describe_counter!(
        "compliance_rule_evaluations_total",
        "Total number of compliance rule evaluations"
    );
    metrics::describe_histogram!(
        "compliance_rule_evaluation_duration_seconds",
        "Compliance rule evaluation duration in seconds"
    );
    metrics::describe_counter!(
        "compliance_result_cache_hits_total",
        "Rule results served from the evaluation cache"
    );
    metrics::describe_counter!(
        "compliance_result_cache_misses_total",
        "Rule results computed because the evaluation cache missed"
    );
    metrics::describe_counter!(
        "compliance_result_cache_evictions_total",
        "Entries evicted from the evaluation cache"
    );
    metrics::describe_counter!(
        "compliance_rule_set_load_failures_total",
        "Rule sets skipped because they failed to load"
    );
    metrics::describe_histogram!(
        "compliance_validation_duration_seconds",
        "Whole building validation run duration in seconds"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录单条规则评估
#[inline]
pub fn record_rule_evaluation(category: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "compliance_rule_evaluations_total",
        "category" => category.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "compliance_rule_evaluation_duration_seconds",
        "category" => category.to_string()
    )
    .record(duration_secs);
}

/// 记录结果缓存命中/未命中
#[inline]
pub fn record_cache_lookup(hit: bool) {
    if hit {
        metrics::counter!("compliance_result_cache_hits_total").increment(1);
    } else {
        metrics::counter!("compliance_result_cache_misses_total").increment(1);
    }
}

/// 记录缓存淘汰
#[inline]
pub fn record_cache_evictions(policy: &str, count: u64) {
    if count > 0 {
        metrics::counter!(
            "compliance_result_cache_evictions_total",
            "policy" => policy.to_string()
        )
        .increment(count);
    }
}

/// 记录规则集加载失败
#[inline]
pub fn record_rule_set_load_failure(reason: &str) {
    metrics::counter!(
        "compliance_rule_set_load_failures_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// 记录整次校验耗时
#[inline]
pub fn record_validation_run(rule_sets: usize, duration_secs: f64) {
    metrics::histogram!(
        "compliance_validation_duration_seconds",
        "rule_sets" => rule_sets.to_string()
    )
    .record(duration_secs);
}

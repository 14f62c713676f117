//! 可观测性模块集成测试
//!
//! 测试 metrics 记录函数与 tracing 初始化的核心行为。

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use arx_shared::observability::metrics::{
        describe_engine_metrics, record_cache_evictions, record_cache_lookup,
        record_rule_evaluation, record_rule_set_load_failure, record_validation_run,
    };

    #[test]
    fn test_record_rule_evaluation() {
        // 未安装 recorder 时应为空操作，不 panic
        record_rule_evaluation("fire_safety", "passed", 0.002);
        record_rule_evaluation("electrical", "failed", 0.010);
        record_rule_evaluation("structural", "error", 0.0);
    }

    #[test]
    fn test_record_cache_metrics() {
        record_cache_lookup(true);
        record_cache_lookup(false);
        record_cache_evictions("lru", 3);
        record_cache_evictions("adaptive", 0);
    }

    #[test]
    fn test_record_run_metrics() {
        describe_engine_metrics();
        record_rule_set_load_failure("not_found");
        record_validation_run(2, 0.35);
    }
}

// ============================================================================
// Tracing 初始化测试
// ============================================================================

mod tracing_tests {
    use arx_shared::config::ObservabilityConfig;
    use arx_shared::observability;

    #[test]
    fn test_init_twice_returns_error_instead_of_panic() {
        let config = ObservabilityConfig {
            log_level: "debug".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: true,
        };

        let first = observability::init("compliance-engine", &config);
        assert!(first.is_ok());

        // 全局 subscriber 只能安装一次
        let second = observability::init("compliance-engine", &config);
        assert!(second.is_err());
    }

    #[test]
    fn test_empty_guard() {
        let guard = observability::ObservabilityGuard::empty();
        drop(guard);
    }
}

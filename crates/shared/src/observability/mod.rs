//! 统一可观测性模块
//!
//! 提供 tracing、logging 的统一初始化以及规则引擎指标的描述与记录。
//! 所有二进制通过单一入口点配置可观测性，确保一致的指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// 持有可观测性资源的生命周期，drop 时记录关闭日志。
pub struct ObservabilityGuard {
    service_name: String,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用可观测性时）
    pub fn empty() -> Self {
        Self {
            service_name: String::new(),
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if !self.service_name.is_empty() {
            info!(service = %self.service_name, "Shutting down observability...");
        }
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（指标描述，导出器由宿主进程自行安装）
///
/// # Example
///
/// ```ignore
/// use arx_shared::config::AppConfig;
/// use arx_shared::observability;
///
/// fn main() -> anyhow::Result<()> {
///     let config = AppConfig::load("compliance-engine")?;
///     let _guard = observability::init(&config.service_name, &config.observability)?;
///     Ok(())
/// }
/// ```
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    if config.metrics_enabled {
        metrics::describe_engine_metrics();
    }

    info!(
        service = %service_name,
        log_level = %config.log_level,
        log_format = %config.log_format,
        "Observability initialized"
    );

    Ok(ObservabilityGuard {
        service_name: service_name.to_string(),
    })
}

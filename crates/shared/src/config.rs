//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ObservabilityConfig {
    /// 是否输出 JSON 格式日志
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（ARX_ 前缀，双下划线分隔层级，如 ARX_OBSERVABILITY__LOG_LEVEL）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        builder(service_name)?.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// 加载配置中的某一节，缺失时返回默认值
///
/// 与 [`AppConfig::load`] 使用相同的配置源，供各服务读取自己的专属配置段，
/// 如规则引擎的 `[engine]`。
pub fn load_section<T>(service_name: &str, section: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    let config = builder(service_name)?.build()?;
    match config.get::<T>(section) {
        Ok(value) => Ok(value),
        Err(ConfigError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(e),
    }
}

fn builder(service_name: &str) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let env = std::env::var("ARX_ENV").unwrap_or_else(|_| "development".to_string());
    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

    Ok(Config::builder()
        .set_default("service_name", service_name)?
        .set_default("environment", env.clone())?
        .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
        .add_source(
            File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
        )
        .add_source(
            File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                .required(false),
        )
        .add_source(
            Environment::with_prefix("ARX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        ))
}

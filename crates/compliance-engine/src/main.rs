//! 合规校验命令行工具
//!
//! 读取建筑模型与规则集文件，输出 JSON 格式的合规报告。

use anyhow::{Context, Result};
use arx_shared::config::{AppConfig, load_section};
use arx_shared::observability;
use clap::Parser;
use compliance_engine::{BuildingModel, ComplianceEngine, EngineConfig};
use std::path::PathBuf;
use tracing::{info, warn};

const SERVICE_NAME: &str = "compliance-engine";

#[derive(Parser)]
#[command(name = "compliance-check", version, about = "Validate a building model against rule sets")]
struct Cli {
    /// 建筑模型 JSON 文件
    model: PathBuf,

    /// 规则集 JSON 文件（可多个）
    #[arg(required = true)]
    rules: Vec<PathBuf>,

    /// 运行前预检规则文件并输出缺陷
    #[arg(long)]
    lint: bool,

    /// 输出紧凑 JSON
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..AppConfig::default()
        }
    });
    let _guard = observability::init(&config.service_name, &config.observability)?;

    let engine_config: EngineConfig =
        load_section(SERVICE_NAME, "engine").context("加载 [engine] 配置失败")?;
    info!(
        environment = %config.environment,
        level = ?engine_config.optimizer.level,
        "Starting compliance check..."
    );

    let engine = ComplianceEngine::new(engine_config)?;

    if cli.lint {
        for path in &cli.rules {
            for defect in engine.validate_rule_file(path) {
                warn!(path = %path.display(), "{}", defect);
            }
        }
    }

    let content = std::fs::read_to_string(&cli.model)
        .with_context(|| format!("读取建筑模型失败: {}", cli.model.display()))?;
    let model: BuildingModel = serde_json::from_str(&content)
        .with_context(|| format!("解析建筑模型失败: {}", cli.model.display()))?;

    let report = engine.validate_building_model(&model, cli.rules.as_slice())?;

    let output = if cli.compact {
        serde_json::to_string(&report)?
    } else {
        serde_json::to_string_pretty(&report)?
    };
    println!("{}", output);

    info!(
        score = report.overall_compliance_score,
        skipped = report.skipped_rule_sets.len(),
        "Compliance check complete"
    );
    Ok(())
}

//! 合规校验引擎
//!
//! 单次运行的流程：加载规则集（失败的规则集记录后跳过）→ 逐个规则集执行
//! 启用的规则（经由性能优化层）→ 汇总为 [`ComplianceReport`]。
//! 只有建筑模型本身无效时整个运行才会失败。

use arx_shared::observability::metrics::{record_rule_set_load_failure, record_validation_run};
use crate::building::BuildingModel;
use crate::config::{EngineConfig, OptimizationLevel};
use crate::error::Result;
use crate::evaluator::EvaluationContext;
use crate::executor::RuleExecutor;
use crate::models::{Rule, RuleSet};
use crate::optimizer::{MemoryReport, OptimizerStats, PerformanceOptimizer};
use crate::progress::{CancellationToken, ProgressEvent, ProgressListener};
use crate::report::{ComplianceReport, RuleSetReport, SkippedRuleSet};
use crate::spatial::SpatialAnalyzer;
use crate::store::{RuleStore, RuleStoreStats};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, instrument, warn};

/// 引擎运行统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub total_runs: u64,
    pub total_run_time_ms: f64,
    pub average_run_time_ms: f64,
    pub cached_rule_sets: usize,
    pub rule_store: RuleStoreStats,
    pub optimizer: OptimizerStats,
}

#[derive(Default)]
struct RunTotals {
    runs: u64,
    elapsed_ms: f64,
}

/// 单次运行的可选参数
#[derive(Default)]
pub struct RunOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub listener: Option<&'a dyn ProgressListener>,
}

impl RunOptions<'_> {
    fn notify(&self, event: ProgressEvent) {
        if let Some(listener) = self.listener {
            listener.on_event(&event);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }
}

/// 合规校验引擎
pub struct ComplianceEngine {
    analyzer: SpatialAnalyzer,
    store: RuleStore,
    optimizer: PerformanceOptimizer,
    totals: Mutex<RunTotals>,
}

impl ComplianceEngine {
    /// 创建引擎；配置在构造时一次性传入
    pub fn new(config: EngineConfig) -> Result<Self> {
        let optimizer = PerformanceOptimizer::new(&config.optimizer)?;
        info!(
            level = ?config.optimizer.level,
            near_distance = config.spatial.near_distance,
            "合规引擎已创建"
        );

        Ok(Self {
            analyzer: SpatialAnalyzer::new(config.spatial),
            store: RuleStore::new(),
            optimizer,
            totals: Mutex::new(RunTotals::default()),
        })
    }

    /// 规则集存储（可用于预加载内联规则集）
    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn analyzer(&self) -> &SpatialAnalyzer {
        &self.analyzer
    }

    /// 预检规则文件
    pub fn validate_rule_file(&self, path: impl AsRef<Path>) -> Vec<String> {
        self.store.validate(path)
    }

    /// 按文件路径加载规则集并校验建筑模型
    pub fn validate_building_model<P: AsRef<Path>>(
        &self,
        model: &BuildingModel,
        paths: &[P],
    ) -> Result<ComplianceReport> {
        self.validate_building_model_with(model, paths, &RunOptions::default())
    }

    /// 带取消令牌与进度监听的校验
    pub fn validate_building_model_with<P: AsRef<Path>>(
        &self,
        model: &BuildingModel,
        paths: &[P],
        options: &RunOptions<'_>,
    ) -> Result<ComplianceReport> {
        model.validate()?;

        let mut rule_sets = Vec::with_capacity(paths.len());
        let mut skipped = Vec::new();
        for path in paths {
            let path = path.as_ref();
            match self.store.load(path) {
                Ok(rule_set) => rule_sets.push(rule_set),
                Err(e) => {
                    let source = path.display().to_string();
                    warn!(source = %source, error_code = e.code(), "跳过规则集: {}", e);
                    record_rule_set_load_failure(e.code());
                    options.notify(ProgressEvent::RuleSetSkipped {
                        source: source.clone(),
                        reason: e.to_string(),
                    });
                    skipped.push(SkippedRuleSet {
                        source,
                        code: e.code().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.run(model, &rule_sets, skipped, options)
    }

    /// 使用已加载的规则集校验建筑模型
    pub fn validate_rule_sets(
        &self,
        model: &BuildingModel,
        rule_sets: &[Arc<RuleSet>],
    ) -> Result<ComplianceReport> {
        self.validate_rule_sets_with(model, rule_sets, &RunOptions::default())
    }

    pub fn validate_rule_sets_with(
        &self,
        model: &BuildingModel,
        rule_sets: &[Arc<RuleSet>],
        options: &RunOptions<'_>,
    ) -> Result<ComplianceReport> {
        model.validate()?;
        self.run(model, rule_sets, Vec::new(), options)
    }

    #[instrument(skip_all, fields(building_id = %model.id, rule_sets = rule_sets.len()))]
    fn run(
        &self,
        model: &BuildingModel,
        rule_sets: &[Arc<RuleSet>],
        skipped: Vec<SkippedRuleSet>,
        options: &RunOptions<'_>,
    ) -> Result<ComplianceReport> {
        let start = Instant::now();
        options.notify(ProgressEvent::RunStarted {
            building_id: model.id.clone(),
            rule_sets: rule_sets.len(),
        });

        let model_fingerprint = if self.optimizer.level().caching() {
            model.fingerprint()?
        } else {
            String::new()
        };
        let index = self.analyzer.build_index(&model.objects);
        let ctx = EvaluationContext {
            model,
            index: &index,
            analyzer: &self.analyzer,
        };

        let mut reports = Vec::with_capacity(rule_sets.len());
        let mut cancelled = false;
        for rule_set in rule_sets {
            if options.cancelled() {
                warn!(completed = reports.len(), "校验已取消");
                cancelled = true;
                break;
            }
            reports.push(self.run_rule_set(rule_set, &ctx, &model_fingerprint, options));
        }

        let report = ComplianceReport::aggregate(model, reports, skipped, cancelled);

        let elapsed = start.elapsed();
        {
            let mut totals = self.totals.lock();
            totals.runs += 1;
            totals.elapsed_ms += elapsed.as_secs_f64() * 1000.0;
        }
        record_validation_run(rule_sets.len(), elapsed.as_secs_f64());
        options.notify(ProgressEvent::RunFinished {
            compliance_score: report.overall_compliance_score,
            cancelled,
        });

        info!(
            score = report.overall_compliance_score,
            total_rules = report.total_rules,
            violations = report.total_violations,
            warnings = report.total_warnings,
            elapsed_ms = elapsed.as_millis() as u64,
            "校验完成"
        );
        Ok(report)
    }

    fn run_rule_set(
        &self,
        rule_set: &RuleSet,
        ctx: &EvaluationContext<'_>,
        model_fingerprint: &str,
        options: &RunOptions<'_>,
    ) -> RuleSetReport {
        let span = info_span!("rule_set", rule_set = %rule_set.id, source = %rule_set.source);
        let _enter = span.enter();

        let rules: Vec<&Rule> = rule_set.enabled_rules().collect();
        options.notify(ProgressEvent::RuleSetStarted {
            rule_set_id: rule_set.id.clone(),
            rules: rules.len(),
        });

        let results = self
            .optimizer
            .run(&rule_set.id, &rules, model_fingerprint, |rule| {
                RuleExecutor::execute(rule, ctx)
            });
        let report = RuleSetReport::from_results(rule_set, results);

        info!(
            passed = report.passed_rules,
            total = report.total_rules,
            violations = report.total_violations,
            "规则集校验完成"
        );
        options.notify(ProgressEvent::RuleSetFinished {
            rule_set_id: rule_set.id.clone(),
            passed_rules: report.passed_rules,
            total_rules: report.total_rules,
            violations: report.total_violations,
        });
        report
    }

    /// 清空规则集缓存与结果缓存
    pub fn clear_cache(&self) {
        let rule_sets = self.store.clear();
        let results = self.optimizer.clear_cache();
        info!(rule_sets, results, "缓存已清空");
    }

    pub fn optimize_memory(&self) -> MemoryReport {
        self.optimizer.optimize_memory()
    }

    pub fn set_optimization_level(&self, level: OptimizationLevel) {
        self.optimizer.set_optimization_level(level);
    }

    pub fn stats(&self) -> EngineStats {
        let (total_runs, total_run_time_ms) = {
            let totals = self.totals.lock();
            (totals.runs, totals.elapsed_ms)
        };

        EngineStats {
            total_runs,
            total_run_time_ms,
            average_run_time_ms: if total_runs > 0 {
                total_run_time_ms / total_runs as f64
            } else {
                0.0
            },
            cached_rule_sets: self.store.len(),
            rule_store: self.store.stats(),
            optimizer: self.optimizer.stats(),
        }
    }
}

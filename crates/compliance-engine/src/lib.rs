//! 建筑合规校验引擎
//!
//! 根据外部规则集对建筑模型进行校验：
//! - JSON 规则集解析、编译与缓存
//! - 类型化条件求值（属性、空间、关系、系统、组合及扩展条件）
//! - 受限公式计算
//! - 结果缓存与并行执行
//! - 合规报告汇总

pub mod building;
pub mod compiler;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod formula;
pub mod models;
pub mod operators;
pub mod optimizer;
pub mod progress;
pub mod report;
pub mod spatial;
pub mod store;

pub use building::{BuildingModel, BuildingObject, Location};
pub use compiler::RuleSetCompiler;
pub use config::{CachePolicy, EngineConfig, OptimizationLevel, OptimizerConfig, SpatialSettings};
pub use engine::{ComplianceEngine, EngineStats, RunOptions};
pub use error::{EngineError, FormulaError, Result};
pub use evaluator::{ConditionEvaluator, EvaluationContext};
pub use executor::{ActionExecutor, RuleExecutor};
pub use models::{Action, Condition, Jurisdiction, Rule, RuleSet, Severity};
pub use operators::Operator;
pub use optimizer::{MemoryReport, OptimizerStats, PerformanceOptimizer};
pub use progress::{CancellationToken, ProgressEvent, ProgressListener};
pub use report::{
    Calculation, ComplianceReport, RuleSetReport, SkippedRuleSet, ValidationResult,
    ValidationViolation,
};
pub use spatial::{Relation, SpatialAnalyzer, SpatialIndex};
pub use store::{RuleStore, RuleStoreStats};

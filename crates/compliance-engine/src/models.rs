//! 规则集领域模型
//!
//! 规则文档经编译后得到的不可变结构。条件是一个封闭的枚举，
//! 每个求值器对其做穷尽匹配。

use crate::error::EngineError;
use crate::operators::Comparison;
use crate::spatial::Relation;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// 司法管辖区
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Jurisdiction {
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

impl fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.country)?;
        if let Some(state) = &self.state {
            write!(f, "/{}", state)?;
        }
        if let Some(city) = &self.city {
            write!(f, "/{}", city)?;
        }
        Ok(())
    }
}

/// 规则集（已编译，加载后不可变）
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub id: String,
    pub name: String,
    pub version: String,
    pub jurisdiction: Jurisdiction,
    pub rules: Vec<Rule>,
    /// 加载来源（文件路径或调用方给定的标识）
    pub source: String,
}

impl RuleSet {
    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }
}

/// 规则
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub priority: i64,
    pub enabled: bool,
    /// 顶层条件按顺序取交集
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    /// 规则定义内容的 SHA-256，用于结果缓存键
    pub fingerprint: String,
}

/// 条件
#[derive(Debug, Clone)]
pub enum Condition {
    Property(PropertyCondition),
    Spatial(SpatialCondition),
    Relationship(RelationshipCondition),
    System(SystemCondition),
    Composite(CompositeCondition),
    Temporal(TemporalCondition),
    Dynamic(DynamicCondition),
    Statistical(StatisticalCondition),
    Pattern(PatternCondition),
    Range(RangeCondition),
    Logical(LogicalExpression),
    /// 加载时无法识别的类型或名称，求值时使所属规则失败
    Unsupported(Unsupported),
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Property(_) => "property",
            Self::Spatial(_) => "spatial",
            Self::Relationship(_) => "relationship",
            Self::System(_) => "system",
            Self::Composite(_) => "composite",
            Self::Temporal(_) => "temporal",
            Self::Dynamic(_) => "dynamic",
            Self::Statistical(_) => "statistical",
            Self::Pattern(_) => "pattern",
            Self::Range(_) => "range",
            Self::Logical(_) => "logical",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Unsupported {
    ConditionType(String),
    Name { kind: &'static str, name: String },
}

impl Unsupported {
    pub fn to_error(&self) -> EngineError {
        match self {
            Self::ConditionType(name) => EngineError::UnknownConditionType(name.clone()),
            Self::Name { kind, name } => EngineError::unknown(*kind, name.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyCondition {
    pub element_type: Option<String>,
    pub property: String,
    pub comparison: Comparison,
}

/// 空间度量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialMeasure {
    Area,
    Volume,
    Height,
    Distance,
    Intersects,
    Nearby,
}

impl FromStr for SpatialMeasure {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "area" => Ok(Self::Area),
            "volume" => Ok(Self::Volume),
            "height" => Ok(Self::Height),
            "distance" => Ok(Self::Distance),
            "intersects" => Ok(Self::Intersects),
            "nearby" => Ok(Self::Nearby),
            other => Err(EngineError::unknown("空间属性", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpatialCondition {
    pub element_type: Option<String>,
    pub measure: SpatialMeasure,
    /// intersects 与布尔值比较，nearby 的期望值即搜索半径
    pub comparison: Comparison,
    pub target_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    Spatial(Relation),
    /// 通过 connections 显式连接（任一方向）
    Connected,
}

impl FromStr for RelationshipKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Self::Connected),
            other => other
                .parse::<Relation>()
                .map(Self::Spatial)
                .map_err(|_| EngineError::unknown("关系", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelationshipCondition {
    pub element_type: Option<String>,
    pub relationship: RelationshipKind,
    pub target_type: String,
}

#[derive(Debug, Clone)]
pub struct SystemCondition {
    pub element_type: Option<String>,
    pub system_type: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub struct CompositeCondition {
    pub operator: CompositeOperator,
    pub conditions: Vec<Condition>,
}

/// 时间操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalOperator {
    Before,
    After,
    During,
    Within,
    Overlaps,
    Contains,
    Equals,
}

impl FromStr for TemporalOperator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            "during" => Ok(Self::During),
            "within" => Ok(Self::Within),
            "overlaps" => Ok(Self::Overlaps),
            "contains" => Ok(Self::Contains),
            "equals" => Ok(Self::Equals),
            other => Err(EngineError::unknown("时间操作符", other)),
        }
    }
}

/// 闭区间时间段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSpan {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }

    pub fn overlaps(&self, other: &TimeSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// 解析时间值：RFC 3339、ISO 日期时间 / 日期字符串，或 Unix 秒数
pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Some(dt.and_utc());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        }
        Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct TemporalCondition {
    pub element_type: Option<String>,
    pub operator: TemporalOperator,
    pub span: TimeSpan,
    pub property: String,
}

/// 动态值解析器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicResolver {
    Area,
    Volume,
    Load,
    Efficiency,
    Cost,
    SafetyFactor,
    ComplianceScore,
}

impl FromStr for DynamicResolver {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "area_calculator" => Ok(Self::Area),
            "volume_calculator" => Ok(Self::Volume),
            "load_calculator" => Ok(Self::Load),
            "efficiency_calculator" => Ok(Self::Efficiency),
            "cost_calculator" => Ok(Self::Cost),
            "safety_factor" => Ok(Self::SafetyFactor),
            "compliance_score" => Ok(Self::ComplianceScore),
            other => Err(EngineError::unknown("动态解析器", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DynamicCondition {
    pub element_type: Option<String>,
    pub resolver: DynamicResolver,
    pub comparison: Comparison,
}

/// 统计函数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticalFunction {
    Count,
    Sum,
    Average,
    Median,
    Min,
    Max,
    StdDev,
    Variance,
    Percentile,
}

impl FromStr for StatisticalFunction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "average" | "mean" => Ok(Self::Average),
            "median" => Ok(Self::Median),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "std_dev" => Ok(Self::StdDev),
            "variance" => Ok(Self::Variance),
            "percentile" => Ok(Self::Percentile),
            other => Err(EngineError::unknown("统计函数", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatisticalCondition {
    pub element_type: Option<String>,
    pub function: StatisticalFunction,
    /// count 可不指定属性，此时统计对象个数
    pub property: Option<String>,
    pub comparison: Comparison,
    pub group_by: Option<String>,
    pub percentile: f64,
}

#[derive(Debug, Clone)]
pub struct PatternCondition {
    pub element_type: Option<String>,
    pub property: String,
    pub regex: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOperation {
    Any,
    All,
    None,
}

impl FromStr for RangeOperation {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            "none" => Ok(Self::None),
            other => Err(EngineError::unknown("区间运算", other)),
        }
    }
}

/// 数值区间，两端均为闭区间，缺省端不设限
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NumericRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl NumericRange {
    pub fn contains(&self, value: f64) -> bool {
        match (self.min, self.max) {
            (Some(min), Some(max)) => min <= value && value <= max,
            (Some(min), None) => value >= min,
            (None, Some(max)) => value <= max,
            (None, None) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeCondition {
    pub element_type: Option<String>,
    pub property: String,
    pub ranges: Vec<NumericRange>,
    pub operation: RangeOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
    Not,
    Xor,
    Nand,
    Nor,
}

impl FromStr for LogicalOperator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            "not" => Ok(Self::Not),
            "xor" => Ok(Self::Xor),
            "nand" => Ok(Self::Nand),
            "nor" => Ok(Self::Nor),
            _ => Err(EngineError::unknown("逻辑操作符", s)),
        }
    }
}

/// 布尔表达式树，叶子为普通条件
#[derive(Debug, Clone)]
pub struct LogicalExpression {
    pub operator: LogicalOperator,
    pub operands: Vec<LogicalOperand>,
}

#[derive(Debug, Clone)]
pub enum LogicalOperand {
    Expression(LogicalExpression),
    Condition(Condition),
}

/// 违规严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            other => Err(format!("Invalid severity '{}'", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        };
        f.write_str(s)
    }
}

/// 动作
#[derive(Debug, Clone)]
pub enum Action {
    /// validation / warning / error：对每个匹配对象产生一条违规
    Emit(EmitAction),
    Calculation(CalculationAction),
}

#[derive(Debug, Clone)]
pub struct EmitAction {
    pub message: String,
    pub severity: Severity,
    pub code_reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CalculationAction {
    /// 结果键名，未指定时使用公式本身
    pub name: String,
    pub formula: String,
    pub unit: Option<String>,
    pub description: Option<String>,
}

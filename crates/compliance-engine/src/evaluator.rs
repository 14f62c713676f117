//! 条件评估器
//!
//! 将条件作用于候选对象集合，返回满足条件的子集（保持输入顺序，
//! 不会产生输入之外的对象）。关系与空间条件的目标对象取自整个模型。

use crate::building::{BuildingModel, BuildingObject};
use crate::error::Result;
use crate::models::{
    CompositeCondition, CompositeOperator, Condition, DynamicCondition, DynamicResolver,
    LogicalExpression, LogicalOperand, LogicalOperator, PatternCondition, PropertyCondition,
    RangeCondition, RangeOperation, RelationshipCondition, RelationshipKind, SpatialCondition,
    SpatialMeasure, StatisticalCondition, StatisticalFunction, SystemCondition,
    TemporalCondition, TemporalOperator, TimeSpan, parse_instant,
};
use crate::operators::{Comparison, as_f64, values_equal};
use crate::spatial::{SpatialAnalyzer, SpatialIndex};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// 一次规则求值的只读上下文
pub struct EvaluationContext<'a> {
    pub model: &'a BuildingModel,
    pub index: &'a SpatialIndex<'a>,
    pub analyzer: &'a SpatialAnalyzer,
}

/// 条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 顶层条件按声明顺序依次收窄，从模型全部对象开始
    pub fn evaluate_all<'a>(
        conditions: &[Condition],
        ctx: &EvaluationContext<'a>,
    ) -> Result<Vec<&'a BuildingObject>> {
        let mut matched: Vec<&'a BuildingObject> = ctx.model.objects.iter().collect();
        for condition in conditions {
            matched = Self::evaluate(condition, &matched, ctx)?;
        }
        Ok(matched)
    }

    /// 评估单个条件
    pub fn evaluate<'a>(
        condition: &Condition,
        objects: &[&'a BuildingObject],
        ctx: &EvaluationContext<'a>,
    ) -> Result<Vec<&'a BuildingObject>> {
        match condition {
            Condition::Property(c) => Ok(Self::property(c, objects)),
            Condition::Spatial(c) => Ok(Self::spatial(c, objects, ctx)),
            Condition::Relationship(c) => Ok(Self::relationship(c, objects, ctx)),
            Condition::System(c) => Ok(Self::system(c, objects)),
            Condition::Composite(c) => Self::composite(c, objects, ctx),
            Condition::Temporal(c) => Ok(Self::temporal(c, objects)),
            Condition::Dynamic(c) => Ok(Self::dynamic(c, objects, ctx)),
            Condition::Statistical(c) => Ok(Self::statistical(c, objects)),
            Condition::Pattern(c) => Ok(Self::pattern(c, objects)),
            Condition::Range(c) => Ok(Self::range(c, objects)),
            Condition::Logical(expr) => Self::logical(expr, objects, ctx),
            Condition::Unsupported(u) => Err(u.to_error()),
        }
    }

    fn property<'a>(c: &PropertyCondition, objects: &[&'a BuildingObject]) -> Vec<&'a BuildingObject> {
        objects
            .iter()
            .copied()
            .filter(|obj| obj.is_type(c.element_type.as_deref()))
            .filter(|obj| match obj.attribute(&c.property) {
                // 属性缺失时不匹配
                None => false,
                Some(value) => compare(&c.comparison, &value, obj),
            })
            .collect()
    }

    fn spatial<'a>(
        c: &SpatialCondition,
        objects: &[&'a BuildingObject],
        ctx: &EvaluationContext<'a>,
    ) -> Vec<&'a BuildingObject> {
        let analyzer = ctx.analyzer;
        let targets = || ctx.index.of_type(c.target_type.as_deref());

        objects
            .iter()
            .copied()
            .filter(|obj| obj.is_type(c.element_type.as_deref()))
            .filter(|obj| match c.measure {
                SpatialMeasure::Area => compare_number(&c.comparison, analyzer.area(obj), obj),
                SpatialMeasure::Volume => compare_number(&c.comparison, analyzer.volume(obj), obj),
                SpatialMeasure::Height => analyzer
                    .height(obj)
                    .is_some_and(|h| compare_number(&c.comparison, h, obj)),
                SpatialMeasure::Distance => targets()
                    .into_iter()
                    .filter(|t| t.id != obj.id)
                    .any(|t| match analyzer.distance(obj, t) {
                        Ok(d) => compare_number(&c.comparison, d, obj),
                        Err(e) => {
                            debug!(object_id = %obj.id, target_id = %t.id, "跳过距离计算: {}", e);
                            false
                        }
                    }),
                SpatialMeasure::Intersects => {
                    let hit = targets()
                        .into_iter()
                        .any(|t| t.id != obj.id && analyzer.intersects(obj, t));
                    compare(&c.comparison, &Value::Bool(hit), obj)
                }
                SpatialMeasure::Nearby => {
                    let radius = as_f64(&c.comparison.expected).unwrap_or(0.0);
                    ctx.index
                        .nearby(obj, radius)
                        .iter()
                        .any(|t| t.is_type(c.target_type.as_deref()))
                }
            })
            .collect()
    }

    fn relationship<'a>(
        c: &RelationshipCondition,
        objects: &[&'a BuildingObject],
        ctx: &EvaluationContext<'a>,
    ) -> Vec<&'a BuildingObject> {
        let targets = ctx.index.of_type(Some(&c.target_type));

        objects
            .iter()
            .copied()
            .filter(|obj| obj.is_type(c.element_type.as_deref()))
            .filter(|obj| {
                targets.iter().filter(|t| t.id != obj.id).any(|t| match c.relationship {
                    RelationshipKind::Connected => {
                        obj.connections.iter().any(|id| *id == t.id)
                            || t.connections.iter().any(|id| *id == obj.id)
                    }
                    RelationshipKind::Spatial(relation) => {
                        ctx.analyzer.has_relation(obj, t, relation)
                    }
                })
            })
            .collect()
    }

    fn system<'a>(c: &SystemCondition, objects: &[&'a BuildingObject]) -> Vec<&'a BuildingObject> {
        objects
            .iter()
            .copied()
            .filter(|obj| obj.is_type(c.element_type.as_deref()))
            .filter(|obj| {
                obj.attribute("system_type")
                    .is_some_and(|v| values_equal(&v, &c.system_type))
            })
            .collect()
    }

    /// AND 从左到右依次收窄并在结果为空时短路；OR 对各子条件结果取并集
    fn composite<'a>(
        c: &CompositeCondition,
        objects: &[&'a BuildingObject],
        ctx: &EvaluationContext<'a>,
    ) -> Result<Vec<&'a BuildingObject>> {
        match c.operator {
            CompositeOperator::And => {
                let mut matched = objects.to_vec();
                for sub in &c.conditions {
                    matched = Self::evaluate(sub, &matched, ctx)?;
                    if matched.is_empty() {
                        break;
                    }
                }
                Ok(matched)
            }
            CompositeOperator::Or => {
                let mut ids = HashSet::new();
                for sub in &c.conditions {
                    ids.extend(Self::evaluate(sub, objects, ctx)?.into_iter().map(|o| o.id.as_str()));
                }
                Ok(keep(objects, &ids))
            }
        }
    }

    fn temporal<'a>(c: &TemporalCondition, objects: &[&'a BuildingObject]) -> Vec<&'a BuildingObject> {
        objects
            .iter()
            .copied()
            .filter(|obj| obj.is_type(c.element_type.as_deref()))
            .filter(|obj| {
                obj.attribute(&c.property)
                    .and_then(|v| TimeValue::parse(&v))
                    .is_some_and(|t| t.satisfies(c.operator, &c.span))
            })
            .collect()
    }

    fn dynamic<'a>(
        c: &DynamicCondition,
        objects: &[&'a BuildingObject],
        ctx: &EvaluationContext<'a>,
    ) -> Vec<&'a BuildingObject> {
        objects
            .iter()
            .copied()
            .filter(|obj| obj.is_type(c.element_type.as_deref()))
            .filter(|obj| {
                resolve(c.resolver, obj, ctx.analyzer)
                    .is_some_and(|value| compare_number(&c.comparison, value, obj))
            })
            .collect()
    }

    /// 分组统计，满足阈值的分组中所有对象都被保留
    fn statistical<'a>(
        c: &StatisticalCondition,
        objects: &[&'a BuildingObject],
    ) -> Vec<&'a BuildingObject> {
        let mut groups: BTreeMap<String, Vec<&'a BuildingObject>> = BTreeMap::new();
        for obj in objects.iter().copied().filter(|o| o.is_type(c.element_type.as_deref())) {
            let key = match &c.group_by {
                None => "all".to_string(),
                Some(prop) => match obj.attribute(prop) {
                    Some(value) => match value.as_ref() {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                    None => "default".to_string(),
                },
            };
            groups.entry(key).or_default().push(obj);
        }

        let mut ids = HashSet::new();
        for (key, members) in &groups {
            let values: Vec<f64> = match &c.property {
                Some(prop) => members.iter().filter_map(|o| o.number(prop)).collect(),
                None => vec![1.0; members.len()],
            };
            if values.is_empty() {
                continue;
            }

            let stat = statistic(c.function, &values, c.percentile);
            match c.comparison.matches_number(stat) {
                Ok(true) => ids.extend(members.iter().map(|o| o.id.as_str())),
                Ok(false) => {}
                Err(e) => debug!(group = %key, "统计比较失败: {}", e),
            }
        }

        keep(objects, &ids)
    }

    fn pattern<'a>(c: &PatternCondition, objects: &[&'a BuildingObject]) -> Vec<&'a BuildingObject> {
        objects
            .iter()
            .copied()
            .filter(|obj| obj.is_type(c.element_type.as_deref()))
            .filter(|obj| {
                obj.attribute(&c.property).is_some_and(|value| match value.as_ref() {
                    Value::String(s) => c.regex.is_match(s),
                    other => c.regex.is_match(&other.to_string()),
                })
            })
            .collect()
    }

    fn range<'a>(c: &RangeCondition, objects: &[&'a BuildingObject]) -> Vec<&'a BuildingObject> {
        objects
            .iter()
            .copied()
            .filter(|obj| obj.is_type(c.element_type.as_deref()))
            .filter(|obj| {
                let Some(value) = obj.number(&c.property) else {
                    return false;
                };
                let mut hits = c.ranges.iter().map(|r| r.contains(value));
                match c.operation {
                    RangeOperation::Any => hits.any(|h| h),
                    RangeOperation::All => hits.all(|h| h),
                    RangeOperation::None => !hits.any(|h| h),
                }
            })
            .collect()
    }

    fn logical<'a>(
        expr: &LogicalExpression,
        objects: &[&'a BuildingObject],
        ctx: &EvaluationContext<'a>,
    ) -> Result<Vec<&'a BuildingObject>> {
        let mut operand_ids: Vec<HashSet<&'a str>> = Vec::with_capacity(expr.operands.len());
        for operand in &expr.operands {
            let matched = match operand {
                LogicalOperand::Expression(inner) => Self::logical(inner, objects, ctx)?,
                LogicalOperand::Condition(condition) => Self::evaluate(condition, objects, ctx)?,
            };
            operand_ids.push(matched.into_iter().map(|o| o.id.as_str()).collect());
        }

        let all: HashSet<&'a str> = objects.iter().map(|o| o.id.as_str()).collect();
        let intersection = || -> HashSet<&'a str> {
            let mut sets = operand_ids.iter();
            match sets.next() {
                None => HashSet::new(),
                Some(first) => sets.fold(first.clone(), |acc, s| &acc & s),
            }
        };
        let union = || -> HashSet<&'a str> { operand_ids.iter().flatten().copied().collect() };

        let ids = match expr.operator {
            LogicalOperator::And => intersection(),
            LogicalOperator::Or => union(),
            LogicalOperator::Nand => &all - &intersection(),
            LogicalOperator::Nor => &all - &union(),
            LogicalOperator::Not => match operand_ids.first() {
                Some(only) if operand_ids.len() == 1 => &all - only,
                _ => HashSet::new(),
            },
            LogicalOperator::Xor => match operand_ids.as_slice() {
                [a, b] => a ^ b,
                _ => HashSet::new(),
            },
        };

        Ok(keep(objects, &ids))
    }
}

/// 按输入顺序保留 ID 在集合中的对象
fn keep<'a>(objects: &[&'a BuildingObject], ids: &HashSet<&str>) -> Vec<&'a BuildingObject> {
    objects
        .iter()
        .copied()
        .filter(|o| ids.contains(o.id.as_str()))
        .collect()
}

/// 比较失败（类型不匹配等）时排除该对象
fn compare(comparison: &Comparison, value: &Value, obj: &BuildingObject) -> bool {
    match comparison.matches(value) {
        Ok(matched) => matched,
        Err(e) => {
            debug!(object_id = %obj.id, operator = %comparison.operator, "比较失败，排除对象: {}", e);
            false
        }
    }
}

fn compare_number(comparison: &Comparison, value: f64, obj: &BuildingObject) -> bool {
    compare(comparison, &Value::from(value), obj)
}

/// 动态值解析：优先取同名属性，否则由相关属性推导
fn resolve(resolver: DynamicResolver, obj: &BuildingObject, analyzer: &SpatialAnalyzer) -> Option<f64> {
    let ratio = |num: &str, den: &str| -> Option<f64> {
        let (n, d) = (obj.number(num)?, obj.number(den)?);
        (d > 0.0).then(|| n / d)
    };
    let product = |a: &str, b: &str| -> Option<f64> { Some(obj.number(a)? * obj.number(b)?) };
    let positive = |v: f64| (v > 0.0).then_some(v);

    match resolver {
        DynamicResolver::Area => obj.number("area").or_else(|| positive(analyzer.area(obj))),
        DynamicResolver::Volume => obj
            .number("volume")
            .or_else(|| positive(analyzer.volume(obj))),
        DynamicResolver::Load => obj
            .number("load")
            .or_else(|| product("area", "load_per_area")),
        DynamicResolver::Efficiency => obj
            .number("efficiency")
            .or_else(|| ratio("energy_output", "energy_consumption")),
        DynamicResolver::Cost => obj
            .number("cost")
            .or_else(|| product("area", "cost_per_area")),
        DynamicResolver::SafetyFactor => obj
            .number("safety_factor")
            .or_else(|| ratio("design_load", "actual_load")),
        DynamicResolver::ComplianceScore => obj.number("compliance_score"),
    }
}

/// 统计函数；方差与标准差使用样本公式，单个样本时为 0
pub fn statistic(function: StatisticalFunction, values: &[f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sample_variance = || {
        if values.len() < 2 {
            0.0
        } else {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        }
    };

    match function {
        StatisticalFunction::Count => n,
        StatisticalFunction::Sum => values.iter().sum(),
        StatisticalFunction::Average => mean,
        StatisticalFunction::Median => quantile(values, 50.0),
        StatisticalFunction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        StatisticalFunction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        StatisticalFunction::StdDev => sample_variance().sqrt(),
        StatisticalFunction::Variance => sample_variance(),
        StatisticalFunction::Percentile => quantile(values, percentile),
    }
}

/// 线性插值分位数
fn quantile(values: &[f64], percentile: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (percentile.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// 对象上的时间值：时间点或时间段
enum TimeValue {
    Instant(DateTime<Utc>),
    Span(TimeSpan),
}

impl TimeValue {
    fn parse(value: &Value) -> Option<Self> {
        if let (Some(start), Some(end)) = (value.get("start"), value.get("end")) {
            let span = TimeSpan {
                start: parse_instant(start)?,
                end: parse_instant(end)?,
            };
            return Some(Self::Span(span));
        }
        parse_instant(value).map(Self::Instant)
    }

    fn satisfies(&self, operator: TemporalOperator, range: &TimeSpan) -> bool {
        match (operator, self) {
            (TemporalOperator::Before, Self::Instant(t)) => *t < range.start,
            (TemporalOperator::Before, Self::Span(s)) => s.end < range.start,
            (TemporalOperator::After, Self::Instant(t)) => *t > range.end,
            (TemporalOperator::After, Self::Span(s)) => s.start > range.end,
            (
                TemporalOperator::During | TemporalOperator::Within | TemporalOperator::Overlaps,
                Self::Instant(t),
            ) => range.contains(*t),
            (TemporalOperator::During | TemporalOperator::Within, Self::Span(s)) => {
                range.contains(s.start) && range.contains(s.end)
            }
            (TemporalOperator::Overlaps, Self::Span(s)) => s.overlaps(range),
            // 时间点不能包含时间段
            (TemporalOperator::Contains, Self::Instant(_)) => false,
            (TemporalOperator::Contains, Self::Span(s)) => {
                s.contains(range.start) && s.contains(range.end)
            }
            (TemporalOperator::Equals, Self::Instant(t)) => *t == range.start,
            (TemporalOperator::Equals, Self::Span(s)) => s == range,
        }
    }
}

//! 规则集编译器
//!
//! 将规则文档校验并编译成内存中的条件树。所有缺陷一次性收集，
//! `lint` 返回缺陷列表，`compile` 在存在缺陷时返回 `MalformedRuleSet`。

use crate::building::hex_digest;
use crate::document::{
    ActionDocument, ConditionDocument, RuleDocument, RuleSetDocument, present,
};
use crate::error::{EngineError, Result};
use crate::models::{
    Action, CalculationAction, CompositeCondition, CompositeOperator, Condition,
    DynamicCondition, EmitAction, Jurisdiction, LogicalExpression, LogicalOperand,
    LogicalOperator, NumericRange, PatternCondition, PropertyCondition, RangeCondition,
    RangeOperation, RelationshipCondition, Rule, RuleSet, Severity, SpatialCondition,
    SpatialMeasure, StatisticalCondition, StatisticalFunction, SystemCondition,
    TemporalCondition, TemporalOperator, TimeSpan, Unsupported, parse_instant,
};
use crate::operators::{Comparison, Operator, as_f64};
use regex::RegexBuilder;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;

/// 规则集编译器
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleSetCompiler;

impl RuleSetCompiler {
    pub fn new() -> Self {
        Self
    }

    /// 从 JSON 字符串编译规则集
    pub fn compile_from_json(&self, json: &str, source: &str) -> Result<RuleSet> {
        let doc: RuleSetDocument =
            serde_json::from_str(json).map_err(|e| EngineError::MalformedRuleSet {
                source_id: source.to_string(),
                defects: vec![format!("File loading error: {}", e)],
            })?;
        self.compile(&doc, source)
    }

    /// 编译规则集，存在任何缺陷时失败
    pub fn compile(&self, doc: &RuleSetDocument, source: &str) -> Result<RuleSet> {
        let (rule_set, defects) = self.build(doc, source);
        if defects.is_empty() {
            Ok(rule_set)
        } else {
            Err(EngineError::MalformedRuleSet {
                source_id: source.to_string(),
                defects,
            })
        }
    }

    /// 只做校验，返回人类可读的缺陷列表
    pub fn lint(&self, doc: &RuleSetDocument) -> Vec<String> {
        self.build(doc, "").1
    }

    /// 编译单个条件
    pub fn compile_condition(
        &self,
        doc: &ConditionDocument,
    ) -> std::result::Result<Condition, Vec<String>> {
        let mut defects = Vec::new();
        let condition = self.condition(doc, &mut defects);
        if defects.is_empty() {
            Ok(condition)
        } else {
            Err(defects)
        }
    }

    fn build(&self, doc: &RuleSetDocument, source: &str) -> (RuleSet, Vec<String>) {
        let mut defects = Vec::new();

        if present(&doc.id).is_none() {
            defects.push("Missing id".to_string());
        }
        if present(&doc.name).is_none() {
            defects.push("Missing name".to_string());
        }

        let jurisdiction = doc.jurisdiction.clone().unwrap_or_default();
        if present(&jurisdiction.country).is_none() {
            defects.push("Missing jurisdiction country".to_string());
        }

        let mut seen_ids = HashSet::new();
        let mut rules = Vec::with_capacity(doc.rules.len());
        for (i, rule_doc) in doc.rules.iter().enumerate() {
            let rule = self.rule(rule_doc, i, &mut defects);
            if !rule.id.is_empty() && !seen_ids.insert(rule.id.clone()) {
                defects.push(format!("Rule {}: Duplicate rule_id '{}'", i, rule.id));
            }
            rules.push(rule);
        }

        let rule_set = RuleSet {
            id: present(&doc.id).unwrap_or_default().to_string(),
            name: present(&doc.name).unwrap_or_default().to_string(),
            version: present(&doc.version).unwrap_or("1.0").to_string(),
            jurisdiction: Jurisdiction {
                country: present(&jurisdiction.country).unwrap_or_default().to_string(),
                state: present(&jurisdiction.state).map(str::to_string),
                city: present(&jurisdiction.city).map(str::to_string),
            },
            rules,
            source: source.to_string(),
        };

        (rule_set, defects)
    }

    fn rule(&self, doc: &RuleDocument, i: usize, defects: &mut Vec<String>) -> Rule {
        if present(&doc.rule_id).is_none() {
            defects.push(format!("Rule {}: Missing rule_id", i));
        }
        if present(&doc.name).is_none() {
            defects.push(format!("Rule {}: Missing name", i));
        }
        if doc.conditions.is_empty() {
            defects.push(format!("Rule {}: No conditions defined", i));
        }
        if doc.actions.is_empty() {
            defects.push(format!("Rule {}: No actions defined", i));
        }

        let mut conditions = Vec::with_capacity(doc.conditions.len());
        for (j, cond_doc) in doc.conditions.iter().enumerate() {
            let mut local = Vec::new();
            conditions.push(self.condition(cond_doc, &mut local));
            defects.extend(
                local
                    .into_iter()
                    .map(|d| format!("Rule {}, Condition {}: {}", i, j, d)),
            );
        }

        let mut actions = Vec::with_capacity(doc.actions.len());
        for (j, action_doc) in doc.actions.iter().enumerate() {
            match self.action(action_doc) {
                Ok(action) => actions.push(action),
                Err(local) => defects.extend(
                    local
                        .into_iter()
                        .map(|d| format!("Rule {}, Action {}: {}", i, j, d)),
                ),
            }
        }

        let fingerprint = serde_json::to_vec(doc)
            .map(|bytes| hex_digest(&bytes))
            .unwrap_or_default();

        Rule {
            id: present(&doc.rule_id).unwrap_or_default().to_string(),
            name: present(&doc.name).unwrap_or_default().to_string(),
            description: doc.description.clone().unwrap_or_default(),
            category: present(&doc.category).unwrap_or("general").to_string(),
            priority: doc.priority.unwrap_or(1),
            enabled: doc.enabled.unwrap_or(true),
            conditions,
            actions,
            fingerprint,
        }
    }

    /// 编译单个条件
    ///
    /// 缺陷写入 `defects`；无法识别的类型或名称编译为 `Unsupported`，
    /// 不算缺陷。
    fn condition(&self, doc: &ConditionDocument, defects: &mut Vec<String>) -> Condition {
        let Some(kind) = present(&doc.condition_type) else {
            defects.push("Missing condition type".to_string());
            return placeholder();
        };

        let element_type = present(&doc.element_type).map(str::to_string);

        match kind {
            "property" => self.property(doc, element_type, defects),
            "spatial" => self.spatial(doc, element_type, defects),
            "relationship" => self.relationship(doc, element_type, defects),
            "system" => match &doc.value {
                Some(value) if !value.is_null() => Condition::System(SystemCondition {
                    element_type,
                    system_type: value.clone(),
                }),
                _ => {
                    defects.push("Missing value for system condition".to_string());
                    placeholder()
                }
            },
            "composite" => self.composite(doc, defects),
            "temporal" => self.temporal(doc, element_type, defects),
            "dynamic" => self.dynamic(doc, element_type, defects),
            "statistical" => self.statistical(doc, element_type, defects),
            "pattern" => self.pattern(doc, element_type, defects),
            "range" => self.range(doc, element_type, defects),
            "logical" => self.logical(doc, defects),
            other => Condition::Unsupported(Unsupported::ConditionType(other.to_string())),
        }
    }

    fn property(
        &self,
        doc: &ConditionDocument,
        element_type: Option<String>,
        defects: &mut Vec<String>,
    ) -> Condition {
        let property = present(&doc.property);
        let operator = present(&doc.operator);
        if property.is_none() {
            defects.push("Missing property for property condition".to_string());
        }
        if operator.is_none() {
            defects.push("Missing operator for property condition".to_string());
        }
        let (Some(property), Some(operator)) = (property, operator) else {
            return placeholder();
        };

        let operator = match operator.parse::<Operator>() {
            Ok(op) => op,
            Err(_) => return unsupported("操作符", operator),
        };
        let expected = doc.value.clone().unwrap_or(Value::Null);
        match Comparison::new(operator, expected) {
            Ok(comparison) => Condition::Property(PropertyCondition {
                element_type,
                property: property.to_string(),
                comparison,
            }),
            Err(defect) => {
                defects.push(defect);
                placeholder()
            }
        }
    }

    fn spatial(
        &self,
        doc: &ConditionDocument,
        element_type: Option<String>,
        defects: &mut Vec<String>,
    ) -> Condition {
        let Some(property) = present(&doc.property) else {
            defects.push("Missing property for spatial condition".to_string());
            return placeholder();
        };
        let measure = match property.parse::<SpatialMeasure>() {
            Ok(m) => m,
            Err(_) => return unsupported("空间属性", property),
        };

        let comparison = match measure {
            SpatialMeasure::Intersects => {
                let operator = present(&doc.operator).unwrap_or("==");
                let expected = doc.value.clone().unwrap_or(Value::Bool(true));
                operator
                    .parse::<Operator>()
                    .map(|op| Comparison::new(op, expected))
            }
            SpatialMeasure::Nearby => match doc.value.as_ref().and_then(as_f64) {
                Some(radius) if radius >= 0.0 => {
                    Ok(Ok(Comparison::numeric(Operator::Lte, radius)))
                }
                _ => {
                    defects.push("nearby requires a non-negative numeric radius".to_string());
                    return placeholder();
                }
            },
            _ => {
                let Some(operator) = present(&doc.operator) else {
                    defects.push("Missing operator for spatial condition".to_string());
                    return placeholder();
                };
                if doc.value.as_ref().and_then(as_f64).is_none() {
                    defects.push(format!("Missing numeric value for spatial {}", property));
                    return placeholder();
                }
                let expected = doc.value.clone().unwrap_or(Value::Null);
                operator
                    .parse::<Operator>()
                    .map(|op| Comparison::new(op, expected))
            }
        };

        match comparison {
            Ok(Ok(comparison)) => Condition::Spatial(SpatialCondition {
                element_type,
                measure,
                comparison,
                target_type: present(&doc.target_type).map(str::to_string),
            }),
            Ok(Err(defect)) => {
                defects.push(defect);
                placeholder()
            }
            Err(_) => unsupported("操作符", present(&doc.operator).unwrap_or_default()),
        }
    }

    fn relationship(
        &self,
        doc: &ConditionDocument,
        element_type: Option<String>,
        defects: &mut Vec<String>,
    ) -> Condition {
        let relationship = present(&doc.relationship);
        let target_type = present(&doc.target_type);
        if relationship.is_none() {
            defects.push("Missing relationship for relationship condition".to_string());
        }
        if target_type.is_none() {
            defects.push("Missing target_type for relationship condition".to_string());
        }
        let (Some(relationship), Some(target_type)) = (relationship, target_type) else {
            return placeholder();
        };

        match relationship.parse() {
            Ok(kind) => Condition::Relationship(RelationshipCondition {
                element_type,
                relationship: kind,
                target_type: target_type.to_string(),
            }),
            Err(_) => unsupported("关系", relationship),
        }
    }

    fn composite(&self, doc: &ConditionDocument, defects: &mut Vec<String>) -> Condition {
        if doc.conditions.is_empty() {
            defects.push("No sub-conditions for composite condition".to_string());
            return placeholder();
        }

        let name = present(&doc.composite_operator)
            .or(present(&doc.operator))
            .unwrap_or("AND");
        let operator = match name.to_ascii_uppercase().as_str() {
            "AND" => CompositeOperator::And,
            "OR" => CompositeOperator::Or,
            _ => return unsupported("组合操作符", name),
        };

        let mut conditions = Vec::with_capacity(doc.conditions.len());
        for (k, sub) in doc.conditions.iter().enumerate() {
            let mut local = Vec::new();
            conditions.push(self.condition(sub, &mut local));
            defects.extend(
                local
                    .into_iter()
                    .map(|d| format!("Sub-condition {}: {}", k, d)),
            );
        }

        Condition::Composite(CompositeCondition {
            operator,
            conditions,
        })
    }

    fn temporal(
        &self,
        doc: &ConditionDocument,
        element_type: Option<String>,
        defects: &mut Vec<String>,
    ) -> Condition {
        #[derive(Deserialize)]
        struct Params {
            operator: Option<String>,
            start: Option<Value>,
            end: Option<Value>,
            property: Option<String>,
        }

        let Some(params) = params::<Params>(&doc.temporal_params, "temporal", defects) else {
            return placeholder();
        };

        let operator_name = present(&params.operator).unwrap_or("during");
        let operator = match operator_name.parse::<TemporalOperator>() {
            Ok(op) => op,
            Err(_) => return unsupported("时间操作符", operator_name),
        };

        let Some(start) = params.start.as_ref() else {
            defects.push("Missing start for temporal condition".to_string());
            return placeholder();
        };
        let Some(start) = parse_instant(start) else {
            defects.push(format!("Invalid start time: {}", start));
            return placeholder();
        };
        let end = match params.end.as_ref() {
            None => start,
            Some(v) => match parse_instant(v) {
                Some(end) => end,
                None => {
                    defects.push(format!("Invalid end time: {}", v));
                    return placeholder();
                }
            },
        };
        if end < start {
            defects.push("Temporal end precedes start".to_string());
            return placeholder();
        }

        Condition::Temporal(TemporalCondition {
            element_type,
            operator,
            span: TimeSpan { start, end },
            property: present(&params.property).unwrap_or("timestamp").to_string(),
        })
    }

    fn dynamic(
        &self,
        doc: &ConditionDocument,
        element_type: Option<String>,
        defects: &mut Vec<String>,
    ) -> Condition {
        #[derive(Deserialize)]
        struct Params {
            resolver: Option<String>,
            operator: Option<String>,
            value: Option<Value>,
        }

        let Some(params) = params::<Params>(&doc.dynamic_params, "dynamic", defects) else {
            return placeholder();
        };
        let Some(resolver_name) = present(&params.resolver) else {
            defects.push("Missing resolver for dynamic condition".to_string());
            return placeholder();
        };
        let resolver = match resolver_name.parse() {
            Ok(r) => r,
            Err(_) => return unsupported("动态解析器", resolver_name),
        };

        let operator_name = present(&params.operator).unwrap_or("==");
        let operator = match operator_name.parse::<Operator>() {
            Ok(op) => op,
            Err(_) => return unsupported("操作符", operator_name),
        };

        match Comparison::new(operator, params.value.unwrap_or(Value::Null)) {
            Ok(comparison) => Condition::Dynamic(DynamicCondition {
                element_type,
                resolver,
                comparison,
            }),
            Err(defect) => {
                defects.push(defect);
                placeholder()
            }
        }
    }

    fn statistical(
        &self,
        doc: &ConditionDocument,
        element_type: Option<String>,
        defects: &mut Vec<String>,
    ) -> Condition {
        #[derive(Deserialize)]
        struct Params {
            function: Option<String>,
            property: Option<String>,
            operator: Option<String>,
            threshold: Option<f64>,
            group_by: Option<String>,
            percentile: Option<f64>,
        }

        let Some(params) = params::<Params>(&doc.statistical_params, "statistical", defects)
        else {
            return placeholder();
        };

        let function_name = present(&params.function).unwrap_or("count");
        let function = match function_name.parse::<StatisticalFunction>() {
            Ok(f) => f,
            Err(_) => return unsupported("统计函数", function_name),
        };

        let property = present(&params.property).map(str::to_string);
        if property.is_none() && function != StatisticalFunction::Count {
            defects.push("Missing property for statistical condition".to_string());
            return placeholder();
        }

        let percentile = params.percentile.unwrap_or(50.0);
        if !(0.0..=100.0).contains(&percentile) {
            defects.push(format!("Percentile {} out of range 0-100", percentile));
            return placeholder();
        }

        let operator_name = present(&params.operator).unwrap_or(">=");
        let operator = match operator_name.parse::<Operator>() {
            Ok(op) => op,
            Err(_) => return unsupported("操作符", operator_name),
        };

        Condition::Statistical(StatisticalCondition {
            element_type,
            function,
            property,
            comparison: Comparison::numeric(operator, params.threshold.unwrap_or(0.0)),
            group_by: present(&params.group_by).map(str::to_string),
            percentile,
        })
    }

    fn pattern(
        &self,
        doc: &ConditionDocument,
        element_type: Option<String>,
        defects: &mut Vec<String>,
    ) -> Condition {
        #[derive(Deserialize)]
        struct Params {
            property: Option<String>,
            pattern: Option<String>,
            case_sensitive: Option<bool>,
        }

        let Some(params) = params::<Params>(&doc.pattern_params, "pattern", defects) else {
            return placeholder();
        };
        let property = present(&params.property);
        let pattern = params.pattern.as_deref().filter(|p| !p.is_empty());
        if property.is_none() {
            defects.push("Missing property for pattern condition".to_string());
        }
        if pattern.is_none() {
            defects.push("Missing pattern for pattern condition".to_string());
        }
        let (Some(property), Some(pattern)) = (property, pattern) else {
            return placeholder();
        };

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!params.case_sensitive.unwrap_or(true))
            .build();
        match regex {
            Ok(regex) => Condition::Pattern(PatternCondition {
                element_type,
                property: property.to_string(),
                regex,
            }),
            Err(e) => {
                defects.push(format!("Invalid regular expression '{}': {}", pattern, e));
                placeholder()
            }
        }
    }

    fn range(
        &self,
        doc: &ConditionDocument,
        element_type: Option<String>,
        defects: &mut Vec<String>,
    ) -> Condition {
        #[derive(Deserialize)]
        struct Params {
            property: Option<String>,
            #[serde(default)]
            ranges: Vec<NumericRange>,
            operation: Option<String>,
        }

        let Some(params) = params::<Params>(&doc.range_params, "range", defects) else {
            return placeholder();
        };
        let Some(property) = present(&params.property) else {
            defects.push("Missing property for range condition".to_string());
            return placeholder();
        };
        if params.ranges.is_empty() {
            defects.push("No ranges for range condition".to_string());
            return placeholder();
        }

        let operation_name = present(&params.operation).unwrap_or("any");
        let operation = match operation_name.parse::<RangeOperation>() {
            Ok(op) => op,
            Err(_) => return unsupported("区间运算", operation_name),
        };

        Condition::Range(RangeCondition {
            element_type,
            property: property.to_string(),
            ranges: params.ranges,
            operation,
        })
    }

    fn logical(&self, doc: &ConditionDocument, defects: &mut Vec<String>) -> Condition {
        let expression = doc
            .logical_params
            .as_ref()
            .and_then(|p| p.get("expression"))
            .filter(|e| !e.is_null());
        let Some(expression) = expression else {
            defects.push("Missing logical_params expression for logical condition".to_string());
            return placeholder();
        };

        match self.expression(expression, defects) {
            Ok(expr) => Condition::Logical(expr),
            Err(unsupported) => Condition::Unsupported(unsupported),
        }
    }

    fn expression(
        &self,
        value: &Value,
        defects: &mut Vec<String>,
    ) -> std::result::Result<LogicalExpression, Unsupported> {
        let Some(name) = value.get("operator").and_then(Value::as_str) else {
            defects.push("Missing operator in logical expression".to_string());
            return Ok(empty_expression());
        };
        let operator = name.parse::<LogicalOperator>().map_err(|_| Unsupported::Name {
            kind: "逻辑操作符",
            name: name.to_string(),
        })?;

        let raw_operands = value
            .get("operands")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        match operator {
            LogicalOperator::Not if raw_operands.len() != 1 => {
                defects.push("not requires exactly one operand".to_string());
            }
            LogicalOperator::Xor if raw_operands.len() != 2 => {
                defects.push("xor requires exactly two operands".to_string());
            }
            _ if raw_operands.is_empty() => {
                defects.push(format!("No operands for logical {}", name));
            }
            _ => {}
        }

        let mut operands = Vec::with_capacity(raw_operands.len());
        for (k, raw) in raw_operands.iter().enumerate() {
            let mut local = Vec::new();
            let operand = if raw.get("operands").is_some() {
                LogicalOperand::Expression(self.expression(raw, &mut local)?)
            } else {
                match serde_json::from_value::<ConditionDocument>(raw.clone()) {
                    Ok(cond_doc) => LogicalOperand::Condition(self.condition(&cond_doc, &mut local)),
                    Err(e) => {
                        local.push(format!("Invalid condition: {}", e));
                        LogicalOperand::Condition(placeholder())
                    }
                }
            };
            defects.extend(local.into_iter().map(|d| format!("Operand {}: {}", k, d)));
            operands.push(operand);
        }

        Ok(LogicalExpression { operator, operands })
    }

    fn action(&self, doc: &ActionDocument) -> std::result::Result<Action, Vec<String>> {
        let Some(kind) = present(&doc.action_type) else {
            return Err(vec!["Missing action type".to_string()]);
        };

        let default_severity = match kind {
            "validation" => None,
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "calculation" => {
                let Some(formula) = present(&doc.formula) else {
                    return Err(vec!["Missing formula for calculation action".to_string()]);
                };
                return Ok(Action::Calculation(CalculationAction {
                    name: present(&doc.name).unwrap_or(formula).to_string(),
                    formula: formula.to_string(),
                    unit: present(&doc.unit).map(str::to_string),
                    description: present(&doc.description).map(str::to_string),
                }));
            }
            other => return Err(vec![format!("Unknown action type '{}'", other)]),
        };

        let mut defects = Vec::new();
        let message = present(&doc.message);
        if message.is_none() {
            defects.push(format!("Missing message for {} action", kind));
        }
        let severity = match present(&doc.severity) {
            Some(s) => match s.parse::<Severity>() {
                Ok(severity) => Some(severity),
                Err(defect) => {
                    defects.push(defect);
                    None
                }
            },
            None if default_severity.is_none() => {
                defects.push(format!("Missing severity for {} action", kind));
                None
            }
            None => default_severity,
        };

        match (message, severity) {
            (Some(message), Some(severity)) if defects.is_empty() => {
                Ok(Action::Emit(EmitAction {
                    message: message.to_string(),
                    severity,
                    code_reference: present(&doc.code_reference).map(str::to_string),
                }))
            }
            _ => Err(defects),
        }
    }
}

fn params<T: DeserializeOwned>(
    raw: &Option<Value>,
    kind: &str,
    defects: &mut Vec<String>,
) -> Option<T> {
    let Some(raw) = raw.as_ref().filter(|v| !v.is_null()) else {
        defects.push(format!("Missing {}_params for {} condition", kind, kind));
        return None;
    };
    match serde_json::from_value(raw.clone()) {
        Ok(params) => Some(params),
        Err(e) => {
            defects.push(format!("Invalid {}_params: {}", kind, e));
            None
        }
    }
}

fn unsupported(kind: &'static str, name: &str) -> Condition {
    Condition::Unsupported(Unsupported::Name {
        kind,
        name: name.to_string(),
    })
}

/// 存在缺陷时的占位条件，编译失败时不会被使用
fn placeholder() -> Condition {
    Condition::Unsupported(Unsupported::ConditionType("invalid".to_string()))
}

fn empty_expression() -> LogicalExpression {
    LogicalExpression {
        operator: LogicalOperator::And,
        operands: Vec::new(),
    }
}

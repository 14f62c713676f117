//! 规则执行器
//!
//! [`RuleExecutor`] 对单条规则执行"条件过滤 → 动作执行"，产出
//! [`ValidationResult`]；[`ActionExecutor`] 负责把匹配对象转换为违规与计算结果。

use arx_shared::observability::metrics::record_rule_evaluation;
use crate::building::BuildingObject;
use crate::evaluator::{ConditionEvaluator, EvaluationContext};
use crate::formula::{self, FormulaContext};
use crate::models::{Action, CalculationAction, EmitAction, Rule, Severity};
use crate::report::{Calculation, ValidationResult, ValidationViolation};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

/// 动作执行产出
#[derive(Debug, Default)]
pub struct ActionOutcome {
    pub violations: Vec<ValidationViolation>,
    pub warnings: Vec<ValidationViolation>,
    pub calculations: BTreeMap<String, Calculation>,
}

/// 动作执行器
pub struct ActionExecutor;

impl ActionExecutor {
    /// 按声明顺序执行规则的全部动作
    ///
    /// 校验类动作对每个匹配对象产生一条违规；计算动作失败时记录失败结果，
    /// 并追加一条诊断违规，不影响后续动作。
    pub fn execute(
        rule: &Rule,
        matched: &[&BuildingObject],
        ctx: &EvaluationContext<'_>,
    ) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();

        for action in &rule.actions {
            match action {
                Action::Emit(emit) => Self::emit(rule, emit, matched, &mut outcome),
                Action::Calculation(calc) => Self::calculate(rule, calc, matched, ctx, &mut outcome),
            }
        }

        outcome
    }

    fn emit(rule: &Rule, action: &EmitAction, matched: &[&BuildingObject], outcome: &mut ActionOutcome) {
        for obj in matched {
            let violation = ValidationViolation::for_object(
                rule,
                obj,
                action.severity,
                render_message(&action.message, rule, obj),
                action.code_reference.clone(),
            );
            match action.severity {
                Severity::Error => outcome.violations.push(violation),
                Severity::Warning | Severity::Info => outcome.warnings.push(violation),
            }
        }
    }

    fn calculate(
        rule: &Rule,
        action: &CalculationAction,
        matched: &[&BuildingObject],
        ctx: &EvaluationContext<'_>,
        outcome: &mut ActionOutcome,
    ) {
        let formula_ctx = FormulaContext {
            analyzer: ctx.analyzer,
            model: ctx.model,
            matched,
        };

        let (value, error) = match formula::evaluate(&action.formula, &formula_ctx) {
            Ok(value) => (value, None),
            Err(e) => {
                warn!(rule_id = %rule.id, formula = %action.formula, "计算失败: {}", e);
                outcome.violations.push(ValidationViolation::diagnostic(
                    rule,
                    format!("Calculation '{}' failed: {}", action.name, e),
                ));
                (0.0, Some(e.to_string()))
            }
        };

        outcome.calculations.insert(
            action.name.clone(),
            Calculation {
                name: action.name.clone(),
                formula: action.formula.clone(),
                value,
                unit: action.unit.clone(),
                description: action.description.clone(),
                error,
            },
        );
    }
}

/// 替换消息模板中的占位符
///
/// 支持 `{element_id}`、`{element_type}`、`{rule_id}`、`{rule_name}` 以及对象属性名；
/// 无法解析的占位符原样保留。
pub fn render_message(template: &str, rule: &Rule, obj: &BuildingObject) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let key = &after[..close];
        match placeholder(key, rule, obj) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

fn placeholder(key: &str, rule: &Rule, obj: &BuildingObject) -> Option<String> {
    match key {
        "element_id" => Some(obj.id.clone()),
        "element_type" => Some(obj.object_type.clone()),
        "rule_id" => Some(rule.id.clone()),
        "rule_name" => Some(rule.name.clone()),
        _ => obj.attribute(key).map(|value| match value.as_ref() {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    }
}

/// 单条规则执行器
pub struct RuleExecutor;

impl RuleExecutor {
    /// 执行单条规则
    ///
    /// 条件求值失败（未知操作符、未知条件类型等）时规则标记为失败，动作不执行。
    pub fn execute(rule: &Rule, ctx: &EvaluationContext<'_>) -> ValidationResult {
        let start = Instant::now();

        let result = match ConditionEvaluator::evaluate_all(&rule.conditions, ctx) {
            Ok(matched) => {
                debug!(rule_id = %rule.id, matched = matched.len(), "条件评估完成");
                let outcome = ActionExecutor::execute(rule, &matched, ctx);
                ValidationResult::new(rule, outcome.violations, outcome.warnings, outcome.calculations)
            }
            Err(e) => {
                warn!(rule_id = %rule.id, error_code = e.code(), "规则评估失败: {}", e);
                ValidationResult::failed(rule, e.to_string())
            }
        };

        let elapsed = start.elapsed();
        let outcome = match (&result.error, result.passed) {
            (Some(_), _) => "error",
            (None, true) => "passed",
            (None, false) => "failed",
        };
        record_rule_evaluation(
            &rule.category,
            outcome,
            elapsed.as_secs_f64(),
        );

        result.with_execution_time(elapsed.as_secs_f64() * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::{BuildingModel, Location};
    use crate::compiler::RuleSetCompiler;
    use crate::config::SpatialSettings;
    use crate::models::RuleSet;
    use crate::spatial::SpatialAnalyzer;
    use serde_json::json;

    fn rule_set(rules: Value) -> RuleSet {
        let doc = json!({
            "id": "test",
            "name": "Test",
            "jurisdiction": {"country": "US"},
            "rules": rules
        });
        RuleSetCompiler::new()
            .compile_from_json(&doc.to_string(), "inline")
            .unwrap()
    }

    fn run(rule: &Rule, model: &BuildingModel) -> ValidationResult {
        let analyzer = SpatialAnalyzer::new(SpatialSettings::default());
        let index = analyzer.build_index(&model.objects);
        let ctx = EvaluationContext {
            model,
            index: &index,
            analyzer: &analyzer,
        };
        RuleExecutor::execute(rule, &ctx)
    }

    fn room(id: &str, width: f64, depth: f64) -> BuildingObject {
        BuildingObject::new(id, "room")
            .with_location(Location::new(0.0, 0.0, 0.0).with_size(width, depth, 3.0))
    }

    #[test]
    fn test_narrow_door_yields_single_violation() {
        let rules = rule_set(json!([{
            "rule_id": "door_width",
            "name": "Door width",
            "category": "accessibility",
            "conditions": [{"type": "property", "element_type": "door",
                            "property": "width", "operator": "<", "value": 0.8}],
            "actions": [{"type": "validation", "severity": "error",
                         "message": "Door {element_id} is {width}m wide",
                         "code_reference": "ADA 404.2.3"}]
        }]));
        let model = BuildingModel::new(
            "b1",
            "Office",
            vec![
                BuildingObject::new("door_1", "door").with_property("width", 0.7),
                BuildingObject::new("door_2", "door").with_property("width", 0.9),
            ],
        );

        let result = run(&rules.rules[0], &model);
        assert!(!result.passed);
        assert_eq!(result.violations.len(), 1);
        let violation = &result.violations[0];
        assert_eq!(violation.element_id.as_deref(), Some("door_1"));
        assert_eq!(violation.message, "Door door_1 is 0.7m wide");
        assert_eq!(violation.code_reference.as_deref(), Some("ADA 404.2.3"));
        assert_eq!(violation.category, "accessibility");
    }

    #[test]
    fn test_warning_action_does_not_fail_rule() {
        let rules = rule_set(json!([{
            "rule_id": "old_extinguisher",
            "name": "Extinguisher age",
            "conditions": [{"type": "property", "element_type": "extinguisher",
                            "property": "age", "operator": ">", "value": 10}],
            "actions": [{"type": "warning", "message": "{element_type} {element_id} is old"}]
        }]));
        let model = BuildingModel::new(
            "b1",
            "Office",
            vec![BuildingObject::new("x1", "extinguisher").with_property("age", 12)],
        );

        let result = run(&rules.rules[0], &model);
        assert!(result.passed);
        assert!(result.violations.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].severity, Severity::Warning);
        assert_eq!(result.warnings[0].message, "extinguisher x1 is old");
    }

    #[test]
    fn test_calculation_total_area_halved() {
        let rules = rule_set(json!([{
            "rule_id": "half_area",
            "name": "Half area",
            "conditions": [{"type": "property", "property": "type", "operator": "==", "value": "room"}],
            "actions": [{"type": "calculation", "name": "half", "formula": "total_area(room) / 2",
                         "unit": "m2"}]
        }]));
        let model = BuildingModel::new(
            "b1",
            "Office",
            vec![room("r1", 8.0, 5.0), room("r2", 10.0, 6.0)],
        );

        let result = run(&rules.rules[0], &model);
        assert!(result.passed);
        let calc = &result.calculations["half"];
        assert_eq!(calc.value, 50.0);
        assert_eq!(calc.unit.as_deref(), Some("m2"));
        assert!(calc.error.is_none());
    }

    #[test]
    fn test_failed_calculation_does_not_abort_remaining_actions() {
        let rules = rule_set(json!([{
            "rule_id": "calc",
            "name": "Calc",
            "category": "structural",
            "conditions": [{"type": "property", "property": "type", "operator": "==", "value": "room"}],
            "actions": [
                {"type": "calculation", "name": "broken", "formula": "total_area(room) / 0"},
                {"type": "calculation", "name": "rooms", "formula": "count(room)"},
                {"type": "warning", "message": "checked {element_id}"}
            ]
        }]));
        let model = BuildingModel::new("b1", "Office", vec![room("r1", 4.0, 4.0)]);

        let result = run(&rules.rules[0], &model);
        assert!(!result.passed);
        assert_eq!(result.calculations["broken"].value, 0.0);
        assert!(result.calculations["broken"].error.is_some());
        assert_eq!(result.calculations["rooms"].value, 1.0);
        assert_eq!(result.violations.len(), 1);
        assert!(result.violations[0].element_id.is_none());
        assert!(result.violations[0].message.starts_with("Calculation 'broken' failed"));
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_unknown_operator_fails_rule_without_actions() {
        let rules = rule_set(json!([{
            "rule_id": "bad_op",
            "name": "Bad operator",
            "conditions": [{"type": "property", "property": "width", "operator": "approx", "value": 1}],
            "actions": [{"type": "error", "message": "never emitted"}]
        }]));
        let model = BuildingModel::new(
            "b1",
            "Office",
            vec![BuildingObject::new("d1", "door").with_property("width", 1)],
        );

        let result = run(&rules.rules[0], &model);
        assert!(!result.passed);
        assert!(result.error.is_some());
        assert_eq!(result.violations.len(), 1);
        assert!(result.violations[0].message.starts_with("Rule evaluation failed"));
    }

    #[test]
    fn test_no_matches_passes_with_empty_results() {
        let rules = rule_set(json!([{
            "rule_id": "none",
            "name": "No matches",
            "conditions": [{"type": "property", "element_type": "elevator",
                            "property": "capacity", "operator": "<", "value": 600}],
            "actions": [{"type": "error", "message": "Elevator {element_id} too small"}]
        }]));
        let model = BuildingModel::new("b1", "Office", vec![room("r1", 4.0, 4.0)]);

        let result = run(&rules.rules[0], &model);
        assert!(result.passed);
        assert!(result.violations.is_empty());
        assert!(result.warnings.is_empty());
        assert!(result.execution_time_ms >= 0.0);
    }

    #[test]
    fn test_render_message_keeps_unknown_placeholders() {
        let rules = rule_set(json!([{
            "rule_id": "r",
            "name": "Render",
            "conditions": [{"type": "system", "value": "hvac"}],
            "actions": [{"type": "warning", "message": "x"}]
        }]));
        let obj = BuildingObject::new("ahu_1", "hvac_unit").with_property("capacity", 12.5);
        let rule = &rules.rules[0];

        assert_eq!(
            render_message("{rule_id}/{rule_name}: {element_type} {capacity} {missing} {", rule, &obj),
            "r/Render: hvac_unit 12.5 {missing} {"
        );
    }
}

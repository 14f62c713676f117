//! 校验结果与合规报告

use crate::building::{BuildingModel, BuildingObject, Location};
use crate::models::{Jurisdiction, Rule, RuleSet, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 单条违规（创建后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule_id: String,
    pub rule_name: String,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationViolation {
    /// 针对某个对象的违规
    pub fn for_object(
        rule: &Rule,
        object: &BuildingObject,
        severity: Severity,
        message: String,
        code_reference: Option<String>,
    ) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            category: rule.category.clone(),
            severity,
            message,
            code_reference,
            element_id: Some(object.id.clone()),
            element_type: Some(object.object_type.clone()),
            location: object.location,
            timestamp: Utc::now(),
        }
    }

    /// 规则求值失败时的诊断违规，不关联具体对象
    pub fn diagnostic(rule: &Rule, message: String) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            category: rule.category.clone(),
            severity: Severity::Error,
            message,
            code_reference: None,
            element_id: None,
            element_type: None,
            location: None,
            timestamp: Utc::now(),
        }
    }
}

/// 公式计算结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub name: String,
    pub formula: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 计算失败时的错误描述，此时 value 为 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 单条规则的校验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub rule_id: String,
    pub rule_name: String,
    pub category: String,
    /// 当且仅当不含 error 级别违规时为 true
    pub passed: bool,
    pub violations: Vec<ValidationViolation>,
    pub warnings: Vec<ValidationViolation>,
    pub calculations: BTreeMap<String, Calculation>,
    pub execution_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn new(
        rule: &Rule,
        violations: Vec<ValidationViolation>,
        warnings: Vec<ValidationViolation>,
        calculations: BTreeMap<String, Calculation>,
    ) -> Self {
        let passed = !violations.iter().any(|v| v.severity == Severity::Error);
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            category: rule.category.clone(),
            passed,
            violations,
            warnings,
            calculations,
            execution_time_ms: 0.0,
            error: None,
        }
    }

    /// 规则无法求值：标记失败并附带一条诊断违规
    pub fn failed(rule: &Rule, error: String) -> Self {
        let diagnostic = ValidationViolation::diagnostic(
            rule,
            format!("Rule evaluation failed: {}", error),
        );
        let mut result = Self::new(rule, vec![diagnostic], Vec::new(), BTreeMap::new());
        result.error = Some(error);
        result
    }

    pub fn with_execution_time(mut self, elapsed_ms: f64) -> Self {
        self.execution_time_ms = elapsed_ms;
        self
    }
}

/// 单个规则集的校验报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetReport {
    pub rule_set_id: String,
    pub rule_set_name: String,
    pub jurisdiction: Jurisdiction,
    pub source: String,
    pub validation_date: DateTime<Utc>,
    /// 仅统计启用的规则
    pub total_rules: usize,
    pub passed_rules: usize,
    pub failed_rules: usize,
    pub total_violations: usize,
    pub total_warnings: usize,
    /// 按规则声明顺序排列
    pub results: Vec<ValidationResult>,
}

impl RuleSetReport {
    pub fn from_results(rule_set: &RuleSet, results: Vec<ValidationResult>) -> Self {
        let passed_rules = results.iter().filter(|r| r.passed).count();
        Self {
            rule_set_id: rule_set.id.clone(),
            rule_set_name: rule_set.name.clone(),
            jurisdiction: rule_set.jurisdiction.clone(),
            source: rule_set.source.clone(),
            validation_date: Utc::now(),
            total_rules: results.len(),
            passed_rules,
            failed_rules: results.len() - passed_rules,
            total_violations: results.iter().map(|r| r.violations.len()).sum(),
            total_warnings: results.iter().map(|r| r.warnings.len()).sum(),
            results,
        }
    }
}

/// 加载失败被跳过的规则集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRuleSet {
    pub source: String,
    pub code: String,
    pub reason: String,
}

/// 合规报告（多个规则集的汇总）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub building_id: String,
    pub building_name: String,
    pub rule_set_reports: Vec<RuleSetReport>,
    /// passed_rules / total_rules，取值 [0, 1]；没有规则时为 1.0
    pub overall_compliance_score: f64,
    pub total_rules: usize,
    pub passed_rules: usize,
    pub critical_violations: usize,
    pub total_violations: usize,
    pub total_warnings: usize,
    /// 推荐建议只依据违规数，警告单独统计
    pub violations_by_category: BTreeMap<String, usize>,
    pub warnings_by_category: BTreeMap<String, usize>,
    pub recommendations: Vec<String>,
    pub skipped_rule_sets: Vec<SkippedRuleSet>,
    pub cancelled: bool,
    pub generated_at: DateTime<Utc>,
}

impl ComplianceReport {
    pub fn aggregate(
        model: &BuildingModel,
        rule_set_reports: Vec<RuleSetReport>,
        skipped_rule_sets: Vec<SkippedRuleSet>,
        cancelled: bool,
    ) -> Self {
        let total_rules: usize = rule_set_reports.iter().map(|r| r.total_rules).sum();
        let passed_rules: usize = rule_set_reports.iter().map(|r| r.passed_rules).sum();
        let total_violations = rule_set_reports.iter().map(|r| r.total_violations).sum();
        let total_warnings = rule_set_reports.iter().map(|r| r.total_warnings).sum();

        let mut critical_violations = 0;
        let mut violations_by_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut warnings_by_category: BTreeMap<String, usize> = BTreeMap::new();
        for result in rule_set_reports.iter().flat_map(|r| &r.results) {
            critical_violations += result
                .violations
                .iter()
                .filter(|v| v.severity == Severity::Error)
                .count();
            for v in &result.violations {
                *violations_by_category.entry(v.category.clone()).or_default() += 1;
            }
            for w in &result.warnings {
                *warnings_by_category.entry(w.category.clone()).or_default() += 1;
            }
        }

        let recommendations = recommendations(&violations_by_category, &skipped_rule_sets);

        Self {
            building_id: model.id.clone(),
            building_name: model.name.clone(),
            rule_set_reports,
            overall_compliance_score: compliance_score(passed_rules, total_rules),
            total_rules,
            passed_rules,
            critical_violations,
            total_violations,
            total_warnings,
            violations_by_category,
            warnings_by_category,
            recommendations,
            skipped_rule_sets,
            cancelled,
            generated_at: Utc::now(),
        }
    }

    /// 清除时间戳和耗时，便于比较两次运行的报告内容
    pub fn without_timing(&self) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let mut report = self.clone();
        report.generated_at = epoch;
        for rs in &mut report.rule_set_reports {
            rs.validation_date = epoch;
            for result in &mut rs.results {
                result.execution_time_ms = 0.0;
                for v in result.violations.iter_mut().chain(result.warnings.iter_mut()) {
                    v.timestamp = epoch;
                }
            }
        }
        report
    }
}

/// 合规得分：没有规则时视为完全合规
pub fn compliance_score(passed_rules: usize, total_rules: usize) -> f64 {
    if total_rules == 0 {
        1.0
    } else {
        passed_rules as f64 / total_rules as f64
    }
}

/// 按违规数量（降序）和类别名生成建议
pub fn recommendations(
    by_category: &BTreeMap<String, usize>,
    skipped: &[SkippedRuleSet],
) -> Vec<String> {
    let mut ranked: Vec<(&String, &usize)> = by_category.iter().filter(|(_, n)| **n > 0).collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    let mut out: Vec<String> = ranked
        .into_iter()
        .map(|(category, &count)| {
            if count > 5 {
                format!(
                    "High number of {} violations ({}). Consider comprehensive review.",
                    category, count
                )
            } else {
                format!(
                    "Address {} {} violations to improve compliance.",
                    count, category
                )
            }
        })
        .collect();

    if out.is_empty() {
        out.push("Building design appears to meet most code requirements.".to_string());
    }

    for s in skipped {
        out.push(format!(
            "Rule set '{}' was excluded from this report: {}",
            s.source, s.reason
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_score_sentinel_when_no_rules() {
        assert_eq!(compliance_score(0, 0), 1.0);
        assert_eq!(compliance_score(3, 4), 0.75);
    }

    #[test]
    fn test_recommendations_ranked_by_count() {
        let recs = recommendations(
            &counts(&[("electrical", 2), ("fire_safety", 7), ("accessibility", 2)]),
            &[],
        );
        assert_eq!(
            recs,
            vec![
                "High number of fire_safety violations (7). Consider comprehensive review.",
                "Address 2 accessibility violations to improve compliance.",
                "Address 2 electrical violations to improve compliance.",
            ]
        );
    }

    #[test]
    fn test_recommendations_when_clean() {
        let recs = recommendations(&BTreeMap::new(), &[]);
        assert_eq!(
            recs,
            vec!["Building design appears to meet most code requirements."]
        );
    }

    #[test]
    fn test_recommendations_note_skipped_rule_sets() {
        let skipped = vec![SkippedRuleSet {
            source: "rules/missing.json".to_string(),
            code: "NOT_FOUND".to_string(),
            reason: "not found".to_string(),
        }];
        let recs = recommendations(&BTreeMap::new(), &skipped);
        assert_eq!(recs.len(), 2);
        assert!(recs[1].contains("rules/missing.json"));
    }
}

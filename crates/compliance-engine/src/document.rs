//! 规则定义文档
//!
//! 与 JSON 文件一一对应的宽松结构：字段全部可选，缺失项在编译阶段
//! 作为缺陷报告，而不是在反序列化时直接失败。

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSetDocument {
    #[serde(alias = "mcp_id")]
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub jurisdiction: Option<JurisdictionDocument>,
    pub rules: Vec<RuleDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JurisdictionDocument {
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDocument {
    pub rule_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
    pub conditions: Vec<ConditionDocument>,
    pub actions: Vec<ActionDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionDocument {
    #[serde(rename = "type")]
    pub condition_type: Option<String>,
    pub element_type: Option<String>,
    pub property: Option<String>,
    pub operator: Option<String>,
    pub value: Option<Value>,
    pub target_type: Option<String>,
    pub relationship: Option<String>,
    pub composite_operator: Option<String>,
    pub conditions: Vec<ConditionDocument>,
    pub temporal_params: Option<Value>,
    pub dynamic_params: Option<Value>,
    pub statistical_params: Option<Value>,
    pub pattern_params: Option<Value>,
    pub range_params: Option<Value>,
    pub logical_params: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionDocument {
    #[serde(rename = "type")]
    pub action_type: Option<String>,
    pub name: Option<String>,
    pub message: Option<String>,
    pub severity: Option<String>,
    pub code_reference: Option<String>,
    pub formula: Option<String>,
    pub unit: Option<String>,
    pub description: Option<String>,
}

/// 将空字符串视为缺失
pub(crate) fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mcp_id_alias() {
        let doc: RuleSetDocument = serde_json::from_value(json!({
            "mcp_id": "ibc-2021",
            "name": "IBC",
            "jurisdiction": {"country": "US"},
            "rules": []
        }))
        .unwrap();
        assert_eq!(doc.id.as_deref(), Some("ibc-2021"));
    }

    #[test]
    fn test_missing_fields_deserialize() {
        let doc: RuleSetDocument = serde_json::from_value(json!({
            "rules": [{"conditions": [{"type": "property"}]}]
        }))
        .unwrap();
        assert!(doc.jurisdiction.is_none());
        assert_eq!(doc.rules[0].conditions[0].condition_type.as_deref(), Some("property"));
        assert!(doc.rules[0].actions.is_empty());
    }

    #[test]
    fn test_present_treats_blank_as_missing() {
        assert_eq!(present(&Some("  ".to_string())), None);
        assert_eq!(present(&Some("door".to_string())), Some("door"));
        assert_eq!(present(&None), None);
    }
}

//! 比较操作符
//!
//! 规则文档中的操作符使用符号形式（`==`、`>=`、`not_in` 等），
//! 加载时解析为 [`Operator`]，并与期望值一起编译为 [`Comparison`]。

use crate::error::{EngineError, Result};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// 条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    // 通用比较
    Eq,
    Neq,

    // 数值比较
    Gt,
    Gte,
    Lt,
    Lte,

    // 包含检查
    In,
    NotIn,
    Contains,

    // 字符串操作
    StartsWith,
    EndsWith,
    Regex,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Regex => "regex",
        }
    }
}

impl FromStr for Operator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let op = match s.trim() {
            "==" | "eq" => Self::Eq,
            "!=" | "neq" => Self::Neq,
            ">" | "gt" => Self::Gt,
            ">=" | "gte" => Self::Gte,
            "<" | "lt" => Self::Lt,
            "<=" | "lte" => Self::Lte,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "contains" => Self::Contains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "regex" => Self::Regex,
            other => return Err(EngineError::unknown("操作符", other)),
        };
        Ok(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// 编译后的比较：操作符 + 期望值（regex 在加载时预编译）
#[derive(Debug, Clone)]
pub struct Comparison {
    pub operator: Operator,
    pub expected: Value,
    regex: Option<Regex>,
}

impl Comparison {
    /// 构建比较，返回值中的错误是面向规则作者的缺陷描述
    pub fn new(operator: Operator, expected: Value) -> std::result::Result<Self, String> {
        let regex = match operator {
            Operator::Regex => {
                let pattern = expected
                    .as_str()
                    .ok_or_else(|| "regex operator requires a string pattern".to_string())?;
                let compiled = Regex::new(pattern)
                    .map_err(|e| format!("Invalid regular expression '{}': {}", pattern, e))?;
                Some(compiled)
            }
            _ => None,
        };

        Ok(Self {
            operator,
            expected,
            regex,
        })
    }

    /// 数值阈值比较的便捷构造，不会失败
    pub fn numeric(operator: Operator, threshold: f64) -> Self {
        Self {
            operator,
            expected: Value::from(threshold),
            regex: None,
        }
    }

    /// 评估实际值是否满足比较
    pub fn matches(&self, actual: &Value) -> Result<bool> {
        let expected = &self.expected;
        match self.operator {
            Operator::Eq => Ok(values_equal(actual, expected)),
            Operator::Neq => Ok(!values_equal(actual, expected)),
            Operator::Gt => compare(actual, expected, |a, b| a > b),
            Operator::Gte => compare(actual, expected, |a, b| a >= b),
            Operator::Lt => compare(actual, expected, |a, b| a < b),
            Operator::Lte => compare(actual, expected, |a, b| a <= b),
            Operator::In => in_list(actual, expected),
            Operator::NotIn => in_list(actual, expected).map(|r| !r),
            Operator::Contains => contains(actual, expected),
            Operator::StartsWith => {
                let (s, prefix) = string_pair(actual, expected)?;
                Ok(s.starts_with(prefix))
            }
            Operator::EndsWith => {
                let (s, suffix) = string_pair(actual, expected)?;
                Ok(s.ends_with(suffix))
            }
            Operator::Regex => {
                let s = actual.as_str().ok_or_else(|| mismatch("string", actual))?;
                Ok(self.regex.as_ref().is_some_and(|re| re.is_match(s)))
            }
        }
    }

    /// 数值比较的便捷入口（空间度量、统计值等）
    pub fn matches_number(&self, actual: f64) -> Result<bool> {
        self.matches(&Value::from(actual))
    }
}

/// 相等比较
///
/// 至少一侧是 JSON 数字时按浮点数比较，避免 100 与 100.0 不相等；
/// 两个字符串始终按原文比较（"007" 与 "7" 不相等）。
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    let numeric = actual.is_number() || expected.is_number();
    match (numeric, as_f64(actual), as_f64(expected)) {
        (true, Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => actual == expected,
    }
}

fn compare<F>(actual: &Value, expected: &Value, cmp: F) -> Result<bool>
where
    F: Fn(f64, f64) -> bool,
{
    let a = as_f64(actual).ok_or_else(|| mismatch("number", actual))?;
    let b = as_f64(expected).ok_or_else(|| mismatch("number", expected))?;
    Ok(cmp(a, b))
}

fn in_list(actual: &Value, expected: &Value) -> Result<bool> {
    let items = expected.as_array().ok_or_else(|| mismatch("array", expected))?;
    Ok(items.iter().any(|item| values_equal(actual, item)))
}

fn contains(actual: &Value, expected: &Value) -> Result<bool> {
    match actual {
        Value::String(s) => {
            let needle = expected.as_str().ok_or_else(|| mismatch("string", expected))?;
            Ok(s.contains(needle))
        }
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, expected))),
        _ => Err(mismatch("string or array", actual)),
    }
}

fn string_pair<'a>(actual: &'a Value, expected: &'a Value) -> Result<(&'a str, &'a str)> {
    let s = actual.as_str().ok_or_else(|| mismatch("string", actual))?;
    let other = expected.as_str().ok_or_else(|| mismatch("string", expected))?;
    Ok((s, other))
}

fn mismatch(expected: &str, actual: &Value) -> EngineError {
    EngineError::TypeMismatch {
        expected: expected.to_string(),
        actual: type_name(actual).to_string(),
    }
}

/// 尝试将 Value 转换为 f64（数字或数字字符串）
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 获取值的类型名称
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(op: &str, actual: Value, expected: Value) -> bool {
        let operator: Operator = op.parse().unwrap();
        Comparison::new(operator, expected)
            .unwrap()
            .matches(&actual)
            .unwrap()
    }

    #[test]
    fn test_parse_symbols() {
        assert_eq!(">=".parse::<Operator>().unwrap(), Operator::Gte);
        assert_eq!("not_in".parse::<Operator>().unwrap(), Operator::NotIn);
        assert_eq!("eq".parse::<Operator>().unwrap(), Operator::Eq);
        assert_eq!(Operator::Neq.to_string(), "!=");

        let err = "~=".parse::<Operator>().unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_OPERATOR");
    }

    #[test]
    fn test_eq_numbers() {
        assert!(check("==", json!(100), json!(100.0)));
        assert!(check("!=", json!(0.7), json!(0.8)));
        assert!(check("==", json!("0.8"), json!(0.8)));
    }

    #[test]
    fn test_eq_strings() {
        assert!(check("==", json!("storage"), json!("storage")));
        assert!(!check("==", json!("storage"), json!("office")));
    }

    #[test]
    fn test_eq_numeric_looking_strings_compare_verbatim() {
        assert!(!check("==", json!("007"), json!("7")));
        assert!(!check("==", json!("1e3"), json!("1000")));
        assert!(check("!=", json!("007"), json!("7")));
        assert!(!check("in", json!("007"), json!(["7", "8"])));
        // 一侧为数字时仍然按数值比较
        assert!(check("==", json!(1000), json!("1e3")));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(check(">", json!(60), json!(50)));
        assert!(check(">=", json!(0.8), json!(0.8)));
        assert!(check("<", json!(0.7), json!(0.8)));
        assert!(check("<=", json!(10), json!(10)));
    }

    #[test]
    fn test_numeric_comparison_type_mismatch() {
        let cmp = Comparison::new(Operator::Gt, json!(5)).unwrap();
        let err = cmp.matches(&json!("wide")).unwrap_err();
        assert_eq!(err.code(), "TYPE_MISMATCH");
    }

    #[test]
    fn test_in_list() {
        assert!(check("in", json!("copper"), json!(["copper", "aluminum"])));
        assert!(check("not_in", json!("pvc"), json!(["copper", "aluminum"])));
    }

    #[test]
    fn test_contains() {
        assert!(check("contains", json!("fire rated door"), json!("rated")));
        assert!(check("contains", json!(["exit", "egress"]), json!("egress")));
    }

    #[test]
    fn test_prefix_suffix() {
        assert!(check("starts_with", json!("EXIT-01"), json!("EXIT")));
        assert!(check("ends_with", json!("panel.main"), json!(".main")));
    }

    #[test]
    fn test_regex() {
        assert!(check("regex", json!("R-101"), json!(r"^R-\d+$")));
        assert!(!check("regex", json!("corridor"), json!(r"^R-\d+$")));
    }

    #[test]
    fn test_invalid_regex_is_defect() {
        let err = Comparison::new(Operator::Regex, json!("([a-z")).unwrap_err();
        assert!(err.starts_with("Invalid regular expression"));

        let err = Comparison::new(Operator::Regex, json!(42)).unwrap_err();
        assert_eq!(err, "regex operator requires a string pattern");
    }

    #[test]
    fn test_matches_number() {
        let cmp = Comparison::numeric(Operator::Gt, 50.0);
        assert!(cmp.matches_number(60.0).unwrap());
        assert!(!cmp.matches_number(10.0).unwrap());
    }
}

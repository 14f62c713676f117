//! 合规引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("规则文件不存在: {0}")]
    NotFound(String),

    #[error("规则集格式错误: {source_id} ({} 处缺陷): {}", defects.len(), defects.join("; "))]
    MalformedRuleSet {
        source_id: String,
        defects: Vec<String>,
    },

    #[error("公式计算失败: {0}")]
    Formula(#[from] FormulaError),

    #[error("未知的{kind}: {name}")]
    UnknownOperator { kind: String, name: String },

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("未知的条件类型: {0}")]
    UnknownConditionType(String),

    #[error("对象缺少位置信息: {0}")]
    MissingLocation(String),

    #[error("建筑模型无效: {0}")]
    InvalidModel(String),

    #[error("工作线程池创建失败: {0}")]
    WorkerPool(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn unknown(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnknownOperator {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::MalformedRuleSet { .. } => "MALFORMED_RULE_SET",
            Self::Formula(_) => "FORMULA_ERROR",
            Self::UnknownOperator { .. } => "UNKNOWN_OPERATOR",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::UnknownConditionType(_) => "UNKNOWN_CONDITION_TYPE",
            Self::MissingLocation(_) => "MISSING_LOCATION",
            Self::InvalidModel(_) => "INVALID_MODEL",
            Self::WorkerPool(_) => "WORKER_POOL",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// 是否可在编排层恢复（跳过规则集或将单条规则标记为失败后继续）
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidModel(_) | Self::WorkerPool(_))
    }
}

/// 公式求值错误
///
/// 公式只会因语法、函数表或算术问题失败，不会抛出与宿主相关的异常。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("语法错误（位置 {position}）: {message}")]
    Syntax { position: usize, message: String },

    #[error("公式意外结束")]
    UnexpectedEnd,

    #[error("未知函数: {0}")]
    UnknownFunction(String),

    #[error("函数 {function} 参数个数不匹配: 期望 {expected}, 实际 {found}")]
    Arity {
        function: String,
        expected: String,
        found: usize,
    },

    #[error("函数 {function} 参数无效: {message}")]
    InvalidArgument { function: String, message: String },

    #[error("除数为零")]
    DivisionByZero,

    #[error("计算结果不是有限数值")]
    NonFinite,
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = EngineError::NotFound("rules/fire.json".to_string());
        assert_eq!(err.code(), "NOT_FOUND");

        let err = EngineError::unknown("操作符", "~=");
        assert_eq!(err.code(), "UNKNOWN_OPERATOR");
        assert_eq!(err.to_string(), "未知的操作符: ~=");
    }

    #[test]
    fn test_malformed_message_lists_defects() {
        let err = EngineError::MalformedRuleSet {
            source_id: "fire.json".to_string(),
            defects: vec![
                "Missing id".to_string(),
                "Missing jurisdiction country".to_string(),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("2 处缺陷"));
        assert!(message.contains("Missing jurisdiction country"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(EngineError::Formula(FormulaError::DivisionByZero).is_recoverable());
        assert!(EngineError::NotFound("x".to_string()).is_recoverable());
        assert!(!EngineError::InvalidModel("empty id".to_string()).is_recoverable());
    }
}

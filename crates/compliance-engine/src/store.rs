//! 规则集存储
//!
//! 使用 DashMap 按来源缓存已编译的规则集。同一来源第二次加载直接返回缓存的
//! 不可变值，不会重新解析；缓存只能通过 [`RuleStore::clear`] 显式失效。

use crate::compiler::RuleSetCompiler;
use crate::document::RuleSetDocument;
use crate::error::{EngineError, Result};
use crate::models::RuleSet;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 规则集存储
#[derive(Clone, Default)]
pub struct RuleStore {
    /// 来源 → 已编译规则集
    rule_sets: Arc<DashMap<String, Arc<RuleSet>>>,
    compiler: RuleSetCompiler,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rule_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_sets.is_empty()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.rule_sets.contains_key(source)
    }

    /// 从文件加载规则集（按路径缓存）
    #[instrument(skip(self), fields(path = %path.as_ref().display()))]
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<RuleSet>> {
        let path = path.as_ref();
        let source = path.display().to_string();

        if let Some(cached) = self.rule_sets.get(&source) {
            debug!("命中规则集缓存: {}", source);
            return Ok(Arc::clone(cached.value()));
        }

        let content = read_source(path)?;
        self.compile_and_cache(&source, &content)
    }

    /// 从 JSON 字符串加载规则集，`source` 作为缓存键与报告中的来源标识
    #[instrument(skip(self, json))]
    pub fn load_from_str(&self, source: &str, json: &str) -> Result<Arc<RuleSet>> {
        if let Some(cached) = self.rule_sets.get(source) {
            debug!("命中规则集缓存: {}", source);
            return Ok(Arc::clone(cached.value()));
        }

        self.compile_and_cache(source, json)
    }

    fn compile_and_cache(&self, source: &str, json: &str) -> Result<Arc<RuleSet>> {
        let rule_set = match self.compiler.compile_from_json(json, source) {
            Ok(rule_set) => Arc::new(rule_set),
            Err(e) => {
                warn!(error_code = e.code(), "规则集加载失败: {}", e);
                return Err(e);
            }
        };

        // 并发加载同一来源时以先写入者为准
        let cached = self
            .rule_sets
            .entry(source.to_string())
            .or_insert(rule_set)
            .value()
            .clone();

        info!(
            rule_set = %cached.id,
            rules = cached.rules.len(),
            jurisdiction = %cached.jurisdiction,
            "规则集已加载: {}",
            source
        );
        Ok(cached)
    }

    /// 预检规则文件，返回缺陷列表（为空表示通过），不写入缓存
    #[instrument(skip(self), fields(path = %path.as_ref().display()))]
    pub fn validate(&self, path: impl AsRef<Path>) -> Vec<String> {
        let content = match read_source(path.as_ref()) {
            Ok(content) => content,
            Err(e) => return vec![format!("File loading error: {}", e)],
        };
        self.validate_str(&content)
    }

    /// 预检 JSON 内容
    pub fn validate_str(&self, json: &str) -> Vec<String> {
        match serde_json::from_str::<RuleSetDocument>(json) {
            Ok(doc) => self.compiler.lint(&doc),
            Err(e) => vec![format!("File loading error: {}", e)],
        }
    }

    pub fn get(&self, source: &str) -> Option<Arc<RuleSet>> {
        self.rule_sets.get(source).map(|r| Arc::clone(r.value()))
    }

    /// 已缓存的来源列表（排序后返回）
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.rule_sets.iter().map(|r| r.key().clone()).collect();
        sources.sort();
        sources
    }

    /// 清空缓存，返回被清除的规则集数量
    #[instrument(skip(self))]
    pub fn clear(&self) -> usize {
        let count = self.rule_sets.len();
        self.rule_sets.clear();
        info!("已清空 {} 个规则集", count);
        count
    }

    pub fn stats(&self) -> RuleStoreStats {
        let rule_sets = self.rule_sets.len();
        let (total_rules, enabled_rules) = self.rule_sets.iter().fold((0, 0), |(total, enabled), r| {
            (total + r.rules.len(), enabled + r.enabled_rules().count())
        });

        RuleStoreStats {
            rule_sets,
            total_rules,
            enabled_rules,
            avg_rules_per_set: if rule_sets > 0 {
                total_rules as f64 / rule_sets as f64
            } else {
                0.0
            },
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::NotFound(path.display().to_string()),
        _ => EngineError::Io(e),
    })
}

/// 规则集存储统计
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RuleStoreStats {
    pub rule_sets: usize,
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub avg_rules_per_set: f64,
}

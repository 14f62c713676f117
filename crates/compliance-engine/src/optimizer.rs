//! 性能优化层
//!
//! 负责规则结果缓存与并行执行。规则之间互不依赖，在同一只读模型快照上
//! 并行求值；结果始终按规则声明顺序返回。缓存锁只在单次读写期间持有，
//! 不跨越规则求值。

use arx_shared::observability::metrics::{record_cache_evictions, record_cache_lookup};
use crate::config::{CachePolicy, OptimizationLevel, OptimizerConfig};
use crate::error::{EngineError, Result};
use crate::models::Rule;
use crate::report::{ValidationResult, ValidationViolation};
use parking_lot::{Mutex, RwLock};
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// 结果缓存键：规则集 + 规则（含内容指纹）+ 模型指纹
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub rule_set_id: String,
    pub rule_id: String,
    pub rule_fingerprint: String,
    pub model_fingerprint: String,
}

impl CacheKey {
    pub fn new(rule_set_id: &str, rule: &Rule, model_fingerprint: &str) -> Self {
        Self {
            rule_set_id: rule_set_id.to_string(),
            rule_id: rule.id.clone(),
            rule_fingerprint: rule.fingerprint.clone(),
            model_fingerprint: model_fingerprint.to_string(),
        }
    }

    fn estimated_bytes(&self) -> usize {
        self.rule_set_id.len()
            + self.rule_id.len()
            + self.rule_fingerprint.len()
            + self.model_fingerprint.len()
    }
}

struct CacheEntry {
    result: ValidationResult,
    last_used: u64,
    bytes: usize,
}

/// 按策略淘汰的结果缓存
struct ResultCache {
    policy: CachePolicy,
    entries: HashMap<CacheKey, CacheEntry>,
    tick: u64,
    bytes: usize,
}

impl ResultCache {
    fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            tick: 0,
            bytes: 0,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<ValidationResult> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.result.clone()
        })
    }

    /// 插入结果，返回因超出策略限制而淘汰的条目数
    fn insert(&mut self, key: CacheKey, result: ValidationResult) -> usize {
        self.tick += 1;
        let bytes = key.estimated_bytes() + estimate_result_bytes(&result);
        let entry = CacheEntry {
            result,
            last_used: self.tick,
            bytes,
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.bytes -= old.bytes;
        }
        self.bytes += bytes;

        match self.policy {
            CachePolicy::Lru { capacity } => self.evict_until(capacity, usize::MAX),
            CachePolicy::Adaptive {
                capacity,
                memory_threshold_bytes,
            } => self.evict_until(capacity, memory_threshold_bytes),
        }
    }

    /// 淘汰最久未使用的条目，直到条目数与估算内存都不超过限制
    fn evict_until(&mut self, max_entries: usize, max_bytes: usize) -> usize {
        let mut evicted = 0;
        while !self.entries.is_empty()
            && (self.entries.len() > max_entries || self.bytes > max_bytes)
        {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes -= entry.bytes;
                evicted += 1;
            }
        }
        evicted
    }

    fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.entries.shrink_to_fit();
        self.bytes = 0;
        count
    }
}

fn estimate_violation_bytes(v: &ValidationViolation) -> usize {
    std::mem::size_of::<ValidationViolation>()
        + v.rule_id.len()
        + v.rule_name.len()
        + v.category.len()
        + v.message.len()
        + v.code_reference.as_ref().map_or(0, String::len)
        + v.element_id.as_ref().map_or(0, String::len)
        + v.element_type.as_ref().map_or(0, String::len)
}

/// 估算单条结果占用的内存
fn estimate_result_bytes(result: &ValidationResult) -> usize {
    std::mem::size_of::<ValidationResult>()
        + result.rule_id.len()
        + result.rule_name.len()
        + result.category.len()
        + result.error.as_ref().map_or(0, String::len)
        + result
            .violations
            .iter()
            .chain(result.warnings.iter())
            .map(estimate_violation_bytes)
            .sum::<usize>()
        + result
            .calculations
            .values()
            .map(|c| 64 + c.name.len() * 2 + c.formula.len())
            .sum::<usize>()
}

/// 优化器统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerStats {
    pub level: OptimizationLevel,
    pub cache_policy: &'static str,
    pub workers: usize,
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub hit_rate: f64,
    pub rules_evaluated: u64,
}

/// `optimize_memory` 的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryReport {
    pub entries_before: usize,
    pub entries_after: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// 性能优化器
pub struct PerformanceOptimizer {
    level: RwLock<OptimizationLevel>,
    policy: CachePolicy,
    workers: usize,
    pool: ThreadPool,
    cache: Mutex<ResultCache>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    evaluated: AtomicU64,
}

impl PerformanceOptimizer {
    /// 创建优化器并构建工作线程池
    pub fn new(config: &OptimizerConfig) -> Result<Self> {
        let workers = config.worker_count();
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("compliance-worker-{}", i))
            .build()
            .map_err(|e| EngineError::WorkerPool(format!("创建工作线程池失败: {}", e)))?;

        info!(
            level = ?config.level,
            workers,
            cache_policy = config.cache.name(),
            "性能优化器已创建"
        );

        Ok(Self {
            level: RwLock::new(config.level),
            policy: config.cache,
            workers,
            pool,
            cache: Mutex::new(ResultCache::new(config.cache)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            evaluated: AtomicU64::new(0),
        })
    }

    pub fn level(&self) -> OptimizationLevel {
        *self.level.read()
    }

    pub fn set_optimization_level(&self, level: OptimizationLevel) {
        let previous = std::mem::replace(&mut *self.level.write(), level);
        if previous != level {
            info!(from = ?previous, to = ?level, "优化级别已变更");
        }
    }

    /// 对每条规则执行一次 `eval`（命中缓存时跳过），结果按输入顺序返回
    pub fn run<F>(
        &self,
        rule_set_id: &str,
        rules: &[&Rule],
        model_fingerprint: &str,
        eval: F,
    ) -> Vec<ValidationResult>
    where
        F: Fn(&Rule) -> ValidationResult + Sync,
    {
        let level = self.level();
        let mut results: Vec<Option<ValidationResult>> = vec![None; rules.len()];

        let keys: Vec<CacheKey> = if level.caching() {
            rules
                .iter()
                .map(|rule| CacheKey::new(rule_set_id, rule, model_fingerprint))
                .collect()
        } else {
            Vec::new()
        };

        if level.caching() {
            for (slot, key) in results.iter_mut().zip(&keys) {
                let cached = self.cache.lock().get(key);
                record_cache_lookup(cached.is_some());
                match cached {
                    Some(result) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        *slot = Some(result);
                    }
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        let pending: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i)
            .collect();

        let computed: Vec<(usize, ValidationResult)> = if level.parallel() && pending.len() > 1 {
            debug!(rule_set = rule_set_id, pending = pending.len(), "并行评估规则");
            self.pool.install(|| {
                pending
                    .par_iter()
                    .map(|&i| (i, eval(rules[i])))
                    .collect()
            })
        } else {
            pending.iter().map(|&i| (i, eval(rules[i]))).collect()
        };
        self.evaluated
            .fetch_add(computed.len() as u64, Ordering::Relaxed);

        for (i, result) in computed {
            if level.caching() {
                let evicted = self.cache.lock().insert(keys[i].clone(), result.clone());
                if evicted > 0 {
                    self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                    record_cache_evictions(
                        self.policy.name(),
                        evicted as u64,
                    );
                }
            }
            results[i] = Some(result);
        }

        results.into_iter().flatten().collect()
    }

    /// 清空结果缓存，返回被清除的条目数
    pub fn clear_cache(&self) -> usize {
        let cleared = self.cache.lock().clear();
        info!("已清空 {} 条缓存结果", cleared);
        cleared
    }

    /// 主动回收缓存内存
    ///
    /// 淘汰最久未使用的条目，使条目数降到容量的一半；
    /// 自适应策略同时把估算内存降到阈值的一半。
    pub fn optimize_memory(&self) -> MemoryReport {
        let mut cache = self.cache.lock();
        let entries_before = cache.entries.len();
        let bytes_before = cache.bytes;

        let evicted = match self.policy {
            CachePolicy::Lru { capacity } => cache.evict_until(capacity / 2, usize::MAX),
            CachePolicy::Adaptive {
                capacity,
                memory_threshold_bytes,
            } => cache.evict_until(capacity / 2, memory_threshold_bytes / 2),
        };
        cache.entries.shrink_to_fit();

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            record_cache_evictions(self.policy.name(), evicted as u64);
        }

        let report = MemoryReport {
            entries_before,
            entries_after: cache.entries.len(),
            bytes_before,
            bytes_after: cache.bytes,
        };
        info!(
            evicted,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            "内存优化完成"
        );
        report
    }

    pub fn stats(&self) -> OptimizerStats {
        let (cache_entries, cache_bytes) = {
            let cache = self.cache.lock();
            (cache.entries.len(), cache.bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        OptimizerStats {
            level: self.level(),
            cache_policy: self.policy.name(),
            workers: self.workers,
            cache_entries,
            cache_bytes,
            cache_hits: hits,
            cache_misses: misses,
            cache_evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            rules_evaluated: self.evaluated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("Rule {}", id),
            description: String::new(),
            category: "general".to_string(),
            priority: 1,
            enabled: true,
            conditions: Vec::new(),
            actions: Vec::new(),
            fingerprint: format!("fp-{}", id),
        }
    }

    fn passed(rule: &Rule) -> ValidationResult {
        ValidationResult::new(rule, Vec::new(), Vec::new(), BTreeMap::new())
    }

    fn optimizer(level: OptimizationLevel, cache: CachePolicy) -> PerformanceOptimizer {
        PerformanceOptimizer::new(&OptimizerConfig {
            level,
            max_workers: 4,
            cache,
        })
        .unwrap()
    }

    #[test]
    fn test_results_keep_declaration_order() {
        let opt = optimizer(OptimizationLevel::Advanced, CachePolicy::default());
        let rules: Vec<Rule> = (0..32).map(|i| rule(&format!("r{:02}", i))).collect();
        let refs: Vec<&Rule> = rules.iter().collect();

        let results = opt.run("set", &refs, "model", |r| {
            // 让靠前的规则更晚完成
            let delay = 32 - r.id[1..].parse::<u64>().unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_micros(delay * 50));
            passed(r)
        });

        let ids: Vec<&str> = results.iter().map(|r| r.rule_id.as_str()).collect();
        let expected: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_cache_hits_skip_evaluation() {
        let opt = optimizer(OptimizationLevel::Basic, CachePolicy::default());
        let rules = [rule("a"), rule("b")];
        let refs: Vec<&Rule> = rules.iter().collect();
        let calls = AtomicUsize::new(0);
        let eval = |r: &Rule| {
            calls.fetch_add(1, Ordering::SeqCst);
            passed(r)
        };

        opt.run("set", &refs, "model-1", eval);
        opt.run("set", &refs, "model-1", eval);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // 模型变化后缓存键不同
        opt.run("set", &refs, "model-2", eval);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stats = opt.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 4);
        assert_eq!(stats.cache_entries, 4);
        assert_eq!(stats.rules_evaluated, 4);
    }

    #[test]
    fn test_level_none_never_caches() {
        let opt = optimizer(OptimizationLevel::None, CachePolicy::default());
        let rules = [rule("a")];
        let refs: Vec<&Rule> = rules.iter().collect();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            opt.run("set", &refs, "model", |r| {
                calls.fetch_add(1, Ordering::SeqCst);
                passed(r)
            });
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(opt.stats().cache_entries, 0);
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let opt = optimizer(OptimizationLevel::Basic, CachePolicy::Lru { capacity: 2 });
        let (a, b, c) = (rule("a"), rule("b"), rule("c"));

        opt.run("set", &[&a, &b], "m", passed);
        // 访问 a，使 b 成为最久未使用
        opt.run("set", &[&a], "m", passed);
        opt.run("set", &[&c], "m", passed);

        let calls = AtomicUsize::new(0);
        opt.run("set", &[&a, &c], "m", |r| {
            calls.fetch_add(1, Ordering::SeqCst);
            passed(r)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        opt.run("set", &[&b], "m", |r| {
            calls.fetch_add(1, Ordering::SeqCst);
            passed(r)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(opt.stats().cache_evictions >= 1);
    }

    #[test]
    fn test_adaptive_policy_bounds_memory() {
        let threshold = 4 * estimate_result_bytes(&passed(&rule("x"))) + 4 * 64;
        let opt = optimizer(
            OptimizationLevel::Basic,
            CachePolicy::Adaptive {
                capacity: 1000,
                memory_threshold_bytes: threshold,
            },
        );
        let rules: Vec<Rule> = (0..20).map(|i| rule(&format!("r{}", i))).collect();
        let refs: Vec<&Rule> = rules.iter().collect();

        opt.run("set", &refs, "m", passed);

        let stats = opt.stats();
        assert!(stats.cache_bytes <= threshold);
        assert!(stats.cache_entries < 20);
        assert!(stats.cache_evictions > 0);
    }

    #[test]
    fn test_clear_cache_and_optimize_memory() {
        let opt = optimizer(OptimizationLevel::Basic, CachePolicy::Lru { capacity: 8 });
        let rules: Vec<Rule> = (0..8).map(|i| rule(&format!("r{}", i))).collect();
        let refs: Vec<&Rule> = rules.iter().collect();
        opt.run("set", &refs, "m", passed);

        let report = opt.optimize_memory();
        assert_eq!(report.entries_before, 8);
        assert_eq!(report.entries_after, 4);
        assert!(report.bytes_after < report.bytes_before);

        assert_eq!(opt.clear_cache(), 4);
        assert_eq!(opt.stats().cache_entries, 0);
        assert_eq!(opt.stats().cache_bytes, 0);
    }

    #[test]
    fn test_set_optimization_level() {
        let opt = optimizer(OptimizationLevel::Advanced, CachePolicy::default());
        opt.set_optimization_level(OptimizationLevel::None);
        assert_eq!(opt.level(), OptimizationLevel::None);
        assert_eq!(opt.stats().level, OptimizationLevel::None);
    }
}

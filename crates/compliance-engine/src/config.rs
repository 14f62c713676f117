//! 引擎配置
//!
//! 作为显式值传给 [`crate::ComplianceEngine::new`]；库本身不读取文件或环境变量，
//! 二进制通过 `arx_shared::config::load_section` 加载 `[engine]` 段。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub optimizer: OptimizerConfig,
    pub spatial: SpatialSettings,
}

/// 优化级别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    /// 顺序执行，不使用缓存
    None,
    /// 顺序执行 + 结果缓存
    Basic,
    /// 结果缓存 + 工作线程池
    #[default]
    Advanced,
}

impl OptimizationLevel {
    pub fn caching(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn parallel(&self) -> bool {
        matches!(self, Self::Advanced)
    }
}

/// 结果缓存淘汰策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CachePolicy {
    /// 固定容量，淘汰最久未使用的条目
    Lru { capacity: usize },
    /// 在容量之外，估算内存超过阈值时持续淘汰最久未使用的条目
    Adaptive {
        capacity: usize,
        memory_threshold_bytes: usize,
    },
}

impl CachePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lru { .. } => "lru",
            Self::Adaptive { .. } => "adaptive",
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            Self::Lru { capacity } | Self::Adaptive { capacity, .. } => *capacity,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::Lru { capacity: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub level: OptimizationLevel,
    /// 工作线程数上限，0 表示使用可用 CPU 数
    pub max_workers: usize,
    pub cache: CachePolicy,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            level: OptimizationLevel::default(),
            max_workers: 0,
            cache: CachePolicy::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn worker_count(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

/// 空间分析参数（单位与模型坐标一致）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialSettings {
    /// near 关系的最大包围盒间距
    pub near_distance: f64,
    /// adjacent 关系允许的最大轴向间隙
    pub adjacency_tolerance: f64,
    /// 空间网格单元边长
    pub grid_cell_size: f64,
}

impl Default for SpatialSettings {
    fn default() -> Self {
        Self {
            near_distance: 3.0,
            adjacency_tolerance: 0.1,
            grid_cell_size: 10.0,
        }
    }
}

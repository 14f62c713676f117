//! 空间分析
//!
//! 基于轴对齐包围盒计算面积、体积、距离以及对象间的空间关系，
//! 并提供按网格划分的空间索引用于邻近查询。

use crate::building::BuildingObject;
use crate::config::SpatialSettings;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

/// 空间关系
///
/// Intersects / Adjacent / Near 对称；Contains 与 Above / Below 有方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Intersects,
    Contains,
    Adjacent,
    Near,
    Above,
    Below,
}

impl FromStr for Relation {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "intersects" => Ok(Self::Intersects),
            "contains" => Ok(Self::Contains),
            "adjacent" => Ok(Self::Adjacent),
            "near" => Ok(Self::Near),
            "above" => Ok(Self::Above),
            "below" => Ok(Self::Below),
            other => Err(EngineError::unknown("空间关系", other)),
        }
    }
}

/// 轴对齐包围盒
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    min: [f64; 3],
    max: [f64; 3],
}

impl Bounds {
    fn of(obj: &BuildingObject) -> Option<Self> {
        obj.location.map(|loc| Self {
            min: loc.min(),
            max: loc.max(),
        })
    }

    fn center(&self, axis: usize) -> f64 {
        (self.min[axis] + self.max[axis]) / 2.0
    }

    fn thickness(&self, axis: usize) -> f64 {
        self.max[axis] - self.min[axis]
    }

    /// 某一轴上的重叠：两者都有厚度时要求内部重叠，否则端点接触即可
    fn overlaps_on(&self, other: &Self, axis: usize) -> bool {
        if self.thickness(axis) > 0.0 && other.thickness(axis) > 0.0 {
            self.min[axis] < other.max[axis] && other.min[axis] < self.max[axis]
        } else {
            self.min[axis] <= other.max[axis] && other.min[axis] <= self.max[axis]
        }
    }

    fn touches_on(&self, other: &Self, axis: usize) -> bool {
        self.min[axis] <= other.max[axis] && other.min[axis] <= self.max[axis]
    }

    fn gap_on(&self, other: &Self, axis: usize) -> f64 {
        (self.min[axis] - other.max[axis])
            .max(other.min[axis] - self.max[axis])
            .max(0.0)
    }

    fn intersects(&self, other: &Self) -> bool {
        (0..3).all(|axis| self.overlaps_on(other, axis))
    }

    fn max_gap(&self, other: &Self) -> f64 {
        (0..3).map(|axis| self.gap_on(other, axis)).fold(0.0, f64::max)
    }

    /// 两个包围盒之间的最短距离
    fn separation(&self, other: &Self) -> f64 {
        (0..3)
            .map(|axis| self.gap_on(other, axis).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn encloses(&self, other: &Self) -> bool {
        self != other
            && (0..3).all(|axis| {
                self.min[axis] <= other.min[axis] && other.max[axis] <= self.max[axis]
            })
    }

    fn is_above(&self, other: &Self) -> bool {
        self.min[2] >= other.max[2]
            && self.touches_on(other, 0)
            && self.touches_on(other, 1)
            && self.center(2) > other.center(2)
    }
}

/// 空间分析器
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialAnalyzer {
    settings: SpatialSettings,
}

impl SpatialAnalyzer {
    pub fn new(settings: SpatialSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SpatialSettings {
        &self.settings
    }

    /// 面积：宽 × 深，否则取 `area` 属性，否则为 0
    pub fn area(&self, obj: &BuildingObject) -> f64 {
        if let Some(loc) = obj.location {
            let (w, d) = (loc.width.abs(), loc.depth.abs());
            if w > 0.0 && d > 0.0 {
                return w * d;
            }
        }
        obj.number("area").unwrap_or(0.0)
    }

    /// 体积：宽 × 深 × 高，否则取 `volume` 属性，否则为 0
    pub fn volume(&self, obj: &BuildingObject) -> f64 {
        if let Some(loc) = obj.location {
            let (w, d, h) = (loc.width.abs(), loc.depth.abs(), loc.height.abs());
            if w > 0.0 && d > 0.0 && h > 0.0 {
                return w * d * h;
            }
        }
        obj.number("volume").unwrap_or(0.0)
    }

    /// 高度：位置高度，否则取 `height` 属性
    pub fn height(&self, obj: &BuildingObject) -> Option<f64> {
        obj.location
            .map(|loc| loc.height.abs())
            .filter(|h| *h > 0.0)
            .or_else(|| obj.number("height"))
    }

    pub fn total_area<'a>(&self, objects: impl IntoIterator<Item = &'a BuildingObject>) -> f64 {
        objects.into_iter().map(|o| self.area(o)).sum()
    }

    pub fn total_volume<'a>(&self, objects: impl IntoIterator<Item = &'a BuildingObject>) -> f64 {
        objects.into_iter().map(|o| self.volume(o)).sum()
    }

    /// 包围盒中心间的三维欧氏距离，缺少位置信息时返回错误
    pub fn distance(&self, a: &BuildingObject, b: &BuildingObject) -> Result<f64> {
        let ca = a
            .location
            .ok_or_else(|| EngineError::MissingLocation(a.id.clone()))?
            .center();
        let cb = b
            .location
            .ok_or_else(|| EngineError::MissingLocation(b.id.clone()))?
            .center();
        Ok(ca
            .iter()
            .zip(cb.iter())
            .map(|(p, q)| (p - q).powi(2))
            .sum::<f64>()
            .sqrt())
    }

    /// 计算 a 相对于 b 的全部空间关系；任一方缺少几何信息时为空
    pub fn relations(&self, a: &BuildingObject, b: &BuildingObject) -> BTreeSet<Relation> {
        let mut out = BTreeSet::new();
        let (Some(ba), Some(bb)) = (Bounds::of(a), Bounds::of(b)) else {
            return out;
        };

        let intersects = ba.intersects(&bb);
        if intersects {
            out.insert(Relation::Intersects);
        } else if ba.max_gap(&bb) <= self.settings.adjacency_tolerance {
            out.insert(Relation::Adjacent);
        }
        if ba.separation(&bb) <= self.settings.near_distance {
            out.insert(Relation::Near);
        }
        if ba.encloses(&bb) {
            out.insert(Relation::Contains);
        }
        if ba.is_above(&bb) {
            out.insert(Relation::Above);
        }
        if bb.is_above(&ba) {
            out.insert(Relation::Below);
        }
        out
    }

    pub fn has_relation(&self, a: &BuildingObject, b: &BuildingObject, relation: Relation) -> bool {
        self.relations(a, b).contains(&relation)
    }

    /// 两对象包围盒是否相交；缺少几何信息时为 false
    pub fn intersects(&self, a: &BuildingObject, b: &BuildingObject) -> bool {
        match (Bounds::of(a), Bounds::of(b)) {
            (Some(ba), Some(bb)) => ba.intersects(&bb),
            _ => false,
        }
    }

    /// 为一批对象构建空间索引
    pub fn build_index<'a>(&self, objects: &'a [BuildingObject]) -> SpatialIndex<'a> {
        SpatialIndex::build(objects, self.settings.grid_cell_size)
    }
}

type Cell = (i64, i64);

/// 单个对象最多登记的网格单元数，超出的对象单独存放
const MAX_CELLS_PER_OBJECT: usize = 4096;

/// 闭区间单元范围
#[derive(Debug, Clone, Copy)]
struct CellRange {
    min: Cell,
    max: Cell,
}

impl CellRange {
    fn checked_len(&self) -> Option<usize> {
        let width = self.max.0.checked_sub(self.min.0)?.checked_add(1)?;
        let depth = self.max.1.checked_sub(self.min.1)?.checked_add(1)?;
        usize::try_from(width.checked_mul(depth)?).ok()
    }

    /// 溢出时视为无穷大
    fn len(&self) -> usize {
        self.checked_len().unwrap_or(usize::MAX)
    }

    fn cells(self) -> impl Iterator<Item = Cell> {
        (self.min.0..=self.max.0).flat_map(move |cx| (self.min.1..=self.max.1).map(move |cy| (cx, cy)))
    }
}

/// 网格空间索引
///
/// 按 x/y 平面划分等边网格，每个对象登记到其包围盒覆盖的所有单元；
/// 另维护按类型与按 ID 的查找表。构建后只读，可在线程间共享。
#[derive(Debug)]
pub struct SpatialIndex<'a> {
    objects: &'a [BuildingObject],
    bounds: Vec<Option<Bounds>>,
    cell_size: f64,
    cells: HashMap<Cell, Vec<usize>>,
    /// 包围盒覆盖单元过多的对象，查询时总是作为候选
    oversized: Vec<usize>,
    by_type: HashMap<&'a str, Vec<usize>>,
    by_id: HashMap<&'a str, usize>,
}

impl<'a> SpatialIndex<'a> {
    fn build(objects: &'a [BuildingObject], cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            SpatialSettings::default().grid_cell_size
        };

        let mut index = Self {
            objects,
            bounds: Vec::with_capacity(objects.len()),
            cell_size,
            cells: HashMap::new(),
            oversized: Vec::new(),
            by_type: HashMap::new(),
            by_id: HashMap::with_capacity(objects.len()),
        };

        for (i, obj) in objects.iter().enumerate() {
            let bounds = Bounds::of(obj);
            if let Some(b) = bounds {
                match index.cell_range(&b, 0.0) {
                    Some(range) if range.len() <= MAX_CELLS_PER_OBJECT => {
                        for cell in range.cells() {
                            index.cells.entry(cell).or_default().push(i);
                        }
                    }
                    _ => index.oversized.push(i),
                }
            }
            index.bounds.push(bounds);
            index.by_type.entry(obj.object_type.as_str()).or_default().push(i);
            index.by_id.insert(obj.id.as_str(), i);
        }

        index
    }

    fn cell_of(&self, x: f64, y: f64) -> Cell {
        (
            (x / self.cell_size).floor() as i64,
            (y / self.cell_size).floor() as i64,
        )
    }

    /// 包围盒外扩 `margin` 后覆盖的单元范围；坐标非有限或单元数溢出时返回 None
    fn cell_range(&self, b: &Bounds, margin: f64) -> Option<CellRange> {
        let lo = [b.min[0] - margin, b.min[1] - margin];
        let hi = [b.max[0] + margin, b.max[1] + margin];
        if !lo.iter().chain(&hi).all(|v| v.is_finite()) {
            return None;
        }
        let range = CellRange {
            min: self.cell_of(lo[0], lo[1]),
            max: self.cell_of(hi[0], hi[1]),
        };
        range.checked_len().map(|_| range)
    }

    pub fn objects(&self) -> &'a [BuildingObject] {
        self.objects
    }

    pub fn get(&self, id: &str) -> Option<&'a BuildingObject> {
        self.by_id.get(id).map(|&i| &self.objects[i])
    }

    /// 指定类型的对象（保持模型顺序）；未指定类型时返回全部对象
    pub fn of_type(&self, object_type: Option<&str>) -> Vec<&'a BuildingObject> {
        match object_type {
            None => self.objects.iter().collect(),
            Some(t) => self
                .by_type
                .get(t)
                .map(|ids| ids.iter().map(|&i| &self.objects[i]).collect())
                .unwrap_or_default(),
        }
    }

    /// 包围盒间距不超过 `radius` 的其他对象（保持模型顺序）
    pub fn nearby(&self, obj: &BuildingObject, radius: f64) -> Vec<&'a BuildingObject> {
        let Some(origin) = Bounds::of(obj) else {
            return Vec::new();
        };

        let mut candidates: Vec<usize> = match self.cell_range(&origin, radius) {
            Some(range) if range.len() <= self.cells.len() => {
                let mut ids = self.oversized.clone();
                for cell in range.cells() {
                    if let Some(found) = self.cells.get(&cell) {
                        ids.extend_from_slice(found);
                    }
                }
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            // 查询范围大于已占用单元数（或无法用网格表示）时直接扫描
            _ => (0..self.objects.len()).collect(),
        };

        candidates.retain(|&i| {
            self.objects[i].id != obj.id
                && self.bounds[i].is_some_and(|b| origin.separation(&b) <= radius)
        });
        candidates.into_iter().map(|i| &self.objects[i]).collect()
    }
}

//! 建筑模型
//!
//! 一次校验运行的输入：带类型、位置和属性的对象集合。引擎只读不写。

use crate::error::{EngineError, Result};
use crate::operators::as_f64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

/// 几何包围盒：原点角点 + 三个轴向的尺寸
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub depth: f64,
    #[serde(default)]
    pub height: f64,
}

impl Location {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: f64, depth: f64, height: f64) -> Self {
        self.width = width;
        self.depth = depth;
        self.height = height;
        self
    }

    /// 最小角点（尺寸为负时按绝对值处理）
    pub fn min(&self) -> [f64; 3] {
        [
            self.x.min(self.x + self.width),
            self.y.min(self.y + self.depth),
            self.z.min(self.z + self.height),
        ]
    }

    pub fn max(&self) -> [f64; 3] {
        [
            self.x.max(self.x + self.width),
            self.y.max(self.y + self.depth),
            self.z.max(self.z + self.height),
        ]
    }

    /// 包围盒中心，作为对象的代表点
    pub fn center(&self) -> [f64; 3] {
        [
            self.x + self.width / 2.0,
            self.y + self.depth / 2.0,
            self.z + self.height / 2.0,
        ]
    }
}

/// 建筑对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingObject {
    #[serde(alias = "object_id")]
    pub id: String,
    #[serde(alias = "type")]
    pub object_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub connections: Vec<String>,
}

impl BuildingObject {
    pub fn new(id: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            properties: BTreeMap::new(),
            location: None,
            connections: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_connection(mut self, id: impl Into<String>) -> Self {
        self.connections.push(id.into());
        self
    }

    /// 类型匹配，未指定类型时匹配所有对象
    pub fn is_type(&self, element_type: Option<&str>) -> bool {
        element_type.is_none_or(|t| self.object_type == t)
    }

    /// 读取属性
    ///
    /// 属性表优先；`id`、`type`/`object_type` 作为内置属性兜底。
    /// 值为 null 的属性视为缺失。
    pub fn attribute(&self, name: &str) -> Option<Cow<'_, Value>> {
        match self.properties.get(name) {
            Some(Value::Null) => None,
            Some(value) => Some(Cow::Borrowed(value)),
            None => match name {
                "id" => Some(Cow::Owned(Value::String(self.id.clone()))),
                "type" | "object_type" => {
                    Some(Cow::Owned(Value::String(self.object_type.clone())))
                }
                _ => None,
            },
        }
    }

    /// 读取数值属性
    pub fn number(&self, name: &str) -> Option<f64> {
        self.properties.get(name).and_then(as_f64)
    }
}

/// 建筑模型
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildingModel {
    #[serde(alias = "building_id")]
    pub id: String,
    #[serde(default, alias = "building_name")]
    pub name: String,
    #[serde(default)]
    pub objects: Vec<BuildingObject>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl BuildingModel {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        objects: Vec<BuildingObject>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            objects,
            metadata: BTreeMap::new(),
        }
    }

    /// 校验模型：ID 不能为空，对象 ID 不能为空且不能重复
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidModel("模型 ID 不能为空".to_string()));
        }

        let mut seen = HashSet::with_capacity(self.objects.len());
        for obj in &self.objects {
            if obj.id.trim().is_empty() {
                return Err(EngineError::InvalidModel(format!(
                    "类型为 {} 的对象缺少 ID",
                    obj.object_type
                )));
            }
            if !seen.insert(obj.id.as_str()) {
                return Err(EngineError::InvalidModel(format!(
                    "对象 ID 重复: {}",
                    obj.id
                )));
            }
        }

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&BuildingObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn objects_of_type<'a>(
        &'a self,
        object_type: &'a str,
    ) -> impl Iterator<Item = &'a BuildingObject> + 'a {
        self.objects.iter().filter(move |o| o.object_type == object_type)
    }

    /// 模型内容指纹（SHA-256 十六进制），用作结果缓存键的一部分
    pub fn fingerprint(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex_digest(&bytes))
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

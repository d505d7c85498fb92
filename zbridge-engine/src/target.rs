//! 目标持久化模型的接口：几何部件与元素。

use glam::DAffine3;
use serde::Serialize;
use thiserror::Error;
use zbridge_core::geometry::{Geometry, Range3};
use zbridge_core::scene::{EntityId, LayerId};

use crate::symbology::DisplayParams;

macro_rules! target_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }
    };
}

target_id!(PartId);
target_id!(ElementId);

/// 可复用的几何定义。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeometryPart {
    pub code: String,
    /// 代码作用域，通常为块定义名。
    pub namespace: String,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartInstance {
    pub part: PartId,
    pub transform: DAffine3,
    /// 部件自身已按该比例缩放，此处仅记录。
    pub scale: f64,
    pub display: DisplayParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedGeometry {
    pub display: DisplayParams,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementPayload {
    Inline { geometry: Vec<PlacedGeometry> },
    Parts { instances: Vec<PartInstance> },
    Empty,
}

impl ElementPayload {
    pub fn len(&self) -> usize {
        match self {
            ElementPayload::Inline { geometry } => geometry.len(),
            ElementPayload::Parts { instances } => instances.len(),
            ElementPayload::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetElement {
    pub source: EntityId,
    /// `{实体}-{分块序号}`，用于重复检测。
    pub code: String,
    pub category: LayerId,
    pub placement: DAffine3,
    pub display: DisplayParams,
    pub payload: ElementPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(ElementId),
    Duplicate,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("target rejected '{code}': {reason}")]
    Rejected { code: String, reason: String },
    #[error("geometry part '{0}' is empty")]
    EmptyPart(String),
}

/// 目标模型写入接口。
pub trait TargetStore {
    /// 持久化几何部件，返回其标识与包围盒。
    fn insert_part(&mut self, part: &GeometryPart) -> Result<(PartId, Range3), StoreError>;
    fn insert_element(&mut self, element: &TargetElement) -> InsertOutcome;
}

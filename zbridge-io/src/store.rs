//! 内存目标存储。

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;
use zbridge_core::geometry::Range3;
use zbridge_core::scene::LayerId;
use zbridge_engine::target::{
    ElementId, GeometryPart, InsertOutcome, PartId, StoreError, TargetElement, TargetStore,
};

#[derive(Debug, Clone, Serialize)]
pub struct PartRecord {
    pub id: PartId,
    pub range: Range3,
    #[serde(flatten)]
    pub part: GeometryPart,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElementRecord {
    pub id: ElementId,
    #[serde(flatten)]
    pub element: TargetElement,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    parts: Vec<PartRecord>,
    elements: Vec<ElementRecord>,
    codes: HashSet<String>,
    /// 拒绝写入的类别，用于模拟目标端失败。
    pub reject_categories: HashSet<LayerId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parts(&self) -> &[PartRecord] {
        &self.parts
    }

    pub fn elements(&self) -> &[ElementRecord] {
        &self.elements
    }

    pub fn part(&self, id: PartId) -> Option<&PartRecord> {
        self.parts.iter().find(|record| record.id == id)
    }
}

impl TargetStore for MemoryStore {
    fn insert_part(&mut self, part: &GeometryPart) -> Result<(PartId, Range3), StoreError> {
        let range = part.geometry.range();
        if range.is_empty() {
            return Err(StoreError::EmptyPart(part.code.clone()));
        }
        let id = PartId::new(self.parts.len() as u64 + 1);
        self.parts.push(PartRecord {
            id,
            range,
            part: part.clone(),
        });
        Ok((id, range))
    }

    fn insert_element(&mut self, element: &TargetElement) -> InsertOutcome {
        if self.reject_categories.contains(&element.category) {
            return InsertOutcome::Failed(format!("category {} is read-only", element.category));
        }
        if !self.codes.insert(element.code.clone()) {
            debug!(code = %element.code, "重复元素");
            return InsertOutcome::Duplicate;
        }
        let id = ElementId::new(self.elements.len() as u64 + 1);
        self.elements.push(ElementRecord {
            id,
            element: element.clone(),
        });
        InsertOutcome::Inserted(id)
    }
}

#[cfg(test)]
mod tests {
    use glam::{DAffine3, DVec3};
    use zbridge_core::geometry::Geometry;
    use zbridge_core::scene::EntityId;
    use zbridge_engine::symbology::{EffectiveSymbology, FillMode};
    use zbridge_engine::target::ElementPayload;

    use super::*;

    fn element(code: &str, category: LayerId) -> TargetElement {
        TargetElement {
            source: EntityId::new(1),
            code: code.to_string(),
            category,
            placement: DAffine3::IDENTITY,
            display: EffectiveSymbology::root_default(category).display(1.0, FillMode::Unfilled),
            payload: ElementPayload::Empty,
        }
    }

    #[test]
    fn duplicate_codes_are_detected() {
        let mut store = MemoryStore::new();
        assert_eq!(
            store.insert_element(&element("1-0", LayerId::new(0))),
            InsertOutcome::Inserted(ElementId::new(1))
        );
        assert_eq!(
            store.insert_element(&element("1-0", LayerId::new(0))),
            InsertOutcome::Duplicate
        );
        store.reject_categories.insert(LayerId::new(4));
        assert!(matches!(
            store.insert_element(&element("2-0", LayerId::new(4))),
            InsertOutcome::Failed(_)
        ));
        assert_eq!(store.elements().len(), 1);
    }

    #[test]
    fn parts_report_their_range() {
        let mut store = MemoryStore::new();
        let part = GeometryPart {
            code: "A-1-0".to_string(),
            namespace: "DOOR".to_string(),
            geometry: Geometry::line(DVec3::ZERO, DVec3::new(2.0, 1.0, 0.0)),
        };
        let (id, range) = store.insert_part(&part).expect("写入部件");
        assert_eq!(id, PartId::new(1));
        assert_eq!(range.max(), DVec3::new(2.0, 1.0, 0.0));
        assert!(store.part(id).is_some());

        let empty = GeometryPart {
            geometry: Geometry::PointString { points: Vec::new() },
            ..part
        };
        assert!(matches!(store.insert_part(&empty), Err(StoreError::EmptyPart(_))));
    }
}

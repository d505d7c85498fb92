//! JSON 场景读取。
//!
//! 块参照可用插入点/旋转角（度）/比例描述，也可直接给出 3×4 行矩阵；
//! 最终变换为 放置 × 平移(-基点)。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use glam::{DAffine3, DMat3, DVec3};
use serde::Deserialize;
use tracing::{debug, info};
use zbridge_core::geometry::{Point3, Range3, Vector3};
use zbridge_core::scene::{
    BlockDefinition, BlockId, BlockReference, Color, DrawableEntity, EntityId, EntityKind, LayerId,
    LayerRecord, LineWeight, LinetypeId, MaterialId, Primitive, Scene, SceneReader, Symbology,
    Transparency,
};

use crate::{IoError, SceneLoader};

#[derive(Debug, Deserialize)]
struct SceneDoc {
    #[serde(default)]
    layers: Vec<LayerRecord>,
    #[serde(default)]
    linetypes: Vec<NamedDoc>,
    #[serde(default)]
    materials: Vec<NamedDoc>,
    #[serde(default)]
    blocks: Vec<BlockDoc>,
    #[serde(default)]
    entities: Vec<EntityDoc>,
}

#[derive(Debug, Deserialize)]
struct NamedDoc {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct BlockDoc {
    id: u64,
    name: String,
    #[serde(default)]
    anonymous: Option<bool>,
    #[serde(default)]
    base_point: [f64; 3],
    #[serde(default)]
    entities: Vec<EntityDoc>,
}

fn default_scale() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

fn default_linetype_scale() -> f64 {
    1.0
}

fn default_visible() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PlacementDoc {
    block: u64,
    #[serde(default)]
    insert: [f64; 3],
    /// 绕 Z 轴旋转，单位度。
    #[serde(default)]
    rotation: f64,
    #[serde(default = "default_scale")]
    scale: [f64; 3],
    /// 行主序 3×4 矩阵，给出时忽略插入点/旋转/比例。
    #[serde(default)]
    matrix: Option<[[f64; 4]; 3]>,
    #[serde(default)]
    attributes: Vec<EntityDoc>,
    #[serde(default)]
    clip: Option<Range3>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KindDoc {
    Primitives { primitives: Vec<Primitive> },
    BlockReference(PlacementDoc),
    Dimension(PlacementDoc),
}

#[derive(Debug, Deserialize)]
struct EntityDoc {
    id: u64,
    #[serde(default)]
    layer: u64,
    #[serde(default)]
    symbology_parent: Option<u64>,
    #[serde(default)]
    color: Symbology<Color>,
    #[serde(default)]
    linetype: Symbology<Option<LinetypeId>>,
    #[serde(default)]
    material: Symbology<Option<MaterialId>>,
    #[serde(default)]
    weight: Symbology<LineWeight>,
    #[serde(default)]
    transparency: Symbology<Transparency>,
    #[serde(default = "default_linetype_scale")]
    linetype_scale: f64,
    #[serde(default)]
    thickness: f64,
    #[serde(default = "default_visible")]
    visible: bool,
    #[serde(default)]
    attached_data: bool,
    kind: KindDoc,
}

/// 读取 JSON 场景文件。
#[derive(Debug, Default)]
pub struct JsonSceneLoader;

impl JsonSceneLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, text: &str) -> Result<Scene, IoError> {
        let document: SceneDoc = serde_json::from_str(text)?;
        SceneBuilder::default().build(document)
    }
}

impl SceneLoader for JsonSceneLoader {
    fn load(&self, path: &Path) -> Result<Scene, IoError> {
        let text = fs::read_to_string(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let scene = self.parse(&text)?;
        info!(path = %path.display(), "场景已加载");
        Ok(scene)
    }
}

#[derive(Default)]
struct SceneBuilder {
    base_points: HashMap<BlockId, DVec3>,
    seen: HashSet<EntityId>,
}

impl SceneBuilder {
    fn build(mut self, document: SceneDoc) -> Result<Scene, IoError> {
        let mut scene = Scene::new();
        let model_space = scene.model_space();
        let passthrough = scene.passthrough_layer();

        for layer in document.layers {
            if layer.id == passthrough {
                // 0 层始终保持随块语义
                if let Some(layer0) = scene.layer0_mut() {
                    *layer0 = LayerRecord {
                        passthrough: true,
                        ..layer
                    };
                }
            } else {
                scene.add_layer(layer);
            }
        }
        for linetype in document.linetypes {
            scene.add_linetype(LinetypeId::new(linetype.id), linetype.name);
        }
        for material in document.materials {
            scene.add_material(MaterialId::new(material.id), material.name);
        }

        for block in &document.blocks {
            let id = BlockId::new(block.id);
            if id == model_space {
                return Err(invalid(format!("block id {} is reserved for model space", block.id)));
            }
            let base_point = DVec3::from_array(block.base_point);
            if !base_point.is_finite() {
                return Err(invalid(format!("block '{}' has a non-finite base point", block.name)));
            }
            if self.base_points.insert(id, base_point).is_some() {
                return Err(invalid(format!("duplicate block id {}", block.id)));
            }
        }

        for block in document.blocks {
            let id = BlockId::new(block.id);
            let mut definition = BlockDefinition::new(id, block.name);
            if let Some(anonymous) = block.anonymous {
                definition.anonymous = anonymous;
            }
            definition.base_point = Point3::from(DVec3::from_array(block.base_point));
            scene.add_block(definition);
            for entity in block.entities {
                let entity = self.entity(entity)?;
                scene.add_entity(id, entity);
            }
        }

        for entity in document.entities {
            let entity = self.entity(entity)?;
            scene.add_entity(model_space, entity);
        }
        debug!(entities = self.seen.len(), blocks = self.base_points.len(), "场景构建完成");
        Ok(scene)
    }

    fn entity(&mut self, doc: EntityDoc) -> Result<DrawableEntity, IoError> {
        let id = EntityId::new(doc.id);
        if !self.seen.insert(id) {
            return Err(invalid(format!("duplicate entity id {}", doc.id)));
        }
        let kind = match doc.kind {
            KindDoc::Primitives { primitives } => EntityKind::Primitives { primitives },
            KindDoc::BlockReference(placement) => {
                EntityKind::BlockReference(self.reference(doc.id, placement)?)
            }
            KindDoc::Dimension(placement) => EntityKind::Dimension(self.reference(doc.id, placement)?),
        };
        Ok(DrawableEntity {
            id,
            layer: LayerId::new(doc.layer),
            symbology_parent: doc.symbology_parent.map(EntityId::new),
            color: doc.color,
            linetype: doc.linetype,
            material: doc.material,
            weight: doc.weight,
            transparency: doc.transparency,
            linetype_scale: doc.linetype_scale,
            thickness: doc.thickness,
            visible: doc.visible,
            attached_data: doc.attached_data,
            kind,
        })
    }

    fn reference(&mut self, owner: u64, placement: PlacementDoc) -> Result<BlockReference, IoError> {
        let block = BlockId::new(placement.block);
        let local = match placement.matrix {
            Some(rows) => matrix_from_rows(rows),
            None => {
                BlockReference::placed(
                    block,
                    Point3::from(DVec3::from_array(placement.insert)),
                    placement.rotation.to_radians(),
                    Vector3::from(DVec3::from_array(placement.scale)),
                )
                .transform
            }
        };
        if !local.is_finite() {
            return Err(invalid(format!("entity {owner} has a non-finite placement")));
        }
        // 未声明的块保留为悬空引用，由转换阶段报告。
        let base_point = self.base_points.get(&block).copied().unwrap_or(DVec3::ZERO);
        let mut reference = BlockReference::new(block, local * DAffine3::from_translation(-base_point));
        reference.clip = placement.clip;
        for attribute in placement.attributes {
            reference.attributes.push(self.entity(attribute)?);
        }
        Ok(reference)
    }
}

fn matrix_from_rows(rows: [[f64; 4]; 3]) -> DAffine3 {
    let linear = DMat3::from_cols(
        DVec3::new(rows[0][0], rows[1][0], rows[2][0]),
        DVec3::new(rows[0][1], rows[1][1], rows[2][1]),
        DVec3::new(rows[0][2], rows[1][2], rows[2][2]),
    );
    DAffine3::from_mat3_translation(linear, DVec3::new(rows[0][3], rows[1][3], rows[2][3]))
}

fn invalid(message: String) -> IoError {
    IoError::InvalidDocument(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_rows_map_to_affine() {
        let transform = matrix_from_rows([
            [0.0, -1.0, 0.0, 5.0],
            [1.0, 0.0, 0.0, 6.0],
            [0.0, 0.0, 1.0, 0.0],
        ]);
        let point = transform.transform_point3(DVec3::X);
        assert!((point - DVec3::new(5.0, 7.0, 0.0)).length() < 1e-12);
    }

    #[test]
    fn layer_zero_stays_passthrough() {
        let scene = JsonSceneLoader::new()
            .parse(r#"{"layers": [{"id": 0, "name": "0", "color": {"indexed": 2}}]}"#)
            .expect("解析场景");
        let layer0 = scene.layer(LayerId::new(0)).expect("0 层存在");
        assert!(layer0.passthrough);
        assert_eq!(layer0.color, Color::Indexed(2));
    }

    #[test]
    fn attributes_share_entity_id_space() {
        let text = r#"{
            "blocks": [{"id": 5, "name": "TAG"}],
            "entities": [{
                "id": 1,
                "kind": {"type": "block_reference", "block": 5, "attributes": [
                    {"id": 1, "kind": {"type": "primitives", "primitives": []}}
                ]}
            }]
        }"#;
        let error = JsonSceneLoader::new().parse(text).expect_err("重复 id 应失败");
        assert!(matches!(error, IoError::InvalidDocument(_)));
    }
}

//! 符号属性解析：绝对值 / 随容器 / 随引用 三态间接，以及可见性级联。
//!
//! 每个节点只读取直接父级已解析的快照，因此解析深度受树深约束。

use serde::Serialize;
use tracing::warn;
use zbridge_core::scene::{
    Color, DrawableEntity, LayerId, LayerRecord, LineWeight, LinetypeId, MaterialId, SceneReader,
    Symbology, Transparency,
};

use crate::diagnostics::{Diagnostic, DiagnosticsSink, IssueCategory};

/// 实例化链根部仍为“随引用”时的终止默认值。
pub const ROOT_DEFAULT_COLOR: Color = Color::BLACK;
pub const ROOT_DEFAULT_WEIGHT: LineWeight = LineWeight::ZERO;

/// 节点解析后的符号快照，供子节点“随引用”查找。所有值均为绝对值。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveSymbology {
    /// 有效图层：保留图层上的节点浮动到父级的有效图层。
    pub layer: LayerId,
    pub color: Color,
    pub linetype: Option<LinetypeId>,
    pub material: Option<MaterialId>,
    pub weight: LineWeight,
    pub transparency: Transparency,
    pub visible: bool,
    /// 自身或任一外层容器图层被冻结。
    pub frozen_chain: bool,
    pub on_passthrough: bool,
}

impl EffectiveSymbology {
    pub fn root_default(layer: LayerId) -> Self {
        Self {
            layer,
            color: ROOT_DEFAULT_COLOR,
            linetype: None,
            material: None,
            weight: ROOT_DEFAULT_WEIGHT,
            transparency: Transparency::OPAQUE,
            visible: true,
            frozen_chain: false,
            on_passthrough: false,
        }
    }

    pub fn display(&self, linetype_scale: f64, fill: FillMode) -> DisplayParams {
        DisplayParams {
            category: self.layer,
            color: self.color,
            fill,
            linetype: self.linetype,
            linetype_scale,
            weight: self.weight,
            transparency: self.transparency,
            material: self.material,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    Unfilled,
    Filled,
}

/// 写入目标模型的显示参数。
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayParams {
    pub category: LayerId,
    pub color: Color,
    pub fill: FillMode,
    pub linetype: Option<LinetypeId>,
    pub linetype_scale: f64,
    pub weight: LineWeight,
    pub transparency: Transparency,
    pub material: Option<MaterialId>,
}

/// 单个属性的三态解析。
///
/// `container` 为节点所在图层的值；保留图层以 `ByReference` 表示。`parent` 为直接父级暴露的值。
pub fn resolve_attribute<T: Copy>(
    own: Symbology<T>,
    container: Symbology<T>,
    parent: Option<T>,
    fallback: T,
) -> T {
    match own {
        Symbology::Absolute(value) => value,
        Symbology::ByContainer => match container {
            Symbology::Absolute(value) => value,
            Symbology::ByContainer | Symbology::ByReference => parent.unwrap_or(fallback),
        },
        Symbology::ByReference => parent.unwrap_or(fallback),
    }
}

pub struct SymbologyResolver<'a, S: SceneReader + ?Sized> {
    scene: &'a S,
}

impl<'a, S: SceneReader + ?Sized> SymbologyResolver<'a, S> {
    pub fn new(scene: &'a S) -> Self {
        Self { scene }
    }

    pub fn resolve(
        &self,
        entity: &DrawableEntity,
        parent: Option<&EffectiveSymbology>,
        diagnostics: &mut dyn DiagnosticsSink,
    ) -> EffectiveSymbology {
        let fallback_layer;
        let layer = match self.scene.layer(entity.layer) {
            Some(layer) => layer,
            None => {
                warn!(entity = %entity.id, layer = %entity.layer, "图层缺失，使用默认符号");
                diagnostics.report(Diagnostic::warning(
                    IssueCategory::MissingReference,
                    format!(
                        "layer {} referenced by entity {} is missing; defaults applied",
                        entity.layer, entity.id
                    ),
                ));
                fallback_layer = missing_layer(entity.layer);
                &fallback_layer
            }
        };

        let defer_to_parent = layer.passthrough && parent.is_some();

        let color = resolve_attribute(
            entity.color,
            container_value(defer_to_parent, layer.color),
            parent.map(|p| p.color),
            ROOT_DEFAULT_COLOR,
        );
        let weight = resolve_attribute(
            entity.weight,
            container_value(defer_to_parent, layer.weight),
            parent.map(|p| p.weight),
            ROOT_DEFAULT_WEIGHT,
        );
        let transparency = resolve_attribute(
            entity.transparency,
            container_value(defer_to_parent, layer.transparency),
            parent.map(|p| p.transparency),
            Transparency::OPAQUE,
        );
        let linetype = resolve_attribute(
            entity.linetype,
            container_value(defer_to_parent, layer.linetype),
            parent.map(|p| p.linetype),
            None,
        );
        let material = resolve_attribute(
            entity.material,
            container_value(defer_to_parent, layer.material),
            parent.map(|p| p.material),
            None,
        );

        let linetype = linetype.filter(|&id| {
            let known = self.scene.has_linetype(id);
            if !known {
                warn!(entity = %entity.id, linetype = %id, "线型缺失，回退为连续线");
                diagnostics.report(Diagnostic::warning(
                    IssueCategory::MissingReference,
                    format!("linetype {id} is missing; continuous used"),
                ));
            }
            known
        });
        let material = material.filter(|&id| {
            let known = self.scene.has_material(id);
            if !known {
                warn!(entity = %entity.id, material = %id, "材质缺失，回退为全局材质");
                diagnostics.report(Diagnostic::warning(
                    IssueCategory::MissingReference,
                    format!("material {id} is missing; global material used"),
                ));
            }
            known
        });

        let effective_layer = match parent {
            Some(parent) if layer.passthrough => parent.layer,
            _ => entity.layer,
        };

        let own_frozen = layer.frozen && !defer_to_parent;
        let frozen_chain = own_frozen || parent.is_some_and(|p| p.frozen_chain);

        let visible = match parent {
            None => layer.is_displayed(),
            // 保留图层上的子节点服从实例化上下文的可见性，不受直接容器冻结影响。
            Some(parent) if layer.passthrough => parent.visible,
            Some(parent) if parent.frozen_chain && !parent.on_passthrough => false,
            Some(_) => layer.is_displayed(),
        };

        EffectiveSymbology {
            layer: effective_layer,
            color,
            linetype,
            material,
            weight,
            transparency,
            visible,
            frozen_chain,
            on_passthrough: layer.passthrough,
        }
    }
}

/// 保留图层的值以随引用表示，使解析向父级前进一层。
fn container_value<T>(defer_to_parent: bool, value: T) -> Symbology<T> {
    if defer_to_parent {
        Symbology::ByReference
    } else {
        Symbology::Absolute(value)
    }
}

fn missing_layer(id: LayerId) -> LayerRecord {
    let mut layer = LayerRecord::new(id, format!("<missing {id}>"));
    layer.color = ROOT_DEFAULT_COLOR;
    layer.weight = ROOT_DEFAULT_WEIGHT;
    layer
}

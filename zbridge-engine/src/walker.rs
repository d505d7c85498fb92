//! 场景遍历与几何收集。
//!
//! 深度优先遍历块参照树，维护变换栈与容器栈，把图元回调转换为边界几何，
//! 并按块定义分桶。栈通过作用域守卫弹出，任何退出路径（包括错误与取消）都保持平衡。

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::ops::{Deref, DerefMut};

use glam::{DAffine3, DVec3};
use tracing::{debug, warn};
use zbridge_core::geometry::{CurvePrimitive, EllipticArc, Geometry, Point3, Range3, Vector3};
use zbridge_core::scene::{
    BlockDefinition, BlockId, BlockReference, ColorOverrides, DrawableEntity, EntityId, EntityKind,
    PolylineVertex, PrimitiveVisitor, SceneReader,
};

use crate::cancel::CancellationToken;
use crate::diagnostics::{Diagnostic, DiagnosticsSink, IssueCategory};
use crate::errors::EngineError;
use crate::primitives::{self, ConversionIssue, POINT_TOLERANCE, THICKNESS_EPSILON};
use crate::symbology::{DisplayParams, EffectiveSymbology, FillMode, SymbologyResolver};

pub type WalkError = EngineError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkOptions {
    pub target_3d: bool,
    /// 构造线/射线截断长度。
    pub infinite_line_length: f64,
    pub prefer_face_colors: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            target_3d: true,
            infinite_line_length: 1.0e5,
            prefer_face_colors: false,
        }
    }
}

/// 单个图元的收集结果。几何位于容器局部坐标，`transform` 把它映射到世界坐标。
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryEntry {
    pub geometry: Geometry,
    pub display: DisplayParams,
    pub transform: DAffine3,
    pub container: BlockId,
    pub source: EntityId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedGeometry {
    pub root: EntityId,
    pub symbology: EffectiveSymbology,
    pub buckets: BTreeMap<BlockId, Vec<GeometryEntry>>,
    /// 桶的首次写入顺序。
    pub order: Vec<BlockId>,
    /// 根块参照的定义与累积放置变换。
    pub definition: Option<BlockId>,
    pub placement: Option<DAffine3>,
    /// 遍历中遇到带裁剪范围的参照，桶内序号不再与定义子实体一一对应。
    pub clipped: bool,
}

impl CollectedGeometry {
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }

    pub fn entry_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// 按桶的首次写入顺序迭代 (桶内序号, 条目)。
    pub fn entries(&self) -> impl Iterator<Item = (usize, &GeometryEntry)> {
        self.order
            .iter()
            .filter_map(|block| self.buckets.get(block))
            .flat_map(|bucket| bucket.iter().enumerate())
    }
}

#[derive(Debug, Clone, Copy)]
struct ContainerFrame {
    block: BlockId,
    /// 实例化实体的已解析符号，作为子节点的父级上下文。
    parent: Option<EffectiveSymbology>,
    clip: Option<Range3>,
    /// 宿主为标注且其图层关闭或冻结。
    hidden_dimension_host: bool,
}

#[derive(Debug, Clone, Copy)]
struct DrawState {
    symbology: EffectiveSymbology,
    linetype_scale: f64,
    thickness: f64,
    source: EntityId,
}

#[derive(Debug, Clone, Copy)]
enum Stack {
    Transform,
    Container,
}

/// 栈作用域守卫，析构时弹出对应栈顶。
struct StackGuard<'g, 'a, S: SceneReader + ?Sized> {
    collector: &'g mut GeometryCollector<'a, S>,
    stack: Stack,
}

impl<'a, S: SceneReader + ?Sized> Deref for StackGuard<'_, 'a, S> {
    type Target = GeometryCollector<'a, S>;

    fn deref(&self) -> &Self::Target {
        self.collector
    }
}

impl<S: SceneReader + ?Sized> DerefMut for StackGuard<'_, '_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.collector
    }
}

impl<S: SceneReader + ?Sized> Drop for StackGuard<'_, '_, S> {
    fn drop(&mut self) {
        match self.stack {
            Stack::Transform => {
                self.collector.transforms.pop();
            }
            Stack::Container => {
                self.collector.containers.pop();
            }
        }
    }
}

pub struct GeometryCollector<'a, S: SceneReader + ?Sized> {
    scene: &'a S,
    resolver: SymbologyResolver<'a, S>,
    options: WalkOptions,
    diagnostics: &'a mut dyn DiagnosticsSink,
    cancel: &'a CancellationToken,
    base: DAffine3,
    transforms: Vec<DAffine3>,
    containers: Vec<ContainerFrame>,
    state: DrawState,
    buckets: BTreeMap<BlockId, Vec<GeometryEntry>>,
    order: Vec<BlockId>,
    definition: Option<BlockId>,
    placement: Option<DAffine3>,
    clipped: bool,
}

impl<'a, S: SceneReader + ?Sized> GeometryCollector<'a, S> {
    pub fn new(
        scene: &'a S,
        options: WalkOptions,
        diagnostics: &'a mut dyn DiagnosticsSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        let model_space = ContainerFrame {
            block: scene.model_space(),
            parent: None,
            clip: None,
            hidden_dimension_host: false,
        };
        Self {
            scene,
            resolver: SymbologyResolver::new(scene),
            options,
            diagnostics,
            cancel,
            base: DAffine3::IDENTITY,
            transforms: Vec::new(),
            containers: vec![model_space],
            state: DrawState {
                symbology: EffectiveSymbology::root_default(scene.passthrough_layer()),
                linetype_scale: 1.0,
                thickness: 0.0,
                source: EntityId::new(0),
            },
            buckets: BTreeMap::new(),
            order: Vec::new(),
            definition: None,
            placement: None,
            clipped: false,
        }
    }

    pub fn with_base(mut self, base: DAffine3) -> Self {
        self.base = base;
        self
    }

    pub fn transform_depth(&self) -> usize {
        self.transforms.len()
    }

    pub fn container_depth(&self) -> usize {
        self.containers.len()
    }

    /// 基准变换 × 栈顶。
    pub fn current_transform(&self) -> DAffine3 {
        match self.transforms.last() {
            Some(top) => self.base * *top,
            None => self.base,
        }
    }

    /// 收集一个顶层实体的几何。出错或取消时丢弃已收集的桶。
    pub fn collect(&mut self, root: &'a DrawableEntity) -> Result<CollectedGeometry, WalkError> {
        self.buckets.clear();
        self.order.clear();
        self.definition = None;
        self.placement = None;
        self.clipped = false;

        let result = self.collect_root(root);
        let buckets = std::mem::take(&mut self.buckets);
        let order = std::mem::take(&mut self.order);
        let symbology = result?;

        Ok(CollectedGeometry {
            root: root.id,
            symbology,
            buckets,
            order,
            definition: self.definition.take(),
            placement: self.placement.take(),
            clipped: std::mem::take(&mut self.clipped),
        })
    }

    fn collect_root(&mut self, root: &'a DrawableEntity) -> Result<EffectiveSymbology, WalkError> {
        self.cancel.check()?;
        let template = self.template_parent(root);
        let symbology = self
            .resolver
            .resolve(root, template.as_ref(), &mut *self.diagnostics);
        if !symbology.visible || !root.visible {
            debug!(entity = %root.id, "顶层实体不可见，跳过");
            return Ok(symbology);
        }
        self.draw_entity(root, symbology)?;
        Ok(symbology)
    }

    /// 独立转换时，“随引用”属性按模板父实体解析。
    fn template_parent(&mut self, root: &DrawableEntity) -> Option<EffectiveSymbology> {
        let parent_id = root.symbology_parent?;
        match self.scene.entity(parent_id) {
            Some(parent) => Some(self.resolver.resolve(parent, None, &mut *self.diagnostics)),
            None => {
                self.diagnostics.report(Diagnostic::warning(
                    IssueCategory::MissingReference,
                    format!(
                        "symbology parent {parent_id} of entity {} is missing",
                        root.id
                    ),
                ));
                None
            }
        }
    }

    fn push_transform(&mut self, local: DAffine3) -> StackGuard<'_, 'a, S> {
        let local = if local.is_finite() {
            local
        } else {
            warn!("块参照变换含非有限值，按单位变换处理");
            self.diagnostics.report(Diagnostic::warning(
                IssueCategory::NumericDegeneracy,
                "non-finite block transform replaced by identity",
            ));
            DAffine3::IDENTITY
        };
        let composed = match self.transforms.last() {
            Some(top) => *top * local,
            None => local,
        };
        self.transforms.push(composed);
        StackGuard {
            collector: self,
            stack: Stack::Transform,
        }
    }

    fn push_container(&mut self, frame: ContainerFrame) -> StackGuard<'_, 'a, S> {
        self.containers.push(frame);
        StackGuard {
            collector: self,
            stack: Stack::Container,
        }
    }

    fn draw_entity(
        &mut self,
        entity: &'a DrawableEntity,
        symbology: EffectiveSymbology,
    ) -> Result<(), WalkError> {
        self.cancel.check()?;
        match &entity.kind {
            EntityKind::Primitives { primitives } => {
                self.state = DrawState {
                    symbology,
                    linetype_scale: entity.linetype_scale,
                    thickness: entity.thickness,
                    source: entity.id,
                };
                for primitive in primitives {
                    primitive.accept(self);
                }
                Ok(())
            }
            EntityKind::BlockReference(reference) | EntityKind::Dimension(reference) => {
                self.draw_reference(entity, reference, symbology)
            }
        }
    }

    fn draw_reference(
        &mut self,
        entity: &'a DrawableEntity,
        reference: &'a BlockReference,
        symbology: EffectiveSymbology,
    ) -> Result<(), WalkError> {
        let definition = self
            .scene
            .block(reference.block)
            .ok_or(EngineError::MissingBlock(reference.block.get()))?;
        if self.containers.iter().any(|frame| frame.block == definition.id) {
            return Err(EngineError::RecursiveBlock(definition.id.get()));
        }
        if self.transforms.is_empty() {
            self.definition = Some(definition.id);
            self.placement = Some(self.base * reference.transform);
        }
        self.clipped |= reference.clip.is_some();

        let hidden_dimension_host = entity.is_dimension()
            && self
                .scene
                .layer(entity.layer)
                .is_some_and(|layer| !layer.is_displayed());
        let frame = ContainerFrame {
            block: definition.id,
            parent: Some(symbology),
            clip: reference.clip,
            hidden_dimension_host,
        };

        debug!(
            entity = %entity.id,
            block = %definition.name,
            depth = self.transforms.len() + 1,
            "进入块定义"
        );
        {
            let mut scope = self.push_transform(reference.transform);
            let mut scope = scope.push_container(frame);
            scope.draw_children(definition)?;
        }

        // 属性在定义之后绘制，位于实例化方的容器中。
        for attribute in &reference.attributes {
            self.cancel.check()?;
            if !attribute.visible {
                continue;
            }
            let resolved = self
                .resolver
                .resolve(attribute, Some(&symbology), &mut *self.diagnostics);
            if resolved.visible {
                self.draw_entity(attribute, resolved)?;
            }
        }
        Ok(())
    }

    fn draw_children(&mut self, definition: &'a BlockDefinition) -> Result<(), WalkError> {
        for &child in &definition.children {
            self.cancel.check()?;
            match self.draw_child(child) {
                Ok(()) => {}
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(error) => {
                    warn!(block = %definition.name, child = %child, %error, "子实体转换失败，继续处理兄弟实体");
                    let category = match error {
                        EngineError::RecursiveBlock(_) => IssueCategory::CorruptData,
                        _ => IssueCategory::MissingReference,
                    };
                    self.diagnostics.report(Diagnostic::error(
                        category,
                        format!("{error} (in block '{}')", definition.name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn draw_child(&mut self, id: EntityId) -> Result<(), WalkError> {
        let entity = self
            .scene
            .entity(id)
            .ok_or(EngineError::MissingEntity(id.get()))?;
        let Some(frame) = self.containers.last().copied() else {
            return Ok(());
        };
        if !entity.visible {
            return Ok(());
        }
        if let (Some(clip), Some(range)) = (frame.clip, entity.range()) {
            if !clip.intersects(&range) {
                debug!(entity = %entity.id, "实体位于裁剪范围外");
                return Ok(());
            }
        }
        if frame.hidden_dimension_host
            && self
                .scene
                .layer(entity.layer)
                .is_some_and(|layer| layer.non_plot)
        {
            return Ok(());
        }

        let symbology = self
            .resolver
            .resolve(entity, frame.parent.as_ref(), &mut *self.diagnostics);
        if !symbology.visible {
            // 仅因图层关闭而隐藏的嵌套参照仍需下探，由各子实体自行判定可见性；冻结则整棵剪除。
            let descend = matches!(
                entity.kind,
                EntityKind::BlockReference(_) | EntityKind::Dimension(_)
            ) && !symbology.frozen_chain;
            if !descend {
                return Ok(());
            }
        }
        self.draw_entity(entity, symbology)
    }

    fn container(&self) -> BlockId {
        self.containers
            .last()
            .map(|frame| frame.block)
            .unwrap_or_else(|| self.scene.model_space())
    }

    fn display(&self, fill: FillMode) -> DisplayParams {
        self.state
            .symbology
            .display(self.state.linetype_scale, fill)
    }

    fn emit(&mut self, geometry: Geometry, fill: FillMode, normal: DVec3) {
        let display = self.display(fill);
        let transform = self.current_transform();
        self.push_entry(geometry, display, transform, normal);
    }

    fn push_entry(
        &mut self,
        geometry: Geometry,
        display: DisplayParams,
        transform: DAffine3,
        normal: DVec3,
    ) {
        let thickness = self.state.thickness;
        let geometry = if self.options.target_3d
            && thickness.abs() > THICKNESS_EPSILON
            && extrudable(&geometry)
        {
            let capped = matches!(geometry, Geometry::Shape { filled: true, .. } | Geometry::Region { .. });
            primitives::extrude(geometry, normal, thickness, capped)
        } else {
            geometry
        };

        let container = self.container();
        let bucket = self.buckets.entry(container).or_insert_with(|| {
            self.order.push(container);
            Vec::new()
        });
        bucket.push(GeometryEntry {
            geometry,
            display,
            transform,
            container,
            source: self.state.source,
        });
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.report(diagnostic);
    }

    fn report_issue(&mut self, kind: &str, issue: ConversionIssue) {
        let source = self.state.source;
        warn!(entity = %source, kind, %issue, "图元转换失败");
        let diagnostic = match issue {
            ConversionIssue::NonFinite => Diagnostic::warning(
                IssueCategory::NumericDegeneracy,
                format!("{kind} of entity {source} skipped: {issue}"),
            ),
            ConversionIssue::NonPlanar => Diagnostic::warning(
                IssueCategory::Skipped,
                format!("{kind} of entity {source} skipped: {issue}"),
            ),
            ConversionIssue::FaceVertexCountExceeded { .. }
            | ConversionIssue::IndexOutOfRange { .. }
            | ConversionIssue::TruncatedFaceList(_)
            | ConversionIssue::GridSizeMismatch { .. }
            | ConversionIssue::PointCountExceeded { .. } => Diagnostic::error(
                IssueCategory::CorruptData,
                format!("{kind} of entity {source} is corrupt: {issue}"),
            ),
        };
        self.report(diagnostic);
    }

    fn degenerate(&mut self, kind: &str) {
        let source = self.state.source;
        self.report(Diagnostic::warning(
            IssueCategory::NumericDegeneracy,
            format!("degenerate {kind} of entity {source} skipped"),
        ));
    }

    fn infinite_line(&mut self, kind: &str, base: Point3, through: Point3, both_ways: bool) {
        let base = base.as_vec3();
        let Some(direction) = (through.as_vec3() - base)
            .try_normalize()
            .filter(|_| base.is_finite())
        else {
            self.degenerate(kind);
            return;
        };
        let reach = direction * self.options.infinite_line_length;
        let start = if both_ways { base - reach } else { base };
        self.emit(Geometry::line(start, base + reach), FillMode::Unfilled, DVec3::Z);
    }
}

fn extrudable(geometry: &Geometry) -> bool {
    matches!(
        geometry,
        Geometry::Curve { .. }
            | Geometry::Chain { .. }
            | Geometry::Shape { .. }
            | Geometry::Region { .. }
            | Geometry::PointString { .. }
    )
}

impl<S: SceneReader + ?Sized> PrimitiveVisitor for GeometryCollector<'_, S> {
    fn unsupported(&mut self, kind: &str) {
        debug!(entity = %self.state.source, kind, "跳过不支持的图元");
        self.report(Diagnostic::warning(
            IssueCategory::UnsupportedPrimitive,
            format!("unsupported primitive kind '{kind}' skipped"),
        ));
    }

    fn line(&mut self, start: Point3, end: Point3) {
        if !start.is_finite() || !end.is_finite() {
            self.degenerate("line");
            return;
        }
        self.emit(
            Geometry::line(start.as_vec3(), end.as_vec3()),
            FillMode::Unfilled,
            DVec3::Z,
        );
    }

    fn polyline(&mut self, vertices: &[PolylineVertex], closed: bool, normal: Vector3) {
        match primitives::polyline_geometry(vertices, closed, normal.as_vec3()) {
            Ok(outcome) => {
                if outcome.rejected_bulges > 0 {
                    let source = self.state.source;
                    self.report(Diagnostic::warning(
                        IssueCategory::NumericDegeneracy,
                        format!("polyline of entity {source} has out-of-range bulges drawn straight"),
                    ));
                }
                if let Some(geometry) = outcome.geometry {
                    self.emit(geometry, FillMode::Unfilled, normal.as_vec3());
                }
            }
            Err(issue) => self.report_issue("polyline", issue),
        }
    }

    fn circle(&mut self, center: Point3, radius: f64, normal: Vector3) {
        self.arc(center, radius, normal, 0.0, TAU);
    }

    fn arc(&mut self, center: Point3, radius: f64, normal: Vector3, start: f64, sweep: f64) {
        let valid = center.is_finite()
            && radius.is_finite()
            && radius > POINT_TOLERANCE
            && sweep.is_finite()
            && sweep.abs() > POINT_TOLERANCE;
        let Some(normal) = normal.normalize().filter(|_| valid) else {
            self.degenerate("arc");
            return;
        };
        let arc = EllipticArc::circular(center.as_vec3(), radius, normal.as_vec3(), start, sweep);
        self.emit(
            Geometry::Curve {
                curve: CurvePrimitive::Arc(arc),
            },
            FillMode::Unfilled,
            normal.as_vec3(),
        );
    }

    fn polygon(&mut self, points: &[Point3]) {
        if points.iter().any(|p| !p.is_finite()) {
            self.degenerate("polygon");
            return;
        }
        let mut outline: Vec<DVec3> = Vec::with_capacity(points.len() + 1);
        for point in points.iter().map(|p| p.as_vec3()) {
            if outline
                .last()
                .is_none_or(|last| last.distance(point) > POINT_TOLERANCE)
            {
                outline.push(point);
            }
        }
        if outline.len() < 3 {
            self.degenerate("polygon");
            return;
        }
        if let Some(&first) = outline.first() {
            outline.push(first);
        }
        self.emit(
            Geometry::Shape {
                points: outline,
                filled: true,
            },
            FillMode::Filled,
            DVec3::Z,
        );
    }

    fn mesh(&mut self, rows: usize, columns: usize, points: &[Point3], overrides: &ColorOverrides) {
        match primitives::mesh_geometry(rows, columns, points, !self.options.target_3d) {
            Ok(Some(geometry)) => {
                let mut display = self.display(FillMode::Unfilled);
                if let Some(color) = primitives::color_override(overrides, self.options.prefer_face_colors) {
                    display.color = color;
                }
                let transform = self.current_transform();
                self.push_entry(geometry, display, transform, DVec3::Z);
            }
            Ok(None) => self.degenerate("mesh"),
            Err(issue) => self.report_issue("mesh", issue),
        }
    }

    fn shell(
        &mut self,
        points: &[Point3],
        faces: &[i32],
        edge_visibility: Option<&[bool]>,
        overrides: &ColorOverrides,
    ) {
        let (converted, fill) = if self.options.target_3d {
            (
                primitives::shell_polyface(points, faces, edge_visibility),
                FillMode::Unfilled,
            )
        } else {
            (primitives::shell_region(points, faces), FillMode::Filled)
        };
        match converted {
            Ok(Some(geometry)) => {
                let mut display = self.display(fill);
                if let Some(color) = primitives::color_override(overrides, self.options.prefer_face_colors) {
                    display.color = color;
                }
                let transform = self.current_transform();
                self.push_entry(geometry, display, transform, DVec3::Z);
            }
            Ok(None) => self.degenerate("shell"),
            Err(issue) => self.report_issue("shell", issue),
        }
    }

    fn text(&mut self, position: Point3, content: &str, height: f64, rotation: f64) {
        if content.trim().is_empty() {
            let source = self.state.source;
            self.report(Diagnostic::info(
                IssueCategory::Skipped,
                format!("empty text of entity {source} skipped"),
            ));
            return;
        }
        if !position.is_finite() || !height.is_finite() || height.abs() <= POINT_TOLERANCE {
            self.degenerate("text");
            return;
        }
        let (sin, cos) = rotation.sin_cos();
        self.emit(
            Geometry::Text {
                origin: position.as_vec3(),
                x_axis: DVec3::new(cos, sin, 0.0) * height,
                y_axis: DVec3::new(-sin, cos, 0.0) * height,
                content: content.to_string(),
            },
            FillMode::Unfilled,
            DVec3::Z,
        );
    }

    fn xline(&mut self, base: Point3, through: Point3) {
        self.infinite_line("xline", base, through, true);
    }

    fn ray(&mut self, origin: Point3, through: Point3) {
        self.infinite_line("ray", origin, through, false);
    }

    fn row_of_dots(&mut self, count: usize, start: Point3, step: Vector3) {
        match primitives::row_of_dots(count, start.as_vec3(), step.as_vec3()) {
            Ok(Some(geometry)) => self.emit(geometry, FillMode::Unfilled, DVec3::Z),
            Ok(None) => {}
            Err(issue) => self.report_issue("row of dots", issue),
        }
    }

    fn world_line(&mut self, start: Point3, end: Point3) {
        if !start.is_finite() || !end.is_finite() {
            self.degenerate("world line");
            return;
        }
        let display = self.display(FillMode::Unfilled);
        let base = self.base;
        self.push_entry(
            Geometry::line(start.as_vec3(), end.as_vec3()),
            display,
            base,
            DVec3::Z,
        );
    }

    fn point(&mut self, position: Point3) {
        if !position.is_finite() {
            self.degenerate("point");
            return;
        }
        self.emit(
            Geometry::PointString {
                points: vec![position.as_vec3()],
            },
            FillMode::Unfilled,
            DVec3::Z,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostics, Severity};
    use zbridge_core::scene::{
        Color, LayerId, LayerRecord, LinetypeId, MaterialId, Primitive, Scene, Symbology,
    };

    const WALLS: LayerId = LayerId::new(1);

    fn line_entity(id: u64, layer: LayerId) -> DrawableEntity {
        DrawableEntity::with_primitives(
            EntityId::new(id),
            layer,
            vec![Primitive::Line {
                start: Point3::new(0.0, 0.0, 0.0),
                end: Point3::new(1.0, 0.0, 0.0),
            }],
        )
    }

    fn reference(id: u64, block: u64, transform: DAffine3) -> DrawableEntity {
        DrawableEntity::new(
            EntityId::new(id),
            WALLS,
            EntityKind::BlockReference(BlockReference::new(BlockId::new(block), transform)),
        )
    }

    /// 块 10 含两条 0 层直线；模型空间中实体 100 以平移 (5,0,0) 插入它。
    fn scene_with_block() -> Scene {
        let mut scene = Scene::new();
        let mut walls = LayerRecord::new(WALLS, "WALLS");
        walls.color = Color::Indexed(1);
        scene.add_layer(walls);
        scene.add_block(BlockDefinition::new(BlockId::new(10), "DOOR"));
        let layer0 = scene.passthrough_layer();
        scene.add_entity(BlockId::new(10), line_entity(11, layer0));
        scene.add_entity(BlockId::new(10), line_entity(12, layer0));
        let model = scene.model_space();
        scene.add_entity(
            model,
            reference(100, 10, DAffine3::from_translation(DVec3::new(5.0, 0.0, 0.0))),
        );
        scene
    }

    fn collect(
        scene: &Scene,
        options: WalkOptions,
        root: u64,
    ) -> (Result<CollectedGeometry, WalkError>, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let cancel = CancellationToken::new();
        let result = {
            let mut collector = GeometryCollector::new(scene, options, &mut diagnostics, &cancel);
            let entity = scene.entity(EntityId::new(root)).expect("根实体存在");
            let result = collector.collect(entity);
            assert_eq!(collector.transform_depth(), 0);
            assert_eq!(collector.container_depth(), 1);
            result
        };
        (result, diagnostics)
    }

    #[test]
    fn block_children_are_bucketed_with_composed_transform() {
        let scene = scene_with_block();
        let (result, diagnostics) = collect(&scene, WalkOptions::default(), 100);
        let collected = result.expect("收集成功");
        assert!(diagnostics.is_empty());
        assert!(!collected.clipped);
        assert_eq!(collected.order, vec![BlockId::new(10)]);
        assert_eq!(collected.definition, Some(BlockId::new(10)));
        let bucket = &collected.buckets[&BlockId::new(10)];
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket[0].source, EntityId::new(11));
        assert_eq!(bucket[1].source, EntityId::new(12));
        for entry in bucket {
            assert_eq!(entry.transform.translation, DVec3::new(5.0, 0.0, 0.0));
            // 0 层子实体浮动到实例化图层
            assert_eq!(entry.display.category, WALLS);
            assert_eq!(entry.display.color, Color::Indexed(1));
        }
    }

    #[test]
    fn missing_child_is_reported_and_siblings_continue() {
        let mut scene = scene_with_block();
        let mut block = scene.block(BlockId::new(10)).cloned().expect("块存在");
        block.children.insert(1, EntityId::new(999));
        scene.add_block(block);

        let (result, diagnostics) = collect(&scene, WalkOptions::default(), 100);
        let collected = result.expect("收集成功");
        assert_eq!(collected.entry_count(), 2);
        assert_eq!(diagnostics.count(Severity::Error), 1);
    }

    #[test]
    fn missing_root_definition_abandons_entity() {
        let mut scene = scene_with_block();
        let model = scene.model_space();
        scene.add_entity(model, reference(200, 77, DAffine3::IDENTITY));
        let (result, _) = collect(&scene, WalkOptions::default(), 200);
        assert!(matches!(result, Err(EngineError::MissingBlock(77))));
    }

    #[test]
    fn self_referencing_block_is_cut_off() {
        let mut scene = scene_with_block();
        scene.add_entity(BlockId::new(10), reference(13, 10, DAffine3::IDENTITY));
        let (result, diagnostics) = collect(&scene, WalkOptions::default(), 100);
        assert_eq!(result.expect("收集成功").entry_count(), 2);
        assert_eq!(diagnostics.count_category(IssueCategory::CorruptData), 1);
    }

    #[test]
    fn cancellation_mid_walk_keeps_stacks_balanced() {
        struct CancellingScene<'s> {
            inner: &'s Scene,
            trigger: EntityId,
            token: CancellationToken,
        }

        impl SceneReader for CancellingScene<'_> {
            fn model_space(&self) -> BlockId {
                self.inner.model_space()
            }
            fn passthrough_layer(&self) -> LayerId {
                self.inner.passthrough_layer()
            }
            fn layer(&self, id: LayerId) -> Option<&LayerRecord> {
                self.inner.layer(id)
            }
            fn block(&self, id: BlockId) -> Option<&BlockDefinition> {
                self.inner.block(id)
            }
            fn entity(&self, id: EntityId) -> Option<&DrawableEntity> {
                if id == self.trigger {
                    self.token.cancel();
                }
                self.inner.entity(id)
            }
            fn has_linetype(&self, id: LinetypeId) -> bool {
                self.inner.has_linetype(id)
            }
            fn has_material(&self, id: MaterialId) -> bool {
                self.inner.has_material(id)
            }
        }

        let scene = scene_with_block();
        let token = CancellationToken::new();
        let wrapped = CancellingScene {
            inner: &scene,
            trigger: EntityId::new(12),
            token: token.clone(),
        };
        let root = scene.entity(EntityId::new(100)).expect("根实体存在");
        let mut diagnostics = Diagnostics::new();
        let mut collector =
            GeometryCollector::new(&wrapped, WalkOptions::default(), &mut diagnostics, &token);
        let result = collector.collect(root);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(collector.transform_depth(), 0);
        assert_eq!(collector.container_depth(), 1);
    }

    #[test]
    fn thickness_extrudes_only_for_3d_targets() {
        let mut scene = Scene::new();
        scene.add_layer(LayerRecord::new(WALLS, "WALLS"));
        let model = scene.model_space();
        scene.add_entity(model, line_entity(1, WALLS).with_thickness(2.0));

        let (result, _) = collect(&scene, WalkOptions::default(), 1);
        let collected = result.expect("收集成功");
        let (_, entry) = collected.entries().next().expect("有几何");
        match &entry.geometry {
            Geometry::Extrusion { vector, capped, .. } => {
                assert_eq!(*vector, DVec3::new(0.0, 0.0, 2.0));
                assert!(!capped);
            }
            other => panic!("unexpected geometry: {other:?}"),
        }

        let flat = WalkOptions {
            target_3d: false,
            ..WalkOptions::default()
        };
        let (result, _) = collect(&scene, flat, 1);
        let collected = result.expect("收集成功");
        let (_, entry) = collected.entries().next().expect("有几何");
        assert_eq!(entry.geometry.kind(), "curve");
    }

    #[test]
    fn attributes_are_drawn_outside_the_definition() {
        let mut scene = scene_with_block();
        let mut root = scene.entity(EntityId::new(100)).cloned().expect("根实体存在");
        let attribute = DrawableEntity::with_primitives(
            EntityId::new(101),
            scene.passthrough_layer(),
            vec![Primitive::Text {
                position: Point3::new(5.0, 1.0, 0.0),
                content: "D-01".to_string(),
                height: 0.25,
                rotation: 0.0,
            }],
        );
        if let EntityKind::BlockReference(reference) = &mut root.kind {
            reference.attributes.push(attribute);
        }
        let model = scene.model_space();
        scene.add_entity(model, root);

        let (result, _) = collect(&scene, WalkOptions::default(), 100);
        let collected = result.expect("收集成功");
        assert_eq!(collected.order, vec![BlockId::new(10), model]);
        let text = &collected.buckets[&model][0];
        assert_eq!(text.transform, DAffine3::IDENTITY);
        assert_eq!(text.display.category, WALLS);
    }

    #[test]
    fn clip_range_filters_children() {
        let mut scene = scene_with_block();
        let far = DrawableEntity::with_primitives(
            EntityId::new(14),
            scene.passthrough_layer(),
            vec![Primitive::Point {
                position: Point3::new(50.0, 50.0, 0.0),
            }],
        );
        scene.add_entity(BlockId::new(10), far);
        let mut root = scene.entity(EntityId::new(100)).cloned().expect("根实体存在");
        if let EntityKind::BlockReference(reference) = &mut root.kind {
            reference.clip = Some(Range3::new(DVec3::splat(-1.0), DVec3::splat(2.0)));
        }
        let model = scene.model_space();
        scene.add_entity(model, root);

        let (result, _) = collect(&scene, WalkOptions::default(), 100);
        let collected = result.expect("收集成功");
        assert_eq!(collected.entry_count(), 2);
        assert!(collected.clipped);
    }

    /// 块 10 内嵌一个位于 `layer` 图层的参照，指向含 WALLS 直线 31 与 0 层直线 32 的块 30。
    fn scene_with_nested_on(layer: LayerRecord) -> Scene {
        let mut scene = scene_with_block();
        let nested_layer = layer.id;
        scene.add_layer(layer);
        scene.add_block(BlockDefinition::new(BlockId::new(30), "FRAME"));
        scene.add_entity(BlockId::new(30), line_entity(31, WALLS));
        let layer0 = scene.passthrough_layer();
        scene.add_entity(BlockId::new(30), line_entity(32, layer0));
        scene.add_entity(
            BlockId::new(10),
            DrawableEntity::new(
                EntityId::new(13),
                nested_layer,
                EntityKind::BlockReference(BlockReference::new(BlockId::new(30), DAffine3::IDENTITY)),
            ),
        );
        scene
    }

    #[test]
    fn off_nested_reference_still_draws_children_on_displayed_layers() {
        let mut off = LayerRecord::new(LayerId::new(7), "OFF");
        off.off = true;
        let scene = scene_with_nested_on(off);
        let (result, _) = collect(&scene, WalkOptions::default(), 100);
        let collected = result.expect("收集成功");
        let sources: Vec<EntityId> = collected.entries().map(|(_, entry)| entry.source).collect();
        // 0 层直线 32 随关闭的参照隐藏
        assert_eq!(sources, vec![EntityId::new(11), EntityId::new(12), EntityId::new(31)]);
        let walls_line = &collected.buckets[&BlockId::new(30)][0];
        assert_eq!(walls_line.display.category, WALLS);
    }

    #[test]
    fn frozen_nested_reference_prunes_its_subtree() {
        let mut frozen = LayerRecord::new(LayerId::new(8), "FROZEN");
        frozen.frozen = true;
        let scene = scene_with_nested_on(frozen);
        let (result, _) = collect(&scene, WalkOptions::default(), 100);
        let collected = result.expect("收集成功");
        assert_eq!(collected.entry_count(), 2);
        assert!(!collected.buckets.contains_key(&BlockId::new(30)));
    }

    #[test]
    fn row_of_dots_over_limit_is_reported_as_corrupt() {
        let mut scene = Scene::new();
        let layer0 = scene.passthrough_layer();
        let model = scene.model_space();
        scene.add_entity(
            model,
            DrawableEntity::with_primitives(
                EntityId::new(1),
                layer0,
                vec![Primitive::RowOfDots {
                    count: primitives::MAX_DOT_COUNT + 1,
                    start: Point3::new(0.0, 0.0, 0.0),
                    step: Vector3::new(1.0, 0.0, 0.0),
                }],
            ),
        );
        let (result, diagnostics) = collect(&scene, WalkOptions::default(), 1);
        assert!(result.expect("收集成功").is_empty());
        assert_eq!(diagnostics.count_category(IssueCategory::CorruptData), 1);
    }

    #[test]
    fn hidden_dimension_drops_definition_points() {
        let mut scene = Scene::new();
        let mut dims = LayerRecord::new(LayerId::new(5), "DIMS");
        dims.off = true;
        scene.add_layer(dims);
        let mut defpoints = LayerRecord::new(LayerId::new(6), "DEFPOINTS");
        defpoints.non_plot = true;
        scene.add_layer(defpoints);
        scene.add_block(BlockDefinition::new(BlockId::new(20), "*D1"));
        scene.add_entity(BlockId::new(20), line_entity(21, LayerId::new(6)));
        let dimension = DrawableEntity::new(
            EntityId::new(300),
            LayerId::new(5),
            EntityKind::Dimension(BlockReference::new(BlockId::new(20), DAffine3::IDENTITY)),
        );
        let mut diagnostics = Diagnostics::new();
        let cancel = CancellationToken::new();
        let mut collector =
            GeometryCollector::new(&scene, WalkOptions::default(), &mut diagnostics, &cancel);
        // 直接绘制引用：根可见性由调用方决定，这里只检查定义点过滤。
        let symbology = EffectiveSymbology::root_default(LayerId::new(5));
        collector
            .draw_entity(&dimension, symbology)
            .expect("绘制成功");
        assert!(collector.buckets.is_empty());
    }

    #[test]
    fn world_line_ignores_block_transform() {
        let mut scene = scene_with_block();
        let world = DrawableEntity::with_primitives(
            EntityId::new(15),
            scene.passthrough_layer(),
            vec![Primitive::WorldLine {
                start: Point3::new(0.0, 0.0, 0.0),
                end: Point3::new(0.0, 1.0, 0.0),
            }],
        );
        scene.add_entity(BlockId::new(10), world);
        let (result, _) = collect(&scene, WalkOptions::default(), 100);
        let collected = result.expect("收集成功");
        let bucket = &collected.buckets[&BlockId::new(10)];
        assert_eq!(bucket[2].transform, DAffine3::IDENTITY);
    }

    #[test]
    fn empty_text_and_unknown_kinds_are_reported() {
        let mut scene = Scene::new();
        let layer0 = scene.passthrough_layer();
        let model = scene.model_space();
        scene.add_entity(
            model,
            DrawableEntity::with_primitives(
                EntityId::new(1),
                layer0,
                vec![
                    Primitive::Text {
                        position: Point3::new(0.0, 0.0, 0.0),
                        content: "   ".to_string(),
                        height: 1.0,
                        rotation: 0.0,
                    },
                    Primitive::Unsupported {
                        kind: "image".to_string(),
                    },
                    Primitive::Xline {
                        base: Point3::new(0.0, 0.0, 0.0),
                        through: Point3::new(1.0, 0.0, 0.0),
                    },
                    Primitive::RowOfDots {
                        count: 0,
                        start: Point3::new(0.0, 0.0, 0.0),
                        step: Vector3::new(1.0, 0.0, 0.0),
                    },
                ],
            ),
        );
        let options = WalkOptions {
            infinite_line_length: 10.0,
            ..WalkOptions::default()
        };
        let (result, diagnostics) = collect(&scene, options, 1);
        let collected = result.expect("收集成功");
        assert_eq!(collected.entry_count(), 1);
        let (_, xline) = collected.entries().next().expect("构造线");
        let range = xline.geometry.range();
        assert!((range.min().x + 10.0).abs() < 1e-9);
        assert!((range.max().x - 10.0).abs() < 1e-9);
        assert_eq!(diagnostics.count_category(IssueCategory::Skipped), 1);
        assert_eq!(diagnostics.count_category(IssueCategory::UnsupportedPrimitive), 1);
    }

    #[test]
    fn shell_over_maximum_emits_one_diagnostic() {
        let mut scene = Scene::new();
        let layer0 = scene.passthrough_layer();
        let model = scene.model_space();
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
        ];
        let mut faces = Vec::new();
        while faces.len() <= primitives::LARGE_FACE_LIST {
            faces.extend([3, 0, 1, 2]);
        }
        faces.push(500);
        scene.add_entity(
            model,
            DrawableEntity::with_primitives(
                EntityId::new(1),
                layer0,
                vec![
                    Primitive::Shell {
                        points: points.clone(),
                        faces,
                        edge_visibility: None,
                        overrides: ColorOverrides::default(),
                    },
                    Primitive::Polygon { points },
                ],
            ),
        );
        let flat = WalkOptions {
            target_3d: false,
            ..WalkOptions::default()
        };
        let (result, diagnostics) = collect(&scene, flat, 1);
        let collected = result.expect("收集成功");
        assert_eq!(collected.entry_count(), 1);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics.count_category(IssueCategory::CorruptData), 1);
    }

    #[test]
    fn mesh_override_takes_first_edge_color() {
        let mut scene = Scene::new();
        let layer0 = scene.passthrough_layer();
        let model = scene.model_space();
        scene.add_entity(
            model,
            DrawableEntity::with_primitives(
                EntityId::new(1),
                layer0,
                vec![Primitive::Mesh {
                    rows: 2,
                    columns: 2,
                    points: vec![
                        Point3::new(0.0, 0.0, 0.0),
                        Point3::new(1.0, 0.0, 0.0),
                        Point3::new(0.0, 1.0, 0.0),
                        Point3::new(1.0, 1.0, 0.0),
                    ],
                    overrides: ColorOverrides {
                        face_colors: vec![Color::Indexed(2)],
                        edge_colors: vec![Color::Indexed(4), Color::Indexed(6)],
                    },
                }],
            )
            .with_color(Symbology::Absolute(Color::Indexed(9))),
        );
        let (result, _) = collect(&scene, WalkOptions::default(), 1);
        let collected = result.expect("收集成功");
        let (_, entry) = collected.entries().next().expect("网格");
        assert_eq!(entry.display.color, Color::Indexed(4));
        assert_eq!(entry.display.fill, FillMode::Unfilled);
        assert_eq!(entry.geometry.kind(), "shape");
    }

    #[test]
    fn collecting_twice_is_idempotent() {
        let scene = scene_with_block();
        let (first, _) = collect(&scene, WalkOptions::default(), 100);
        let (second, _) = collect(&scene, WalkOptions::default(), 100);
        assert_eq!(first.expect("收集成功"), second.expect("收集成功"));
    }
}

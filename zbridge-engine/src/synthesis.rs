//! 元素与共享部件合成。
//!
//! 一次实例化的分桶几何要么写成引用共享部件的元素，要么展平为独立元素。
//! 共享部件缓存跨实例化复用，由导入会话持有。

use std::collections::HashMap;

use glam::{DAffine3, DVec3};
use serde::Serialize;
use tracing::{debug, warn};
use zbridge_core::geometry::Range3;
use zbridge_core::scene::{BlockId, DrawableEntity, LayerId, SceneReader};
use zbridge_core::transform::{Decomposition, decompose};

use crate::diagnostics::{Diagnostic, DiagnosticsSink, IssueCategory};
use crate::symbology::{DisplayParams, FillMode};
use crate::target::{
    ElementId, ElementPayload, GeometryPart, InsertOutcome, PartId, PartInstance, PlacedGeometry,
    TargetElement, TargetStore,
};
use crate::walker::{CollectedGeometry, GeometryEntry};

/// 比例量化步长，相等比例得到相同的键。
pub const SCALE_QUANTUM: f64 = 1.0 / SCALE_STEPS;
const SCALE_STEPS: f64 = 1.0e9;
/// 相对变换视为已对齐的容差。
const ALIGNED_TOLERANCE: f64 = 1.0e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScaleKey {
    magnitude: i64,
    mirrored: bool,
}

impl ScaleKey {
    pub fn new(scale: f64) -> Self {
        Self {
            magnitude: (scale.abs() * SCALE_STEPS).round() as i64,
            mirrored: scale.is_sign_negative(),
        }
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude as f64 / SCALE_STEPS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedPartKey {
    pub definition: BlockId,
    pub layer: LayerId,
    pub scale: ScaleKey,
    /// 条目在其块定义桶中的序号。
    pub sequence: usize,
}

impl SharedPartKey {
    pub fn code(&self) -> String {
        let mut code = format!("{}-{}-{}", self.definition, self.layer, self.sequence);
        let magnitude = self.scale.magnitude();
        if (magnitude - 1.0).abs() > SCALE_QUANTUM {
            code.push_str(&format!("-x{magnitude}"));
        }
        if self.scale.mirrored {
            code.push_str("-m");
        }
        code
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharedPartEntry {
    pub part: PartId,
    pub range: Range3,
    pub scale: f64,
}

/// 导入会话内的共享部件缓存。不同会话不得共用。
#[derive(Debug, Default)]
pub struct PartCache {
    entries: HashMap<SharedPartKey, SharedPartEntry>,
}

impl PartCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SharedPartKey) -> Option<&SharedPartEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: SharedPartKey, entry: SharedPartEntry) {
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SharedPartKey> {
        self.entries.keys()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SharedParts,
    IndividualElements,
    Placeholder,
    /// 没有几何也没有附加数据。
    Abandoned,
    Hidden,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutcome {
    pub strategy: Strategy,
    pub elements: Vec<ElementId>,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub parts_created: usize,
    pub parts_reused: usize,
    pub duplicates: usize,
}

impl SynthesisOutcome {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            elements: Vec::new(),
            chunks: 0,
            failed_chunks: 0,
            parts_created: 0,
            parts_reused: 0,
            duplicates: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failed_chunks == 0 && self.strategy != Strategy::Abandoned
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisOptions {
    pub shared_parts: bool,
    /// 单个元素的几何体量上限（点数）。
    pub max_chunk_weight: usize,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            shared_parts: true,
            max_chunk_weight: 10_000,
        }
    }
}

struct Chunk<T> {
    category: LayerId,
    weight: usize,
    items: Vec<T>,
}

/// 类别变化或超出体量上限时开启新块。
fn chunk_by<T>(
    items: impl IntoIterator<Item = T>,
    max_weight: usize,
    measure: impl Fn(&T) -> (LayerId, usize),
) -> Vec<Chunk<T>> {
    let mut chunks: Vec<Chunk<T>> = Vec::new();
    for item in items {
        let (category, weight) = measure(&item);
        let start_new = match chunks.last() {
            None => true,
            Some(chunk) => {
                chunk.category != category
                    || (!chunk.items.is_empty() && chunk.weight + weight > max_weight)
            }
        };
        if start_new {
            chunks.push(Chunk {
                category,
                weight: 0,
                items: Vec::new(),
            });
        }
        if let Some(chunk) = chunks.last_mut() {
            chunk.weight += weight;
            chunk.items.push(item);
        }
    }
    chunks
}

struct PlannedInstance<'c> {
    entry: &'c GeometryEntry,
    sequence: usize,
    relative: Decomposition,
}

struct SharedPlan<'c> {
    placement: DAffine3,
    instances: Vec<PlannedInstance<'c>>,
    /// 模型空间中的条目（根参照的属性），内容随实例变化，不进入部件缓存。
    loose: Vec<&'c GeometryEntry>,
}

pub struct ElementSynthesizer<'a> {
    options: SynthesisOptions,
    cache: &'a mut PartCache,
    store: &'a mut dyn TargetStore,
    diagnostics: &'a mut dyn DiagnosticsSink,
}

impl<'a> ElementSynthesizer<'a> {
    pub fn new(
        options: SynthesisOptions,
        cache: &'a mut PartCache,
        store: &'a mut dyn TargetStore,
        diagnostics: &'a mut dyn DiagnosticsSink,
    ) -> Self {
        Self {
            options,
            cache,
            store,
            diagnostics,
        }
    }

    pub fn synthesize<S: SceneReader + ?Sized>(
        &mut self,
        scene: &S,
        entity: &DrawableEntity,
        collected: &CollectedGeometry,
    ) -> SynthesisOutcome {
        if !entity.visible || !collected.symbology.visible {
            return SynthesisOutcome::new(Strategy::Hidden);
        }
        let display = collected
            .symbology
            .display(entity.linetype_scale, FillMode::Unfilled);

        if collected.is_empty() {
            return self.empty_geometry(entity, collected, display);
        }

        let mut outcome = match self.shared_plan(scene, entity, collected) {
            Some(plan) => self.emit_shared(scene, entity, display, plan),
            None => self.emit_individual(entity, collected, display),
        };
        if outcome.failed_chunks > 0 {
            warn!(
                entity = %entity.id,
                failed = outcome.failed_chunks,
                total = outcome.chunks,
                "部分元素写入失败"
            );
            self.diagnostics.report(Diagnostic::error(
                IssueCategory::ElementFailure,
                format!(
                    "{} of {} chunks failed for entity {}",
                    outcome.failed_chunks, outcome.chunks, entity.id
                ),
            ));
        }
        if outcome.elements.is_empty() && outcome.duplicates == 0 && outcome.failed_chunks == 0 {
            outcome.strategy = Strategy::Abandoned;
        }
        outcome
    }

    fn empty_geometry(
        &mut self,
        entity: &DrawableEntity,
        collected: &CollectedGeometry,
        display: DisplayParams,
    ) -> SynthesisOutcome {
        if !entity.hosts_attached_data() {
            debug!(entity = %entity.id, "实体没有几何，放弃转换");
            self.diagnostics.report(Diagnostic::warning(
                IssueCategory::EmptyGeometry,
                format!("entity {} produced no geometry", entity.id),
            ));
            return SynthesisOutcome::new(Strategy::Abandoned);
        }

        let placement = collected
            .placement
            .and_then(|placement| rigid_frame(&placement))
            .unwrap_or(DAffine3::IDENTITY);
        let element = TargetElement {
            source: entity.id,
            code: element_code(entity, 0),
            category: collected.symbology.layer,
            placement,
            display,
            payload: ElementPayload::Empty,
        };
        let mut outcome = SynthesisOutcome::new(Strategy::Placeholder);
        outcome.chunks = 1;
        self.insert_element(&element, &mut outcome);
        outcome
    }

    /// 共享条件：开启共享、命名块参照、无裁剪、放置变换及所有相对变换均可分解。
    fn shared_plan<'c, S: SceneReader + ?Sized>(
        &self,
        scene: &S,
        entity: &DrawableEntity,
        collected: &'c CollectedGeometry,
    ) -> Option<SharedPlan<'c>> {
        if !self.options.shared_parts || entity.is_dimension() {
            return None;
        }
        let definition = scene.block(collected.definition?)?;
        if definition.anonymous {
            return None;
        }
        if collected.clipped {
            debug!(entity = %entity.id, "参照带裁剪范围，改为独立元素");
            return None;
        }
        let base = match decompose(&collected.placement?) {
            Ok(base) if !base.degenerate => base,
            Ok(_) => {
                debug!(entity = %entity.id, "放置变换奇异，改为独立元素");
                return None;
            }
            Err(error) => {
                debug!(entity = %entity.id, %error, "放置变换无法分解，改为独立元素");
                return None;
            }
        };

        let placement = base.rigid();
        let inverse = placement.inverse();
        let model_space = scene.model_space();
        let mut instances = Vec::with_capacity(collected.entry_count());
        let mut loose = Vec::new();
        for (sequence, entry) in collected.entries() {
            if entry.container == model_space {
                loose.push(entry);
                continue;
            }
            match decompose(&(inverse * entry.transform)) {
                Ok(relative) if !relative.degenerate => instances.push(PlannedInstance {
                    entry,
                    sequence,
                    relative,
                }),
                _ => {
                    debug!(entity = %entity.id, sequence, "相对变换无法分解，整体改为独立元素");
                    return None;
                }
            }
        }
        Some(SharedPlan {
            placement,
            instances,
            loose,
        })
    }

    fn emit_shared<S: SceneReader + ?Sized>(
        &mut self,
        scene: &S,
        entity: &DrawableEntity,
        display: DisplayParams,
        plan: SharedPlan<'_>,
    ) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::new(Strategy::SharedParts);
        let chunks = chunk_by(plan.instances, self.options.max_chunk_weight, |planned| {
            (planned.entry.display.category, planned.entry.geometry.weight())
        });
        outcome.chunks = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut instances = Vec::with_capacity(chunk.items.len());
            let mut failed = false;
            for planned in &chunk.items {
                match self.shared_part(scene, planned, &mut outcome) {
                    Some(entry) => instances.push(PartInstance {
                        part: entry.part,
                        transform: planned.relative.rigid(),
                        scale: planned.relative.scale,
                        display: planned.entry.display,
                    }),
                    None => {
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                outcome.failed_chunks += 1;
                continue;
            }
            let element = TargetElement {
                source: entity.id,
                code: element_code(entity, index),
                category: chunk.category,
                placement: plan.placement,
                display,
                payload: ElementPayload::Parts { instances },
            };
            self.insert_element(&element, &mut outcome);
        }

        let inverse = plan.placement.inverse();
        let placed = plan
            .loose
            .into_iter()
            .map(|entry| inline_geometry(&inverse, entry));
        let first_index = outcome.chunks;
        self.emit_inline(entity, plan.placement, display, placed, first_index, &mut outcome);
        outcome
    }

    fn shared_part<S: SceneReader + ?Sized>(
        &mut self,
        scene: &S,
        planned: &PlannedInstance<'_>,
        outcome: &mut SynthesisOutcome,
    ) -> Option<SharedPartEntry> {
        let entry = planned.entry;
        let key = SharedPartKey {
            definition: entry.container,
            layer: entry.display.category,
            scale: ScaleKey::new(planned.relative.scale),
            sequence: planned.sequence,
        };
        if let Some(cached) = self.cache.get(&key) {
            outcome.parts_reused += 1;
            return Some(*cached);
        }

        let mut geometry = entry.geometry.clone();
        if (planned.relative.scale - 1.0).abs() > SCALE_QUANTUM {
            geometry.transform(&DAffine3::from_scale(DVec3::splat(planned.relative.scale)));
        }
        let part = GeometryPart {
            code: key.code(),
            namespace: scene
                .block(entry.container)
                .map(|block| block.name.clone())
                .unwrap_or_default(),
            geometry,
        };
        match self.store.insert_part(&part) {
            Ok((id, range)) => {
                debug!(code = %part.code, "创建共享部件");
                let cached = SharedPartEntry {
                    part: id,
                    range,
                    scale: planned.relative.scale,
                };
                self.cache.insert(key, cached);
                outcome.parts_created += 1;
                Some(cached)
            }
            Err(error) => {
                warn!(code = %part.code, %error, "共享部件写入失败");
                None
            }
        }
    }

    fn emit_individual(
        &mut self,
        entity: &DrawableEntity,
        collected: &CollectedGeometry,
        display: DisplayParams,
    ) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::new(Strategy::IndividualElements);
        let Some((_, first)) = collected.entries().next() else {
            return outcome;
        };
        let frame = collected
            .placement
            .and_then(|placement| rigid_frame(&placement))
            .or_else(|| rigid_frame(&first.transform))
            .unwrap_or_else(|| DAffine3::from_translation(first.transform.translation));
        let inverse = frame.inverse();

        let placed = collected
            .entries()
            .map(|(_, entry)| inline_geometry(&inverse, entry));
        self.emit_inline(entity, frame, display, placed, 0, &mut outcome);
        debug!(entity = %entity.id, chunks = outcome.chunks, "写入独立元素");
        outcome
    }

    /// 内联几何按类别与体量分块，元素编号从 `first_index` 起。
    fn emit_inline(
        &mut self,
        entity: &DrawableEntity,
        frame: DAffine3,
        display: DisplayParams,
        placed: impl Iterator<Item = PlacedGeometry>,
        first_index: usize,
        outcome: &mut SynthesisOutcome,
    ) {
        let chunks = chunk_by(placed, self.options.max_chunk_weight, |placed| {
            (placed.display.category, placed.geometry.weight())
        });
        outcome.chunks += chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let element = TargetElement {
                source: entity.id,
                code: element_code(entity, first_index + index),
                category: chunk.category,
                placement: frame,
                display,
                payload: ElementPayload::Inline {
                    geometry: chunk.items,
                },
            };
            self.insert_element(&element, outcome);
        }
    }

    fn insert_element(&mut self, element: &TargetElement, outcome: &mut SynthesisOutcome) {
        match self.store.insert_element(element) {
            InsertOutcome::Inserted(id) => outcome.elements.push(id),
            InsertOutcome::Duplicate => {
                debug!(code = %element.code, "元素已存在，跳过");
                outcome.duplicates += 1;
            }
            InsertOutcome::Failed(reason) => {
                warn!(code = %element.code, %reason, "元素写入失败");
                outcome.failed_chunks += 1;
            }
        }
    }
}

fn element_code(entity: &DrawableEntity, chunk: usize) -> String {
    format!("{}-{}", entity.id, chunk)
}

/// 可分解且非奇异时取刚体部分。
fn rigid_frame(transform: &DAffine3) -> Option<DAffine3> {
    decompose(transform)
        .ok()
        .filter(|decomposition| !decomposition.degenerate)
        .map(|decomposition| decomposition.rigid())
}

/// 把条目几何变换到元素坐标系；已对齐时保持原样。
fn inline_geometry(inverse: &DAffine3, entry: &GeometryEntry) -> PlacedGeometry {
    let relative = *inverse * entry.transform;
    let mut geometry = entry.geometry.clone();
    if !relative.abs_diff_eq(DAffine3::IDENTITY, ALIGNED_TOLERANCE) {
        geometry.transform(&relative);
    }
    PlacedGeometry {
        display: entry.display,
        geometry,
    }
}

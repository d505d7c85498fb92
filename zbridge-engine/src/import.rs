//! 导入驱动：遍历模型空间顶层实体，逐个收集并合成元素。

use glam::DAffine3;
use serde::Serialize;
use tracing::{info, warn};
use zbridge_core::scene::{EntityId, SceneReader};

use crate::cancel::CancellationToken;
use crate::diagnostics::{Diagnostic, DiagnosticRecord, Diagnostics, DiagnosticsSink, IssueCategory};
use crate::errors::EngineError;
use crate::synthesis::{
    ElementSynthesizer, PartCache, Strategy, SynthesisOptions, SynthesisOutcome,
};
use crate::target::TargetStore;
use crate::walker::{GeometryCollector, WalkOptions};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImportOptions {
    pub shared_parts: bool,
    pub target_3d: bool,
    pub max_chunk_weight: usize,
    pub infinite_line_length: f64,
    pub prefer_face_colors: bool,
    /// 源坐标到目标坐标的基准变换。
    pub base_transform: DAffine3,
}

impl Default for ImportOptions {
    fn default() -> Self {
        let walk = WalkOptions::default();
        let synthesis = SynthesisOptions::default();
        Self {
            shared_parts: synthesis.shared_parts,
            target_3d: walk.target_3d,
            max_chunk_weight: synthesis.max_chunk_weight,
            infinite_line_length: walk.infinite_line_length,
            prefer_face_colors: walk.prefer_face_colors,
            base_transform: DAffine3::IDENTITY,
        }
    }
}

impl ImportOptions {
    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            target_3d: self.target_3d,
            infinite_line_length: self.infinite_line_length,
            prefer_face_colors: self.prefer_face_colors,
        }
    }

    pub fn synthesis_options(&self) -> SynthesisOptions {
        SynthesisOptions {
            shared_parts: self.shared_parts,
            max_chunk_weight: self.max_chunk_weight.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elements: usize,
    pub parts_created: usize,
    pub parts_reused: usize,
    pub duplicates: usize,
    pub cancelled: bool,
    pub diagnostics: Vec<DiagnosticRecord>,
}

impl ImportReport {
    fn record(&mut self, outcome: &SynthesisOutcome) {
        match outcome.strategy {
            Strategy::Hidden | Strategy::Abandoned => self.skipped += 1,
            _ if outcome.failed_chunks > 0 => self.failed += 1,
            _ => self.converted += 1,
        }
        self.elements += outcome.elements.len();
        self.parts_created += outcome.parts_created;
        self.parts_reused += outcome.parts_reused;
        self.duplicates += outcome.duplicates;
    }
}

/// 一次导入会话。共享部件缓存只在会话内有效。
#[derive(Debug, Default)]
pub struct ImportSession {
    options: ImportOptions,
    cache: PartCache,
    diagnostics: Diagnostics,
    cancel: CancellationToken,
}

impl ImportSession {
    pub fn new(options: ImportOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// 可跨线程请求取消的句柄。
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn part_cache(&self) -> &PartCache {
        &self.cache
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// 转换单个实体。遍历期间取消时不写入任何元素。
    pub fn convert_entity<S: SceneReader + ?Sized>(
        &mut self,
        scene: &S,
        id: EntityId,
        store: &mut dyn TargetStore,
    ) -> Result<SynthesisOutcome, EngineError> {
        let entity = scene
            .entity(id)
            .ok_or(EngineError::MissingEntity(id.get()))?;
        let collected = {
            let mut collector = GeometryCollector::new(
                scene,
                self.options.walk_options(),
                &mut self.diagnostics,
                &self.cancel,
            )
            .with_base(self.options.base_transform);
            collector.collect(entity)?
        };
        let outcome = ElementSynthesizer::new(
            self.options.synthesis_options(),
            &mut self.cache,
            store,
            &mut self.diagnostics,
        )
        .synthesize(scene, entity, &collected);
        Ok(outcome)
    }

    pub fn import_scene<S: SceneReader + ?Sized>(
        &mut self,
        scene: &S,
        store: &mut dyn TargetStore,
    ) -> ImportReport {
        let mut report = ImportReport::default();
        for &id in scene.top_level() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.convert_entity(scene, id, store) {
                Ok(outcome) => report.record(&outcome),
                Err(EngineError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(error) => {
                    warn!(entity = %id, %error, "实体转换失败");
                    report.failed += 1;
                    let category = match error {
                        EngineError::MissingBlock(_) | EngineError::MissingEntity(_) => {
                            IssueCategory::MissingReference
                        }
                        _ => IssueCategory::CorruptData,
                    };
                    self.diagnostics.report(Diagnostic::error(
                        category,
                        format!("entity {id} not converted: {error}"),
                    ));
                }
            }
        }
        if report.cancelled {
            warn!("导入已取消，仅保留已完成的实体");
            self.diagnostics.report(Diagnostic::warning(
                IssueCategory::Cancelled,
                "import cancelled; remaining entities were not converted",
            ));
        }

        report.diagnostics = self.diagnostics.records().to_vec();
        info!(
            converted = report.converted,
            skipped = report.skipped,
            failed = report.failed,
            elements = report.elements,
            parts_created = report.parts_created,
            parts_reused = report.parts_reused,
            diagnostics = report.diagnostics.len(),
            "导入完成"
        );
        report
    }
}

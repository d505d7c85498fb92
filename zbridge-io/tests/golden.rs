use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use zbridge_engine::import::ImportReport;
use zbridge_engine::target::ElementPayload;
use zbridge_io::MemoryStore;
use zbridge_io::store::ElementRecord;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct GoldenImport {
    report: GoldenReport,
    parts: Vec<GoldenPart>,
    elements: Vec<GoldenElement>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct GoldenReport {
    converted: usize,
    skipped: usize,
    failed: usize,
    elements: usize,
    parts_created: usize,
    parts_reused: usize,
    duplicates: usize,
    cancelled: bool,
    diagnostics: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct GoldenPart {
    code: String,
    namespace: String,
    kind: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct GoldenElement {
    code: String,
    category: u64,
    payload: String,
    /// 内联几何的种类，或引用的共享部件编码。
    items: Vec<String>,
}

pub fn assert_golden(name: &str, store: &MemoryStore, report: &ImportReport) {
    let snapshot = GoldenImport::from_store(store, report);
    let base_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data/golden");
    if let Err(err) = fs::create_dir_all(&base_dir) {
        panic!("无法创建黄金数据目录 {}: {err}", base_dir.display());
    }
    let golden_path = base_dir.join(format!("{name}.json"));
    let serialized = serde_json::to_string_pretty(&snapshot).expect("序列化黄金快照失败");

    if !golden_path.exists() {
        fs::write(&golden_path, &serialized)
            .unwrap_or_else(|err| panic!("写入黄金文件 {} 失败: {err}", golden_path.display()));
        panic!(
            "黄金文件 {} 不存在，已自动生成。请确认内容后重新运行测试。",
            golden_path.display()
        );
    }

    let expected_str = fs::read_to_string(&golden_path)
        .unwrap_or_else(|err| panic!("读取黄金文件 {} 失败: {err}", golden_path.display()));
    let expected: GoldenImport = serde_json::from_str(&expected_str)
        .unwrap_or_else(|err| panic!("解析黄金文件 {} 失败: {err}", golden_path.display()));

    if expected != snapshot {
        let diff_path = base_dir.join(format!("{name}.actual.json"));
        fs::write(&diff_path, &serialized).expect("写入差异文件失败");
        panic!(
            "黄金文件 {} 与当前导入结果不一致。已生成对照输出 {}。",
            golden_path.display(),
            diff_path.display()
        );
    }
}

impl GoldenImport {
    fn from_store(store: &MemoryStore, report: &ImportReport) -> Self {
        let report = GoldenReport {
            converted: report.converted,
            skipped: report.skipped,
            failed: report.failed,
            elements: report.elements,
            parts_created: report.parts_created,
            parts_reused: report.parts_reused,
            duplicates: report.duplicates,
            cancelled: report.cancelled,
            diagnostics: report
                .diagnostics
                .iter()
                .map(|record| format!("{}: {}", record.category, record.message))
                .collect(),
        };

        let parts = store
            .parts()
            .iter()
            .map(|record| GoldenPart {
                code: record.part.code.clone(),
                namespace: record.part.namespace.clone(),
                kind: record.part.geometry.kind().to_string(),
            })
            .collect();

        let elements = store
            .elements()
            .iter()
            .map(|record| element_snapshot(store, record))
            .collect();

        Self {
            report,
            parts,
            elements,
        }
    }
}

fn element_snapshot(store: &MemoryStore, record: &ElementRecord) -> GoldenElement {
    let element = &record.element;
    let (payload, items) = match &element.payload {
        ElementPayload::Inline { geometry } => (
            "inline",
            geometry
                .iter()
                .map(|placed| placed.geometry.kind().to_string())
                .collect(),
        ),
        ElementPayload::Parts { instances } => (
            "parts",
            instances
                .iter()
                .map(|instance| {
                    store
                        .part(instance.part)
                        .map(|part| part.part.code.clone())
                        .unwrap_or_else(|| format!("<missing {}>", instance.part.get()))
                })
                .collect(),
        ),
        ElementPayload::Empty => ("empty", Vec::new()),
    };
    GoldenElement {
        code: element.code.clone(),
        category: element.category.get(),
        payload: payload.to_string(),
        items,
    }
}

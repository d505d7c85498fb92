use std::path::Path;

use zbridge_engine::diagnostics::Severity;
use zbridge_engine::import::ImportReport;

pub fn print_report(report: &ImportReport, output: &Path) {
    println!("转换完成：{}", output.display());
    println!(
        "  实体: 成功 {} / 跳过 {} / 失败 {}",
        report.converted, report.skipped, report.failed
    );
    println!(
        "  元素 {}，共享部件 新建 {} / 复用 {}，重复 {}",
        report.elements, report.parts_created, report.parts_reused, report.duplicates
    );
    if report.cancelled {
        println!("  导入被取消，结果不完整");
    }
    if report.diagnostics.is_empty() {
        return;
    }
    println!("诊断：");
    for record in &report.diagnostics {
        let level = match record.severity {
            Severity::Info => "信息",
            Severity::Warning => "警告",
            Severity::Error => "错误",
        };
        if record.occurrences > 1 {
            println!(
                "  [{level}] {}: {} (x{})",
                record.category, record.message, record.occurrences
            );
        } else {
            println!("  [{level}] {}: {}", record.category, record.message);
        }
    }
}

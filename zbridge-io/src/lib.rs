use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use zbridge_core::scene::Scene;
use zbridge_engine::import::ImportReport;

pub mod scene_json;
pub mod store;

pub use scene_json::JsonSceneLoader;
pub use store::MemoryStore;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait SceneLoader {
    fn load(&self, path: &Path) -> Result<Scene, IoError>;
}

pub trait ResultWriter {
    fn write(&self, store: &MemoryStore, report: &ImportReport, path: &Path) -> Result<(), IoError>;
}

#[derive(Serialize)]
struct ResultDocument<'a> {
    report: &'a ImportReport,
    parts: &'a [store::PartRecord],
    elements: &'a [store::ElementRecord],
}

/// 把目标存储内容与导入报告写成 JSON。
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResultWriter {
    pub pretty: bool,
}

impl JsonResultWriter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    pub fn to_string(&self, store: &MemoryStore, report: &ImportReport) -> Result<String, IoError> {
        let document = ResultDocument {
            report,
            parts: store.parts(),
            elements: store.elements(),
        };
        let text = if self.pretty {
            serde_json::to_string_pretty(&document)?
        } else {
            serde_json::to_string(&document)?
        };
        Ok(text)
    }
}

impl ResultWriter for JsonResultWriter {
    fn write(&self, store: &MemoryStore, report: &ImportReport, path: &Path) -> Result<(), IoError> {
        let text = self.to_string(store, report)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| IoError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, text).map_err(|source| IoError::WriteError {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "结果已写入");
        Ok(())
    }
}

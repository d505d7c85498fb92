use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use zbridge_engine::import::ImportOptions;

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.import.validate()?;
        Ok(config)
    }

    /// 自动发现配置文件：优先读取环境变量 `ZBRIDGE_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os("ZBRIDGE_CONFIG") {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 转换行为开关。
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "ImportConfig::default_true")]
    pub shared_parts: bool,
    #[serde(default = "ImportConfig::default_true")]
    pub target_3d: bool,
    #[serde(default = "ImportConfig::default_max_chunk_weight")]
    pub max_chunk_weight: usize,
    #[serde(default = "ImportConfig::default_infinite_line_length")]
    pub infinite_line_length: f64,
    #[serde(default)]
    pub prefer_face_colors: bool,
}

impl ImportConfig {
    fn default_true() -> bool {
        true
    }

    fn default_max_chunk_weight() -> usize {
        ImportOptions::default().max_chunk_weight
    }

    fn default_infinite_line_length() -> f64 {
        ImportOptions::default().infinite_line_length
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_weight == 0 {
            return Err(ConfigError::Invalid(
                "import.max_chunk_weight 必须大于 0".to_string(),
            ));
        }
        if !self.infinite_line_length.is_finite() || self.infinite_line_length <= 0.0 {
            return Err(ConfigError::Invalid(
                "import.infinite_line_length 必须为正的有限值".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_options(&self) -> ImportOptions {
        ImportOptions {
            shared_parts: self.shared_parts,
            target_3d: self.target_3d,
            max_chunk_weight: self.max_chunk_weight,
            infinite_line_length: self.infinite_line_length,
            prefer_face_colors: self.prefer_face_colors,
            ..ImportOptions::default()
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            shared_parts: true,
            target_3d: true,
            max_chunk_weight: Self::default_max_chunk_weight(),
            infinite_line_length: Self::default_infinite_line_length(),
            prefer_face_colors: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// 结果文件目录；缺省时写在场景文件旁。
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "OutputConfig::default_pretty")]
    pub pretty: bool,
}

impl OutputConfig {
    fn default_pretty() -> bool {
        true
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: None,
            pretty: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("配置无效: {0}")]
    Invalid(String),
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

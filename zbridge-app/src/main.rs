use std::path::{Path, PathBuf};

use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use zbridge_config::{AppConfig, ConfigError};
use zbridge_engine::import::ImportSession;
use zbridge_io::{JsonResultWriter, JsonSceneLoader, MemoryStore, ResultWriter, SceneLoader};

mod summary;

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    target_3d: Option<bool>,
    no_shared_parts: bool,
    scene: Option<PathBuf>,
}

fn main() {
    let args = parse_args();
    let Some(scene_path) = args.scene.clone() else {
        eprintln!("用法: zbridge [--config PATH] [--output PATH] [--2d|--3d] [--no-shared-parts] SCENE.json");
        std::process::exit(1);
    };

    let config = load_configuration(args.config.clone());
    init_logging(&config);
    info!(scene = %scene_path.display(), "启动场景转换");

    let scene = match JsonSceneLoader::new().load(&scene_path) {
        Ok(scene) => scene,
        Err(err) => {
            error!(path = %scene_path.display(), error = %err, "读取场景失败");
            std::process::exit(1);
        }
    };

    let mut options = config.import.to_options();
    if let Some(target_3d) = args.target_3d {
        options.target_3d = target_3d;
    }
    if args.no_shared_parts {
        options.shared_parts = false;
    }

    let mut store = MemoryStore::new();
    let mut session = ImportSession::new(options);
    let report = session.import_scene(&scene, &mut store);

    let output = output_path(&args, &config, &scene_path);
    if let Err(err) = JsonResultWriter::new(config.output.pretty).write(&store, &report, &output) {
        error!(path = %output.display(), error = %err, "写入结果失败");
        std::process::exit(1);
    }

    summary::print_report(&report, &output);
    if report.failed > 0 || report.cancelled {
        std::process::exit(2);
    }
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--2d" => parsed.target_3d = Some(false),
            "--3d" => parsed.target_3d = Some(true),
            "--no-shared-parts" => parsed.no_shared_parts = true,
            "--config" => {
                let Some(path) = args.next() else {
                    eprintln!("`--config` 需要提供配置文件路径");
                    std::process::exit(1);
                };
                parsed.config = Some(PathBuf::from(path));
            }
            "--output" => {
                let Some(path) = args.next() else {
                    eprintln!("`--output` 需要提供输出文件路径");
                    std::process::exit(1);
                };
                parsed.output = Some(PathBuf::from(path));
            }
            other if other.starts_with("--") => {
                eprintln!("未知参数：{other}");
                std::process::exit(1);
            }
            other => {
                if parsed.scene.is_some() {
                    eprintln!("只能指定一个场景文件：{other}");
                    std::process::exit(1);
                }
                parsed.scene = Some(PathBuf::from(other));
            }
        }
    }
    parsed
}

/// 输出路径：命令行优先，其次配置目录，最后写在场景文件旁。
fn output_path(args: &CliArgs, config: &AppConfig, scene: &Path) -> PathBuf {
    if let Some(path) = &args.output {
        return path.clone();
    }
    let stem = scene
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "scene".to_string());
    let file_name = format!("{stem}.result.json");
    match &config.output.directory {
        Some(directory) => directory.join(file_name),
        None => scene.with_file_name(file_name),
    }
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "加载指定配置失败，使用默认配置");
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                        warn!(path = %path.display(), error = %err, "加载默认配置失败，使用内建默认值");
                    }
                    ConfigError::Invalid(_) | ConfigError::Context { .. } => {
                        warn!(error = %err, "加载默认配置失败，使用内建默认值");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_defaults_next_to_scene() {
        let args = CliArgs::default();
        let config = AppConfig::default();
        let path = output_path(&args, &config, Path::new("drawings/office.json"));
        assert_eq!(path, PathBuf::from("drawings/office.result.json"));
    }

    #[test]
    fn output_prefers_command_line_then_config() {
        let mut config = AppConfig::default();
        config.output.directory = Some(PathBuf::from("out"));
        let scene = Path::new("drawings/office.json");

        let args = CliArgs::default();
        assert_eq!(
            output_path(&args, &config, scene),
            PathBuf::from("out/office.result.json")
        );

        let args = CliArgs {
            output: Some(PathBuf::from("custom.json")),
            ..CliArgs::default()
        };
        assert_eq!(output_path(&args, &config, scene), PathBuf::from("custom.json"));
    }
}

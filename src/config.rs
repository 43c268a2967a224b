//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读默认 TOML，再读显式指定的文件，最后用环境变量 `STORYLOOM__*` 覆盖
//! （双下划线表示嵌套，如 `STORYLOOM__TURN__MAX_ROUNDS=3`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::turn::TurnConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub turn: TurnConfig,
    pub llm: LlmSection,
    pub memory: MemorySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：采样参数（具体厂商接入不在本 crate 内）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemorySection {
    /// 设置后 save() 将全部记忆写入该 JSON 文件
    pub snapshot_path: Option<PathBuf>,
}

impl AppConfig {
    /// 合并 [turn] 与 [llm] 段得到驱动器配置；[turn] 中显式设置的采样参数优先
    pub fn turn_config(&self) -> TurnConfig {
        let mut turn = self.turn.clone();
        turn.max_tokens = turn.max_tokens.or(self.llm.max_tokens);
        turn.temperature = turn.temperature.or(self.llm.temperature);
        turn
    }

    pub fn app_name(&self) -> &str {
        self.app.name.as_deref().unwrap_or("storyloom")
    }
}

/// 加载配置；config_path 为可选的额外文件，存在时覆盖默认文件中的同名项
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STORYLOOM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

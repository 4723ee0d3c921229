use crate::core::pipeline::DEFAULT_CHANNEL_CAPACITY;
use crate::utils::error::{Result, StageError};
use crate::utils::validation::{validate_non_empty_string, validate_positive_number, Validate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub description: Option<String>,
    pub channel_capacity: Option<usize>,
    pub halt_on_error: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    #[default]
    Sync,
    Async,
}

/// 非同步 stage 的呼叫慣例
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncStyle {
    #[default]
    Future,
    Callback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub mode: StageMode,
    #[serde(default)]
    pub style: AsyncStyle,
    pub transform: Option<String>,
    pub flush: Option<String>,
    pub validate: Option<bool>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl StageDefinition {
    fn invalid_option(&self, key: &str, value: &serde_json::Value, reason: &str) -> StageError {
        StageError::InvalidConfigValueError {
            field: format!("stages.{}.options.{}", self.name, key),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// 選項不存在時回傳 `None`；型別不符是錯誤，不會退回預設值
    pub fn option_str(&self, key: &str) -> Result<Option<&str>> {
        match self.options.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| self.invalid_option(key, value, "expected a string")),
        }
    }

    pub fn option_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.options.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .map(|v| Some(v as usize))
                .ok_or_else(|| self.invalid_option(key, value, "expected a non-negative integer")),
        }
    }

    pub fn option_str_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        let Some(value) = self.options.get(key) else {
            return Ok(None);
        };
        let items = value
            .as_array()
            .ok_or_else(|| self.invalid_option(key, value, "expected a list of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.invalid_option(key, item, "expected a list of strings"))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    pub fn validation_enabled(&self) -> bool {
        self.validate.unwrap_or(false)
    }
}

impl TomlConfig {
    /// 只有一個 pass-through stage 的預設配置
    pub fn passthrough(name: &str) -> Self {
        Self {
            pipeline: PipelineConfig {
                name: name.to_string(),
                description: None,
                channel_capacity: None,
                halt_on_error: None,
            },
            stages: vec![StageDefinition {
                name: name.to_string(),
                mode: StageMode::Sync,
                style: AsyncStyle::Future,
                transform: None,
                flush: None,
                validate: None,
                options: HashMap::new(),
            }],
        }
    }

    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(StageError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;
        Ok(toml::from_str(&processed_content)?)
    }

    /// 替換環境變數 (例如 ${SUFFIX})，未定義的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| StageError::ConfigValidationError {
            field: "environment".to_string(),
            message: e.to_string(),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn validate_config(&self) -> Result<()> {
        validate_non_empty_string("pipeline.name", &self.pipeline.name)?;

        if let Some(capacity) = self.pipeline.channel_capacity {
            validate_positive_number("pipeline.channel_capacity", capacity, 1)?;
        }

        if self.stages.is_empty() {
            return Err(StageError::MissingConfigError {
                field: "stages".to_string(),
            });
        }

        for (index, stage) in self.stages.iter().enumerate() {
            validate_non_empty_string(&format!("stages[{}].name", index), &stage.name)?;

            if stage.mode == StageMode::Sync {
                if stage.style == AsyncStyle::Callback {
                    return Err(StageError::ConfigValidationError {
                        field: format!("stages[{}].style", index),
                        message: "style only applies to async stages".to_string(),
                    });
                }
                if stage.validation_enabled() {
                    return Err(StageError::ConfigValidationError {
                        field: format!("stages[{}].validate", index),
                        message: "validation only applies to async stages".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn channel_capacity(&self) -> usize {
        self.pipeline
            .channel_capacity
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn halt_on_error(&self) -> bool {
        self.pipeline.halt_on_error.unwrap_or(false)
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

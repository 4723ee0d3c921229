use crate::utils::error::{Result, StageError};
use crate::utils::validation::{validate_path, Validate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 類檔案的 record：路徑、metadata 與內容
///
/// Stage 本身不檢查 record 內容，這個型別只是 CLI 與內建 transform 使用的具體實作。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub cwd: PathBuf,
    pub base: Option<PathBuf>,
    pub path: Option<PathBuf>,
    /// `None` 代表沒有內容 (null contents)
    pub contents: Option<Vec<u8>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub modified: Option<DateTime<Utc>>,
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl Record {
    pub fn new() -> Self {
        Self {
            cwd: PathBuf::from("/"),
            base: None,
            path: None,
            contents: None,
            metadata: HashMap::new(),
            modified: None,
        }
    }

    pub fn from_contents(contents: impl Into<Vec<u8>>) -> Self {
        let mut record = Self::new();
        record.set_contents(contents);
        record
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 替換內容並更新修改時間
    pub fn set_contents(&mut self, contents: impl Into<Vec<u8>>) {
        self.contents = Some(contents.into());
        self.modified = Some(Utc::now());
    }

    pub fn is_null(&self) -> bool {
        self.contents.is_none()
    }

    /// 以 UTF-8 (lossy) 讀取內容，沒有內容時回傳空字串
    pub fn contents_str(&self) -> Cow<'_, str> {
        match &self.contents {
            Some(bytes) => String::from_utf8_lossy(bytes),
            None => Cow::Borrowed(""),
        }
    }

    /// 相對於 base 的路徑
    pub fn relative(&self) -> Option<&Path> {
        let path = self.path.as_deref()?;
        match self.base.as_deref() {
            Some(base) => path.strip_prefix(base).ok(),
            None => Some(path),
        }
    }
}

impl Validate for Record {
    fn validate(&self) -> Result<()> {
        if let Some(path) = &self.path {
            validate_path("record.path", &path.to_string_lossy())?;

            if let Some(base) = &self.base {
                if !path.starts_with(base) {
                    return Err(StageError::InvalidConfigValueError {
                        field: "record.path".to_string(),
                        value: path.display().to_string(),
                        reason: format!("Path is not inside base {}", base.display()),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Transform / flush 的回傳值：不輸出、輸出一筆或多筆
#[derive(Debug, Clone, PartialEq)]
pub enum Output<T> {
    Empty,
    One(T),
    Many(Vec<T>),
}

impl<T> Default for Output<T> {
    fn default() -> Self {
        Output::Empty
    }
}

impl<T> Output<T> {
    pub fn len(&self) -> usize {
        match self {
            Output::Empty => 0,
            Output::One(_) => 1,
            Output::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            Output::Empty => Default::default(),
            Output::One(item) => std::slice::from_ref(item).iter(),
            Output::Many(items) => items.iter(),
        }
    }

    pub fn into_records(self) -> Vec<T> {
        match self {
            Output::Empty => Vec::new(),
            Output::One(item) => vec![item],
            Output::Many(items) => items,
        }
    }
}

impl<T> From<Option<T>> for Output<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(item) => Output::One(item),
            None => Output::Empty,
        }
    }
}

impl<T> From<Vec<T>> for Output<T> {
    fn from(items: Vec<T>) -> Self {
        Output::Many(items)
    }
}

/// 單一 stage 的執行結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub records_in: usize,
    pub records_out: usize,
    pub errors: usize,
    pub flushed: bool,
    /// 下游提前關閉，剩餘輸入未處理
    pub closed_early: bool,
    pub duration: std::time::Duration,
}

impl StageSummary {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            records_in: 0,
            records_out: 0,
            errors: 0,
            flushed: false,
            closed_early: false,
            duration: std::time::Duration::ZERO,
        }
    }
}

use crate::config::toml_config::{AsyncStyle, StageDefinition, StageMode, TomlConfig};
use crate::core::async_stage::{AsyncFlush, AsyncStage, AsyncStageConfig, AsyncTransform};
use crate::core::emitter::{AsyncEmitter, Done, Emitter};
use crate::core::pipeline::StagePipeline;
use crate::core::sync_stage::{SyncFlushFn, SyncStage, SyncStageConfig, SyncTransformFn};
use crate::domain::model::{Output, Record};
use crate::domain::ports::Stage;
use crate::utils::error::{Result, StageError, TransformResult};
use crate::utils::validation::Validate;

pub const TRANSFORMS: &[&str] = &[
    "append",
    "prepend",
    "uppercase",
    "every_nth",
    "fan_out",
    "reject_empty",
];
pub const FLUSHES: &[&str] = &["banner"];

fn required_str(def: &StageDefinition, key: &str) -> Result<String> {
    def.option_str(key)?.map(str::to_string).ok_or_else(|| {
        StageError::construction(&def.name, format!("missing string option '{}'", key))
    })
}

/// 依名稱建立內建 transform
pub fn transform_for(def: &StageDefinition, name: &str) -> Result<SyncTransformFn<Record>> {
    let transform: SyncTransformFn<Record> = match name {
        "append" => {
            let suffix = required_str(def, "suffix")?;
            Box::new(move |mut record: Record, _: &mut Emitter<Record>| -> TransformResult<Output<Record>> {
                let contents = format!("{}{}", record.contents_str(), suffix);
                record.set_contents(contents);
                Ok(Output::One(record))
            })
        }
        "prepend" => {
            let prefix = required_str(def, "prefix")?;
            Box::new(move |mut record: Record, _: &mut Emitter<Record>| -> TransformResult<Output<Record>> {
                let contents = format!("{}{}", prefix, record.contents_str());
                record.set_contents(contents);
                Ok(Output::One(record))
            })
        }
        "uppercase" => Box::new(|mut record: Record, _: &mut Emitter<Record>| -> TransformResult<Output<Record>> {
            let contents = record.contents_str().to_uppercase();
            record.set_contents(contents);
            Ok(Output::One(record))
        }),
        "every_nth" => {
            let n = def.option_usize("n")?.unwrap_or(3);
            if n == 0 {
                return Err(StageError::construction(&def.name, "option 'n' must be at least 1"));
            }
            let mut counter = 0usize;
            Box::new(move |record: Record, emitter: &mut Emitter<Record>| -> TransformResult<Output<Record>> {
                if counter != 0 && counter % n == 0 {
                    emitter.emit(record);
                }
                counter += 1;
                Ok(Output::Empty)
            })
        }
        "fan_out" => {
            let prefixes = def
                .option_str_list("prefixes")?
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    StageError::construction(&def.name, "option 'prefixes' must be a non-empty list")
                })?;
            Box::new(move |record: Record, emitter: &mut Emitter<Record>| -> TransformResult<Output<Record>> {
                for prefix in &prefixes {
                    let mut copy = record.clone();
                    copy.set_contents(format!("{}{}", prefix, record.contents_str()));
                    emitter.emit(copy);
                }
                Ok(Output::One(record))
            })
        }
        "reject_empty" => Box::new(|record: Record, _: &mut Emitter<Record>| -> TransformResult<Output<Record>> {
            if record.contents.as_ref().map_or(true, |c| c.is_empty()) {
                let label = record
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<unnamed>".to_string());
                return Err(format!("record {} has no contents", label).into());
            }
            Ok(Output::One(record))
        }),
        other => {
            return Err(StageError::construction(
                &def.name,
                format!(
                    "unknown transform '{}' (available: {})",
                    other,
                    TRANSFORMS.join(", ")
                ),
            ))
        }
    };
    Ok(transform)
}

/// 依名稱建立內建 flush
pub fn flush_for(def: &StageDefinition, name: &str) -> Result<SyncFlushFn<Record>> {
    match name {
        "banner" => {
            let content = required_str(def, "content")?;
            let path = def.option_str("path")?.map(str::to_string);
            Ok(Box::new(move |_: &mut Emitter<Record>| -> TransformResult<Output<Record>> {
                let mut record = Record::from_contents(content.clone());
                record.path = path.clone().map(Into::into);
                Ok(Output::One(record))
            }))
        }
        other => Err(StageError::construction(
            &def.name,
            format!("unknown flush '{}' (available: {})", other, FLUSHES.join(", ")),
        )),
    }
}

/// Callback 風格最多只能完成一筆 record
fn complete(done: Done<Record>, result: TransformResult<Output<Record>>) {
    match result {
        Ok(Output::Empty) => done.skip(),
        Ok(Output::One(record)) => done.next(record),
        Ok(Output::Many(_)) => done.fail("callback-style stages complete with at most one record"),
        Err(e) => done.fail(e),
    }
}

fn future_transform(mut f: SyncTransformFn<Record>) -> AsyncTransform<Record> {
    AsyncTransform::future(move |record: Record, emitter: AsyncEmitter<Record>| {
        let mut local = Emitter::new();
        let result = f(record, &mut local);
        let emitted = local.into_records();
        async move {
            for record in emitted {
                emitter.emit(record).await;
            }
            result
        }
    })
}

fn callback_transform(mut f: SyncTransformFn<Record>) -> AsyncTransform<Record> {
    AsyncTransform::callback(
        move |record: Record, emitter: AsyncEmitter<Record>, done: Done<Record>| {
            let mut local = Emitter::new();
            let result = f(record, &mut local);
            let emitted = local.into_records();
            tokio::spawn(async move {
                for record in emitted {
                    emitter.emit(record).await;
                }
                complete(done, result);
            });
        },
    )
}

fn future_flush(mut f: SyncFlushFn<Record>) -> AsyncFlush<Record> {
    AsyncFlush::future(move |emitter: AsyncEmitter<Record>| {
        let mut local = Emitter::new();
        let result = f(&mut local);
        let emitted = local.into_records();
        async move {
            for record in emitted {
                emitter.emit(record).await;
            }
            result
        }
    })
}

fn callback_flush(mut f: SyncFlushFn<Record>) -> AsyncFlush<Record> {
    AsyncFlush::callback(move |emitter: AsyncEmitter<Record>, done: Done<Record>| {
        let mut local = Emitter::new();
        let result = f(&mut local);
        let emitted = local.into_records();
        tokio::spawn(async move {
            for record in emitted {
                emitter.emit(record).await;
            }
            complete(done, result);
        });
    })
}

/// 依 stage 定義建立 stage；未知名稱或缺少選項時回傳 construction error
pub fn build_stage(def: &StageDefinition) -> Result<Box<dyn Stage<Record>>> {
    let transform = def
        .transform
        .as_deref()
        .map(|name| transform_for(def, name))
        .transpose()?;
    let flush = def
        .flush
        .as_deref()
        .map(|name| flush_for(def, name))
        .transpose()?;

    let stage: Box<dyn Stage<Record>> = match def.mode {
        StageMode::Sync => {
            let mut config = SyncStageConfig::new().with_name(&def.name);
            config.transform = transform;
            config.flush = flush;
            Box::new(SyncStage::new(config)?)
        }
        StageMode::Async => {
            let mut config = AsyncStageConfig::new().with_name(&def.name);
            config.transform = transform.map(|f| match def.style {
                AsyncStyle::Future => future_transform(f),
                AsyncStyle::Callback => callback_transform(f),
            });
            config.flush = flush.map(|f| match def.style {
                AsyncStyle::Future => future_flush(f),
                AsyncStyle::Callback => callback_flush(f),
            });
            if def.validation_enabled() {
                config = config.with_validation();
            }
            Box::new(AsyncStage::new(config)?)
        }
    };

    tracing::debug!(
        "🔧 Built {:?} stage '{}' (transform: {:?}, flush: {:?})",
        def.mode,
        def.name,
        def.transform,
        def.flush
    );
    Ok(stage)
}

pub fn build_pipeline(config: &TomlConfig) -> Result<StagePipeline<Record>> {
    config.validate()?;

    let mut pipeline = StagePipeline::new(config.pipeline.name.clone())
        .with_capacity(config.channel_capacity())
        .with_halt_on_error(config.halt_on_error());
    for def in &config.stages {
        pipeline.add_stage(build_stage(def)?);
    }
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn definition(transform: Option<&str>, flush: Option<&str>) -> StageDefinition {
        StageDefinition {
            name: "test".to_string(),
            mode: StageMode::Sync,
            style: AsyncStyle::Future,
            transform: transform.map(str::to_string),
            flush: flush.map(str::to_string),
            validate: None,
            options: HashMap::new(),
        }
    }

    #[test]
    fn test_unknown_transform_is_construction_error() {
        let def = definition(Some("does_not_exist"), None);
        match build_stage(&def) {
            Err(StageError::ConstructionError { stage, message }) => {
                assert_eq!(stage, "test");
                assert!(message.contains("does_not_exist"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected construction error"),
        }
    }

    #[test]
    fn test_unknown_flush_is_construction_error() {
        let def = definition(None, Some("string"));
        assert!(matches!(
            build_stage(&def),
            Err(StageError::ConstructionError { .. })
        ));
    }

    #[test]
    fn test_missing_option_is_construction_error() {
        let def = definition(Some("append"), None);
        assert!(matches!(
            build_stage(&def),
            Err(StageError::ConstructionError { .. })
        ));

        let mut zero = definition(Some("every_nth"), None);
        zero.options.insert("n".to_string(), serde_json::json!(0));
        assert!(build_stage(&zero).is_err());
    }

    #[test]
    fn test_append_transform() {
        let mut def = definition(Some("append"), None);
        def.options
            .insert("suffix".to_string(), serde_json::json!(":append"));
        let mut transform = transform_for(&def, "append").unwrap();
        let mut emitter = Emitter::new();
        let output = transform(Record::from_contents("test"), &mut emitter).unwrap();
        assert!(emitter.is_empty());
        match output {
            Output::One(record) => assert_eq!(record.contents_str(), "test:append"),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_reject_empty_transform() {
        let mut transform = transform_for(&definition(None, None), "reject_empty").unwrap();
        let mut emitter = Emitter::new();
        let err = transform(Record::new().with_path("/stdin/0"), &mut emitter).unwrap_err();
        assert_eq!(err.to_string(), "record /stdin/0 has no contents");
    }
}

use clap::Parser;
use std::io::{BufRead, Write};
use use_stage::app::builtins;
use use_stage::utils::error::{ErrorSeverity, Result};
use use_stage::utils::logger;
use use_stage::{CliConfig, Record, StagePipeline, TomlConfig};

#[tokio::main]
async fn main() {
    let config = CliConfig::parse();

    // 初始化日誌
    if config.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(config.verbose);
    }
    logger::install_panic_hook();

    tracing::info!("Starting use-stage CLI");
    if config.verbose {
        tracing::debug!("CLI config: {:?}", config);
    }

    match run(&config).await {
        Ok(error_count) => {
            if error_count > 0 {
                tracing::warn!("⚠️ Finished with {} stage errors", error_count);
                std::process::exit(2);
            }
        }
        Err(e) => {
            tracing::error!("❌ use-stage failed: {} (Severity: {:?})", e, e.severity());
            eprintln!("❌ {}", e.user_friendly_message());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };

            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }
}

async fn run(config: &CliConfig) -> Result<usize> {
    let mut pipeline_config = match &config.config {
        Some(path) => TomlConfig::from_file(path)?,
        None => TomlConfig::passthrough("stdin"),
    };
    if config.fail_fast {
        pipeline_config.pipeline.halt_on_error = Some(true);
    }

    let pipeline = builtins::build_pipeline(&pipeline_config)?;
    tracing::info!("🔧 Stages: {}", pipeline.stage_names().join(" -> "));

    let records = read_records(std::io::stdin().lock())?;
    let outcome = pipeline.run_collect(records).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for record in &outcome.records {
        writeln!(out, "{}", record.contents_str())?;
    }
    out.flush()?;

    for error in &outcome.errors {
        eprintln!("⚠️ {}", error);
    }

    if config.summary {
        let summary = StagePipeline::execution_summary(&outcome);
        eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(outcome.errors.len())
}

/// 每一行輸入成為一筆 record
fn read_records(reader: impl BufRead) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        records.push(
            Record::from_contents(line)
                .with_base("/stdin/")
                .with_path(format!("/stdin/{}", index)),
        );
    }
    tracing::debug!("📥 Read {} records from stdin", records.len());
    Ok(records)
}

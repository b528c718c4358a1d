//! Offkit Smoke Harness
//!
//! Starts an engine against the real network, fetches the given URLs
//! through it and prints a JSON summary of how each one was served.
//!
//! ```text
//! offkit-smoke [--config FILE] [--data-dir DIR] [--navigate] [--json-log] [--verbose] URL...
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use offkit_common::{init_logging, LogConfig, LogFormat};
use offkit_sw::{
    ControlMessage, DestinationType, EngineConfig, EngineError, FetchEvent, OfflineEngine,
    RequestMode,
};
use serde_json::json;
use tracing::{info, warn};

/// Parse command line arguments
struct Args {
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    navigate: bool,
    json_log: bool,
    verbose: bool,
    urls: Vec<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config: None,
            data_dir: None,
            navigate: false,
            json_log: false,
            verbose: false,
            urls: Vec::new(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next().map(PathBuf::from),
                "--data-dir" => parsed.data_dir = args.next().map(PathBuf::from),
                "--navigate" => parsed.navigate = true,
                "--json-log" => parsed.json_log = true,
                "--verbose" => parsed.verbose = true,
                _ => parsed.urls.push(arg),
            }
        }
        parsed
    }
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let args = Args::parse();
    let log = if args.json_log {
        LogConfig::production()
    } else if args.verbose {
        LogConfig::debug()
    } else {
        LogConfig {
            format: LogFormat::Compact,
            ..Default::default()
        }
    };
    init_logging(log);

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    info!(version = %config.version, data_dir = %config.data_dir.display(), "Starting Offkit smoke harness");

    let (engine, _events) = OfflineEngine::builder(config).build()?;
    let engine = Arc::new(engine);
    let install = match engine.start().await {
        Ok(report) => json!({ "version": report.version, "state": report.state, "precached": report.precached }),
        Err(e) => {
            warn!(error = %e, "Install failed; continuing without an active version");
            json!({ "error": e.to_string() })
        }
    };

    let (destination, mode) = if args.navigate {
        (DestinationType::Document, RequestMode::Navigate)
    } else {
        (DestinationType::Other, RequestMode::Cors)
    };

    let mut results = Vec::new();
    for raw in &args.urls {
        let started = Instant::now();
        let request = engine.request(raw, "GET", destination, mode)?;
        let rule = engine.classifier().explain(&request).to_string();
        let outcome = engine.handle_fetch(FetchEvent::new(request)).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        results.push(match outcome {
            Ok(response) => json!({
                "url": raw,
                "rule": rule,
                "status": response.status.as_u16(),
                "source": response.source,
                "freshness": response.freshness,
                "partition": response.partition,
                "bytes": response.body.len(),
                "elapsed_ms": (elapsed_ms * 100.0).round() / 100.0,
            }),
            Err(e) => json!({ "url": raw, "rule": rule, "error": e.to_string(), "category": e.category() }),
        });
    }
    engine.settle().await;

    let summary = json!({
        "install": install,
        "results": results,
        "version": engine.handle_control(ControlMessage::QueryVersion).await,
        "queue": engine.handle_control(ControlMessage::QueueStatus).await,
    });
    println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
    Ok(())
}

mod asr;
mod audio;
mod config;
mod error;
mod orchestrator;
mod segmenter;
mod wrapup;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use asr::{AsrConfig, AsrWorker};
use config::AppConfig;
use orchestrator::Orchestrator;
use wrapup::{HttpSummaryGenerator, SummaryGenerator};

#[derive(Parser, Debug)]
#[command(name = "speechd", about = "Voice-capture and segmentation core")]
struct Args {
    #[arg(long, help = "path to config.toml")]
    config: Option<PathBuf>,

    #[arg(long, help = "override the listen address")]
    address: Option<String>,

    #[arg(long, help = "override the listen port")]
    port: Option<u16>,

    #[arg(long, help = "path to the whisper model file")]
    model: Option<String>,

    #[arg(long, help = "path to an optional bearer-token file gating WebSocket connections")]
    token_file: Option<PathBuf>,

    #[arg(long, help = "inference device: auto, cpu, cuda, metal, mps")]
    device: Option<String>,
}

fn build_config(args: &Args) -> Result<AppConfig> {
    let mut cfg = config::load_app_config(args.config.as_deref())?;
    if let Some(address) = &args.address {
        cfg.net.host = address.clone();
    }
    if let Some(port) = args.port {
        cfg.net.port = port;
    }
    if let Some(model) = &args.model {
        cfg.whisper.model = model.clone();
    }
    if let Some(device) = &args.device {
        cfg.device = device.clone();
    }
    Ok(cfg)
}

fn load_auth_token(args: &Args) -> Result<Option<String>> {
    match &args.token_file {
        Some(path) => {
            info!("connection-level token authentication enabled");
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("reading token file {}", path.display()))?;
            Ok(Some(token.trim().to_string()))
        }
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = build_config(&args)?;
    let auth_token = load_auth_token(&args)?;

    let addr = format!("{}:{}", cfg.net.host, cfg.net.port);
    info!(%addr, "binding listener");
    // Bind before loading the model so a misconfigured port fails fast,
    // without paying for a multi-second model load first.
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(model = %cfg.whisper.model, device = %cfg.device, "loading whisper model");
    let asr_cfg = AsrConfig {
        model_path: cfg.whisper.model.clone(),
        device: cfg.device.clone(),
        logprob_threshold: cfg.whisper.logprob_threshold,
        no_speech_threshold: cfg.whisper.no_speech_threshold,
        max_single_word_repeats: cfg.whisper.max_single_word_repeats,
        drop_repeated_only_segments: cfg.whisper.drop_repeated_only_segments,
    };
    let (worker, asr_handle, asr_results, asr_fatal) = AsrWorker::load(asr_cfg)?;
    let worker_task = tokio::spawn(worker.run());

    // Built unconditionally, matching the original's "always build the
    // generator inline and gate purely on the key" shape: the missing-key
    // and no-endpoint-configured checks happen per-request in the
    // orchestrator, not by withholding the generator itself.
    let wrapup_generator: Arc<dyn SummaryGenerator> = Arc::new(HttpSummaryGenerator::new(
        cfg.net.ai_service_url.clone(),
        cfg.wrapup_api_key.clone().unwrap_or_default(),
        cfg.wrapup.model.clone(),
        cfg.wrapup.prompt.clone(),
        cfg.wrapup.temperature,
        cfg.wrapup.max_output_tokens,
    ));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let orchestrator = Orchestrator::new(cfg, asr_handle, asr_results, asr_fatal, wrapup_generator, auth_token);
    // `run` consumes the orchestrator, so the `AsrHandle` it owns (and with
    // it the job submission channel) is dropped the moment `run` returns -
    // closing the queue is what lets the worker's `recv()` loop end and
    // `run()` return on its own. Cancellation order per the concurrency
    // model: ASR worker first (awaited to completion here), then the
    // flusher/ingress loop (already torn down by the time `run` returns),
    // then client sockets (closed inside `run` as it unwinds).
    let result = orchestrator.run(listener, shutdown_rx).await;

    if let Err(e) = worker_task.await {
        if !e.is_cancelled() {
            warn!(error = %e, "ASR worker task panicked during shutdown");
        }
    }
    match &result {
        Ok(()) => info!("shut down cleanly"),
        Err(e) => error!(error = %e, "fatal error"),
    }
    result
}

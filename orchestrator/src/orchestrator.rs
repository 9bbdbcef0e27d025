//! The event loop: ingests wire messages, dispatches to segmenters, drives
//! periodic finalization, and correlates ASR results with segment metadata.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use uuid::Uuid;

use shared_protocol::{AudioChunkMessage, ServerMessage, WrapupRequestMessage};

use crate::asr::{AsrHandle, FatalReceiver, ResultReceiver, TranscribeJob};
use crate::audio::{enhance_speech, normalize_to_mono16k, TARGET_SR};
use crate::config::AppConfig;
use crate::error::WireError;
use crate::segmenter::{Segmenter, SegmenterConfig};
use crate::wrapup::{format_transcript, SummaryGenerator};

type ClientId = u64;

struct JobMeta {
    user_id: String,
    capture_ts: f64,
    end_ts: f64,
    submitted_at: f64,
}

/// Sent down a connection's egress channel; `Close` is how the orchestrator
/// tells a connection's writer to send a close frame and shut the socket
/// down, rather than relying on the sender simply being dropped.
enum Outbound {
    Message(ServerMessage),
    Close,
}

enum Event {
    Connected(ClientId, mpsc::UnboundedSender<Outbound>),
    /// The connection's own task handle, sent right after `tokio::spawn`
    /// so the orchestrator can await it on shutdown.
    Task(ClientId, JoinHandle<()>),
    Disconnected(ClientId),
    Text(ClientId, String),
    BinaryFrame(ClientId),
}

pub struct Orchestrator {
    cfg: AppConfig,
    asr: AsrHandle,
    asr_results: ResultReceiver,
    asr_fatal: FatalReceiver,
    wrapup_generator: Arc<dyn SummaryGenerator>,
    segmenters: HashMap<String, Segmenter>,
    job_meta: HashMap<String, JobMeta>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<Outbound>>,
    client_tasks: HashMap<ClientId, JoinHandle<()>>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    nudge: Arc<Notify>,
    auth_token: Option<Arc<String>>,
}

const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
/// Model inference has no explicit timeout (spec.md §5), so this is
/// generous - it exists to catch actual leaks, not slow jobs.
const STALE_JOB_MAX_AGE_S: f64 = 300.0;

impl Orchestrator {
    pub fn new(
        cfg: AppConfig,
        asr: AsrHandle,
        asr_results: ResultReceiver,
        asr_fatal: FatalReceiver,
        wrapup_generator: Arc<dyn SummaryGenerator>,
        auth_token: Option<String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            asr,
            asr_results,
            asr_fatal,
            wrapup_generator,
            segmenters: HashMap::new(),
            job_meta: HashMap::new(),
            clients: HashMap::new(),
            client_tasks: HashMap::new(),
            events_rx,
            events_tx,
            nudge: Arc::new(Notify::new()),
            auth_token: auth_token.map(Arc::new),
        }
    }

    /// Bind the listener, then run ingress/flusher/egress until a fatal
    /// condition or external shutdown signal fires. Binding happens before
    /// this is even called so the model never loads on a dead port.
    pub async fn run(mut self, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let local_addr = listener.local_addr().ok();
        info!(?local_addr, "orchestrator listening");

        let events_tx = self.events_tx.clone();
        let nudge = Arc::clone(&self.nudge);
        let auth_token = self.auth_token.clone();
        let accept_handle = tokio::spawn(accept_loop(listener, events_tx, nudge, auth_token));

        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush();
                }
                _ = self.nudge.notified() => {
                    self.flush();
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(ev) => self.handle_event(ev).await,
                        None => break Ok(()),
                    }
                }
                result = self.asr_results.recv() => {
                    match result {
                        Some(r) => {
                            if let Err(e) = self.handle_transcription_result(r).await {
                                break Err(e);
                            }
                        }
                        None => break Err(anyhow::anyhow!("ASR worker result channel closed unexpectedly")),
                    }
                }
                fatal = &mut self.asr_fatal => {
                    let e = fatal.unwrap_or_else(|_| anyhow::anyhow!("ASR worker dropped without reporting a cause"));
                    break Err(e.context("ASR worker failed"));
                }
                _ = &mut shutdown => {
                    break Ok(());
                }
            }
        };

        // Cancellation order per spec.md §5: ASR worker first (already
        // unreachable - `self.asr` and its job channel are dropped with
        // `self` at the end of this function), then the flusher/ingress
        // loop (already torn down above), then every peer socket. Tell each
        // connection's writer to send a close frame and shut its socket
        // down, then wait for the connection tasks themselves to finish so
        // a stop request doesn't return before every socket is actually
        // closed.
        accept_handle.abort();
        for (_, tx) in self.clients.drain() {
            let _ = tx.send(Outbound::Close);
        }
        let tasks: Vec<_> = self.client_tasks.drain().map(|(_, task)| task).collect();
        join_all(tasks).await;
        result
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected(id, tx) => {
                self.clients.insert(id, tx);
            }
            Event::Task(id, task) => {
                self.client_tasks.insert(id, task);
            }
            Event::Disconnected(id) => {
                self.clients.remove(&id);
                self.client_tasks.remove(&id);
            }
            Event::BinaryFrame(id) => {
                self.emit_to(id, (&WireError::UnsupportedFrame).into()).await;
            }
            Event::Text(id, raw) => {
                self.handle_incoming(id, &raw).await;
            }
        }
    }

    async fn handle_incoming(&mut self, id: ClientId, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.emit_to(id, (&WireError::BadJson(e.to_string())).into()).await;
                return;
            }
        };

        let Some(msg_type) = value.get("type").and_then(Value::as_str) else {
            self.emit_to(id, (&WireError::BadRequest { kind: "message", reason: "missing type field".into() }).into()).await;
            return;
        };

        match msg_type {
            "audio.chunk" => self.handle_audio_chunk(id, value).await,
            "wrapup.request" => self.handle_wrapup_request(id, value).await,
            other => {
                self.emit_to(id, (&WireError::UnknownType(other.to_string())).into()).await;
            }
        }
    }

    async fn handle_audio_chunk(&mut self, id: ClientId, value: Value) {
        let msg: AudioChunkMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                self.emit_to(id, (&WireError::BadRequest { kind: "audio.chunk", reason: e.to_string() }).into()).await;
                return;
            }
        };

        if !msg.pcm_format.is_valid() {
            self.emit_to(id, (&WireError::BadAudioFormat("invalid pcm_format".into())).into()).await;
            return;
        }

        let raw_pcm = match base64::engine::general_purpose::STANDARD.decode(&msg.data_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.emit_to(id, (&WireError::BadAudioFormat(format!("invalid base64: {e}"))).into()).await;
                return;
            }
        };

        let pcm16 = match normalize_to_mono16k(
            &raw_pcm,
            msg.pcm_format.sr,
            msg.pcm_format.channels,
            msg.pcm_format.sample_width,
        ) {
            Ok(p) => p,
            Err(e) => {
                self.emit_to(id, (&e).into()).await;
                return;
            }
        };

        let segmenter = self.segmenters.entry(msg.user_id.clone()).or_insert_with(|| {
            Segmenter::new(
                msg.user_id.clone(),
                SegmenterConfig {
                    silence_gap_s: self.cfg.voice.silence_threshold_seconds,
                    vad_threshold: self.cfg.voice.vad_threshold,
                    max_segment_s: self.cfg.voice.max_segment_s(),
                    ..SegmenterConfig::default()
                },
            )
        });
        // feed() never blocks; ready segments are collected by the flusher,
        // not here, so a burst of chunks can't starve other users.
        segmenter.feed(&pcm16, msg.capture_ts, msg.prompt.as_deref());
        self.nudge.notify_one();
    }

    async fn handle_wrapup_request(&mut self, id: ClientId, value: Value) {
        let msg: WrapupRequestMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                self.emit_to(id, (&WireError::BadRequest { kind: "wrapup.request", reason: e.to_string() }).into()).await;
                return;
            }
        };

        if self.cfg.net.ai_service_url.is_empty() {
            self.emit_to(id, (&WireError::ServerConfig("no wrap-up endpoint configured".into())).into()).await;
            return;
        }
        if self.cfg.wrapup_api_key.is_none() {
            self.emit_to(id, (&WireError::MissingApiKey).into()).await;
            return;
        }

        let transcript = format_transcript(&msg.log_entries, &msg.session_name);
        match self.wrapup_generator.summarize(&transcript, &self.cfg.wrapup.tips).await {
            Ok(outline) => {
                self.emit_to(id, ServerMessage::wrapup_response(outline, msg.request_id)).await;
            }
            Err(e) => {
                self.emit_to(id, ServerMessage::error("llm_error", e.to_string(), None)).await;
            }
        }
    }

    /// Wakes on the 250ms ticker or a nudge; sweeps every segmenter and
    /// submits whatever is ready.
    fn flush(&mut self) {
        let now = now_unix_secs();
        self.prune_stale_jobs(now, STALE_JOB_MAX_AGE_S);
        for (user_id, segmenter) in self.segmenters.iter_mut() {
            for segment in segmenter.collect_ready(now) {
                let audio_f32: Vec<f32> = segment
                    .pcm16
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
                    .collect();
                let enhanced = enhance_speech(&audio_f32, TARGET_SR);
                let mut enhanced_pcm16 = Vec::with_capacity(enhanced.len() * 2);
                for s in enhanced {
                    let clipped = s.clamp(-1.0, 1.0);
                    enhanced_pcm16.extend_from_slice(&((clipped * 32767.0) as i16).to_le_bytes());
                }

                let job_id = Uuid::new_v4().simple().to_string();
                self.job_meta.insert(
                    job_id.clone(),
                    JobMeta {
                        user_id: user_id.clone(),
                        capture_ts: segment.start_ts,
                        end_ts: segment.end_ts,
                        submitted_at: now,
                    },
                );
                // A per-chunk prompt override wins; otherwise fall back to
                // the configured default prompt, if any.
                let prompt = segment.prompt.clone().or_else(|| {
                    (!self.cfg.whisper.prompt.is_empty()).then(|| self.cfg.whisper.prompt.clone())
                });
                self.asr.submit(TranscribeJob { id: job_id, pcm16: enhanced_pcm16, prompt });
            }
        }
    }

    /// Debug-only leak detector: `JobMeta` is removed exactly once, when its
    /// matching `TranscriptionResult` arrives (§3). A job whose result never
    /// comes back (queue-overflow drop on the worker side, or a crash
    /// between submission and completion) leaves its entry behind forever
    /// unless something sweeps it. This is diagnostic, not correctness-load-
    /// bearing: a stale entry wastes a HashMap slot but never misroutes a
    /// real result, since results are matched by id.
    fn prune_stale_jobs(&mut self, now: f64, max_age_s: f64) {
        let before = self.job_meta.len();
        self.job_meta.retain(|_, meta| now - meta.submitted_at < max_age_s);
        let pruned = before - self.job_meta.len();
        if pruned > 0 {
            warn!(pruned, "pruned stale job-meta entries with no matching transcription result");
        }
    }

    async fn handle_transcription_result(&mut self, result: crate::asr::TranscriptionResult) -> Result<()> {
        let meta = self
            .job_meta
            .remove(&result.id)
            .context("missing job metadata for transcription result - internal consistency error")?;
        self.broadcast(ServerMessage::transcription(meta.user_id, result.text, meta.capture_ts, meta.end_ts))
            .await;
        Ok(())
    }

    async fn emit_to(&mut self, id: ClientId, msg: ServerMessage) {
        if let Some(tx) = self.clients.get(&id) {
            if tx.send(Outbound::Message(msg)).is_err() {
                self.clients.remove(&id);
            }
        }
    }

    async fn broadcast(&mut self, msg: ServerMessage) {
        let mut dead = Vec::new();
        for (id, tx) in &self.clients {
            if tx.send(Outbound::Message(msg.clone())).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            self.clients.remove(&id);
        }
    }
}

fn now_unix_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

async fn accept_loop(
    listener: TcpListener,
    events_tx: mpsc::UnboundedSender<Event>,
    nudge: Arc<Notify>,
    auth_token: Option<Arc<String>>,
) {
    let mut next_id: ClientId = 0;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let id = next_id;
        next_id += 1;
        let task_events_tx = events_tx.clone();
        let nudge = Arc::clone(&nudge);
        let auth_token = auth_token.clone();
        let task = tokio::spawn(handle_connection(id, stream, peer, task_events_tx, nudge, auth_token));
        let _ = events_tx.send(Event::Task(id, task));
    }
}

/// Extracts `?token=...` from the handshake request's query string and
/// compares it to the configured bearer token before the upgrade completes.
fn check_token(request: &Request, response: Response, expected: &str) -> Result<Response, ErrorResponse> {
    let provided = request
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("token=")));
    match provided {
        Some(token) if token == expected => Ok(response),
        _ => {
            let rejection: ErrorResponse = Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Some("unauthorized".to_string()))
                .expect("building a static rejection response cannot fail");
            Err(rejection)
        }
    }
}

async fn handle_connection(
    id: ClientId,
    stream: TcpStream,
    peer: SocketAddr,
    events_tx: mpsc::UnboundedSender<Event>,
    nudge: Arc<Notify>,
    auth_token: Option<Arc<String>>,
) {
    let handshake = match auth_token {
        Some(expected) => {
            tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
                check_token(req, resp, &expected)
            })
            .await
        }
        None => tokio_tungstenite::accept_async(stream).await,
    };
    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    info!(%peer, "client connected");

    let (mut sink, mut stream) = ws.split();
    let (egress_tx, mut egress_rx) = mpsc::unbounded_channel::<Outbound>();
    let _ = events_tx.send(Event::Connected(id, egress_tx));

    let writer = tokio::spawn(async move {
        while let Some(out) = egress_rx.recv().await {
            match out {
                Outbound::Message(msg) => {
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    warn!(%peer, size = text.len(), "dropping oversized text frame");
                    continue;
                }
                let _ = events_tx.send(Event::Text(id, text));
                nudge.notify_one();
            }
            Ok(Message::Binary(_)) => {
                let _ = events_tx.send(Event::BinaryFrame(id));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%peer, error = %e, "websocket read error");
                break;
            }
        }
    }

    let _ = events_tx.send(Event::Disconnected(id));
    writer.abort();
    info!(%peer, "client disconnected");
}

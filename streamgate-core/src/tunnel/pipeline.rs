//! Subprocess stream pipeline.
//!
//! Spawns the processing subprocess with its stdout as the media pipe,
//! bridges that pipe into an HTTP response body through a bounded channel,
//! and supervises termination: cooperative first, forceful after the grace
//! window. Stderr is drained into the log so a failed job leaves a trace.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::args::FfmpegJob;
use super::registry::{UpstreamHandle, UpstreamRegistry};
use super::TunnelError;
use crate::config::ProcessingConfig;

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Running,
    /// Subprocess exited zero on its own.
    Completed,
    /// Subprocess exited nonzero or could not be waited on.
    Failed,
    /// Shut down from our side, client disconnect included.
    Terminated,
}

/// Shared teardown point for one pipeline.
///
/// Every exit path funnels through [`ShutdownGuard::shutdown`]: it is
/// idempotent, so the response body dropping, the reader noticing a closed
/// channel, and an explicit abort can all race without signaling the
/// subprocess twice. The supervisor performs the ordered teardown itself:
/// the child is stopped first, upstream handles are released after.
pub struct ShutdownGuard {
    handles: Vec<Arc<dyn UpstreamHandle>>,
    stopped: AtomicBool,
    notify: Notify,
    status: RwLock<PipelineStatus>,
}

impl ShutdownGuard {
    fn new(handles: Vec<Arc<dyn UpstreamHandle>>) -> Self {
        Self {
            handles,
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
            status: RwLock::new(PipelineStatus::Running),
        }
    }

    /// Requests teardown. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_one();
        debug!("pipeline shutdown initiated");
    }

    fn release_handles(&self) {
        for handle in &self.handles {
            handle.release();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PipelineStatus {
        *self.status.read()
    }

    fn set_status(&self, status: PipelineStatus) {
        *self.status.write() = status;
    }
}

/// A spawned pipeline whose output has not yet been wired to a response.
pub struct RunningPipeline {
    pub guard: Arc<ShutdownGuard>,
    receiver: mpsc::Receiver<Bytes>,
}

/// Keeps the guard alive inside the response body stream; dropping the
/// body (client disconnect) tears the pipeline down.
struct BodyGuard(Arc<ShutdownGuard>);

impl Drop for BodyGuard {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

fn build_command(job: &FfmpegJob, processing: &ProcessingConfig) -> Command {
    let mut command = match processing.nice_level {
        Some(level) => {
            let mut command = Command::new("nice");
            command.arg("-n").arg(level.to_string());
            command.arg(&processing.ffmpeg_path);
            command
        }
        None => Command::new(&processing.ffmpeg_path),
    };
    command.args(&job.args);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

fn spawn_stderr_logger(stderr: Option<tokio::process::ChildStderr>) {
    let Some(stderr) = stderr else {
        return;
    };
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if !line.trim().is_empty() {
                        debug!("subprocess: {}", line.trim());
                    }
                }
                Err(error) => {
                    warn!(%error, "error reading subprocess stderr");
                    break;
                }
            }
        }
    });
}

/// Waits for the child on its own task. A shutdown request gives the
/// child the grace window to exit on its own (its output pipe is gone by
/// then) before killing it outright. Upstream handles are released only
/// after the child is down, so teardown is ordered stop-then-release.
/// Exit codes are logged, never propagated: by the time the subprocess
/// fails the response status is already on the wire.
fn spawn_supervisor(mut child: Child, guard: Arc<ShutdownGuard>, grace: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => match result {
                Ok(status) if status.success() => {
                    debug!("processing subprocess completed");
                    guard.set_status(PipelineStatus::Completed);
                }
                Ok(status) => {
                    warn!(code = ?status.code(), "processing subprocess failed");
                    guard.set_status(PipelineStatus::Failed);
                }
                Err(error) => {
                    warn!(%error, "failed waiting on processing subprocess");
                    guard.set_status(PipelineStatus::Failed);
                }
            },
            () = guard.notify.notified() => {
                match timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(code = ?status.code(), "subprocess exited within grace window");
                    }
                    Ok(Err(error)) => {
                        warn!(%error, "failed waiting on subprocess during shutdown");
                    }
                    Err(_) => {
                        warn!("grace window expired, killing subprocess");
                        if let Err(error) = child.kill().await {
                            warn!(%error, "failed to kill subprocess");
                        }
                    }
                }
                guard.set_status(PipelineStatus::Terminated);
            }
        }
        guard.release_handles();
    });
}

/// Spawns the subprocess and the reader/supervisor tasks.
///
/// One upstream handle is acquired per input URL before the spawn; on a
/// spawn failure they are released before the error returns.
///
/// # Errors
///
/// - `TunnelError::ProcessStart` - Subprocess could not be spawned
/// - `TunnelError::PipeUnavailable` - Spawned without a stdout pipe
pub fn spawn_pipeline(
    job: &FfmpegJob,
    urls: &[String],
    registry: &dyn UpstreamRegistry,
    processing: &ProcessingConfig,
) -> Result<RunningPipeline, TunnelError> {
    let handles: Vec<Arc<dyn UpstreamHandle>> =
        urls.iter().map(|url| registry.acquire(url)).collect();

    let mut command = build_command(job, processing);
    debug!(command = ?command.as_std(), "starting processing subprocess");

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            for handle in &handles {
                handle.release();
            }
            return Err(TunnelError::ProcessStart(error));
        }
    };

    let Some(mut stdout) = child.stdout.take() else {
        for handle in &handles {
            handle.release();
        }
        return Err(TunnelError::PipeUnavailable);
    };
    spawn_stderr_logger(child.stderr.take());

    let guard = Arc::new(ShutdownGuard::new(handles));
    spawn_supervisor(child, Arc::clone(&guard), processing.kill_grace);

    let (sender, receiver) = mpsc::channel::<Bytes>(processing.pipe_depth);
    let chunk_size = processing.chunk_size;
    let reader_guard = Arc::clone(&guard);
    tokio::spawn(async move {
        let mut buffer = vec![0u8; chunk_size];
        loop {
            match stdout.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => {
                    let chunk = Bytes::copy_from_slice(&buffer[..read]);
                    if sender.send(chunk).await.is_err() {
                        // Receiver gone: the client went away.
                        reader_guard.shutdown();
                        break;
                    }
                }
                Err(error) => {
                    warn!(%error, "error reading subprocess output");
                    reader_guard.shutdown();
                    break;
                }
            }
        }
    });

    Ok(RunningPipeline { guard, receiver })
}

impl RunningPipeline {
    /// Next chunk of subprocess output; None once the pipe closes.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Wires the output channel into a streaming HTTP response.
    ///
    /// # Errors
    ///
    /// - `TunnelError::ResponseBuild` - Header values were rejected
    pub fn into_response(self, filename: &str, estimate: i64) -> Result<Response, TunnelError> {
        let mime = mime_guess::from_path(filename).first_or_octet_stream();
        let state = (self.receiver, BodyGuard(self.guard));
        let stream = futures::stream::unfold(state, |mut state| async move {
            let chunk = state.0.recv().await?;
            Some((Ok::<Bytes, std::io::Error>(chunk), state))
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime.as_ref())
            .header(header::CONTENT_DISPOSITION, content_disposition(filename))
            .header("Cross-Origin-Resource-Policy", "cross-origin")
            .header("Estimated-Content-Length", estimate.to_string())
            .body(Body::from_stream(stream))
            .map_err(|error| TunnelError::ResponseBuild {
                reason: error.to_string(),
            })
    }
}

/// Spawns the pipeline and builds the streaming response in one step.
///
/// # Errors
///
/// See [`spawn_pipeline`] and [`RunningPipeline::into_response`].
pub fn run_pipeline(
    job: &FfmpegJob,
    urls: &[String],
    filename: &str,
    estimate: i64,
    registry: &dyn UpstreamRegistry,
    processing: &ProcessingConfig,
) -> Result<Response, TunnelError> {
    spawn_pipeline(job, urls, registry, processing)?.into_response(filename, estimate)
}

/// RFC 6266 attachment disposition with a UTF-8 extended filename and an
/// ASCII fallback for clients that ignore the extended form.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control() && *c != '"' && *c != '\\')
        .collect();
    let encoded = urlencoding::encode(filename);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::registry::CountingRegistry;

    fn job(args: &[&str]) -> FfmpegJob {
        FfmpegJob {
            args: args.iter().map(|a| a.to_string()).collect(),
            estimate_multiplier: 1.0,
        }
    }

    fn processing(binary: &str) -> ProcessingConfig {
        ProcessingConfig {
            ffmpeg_path: binary.to_string(),
            kill_grace: Duration::from_millis(100),
            ..ProcessingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_kills_long_running_subprocess_once() {
        let registry = CountingRegistry::new();
        let pipeline = spawn_pipeline(
            &job(&["5"]),
            &["https://example.com/v".to_string()],
            &registry,
            &processing("sleep"),
        )
        .unwrap();

        assert_eq!(registry.acquired(), 1);
        assert_eq!(pipeline.guard.status(), PipelineStatus::Running);

        pipeline.guard.shutdown();
        pipeline.guard.shutdown();
        assert!(pipeline.guard.is_shutdown());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pipeline.guard.status(), PipelineStatus::Terminated);
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn test_subprocess_output_flows_through_channel() {
        let registry = CountingRegistry::new();
        let mut pipeline = spawn_pipeline(
            &job(&["hello"]),
            &["https://example.com/v".to_string()],
            &registry,
            &processing("echo"),
        )
        .unwrap();

        let mut output = Vec::new();
        while let Some(chunk) = pipeline.recv().await {
            output.extend_from_slice(&chunk);
        }
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("hello"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pipeline.guard.status(), PipelineStatus::Completed);
        // Natural completion releases the handles without a shutdown call.
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn test_dropping_response_mid_stream_tears_pipeline_down() {
        let registry = CountingRegistry::new();
        let pipeline = spawn_pipeline(
            &job(&["5"]),
            &["https://example.com/v".to_string()],
            &registry,
            &processing("sleep"),
        )
        .unwrap();
        let guard = Arc::clone(&pipeline.guard);

        // Client disconnect: the response body is dropped mid-stream.
        let response = pipeline.into_response("clip.mp4", -1).unwrap();
        drop(response);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(guard.is_shutdown());
        assert_eq!(guard.status(), PipelineStatus::Terminated);
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_handles() {
        let registry = CountingRegistry::new();
        let result = spawn_pipeline(
            &job(&[]),
            &["https://example.com/v".to_string()],
            &registry,
            &processing("/nonexistent/binary/for-this-test"),
        );

        assert!(matches!(result, Err(TunnelError::ProcessStart(_))));
        assert_eq!(registry.acquired(), 1);
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn test_response_carries_delivery_headers() {
        let registry = CountingRegistry::new();
        let response = run_pipeline(
            &job(&["hi"]),
            &["https://example.com/v".to_string()],
            "clip video.mp4",
            2_200_000,
            &registry,
            &processing("echo"),
        )
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "video/mp4"
        );
        assert_eq!(
            response.headers().get("estimated-content-length").unwrap(),
            "2200000"
        );
        assert_eq!(
            response
                .headers()
                .get("cross-origin-resource-policy")
                .unwrap(),
            "cross-origin"
        );
        let disposition = response
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.contains("filename=\"clip video.mp4\""));
    }

    #[test]
    fn test_content_disposition_escapes_non_ascii() {
        let value = content_disposition("vidéo \"1\".mp4");
        assert!(value.starts_with("attachment; filename=\"vido 1.mp4\";"));
        assert!(value.contains("filename*=UTF-8''vid%C3%A9o%20%221%22.mp4"));
    }

    #[test]
    fn test_nice_wrapper_applied_when_configured() {
        let mut config = processing("ffmpeg");
        config.nice_level = Some(10);
        let command = build_command(&job(&["-i", "x"]), &config);
        let program = command.as_std().get_program().to_string_lossy().to_string();
        assert_eq!(program, "nice");
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(&args[..3], &["-n", "10", "ffmpeg"]);
        assert_eq!(&args[3..], &["-i", "x"]);
    }
}

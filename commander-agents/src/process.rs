//! Engine launcher backed by local OS processes.
//!
//! Settings are translated into llama.cpp server flags. Readiness is polled
//! over HTTP against the engine's `/health` endpoint; stdout and stderr are
//! captured into a bounded buffer for diagnostics.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use commander_core::{EngineSettings, LifecycleConfig, LifecycleError, Node, NodeId};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::lifecycle::{EngineHandle, EngineLauncher};

/// Per-request timeout of a health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Build the engine command line for a node.
pub fn engine_args(node: &Node, settings: &EngineSettings) -> Result<Vec<String>, LifecycleError> {
    let spawn_failed = |reason: String| LifecycleError::SpawnFailed {
        node_id: node.id.clone(),
        reason,
    };

    if settings.model.trim().is_empty() {
        return Err(spawn_failed("no model configured".to_string()));
    }
    let (host, port) = split_address(&node.network_address).ok_or_else(|| {
        spawn_failed(format!("invalid network address '{}'", node.network_address))
    })?;

    let model = if Path::new(&settings.model).is_absolute() || node.model_root.is_empty() {
        settings.model.clone()
    } else {
        Path::new(&node.model_root)
            .join(&settings.model)
            .to_string_lossy()
            .into_owned()
    };

    let mut args = vec![
        "-m".to_string(),
        model,
        "-c".to_string(),
        settings.context_size.to_string(),
        "-ngl".to_string(),
        settings.gpu_layers.to_string(),
    ];
    if settings.flash_attention {
        args.push("-fa".to_string());
    }
    args.extend([
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
    ]);
    args.extend(settings.extra_flags.iter().cloned());
    Ok(args)
}

fn split_address(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Launches engines as child processes of this service.
pub struct ProcessLauncher {
    http: reqwest::Client,
    poll_interval: Duration,
    diagnostics_limit: usize,
}

impl ProcessLauncher {
    pub fn new(config: &LifecycleConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            poll_interval: config.ready_poll_interval,
            diagnostics_limit: config.diagnostics_limit,
        }
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn spawn(
        &self,
        node: &Node,
        settings: &EngineSettings,
    ) -> Result<Box<dyn EngineHandle>, LifecycleError> {
        let args = engine_args(node, settings)?;
        tracing::info!(
            node_id = %node.id,
            binary = %settings.binary,
            args = %args.join(" "),
            "Spawning engine"
        );

        let mut child = Command::new(&settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LifecycleError::SpawnFailed {
                node_id: node.id.clone(),
                reason: e.to_string(),
            })?;

        let output = OutputBuffer::new(self.diagnostics_limit);
        if let Some(stdout) = child.stdout.take() {
            output.capture(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            output.capture(stderr);
        }

        let health_url = format!("http://{}/health", node.network_address);
        Ok(Box::new(ProcessHandle {
            node_id: node.id.clone(),
            child,
            health_url,
            http: self.http.clone(),
            poll_interval: self.poll_interval,
            output,
        }))
    }
}

/// Tail of a process's combined output.
#[derive(Clone)]
struct OutputBuffer {
    inner: Arc<Mutex<String>>,
    limit: usize,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(String::new())),
            limit,
        }
    }

    fn capture<R: AsyncRead + Unpin + Send + 'static>(&self, stream: R) {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.push_line(&line);
            }
        });
    }

    fn push_line(&self, line: &str) {
        let Ok(mut text) = self.inner.lock() else {
            return;
        };
        text.push_str(line);
        text.push('\n');
        if text.len() > self.limit {
            let mut cut = text.len() - self.limit;
            while !text.is_char_boundary(cut) {
                cut += 1;
            }
            text.drain(..cut);
        }
    }

    fn contents(&self) -> String {
        self.inner.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

struct ProcessHandle {
    node_id: NodeId,
    child: Child,
    health_url: String,
    http: reqwest::Client,
    poll_interval: Duration,
    output: OutputBuffer,
}

impl ProcessHandle {
    async fn health_ok(&self) -> bool {
        match self
            .http
            .get(&self.health_url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    #[cfg(unix)]
    fn request_exit(&mut self) -> Result<(), LifecycleError> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: `pid` belongs to a child we own and have not yet reaped.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(LifecycleError::StopFailed {
                node_id: self.node_id.clone(),
                reason: std::io::Error::last_os_error().to_string(),
            })
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) -> Result<(), LifecycleError> {
        self.child.start_kill().map_err(|e| LifecycleError::StopFailed {
            node_id: self.node_id.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl EngineHandle for ProcessHandle {
    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    return Err(LifecycleError::ProcessExited {
                        node_id: self.node_id.clone(),
                        code: status.code(),
                        diagnostics: self.diagnostics(),
                    })
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(LifecycleError::SpawnFailed {
                        node_id: self.node_id.clone(),
                        reason: e.to_string(),
                    })
                }
            }

            if self.health_ok().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LifecycleError::ReadyTimeout {
                    node_id: self.node_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                    diagnostics: self.diagnostics(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn stop(&mut self, grace: Duration) -> Result<(), LifecycleError> {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        self.request_exit()?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::StopFailed {
                node_id: self.node_id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                tracing::warn!(
                    node_id = %self.node_id,
                    grace_ms = grace.as_millis() as u64,
                    "Engine ignored stop request, killing"
                );
                self.child.kill().await.map_err(|e| LifecycleError::StopFailed {
                    node_id: self.node_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn exited(&mut self) -> LifecycleError {
        match self.child.wait().await {
            Ok(status) => {
                tracing::error!(node_id = %self.node_id, code = ?status.code(), "Engine exited");
                LifecycleError::ProcessExited {
                    node_id: self.node_id.clone(),
                    code: status.code(),
                    diagnostics: self.diagnostics(),
                }
            }
            Err(e) => LifecycleError::ProcessExited {
                node_id: self.node_id.clone(),
                code: None,
                diagnostics: format!("wait failed: {e}\n{}", self.diagnostics()),
            },
        }
    }

    fn diagnostics(&self) -> String {
        self.output.contents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commander_core::{NodeRole, NodeSpec};

    fn node(address: &str, model_root: &str) -> Node {
        let mut spec = NodeSpec::new("htpc", 60, NodeRole::Worker);
        spec.network_address = address.to_string();
        spec.model_root = model_root.to_string();
        Node::from_spec(spec)
    }

    #[test]
    fn test_flag_translation() {
        let settings = EngineSettings {
            context_size: 8192,
            gpu_layers: 40,
            flash_attention: true,
            model: "qwen2.5-7b.gguf".to_string(),
            extra_flags: vec!["--mlock".to_string()],
            ..EngineSettings::default()
        };
        let args = engine_args(&node("10.0.0.5:8080", "/models"), &settings).expect("args");
        assert_eq!(
            args,
            vec![
                "-m", "/models/qwen2.5-7b.gguf", "-c", "8192", "-ngl", "40", "-fa", "--host",
                "10.0.0.5", "--port", "8080", "--mlock",
            ]
        );
    }

    #[test]
    fn test_flash_attention_off_omits_flag() {
        let settings = EngineSettings {
            flash_attention: false,
            model: "/abs/model.gguf".to_string(),
            ..EngineSettings::default()
        };
        let args = engine_args(&node("localhost:9000", "/models"), &settings).expect("args");
        assert!(!args.contains(&"-fa".to_string()));
        assert_eq!(args[1], "/abs/model.gguf");
    }

    #[test]
    fn test_bad_address_or_missing_model() {
        let settings = EngineSettings {
            model: "m.gguf".to_string(),
            ..EngineSettings::default()
        };
        assert!(engine_args(&node("no-port", ""), &settings).is_err());
        assert!(engine_args(&node("host:1", ""), &EngineSettings::default()).is_err());
    }

    #[test]
    fn test_output_buffer_keeps_tail() {
        let buffer = OutputBuffer::new(16);
        buffer.push_line("0123456789");
        buffer.push_line("abcdefghij");
        let text = buffer.contents();
        assert!(text.len() <= 16);
        assert!(text.ends_with("abcdefghij\n"));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let launcher = ProcessLauncher::new(&LifecycleConfig::default());
        let settings = EngineSettings {
            binary: "/nonexistent/engine-binary".to_string(),
            model: "m.gguf".to_string(),
            ..EngineSettings::default()
        };
        let result = launcher.spawn(&node("127.0.0.1:1", ""), &settings).await;
        assert!(matches!(result, Err(LifecycleError::SpawnFailed { .. })));
    }
}

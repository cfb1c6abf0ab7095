//! Transcription worker subprocess.
//!
//! One invocation per finished WAV segment:
//! `<python> <script> <wav> --model m --device d --compute-type t [--language l]`.
//! The worker must exit 0 and print a single JSON object on stdout. A hard
//! 60 s cap applies; on expiry the process is killed and the segment is
//! reported failed.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use confab_core::config::CaptureConfig;
use confab_core::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub avg_logprob: f64,
    #[serde(default)]
    pub no_speech_prob: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionResult {
    pub success: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub language_probability: f64,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub segments: Vec<TranscriptionSegment>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct TranscriptionWorker {
    python_bin: String,
    script_path: String,
    model: String,
    device: String,
    compute_type: String,
    language: Option<String>,
    timeout: Duration,
}

impl TranscriptionWorker {
    #[must_use]
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            python_bin: config.python_bin.clone(),
            script_path: config.script_path.clone(),
            model: config.model.clone(),
            device: config.device.clone(),
            compute_type: config.compute_type.clone(),
            language: config.language.clone(),
            timeout: Duration::from_secs(config.transcribe_timeout_secs),
        }
    }

    /// Argument vector for one invocation (without the interpreter).
    #[must_use]
    pub fn args(&self, wav_path: &Path) -> Vec<String> {
        let mut args = vec![
            self.script_path.clone(),
            wav_path.display().to_string(),
            "--model".into(),
            self.model.clone(),
            "--device".into(),
            self.device.clone(),
            "--compute-type".into(),
            self.compute_type.clone(),
        ];
        if let Some(language) = &self.language {
            args.push("--language".into());
            args.push(language.clone());
        }
        args
    }

    /// Transcribe one WAV segment.
    pub async fn transcribe(&self, wav_path: &Path) -> Result<TranscriptionResult> {
        let child = Command::new(&self.python_bin)
            .args(self.args(wav_path))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TranscriptionFailed(format!("spawn failed: {e}")))?;

        // Dropping the in-flight future on timeout kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| Error::TranscriptionFailed(format!("wait failed: {e}")))?
            }
            () = tokio::time::sleep(self.timeout) => {
                return Err(Error::TranscriptionFailed(format!(
                    "timed out after {}s for {}",
                    self.timeout.as_secs(),
                    wav_path.display()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::TranscriptionFailed(format!(
                "worker exited {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let result: TranscriptionResult = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::TranscriptionFailed(format!("invalid worker output: {e}")))?;

        if !result.success {
            return Err(Error::TranscriptionFailed(
                result
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string()),
            ));
        }

        Ok(result)
    }
}

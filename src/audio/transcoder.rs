//! External transcoder processes.
//!
//! A [`Transcoder`] turns a stream locator plus ffmpeg arguments into raw PCM
//! (`f32le`, 48 kHz, stereo) and a [`TranscodeProcess`] handle. The guild
//! actor owns the handle for the lifetime of one playback session and always
//! observes its exit before spawning the next one.

use async_trait::async_trait;
use regex::Regex;
use std::{
    collections::VecDeque,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::audio::effects::FfmpegArgs;

/// Audio PCM del transcodificador
pub type PcmStream = Box<dyn AsyncRead + Send + Sync + Unpin>;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;

const STDERR_TAIL: usize = 12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranscodeError {
    #[error("No se pudo lanzar {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    #[error("El proceso no expuso su salida de audio")]
    MissingStdout,
}

/// Cómo terminó el proceso
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Llegó al final del stream
    Finished,
    /// El servidor rechazó el localizador (403/404): hay que volver a resolver
    Expired,
    /// Terminó con error; incluye las últimas líneas de stderr
    Failed(String),
    /// Lo detuvimos nosotros
    Terminated,
}

#[async_trait]
pub trait TranscodeProcess: Send {
    /// Espera a que el proceso termine. Es seguro cancelarlo y volver a llamarlo.
    async fn wait(&mut self) -> ExitOutcome;

    /// Pide una salida limpia y mata el proceso si no termina en `grace`
    async fn terminate(&mut self, grace: Duration);
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn spawn(
        &self,
        input: &str,
        args: &FfmpegArgs,
    ) -> Result<(PcmStream, Box<dyn TranscodeProcess>), TranscodeError>;
}

/// Transcodificador basado en el binario de ffmpeg
pub struct FfmpegTranscoder {
    binary: String,
    expired: Regex,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            binary: binary.into(),
            expired: Regex::new(
                r"(?i)(http error 40[34]|server returned 40[34]|403 forbidden|404 not found)",
            )?,
        })
    }

    fn command(&self, input: &str, args: &FfmpegArgs) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-nostats", "-loglevel", "warning"])
            .args(&args.pre_args)
            .arg("-i")
            .arg(input)
            .args(&args.filter_args)
            .args(["-f", "f32le", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(
        &self,
        input: &str,
        args: &FfmpegArgs,
    ) -> Result<(PcmStream, Box<dyn TranscodeProcess>), TranscodeError> {
        let mut child = self.command(input, args).spawn().map_err(|e| TranscodeError::Spawn {
            binary: self.binary.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or(TranscodeError::MissingStdout)?;
        let stderr = child.stderr.take().map(collect_stderr);

        info!("🎬 ffmpeg lanzado (pid {:?})", child.id());

        let pcm: PcmStream = Box::new(stdout);
        let process: Box<dyn TranscodeProcess> = Box::new(FfmpegProcess {
            child,
            stderr,
            expired: self.expired.clone(),
            status: None,
            terminated: false,
        });
        Ok((pcm, process))
    }
}

/// Guarda las últimas líneas de stderr
fn collect_stderr(stderr: ChildStderr) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);

        while let Ok(Some(line)) = lines.next_line().await {
            debug!("ffmpeg: {}", line);
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        tail.into()
    })
}

struct FfmpegProcess {
    child: Child,
    stderr: Option<JoinHandle<Vec<String>>>,
    expired: Regex,
    status: Option<ExitStatus>,
    terminated: bool,
}

fn classify(expired: &Regex, terminated: bool, success: bool, stderr: &[String]) -> ExitOutcome {
    if terminated {
        ExitOutcome::Terminated
    } else if stderr.iter().any(|l| expired.is_match(l)) {
        ExitOutcome::Expired
    } else if success {
        ExitOutcome::Finished
    } else {
        ExitOutcome::Failed(stderr.join("\n"))
    }
}

#[async_trait]
impl TranscodeProcess for FfmpegProcess {
    async fn wait(&mut self) -> ExitOutcome {
        if self.status.is_none() {
            match self.child.wait().await {
                Ok(status) => self.status = Some(status),
                Err(e) => return ExitOutcome::Failed(e.to_string()),
            }
        }

        let stderr = match self.stderr.as_mut() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        self.stderr = None;

        let success = self.status.is_some_and(|s| s.success());
        let outcome = classify(&self.expired, self.terminated, success, &stderr);
        debug!("ffmpeg terminó: {:?}", outcome);
        outcome
    }

    async fn terminate(&mut self, grace: Duration) {
        if self.status.is_some() {
            return;
        }
        self.terminated = true;

        // ffmpeg sale limpio al recibir 'q' por stdin
        if let Some(mut stdin) = self.child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => self.status = Some(status),
            Ok(Err(e)) => warn!("⚠️ Error esperando a ffmpeg: {}", e),
            Err(_) => {
                warn!("⏰ ffmpeg no respondió en {:?}, forzando cierre", grace);
                if let Err(e) = self.child.kill().await {
                    warn!("⚠️ No se pudo matar ffmpeg: {}", e);
                }
                if let Ok(status) = self.child.wait().await {
                    self.status = Some(status);
                }
            }
        }
    }
}

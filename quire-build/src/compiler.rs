//! Driving the external typesetting compiler for one pass.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::BuildError;

/// Compiler invocation: `<program> <args…> <entry>`.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Executable name or path
    pub program: String,
    /// Arguments placed before the entry file
    pub args: Vec<String>,
    /// Wall-clock limit for a single pass
    pub pass_timeout: Duration,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "pdflatex".to_string(),
            args: vec!["-interaction=nonstopmode".to_string()],
            pass_timeout: Duration::from_secs(30),
        }
    }
}

/// Captured outcome of one compiler pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutput {
    /// Exit code; `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl PassOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable exit status.
    pub fn status(&self) -> String {
        match self.code {
            Some(code) => format!("status {code}"),
            None => "a signal".to_string(),
        }
    }

    /// Diagnostic log: stdout followed by stderr, never empty.
    pub fn log(&self) -> String {
        let mut log = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        log.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(&self.stderr);
        }
        if log.trim().is_empty() {
            return format!("compiler exited with {}", self.status());
        }
        log
    }
}

/// How long output pipes may stay open once the compiler itself has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run one pass of the compiler on `entry` inside `dir`.
///
/// Stdin is closed and both output streams are captured. The pass timeout
/// bounds the compiler process; if it is exceeded the child is killed and
/// reaped before [`BuildError::Timeout`] is returned. Output pipes held open
/// by leftover grandchildren are abandoned shortly after the child exits.
pub async fn run_pass(config: &CompilerConfig, dir: &Path, entry: &str) -> Result<PassOutput, BuildError> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .arg(entry)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BuildError::Spawn {
            program: config.program.clone(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (exited_tx, exited_rx) = watch::channel(false);

    let wait = async {
        let status = match tokio::time::timeout(config.pass_timeout, child.wait()).await {
            Ok(status) => status.map_err(BuildError::Io),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill timed-out compiler: {e}");
                }
                Err(BuildError::Timeout(config.pass_timeout))
            }
        };
        let _ = exited_tx.send(true);
        status
    };

    let (status, stdout, stderr) =
        tokio::join!(wait, drain(stdout, exited_rx.clone()), drain(stderr, exited_rx));

    Ok(PassOutput {
        code: status?.code(),
        stdout,
        stderr,
    })
}

/// Read a pipe to EOF, or until it has stayed open for
/// [`OUTPUT_DRAIN_GRACE`] after the child exited.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, mut exited: watch::Receiver<bool>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };

    let grace = async move {
        let _ = exited.wait_for(|done| *done).await;
        tokio::time::sleep(OUTPUT_DRAIN_GRACE).await;
    };
    tokio::pin!(grace);

    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            biased;
            read = pipe.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    log::warn!("Reading compiler output failed: {e}");
                    break;
                }
            },
            _ = &mut grace => {
                log::warn!("Compiler output still open after exit; keeping {} byte(s)", buf.len());
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

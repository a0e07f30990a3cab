//! Remote backend: SSH transport with a lazily established, reused
//! connection per host. File operations ride the command channel
//! (`cat`, `test`, `mkdir -p`) so the capability surface stays identical
//! across backends; `close` tears the connection down.

use async_trait::async_trait;
use openssh::{KnownHosts, Session, Stdio};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::local::{mongo_shell_command, parse_mongo_reply};
use super::{CommandOutput, Executor, MongoEndpoint, SystemInfo, sh_quote};
use crate::errors::ExecutorError;

/// Executes on a remote host over SSH.
pub struct RemoteExecutor {
    /// Host label used for routing (`op.target.host`).
    host: String,
    /// SSH destination, e.g. `admin@db1.example.com`.
    destination: String,
    mongo_shell: String,
    accept_unknown_hosts: bool,
    session: Mutex<Option<Session>>,
}

impl RemoteExecutor {
    pub fn new(host: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            destination: destination.into(),
            mongo_shell: "mongosh".to_string(),
            accept_unknown_hosts: false,
            session: Mutex::new(None),
        }
    }

    pub fn with_mongo_shell(mut self, shell: impl Into<String>) -> Self {
        self.mongo_shell = shell.into();
        self
    }

    /// Accept unknown host keys instead of failing the handshake.
    pub fn accept_unknown_hosts(mut self) -> Self {
        self.accept_unknown_hosts = true;
        self
    }

    /// Run a remote shell command, returning raw stdout plus combined text.
    async fn run_raw(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<(Vec<u8>, CommandOutput), ExecutorError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let known_hosts = if self.accept_unknown_hosts {
                KnownHosts::Accept
            } else {
                KnownHosts::Strict
            };
            debug!(destination = %self.destination, "establishing ssh session");
            let session = Session::connect(&self.destination, known_hosts)
                .await
                .map_err(ExecutorError::transport)?;
            *guard = Some(session);
        }
        let session = guard.as_ref().expect("session established above");

        let mut child = session
            .command("sh")
            .arg("-c")
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(ExecutorError::transport)?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin().take() {
                pipe.write_all(bytes)
                    .await
                    .map_err(|e| ExecutorError::io(command, e))?;
                pipe.shutdown()
                    .await
                    .map_err(|e| ExecutorError::io(command, e))?;
            }
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(ExecutorError::transport)?;
        let mut combined = String::from_utf8_lossy(&out.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok((
            out.stdout,
            CommandOutput {
                output: combined,
                exit_code: out.status.code().unwrap_or(-1),
            },
        ))
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, ExecutorError> {
        Ok(self.run_raw(command, None).await?.1)
    }

    /// Run and fail on a non-zero exit.
    async fn run_checked(&self, command: &str) -> Result<CommandOutput, ExecutorError> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(ExecutorError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.output.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    fn name(&self) -> &str {
        &self.host
    }

    async fn create_dir(&self, path: &str) -> Result<(), ExecutorError> {
        self.run_checked(&format!("mkdir -p {}", sh_quote(path)))
            .await?;
        Ok(())
    }

    async fn upload_bytes(
        &self,
        content: &[u8],
        dest: &str,
        mode: u32,
    ) -> Result<(), ExecutorError> {
        let parent = Path::new(dest)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());
        let script = format!(
            "mkdir -p {parent} && cat > {dest} && chmod {mode:o} {dest}",
            parent = sh_quote(&parent),
            dest = sh_quote(dest),
        );
        let (_, output) = self.run_raw(&script, Some(content)).await?;
        if !output.success() {
            return Err(ExecutorError::CommandFailed {
                command: script,
                exit_code: output.exit_code,
                stderr: output.output.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, dest: &str) -> Result<(), ExecutorError> {
        let content = tokio::fs::read(local)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ExecutorError::NotFound {
                    path: local.display().to_string(),
                },
                _ => ExecutorError::io(local.display().to_string(), e),
            })?;
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::metadata(local)
                .await
                .map(|m| m.permissions().mode() & 0o777)
                .unwrap_or(0o644)
        };
        #[cfg(not(unix))]
        let mode = 0o644;
        self.upload_bytes(&content, dest, mode).await
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ExecutorError> {
        let (stdout, output) = self
            .run_raw(&format!("cat {}", sh_quote(remote)), None)
            .await?;
        if !output.success() {
            return Err(ExecutorError::NotFound {
                path: remote.to_string(),
            });
        }
        tokio::fs::write(local, stdout)
            .await
            .map_err(|e| ExecutorError::io(local.display().to_string(), e))?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool, ExecutorError> {
        Ok(self
            .run(&format!("test -e {}", sh_quote(path)))
            .await?
            .success())
    }

    async fn remove_file(&self, path: &str) -> Result<(), ExecutorError> {
        self.run_checked(&format!("rm -f {}", sh_quote(path)))
            .await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &str, recursive: bool) -> Result<(), ExecutorError> {
        let command = if recursive {
            format!("rm -rf {}", sh_quote(path))
        } else {
            format!("test ! -e {path} || rmdir {path}", path = sh_quote(path))
        };
        self.run_checked(&command).await?;
        Ok(())
    }

    async fn create_symlink(&self, target: &str, link: &str) -> Result<(), ExecutorError> {
        self.run_checked(&format!(
            "ln -sfn {} {}",
            sh_quote(target),
            sh_quote(link)
        ))
        .await?;
        Ok(())
    }

    async fn read_symlink(&self, link: &str) -> Result<Option<String>, ExecutorError> {
        let quoted = sh_quote(link);
        let output = self
            .run(&format!("test -L {quoted} && readlink {quoted}"))
            .await?;
        if output.success() {
            Ok(Some(output.output.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    async fn run_command(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecutorError> {
        Ok(self.run_raw(command, stdin).await?.1)
    }

    async fn spawn_process(&self, command: &str, args: &[String]) -> Result<u32, ExecutorError> {
        let quoted_args: Vec<String> = args.iter().map(|a| sh_quote(a)).collect();
        let script = format!(
            "nohup {} {} >/dev/null 2>&1 & echo $!",
            sh_quote(command),
            quoted_args.join(" ")
        );
        let output = self.run_checked(&script).await?;
        output
            .output
            .trim()
            .parse::<u32>()
            .map_err(|_| ExecutorError::Transport {
                message: format!("no pid returned for spawned command '{command}'"),
            })
    }

    async fn run_mongo_command(
        &self,
        endpoint: &MongoEndpoint,
        command: serde_json::Value,
        _safety_check: bool,
    ) -> Result<serde_json::Value, ExecutorError> {
        let shell = mongo_shell_command(&self.mongo_shell, endpoint, &command);
        let output = self.run(&shell).await?;
        parse_mongo_reply(&output)
    }

    async fn process_running(&self, pid: u32) -> Result<bool, ExecutorError> {
        Ok(self.run(&format!("kill -0 {pid}")).await?.success())
    }

    async fn kill_process(&self, pid: u32) -> Result<(), ExecutorError> {
        self.run(&format!("kill -KILL {pid}")).await?;
        Ok(())
    }

    async fn stop_process(&self, pid: u32, grace: Duration) -> Result<(), ExecutorError> {
        if !self.run(&format!("kill -TERM {pid}")).await?.success() {
            // Already gone.
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.process_running(pid).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.kill_process(pid).await
    }

    async fn system_info(&self) -> Result<SystemInfo, ExecutorError> {
        let output = self.run_checked("uname -s -m -r").await?;
        let mut fields = output.output.split_whitespace();
        Ok(SystemInfo {
            os: fields.next().unwrap_or_default().to_lowercase(),
            arch: fields.next().unwrap_or_default().to_string(),
            version: fields.next().unwrap_or_default().to_string(),
        })
    }

    async fn available_disk(&self, path: &str) -> Result<u64, ExecutorError> {
        // POSIX df: last line is `fs 1k-blocks used avail capacity mount`.
        let output = self
            .run_checked(&format!("df -Pk {}", sh_quote(path)))
            .await?;
        let avail_kb = output
            .output
            .lines()
            .last()
            .and_then(|l| l.split_whitespace().nth(3))
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| ExecutorError::Transport {
                message: format!("unparseable df output for {path}"),
            })?;
        Ok(avail_kb * 1024)
    }

    async fn port_free(&self, port: u16) -> Result<bool, ExecutorError> {
        let probe = format!("ss -ltn 2>/dev/null | grep -q ':{port} '");
        Ok(!self.run(&probe).await?.success())
    }

    async fn user_exists(&self, user: &str) -> Result<bool, ExecutorError> {
        Ok(self
            .run(&format!("id -u {} >/dev/null 2>&1", sh_quote(user)))
            .await?
            .success())
    }

    async fn ping(&self) -> Result<(), ExecutorError> {
        self.run_checked("true").await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ExecutorError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.close().await.map_err(ExecutorError::transport)?;
        }
        Ok(())
    }
}

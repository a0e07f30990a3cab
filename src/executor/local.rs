//! Local backend: thin wrapper over the host process API and filesystem.

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, Executor, MongoEndpoint, SystemInfo};
use crate::errors::ExecutorError;

/// Executes against the machine the engine itself runs on.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    /// MongoDB shell binary used for the admin command path.
    mongo_shell: String,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self {
            mongo_shell: "mongosh".to_string(),
        }
    }
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different MongoDB shell binary (`mongo` for pre-5.0 servers).
    pub fn with_mongo_shell(mut self, shell: impl Into<String>) -> Self {
        self.mongo_shell = shell.into();
        self
    }
}

/// Build the shell invocation that runs one admin command through the
/// MongoDB shell and prints the reply as JSON on the last line.
pub(crate) fn mongo_shell_command(
    shell: &str,
    endpoint: &MongoEndpoint,
    command: &serde_json::Value,
) -> String {
    let eval = format!("EJSON.stringify(db.adminCommand({command}))");
    format!(
        "{shell} '{uri}' --quiet --eval '{eval}'",
        uri = endpoint.uri(),
        eval = eval.replace('\'', r#"'\''"#),
    )
}

/// Parse the shell's reply, surfacing `ok: 0` replies as Mongo errors.
pub(crate) fn parse_mongo_reply(output: &CommandOutput) -> Result<serde_json::Value, ExecutorError> {
    if !output.success() {
        return Err(ExecutorError::Mongo {
            message: output.output.trim().to_string(),
        });
    }
    let line = output
        .output
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .unwrap_or("");
    let reply: serde_json::Value = serde_json::from_str(line).map_err(|e| ExecutorError::Mongo {
        message: format!("unparseable shell reply: {e}"),
    })?;
    if reply.get("ok").and_then(|v| v.as_f64()) == Some(0.0) {
        let message = reply
            .get("errmsg")
            .and_then(|v| v.as_str())
            .unwrap_or("command returned ok: 0")
            .to_string();
        return Err(ExecutorError::Mongo { message });
    }
    Ok(reply)
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    async fn create_dir(&self, path: &str) -> Result<(), ExecutorError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| ExecutorError::io(path, e))
    }

    async fn upload_bytes(
        &self,
        content: &[u8],
        dest: &str,
        mode: u32,
    ) -> Result<(), ExecutorError> {
        if let Some(parent) = Path::new(dest).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::io(dest, e))?;
        }
        tokio::fs::write(dest, content)
            .await
            .map_err(|e| ExecutorError::io(dest, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| ExecutorError::io(dest, e))?;
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, dest: &str) -> Result<(), ExecutorError> {
        if !tokio::fs::try_exists(local)
            .await
            .map_err(|e| ExecutorError::io(local.display().to_string(), e))?
        {
            return Err(ExecutorError::NotFound {
                path: local.display().to_string(),
            });
        }
        if let Some(parent) = Path::new(dest).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::io(dest, e))?;
        }
        tokio::fs::copy(local, dest)
            .await
            .map_err(|e| ExecutorError::io(dest, e))?;
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ExecutorError> {
        tokio::fs::copy(remote, local)
            .await
            .map_err(|e| ExecutorError::io(remote, e))?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool, ExecutorError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| ExecutorError::io(path, e))
    }

    async fn remove_file(&self, path: &str) -> Result<(), ExecutorError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecutorError::io(path, e)),
        }
    }

    async fn remove_dir(&self, path: &str, recursive: bool) -> Result<(), ExecutorError> {
        let result = if recursive {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecutorError::io(path, e)),
        }
    }

    async fn create_symlink(&self, target: &str, link: &str) -> Result<(), ExecutorError> {
        match tokio::fs::symlink_metadata(link).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                tokio::fs::remove_file(link)
                    .await
                    .map_err(|e| ExecutorError::io(link, e))?;
            }
            _ => {}
        }
        #[cfg(unix)]
        tokio::fs::symlink(target, link)
            .await
            .map_err(|e| ExecutorError::io(link, e))?;
        Ok(())
    }

    async fn read_symlink(&self, link: &str) -> Result<Option<String>, ExecutorError> {
        match tokio::fs::symlink_metadata(link).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = tokio::fs::read_link(link)
                    .await
                    .map_err(|e| ExecutorError::io(link, e))?;
                Ok(Some(target.to_string_lossy().to_string()))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ExecutorError::io(link, e)),
        }
    }

    async fn run_command(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecutorError> {
        debug!(command, "running local command");
        let mut child = Command::new("sh")
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
            .map_err(|e| ExecutorError::io(command, e))?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes)
                    .await
                    .map_err(|e| ExecutorError::io(command, e))?;
            }
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutorError::io(command, e))?;
        let mut output = String::from_utf8_lossy(&out.stdout).to_string();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            output,
            exit_code: out.status.code().unwrap_or(-1),
        })
    }

    async fn spawn_process(&self, command: &str, args: &[String]) -> Result<u32, ExecutorError> {
        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| ExecutorError::io(command, e))?;
        child.id().ok_or_else(|| ExecutorError::Transport {
            message: format!("spawned process '{command}' exited before a pid was assigned"),
        })
    }

    async fn run_mongo_command(
        &self,
        endpoint: &MongoEndpoint,
        command: serde_json::Value,
        _safety_check: bool,
    ) -> Result<serde_json::Value, ExecutorError> {
        let shell = mongo_shell_command(&self.mongo_shell, endpoint, &command);
        let output = self.run_command(&shell, None).await?;
        parse_mongo_reply(&output)
    }

    async fn process_running(&self, pid: u32) -> Result<bool, ExecutorError> {
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            // Alive but owned by someone else.
            Err(nix::errno::Errno::EPERM) => Ok(true),
            Err(e) => Err(ExecutorError::Transport {
                message: format!("signal probe for pid {pid} failed: {e}"),
            }),
        }
    }

    async fn kill_process(&self, pid: u32) -> Result<(), ExecutorError> {
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ExecutorError::Transport {
                message: format!("kill of pid {pid} failed: {e}"),
            }),
        }
    }

    async fn stop_process(&self, pid: u32, grace: Duration) -> Result<(), ExecutorError> {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => return Ok(()),
            Err(e) => {
                return Err(ExecutorError::Transport {
                    message: format!("stop of pid {pid} failed: {e}"),
                });
            }
        }
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.process_running(pid).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.kill_process(pid).await
    }

    async fn system_info(&self) -> Result<SystemInfo, ExecutorError> {
        Ok(SystemInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: sysinfo::System::os_version().unwrap_or_default(),
        })
    }

    async fn available_disk(&self, path: &str) -> Result<u64, ExecutorError> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let target = Path::new(path);
        // Longest mount point that prefixes the path wins.
        let best = disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());
        match best {
            Some(disk) => Ok(disk.available_space()),
            None => Err(ExecutorError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    async fn port_free(&self, port: u16) -> Result<bool, ExecutorError> {
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(false),
            Err(e) => Err(ExecutorError::Transport {
                message: format!("port probe for {port} failed: {e}"),
            }),
        }
    }

    async fn user_exists(&self, user: &str) -> Result<bool, ExecutorError> {
        nix::unistd::User::from_name(user)
            .map(|u| u.is_some())
            .map_err(|e| ExecutorError::Transport {
                message: format!("user lookup for '{user}' failed: {e}"),
            })
    }

    async fn ping(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

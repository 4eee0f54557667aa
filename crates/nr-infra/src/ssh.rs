use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::types::CommandOutput;
use crate::{Error, RemoteConnector, RemoteExecutor, Result};

/// ssh reserves exit code 255 for its own failures (connect, auth, ...).
const SSH_FAILURE: i32 = 255;

/// Connection settings shared by every server.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub private_key_path: PathBuf,
    pub public_key: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl SshConfig {
    /// Create from env vars:
    ///
    /// - `SSH_PRIVATE_KEY_PATH` (required, must exist)
    /// - `SSH_PUBLIC_KEY_PATH` (optional, contents installed on new servers)
    /// - `SSH_USER` (default: `"root"`)
    /// - `SSH_PORT` (default: `22`)
    /// - `SSH_CONNECT_TIMEOUT_SECS` (default: `10`)
    /// - `SSH_COMMAND_TIMEOUT_SECS` (default: `300`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let private_key_path = std::env::var("SSH_PRIVATE_KEY_PATH")
            .map(PathBuf::from)
            .map_err(|_| Error::MissingEnv("SSH_PRIVATE_KEY_PATH".into()))?;
        if !private_key_path.is_file() {
            return Err(Error::Config(format!(
                "ssh private key not found at {}",
                private_key_path.display()
            )));
        }

        let public_key = match std::env::var("SSH_PUBLIC_KEY_PATH") {
            Ok(path) => Some(
                std::fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("read ssh public key {path}: {e}")))?
                    .trim()
                    .to_string(),
            ),
            Err(_) => None,
        };

        let port = std::env::var("SSH_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(22);
        let connect_timeout = std::env::var("SSH_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let command_timeout = std::env::var("SSH_COMMAND_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        Ok(Self {
            user: std::env::var("SSH_USER").unwrap_or_else(|_| "root".into()),
            port,
            private_key_path,
            public_key,
            connect_timeout: Duration::from_secs(connect_timeout),
            command_timeout: Duration::from_secs(command_timeout),
        })
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Opens [`SshExecutor`]s with a shared [`SshConfig`].
pub struct SshConnector {
    config: Arc<SshConfig>,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl RemoteConnector for SshConnector {
    fn connect(&self, host: &str) -> Arc<dyn RemoteExecutor> {
        Arc::new(SshExecutor {
            host: host.to_string(),
            config: self.config.clone(),
        })
    }

    fn public_key(&self) -> Option<&str> {
        self.config.public_key.as_deref()
    }
}

/// Runs commands on one host through the system `ssh` binary.
pub struct SshExecutor {
    host: String,
    config: Arc<SshConfig>,
}

impl SshExecutor {
    fn args(&self, command: &str) -> Vec<String> {
        let cfg = &self.config;
        vec![
            "-i".into(),
            cfg.private_key_path.display().to_string(),
            "-p".into(),
            cfg.port.to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            format!("ConnectTimeout={}", cfg.connect_timeout.as_secs()),
            format!("{}@{}", cfg.user, self.host),
            command.to_string(),
        ]
    }

    async fn run(&self, command: &str, stdin: Option<&str>) -> Result<CommandOutput> {
        let mut child = Command::new("ssh")
            .args(self.args(command))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.remote_err(format!("spawn ssh: {e}")))?;

        if let (Some(content), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(content.as_bytes())
                .await
                .map_err(|e| self.remote_err(format!("write stdin: {e}")))?;
            // Dropping the pipe sends EOF.
            drop(pipe);
        }

        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "{} after {}s: {command}",
                    self.host,
                    self.config.command_timeout.as_secs()
                ))
            })?
            .map_err(|e| self.remote_err(format!("wait for ssh: {e}")))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn remote_err(&self, message: String) -> Error {
        Error::Remote {
            host: self.host.clone(),
            message,
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, command: &str, check: bool) -> Result<CommandOutput> {
        debug!(host = %self.host, command, "ssh: exec");
        let out = self.run(command, None).await?;

        if out.exit_code == SSH_FAILURE {
            return Err(self.remote_err(out.stderr.trim().to_string()));
        }
        if check && !out.success() {
            warn!(host = %self.host, command, exit_code = out.exit_code, "ssh: command failed");
            return Err(Error::CommandFailed {
                host: self.host.clone(),
                command: command.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    async fn upload(&self, content: &str, remote_path: &str, mode: u32) -> Result<()> {
        let dir = match remote_path.rsplit_once('/') {
            Some(("", _)) => "/",
            Some((dir, _)) => dir,
            None => ".",
        };
        let path = shell_quote(remote_path);
        let command = format!(
            "mkdir -p {} && cat > {path} && chmod {mode:o} {path}",
            shell_quote(dir)
        );

        debug!(host = %self.host, path = remote_path, bytes = content.len(), "ssh: upload");
        let out = self.run(&command, Some(content)).await?;
        if !out.success() {
            return Err(Error::CommandFailed {
                host: self.host.clone(),
                command,
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SshConfig {
        SshConfig {
            user: "root".into(),
            port: 2222,
            private_key_path: PathBuf::from("/keys/id_ed25519"),
            public_key: Some("ssh-ed25519 AAAA operator".into()),
            connect_timeout: Duration::from_secs(7),
            command_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("/opt/noderack/instances/a"), "/opt/noderack/instances/a");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn args_target_host_with_key_and_port() {
        let exec = SshExecutor {
            host: "203.0.113.9".into(),
            config: Arc::new(config()),
        };
        let args = exec.args("uptime");
        assert_eq!(args.last().map(String::as_str), Some("uptime"));
        assert!(args.contains(&"root@203.0.113.9".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"/keys/id_ed25519".to_string()));
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn connector_exposes_public_key() {
        let connector = SshConnector::new(config());
        assert_eq!(connector.public_key(), Some("ssh-ed25519 AAAA operator"));
        assert_eq!(connector.connect("10.0.0.2").host(), "10.0.0.2");
    }
}

//! Environment for git commands that may talk to a remote.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempdir::TempDir;
use tokio::process::Command;

use crate::GitserverResult;

const CREDENTIAL_HELPER: &str =
    r#"!f() { echo "username=${GIT_USER}"; echo "password=${GIT_PASSWORD}"; }; f"#;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteOptions {
    pub ssh: Option<SshConfig>,
    pub https: Option<HttpsConfig>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SshConfig {
    #[serde(default)]
    pub user: String,
    pub private_key: String,
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("user", &self.user)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpsConfig {
    #[serde(default)]
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for HttpsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Files the git environment points at. Must outlive the git process.
#[derive(Debug, Default)]
pub struct RemoteEnv {
    _key_dir: Option<TempDir>,
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

fn make_ssh_command(insecure: bool, user: Option<&str>, identity: Option<&Path>) -> String {
    let mut ssh_options = vec!["BatchMode=yes", "ConnectTimeout=30"];
    if insecure {
        ssh_options.extend(["StrictHostKeyChecking=no", "UserKnownHostsFile=/dev/null"]);
    }
    if identity.is_some() {
        ssh_options.push("IdentitiesOnly=yes");
    }

    let mut command = vec!["ssh".to_owned()];
    command.extend(ssh_options.iter().map(|o| format!("-o {}", o)));
    if let Some(identity) = identity {
        command.push(format!("-i {}", shell_quote(&identity.to_string_lossy())));
    }
    if let Some(user) = user.filter(|u| !u.is_empty()) {
        command.push(format!("-l {}", shell_quote(user)));
    }

    command.join(" ")
}

fn write_private_key(dir: &Path, key: &str) -> GitserverResult<std::path::PathBuf> {
    let path = dir.join("id");
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;

    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }

    Ok(path)
}

/// Configure `cmd` so that git never prompts, honours the host verification
/// policy and authenticates with the credentials in `opt`.
pub fn apply(cmd: &mut Command, opt: &RemoteOptions, insecure: bool) -> GitserverResult<RemoteEnv> {
    cmd.env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_ASKPASS", "true");

    let mut remote_env = RemoteEnv::default();

    let ssh_command = match &opt.ssh {
        Some(ssh) => {
            let key_dir = TempDir::new("gitserver-ssh")?;
            let identity = write_private_key(key_dir.path(), &ssh.private_key)?;
            let command = make_ssh_command(insecure, Some(&ssh.user), Some(&identity));
            remote_env._key_dir = Some(key_dir);
            command
        }
        None => make_ssh_command(insecure, None, None),
    };
    cmd.env("GIT_SSH_COMMAND", ssh_command);

    if let Some(https) = &opt.https {
        cmd.env("GIT_USER", &https.user)
            .env("GIT_PASSWORD", &https.password)
            .env("GIT_CONFIG_COUNT", "2")
            .env("GIT_CONFIG_KEY_0", "credential.helper")
            .env("GIT_CONFIG_VALUE_0", "")
            .env("GIT_CONFIG_KEY_1", "credential.helper")
            .env("GIT_CONFIG_VALUE_1", CREDENTIAL_HELPER);
    }

    Ok(remote_env)
}

//! Remote-connect command construction.
//!
//! A remote session is a local shell that immediately runs `ssh` to the
//! target. The command line is typed into the shell, so every argument is
//! validated and shell-quoted here.

use std::path::{Path, PathBuf};

use protocol::ConnectionParams;

use super::SessionError;

/// Settings applied to every generated ssh command.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// ssh binary to invoke.
    pub ssh_program: String,
    /// Seconds before ssh gives up on the TCP connect.
    pub connect_timeout_secs: u64,
    /// Key used when the target does not name one.
    pub default_key: Option<PathBuf>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            connect_timeout_secs: 10,
            default_key: None,
        }
    }
}

/// Build the line written to the shell to open the remote session,
/// including the trailing newline.
pub fn connect_command(
    params: &ConnectionParams,
    options: &RemoteOptions,
) -> Result<String, SessionError> {
    validate_token("host", &params.host)?;
    validate_token("username", &params.username)?;
    if params.port == 0 {
        return Err(SessionError::InvalidConnection("port must be non-zero".into()));
    }

    let key = params
        .key_path
        .as_deref()
        .map(Path::new)
        .or(options.default_key.as_deref());

    let mut args: Vec<String> = vec![
        options.ssh_program.clone(),
        "-tt".into(),
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "ServerAliveInterval=30".into(),
        "-o".into(),
        "ServerAliveCountMax=3".into(),
        "-o".into(),
        format!("ConnectTimeout={}", options.connect_timeout_secs),
    ];
    if let Some(key) = key {
        args.push("-o".into());
        args.push("PasswordAuthentication=no".into());
        args.push("-i".into());
        args.push(key.to_string_lossy().into_owned());
    }
    args.push("-p".into());
    args.push(params.port.to_string());
    args.push(format!("{}@{}", params.username, params.host));

    let mut line = args
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    line.push('\n');
    Ok(line)
}

fn validate_token(field: &str, value: &str) -> Result<(), SessionError> {
    if value.is_empty() {
        return Err(SessionError::InvalidConnection(format!("{} is empty", field)));
    }
    if value.starts_with('-') {
        return Err(SessionError::InvalidConnection(format!(
            "{} must not start with '-'",
            field
        )));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '@')
    {
        return Err(SessionError::InvalidConnection(format!(
            "{} contains invalid characters",
            field
        )));
    }
    Ok(())
}

/// POSIX single-quote escaping. Plain words are left as they are.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

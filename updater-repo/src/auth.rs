//! Credential delivery to git child processes.
//!
//! Nothing is written to disk or placed on the command line: SSH keys go
//! through `GIT_SSH_COMMAND`, HTTP credentials through an `http.extraHeader`
//! setting passed in the `GIT_CONFIG_COUNT` environment form.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::process::Command;
use updater_core::GitAuth;

/// Configure `cmd` to authenticate with `auth`.
pub fn apply(cmd: &mut Command, auth: &GitAuth) {
    for (key, value) in env_for(auth) {
        cmd.env(key, value);
    }
}

/// Environment variables carrying `auth`. Empty for [`GitAuth::None`].
pub fn env_for(auth: &GitAuth) -> Vec<(&'static str, String)> {
    match auth {
        GitAuth::None => vec![],
        GitAuth::SshKey { key_path } => vec![(
            "GIT_SSH_COMMAND",
            format!(
                "ssh -i '{}' -o IdentitiesOnly=yes -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
                key_path.display().to_string().replace('\'', r"'\''")
            ),
        )],
        GitAuth::Basic { username, password } => {
            let encoded = STANDARD.encode(format!("{username}:{}", password.expose()));
            extra_header(format!("Authorization: Basic {encoded}"))
        }
        GitAuth::Bearer { token } => {
            extra_header(format!("Authorization: Bearer {}", token.expose()))
        }
    }
}

fn extra_header(value: String) -> Vec<(&'static str, String)> {
    vec![
        ("GIT_CONFIG_COUNT", "1".to_string()),
        ("GIT_CONFIG_KEY_0", "http.extraHeader".to_string()),
        ("GIT_CONFIG_VALUE_0", value),
    ]
}

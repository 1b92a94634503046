//! Remote execution on the DUT over a login session.
//!
//! - [`session`] runs one command per session and streams its output
//! - [`reachability`] waits for the host to come back after a reboot

pub mod reachability;
pub mod session;

use std::time::Duration;

use crate::stage::ScriptSpec;

pub use reachability::{ReachabilitySettings, wait_until_reachable};
pub use session::{
    CommandChannel, Connector, OutputSink, RemoteOutcome, RemoteSession, SshConnector, TeeSink,
};

/// Login and polling parameters shared by every remote command.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub username: String,
    /// Used both for login and for the elevation prompt.
    pub password: Option<String>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            username: "truffle".to_string(),
            password: None,
            port: 22,
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Command line for a stage script run with elevated privileges on the DUT.
///
/// `sudo -S -p ''` reads the secret from stdin without printing a prompt.
pub fn elevated_command(script: &ScriptSpec) -> String {
    let mut parts: Vec<String> = ["sudo", "-S", "-p", "''"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    parts.extend(script.argv().iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

/// Whether `command` expects the elevation secret on stdin.
pub fn needs_secret(command: &str) -> bool {
    let mut words = command.split_whitespace();
    words.next() == Some("sudo") && words.any(|w| w == "-S")
}

/// Quote `arg` for a POSIX shell if it contains anything unusual.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::ScriptRuntime;

    #[test]
    fn test_elevated_command_for_python_stage() {
        let script = ScriptSpec::new(
            "/home/truffle/qa/scripts/burn_test.py",
            ScriptRuntime::Python,
            vec!["--stage-one".into(), "2".into()],
        );
        assert_eq!(
            elevated_command(&script),
            "sudo -S -p '' python3 /home/truffle/qa/scripts/burn_test.py --stage-one 2"
        );
    }

    #[test]
    fn test_needs_secret() {
        assert!(needs_secret("sudo -S -p '' bash x.sh"));
        assert!(!needs_secret("sudo bash x.sh"));
        assert!(!needs_secret("bash -S x.sh"));
        assert!(!needs_secret(""));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-arg_1.sh"), "plain-arg_1.sh");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}

//! One remote command per login session.
//!
//! Each call opens a fresh session, allocates a pseudo-terminal, runs the
//! command and relays output as it arrives. Sessions are never reused so a
//! reboot cannot leave a half-open session behind.
//!
//! Lifecycle of one call:
//!
//! ```text
//! CONNECTING -> STREAMING -> COMPLETED
//!                         \-> DISCONNECTED
//! ```
//!
//! A disconnect while streaming is returned as success when the caller
//! declared it tolerable; connection and authentication failures never are.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RemoteSettings, needs_secret};
use crate::errors::SessionError;

/// How often an idle session is checked for liveness.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A running command on an open session.
///
/// Reads are non-blocking: `ErrorKind::WouldBlock` means no data yet. Any
/// other error means the transport is gone.
pub trait CommandChannel: Send {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send_input(&mut self, data: &[u8]) -> io::Result<()>;
    /// The remote side closed its output.
    fn is_finished(&self) -> bool;
    fn exit_status(&mut self) -> io::Result<i32>;
    /// Probe the transport while no output is flowing.
    fn heartbeat(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens authenticated sessions and starts a command on them.
pub trait Connector: Send + Sync {
    fn open(&self, host: &str, command: &str) -> Result<Box<dyn CommandChannel>, SessionError>;
}

/// Receives output chunks in arrival order.
pub trait OutputSink: Send {
    fn relay(&mut self, chunk: &[u8]);
}

/// Echoes output to the console and appends it to a log file.
pub struct TeeSink {
    echo: bool,
    log: Option<File>,
}

impl TeeSink {
    pub fn new(echo: bool, log_path: Option<&Path>) -> io::Result<Self> {
        let log = match log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(File::create(path)?)
            }
            None => None,
        };
        Ok(Self { echo, log })
    }
}

impl OutputSink for TeeSink {
    fn relay(&mut self, chunk: &[u8]) {
        if self.echo {
            let mut out = io::stdout().lock();
            let _ = out.write_all(chunk);
            let _ = out.flush();
        }
        if let Some(file) = self.log.as_mut()
            && let Err(e) = file.write_all(chunk)
        {
            warn!(error = %e, "Failed to append remote output to log file");
            self.log = None;
        }
    }
}

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOutcome {
    pub succeeded: bool,
    /// Everything read before completion or disconnect.
    pub output: String,
    /// The session dropped and the drop was tolerated.
    pub disconnected: bool,
    pub exit_code: Option<i32>,
}

/// Runs commands on remote hosts through a [`Connector`].
#[derive(Clone)]
pub struct RemoteSession {
    connector: Arc<dyn Connector>,
    settings: RemoteSettings,
}

impl RemoteSession {
    pub fn new(connector: Arc<dyn Connector>, settings: RemoteSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Convenience constructor for real SSH sessions.
    pub fn ssh(settings: RemoteSettings) -> Self {
        Self::new(Arc::new(SshConnector::new(settings.clone())), settings)
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    /// Run `command` on `host`, relaying output to `sink`.
    ///
    /// The polling loop runs on the blocking pool and checks `cancel` on every
    /// iteration.
    pub async fn run(
        &self,
        host: &str,
        command: &str,
        tolerate_disconnect: bool,
        sink: Box<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<RemoteOutcome, SessionError> {
        let connector = self.connector.clone();
        let settings = self.settings.clone();
        let host_owned = host.to_string();
        let command = command.to_string();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            pump(
                connector.as_ref(),
                &settings,
                &host_owned,
                &command,
                tolerate_disconnect,
                sink,
                &cancel,
            )
        })
        .await
        .map_err(|e| SessionError::Connection {
            host: host.to_string(),
            message: format!("session task failed: {}", e),
        })?
    }
}

enum Stream {
    Stdout,
    Stderr,
}

fn pump(
    connector: &dyn Connector,
    settings: &RemoteSettings,
    host: &str,
    command: &str,
    tolerate_disconnect: bool,
    mut sink: Box<dyn OutputSink>,
    cancel: &CancellationToken,
) -> Result<RemoteOutcome, SessionError> {
    info!(host = %host, command = %command, "Starting remote command");
    let mut channel = connector.open(host, command)?;
    let mut collected: Vec<u8> = Vec::new();
    let mut redactor = Redactor::new(None);

    if let Some(secret) = settings.password.as_deref()
        && needs_secret(command)
    {
        // The pty echoes input, so the secret would come back as output.
        redactor = Redactor::new(Some(secret));
        if let Err(e) = channel.send_input(format!("{}\n", secret).as_bytes()) {
            return dropped(host, tolerate_disconnect, &collected, e);
        }
    }

    let mut buf = [0u8; 4096];
    let mut last_heartbeat = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled {
                host: host.to_string(),
            });
        }

        let mut received = false;
        for stream in [Stream::Stdout, Stream::Stderr] {
            let read = match stream {
                Stream::Stdout => channel.read_stdout(&mut buf),
                Stream::Stderr => channel.read_stderr(&mut buf),
            };
            match read {
                Ok(0) => {}
                Ok(n) => {
                    let clean = redactor.feed(&buf[..n]);
                    emit(sink.as_mut(), &mut collected, &clean);
                    received = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    emit(sink.as_mut(), &mut collected, &redactor.finish());
                    return dropped(host, tolerate_disconnect, &collected, e);
                }
            }
        }

        if received {
            last_heartbeat = Instant::now();
            continue;
        }
        if channel.is_finished() {
            break;
        }
        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            if let Err(e) = channel.heartbeat() {
                emit(sink.as_mut(), &mut collected, &redactor.finish());
                return dropped(host, tolerate_disconnect, &collected, e);
            }
            last_heartbeat = Instant::now();
        }
        std::thread::sleep(settings.poll_interval);
    }

    emit(sink.as_mut(), &mut collected, &redactor.finish());

    let exit_code = match channel.exit_status() {
        Ok(code) => code,
        Err(e) => return dropped(host, tolerate_disconnect, &collected, e),
    };
    debug!(host = %host, exit_code, "Remote command finished");

    Ok(RemoteOutcome {
        succeeded: exit_code == 0,
        output: String::from_utf8_lossy(&collected).into_owned(),
        disconnected: false,
        exit_code: Some(exit_code),
    })
}

fn emit(sink: &mut dyn OutputSink, collected: &mut Vec<u8>, chunk: &[u8]) {
    if chunk.is_empty() {
        return;
    }
    sink.relay(chunk);
    collected.extend_from_slice(chunk);
}

const REDACTED: &[u8] = b"********";

/// Masks the sudo secret in output before it reaches the console, the stage
/// log or the backend.
///
/// A chunk ending in a prefix of the secret is held back until the next read
/// decides whether it completes the secret.
struct Redactor {
    secret: Vec<u8>,
    pending: Vec<u8>,
}

impl Redactor {
    fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.map(|s| s.as_bytes().to_vec()).unwrap_or_default(),
            pending: Vec::new(),
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.secret.is_empty() {
            return chunk.to_vec();
        }
        self.pending.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(self.pending.len());
        let mut i = 0;
        while i < self.pending.len() {
            let rest = &self.pending[i..];
            if rest.starts_with(&self.secret) {
                out.extend_from_slice(REDACTED);
                i += self.secret.len();
            } else if self.secret.starts_with(rest) {
                break;
            } else {
                out.push(rest[0]);
                i += 1;
            }
        }
        self.pending.drain(..i);
        out
    }

    /// Release whatever is held back; it cannot contain the whole secret.
    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

fn dropped(
    host: &str,
    tolerate_disconnect: bool,
    collected: &[u8],
    error: io::Error,
) -> Result<RemoteOutcome, SessionError> {
    if tolerate_disconnect {
        warn!(host = %host, error = %error, "Session dropped; treating as expected reboot");
        return Ok(RemoteOutcome {
            succeeded: true,
            output: String::from_utf8_lossy(collected).into_owned(),
            disconnected: true,
            exit_code: None,
        });
    }
    Err(SessionError::DisconnectDuringCommand {
        host: host.to_string(),
        message: error.to_string(),
    })
}

/// Password-authenticated SSH with an interactive pty.
pub struct SshConnector {
    settings: RemoteSettings,
}

impl SshConnector {
    pub fn new(settings: RemoteSettings) -> Self {
        Self { settings }
    }
}

impl Connector for SshConnector {
    fn open(&self, host: &str, command: &str) -> Result<Box<dyn CommandChannel>, SessionError> {
        let connection = |message: String| SessionError::Connection {
            host: host.to_string(),
            message,
        };

        let addr = (host, self.settings.port)
            .to_socket_addrs()
            .map_err(|e| connection(e.to_string()))?
            .next()
            .ok_or_else(|| connection("no address resolved".to_string()))?;
        let tcp = TcpStream::connect_timeout(&addr, self.settings.connect_timeout)
            .map_err(|e| connection(e.to_string()))?;

        let mut session = ssh2::Session::new().map_err(|e| connection(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.settings.connect_timeout.as_millis() as u32);
        session.handshake().map_err(|e| connection(e.to_string()))?;

        let password = self.settings.password.as_deref().unwrap_or_default();
        session
            .userauth_password(&self.settings.username, password)
            .map_err(|_| SessionError::Authentication {
                host: host.to_string(),
                user: self.settings.username.clone(),
            })?;
        if !session.authenticated() {
            return Err(SessionError::Authentication {
                host: host.to_string(),
                user: self.settings.username.clone(),
            });
        }

        let mut channel = session
            .channel_session()
            .map_err(|e| connection(e.to_string()))?;
        channel
            .request_pty("xterm", None, None)
            .map_err(|e| connection(e.to_string()))?;
        channel.exec(command).map_err(|e| connection(e.to_string()))?;

        session.set_keepalive(false, HEARTBEAT_INTERVAL.as_secs() as u32);
        session.set_timeout(0);
        session.set_blocking(false);

        Ok(Box::new(SshChannel { session, channel }))
    }
}

struct SshChannel {
    session: ssh2::Session,
    channel: ssh2::Channel,
}

impl CommandChannel for SshChannel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.stderr().read(buf)
    }

    fn send_input(&mut self, data: &[u8]) -> io::Result<()> {
        self.session.set_blocking(true);
        let result = self
            .channel
            .write_all(data)
            .and_then(|_| self.channel.flush());
        self.session.set_blocking(false);
        result
    }

    fn is_finished(&self) -> bool {
        self.channel.eof()
    }

    fn exit_status(&mut self) -> io::Result<i32> {
        self.session.set_blocking(true);
        let _ = self.channel.wait_close();
        let status = self.channel.exit_status();
        self.session.set_blocking(false);
        status.map_err(io::Error::other)
    }

    fn heartbeat(&mut self) -> io::Result<()> {
        match self.session.keepalive_send() {
            Ok(_) => Ok(()),
            Err(e) => match e.code() {
                ssh2::ErrorCode::Session(-37) => Ok(()), // LIBSSH2_ERROR_EAGAIN
                _ => Err(io::Error::new(io::ErrorKind::ConnectionAborted, e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        Out(&'static str),
        Err(&'static str),
        Idle,
        Drop,
    }

    struct FakeChannel {
        steps: VecDeque<Step>,
        pending_stderr: Option<&'static str>,
        exit_code: i32,
        input: Arc<Mutex<Vec<u8>>>,
        echo: bool,
        echoed: Vec<u8>,
    }

    impl CommandChannel for FakeChannel {
        fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.echoed.is_empty() {
                let n = self.echoed.len();
                buf[..n].copy_from_slice(&self.echoed);
                self.echoed.clear();
                return Ok(n);
            }
            match self.steps.pop_front() {
                Some(Step::Out(s)) => {
                    buf[..s.len()].copy_from_slice(s.as_bytes());
                    Ok(s.len())
                }
                Some(Step::Err(s)) => {
                    self.pending_stderr = Some(s);
                    Err(io::ErrorKind::WouldBlock.into())
                }
                Some(Step::Idle) => Err(io::ErrorKind::WouldBlock.into()),
                Some(Step::Drop) => Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )),
                None => Ok(0),
            }
        }

        fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.pending_stderr.take() {
                Some(s) => {
                    buf[..s.len()].copy_from_slice(s.as_bytes());
                    Ok(s.len())
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn send_input(&mut self, data: &[u8]) -> io::Result<()> {
            self.input.lock().unwrap().extend_from_slice(data);
            if self.echo {
                // A pty turns "\n" into "\r\n" on echo.
                let text = String::from_utf8_lossy(data).replace('\n', "\r\n");
                self.echoed.extend_from_slice(text.as_bytes());
            }
            Ok(())
        }

        fn is_finished(&self) -> bool {
            self.steps.is_empty() && self.pending_stderr.is_none() && self.echoed.is_empty()
        }

        fn exit_status(&mut self) -> io::Result<i32> {
            Ok(self.exit_code)
        }
    }

    struct FakeConnector {
        script: Mutex<Option<(Vec<Step>, i32)>>,
        input: Arc<Mutex<Vec<u8>>>,
        refuse: bool,
        echo: bool,
    }

    impl FakeConnector {
        fn new(steps: Vec<Step>, exit_code: i32) -> Self {
            Self {
                script: Mutex::new(Some((steps, exit_code))),
                input: Arc::new(Mutex::new(Vec::new())),
                refuse: false,
                echo: false,
            }
        }

        fn echoing(steps: Vec<Step>, exit_code: i32) -> Self {
            Self {
                echo: true,
                ..Self::new(steps, exit_code)
            }
        }

        fn refusing() -> Self {
            Self {
                script: Mutex::new(None),
                input: Arc::new(Mutex::new(Vec::new())),
                refuse: true,
                echo: false,
            }
        }
    }

    impl Connector for FakeConnector {
        fn open(&self, host: &str, _command: &str) -> Result<Box<dyn CommandChannel>, SessionError> {
            if self.refuse {
                return Err(SessionError::Connection {
                    host: host.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            let (steps, exit_code) = self.script.lock().unwrap().take().unwrap();
            Ok(Box::new(FakeChannel {
                steps: steps.into(),
                pending_stderr: None,
                exit_code,
                input: self.input.clone(),
                echo: self.echo,
                echoed: Vec::new(),
            }))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<u8>>>);

    impl OutputSink for RecordingSink {
        fn relay(&mut self, chunk: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(chunk);
        }
    }

    fn settings(password: Option<&str>) -> RemoteSettings {
        RemoteSettings {
            password: password.map(String::from),
            poll_interval: Duration::from_millis(1),
            ..RemoteSettings::default()
        }
    }

    async fn run_fake(
        connector: FakeConnector,
        password: Option<&str>,
        command: &str,
        tolerate_disconnect: bool,
    ) -> Result<RemoteOutcome, SessionError> {
        let cancel = CancellationToken::new();
        let sink = RecordingSink::default();
        run_fake_with(connector, password, command, tolerate_disconnect, sink, &cancel).await
    }

    async fn run_fake_with(
        connector: FakeConnector,
        password: Option<&str>,
        command: &str,
        tolerate_disconnect: bool,
        sink: RecordingSink,
        cancel: &CancellationToken,
    ) -> Result<RemoteOutcome, SessionError> {
        RemoteSession::new(Arc::new(connector), settings(password))
            .run("dut.local", command, tolerate_disconnect, Box::new(sink), cancel)
            .await
    }

    #[tokio::test]
    async fn test_output_is_relayed_in_order() {
        let connector = FakeConnector::new(
            vec![Step::Out("line 1\n"), Step::Idle, Step::Err("warn\n"), Step::Out("line 2\n")],
            0,
        );
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let outcome = run_fake_with(connector, None, "bash x.sh", false, sink.clone(), &cancel)
            .await
            .unwrap();

        assert!(outcome.succeeded);
        assert!(!outcome.disconnected);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output, "line 1\nwarn\nline 2\n");
        assert_eq!(&*sink.0.lock().unwrap(), b"line 1\nwarn\nline 2\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let connector = FakeConnector::new(vec![Step::Out("FAIL\n")], 2);
        let outcome = run_fake(connector, None, "bash x.sh", false).await.unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_tolerated_disconnect_returns_partial_output() {
        let connector = FakeConnector::new(
            vec![Step::Out("Rebooting...\n"), Step::Drop, Step::Out("never read\n")],
            0,
        );
        let outcome = run_fake(connector, None, "sudo -S -p '' bash stage0.sh", true).await.unwrap();
        assert!(outcome.succeeded);
        assert!(outcome.disconnected);
        assert_eq!(outcome.output, "Rebooting...\n");
        assert_eq!(outcome.exit_code, None);
    }

    #[tokio::test]
    async fn test_untolerated_disconnect_is_error() {
        let connector = FakeConnector::new(vec![Step::Out("partial\n"), Step::Drop], 0);
        let result = run_fake(connector, None, "bash x.sh", false).await;
        assert!(matches!(
            result,
            Err(SessionError::DisconnectDuringCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_never_tolerated() {
        let result = run_fake(FakeConnector::refusing(), None, "bash x.sh", true).await;
        assert!(matches!(result, Err(SessionError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_secret_written_once_for_sudo_stdin() {
        let connector = FakeConnector::new(vec![Step::Out("ok\n")], 0);
        let input = connector.input.clone();
        run_fake(connector, Some("hunter2"), "sudo -S -p '' bash led_test.sh", false).await.unwrap();
        assert_eq!(&*input.lock().unwrap(), b"hunter2\n");
    }

    #[tokio::test]
    async fn test_echoed_secret_is_masked() {
        let connector = FakeConnector::echoing(vec![Step::Out("led ok\n")], 0);
        let input = connector.input.clone();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let outcome = run_fake_with(
            connector,
            Some("hunter2"),
            "sudo -S -p '' bash led_test.sh",
            false,
            sink.clone(),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(&*input.lock().unwrap(), b"hunter2\n");
        assert!(!outcome.output.contains("hunter2"));
        assert_eq!(outcome.output, "********\r\nled ok\n");
        let relayed = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(relayed, outcome.output);
    }

    #[tokio::test]
    async fn test_secret_split_across_reads_is_masked() {
        let connector = FakeConnector::new(
            vec![Step::Out("pw: hun"), Step::Idle, Step::Out("ter2\r\ndone\n")],
            0,
        );
        let outcome = run_fake(connector, Some("hunter2"), "sudo -S -p '' bash x.sh", false)
            .await
            .unwrap();
        assert_eq!(outcome.output, "pw: ********\r\ndone\n");
    }

    #[test]
    fn test_redactor_releases_partial_match_at_end() {
        let mut redactor = Redactor::new(Some("hunter2"));
        assert_eq!(redactor.feed(b"abc hun"), b"abc ");
        assert_eq!(redactor.feed(b"x hu"), b"hunx ");
        assert_eq!(redactor.finish(), b"hu");
    }

    #[test]
    fn test_redactor_without_secret_passes_through() {
        let mut redactor = Redactor::new(None);
        assert_eq!(redactor.feed(b"hunter2"), b"hunter2");
        assert!(redactor.finish().is_empty());
    }

    #[tokio::test]
    async fn test_secret_not_sent_without_sudo() {
        let connector = FakeConnector::new(vec![Step::Out("ok\n")], 0);
        let input = connector.input.clone();
        run_fake(connector, Some("hunter2"), "uptime", false).await.unwrap();
        assert!(input.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let steps = (0..10_000).map(|_| Step::Idle).collect();
        let connector = FakeConnector::new(steps, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = RecordingSink::default();
        let result = run_fake_with(connector, None, "bash x.sh", true, sink, &cancel).await;
        assert!(matches!(result, Err(SessionError::Cancelled { .. })));
    }

    #[test]
    fn test_tee_sink_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("led_test.txt");
        {
            let mut sink = TeeSink::new(false, Some(&path)).unwrap();
            sink.relay(b"chunk one ");
            sink.relay(b"chunk two");
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "chunk one chunk two");
    }
}

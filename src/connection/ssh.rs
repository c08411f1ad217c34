//! SSH connection manager
//!
//! Runs commands on the guest over an `ssh2` session and moves files with
//! SFTP. The session is opened lazily and dropped whenever the transport
//! fails, so the next call (usually a retry from the step runner) reconnects.
//!
//! ```toml
//! testing_type = "remote"
//!
//! [connection]
//! ip = "10.0.0.4"
//! port = 22
//! username = "lisa"
//! private_key_path = "/home/lisa/.ssh/id_rsa"
//! ```

use anyhow::Context;
use log::{debug, warn};
use ssh2::{Channel, ErrorCode, Session};
use std::fs::{self, File};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::connection_config::ConnectionConfig;
use crate::connection::{CommandOutput, ConnectionError, ConnectionManager, Result};
use crate::utils::shell_quote;

/// libssh2 `LIBSSH2_ERROR_TIMEOUT`
const SESSION_TIMEOUT: i32 = -9;
/// libssh2 `LIBSSH2_ERROR_SOCKET_RECV`
const SOCKET_RECV: i32 = -43;
/// libssh2 `LIBSSH2_FX_NO_SUCH_FILE`
const SFTP_NO_SUCH_FILE: i32 = 2;

pub struct SSHConnectionManager {
    config: ConnectionConfig,
    session: Option<Session>,
}

impl SSHConnectionManager {
    /// Creates a manager; nothing is connected until the first operation.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn ensure_session(&mut self) -> Result<&Session> {
        if self.session.is_none() {
            let session = self.connect()?;
            self.session = Some(session);
        }
        self.session
            .as_ref()
            .ok_or_else(|| ConnectionError::Transport("SSH session unavailable".into()))
    }

    fn connect(&self) -> Result<Session> {
        let host = &self.config.ip;
        let port = self.config.port;
        debug!("Opening SSH connection to {}@{host}:{port}", self.config.username);

        let tcp = Self::connect_with_retry(
            host,
            port,
            self.config.max_retries as usize,
            self.config.timeout,
        )?;

        let mut session = Session::new()
            .map_err(|e| ConnectionError::Transport(format!("cannot create SSH session: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| ConnectionError::Transport(format!("SSH handshake with {host}:{port} failed: {e}")))?;

        Self::authenticate_session(
            &session,
            &self.config.username,
            self.config.password.as_deref(),
            self.config.private_key_path.as_deref(),
        )?;
        debug!("SSH session to {host}:{port} established");
        Ok(session)
    }

    /// TCP connect with a bounded number of attempts, one second apart
    fn connect_with_retry(
        host: &str,
        port: u16,
        max_retries: usize,
        timeout: Duration,
    ) -> Result<TcpStream> {
        let start_time = Instant::now();
        let mut retry = 0;
        loop {
            let attempt = (host, port)
                .to_socket_addrs()
                .and_then(|mut addrs| {
                    addrs
                        .next()
                        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))
                })
                .and_then(|addr| TcpStream::connect_timeout(&addr, timeout));
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connection to {host}:{port} failed: {e}");
                    retry += 1;
                    if retry > max_retries || start_time.elapsed() > timeout * (max_retries as u32 + 1) {
                        return Err(ConnectionError::Transport(format!(
                            "cannot connect to {host}:{port}: {e}"
                        )));
                    }
                }
            }
            debug!("Connection retry #{retry}");
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    fn authenticate_session(
        session: &Session,
        username: &str,
        password: Option<&str>,
        private_key_path: Option<&str>,
    ) -> Result<()> {
        let result = if let Some(private_key) = private_key_path {
            debug!("Authenticating with key {private_key}");
            session.userauth_pubkey_file(username, None, Path::new(private_key), None)
        } else if let Some(pass) = password {
            debug!("Authenticating with password");
            session.userauth_password(username, pass)
        } else {
            debug!("Authenticating with SSH agent");
            session.userauth_agent(username)
        };

        if let Err(e) = result {
            return Err(ConnectionError::Auth(format!("{username}: {e}")));
        }
        if !session.authenticated() {
            return Err(ConnectionError::Auth(format!("{username}: not authenticated")));
        }
        Ok(())
    }

    /// Maps an ssh2 error, dropping the session when the transport itself broke.
    fn classify(&mut self, e: ssh2::Error, what: &str) -> ConnectionError {
        match e.code() {
            ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => ConnectionError::NotFound(what.to_string()),
            ErrorCode::Session(_) => {
                warn!("SSH transport error during {what}: {e}");
                self.session = None;
                ConnectionError::Transport(format!("{what}: {e}"))
            }
            ErrorCode::SFTP(_) => anyhow::anyhow!("{what}: {e}").into(),
        }
    }

    fn run(&mut self, command: &str, timeout: Option<Duration>) -> std::result::Result<CommandOutput, ssh2::Error> {
        // ensure_session was called by the public entry point
        let Some(session) = self.session.as_ref() else {
            return Err(ssh2::Error::from_errno(ErrorCode::Session(-1)));
        };
        session.set_timeout(timeout.map(timeout_millis).unwrap_or(0));

        let mut channel = session.channel_session()?;
        channel.exec(command)?;

        session.set_blocking(false);
        let drained = drain_channel(&mut channel, timeout);
        session.set_blocking(true);
        let (mut stdout, mut stderr) = drained?;
        // Whatever arrived between the last read and EOF
        channel.read_to_end(&mut stdout).map_err(read_error)?;
        channel.stderr().read_to_end(&mut stderr).map_err(read_error)?;
        channel.wait_close()?;
        let exit_code = channel.exit_status()?;
        session.set_timeout(0);

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

/// libssh2 takes its timeout in milliseconds as `u32`; longer budgets saturate
fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn read_error(e: io::Error) -> ssh2::Error {
    debug!("SSH channel read failed: {e}");
    ssh2::Error::from_errno(ErrorCode::Session(SOCKET_RECV))
}

/// Reads whatever `stream` has ready into `out`; `Ok(false)` when nothing was.
fn read_available(stream: &mut impl Read, buf: &mut [u8], out: &mut Vec<u8>) -> std::result::Result<bool, ssh2::Error> {
    match stream.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(read_error(e)),
    }
}

/// Reads stdout and stderr in one non-blocking loop until the guest closes
/// the channel, so neither stream can fill its window while the other is read.
fn drain_channel(
    channel: &mut Channel,
    timeout: Option<Duration>,
) -> std::result::Result<(Vec<u8>, Vec<u8>), ssh2::Error> {
    let started = Instant::now();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];

    while !channel.eof() {
        if timeout.is_some_and(|t| started.elapsed() > t) {
            return Err(ssh2::Error::from_errno(ErrorCode::Session(SESSION_TIMEOUT)));
        }
        let got_stdout = read_available(&mut *channel, &mut buf, &mut stdout)?;
        let got_stderr = read_available(&mut channel.stderr(), &mut buf, &mut stderr)?;
        if !got_stdout && !got_stderr {
            thread::sleep(Duration::from_millis(20));
        }
    }
    Ok((stdout, stderr))
}

impl ConnectionManager for SSHConnectionManager {
    fn execute_command(&mut self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        self.ensure_session()?;
        debug!("Running remote command: {command}");
        match self.run(command, timeout) {
            Ok(output) => {
                debug!("Remote command finished: exit_code={}", output.exit_code);
                Ok(output)
            }
            Err(e) if matches!(e.code(), ErrorCode::Session(SESSION_TIMEOUT)) && timeout.is_some() => {
                warn!("Remote command timed out: {command}");
                // The channel is in an unknown state, start over next time
                self.session = None;
                Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: format!("command timed out after {:?}", timeout.unwrap_or_default()),
                    exit_code: -1,
                })
            }
            Err(e) => Err(self.classify(e, command)),
        }
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        if let Some((parent, _)) = remote_path.rsplit_once('/') {
            if !parent.is_empty() {
                let output =
                    self.execute_command(&format!("mkdir -p {}", shell_quote(parent)), None)?;
                if output.exit_code != 0 {
                    return Err(anyhow::anyhow!(
                        "cannot create remote directory {parent}: {}",
                        output.stderr.trim()
                    )
                    .into());
                }
            }
        }

        let mut local = File::open(local_path)
            .with_context(|| format!("Failed to open {}", local_path.display()))?;
        let sftp = match self.ensure_session()?.sftp() {
            Ok(sftp) => sftp,
            Err(e) => return Err(self.classify(e, "sftp")),
        };
        let mut remote = match sftp.create(Path::new(remote_path)) {
            Ok(file) => file,
            Err(e) => return Err(self.classify(e, remote_path)),
        };
        io::copy(&mut local, &mut remote)
            .map_err(|e| ConnectionError::Transport(format!("upload of {remote_path} failed: {e}")))?;
        debug!("Uploaded {} to {remote_path}", local_path.display());
        Ok(())
    }

    fn download_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        let sftp = match self.ensure_session()?.sftp() {
            Ok(sftp) => sftp,
            Err(e) => return Err(self.classify(e, "sftp")),
        };
        let mut remote = match sftp.open(Path::new(remote_path)) {
            Ok(file) => file,
            Err(e) => return Err(self.classify(e, remote_path)),
        };
        let mut contents = Vec::new();
        remote
            .read_to_end(&mut contents)
            .map_err(|e| ConnectionError::Transport(format!("download of {remote_path} failed: {e}")))?;

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(local_path, &contents)
            .with_context(|| format!("Failed to write {}", local_path.display()))?;
        debug!("Downloaded {remote_path} to {}", local_path.display());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "lisaprobe done", None) {
                debug!("SSH disconnect failed: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_host_is_a_transport_error() {
        let config = ConnectionConfig {
            ip: "127.0.0.1".into(),
            // Port 1 is essentially never listening
            port: 1,
            max_retries: 0,
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let mut conn = SSHConnectionManager::new(config);
        let err = conn.execute_command("true", None).unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn huge_budgets_saturate_instead_of_wrapping() {
        assert_eq!(timeout_millis(Duration::from_secs(5)), 5000);
        assert_eq!(timeout_millis(Duration::from_secs(u64::from(u32::MAX))), u32::MAX);
        assert_eq!(timeout_millis(Duration::MAX), u32::MAX);
    }

    /// Hands out scripted reads, like a non-blocking channel stream
    struct ScriptedStream(Vec<io::Result<Vec<u8>>>);

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.remove(0) {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Err(e) => Err(e),
            }
        }
    }

    #[test]
    fn partial_reads_keep_raw_bytes() {
        let mut stream = ScriptedStream(vec![
            Err(io::ErrorKind::WouldBlock.into()),
            Ok(b"ok\xff\n".to_vec()),
            Err(io::Error::other("connection reset")),
        ]);
        let mut buf = [0u8; 64];
        let mut out = Vec::new();

        assert!(!read_available(&mut stream, &mut buf, &mut out).unwrap());
        assert!(read_available(&mut stream, &mut buf, &mut out).unwrap());
        assert_eq!(String::from_utf8_lossy(&out), "ok\u{FFFD}\n");

        let err = read_available(&mut stream, &mut buf, &mut out).unwrap_err();
        assert!(matches!(err.code(), ErrorCode::Session(SOCKET_RECV)));
    }
}

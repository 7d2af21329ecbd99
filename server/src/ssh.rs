mod commands;

use russh::server::{Auth, Config as ServerConfig, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, ChannelMsg, MethodSet};
use russh_keys::key::PublicKey;
use snafu::{ResultExt, Snafu};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::sftp;
use crate::types::AppState;

const WELCOME: &str = "Welcome to Secure Online Judge\n";
const PROMPT: &str = "soj> ";

#[derive(Debug, Snafu)]
pub enum SshServerError {
    #[snafu(display("Could not parse the configured host key"))]
    HostKey { source: russh_keys::Error },
    #[snafu(display("Could not parse the configured authorized key"))]
    AllowedKey { source: russh_keys::Error },
    #[snafu(display(
        "Configured authorized key line has no key material: `{line}`"
    ))]
    AllowedKeyFormat { line: String },
    #[snafu(display("SSH server failed"))]
    Run { source: std::io::Error },
}

/// Parses one authorized-keys style line (`<type> <base64> [comment]`).
fn parse_allowed_key(line: &str) -> Result<PublicKey, SshServerError> {
    let b64 = line
        .split_whitespace()
        .find(|part| part.starts_with("AAAA"))
        .ok_or_else(|| SshServerError::AllowedKeyFormat {
            line: line.to_string(),
        })?;
    russh_keys::parse_public_key_base64(b64).context(AllowedKeySnafu)
}

pub async fn serve(state: AppState) -> Result<(), SshServerError> {
    let host_key =
        russh_keys::decode_secret_key(&state.config.host_key, None).context(HostKeySnafu)?;

    let allowed = if state.config.allowed_ssh_pubkey.trim().is_empty() {
        None
    } else {
        Some(parse_allowed_key(&state.config.allowed_ssh_pubkey)?)
    };

    let config = ServerConfig {
        methods: MethodSet::PUBLICKEY,
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: Some(Duration::from_secs(3600)),
        keys: vec![host_key],
        ..Default::default()
    };

    let addr = state.config.listen_addr.clone();
    info!(addr = %addr, "SSH server listening");

    let mut server = SojSshServer {
        state,
        allowed: Arc::new(allowed),
    };
    server
        .run_on_address(Arc::new(config), addr.as_str())
        .await
        .context(RunSnafu)
}

struct SojSshServer {
    state: AppState,
    allowed: Arc<Option<PublicKey>>,
}

impl Server for SojSshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshSession {
        debug!(peer = ?peer, "New SSH connection");
        SshSession {
            state: self.state.clone(),
            allowed: self.allowed.clone(),
            user: None,
            channels: HashMap::new(),
            ptys: HashSet::new(),
        }
    }
}

struct SshSession {
    state: AppState,
    allowed: Arc<Option<PublicKey>>,
    user: Option<String>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    ptys: HashSet<ChannelId>,
}

impl SshSession {
    fn user(&self) -> String {
        self.user.clone().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let accepted = match self.allowed.as_ref() {
            None => true,
            Some(allowed) => allowed.fingerprint() == public_key.fingerprint(),
        };

        if !accepted {
            warn!(%user, "Rejected public key");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        info!(%user, "Authenticated");
        self.user = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.ptys.insert(channel);
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id);
            return Ok(());
        };
        session.channel_success(channel_id);

        let state = self.state.clone();
        let user = self.user();
        let pty = self.ptys.contains(&channel_id);
        let handle = session.handle();

        info!(%user, "Interactive session started");
        tokio::spawn(async move {
            let mut term = Term::new(channel, pty);
            repl(state, user, &mut term).await;
            let _ = handle.exit_status_request(channel_id, 0).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id);
            return Ok(());
        };
        session.channel_success(channel_id);

        let state = self.state.clone();
        let user = self.user();
        let pty = self.ptys.contains(&channel_id);
        let line = String::from_utf8_lossy(data).into_owned();
        let handle = session.handle();

        info!(%user, command = %line, "Exec request");
        tokio::spawn(async move {
            let mut term = Term::new(channel, pty);
            let _ = commands::dispatch(&state, &user, &line, &mut term).await;
            let _ = handle.exit_status_request(channel_id, 0).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel_id);
            return Ok(());
        }
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id);
            return Ok(());
        };
        session.channel_success(channel_id);

        let state = self.state.clone();
        let user = self.user();
        tokio::spawn(async move {
            sftp::tunnel(state, user, channel).await;
        });
        Ok(())
    }
}

/// The interactive command loop shown on `ssh soj@host`.
async fn repl(state: AppState, user: String, term: &mut Term) {
    term.write(WELCOME).await;
    term.write(&format!("logged in as {user}, try `help`\n")).await;

    loop {
        term.write(PROMPT).await;
        let Some(line) = term.read_line().await else {
            break;
        };
        match commands::dispatch(&state, &user, &line, term).await {
            commands::Outcome::Continue => {}
            commands::Outcome::Exit => break,
        }
    }

    term.write("bye\n").await;
    info!(%user, "Interactive session closed");
}

/// A session channel dressed up as a line terminal: normalizes newlines for
/// ptys, echoes typed input, and understands just enough control characters
/// to be usable.
pub struct Term {
    channel: Channel<Msg>,
    pty: bool,
    pending: VecDeque<u8>,
    eof: bool,
}

impl Term {
    fn new(channel: Channel<Msg>, pty: bool) -> Self {
        Self {
            channel,
            pty,
            pending: VecDeque::new(),
            eof: false,
        }
    }

    pub async fn write(&mut self, text: &str) {
        self.write_bytes(text.as_bytes()).await;
    }

    /// Raw bytes (judge tee output, face replays). For ptys every bare LF
    /// becomes CRLF.
    pub async fn write_bytes(&mut self, bytes: &[u8]) {
        if !self.pty {
            let _ = self.channel.data(bytes).await;
            return;
        }
        let mut out = Vec::with_capacity(bytes.len() + 8);
        for &b in bytes {
            if b == b'\n' {
                out.push(b'\r');
            }
            out.push(b);
        }
        let _ = self.channel.data(&out[..]).await;
    }

    async fn fill_pending(&mut self) -> bool {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    self.pending.extend(data.iter());
                    return true;
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    self.eof = true;
                    return false;
                }
                Some(_) => {}
            }
        }
    }

    /// Reads one line, echoing when a pty is attached. `None` means the
    /// session is gone (EOF, close, or ^D on an empty line).
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line: Vec<u8> = Vec::new();

        loop {
            let Some(byte) = self.pending.pop_front() else {
                if self.eof || !self.fill_pending().await {
                    return None;
                }
                continue;
            };

            match byte {
                b'\r' | b'\n' => {
                    self.write("\n").await;
                    return Some(String::from_utf8_lossy(&line).into_owned());
                }
                // ^D on an empty line ends the session
                0x04 if line.is_empty() => return None,
                0x04 => {}
                // ^C drops the current line
                0x03 => {
                    self.write("^C\n").await;
                    line.clear();
                    self.write(PROMPT).await;
                }
                0x7f | 0x08 => {
                    if line.pop().is_some() && self.pty {
                        self.write_bytes(b"\x08 \x08").await;
                    }
                }
                b if b.is_ascii_graphic() || b == b' ' => {
                    line.push(b);
                    if self.pty {
                        self.write_bytes(&[b]).await;
                    }
                }
                _ => {}
            }
        }
    }
}

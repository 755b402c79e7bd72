use std::fmt::Display;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::credentials::{Credentials, RefreshPayload, TokenClient};
use crate::message::{Message, User};

/// Seam between the credential supervisor and the concrete chat transport.
///
/// `connect` must resolve only after the provider confirms protocol-level
/// registration, not after the socket opens. Any token rotation the provider
/// performs on its own is reported through `refreshes`.
#[async_trait]
pub trait ChatConnector: Send + Sync {
    type Session: Send;

    async fn connect(
        &self,
        credentials: Credentials,
        refreshes: mpsc::Sender<RefreshPayload>,
    ) -> Result<Self::Session>;
}

/// A registered chat session: a stream of parsed channel messages plus a
/// sender for outbound chat lines. Dropping the handle tears the session down.
pub struct SessionHandle {
    incoming: mpsc::Receiver<Message>,
    outgoing: mpsc::Sender<String>,
}

impl SessionHandle {
    pub fn new(incoming: mpsc::Receiver<Message>, outgoing: mpsc::Sender<String>) -> Self {
        SessionHandle { incoming, outgoing }
    }

    /// `None` once the underlying connection is gone.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    pub async fn say<T: Display>(&self, text: T) {
        if self.outgoing.send(text.to_string()).await.is_err() {
            tracing::warn!("dropping chat reply, session is closed");
        }
    }
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("chat login rejected for the supplied token")]
    LoginFailed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Twitch IRC transport. Performs the PASS/NICK/CAP/JOIN handshake, gates on
/// the 001 welcome reply, and rotates an expired or rejected token pair via
/// the token endpoint before giving up.
pub struct IrcConnector {
    pub host: String,
    pub port: u16,
    pub account: String,
    pub channel: String,
    pub tokens: TokenClient,
}

#[async_trait]
impl ChatConnector for IrcConnector {
    type Session = SessionHandle;

    async fn connect(
        &self,
        mut credentials: Credentials,
        refreshes: mpsc::Sender<RefreshPayload>,
    ) -> Result<SessionHandle> {
        if credentials.is_expired() {
            tracing::info!(account = %self.account, "access token expired, rotating before connect");
            credentials = self.rotate(&credentials, &refreshes).await?;
        }

        for attempt in 0..2 {
            match self.handshake(&credentials).await {
                Ok(session) => return Ok(session),
                Err(HandshakeError::LoginFailed) if attempt == 0 => {
                    tracing::warn!(account = %self.account, "chat login rejected, rotating token pair and retrying");
                    credentials = self.rotate(&credentials, &refreshes).await?;
                }
                Err(HandshakeError::LoginFailed) => {
                    bail!("chat login rejected twice for account '{}'", self.account)
                }
                Err(HandshakeError::Io(e)) => return Err(e.into()),
            }
        }
        unreachable!("handshake loop returns or bails within two attempts")
    }
}

impl IrcConnector {
    async fn rotate(
        &self,
        current: &Credentials,
        refreshes: &mpsc::Sender<RefreshPayload>,
    ) -> Result<Credentials> {
        let payload = self.tokens.refresh(&current.refresh_token).await?;
        let fresh = payload.clone().into_credentials();
        // Report the rotation even when the payload is partial; persistence
        // policy lives with the supervisor, not here.
        let _ = refreshes.send(payload).await;
        fresh.context("token endpoint returned an incomplete pair")
    }

    async fn handshake(&self, credentials: &Credentials) -> Result<SessionHandle, HandshakeError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();

        writer
            .write_all(
                format!(
                    "PASS oauth:{}\r\nNICK {}\r\nCAP REQ :twitch.tv/commands twitch.tv/tags\r\nJOIN #{}\r\n",
                    credentials.access_token, self.account, self.channel
                )
                .as_bytes(),
            )
            .await?;

        // Connection established and protocol registration are two separate
        // signals; only the 001 welcome unblocks dependents.
        while let Some(line) = reader.next_line().await? {
            if is_login_failure(&line) {
                return Err(HandshakeError::LoginFailed);
            }
            if reply_code(&line) == Some("001") {
                tracing::info!(account = %self.account, channel = %self.channel, "chat session registered");
                let (in_tx, in_rx) = mpsc::channel(64);
                let (out_tx, out_rx) = mpsc::channel(64);
                tokio::spawn(session_loop(reader, writer, in_tx, out_rx, self.channel.clone()));
                return Ok(SessionHandle::new(in_rx, out_tx));
            }
        }

        Err(HandshakeError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before registration completed",
        )))
    }
}

async fn session_loop(
    mut reader: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    incoming: mpsc::Sender<Message>,
    mut outgoing: mpsc::Receiver<String>,
    channel: String,
) {
    loop {
        tokio::select! {
            line = reader.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(answer) = ping_payload(&line) {
                        if let Err(e) = writer.write_all(format!("PONG {answer}\r\n").as_bytes()).await {
                            tracing::warn!("failed to answer ping: {e}");
                            break;
                        }
                    } else if let Some(message) = parse_privmsg(&line) {
                        if incoming.send(message).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(%channel, "chat connection closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%channel, "chat read failed: {e}");
                    break;
                }
            },
            text = outgoing.recv() => match text {
                Some(text) => {
                    if let Err(e) = writer.write_all(format!("PRIVMSG #{channel} :{text}\r\n").as_bytes()).await {
                        tracing::warn!(%channel, "failed to send chat message: {e}");
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Numeric or verb in the second position of a server line, e.g. `001`.
fn reply_code(line: &str) -> Option<&str> {
    line.split(' ').nth(1)
}

fn is_login_failure(line: &str) -> bool {
    line.contains("NOTICE")
        && (line.contains("Login authentication failed")
            || line.contains("Improperly formatted auth"))
}

fn ping_payload(line: &str) -> Option<&str> {
    line.strip_prefix("PING ").map(str::trim_end)
}

/// Parses one tagged or untagged PRIVMSG into a [`Message`].
fn parse_privmsg(raw: &str) -> Option<Message> {
    let (tags, rest) = if let Some(stripped) = raw.strip_prefix('@') {
        let (tags, rest) = stripped.split_once(' ')?;
        (tags, rest)
    } else {
        ("", raw)
    };

    let rest = rest.strip_prefix(':')?;
    let (prefix, rest) = rest.split_once(' ')?;
    if !rest.starts_with("PRIVMSG") {
        return None;
    }

    let username = prefix.split('!').next()?.to_string();
    let (_, text) = rest.split_once(" :")?;

    // Strip the invisible tag character some clients append, then trailing
    // whitespace.
    let text = text.replace(" \u{e0000}", "").trim_end().to_string();

    Some(Message::new(User::from_tags(tags, username), text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Group;

    #[test]
    fn tagged_privmsg_parses_user_and_text() {
        let raw = "@badge-info=;badges=moderator/1;mod=1;vip=0 :helper!helper@helper.tmi.twitch.tv PRIVMSG #somechannel :!chatban now";
        let message = parse_privmsg(raw).unwrap();
        assert_eq!(message.user.username, "helper");
        assert!(message.user.is_in(&[Group::Moderator]));
        assert_eq!(message.text, "!chatban now");
    }

    #[test]
    fn untagged_privmsg_parses() {
        let raw = ":viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #somechannel :hello there";
        let message = parse_privmsg(raw).unwrap();
        assert_eq!(message.user.username, "viewer");
        assert_eq!(message.user.groups, vec![Group::Everyone]);
        assert_eq!(message.text, "hello there");
    }

    #[test]
    fn non_privmsg_lines_are_ignored() {
        assert!(parse_privmsg(":tmi.twitch.tv 376 bot :>").is_none());
        assert!(parse_privmsg("PING :tmi.twitch.tv").is_none());
        assert!(parse_privmsg("").is_none());
    }

    #[test]
    fn ping_lines_expose_their_payload() {
        assert_eq!(ping_payload("PING :tmi.twitch.tv"), Some(":tmi.twitch.tv"));
        assert_eq!(ping_payload(":tmi.twitch.tv 001 bot :Welcome"), None);
    }

    #[test]
    fn welcome_reply_is_detected_by_code() {
        assert_eq!(reply_code(":tmi.twitch.tv 001 bot :Welcome, GLHF!"), Some("001"));
    }

    #[test]
    fn login_failure_notice_is_detected() {
        assert!(is_login_failure(
            ":tmi.twitch.tv NOTICE * :Login authentication failed"
        ));
        assert!(!is_login_failure(":tmi.twitch.tv NOTICE * :Now hosting"));
    }

    #[test]
    fn invisible_suffix_is_stripped_from_text() {
        let raw = ":v!v@v.tmi.twitch.tv PRIVMSG #c :!voiceban \u{e0000}";
        let message = parse_privmsg(raw).unwrap();
        assert_eq!(message.text, "!voiceban");
    }
}

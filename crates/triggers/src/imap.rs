//! IMAP mailbox access over TLS, authenticated with an OAuth bearer token.

use async_imap::Authenticator;
use async_trait::async_trait;
use futures::TryStreamExt;
use nodes::mail::MailboxAccount;
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;
use tracing::debug;

use crate::TriggerError;

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub mailbox: String,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: "imap.gmail.com".into(),
            port: 993,
            mailbox: "INBOX".into(),
        }
    }
}

/// Opens authenticated sessions for a mailbox account.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, account: &MailboxAccount) -> Result<Box<dyn MailboxSession>, TriggerError>;
}

/// An open mailbox, examined read-only.
#[async_trait]
pub trait MailboxSession: Send {
    /// Raw RFC 5322 bytes of every message that arrived since the session
    /// opened or since the previous call. Mail already in the folder at
    /// connect time is never returned, and no flags are changed.
    async fn fetch_new(&mut self) -> Result<Vec<Vec<u8>>, TriggerError>;

    async fn close(self: Box<Self>);
}

/// SASL XOAUTH2 initial response.
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

type ImapTlsSession = async_imap::Session<TlsStream<TcpStream>>;

/// Lowest UID not yet handed out. UIDs only grow within a folder, so
/// everything at or above it is new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidWatermark {
    next: u32,
}

impl UidWatermark {
    pub fn new(next: u32) -> Self {
        Self { next: next.max(1) }
    }

    pub fn next(&self) -> u32 {
        self.next
    }

    /// Keep the UIDs at or above the mark, sorted, and move the mark past
    /// them. A `n:*` search always echoes the highest existing UID even
    /// when it is below `n`, hence the filter.
    pub fn advance(&mut self, uids: impl IntoIterator<Item = u32>) -> Vec<u32> {
        let mut fresh: Vec<u32> = uids.into_iter().filter(|uid| *uid >= self.next).collect();
        fresh.sort_unstable();
        fresh.dedup();
        if let Some(last) = fresh.last() {
            self.next = last.saturating_add(1);
        }
        fresh
    }
}

pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self, account: &MailboxAccount) -> Result<Box<dyn MailboxSession>, TriggerError> {
        let host = self.config.host.as_str();
        let tcp = TcpStream::connect((host, self.config.port)).await?;
        let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
        let tls = connector.connect(host, tcp).await?;

        let client = async_imap::Client::new(tls);
        let mut session = client
            .authenticate(
                "XOAUTH2",
                XOAuth2 {
                    user: account.email.clone(),
                    access_token: account.access_token.clone(),
                },
            )
            .await
            .map_err(|(e, _client)| e)?;
        let mailbox = session.examine(&self.config.mailbox).await?;
        let next = match mailbox.uid_next {
            Some(next) => next,
            None => {
                let existing = session.uid_search("ALL").await?;
                existing.into_iter().max().map_or(1, |max| max.saturating_add(1))
            }
        };
        let watermark = UidWatermark::new(next);
        debug!(
            email = %account.email,
            mailbox = %self.config.mailbox,
            uid_next = watermark.next(),
            "IMAP session ready"
        );

        Ok(Box::new(ImapSession { session, watermark }))
    }
}

struct ImapSession {
    session: ImapTlsSession,
    watermark: UidWatermark,
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn fetch_new(&mut self) -> Result<Vec<Vec<u8>>, TriggerError> {
        let query = format!("UID {}:*", self.watermark.next());
        let found = self.session.uid_search(&query).await?;
        let uids = self.watermark.advance(found);
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let uid_set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let fetches: Vec<_> = self
            .session
            .uid_fetch(&uid_set, "(UID BODY.PEEK[])")
            .await?
            .try_collect()
            .await?;
        let raw: Vec<Vec<u8>> = fetches
            .iter()
            .filter_map(|fetch| fetch.body().map(<[u8]>::to_vec))
            .collect();

        debug!(count = raw.len(), next_uid = self.watermark.next(), "fetched new messages");
        Ok(raw)
    }

    async fn close(mut self: Box<Self>) {
        let _ = self.session.logout().await;
    }
}

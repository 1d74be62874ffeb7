//! IMAP client over async-imap with tokio-rustls, supporting password LOGIN
//! and XOAUTH2 bearer authentication on TLS or plain-TCP transports.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Flag, Name, NameAttribute};
use async_imap::{Authenticator, Client, Session};
use chrono::Utc;
use futures::{AsyncRead, AsyncWrite, StreamExt};
use rustls_native_certs::load_native_certs;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::credentials::Secret;
use crate::errors::{ArchiveError, ArchiveResult};
use crate::types::{Account, AuthKind, FolderInfo, FolderRole, MessageMeta};

type TlsSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;
type PlainSession = Session<Compat<TcpStream>>;

const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Untagged responses observed on SELECT.
#[derive(Clone, Copy, Debug)]
pub struct SelectedFolder {
    pub exists: u32,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
}

enum SessionKind {
    Tls(TlsSession),
    Plain(PlainSession),
}

/// One authenticated IMAP connection. Single-writer: exactly one worker
/// drives it at a time, one command in flight per tag. Any I/O failure
/// surfaces as an error that tells the caller to drop and re-dial.
pub struct ImapConnection {
    session: SessionKind,
    op_timeout: Duration,
}

impl ImapConnection {
    /// Dials, reads the greeting, authenticates, and confirms capabilities.
    /// The secret is wiped by the caller once this returns.
    pub async fn establish(
        account: &Account,
        secret: &Secret,
        op_timeout: Duration,
    ) -> ArchiveResult<Self> {
        let session = if account.tls {
            let tls = timed(op_timeout, "connect", dial_tls(&account.host, account.port)).await?;
            let client = Client::new(tls.compat());
            SessionKind::Tls(timed(op_timeout, "login", greet_and_login(client, account, secret)).await?)
        } else {
            let tcp = timed(op_timeout, "connect", dial_tcp(&account.host, account.port)).await?;
            let client = Client::new(tcp.compat());
            SessionKind::Plain(timed(op_timeout, "login", greet_and_login(client, account, secret)).await?)
        };

        let mut conn = Self { session, op_timeout };
        conn.log_capabilities().await;
        Ok(conn)
    }

    async fn log_capabilities(&mut self) {
        let result = match &mut self.session {
            SessionKind::Tls(s) => capability_names(s).await,
            SessionKind::Plain(s) => capability_names(s).await,
        };
        match result {
            Ok(caps) => {
                if !caps.iter().any(|c| c == "IMAP4rev1") {
                    warn!("server does not advertise IMAP4rev1");
                }
                debug!(capabilities = %caps.join(" "), "CAPABILITY");
            }
            Err(e) => debug!(error = %e, "CAPABILITY request failed"),
        }
    }

    /// `LIST "" "*"`: every folder with its delimiter and attributes.
    /// Non-selectable folders are included but marked.
    pub async fn list_folders(&mut self) -> ArchiveResult<Vec<FolderInfo>> {
        let timeout = self.op_timeout;
        match &mut self.session {
            SessionKind::Tls(s) => timed(timeout, "LIST", list_in(s)).await,
            SessionKind::Plain(s) => timed(timeout, "LIST", list_in(s)).await,
        }
    }

    pub async fn select(&mut self, folder: &str) -> ArchiveResult<SelectedFolder> {
        let timeout = self.op_timeout;
        match &mut self.session {
            SessionKind::Tls(s) => timed(timeout, "SELECT", select_in(s, folder)).await,
            SessionKind::Plain(s) => timed(timeout, "SELECT", select_in(s, folder)).await,
        }
    }

    /// `UID SEARCH ALL`, ascending.
    pub async fn search_all_uids(&mut self) -> ArchiveResult<Vec<u32>> {
        let timeout = self.op_timeout;
        match &mut self.session {
            SessionKind::Tls(s) => timed(timeout, "UID SEARCH", search_all_in(s)).await,
            SessionKind::Plain(s) => timed(timeout, "UID SEARCH", search_all_in(s)).await,
        }
    }

    /// Header-level summaries for a UID set, without bodies.
    pub async fn fetch_metadata(&mut self, uids: &[u32]) -> ArchiveResult<Vec<MessageMeta>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uid_set(uids);
        let timeout = self.op_timeout;
        match &mut self.session {
            SessionKind::Tls(s) => timed(timeout, "UID FETCH (metadata)", fetch_metadata_in(s, &set)).await,
            SessionKind::Plain(s) => timed(timeout, "UID FETCH (metadata)", fetch_metadata_in(s, &set)).await,
        }
    }

    /// Complete RFC-5322 octet stream for one message. PEEK keeps `\Seen`
    /// untouched.
    pub async fn fetch_message(&mut self, uid: u32) -> ArchiveResult<Vec<u8>> {
        let timeout = self.op_timeout;
        match &mut self.session {
            SessionKind::Tls(s) => timed(timeout, "UID FETCH (body)", fetch_body_in(s, uid)).await,
            SessionKind::Plain(s) => timed(timeout, "UID FETCH (body)", fetch_body_in(s, uid)).await,
        }
    }

    /// Same semantics as [`fetch_message`], but the body is written through
    /// a bounded buffer to `dest` instead of being handed back; used above
    /// the streaming size threshold. Returns bytes written. The file is
    /// fsynced but not renamed; committing is the store's job.
    ///
    /// [`fetch_message`]: Self::fetch_message
    pub async fn stream_message_to_file(&mut self, uid: u32, dest: &Path) -> ArchiveResult<u64> {
        let body = self.fetch_message(uid).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| ArchiveError::local_io("creating streaming temp file", e))?;
        for chunk in body.chunks(STREAM_CHUNK_BYTES) {
            if let Err(e) = file.write_all(chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(ArchiveError::local_io("writing streaming temp file", e));
            }
        }
        file.sync_all()
            .await
            .map_err(|e| ArchiveError::local_io("syncing streaming temp file", e))?;
        Ok(body.len() as u64)
    }

    /// `LOGOUT`; the socket is closed regardless of what the server says.
    pub async fn logout(self) {
        let timeout = self.op_timeout;
        match self.session {
            SessionKind::Tls(mut s) => {
                let _ = tokio::time::timeout(timeout, s.logout()).await;
            }
            SessionKind::Plain(mut s) => {
                let _ = tokio::time::timeout(timeout, s.logout()).await;
            }
        }
    }
}

async fn dial_tcp(host: &str, port: u16) -> ArchiveResult<TcpStream> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| ArchiveError::ConnectionFailed(format!("connecting to {host}:{port}: {e}")))
}

async fn dial_tls(host: &str, port: u16) -> ArchiveResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = RootCertStore::empty();
    let certs = load_native_certs()
        .map_err(|e| ArchiveError::ConnectionFailed(format!("loading native certs: {e}")))?;
    for cert in certs {
        root_store
            .add(&tokio_rustls::rustls::Certificate(cert.0))
            .map_err(|e| ArchiveError::ConnectionFailed(format!("adding root cert: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = dial_tcp(host, port).await?;
    let server_name = ServerName::try_from(host)
        .map_err(|e| ArchiveError::ConnectionFailed(format!("invalid server name {host}: {e}")))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ArchiveError::ConnectionFailed(format!("TLS handshake with {host}: {e}")))
}

/// Reads the server greeting (anything but `* OK` is a refused connection)
/// and authenticates according to the account's auth kind.
async fn greet_and_login<S>(
    mut client: Client<S>,
    account: &Account,
    secret: &Secret,
) -> ArchiveResult<Session<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    let greeting = client
        .read_response()
        .await
        .map_err(|e| ArchiveError::ConnectionFailed(format!("reading greeting: {e}")))?
        .ok_or_else(|| {
            ArchiveError::ConnectionFailed("connection closed before greeting".into())
        })?;
    match greeting.parsed() {
        imap_proto::types::Response::Data {
            status: imap_proto::types::Status::Ok,
            ..
        } => {}
        other => {
            return Err(ArchiveError::ConnectionFailed(format!(
                "unexpected greeting: {other:?}"
            )))
        }
    }

    match account.auth {
        AuthKind::Password => client
            .login(&account.username, secret.expose())
            .await
            .map_err(|(e, _client)| auth_error(e)),
        AuthKind::OAuth2 => {
            let authenticator = Xoauth2 {
                user: account.username.clone(),
                token: secret.expose().to_string(),
            };
            client
                .authenticate("XOAUTH2", authenticator)
                .await
                .map_err(|(e, _client)| auth_error(e))
        }
    }
}

async fn capability_names<S>(session: &mut Session<S>) -> ArchiveResult<Vec<String>>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    let caps = session.capabilities().await.map_err(imap_error)?;
    Ok(caps
        .iter()
        .map(|c| match c {
            async_imap::types::Capability::Imap4rev1 => "IMAP4rev1".to_string(),
            async_imap::types::Capability::Auth(mechanism) => format!("AUTH={mechanism}"),
            async_imap::types::Capability::Atom(atom) => atom.to_string(),
        })
        .collect())
}

async fn list_in<S>(session: &mut Session<S>) -> ArchiveResult<Vec<FolderInfo>>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    let mut stream = session
        .list(Some(""), Some("*"))
        .await
        .map_err(imap_error)?;
    let mut folders = Vec::new();
    while let Some(item) = stream.next().await {
        let name = item.map_err(imap_error)?;
        folders.push(folder_info(&name));
    }
    Ok(folders)
}

fn folder_info(name: &Name) -> FolderInfo {
    let mut selectable = true;
    let mut role = FolderRole::Regular;
    for attr in name.attributes() {
        match attr {
            NameAttribute::NoSelect => selectable = false,
            NameAttribute::Extension(ext) => {
                if let Some(special) = FolderRole::from_special_use(ext.as_ref()) {
                    role = special;
                }
            }
            _ => {}
        }
    }
    if role == FolderRole::Regular && name.name().eq_ignore_ascii_case("INBOX") {
        role = FolderRole::Inbox;
    }
    FolderInfo {
        raw_name: name.name().to_string(),
        delimiter: name.delimiter().map(str::to_string),
        selectable,
        role,
    }
}

async fn select_in<S>(session: &mut Session<S>, folder: &str) -> ArchiveResult<SelectedFolder>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    let mailbox = session.select(folder).await.map_err(|e| match e {
        async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
            ArchiveError::FolderNotFound(format!("{folder}: {msg}"))
        }
        other => imap_error(other),
    })?;
    Ok(SelectedFolder {
        exists: mailbox.exists,
        uid_next: mailbox.uid_next,
        uid_validity: mailbox.uid_validity,
    })
}

async fn search_all_in<S>(session: &mut Session<S>) -> ArchiveResult<Vec<u32>>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    let set = session.uid_search("ALL").await.map_err(imap_error)?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

async fn fetch_metadata_in<S>(session: &mut Session<S>, set: &str) -> ArchiveResult<Vec<MessageMeta>>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    let mut stream = session
        .uid_fetch(set, "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[HEADER])")
        .await
        .map_err(imap_error)?;

    let mut metas = Vec::new();
    while let Some(item) = stream.next().await {
        let fetch = item.map_err(imap_error)?;
        let Some(uid) = fetch.uid else { continue };
        metas.push(MessageMeta {
            uid,
            flags: fetch.flags().map(|f| flag_name(&f)).collect(),
            size: fetch.size,
            internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        });
    }
    Ok(metas)
}

async fn fetch_body_in<S>(session: &mut Session<S>, uid: u32) -> ArchiveResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    let mut stream = session
        .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
        .await
        .map_err(imap_error)?;

    let mut body = None;
    while let Some(item) = stream.next().await {
        let fetch = item.map_err(imap_error)?;
        if fetch.uid == Some(uid) {
            body = fetch.body().map(<[u8]>::to_vec);
        }
    }
    body.ok_or_else(|| ArchiveError::FetchFailed(format!("no body returned for uid {uid}")))
}

fn flag_name(flag: &Flag) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

/// Compresses an ascending UID list into an IMAP sequence set
/// (`1:5,7,10:12`).
pub fn uid_set(uids: &[u32]) -> String {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for &uid in uids {
        match ranges.last_mut() {
            Some((_, end)) if *end != u32::MAX && uid == *end + 1 => *end = uid,
            _ => ranges.push((uid, uid)),
        }
    }
    ranges
        .iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}:{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

async fn timed<T, F>(limit: Duration, what: &str, fut: F) -> ArchiveResult<T>
where
    F: std::future::Future<Output = ArchiveResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ArchiveError::Timeout(what.to_string())),
    }
}

fn auth_error(e: async_imap::error::Error) -> ArchiveError {
    match e {
        async_imap::error::Error::Io(e) => ArchiveError::ConnectionFailed(e.to_string()),
        async_imap::error::Error::ConnectionLost => {
            ArchiveError::ConnectionFailed("connection lost during login".into())
        }
        other => ArchiveError::AuthFailed(other.to_string()),
    }
}

fn imap_error(e: async_imap::error::Error) -> ArchiveError {
    match e {
        async_imap::error::Error::Io(e) => ArchiveError::ConnectionFailed(e.to_string()),
        async_imap::error::Error::ConnectionLost => {
            ArchiveError::ConnectionFailed("connection lost".into())
        }
        async_imap::error::Error::No(msg) => {
            if is_rate_limit(&msg) {
                ArchiveError::RateLimited(msg)
            } else {
                ArchiveError::FetchFailed(format!("NO: {msg}"))
            }
        }
        async_imap::error::Error::Bad(msg) => ArchiveError::FetchFailed(format!("BAD: {msg}")),
        other => ArchiveError::FetchFailed(other.to_string()),
    }
}

fn is_rate_limit(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("rate") || lower.contains("throttl") || lower.contains("too many")
        || lower.contains("overquota")
}

struct Xoauth2 {
    user: String,
    token: String,
}

impl Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.token)
    }
}

impl Drop for Xoauth2 {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::uid_set;

    #[test]
    fn uid_set_compresses_runs() {
        assert_eq!(uid_set(&[1, 2, 3, 4, 5]), "1:5");
        assert_eq!(uid_set(&[1, 2, 3, 7, 10, 11, 12]), "1:3,7,10:12");
        assert_eq!(uid_set(&[42]), "42");
        assert_eq!(uid_set(&[]), "");
    }
}

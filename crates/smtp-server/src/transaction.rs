use crate::resolver::Resolver;
use chrono::{DateTime, Utc};
use mailparse::{MailParseError, ParsedMail};
use parking_lot::Mutex;
use rfc5321::{ForwardPath, ReversePath};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// The counter key under which karma is reported. It cannot be
/// written through the counter accessors.
pub const KARMA_COUNTER: &str = "karma";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    Esmtp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Smtp => write!(fmt, "SMTP"),
            Self::Esmtp => write!(fmt, "ESMTP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol_version: String,
    pub cipher: String,
}

#[derive(Debug, Default)]
struct Metadata {
    facts: HashMap<String, String>,
    counters: HashMap<String, f64>,
    flags: HashMap<String, bool>,
    karma: i64,
}

#[derive(Debug)]
struct Shared {
    id: String,
    metadata: Mutex<Metadata>,
    cancel: CancellationToken,
}

/// The part of a transaction that may be shared with work running
/// outside of the connection's own task, such as a lookup spawned
/// by a checker. It gives access to the metadata stores, karma and
/// the cancellation token, but not to the protocol state.
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    shared: Arc<Shared>,
}

impl TransactionHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn set_fact(&self, key: impl Into<String>, value: impl Into<String>) {
        self.shared
            .metadata
            .lock()
            .facts
            .insert(key.into(), value.into());
    }

    pub fn get_fact(&self, key: &str) -> Option<String> {
        self.shared.metadata.lock().facts.get(key).cloned()
    }

    pub fn facts(&self) -> HashMap<String, String> {
        self.shared.metadata.lock().facts.clone()
    }

    /// Adds `delta` to the counter and returns its new value
    pub fn incr_counter(&self, key: &str, delta: f64) -> f64 {
        let mut meta = self.shared.metadata.lock();
        if key == KARMA_COUNTER {
            tracing::warn!("ignoring attempt to increment the reserved {KARMA_COUNTER} counter");
            return meta.karma as f64;
        }
        let value = meta.counters.entry(key.to_string()).or_insert(0.);
        *value += delta;
        *value
    }

    pub fn set_counter(&self, key: &str, value: f64) {
        if key == KARMA_COUNTER {
            tracing::warn!("ignoring attempt to set the reserved {KARMA_COUNTER} counter");
            return;
        }
        self.shared
            .metadata
            .lock()
            .counters
            .insert(key.to_string(), value);
    }

    pub fn get_counter(&self, key: &str) -> Option<f64> {
        let meta = self.shared.metadata.lock();
        if key == KARMA_COUNTER {
            return Some(meta.karma as f64);
        }
        meta.counters.get(key).copied()
    }

    pub fn counters(&self) -> HashMap<String, f64> {
        let meta = self.shared.metadata.lock();
        let mut counters = meta.counters.clone();
        counters.insert(KARMA_COUNTER.to_string(), meta.karma as f64);
        counters
    }

    pub fn set_flag(&self, key: impl Into<String>) {
        self.shared.metadata.lock().flags.insert(key.into(), true);
    }

    pub fn unset_flag(&self, key: impl Into<String>) {
        self.shared.metadata.lock().flags.insert(key.into(), false);
    }

    pub fn is_flag_set(&self, key: &str) -> bool {
        self.shared
            .metadata
            .lock()
            .flags
            .get(key)
            .copied()
            .unwrap_or(false)
    }

    pub fn flags(&self) -> HashMap<String, bool> {
        self.shared.metadata.lock().flags.clone()
    }

    pub fn karma(&self) -> i64 {
        self.shared.metadata.lock().karma
    }

    /// Raise karma by `amount`, returning the new total
    pub fn reward(&self, amount: i64) -> i64 {
        let mut meta = self.shared.metadata.lock();
        meta.karma += amount;
        meta.karma
    }

    /// Lower karma by `amount`, returning the new total
    pub fn penalize(&self, amount: i64) -> i64 {
        let mut meta = self.shared.metadata.lock();
        meta.karma -= amount;
        meta.karma
    }

    /// Cancelled once, when the connection is torn down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }
}

/// The state of one client connection. It is owned by the task
/// serving the connection, and is what every checker operates upon.
pub struct Transaction {
    handle: TransactionHandle,
    _cancel_on_drop: DropGuard,
    resolver: Arc<dyn Resolver>,
    parsed_headers: Vec<(String, String)>,

    pub started_at: DateTime<Utc>,
    /// The name the server announced itself with
    pub server_hostname: String,
    pub local_addr: SocketAddr,
    /// May be replaced by PROXY or XCLIENT
    pub remote_addr: SocketAddr,
    /// Reverse DNS names for the remote address
    pub ptrs: Vec<String>,

    pub encrypted: bool,
    /// The TLS peer presented a certificate our verifier accepted
    pub secured: bool,
    pub tls: Option<TlsInfo>,

    pub helo: Option<String>,
    pub protocol: Protocol,
    pub username: Option<String>,
    pub password: Option<String>,

    pub mail_from: Option<ReversePath>,
    pub rcpt_to: Vec<ForwardPath>,
    /// Delivery aliases resolved by checkers
    pub aliases: Vec<String>,
    pub body: Vec<u8>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Transaction")
            .field("id", &self.id())
            .field("remote_addr", &self.remote_addr)
            .field("helo", &self.helo)
            .field("mail_from", &self.mail_from)
            .field("rcpt_to", &self.rcpt_to)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl Deref for Transaction {
    type Target = TransactionHandle;
    fn deref(&self) -> &TransactionHandle {
        &self.handle
    }
}

impl Transaction {
    pub fn new(
        server_hostname: impl Into<String>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = TransactionHandle {
            shared: Arc::new(Shared {
                id: uuid::Uuid::new_v4().simple().to_string(),
                metadata: Mutex::new(Metadata::default()),
                cancel: cancel.clone(),
            }),
        };
        Self {
            handle,
            _cancel_on_drop: cancel.drop_guard(),
            resolver,
            parsed_headers: vec![],
            started_at: Utc::now(),
            server_hostname: server_hostname.into(),
            local_addr,
            remote_addr,
            ptrs: vec![],
            encrypted: false,
            secured: false,
            tls: None,
            helo: None,
            protocol: Protocol::Smtp,
            username: None,
            password: None,
            mail_from: None,
            rcpt_to: vec![],
            aliases: vec![],
            body: vec![],
        }
    }

    /// A cloneable handle on the shared parts of this transaction
    pub fn handle(&self) -> TransactionHandle {
        self.handle.clone()
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// Headers of the accepted message, in order. Empty if the
    /// message could not be parsed.
    pub fn parsed_headers(&self) -> &[(String, String)] {
        &self.parsed_headers
    }

    /// The first header with the given name, case insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parsed_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// A full MIME parse of the body
    pub fn parse_message(&self) -> Result<ParsedMail<'_>, MailParseError> {
        mailparse::parse_mail(&self.body)
    }

    pub(crate) fn set_body(&mut self, body: Vec<u8>) {
        self.parsed_headers = match mailparse::parse_headers(&body) {
            Ok((headers, _)) => headers
                .iter()
                .map(|header| (header.get_key(), header.get_value()))
                .collect(),
            Err(err) => {
                tracing::debug!("message headers could not be parsed: {err:#}");
                vec![]
            }
        };
        self.body = body;
    }

    /// Forget the sender, recipients and message, keeping the greeting
    pub(crate) fn reset_envelope(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.aliases.clear();
        self.body.clear();
        self.parsed_headers.clear();
    }

    /// Prepend a `Received:` trace header describing this transaction
    pub fn add_received_line(&mut self) {
        let helo = self.helo.as_deref().unwrap_or("unknown");
        let ptr = self
            .ptrs
            .first()
            .map(|ptr| ptr.trim_end_matches('.'))
            .unwrap_or("unknown");

        let mut with = self.protocol.to_string();
        if self.encrypted {
            with.push('S');
        }
        if self.is_authenticated() {
            with.push('A');
        }

        let mut line = format!(
            "Received: from {helo} ({ptr} [{ip}])\r\n\tby {host} with {with} id {id}",
            ip = self.remote_addr.ip(),
            host = self.server_hostname,
            id = self.id(),
        );
        if let [rcpt] = self.rcpt_to.as_slice() {
            line.push_str(&format!("\r\n\tfor <{rcpt}>"));
        }
        line.push_str(&format!(";\r\n\t{}\r\n", Utc::now().to_rfc2822()));

        let mut body = line.into_bytes();
        body.extend_from_slice(&self.body);
        self.set_body(body);
    }
}

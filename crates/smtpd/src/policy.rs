//! The sample policy the daemon installs into the engine
use async_trait::async_trait;
use chrono::Utc;
use smtp_server::{Authenticator, CheckError, CheckResult, Checker, Transaction};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Authenticates against the `users` table of the configuration
pub struct StaticAuthenticator {
    users: BTreeMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: BTreeMap<String, String>) -> Self {
        Self { users }
    }
}

/// Compares without short-circuiting on the first mismatch
fn same_secret(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        _tx: &mut Transaction,
        username: &str,
        password: &str,
    ) -> CheckResult {
        match self.users.get(username) {
            Some(expected) if same_secret(expected, password) => Ok(()),
            _ => Err(CheckError::reject(
                535,
                "5.7.8 Authentication credentials invalid",
            )),
        }
    }
}

/// Stamps a Received header on every message
pub struct AddReceivedLine;

#[async_trait]
impl Checker for AddReceivedLine {
    async fn check(&self, tx: &mut Transaction) -> CheckResult {
        tx.add_received_line();
        Ok(())
    }
}

/// Accepts the message, writing it to the spool directory if one
/// is configured.
pub struct Deliver {
    spool_dir: Option<PathBuf>,
}

impl Deliver {
    pub fn new(spool_dir: Option<PathBuf>) -> Self {
        Self { spool_dir }
    }
}

#[async_trait]
impl Checker for Deliver {
    async fn check(&self, tx: &mut Transaction) -> CheckResult {
        let sender = tx
            .mail_from
            .as_ref()
            .map(|sender| sender.to_string())
            .unwrap_or_default();
        let recipients: Vec<String> = tx.rcpt_to.iter().map(|rcpt| rcpt.to_string()).collect();

        if let Some(dir) = &self.spool_dir {
            let path = dir.join(format!("{}.eml", tx.id()));
            if let Err(err) = tokio::fs::write(&path, &tx.body).await {
                tracing::error!("failed to spool message to {}: {err:#}", path.display());
                return Err(CheckError::reject(451, "4.3.0 Temporary failure, try again later"));
            }
        }

        tracing::info!(
            sender = %sender,
            recipients = ?recipients,
            size = tx.body.len(),
            subject = tx.header("subject").unwrap_or_default(),
            "accepted message"
        );
        Ok(())
    }
}

/// Logs a summary of every connection as it closes
pub struct LogClose;

#[async_trait]
impl Checker for LogClose {
    async fn check(&self, tx: &mut Transaction) -> CheckResult {
        let elapsed = (Utc::now() - tx.started_at).to_std().unwrap_or_default();
        tracing::info!(
            remote = %tx.remote_addr,
            helo = tx.helo.as_deref().unwrap_or_default(),
            ptr = tx.ptrs.first().map(String::as_str).unwrap_or_default(),
            encrypted = tx.encrypted,
            user = tx.username.as_deref().unwrap_or_default(),
            karma = tx.karma(),
            elapsed = ?elapsed,
            "connection closed"
        );
        Ok(())
    }
}

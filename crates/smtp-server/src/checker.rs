use crate::transaction::Transaction;
use async_trait::async_trait;
use futures::future::BoxFuture;
use rfc5321::ForwardPath;
use std::sync::Arc;
use thiserror::Error;

/// A rejection with an explicit SMTP status, relayed to the client
/// as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {message}")]
pub struct RejectError {
    /// SMTP 3-digit response code
    pub code: u16,
    /// The textual portion of the response to send
    pub message: String,
}

impl RejectError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Looks for a RejectError anywhere in the chain of `err`
    pub fn from_anyhow(err: &anyhow::Error) -> Option<Self> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<Self>())
            .cloned()
    }
}

/// The outcome of a failed checker
#[derive(Error, Debug)]
pub enum CheckError {
    #[error(transparent)]
    Reject(RejectError),
    /// Anything else; reported to the client as a 502
    #[error("{0:#}")]
    Other(anyhow::Error),
}

impl CheckError {
    pub fn reject(code: u16, message: impl Into<String>) -> Self {
        Self::Reject(RejectError::new(code, message))
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::Reject(rej) => rej.code,
            Self::Other(_) => 502,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Reject(rej) => rej.message.clone(),
            Self::Other(err) => format!("{err:#}"),
        }
    }
}

impl From<RejectError> for CheckError {
    fn from(rej: RejectError) -> Self {
        Self::Reject(rej)
    }
}

impl From<anyhow::Error> for CheckError {
    fn from(err: anyhow::Error) -> Self {
        match RejectError::from_anyhow(&err) {
            Some(rej) => Self::Reject(rej),
            None => Self::Other(err),
        }
    }
}

pub type CheckResult = Result<(), CheckError>;

/// A checker for one of the stages that only needs the transaction:
/// connection, helo, sender, data, handler and close.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, tx: &mut Transaction) -> CheckResult;
}

/// Checks a candidate recipient before it is added to the transaction
#[async_trait]
pub trait RecipientChecker: Send + Sync {
    async fn check(&self, tx: &mut Transaction, recipient: &ForwardPath) -> CheckResult;
}

/// Verifies credentials presented via AUTH
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        tx: &mut Transaction,
        username: &str,
        password: &str,
    ) -> CheckResult;
}

struct FnChecker<F>(F);

#[async_trait]
impl<F> Checker for FnChecker<F>
where
    F: for<'a> Fn(&'a mut Transaction) -> BoxFuture<'a, CheckResult> + Send + Sync,
{
    async fn check(&self, tx: &mut Transaction) -> CheckResult {
        (self.0)(tx).await
    }
}

/// Wrap a closure returning a boxed future as a `Checker`
pub fn checker_fn<F>(func: F) -> Arc<dyn Checker>
where
    F: for<'a> Fn(&'a mut Transaction) -> BoxFuture<'a, CheckResult> + Send + Sync + 'static,
{
    Arc::new(FnChecker(func))
}

struct FnRecipientChecker<F>(F);

#[async_trait]
impl<F> RecipientChecker for FnRecipientChecker<F>
where
    F: for<'a> Fn(&'a mut Transaction, &'a ForwardPath) -> BoxFuture<'a, CheckResult>
        + Send
        + Sync,
{
    async fn check(&self, tx: &mut Transaction, recipient: &ForwardPath) -> CheckResult {
        (self.0)(tx, recipient).await
    }
}

pub fn recipient_checker_fn<F>(func: F) -> Arc<dyn RecipientChecker>
where
    F: for<'a> Fn(&'a mut Transaction, &'a ForwardPath) -> BoxFuture<'a, CheckResult>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnRecipientChecker(func))
}

struct FnAuthenticator<F>(F);

#[async_trait]
impl<F> Authenticator for FnAuthenticator<F>
where
    F: for<'a> Fn(&'a mut Transaction, &'a str, &'a str) -> BoxFuture<'a, CheckResult>
        + Send
        + Sync,
{
    async fn authenticate(
        &self,
        tx: &mut Transaction,
        username: &str,
        password: &str,
    ) -> CheckResult {
        (self.0)(tx, username, password).await
    }
}

pub fn authenticator_fn<F>(func: F) -> Arc<dyn Authenticator>
where
    F: for<'a> Fn(&'a mut Transaction, &'a str, &'a str) -> BoxFuture<'a, CheckResult>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnAuthenticator(func))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connection,
    Helo,
    Sender,
    Recipient,
    Data,
    Handler,
    Close,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Helo => "helo",
            Self::Sender => "sender",
            Self::Recipient => "recipient",
            Self::Data => "data",
            Self::Handler => "handler",
            Self::Close => "close",
        };
        write!(fmt, "{name}")
    }
}

/// The ordered checkers for every stage of the protocol
#[derive(Default, Clone)]
pub struct Pipelines {
    pub connection: Vec<Arc<dyn Checker>>,
    pub helo: Vec<Arc<dyn Checker>>,
    pub sender: Vec<Arc<dyn Checker>>,
    pub recipient: Vec<Arc<dyn RecipientChecker>>,
    pub data: Vec<Arc<dyn Checker>>,
    pub handlers: Vec<Arc<dyn Checker>>,
    pub close: Vec<Arc<dyn Checker>>,
}

impl Pipelines {
    pub(crate) fn stage(&self, stage: Stage) -> &[Arc<dyn Checker>] {
        match stage {
            Stage::Connection => &self.connection,
            Stage::Helo => &self.helo,
            Stage::Sender => &self.sender,
            Stage::Recipient => &[],
            Stage::Data => &self.data,
            Stage::Handler => &self.handlers,
            Stage::Close => &self.close,
        }
    }

    /// Run the checkers for `stage` in order, stopping at the first error
    pub(crate) async fn run(&self, stage: Stage, tx: &mut Transaction) -> CheckResult {
        for (idx, checker) in self.stage(stage).iter().enumerate() {
            if let Err(err) = checker.check(tx).await {
                tracing::debug!("{stage} checker #{idx} failed: {err:#}");
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) async fn run_recipient(
        &self,
        tx: &mut Transaction,
        recipient: &ForwardPath,
    ) -> CheckResult {
        for (idx, checker) in self.recipient.iter().enumerate() {
            if let Err(err) = checker.check(tx, recipient).await {
                tracing::debug!("recipient checker #{idx} failed for {recipient}: {err:#}");
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transaction::test::make_transaction;
    use k9::assert_equal;

    struct Record(&'static str);

    #[async_trait]
    impl Checker for Record {
        async fn check(&self, tx: &mut Transaction) -> CheckResult {
            let seen = tx.get_fact("seen").unwrap_or_default();
            tx.set_fact("seen", format!("{seen}{}", self.0));
            Ok(())
        }
    }

    #[test]
    fn error_mapping() {
        let err = CheckError::reject(451, "try again later");
        assert_equal!(err.code(), 451);
        assert_equal!(err.message(), "try again later");

        let err: CheckError = anyhow::anyhow!("database is down").into();
        assert_equal!(err.code(), 502);
        assert_equal!(err.message(), "database is down");

        // A typed rejection wrapped in anyhow keeps its code
        let err: CheckError = anyhow::Error::from(RejectError::new(550, "no such user"))
            .context("checking recipient")
            .into();
        assert_equal!(err.code(), 550);
        assert_equal!(err.message(), "no such user");
    }

    #[tokio::test]
    async fn first_error_stops_the_stage() {
        let pipelines = Pipelines {
            helo: vec![
                Arc::new(Record("a")),
                checker_fn(|tx| {
                    Box::pin(async move {
                        tx.set_fact("reached", "yes");
                        Err(CheckError::reject(550, "go away"))
                    })
                }),
                Arc::new(Record("c")),
            ],
            sender: vec![Arc::new(Record("x")), Arc::new(Record("y"))],
            ..Default::default()
        };

        let mut tx = make_transaction();
        let err = pipelines.run(Stage::Helo, &mut tx).await.unwrap_err();
        assert_equal!(err.code(), 550);
        assert_equal!(tx.get_fact("seen").as_deref(), Some("a"));
        assert_equal!(tx.get_fact("reached").as_deref(), Some("yes"));

        pipelines.run(Stage::Sender, &mut tx).await.unwrap();
        assert_equal!(tx.get_fact("seen").as_deref(), Some("axy"));

        // Empty stages succeed
        pipelines.run(Stage::Close, &mut tx).await.unwrap();
    }

    #[tokio::test]
    async fn recipient_checker_sees_candidate() {
        let pipelines = Pipelines {
            recipient: vec![recipient_checker_fn(|tx, rcpt| {
                Box::pin(async move {
                    tx.set_fact("candidate", rcpt.to_string());
                    Ok(())
                })
            })],
            ..Default::default()
        };
        let mut tx = make_transaction();
        let rcpt = ForwardPath::parse("<user@example.com>").unwrap();
        pipelines.run_recipient(&mut tx, &rcpt).await.unwrap();
        assert_equal!(tx.get_fact("candidate").as_deref(), Some("user@example.com"));
        assert!(tx.rcpt_to.is_empty());
    }
}

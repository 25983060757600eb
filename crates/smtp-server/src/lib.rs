//! A programmable SMTP/ESMTP server engine.
//!
//! The engine drives the protocol state machine for each connection
//! and calls out to ordered pipelines of checkers at every stage, so
//! that policy and delivery live outside of the protocol logic.
mod auth;
mod checker;
mod config;
mod data;
pub mod karma;
mod lifecycle;
mod metrics;
mod resolver;
mod server;
mod session;
mod tls;
mod transaction;
mod trust;

pub use checker::{
    authenticator_fn, checker_fn, recipient_checker_fn, Authenticator, CheckError, CheckResult,
    Checker, Pipelines, RecipientChecker, RejectError, Stage,
};
pub use config::SmtpServerConfig;
pub use data::{DataOutcome, DotDecoder};
pub use resolver::{default_resolver, MxRecord, Resolver, SystemResolver, UnavailableResolver};
pub use rfc5321::{ForwardPath, Mailbox, ReversePath};
pub use server::{ServerError, SmtpServer, SmtpServerBuilder};
pub use transaction::{Protocol, TlsInfo, Transaction, TransactionHandle, KARMA_COUNTER};

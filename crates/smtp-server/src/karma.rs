//! Reward and penalty amounts applied to a transaction's karma as
//! it moves through the protocol. The core never acts on karma by
//! itself; checkers may.

/// HELO/EHLO, MAIL, the first accepted RCPT, and a delivered DATA
pub const COMMAND_EXECUTED_PROPERLY: i64 = 1;
/// A required argument was missing or malformed
pub const MISSING_PARAMETER_PENALTY: i64 = 1;
/// A command arrived before its preconditions were met
pub const ORDER_VIOLATION_PENALTY: i64 = 1;
pub const UNKNOWN_COMMAND_PENALTY: i64 = 2;
pub const TOO_MANY_RECIPIENTS_PENALTY: i64 = 5;
pub const TOO_BIG_MESSAGE_PENALTY: i64 = 5;
pub const TLS_HANDSHAKE_FAILED_PENALTY: i64 = 2;
pub const STARTTLS_NOT_POSSIBLE_PENALTY: i64 = 1;
pub const AUTH_FAILED_PENALTY: i64 = 1;
/// A recipient checker refused the candidate recipient
pub const RECIPIENT_REJECTED_PENALTY: i64 = 1;

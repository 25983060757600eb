use crate::karma;
use crate::session::{Line, Next, Session, SessionError};
use rfc5321::{
    decode_login, decode_plain, CommandLine, SaslError, SaslMechanism, LOGIN_PASSWORD_CHALLENGE,
    LOGIN_USERNAME_CHALLENGE,
};

/// Why a SASL exchange ended without credentials
enum Abort {
    /// The client sent `*`
    Cancelled,
    Invalid(SaslError),
}

impl From<SaslError> for Abort {
    fn from(err: SaslError) -> Self {
        Self::Invalid(err)
    }
}

impl Session {
    pub(crate) async fn handle_auth(&mut self, cmd: &CommandLine) -> Result<Next, SessionError> {
        let Some(authenticator) = self.server.authenticator.clone() else {
            self.tx.penalize(karma::UNKNOWN_COMMAND_PENALTY);
            return self.reply_continue(502, "AUTH not supported.").await;
        };
        let Some(mechanism) = cmd.argument() else {
            self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
            return self.reply_continue(502, "Missing parameter").await;
        };
        if self.tx.helo.is_none() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self
                .reply_continue(502, "Please introduce yourself first.")
                .await;
        }
        if !self.tx.encrypted {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self
                .reply_continue(502, "Cannot AUTH in plain text mode. Use STARTTLS.")
                .await;
        }
        if self.tx.is_authenticated() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self.reply_continue(503, "Already authenticated").await;
        }
        if self.tx.mail_from.is_some() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self
                .reply_continue(503, "AUTH not permitted during a mail transaction")
                .await;
        }

        let mechanism = match mechanism.parse::<SaslMechanism>() {
            Ok(mechanism) => mechanism,
            Err(err) => return self.reply_continue(502, err.to_string()).await,
        };
        let initial = cmd.fields.get(2).cloned();

        let exchange = match mechanism {
            SaslMechanism::Plain => self.auth_plain(initial).await?,
            SaslMechanism::Login => self.auth_login(initial).await?,
        };

        let (username, password) = match exchange {
            Ok(credentials) => credentials,
            Err(Abort::Cancelled) => {
                return self.reply_continue(501, "Authentication cancelled").await;
            }
            Err(Abort::Invalid(err)) => {
                self.tx.penalize(karma::AUTH_FAILED_PENALTY);
                return self.reply_continue(502, err.to_string()).await;
            }
        };

        if let Err(err) = authenticator
            .authenticate(&mut self.tx, &username, &password)
            .await
        {
            tracing::info!(username = %username, "authentication failed");
            self.tx.penalize(karma::AUTH_FAILED_PENALTY);
            return self.reply_error_continue(&err).await;
        }

        tracing::info!(username = %username, "authenticated");
        self.tx.username = Some(username);
        self.tx.password = Some(password);
        self.reply_continue(235, "OK, you are now authenticated").await
    }

    async fn auth_plain(
        &mut self,
        initial: Option<String>,
    ) -> Result<Result<(String, String), Abort>, SessionError> {
        let response = match initial {
            // A lone `=` is an empty initial response
            Some(initial) if initial != "=" => initial,
            _ => {
                self.reply(334, "").await?;
                match self.read_sasl_response().await? {
                    Ok(response) => response,
                    Err(abort) => return Ok(Err(abort)),
                }
            }
        };

        Ok(decode_plain(&response)
            .map(|creds| (creds.username, creds.password))
            .map_err(Abort::from))
    }

    async fn auth_login(
        &mut self,
        initial: Option<String>,
    ) -> Result<Result<(String, String), Abort>, SessionError> {
        let username = match initial {
            Some(initial) => initial,
            None => {
                self.reply(334, LOGIN_USERNAME_CHALLENGE).await?;
                match self.read_sasl_response().await? {
                    Ok(response) => response,
                    Err(abort) => return Ok(Err(abort)),
                }
            }
        };
        let username = match decode_login(&username) {
            Ok(username) => username,
            Err(err) => return Ok(Err(err.into())),
        };

        self.reply(334, LOGIN_PASSWORD_CHALLENGE).await?;
        let password = match self.read_sasl_response().await? {
            Ok(response) => response,
            Err(abort) => return Ok(Err(abort)),
        };

        Ok(decode_login(&password)
            .map(|password| (username, password))
            .map_err(Abort::from))
    }

    async fn read_sasl_response(&mut self) -> Result<Result<String, Abort>, SessionError> {
        match self.read_line(self.server.config.read_timeout).await? {
            Line::Text(text) if text.trim() == "*" => Ok(Err(Abort::Cancelled)),
            Line::Text(text) => Ok(Ok(text)),
            Line::TooLong => Ok(Err(Abort::Invalid(SaslError::Malformed))),
        }
    }
}

//! Reinterpreting the client identity on behalf of a trusted proxy
use crate::karma;
use crate::session::{Next, Session, SessionError};
use crate::transaction::Protocol;
use rfc5321::{CommandLine, ProxyHeader, XClientAttributes, XClientProto};
use std::net::SocketAddr;

impl Session {
    pub(crate) async fn handle_proxy(&mut self, cmd: &CommandLine) -> Result<Next, SessionError> {
        if !self.server.config.enable_proxy_protocol {
            return self
                .reply_continue(550, "Proxy Protocol not enabled")
                .await;
        }
        if self.commands > 0 {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self
                .reply_continue(502, "PROXY must be the first command")
                .await;
        }

        let header = match ProxyHeader::from_fields(&cmd.fields) {
            Ok(header) => header,
            Err(err) => {
                self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
                return self.reply_continue(502, err.to_string()).await;
            }
        };

        tracing::info!(
            "PROXY: client {} is really {}",
            self.tx.remote_addr,
            header.source
        );
        self.tx.remote_addr = header.source;
        self.lookup_ptrs().await;

        // The proxy consumed our first banner
        self.greet().await?;
        Ok(Next::Continue)
    }

    pub(crate) async fn handle_xclient(&mut self, cmd: &CommandLine) -> Result<Next, SessionError> {
        if !self.server.config.enable_xclient {
            return self.reply_continue(550, "XCLIENT not enabled").await;
        }

        let attrs = match XClientAttributes::parse(cmd.arguments()) {
            Ok(attrs) => attrs,
            Err(err) => {
                self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
                return self.reply_continue(502, err.to_string()).await;
            }
        };

        if let (Some(addr), Some(port)) = (attrs.addr, attrs.port) {
            let remote = SocketAddr::new(addr, port);
            tracing::info!("XCLIENT: client {} is really {remote}", self.tx.remote_addr);
            self.tx.remote_addr = remote;
            self.lookup_ptrs().await;
        }
        if let Some(helo) = attrs.helo {
            self.tx.helo = Some(helo);
        }
        if let Some(login) = attrs.login {
            self.tx.username = Some(login);
        }
        if let Some(proto) = attrs.proto {
            self.tx.protocol = match proto {
                XClientProto::Smtp => Protocol::Smtp,
                XClientProto::Esmtp => Protocol::Esmtp,
            };
        }

        self.greet().await?;
        Ok(Next::Continue)
    }
}

use pest::iterators::{Pair, Pairs};
use pest::Parser as _;
use pest_derive::Parser;
use std::fmt;
use thiserror::Error;

#[derive(Parser)]
#[grammar = "rfc5321.pest"]
struct PathParser;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(String);

impl ParseError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self(message.into())
    }
}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        Self(format!("{err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    Path(MailPath),
    NullSender,
}

impl ReversePath {
    /// Parse the argument of `MAIL FROM:`, angle brackets included.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let pair = top_level(PathParser::parse(Rule::reverse_path, text)?)?;
        match pair.as_rule() {
            Rule::null_sender => Ok(Self::NullSender),
            Rule::path | Rule::path_no_angles => Ok(Self::Path(parse_path(pair)?)),
            wat => Err(unexpected(wat)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::NullSender)
    }

    pub fn mailbox(&self) -> Option<&Mailbox> {
        match self {
            Self::Path(path) => Some(&path.mailbox),
            Self::NullSender => None,
        }
    }
}

impl fmt::Display for ReversePath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Path(p) => p.fmt(fmt),
            Self::NullSender => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    Path(MailPath),
    Postmaster,
}

impl ForwardPath {
    /// Parse the argument of `RCPT TO:`, angle brackets included.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let pair = top_level(PathParser::parse(Rule::forward_path, text)?)?;
        match pair.as_rule() {
            Rule::postmaster => Ok(Self::Postmaster),
            Rule::path | Rule::path_no_angles => Ok(Self::Path(parse_path(pair)?)),
            wat => Err(unexpected(wat)),
        }
    }

    pub fn mailbox(&self) -> Option<&Mailbox> {
        match self {
            Self::Path(path) => Some(&path.mailbox),
            Self::Postmaster => None,
        }
    }
}

impl fmt::Display for ForwardPath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Path(p) => p.fmt(fmt),
            Self::Postmaster => write!(fmt, "postmaster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPath {
    pub at_domain_list: Vec<String>,
    pub mailbox: Mailbox,
}

impl fmt::Display for MailPath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // Source routes must be accepted but should be ignored,
        // so they are not part of the textual form.
        self.mailbox.fmt(fmt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: Domain,
}

impl fmt::Display for Mailbox {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}@{}", self.local_part, self.domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Name(String),
    V4(String),
    V6(String),
    Tagged { tag: String, literal: String },
}

impl fmt::Display for Domain {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Name(name) => write!(fmt, "{name}"),
            Self::V4(addr) => write!(fmt, "[{addr}]"),
            Self::V6(addr) => write!(fmt, "[IPv6:{addr}]"),
            Self::Tagged { tag, literal } => write!(fmt, "[{tag}:{literal}]"),
        }
    }
}

fn unexpected(rule: Rule) -> ParseError {
    ParseError(format!("unexpected {rule:?}"))
}

/// Unwraps `SOI ~ (alternatives) ~ EOI` to the matched alternative
fn top_level(mut pairs: Pairs<'_, Rule>) -> Result<Pair<'_, Rule>, ParseError> {
    pairs
        .next()
        .and_then(|pair| pair.into_inner().next())
        .ok_or_else(|| ParseError::new("empty path"))
}

fn parse_path(path: Pair<Rule>) -> Result<MailPath, ParseError> {
    let mut at_domain_list: Vec<String> = vec![];
    for p in path.into_inner() {
        match p.as_rule() {
            Rule::adl => {
                for pair in p.into_inner() {
                    if let Some(dom) = pair.into_inner().next() {
                        at_domain_list.push(dom.as_str().to_string());
                    }
                }
            }
            Rule::mailbox => {
                let mailbox = parse_mailbox(p.into_inner())?;
                return Ok(MailPath {
                    at_domain_list,
                    mailbox,
                });
            }
            wat => return Err(unexpected(wat)),
        }
    }
    Err(ParseError::new("path has no mailbox"))
}

fn parse_mailbox(mut mailbox: Pairs<Rule>) -> Result<Mailbox, ParseError> {
    let local_part = mailbox
        .next()
        .ok_or_else(|| ParseError::new("missing local part"))?
        .as_str()
        .to_string();
    let domain = mailbox
        .next()
        .ok_or_else(|| ParseError::new("missing domain"))?;
    let domain = parse_domain(domain)?;
    Ok(Mailbox { local_part, domain })
}

fn parse_domain(domain: Pair<Rule>) -> Result<Domain, ParseError> {
    match domain.as_rule() {
        Rule::domain => Ok(Domain::Name(domain.as_str().to_string())),
        Rule::address_literal => {
            let literal = domain
                .into_inner()
                .next()
                .ok_or_else(|| ParseError::new("empty address literal"))?;
            match literal.as_rule() {
                Rule::ipv4_address_literal => Ok(Domain::V4(literal.as_str().to_string())),
                Rule::ipv6_address_literal => {
                    let addr = literal
                        .into_inner()
                        .next()
                        .ok_or_else(|| ParseError::new("empty IPv6 literal"))?;
                    Ok(Domain::V6(addr.as_str().to_string()))
                }
                Rule::general_address_literal => {
                    let mut literal = literal.into_inner();
                    match (literal.next(), literal.next()) {
                        (Some(tag), Some(content)) => Ok(Domain::Tagged {
                            tag: tag.as_str().to_string(),
                            literal: content.as_str().to_string(),
                        }),
                        _ => Err(ParseError::new("incomplete address literal")),
                    }
                }
                wat => Err(unexpected(wat)),
            }
        }
        wat => Err(unexpected(wat)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn mailbox(local_part: &str, domain: Domain) -> MailPath {
        MailPath {
            at_domain_list: vec![],
            mailbox: Mailbox {
                local_part: local_part.to_string(),
                domain,
            },
        }
    }

    #[test]
    fn reverse_path() {
        assert_equal!(ReversePath::parse("<>").unwrap(), ReversePath::NullSender);
        assert_equal!(
            ReversePath::parse("<user@host>").unwrap(),
            ReversePath::Path(mailbox("user", Domain::Name("host".to_string())))
        );
        assert_equal!(
            ReversePath::parse("user@host.example").unwrap(),
            ReversePath::Path(mailbox("user", Domain::Name("host.example".to_string())))
        );
        assert_equal!(ReversePath::NullSender.to_string(), "");
    }

    #[test]
    fn malformed_paths() {
        for bad in [
            "",
            "<",
            "<user>",
            "<user@>",
            "<@host>",
            "user@host>",
            "<user@host",
            "<user@host.>",
            "<a@b@c>",
            "<user@[1.2.3.4.5]>",
        ] {
            assert!(ReversePath::parse(bad).is_err(), "{bad} should not parse");
            assert!(ForwardPath::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn source_route_is_ignored_in_display() {
        let path = ForwardPath::parse("<@relay.example,@other.example:user@host>").unwrap();
        match &path {
            ForwardPath::Path(p) => {
                assert_equal!(
                    p.at_domain_list,
                    vec!["relay.example".to_string(), "other.example".to_string()]
                );
            }
            ForwardPath::Postmaster => panic!("wrong variant"),
        }
        assert_equal!(path.to_string(), "user@host");
    }

    #[test]
    fn forward_path_literals() {
        assert_equal!(
            ForwardPath::parse("<admin@[127.0.0.1]>").unwrap(),
            ForwardPath::Path(mailbox("admin", Domain::V4("127.0.0.1".to_string())))
        );
        assert_equal!(
            ForwardPath::parse("<admin@[IPv6:::1]>").unwrap(),
            ForwardPath::Path(mailbox("admin", Domain::V6("::1".to_string())))
        );
        assert_equal!(
            ForwardPath::parse("<admin@[2001:aaaa:bbbbb]>").unwrap(),
            ForwardPath::Path(mailbox(
                "admin",
                Domain::Tagged {
                    tag: "2001".to_string(),
                    literal: "aaaa:bbbbb".to_string()
                }
            ))
        );
        assert_equal!(
            Domain::Tagged {
                tag: "2001".to_string(),
                literal: "aaaa:bbbbb".to_string()
            }
            .to_string(),
            "[2001:aaaa:bbbbb]"
        );
    }

    #[test]
    fn quoted_local_part() {
        assert_equal!(
            ForwardPath::parse("<\"asking for trouble\"@host.name>").unwrap(),
            ForwardPath::Path(mailbox(
                "\"asking for trouble\"",
                Domain::Name("host.name".to_string())
            ))
        );
    }

    #[test]
    fn postmaster() {
        assert_equal!(
            ForwardPath::parse("<PostMastER>").unwrap(),
            ForwardPath::Postmaster
        );
        assert_equal!(
            ForwardPath::parse("postmaster").unwrap(),
            ForwardPath::Postmaster
        );
        assert_equal!(
            ForwardPath::parse("<postmaster@host>").unwrap(),
            ForwardPath::Path(mailbox("postmaster", Domain::Name("host".to_string())))
        );
        // The null path is only valid as a sender
        assert!(ForwardPath::parse("<>").is_err());
    }
}

/// A single command line as received from the client, broken into
/// the pieces the dispatcher needs. No validation happens here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLine {
    /// The first field, upper-cased
    pub action: String,
    /// Whitespace separated fields, the verb included
    pub fields: Vec<String>,
    /// The second field split on `:`, so `FROM:<user@host>`
    /// becomes `["FROM", "<user@host>"]`
    pub params: Vec<String>,
}

impl CommandLine {
    /// Tokenize a line that has already had its CRLF removed.
    pub fn parse(line: &str) -> Self {
        let mut fields: Vec<String> = line.split_ascii_whitespace().map(str::to_string).collect();

        let action = fields
            .first()
            .map(|verb| verb.to_ascii_uppercase())
            .unwrap_or_default();

        // `MAIL FROM: <user@host>` is a common client bug; glue the
        // address back on so that it looks like `MAIL FROM:<user@host>`
        if fields.len() > 2 && fields[1].ends_with(':') {
            let value = fields.remove(2);
            fields[1].push_str(&value);
        }

        let params = fields
            .get(1)
            .map(|field| field.split(':').map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            action,
            fields,
            params,
        }
    }

    /// The first argument after the verb, if any
    pub fn argument(&self) -> Option<&str> {
        self.fields.get(1).map(String::as_str)
    }

    /// Everything after the verb
    pub fn arguments(&self) -> &[String] {
        self.fields.get(1..).unwrap_or_default()
    }

    /// The keyword before the first colon of the second field,
    /// upper-cased. `FROM` for `MAIL FROM:<...>`.
    pub fn keyword(&self) -> Option<String> {
        self.params.first().map(|p| p.to_ascii_uppercase())
    }

    /// The text following `KEYWORD:`. IPv6 address literals
    /// contain colons of their own, so everything after the
    /// keyword is rejoined.
    pub fn path_argument(&self) -> Option<String> {
        if self.params.len() < 2 {
            return None;
        }
        Some(self.params[1..].join(":"))
    }

    /// ESMTP parameters such as `SIZE=1234` that follow the path
    pub fn esmtp_parameters(&self) -> &[String] {
        self.fields.get(2..).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn action_is_upper_cased() {
        let cmd = CommandLine::parse("ehlo there");
        assert_equal!(cmd.action, "EHLO");
        assert_equal!(cmd.fields, vec!["ehlo".to_string(), "there".to_string()]);
        assert_equal!(cmd.argument(), Some("there"));
    }

    #[test]
    fn empty_line() {
        let cmd = CommandLine::parse("   ");
        assert_equal!(cmd.action, "");
        assert!(cmd.fields.is_empty());
        assert!(cmd.params.is_empty());
        assert_equal!(cmd.argument(), None);
    }

    #[test]
    fn space_after_colon() {
        let compact = CommandLine::parse("MAIL FROM:<user@example.com>");
        let spaced = CommandLine::parse("MAIL FROM: <user@example.com>");
        assert_equal!(compact.params, spaced.params);
        assert_equal!(compact.fields, spaced.fields);
        assert_equal!(
            spaced.params,
            vec!["FROM".to_string(), "<user@example.com>".to_string()]
        );
        assert_equal!(spaced.path_argument().as_deref(), Some("<user@example.com>"));
    }

    #[test]
    fn space_after_colon_keeps_esmtp_params() {
        let cmd = CommandLine::parse("mail from: <a@b> SIZE=100 BODY=8BITMIME");
        assert_equal!(cmd.keyword().as_deref(), Some("FROM"));
        assert_equal!(cmd.path_argument().as_deref(), Some("<a@b>"));
        assert_equal!(
            cmd.esmtp_parameters(),
            &["SIZE=100".to_string(), "BODY=8BITMIME".to_string()][..]
        );
    }

    #[test]
    fn ipv6_literal_is_rejoined() {
        let cmd = CommandLine::parse("RCPT TO:<user@[IPv6:::1]>");
        assert_equal!(cmd.path_argument().as_deref(), Some("<user@[IPv6:::1]>"));
    }

    #[test]
    fn missing_path() {
        let cmd = CommandLine::parse("MAIL FROM");
        assert_equal!(cmd.keyword().as_deref(), Some("FROM"));
        assert_equal!(cmd.path_argument(), None);

        let cmd = CommandLine::parse("MAIL");
        assert_equal!(cmd.keyword(), None);
        assert_equal!(cmd.path_argument(), None);
    }
}

use crate::parser::ParseError;

/// Render a reply. Each line of `message` becomes its own
/// `code-text` line, with the final one using `code text`.
pub fn format_reply(code: u16, message: &str) -> String {
    let mut result = String::new();
    let mut lines = message.lines().peekable();
    if lines.peek().is_none() {
        return format!("{code} \r\n");
    }
    while let Some(line) = lines.next() {
        let is_last = lines.peek().is_none();
        let sep = if is_last { ' ' } else { '-' };
        result.push_str(&format!("{code}{sep}{line}\r\n"));
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

pub fn parse_response_line(line: &str) -> Result<ResponseLine<'_>, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 4 || !line.is_char_boundary(4) {
        return Err(ParseError::new(format!("malformed response line {line:?}")));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(ParseError::new(format!("malformed response line {line:?}"))),
        },
        _ => Err(ParseError::new(format!("malformed response line {line:?}"))),
    }
}

/// A complete, possibly multi-line, reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    pub fn content(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }
}

/// Accumulates lines until the final line of a reply has been seen
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    code: Option<u16>,
    lines: Vec<String>,
}

impl ResponseBuilder {
    /// Returns the completed response once the final line was added
    pub fn add_line(&mut self, line: &str) -> Result<Option<Response>, ParseError> {
        let parsed = parse_response_line(line)?;
        match self.code {
            Some(code) if code != parsed.code => {
                return Err(ParseError::new(format!(
                    "reply code changed from {code} to {} mid-response",
                    parsed.code
                )));
            }
            _ => self.code = Some(parsed.code),
        }
        self.lines.push(parsed.content.to_string());
        if parsed.is_final {
            let lines = std::mem::take(&mut self.lines);
            let code = parsed.code;
            self.code = None;
            return Ok(Some(Response { code, lines }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn single_line() {
        assert_equal!(format_reply(250, "Go ahead"), "250 Go ahead\r\n");
        assert_equal!(format_reply(250, ""), "250 \r\n");
    }

    #[test]
    fn multi_line() {
        assert_equal!(
            format_reply(250, "mx.example.com\nSIZE 100\nPIPELINING"),
            "250-mx.example.com\r\n250-SIZE 100\r\n250 PIPELINING\r\n"
        );
    }

    #[test]
    fn build_response() {
        let mut builder = ResponseBuilder::default();
        assert_equal!(builder.add_line("250-mx.example.com\r\n"), Ok(None));
        assert_equal!(
            builder.add_line("250 SIZE 100\r\n"),
            Ok(Some(Response {
                code: 250,
                lines: vec!["mx.example.com".to_string(), "SIZE 100".to_string()],
            }))
        );
        assert!(builder.add_line("25").is_err());
        assert!(builder.add_line("abc def").is_err());

        let mut builder = ResponseBuilder::default();
        builder.add_line("250-one").unwrap();
        assert!(builder.add_line("550 two").is_err());
    }
}

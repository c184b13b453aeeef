/// Tokenizer for the postfix query language.
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    /// `~r/pattern/flags`
    Regex { pattern: String, flags: String },
    /// `~d/2021-01-01T00:00:00Z/`
    Date(String),
    /// `name:` or `"name":` inside a map literal.
    Key(String),

    /// Anything else, including `[ ] { }`.
    Word(String),

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Int(n) => write!(f, "{n}"),
            Token::Float(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Bool(b) => write!(f, "{b}"),
            Token::Null => write!(f, "null"),
            Token::Regex { pattern, flags } => write!(f, "~r/{pattern}/{flags}"),
            Token::Date(s) => write!(f, "~d/{s}/"),
            Token::Key(s) => write!(f, "{s}:"),
            Token::Word(s) => write!(f, "{s}"),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub line: usize,
    pub col: usize,
}

pub struct Tokenizer<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b',' | b'[' | b']' | b'{' | b'}')
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    /// Splits the input into tokens. The trailing `Eof` is not included.
    pub fn tokenize(&mut self) -> Result<Vec<SpannedToken>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            if tok.token == Token::Eof {
                break;
            }
            tokens.push(tok);
        }
        Ok(tokens)
    }

    fn peek_byte(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.input.get(self.pos).copied()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else if b & 0xC0 != 0x80 {
            // count chars, not continuation bytes
            self.col += 1;
        }
        Some(b)
    }

    fn error(&self, line: usize, col: usize, message: impl Into<String>) -> LexError {
        LexError {
            line,
            col,
            message: message.into(),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while let Some(b) = self.peek_byte() {
                if matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b',') {
                    self.advance();
                } else {
                    break;
                }
            }

            if self.peek_byte() == Some(b'/') && self.peek_at(1) == Some(b'/') {
                while let Some(b) = self.advance() {
                    if b == b'\n' {
                        break;
                    }
                }
                continue;
            }

            if self.peek_byte() == Some(b'/') && self.peek_at(1) == Some(b'*') {
                self.advance();
                self.advance();
                loop {
                    match self.advance() {
                        None => break,
                        Some(b'*') if self.peek_byte() == Some(b'/') => {
                            self.advance();
                            break;
                        }
                        _ => {}
                    }
                }
                continue;
            }

            break;
        }
    }

    fn next_token(&mut self) -> Result<SpannedToken, LexError> {
        self.skip_whitespace_and_comments();

        let line = self.line;
        let col = self.col;
        let spanned = |token| SpannedToken { token, line, col };

        let Some(b) = self.peek_byte() else {
            return Ok(spanned(Token::Eof));
        };

        if matches!(b, b'[' | b']' | b'{' | b'}') {
            self.advance();
            return Ok(spanned(Token::Word((b as char).to_string())));
        }

        if b == b'"' || b == b'\'' {
            let text = self.read_quoted(b, line, col)?;
            if self.peek_byte() == Some(b':') {
                self.advance();
                return Ok(spanned(Token::Key(text)));
            }
            return Ok(spanned(Token::Str(text)));
        }

        if b == b'~' && self.peek_at(2) == Some(b'/') {
            match self.peek_at(1) {
                Some(b'r') => {
                    self.advance();
                    self.advance();
                    self.advance();
                    let pattern = self.read_until_slash(line, col, "regex")?;
                    let flags = self.read_word();
                    return Ok(spanned(Token::Regex { pattern, flags }));
                }
                Some(b'd') => {
                    self.advance();
                    self.advance();
                    self.advance();
                    let date = self.read_until_slash(line, col, "date")?;
                    return Ok(spanned(Token::Date(date)));
                }
                _ => {}
            }
        }

        let word = self.read_word();
        Ok(spanned(classify(word)))
    }

    fn read_word(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek_byte() {
            if is_delimiter(c) {
                break;
            }
            self.advance();
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn read_quoted(&mut self, quote: u8, line: usize, col: usize) -> Result<String, LexError> {
        self.advance();
        let mut out = Vec::new();
        loop {
            match self.advance() {
                None => return Err(self.error(line, col, "unterminated string")),
                Some(b) if b == quote => break,
                Some(b'\\') => {
                    let escaped = match self.advance() {
                        Some(b'n') => b'\n',
                        Some(b't') => b'\t',
                        Some(b'r') => b'\r',
                        Some(b'0') => b'\0',
                        Some(other) => other,
                        None => return Err(self.error(line, col, "unterminated string")),
                    };
                    out.push(escaped);
                }
                Some(b) => out.push(b),
            }
        }
        String::from_utf8(out).map_err(|_| self.error(line, col, "string is not valid utf-8"))
    }

    /// Reads up to the closing `/`. `\/` escapes a slash.
    fn read_until_slash(&mut self, line: usize, col: usize, what: &str) -> Result<String, LexError> {
        let mut out = Vec::new();
        loop {
            match self.advance() {
                None => return Err(self.error(line, col, format!("unterminated {what}"))),
                Some(b'/') => break,
                Some(b'\\') if self.peek_byte() == Some(b'/') => {
                    self.advance();
                    out.push(b'/');
                }
                Some(b) => out.push(b),
            }
        }
        String::from_utf8(out).map_err(|_| self.error(line, col, format!("{what} is not valid utf-8")))
    }
}

fn looks_numeric(word: &str) -> bool {
    let digits = word.strip_prefix(['-', '+']).unwrap_or(word);
    let digits = digits.strip_prefix('.').unwrap_or(digits);
    digits.as_bytes().first().is_some_and(u8::is_ascii_digit)
}

fn classify(word: String) -> Token {
    match word.as_str() {
        "true" => return Token::Bool(true),
        "false" => return Token::Bool(false),
        "null" | "undefined" => return Token::Null,
        _ => {}
    }
    if looks_numeric(&word) {
        if let Ok(n) = word.parse::<i64>() {
            return Token::Int(n);
        }
        if let Ok(n) = word.parse::<f64>() {
            return Token::Float(n);
        }
    }
    if word.len() > 1 {
        if let Some(key) = word.strip_suffix(':') {
            return Token::Key(key.to_string());
        }
        if word.starts_with('/') {
            return Token::Str(word);
        }
    }
    Token::Word(word)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for LexError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Tokenizer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    fn word(s: &str) -> Token {
        Token::Word(s.to_string())
    }

    #[test]
    fn test_numbers_and_words() {
        assert_eq!(
            tokens("[2 3 +] -4 1.5 -0.5 - x"),
            vec![
                word("["),
                Token::Int(2),
                Token::Int(3),
                word("+"),
                word("]"),
                Token::Int(-4),
                Token::Float(1.5),
                Token::Float(-0.5),
                word("-"),
                word("x"),
            ]
        );
    }

    #[test]
    fn test_strings_and_keys() {
        assert_eq!(
            tokens(r#"{ "@e":14, channel: 3 'it\'s' "a\"b" }"#),
            vec![
                word("{"),
                Token::Key("@e".into()),
                Token::Int(14),
                Token::Key("channel".into()),
                Token::Int(3),
                Token::Str("it's".into()),
                Token::Str("a\"b".into()),
                word("}"),
            ]
        );
    }

    #[test]
    fn test_locators_are_strings() {
        assert_eq!(
            tokens("/component/title#/text !ca / 2"),
            vec![
                Token::Str("/component/title#/text".into()),
                word("!ca"),
                word("/"),
                Token::Int(2),
            ]
        );
    }

    #[test]
    fn test_regex_and_date_literals() {
        assert_eq!(
            tokens("~r/^do\\/it/i ~d/2021-01-01T10:00:00Z/ true null"),
            vec![
                Token::Regex {
                    pattern: "^do/it".into(),
                    flags: "i".into()
                },
                Token::Date("2021-01-01T10:00:00Z".into()),
                Token::Bool(true),
                Token::Null,
            ]
        );
    }

    #[test]
    fn test_comments() {
        let input = "// line comment\n1 /* block */ 2 // trailing";
        assert_eq!(tokens(input), vec![Token::Int(1), Token::Int(2)]);
    }

    #[test]
    fn test_positions() {
        let toks = Tokenizer::new("1\n  foo").tokenize().unwrap();
        assert_eq!((toks[1].line, toks[1].col), (2, 3));
    }

    #[test]
    fn test_unterminated() {
        let err = Tokenizer::new("1 \"abc").tokenize().unwrap_err();
        assert_eq!((err.line, err.col), (1, 3));
        assert_eq!(err.to_string(), "1:3: unterminated string");
        assert!(Tokenizer::new("~r/abc").tokenize().is_err());
    }
}

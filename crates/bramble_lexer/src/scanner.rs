use crate::token::{lookup_keyword, Token, TokenKind};

/// Lazy, restartable scanner: `scan_token` can be called repeatedly from
/// wherever the previous call left `pos`; there is no internal lookahead
/// buffer beyond the single `peek`/`peek_next` characters, so a caller
/// that stops scanning mid-stream (e.g. to resynchronize after a parse
/// error) can simply keep calling `scan_token` — nothing needs to be
/// rewound.
pub struct Scanner {
    source: Vec<u8>,
    start: usize,
    pos: usize,
    line: u32,
}

impl Scanner {
    pub fn new(source: &str) -> Self {
        Scanner { source: source.as_bytes().to_vec(), start: 0, pos: 0, line: 1 }
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() { 0 } else { self.source[self.pos] }
    }

    fn peek_next(&self) -> u8 {
        if self.pos + 1 >= self.source.len() { 0 } else { self.source[self.pos + 1] }
    }

    fn advance(&mut self) -> u8 {
        let c = self.source[self.pos];
        self.pos += 1;
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source[self.pos] != expected {
            return false;
        }
        self.pos += 1;
        true
    }

    fn lexeme(&self) -> String {
        String::from_utf8_lossy(&self.source[self.start..self.pos]).into_owned()
    }

    fn make(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.lexeme(), self.line)
    }

    fn error(&self, message: &str) -> Token {
        Token::new(TokenKind::Error, message, self.line)
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => { self.advance(); }
                b'\n' => { self.line += 1; self.advance(); }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.is_at_end() { self.advance(); }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' { self.line += 1; }
            self.advance();
        }
        if self.is_at_end() {
            return self.error("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make(TokenKind::String)
    }

    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() { self.advance(); }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() { self.advance(); }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() { self.advance(); }
        let text = self.lexeme();
        let kind = lookup_keyword(&text).unwrap_or(TokenKind::Identifier);
        self.make(kind)
    }

    pub fn scan_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.pos;
        if self.is_at_end() {
            return self.make(TokenKind::Eof);
        }

        let c = self.advance();
        if is_alpha(c) { return self.identifier(); }
        if c.is_ascii_digit() { return self.number(); }

        match c {
            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => self.make(TokenKind::RightBrace),
            b';' => self.make(TokenKind::Semicolon),
            b',' => self.make(TokenKind::Comma),
            b'.' => self.make(TokenKind::Dot),
            b'-' => self.make(TokenKind::Minus),
            b'+' => self.make(TokenKind::Plus),
            b'/' => self.make(TokenKind::Slash),
            b'*' => self.make(TokenKind::Star),
            b'!' => { let k = if self.matches(b'=') { TokenKind::BangEqual } else { TokenKind::Bang }; self.make(k) }
            b'=' => { let k = if self.matches(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal }; self.make(k) }
            b'<' => { let k = if self.matches(b'=') { TokenKind::LessEqual } else { TokenKind::Less }; self.make(k) }
            b'>' => { let k = if self.matches(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater }; self.make(k) }
            b'"' => self.string(),
            _ => self.error("Unexpected character."),
        }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut s = Scanner::new(src);
        let mut out = Vec::new();
        loop {
            let t = s.scan_token();
            let done = t.kind == TokenKind::Eof;
            out.push(t.kind);
            if done { break; }
        }
        out
    }

    #[test]
    fn scans_arithmetic() {
        assert_eq!(
            kinds("1 + 2 * 3;"),
            vec![TokenKind::Number, TokenKind::Plus, TokenKind::Number, TokenKind::Star,
                 TokenKind::Number, TokenKind::Semicolon, TokenKind::Eof]
        );
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        assert_eq!(
            kinds("var x = foo;"),
            vec![TokenKind::Var, TokenKind::Identifier, TokenKind::Equal,
                 TokenKind::Identifier, TokenKind::Semicolon, TokenKind::Eof]
        );
    }

    #[test]
    fn tracks_line_numbers() {
        let mut s = Scanner::new("1\n2\n3");
        assert_eq!(s.scan_token().line, 1);
        assert_eq!(s.scan_token().line, 2);
        assert_eq!(s.scan_token().line, 3);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut s = Scanner::new("\"abc");
        assert_eq!(s.scan_token().kind, TokenKind::Error);
    }

    #[test]
    fn skips_line_comments() {
        assert_eq!(kinds("// hi\n1;"), vec![TokenKind::Number, TokenKind::Semicolon, TokenKind::Eof]);
    }

    #[test]
    fn is_restartable_after_an_error_token() {
        let mut s = Scanner::new("@ 1;");
        assert_eq!(s.scan_token().kind, TokenKind::Error);
        assert_eq!(s.scan_token().kind, TokenKind::Number);
    }
}

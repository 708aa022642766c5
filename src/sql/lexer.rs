//! SQL Lexer (Tokenizer)
//!
//! This module converts SQL strings into a stream of tokens. The byte offset
//! of each token's first character is recorded so the parser can slice the
//! original text of sub-expressions (view bodies, CHECK and DEFAULT
//! expressions, trigger bodies) for catalog storage.

use super::token::Token;
use crate::error::{Error, Result};

/// SQL Lexer
pub struct Lexer {
    input: Vec<char>,
    position: usize,
    /// Start of the most recently produced token.
    token_start: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            token_start: 0,
        }
    }

    /// Tokenize the entire input, returning tokens with their start offsets
    /// (in characters).
    pub fn tokenize(&mut self) -> Result<(Vec<Token>, Vec<usize>)> {
        let mut tokens = Vec::new();
        let mut spans = Vec::new();
        loop {
            let token = self.next_token()?;
            spans.push(self.token_start);
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok((tokens, spans))
    }

    /// Get the next token from the input
    pub fn next_token(&mut self) -> Result<Token> {
        loop {
            self.skip_whitespace();
            if !self.skip_comment() {
                break;
            }
        }
        self.token_start = self.position;

        if self.is_at_end() {
            return Ok(Token::Eof);
        }

        let ch = self.current_char();
        match ch {
            '(' => {
                self.advance();
                Ok(Token::LParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RParen)
            }
            ',' => {
                self.advance();
                Ok(Token::Comma)
            }
            ';' => {
                self.advance();
                Ok(Token::Semicolon)
            }
            '.' => {
                self.advance();
                Ok(Token::Dot)
            }
            '+' => {
                self.advance();
                Ok(Token::Plus)
            }
            '-' => {
                self.advance();
                Ok(Token::Minus)
            }
            '*' => {
                self.advance();
                Ok(Token::Asterisk)
            }
            '/' => {
                self.advance();
                Ok(Token::Slash)
            }
            '%' => {
                self.advance();
                Ok(Token::Percent)
            }
            '=' => {
                self.advance();
                Ok(Token::Eq)
            }
            '<' => {
                self.advance();
                if !self.is_at_end() {
                    match self.current_char() {
                        '=' => {
                            self.advance();
                            return Ok(Token::Lte);
                        }
                        '>' => {
                            self.advance();
                            return Ok(Token::Neq);
                        }
                        _ => {}
                    }
                }
                Ok(Token::Lt)
            }
            '>' => {
                self.advance();
                if !self.is_at_end() && self.current_char() == '=' {
                    self.advance();
                    return Ok(Token::Gte);
                }
                Ok(Token::Gt)
            }
            '!' => {
                self.advance();
                if !self.is_at_end() && self.current_char() == '=' {
                    self.advance();
                    return Ok(Token::Neq);
                }
                Err(Error::UnexpectedCharacter('!', self.position))
            }
            '|' => {
                self.advance();
                if !self.is_at_end() && self.current_char() == '|' {
                    self.advance();
                    return Ok(Token::Concat);
                }
                Err(Error::UnexpectedCharacter('|', self.position))
            }
            '\'' => self.read_string(),
            '"' => self.read_quoted_identifier(),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_alphabetic() || c == '_' => self.read_word(),
            c => Err(Error::UnexpectedCharacter(c, self.position)),
        }
    }

    fn read_string(&mut self) -> Result<Token> {
        let start = self.position;
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            if self.is_at_end() {
                return Err(Error::UnterminatedString(start));
            }
            let ch = self.current_char();
            self.advance();
            if ch == '\'' {
                // Doubled quote escapes a single quote.
                if !self.is_at_end() && self.current_char() == '\'' {
                    value.push('\'');
                    self.advance();
                    continue;
                }
                return Ok(Token::StringLiteral(value));
            }
            value.push(ch);
        }
    }

    fn read_quoted_identifier(&mut self) -> Result<Token> {
        let start = self.position;
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            if self.is_at_end() {
                return Err(Error::UnterminatedString(start));
            }
            let ch = self.current_char();
            self.advance();
            if ch == '"' {
                return Ok(Token::Identifier(value));
            }
            value.push(ch);
        }
    }

    fn read_number(&mut self) -> Result<Token> {
        let start = self.position;
        let mut text = String::new();
        let mut is_decimal = false;

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else if ch == '.' && !is_decimal {
                // Only a digit after the dot makes this a decimal literal;
                // otherwise the dot belongs to a qualified name.
                if self
                    .peek_char()
                    .map(|c| c.is_ascii_digit())
                    .unwrap_or(false)
                {
                    is_decimal = true;
                    text.push(ch);
                    self.advance();
                } else {
                    break;
                }
            } else {
                break;
            }
        }

        if is_decimal {
            Ok(Token::DecimalLiteral(text))
        } else {
            text.parse::<i64>()
                .map(Token::IntegerLiteral)
                .map_err(|_| Error::InvalidNumber(start))
        }
    }

    fn read_word(&mut self) -> Result<Token> {
        let mut word = String::new();
        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_alphanumeric() || ch == '_' {
                word.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        Ok(Token::keyword(&word).unwrap_or(Token::Identifier(word)))
    }

    fn skip_whitespace(&mut self) {
        while !self.is_at_end() && self.current_char().is_whitespace() {
            self.advance();
        }
    }

    /// Skip one comment if present; returns true if anything was skipped.
    fn skip_comment(&mut self) -> bool {
        if self.current_char_is('-') && self.peek_char() == Some('-') {
            while !self.is_at_end() && self.current_char() != '\n' {
                self.advance();
            }
            return true;
        }
        if self.current_char_is('/') && self.peek_char() == Some('*') {
            self.advance();
            self.advance();
            while !self.is_at_end() {
                if self.current_char() == '*' && self.peek_char() == Some('/') {
                    self.advance();
                    self.advance();
                    break;
                }
                self.advance();
            }
            return true;
        }
        false
    }

    fn current_char(&self) -> char {
        self.input[self.position]
    }

    fn current_char_is(&self, c: char) -> bool {
        !self.is_at_end() && self.current_char() == c
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(sql: &str) -> Vec<Token> {
        Lexer::new(sql).tokenize().unwrap().0
    }

    #[test]
    fn test_simple_select() {
        let tokens = lex("SELECT * FROM students;");
        assert_eq!(
            tokens,
            vec![
                Token::Select,
                Token::Asterisk,
                Token::From,
                Token::Identifier("students".into()),
                Token::Semicolon,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = lex("42 3.14 0.5");
        assert_eq!(
            tokens,
            vec![
                Token::IntegerLiteral(42),
                Token::DecimalLiteral("3.14".into()),
                Token::DecimalLiteral("0.5".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_qualified_name_not_decimal() {
        let tokens = lex("s.dept_id");
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("s".into()),
                Token::Dot,
                Token::Identifier("dept_id".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_with_escaped_quote() {
        let tokens = lex("'it''s'");
        assert_eq!(tokens, vec![Token::StringLiteral("it's".into()), Token::Eof]);
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("'oops").tokenize();
        assert!(matches!(err, Err(Error::UnterminatedString(_))));
    }

    #[test]
    fn test_operators() {
        let tokens = lex("a <> b != c <= d >= e || f");
        assert!(tokens.contains(&Token::Neq));
        assert!(tokens.contains(&Token::Lte));
        assert!(tokens.contains(&Token::Gte));
        assert!(tokens.contains(&Token::Concat));
    }

    #[test]
    fn test_comments_skipped() {
        let tokens = lex("SELECT 1 -- trailing\n/* block */ + 2");
        assert_eq!(
            tokens,
            vec![
                Token::Select,
                Token::IntegerLiteral(1),
                Token::Plus,
                Token::IntegerLiteral(2),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_spans_point_at_token_starts() {
        let (tokens, spans) = Lexer::new("SELECT  name").tokenize().unwrap();
        assert_eq!(tokens[1], Token::Identifier("name".into()));
        assert_eq!(spans[1], 8);
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let tokens = lex("select FROM Where");
        assert_eq!(tokens[0], Token::Select);
        assert_eq!(tokens[1], Token::From);
        assert_eq!(tokens[2], Token::Where);
    }
}

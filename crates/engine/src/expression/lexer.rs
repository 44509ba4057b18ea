//! Tokenizer for condition, switch and filter expressions.

use crate::expression::ExpressionError;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Identifier(String),
    String(String),
    Number(f64),
    True,
    False,
    Null,
    In,
    Dot,
    OpenBracket,
    CloseBracket,
    OpenParen,
    CloseParen,
    Not,
    Minus,
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eof,
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.pos += 1;
            }
            let Some(ch) = self.peek() else {
                tokens.push(Token::Eof);
                return Ok(tokens);
            };
            let start = self.pos;
            let token = match ch {
                '.' => self.single(Token::Dot),
                '[' => self.single(Token::OpenBracket),
                ']' => self.single(Token::CloseBracket),
                '(' => self.single(Token::OpenParen),
                ')' => self.single(Token::CloseParen),
                '-' => self.single(Token::Minus),
                '!' => self.one_or_two('=', Token::NotEq, Token::Not),
                '<' => self.one_or_two('=', Token::LtEq, Token::Lt),
                '>' => self.one_or_two('=', Token::GtEq, Token::Gt),
                '=' => self.pair('=', Token::Eq, start)?,
                '&' => self.pair('&', Token::And, start)?,
                '|' => self.pair('|', Token::Or, start)?,
                '"' | '\'' => self.read_string(ch)?,
                c if c.is_ascii_digit() => self.read_number()?,
                c if c.is_alphabetic() || c == '_' || c == '$' => self.read_word(),
                other => {
                    return Err(ExpressionError::Syntax {
                        position: start,
                        message: format!("unexpected character '{}'", other),
                    })
                }
            };
            tokens.push(token);
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn single(&mut self, token: Token) -> Token {
        self.pos += 1;
        token
    }

    fn one_or_two(&mut self, second: char, two: Token, one: Token) -> Token {
        self.pos += 1;
        if self.peek() == Some(second) {
            self.pos += 1;
            two
        } else {
            one
        }
    }

    /// Operators that only exist doubled (`==`, `&&`, `||`).
    fn pair(&mut self, second: char, token: Token, start: usize) -> Result<Token, ExpressionError> {
        self.pos += 1;
        if self.peek() == Some(second) {
            self.pos += 1;
            Ok(token)
        } else {
            Err(ExpressionError::Syntax {
                position: start,
                message: format!("expected '{}{}'", second, second),
            })
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, ExpressionError> {
        let start = self.pos;
        self.pos += 1;
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            self.pos += 1;
            match ch {
                '\\' => {
                    if let Some(escaped) = self.peek() {
                        self.pos += 1;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                }
                c if c == quote => return Ok(Token::String(text)),
                c => text.push(c),
            }
        }
        Err(ExpressionError::Syntax {
            position: start,
            message: "unterminated string literal".to_string(),
        })
    }

    fn read_number(&mut self) -> Result<Token, ExpressionError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.' || c == '_')
        {
            self.pos += 1;
        }
        let text: String = self.input[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| ExpressionError::Syntax {
                position: start,
                message: format!("invalid number '{}'", text),
            })
    }

    fn read_word(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
        {
            self.pos += 1;
        }
        let word: String = self.input[start..self.pos].iter().collect();
        match word.as_str() {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "in" => Token::In,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Identifier(word),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_comparison_chain() {
        let tokens = Lexer::new("order.total >= 100 && tier != 'basic'")
            .tokenize()
            .unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("order".into()),
                Token::Dot,
                Token::Identifier("total".into()),
                Token::GtEq,
                Token::Number(100.0),
                Token::And,
                Token::Identifier("tier".into()),
                Token::NotEq,
                Token::String("basic".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn rejects_single_equals() {
        let err = Lexer::new("a = 1").tokenize().unwrap_err();
        assert!(err.to_string().contains("expected '=='"));
    }
}

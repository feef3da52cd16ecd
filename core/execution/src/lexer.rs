//! Tokenizer for the sandboxed script language.

use crate::types::ExecutionError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Keyword(Keyword),

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Colon,
    Dot,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PlusPlus,
    MinusMinus,

    EqEq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,

    AndAnd,
    OrOr,
    Bang,

    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Function,
    Return,
    Var,
    Let,
    Const,
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    True,
    False,
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ExecutionError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ExecutionError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(&c) = self.chars.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let kind = if c.is_ascii_digit() {
                self.number()?
            } else if c == '"' || c == '\'' {
                self.string(c)?
            } else if c.is_ascii_alphabetic() || c == '_' || c == '$' {
                self.ident_or_keyword()
            } else {
                self.punct()?
            };

            tokens.push(Token { kind, line, column });
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ExecutionError {
        ExecutionError::Syntax {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ExecutionError> {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    match lookahead.peek() {
                        Some('/') => {
                            while let Some(&c) = self.chars.peek() {
                                if c == '\n' {
                                    break;
                                }
                                self.bump();
                            }
                        }
                        Some('*') => {
                            self.bump();
                            self.bump();
                            loop {
                                match self.bump() {
                                    Some('*') if self.chars.peek() == Some(&'/') => {
                                        self.bump();
                                        break;
                                    }
                                    Some(_) => {}
                                    None => return Err(self.error("unterminated block comment")),
                                }
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn number(&mut self) -> Result<TokenKind, ExecutionError> {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E') && !text.is_empty() {
                text.push(c);
                self.bump();
                if let Some(&sign @ ('+' | '-')) = self.chars.peek() {
                    text.push(sign);
                    self.bump();
                }
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| self.error(format!("invalid number literal `{text}`")))
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, ExecutionError> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote => return Ok(TokenKind::Str(text)),
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some('\'') => text.push('\''),
                    Some('"') => text.push('"'),
                    Some(other) => {
                        return Err(self.error(format!("unknown escape `\\{other}`")))
                    }
                    None => return Err(self.error("unterminated string literal")),
                },
                Some('\n') => return Err(self.error("unterminated string literal")),
                Some(c) => text.push(c),
            }
        }
    }

    fn ident_or_keyword(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match text.as_str() {
            "function" => TokenKind::Keyword(Keyword::Function),
            "return" => TokenKind::Keyword(Keyword::Return),
            "var" => TokenKind::Keyword(Keyword::Var),
            "let" => TokenKind::Keyword(Keyword::Let),
            "const" => TokenKind::Keyword(Keyword::Const),
            "if" => TokenKind::Keyword(Keyword::If),
            "else" => TokenKind::Keyword(Keyword::Else),
            "while" => TokenKind::Keyword(Keyword::While),
            "for" => TokenKind::Keyword(Keyword::For),
            "break" => TokenKind::Keyword(Keyword::Break),
            "continue" => TokenKind::Keyword(Keyword::Continue),
            "true" => TokenKind::Keyword(Keyword::True),
            "false" => TokenKind::Keyword(Keyword::False),
            "null" => TokenKind::Keyword(Keyword::Null),
            _ => TokenKind::Ident(text),
        }
    }

    fn punct(&mut self) -> Result<TokenKind, ExecutionError> {
        let c = self.bump().ok_or_else(|| self.error("unexpected end of input"))?;
        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            '%' => TokenKind::Percent,
            '+' => {
                if self.eat('+') {
                    TokenKind::PlusPlus
                } else if self.eat('=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.eat('-') {
                    TokenKind::MinusMinus
                } else if self.eat('=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.eat('=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if self.eat('=') {
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }
            '=' => {
                if self.eat('=') {
                    if self.eat('=') {
                        TokenKind::StrictEq
                    } else {
                        TokenKind::EqEq
                    }
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.eat('=') {
                    if self.eat('=') {
                        TokenKind::StrictNotEq
                    } else {
                        TokenKind::NotEq
                    }
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.eat('=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.eat('&') {
                    TokenKind::AndAnd
                } else {
                    return Err(self.error("bitwise `&` is not supported"));
                }
            }
            '|' => {
                if self.eat('|') {
                    TokenKind::OrOr
                } else {
                    return Err(self.error("bitwise `|` is not supported"));
                }
            }
            other => return Err(self.error(format!("unexpected character `{other}`"))),
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds("let x = 1.5;"),
            vec![
                TokenKind::Keyword(Keyword::Let),
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Number(1.5),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            kinds(r#"'a\n' "b\"c""#),
            vec![
                TokenKind::Str("a\n".into()),
                TokenKind::Str("b\"c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_multi_char_operators() {
        assert_eq!(
            kinds("=== !== == != <= >= && || ++ +="),
            vec![
                TokenKind::StrictEq,
                TokenKind::StrictNotEq,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::PlusPlus,
                TokenKind::PlusAssign,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("1 // line\n/* block\nstill */ 2"),
            vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Eof]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("let x =\n  @").unwrap_err();
        match tokens {
            ExecutionError::Syntax { line, column, .. } => {
                assert_eq!(line, 2);
                assert_eq!(column, 4);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            tokenize("'oops"),
            Err(ExecutionError::Syntax { .. })
        ));
    }
}

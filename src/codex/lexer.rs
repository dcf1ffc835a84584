use crate::core::{KernelError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
    /// Statement terminator: newline or `;`
    Terminator,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' | ';' => {
                tokens.push(Token { kind: TokenKind::Terminator, line });
                if c == '\n' {
                    line += 1;
                }
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' | '\'' => {
                let (text, next, lines) = read_string(&chars, i, line)?;
                tokens.push(Token { kind: TokenKind::Str(text), line });
                line += lines;
                i = next;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
                if is_float {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let kind = if is_float {
                    TokenKind::Float(text.parse().map_err(|_| {
                        KernelError::ParseError(format!("Line {}: invalid number '{}'", line, text))
                    })?)
                } else {
                    TokenKind::Int(text.parse().map_err(|_| {
                        KernelError::ParseError(format!(
                            "Line {}: integer literal '{}' out of range",
                            line, text
                        ))
                    })?)
                };
                tokens.push(Token { kind, line });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(chars[start..i].iter().collect()),
                    line,
                });
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (kind, width) = match (c, next) {
                    ('=', Some('=')) => (TokenKind::EqEq, 2),
                    ('!', Some('=')) => (TokenKind::NotEq, 2),
                    ('<', Some('=')) => (TokenKind::Le, 2),
                    ('>', Some('=')) => (TokenKind::Ge, 2),
                    ('&', Some('&')) => (TokenKind::AndAnd, 2),
                    ('|', Some('|')) => (TokenKind::OrOr, 2),
                    ('=', _) => (TokenKind::Assign, 1),
                    ('!', _) => (TokenKind::Bang, 1),
                    ('<', _) => (TokenKind::Lt, 1),
                    ('>', _) => (TokenKind::Gt, 1),
                    ('(', _) => (TokenKind::LParen, 1),
                    (')', _) => (TokenKind::RParen, 1),
                    ('{', _) => (TokenKind::LBrace, 1),
                    ('}', _) => (TokenKind::RBrace, 1),
                    ('[', _) => (TokenKind::LBracket, 1),
                    (']', _) => (TokenKind::RBracket, 1),
                    (',', _) => (TokenKind::Comma, 1),
                    (':', _) => (TokenKind::Colon, 1),
                    ('.', _) => (TokenKind::Dot, 1),
                    ('+', _) => (TokenKind::Plus, 1),
                    ('-', _) => (TokenKind::Minus, 1),
                    ('*', _) => (TokenKind::Star, 1),
                    ('/', _) => (TokenKind::Slash, 1),
                    ('%', _) => (TokenKind::Percent, 1),
                    _ => {
                        return Err(KernelError::ParseError(format!(
                            "Line {}: unexpected character '{}'",
                            line, c
                        )));
                    }
                };
                tokens.push(Token { kind, line });
                i += width;
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, line });
    Ok(tokens)
}

/// Returns the decoded text, the index after the closing quote and the
/// number of newlines consumed.
fn read_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize, usize)> {
    let quote = chars[start];
    let mut text = String::new();
    let mut newlines = 0;
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((text, i + 1, newlines)),
            '\\' => {
                let escaped = chars.get(i + 1).copied().ok_or_else(|| {
                    KernelError::ParseError(format!("Line {}: unterminated string", line))
                })?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                });
                i += 2;
            }
            c => {
                if c == '\n' {
                    newlines += 1;
                }
                text.push(c);
                i += 1;
            }
        }
    }

    Err(KernelError::ParseError(format!(
        "Line {}: unterminated string",
        line
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokens_and_comments() {
        assert_eq!(
            kinds("let x = 1.5 # trailing\nx >= 2"),
            vec![
                TokenKind::Ident("let".into()),
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Float(1.5),
                TokenKind::Terminator,
                TokenKind::Ident("x".into()),
                TokenKind::Ge,
                TokenKind::Int(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes_and_lines() {
        let tokens = tokenize("'a\\'b'\n\"c\\n\"").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str("a'b".into()));
        assert_eq!(tokens[2].kind, TokenKind::Str("c\n".into()));
        assert_eq!(tokens[2].line, 2);
    }

    #[test]
    fn test_lex_errors_report_line() {
        let err = tokenize("let a = 1\nlet b = @").unwrap_err();
        assert_eq!(err, KernelError::ParseError("Line 2: unexpected character '@'".into()));
        assert!(tokenize("\"open").is_err());
    }
}

//! Lexical analysis for sandboxed expressions
//!
//! Pure function from source text to tokens. Every token remembers its byte
//! offset and whether a line break preceded it; the parser uses the latter to
//! split statements that are not separated by `;`.

use super::error::{EvalError, EvalResult};
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    String(String),
    Identifier(String),
    True,
    False,
    Null,
    Undefined,

    // Keywords
    Let,
    Return,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    Equal,
    NotEqual,
    StrictEqual,
    StrictNotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    Nullish,
    Question,
    OptionalDot,
    Arrow,

    // Punctuation
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Colon,
    Semicolon,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
    pub newline_before: bool,
}

type Chars<'a> = Peekable<CharIndices<'a>>;

/// Consume `next` if it follows, returning whether it did
fn eat(chars: &mut Chars, next: char) -> bool {
    if matches!(chars.peek(), Some((_, c)) if *c == next) {
        chars.next();
        true
    } else {
        false
    }
}

/// Parse operator and punctuation tokens, with lookahead for multi-char forms
fn parse_operator(ch: char, pos: usize, chars: &mut Chars) -> EvalResult<TokenKind> {
    let kind = match ch {
        '(' => TokenKind::LeftParen,
        ')' => TokenKind::RightParen,
        '[' => TokenKind::LeftBracket,
        ']' => TokenKind::RightBracket,
        '{' => TokenKind::LeftBrace,
        '}' => TokenKind::RightBrace,
        ',' => TokenKind::Comma,
        '.' => TokenKind::Dot,
        ':' => TokenKind::Colon,
        ';' => TokenKind::Semicolon,
        '+' => TokenKind::Plus,
        '-' => TokenKind::Minus,
        '*' => TokenKind::Star,
        '/' => TokenKind::Slash,
        '%' => TokenKind::Percent,
        '!' => {
            if eat(chars, '=') {
                if eat(chars, '=') {
                    TokenKind::StrictNotEqual
                } else {
                    TokenKind::NotEqual
                }
            } else {
                TokenKind::Bang
            }
        }
        '=' => {
            if eat(chars, '=') {
                if eat(chars, '=') {
                    TokenKind::StrictEqual
                } else {
                    TokenKind::Equal
                }
            } else if eat(chars, '>') {
                TokenKind::Arrow
            } else {
                TokenKind::Assign
            }
        }
        '<' => {
            if eat(chars, '=') {
                TokenKind::LessEqual
            } else {
                TokenKind::Less
            }
        }
        '>' => {
            if eat(chars, '=') {
                TokenKind::GreaterEqual
            } else {
                TokenKind::Greater
            }
        }
        '&' => {
            if eat(chars, '&') {
                TokenKind::And
            } else {
                return Err(EvalError::syntax("expected && but got single &", pos));
            }
        }
        '|' => {
            if eat(chars, '|') {
                TokenKind::Or
            } else {
                return Err(EvalError::syntax("expected || but got single |", pos));
            }
        }
        '?' => {
            if eat(chars, '?') {
                TokenKind::Nullish
            } else if matches!(chars.peek(), Some((_, '.'))) {
                chars.next();
                TokenKind::OptionalDot
            } else {
                TokenKind::Question
            }
        }
        other => {
            return Err(EvalError::syntax(
                format!("unexpected character '{}'", other),
                pos,
            ))
        }
    };
    Ok(kind)
}

/// Parse a quoted string literal; the opening quote is already consumed
fn parse_string(quote: char, start: usize, chars: &mut Chars) -> EvalResult<String> {
    let mut string = String::new();
    while let Some((_, ch)) = chars.next() {
        match ch {
            c if c == quote => return Ok(string),
            '\\' => match chars.next() {
                Some((_, 'n')) => string.push('\n'),
                Some((_, 't')) => string.push('\t'),
                Some((_, 'r')) => string.push('\r'),
                Some((_, other)) => string.push(other),
                None => break,
            },
            c => string.push(c),
        }
    }
    Err(EvalError::syntax("unterminated string literal", start))
}

/// Parse an unsigned numeric literal; unary minus is handled by the parser
fn parse_number(start: usize, chars: &mut Chars) -> EvalResult<f64> {
    let mut num_str = String::new();
    while let Some(&(_, ch)) = chars.peek() {
        if ch.is_ascii_digit() || ch == '.' || ch == '_' {
            if ch != '_' {
                num_str.push(ch);
            }
            chars.next();
        } else {
            break;
        }
    }
    num_str
        .parse::<f64>()
        .map_err(|_| EvalError::syntax(format!("invalid number: {}", num_str), start))
}

fn parse_identifier(chars: &mut Chars) -> String {
    let mut ident = String::new();
    while let Some(&(_, ch)) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' || ch == '$' {
            ident.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    ident
}

fn keyword_or_identifier(ident: String) -> TokenKind {
    match ident.as_str() {
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        "undefined" => TokenKind::Undefined,
        "const" | "let" | "var" => TokenKind::Let,
        "return" => TokenKind::Return,
        _ => TokenKind::Identifier(ident),
    }
}

/// Skip a `//` or `/* */` comment if one starts here
fn skip_comment(chars: &mut Chars, saw_newline: &mut bool) -> bool {
    let mut lookahead = chars.clone();
    lookahead.next();
    match lookahead.peek() {
        Some((_, '/')) => {
            for (_, c) in chars.by_ref() {
                if c == '\n' {
                    *saw_newline = true;
                    break;
                }
            }
            true
        }
        Some((_, '*')) => {
            chars.next();
            chars.next();
            let mut prev = '\0';
            for (_, c) in chars.by_ref() {
                if c == '\n' {
                    *saw_newline = true;
                }
                if prev == '*' && c == '/' {
                    break;
                }
                prev = c;
            }
            true
        }
        _ => false,
    }
}

/// Tokenize expression source into a sequence ending with `Eof`
pub fn tokenize(source: &str) -> EvalResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    let mut newline_before = false;

    while let Some(&(pos, ch)) = chars.peek() {
        let kind = match ch {
            '\n' => {
                chars.next();
                newline_before = true;
                continue;
            }
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '/' if skip_comment(&mut chars, &mut newline_before) => continue,
            '"' | '\'' | '`' => {
                chars.next();
                TokenKind::String(parse_string(ch, pos, &mut chars)?)
            }
            '0'..='9' => TokenKind::Number(parse_number(pos, &mut chars)?),
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                keyword_or_identifier(parse_identifier(&mut chars))
            }
            _ => {
                chars.next();
                parse_operator(ch, pos, &mut chars)?
            }
        };
        tokens.push(Token {
            kind,
            position: pos,
            newline_before,
        });
        newline_before = false;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: source.len(),
        newline_before,
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_comparison() {
        assert_eq!(
            kinds("a === 'x'"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::StrictEqual,
                TokenKind::String("x".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_tokenize_optional_chain_and_nullish() {
        assert_eq!(
            kinds("a?.b ?? 1"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::OptionalDot,
                TokenKind::Identifier("b".into()),
                TokenKind::Nullish,
                TokenKind::Number(1.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_tokenize_ternary() {
        assert_eq!(
            kinds("a ? b : 1"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Question,
                TokenKind::Identifier("b".into()),
                TokenKind::Colon,
                TokenKind::Number(1.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_tokenize_arrow_and_keywords() {
        assert_eq!(
            kinds("const x = y => y"),
            vec![
                TokenKind::Let,
                TokenKind::Identifier("x".into()),
                TokenKind::Assign,
                TokenKind::Identifier("y".into()),
                TokenKind::Arrow,
                TokenKind::Identifier("y".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n""#),
            vec![TokenKind::String("a\"b\n".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_newline_flag_and_comments() {
        let tokens = tokenize("a // trailing\nb /* block */ c").unwrap();
        assert!(!tokens[0].newline_before);
        assert!(tokens[1].newline_before);
        assert!(!tokens[2].newline_before);
        assert_eq!(tokens[2].kind, TokenKind::Identifier("c".into()));
    }

    #[test]
    fn test_single_ampersand_is_error() {
        let err = tokenize("a & b").unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("'open").unwrap_err().is_syntax());
    }
}

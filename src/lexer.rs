// File: src/lexer.rs
//
// Tokenizer for the Tmbdl language. Produces a flat token stream with
// line/column information for the parser and the chunk line tables.

use crate::errors::{SourceLocation, TmbdlError};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Number(f64),
    Str(String),
    /// Backtick template string, split into raw parts at `${ ... }` seams.
    /// Expression parts carry unparsed source; the parser finishes them.
    Template(Vec<RawTemplatePart>),
    Operator(String),
    Punctuation(char),
    Keyword(String),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawTemplatePart {
    Text(String),
    Expr(String),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

fn keyword(ident: &str) -> bool {
    matches!(
        ident,
        "ring"
            | "song"
            | "answer"
            | "sing"
            | "eyeof"
            | "wander"
            | "journey"
            | "in"
            | "perhaps"
            | "otherwise"
            | "flee"
            | "onwards"
            | "with"
            | "either"
            | "sauron"
            | "goldberry"
            | "nothing"
            | "summon"
            | "share"
            | "attempt"
            | "rescue"
            | "realm"
            | "inherits"
    )
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, TmbdlError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    let mut col = 1usize;

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
                col += 1;
            }
            '\n' => {
                chars.next();
                line += 1;
                col = 1;
            }
            '/' => {
                let start_col = col;
                chars.next();
                col += 1;
                match chars.peek() {
                    Some('/') => {
                        // line comment
                        for ch in chars.by_ref() {
                            if ch == '\n' {
                                line += 1;
                                col = 1;
                                break;
                            }
                        }
                    }
                    Some('=') => {
                        chars.next();
                        col += 1;
                        tokens.push(Token {
                            kind: TokenKind::Operator("/=".to_string()),
                            line,
                            column: start_col,
                        });
                    }
                    _ => tokens.push(Token {
                        kind: TokenKind::Operator("/".to_string()),
                        line,
                        column: start_col,
                    }),
                }
            }
            '"' => {
                let start_col = col;
                chars.next();
                col += 1;
                let mut s = String::new();
                let mut closed = false;
                while let Some(&ch) = chars.peek() {
                    chars.next();
                    col += 1;
                    if ch == '"' {
                        closed = true;
                        break;
                    }
                    if ch == '\n' {
                        line += 1;
                        col = 1;
                    }
                    if ch == '\\' {
                        if let Some(&esc) = chars.peek() {
                            chars.next();
                            col += 1;
                            match esc {
                                'n' => s.push('\n'),
                                't' => s.push('\t'),
                                '\\' => s.push('\\'),
                                '"' => s.push('"'),
                                _ => s.push(esc),
                            }
                        }
                    } else {
                        s.push(ch);
                    }
                }
                if !closed {
                    return Err(TmbdlError::parse_error(
                        "Unterminated string literal".to_string(),
                        SourceLocation::new(line, start_col),
                    ));
                }
                tokens.push(Token { kind: TokenKind::Str(s), line, column: start_col });
            }
            '`' => {
                let start_col = col;
                let start_line = line;
                chars.next();
                col += 1;
                let mut parts = Vec::new();
                let mut text = String::new();
                let mut closed = false;
                while let Some(&ch) = chars.peek() {
                    chars.next();
                    col += 1;
                    if ch == '`' {
                        closed = true;
                        break;
                    }
                    if ch == '\n' {
                        line += 1;
                        col = 1;
                        text.push(ch);
                        continue;
                    }
                    if ch == '$' && chars.peek() == Some(&'{') {
                        chars.next(); // consume '{'
                        col += 1;
                        parts.push(RawTemplatePart::Text(std::mem::take(&mut text)));
                        let mut expr = String::new();
                        let mut depth = 1usize;
                        for sub in chars.by_ref() {
                            col += 1;
                            if sub == '\n' {
                                line += 1;
                                col = 1;
                            }
                            if sub == '{' {
                                depth += 1;
                            } else if sub == '}' {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            expr.push(sub);
                        }
                        if depth != 0 {
                            return Err(TmbdlError::parse_error(
                                "Unterminated ${...} in template string".to_string(),
                                SourceLocation::new(line, start_col),
                            ));
                        }
                        parts.push(RawTemplatePart::Expr(expr));
                    } else if ch == '\\' {
                        if let Some(&esc) = chars.peek() {
                            chars.next();
                            col += 1;
                            match esc {
                                'n' => text.push('\n'),
                                't' => text.push('\t'),
                                '`' => text.push('`'),
                                '\\' => text.push('\\'),
                                '$' => text.push('$'),
                                _ => text.push(esc),
                            }
                        }
                    } else {
                        text.push(ch);
                    }
                }
                if !closed {
                    return Err(TmbdlError::parse_error(
                        "Unterminated template string".to_string(),
                        SourceLocation::new(start_line, start_col),
                    ));
                }
                if !text.is_empty() || parts.is_empty() {
                    parts.push(RawTemplatePart::Text(text));
                }
                tokens.push(Token {
                    kind: TokenKind::Template(parts),
                    line: start_line,
                    column: start_col,
                });
            }
            '0'..='9' => {
                let start_col = col;
                let mut num = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        num.push(ch);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }
                let parsed: f64 = num.parse().map_err(|_| {
                    TmbdlError::parse_error(
                        format!("Malformed number literal '{}'", num),
                        SourceLocation::new(line, start_col),
                    )
                })?;
                tokens.push(Token { kind: TokenKind::Number(parsed), line, column: start_col });
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start_col = col;
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }
                let kind = if keyword(&ident) {
                    TokenKind::Keyword(ident)
                } else {
                    TokenKind::Identifier(ident)
                };
                tokens.push(Token { kind, line, column: start_col });
            }
            '+' | '-' | '*' | '%' | '=' | '!' | '<' | '>' => {
                let start_col = col;
                chars.next();
                col += 1;
                let mut op = c.to_string();
                match (c, chars.peek()) {
                    ('+', Some('+')) | ('-', Some('-')) => {
                        op.push(c);
                        chars.next();
                        col += 1;
                    }
                    (_, Some('=')) => {
                        op.push('=');
                        chars.next();
                        col += 1;
                    }
                    _ => {}
                }
                tokens.push(Token { kind: TokenKind::Operator(op), line, column: start_col });
            }
            '(' | ')' | '{' | '}' | '[' | ']' | ',' | ';' | ':' | '.' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Punctuation(c), line, column: col });
                col += 1;
            }
            other => {
                return Err(TmbdlError::parse_error(
                    format!("Unexpected character '{}'", other),
                    SourceLocation::new(line, col),
                ));
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, line, column: col });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        let toks = kinds("ring f = makeCounter()");
        assert_eq!(toks[0], TokenKind::Keyword("ring".to_string()));
        assert_eq!(toks[1], TokenKind::Identifier("f".to_string()));
        assert_eq!(toks[2], TokenKind::Operator("=".to_string()));
        assert_eq!(toks[3], TokenKind::Identifier("makeCounter".to_string()));
    }

    #[test]
    fn compound_operators() {
        let toks = kinds("a += 1 b ++ c <= d == e !=");
        assert!(toks.contains(&TokenKind::Operator("+=".to_string())));
        assert!(toks.contains(&TokenKind::Operator("++".to_string())));
        assert!(toks.contains(&TokenKind::Operator("<=".to_string())));
        assert!(toks.contains(&TokenKind::Operator("==".to_string())));
        assert!(toks.contains(&TokenKind::Operator("!=".to_string())));
    }

    #[test]
    fn template_strings_split_into_parts() {
        let toks = kinds("`a${x}b`");
        match &toks[0] {
            TokenKind::Template(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], RawTemplatePart::Text("a".to_string()));
                assert_eq!(parts[1], RawTemplatePart::Expr("x".to_string()));
                assert_eq!(parts[2], RawTemplatePart::Text("b".to_string()));
            }
            other => panic!("expected template token, got {:?}", other),
        }
    }

    #[test]
    fn line_numbers_advance() {
        let toks = tokenize("ring a\nring b").unwrap();
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[2].line, 2);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(tokenize("\"abc").is_err());
    }
}

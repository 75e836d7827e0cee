use std::ops::Range;

use crate::expr::{BinaryOperator, Expr, FieldPath, UnaryOperator};
use crate::parser::error::ParseError;

// ---------------------------------------------------------------------------
// Token types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    // Literals
    Number(f64),
    StringLit(String),
    True,
    False,
    Null,

    // `$Field.Sub` or a bare `Field.Sub`
    Path(Vec<String>),

    // Keywords
    If,
    Unless,
    Not,

    // Operators
    Minus,
    Eq,     // =
    EqEq,   // ==
    BangEq, // !=
    Gt,
    Lt,
    GtEq,
    LtEq,
    AmpAmp, // &&
    PipePipe, // ||
    Bang,   // !
    Comma,

    // Grouping
    LParen,
    RParen,
}

type Spanned = (Token, Range<usize>);

/// Arguments of a `cached` tag: `[keys, ...] [(if|unless) condition]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheArguments {
    pub key_exprs: Vec<Expr>,
    pub condition: Option<Expr>,
    pub negated: bool,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a single expression, e.g. the argument of `if` or `loop`.
/// `base_offset` is the byte offset of `text` within the template source.
pub fn parse_expression(text: &str, base_offset: usize, file_id: usize) -> Result<Expr, ParseError> {
    let span = base_offset..base_offset + text.len();
    let tokens = tokenize(text, base_offset, file_id)?;
    let mut parser = ExprParser::new(tokens, span, file_id);
    let expr = parser.parse_expr(0)?;
    if !parser.at_end() {
        return Err(parser.error_at_current("unexpected tokens after expression"));
    }
    Ok(expr)
}

/// Parse the arguments of a `cached` / `cacheblock` tag.
pub fn parse_cache_arguments(
    text: &str,
    base_offset: usize,
    file_id: usize,
) -> Result<CacheArguments, ParseError> {
    let span = base_offset..base_offset + text.len();
    let tokens = tokenize(text, base_offset, file_id)?;
    let mut parser = ExprParser::new(tokens, span, file_id);

    let mut key_exprs = Vec::new();
    while !parser.at_end() && !matches!(parser.peek(), Some(Token::If | Token::Unless)) {
        key_exprs.push(parser.parse_expr(0)?);
        match parser.peek() {
            Some(Token::Comma) => {
                parser.advance();
            }
            Some(Token::If | Token::Unless) | None => break,
            Some(_) => return Err(parser.error_at_current("expected ',' between cache keys")),
        }
    }

    let (condition, negated) = match parser.advance() {
        Some((Token::If, _)) => (Some(parser.parse_expr(0)?), false),
        Some((Token::Unless, _)) => (Some(parser.parse_expr(0)?), true),
        Some(_) => return Err(parser.error("unexpected token in cache arguments")),
        None => (None, false),
    };

    if !parser.at_end() {
        return Err(parser.error_at_current("unexpected tokens after cache condition"));
    }

    Ok(CacheArguments {
        key_exprs,
        condition,
        negated,
    })
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

fn tokenize(text: &str, base_offset: usize, file_id: usize) -> Result<Vec<Spanned>, ParseError> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < len {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
            }

            // String literal, single or double quoted, with backslash escapes
            b'\'' | b'"' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                let mut closed = false;
                while i < len {
                    let ch = text[i..].chars().next().unwrap_or('\0');
                    if ch as u32 == quote as u32 {
                        i += 1;
                        closed = true;
                        break;
                    }
                    if ch == '\\' && i + 1 < len {
                        let next = text[i + 1..].chars().next().unwrap_or('\0');
                        s.push(next);
                        i += 1 + next.len_utf8();
                        continue;
                    }
                    s.push(ch);
                    i += ch.len_utf8();
                }
                if !closed {
                    return Err(ParseError::error(
                        "unterminated string literal",
                        base_offset + start..base_offset + len,
                        file_id,
                    ));
                }
                tokens.push((Token::StringLit(s), base_offset + start..base_offset + i));
            }

            b'0'..=b'9' => {
                while i < len && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let span = base_offset + start..base_offset + i;
                match text[start..i].parse::<f64>() {
                    Ok(n) => tokens.push((Token::Number(n), span)),
                    Err(_) => return Err(ParseError::error("invalid number literal", span, file_id)),
                }
            }

            // `$Field.Sub`
            b'$' => {
                i += 1;
                let segments = scan_path(text, &mut i);
                let span = base_offset + start..base_offset + i;
                if segments.is_empty() {
                    return Err(ParseError::error("expected field name after '$'", span, file_id));
                }
                tokens.push((Token::Path(segments), span));
            }

            // Keywords, or a bare field reference
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let segments = scan_path(text, &mut i);
                let span = base_offset + start..base_offset + i;
                let token = if segments.len() == 1 {
                    match segments[0].as_str() {
                        "true" => Token::True,
                        "false" => Token::False,
                        "null" => Token::Null,
                        "if" => Token::If,
                        "unless" => Token::Unless,
                        "not" => Token::Not,
                        _ => Token::Path(segments),
                    }
                } else {
                    Token::Path(segments)
                };
                tokens.push((token, span));
            }

            b'=' => {
                i += 1;
                if i < len && bytes[i] == b'=' {
                    i += 1;
                    tokens.push((Token::EqEq, base_offset + start..base_offset + i));
                } else {
                    tokens.push((Token::Eq, base_offset + start..base_offset + i));
                }
            }
            b'!' => {
                i += 1;
                if i < len && bytes[i] == b'=' {
                    i += 1;
                    tokens.push((Token::BangEq, base_offset + start..base_offset + i));
                } else {
                    tokens.push((Token::Bang, base_offset + start..base_offset + i));
                }
            }
            b'>' => {
                i += 1;
                if i < len && bytes[i] == b'=' {
                    i += 1;
                    tokens.push((Token::GtEq, base_offset + start..base_offset + i));
                } else {
                    tokens.push((Token::Gt, base_offset + start..base_offset + i));
                }
            }
            b'<' => {
                i += 1;
                if i < len && bytes[i] == b'=' {
                    i += 1;
                    tokens.push((Token::LtEq, base_offset + start..base_offset + i));
                } else {
                    tokens.push((Token::Lt, base_offset + start..base_offset + i));
                }
            }
            b'&' | b'|' => {
                i += 1;
                if i < len && bytes[i] == c {
                    i += 1;
                    let token = if c == b'&' { Token::AmpAmp } else { Token::PipePipe };
                    tokens.push((token, base_offset + start..base_offset + i));
                } else {
                    return Err(ParseError::error(
                        format!("unexpected '{}'", c as char),
                        base_offset + start..base_offset + i,
                        file_id,
                    )
                    .with_note("logical operators are written '&&' and '||'"));
                }
            }

            b'-' => { i += 1; tokens.push((Token::Minus, base_offset + start..base_offset + i)); }
            b',' => { i += 1; tokens.push((Token::Comma, base_offset + start..base_offset + i)); }
            b'(' => { i += 1; tokens.push((Token::LParen, base_offset + start..base_offset + i)); }
            b')' => { i += 1; tokens.push((Token::RParen, base_offset + start..base_offset + i)); }

            _ => {
                let ch = text[i..].chars().next().unwrap_or('?');
                return Err(ParseError::error(
                    format!("unexpected character '{}'", ch),
                    base_offset + start..base_offset + start + ch.len_utf8(),
                    file_id,
                ));
            }
        }
    }

    Ok(tokens)
}

/// Scan `Ident(.Ident)*` starting at `*i`, advancing past it.
fn scan_path(text: &str, i: &mut usize) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    loop {
        let start = *i;
        while *i < bytes.len() && (bytes[*i].is_ascii_alphanumeric() || bytes[*i] == b'_') {
            *i += 1;
        }
        if *i == start {
            break;
        }
        segments.push(text[start..*i].to_string());
        let continues = *i + 1 < bytes.len()
            && bytes[*i] == b'.'
            && (bytes[*i + 1].is_ascii_alphabetic() || bytes[*i + 1] == b'_');
        if !continues {
            break;
        }
        *i += 1;
    }
    segments
}

/// Length in bytes of a `$Field.Sub` reference at the start of `text`
/// (which must begin with `$`), or 0 if there is none.
pub(crate) fn field_reference_len(text: &str) -> usize {
    if !text.starts_with('$') {
        return 0;
    }
    let mut i = 1;
    let bytes = text.as_bytes();
    if i >= bytes.len() || !(bytes[i].is_ascii_alphabetic() || bytes[i] == b'_') {
        return 0;
    }
    scan_path(text, &mut i);
    i
}

// ---------------------------------------------------------------------------
// Pratt parser
// ---------------------------------------------------------------------------

struct ExprParser {
    tokens: Vec<Spanned>,
    pos: usize,
    span: Range<usize>,
    file_id: usize,
}

// Binding powers (precedence). Higher = tighter binding.
const BP_OR: u8 = 4;          // ||
const BP_AND: u8 = 6;         // &&
const BP_EQUALITY: u8 = 8;    // == = !=
const BP_COMPARISON: u8 = 10; // < > <= >=
const BP_UNARY: u8 = 16;      // ! not -

impl ExprParser {
    fn new(tokens: Vec<Spanned>, span: Range<usize>, file_id: usize) -> Self {
        ExprParser {
            tokens,
            pos: 0,
            span,
            file_id,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn error(&self, msg: impl Into<String>) -> ParseError {
        ParseError::error(msg, self.span.clone(), self.file_id)
    }

    fn error_at_current(&self, msg: impl Into<String>) -> ParseError {
        match self.tokens.get(self.pos) {
            Some((_, span)) => ParseError::error(msg, span.clone(), self.file_id),
            None => self.error(msg),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut left = self.parse_prefix()?;

        loop {
            let Some(token) = self.peek() else { break };
            let Some((l_bp, r_bp, operator)) = infix_bp(token) else { break };
            if l_bp < min_bp {
                break;
            }
            self.advance();
            let right = self.parse_expr(r_bp)?;
            left = Expr::BinaryOperation {
                operator,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ParseError> {
        let (token, span) = self
            .advance()
            .ok_or_else(|| self.error("unexpected end of expression"))?;

        match token {
            Token::Number(n) => Ok(Expr::NumberLiteral(n)),
            Token::StringLit(s) => Ok(Expr::StringLiteral(s)),
            Token::True => Ok(Expr::BooleanLiteral(true)),
            Token::False => Ok(Expr::BooleanLiteral(false)),
            Token::Null => Ok(Expr::Null),
            Token::Path(segments) => Ok(Expr::Path(FieldPath::new(segments), span)),

            Token::Bang | Token::Not => {
                let operand = self.parse_expr(BP_UNARY)?;
                Ok(Expr::UnaryOperation {
                    operator: UnaryOperator::LogicalNot,
                    operand: Box::new(operand),
                })
            }
            Token::Minus => {
                let operand = self.parse_expr(BP_UNARY)?;
                Ok(Expr::UnaryOperation {
                    operator: UnaryOperator::Negation,
                    operand: Box::new(operand),
                })
            }

            Token::LParen => {
                let expr = self.parse_expr(0)?;
                match self.advance() {
                    Some((Token::RParen, _)) => Ok(expr),
                    _ => Err(ParseError::error("expected ')'", span, self.file_id)),
                }
            }

            other => Err(ParseError::error(
                format!("unexpected token: {:?}", other),
                span,
                self.file_id,
            )),
        }
    }
}

/// Infix binding powers: (left_bp, right_bp, operator), or None if not infix.
fn infix_bp(token: &Token) -> Option<(u8, u8, BinaryOperator)> {
    match token {
        Token::PipePipe => Some((BP_OR, BP_OR + 1, BinaryOperator::LogicalOr)),
        Token::AmpAmp => Some((BP_AND, BP_AND + 1, BinaryOperator::LogicalAnd)),
        Token::EqEq | Token::Eq => Some((BP_EQUALITY, BP_EQUALITY + 1, BinaryOperator::Equality)),
        Token::BangEq => Some((BP_EQUALITY, BP_EQUALITY + 1, BinaryOperator::Inequality)),
        Token::Gt => Some((BP_COMPARISON, BP_COMPARISON + 1, BinaryOperator::GreaterThan)),
        Token::Lt => Some((BP_COMPARISON, BP_COMPARISON + 1, BinaryOperator::LessThan)),
        Token::GtEq => Some((BP_COMPARISON, BP_COMPARISON + 1, BinaryOperator::GreaterThanOrEqual)),
        Token::LtEq => Some((BP_COMPARISON, BP_COMPARISON + 1, BinaryOperator::LessThanOrEqual)),
        _ => None,
    }
}

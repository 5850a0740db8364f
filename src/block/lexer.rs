//! Source splitting and tokenizing.
//!
//! Source text is first split into logical lines (continuations inside
//! brackets are joined, comments and blank lines dropped) arranged as an
//! indentation tree. Each line is then tokenized on its own.

use crate::error::{FlowError, Result};
use std::fmt;

/// One logical line plus the indented block that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    pub number: usize,
    pub indent: usize,
    pub text: String,
    pub body: Vec<SourceLine>,
}

impl SourceLine {
    pub fn is_header(&self) -> bool {
        self.text.ends_with(':')
    }

    /// Render the line and its body, re-indenting children by four spaces.
    pub fn render(&self, indent: usize) -> String {
        let mut out = format!("{}{}", " ".repeat(indent), self.text);
        for child in &self.body {
            out.push('\n');
            out.push_str(&child.render(indent + 4));
        }
        out
    }
}

/// Split `source` into an indentation tree of logical lines.
pub fn logical_lines(source: &str) -> Result<Vec<SourceLine>> {
    let mut flat: Vec<(usize, usize, String)> = Vec::new();
    let mut pending: Option<(usize, usize, String)> = None;
    let mut depth: i32 = 0;

    for (index, raw) in source.lines().enumerate() {
        let number = index + 1;
        let code = strip_comment(raw);
        if pending.is_none() && code.trim().is_empty() {
            continue;
        }
        let line_depth = bracket_delta(code);
        match pending.as_mut() {
            Some((_, _, text)) => {
                text.push(' ');
                text.push_str(code.trim());
            }
            None => {
                let indent = code.len() - code.trim_start().len();
                if code[..indent].contains('\t') {
                    return Err(FlowError::Parse {
                        line: number,
                        message: "tabs are not allowed in indentation".to_string(),
                    });
                }
                pending = Some((number, indent, code.trim().to_string()));
            }
        }
        depth += line_depth;
        if depth <= 0 {
            depth = 0;
            if let Some(line) = pending.take() {
                flat.push(line);
            }
        }
    }
    if let Some((number, _, _)) = pending {
        return Err(FlowError::Parse {
            line: number,
            message: "unclosed bracket".to_string(),
        });
    }

    let mut position = 0;
    let lines = build_tree(&flat, &mut position, 0, None)?;
    Ok(lines)
}

fn build_tree(
    flat: &[(usize, usize, String)],
    position: &mut usize,
    indent: usize,
    parent: Option<usize>,
) -> Result<Vec<SourceLine>> {
    let mut out: Vec<SourceLine> = Vec::new();
    while let Some((number, line_indent, text)) = flat.get(*position) {
        if *line_indent < indent {
            break;
        }
        if *line_indent > indent {
            let header_ok = out
                .last()
                .is_some_and(|last| last.is_header() && last.body.is_empty());
            if !header_ok {
                return Err(FlowError::Parse {
                    line: *number,
                    message: "unexpected indent".to_string(),
                });
            }
            let child_indent = *line_indent;
            let body = build_tree(flat, position, child_indent, Some(*number))?;
            if let Some(last) = out.last_mut() {
                last.body = body;
            }
            continue;
        }
        if let Some(last) = out.last() {
            if last.is_header() && last.body.is_empty() {
                return Err(FlowError::Parse {
                    line: last.number,
                    message: "expected an indented block".to_string(),
                });
            }
        }
        out.push(SourceLine {
            number: *number,
            indent: *line_indent,
            text: text.clone(),
            body: Vec::new(),
        });
        *position += 1;
    }
    if let Some(last) = out.last() {
        if last.is_header() && last.body.is_empty() {
            return Err(FlowError::Parse {
                line: last.number,
                message: "expected an indented block".to_string(),
            });
        }
    }
    if parent.is_some() && out.is_empty() {
        return Err(FlowError::Parse {
            line: parent.unwrap_or_default(),
            message: "expected an indented block".to_string(),
        });
    }
    Ok(out)
}

fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '#' => return line[..i].trim_end(),
            None => {}
        }
    }
    line.trim_end()
}

fn bracket_delta(code: &str) -> i32 {
    let mut quote: Option<char> = None;
    let mut delta = 0;
    for c in code.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => delta += 1,
                ')' | ']' | '}' => delta -= 1,
                _ => {}
            },
        }
    }
    delta
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Name(n) => write!(f, "{n}"),
            Token::Int(i) => write!(f, "{i}"),
            Token::Float(v) => write!(f, "{v:?}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Op(op) => write!(f, "{op}"),
        }
    }
}

const OPERATORS: [&str; 23] = [
    "**", "//", "<=", ">=", "==", "!=", "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[",
    "]", ",", ":", ".", "{", "}",
];

/// Tokenize one logical line.
pub fn tokenize(text: &str, line: usize) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let error = |message: String| FlowError::Parse { line, message };

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Name(chars[start..i].iter().collect()));
            continue;
        }
        let starts_number = c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()));
        if starts_number {
            let start = i;
            let mut is_float = false;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_digit() || d == '_' {
                    i += 1;
                } else if d == '.' && !is_float {
                    is_float = true;
                    i += 1;
                } else if (d == 'e' || d == 'E')
                    && chars
                        .get(i + 1)
                        .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+')
                {
                    is_float = true;
                    i += 2;
                } else {
                    break;
                }
            }
            let literal: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let token = if is_float {
                literal
                    .parse::<f64>()
                    .map(Token::Float)
                    .map_err(|e| error(format!("bad number '{literal}': {e}")))?
            } else {
                literal
                    .parse::<i64>()
                    .map(Token::Int)
                    .map_err(|e| error(format!("bad number '{literal}': {e}")))?
            };
            tokens.push(token);
            continue;
        }
        if c == '\'' || c == '"' {
            let mut value = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let d = chars[i];
                if d == '\\' {
                    match chars.get(i + 1) {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some(other) => value.push(*other),
                        None => break,
                    }
                    i += 2;
                    continue;
                }
                if d == c {
                    closed = true;
                    i += 1;
                    break;
                }
                value.push(d);
                i += 1;
            }
            if !closed {
                return Err(error("unterminated string".to_string()));
            }
            tokens.push(Token::Str(value));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(op));
                i += op.len();
            }
            None => return Err(error(format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_lines_build_tree() {
        let source = "import numpy as np\n\nfor i in range(2):\n    a = f(i)  # note\n    b = g(a)\nc = h(\n    a,\n    b)\n";
        let lines = logical_lines(source).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].body.len(), 2);
        assert_eq!(lines[1].body[0].text, "a = f(i)");
        assert_eq!(lines[2].text, "c = h( a, b)");
    }

    #[test]
    fn test_unexpected_indent() {
        let err = logical_lines("a = 1\n    b = 2\n").unwrap_err();
        assert!(matches!(err, FlowError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("x = f(1.5e3, 'a#b', y // 2)", 1).unwrap();
        assert_eq!(tokens[0], Token::Name("x".into()));
        assert_eq!(tokens[1], Token::Op("="));
        assert_eq!(tokens[4], Token::Float(1500.0));
        assert_eq!(tokens[6], Token::Str("a#b".into()));
        assert!(tokens.contains(&Token::Op("//")));
    }

    #[test]
    fn test_comment_inside_string_is_kept() {
        let lines = logical_lines("s = 'a # b'").unwrap();
        assert_eq!(lines[0].text, "s = 'a # b'");
    }
}

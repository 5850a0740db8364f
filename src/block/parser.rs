//! Recursive-descent parser for block source.
//!
//! Lines the statement grammar does not cover are kept as raw general
//! expressions so that rendering reproduces them verbatim.

use super::ast::{Expr, Literal, UnaryOp};
use super::lexer::{logical_lines, tokenize, SourceLine, Token};
use super::statement::{
    Binding, FunctionCall, FunctionCallGroup, GeneralExpression, GeneralKind, Import, LocalFunction,
    LoopHeader, PreambleItem, Statement,
};
use crate::error::{FlowError, Result};
use crate::numeric::BinaryOp;
use tracing::debug;

const KEYWORDS: [&str; 17] = [
    "and", "or", "not", "in", "is", "for", "while", "if", "else", "elif", "def", "return",
    "import", "from", "as", "lambda", "pass",
];

/// Parsed block source: preamble items and top-level statements.
#[derive(Debug, Clone, Default)]
pub struct ParsedSource {
    pub preamble: Vec<PreambleItem>,
    pub statements: Vec<Statement>,
}

/// Parse complete block source.
pub fn parse_source(source: &str) -> Result<ParsedSource> {
    let mut parsed = ParsedSource::default();
    for line in logical_lines(source)? {
        let first = first_word(&line.text);
        match first {
            "import" | "from" => parsed.preamble.push(parse_import(&line)?),
            "def" => parsed.preamble.push(parse_def(&line)?),
            _ => parsed.statements.push(parse_statement(&line)),
        }
    }
    Ok(parsed)
}

/// Parse a standalone expression.
pub fn parse_expression(source: &str, line: usize) -> Result<Expr> {
    let tokens = tokenize(source, line)?;
    let mut stream = TokenStream::new(tokens, line);
    let expr = stream.expression()?;
    stream.expect_end()?;
    Ok(expr)
}

fn first_word(text: &str) -> &str {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .next()
        .unwrap_or_default()
}

fn raw(line: &SourceLine) -> Statement {
    Statement::General(GeneralExpression {
        source: line.render(0),
        line: line.number,
        kind: GeneralKind::Raw,
    })
}

/// Parse one statement line (with its body, for loop headers). Never fails:
/// unsupported constructs become raw statements.
pub(crate) fn parse_statement(line: &SourceLine) -> Statement {
    let parsed = if first_word(&line.text) == "for" && line.is_header() {
        parse_loop(line)
    } else if line.is_header() || !line.body.is_empty() {
        return raw(line);
    } else {
        parse_simple(line)
    };
    match parsed {
        Ok(statement) => statement,
        Err(e) => {
            debug!(line = line.number, error = %e, "keeping unsupported statement verbatim");
            raw(line)
        }
    }
}

fn parse_loop(line: &SourceLine) -> Result<Statement> {
    let tokens = tokenize(&line.text, line.number)?;
    let mut stream = TokenStream::new(tokens, line.number);
    stream.expect_keyword("for")?;
    let variable = stream.identifier()?;
    stream.expect_keyword("in")?;
    let iterable = stream.expression()?;
    stream.expect_op(":")?;
    stream.expect_end()?;
    let statements = line.body.iter().map(parse_statement).collect();
    Ok(Statement::Group(FunctionCallGroup {
        header: Some(LoopHeader { variable, iterable }),
        statements,
    }))
}

fn parse_simple(line: &SourceLine) -> Result<Statement> {
    let tokens = tokenize(&line.text, line.number)?;
    if let Some(Token::Name(word)) = tokens.first() {
        if KEYWORDS.contains(&word.as_str()) && word != "not" && word != "lambda" {
            return Err(FlowError::Parse {
                line: line.number,
                message: format!("unsupported statement '{word}'"),
            });
        }
    }
    let (targets, value_tokens) = match split_assignment(&tokens) {
        Some(at) => {
            let targets = parse_targets(&tokens[..at], line.number)?;
            (Some(targets), tokens[at + 1..].to_vec())
        }
        None => (None, tokens),
    };
    let mut stream = TokenStream::new(value_tokens, line.number);
    let value = stream.tuple_or_expression()?;
    stream.expect_end()?;

    if let Some(call) = as_function_call(&value, targets.as_deref()) {
        return Ok(Statement::Call(call));
    }
    let kind = match targets {
        Some(targets) => GeneralKind::Assign { targets, value },
        None => GeneralKind::Expr(value),
    };
    Ok(Statement::General(GeneralExpression {
        source: line.text.clone(),
        line: line.number,
        kind,
    }))
}

/// Position of a top-level `=`.
fn split_assignment(tokens: &[Token]) -> Option<usize> {
    let mut depth = 0i32;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Op("(" | "[" | "{") => depth += 1,
            Token::Op(")" | "]" | "}") => depth -= 1,
            Token::Op("=") if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_targets(tokens: &[Token], line: usize) -> Result<Vec<String>> {
    let mut stream = TokenStream::new(tokens.to_vec(), line);
    let parenthesized = stream.eat_op("(");
    let mut targets = vec![stream.dotted_name()?];
    while stream.eat_op(",") {
        if stream.peek().is_none() || stream.peek() == Some(&Token::Op(")")) {
            break;
        }
        targets.push(stream.dotted_name()?);
    }
    if parenthesized {
        stream.expect_op(")")?;
    }
    stream.expect_end()?;
    Ok(targets)
}

/// A call whose arguments are all literals or names.
fn as_function_call(value: &Expr, targets: Option<&[String]>) -> Option<FunctionCall> {
    let Expr::Call {
        function,
        args,
        kwargs,
    } = value
    else {
        return None;
    };
    let mut call = FunctionCall::new(function.clone());
    for arg in args {
        call = call.arg(simple_binding(arg)?);
    }
    for (name, arg) in kwargs {
        call = call.kwarg(name.clone(), simple_binding(arg)?);
    }
    for target in targets.unwrap_or_default() {
        call = call.output(target.clone());
    }
    Some(call)
}

fn simple_binding(expr: &Expr) -> Option<Binding> {
    match expr {
        Expr::Literal(lit) => Some(Binding::Literal(lit.clone())),
        Expr::Name(name) => Some(Binding::Name(name.clone())),
        _ => None,
    }
}

fn parse_import(line: &SourceLine) -> Result<PreambleItem> {
    let tokens = tokenize(&line.text, line.number)?;
    let mut stream = TokenStream::new(tokens, line.number);
    let mut imports = Vec::new();
    if stream.eat_keyword("import") {
        loop {
            let module = stream.dotted_name()?;
            let alias = if stream.eat_keyword("as") {
                stream.identifier()?
            } else {
                module.clone()
            };
            imports.push(Import::Module { module, alias });
            if !stream.eat_op(",") {
                break;
            }
        }
    } else {
        stream.expect_keyword("from")?;
        let module = stream.dotted_name()?;
        stream.expect_keyword("import")?;
        let parenthesized = stream.eat_op("(");
        loop {
            let name = stream.identifier()?;
            let alias = if stream.eat_keyword("as") {
                stream.identifier()?
            } else {
                name.clone()
            };
            imports.push(Import::Symbol {
                module: module.clone(),
                name,
                alias,
            });
            if !stream.eat_op(",") {
                break;
            }
        }
        if parenthesized {
            stream.expect_op(")")?;
        }
    }
    stream.expect_end()?;
    Ok(PreambleItem::Import {
        source: line.render(0),
        imports,
    })
}

fn parse_def(line: &SourceLine) -> Result<PreambleItem> {
    let tokens = tokenize(&line.text, line.number)?;
    let mut stream = TokenStream::new(tokens, line.number);
    stream.expect_keyword("def")?;
    let name = stream.identifier()?;
    stream.expect_op("(")?;
    let mut params = Vec::new();
    while !stream.eat_op(")") {
        params.push(stream.identifier()?);
        if !stream.eat_op(",") {
            stream.expect_op(")")?;
            break;
        }
    }
    stream.expect_op(":")?;
    stream.expect_end()?;

    let function = match compile_body(&line.body) {
        Ok((body, result)) => Some(LocalFunction {
            name: name.clone(),
            params,
            body,
            result,
        }),
        Err(e) => {
            debug!(function = %name, error = %e, "function body is not executable");
            None
        }
    };
    Ok(PreambleItem::Def {
        source: line.render(0),
        name,
        function,
    })
}

type FunctionBody = (Vec<(Vec<String>, Expr)>, Option<Expr>);

fn compile_body(lines: &[SourceLine]) -> Result<FunctionBody> {
    let mut body = Vec::new();
    let mut result = None;
    for (i, line) in lines.iter().enumerate() {
        let unsupported = || FlowError::Parse {
            line: line.number,
            message: "unsupported construct in function body".to_string(),
        };
        if !line.body.is_empty() || line.is_header() {
            return Err(unsupported());
        }
        let tokens = tokenize(&line.text, line.number)?;
        if tokens.first() == Some(&Token::Name("return".to_string())) {
            if i + 1 != lines.len() {
                return Err(unsupported());
            }
            let mut stream = TokenStream::new(tokens[1..].to_vec(), line.number);
            if stream.peek().is_some() {
                result = Some(stream.tuple_or_expression()?);
            }
            stream.expect_end()?;
            continue;
        }
        if tokens.first() == Some(&Token::Name("pass".to_string())) && tokens.len() == 1 {
            continue;
        }
        let at = split_assignment(&tokens).ok_or_else(unsupported)?;
        let targets = parse_targets(&tokens[..at], line.number)?;
        let mut stream = TokenStream::new(tokens[at + 1..].to_vec(), line.number);
        let value = stream.tuple_or_expression()?;
        stream.expect_end()?;
        body.push((targets, value));
    }
    Ok((body, result))
}

struct TokenStream {
    tokens: Vec<Token>,
    position: usize,
    line: usize,
}

impl TokenStream {
    fn new(tokens: Vec<Token>, line: usize) -> Self {
        Self {
            tokens,
            position: 0,
            line,
        }
    }

    fn error(&self, message: impl Into<String>) -> FlowError {
        FlowError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.position + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{op}'")))
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == word)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.is_keyword(word) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<()> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{word}'")))
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected '{token}'"))),
        }
    }

    fn unexpected(&self, expected: &str) -> FlowError {
        match self.peek() {
            Some(token) => self.error(format!("expected {expected}, found '{token}'")),
            None => self.error(format!("expected {expected}, found end of line")),
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Name(name)) if !KEYWORDS.contains(&name.as_str()) => {
                let name = name.clone();
                self.position += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn dotted_name(&mut self) -> Result<String> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    /// `a, b` without parentheses becomes a tuple.
    fn tuple_or_expression(&mut self) -> Result<Expr> {
        let first = self.expression()?;
        if !self.eat_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.peek().is_some() {
            items.push(self.expression()?);
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(Expr::Tuple(items))
    }

    fn expression(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat_keyword("or") {
            let rhs = self.and_expr()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.not_expr()?;
        while self.eat_keyword("and") {
            let rhs = self.not_expr()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison_op(&self) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Op("<")) => Some(BinaryOp::Lt),
            Some(Token::Op("<=")) => Some(BinaryOp::Le),
            Some(Token::Op(">")) => Some(BinaryOp::Gt),
            Some(Token::Op(">=")) => Some(BinaryOp::Ge),
            Some(Token::Op("==")) => Some(BinaryOp::Eq),
            Some(Token::Op("!=")) => Some(BinaryOp::Ne),
            _ => None,
        }
    }

    /// `a < b < c` folds into `a < b and b < c`.
    fn comparison(&mut self) -> Result<Expr> {
        let first = self.arith()?;
        let mut operands = vec![first];
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            self.position += 1;
            ops.push(op);
            operands.push(self.arith()?);
        }
        if self.is_keyword("in") || self.is_keyword("is") {
            return Err(self.error("membership and identity tests are not supported"));
        }
        if ops.is_empty() {
            return Ok(operands.remove(0));
        }
        let mut links = ops
            .iter()
            .zip(operands.windows(2))
            .map(|(op, pair)| binary(*op, pair[0].clone(), pair[1].clone()));
        let mut folded = links.next().ok_or_else(|| self.error("empty comparison"))?;
        for link in links {
            folded = binary(BinaryOp::And, folded, link);
        }
        Ok(folded)
    }

    fn arith(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.position += 1;
            let rhs = self.term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                Some(Token::Op("//")) => BinaryOp::FloorDiv,
                Some(Token::Op("%")) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.position += 1;
            let rhs = self.factor()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn factor(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(Token::Op("-")) => UnaryOp::Neg,
            Some(Token::Op("+")) => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.position += 1;
        let operand = self.factor()?;
        Ok(match (op, operand) {
            (UnaryOp::Neg, Expr::Literal(Literal::Int(i))) => Expr::Literal(Literal::Int(-i)),
            (UnaryOp::Neg, Expr::Literal(Literal::Float(v))) => Expr::Literal(Literal::Float(-v)),
            (op, operand) => Expr::Unary {
                op,
                operand: Box::new(operand),
            },
        })
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            let exponent = self.factor()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op(".") {
                let attr = self.identifier()?;
                expr = match expr {
                    Expr::Name(name) => Expr::Name(format!("{name}.{attr}")),
                    _ => return Err(self.error("attribute access is only supported on names")),
                };
            } else if self.eat_op("(") {
                let Expr::Name(function) = expr else {
                    return Err(self.error("only named functions can be called"));
                };
                let (args, kwargs) = self.call_arguments()?;
                expr = Expr::Call {
                    function,
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                let index = self.tuple_or_expression()?;
                self.expect_op("]")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.eat_op(")") {
            let keyword = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Name(name)), Some(Token::Op("="))) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.position += 2;
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expression()?);
            }
            if !self.eat_op(",") {
                self.expect_op(")")?;
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr> {
        let Some(token) = self.next() else {
            return Err(self.error("unexpected end of line"));
        };
        match token {
            Token::Int(i) => Ok(Expr::Literal(Literal::Int(i))),
            Token::Float(v) => Ok(Expr::Literal(Literal::Float(v))),
            Token::Str(mut s) => {
                while let Some(Token::Str(next)) = self.peek() {
                    s.push_str(next);
                    self.position += 1;
                }
                Ok(Expr::Literal(Literal::Str(s)))
            }
            Token::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Literal(Literal::Bool(true))),
                "False" => Ok(Expr::Literal(Literal::Bool(false))),
                "None" => Ok(Expr::Literal(Literal::None)),
                word if KEYWORDS.contains(&word) => {
                    Err(self.error(format!("unexpected keyword '{word}'")))
                }
                _ => Ok(Expr::Name(name)),
            },
            Token::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expression()?;
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.peek() == Some(&Token::Op(")")) {
                        break;
                    }
                    items.push(self.expression()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Token::Op("[") => {
                let mut items = Vec::new();
                while !self.eat_op("]") {
                    items.push(self.expression()?);
                    if !self.eat_op(",") {
                        self.expect_op("]")?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(self.error(format!("unexpected '{other}'"))),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

//! # Surface Parser
//!
//! Lexes and parses VoxLogicA source into the [`crate::ast`] types.
//! Handles let bindings, function definitions, scoped `let ... in ...`
//! expressions, `for ... in ... do ...` comprehensions, namespace imports,
//! `print`/`save` goals, infix arithmetic and `//` line comments.
//!
//! Infix operators desugar to their primitive names at parse time:
//! `a + b` becomes `addition(a, b)` and so on, leaving resolution (user
//! shadowing included) to the reducer.

use crate::ast::{Declaration, Expr, Goal, Program};
use thiserror::Error;

/// Parse failure with source position context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("parse error at line {line}, column {column}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        ParseError {
            message: message.into(),
            line,
            column,
        }
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    // Keywords
    Let,
    In,
    For,
    Do,
    Import,
    Print,
    Save,
    True,
    False,
    // Punctuation
    LParen,
    RParen,
    Comma,
    Dot,
    Equals,
    Plus,
    Minus,
    Star,
    Slash,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

fn keyword(word: &str) -> Option<TokenKind> {
    match word {
        "let" => Some(TokenKind::Let),
        "in" => Some(TokenKind::In),
        "for" => Some(TokenKind::For),
        "do" => Some(TokenKind::Do),
        "import" => Some(TokenKind::Import),
        "print" => Some(TokenKind::Print),
        "save" => Some(TokenKind::Save),
        "true" => Some(TokenKind::True),
        "false" => Some(TokenKind::False),
        _ => None,
    }
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if let Some(c) = c {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        c
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();

        while let Some(&c) = self.chars.peek() {
            let (line, column) = (self.line, self.column);

            if c.is_whitespace() {
                self.bump();
                continue;
            }

            // Line comments
            if c == '/' {
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if lookahead.peek() == Some(&'/') {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
            }

            let kind = match c {
                '(' => {
                    self.bump();
                    TokenKind::LParen
                }
                ')' => {
                    self.bump();
                    TokenKind::RParen
                }
                ',' => {
                    self.bump();
                    TokenKind::Comma
                }
                '.' => {
                    self.bump();
                    TokenKind::Dot
                }
                '=' => {
                    self.bump();
                    TokenKind::Equals
                }
                '+' => {
                    self.bump();
                    TokenKind::Plus
                }
                '-' => {
                    self.bump();
                    TokenKind::Minus
                }
                '*' => {
                    self.bump();
                    TokenKind::Star
                }
                '/' => {
                    self.bump();
                    TokenKind::Slash
                }
                '"' => {
                    self.bump();
                    let mut value = String::new();
                    loop {
                        match self.bump() {
                            Some('"') => break,
                            Some('\\') => match self.bump() {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some('\\') => value.push('\\'),
                                Some('"') => value.push('"'),
                                Some(other) => {
                                    return Err(ParseError::new(
                                        format!("unknown escape '\\{other}'"),
                                        line,
                                        column,
                                    ))
                                }
                                None => {
                                    return Err(ParseError::new(
                                        "unterminated string literal",
                                        line,
                                        column,
                                    ))
                                }
                            },
                            Some(other) => value.push(other),
                            None => {
                                return Err(ParseError::new(
                                    "unterminated string literal",
                                    line,
                                    column,
                                ))
                            }
                        }
                    }
                    TokenKind::Str(value)
                }
                c if c.is_ascii_digit() => {
                    let mut text = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                            // A dot is part of the number only when followed
                            // by a digit (so `1.method` style never arises).
                            if c == '.' {
                                let mut lookahead = self.chars.clone();
                                lookahead.next();
                                if !lookahead.peek().is_some_and(char::is_ascii_digit) {
                                    break;
                                }
                            }
                            text.push(c);
                            self.bump();
                            // Exponent sign
                            if (c == 'e' || c == 'E')
                                && matches!(self.chars.peek(), Some(&('+' | '-')))
                            {
                                if let Some(sign) = self.bump() {
                                    text.push(sign);
                                }
                            }
                        } else {
                            break;
                        }
                    }
                    let value: f64 = text.parse().map_err(|_| {
                        ParseError::new(format!("invalid number literal '{text}'"), line, column)
                    })?;
                    TokenKind::Number(value)
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut word = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_alphanumeric() || c == '_' {
                            word.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    keyword(&word).unwrap_or(TokenKind::Ident(word))
                }
                other => {
                    return Err(ParseError::new(
                        format!("unexpected character '{other}'"),
                        line,
                        column,
                    ))
                }
            };

            tokens.push(Token { kind, line, column });
        }

        Ok(tokens)
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn position(&self) -> (usize, usize) {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or((1, 1), |t| (t.line, t.column))
    }

    fn advance(&mut self) -> Option<TokenKind> {
        let token = self.tokens.get(self.pos).map(|t| t.kind.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let (line, column) = self.position();
        ParseError::new(message, line, column)
    }

    fn expect(&mut self, expected: &TokenKind, what: &str) -> Result<(), ParseError> {
        match self.peek() {
            Some(kind) if kind == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(kind) => Err(self.error(format!("expected {what}, found {kind:?}"))),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek() {
            Some(TokenKind::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            Some(kind) => Err(self.error(format!("expected {what}, found {kind:?}"))),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek() {
            Some(TokenKind::Str(value)) => {
                let value = value.clone();
                self.pos += 1;
                Ok(value)
            }
            Some(kind) => Err(self.error(format!("expected {what}, found {kind:?}"))),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut program = Program::new();

        while let Some(kind) = self.peek() {
            match kind {
                TokenKind::Import => {
                    self.pos += 1;
                    let namespace = self.expect_string("namespace string after 'import'")?;
                    program.add_declaration(Declaration::Import { namespace });
                }
                TokenKind::Let => {
                    self.pos += 1;
                    program.add_declaration(self.parse_let_declaration()?);
                }
                TokenKind::Print => {
                    self.pos += 1;
                    let label = self.expect_string("label string after 'print'")?;
                    let expr = self.parse_expr()?;
                    program.add_goal(Goal::Print { label, expr });
                }
                TokenKind::Save => {
                    self.pos += 1;
                    let path = self.expect_string("path string after 'save'")?;
                    let expr = self.parse_expr()?;
                    program.add_goal(Goal::Save { path, expr });
                }
                other => {
                    return Err(self.error(format!(
                        "expected declaration or goal, found {other:?}"
                    )))
                }
            }
        }

        Ok(program)
    }

    /// After the `let` keyword of a top-level declaration.
    fn parse_let_declaration(&mut self) -> Result<Declaration, ParseError> {
        let name = self.expect_ident("binding name after 'let'")?;

        let mut params = Vec::new();
        if self.peek() == Some(&TokenKind::LParen) {
            self.pos += 1;
            loop {
                params.push(self.expect_ident("parameter name")?);
                match self.advance() {
                    Some(TokenKind::Comma) => continue,
                    Some(TokenKind::RParen) => break,
                    _ => return Err(self.error("expected ',' or ')' in parameter list")),
                }
            }
        }

        self.expect(&TokenKind::Equals, "'=' in let declaration")?;
        let rhs = self.parse_expr()?;
        Ok(Declaration::Let { name, params, rhs })
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(TokenKind::Let) => {
                self.pos += 1;
                let name = self.expect_ident("binding name after 'let'")?;
                self.expect(&TokenKind::Equals, "'=' in let expression")?;
                let rhs = self.parse_expr()?;
                self.expect(&TokenKind::In, "'in' after let expression binding")?;
                let body = self.parse_expr()?;
                Ok(Expr::LetIn {
                    name,
                    rhs: Box::new(rhs),
                    body: Box::new(body),
                })
            }
            Some(TokenKind::For) => {
                self.pos += 1;
                let var = self.expect_ident("loop variable after 'for'")?;
                self.expect(&TokenKind::In, "'in' after loop variable")?;
                let iter = self.parse_expr()?;
                self.expect(&TokenKind::Do, "'do' after loop iterable")?;
                let body = self.parse_expr()?;
                Ok(Expr::For {
                    var,
                    iter: Box::new(iter),
                    body: Box::new(body),
                })
            }
            _ => self.parse_additive(),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => "addition",
                Some(TokenKind::Minus) => "subtraction",
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::call(op, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => "multiplication",
                Some(TokenKind::Slash) => "division",
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::call(op, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&TokenKind::Minus) {
            self.pos += 1;
            let operand = self.parse_unary()?;
            // Fold negation of literals, desugar the rest to a subtraction.
            if let Expr::Number(n) = operand {
                return Ok(Expr::Number(-n));
            }
            return Ok(Expr::call("subtraction", vec![Expr::Number(0.0), operand]));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Some(TokenKind::Number(value)) => Ok(Expr::Number(value)),
            Some(TokenKind::Str(value)) => Ok(Expr::String(value)),
            Some(TokenKind::True) => Ok(Expr::Boolean(true)),
            Some(TokenKind::False) => Ok(Expr::Boolean(false)),
            Some(TokenKind::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "')' closing parenthesized expression")?;
                Ok(expr)
            }
            Some(TokenKind::Ident(name)) => {
                // Qualified reference: ns.name
                let callee = if self.peek() == Some(&TokenKind::Dot) {
                    self.pos += 1;
                    let member = self.expect_ident("primitive name after '.'")?;
                    Expr::Qualified {
                        namespace: name,
                        name: member,
                    }
                } else {
                    Expr::Identifier(name)
                };

                if self.peek() == Some(&TokenKind::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() == Some(&TokenKind::RParen) {
                        self.pos += 1;
                    } else {
                        loop {
                            args.push(self.parse_expr()?);
                            match self.advance() {
                                Some(TokenKind::Comma) => continue,
                                Some(TokenKind::RParen) => break,
                                _ => {
                                    return Err(
                                        self.error("expected ',' or ')' in argument list")
                                    )
                                }
                            }
                        }
                    }
                    Ok(Expr::App {
                        callee: Box::new(callee),
                        args,
                    })
                } else {
                    Ok(callee)
                }
            }
            Some(other) => Err(self.error(format!("unexpected token {other:?}"))),
            None => Err(self.error("unexpected end of input")),
        }
    }
}

/// Parse a full program.
pub fn parse_program(source: &str) -> Result<Program, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_program()
}

/// Parse a single expression (REPL input that is not a declaration).
pub fn parse_expression(source: &str) -> Result<Expr, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing input after expression"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_let_value_and_goal() {
        let program = parse_program("let x = 5\nprint \"x\" x").expect("parse");
        assert_eq!(program.declarations.len(), 1);
        assert_eq!(program.goals.len(), 1);
    }

    #[test]
    fn test_parse_function_definition() {
        let program = parse_program("let inc(x) = x + 1").expect("parse");
        match &program.declarations[0] {
            Declaration::Let { name, params, rhs } => {
                assert_eq!(name, "inc");
                assert_eq!(params, &["x".to_string()]);
                assert_eq!(
                    rhs,
                    &Expr::call(
                        "addition",
                        vec![Expr::Identifier("x".to_string()), Expr::Number(1.0)]
                    )
                );
            }
            other => panic!("expected let declaration, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_precedence() {
        let program = parse_program("print \"v\" 1 + 2 * 3").expect("parse");
        let expr = program.goals[0].expr();
        assert_eq!(
            expr,
            &Expr::call(
                "addition",
                vec![
                    Expr::Number(1.0),
                    Expr::call(
                        "multiplication",
                        vec![Expr::Number(2.0), Expr::Number(3.0)]
                    ),
                ]
            )
        );
    }

    #[test]
    fn test_parse_nested_let_in() {
        let program =
            parse_program("let r = let x = 1 in let x = x + 10 in x + 5").expect("parse");
        match &program.declarations[0] {
            Declaration::Let { rhs, .. } => assert!(matches!(rhs, Expr::LetIn { .. })),
            other => panic!("expected let declaration, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_for_comprehension() {
        let program =
            parse_program("print \"out\" for x in range(0,5) do inc(x)").expect("parse");
        match program.goals[0].expr() {
            Expr::For { var, iter, body } => {
                assert_eq!(var, "x");
                assert!(matches!(**iter, Expr::App { .. }));
                assert!(matches!(**body, Expr::App { .. }));
            }
            other => panic!("expected for comprehension, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_qualified_call() {
        let program = parse_program("print \"sum\" default.addition(2,3)").expect("parse");
        match program.goals[0].expr() {
            Expr::App { callee, args } => {
                assert_eq!(**callee, Expr::qualified("default", "addition"));
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected qualified call, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_import_declaration() {
        let program = parse_program("import \"strings\"").expect("parse");
        assert_eq!(
            program.declarations[0],
            Declaration::Import {
                namespace: "strings".to_string()
            }
        );
    }

    #[test]
    fn test_parse_comments_and_whitespace() {
        let program = parse_program("// leading comment\nlet x = 1 // trailing\nprint \"x\" x")
            .expect("parse");
        assert_eq!(program.declarations.len(), 1);
        assert_eq!(program.goals.len(), 1);
    }

    #[test]
    fn test_parse_error_reports_position() {
        let err = parse_program("let = 5").expect_err("should fail");
        assert_eq!(err.line, 1);
        assert!(err.message.contains("binding name"));
    }

    #[test]
    fn test_parse_unary_minus_literal() {
        let expr = parse_expression("-4").expect("parse");
        assert_eq!(expr, Expr::Number(-4.0));
    }
}

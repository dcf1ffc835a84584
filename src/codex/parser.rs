use super::ast::{BinaryOp, CodexProgram, Expr, Statement, StmtKind, UnaryOp};
use super::builtins::is_builtin;
use super::lexer::{Token, TokenKind, tokenize};
use crate::core::{KernelError, Result, Value};

pub const DEFAULT_MAX_NESTING: usize = 64;

const KEYWORDS: &[&str] = &[
    "let", "set", "emit", "fail", "return", "if", "else", "repeat", "for", "in", "true", "false",
    "null",
];

/// Compiles codex source with the default nesting limit.
pub fn compile(source: &str) -> Result<CodexProgram> {
    compile_with_limit(source, DEFAULT_MAX_NESTING)
}

pub fn compile_with_limit(source: &str, max_nesting: usize) -> Result<CodexProgram> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        brackets: 0,
        nesting: 0,
        max_nesting,
    };
    let statements = parser.parse_block_body(true)?;
    check_calls(&statements)?;
    Ok(CodexProgram { statements })
}

/// Rejects calls to anything outside the builtin table.
fn check_calls(statements: &[Statement]) -> Result<()> {
    for statement in statements {
        let line = statement.line;
        match &statement.kind {
            StmtKind::Let { value, .. }
            | StmtKind::Assign { value, .. }
            | StmtKind::SetAttribute { value, .. }
            | StmtKind::Emit(value)
            | StmtKind::Fail(value)
            | StmtKind::Expr(value)
            | StmtKind::Return(Some(value)) => check_expr(value, line)?,
            StmtKind::Return(None) => {}
            StmtKind::If { condition, then_branch, else_branch } => {
                check_expr(condition, line)?;
                check_calls(then_branch)?;
                check_calls(else_branch)?;
            }
            StmtKind::Repeat { count, body } => {
                check_expr(count, line)?;
                check_calls(body)?;
            }
            StmtKind::ForIn { iterable, body, .. } => {
                check_expr(iterable, line)?;
                check_calls(body)?;
            }
        }
    }
    Ok(())
}

fn check_expr(expr: &Expr, line: usize) -> Result<()> {
    match expr {
        Expr::Literal(_) | Expr::Variable(_) => Ok(()),
        Expr::Array(items) => items.iter().try_for_each(|item| check_expr(item, line)),
        Expr::Object(fields) => fields.iter().try_for_each(|(_, value)| check_expr(value, line)),
        Expr::Member { object, .. } => check_expr(object, line),
        Expr::Index { object, index } => {
            check_expr(object, line)?;
            check_expr(index, line)
        }
        Expr::Call { function, args } => {
            if !is_builtin(function) {
                return Err(KernelError::ParseError(format!(
                    "Line {}: unknown function '{}'",
                    line, function
                )));
            }
            args.iter().try_for_each(|arg| check_expr(arg, line))
        }
        Expr::Unary { operand, .. } => check_expr(operand, line),
        Expr::Binary { left, right, .. } => {
            check_expr(left, line)?;
            check_expr(right, line)
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Open `(`, `[` and object-literal `{`; terminators are insignificant inside them.
    brackets: usize,
    nesting: usize,
    max_nesting: usize,
}

impl Parser {
    fn peek(&mut self) -> &TokenKind {
        if self.brackets > 0 {
            while self.tokens[self.pos].kind == TokenKind::Terminator {
                self.pos += 1;
            }
        }
        &self.tokens[self.pos].kind
    }

    fn line(&mut self) -> usize {
        self.peek();
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        self.peek();
        let token = self.tokens[self.pos].clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check(&mut self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn check_keyword(&mut self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(name) if name == keyword)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn error(&mut self, message: &str) -> KernelError {
        let line = self.line();
        let found = describe(&self.tokens[self.pos].kind);
        KernelError::ParseError(format!("Line {}: {}, found {}", line, message, found))
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(&format!("expected {}", what))),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.nesting += 1;
        if self.nesting > self.max_nesting {
            let line = self.line();
            return Err(KernelError::ParseError(format!(
                "Line {}: nesting deeper than {} levels",
                line, self.max_nesting
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    fn skip_terminators(&mut self) {
        while self.tokens[self.pos].kind == TokenKind::Terminator {
            self.pos += 1;
        }
    }

    /// Statements up to `}` (not consumed) or end of input.
    fn parse_block_body(&mut self, top_level: bool) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        loop {
            self.skip_terminators();
            match self.peek() {
                TokenKind::Eof if top_level => break,
                TokenKind::Eof => return Err(self.error("expected '}'")),
                TokenKind::RBrace if !top_level => break,
                TokenKind::RBrace => return Err(self.error("unexpected '}'")),
                _ => {}
            }

            statements.push(self.parse_statement()?);

            match self.peek() {
                TokenKind::Terminator => {
                    self.advance();
                }
                TokenKind::Eof => {}
                TokenKind::RBrace if !top_level => {}
                _ => return Err(self.error("expected end of statement")),
            }
        }
        Ok(statements)
    }

    fn parse_block(&mut self) -> Result<Vec<Statement>> {
        self.expect(TokenKind::LBrace, "'{'")?;
        self.enter()?;
        let body = self.parse_block_body(false)?;
        self.leave();
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        let line = self.line();
        let keyword = match self.peek() {
            TokenKind::Ident(name) => name.clone(),
            _ => String::new(),
        };

        let kind = match keyword.as_str() {
            "let" => {
                self.advance();
                let name = self.expect_identifier("variable name after 'let'")?;
                self.expect(TokenKind::Assign, "'='")?;
                StmtKind::Let { name, value: self.parse_expression()? }
            }
            "set" => {
                self.advance();
                if !self.check_keyword("entity") {
                    return Err(self.error("expected 'entity' after 'set'"));
                }
                self.advance();
                self.expect(TokenKind::Dot, "'.'")?;
                let attribute = match self.advance().kind {
                    TokenKind::Ident(name) => name,
                    _ => {
                        return Err(KernelError::ParseError(format!(
                            "Line {}: expected attribute name after 'entity.'",
                            line
                        )));
                    }
                };
                self.expect(TokenKind::Assign, "'='")?;
                StmtKind::SetAttribute { attribute, value: self.parse_expression()? }
            }
            "emit" => {
                self.advance();
                StmtKind::Emit(self.parse_expression()?)
            }
            "fail" => {
                self.advance();
                StmtKind::Fail(self.parse_expression()?)
            }
            "return" => {
                self.advance();
                match self.peek() {
                    TokenKind::Terminator | TokenKind::RBrace | TokenKind::Eof => {
                        StmtKind::Return(None)
                    }
                    _ => StmtKind::Return(Some(self.parse_expression()?)),
                }
            }
            "if" => self.parse_if()?,
            "repeat" => {
                self.advance();
                let count = self.parse_expression()?;
                StmtKind::Repeat { count, body: self.parse_block()? }
            }
            "for" => {
                self.advance();
                let var = self.expect_identifier("loop variable after 'for'")?;
                if !self.check_keyword("in") {
                    return Err(self.error("expected 'in'"));
                }
                self.advance();
                let iterable = self.parse_expression()?;
                StmtKind::ForIn { var, iterable, body: self.parse_block()? }
            }
            "else" => return Err(self.error("'else' without 'if'")),
            _ => {
                let is_assignment = !keyword.is_empty()
                    && !KEYWORDS.contains(&keyword.as_str())
                    && self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::Assign);
                if is_assignment {
                    self.advance();
                    self.advance();
                    StmtKind::Assign { name: keyword, value: self.parse_expression()? }
                } else {
                    StmtKind::Expr(self.parse_expression()?)
                }
            }
        };

        Ok(Statement { line, kind })
    }

    fn parse_if(&mut self) -> Result<StmtKind> {
        self.advance();
        let condition = self.parse_expression()?;
        let then_branch = self.parse_block()?;

        // `else` may sit on the line after the closing brace.
        let resume = self.pos;
        self.skip_terminators();
        if !self.check_keyword("else") {
            self.pos = resume;
            return Ok(StmtKind::If { condition, then_branch, else_branch: Vec::new() });
        }
        self.advance();

        let else_branch = if self.check_keyword("if") {
            let line = self.line();
            self.enter()?;
            let nested = self.parse_if()?;
            self.leave();
            vec![Statement { line, kind: nested }]
        } else {
            self.parse_block()?
        };
        Ok(StmtKind::If { condition, then_branch, else_branch })
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        self.enter()?;
        let expr = self.parse_or();
        self.leave();
        expr
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Negate,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary();
        self.leave();
        Ok(Expr::Unary { op, operand: Box::new(operand?) })
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let field = match self.advance().kind {
                    TokenKind::Ident(name) => name,
                    _ => return Err(self.error("expected field name after '.'")),
                };
                expr = Expr::Member { object: Box::new(expr), field };
            } else if self.check(&TokenKind::LBracket) {
                self.advance();
                self.brackets += 1;
                let index = self.parse_expression();
                let closed = index.is_ok() && self.check(&TokenKind::RBracket);
                self.brackets -= 1;
                let index = index?;
                if !closed {
                    return Err(self.error("expected ']'"));
                }
                self.advance();
                expr = Expr::Index { object: Box::new(expr), index: Box::new(index) };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::Int(n) => Ok(Expr::Literal(Value::from(n))),
            TokenKind::Float(f) => Ok(Expr::Literal(
                serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            )),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                keyword if KEYWORDS.contains(&keyword) => Err(KernelError::ParseError(format!(
                    "Line {}: unexpected keyword '{}'",
                    token.line, keyword
                ))),
                _ if self.check(&TokenKind::LParen) => {
                    self.advance();
                    let args = self.parse_list(TokenKind::RParen, "')'")?;
                    Ok(Expr::Call { function: name, args })
                }
                _ => Ok(Expr::Variable(name)),
            },
            TokenKind::LParen => {
                self.brackets += 1;
                let inner = self.parse_expression();
                let closed = inner.is_ok() && self.check(&TokenKind::RParen);
                self.brackets -= 1;
                let inner = inner?;
                if !closed {
                    return Err(self.error("expected ')'"));
                }
                self.advance();
                Ok(inner)
            }
            TokenKind::LBracket => Ok(Expr::Array(self.parse_list(TokenKind::RBracket, "']'")?)),
            TokenKind::LBrace => self.parse_object(),
            other => Err(KernelError::ParseError(format!(
                "Line {}: expected expression, found {}",
                token.line,
                describe(&other)
            ))),
        }
    }

    /// Comma-separated expressions; the opening bracket is already consumed.
    fn parse_list(&mut self, close: TokenKind, what: &str) -> Result<Vec<Expr>> {
        self.brackets += 1;
        let items = self.parse_list_items(&close);
        let closed = items.is_ok() && self.check(&close);
        self.brackets -= 1;
        let items = items?;
        if !closed {
            return Err(self.error(&format!("expected {}", what)));
        }
        self.advance();
        Ok(items)
    }

    fn parse_list_items(&mut self, close: &TokenKind) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(self.parse_expression()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(items)
    }

    fn parse_object(&mut self) -> Result<Expr> {
        self.brackets += 1;
        let fields = self.parse_object_fields();
        let closed = fields.is_ok() && self.check(&TokenKind::RBrace);
        self.brackets -= 1;
        let fields = fields?;
        if !closed {
            return Err(self.error("expected '}'"));
        }
        self.advance();
        Ok(Expr::Object(fields))
    }

    fn parse_object_fields(&mut self) -> Result<Vec<(String, Expr)>> {
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let key = match self.advance().kind {
                TokenKind::Ident(name) | TokenKind::Str(name) => name,
                _ => return Err(self.error("expected object key")),
            };
            self.expect(TokenKind::Colon, "':'")?;
            fields.push((key, self.parse_expression()?));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(fields)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("'{}'", name),
        TokenKind::Int(n) => n.to_string(),
        TokenKind::Float(f) => f.to_string(),
        TokenKind::Str(_) => "string".to_string(),
        TokenKind::Terminator => "end of line".to_string(),
        TokenKind::Eof => "end of input".to_string(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let program = compile("return 1 + 2 * 3 == 7 && !false").unwrap();
        let StmtKind::Return(Some(Expr::Binary { op, left, .. })) = &program.statements[0].kind else {
            panic!("expected return of binary expression");
        };
        assert_eq!(*op, BinaryOp::And);
        assert!(matches!(**left, Expr::Binary { op: BinaryOp::Eq, .. }));
    }

    #[test]
    fn test_statements_and_lines() {
        let source = r#"
            # greet the new member
            let greeting = format("hi {}", entity.name)
            if len(greeting) > 3 {
                emit greeting
            } else {
                fail "too short"
            }
            for tag in ["a", "b"] { emit tag }
            set entity.greeted = true; return
        "#;
        let program = compile(source).unwrap();
        assert_eq!(program.statements.len(), 5);
        assert_eq!(program.statements[0].line, 3);
        assert!(matches!(program.statements[1].kind, StmtKind::If { .. }));
        assert!(matches!(program.statements[3].kind, StmtKind::SetAttribute { .. }));
        assert!(matches!(program.statements[4].kind, StmtKind::Return(None)));
    }

    #[test]
    fn test_multiline_literals() {
        let program = compile("let o = {\n  a: 1,\n  \"b\": [1,\n 2]\n}\nreturn o").unwrap();
        assert_eq!(program.statements.len(), 2);
    }

    #[test]
    fn test_else_on_next_line() {
        let program = compile("if x {\n emit 1\n}\nelse if y {\n emit 2\n}").unwrap();
        let StmtKind::If { else_branch, .. } = &program.statements[0].kind else {
            panic!("expected if");
        };
        assert_eq!(else_branch.len(), 1);
    }

    #[test]
    fn test_parse_errors_name_line() {
        let err = compile("let a = 1\nlet = 2").unwrap_err();
        match err {
            KernelError::ParseError(message) => assert!(message.starts_with("Line 2:"), "{}", message),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(compile("if x { emit 1").is_err());
        assert!(compile("emit 1 2").is_err());
        assert!(compile("}").is_err());
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = compile("emit 1\nemit system(\"rm\")").unwrap_err();
        assert_eq!(err, KernelError::ParseError("Line 2: unknown function 'system'".into()));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("return {}1{}", "(".repeat(10), ")".repeat(10));
        assert!(compile_with_limit(&deep, 32).is_ok());
        assert!(compile_with_limit(&deep, 5).is_err());
    }
}

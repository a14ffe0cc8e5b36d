// File: src/parser.rs
//
// Recursive-descent parser for the Tmbdl language. Builds the AST the
// bytecode compiler consumes. Precedence, lowest to highest:
// assignment, `either`, `with`, equality, comparison, additive,
// multiplicative, unary, postfix (call/index/property/update), primary.

use crate::ast::{
    BinaryOp, Expr, ExprKind, FunctionLiteral, LogicalOp, Stmt, StmtKind, TemplatePart, UnaryOp,
    UpdateOp,
};
use crate::errors::{SourceLocation, TmbdlError};
use crate::lexer::{tokenize, RawTemplatePart, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn line(&self) -> u16 {
        self.tokens.get(self.pos).map(|t| t.line as u16).unwrap_or(0)
    }

    fn location(&self) -> SourceLocation {
        self.tokens
            .get(self.pos)
            .map(|t| SourceLocation::new(t.line, t.column))
            .unwrap_or_else(SourceLocation::unknown)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        self.pos += 1;
        kind
    }

    fn check_punct(&self, p: char) -> bool {
        matches!(self.peek(), TokenKind::Punctuation(c) if *c == p)
    }

    fn check_operator(&self, op: &str) -> bool {
        matches!(self.peek(), TokenKind::Operator(o) if o == op)
    }

    fn check_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if k == kw)
    }

    fn match_punct(&mut self, p: char) -> bool {
        if self.check_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn match_keyword(&mut self, kw: &str) -> bool {
        if self.check_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: char, context: &str) -> Result<(), TmbdlError> {
        if self.match_punct(p) {
            Ok(())
        } else {
            Err(TmbdlError::parse_error(
                format!("Expected '{}' {}", p, context),
                self.location(),
            ))
        }
    }

    fn expect_identifier(&mut self, context: &str) -> Result<String, TmbdlError> {
        match self.peek() {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            other => Err(TmbdlError::parse_error(
                format!("Expected identifier {}, found {:?}", context, other),
                self.location(),
            )),
        }
    }

    pub fn parse(&mut self) -> Result<Vec<Stmt>, TmbdlError> {
        let mut stmts = Vec::new();
        while !matches!(self.peek(), TokenKind::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        let stmt = match self.peek() {
            TokenKind::Keyword(k) => match k.as_str() {
                "ring" => self.parse_let()?,
                "song" => self.parse_func_def()?,
                "answer" => self.parse_return()?,
                "perhaps" => self.parse_if()?,
                "wander" => self.parse_while()?,
                "journey" => self.parse_for()?,
                "flee" => {
                    self.pos += 1;
                    Stmt::new(StmtKind::Break, line)
                }
                "onwards" => {
                    self.pos += 1;
                    Stmt::new(StmtKind::Continue, line)
                }
                "sing" => {
                    self.pos += 1;
                    let expr = self.parse_expr()?;
                    Stmt::new(StmtKind::Print(expr), line)
                }
                "eyeof" => self.parse_debug()?,
                "share" => self.parse_export()?,
                "attempt" => self.parse_try()?,
                "realm" => self.parse_class()?,
                _ => Stmt::new(StmtKind::ExprStmt(self.parse_expr()?), line),
            },
            TokenKind::Punctuation('{') => Stmt::new(StmtKind::Block(self.parse_block()?), line),
            _ => Stmt::new(StmtKind::ExprStmt(self.parse_expr()?), line),
        };
        // Semicolons are optional statement separators
        self.match_punct(';');
        Ok(stmt)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, TmbdlError> {
        self.expect_punct('{', "to open a block")?;
        let mut stmts = Vec::new();
        while !self.check_punct('}') && !matches!(self.peek(), TokenKind::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        self.expect_punct('}', "to close a block")?;
        Ok(stmts)
    }

    fn parse_let(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // ring
        let name = self.expect_identifier("after 'ring'")?;
        let init = if self.check_operator("=") {
            self.pos += 1;
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Stmt::new(StmtKind::Let { name, init }, line))
    }

    fn parse_func_literal(&mut self, name: String) -> Result<FunctionLiteral, TmbdlError> {
        let line = self.line();
        self.expect_punct('(', "after song name")?;
        let mut params = Vec::new();
        if !self.check_punct(')') {
            loop {
                params.push(self.expect_identifier("as parameter name")?);
                if !self.match_punct(',') {
                    break;
                }
            }
        }
        self.expect_punct(')', "after parameters")?;
        let body = self.parse_block()?;
        Ok(FunctionLiteral { name, params, body, line })
    }

    fn parse_func_def(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // song
        if let TokenKind::Identifier(name) = self.peek() {
            let name = name.clone();
            self.pos += 1;
            let literal = self.parse_func_literal(name)?;
            Ok(Stmt::new(StmtKind::FuncDef(literal), line))
        } else {
            // anonymous song in statement position is just an expression
            let literal = self.parse_func_literal("<lambda>".to_string())?;
            Ok(Stmt::new(
                StmtKind::ExprStmt(Expr::new(ExprKind::Lambda(literal), line)),
                line,
            ))
        }
    }

    fn parse_return(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // answer
        let value = if self.check_punct(';')
            || self.check_punct('}')
            || matches!(self.peek(), TokenKind::Eof)
        {
            None
        } else {
            Some(self.parse_expr()?)
        };
        Ok(Stmt::new(StmtKind::Return(value), line))
    }

    fn parse_if(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // perhaps
        self.expect_punct('(', "after 'perhaps'")?;
        let condition = self.parse_expr()?;
        self.expect_punct(')', "after condition")?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.match_keyword("otherwise") {
            if self.check_keyword("perhaps") {
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(Stmt::new(StmtKind::If { condition, then_branch, else_branch }, line))
    }

    fn parse_while(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // wander
        self.expect_punct('(', "after 'wander'")?;
        let condition = self.parse_expr()?;
        self.expect_punct(')', "after condition")?;
        let body = self.parse_block()?;
        Ok(Stmt::new(StmtKind::While { condition, body }, line))
    }

    fn parse_for(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // journey
        self.expect_punct('(', "after 'journey'")?;
        let var = self.expect_identifier("as loop variable")?;
        if !self.match_keyword("in") {
            return Err(TmbdlError::parse_error(
                "Expected 'in' after journey variable".to_string(),
                self.location(),
            ));
        }
        let iterable = self.parse_expr()?;
        self.expect_punct(')', "after journey iterable")?;
        let body = self.parse_block()?;
        Ok(Stmt::new(StmtKind::For { var, iterable, body }, line))
    }

    fn parse_debug(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // eyeof
        self.expect_punct('(', "after 'eyeof'")?;
        let label = self.parse_expr()?;
        self.expect_punct(',', "between eyeof label and value")?;
        let value = self.parse_expr()?;
        self.expect_punct(')', "after eyeof arguments")?;
        Ok(Stmt::new(StmtKind::Debug { label, value }, line))
    }

    fn parse_export(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // share
        let name = self.expect_identifier("after 'share'")?;
        if !self.check_operator("=") {
            return Err(TmbdlError::parse_error(
                "Expected '=' after share name".to_string(),
                self.location(),
            ));
        }
        self.pos += 1;
        let value = self.parse_expr()?;
        Ok(Stmt::new(StmtKind::Export { name, value }, line))
    }

    fn parse_try(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // attempt
        let try_block = self.parse_block()?;
        if !self.match_keyword("rescue") {
            return Err(TmbdlError::parse_error(
                "Expected 'rescue' after attempt block".to_string(),
                self.location(),
            ));
        }
        self.expect_punct('(', "after 'rescue'")?;
        let rescue_var = self.expect_identifier("as rescue binding")?;
        self.expect_punct(')', "after rescue binding")?;
        let rescue_block = self.parse_block()?;
        Ok(Stmt::new(StmtKind::Try { try_block, rescue_var, rescue_block }, line))
    }

    fn parse_class(&mut self) -> Result<Stmt, TmbdlError> {
        let line = self.line();
        self.pos += 1; // realm
        let name = self.expect_identifier("after 'realm'")?;
        let parent = if self.match_keyword("inherits") {
            Some(self.expect_identifier("after 'inherits'")?)
        } else {
            None
        };
        self.expect_punct('{', "to open realm body")?;
        let mut methods = Vec::new();
        while !self.check_punct('}') && !matches!(self.peek(), TokenKind::Eof) {
            if !self.match_keyword("song") {
                return Err(TmbdlError::parse_error(
                    "Expected 'song' inside realm body".to_string(),
                    self.location(),
                ));
            }
            let method_name = self.expect_identifier("as method name")?;
            methods.push(self.parse_func_literal(method_name)?);
        }
        self.expect_punct('}', "to close realm body")?;
        Ok(Stmt::new(StmtKind::Class { name, parent, methods }, line))
    }

    // === Expressions ===

    pub fn parse_expr(&mut self) -> Result<Expr, TmbdlError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, TmbdlError> {
        let target = self.parse_or()?;
        let line = target.line;

        let compound = match self.peek() {
            TokenKind::Operator(op) => match op.as_str() {
                "=" => None,
                "+=" => Some(BinaryOp::Add),
                "-=" => Some(BinaryOp::Sub),
                "*=" => Some(BinaryOp::Mul),
                "/=" => Some(BinaryOp::Div),
                "%=" => Some(BinaryOp::Mod),
                _ => return Ok(target),
            },
            _ => return Ok(target),
        };

        self.pos += 1; // the assignment operator
        let value = Box::new(self.parse_assignment()?);

        match (target.kind, compound) {
            (ExprKind::Variable(name), None) => {
                Ok(Expr::new(ExprKind::Assign { name, value }, line))
            }
            (ExprKind::Variable(name), Some(op)) => {
                Ok(Expr::new(ExprKind::CompoundAssign { name, op, value }, line))
            }
            (ExprKind::IndexGet { object, index }, None) => {
                Ok(Expr::new(ExprKind::IndexSet { object, index, value }, line))
            }
            (ExprKind::PropGet { object, name }, None) => {
                Ok(Expr::new(ExprKind::PropSet { object, name, value }, line))
            }
            _ => Err(TmbdlError::parse_error(
                "Invalid assignment target".to_string(),
                SourceLocation::at_line(line as usize),
            )),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, TmbdlError> {
        let mut left = self.parse_and()?;
        while self.check_keyword("either") {
            self.pos += 1;
            let right = self.parse_and()?;
            let line = left.line;
            left = Expr::new(
                ExprKind::Logical { left: Box::new(left), op: LogicalOp::Or, right: Box::new(right) },
                line,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, TmbdlError> {
        let mut left = self.parse_equality()?;
        while self.check_keyword("with") {
            self.pos += 1;
            let right = self.parse_equality()?;
            let line = left.line;
            left = Expr::new(
                ExprKind::Logical {
                    left: Box::new(left),
                    op: LogicalOp::And,
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, TmbdlError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.check_operator("==") {
                BinaryOp::Equal
            } else if self.check_operator("!=") {
                BinaryOp::NotEqual
            } else {
                break;
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            let line = left.line;
            left = Expr::new(
                ExprKind::Binary { left: Box::new(left), op, right: Box::new(right) },
                line,
            );
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, TmbdlError> {
        let mut left = self.parse_term()?;
        loop {
            let op = if self.check_operator("<") {
                BinaryOp::Less
            } else if self.check_operator("<=") {
                BinaryOp::LessEqual
            } else if self.check_operator(">") {
                BinaryOp::Greater
            } else if self.check_operator(">=") {
                BinaryOp::GreaterEqual
            } else {
                break;
            };
            self.pos += 1;
            let right = self.parse_term()?;
            let line = left.line;
            left = Expr::new(
                ExprKind::Binary { left: Box::new(left), op, right: Box::new(right) },
                line,
            );
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, TmbdlError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = if self.check_operator("+") {
                BinaryOp::Add
            } else if self.check_operator("-") {
                BinaryOp::Sub
            } else {
                break;
            };
            self.pos += 1;
            let right = self.parse_factor()?;
            let line = left.line;
            left = Expr::new(
                ExprKind::Binary { left: Box::new(left), op, right: Box::new(right) },
                line,
            );
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, TmbdlError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.check_operator("*") {
                BinaryOp::Mul
            } else if self.check_operator("/") {
                BinaryOp::Div
            } else if self.check_operator("%") {
                BinaryOp::Mod
            } else {
                break;
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            let line = left.line;
            left = Expr::new(
                ExprKind::Binary { left: Box::new(left), op, right: Box::new(right) },
                line,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, TmbdlError> {
        let line = self.line();
        if self.check_operator("-") {
            self.pos += 1;
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::new(ExprKind::Unary { op: UnaryOp::Negate, operand }, line));
        }
        if self.check_operator("!") {
            self.pos += 1;
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::new(ExprKind::Unary { op: UnaryOp::Not, operand }, line));
        }
        if self.check_operator("++") || self.check_operator("--") {
            let op = if self.check_operator("++") { UpdateOp::Increment } else { UpdateOp::Decrement };
            self.pos += 1;
            let name = self.expect_identifier("after prefix update operator")?;
            return Ok(Expr::new(ExprKind::Update { name, op, prefix: true }, line));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, TmbdlError> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = expr.line;
            if self.match_punct('(') {
                let mut args = Vec::new();
                if !self.check_punct(')') {
                    loop {
                        args.push(self.parse_expr()?);
                        if !self.match_punct(',') {
                            break;
                        }
                    }
                }
                self.expect_punct(')', "after call arguments")?;
                expr = Expr::new(ExprKind::Call { callee: Box::new(expr), args }, line);
            } else if self.match_punct('[') {
                let index = self.parse_expr()?;
                self.expect_punct(']', "after index expression")?;
                expr = Expr::new(
                    ExprKind::IndexGet { object: Box::new(expr), index: Box::new(index) },
                    line,
                );
            } else if self.match_punct('.') {
                let name = self.expect_identifier("after '.'")?;
                expr = Expr::new(ExprKind::PropGet { object: Box::new(expr), name }, line);
            } else if self.check_operator("++") || self.check_operator("--") {
                let op = if self.check_operator("++") {
                    UpdateOp::Increment
                } else {
                    UpdateOp::Decrement
                };
                match expr.kind {
                    ExprKind::Variable(name) => {
                        self.pos += 1;
                        expr = Expr::new(ExprKind::Update { name, op, prefix: false }, line);
                    }
                    _ => {
                        return Err(TmbdlError::parse_error(
                            "Update operators only apply to variables".to_string(),
                            self.location(),
                        ))
                    }
                }
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, TmbdlError> {
        let line = self.line();
        match self.advance() {
            TokenKind::Number(n) => Ok(Expr::new(ExprKind::Number(n), line)),
            TokenKind::Str(s) => Ok(Expr::new(ExprKind::Str(s), line)),
            TokenKind::Template(raw_parts) => {
                let mut parts = Vec::new();
                // The ADD-chain lowering needs a leading string operand
                if !matches!(raw_parts.first(), Some(RawTemplatePart::Text(_))) {
                    parts.push(TemplatePart::Text(String::new()));
                }
                for raw in raw_parts {
                    match raw {
                        RawTemplatePart::Text(s) => parts.push(TemplatePart::Text(s)),
                        RawTemplatePart::Expr(source) => {
                            let tokens = tokenize(&source)?;
                            let mut sub = Parser::new(tokens);
                            let inner = sub.parse_expr()?;
                            if !matches!(sub.peek(), TokenKind::Eof) {
                                return Err(TmbdlError::parse_error(
                                    "Unexpected tokens after template expression".to_string(),
                                    SourceLocation::at_line(line as usize),
                                ));
                            }
                            parts.push(TemplatePart::Expr(inner));
                        }
                    }
                }
                Ok(Expr::new(ExprKind::Template(parts), line))
            }
            TokenKind::Identifier(name) => Ok(Expr::new(ExprKind::Variable(name), line)),
            TokenKind::Keyword(kw) => match kw.as_str() {
                "nothing" => Ok(Expr::new(ExprKind::Null, line)),
                "sauron" => Ok(Expr::new(ExprKind::Bool(false), line)),
                "goldberry" => Ok(Expr::new(ExprKind::Bool(true), line)),
                "song" => {
                    let literal = self.parse_func_literal("<lambda>".to_string())?;
                    Ok(Expr::new(ExprKind::Lambda(literal), line))
                }
                "summon" => match self.advance() {
                    TokenKind::Str(path) => Ok(Expr::new(ExprKind::Import(path), line)),
                    other => Err(TmbdlError::parse_error(
                        format!("Expected module path string after 'summon', found {:?}", other),
                        self.location(),
                    )),
                },
                other => Err(TmbdlError::parse_error(
                    format!("Unexpected keyword '{}'", other),
                    self.location(),
                )),
            },
            TokenKind::Punctuation('(') => {
                let expr = self.parse_expr()?;
                self.expect_punct(')', "after grouped expression")?;
                Ok(expr)
            }
            TokenKind::Punctuation('[') => {
                let mut elements = Vec::new();
                if !self.check_punct(']') {
                    loop {
                        elements.push(self.parse_expr()?);
                        if !self.match_punct(',') {
                            break;
                        }
                    }
                }
                self.expect_punct(']', "after array elements")?;
                Ok(Expr::new(ExprKind::Array(elements), line))
            }
            TokenKind::Punctuation('{') => {
                let mut entries = Vec::new();
                if !self.check_punct('}') {
                    loop {
                        let key_line = self.line();
                        let key = match self.advance() {
                            TokenKind::Identifier(name) => {
                                Expr::new(ExprKind::Str(name), key_line)
                            }
                            TokenKind::Str(s) => Expr::new(ExprKind::Str(s), key_line),
                            other => {
                                return Err(TmbdlError::parse_error(
                                    format!("Expected map key, found {:?}", other),
                                    self.location(),
                                ))
                            }
                        };
                        self.expect_punct(':', "after map key")?;
                        let value = self.parse_expr()?;
                        entries.push((key, value));
                        if !self.match_punct(',') {
                            break;
                        }
                    }
                }
                self.expect_punct('}', "after map entries")?;
                Ok(Expr::new(ExprKind::MapLiteral(entries), line))
            }
            other => Err(TmbdlError::parse_error(
                format!("Unexpected token {:?}", other),
                self.location(),
            )),
        }
    }
}

//! Recursive-descent parser. Errors carry the line and column of the
//! offending token.

use crate::ast::*;
use crate::lexer::{tokenize, Keyword, Token, TokenKind};
use crate::types::ExecutionError;

pub fn parse(source: &str) -> Result<Vec<Stmt>, ExecutionError> {
    let tokens = tokenize(source)?;
    Parser { tokens, pos: 0 }.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn program(mut self) -> Result<Vec<Stmt>, ExecutionError> {
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Eof) {
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ExecutionError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("expected {what}")))
        }
    }

    fn error_here(&self, message: String) -> ExecutionError {
        let token = self.peek();
        ExecutionError::Syntax {
            line: token.line,
            column: token.column,
            message,
        }
    }

    fn statement(&mut self) -> Result<Stmt, ExecutionError> {
        match &self.peek().kind {
            TokenKind::Keyword(Keyword::Let | Keyword::Const | Keyword::Var) => {
                self.declaration()
            }
            TokenKind::Keyword(Keyword::Function) => self.function_decl(),
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon) || self.check(&TokenKind::RBrace)
                {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.eat(&TokenKind::Semicolon);
                Ok(Stmt::Return(value))
            }
            TokenKind::Keyword(Keyword::If) => self.if_stmt(),
            TokenKind::Keyword(Keyword::While) => self.while_stmt(),
            TokenKind::Keyword(Keyword::For) => self.for_stmt(),
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                self.eat(&TokenKind::Semicolon);
                Ok(Stmt::Break)
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                self.eat(&TokenKind::Semicolon);
                Ok(Stmt::Continue)
            }
            _ => {
                let expr = self.expression()?;
                self.eat(&TokenKind::Semicolon);
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn declaration(&mut self) -> Result<Stmt, ExecutionError> {
        self.advance();
        let name = self.ident("variable name")?;
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.expression()?)
        } else {
            None
        };
        self.eat(&TokenKind::Semicolon);
        Ok(Stmt::Declare { name, init })
    }

    fn function_decl(&mut self) -> Result<Stmt, ExecutionError> {
        self.advance();
        let name = self.ident("function name")?;
        let params = self.param_list()?;
        let body = self.block()?;
        Ok(Stmt::Function { name, params, body })
    }

    fn param_list(&mut self) -> Result<Vec<String>, ExecutionError> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.ident("parameter name")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(params)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ExecutionError> {
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            stmts.push(self.statement()?);
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        Ok(stmts)
    }

    fn block_or_single(&mut self) -> Result<Vec<Stmt>, ExecutionError> {
        if self.check(&TokenKind::LBrace) {
            self.block()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, ExecutionError> {
        self.advance();
        self.expect(TokenKind::LParen, "`(`")?;
        let cond = self.expression()?;
        self.expect(TokenKind::RParen, "`)`")?;
        let then_branch = self.block_or_single()?;
        let else_branch = if self.eat(&TokenKind::Keyword(Keyword::Else)) {
            Some(self.block_or_single()?)
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn while_stmt(&mut self) -> Result<Stmt, ExecutionError> {
        self.advance();
        self.expect(TokenKind::LParen, "`(`")?;
        let cond = self.expression()?;
        self.expect(TokenKind::RParen, "`)`")?;
        let body = self.block_or_single()?;
        Ok(Stmt::While { cond, body })
    }

    fn for_stmt(&mut self) -> Result<Stmt, ExecutionError> {
        self.advance();
        self.expect(TokenKind::LParen, "`(`")?;

        let init = if self.eat(&TokenKind::Semicolon) {
            None
        } else {
            let stmt = if matches!(
                self.peek().kind,
                TokenKind::Keyword(Keyword::Let | Keyword::Const | Keyword::Var)
            ) {
                self.declaration()?
            } else {
                let expr = self.expression()?;
                self.eat(&TokenKind::Semicolon);
                Stmt::Expr(expr)
            };
            Some(Box::new(stmt))
        };

        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(TokenKind::Semicolon, "`;`")?;

        let update = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(TokenKind::RParen, "`)`")?;

        let body = self.block_or_single()?;
        Ok(Stmt::For {
            init,
            cond,
            update,
            body,
        })
    }

    fn ident(&mut self, what: &str) -> Result<String, ExecutionError> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_here(format!("expected {what}"))),
        }
    }

    fn expression(&mut self) -> Result<Expr, ExecutionError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, ExecutionError> {
        let target = self.logical_or()?;

        let op = match self.peek().kind {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            TokenKind::StarAssign => AssignOp::Mul,
            TokenKind::SlashAssign => AssignOp::Div,
            _ => return Ok(target),
        };

        if !matches!(
            target,
            Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }
        ) {
            return Err(self.error_here("invalid assignment target".into()));
        }
        self.advance();
        let value = self.assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn logical_or(&mut self) -> Result<Expr, ExecutionError> {
        let mut lhs = self.logical_and()?;
        while self.eat(&TokenKind::OrOr) {
            let rhs = self.logical_and()?;
            lhs = Expr::Logical {
                op: LogicalOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, ExecutionError> {
        let mut lhs = self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let rhs = self.equality()?;
            lhs = Expr::Logical {
                op: LogicalOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ExecutionError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                TokenKind::StrictEq => BinaryOp::StrictEq,
                TokenKind::StrictNotEq => BinaryOp::StrictNotEq,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.comparison()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn comparison(&mut self) -> Result<Expr, ExecutionError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::LtEq => BinaryOp::LtEq,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::GtEq => BinaryOp::GtEq,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn additive(&mut self) -> Result<Expr, ExecutionError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExecutionError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ExecutionError> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExecutionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek().kind {
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "`)`")?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let property = self.ident("property name")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let increment = self.peek().kind == TokenKind::PlusPlus;
                    if !matches!(
                        expr,
                        Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }
                    ) {
                        return Err(self.error_here("invalid increment target".into()));
                    }
                    self.advance();
                    expr = Expr::IncDec {
                        target: Box::new(expr),
                        increment,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExecutionError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::Null)
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::Ident(name))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket, "`]`")?;
                Ok(Expr::Array(items))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut fields = Vec::new();
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let key = match self.peek().kind.clone() {
                            TokenKind::Ident(name) => {
                                self.advance();
                                name
                            }
                            TokenKind::Str(s) => {
                                self.advance();
                                s
                            }
                            _ => return Err(self.error_here("expected property key".into())),
                        };
                        self.expect(TokenKind::Colon, "`:`")?;
                        fields.push((key, self.expression()?));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBrace, "`}`")?;
                Ok(Expr::Object(fields))
            }
            _ => Err(self.error_here("expected expression".into())),
        }
    }
}

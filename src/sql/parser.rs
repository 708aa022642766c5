//! SQL Parser
//!
//! Recursive-descent parser from tokens to the AST. Sub-expressions whose
//! text the catalog stores (view bodies, DEFAULT/CHECK expressions, trigger
//! conditions and bodies) are sliced out of the source using the token
//! spans recorded by the lexer.

use super::ast::*;
use super::lexer::Lexer;
use super::token::Token;
use crate::catalog::{DataType, TriggerEvent, TriggerTiming};
use crate::error::{Error, Result};

/// SQL Parser
pub struct Parser {
    tokens: Vec<Token>,
    /// Start offset (in chars) of each token.
    spans: Vec<usize>,
    source: Vec<char>,
    position: usize,
}

impl Parser {
    /// Create a new parser from a SQL string
    pub fn new(sql: &str) -> Result<Self> {
        let (tokens, spans) = Lexer::new(sql).tokenize()?;
        Ok(Self {
            tokens,
            spans,
            source: sql.chars().collect(),
            position: 0,
        })
    }

    /// Parse a single SQL statement
    pub fn parse(&mut self) -> Result<Statement> {
        let stmt = self.parse_statement()?;
        if self.check(&Token::Semicolon) {
            self.advance();
        }
        Ok(stmt)
    }

    /// Parse multiple SQL statements
    pub fn parse_all(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            statements.push(self.parse()?);
        }
        Ok(statements)
    }

    /// Parse a bare expression (catalog-stored CHECK/DEFAULT/WHEN texts).
    pub fn parse_expression(sql: &str) -> Result<Expr> {
        let mut parser = Self::new(sql)?;
        let expr = parser.parse_expr()?;
        if !parser.is_at_end() {
            return Err(Error::ParseError(format!(
                "trailing input after expression: '{}'",
                parser.current()
            )));
        }
        Ok(expr)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.current() {
            Token::Select => self.parse_select().map(Statement::Select),
            Token::Insert => self.parse_insert().map(Statement::Insert),
            Token::Update => self.parse_update().map(Statement::Update),
            Token::Delete => self.parse_delete().map(Statement::Delete),
            Token::Create => self.parse_create(),
            Token::Drop => self.parse_drop(),
            Token::Alter => self.parse_alter(),
            Token::Begin => self.parse_begin(),
            Token::Commit => self.parse_commit(),
            Token::Rollback => self.parse_rollback(),
            Token::Analyze => self.parse_analyze(),
            Token::Use => self.parse_use(),
            Token::Show => self.parse_show(),
            Token::Explain => self.parse_explain(),
            Token::Declare => self.parse_declare_cursor(),
            Token::Open => self.parse_open_cursor(),
            Token::Fetch => self.parse_fetch(),
            Token::Close => self.parse_close_cursor(),
            _ => Err(Error::UnexpectedToken {
                expected: "a SQL statement".to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    // ========== SELECT Statement ==========

    fn parse_select(&mut self) -> Result<SelectStatement> {
        self.expect(&Token::Select)?;

        let mut stmt = SelectStatement::default();

        if self.check(&Token::Distinct) {
            self.advance();
            stmt.distinct = true;
        } else if self.check(&Token::All) {
            self.advance();
        }

        stmt.columns = self.parse_select_list()?;

        if self.check(&Token::From) {
            stmt.from = Some(self.parse_from_clause()?);
        }

        if self.check(&Token::Where) {
            self.advance();
            stmt.where_clause = Some(self.parse_expr()?);
        }

        if self.check(&Token::Group) {
            self.advance();
            self.expect(&Token::By)?;
            stmt.group_by = self.parse_expr_list()?;
        }

        if self.check(&Token::Having) {
            self.advance();
            stmt.having = Some(self.parse_expr()?);
        }

        if self.check(&Token::Order) {
            self.advance();
            self.expect(&Token::By)?;
            stmt.order_by = self.parse_order_by_list()?;
        }

        if self.check(&Token::Limit) {
            self.advance();
            stmt.limit = Some(self.parse_expr()?);
        }

        if self.check(&Token::Offset) {
            self.advance();
            stmt.offset = Some(self.parse_expr()?);
        }

        Ok(stmt)
    }

    fn parse_select_list(&mut self) -> Result<Vec<SelectItem>> {
        let mut items = Vec::new();
        loop {
            items.push(self.parse_select_item()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(items)
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.check(&Token::Asterisk) {
            self.advance();
            return Ok(SelectItem::Wildcard);
        }

        // table.*
        if let Token::Identifier(name) = self.current().clone() {
            if self.peek() == Some(&Token::Dot) && self.peek2() == Some(&Token::Asterisk) {
                self.advance();
                self.advance();
                self.advance();
                return Ok(SelectItem::QualifiedWildcard(name));
            }
        }

        let expr = self.parse_expr()?;

        let alias = if self.check(&Token::As) {
            self.advance();
            Some(self.expect_identifier()?)
        } else if let Token::Identifier(_) = self.current() {
            // Alias without AS
            Some(self.expect_identifier()?)
        } else {
            None
        };

        Ok(SelectItem::Expr { expr, alias })
    }

    fn parse_from_clause(&mut self) -> Result<FromClause> {
        self.expect(&Token::From)?;
        let table = self.parse_table_ref()?;
        let mut joins = Vec::new();
        while self.is_join_keyword() {
            joins.push(self.parse_join()?);
        }
        Ok(FromClause { table, joins })
    }

    fn parse_table_ref(&mut self) -> Result<TableRef> {
        let name = self.expect_identifier()?;
        let alias = if self.check(&Token::As) {
            self.advance();
            Some(self.expect_identifier()?)
        } else if let Token::Identifier(_) = self.current() {
            Some(self.expect_identifier()?)
        } else {
            None
        };
        Ok(TableRef { name, alias })
    }

    fn is_join_keyword(&self) -> bool {
        matches!(
            self.current(),
            Token::Join | Token::Inner | Token::Left | Token::Right | Token::Full | Token::Cross
        )
    }

    fn parse_join(&mut self) -> Result<Join> {
        let join_type = self.parse_join_type()?;
        self.expect(&Token::Join)?;
        let table = self.parse_table_ref()?;

        let condition = if self.check(&Token::On) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(Join {
            join_type,
            table,
            condition,
        })
    }

    fn parse_join_type(&mut self) -> Result<JoinType> {
        if self.check(&Token::Inner) {
            self.advance();
            Ok(JoinType::Inner)
        } else if self.check(&Token::Left) {
            self.advance();
            if self.check(&Token::Outer) {
                self.advance();
            }
            Ok(JoinType::Left)
        } else if self.check(&Token::Right) {
            self.advance();
            if self.check(&Token::Outer) {
                self.advance();
            }
            Ok(JoinType::Right)
        } else if self.check(&Token::Full) {
            self.advance();
            if self.check(&Token::Outer) {
                self.advance();
            }
            Ok(JoinType::Full)
        } else if self.check(&Token::Cross) {
            self.advance();
            Ok(JoinType::Cross)
        } else {
            // Bare JOIN means INNER JOIN
            Ok(JoinType::Inner)
        }
    }

    fn parse_order_by_list(&mut self) -> Result<Vec<OrderByItem>> {
        let mut items = Vec::new();
        loop {
            let expr = self.parse_expr()?;
            let ascending = if self.check(&Token::Desc) {
                self.advance();
                false
            } else {
                if self.check(&Token::Asc) {
                    self.advance();
                }
                true
            };
            items.push(OrderByItem { expr, ascending });
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(items)
    }

    // ========== INSERT Statement ==========

    fn parse_insert(&mut self) -> Result<InsertStatement> {
        self.expect(&Token::Insert)?;
        self.expect(&Token::Into)?;

        let table_name = self.expect_identifier()?;

        let columns = if self.check(&Token::LParen) {
            self.advance();
            let cols = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect(&Token::Values)?;

        let mut values = Vec::new();
        loop {
            self.expect(&Token::LParen)?;
            let row = self.parse_expr_list()?;
            self.expect(&Token::RParen)?;
            values.push(row);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        Ok(InsertStatement {
            table_name,
            columns,
            values,
        })
    }

    // ========== UPDATE Statement ==========

    fn parse_update(&mut self) -> Result<UpdateStatement> {
        self.expect(&Token::Update)?;
        let table_name = self.expect_identifier()?;
        self.expect(&Token::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.expect_identifier()?;
            self.expect(&Token::Eq)?;
            let value = self.parse_expr()?;
            assignments.push(Assignment { column, value });
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        let where_clause = if self.check(&Token::Where) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(UpdateStatement {
            table_name,
            assignments,
            where_clause,
        })
    }

    // ========== DELETE Statement ==========

    fn parse_delete(&mut self) -> Result<DeleteStatement> {
        self.expect(&Token::Delete)?;
        self.expect(&Token::From)?;
        let table_name = self.expect_identifier()?;

        let where_clause = if self.check(&Token::Where) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(DeleteStatement {
            table_name,
            where_clause,
        })
    }

    // ========== CREATE Statements ==========

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect(&Token::Create)?;

        match self.current() {
            Token::Table => self.parse_create_table().map(Statement::CreateTable),
            Token::Index | Token::Unique => self.parse_create_index().map(Statement::CreateIndex),
            Token::Database => {
                self.advance();
                Ok(Statement::CreateDatabase(self.expect_identifier()?))
            }
            Token::View | Token::Or => self.parse_create_view(false),
            Token::Trigger => self.parse_create_trigger().map(Statement::CreateTrigger),
            _ => Err(Error::UnexpectedToken {
                expected: "TABLE, INDEX, DATABASE, VIEW, or TRIGGER".to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    fn parse_create_table(&mut self) -> Result<CreateTableStatement> {
        self.expect(&Token::Table)?;

        let if_not_exists = if self.check(&Token::If) {
            self.advance();
            self.expect(&Token::Not)?;
            self.expect(&Token::Exists)?;
            true
        } else {
            false
        };

        let table_name = self.expect_identifier()?;
        self.expect(&Token::LParen)?;

        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            if self.check(&Token::Primary)
                || self.check(&Token::Foreign)
                || self.check(&Token::Unique)
                || self.check(&Token::Check)
                || self.check(&Token::Constraint)
            {
                constraints.push(self.parse_table_constraint()?);
            } else {
                columns.push(self.parse_column_def()?);
            }
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        self.expect(&Token::RParen)?;

        Ok(CreateTableStatement {
            table_name,
            columns,
            constraints,
            if_not_exists,
        })
    }

    fn parse_create_index(&mut self) -> Result<CreateIndexStatement> {
        let unique = if self.check(&Token::Unique) {
            self.advance();
            true
        } else {
            false
        };

        self.expect(&Token::Index)?;

        let if_not_exists = if self.check(&Token::If) {
            self.advance();
            self.expect(&Token::Not)?;
            self.expect(&Token::Exists)?;
            true
        } else {
            false
        };

        let index_name = self.expect_identifier()?;
        self.expect(&Token::On)?;
        let table_name = self.expect_identifier()?;

        self.expect(&Token::LParen)?;
        let columns = self.parse_identifier_list()?;
        self.expect(&Token::RParen)?;

        Ok(CreateIndexStatement {
            index_name,
            table_name,
            columns,
            unique,
            if_not_exists,
        })
    }

    fn parse_create_view(&mut self, force_replace: bool) -> Result<Statement> {
        let or_replace = if self.check(&Token::Or) {
            self.advance();
            self.expect(&Token::Replace)?;
            true
        } else {
            force_replace
        };
        self.expect(&Token::View)?;
        let name = self.expect_identifier()?;
        self.expect(&Token::As)?;

        let start = self.mark();
        let query = self.parse_select()?;
        let sql = self.slice_from(start);

        let stmt = CreateViewStatement {
            name,
            query,
            sql,
            or_replace,
        };
        if force_replace {
            Ok(Statement::AlterView(stmt))
        } else {
            Ok(Statement::CreateView(stmt))
        }
    }

    fn parse_create_trigger(&mut self) -> Result<CreateTriggerStatement> {
        self.expect(&Token::Trigger)?;
        let name = self.expect_identifier()?;

        let timing = match self.current() {
            Token::Before => {
                self.advance();
                TriggerTiming::Before
            }
            Token::After => {
                self.advance();
                TriggerTiming::After
            }
            other => {
                return Err(Error::UnexpectedToken {
                    expected: "BEFORE or AFTER".to_string(),
                    found: format!("{}", other),
                })
            }
        };

        let event = match self.current() {
            Token::Insert => {
                self.advance();
                TriggerEvent::Insert
            }
            Token::Update => {
                self.advance();
                TriggerEvent::Update
            }
            Token::Delete => {
                self.advance();
                TriggerEvent::Delete
            }
            other => {
                return Err(Error::UnexpectedToken {
                    expected: "INSERT, UPDATE, or DELETE".to_string(),
                    found: format!("{}", other),
                })
            }
        };

        self.expect(&Token::On)?;
        let table_name = self.expect_identifier()?;

        if self.check(&Token::For) {
            self.advance();
            self.expect(&Token::Each)?;
            self.expect(&Token::Row)?;
        }

        let condition = if self.check(&Token::When) {
            self.advance();
            self.expect(&Token::LParen)?;
            let start = self.mark();
            let expr = self.parse_expr()?;
            let sql = self.slice_from(start);
            self.expect(&Token::RParen)?;
            Some((expr, sql))
        } else {
            None
        };

        let body = if self.check(&Token::Signal) {
            self.advance();
            self.expect(&Token::Sqlstate)?;
            let sqlstate = self.expect_string()?;
            let message = if self.check(&Token::Set) {
                self.advance();
                let word = self.expect_identifier()?;
                if !word.eq_ignore_ascii_case("message_text") {
                    return Err(Error::UnexpectedToken {
                        expected: "MESSAGE_TEXT".to_string(),
                        found: word,
                    });
                }
                self.expect(&Token::Eq)?;
                Some(self.expect_string()?)
            } else {
                None
            };
            TriggerBody::Signal { sqlstate, message }
        } else {
            let start = self.mark();
            let stmt = self.parse_statement()?;
            match stmt {
                Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_) => {}
                _ => {
                    return Err(Error::ParseError(
                        "trigger body must be SIGNAL or a DML statement".to_string(),
                    ))
                }
            }
            let sql = self.slice_from(start);
            TriggerBody::Statement {
                stmt: Box::new(stmt),
                sql,
            }
        };

        Ok(CreateTriggerStatement {
            name,
            timing,
            event,
            table_name,
            condition,
            body,
        })
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.expect_identifier()?;
        let data_type = self.parse_data_type()?;

        let mut not_null = false;
        let mut default = None;
        let mut check = None;
        let mut primary_key = false;
        let mut unique = false;
        let mut references = None;

        loop {
            if self.check(&Token::Not) {
                self.advance();
                self.expect(&Token::Null)?;
                not_null = true;
            } else if self.check(&Token::Null) {
                self.advance();
            } else if self.check(&Token::Default) {
                self.advance();
                let start = self.mark();
                let expr = self.parse_unary_expr()?;
                default = Some((expr, self.slice_from(start)));
            } else if self.check(&Token::Check) {
                self.advance();
                self.expect(&Token::LParen)?;
                let start = self.mark();
                let expr = self.parse_expr()?;
                let sql = self.slice_from(start);
                self.expect(&Token::RParen)?;
                check = Some((expr, sql));
            } else if self.check(&Token::Primary) {
                self.advance();
                self.expect(&Token::Key)?;
                primary_key = true;
                not_null = true;
            } else if self.check(&Token::Unique) {
                self.advance();
                unique = true;
            } else if self.check(&Token::References) {
                self.advance();
                let ref_table = self.expect_identifier()?;
                self.expect(&Token::LParen)?;
                let ref_column = self.expect_identifier()?;
                self.expect(&Token::RParen)?;
                references = Some((ref_table, ref_column));
            } else {
                break;
            }
        }

        Ok(ColumnDef {
            name,
            data_type,
            not_null,
            default,
            check,
            primary_key,
            unique,
            references,
        })
    }

    fn parse_data_type(&mut self) -> Result<DataType> {
        let dt = match self.current() {
            Token::Int | Token::Integer => {
                self.advance();
                DataType::Int
            }
            Token::BigInt => {
                self.advance();
                DataType::BigInt
            }
            Token::Decimal | Token::Numeric => {
                self.advance();
                if self.check(&Token::LParen) {
                    self.advance();
                    let precision = self.expect_integer()? as u8;
                    let scale = if self.check(&Token::Comma) {
                        self.advance();
                        self.expect_integer()? as u8
                    } else {
                        0
                    };
                    self.expect(&Token::RParen)?;
                    DataType::Decimal(precision, scale)
                } else {
                    DataType::Decimal(18, 0)
                }
            }
            Token::Varchar => {
                self.advance();
                self.expect(&Token::LParen)?;
                let len = self.expect_integer()? as usize;
                self.expect(&Token::RParen)?;
                DataType::Varchar(len)
            }
            Token::Text => {
                self.advance();
                DataType::Text
            }
            Token::Date => {
                self.advance();
                DataType::Date
            }
            Token::Bool | Token::Boolean => {
                self.advance();
                DataType::Bool
            }
            _ => {
                return Err(Error::UnexpectedToken {
                    expected: "data type".to_string(),
                    found: format!("{}", self.current()),
                });
            }
        };
        Ok(dt)
    }

    fn parse_table_constraint(&mut self) -> Result<TableConstraint> {
        let name = if self.check(&Token::Constraint) {
            self.advance();
            Some(self.expect_identifier()?)
        } else {
            None
        };

        if self.check(&Token::Primary) {
            self.advance();
            self.expect(&Token::Key)?;
            self.expect(&Token::LParen)?;
            let columns = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            Ok(TableConstraint::PrimaryKey { name, columns })
        } else if self.check(&Token::Unique) {
            self.advance();
            self.expect(&Token::LParen)?;
            let columns = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            Ok(TableConstraint::Unique { name, columns })
        } else if self.check(&Token::Foreign) {
            self.advance();
            self.expect(&Token::Key)?;
            self.expect(&Token::LParen)?;
            let columns = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            self.expect(&Token::References)?;
            let ref_table = self.expect_identifier()?;
            self.expect(&Token::LParen)?;
            let ref_columns = self.parse_identifier_list()?;
            self.expect(&Token::RParen)?;
            Ok(TableConstraint::ForeignKey {
                name,
                columns,
                ref_table,
                ref_columns,
            })
        } else if self.check(&Token::Check) {
            self.advance();
            self.expect(&Token::LParen)?;
            let start = self.mark();
            let expr = self.parse_expr()?;
            let sql = self.slice_from(start);
            self.expect(&Token::RParen)?;
            Ok(TableConstraint::Check { name, expr, sql })
        } else {
            Err(Error::UnexpectedToken {
                expected: "PRIMARY, UNIQUE, FOREIGN, or CHECK".to_string(),
                found: format!("{}", self.current()),
            })
        }
    }

    // ========== DROP / ALTER Statements ==========

    fn parse_drop(&mut self) -> Result<Statement> {
        self.expect(&Token::Drop)?;

        match self.current() {
            Token::Table => {
                self.advance();
                let if_exists = self.parse_if_exists()?;
                let table_name = self.expect_identifier()?;
                Ok(Statement::DropTable(DropTableStatement {
                    table_name,
                    if_exists,
                }))
            }
            Token::Index => {
                self.advance();
                let if_exists = self.parse_if_exists()?;
                let index_name = self.expect_identifier()?;
                Ok(Statement::DropIndex(DropIndexStatement {
                    index_name,
                    if_exists,
                }))
            }
            Token::View => {
                self.advance();
                Ok(Statement::DropView(self.expect_identifier()?))
            }
            Token::Trigger => {
                self.advance();
                Ok(Statement::DropTrigger(self.expect_identifier()?))
            }
            _ => Err(Error::UnexpectedToken {
                expected: "TABLE, INDEX, VIEW, or TRIGGER".to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    fn parse_if_exists(&mut self) -> Result<bool> {
        if self.check(&Token::If) {
            self.advance();
            self.expect(&Token::Exists)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse_alter(&mut self) -> Result<Statement> {
        self.expect(&Token::Alter)?;
        match self.current() {
            Token::View => self.parse_create_view(true),
            _ => Err(Error::UnexpectedToken {
                expected: "VIEW".to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    // ========== TCL / utility statements ==========

    fn parse_begin(&mut self) -> Result<Statement> {
        self.expect(&Token::Begin)?;
        if self.check(&Token::Transaction) {
            self.advance();
        }
        Ok(Statement::BeginTransaction)
    }

    fn parse_commit(&mut self) -> Result<Statement> {
        self.expect(&Token::Commit)?;
        if self.check(&Token::Transaction) {
            self.advance();
        }
        Ok(Statement::Commit)
    }

    fn parse_rollback(&mut self) -> Result<Statement> {
        self.expect(&Token::Rollback)?;
        if self.check(&Token::Transaction) {
            self.advance();
        }
        Ok(Statement::Rollback)
    }

    fn parse_analyze(&mut self) -> Result<Statement> {
        self.expect(&Token::Analyze)?;
        Ok(Statement::Analyze(self.expect_identifier()?))
    }

    fn parse_use(&mut self) -> Result<Statement> {
        self.expect(&Token::Use)?;
        Ok(Statement::UseDatabase(self.expect_identifier()?))
    }

    fn parse_show(&mut self) -> Result<Statement> {
        self.expect(&Token::Show)?;
        let show = match self.current() {
            Token::Tables => {
                self.advance();
                ShowStatement::Tables
            }
            Token::Columns => {
                self.advance();
                self.expect(&Token::From)?;
                ShowStatement::Columns {
                    table: self.expect_identifier()?,
                }
            }
            Token::Index => {
                self.advance();
                self.expect(&Token::From)?;
                ShowStatement::Index {
                    table: self.expect_identifier()?,
                }
            }
            Token::Triggers => {
                self.advance();
                ShowStatement::Triggers
            }
            Token::Views => {
                self.advance();
                ShowStatement::Views
            }
            other => {
                return Err(Error::UnexpectedToken {
                    expected: "TABLES, COLUMNS, INDEX, TRIGGERS, or VIEWS".to_string(),
                    found: format!("{}", other),
                })
            }
        };
        Ok(Statement::Show(show))
    }

    fn parse_explain(&mut self) -> Result<Statement> {
        self.expect(&Token::Explain)?;
        let select = self.parse_select()?;
        Ok(Statement::Explain(Box::new(select)))
    }

    fn parse_declare_cursor(&mut self) -> Result<Statement> {
        self.expect(&Token::Declare)?;
        let name = self.expect_identifier()?;
        self.expect(&Token::Cursor)?;
        self.expect(&Token::For)?;
        let query = self.parse_select()?;
        Ok(Statement::DeclareCursor(DeclareCursorStatement {
            name,
            query,
        }))
    }

    fn parse_open_cursor(&mut self) -> Result<Statement> {
        self.expect(&Token::Open)?;
        Ok(Statement::OpenCursor(self.expect_identifier()?))
    }

    fn parse_fetch(&mut self) -> Result<Statement> {
        self.expect(&Token::Fetch)?;
        if let Token::IntegerLiteral(n) = self.current().clone() {
            self.advance();
            self.expect(&Token::From)?;
            let name = self.expect_identifier()?;
            if n < 0 {
                return Err(Error::ParseError("FETCH count must be positive".to_string()));
            }
            return Ok(Statement::FetchCursor {
                name,
                count: Some(n as u64),
            });
        }
        if self.check(&Token::From) {
            self.advance();
        }
        let name = self.expect_identifier()?;
        Ok(Statement::FetchCursor { name, count: None })
    }

    fn parse_close_cursor(&mut self) -> Result<Statement> {
        self.expect(&Token::Close)?;
        Ok(Statement::CloseCursor(self.expect_identifier()?))
    }

    // ========== Expression Parsing ==========

    pub(crate) fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or_expr()
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = Vec::new();
        loop {
            exprs.push(self.parse_expr()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(exprs)
    }

    fn parse_or_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_and_expr()?;
        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_not_expr()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_not_expr()?;
            left = Expr::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr> {
        if self.check(&Token::Not)
            && !matches!(
                self.peek(),
                Some(Token::Between) | Some(Token::In) | Some(Token::Like)
            )
        {
            self.advance();
            let expr = self.parse_not_expr()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison_expr()
    }

    fn parse_comparison_expr(&mut self) -> Result<Expr> {
        let left = self.parse_additive_expr()?;

        // IS NULL / IS NOT NULL
        if self.check(&Token::Is) {
            self.advance();
            if self.check(&Token::Not) {
                self.advance();
                self.expect(&Token::Null)?;
                return Ok(Expr::IsNotNull(Box::new(left)));
            }
            self.expect(&Token::Null)?;
            return Ok(Expr::IsNull(Box::new(left)));
        }

        // [NOT] BETWEEN / IN / LIKE
        let negated = if self.check(&Token::Not)
            && matches!(
                self.peek(),
                Some(Token::Between) | Some(Token::In) | Some(Token::Like)
            ) {
            self.advance();
            true
        } else {
            false
        };

        if self.check(&Token::Between) {
            self.advance();
            let low = self.parse_additive_expr()?;
            self.expect(&Token::And)?;
            let high = self.parse_additive_expr()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            });
        }

        if self.check(&Token::In) {
            self.advance();
            self.expect(&Token::LParen)?;
            if self.check(&Token::Select) {
                let query = self.parse_select()?;
                self.expect(&Token::RParen)?;
                return Ok(Expr::InSubquery {
                    expr: Box::new(left),
                    query: Box::new(query),
                    negated,
                });
            }
            let list = self.parse_expr_list()?;
            self.expect(&Token::RParen)?;
            return Ok(Expr::InList {
                expr: Box::new(left),
                list,
                negated,
            });
        }

        if self.check(&Token::Like) {
            self.advance();
            let pattern = self.parse_primary_expr()?;
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern: Box::new(pattern),
                negated,
            });
        }

        // Comparison operators
        let op = match self.current() {
            Token::Eq => Some(BinaryOperator::Eq),
            Token::Neq => Some(BinaryOperator::Neq),
            Token::Lt => Some(BinaryOperator::Lt),
            Token::Gt => Some(BinaryOperator::Gt),
            Token::Lte => Some(BinaryOperator::Lte),
            Token::Gte => Some(BinaryOperator::Gte),
            _ => None,
        };

        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive_expr()?;
            Ok(Expr::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            })
        } else {
            Ok(left)
        }
    }

    fn parse_additive_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative_expr()?;
        loop {
            let op = match self.current() {
                Token::Plus => Some(BinaryOperator::Add),
                Token::Minus => Some(BinaryOperator::Sub),
                Token::Concat => Some(BinaryOperator::Concat),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.advance();
                    let right = self.parse_multiplicative_expr()?;
                    left = Expr::BinaryOp {
                        left: Box::new(left),
                        op,
                        right: Box::new(right),
                    };
                }
                None => break,
            }
        }
        Ok(left)
    }

    fn parse_multiplicative_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary_expr()?;
        loop {
            let op = match self.current() {
                Token::Asterisk => Some(BinaryOperator::Mul),
                Token::Slash => Some(BinaryOperator::Div),
                Token::Percent => Some(BinaryOperator::Mod),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.advance();
                    let right = self.parse_unary_expr()?;
                    left = Expr::BinaryOp {
                        left: Box::new(left),
                        op,
                        right: Box::new(right),
                    };
                }
                None => break,
            }
        }
        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr> {
        match self.current() {
            Token::Minus => {
                self.advance();
                let expr = self.parse_unary_expr()?;
                Ok(Expr::UnaryOp {
                    op: UnaryOperator::Minus,
                    expr: Box::new(expr),
                })
            }
            Token::Plus => {
                self.advance();
                let expr = self.parse_unary_expr()?;
                Ok(Expr::UnaryOp {
                    op: UnaryOperator::Plus,
                    expr: Box::new(expr),
                })
            }
            _ => self.parse_primary_expr(),
        }
    }

    fn parse_primary_expr(&mut self) -> Result<Expr> {
        match self.current().clone() {
            Token::IntegerLiteral(n) => {
                self.advance();
                Ok(Expr::Literal(Literal::Integer(n)))
            }
            Token::DecimalLiteral(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::Decimal(s)))
            }
            Token::StringLiteral(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::String(s)))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }

            // Parenthesized expression or scalar subquery
            Token::LParen => {
                self.advance();
                if self.check(&Token::Select) {
                    let subquery = self.parse_select()?;
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Subquery(Box::new(subquery)))
                } else {
                    let expr = self.parse_expr()?;
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Nested(Box::new(expr)))
                }
            }

            Token::Exists => {
                self.advance();
                self.expect(&Token::LParen)?;
                let subquery = self.parse_select()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Exists(Box::new(subquery)))
            }

            Token::Case => self.parse_case_expr(),

            Token::Count | Token::Sum | Token::Avg | Token::Min | Token::Max => {
                self.parse_function()
            }

            Token::Identifier(name) => {
                self.advance();
                if self.check(&Token::LParen) {
                    self.position -= 1;
                    self.parse_function()
                } else if self.check(&Token::Dot) {
                    self.advance();
                    let column = self.expect_identifier()?;
                    Ok(Expr::Column(ColumnRef {
                        table: Some(name),
                        column,
                    }))
                } else {
                    Ok(Expr::Column(ColumnRef {
                        table: None,
                        column: name,
                    }))
                }
            }

            _ => Err(Error::UnexpectedToken {
                expected: "expression".to_string(),
                found: format!("{}", self.current()),
            }),
        }
    }

    fn parse_case_expr(&mut self) -> Result<Expr> {
        self.expect(&Token::Case)?;

        let operand = if !self.check(&Token::When) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };

        let mut when_clauses = Vec::new();
        while self.check(&Token::When) {
            self.advance();
            let condition = self.parse_expr()?;
            self.expect(&Token::Then)?;
            let result = self.parse_expr()?;
            when_clauses.push((condition, result));
        }
        if when_clauses.is_empty() {
            return Err(Error::ParseError(
                "CASE requires at least one WHEN clause".to_string(),
            ));
        }

        let else_clause = if self.check(&Token::Else) {
            self.advance();
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };

        self.expect(&Token::End)?;

        Ok(Expr::Case {
            operand,
            when_clauses,
            else_clause,
        })
    }

    fn parse_function(&mut self) -> Result<Expr> {
        let name = match self.current().clone() {
            Token::Count => {
                self.advance();
                "COUNT".to_string()
            }
            Token::Sum => {
                self.advance();
                "SUM".to_string()
            }
            Token::Avg => {
                self.advance();
                "AVG".to_string()
            }
            Token::Min => {
                self.advance();
                "MIN".to_string()
            }
            Token::Max => {
                self.advance();
                "MAX".to_string()
            }
            Token::Identifier(n) => {
                self.advance();
                n
            }
            _ => {
                return Err(Error::UnexpectedToken {
                    expected: "function name".to_string(),
                    found: format!("{}", self.current()),
                })
            }
        };

        self.expect(&Token::LParen)?;

        let distinct = if self.check(&Token::Distinct) {
            self.advance();
            true
        } else {
            false
        };

        let args = if self.check(&Token::Asterisk) {
            self.advance();
            // COUNT(*): no argument expression
            Vec::new()
        } else if self.check(&Token::RParen) {
            Vec::new()
        } else {
            self.parse_expr_list()?
        };

        self.expect(&Token::RParen)?;

        Ok(Expr::Function {
            name,
            args,
            distinct,
        })
    }

    fn parse_identifier_list(&mut self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        loop {
            names.push(self.expect_identifier()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(names)
    }

    // ========== Token helpers ==========

    fn current(&self) -> &Token {
        &self.tokens[self.position]
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position + 1)
    }

    fn peek2(&self) -> Option<&Token> {
        self.tokens.get(self.position + 2)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
    }

    fn check(&self, token: &Token) -> bool {
        self.current() == token
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(Error::UnexpectedToken {
                expected: format!("{}", token),
                found: format!("{}", self.current()),
            })
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.current().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(Error::UnexpectedToken {
                expected: "identifier".to_string(),
                found: format!("{}", other),
            }),
        }
    }

    fn expect_integer(&mut self) -> Result<i64> {
        match self.current().clone() {
            Token::IntegerLiteral(n) => {
                self.advance();
                Ok(n)
            }
            other => Err(Error::UnexpectedToken {
                expected: "integer".to_string(),
                found: format!("{}", other),
            }),
        }
    }

    fn expect_string(&mut self) -> Result<String> {
        match self.current().clone() {
            Token::StringLiteral(s) => {
                self.advance();
                Ok(s)
            }
            other => Err(Error::UnexpectedToken {
                expected: "string literal".to_string(),
                found: format!("{}", other),
            }),
        }
    }

    fn is_at_end(&self) -> bool {
        self.check(&Token::Eof)
    }

    /// Byte offset (in chars) of the current token: the start of a slice.
    fn mark(&self) -> usize {
        self.spans[self.position]
    }

    /// Source text from `start` up to the current token, trimmed.
    fn slice_from(&self, start: usize) -> String {
        let end = self.spans[self.position];
        self.source[start..end]
            .iter()
            .collect::<String>()
            .trim()
            .to_string()
    }
}

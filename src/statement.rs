//! DDL 문장 분류기
//!
//! 문장을 토큰으로 나눈 뒤 정해진 우선순위대로 각 문장 형태의 키워드 패턴을
//! 앞에서부터 맞춰봅니다. 처음 맞는 형태가 이기고, 아무것도 맞지 않으면
//! `Unsupported`가 됩니다. 패턴들은 키워드 접두사가 겹치지 않도록 만들어져
//! 있어서 형태 사이의 백트래킹은 필요 없습니다.

use crate::error::{CdcError, Result};
use crate::tokenizer::{tokenize_prefix, Token};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 복제하지 않는 시스템 데이터베이스
pub const RESERVED_DATABASES: [&str; 4] = ["mysql", "information_schema", "performance_schema", "sys"];

pub fn is_reserved_database(name: &str) -> bool {
    RESERVED_DATABASES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// 키워드 매칭 패턴
#[derive(Debug, Clone)]
pub enum Pattern {
    /// 키워드 집합 중 하나
    Literal(&'static [&'static str]),
    /// 있으면 소비하고 없어도 실패하지 않음
    Optional(Box<Pattern>),
    /// 모두 맞거나 하나도 소비하지 않음 (e.g. `IF NOT EXISTS`)
    Compound(Vec<Pattern>),
    /// 토큰 하나를 무조건 소비
    Any,
}

impl Pattern {
    pub fn keyword(words: &'static [&'static str]) -> Self {
        Pattern::Literal(words)
    }

    pub fn optional(pattern: Pattern) -> Self {
        Pattern::Optional(Box::new(pattern))
    }

    /// `pos`에서 매칭되면 다음 위치를 돌려준다
    pub fn match_at(&self, tokens: &[Token], pos: usize) -> Option<usize> {
        match self {
            Pattern::Literal(words) => {
                let token = tokens.get(pos)?;
                words
                    .iter()
                    .any(|w| token.is_keyword(w))
                    .then_some(pos + 1)
            }
            Pattern::Optional(inner) => Some(inner.match_at(tokens, pos).unwrap_or(pos)),
            Pattern::Compound(parts) => parts
                .iter()
                .try_fold(pos, |next, part| part.match_at(tokens, next)),
            Pattern::Any => Some(if pos < tokens.len() { pos + 1 } else { pos }),
        }
    }
}

fn match_sequence(patterns: &[Pattern], tokens: &[Token]) -> Option<usize> {
    patterns
        .iter()
        .try_fold(0, |pos, pattern| pattern.match_at(tokens, pos))
}

/// 문장 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    CreateTable,
    AlterTable,
    DropTable,
    CreateDatabase,
    AlterDatabase,
    DropDatabase,
    CreateIndex,
    DropIndex,
    RenameTable,
    Unsupported,
}

impl StatementKind {
    /// 분류 우선순위 (`Unsupported`는 항상 마지막)
    pub const PRIORITY: [StatementKind; 9] = [
        StatementKind::CreateDatabase,
        StatementKind::CreateTable,
        StatementKind::CreateIndex,
        StatementKind::AlterDatabase,
        StatementKind::AlterTable,
        StatementKind::DropDatabase,
        StatementKind::DropTable,
        StatementKind::DropIndex,
        StatementKind::RenameTable,
    ];

    /// 문장 앞부분의 키워드 패턴
    fn leading_pattern(self) -> Vec<Pattern> {
        use Pattern::*;
        const DATABASE: &[&str] = &["DATABASE", "SCHEMA"];
        const ONLINE: &[&str] = &["ONLINE", "OFFLINE"];
        let if_exists = || Compound(vec![Literal(&["IF"]), Literal(&["EXISTS"])]);
        let if_not_exists = || {
            Compound(vec![
                Literal(&["IF"]),
                Literal(&["NOT"]),
                Literal(&["EXISTS"]),
            ])
        };

        match self {
            StatementKind::CreateDatabase => vec![
                Literal(&["CREATE"]),
                Literal(DATABASE),
                Pattern::optional(if_not_exists()),
            ],
            StatementKind::CreateTable => vec![
                Literal(&["CREATE"]),
                Pattern::optional(Literal(&["TEMPORARY"])),
                Literal(&["TABLE"]),
                Pattern::optional(if_not_exists()),
            ],
            StatementKind::CreateIndex => vec![
                Literal(&["CREATE"]),
                Pattern::optional(Literal(ONLINE)),
                Pattern::optional(Literal(&["UNIQUE", "FULLTEXT", "SPATIAL"])),
                Literal(&["INDEX"]),
                Any,
            ],
            StatementKind::AlterDatabase => vec![Literal(&["ALTER"]), Literal(DATABASE)],
            StatementKind::AlterTable => vec![
                Literal(&["ALTER"]),
                Pattern::optional(Literal(ONLINE)),
                Pattern::optional(Literal(&["IGNORE"])),
                Literal(&["TABLE"]),
            ],
            StatementKind::DropDatabase => vec![
                Literal(&["DROP"]),
                Literal(DATABASE),
                Pattern::optional(if_exists()),
            ],
            StatementKind::DropTable => vec![
                Literal(&["DROP"]),
                Pattern::optional(Literal(&["TEMPORARY"])),
                Literal(&["TABLE", "TABLES"]),
                Pattern::optional(if_exists()),
            ],
            StatementKind::DropIndex => vec![
                Literal(&["DROP"]),
                Pattern::optional(Literal(ONLINE)),
                Literal(&["INDEX"]),
                Any,
            ],
            StatementKind::RenameTable => vec![Literal(&["RENAME"]), Literal(&["TABLE", "TABLES"])],
            StatementKind::Unsupported => vec![],
        }
    }

    pub fn is_table_statement(self) -> bool {
        matches!(
            self,
            StatementKind::CreateTable
                | StatementKind::AlterTable
                | StatementKind::DropTable
                | StatementKind::CreateIndex
                | StatementKind::DropIndex
                | StatementKind::RenameTable
        )
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 문장에서 추출한 테이블 이름 (DB는 생략될 수 있음)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub database: Option<String>,
    pub table: String,
}

impl TableRef {
    /// 생략된 DB를 이벤트의 현재 DB로 채운다
    pub fn resolve(&self, default_database: &str) -> TableName {
        TableName {
            database: self
                .database
                .clone()
                .unwrap_or_else(|| default_database.to_string()),
            table: self.table.clone(),
        }
    }
}

/// DB까지 확정된 테이블 이름
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub database: String,
    pub table: String,
}

impl TableName {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        TableName {
            database: database.into(),
            table: table.into(),
        }
    }

    /// `` `db`.`table` `` 형식
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_identifier(&self.database), quote_identifier(&self.table))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// 백틱으로 인용 (백틱은 두 번 씀)
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// 분류된 DDL 문장
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateTable {
        table: TableRef,
        temporary: bool,
    },
    AlterTable {
        table: TableRef,
        /// `ALTER TABLE ... RENAME [TO] new_name` 이면 새 이름
        renamed_to: Option<TableRef>,
    },
    DropTable {
        tables: Vec<TableRef>,
    },
    CreateDatabase {
        database: String,
    },
    AlterDatabase {
        database: Option<String>,
    },
    DropDatabase {
        database: String,
    },
    CreateIndex {
        index: String,
        table: TableRef,
    },
    DropIndex {
        index: String,
        table: TableRef,
    },
    RenameTable {
        renames: Vec<(TableRef, TableRef)>,
    },
    Unsupported,
}

impl Statement {
    /// DDL 문자열 분류
    ///
    /// 어떤 형태에도 맞지 않는 문장은 에러가 아니라 `Unsupported`.
    /// 식별자가 깨져 있으면 `UnparseableIdentifier`, 시스템 DB 대상이면
    /// `ReservedDatabase`. 토큰화 에러는 앞부분이 지원하는 형태일 때만 낸다.
    pub fn parse(sql: &str) -> Result<Statement> {
        let (tokens, lex_error) = tokenize_prefix(sql);

        for kind in StatementKind::PRIORITY {
            if let Some(pos) = match_sequence(&kind.leading_pattern(), &tokens) {
                if let Some(e) = lex_error {
                    return Err(e);
                }
                let statement = build(kind, &tokens, pos)?;
                statement.check_reserved()?;
                return Ok(statement);
            }
        }

        Ok(Statement::Unsupported)
    }

    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::CreateTable { .. } => StatementKind::CreateTable,
            Statement::AlterTable { .. } => StatementKind::AlterTable,
            Statement::DropTable { .. } => StatementKind::DropTable,
            Statement::CreateDatabase { .. } => StatementKind::CreateDatabase,
            Statement::AlterDatabase { .. } => StatementKind::AlterDatabase,
            Statement::DropDatabase { .. } => StatementKind::DropDatabase,
            Statement::CreateIndex { .. } => StatementKind::CreateIndex,
            Statement::DropIndex { .. } => StatementKind::DropIndex,
            Statement::RenameTable { .. } => StatementKind::RenameTable,
            Statement::Unsupported => StatementKind::Unsupported,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Statement::Unsupported)
    }

    /// 테이블 이름을 바꾸는 문장인지 (스키마 캐시 무효화 대상)
    pub fn does_rename_table(&self) -> bool {
        match self {
            Statement::AlterTable { renamed_to, .. } => renamed_to.is_some(),
            Statement::RenameTable { .. } => true,
            _ => false,
        }
    }

    /// 문장이 다루는 주 테이블
    pub fn primary_table(&self) -> Option<&TableRef> {
        match self {
            Statement::CreateTable { table, .. }
            | Statement::AlterTable { table, .. }
            | Statement::CreateIndex { table, .. }
            | Statement::DropIndex { table, .. } => Some(table),
            Statement::DropTable { tables } => tables.first(),
            Statement::RenameTable { renames } => renames.first().map(|(from, _)| from),
            _ => None,
        }
    }

    /// 문장 실행 전후로 정의가 바뀌는 모든 테이블
    pub fn affected_tables(&self) -> Vec<&TableRef> {
        match self {
            Statement::AlterTable {
                table,
                renamed_to: Some(new),
            } => vec![table, new],
            Statement::DropTable { tables } => tables.iter().collect(),
            Statement::RenameTable { renames } => renames
                .iter()
                .flat_map(|(from, to)| [from, to])
                .collect(),
            other => other.primary_table().into_iter().collect(),
        }
    }

    /// 이름 변경 결과 테이블
    pub fn rename_targets(&self) -> Vec<&TableRef> {
        match self {
            Statement::AlterTable {
                renamed_to: Some(new),
                ..
            } => vec![new],
            Statement::RenameTable { renames } => renames.iter().map(|(_, to)| to).collect(),
            _ => Vec::new(),
        }
    }

    /// 문장 자체가 대상으로 삼는 DB (DB 수준 문장)
    pub fn database(&self) -> Option<&str> {
        match self {
            Statement::CreateDatabase { database } | Statement::DropDatabase { database } => {
                Some(database)
            }
            Statement::AlterDatabase { database } => database.as_deref(),
            _ => None,
        }
    }

    fn check_reserved(&self) -> Result<()> {
        let mut databases: Vec<&str> = self
            .affected_tables()
            .into_iter()
            .filter_map(|t| t.database.as_deref())
            .collect();
        databases.extend(self.database());

        match databases.into_iter().find(|db| is_reserved_database(db)) {
            Some(db) => Err(CdcError::ReservedDatabase(db.to_string())),
            None => Ok(()),
        }
    }
}

/// 매칭된 키워드 뒤의 토큰에서 이름들을 추출
fn build(kind: StatementKind, tokens: &[Token], pos: usize) -> Result<Statement> {
    let mut cursor = NameCursor { tokens, pos };

    let statement = match kind {
        StatementKind::CreateTable => Statement::CreateTable {
            temporary: tokens[..pos].iter().any(|t| t.is_keyword("TEMPORARY")),
            table: cursor.table_ref()?,
        },
        StatementKind::AlterTable => {
            let table = cursor.table_ref()?;
            let renamed_to = cursor.find_table_rename()?;
            Statement::AlterTable { table, renamed_to }
        }
        StatementKind::DropTable => Statement::DropTable {
            tables: cursor.table_list()?,
        },
        StatementKind::CreateDatabase => Statement::CreateDatabase {
            database: cursor.identifier()?,
        },
        StatementKind::AlterDatabase => Statement::AlterDatabase {
            database: cursor.optional_identifier()?,
        },
        StatementKind::DropDatabase => Statement::DropDatabase {
            database: cursor.identifier()?,
        },
        StatementKind::CreateIndex | StatementKind::DropIndex => {
            // 패턴의 Any가 인덱스 이름을 소비했다
            let index = identifier_text(&tokens[pos - 1])?;
            cursor.skip_until_keyword("ON")?;
            let table = cursor.table_ref()?;
            if kind == StatementKind::CreateIndex {
                Statement::CreateIndex { index, table }
            } else {
                Statement::DropIndex { index, table }
            }
        }
        StatementKind::RenameTable => Statement::RenameTable {
            renames: cursor.rename_pairs()?,
        },
        StatementKind::Unsupported => Statement::Unsupported,
    };

    Ok(statement)
}

/// 식별자 토큰의 텍스트
fn identifier_text(token: &Token) -> Result<String> {
    match token {
        Token::Word(w) => Ok(w.clone()),
        Token::Quoted { text, .. } if !text.is_empty() => Ok(text.clone()),
        Token::Number(n) => Ok(n.clone()),
        other => Err(CdcError::UnparseableIdentifier(format!(
            "expected identifier, found {:?}",
            other
        ))),
    }
}

struct NameCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> NameCursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn identifier(&mut self) -> Result<String> {
        let token = self.peek().ok_or_else(|| {
            CdcError::UnparseableIdentifier("statement ends before identifier".to_string())
        })?;
        let text = identifier_text(token)?;
        if text.is_empty() {
            return Err(CdcError::UnparseableIdentifier("empty identifier".to_string()));
        }
        self.pos += 1;
        Ok(text)
    }

    fn optional_identifier(&mut self) -> Result<Option<String>> {
        match self.peek() {
            None => Ok(None),
            Some(Token::Word(w)) if is_database_option_keyword(w) => Ok(None),
            Some(_) => self.identifier().map(Some),
        }
    }

    /// `name` 또는 `db.name`
    fn table_ref(&mut self) -> Result<TableRef> {
        let first = self.identifier()?;
        if self.peek().map_or(false, |t| t.is_punct('.')) {
            self.pos += 1;
            let table = self.identifier()?;
            return Ok(TableRef {
                database: Some(first),
                table,
            });
        }
        Ok(TableRef {
            database: None,
            table: first,
        })
    }

    fn table_list(&mut self) -> Result<Vec<TableRef>> {
        let mut tables = vec![self.table_ref()?];
        while self.peek().map_or(false, |t| t.is_punct(',')) {
            self.pos += 1;
            tables.push(self.table_ref()?);
        }
        Ok(tables)
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        match self.peek() {
            Some(t) if t.is_keyword(keyword) => {
                self.pos += 1;
                Ok(())
            }
            other => Err(CdcError::UnparseableIdentifier(format!(
                "expected {}, found {:?}",
                keyword, other
            ))),
        }
    }

    fn skip_until_keyword(&mut self, keyword: &str) -> Result<()> {
        while let Some(token) = self.peek() {
            self.pos += 1;
            if token.is_keyword(keyword) {
                return Ok(());
            }
        }
        Err(CdcError::UnparseableIdentifier(format!(
            "missing {} clause",
            keyword
        )))
    }

    /// `a TO b [, c TO d ...]`
    fn rename_pairs(&mut self) -> Result<Vec<(TableRef, TableRef)>> {
        let mut renames = Vec::new();
        loop {
            let from = self.table_ref()?;
            self.expect_keyword("TO")?;
            let to = self.table_ref()?;
            renames.push((from, to));

            if self.peek().map_or(false, |t| t.is_punct(',')) {
                self.pos += 1;
            } else {
                return Ok(renames);
            }
        }
    }

    /// 남은 토큰에서 테이블 이름 변경 절을 찾는다.
    /// `RENAME COLUMN/INDEX/KEY`는 테이블 이름을 바꾸지 않는다.
    fn find_table_rename(&mut self) -> Result<Option<TableRef>> {
        while let Some(token) = self.peek() {
            self.pos += 1;
            if !token.is_keyword("RENAME") {
                continue;
            }
            match self.peek() {
                Some(t) if t.is_keyword("COLUMN") || t.is_keyword("INDEX") || t.is_keyword("KEY") => {
                    continue;
                }
                Some(t) if t.is_keyword("TO") || t.is_keyword("AS") => {
                    self.pos += 1;
                }
                _ => {}
            }
            return self.table_ref().map(Some);
        }
        Ok(None)
    }
}

fn is_database_option_keyword(word: &str) -> bool {
    ["DEFAULT", "CHARACTER", "CHARSET", "COLLATE", "ENCRYPTION", "READ"]
        .iter()
        .any(|k| k.eq_ignore_ascii_case(word))
}

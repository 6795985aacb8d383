//! 스키마 레지스트리
//!
//! 테이블 정의를 등록하고 schema id, 토픽, primary key를 돌려받는 경계입니다.
//! `LocalSchemaRegistry`는 프로세스 안에서 동작하는 구현입니다.

use crate::error::{CdcError, Result};
use crate::tokenizer::{tokenize, Token};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, info};

/// 등록 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRegistration {
    pub database: String,
    pub table: String,
    /// DDL 적용 전 CREATE 문
    pub before_create: Option<String>,
    /// DDL 적용 후 CREATE 문
    pub after_create: Option<String>,
    pub ddl: Option<String>,
}

impl SchemaRegistration {
    /// DDL 없이 현재 정의만으로 등록
    pub fn current(database: impl Into<String>, table: impl Into<String>, create: String) -> Self {
        SchemaRegistration {
            database: database.into(),
            table: table.into(),
            before_create: None,
            after_create: Some(create),
            ddl: None,
        }
    }
}

/// 등록 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSchema {
    pub schema_id: u64,
    pub topic: String,
    pub primary_keys: Vec<String>,
    /// 컬럼 이름 (row 값과 같은 순서)
    pub columns: Vec<String>,
}

#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// 같은 정의를 다시 등록하면 같은 결과를 돌려준다
    async fn register_or_fetch(&self, request: &SchemaRegistration) -> Result<RegisteredSchema>;
}

#[derive(Default)]
struct LocalState {
    schemas: HashMap<(String, String, String), RegisteredSchema>,
    versions: HashMap<(String, String), u32>,
    next_id: u64,
}

pub struct LocalSchemaRegistry {
    namespace: String,
    primary_key: Regex,
    state: Mutex<LocalState>,
}

impl LocalSchemaRegistry {
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let primary_key = Regex::new(r"(?i)PRIMARY\s+KEY\s*(?:USING\s+\w+\s*)?\(((?:[^()]|\([^()]*\))*)\)")
            .map_err(|e| CdcError::Registry(e.to_string()))?;

        Ok(LocalSchemaRegistry {
            namespace: namespace.into(),
            primary_key,
            state: Mutex::new(LocalState {
                next_id: 1,
                ..Default::default()
            }),
        })
    }

    /// 테이블 수준 `PRIMARY KEY (...)` 또는 컬럼 수준 `... PRIMARY KEY`
    fn primary_keys(&self, columns: &[ColumnDefinition]) -> Vec<String> {
        for column in columns {
            if let Some(captures) = column.is_constraint.then(|| self.primary_key.captures(&column.text)).flatten() {
                return captures[1]
                    .split(',')
                    .map(|part| {
                        let name = part.split('(').next().unwrap_or(part);
                        name.trim().trim_matches('`').trim_matches('"').to_string()
                    })
                    .filter(|name| !name.is_empty())
                    .collect();
            }
        }

        columns
            .iter()
            .filter(|c| !c.is_constraint && c.text.to_ascii_uppercase().contains("PRIMARY KEY"))
            .filter_map(|c| c.name.clone())
            .collect()
    }
}

#[async_trait]
impl SchemaRegistry for LocalSchemaRegistry {
    async fn register_or_fetch(&self, request: &SchemaRegistration) -> Result<RegisteredSchema> {
        let create = request.after_create.as_deref().ok_or_else(|| {
            CdcError::Registry(format!(
                "no table definition to register for {}.{}",
                request.database, request.table
            ))
        })?;

        let key = (request.database.clone(), request.table.clone(), create.to_string());
        let mut state = self.state.lock();
        if let Some(existing) = state.schemas.get(&key) {
            debug!("Schema for {}.{} already registered", request.database, request.table);
            return Ok(existing.clone());
        }

        let definitions = column_definitions(create);
        let version = {
            let version = state
                .versions
                .entry((request.database.clone(), request.table.clone()))
                .or_insert(0);
            *version += 1;
            *version
        };
        let schema_id = state.next_id;
        state.next_id += 1;

        let schema = RegisteredSchema {
            schema_id,
            topic: format!(
                "{}.{}.{}.{}",
                self.namespace, request.database, request.table, version
            ),
            primary_keys: self.primary_keys(&definitions),
            columns: definitions.into_iter().filter_map(|c| c.name).collect(),
        };

        info!(
            "Registered schema {} for {}.{} (topic {})",
            schema.schema_id, request.database, request.table, schema.topic
        );
        state.schemas.insert(key, schema.clone());
        Ok(schema)
    }
}

/// CREATE TABLE 본문의 항목 하나
struct ColumnDefinition {
    /// 컬럼이면 이름, 인덱스/제약 조건이면 `None`
    name: Option<String>,
    is_constraint: bool,
    text: String,
}

const CONSTRAINT_KEYWORDS: [&str; 9] = [
    "PRIMARY", "KEY", "INDEX", "UNIQUE", "CONSTRAINT", "FOREIGN", "FULLTEXT", "SPATIAL", "CHECK",
];

/// 괄호 안 최상위 쉼표로 항목을 나눈다
fn column_definitions(create: &str) -> Vec<ColumnDefinition> {
    let body = match (create.find('('), create.rfind(')')) {
        (Some(open), Some(close)) if open < close => &create[open + 1..close],
        _ => return Vec::new(),
    };

    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '`' | '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    items.push(&body[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    items.push(&body[start..]);

    items
        .into_iter()
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let first = tokenize(item).ok().and_then(|tokens| tokens.into_iter().next());
            let (name, is_constraint) = match first {
                Some(Token::Quoted { text, .. }) => (Some(text), false),
                Some(Token::Word(word)) if CONSTRAINT_KEYWORDS.contains(&word.to_ascii_uppercase().as_str()) => {
                    (None, true)
                }
                Some(Token::Word(word)) => (Some(word), false),
                _ => (None, true),
            };
            ColumnDefinition {
                name,
                is_constraint,
                text: item.to_string(),
            }
        })
        .collect()
}

//! DDL 문장 토크나이저
//!
//! 공백과 주석은 버리고 키워드/식별자, 인용 식별자, 문자열, 숫자, 구두점
//! 토큰만 남깁니다. MySQL 버전 주석 (`/*!50100 ... */`)은 서버가 실행하는
//! 코드이므로 주석으로 취급하지 않고 내용을 토큰화합니다.

use crate::error::{CdcError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// 인용되지 않은 단어 (키워드 또는 식별자)
    Word(String),
    /// `` `name` `` 또는 `"name"` (따옴표 중복은 이미 풀린 상태)
    Quoted { text: String, quote: char },
    /// `'text'`
    Literal(String),
    Number(String),
    Punct(char),
}

impl Token {
    /// 대소문자 구분 없이 키워드 비교
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    pub fn is_punct(&self, c: char) -> bool {
        matches!(self, Token::Punct(p) if *p == c)
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    tokenize_into(sql, &mut tokens)?;
    Ok(tokens)
}

/// 실패하더라도 실패 지점 앞까지의 토큰은 돌려준다
pub fn tokenize_prefix(sql: &str) -> (Vec<Token>, Option<CdcError>) {
    let mut tokens = Vec::new();
    let error = tokenize_into(sql, &mut tokens).err();
    (tokens, error)
}

fn tokenize_into(sql: &str, tokens: &mut Vec<Token>) -> Result<()> {
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // -- 주석은 공백이 뒤따라야 한다
        if c == '-' && chars.get(i + 1) == Some(&'-') {
            let next = chars.get(i + 2);
            if next.map_or(true, |n| n.is_whitespace()) {
                i = skip_line(&chars, i);
                continue;
            }
        }

        if c == '#' {
            i = skip_line(&chars, i);
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            if chars.get(i + 2) == Some(&'!') {
                // 버전 주석: 숫자를 건너뛰고 내용만 남긴다
                i += 3;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                continue;
            }
            i = skip_block_comment(&chars, i)?;
            continue;
        }

        if c == '*' && chars.get(i + 1) == Some(&'/') {
            // 버전 주석의 끝
            i += 2;
            continue;
        }

        if c == '`' || c == '"' {
            let (text, next) = read_quoted(&chars, i, c)?;
            tokens.push(Token::Quoted { text, quote: c });
            i = next;
            continue;
        }

        if c == '\'' {
            let (text, next) = read_quoted(&chars, i, c)?;
            tokens.push(Token::Literal(text));
            i = next;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            // MySQL은 숫자로 시작하는 식별자를 허용한다 (e.g. 1table)
            if text.chars().all(|c| c.is_ascii_digit()) {
                tokens.push(Token::Number(text));
            } else {
                tokens.push(Token::Word(text));
            }
            continue;
        }

        if is_word_char(c) {
            let start = i;
            while i < chars.len() && is_word_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
            continue;
        }

        tokens.push(Token::Punct(c));
        i += 1;
    }

    Ok(())
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn skip_line(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i] != '\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(chars: &[char], start: usize) -> Result<usize> {
    let mut i = start + 2;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return Ok(i + 2);
        }
        i += 1;
    }
    Err(CdcError::UnparseableIdentifier(
        "unterminated block comment".to_string(),
    ))
}

/// 따옴표로 감싼 구간을 읽는다. 같은 따옴표 두 개는 하나로 푼다.
/// 백슬래시 이스케이프는 문자열(`'`, `"`)에만 있다.
fn read_quoted(chars: &[char], start: usize, quote: char) -> Result<(String, usize)> {
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                text.push(quote);
                i += 2;
                continue;
            }
            return Ok((text, i + 1));
        }
        if c == '\\' && quote != '`' {
            if let Some(&escaped) = chars.get(i + 1) {
                text.push(escaped);
                i += 2;
                continue;
            }
        }
        text.push(c);
        i += 1;
    }

    Err(CdcError::UnparseableIdentifier(format!(
        "unterminated {} quoted text: {}",
        quote,
        chars[start..].iter().collect::<String>()
    )))
}

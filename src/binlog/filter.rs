//! 데이터베이스/테이블 필터
//!
//! `--databases`, `--tables`, `--exclude-databases`, `--exclude-tables` 에 주는
//! glob 목록을 정규식 집합으로 컴파일합니다. `*`, `%` 는 `.*`, `?` 는 `.` 입니다.
//! 점이 없는 테이블 패턴은 모든 데이터베이스의 테이블에 적용됩니다.

use crate::error::{BinlogError, Result};
use regex::{Regex, RegexSet};
use std::fmt;
use std::sync::Arc;

/// glob 패턴을 고정된(^...$) 정규식 문자열로
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' | '%' => out.push_str(".*"),
            '?' => out.push('.'),
            c => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
    }
    out.push('$');
    out
}

fn compile(patterns: &[String]) -> Result<Option<RegexSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    RegexSet::new(patterns)
        .map(Some)
        .map_err(|e| BinlogError::FilterError(e.to_string()))
}

/// 테이블 패턴 정규화: "t1" → "*.t1"
fn table_glob(pattern: &str) -> String {
    if pattern.contains('.') {
        pattern.to_string()
    } else {
        format!("*.{}", pattern)
    }
}

/// 컴파일된 DB/테이블 필터
#[derive(Clone)]
pub struct DdlFilter {
    include_db: Option<RegexSet>,
    exclude_db: Option<RegexSet>,
    include_table: Option<RegexSet>,
    exclude_table: Option<RegexSet>,
}

impl fmt::Debug for DdlFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let patterns = |set: &Option<RegexSet>| set.as_ref().map(|s| s.patterns().to_vec()).unwrap_or_default();
        f.debug_struct("DdlFilter")
            .field("include_db", &patterns(&self.include_db))
            .field("exclude_db", &patterns(&self.exclude_db))
            .field("include_table", &patterns(&self.include_table))
            .field("exclude_table", &patterns(&self.exclude_table))
            .finish()
    }
}

impl DdlFilter {
    pub fn new(
        include_db: &[String],
        include_table: &[String],
        exclude_db: &[String],
        exclude_table: &[String],
    ) -> Result<Self> {
        let regexes = |globs: &[String]| globs.iter().map(|g| glob_to_regex(g.trim())).collect::<Vec<_>>();
        let mut excluded_tables: Vec<String> = exclude_table.iter().map(|t| table_glob(t.trim())).collect();
        // 제외된 DB 아래 테이블도 제외
        excluded_tables.extend(exclude_db.iter().map(|db| format!("{}.*", db.trim())));
        let included_tables: Vec<String> = include_table.iter().map(|t| table_glob(t.trim())).collect();

        Ok(DdlFilter {
            include_db: compile(&regexes(include_db))?,
            exclude_db: compile(&regexes(exclude_db))?,
            include_table: compile(&regexes(&included_tables))?,
            exclude_table: compile(&regexes(&excluded_tables))?,
        })
    }

    /// 쉼표로 구분된 목록으로 생성
    pub fn from_lists(databases: &str, tables: &str, exclude_databases: &str, exclude_tables: &str) -> Result<Self> {
        let split = |s: &str| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        Self::new(
            &split(databases),
            &split(tables),
            &split(exclude_databases),
            &split(exclude_tables),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.include_db.is_none()
            && self.exclude_db.is_none()
            && self.include_table.is_none()
            && self.exclude_table.is_none()
    }

    pub fn match_db(&self, db: &str) -> bool {
        if let Some(include) = &self.include_db {
            if !include.is_match(db) {
                return false;
            }
        }
        !self.exclude_db.as_ref().is_some_and(|exclude| exclude.is_match(db))
    }

    pub fn match_table(&self, db: &str, table: &str) -> bool {
        if !self.match_db(db) {
            return false;
        }
        let name = format!("{}.{}", db, table);
        if let Some(include) = &self.include_table {
            if !include.is_match(&name) {
                return false;
            }
        }
        !self.exclude_table.as_ref().is_some_and(|exclude| exclude.is_match(&name))
    }

    /// 쿼리가 참조하는 테이블 중 하나라도 필터를 통과하면 true.
    /// 참조가 없으면 (BEGIN 등) 통과
    pub fn match_refs(&self, default_schema: &str, refs: &[TableRef]) -> bool {
        if refs.is_empty() {
            return true;
        }
        refs.iter().any(|r| {
            let schema = r.schema.as_deref().unwrap_or(default_schema);
            match &r.table {
                Some(table) => self.match_table(schema, table),
                None => self.match_db(schema),
            }
        })
    }
}

/// 쿼리가 참조하는 (schema, table). DB 단위 문장은 table 없음
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: Option<String>,
}

impl TableRef {
    fn from_name(name: &str) -> Self {
        let clean = |s: &str| s.trim().trim_matches('`').to_string();
        match name.split_once('.') {
            Some((schema, table)) => TableRef {
                schema: Some(clean(schema)),
                table: Some(clean(table)),
            },
            None => TableRef {
                schema: None,
                table: Some(clean(name)),
            },
        }
    }
}

/// 쿼리 문자열에서 참조 테이블을 추출
pub trait StatementParser: Send + Sync {
    fn parse_tables(&self, sql: &str) -> Result<Vec<TableRef>>;
}

/// 정규식 기반 기본 파서 (DDL 과 단순 DML 만 인식)
#[derive(Debug, Clone)]
pub struct SimpleStatementParser {
    table: Regex,
    dml: Regex,
    database: Regex,
    rename: Regex,
}

const IDENT: &str = r"((?:`[^`]+`|[\w$]+)(?:\s*\.\s*(?:`[^`]+`|[\w$]+))?)";

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| BinlogError::FilterError(e.to_string()))
}

impl SimpleStatementParser {
    pub fn new() -> Result<Self> {
        Ok(SimpleStatementParser {
            table: regex(&format!(
                r"(?is)^\s*(?:CREATE|ALTER|DROP|TRUNCATE)\s+(?:TEMPORARY\s+)?(?:TABLE\s+)?(?:IF\s+(?:NOT\s+)?EXISTS\s+)?{}",
                IDENT
            ))?,
            dml: regex(&format!(
                r"(?is)^\s*(?:INSERT\s+(?:IGNORE\s+)?INTO|REPLACE\s+INTO|UPDATE|DELETE\s+FROM)\s+{}",
                IDENT
            ))?,
            database: regex(
                r"(?is)^\s*(?:CREATE|ALTER|DROP)\s+(?:DATABASE|SCHEMA)\s+(?:IF\s+(?:NOT\s+)?EXISTS\s+)?(`[^`]+`|[\w$]+)",
            )?,
            rename: regex(&format!(r"(?is){}\s+TO\s+{}", IDENT, IDENT))?,
        })
    }
}

impl StatementParser for SimpleStatementParser {
    fn parse_tables(&self, sql: &str) -> Result<Vec<TableRef>> {
        let trimmed = sql.trim_start();

        if let Some(caps) = self.database.captures(trimmed) {
            return Ok(vec![TableRef {
                schema: Some(caps[1].trim_matches('`').to_string()),
                table: None,
            }]);
        }
        let is_rename = trimmed
            .get(..6)
            .is_some_and(|head| head.eq_ignore_ascii_case("RENAME"));
        if is_rename {
            let mut refs = Vec::new();
            for caps in self.rename.captures_iter(&trimmed[6..]) {
                refs.push(TableRef::from_name(&caps[1]));
                refs.push(TableRef::from_name(&caps[2]));
            }
            return Ok(refs);
        }
        if let Some(caps) = self.table.captures(trimmed) {
            let name = &caps[1];
            // CREATE INDEX/VIEW 등은 테이블 이름이 아님
            let keyword = name.trim_matches('`').to_ascii_uppercase();
            if matches!(
                keyword.as_str(),
                "INDEX" | "VIEW" | "USER" | "TRIGGER" | "PROCEDURE" | "FUNCTION" | "EVENT" | "UNIQUE"
            ) {
                return Ok(Vec::new());
            }
            return Ok(vec![TableRef::from_name(name)]);
        }
        if let Some(caps) = self.dml.captures(trimmed) {
            return Ok(vec![TableRef::from_name(&caps[1])]);
        }
        Ok(Vec::new())
    }
}

/// 기본 파서 핸들
pub fn default_statement_parser() -> Result<Arc<dyn StatementParser>> {
    Ok(Arc::new(SimpleStatementParser::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("db_*"), "^db_.*$");
        assert_eq!(glob_to_regex("t?%"), "^t..*$");
        assert_eq!(glob_to_regex("a.b"), r"^a\.b$");
    }

    #[test]
    fn test_include_and_exclude() {
        let filter = DdlFilter::new(&list(&["shop*"]), &[], &list(&["shop_tmp"]), &list(&["shop.audit_*"])).unwrap();
        assert!(filter.match_db("shop"));
        assert!(!filter.match_db("other"));
        assert!(!filter.match_db("shop_tmp"));
        assert!(filter.match_table("shop", "orders"));
        assert!(!filter.match_table("shop", "audit_2024"));
        assert!(!filter.match_table("shop_tmp", "orders"));
    }

    #[test]
    fn test_table_pattern_without_schema() {
        let filter = DdlFilter::from_lists("", "users, orders", "", "").unwrap();
        assert!(filter.match_table("a", "users"));
        assert!(filter.match_table("b", "orders"));
        assert!(!filter.match_table("a", "items"));
        assert!(DdlFilter::from_lists("", "", "", "").unwrap().is_empty());
    }

    #[test]
    fn test_statement_parser() {
        let parser = SimpleStatementParser::new().unwrap();
        assert_eq!(
            parser.parse_tables("CREATE TABLE IF NOT EXISTS `shop`.`orders` (id int)").unwrap(),
            vec![TableRef {
                schema: Some("shop".into()),
                table: Some("orders".into())
            }]
        );
        assert_eq!(parser.parse_tables("alter table t1 add column c int").unwrap()[0].table.as_deref(), Some("t1"));
        assert_eq!(parser.parse_tables("DROP DATABASE old").unwrap()[0].schema.as_deref(), Some("old"));
        assert_eq!(parser.parse_tables("RENAME TABLE a TO b, c.d TO c.e").unwrap().len(), 4);
        assert!(parser.parse_tables("BEGIN").unwrap().is_empty());
        assert!(parser.parse_tables("CREATE INDEX idx ON t (c)").unwrap().is_empty());
    }

    #[test]
    fn test_match_refs() {
        let filter = DdlFilter::from_lists("shop", "", "", "").unwrap();
        let parser = SimpleStatementParser::new().unwrap();
        let refs = parser.parse_tables("ALTER TABLE orders ADD c INT").unwrap();
        assert!(filter.match_refs("shop", &refs));
        assert!(!filter.match_refs("other", &refs));
        assert!(filter.match_refs("other", &[]));
    }
}

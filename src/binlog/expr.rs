//! 행 필터 식 (`--rows-filter`)
//!
//! 예: `col[0] > 100 and (name = 'kim' or col[2] is null)`
//!
//! - 컬럼 참조: `col[i]` (0부터) 또는 컬럼 이름 (table map 에 이름이 있을 때)
//! - 비교: `=`, `==`, `!=`, `<>`, `<`, `<=`, `>`, `>=`, `is [not] null`, `[not] in (...)`
//! - 논리: `and`/`&&`, `or`/`||`, `not`/`!`
//! - 리터럴: 숫자, '문자열' / "문자열", `null`, `true`, `false`

use crate::error::{BinlogError, Result};
use crate::events::TableMapEvent;
use crate::types::CellValue;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(Operator),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn filter_error(msg: impl Into<String>) -> BinlogError {
    BinlogError::FilterError(msg.into())
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(Operator::Eq));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(Operator::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Op(Operator::Not));
                i += 1;
            }
            '<' => match next {
                Some('=') => {
                    tokens.push(Token::Op(Operator::Le));
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Op(Operator::Ne));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(Operator::Lt));
                    i += 1;
                }
            },
            '>' => {
                if next == Some('=') {
                    tokens.push(Token::Op(Operator::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Operator::Gt));
                    i += 1;
                }
            }
            '&' if next == Some('&') => {
                tokens.push(Token::Op(Operator::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Op(Operator::Or));
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(filter_error("unterminated string literal")),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                s.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .map(|p| start + p)
                    .ok_or_else(|| filter_error("unterminated quoted identifier"))?;
                tokens.push(Token::Ident(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E')) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| filter_error(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphanumeric() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$')) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::Op(Operator::And)),
                    "or" => tokens.push(Token::Op(Operator::Or)),
                    "not" => tokens.push(Token::Op(Operator::Not)),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(filter_error(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

/// 식에서 참조하는 컬럼
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Column(ColumnRef),
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Compare(Operator, Operand, Operand),
    IsNull(Operand, bool),
    In(Operand, Vec<Operand>, bool),
    Value(Operand),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(filter_error(format!("expected {:?}, found {:?}", token, other))),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op(Operator::Or)) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::Op(Operator::And)) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Op(Operator::Not)) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        let left = self.parse_operand()?;

        if self.peek_keyword("is") {
            self.pos += 1;
            let negated = self.peek() == Some(&Token::Op(Operator::Not));
            if negated {
                self.pos += 1;
            }
            if !self.peek_keyword("null") {
                return Err(filter_error("expected NULL after IS"));
            }
            self.pos += 1;
            return Ok(Expr::IsNull(left, negated));
        }

        let negated_in = self.peek() == Some(&Token::Op(Operator::Not))
            && matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(w)) if w.eq_ignore_ascii_case("in"));
        if negated_in || self.peek_keyword("in") {
            self.pos += if negated_in { 2 } else { 1 };
            self.expect(Token::LParen)?;
            let mut items = vec![self.parse_operand()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                items.push(self.parse_operand()?);
            }
            self.expect(Token::RParen)?;
            return Ok(Expr::In(left, items, negated_in));
        }

        match self.peek() {
            Some(Token::Op(op))
                if matches!(
                    op,
                    Operator::Eq | Operator::Ne | Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge
                ) =>
            {
                let op = *op;
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Expr::Compare(op, left, right))
            }
            _ => Ok(Expr::Value(left)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Operand::Number(n)),
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Ident(word)) => {
                if word.eq_ignore_ascii_case("col") && self.peek() == Some(&Token::LBracket) {
                    self.pos += 1;
                    let index = match self.next() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                        other => return Err(filter_error(format!("invalid column index {:?}", other))),
                    };
                    self.expect(Token::RBracket)?;
                    return Ok(Operand::Column(ColumnRef::Index(index)));
                }
                match word.to_ascii_lowercase().as_str() {
                    "null" => Ok(Operand::Null),
                    "true" => Ok(Operand::Bool(true)),
                    "false" => Ok(Operand::Bool(false)),
                    _ => Ok(Operand::Column(ColumnRef::Name(word))),
                }
            }
            other => Err(filter_error(format!("unexpected token {:?}", other))),
        }
    }
}

/// 평가 중 값
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Number(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    fn from_cell(cell: &CellValue) -> Value {
        match cell {
            CellValue::Null => Value::Null,
            CellValue::String(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::DateTime(s)
            | CellValue::Timestamp(s)
            | CellValue::Json(s) => Value::Str(s.clone()),
            CellValue::Bytes(b) => Value::Str(String::from_utf8_lossy(b).into_owned()),
            other => other
                .as_f64()
                .map(Value::Number)
                .unwrap_or_else(|| Value::Str(other.to_string())),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
        }
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Number(a), Value::Str(b)) => b.parse::<f64>().ok().and_then(|b| a.partial_cmp(&b)),
            (Value::Str(a), Value::Number(b)) => a.parse::<f64>().ok().and_then(|a| a.partial_cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Number(b)) => (*a as u8 as f64).partial_cmp(b),
            (Value::Number(a), Value::Bool(b)) => a.partial_cmp(&(*b as u8 as f64)),
            _ => None,
        }
    }
}

/// 컴파일된 행 필터
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    source: String,
    expr: Expr,
}

impl RowFilter {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(filter_error("empty row filter"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(filter_error(format!(
                "unexpected trailing token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(RowFilter {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 한 행 이미지에 대해 평가
    pub fn matches(&self, row: &[CellValue], table: &TableMapEvent) -> Result<bool> {
        eval(&self.expr, row, table)
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for RowFilter {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        RowFilter::parse(s)
    }
}

fn resolve(operand: &Operand, row: &[CellValue], table: &TableMapEvent) -> Result<Value> {
    Ok(match operand {
        Operand::Number(n) => Value::Number(*n),
        Operand::Str(s) => Value::Str(s.clone()),
        Operand::Bool(b) => Value::Bool(*b),
        Operand::Null => Value::Null,
        Operand::Column(column) => {
            let index = match column {
                ColumnRef::Index(i) => *i,
                ColumnRef::Name(name) => table.column_index(name).ok_or_else(|| {
                    filter_error(format!("unknown column '{}' in {}.{}", name, table.schema, table.table))
                })?,
            };
            let cell = row.get(index).ok_or_else(|| {
                filter_error(format!("column index {} out of range ({} columns)", index, row.len()))
            })?;
            Value::from_cell(cell)
        }
    })
}

fn eval(expr: &Expr, row: &[CellValue], table: &TableMapEvent) -> Result<bool> {
    Ok(match expr {
        Expr::And(a, b) => eval(a, row, table)? && eval(b, row, table)?,
        Expr::Or(a, b) => eval(a, row, table)? || eval(b, row, table)?,
        Expr::Not(inner) => !eval(inner, row, table)?,
        Expr::Value(operand) => resolve(operand, row, table)?.truthy(),
        Expr::IsNull(operand, negated) => (resolve(operand, row, table)? == Value::Null) != *negated,
        Expr::In(operand, items, negated) => {
            let value = resolve(operand, row, table)?;
            let mut found = false;
            for item in items {
                if value.compare(&resolve(item, row, table)?) == Some(Ordering::Equal) {
                    found = true;
                    break;
                }
            }
            found != *negated
        }
        Expr::Compare(op, left, right) => {
            let left = resolve(left, row, table)?;
            let right = resolve(right, row, table)?;
            let Some(ordering) = left.compare(&right) else {
                return Ok(false);
            };
            match op {
                Operator::Eq => ordering == Ordering::Equal,
                Operator::Ne => ordering != Ordering::Equal,
                Operator::Lt => ordering == Ordering::Less,
                Operator::Le => ordering != Ordering::Greater,
                Operator::Gt => ordering == Ordering::Greater,
                Operator::Ge => ordering != Ordering::Less,
                Operator::And | Operator::Or | Operator::Not => false,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableMapEvent {
        TableMapEvent {
            table_id: 1,
            flags: 0,
            schema: "shop".into(),
            table: "orders".into(),
            column_count: 3,
            column_types: vec![3, 15, 15],
            column_meta: vec![0, 64, 64],
            null_bitmap: vec![0b100],
            signedness: None,
            column_names: vec!["id".into(), "name".into(), "note".into()],
            primary_key: vec![0],
            enum_values: Vec::new(),
            set_values: Vec::new(),
            optional_metadata: Vec::new(),
        }
    }

    fn row() -> Vec<CellValue> {
        vec![CellValue::Signed(150), CellValue::String("kim".into()), CellValue::Null]
    }

    fn check(expr: &str) -> bool {
        RowFilter::parse(expr).unwrap().matches(&row(), &table()).unwrap()
    }

    #[test]
    fn test_comparisons() {
        assert!(check("col[0] > 100"));
        assert!(check("col[0] = 150"));
        assert!(!check("col[0] <> 150"));
        assert!(check("name == 'kim'"));
        assert!(check("`name` != \"lee\""));
        assert!(!check("col[0] < -1"));
    }

    #[test]
    fn test_logic_and_null() {
        assert!(check("col[0] >= 150 and (name = 'lee' or note is null)"));
        assert!(!check("not col[2] is null"));
        assert!(check("note is not null || id in (1, 150)"));
        assert!(check("id not in (1, 2) && !(name = 'x')"));
        // NULL과의 비교는 거짓
        assert!(!check("note = null"));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(RowFilter::parse("col[0] >"), Err(BinlogError::FilterError(_))));
        assert!(RowFilter::parse("'open").is_err());
        assert!(RowFilter::parse("").is_err());
        assert!(RowFilter::parse("a = 1 b").is_err());
        let filter = RowFilter::parse("missing = 1").unwrap();
        assert!(filter.matches(&row(), &table()).is_err());
        let filter = RowFilter::parse("col[9] = 1").unwrap();
        assert!(filter.matches(&row(), &table()).is_err());
    }
}

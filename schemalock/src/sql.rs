//! Statement templates with `:name` tokens and their rendering into a
//! database's placeholder dialect.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use crate::db::Value;
use crate::error::UnknownDialect;

/// How a database expects bound parameters to appear in SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// `?` for every parameter, bound by position (SQLite, MySQL).
    QuestionMark,
    /// `prefix` followed by the 1-based parameter index, e.g. `$1` (PostgreSQL).
    Indexed(String),
    /// Tokens stay in the text and are bound by name.
    Named,
}

impl Dialect {
    pub fn postgres() -> Self {
        Self::Indexed("$".to_string())
    }

    pub fn oracle() -> Self {
        Self::Indexed(":".to_string())
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuestionMark => f.write_str("question-mark"),
            Self::Indexed(prefix) => write!(f, "indexed:{prefix}"),
            Self::Named => f.write_str("named"),
        }
    }
}

impl FromStr for Dialect {
    type Err = UnknownDialect;

    /// Accepts `question-mark` (or `?`), `named`, `indexed` (same as `$`),
    /// `indexed:<prefix>`, and a bare `$` or `:` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "?" | "question-mark" | "questionmark" => Ok(Self::QuestionMark),
            "named" => Ok(Self::Named),
            "$" | "indexed" => Ok(Self::postgres()),
            ":" => Ok(Self::oracle()),
            other => match other.strip_prefix("indexed:") {
                Some(prefix) if !prefix.is_empty() => Ok(Self::Indexed(prefix.to_string())),
                _ => Err(UnknownDialect(other.to_string())),
            },
        }
    }
}

/// A SQL template plus the named arguments bound to it, in bind order.
///
/// ```
/// use schemalock::{Dialect, Statement};
///
/// let compiled = Statement::new("select * from t where a = :a or b = :a")
///     .arg("a", 7_i64)
///     .render(&Dialect::postgres());
/// assert_eq!(compiled.sql, "select * from t where a = $1 or b = $1");
/// assert_eq!(compiled.params.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    args: Vec<(String, Value)>,
}

/// Parameters of a rendered statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Params {
    pub fn len(&self) -> usize {
        match self {
            Self::Positional(values) => values.len(),
            Self::Named(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A statement rendered for one dialect, ready to hand to a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub params: Params,
}

impl Compiled {
    /// Raw SQL with no parameters, e.g. a migration script.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Params::Positional(Vec::new()),
        }
    }
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Bind `value` to every `:name` token. Binding a name twice keeps both.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((name.into(), value.into()));
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn args(&self) -> &[(String, Value)] {
        &self.args
    }

    pub fn render(&self, dialect: &Dialect) -> Compiled {
        if self.args.is_empty() {
            return Compiled {
                sql: self.sql.clone(),
                params: match dialect {
                    Dialect::Named => Params::Named(Vec::new()),
                    _ => Params::Positional(Vec::new()),
                },
            };
        }

        match dialect {
            Dialect::QuestionMark => self.render_question_mark(),
            Dialect::Indexed(prefix) => self.render_indexed(prefix),
            Dialect::Named => Compiled {
                sql: self.sql.clone(),
                params: Params::Named(self.args.clone()),
            },
        }
    }

    fn render_question_mark(&self) -> Compiled {
        // Values follow textual order, so a name used twice is passed twice.
        let mut found: Vec<(usize, usize, &Value)> = Vec::new();
        for (name, value) in &self.args {
            for offset in token_offsets(&self.sql, name) {
                found.push((offset, name.len() + 1, value));
            }
        }
        found.sort_by_key(|(offset, len, _)| (*offset, Reverse(*len)));
        // Tokens that start inside an earlier token (`:a:b` with both `a:b`
        // and `b` bound) are not placeholders.
        let mut cursor = 0;
        let mut last = None;
        found.retain(|(offset, len, _)| {
            if last == Some((*offset, *len)) {
                return true;
            }
            if *offset < cursor {
                return false;
            }
            last = Some((*offset, *len));
            cursor = offset + len;
            true
        });

        let mut replacements: Vec<(usize, usize, String)> = found
            .iter()
            .map(|(offset, len, _)| (*offset, *len, "?".to_string()))
            .collect();
        replacements.dedup_by_key(|(offset, _, _)| *offset);

        Compiled {
            sql: splice(&self.sql, &replacements),
            params: Params::Positional(found.into_iter().map(|(_, _, v)| v.clone()).collect()),
        }
    }

    fn render_indexed(&self, prefix: &str) -> Compiled {
        let mut replacements: Vec<(usize, usize, String)> = Vec::new();
        for (index, (name, _)) in self.args.iter().enumerate() {
            // A repeated binding shares the index of its first occurrence.
            if self.args[..index].iter().any(|(earlier, _)| earlier == name) {
                continue;
            }
            for offset in token_offsets(&self.sql, name) {
                replacements.push((offset, name.len() + 1, format!("{prefix}{}", index + 1)));
            }
        }
        replacements.sort_by_key(|(offset, len, _)| (*offset, Reverse(*len)));

        Compiled {
            sql: splice(&self.sql, &replacements),
            params: Params::Positional(self.args.iter().map(|(_, v)| v.clone()).collect()),
        }
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Byte offsets of every `:name` token in `sql` that is not the prefix of a
/// longer token.
fn token_offsets(sql: &str, name: &str) -> Vec<usize> {
    let token = format!(":{name}");
    let bytes = sql.as_bytes();
    sql.match_indices(&token)
        .map(|(offset, _)| offset)
        .filter(|offset| {
            bytes
                .get(offset + token.len())
                .map_or(true, |next| !is_ident_byte(*next))
        })
        .collect()
}

fn splice(sql: &str, replacements: &[(usize, usize, String)]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (offset, len, with) in replacements {
        if *offset < cursor {
            continue;
        }
        out.push_str(&sql[cursor..*offset]);
        out.push_str(with);
        cursor = offset + len;
    }
    out.push_str(&sql[cursor..]);
    out
}

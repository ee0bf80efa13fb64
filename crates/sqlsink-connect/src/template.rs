//! SQL template compiler
//!
//! A channel is bound to one `INSERT` statement with `${field}` placeholders.
//! Compiling it yields two templates:
//!
//! - the **insert template**: the whole statement, rendered once per record
//! - the **batch template**: only the value tuple after `VALUES`, rendered
//!   once per record and appended to the batch prefix
//!
//! ```text
//! INSERT INTO t (a, b) VALUES (${a}, ${b})
//! |------ batch prefix -------||- batch -|
//! ```
//!
//! The split is purely textual: `insert into` or `values` inside string
//! literals or comments will confuse it. Channel compatibility depends on
//! these exact semantics.

use std::fmt;
use std::sync::LazyLock;

use crate::error::ParseError;

/// Fixed command fragment every batch statement starts with
pub const BATCH_COMMAND_PREFIX: &str = "INSERT INTO";

static INSERT_INTO_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)INSERT INTO")
        .expect("boundary regex pattern is invalid - this is a bug")
});

static VALUES_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\bVALUES\b").expect("VALUES regex pattern is invalid - this is a bug")
});

/// Dotted path naming a record field, e.g. `payload.temp`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(String);

impl FieldPath {
    /// Create a path from its textual form
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The full path text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path split at dots
    pub fn segments(&self) -> std::str::Split<'_, char> {
        self.0.split('.')
    }

    fn is_valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One piece of a compiled template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text copied verbatim
    Literal(String),
    /// Replaced by a record field at render time
    Placeholder(FieldPath),
}

/// An ordered sequence of literal and placeholder segments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Scan `text` for `${path}` markers.
    ///
    /// A `${` without a closing brace, with an empty path, or with characters
    /// outside `[A-Za-z0-9_.-]` is kept as literal text.
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let path = after
                .find('}')
                .map(|end| &after[..end])
                .filter(|p| !p.is_empty() && p.chars().all(FieldPath::is_valid_char));

            match path {
                Some(path) => {
                    literal.push_str(&rest[..start]);
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(FieldPath::new(path)));
                    rest = &after[path.len() + 1..];
                }
                None => {
                    // Keep the `$` and rescan from the brace
                    literal.push_str(&rest[..start + 1]);
                    rest = &rest[start + 1..];
                }
            }
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    /// The compiled segments in order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Every placeholder path in order of appearance
    pub fn placeholders(&self) -> impl Iterator<Item = &FieldPath> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p),
            Segment::Literal(_) => None,
        })
    }

    /// Whether the template renders the same text for every record
    pub fn is_constant(&self) -> bool {
        self.placeholders().next().is_none()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => f.write_str(text)?,
                Segment::Placeholder(path) => write!(f, "${{{}}}", path)?,
            }
        }
        Ok(())
    }
}

/// Statement type derived from the leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    /// INSERT
    Insert,
    /// SELECT / WITH / SHOW / DESCRIBE / EXPLAIN
    Query,
    /// UPDATE
    Update,
    /// DELETE / TRUNCATE
    Delete,
    /// REPLACE / MERGE / UPSERT
    Upsert,
    /// CREATE / ALTER / DROP
    Ddl,
    /// USE / SET / BEGIN / COMMIT / ROLLBACK / GRANT / REVOKE
    Session,
}

impl StatementType {
    fn from_keyword(keyword: &str) -> Option<Self> {
        let kind = match keyword.to_ascii_uppercase().as_str() {
            "INSERT" => Self::Insert,
            "SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" => Self::Query,
            "UPDATE" => Self::Update,
            "DELETE" | "TRUNCATE" => Self::Delete,
            "REPLACE" | "MERGE" | "UPSERT" => Self::Upsert,
            "CREATE" | "ALTER" | "DROP" => Self::Ddl,
            "USE" | "SET" | "BEGIN" | "COMMIT" | "ROLLBACK" | "GRANT" | "REVOKE" => Self::Session,
            _ => return None,
        };
        Some(kind)
    }
}

/// Classify a statement by its leading keyword (case-insensitive)
pub fn detect_statement_type(sql: &str) -> Result<StatementType, ParseError> {
    StatementType::from_keyword(leading_keyword(sql)).ok_or_else(|| ParseError::DetectionFailed {
        sql: sql.to_string(),
    })
}

/// Templates compiled from one channel's SQL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSql {
    /// The whole statement, for single-record execution
    pub insert_template: Template,
    /// The value tuple after `VALUES`, for aggregation
    pub batch_template: Template,
    /// Normalized statement head up to and including `VALUES`
    pub batch_prefix: String,
}

/// Compile an `INSERT` statement into its insert and batch templates
pub fn compile(sql: &str) -> Result<CompiledSql, ParseError> {
    let kind = detect_statement_type(sql)?;
    if kind != StatementType::Insert {
        return Err(ParseError::UnsupportedStatementType {
            statement: leading_keyword(sql).to_ascii_uppercase(),
        });
    }

    let statement = strip_terminator(sql);
    let insert_template = Template::parse(statement);

    let normalized = normalize_whitespace(statement);
    let parts = split_on_boundary(&normalized);
    let well_formed = matches!(
        parts.as_slice(),
        [boundary, _] if boundary.eq_ignore_ascii_case(BATCH_COMMAND_PREFIX)
    );
    if !well_formed {
        return Err(ParseError::SplitFailed {
            sql: sql.to_string(),
            parts,
        });
    }
    let body = parts[1].as_str();

    let split_failed = || ParseError::SplitFailed {
        sql: sql.to_string(),
        parts: parts.clone(),
    };
    let values = VALUES_REGEX.find(body).ok_or_else(split_failed)?;
    let tuples = body[values.end()..].trim_start();
    if !tuples.starts_with('(') {
        return Err(split_failed());
    }

    Ok(CompiledSql {
        insert_template,
        batch_template: Template::parse(tuples),
        batch_prefix: format!("{} {}", BATCH_COMMAND_PREFIX, body[..values.end()].trim_end()),
    })
}

fn leading_keyword(sql: &str) -> &str {
    let text = sql.trim_start();
    let end = text
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    &text[..end]
}

/// Trim and drop trailing `;` terminators
fn strip_terminator(sql: &str) -> &str {
    let mut text = sql.trim();
    while let Some(rest) = text.strip_suffix(';') {
        text = rest.trim_end();
    }
    text
}

/// Collapse every whitespace run into one space and trim
pub fn normalize_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split on `INSERT INTO`, keeping the boundary, dropping empty parts
fn split_on_boundary(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut last = 0;
    for m in INSERT_INTO_REGEX.find_iter(text) {
        parts.push(&text[last..m.start()]);
        parts.push(m.as_str());
        last = m.end();
    }
    parts.push(&text[last..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

//! Migration units and their on-disk format.
//!
//! A unit is a single `<version>_<name>.sql` file:
//!
//! ```sql
//! -- migrate:up
//! CREATE TABLE farms (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
//!
//! -- migrate:down
//! DROP TABLE farms;
//! ```
//!
//! The version token is the run of digits before the first `_`. Units are
//! ordered by version (numerically, so zero padding is optional) and then by
//! name.

use super::error::MigrationError;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// File extension of migration units.
pub const UNIT_EXTENSION: &str = ".sql";

const UP_MARKER: &str = "migrate:up";
const DOWN_MARKER: &str = "migrate:down";

/// A single schema statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Operation {
    sql: String,
}

impl Operation {
    /// Create an operation from statement text.
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// The statement text.
    pub fn as_str(&self) -> &str {
        &self.sql
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// A versioned bundle of forward and reverse schema operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationDefinition {
    /// Full identifier, e.g. `2024010100_create_farms`.
    pub identifier: String,
    /// Version token (the digit prefix).
    pub version: String,
    /// Descriptive name (everything after the first `_`).
    pub name: String,
    /// Operations run by `upgrade`, in order.
    pub forward: Vec<Operation>,
    /// Operations run by `rollback`, in order.
    pub reverse: Vec<Operation>,
    /// Hex BLAKE3 digest of the unit's raw contents.
    pub checksum: String,
}

impl MigrationDefinition {
    /// Build a definition directly from operation lists.
    ///
    /// The checksum covers the identifier and every operation, so two
    /// definitions built from the same inputs always agree.
    pub fn new(
        identifier: impl Into<String>,
        forward: Vec<Operation>,
        reverse: Vec<Operation>,
    ) -> Result<Self, MigrationError> {
        let identifier = identifier.into();
        let (version, name) = split_identifier(&identifier)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(identifier.as_bytes());
        for op in forward.iter().chain(reverse.iter()) {
            hasher.update(b"\0");
            hasher.update(op.as_str().as_bytes());
        }

        Ok(Self {
            version: version.to_string(),
            name: name.to_string(),
            identifier,
            forward,
            reverse,
            checksum: hex::encode(hasher.finalize().as_bytes()),
        })
    }

    /// Parse a unit from its source entry name and contents.
    pub fn parse(entry_name: &str, contents: &str) -> Result<Self, MigrationError> {
        let identifier = entry_name.strip_suffix(UNIT_EXTENSION).unwrap_or(entry_name);
        let (version, name) = split_identifier(identifier).map_err(|_| {
            parse_error(entry_name, "expected a name of the form <version>_<name>.sql")
        })?;

        let (up, down) =
            split_sections(contents).map_err(|reason| parse_error(entry_name, reason))?;
        let forward = split_statements(up).map_err(|reason| parse_error(entry_name, reason))?;
        let reverse = split_statements(down).map_err(|reason| parse_error(entry_name, reason))?;

        if forward.is_empty() {
            return Err(parse_error(entry_name, "no statements in the up section"));
        }

        Ok(Self {
            identifier: identifier.to_string(),
            version: version.to_string(),
            name: name.to_string(),
            forward,
            reverse,
            checksum: checksum(contents),
        })
    }

    /// Whether this unit can be reverted.
    pub fn is_reversible(&self) -> bool {
        !self.reverse.is_empty()
    }

    /// Total ordering used for plans: version, then name.
    pub fn order(&self, other: &Self) -> Ordering {
        compare_identifiers(&self.identifier, &other.identifier)
    }
}

/// Hex BLAKE3 digest of unit contents.
pub fn checksum(contents: &str) -> String {
    hex::encode(blake3::hash(contents.as_bytes()).as_bytes())
}

/// Compare two identifiers by version token, then by name.
///
/// Version tokens compare numerically: leading zeros are ignored and a
/// longer token is larger. Identifiers without a version prefix sort after
/// every versioned one, lexicographically.
pub fn compare_identifiers(a: &str, b: &str) -> Ordering {
    match (split_identifier(a), split_identifier(b)) {
        (Ok((va, na)), Ok((vb, nb))) => compare_versions(va, vb)
            .then_with(|| na.cmp(nb))
            .then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Compare two digit-only version tokens numerically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_trimmed = a.trim_start_matches('0');
    let b_trimmed = b.trim_start_matches('0');
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
}

/// Split `<version>_<name>` into its parts.
pub fn split_identifier(identifier: &str) -> Result<(&str, &str), MigrationError> {
    let invalid = || parse_error(identifier, "expected an identifier of the form <version>_<name>");

    let (version, name) = identifier.split_once('_').ok_or_else(invalid)?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) || name.is_empty() {
        return Err(invalid());
    }
    Ok((version, name))
}

fn parse_error(name: &str, reason: impl Into<String>) -> MigrationError {
    MigrationError::DefinitionParseError {
        name: name.to_string(),
        reason: reason.into(),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

/// Recognize a `-- migrate:up` / `-- migrate:down` marker line.
fn marker(line: &str) -> Option<Section> {
    let body = line.trim().strip_prefix("--")?.trim();
    if body.eq_ignore_ascii_case(UP_MARKER) {
        Some(Section::Up)
    } else if body.eq_ignore_ascii_case(DOWN_MARKER) {
        Some(Section::Down)
    } else {
        None
    }
}

/// Split unit contents into the up and down sections.
fn split_sections(contents: &str) -> Result<(&str, &str), String> {
    let mut section = Section::Preamble;
    let mut up: Option<(usize, usize)> = None;
    let mut down_start: Option<usize> = None;
    let mut offset = 0;

    for line in contents.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        match marker(line) {
            Some(Section::Up) => {
                if section != Section::Preamble {
                    return Err("duplicate or misplaced migrate:up marker".to_string());
                }
                section = Section::Up;
                up = Some((offset, offset));
            }
            Some(Section::Down) => {
                if section != Section::Up {
                    return Err(
                        "migrate:down marker must follow migrate:up exactly once".to_string()
                    );
                }
                section = Section::Down;
                if let Some((start, _)) = up {
                    up = Some((start, line_start));
                }
                down_start = Some(offset);
            }
            _ => {
                if section == Section::Preamble {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() && !trimmed.starts_with("--") {
                        return Err("statements before the migrate:up marker".to_string());
                    }
                }
            }
        }
    }

    match (up, down_start) {
        (Some((up_start, up_end)), Some(down_start)) => {
            Ok((&contents[up_start..up_end], &contents[down_start..]))
        }
        (None, _) => Err("missing migrate:up marker".to_string()),
        (Some(_), None) => Err("missing migrate:down marker".to_string()),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LexState {
    Normal,
    SingleQuote,
    DoubleQuote,
    Bracket,
    Backtick,
    LineComment,
    BlockComment,
}

/// Keyword tracking within one statement.
///
/// A `CREATE [TEMP|TEMPORARY] TRIGGER` body is a `BEGIN ... END` block whose
/// inner statements end in `;`. Those separators belong to the trigger.
#[derive(Default)]
struct StatementScope {
    leading: Vec<String>,
    trigger: bool,
    depth: usize,
}

impl StatementScope {
    fn keyword(&mut self, word: &str) {
        let word = word.to_ascii_uppercase();
        if self.leading.len() < 3 {
            self.leading.push(word.clone());
            let words: Vec<&str> = self.leading.iter().map(String::as_str).collect();
            self.trigger = matches!(
                words.as_slice(),
                ["CREATE", "TRIGGER", ..] | ["CREATE", "TEMP" | "TEMPORARY", "TRIGGER"]
            );
        }
        if !self.trigger {
            return;
        }
        match word.as_str() {
            "BEGIN" | "CASE" => self.depth += 1,
            "END" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
    }

    fn in_block(&self) -> bool {
        self.depth > 0
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Split a SQL section into statements on `;`.
///
/// Separators inside quoted strings, quoted identifiers (`"x"`, `[x]`,
/// `` `x` ``), comments and trigger bodies are ignored. Segments containing
/// only whitespace and comments are dropped.
pub fn split_statements(sql: &str) -> Result<Vec<Operation>, String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut word = String::new();
    let mut scope = StatementScope::default();
    let mut has_code = false;
    let mut state = LexState::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            LexState::Normal => {
                if is_word_char(c) {
                    word.push(c);
                    current.push(c);
                    has_code = true;
                    continue;
                }
                if !word.is_empty() {
                    scope.keyword(&word);
                    word.clear();
                }

                match c {
                    ';' if !scope.in_block() => {
                        if has_code {
                            statements.push(Operation::new(current.trim()));
                        }
                        current.clear();
                        has_code = false;
                        scope = StatementScope::default();
                        continue;
                    }
                    '\'' => {
                        state = LexState::SingleQuote;
                        has_code = true;
                    }
                    '"' => {
                        state = LexState::DoubleQuote;
                        has_code = true;
                    }
                    '[' => {
                        state = LexState::Bracket;
                        has_code = true;
                    }
                    '`' => {
                        state = LexState::Backtick;
                        has_code = true;
                    }
                    '-' if chars.peek() == Some(&'-') => {
                        state = LexState::LineComment;
                    }
                    '/' if chars.peek() == Some(&'*') => {
                        current.push(c);
                        if let Some(star) = chars.next() {
                            current.push(star);
                        }
                        state = LexState::BlockComment;
                        continue;
                    }
                    c if c.is_whitespace() => {}
                    _ => has_code = true,
                }
            }
            LexState::SingleQuote => {
                if c == '\'' {
                    state = LexState::Normal;
                }
            }
            LexState::DoubleQuote => {
                if c == '"' {
                    state = LexState::Normal;
                }
            }
            LexState::Bracket => {
                if c == ']' {
                    state = LexState::Normal;
                }
            }
            LexState::Backtick => {
                if c == '`' {
                    state = LexState::Normal;
                }
            }
            LexState::LineComment => {
                if c == '\n' {
                    state = LexState::Normal;
                }
            }
            LexState::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    current.push(c);
                    if let Some(slash) = chars.next() {
                        current.push(slash);
                    }
                    state = LexState::Normal;
                    continue;
                }
            }
        }
        current.push(c);
    }

    match state {
        LexState::SingleQuote | LexState::DoubleQuote => {
            return Err("unterminated quoted string".to_string())
        }
        LexState::Bracket | LexState::Backtick => {
            return Err("unterminated quoted identifier".to_string())
        }
        LexState::BlockComment => return Err("unterminated block comment".to_string()),
        LexState::Normal | LexState::LineComment => {}
    }

    if !word.is_empty() {
        scope.keyword(&word);
    }
    if scope.in_block() {
        return Err("unterminated BEGIN ... END block in trigger".to_string());
    }

    if has_code {
        statements.push(Operation::new(current.trim()));
    }

    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FARMS: &str = "-- migrate:up\n\
        CREATE TABLE farms (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n\
        CREATE INDEX idx_farms_name ON farms(name);\n\
        \n\
        -- migrate:down\n\
        DROP INDEX idx_farms_name;\n\
        DROP TABLE farms;\n";

    #[test]
    fn test_parse_unit() {
        let def = MigrationDefinition::parse("2024010100_create_farms.sql", FARMS).unwrap();

        assert_eq!(def.identifier, "2024010100_create_farms");
        assert_eq!(def.version, "2024010100");
        assert_eq!(def.name, "create_farms");
        assert_eq!(def.forward.len(), 2);
        assert_eq!(
            def.forward[0].as_str(),
            "CREATE TABLE farms (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"
        );
        assert_eq!(def.reverse.len(), 2);
        assert_eq!(def.reverse[1].as_str(), "DROP TABLE farms");
        assert_eq!(def.checksum, checksum(FARMS));
        assert!(def.is_reversible());
    }

    #[test]
    fn test_parse_allows_header_comments() {
        let contents = format!("-- create farms table\n\n{}", FARMS);
        let def = MigrationDefinition::parse("2024010100_create_farms.sql", &contents).unwrap();
        assert_eq!(def.forward.len(), 2);
    }

    #[test]
    fn test_parse_irreversible_unit() {
        let contents = "-- migrate:up\nCREATE TABLE t (id INTEGER);\n-- migrate:down\n";
        let def = MigrationDefinition::parse("1_t.sql", contents).unwrap();
        assert!(!def.is_reversible());
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        for name in ["create_farms.sql", "2024_.sql", "_farms.sql", "2024.sql", "20a4_x.sql"] {
            let result = MigrationDefinition::parse(name, FARMS);
            assert!(
                matches!(result, Err(MigrationError::DefinitionParseError { .. })),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_rejects_bad_sections() {
        let cases = [
            "CREATE TABLE t (id INTEGER);\n",
            "-- migrate:up\nCREATE TABLE t (id INTEGER);\n",
            "-- migrate:down\nDROP TABLE t;\n-- migrate:up\nCREATE TABLE t (id INTEGER);\n",
            "-- migrate:up\nCREATE TABLE t (id INTEGER);\n-- migrate:down\n-- migrate:down\n",
            "SELECT 1;\n-- migrate:up\nCREATE TABLE t (id INTEGER);\n-- migrate:down\n",
            "-- migrate:up\n-- nothing here\n-- migrate:down\nDROP TABLE t;\n",
        ];

        for contents in cases {
            let result = MigrationDefinition::parse("1_t.sql", contents);
            assert!(
                matches!(result, Err(MigrationError::DefinitionParseError { .. })),
                "{contents:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_split_statements_respects_quotes_and_comments() {
        let sql = "INSERT INTO notes (body) VALUES ('a;b');\n\
            -- trailing; comment\n\
            CREATE TABLE \"odd;name\" (id INTEGER); /* block; comment */\n\
            UPDATE notes SET body = 'it''s; fine'";

        let ops = split_statements(sql).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].as_str(), "INSERT INTO notes (body) VALUES ('a;b')");
        assert!(ops[1].as_str().ends_with("CREATE TABLE \"odd;name\" (id INTEGER)"));
        assert!(ops[2].as_str().starts_with("/* block; comment */"));
        assert!(ops[2].as_str().ends_with("UPDATE notes SET body = 'it''s; fine'"));
    }

    #[test]
    fn test_split_statements_drops_empty_segments() {
        let ops = split_statements(";;  -- only a comment\n;\n").unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_split_statements_unterminated() {
        assert!(split_statements("SELECT 'oops").is_err());
        assert!(split_statements("SELECT 1 /* never closed").is_err());
        assert!(split_statements("CREATE TABLE [odd (id INTEGER)").is_err());
        assert!(split_statements("CREATE TABLE `odd (id INTEGER)").is_err());
        assert!(split_statements(
            "CREATE TRIGGER t AFTER INSERT ON farms BEGIN DELETE FROM nodes;"
        )
        .is_err());
    }

    #[test]
    fn test_split_statements_bracket_and_backtick_identifiers() {
        let ops = split_statements(
            "CREATE TABLE [odd;name] (id INTEGER);\nCREATE TABLE `other;name` (id INTEGER);",
        )
        .unwrap();

        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].as_str(), "CREATE TABLE [odd;name] (id INTEGER)");
        assert_eq!(ops[1].as_str(), "CREATE TABLE `other;name` (id INTEGER)");
    }

    #[test]
    fn test_split_statements_keeps_trigger_body() {
        let sql = "CREATE TABLE readings (id INTEGER PRIMARY KEY, node_id INTEGER, updated TEXT);\n\
            CREATE TRIGGER readings_touch AFTER UPDATE ON readings\n\
            BEGIN\n\
                UPDATE readings SET updated = CASE WHEN NEW.id > 0 THEN 'yes' ELSE 'no' END\n\
                WHERE id = NEW.id;\n\
                DELETE FROM readings WHERE node_id IS NULL;\n\
            END;\n\
            create temp trigger scratch_guard before delete on readings begin select 1; end;\n\
            DROP TABLE IF EXISTS scratch";

        let ops = split_statements(sql).unwrap();
        assert_eq!(ops.len(), 4);
        assert!(ops[1].as_str().starts_with("CREATE TRIGGER readings_touch"));
        assert!(ops[1].as_str().contains("WHERE id = NEW.id;"));
        assert!(ops[1].as_str().ends_with("END"));
        assert_eq!(
            ops[2].as_str(),
            "create temp trigger scratch_guard before delete on readings begin select 1; end"
        );
        assert_eq!(ops[3].as_str(), "DROP TABLE IF EXISTS scratch");
    }

    #[test]
    fn test_split_statements_begin_outside_trigger() {
        let ops = split_statements("BEGIN; CREATE TABLE t (id INTEGER); END").unwrap();
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_compare_identifiers() {
        assert_eq!(
            compare_identifiers("2024010100_create_farms", "2024010200_create_nodes"),
            Ordering::Less
        );
        assert_eq!(compare_identifiers("9_b", "10_a"), Ordering::Less);
        assert_eq!(compare_identifiers("007_a", "7_b"), Ordering::Less);
        assert_eq!(compare_identifiers("1_a", "1_a"), Ordering::Equal);
        assert_eq!(compare_identifiers("1_a", "legacy"), Ordering::Less);
    }

    #[test]
    fn test_new_definition_checksum_is_stable() {
        let a = MigrationDefinition::new(
            "1_users",
            vec![Operation::new("CREATE TABLE users (id INTEGER)")],
            vec![Operation::new("DROP TABLE users")],
        )
        .unwrap();
        let b = a.clone();
        let c = MigrationDefinition::new(
            "1_users",
            vec![Operation::new("CREATE TABLE users (id INTEGER, email TEXT)")],
            vec![Operation::new("DROP TABLE users")],
        )
        .unwrap();

        assert_eq!(a.checksum, b.checksum);
        assert_ne!(a.checksum, c.checksum);
    }
}

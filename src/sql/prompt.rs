use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PromptError;

pub const TABLE_RESTRICTIONS_PLACEHOLDER: &str = "table_restrictions";

pub const DEFAULT_SQL_PROMPT: &str = "
You are a Postgres database expert.

Rules:
- Think step by step
- When calling the tool, always explain the steps you are taking
- When you need the data, call execute_query with one select query
- No updates. Only Selects
- Limit 5 rows
{table_restrictions}
- Prefer explicit column list
";

const UNRESTRICTED_TEXT: &str = "There's no limits.";

pub const DEFAULT_ALLOWED_TABLES: &[&str] = &[
    "Album",
    "Artists",
    "Genre",
    "Playlist",
    "PlaylistTrack",
    "Track",
];

/// Caller access classification. Fixed for the lifetime of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Privileged,
    Restricted,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Privileged => f.write_str("privileged"),
            Role::Restricted => f.write_str("restricted"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "privileged" => Ok(Role::Privileged),
            "restricted" => Ok(Role::Restricted),
            other => Err(format!(
                "unknown role '{other}', expected privileged or restricted"
            )),
        }
    }
}

/// Ordered, case-insensitively de-duplicated set of table names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableAllowList {
    tables: Vec<String>,
}

impl TableAllowList {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        for table in tables {
            list.insert(table);
        }
        list
    }

    /// Parses a comma-separated list, ignoring blank entries.
    pub fn parse(raw: &str) -> Self {
        Self::new(
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        )
    }

    pub fn insert(&mut self, table: impl Into<String>) -> bool {
        let table = table.into();
        if self.contains(&table) {
            return false;
        }
        self.tables.push(table);
        true
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(table))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }
}

/// Prompt text with a single `{table_restrictions}` substitution point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Result<Self, PromptError> {
        let text = text.into();
        let mut found = 0;
        for captures in PLACEHOLDER_PATTERN.captures_iter(&text) {
            let name = &captures[1];
            if name != TABLE_RESTRICTIONS_PLACEHOLDER {
                return Err(PromptError::UnknownPlaceholder(name.to_string()));
            }
            found += 1;
        }

        if found != 1 {
            return Err(PromptError::PlaceholderCount {
                placeholder: TABLE_RESTRICTIONS_PLACEHOLDER.to_string(),
                found,
            });
        }

        Ok(Self { text })
    }

    pub fn render(&self, table_restrictions: &str) -> String {
        self.text.replacen(
            &format!("{{{TABLE_RESTRICTIONS_PLACEHOLDER}}}"),
            table_restrictions,
            1,
        )
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            text: DEFAULT_SQL_PROMPT.to_string(),
        }
    }
}

// Single-brace names only; `{{` escapes are not used by these templates.
static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Derives the system instructions for a model call from the caller's role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptPolicy {
    template: PromptTemplate,
    allow_list: TableAllowList,
}

impl PromptPolicy {
    pub fn new(template: PromptTemplate, allow_list: TableAllowList) -> Self {
        Self {
            template,
            allow_list,
        }
    }

    pub fn allow_list(&self) -> &TableAllowList {
        &self.allow_list
    }

    pub fn build_instructions(&self, role: Role) -> String {
        self.template.render(&self.restriction_text(role))
    }

    fn restriction_text(&self, role: Role) -> String {
        match role {
            Role::Restricted if !self.allow_list.is_empty() => format!(
                "Limit access to these tables: {}.",
                self.allow_list.iter().collect::<Vec<_>>().join(", ")
            ),
            Role::Privileged | Role::Restricted => UNRESTRICTED_TEXT.to_string(),
        }
    }
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self::new(
            PromptTemplate::default(),
            TableAllowList::new(DEFAULT_ALLOWED_TABLES.iter().copied()),
        )
    }
}

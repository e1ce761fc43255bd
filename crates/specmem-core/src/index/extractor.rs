//! Heuristic definition extraction via per-language regex tables
//!
//! Each line is matched against the language's rules in order and the first
//! hit wins. End lines come from a bounded brace-balance scan, so brace-less
//! languages get single-line spans.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::language::Language;
use crate::embedding::protocol::truncate_chars;

/// Longest signature kept, in characters
const MAX_SIGNATURE_CHARS: usize = 200;

/// Lines scanned forward when looking for a definition's closing brace
const MAX_BODY_SCAN_LINES: usize = 20;

const MIN_NAME_LEN: usize = 2;
const MAX_NAME_LEN: usize = 100;

/// Keywords that regexes tend to pick up as names
const NOISE_NAMES: &[&str] = &[
    "if", "else", "elif", "for", "foreach", "while", "do", "switch", "case", "catch", "try",
    "finally", "return", "function", "new", "delete", "typeof", "instanceof", "await", "yield",
    "with", "match", "throw", "super", "this", "self", "import", "export", "from", "default",
    "constructor", "sizeof", "using", "lock", "fixed", "unless", "until", "begin", "end",
];

/// Kinds of definitions we index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Function,
    Class,
    Struct,
    Interface,
    Trait,
    Impl,
    Method,
    Type,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Struct => "struct",
            Self::Interface => "interface",
            Self::Trait => "trait",
            Self::Impl => "impl",
            Self::Method => "method",
            Self::Type => "type",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "struct" => Some(Self::Struct),
            "interface" => Some(Self::Interface),
            "trait" => Some(Self::Trait),
            "impl" => Some(Self::Impl),
            "method" => Some(Self::Method),
            "type" => Some(Self::Type),
            _ => None,
        }
    }
}

/// A definition found in a source file
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub id: String,
    pub file_id: String,
    pub file_path: String,
    pub name: String,
    pub kind: DefinitionKind,
    /// 1-based, inclusive
    pub start_line: usize,
    pub end_line: usize,
    pub signature: String,
    pub is_exported: bool,
    pub embedding: Option<Vec<f32>>,
}

impl Definition {
    /// Stable id derived from the owning file and the definition's position
    pub fn stable_id(file_id: &str, kind: DefinitionKind, name: &str, start_line: usize) -> String {
        let key = format!("{file_id}:{}:{name}:{start_line}", kind.as_str());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
    }

    /// Text sent for embedding
    pub fn embedding_text(&self) -> String {
        definition_text(self.kind.as_str(), &self.name, &self.signature, &self.file_path)
    }
}

/// `"<kind> <name>\n<signature>\n<path>"`
pub fn definition_text(kind: &str, name: &str, signature: &str, file_path: &str) -> String {
    format!("{kind} {name}\n{signature}\n{file_path}")
}

/// Result of extracting one file
#[derive(Debug, Default)]
pub struct Extraction {
    pub definitions: Vec<Definition>,
    /// The per-file cap was hit and the tail dropped
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy)]
enum Export {
    /// An `export` capture group matched
    Keyword,
    /// Name starts with an uppercase letter (Go)
    Capitalized,
    /// Name does not start with `_` (Python)
    NoUnderscore,
}

struct Rule {
    kind: DefinitionKind,
    pattern: Regex,
}

struct Table {
    rules: Vec<Rule>,
    export: Export,
}

fn table(export: Export, rules: &[(DefinitionKind, &str)]) -> Table {
    Table {
        export,
        rules: rules
            .iter()
            .filter_map(|(kind, src)| {
                Regex::new(src).ok().map(|pattern| Rule {
                    kind: *kind,
                    pattern,
                })
            })
            .collect(),
    }
}

use DefinitionKind as K;

static JS_TS: Lazy<Table> = Lazy::new(|| {
    table(
        Export::Keyword,
        &[
            (K::Function, r"^\s*(?P<export>export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*(?P<name>[A-Za-z_$][\w$]*)"),
            (K::Class, r"^\s*(?P<export>export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(?P<name>[A-Za-z_$][\w$]*)"),
            (K::Interface, r"^\s*(?P<export>export\s+)?(?:declare\s+)?interface\s+(?P<name>[A-Za-z_$][\w$]*)"),
            (K::Type, r"^\s*(?P<export>export\s+)?(?:declare\s+)?type\s+(?P<name>[A-Za-z_$][\w$]*)\s*(?:<[^=]*>)?\s*="),
            (K::Type, r"^\s*(?P<export>export\s+)?(?:const\s+)?enum\s+(?P<name>[A-Za-z_$][\w$]*)"),
            (K::Function, r"^\s*(?P<export>export\s+)?(?:const|let|var)\s+(?P<name>[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=>"),
            (K::Method, r"^\s+(?:(?:public|private|protected|static|async|readonly|override|get|set)\s+)*(?P<name>[A-Za-z_$][\w$]*)\s*\([^)]*\)\s*(?::\s*[^{;]+)?\{"),
        ],
    )
});

static PYTHON: Lazy<Table> = Lazy::new(|| {
    table(
        Export::NoUnderscore,
        &[
            (K::Class, r"^\s*class\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Function, r"^(?:async\s+)?def\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Method, r"^\s+(?:async\s+)?def\s+(?P<name>[A-Za-z_]\w*)"),
        ],
    )
});

static RUST: Lazy<Table> = Lazy::new(|| {
    table(
        Export::Keyword,
        &[
            (K::Function, r#"^\s*(?P<export>pub(?:\([^)]*\))?\s+)?(?:default\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+(?P<name>[A-Za-z_]\w*)"#),
            (K::Struct, r"^\s*(?P<export>pub(?:\([^)]*\))?\s+)?struct\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Type, r"^\s*(?P<export>pub(?:\([^)]*\))?\s+)?(?:enum|type|union)\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Trait, r"^\s*(?P<export>pub(?:\([^)]*\))?\s+)?(?:unsafe\s+)?trait\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Impl, r"^\s*(?:unsafe\s+)?impl(?:<[^>]*>)?\s+(?:[\w:<>, &']+\s+for\s+)?(?P<name>[A-Za-z_]\w*)"),
        ],
    )
});

static GO: Lazy<Table> = Lazy::new(|| {
    table(
        Export::Capitalized,
        &[
            (K::Method, r"^func\s+\([^)]*\)\s*(?P<name>[A-Za-z_]\w*)"),
            (K::Function, r"^func\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Struct, r"^type\s+(?P<name>[A-Za-z_]\w*)\s+struct\b"),
            (K::Interface, r"^type\s+(?P<name>[A-Za-z_]\w*)\s+interface\b"),
            (K::Type, r"^type\s+(?P<name>[A-Za-z_]\w*)\s+"),
        ],
    )
});

static JVM_CLR: Lazy<Table> = Lazy::new(|| {
    table(
        Export::Keyword,
        &[
            (K::Class, r"^\s*(?P<export>public\s+)?(?:(?:private|protected|internal|static|final|abstract|sealed|partial|data|open)\s+)*(?:class|record|object)\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Interface, r"^\s*(?P<export>public\s+)?(?:(?:private|protected|internal|sealed)\s+)*interface\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Type, r"^\s*(?P<export>public\s+)?(?:(?:private|protected|internal)\s+)*(?:enum|struct)\s+(?:class\s+)?(?P<name>[A-Za-z_]\w*)"),
            (K::Function, r"^\s*(?P<export>public\s+)?(?:(?:private|protected|internal|override|suspend|inline|open)\s+)*fun\s+(?:<[^>]*>\s*)?(?:[\w.]+\.)?(?P<name>[A-Za-z_]\w*)"),
            (K::Method, r"^\s+(?P<export>public\s+)?(?:(?:private|protected|internal|static|final|abstract|synchronized|override|virtual|async|sealed)\s+)*[\w<>\[\],.?]+\s+(?P<name>[A-Za-z_]\w*)\s*\([^;]*$"),
        ],
    )
});

static RUBY: Lazy<Table> = Lazy::new(|| {
    table(
        Export::NoUnderscore,
        &[
            (K::Class, r"^\s*class\s+(?P<name>[A-Z]\w*)"),
            (K::Type, r"^\s*module\s+(?P<name>[A-Z]\w*)"),
            (K::Method, r"^\s+def\s+(?:self\.)?(?P<name>[A-Za-z_]\w*[?!]?)"),
            (K::Function, r"^def\s+(?:self\.)?(?P<name>[A-Za-z_]\w*[?!]?)"),
        ],
    )
});

static PHP: Lazy<Table> = Lazy::new(|| {
    table(
        Export::Keyword,
        &[
            (K::Class, r"^\s*(?:abstract\s+|final\s+)?class\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Interface, r"^\s*interface\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Trait, r"^\s*trait\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Method, r"^\s+(?P<export>public\s+)?(?:(?:private|protected|static|final|abstract)\s+)*function\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Function, r"^function\s+(?P<name>[A-Za-z_]\w*)"),
        ],
    )
});

static SWIFT: Lazy<Table> = Lazy::new(|| {
    table(
        Export::Keyword,
        &[
            (K::Class, r"^\s*(?P<export>public\s+|open\s+)?(?:final\s+)?class\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Struct, r"^\s*(?P<export>public\s+)?struct\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Interface, r"^\s*(?P<export>public\s+)?protocol\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Type, r"^\s*(?P<export>public\s+)?(?:enum|typealias)\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Impl, r"^\s*extension\s+(?P<name>[A-Za-z_]\w*)"),
            (K::Function, r"^\s*(?P<export>public\s+|open\s+)?(?:(?:private|internal|static|override|mutating)\s+)*func\s+(?P<name>[A-Za-z_]\w*)"),
        ],
    )
});

fn table_for(language: &Language) -> Option<&'static Table> {
    let table: &'static Lazy<Table> = match language.id {
        "javascript" | "typescript" => &JS_TS,
        "python" => &PYTHON,
        "rust" => &RUST,
        "go" => &GO,
        "java" | "kotlin" | "csharp" | "scala" => &JVM_CLR,
        "ruby" => &RUBY,
        "php" => &PHP,
        "swift" => &SWIFT,
        _ => return None,
    };
    Some(Lazy::force(table))
}

/// Extract definitions from `content`, in source order.
///
/// At most `max_definitions` are returned; hitting the cap sets `truncated`.
pub fn extract(
    content: &str,
    language: &Language,
    file_id: &str,
    file_path: &str,
    max_definitions: usize,
) -> Extraction {
    let Some(table) = table_for(language) else {
        return Extraction::default();
    };

    let lines: Vec<&str> = content.lines().collect();
    let mut extraction = Extraction::default();

    for (idx, line) in lines.iter().enumerate() {
        let Some((kind, name, exported_kw)) = match_line(table, line) else {
            continue;
        };

        if extraction.definitions.len() >= max_definitions {
            extraction.truncated = true;
            break;
        }

        let start_line = idx + 1;
        let is_exported = match table.export {
            Export::Keyword => exported_kw,
            Export::Capitalized => name.starts_with(|c: char| c.is_ascii_uppercase()),
            Export::NoUnderscore => !name.starts_with('_'),
        };

        extraction.definitions.push(Definition {
            id: Definition::stable_id(file_id, kind, name, start_line),
            file_id: file_id.to_string(),
            file_path: file_path.to_string(),
            name: name.to_string(),
            kind,
            start_line,
            end_line: end_line(&lines, idx),
            signature: truncate_chars(line.trim(), MAX_SIGNATURE_CHARS).to_string(),
            is_exported,
            embedding: None,
        });
    }

    extraction
}

fn match_line<'l>(table: &Table, line: &'l str) -> Option<(DefinitionKind, &'l str, bool)> {
    for rule in &table.rules {
        let Some(caps) = rule.pattern.captures(line) else {
            continue;
        };
        let Some(name) = caps.name("name").map(|m| m.as_str()) else {
            continue;
        };
        if !is_plausible_name(name) {
            continue;
        }
        return Some((rule.kind, name, caps.name("export").is_some()));
    }
    None
}

fn is_plausible_name(name: &str) -> bool {
    let len = name.chars().count();
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) && !NOISE_NAMES.contains(&name)
}

/// 1-based end line from a brace-balance scan starting at `start_idx`
fn end_line(lines: &[&str], start_idx: usize) -> usize {
    let mut depth: i64 = 0;
    let mut opened = false;
    let limit = (start_idx + MAX_BODY_SCAN_LINES).min(lines.len());

    for (idx, line) in lines.iter().enumerate().take(limit).skip(start_idx) {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return idx + 1;
        }
        // A statement ending before any brace opened is a one-liner
        if !opened && idx == start_idx && line.trim_end().ends_with(';') {
            return idx + 1;
        }
    }

    if opened {
        limit
    } else {
        start_idx + 1
    }
}

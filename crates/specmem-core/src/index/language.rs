//! File extension to language mapping

use std::path::Path;

/// A source language recognized by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Language {
    pub id: &'static str,
    pub name: &'static str,
}

impl Language {
    const fn new(id: &'static str, name: &'static str) -> Self {
        Self { id, name }
    }

    /// Infer the language from a path's file name or extension
    pub fn detect(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        if let Some(lang) = Self::from_file_name(file_name) {
            return Some(lang);
        }
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Self::from_extension(&ext)
    }

    fn from_file_name(name: &str) -> Option<Self> {
        let lang = match name {
            "Dockerfile" => DOCKERFILE,
            "Makefile" | "makefile" | "GNUmakefile" => MAKEFILE,
            ".prettierrc" | ".babelrc" => JSON,
            ".editorconfig" => INI,
            ".env.example" => SHELL,
            _ if name.starts_with("Dockerfile.") => DOCKERFILE,
            _ => return None,
        };
        Some(lang)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let lang = match ext {
            "js" | "jsx" | "mjs" | "cjs" => JAVASCRIPT,
            "ts" | "tsx" | "mts" | "cts" => TYPESCRIPT,
            "py" | "pyi" => PYTHON,
            "rs" => RUST,
            "go" => GO,
            "java" => JAVA,
            "kt" | "kts" => KOTLIN,
            "cs" => CSHARP,
            "c" | "h" => C,
            "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => CPP,
            "rb" => RUBY,
            "php" => PHP,
            "swift" => SWIFT,
            "scala" | "sc" => SCALA,
            "sh" | "bash" | "zsh" => SHELL,
            "sql" => SQL,
            "md" | "mdx" | "markdown" => MARKDOWN,
            "json" | "jsonc" => JSON,
            "yml" | "yaml" => YAML,
            "toml" => TOML,
            "html" | "htm" => HTML,
            "css" | "scss" | "sass" | "less" => CSS,
            "ini" | "cfg" => INI,
            _ => return None,
        };
        Some(lang)
    }
}

pub const JAVASCRIPT: Language = Language::new("javascript", "JavaScript");
pub const TYPESCRIPT: Language = Language::new("typescript", "TypeScript");
pub const PYTHON: Language = Language::new("python", "Python");
pub const RUST: Language = Language::new("rust", "Rust");
pub const GO: Language = Language::new("go", "Go");
pub const JAVA: Language = Language::new("java", "Java");
pub const KOTLIN: Language = Language::new("kotlin", "Kotlin");
pub const CSHARP: Language = Language::new("csharp", "C#");
pub const C: Language = Language::new("c", "C");
pub const CPP: Language = Language::new("cpp", "C++");
pub const RUBY: Language = Language::new("ruby", "Ruby");
pub const PHP: Language = Language::new("php", "PHP");
pub const SWIFT: Language = Language::new("swift", "Swift");
pub const SCALA: Language = Language::new("scala", "Scala");
pub const SHELL: Language = Language::new("shell", "Shell");
pub const SQL: Language = Language::new("sql", "SQL");
pub const MARKDOWN: Language = Language::new("markdown", "Markdown");
pub const JSON: Language = Language::new("json", "JSON");
pub const YAML: Language = Language::new("yaml", "YAML");
pub const TOML: Language = Language::new("toml", "TOML");
pub const HTML: Language = Language::new("html", "HTML");
pub const CSS: Language = Language::new("css", "CSS");
pub const INI: Language = Language::new("ini", "INI");
pub const DOCKERFILE: Language = Language::new("dockerfile", "Dockerfile");
pub const MAKEFILE: Language = Language::new("makefile", "Makefile");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_by_extension() {
        assert_eq!(Language::detect(Path::new("src/app.tsx")), Some(TYPESCRIPT));
        assert_eq!(Language::detect(Path::new("lib/mod.RS")), Some(RUST));
        assert_eq!(Language::detect(Path::new("a/b/c.mjs")), Some(JAVASCRIPT));
    }

    #[test]
    fn test_detect_by_file_name() {
        assert_eq!(Language::detect(Path::new("Dockerfile")), Some(DOCKERFILE));
        assert_eq!(Language::detect(Path::new("sub/Makefile")), Some(MAKEFILE));
        assert_eq!(Language::detect(Path::new(".babelrc")), Some(JSON));
    }

    #[test]
    fn test_unknown_is_none() {
        assert_eq!(Language::detect(Path::new("image.png")), None);
        assert_eq!(Language::detect(Path::new("LICENSE")), None);
    }
}

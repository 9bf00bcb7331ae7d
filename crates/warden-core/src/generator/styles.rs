//! Coding style templates
//!
//! Styles are a closed enum: adding one is a compile-time-checked change to
//! the exhaustive `render` match, never a string comparison. Templates are
//! intentionally conservative — small modules that differ in naming,
//! structure, comment density, and annotations — and every one of them
//! produces a single top-level callable named deterministically from the
//! topic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of generation styles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingStyle {
    /// Plain idiomatic module with a docstring
    Idiomatic,
    /// Payload-in/payload-out function
    Functional,
    /// Manager class wrapping the behavior
    ObjectOriented,
    /// Step-comment driven procedure
    Procedural,
    /// Heavily commented for reviewers
    VerboseCommented,
    /// Minimal body, no commentary
    Concise,
    /// Full type annotations
    TypedAnnotations,
    /// Module- and function-level docstrings
    DocstringHeavy,
    /// Implementation plus a companion test stub
    TestFirstStub,
    /// Coroutine entry point
    AsyncFirst,
}

impl CodingStyle {
    /// All styles, in fallback iteration order
    pub const ALL: [CodingStyle; 10] = [
        CodingStyle::Idiomatic,
        CodingStyle::Functional,
        CodingStyle::ObjectOriented,
        CodingStyle::Procedural,
        CodingStyle::VerboseCommented,
        CodingStyle::Concise,
        CodingStyle::TypedAnnotations,
        CodingStyle::DocstringHeavy,
        CodingStyle::TestFirstStub,
        CodingStyle::AsyncFirst,
    ];

    /// Stable tag used in filenames, audit entries, and the CLI
    pub fn as_str(&self) -> &'static str {
        match self {
            CodingStyle::Idiomatic => "idiomatic",
            CodingStyle::Functional => "functional",
            CodingStyle::ObjectOriented => "object_oriented",
            CodingStyle::Procedural => "procedural",
            CodingStyle::VerboseCommented => "verbose_commented",
            CodingStyle::Concise => "concise",
            CodingStyle::TypedAnnotations => "typed_annotations",
            CodingStyle::DocstringHeavy => "docstring_heavy",
            CodingStyle::TestFirstStub => "test_first_stub",
            CodingStyle::AsyncFirst => "async_first",
        }
    }

    /// Parse a style tag
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == tag)
    }

    /// Pick a style uniformly at random
    pub fn random() -> Self {
        use rand::seq::SliceRandom;
        *Self::ALL
            .choose(&mut rand::thread_rng())
            .expect("style set is non-empty")
    }

    /// Render the description into Python source in this style.
    ///
    /// The generated module always exposes a top-level callable whose name
    /// is derived deterministically from `topic`.
    pub fn render(&self, topic: &str, description: &str) -> String {
        let fn_name = callable_name(topic);
        let desc = sanitize_text(description);

        match self {
            CodingStyle::Idiomatic => {
                let commented = desc.replace('\n', "\n# ");
                format!(
                    "# {topic}\nimport typing\n\n# Description:\n# {commented}\n\n\
                     def {fn_name}() -> bool:\n    \"\"\"Perform the requested implementation for {topic}.\"\"\"\n    return True\n"
                )
            }
            CodingStyle::Functional => {
                let one_line = desc.replace('\n', " ");
                format!(
                    "# Functional-style implementation for {topic}\n\
                     def {fn_name}(payload=None):\n    # description: {one_line}\n    return {{'ok': True}}\n"
                )
            }
            CodingStyle::ObjectOriented => {
                let one_line = desc.replace('\n', " ");
                let class_name = class_name(topic);
                format!(
                    "# OOP-style implementation for {topic}\n\
                     class {class_name}:\n    \"\"\"Manager object for {topic}.\"\"\"\n\n    def run(self):\n        # {one_line}\n        return True\n\n\n\
                     def {fn_name}():\n    return {class_name}().run()\n"
                )
            }
            CodingStyle::Procedural => {
                let one_line = desc.replace('\n', " ");
                format!(
                    "# Procedural implementation for {topic}\n\
                     def {fn_name}():\n    # steps:\n    # 1) analyze\n    # 2) implement\n    # {one_line}\n    return True\n"
                )
            }
            CodingStyle::VerboseCommented => {
                let commented = desc.replace('\n', "\n    # ");
                format!(
                    "# Verbose commented implementation for {topic}\n\n\
                     # The following implementation is heavily commented to aid reviewers\n\
                     def {fn_name}():\n    # Description:\n    # {commented}\n    # Implementation returns True on success\n    return True\n"
                )
            }
            CodingStyle::Concise => {
                format!("def {fn_name}():\n    return True\n")
            }
            CodingStyle::TypedAnnotations => {
                let one_line = desc.replace('\n', " ");
                format!(
                    "from typing import Any, Dict, Optional\n\n\
                     # Typed implementation for {topic}\n\n\
                     def {fn_name}(payload: Optional[Dict[str, Any]] = None) -> bool:\n    \"\"\"{one_line}\"\"\"\n    return True\n"
                )
            }
            CodingStyle::DocstringHeavy => {
                let mut lines = vec!["\"\"\"".to_string(), topic.to_string(), String::new()];
                if !desc.is_empty() {
                    lines.extend(desc.lines().map(|l| l.to_string()));
                    lines.push(String::new());
                }
                lines.push("Auto-generated docstring-heavy stub.".to_string());
                lines.push("\"\"\"".to_string());
                lines.push(String::new());
                lines.push(format!("def {fn_name}():"));
                lines.push("    \"\"\"See module docstring.\"\"\"".to_string());
                lines.push("    return True".to_string());
                lines.join("\n") + "\n"
            }
            CodingStyle::TestFirstStub => {
                format!(
                    "# Test-first style: include a companion test stub\n\n\
                     def {fn_name}():\n    # implementation goes here\n    return True\n\n\n\
                     # companion test (to be moved to tests/ by the integrator)\n\
                     def test_{fn_name}():\n    assert {fn_name}() is True\n"
                )
            }
            CodingStyle::AsyncFirst => {
                format!(
                    "import asyncio\n\n\
                     async def {fn_name}():\n    # Async-first stub for {topic}\n    return True\n"
                )
            }
        }
    }
}

impl fmt::Display for CodingStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic top-level callable name for a topic
pub fn callable_name(topic: &str) -> String {
    format!("impl_{}", safe_identifier(topic))
}

fn class_name(topic: &str) -> String {
    let ident = safe_identifier(topic);
    let mut out = String::new();
    for part in ident.split('_').filter(|p| !p.is_empty()) {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    if out.is_empty() {
        out.push_str("Generated");
    }
    format!("{out}Manager")
}

/// Filesystem- and identifier-safe rendition of arbitrary text
pub fn safe_identifier(text: &str) -> String {
    let mut name: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        name = "generated_impl".to_string();
    }
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name.truncate(120);
    name
}

/// Normalize line endings and escape triple quotes so a description can
/// never terminate a generated docstring early.
fn sanitize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace("\"\"\"", "\\\"\\\"\\\"")
}

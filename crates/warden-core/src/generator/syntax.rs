//! Syntax validation of generated artifacts
//!
//! Tree-Sitter gives a hard guarantee: an artifact is written to disk only
//! if its parse tree contains no error or missing nodes. Validation is
//! syntax-level only; semantic checks belong to the Quality Gate.

use tree_sitter::{Node, Parser};

/// A top-level function discovered in a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyFunction {
    /// Function name
    pub name: String,
    /// Number of parameters without defaults (excluding `self` and splats)
    pub required_params: usize,
}

fn python_parser() -> Result<Parser, String> {
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_python::language())
        .map_err(|e| format!("failed to load python grammar: {e}"))?;
    Ok(parser)
}

/// Validate Python source. Returns the location of the first syntax error
/// on failure.
pub fn validate_python(code: &str) -> Result<(), String> {
    let mut parser = python_parser()?;
    let tree = parser
        .parse(code, None)
        .ok_or_else(|| "parser produced no tree".to_string())?;
    let root = tree.root_node();
    if !root.has_error() {
        return Ok(());
    }
    Err(first_error(root)
        .map(|node| {
            let pos = node.start_position();
            format!("SyntaxError at line {}, column {}", pos.row + 1, pos.column + 1)
        })
        .unwrap_or_else(|| "SyntaxError".to_string()))
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() {
            if let Some(found) = first_error(child) {
                return Some(found);
            }
        }
    }
    None
}

/// Discover function definitions in a module (top level and nested), with
/// their required-parameter counts. Used by the test harness to decide which
/// functions can be called with zero arguments.
pub fn discover_functions(code: &str) -> Result<Vec<PyFunction>, String> {
    let mut parser = python_parser()?;
    let tree = parser
        .parse(code, None)
        .ok_or_else(|| "parser produced no tree".to_string())?;
    let mut functions = Vec::new();
    collect_functions(tree.root_node(), code.as_bytes(), &mut functions);
    Ok(functions)
}

fn collect_functions(node: Node<'_>, source: &[u8], out: &mut Vec<PyFunction>) {
    if node.kind() == "function_definition" {
        let name = node
            .child_by_field_name("name")
            .and_then(|n| n.utf8_text(source).ok())
            .unwrap_or_default()
            .to_string();
        let required = node
            .child_by_field_name("parameters")
            .map(|params| count_required(params, source))
            .unwrap_or(0);
        if !name.is_empty() {
            out.push(PyFunction {
                name,
                required_params: required,
            });
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_functions(child, source, out);
    }
}

fn count_required(params: Node<'_>, source: &[u8]) -> usize {
    let mut required = 0;
    let mut cursor = params.walk();
    for child in params.named_children(&mut cursor) {
        match child.kind() {
            "identifier" => {
                // `self` is supplied by the instance, not the caller
                if child.utf8_text(source).ok() != Some("self") {
                    required += 1;
                }
            }
            "typed_parameter" => required += 1,
            // defaults, *args, **kwargs never require an argument
            _ => {}
        }
    }
    required
}

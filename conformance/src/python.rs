//! Thin tree-sitter wrapper for the generated target language (Python).
//!
//! The validator, the source normalizer's parse-preserving guard, and the
//! test runner's syntax gate all parse generated sources through here. The
//! pipeline never executes this code; it only inspects it.

use tree_sitter::{Node, Parser, Tree};

/// Parse a Python source string.
///
/// tree-sitter is error-tolerant, so this returns a tree even for broken
/// input; use [`first_syntax_error_line`] or [`parses_cleanly`] to detect
/// errors.
pub fn parse(source: &str) -> Option<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .expect("tree-sitter-python language");
    parser.parse(source, None)
}

/// Whether the source parses without any error or missing node.
pub fn parses_cleanly(source: &str) -> bool {
    parse(source).is_some_and(|tree| !tree.root_node().has_error())
}

/// 1-indexed line of the first syntax error in the source, if any.
pub fn first_syntax_error_line(source: &str) -> Option<usize> {
    let tree = parse(source)?;
    let root = tree.root_node();
    if !root.has_error() {
        return None;
    }
    let mut line = None;
    visit(root, &mut |node| {
        if line.is_none() && (node.is_error() || node.is_missing()) {
            line = Some(node.start_position().row + 1);
        }
    });
    line.or(Some(1))
}

/// Depth-first pre-order traversal over every node (named and anonymous).
pub fn visit<'a, F: FnMut(Node<'a>)>(node: Node<'a>, f: &mut F) {
    f(node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        visit(child, f);
    }
}

/// UTF-8 text of a node.
pub fn text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// 1-indexed line of a node's start.
pub fn line(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

/// Top-level statements of a module, with `decorated_definition` and
/// `expression_statement` wrappers unwrapped to the inner definition or
/// expression.
pub fn top_level_statements<'a>(root: Node<'a>) -> Vec<Node<'a>> {
    let mut statements = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        statements.push(unwrap_statement(child));
    }
    statements
}

/// Unwrap `decorated_definition` / `expression_statement` down to the node
/// the validator cares about.
pub fn unwrap_statement(node: Node<'_>) -> Node<'_> {
    match node.kind() {
        "decorated_definition" => node.child_by_field_name("definition").unwrap_or(node),
        "expression_statement" => node.named_child(0).unwrap_or(node),
        _ => node,
    }
}

/// The literal value of a Python string node, with prefix letters and quotes
/// stripped. Returns `None` for non-string nodes.
pub fn string_value(node: Node<'_>, source: &str) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let raw = text(node, source);
    let trimmed = raw.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if trimmed.starts_with(quote) && trimmed.ends_with(quote) && trimmed.len() >= 2 * quote.len()
        {
            return Some(trimmed[quote.len()..trimmed.len() - quote.len()].to_string());
        }
    }
    None
}

/// Whether the node is the literal `True`.
pub fn is_true(node: Node<'_>) -> bool {
    node.kind() == "true"
}

/// Keyword arguments of a `call` node as `(name, value)` pairs.
pub fn call_keyword_args<'a>(call: Node<'a>, source: &str) -> Vec<(String, Node<'a>)> {
    let mut args = Vec::new();
    let Some(arg_list) = call.child_by_field_name("arguments") else {
        return args;
    };
    let mut cursor = arg_list.walk();
    for child in arg_list.named_children(&mut cursor) {
        if child.kind() == "keyword_argument" {
            if let (Some(name), Some(value)) = (
                child.child_by_field_name("name"),
                child.child_by_field_name("value"),
            ) {
                args.push((text(name, source).to_string(), value));
            }
        }
    }
    args
}

/// Positional arguments of a `call` node.
pub fn call_positional_args<'a>(call: Node<'a>) -> Vec<Node<'a>> {
    let mut args = Vec::new();
    let Some(arg_list) = call.child_by_field_name("arguments") else {
        return args;
    };
    let mut cursor = arg_list.walk();
    for child in arg_list.named_children(&mut cursor) {
        if child.kind() != "keyword_argument" {
            args.push(child);
        }
    }
    args
}

/// Whether an identifier with the given name appears anywhere in the subtree.
pub fn subtree_mentions_identifier(node: Node<'_>, source: &str, name: &str) -> bool {
    let mut found = false;
    visit(node, &mut |n| {
        if !found && n.kind() == "identifier" && text(n, source) == name {
            found = true;
        }
    });
    found
}

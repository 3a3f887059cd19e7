//! Mermaid diagram normalizer.
//!
//! LLM-produced architecture diagrams arrive with markdown fences, sideways
//! orientations, unquoted labels, and shorthand syntax that the renderer
//! rejects. `normalize_mermaid` is a pure function that turns any such text
//! into a syntactically valid top-down flowchart. Idempotent.

use regex::Regex;

/// Normalize an LLM-produced mermaid diagram into a top-down flowchart.
///
/// Rules, applied in order: strip markdown fences, BOM, and zero-width marks;
/// normalize line endings; force `flowchart TD`; drop unsupported `note`
/// syntax; rewrite dotted labeled edges to plain labeled arrows; expand
/// ampersand-shorthand node declarations to one per line; quote
/// square-bracket labels containing whitespace or punctuation; replace arrow
/// glyphs inside edge labels with Unicode arrows. Empty input yields a
/// minimal single-node diagram.
pub fn normalize_mermaid(code: &str) -> String {
    let mut text = code.trim().to_string();
    if text.is_empty() {
        return "flowchart TD\n  API[\"API\"]".to_string();
    }

    // Strip markdown fences / BOM / zero-width chars.
    let fenced = Regex::new(r"(?is)^```(?:mermaid)?\s*(.*?)\s*```$").unwrap();
    if let Some(caps) = fenced.captures(&text) {
        text = caps[1].trim().to_string();
    }
    let marks = Regex::new("^[\u{FEFF}\u{200B}-\u{200D}]+").unwrap();
    text = marks.replace(&text, "").to_string();
    text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = text.split('\n').map(|ln| ln.trim_end().to_string()).collect();
    if lines
        .first()
        .is_some_and(|ln| ln.trim().eq_ignore_ascii_case("mermaid"))
    {
        lines.remove(0);
    }
    text = lines.join("\n").trim().to_string();

    // Force top-down flowchart.
    let sideways = Regex::new(r"(?i)^\s*(flowchart|graph)\s+(LR|RL)\b").unwrap();
    text = sideways.replace(&text, "flowchart TD").to_string();
    let header = Regex::new(r"(?i)^\s*(flowchart|graph)\s+\w+\b").unwrap();
    if !header.is_match(&text) {
        text = format!("flowchart TD\n{text}");
    }
    let graph_td = Regex::new(r"(?i)^\s*graph\s+TD\b").unwrap();
    text = graph_td.replace(&text, "flowchart TD").to_string();

    // Remove fragile note syntax.
    let note = Regex::new(r"(?i)^\s*note\s+(left|right)\s+of\b").unwrap();
    text = text
        .split('\n')
        .filter(|line| !note.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();

    // Rewrite dotted labeled edges to plain labeled arrows.
    let dotted = Regex::new(r"---\s*\|\s*([^|\n]+?)\s*\|\s*").unwrap();
    text = dotted
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            format!(" -->|{}| ", caps[1].trim())
        })
        .to_string();

    // Expand ampersand shorthand declarations (A[...] & B[...]) into one per line.
    let shape_open = Regex::new(r"[\[({]").unwrap();
    let indent_re = Regex::new(r"^\s*").unwrap();
    let mut expanded: Vec<String> = Vec::new();
    for line in text.split('\n') {
        if line.contains('&') && shape_open.is_match(line) {
            let indent = indent_re.find(line).map(|m| m.as_str()).unwrap_or("");
            let parts: Vec<&str> = line
                .split('&')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            if parts.len() > 1 {
                expanded.extend(parts.into_iter().map(|p| format!("{indent}{p}")));
                continue;
            }
        }
        expanded.push(line.to_string());
    }
    text = expanded.join("\n");

    // Quote standard square-bracket labels with spaces/punctuation.
    let square = Regex::new(r"\b([A-Za-z][\w-]*)\[([^\]\n]+)\]").unwrap();
    let needs_quote = Regex::new(r"[\s/:,()\-]").unwrap();
    text = square
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            let node_id = &caps[1];
            let label = caps[2].trim();
            // Leave already-quoted or shape-like labels alone.
            if (label.starts_with('"') && label.ends_with('"'))
                || label.starts_with('(')
                || label.starts_with('{')
                || label.starts_with('<')
            {
                return caps[0].to_string();
            }
            if needs_quote.is_match(label) {
                let safe = label.replace('"', "\\\"");
                format!("{node_id}[\"{safe}\"]")
            } else {
                caps[0].to_string()
            }
        })
        .to_string();

    // Replace arrows inside labels which can confuse mermaid tokenization.
    let label = Regex::new(r"\|([^|\n]*)\|").unwrap();
    text = label
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            format!("|{}|", caps[1].replace("->", "→").replace("<-", "←"))
        })
        .to_string();

    text.trim().to_string()
}

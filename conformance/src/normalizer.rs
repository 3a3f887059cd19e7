//! Source normalizer for generated Python bundles.
//!
//! Applied file-by-file when writing a sandbox bundle (skippable in raw
//! mode). The goal is to stabilize known LLM output footguns without changing
//! semantics for valid code: datetime-name collisions, SQLModel
//! `Field`/`sa_column` conflicts, duplicate index and schema bootstraps, and
//! a small set of compatibility shims for commonly-drifting module surfaces.
//!
//! Every rewrite is idempotent. A rewrite that would turn a parseable file
//! into an unparseable one is discarded (the guard reparses with
//! tree-sitter).

use regex::Regex;

use crate::artifacts::{CodeFile, GeneratedCode};
use crate::python;

const DATETIME_FAMILY: &[&str] = &["date", "datetime", "time"];

/// Contents of the fallback exceptions module synthesized when the bundle
/// does not ship one.
pub const FALLBACK_EXCEPTIONS_SOURCE: &str = "class NotFoundError(Exception):\n\
    \x20   pass\n\n\
    class DomainValidationError(Exception):\n\
    \x20   pass\n\n\
    class ValidationError(Exception):\n\
    \x20   pass\n";

/// Apply a rewrite only if it keeps a parseable file parseable.
fn guarded(original: &str, rewritten: String) -> String {
    if rewritten != original
        && python::parses_cleanly(original)
        && !python::parses_cleanly(&rewritten)
    {
        return original.to_string();
    }
    rewritten
}

/// Alias datetime-family imports when a field name collides with the type.
///
/// `from datetime import date` plus a `date:` field makes Pydantic resolve
/// the annotation to the field itself. Rewrites the import to
/// `date as date_type` and renames bare uses, skipping the annotation target
/// position itself.
fn rewrite_datetime_name_collisions(content: &str) -> String {
    let import_re = Regex::new(r"^\s*from\s+datetime\s+import\s+(.+)$").unwrap();
    let lines: Vec<&str> = content.lines().collect();

    let mut imported: Vec<String> = Vec::new();
    let mut import_rows: Vec<usize> = Vec::new();
    for (row, line) in lines.iter().enumerate() {
        let Some(caps) = import_re.captures(line) else {
            continue;
        };
        import_rows.push(row);
        for part in caps[1].split(',') {
            let segment = part.trim();
            if segment.is_empty() {
                continue;
            }
            let original = segment.split(" as ").next().unwrap_or(segment).trim();
            if DATETIME_FAMILY.contains(&original) && !imported.contains(&original.to_string()) {
                imported.push(original.to_string());
            }
        }
    }
    if imported.is_empty() {
        return content.to_string();
    }

    let collisions: Vec<String> = imported
        .into_iter()
        .filter(|name| {
            Regex::new(&format!(r"(?m)^\s*{name}\s*:")).unwrap().is_match(content)
        })
        .collect();
    if collisions.is_empty() {
        return content.to_string();
    }

    // Rewrite the import lines first.
    let mut rewritten_lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    for &row in &import_rows {
        let Some(caps) = import_re.captures(&rewritten_lines[row]) else {
            continue;
        };
        let mut parts: Vec<String> = Vec::new();
        for part in caps[1].split(',') {
            let segment = part.trim();
            if segment.is_empty() {
                continue;
            }
            if let Some((original, alias)) = segment.split_once(" as ") {
                let original = original.trim();
                if collisions.iter().any(|c| c == original) {
                    parts.push(format!("{original} as {original}_type"));
                } else {
                    parts.push(format!("{original} as {}", alias.trim()));
                }
            } else if collisions.iter().any(|c| c == segment) {
                parts.push(format!("{segment} as {segment}_type"));
            } else {
                parts.push(segment.to_string());
            }
        }
        rewritten_lines[row] = format!("from datetime import {}", parts.join(", "));
    }
    let rewritten = rewritten_lines.join("\n");

    // Rename bare uses of the colliding names, skipping the import lines and
    // annotation targets (an identifier immediately followed by `:`).
    let Some(tree) = python::parse(&rewritten) else {
        return rewritten;
    };
    let bytes = rewritten.as_bytes();
    let mut edits: Vec<(usize, usize, String)> = Vec::new();
    python::visit(tree.root_node(), &mut |node| {
        if node.kind() != "identifier" {
            return;
        }
        let name = python::text(node, &rewritten);
        if !collisions.iter().any(|c| c == name) {
            return;
        }
        if import_rows.contains(&node.start_position().row) {
            return;
        }
        let mut idx = node.end_byte();
        while idx < bytes.len() && (bytes[idx] == b' ' || bytes[idx] == b'\t') {
            idx += 1;
        }
        if idx < bytes.len() && bytes[idx] == b':' {
            return;
        }
        edits.push((node.start_byte(), node.end_byte(), format!("{name}_type")));
    });

    let mut output = rewritten.clone();
    for (start, end, replacement) in edits.into_iter().rev() {
        output.replace_range(start..end, &replacement);
    }
    output
}

/// Insert foreign-key args and flags into a `sa_column=Column(...)` segment.
fn inject_sa_column_args(line: &str, foreign_keys: &[String], flags: &[String]) -> String {
    const COLUMN_TOKEN: &str = "sa_column=Column(";
    let Some(column_start) = line.find(COLUMN_TOKEN) else {
        return line.to_string();
    };
    let inner_start = column_start + COLUMN_TOKEN.len();
    let bytes = line.as_bytes();
    let mut depth = 1usize;
    let mut inner_end = inner_start;
    while inner_end < bytes.len() {
        match bytes[inner_end] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
        inner_end += 1;
    }
    if inner_end >= bytes.len() {
        return line.to_string();
    }

    let mut inner = line[inner_start..inner_end].to_string();
    if !foreign_keys.is_empty() {
        let segment = foreign_keys.join(", ");
        let mut depth = 0i32;
        let mut split = None;
        for (idx, ch) in inner.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => depth -= 1,
                ',' if depth == 0 => {
                    split = Some(idx);
                    break;
                }
                _ => {}
            }
        }
        inner = match split {
            None => format!("{inner}, {segment}"),
            Some(idx) => format!(
                "{} {segment}, {}",
                &inner[..=idx],
                inner[idx + 1..].trim_start()
            ),
        };
    }
    if !flags.is_empty() {
        inner = format!("{inner}, {}", flags.join(", "));
    }

    format!("{}{}{}", &line[..inner_start], inner, &line[inner_end..])
}

/// Rewrite a single-line `Field(..., sa_column=Column(...))` declaration.
fn rewrite_inline_field_conflicts(line: &str) -> (String, bool) {
    if !line.contains("Field(") || !line.contains("sa_column=Column(") {
        return (line.to_string(), false);
    }

    let mut rewritten = line.to_string();
    let mut foreign_keys: Vec<String> = Vec::new();
    let mut flags: Vec<String> = Vec::new();
    let mut requires_foreign_key = false;

    let fk_re = Regex::new(r"\bforeign_key\s*=\s*([^,]+),\s*").unwrap();
    if let Some(caps) = fk_re.captures(&rewritten) {
        foreign_keys.push(format!("ForeignKey({})", caps[1].trim()));
        requires_foreign_key = true;
        let range = caps.get(0).unwrap().range();
        rewritten.replace_range(range, "");
    }

    for flag in ["primary_key", "index", "unique"] {
        let flag_re = Regex::new(&format!(r"\b{flag}\s*=\s*(True|False),\s*")).unwrap();
        if let Some(caps) = flag_re.captures(&rewritten) {
            if &caps[1] == "True" {
                flags.push(format!("{flag}=True"));
            }
            let range = caps.get(0).unwrap().range();
            rewritten.replace_range(range, "");
        }
    }

    let nullable_re = Regex::new(r"\bnullable\s*=\s*(True|False),\s*").unwrap();
    rewritten = nullable_re.replace_all(&rewritten, "").to_string();

    if !foreign_keys.is_empty() || !flags.is_empty() {
        rewritten = inject_sa_column_args(&rewritten, &foreign_keys, &flags);
    }

    (rewritten, requires_foreign_key)
}

fn paren_balance(line: &str) -> i32 {
    line.bytes().fold(0i32, |acc, b| match b {
        b'(' => acc + 1,
        b')' => acc - 1,
        _ => acc,
    })
}

/// Rewrite every `Field(...)` declaration that conflicts with `sa_column=`.
///
/// Returns the rewritten source and whether a `ForeignKey` import is now
/// required.
fn rewrite_field_sa_column_blocks(content: &str) -> (String, bool) {
    let lines: Vec<&str> = content.lines().collect();
    let mut rewritten_lines: Vec<String> = Vec::new();
    let mut requires_foreign_key = false;
    let mut idx = 0usize;

    while idx < lines.len() {
        let line = lines[idx];
        if !line.contains("Field(") {
            rewritten_lines.push(line.to_string());
            idx += 1;
            continue;
        }

        let mut balance = paren_balance(line);
        if balance <= 0 {
            let (mut rewritten, line_requires_fk) = rewrite_inline_field_conflicts(line);
            if rewritten.contains("pattern=") {
                rewritten = rewritten.replacen("pattern=", "regex=", 1);
            }
            rewritten_lines.push(rewritten);
            requires_foreign_key = requires_foreign_key || line_requires_fk;
            idx += 1;
            continue;
        }

        let mut block: Vec<String> = vec![line.to_string()];
        idx += 1;
        while idx < lines.len() && balance > 0 {
            let block_line = lines[idx];
            block.push(block_line.to_string());
            balance += paren_balance(block_line);
            idx += 1;
        }

        let has_sa_column = block.iter().any(|l| l.contains("sa_column="));
        let mut foreign_keys: Vec<String> = Vec::new();
        let mut flags: Vec<String> = Vec::new();
        let mut rewritten_block: Vec<String> = Vec::new();
        for block_line in &block {
            let stripped = block_line.trim_start();
            if stripped.starts_with("pattern=") {
                rewritten_block.push(block_line.replacen("pattern=", "regex=", 1));
                continue;
            }
            if has_sa_column && stripped.starts_with("nullable=") {
                // sa_column already owns nullability; leaving both can break
                // SQLModel startup.
                continue;
            }
            if has_sa_column {
                let mut consumed = false;
                for flag in ["primary_key", "index", "unique"] {
                    if stripped.starts_with(&format!("{flag}=")) {
                        if stripped.to_lowercase().contains("true") {
                            let flag_entry = format!("{flag}=True");
                            if !flags.contains(&flag_entry) {
                                flags.push(flag_entry);
                            }
                        }
                        consumed = true;
                        break;
                    }
                }
                if !consumed && stripped.starts_with("foreign_key=") {
                    let value = stripped["foreign_key=".len()..]
                        .trim_end()
                        .trim_end_matches(',')
                        .trim();
                    if !value.is_empty() {
                        foreign_keys.push(format!("ForeignKey({value})"));
                        requires_foreign_key = true;
                    }
                    consumed = true;
                }
                if consumed {
                    continue;
                }
            }
            rewritten_block.push(block_line.to_string());
        }

        if has_sa_column && (!foreign_keys.is_empty() || !flags.is_empty()) {
            for block_line in rewritten_block.iter_mut() {
                if block_line.contains("sa_column") && block_line.contains("Column(") {
                    *block_line = inject_sa_column_args(block_line, &foreign_keys, &flags);
                    break;
                }
            }
        }

        rewritten_lines.extend(rewritten_block);
    }

    (rewritten_lines.join("\n"), requires_foreign_key)
}

/// Make sure `ForeignKey` is importable after a Field→Column migration.
fn ensure_foreign_key_import(content: &str) -> String {
    let import_re = Regex::new(r"(?m)^from\s+sqlalchemy\s+import\s+(.+)$").unwrap();
    if let Some(caps) = import_re.captures(content) {
        let mut symbols: Vec<String> = caps[1]
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect();
        if symbols.iter().any(|s| s == "ForeignKey") {
            return content.to_string();
        }
        symbols.push("ForeignKey".to_string());
        return import_re
            .replacen(content, 1, format!("from sqlalchemy import {}", symbols.join(", ")))
            .to_string();
    }
    format!("from sqlalchemy import ForeignKey\n{content}")
}

/// Remove `index=True` on fields that also carry an explicit
/// `Index("ix_…", "field")` declaration in the same module.
pub fn remove_duplicate_field_indexes(content: &str) -> String {
    let index_decl =
        Regex::new(r#"Index\(\s*["']ix_[^"']+["']\s*,\s*["']([A-Za-z_][A-Za-z0-9_]*)["']"#)
            .unwrap();
    let explicit_fields: Vec<String> = index_decl
        .captures_iter(content)
        .map(|caps| caps[1].to_string())
        .collect();
    if explicit_fields.is_empty() {
        return content.to_string();
    }

    let field_re = Regex::new(r"^(\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:\s*.*Field\(").unwrap();
    let trailing_index = Regex::new(r",\s*index\s*=\s*True").unwrap();
    let leading_index = Regex::new(r"index\s*=\s*True,\s*").unwrap();
    let lines: Vec<&str> = content.lines().collect();
    let mut rewritten: Vec<String> = Vec::new();
    let mut idx = 0usize;

    while idx < lines.len() {
        let line = lines[idx];
        let Some(caps) = field_re.captures(line) else {
            rewritten.push(line.to_string());
            idx += 1;
            continue;
        };
        let field_name = caps[2].to_string();
        let mut block: Vec<String> = vec![line.to_string()];
        let mut balance = paren_balance(line);
        idx += 1;
        while idx < lines.len() && balance > 0 {
            block.push(lines[idx].to_string());
            balance += paren_balance(lines[idx]);
            idx += 1;
        }

        if explicit_fields.contains(&field_name) {
            block = block
                .into_iter()
                .filter(|block_line| !block_line.trim_start().starts_with("index="))
                .map(|block_line| {
                    if block_line.contains("Field(") || block_line.contains("index=") {
                        let cleaned = trailing_index.replace_all(&block_line, "").to_string();
                        leading_index.replace_all(&cleaned, "").to_string()
                    } else {
                        block_line
                    }
                })
                .collect();
        }
        rewritten.extend(block);
    }

    rewritten.join("\n")
}

/// Compatibility shims for auth modules whose surface drifts from what the
/// generated route modules expect.
fn append_auth_shims(content: &str) -> String {
    let mut normalized = content.to_string();

    if normalized.contains("def create_access_token(*, subject:")
        && !normalized.contains("def _compat_create_access_token_impl(")
    {
        normalized = normalized.replacen(
            "def create_access_token(",
            "def _compat_create_access_token_impl(",
            1,
        );
    }

    let has = |pattern: &str| Regex::new(pattern).unwrap().is_match(&normalized);
    let mut aliases: Vec<String> = Vec::new();
    if (normalized.contains("def hash_password(") || has(r"(?m)^hash_password\s*="))
        && !(normalized.contains("def get_password_hash(") || has(r"(?m)^get_password_hash\s*="))
    {
        aliases.push("get_password_hash = hash_password".to_string());
    }
    if (normalized.contains("def get_current_user(") || has(r"(?m)^get_current_user\s*="))
        && !(normalized.contains("def current_user(") || has(r"(?m)^current_user\s*="))
    {
        aliases.push("current_user = get_current_user".to_string());
    }
    if normalized.contains("def _compat_create_access_token_impl(")
        && !normalized.contains("def create_access_token(subject=None")
    {
        aliases.push(
            "def create_access_token(subject=None, expires_delta=None):\n\
             \x20   if isinstance(subject, dict):\n\
             \x20       subject = subject.get('sub')\n\
             \x20   return _compat_create_access_token_impl(subject=str(subject), expires_delta=expires_delta)"
                .to_string(),
        );
    }

    if aliases.is_empty() {
        return normalized;
    }
    format!(
        "{}\n\n# Compatibility aliases for generated route modules.\n{}\n",
        normalized.trim_end(),
        aliases.join("\n")
    )
}

/// Synthesize `api_router` / `get_router()` when the routes module only
/// exports a `router_list`.
fn append_router_shims(content: &str) -> String {
    let has_router_list = Regex::new(r"(?m)^router_list\s*=\s*\[").unwrap().is_match(content);
    if !has_router_list {
        return content.to_string();
    }
    let has_api_router = Regex::new(r"(?m)^api_router\s*=").unwrap().is_match(content);
    let has_get_router = Regex::new(r"(?m)^def\s+get_router\s*\(").unwrap().is_match(content);

    let mut normalized = content.to_string();
    if !has_api_router {
        normalized = format!(
            "{}\n\n# Aggregate export for app entrypoints that expect a single router.\n\
             api_router = APIRouter()\n\
             for _router in router_list:\n\
             \x20   api_router.include_router(_router)\n",
            normalized.trim_end()
        );
    }
    if !has_get_router {
        normalized = format!(
            "{}\n\ndef get_router():\n\x20   return api_router\n",
            normalized.trim_end()
        );
    }
    normalized
}

/// Strip the schema bootstrap from the app entry when the database module
/// already runs it.
pub fn strip_duplicate_bootstrap(main_source: &str) -> String {
    let create_all_line =
        Regex::new(r"(?m)^\s*SQLModel\.metadata\.create_all\(engine\)\s*$\n?").unwrap();
    create_all_line.replace_all(main_source, "").to_string()
}

/// Strip `prefix=` from `include_router` calls whose router already declares
/// the same prefix.
pub fn strip_duplicate_router_prefixes(main_source: &str, routes_source: &str) -> String {
    let decl_re = Regex::new(
        r#"(?m)^(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*=\s*APIRouter\(\s*prefix\s*=\s*["'](?P<prefix>/[^"']*)["']"#,
    )
    .unwrap();
    let mut normalized = main_source.to_string();
    for caps in decl_re.captures_iter(routes_source) {
        let name = regex::escape(&caps["name"]);
        let prefix = regex::escape(&caps["prefix"]);
        let include_re = Regex::new(&format!(
            r#"(?m)(app\.include_router\(\s*{name}\s*,\s*)prefix\s*=\s*["']{prefix}["']\s*,\s*"#
        ))
        .unwrap();
        normalized = include_re.replace_all(&normalized, "$1").to_string();
    }
    normalized
}

/// Normalize a single generated source file.
pub fn normalize_source(path: &str, content: &str) -> String {
    let normalized_path = path.replace('\\', "/").to_lowercase();
    if !normalized_path.ends_with(".py") {
        return content.to_string();
    }

    let mut normalized = guarded(content, rewrite_datetime_name_collisions(content));

    let (rewritten, requires_foreign_key) = rewrite_field_sa_column_blocks(&normalized);
    let mut rewritten = rewritten;
    if requires_foreign_key {
        rewritten = ensure_foreign_key_import(&rewritten);
    }
    normalized = guarded(&normalized, rewritten);

    if normalized_path.ends_with("auth.py") {
        normalized = guarded(&normalized, append_auth_shims(&normalized));
    }
    if normalized_path.ends_with("routes.py") {
        normalized = guarded(&normalized, append_router_shims(&normalized));
    }

    normalized
}

/// Normalize a whole bundle in place: per-file rewrites plus the
/// cross-file passes (duplicate indexes, fallback exceptions module,
/// bootstrap and router-prefix dedupe).
pub fn normalize_bundle(code: &mut GeneratedCode) {
    for file in code.files.iter_mut() {
        file.content = normalize_source(&file.path, &file.content);
    }

    for file in code.files.iter_mut() {
        if file.path.ends_with("models.py") {
            file.content = guarded(&file.content, remove_duplicate_field_indexes(&file.content));
        }
    }

    if !code.has_file("app/exceptions.py") {
        code.files.push(CodeFile::new(
            "app/exceptions.py",
            FALLBACK_EXCEPTIONS_SOURCE,
        ));
    }

    let database_bootstraps = code
        .file("app/database.py")
        .is_some_and(|f| f.content.contains("SQLModel.metadata.create_all("));
    if database_bootstraps {
        if let Some(main) = code.files.iter_mut().find(|f| f.path == "app/main.py") {
            main.content = guarded(&main.content, strip_duplicate_bootstrap(&main.content));
        }
    }

    let routes_source = code.file("app/routes.py").map(|f| f.content.clone());
    if let Some(routes_source) = routes_source {
        if let Some(main) = code.files.iter_mut().find(|f| f.path == "app/main.py") {
            main.content = guarded(
                &main.content,
                strip_duplicate_router_prefixes(&main.content, &routes_source),
            );
        }
    }
}

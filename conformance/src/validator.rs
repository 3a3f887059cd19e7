//! Deterministic whole-bundle validator for generated Python sources.
//!
//! Two passes: the first parses every file and builds a per-module symbol
//! index (exports, function signatures, router prefixes, schema-bootstrap
//! calls, explicit index declarations); the second walks each AST and checks
//! cross-file usage against that index. The output is a [`TestRunReport`]
//! with `check = import_smoke` failures and one patch request per failing
//! file.
//!
//! Validator output carries no subjective judgment. It is merged into the
//! reviewer's report via [`merge_validator_report`]; any failure forces
//! `approved = false` and caps `security_score` at 6.

use std::collections::{BTreeMap, HashMap, HashSet};

use tree_sitter::{Node, Tree};

use crate::artifacts::{
    FilePatchRequest, GeneratedCode, Issue, ReviewReport, Severity, TestFailure, TestRunReport,
};
use crate::python;

/// Reason attached to every validator-synthesized patch request.
pub const VALIDATOR_PATCH_REASON: &str =
    "Deterministic validator found unresolved imports or incompatible function contracts";

/// Highest security score a report may keep once the validator found failures.
pub const VALIDATOR_SCORE_CAP: u8 = 6;

struct FunctionSignature {
    keyword_params: HashSet<String>,
    accepts_var_keyword: bool,
}

struct ModuleInfo {
    path: String,
    exports: HashSet<String>,
    functions: HashMap<String, FunctionSignature>,
    router_prefixes: HashMap<String, String>,
    has_create_all: bool,
    explicit_indexed_fields: HashSet<String>,
}

struct ParsedFile {
    path: String,
    module: String,
    source: String,
    tree: Tree,
}

/// Dotted module name for a bundle path, e.g. `app/routes.py` → `app.routes`.
fn module_name_from_path(path: &str) -> Option<String> {
    let normalized = path.replace('\\', "/");
    let normalized = normalized.trim().trim_start_matches('/');
    let stem = normalized.strip_suffix(".py")?;
    let stem = stem.strip_suffix("/__init__").unwrap_or(stem);
    if stem.is_empty() {
        return None;
    }
    Some(stem.replace('/', "."))
}

fn is_field_call(
    call: Node<'_>,
    source: &str,
    field_symbols: &HashSet<String>,
    sqlmodel_aliases: &HashSet<String>,
) -> bool {
    let Some(func) = call.child_by_field_name("function") else {
        return false;
    };
    match func.kind() {
        "identifier" => field_symbols.contains(python::text(func, source)),
        "attribute" => {
            let object = func.child_by_field_name("object");
            let attribute = func.child_by_field_name("attribute");
            matches!((object, attribute), (Some(obj), Some(attr))
                if obj.kind() == "identifier"
                    && sqlmodel_aliases.contains(python::text(obj, source))
                    && python::text(attr, source) == "Field")
        }
        _ => false,
    }
}

/// Whether a call is `SQLModel.metadata.create_all(...)`.
fn is_create_all_call(call: Node<'_>, source: &str) -> bool {
    let Some(func) = call.child_by_field_name("function") else {
        return false;
    };
    if func.kind() != "attribute" {
        return false;
    }
    let Some(attr) = func.child_by_field_name("attribute") else {
        return false;
    };
    if python::text(attr, source) != "create_all" {
        return false;
    }
    let Some(meta) = func.child_by_field_name("object") else {
        return false;
    };
    if meta.kind() != "attribute" {
        return false;
    }
    let meta_attr = meta.child_by_field_name("attribute");
    let meta_obj = meta.child_by_field_name("object");
    matches!((meta_obj, meta_attr), (Some(obj), Some(name))
        if python::text(name, source) == "metadata"
            && obj.kind() == "identifier"
            && python::text(obj, source) == "SQLModel")
}

fn function_signature(func: Node<'_>, source: &str) -> FunctionSignature {
    let mut keyword_params = HashSet::new();
    let mut accepts_var_keyword = false;
    if let Some(params) = func.child_by_field_name("parameters") {
        let mut cursor = params.walk();
        for param in params.named_children(&mut cursor) {
            match param.kind() {
                "identifier" => {
                    keyword_params.insert(python::text(param, source).to_string());
                }
                "typed_parameter" => {
                    if let Some(inner) = param.named_child(0) {
                        match inner.kind() {
                            "identifier" | "list_splat_pattern" => {
                                if let Some(name) = leaf_identifier(inner, source) {
                                    keyword_params.insert(name);
                                }
                            }
                            "dictionary_splat_pattern" => accepts_var_keyword = true,
                            _ => {}
                        }
                    }
                }
                "default_parameter" | "typed_default_parameter" => {
                    if let Some(name) = param.child_by_field_name("name") {
                        if name.kind() == "identifier" {
                            keyword_params.insert(python::text(name, source).to_string());
                        }
                    }
                }
                "list_splat_pattern" => {
                    if let Some(name) = leaf_identifier(param, source) {
                        keyword_params.insert(name);
                    }
                }
                "dictionary_splat_pattern" => accepts_var_keyword = true,
                _ => {}
            }
        }
    }
    FunctionSignature {
        keyword_params,
        accepts_var_keyword,
    }
}

fn leaf_identifier(node: Node<'_>, source: &str) -> Option<String> {
    if node.kind() == "identifier" {
        return Some(python::text(node, source).to_string());
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if child.kind() == "identifier" {
            return Some(python::text(child, source).to_string());
        }
    }
    None
}

fn annotation_collision_message(name: &str) -> String {
    format!(
        "Field name `{name}` clashes with its type annotation. Alias imported datetime-like \
         types (for example `date as date_type`) or rename the field to avoid Pydantic \
         startup failures."
    )
}

fn build_module_infos(
    code: &GeneratedCode,
) -> (BTreeMap<String, ModuleInfo>, Vec<ParsedFile>, Vec<TestFailure>) {
    let mut modules = BTreeMap::new();
    let mut parsed_files = Vec::new();
    let mut failures = Vec::new();

    for code_file in &code.files {
        if !code_file.path.ends_with(".py") {
            continue;
        }
        let Some(module_name) = module_name_from_path(&code_file.path) else {
            continue;
        };
        let Some(tree) = python::parse(&code_file.content) else {
            continue;
        };
        if tree.root_node().has_error() {
            let line =
                python::first_syntax_error_line(&code_file.content).unwrap_or(1);
            failures.push(TestFailure::syntax(
                "Syntax error: invalid syntax",
                code_file.path.clone(),
                line,
            ));
            continue;
        }

        let source = code_file.content.as_str();
        let root = tree.root_node();
        let mut exports: HashSet<String> = HashSet::new();
        let mut functions: HashMap<String, FunctionSignature> = HashMap::new();
        let mut router_prefixes: HashMap<String, String> = HashMap::new();
        let mut has_create_all = false;
        let mut explicit_indexed_fields: HashSet<String> = HashSet::new();

        for stmt in python::top_level_statements(root) {
            match stmt.kind() {
                "function_definition" => {
                    if let Some(name) = stmt.child_by_field_name("name") {
                        let name = python::text(name, source).to_string();
                        exports.insert(name.clone());
                        functions.insert(name, function_signature(stmt, source));
                    }
                }
                "class_definition" => {
                    if let Some(name) = stmt.child_by_field_name("name") {
                        exports.insert(python::text(name, source).to_string());
                    }
                }
                "assignment" => {
                    let Some(left) = stmt.child_by_field_name("left") else {
                        continue;
                    };
                    if left.kind() != "identifier" {
                        continue;
                    }
                    let target = python::text(left, source).to_string();
                    exports.insert(target.clone());
                    // X = APIRouter(prefix="...") remembers the prefix.
                    if stmt.child_by_field_name("type").is_none() {
                        if let Some(right) = stmt.child_by_field_name("right") {
                            if right.kind() == "call" {
                                if let Some(prefix) = api_router_prefix(right, source) {
                                    router_prefixes.insert(target, prefix);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        python::visit(root, &mut |node| {
            if node.kind() != "call" {
                return;
            }
            if is_create_all_call(node, source) {
                has_create_all = true;
            }
            if let Some(func) = node.child_by_field_name("function") {
                if func.kind() == "identifier" && python::text(func, source) == "Index" {
                    for arg in python::call_positional_args(node).into_iter().skip(1) {
                        if let Some(field) = python::string_value(arg, source) {
                            explicit_indexed_fields.insert(field);
                        }
                    }
                }
            }
        });

        modules.insert(
            module_name.clone(),
            ModuleInfo {
                path: code_file.path.clone(),
                exports,
                functions,
                router_prefixes,
                has_create_all,
                explicit_indexed_fields,
            },
        );
        parsed_files.push(ParsedFile {
            path: code_file.path.clone(),
            module: module_name,
            source: code_file.content.clone(),
            tree,
        });
    }

    (modules, parsed_files, failures)
}

fn api_router_prefix(call: Node<'_>, source: &str) -> Option<String> {
    let func = call.child_by_field_name("function")?;
    let is_api_router = match func.kind() {
        "identifier" => python::text(func, source) == "APIRouter",
        "attribute" => func
            .child_by_field_name("attribute")
            .is_some_and(|attr| python::text(attr, source) == "APIRouter"),
        _ => false,
    };
    if !is_api_router {
        return None;
    }
    python::call_keyword_args(call, source)
        .into_iter()
        .find(|(name, _)| name == "prefix")
        .and_then(|(_, value)| python::string_value(value, source))
}

/// Whether an attribute node sits on the left side of an assignment.
fn is_store_context(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return false;
    };
    if !matches!(parent.kind(), "assignment" | "augmented_assignment") {
        return false;
    }
    parent
        .child_by_field_name("left")
        .is_some_and(|left| left.id() == node.id())
}

struct ImportBindings {
    /// local name → dotted module (`from app import routes`, `import app.routes`)
    module_aliases: HashMap<String, String>,
    /// local name → (dotted module, exported symbol)
    direct_imports: HashMap<String, (String, String)>,
    sqlmodel_field_symbols: HashSet<String>,
    sqlmodel_module_aliases: HashSet<String>,
}

fn collect_imports(
    file: &ParsedFile,
    modules: &BTreeMap<String, ModuleInfo>,
    failures: &mut Vec<TestFailure>,
) -> ImportBindings {
    let source = file.source.as_str();
    let mut bindings = ImportBindings {
        module_aliases: HashMap::new(),
        direct_imports: HashMap::new(),
        sqlmodel_field_symbols: HashSet::new(),
        sqlmodel_module_aliases: HashSet::new(),
    };

    let root = file.tree.root_node();
    let mut cursor = root.walk();
    for stmt in root.named_children(&mut cursor) {
        match stmt.kind() {
            "import_statement" => {
                let mut names = stmt.walk();
                for name_node in stmt.children_by_field_name("name", &mut names) {
                    let (dotted, alias) = import_name_and_alias(name_node, source);
                    if dotted == "sqlmodel" {
                        bindings
                            .sqlmodel_module_aliases
                            .insert(alias.clone().unwrap_or_else(|| dotted.clone()));
                    }
                    if !dotted.starts_with("app.") {
                        continue;
                    }
                    if modules.contains_key(&dotted) {
                        let local = alias.unwrap_or_else(|| {
                            dotted.rsplit('.').next().unwrap_or(&dotted).to_string()
                        });
                        bindings.module_aliases.insert(local, dotted);
                    }
                }
            }
            "import_from_statement" => {
                let Some(module_node) = stmt.child_by_field_name("module_name") else {
                    continue;
                };
                if module_node.kind() != "dotted_name" {
                    // Relative imports are outside the index's scope.
                    continue;
                }
                let module = python::text(module_node, source).to_string();
                let mut names = stmt.walk();
                let name_nodes: Vec<Node<'_>> =
                    stmt.children_by_field_name("name", &mut names).collect();

                if module == "sqlmodel" {
                    for name_node in &name_nodes {
                        let (name, alias) = import_name_and_alias(*name_node, source);
                        if name == "Field" {
                            bindings
                                .sqlmodel_field_symbols
                                .insert(alias.unwrap_or(name));
                        }
                    }
                }
                if !module.starts_with("app") {
                    continue;
                }

                if let Some(module_info) = modules.get(&module) {
                    for name_node in &name_nodes {
                        let (name, alias) = import_name_and_alias(*name_node, source);
                        if name == "*" {
                            continue;
                        }
                        if !module_info.exports.contains(&name) {
                            failures.push(
                                TestFailure::import_smoke(format!(
                                    "Imported symbol `{name}` does not exist in `{module}`."
                                ))
                                .at(file.path.clone(), Some(python::line(stmt))),
                            );
                        }
                        bindings
                            .direct_imports
                            .insert(alias.unwrap_or_else(|| name.clone()), (module.clone(), name));
                    }
                } else {
                    for name_node in &name_nodes {
                        let (name, alias) = import_name_and_alias(*name_node, source);
                        if name == "*" {
                            continue;
                        }
                        let candidate = format!("{module}.{name}");
                        if modules.contains_key(&candidate) {
                            bindings
                                .module_aliases
                                .insert(alias.unwrap_or(name), candidate);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    bindings
}

fn import_name_and_alias(node: Node<'_>, source: &str) -> (String, Option<String>) {
    if node.kind() == "aliased_import" {
        let name = node
            .child_by_field_name("name")
            .map(|n| python::text(n, source).to_string())
            .unwrap_or_default();
        let alias = node
            .child_by_field_name("alias")
            .map(|n| python::text(n, source).to_string());
        (name, alias)
    } else {
        (python::text(node, source).to_string(), None)
    }
}

fn check_table_primary_keys(
    file: &ParsedFile,
    bindings: &ImportBindings,
    failures: &mut Vec<TestFailure>,
) {
    let source = file.source.as_str();
    for stmt in python::top_level_statements(file.tree.root_node()) {
        if stmt.kind() != "class_definition" {
            continue;
        }
        let Some(superclasses) = stmt.child_by_field_name("superclasses") else {
            continue;
        };
        let mut is_table = false;
        let mut cursor = superclasses.walk();
        for arg in superclasses.named_children(&mut cursor) {
            if arg.kind() == "keyword_argument" {
                let name = arg.child_by_field_name("name");
                let value = arg.child_by_field_name("value");
                if let (Some(name), Some(value)) = (name, value) {
                    if python::text(name, source) == "table" && python::is_true(value) {
                        is_table = true;
                    }
                }
            }
        }
        if !is_table {
            continue;
        }

        let mut has_primary_key = false;
        if let Some(body) = stmt.child_by_field_name("body") {
            let mut body_cursor = body.walk();
            for member in body.named_children(&mut body_cursor) {
                let member = python::unwrap_statement(member);
                if member.kind() != "assignment" {
                    continue;
                }
                let Some(right) = member.child_by_field_name("right") else {
                    continue;
                };
                if right.kind() != "call"
                    || !is_field_call(
                        right,
                        source,
                        &bindings.sqlmodel_field_symbols,
                        &bindings.sqlmodel_module_aliases,
                    )
                {
                    continue;
                }
                for (name, value) in python::call_keyword_args(right, source) {
                    if name == "primary_key" && python::is_true(value) {
                        has_primary_key = true;
                    }
                }
            }
        }

        if !has_primary_key {
            let class_name = stmt
                .child_by_field_name("name")
                .map(|n| python::text(n, source).to_string())
                .unwrap_or_default();
            failures.push(
                TestFailure::import_smoke(format!(
                    "SQLModel table `{class_name}` is missing a primary key. Add \
                     `primary_key=True` to at least one `Field(...)`."
                ))
                .at(file.path.clone(), Some(python::line(stmt))),
            );
        }
    }
}

#[allow(clippy::too_many_lines)]
fn check_usage(
    file: &ParsedFile,
    modules: &BTreeMap<String, ModuleInfo>,
    bindings: &ImportBindings,
    dependency_names: &HashSet<String>,
    failures: &mut Vec<TestFailure>,
) {
    let source = file.source.as_str();
    let module_info = &modules[&file.module];
    let mut uses_email_str = false;

    python::visit(file.tree.root_node(), &mut |node| {
        match node.kind() {
            "identifier" => {
                if python::text(node, source) == "EmailStr" {
                    uses_email_str = true;
                }
            }
            "assignment" => {
                // Field name colliding with its own type annotation breaks
                // Pydantic model construction at import time.
                if let (Some(left), Some(annotation)) = (
                    node.child_by_field_name("left"),
                    node.child_by_field_name("type"),
                ) {
                    if left.kind() == "identifier" {
                        let target = python::text(left, source);
                        if python::subtree_mentions_identifier(annotation, source, target) {
                            failures.push(
                                TestFailure::import_smoke(annotation_collision_message(target))
                                    .at(file.path.clone(), Some(python::line(node))),
                            );
                        }
                    }
                }
            }
            "attribute" => {
                let (Some(object), Some(attr)) = (
                    node.child_by_field_name("object"),
                    node.child_by_field_name("attribute"),
                ) else {
                    return;
                };
                if object.kind() != "identifier" || is_store_context(node) {
                    return;
                }
                let Some(target_module) =
                    bindings.module_aliases.get(python::text(object, source))
                else {
                    return;
                };
                let Some(target_info) = modules.get(target_module) else {
                    return;
                };
                let attr_name = python::text(attr, source);
                if !target_info.exports.contains(attr_name) {
                    failures.push(
                        TestFailure::import_smoke(format!(
                            "Attribute reference uses missing symbol `{target_module}.{attr_name}`."
                        ))
                        .at(file.path.clone(), Some(python::line(node))),
                    );
                }
            }
            "subscript" => {
                // `.one()[0]` / `.first()[0]` on a scalar select raises TypeError.
                let Some(value) = node.child_by_field_name("value") else {
                    return;
                };
                if value.kind() != "call" {
                    return;
                }
                let Some(func) = value.child_by_field_name("function") else {
                    return;
                };
                if func.kind() != "attribute" {
                    return;
                }
                let attr = func
                    .child_by_field_name("attribute")
                    .map(|a| python::text(a, source));
                if !matches!(attr, Some("one") | Some("first")) {
                    return;
                }
                if func
                    .child_by_field_name("object")
                    .is_some_and(|obj| is_exec_call(obj, source))
                {
                    failures.push(
                        TestFailure::import_smoke(
                            "Calling `.one()[0]` or `.first()[0]` on `session.exec(...)` result \
                             throws a TypeError when selecting single scalar columns like \
                             `func.count()`. Omit the `[0]` subscript.",
                        )
                        .at(file.path.clone(), Some(python::line(node))),
                    );
                }
            }
            "call" => {
                check_call(node, file, modules, bindings, module_info, failures);
            }
            _ => {}
        }
    });

    if uses_email_str {
        let has_email_dependency = dependency_names
            .iter()
            .any(|dep| dep == "email-validator" || dep.starts_with("pydantic[email]"));
        if !has_email_dependency {
            failures.push(
                TestFailure::import_smoke(
                    "Generated code uses `EmailStr` but dependencies do not include \
                     `email-validator` or `pydantic[email]`.",
                )
                .at(file.path.clone(), Some(1)),
            );
        }
    }
}

fn is_exec_call(node: Node<'_>, source: &str) -> bool {
    node.kind() == "call"
        && node
            .child_by_field_name("function")
            .is_some_and(|func| {
                func.kind() == "attribute"
                    && func
                        .child_by_field_name("attribute")
                        .is_some_and(|attr| python::text(attr, source) == "exec")
            })
}

fn check_call(
    call: Node<'_>,
    file: &ParsedFile,
    modules: &BTreeMap<String, ModuleInfo>,
    bindings: &ImportBindings,
    module_info: &ModuleInfo,
    failures: &mut Vec<TestFailure>,
) {
    let source = file.source.as_str();
    let Some(func) = call.child_by_field_name("function") else {
        return;
    };

    // `app.include_router(R, prefix=P)` where R already declares prefix P.
    if func.kind() == "attribute"
        && func
            .child_by_field_name("attribute")
            .is_some_and(|attr| python::text(attr, source) == "include_router")
    {
        let include_prefix = python::call_keyword_args(call, source)
            .into_iter()
            .find(|(name, _)| name == "prefix")
            .and_then(|(_, value)| python::string_value(value, source));
        let router_prefix = call_router_prefix(call, source, modules, bindings);
        if let (Some(include_prefix), Some(router_prefix)) = (include_prefix, router_prefix) {
            if include_prefix == router_prefix && include_prefix != "/" {
                failures.push(
                    TestFailure::import_smoke(format!(
                        "Router prefix is duplicated: `{router_prefix}` is declared both in the \
                         router and in `include_router(...)`. Keep the prefix in exactly one \
                         place."
                    ))
                    .at(file.path.clone(), Some(python::line(call))),
                );
            }
        }
    }

    // `session.exec(...).scalar_one()` fails at runtime in the sandbox.
    if func.kind() == "attribute"
        && func
            .child_by_field_name("attribute")
            .is_some_and(|attr| python::text(attr, source) == "scalar_one")
        && func
            .child_by_field_name("object")
            .is_some_and(|obj| is_exec_call(obj, source))
    {
        failures.push(
            TestFailure::import_smoke(
                "SQLModel result handling uses `session.exec(...).scalar_one()`, which is \
                 incompatible with the sandbox runtime. Use a supported pattern such as \
                 `.one()`, `.first()`, or `.one_or_none()` depending on intent.",
            )
            .at(file.path.clone(), Some(python::line(call))),
        );
    }

    if is_field_call(
        call,
        source,
        &bindings.sqlmodel_field_symbols,
        &bindings.sqlmodel_module_aliases,
    ) {
        check_field_call(call, file, module_info, failures);
    }

    // Resolve calls to local module functions and validate keyword usage.
    let (target_module, target_function) = match func.kind() {
        "attribute" => {
            let object = func.child_by_field_name("object");
            let attribute = func.child_by_field_name("attribute");
            match (object, attribute) {
                (Some(obj), Some(attr)) if obj.kind() == "identifier" => (
                    bindings
                        .module_aliases
                        .get(python::text(obj, source))
                        .cloned(),
                    Some(python::text(attr, source).to_string()),
                ),
                _ => (None, None),
            }
        }
        "identifier" => match bindings.direct_imports.get(python::text(func, source)) {
            Some((module, symbol)) => (Some(module.clone()), Some(symbol.clone())),
            None => (None, None),
        },
        _ => (None, None),
    };
    let (Some(target_module), Some(target_function)) = (target_module, target_function) else {
        return;
    };
    let Some(target_info) = modules.get(&target_module) else {
        return;
    };

    let Some(signature) = target_info.functions.get(&target_function) else {
        if !target_info.exports.contains(&target_function) {
            failures.push(
                TestFailure::import_smoke(format!(
                    "Call references missing symbol `{target_module}.{target_function}`."
                ))
                .at(file.path.clone(), Some(python::line(call))),
            );
        }
        return;
    };
    if signature.accepts_var_keyword {
        return;
    }

    let mut invalid: Vec<String> = python::call_keyword_args(call, source)
        .into_iter()
        .filter(|(name, _)| !signature.keyword_params.contains(name))
        .map(|(name, _)| name)
        .collect();
    invalid.sort();
    invalid.dedup();
    if !invalid.is_empty() {
        failures.push(
            TestFailure::import_smoke(format!(
                "Call to `{target_module}.{target_function}` uses unsupported keyword(s): {}",
                invalid.join(", ")
            ))
            .at(file.path.clone(), Some(python::line(call))),
        );
    }
}

fn call_router_prefix(
    call: Node<'_>,
    source: &str,
    modules: &BTreeMap<String, ModuleInfo>,
    bindings: &ImportBindings,
) -> Option<String> {
    let router_arg = python::call_positional_args(call).into_iter().next()?;
    match router_arg.kind() {
        "attribute" => {
            let object = router_arg.child_by_field_name("object")?;
            if object.kind() != "identifier" {
                return None;
            }
            let module = bindings.module_aliases.get(python::text(object, source))?;
            let attr = router_arg.child_by_field_name("attribute")?;
            modules
                .get(module)?
                .router_prefixes
                .get(python::text(attr, source))
                .cloned()
        }
        "identifier" => {
            let (module, symbol) = bindings
                .direct_imports
                .get(python::text(router_arg, source))?;
            modules.get(module)?.router_prefixes.get(symbol).cloned()
        }
        _ => None,
    }
}

fn check_field_call(
    call: Node<'_>,
    file: &ParsedFile,
    module_info: &ModuleInfo,
    failures: &mut Vec<TestFailure>,
) {
    let source = file.source.as_str();
    let line = python::line(call);
    let mut seen: HashSet<String> = HashSet::new();
    for (name, _) in python::call_keyword_args(call, source) {
        if !seen.insert(name.clone()) {
            failures.push(
                TestFailure::import_smoke(format!(
                    "SQLModel Field declares keyword argument `{name}` multiple times. A keyword \
                     argument cannot be repeated."
                ))
                .at(file.path.clone(), Some(line)),
            );
        }
    }

    if seen.contains("pattern") {
        failures.push(
            TestFailure::import_smoke(
                "SQLModel Field uses unsupported keyword `pattern`; use `regex` instead.",
            )
            .at(file.path.clone(), Some(line)),
        );
    }
    if seen.contains("primary_key") && seen.contains("sa_column") {
        failures.push(
            TestFailure::import_smoke(
                "SQLModel Field cannot declare both `primary_key` and `sa_column`; move \
                 `primary_key=True` into the SQLAlchemy Column.",
            )
            .at(file.path.clone(), Some(line)),
        );
    }
    if seen.contains("index") && seen.contains("sa_column") {
        failures.push(
            TestFailure::import_smoke(
                "SQLModel Field cannot declare both `index` and `sa_column`; move `index=True` \
                 into the SQLAlchemy Column.",
            )
            .at(file.path.clone(), Some(line)),
        );
    }
    if seen.contains("foreign_key") && seen.contains("sa_column") {
        failures.push(
            TestFailure::import_smoke(
                "SQLModel Field cannot declare both `foreign_key` and `sa_column`; move the \
                 foreign key constraint into the SQLAlchemy Column with `ForeignKey(...)`.",
            )
            .at(file.path.clone(), Some(line)),
        );
    }

    if seen.contains("index") {
        // Field(index=True) on a column that also carries Index("ix_…", "col")
        // creates the index twice at startup.
        let field_name = call.parent().and_then(|parent| {
            if parent.kind() != "assignment" || parent.child_by_field_name("type").is_none() {
                return None;
            }
            parent
                .child_by_field_name("left")
                .filter(|left| left.kind() == "identifier")
                .map(|left| python::text(left, source).to_string())
        });
        if let Some(field_name) = field_name {
            if module_info.explicit_indexed_fields.contains(&field_name) {
                failures.push(
                    TestFailure::import_smoke(format!(
                        "Field `{field_name}` declares `index=True` and also has an explicit \
                         SQLAlchemy `Index(...)` declaration. Keep the index in exactly one \
                         place to avoid duplicate index creation at startup."
                    ))
                    .at(file.path.clone(), Some(line)),
                );
            }
        }
    }
}

fn validator_patch_requests(failures: &[TestFailure]) -> Vec<FilePatchRequest> {
    let mut order: Vec<String> = Vec::new();
    let mut by_path: HashMap<String, Vec<String>> = HashMap::new();
    for failure in failures {
        let Some(path) = failure.file_path.as_deref() else {
            continue;
        };
        let path = path.trim();
        if path.is_empty() {
            continue;
        }
        if !by_path.contains_key(path) {
            order.push(path.to_string());
        }
        by_path
            .entry(path.to_string())
            .or_default()
            .push(failure.message.clone());
    }
    order
        .into_iter()
        .map(|path| {
            let instructions = by_path.remove(&path).unwrap_or_default();
            FilePatchRequest {
                path,
                reason: VALIDATOR_PATCH_REASON.to_string(),
                instructions,
            }
        })
        .collect()
}

/// Run the whole-bundle static consistency check.
pub fn validate_bundle(code: &GeneratedCode) -> TestRunReport {
    let (modules, parsed_files, mut failures) = build_module_infos(code);
    let dependency_names: HashSet<String> = code
        .dependencies
        .iter()
        .map(|dep| dep.trim().to_string())
        .filter(|dep| !dep.is_empty())
        .collect();

    for file in &parsed_files {
        let bindings = collect_imports(file, &modules, &mut failures);
        check_table_primary_keys(file, &bindings, &mut failures);
        check_usage(file, &modules, &bindings, &dependency_names, &mut failures);
    }

    // Duplicate schema bootstrap across the database module and the app entry.
    if let (Some(database), Some(main)) = (modules.get("app.database"), modules.get("app.main")) {
        if database.has_create_all && main.has_create_all {
            failures.push(
                TestFailure::import_smoke(
                    "Schema initialization runs in both `app.database` and `app.main` via \
                     `SQLModel.metadata.create_all(...)`. Keep startup schema creation in \
                     exactly one place to avoid duplicate index/table creation on boot.",
                )
                .at(main.path.clone(), Some(1)),
            );
        }
    }

    let mut deduped: Vec<TestFailure> = Vec::new();
    let mut seen: HashSet<(String, String, Option<usize>)> = HashSet::new();
    for failure in failures {
        let key = (
            failure.file_path.clone().unwrap_or_default(),
            failure.message.clone(),
            failure.line_number,
        );
        if seen.insert(key) {
            deduped.push(failure);
        }
    }

    let patch_requests = validator_patch_requests(&deduped);
    TestRunReport {
        passed: deduped.is_empty(),
        checks_run: vec!["syntax".into(), "import_smoke".into()],
        failures: deduped,
        warnings: vec![],
        patch_requests,
    }
}

/// Merge the deterministic validator's findings into a reviewer report.
///
/// If the validator reported any failure, the merged report is forced to
/// `approved = false` with `security_score` capped at [`VALIDATOR_SCORE_CAP`],
/// and the validator's findings are appended as high-severity issues, patch
/// requests, and affected files.
pub fn merge_validator_report(review: &mut ReviewReport, validator: &TestRunReport) {
    if validator.failures.is_empty() {
        return;
    }

    review.approved = false;
    review.security_score = review.security_score.min(VALIDATOR_SCORE_CAP);

    for failure in &validator.failures {
        review.issues.push(Issue {
            severity: Severity::High,
            description: failure.message.clone(),
            file_path: failure.file_path.clone().unwrap_or_default(),
            line_number: failure.line_number,
        });
    }
    for request in &validator.patch_requests {
        let duplicate = review.patch_requests.iter().any(|existing| {
            existing.path == request.path && existing.instructions == request.instructions
        });
        if !duplicate {
            review.patch_requests.push(request.clone());
        }
        if !review.affected_files.contains(&request.path) {
            review.affected_files.push(request.path.clone());
        }
    }
}

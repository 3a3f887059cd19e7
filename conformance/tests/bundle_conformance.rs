//! Cross-module conformance tests: validator findings and normalizer
//! rewrites cooperating on the same bundle.

use conformance::{
    normalize_bundle, python, sanitize_path, validate_bundle, CodeFile, GeneratedCode,
};

fn bundle(files: Vec<(&str, &str)>) -> GeneratedCode {
    GeneratedCode::new(
        files
            .into_iter()
            .map(|(path, content)| CodeFile::new(path, content))
            .collect(),
        vec![],
    )
}

#[test]
fn test_duplicate_bootstrap_is_flagged_then_normalized_away() {
    let mut code = bundle(vec![
        (
            "app/main.py",
            "from fastapi import FastAPI\n\
             from sqlmodel import SQLModel\n\
             from app.database import engine\n\n\
             app = FastAPI()\n\
             SQLModel.metadata.create_all(engine)\n",
        ),
        (
            "app/database.py",
            "from sqlmodel import SQLModel\n\n\
             engine = None\n\n\n\
             def init_db(engine):\n\
             \x20   SQLModel.metadata.create_all(engine)\n",
        ),
        (
            "app/models.py",
            "from sqlmodel import SQLModel, Field\n\n\n\
             class Todo(SQLModel, table=True):\n\
             \x20   id: int = Field(primary_key=True)\n",
        ),
    ]);

    // The validator flags the duplicate bootstrap against app/main.py.
    let report = validate_bundle(&code);
    assert!(!report.passed);
    assert!(report.failures.iter().any(|f| {
        f.message.contains("Schema initialization runs in both")
            && f.file_path.as_deref() == Some("app/main.py")
    }));
    assert!(report.patch_requests.iter().any(|r| r.path == "app/main.py"));

    // The sandbox normalizer strips the bootstrap from main, keeping the
    // database module's copy.
    normalize_bundle(&mut code);
    let main = code.file("app/main.py").unwrap();
    assert!(!main.content.contains("SQLModel.metadata.create_all(engine)"));
    assert!(python::parses_cleanly(&main.content));
    let database = code.file("app/database.py").unwrap();
    assert!(database.content.contains("SQLModel.metadata.create_all(engine)"));

    // The normalized bundle no longer trips the duplicate-bootstrap check.
    let normalized_report = validate_bundle(&code);
    assert!(!normalized_report
        .failures
        .iter()
        .any(|f| f.message.contains("Schema initialization runs in both")));
}

#[test]
fn test_bootstrap_strip_is_discarded_when_it_would_break_the_file() {
    // When create_all is the only statement in a function body, stripping it
    // would leave an unparseable file; the parse-preserving guard keeps the
    // original instead.
    let mut code = bundle(vec![
        (
            "app/main.py",
            "from sqlmodel import SQLModel\n\
             from app.database import engine\n\n\n\
             def on_startup():\n\
             \x20   SQLModel.metadata.create_all(engine)\n",
        ),
        (
            "app/database.py",
            "from sqlmodel import SQLModel\n\n\
             engine = None\n\n\n\
             def init_db(engine):\n\
             \x20   SQLModel.metadata.create_all(engine)\n",
        ),
    ]);
    normalize_bundle(&mut code);
    let main = code.file("app/main.py").unwrap();
    assert!(python::parses_cleanly(&main.content));
    assert!(main.content.contains("SQLModel.metadata.create_all(engine)"));
}

#[test]
fn test_normalized_bundles_keep_path_invariants() {
    let mut code = bundle(vec![
        ("app\\main.py", "app = None\n"),
        ("/app//routes.py", "router = None\n"),
    ]);
    for file in code.files.iter_mut() {
        file.path = sanitize_path(&file.path);
    }
    normalize_bundle(&mut code);

    let mut seen = std::collections::HashSet::new();
    for file in &code.files {
        assert!(file.path.starts_with("app/"), "path {}", file.path);
        assert!(!file.path.contains(".."));
        assert_eq!(sanitize_path(&file.path), file.path);
        assert!(seen.insert(file.path.clone()), "duplicate {}", file.path);
    }
}

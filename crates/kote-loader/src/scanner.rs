//! Static code scanner.
//!
//! Untrusted modules are compiled with a bare engine and their syntax
//! tree is walked before anything in them runs. The scanner never
//! evaluates code. The verdict is the most severe rule that fired;
//! every finding is reported.

use std::collections::BTreeSet;
use std::fmt;

use rhai::{ASTNode, Engine, Expr, OptimizationLevel, Position, Stmt};

// ─── Rule set ───────────────────────────────────────────────────────────

/// Calls that execute external processes or evaluate code.
const EXEC_CALLS: &[&str] = &[
    "system",
    "exec",
    "shell",
    "popen",
    "run_command",
    "eval",
    "import_module",
    "load_module",
];

/// Namespaces whose every function counts as process execution.
const EXEC_NAMESPACES: &[&str] = &["process", "subprocess"];

/// Calls that destroy the account or its sessions.
const ACCOUNT_CALLS: &[&str] = &["delete_account", "reset_authorizations"];

const BLOCKED_IMPORTS: &[&str] = &["account", "auth"];

/// Literals naming the session and credential files.
const CREDENTIAL_MARKERS: &[&str] = &[".session", "kote.toml", "kote.db", ".env"];

const WARNING_IMPORTS: &[&str] = &["fs", "shutil", "ftp", "smtp"];

const REFLECTIVE_CALLS: &[&str] = &["open", "get_attr", "set_attr", "call_fn", "Fn"];

const INFO_IMPORTS: &[&str] = &["http", "requests", "socket", "net", "url"];

// ─── Result types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScanLevel {
    Safe,
    Info,
    Warning,
    Block,
}

impl fmt::Display for ScanLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanLevel::Safe => "safe",
            ScanLevel::Info => "info",
            ScanLevel::Warning => "warning",
            ScanLevel::Block => "block",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub level: ScanLevel,
    pub reasons: Vec<String>,
}

impl ScanResult {
    pub fn is_blocked(&self) -> bool {
        self.level == ScanLevel::Block
    }
}

#[derive(Default)]
struct Findings {
    level: Option<ScanLevel>,
    reasons: BTreeSet<String>,
}

impl Findings {
    fn add(&mut self, level: ScanLevel, what: String, pos: Position) {
        self.level = Some(self.level.map_or(level, |l| l.max(level)));
        let reason = match pos.line() {
            Some(line) => format!("{what} (line {line})"),
            None => what,
        };
        self.reasons.insert(reason);
    }

    fn finish(self) -> ScanResult {
        match self.level {
            Some(level) => ScanResult {
                level,
                reasons: self.reasons.into_iter().collect(),
            },
            None => ScanResult {
                level: ScanLevel::Safe,
                reasons: vec!["no dangerous constructs found".to_string()],
            },
        }
    }
}

// ─── Scan ───────────────────────────────────────────────────────────────

/// Scan script source. Pure: same input, same verdict.
pub fn scan(source: &str) -> ScanResult {
    let mut engine = Engine::new_raw();
    engine.set_optimization_level(OptimizationLevel::None);

    let ast = match engine.compile(source) {
        Ok(ast) => ast,
        Err(e) => {
            return ScanResult {
                level: ScanLevel::Safe,
                reasons: vec![format!(
                    "syntax error ({e}); not a security concern, the loader will report it"
                )],
            }
        }
    };

    let mut findings = Findings::default();
    ast.walk(&mut |path: &[ASTNode]| {
        match path.last() {
            Some(ASTNode::Expr(expr)) => inspect_expr(expr, &mut findings),
            Some(ASTNode::Stmt(stmt)) => inspect_stmt(stmt, &mut findings),
            _ => {}
        }
        true
    });
    findings.finish()
}

fn inspect_expr(expr: &Expr, findings: &mut Findings) {
    match expr {
        Expr::FnCall(call, pos) => {
            let namespace = call.namespace.to_string();
            inspect_call(call.name.as_str(), &namespace, *pos, findings);
        }
        Expr::MethodCall(call, pos) => {
            inspect_call(call.name.as_str(), "", *pos, findings);
        }
        Expr::StringConstant(value, pos) => {
            if let Some(marker) = CREDENTIAL_MARKERS
                .iter()
                .find(|m| value.as_str().contains(*m))
            {
                findings.add(
                    ScanLevel::Block,
                    format!("string literal references credential file `{marker}`"),
                    *pos,
                );
            }
        }
        _ => {}
    }
}

fn inspect_call(name: &str, namespace: &str, pos: Position, findings: &mut Findings) {
    let root = namespace.split("::").next().unwrap_or_default();

    if EXEC_NAMESPACES.contains(&root) {
        findings.add(
            ScanLevel::Block,
            format!("call to `{namespace}::{name}` executes external processes"),
            pos,
        );
    } else if EXEC_CALLS.contains(&name) {
        findings.add(
            ScanLevel::Block,
            format!("call to `{name}` executes external code"),
            pos,
        );
    } else if ACCOUNT_CALLS.contains(&name) {
        findings.add(
            ScanLevel::Block,
            format!("call to `{name}` destroys account sessions"),
            pos,
        );
    } else if REFLECTIVE_CALLS.contains(&name) {
        findings.add(
            ScanLevel::Warning,
            format!("reflective call `{name}`"),
            pos,
        );
    }
}

fn inspect_stmt(stmt: &Stmt, findings: &mut Findings) {
    // A call in statement position is a statement node, not an expression.
    if let Stmt::FnCall(call, pos) = stmt {
        let namespace = call.namespace.to_string();
        inspect_call(call.name.as_str(), &namespace, *pos, findings);
    }

    if let Stmt::Import(import, pos) = stmt {
        let Expr::StringConstant(path, _) = &import.0 else {
            findings.add(
                ScanLevel::Block,
                "dynamic import with a computed module path".to_string(),
                *pos,
            );
            return;
        };
        let module = import_root(path.as_str());

        if BLOCKED_IMPORTS.contains(&module) {
            findings.add(
                ScanLevel::Block,
                format!("import of account module `{module}`"),
                *pos,
            );
        } else if WARNING_IMPORTS.contains(&module) {
            findings.add(
                ScanLevel::Warning,
                format!("import of filesystem/mail module `{module}`"),
                *pos,
            );
        } else if INFO_IMPORTS.contains(&module) {
            findings.add(
                ScanLevel::Info,
                format!("import of network module `{module}`"),
                *pos,
            );
        }
    }
}

/// `"lib/http.rhai"` → `"http"`.
fn import_root(path: &str) -> &str {
    let last = path.rsplit(['/', '\\']).next().unwrap_or(path);
    last.strip_suffix(".rhai").unwrap_or(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_script_is_safe() {
        let result = scan(
            r#"
            fn ping(event) { "pong" }
            fn register() { [#{ kind: "command", name: "ping", handler: "ping" }] }
            "#,
        );
        assert_eq!(result.level, ScanLevel::Safe);
        assert_eq!(result.reasons, vec!["no dangerous constructs found"]);
    }

    #[test]
    fn test_syntax_error_is_safe_with_note() {
        let result = scan("fn broken( {");
        assert_eq!(result.level, ScanLevel::Safe);
        assert!(result.reasons[0].contains("syntax error"));
    }

    #[test]
    fn test_exec_call_blocks() {
        let result = scan("fn run(e) {\n  system(\"rm -rf /\");\n}");
        assert!(result.is_blocked());
        assert!(result.reasons.iter().any(|r| r.contains("`system`")));
        assert!(result.reasons.iter().any(|r| r.contains("line 2")));
    }

    #[test]
    fn test_process_namespace_blocks() {
        let result = scan("import \"process\" as process;\nprocess::run(\"ls\");");
        assert!(result.is_blocked());
        assert!(result.reasons.iter().any(|r| r.contains("process::run")));
    }

    #[test]
    fn test_eval_blocks() {
        assert!(scan("eval(\"40 + 2\")").is_blocked());
    }

    #[test]
    fn test_account_calls_block() {
        assert!(scan("fn nuke() { delete_account() }").is_blocked());
        assert!(scan("reset_authorizations();").is_blocked());
    }

    #[test]
    fn test_credential_literal_blocks() {
        let result = scan("let f = \"bot.session\";");
        assert!(result.is_blocked());
        assert!(scan("let c = \"kote.toml\";").is_blocked());
    }

    #[test]
    fn test_blocked_import() {
        assert!(scan("import \"auth\" as a;").is_blocked());
    }

    #[test]
    fn test_warning_import_and_reflection() {
        let result = scan("import \"fs\" as fs;\nlet f = open(\"data.txt\");");
        assert_eq!(result.level, ScanLevel::Warning);
        assert_eq!(result.reasons.len(), 2);
    }

    #[test]
    fn test_info_import() {
        let result = scan("import \"lib/http\" as http;");
        assert_eq!(result.level, ScanLevel::Info);
        assert!(result.reasons[0].contains("`http`"));
    }

    #[test]
    fn test_level_is_maximum_and_reasons_collected() {
        let result = scan("import \"http\" as h;\nimport \"fs\" as f;\nsystem(\"x\");");
        assert_eq!(result.level, ScanLevel::Block);
        assert_eq!(result.reasons.len(), 3);
    }

    #[test]
    fn test_function_bodies_are_scanned() {
        let result = scan("fn helper() {\n  let x = 1;\n  if x > 0 { popen(\"sh\") }\n}");
        assert!(result.is_blocked());
        assert!(result.reasons.iter().any(|r| r.contains("`popen`") && r.contains("line 3")));
    }

    #[test]
    fn test_computed_import_blocks() {
        let result = scan("let name = \"pro\" + \"cess\";\nimport name as p;\np::run(\"ls\");");
        assert!(result.is_blocked());
        assert!(result
            .reasons
            .iter()
            .any(|r| r.contains("dynamic import") && r.contains("line 2")));
    }

    #[test]
    fn test_method_call_is_inspected() {
        let result = scan("let x = \"a\"; x.exec();");
        assert!(result.is_blocked());
    }

    #[test]
    fn test_duplicate_reasons_deduplicated() {
        let result = scan("system(\"a\"); system(\"a\");");
        assert_eq!(result.reasons.len(), 1);
    }

    #[test]
    fn test_import_root() {
        assert_eq!(import_root("http"), "http");
        assert_eq!(import_root("lib/net.rhai"), "net");
    }
}

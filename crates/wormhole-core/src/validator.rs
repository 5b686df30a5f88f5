//! Static admission checks over the syntax tree.
//!
//! One deterministic walk collects every violation in source order; nothing
//! is ever executed. The denylists below are the complete set of names the
//! walk consults.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::lang::ast::*;
use crate::lang::{self, Pos, Program};
use crate::policy::PolicySet;

/// Names that grant ambient power when referenced.
pub const FORBIDDEN_OPERATIONS: &[&str] = &[
    // dynamic evaluation and compilation
    "eval",
    "exec",
    "compile",
    "__import__",
    // raw environment access
    "globals",
    "locals",
    "vars",
    "__builtins__",
    "environ",
    "getenv",
    // introspection and mutation
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "dir",
    "type",
    "object",
    "super",
    "memoryview",
    "id",
    // filesystem, process and network
    "open",
    "input",
    "print",
    "breakpoint",
    "exit",
    "quit",
    "system",
    "popen",
    "spawn",
    "fork",
    "socket",
    "subprocess",
];

/// Forbidden names that double as everyday identifiers. A reference is
/// reported only where no enclosing scope binds the name; the sandbox has
/// no builtin behind any of them.
pub const SHADOWABLE_OPERATIONS: &[&str] = &["id", "type", "input", "object"];

/// Double-underscore attributes that are harmless hooks.
pub const ALLOWED_DUNDER_ATTRIBUTES: &[&str] = &[
    "__init__", "__str__", "__repr__", "__len__", "__format__", "__eq__", "__hash__",
];

/// The host's privileged query primitives. Functions reach data only
/// through the bridge binding, never through these.
pub const HOST_PRIMITIVES: &[&str] = &["spi", "spi_exec", "spi_prepare", "spi_execute", "plpy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DisallowedCapability,
    ForbiddenOperation,
    ForbiddenAttributeAccess,
    DirectHostAccess,
    SyntaxError,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::DisallowedCapability => "disallowed_capability",
            ViolationKind::ForbiddenOperation => "forbidden_operation",
            ViolationKind::ForbiddenAttributeAccess => "forbidden_attribute_access",
            ViolationKind::DirectHostAccess => "direct_host_access",
            ViolationKind::SyntaxError => "syntax_error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// The exact offending construct (module root, name, attribute).
    pub detail: String,
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({}:{})", self.kind, self.detail, self.line, self.col)
    }
}

/// Outcome of validating one source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub accepted: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub(crate) fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            accepted: violations.is_empty(),
            violations,
        }
    }

    /// Whether any violation has the given kind and detail.
    pub fn has(&self, kind: ViolationKind, detail: &str) -> bool {
        self.violations
            .iter()
            .any(|v| v.kind == kind && v.detail == detail)
    }

    pub fn is_syntax_error(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.kind == ViolationKind::SyntaxError)
    }

    /// One-line summary, e.g. `disallowed_capability: os (1:1); ...`
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validates sources against a policy.
#[derive(Debug, Clone, Copy)]
pub struct Validator<'a> {
    policy: &'a PolicySet,
    bridge_binding: &'a str,
}

impl<'a> Validator<'a> {
    pub fn new(policy: &'a PolicySet, bridge_binding: &'a str) -> Self {
        Self {
            policy,
            bridge_binding,
        }
    }

    pub fn validate(&self, source: &str) -> ValidationReport {
        self.validate_program(source).0
    }

    /// Validate and, when accepted, hand back the parsed tree so it can be
    /// cached without parsing again.
    pub fn validate_program(&self, source: &str) -> (ValidationReport, Option<Program>) {
        let program = match lang::parse(source) {
            Ok(program) => program,
            Err(err) => {
                let violation = Violation {
                    kind: ViolationKind::SyntaxError,
                    detail: err.to_string(),
                    line: err.line,
                    col: err.col,
                };
                return (ValidationReport::from_violations(vec![violation]), None);
            }
        };

        let mut walker = Walker {
            policy: self.policy,
            bridge: self.bridge_binding,
            scopes: vec![bindings(&program.body)],
            violations: Vec::new(),
        };
        walker.block(&program.body);
        let report = ValidationReport::from_violations(walker.violations);
        let program = report.accepted.then_some(program);
        (report, program)
    }
}

/// Validate `source` against `policy` with the default bridge binding.
pub fn validate(source: &str, policy: &PolicySet) -> ValidationReport {
    Validator::new(policy, crate::config::DEFAULT_BRIDGE_BINDING).validate(source)
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

/// Names a block binds in its own scope. Nested function bodies are their
/// own scopes and are not descended into.
fn bindings(stmts: &[Stmt]) -> HashSet<String> {
    let mut names = HashSet::new();
    collect_bindings(stmts, &mut names);
    names
}

fn collect_bindings(stmts: &[Stmt], names: &mut HashSet<String>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Def(def) => {
                names.insert(def.name.clone());
            }
            StmtKind::Assign { targets, .. } => {
                for target in targets {
                    collect_targets(target, names);
                }
            }
            StmtKind::AugAssign { target, .. } => collect_targets(target, names),
            StmtKind::For { target, body, .. } => {
                collect_targets(target, names);
                collect_bindings(body, names);
            }
            StmtKind::While { body, .. } => collect_bindings(body, names),
            StmtKind::If { branches, orelse } => {
                for (_, body) in branches {
                    collect_bindings(body, names);
                }
                collect_bindings(orelse, names);
            }
            StmtKind::Try {
                body,
                handlers,
                finally,
            } => {
                collect_bindings(body, names);
                for handler in handlers {
                    if let Some(name) = &handler.name {
                        names.insert(name.clone());
                    }
                    collect_bindings(&handler.body, names);
                }
                collect_bindings(finally, names);
            }
            StmtKind::Import(imports) => {
                for import in imports {
                    names.insert(import.binding().to_string());
                }
            }
            StmtKind::ImportFrom { names: imported, .. } => {
                for (name, alias) in imported {
                    names.insert(alias.as_ref().unwrap_or(name).clone());
                }
            }
            StmtKind::Return(_)
            | StmtKind::Raise(_)
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Pass
            | StmtKind::Expr(_) => {}
        }
    }
}

fn collect_targets(target: &Expr, names: &mut HashSet<String>) {
    match &target.kind {
        ExprKind::Name(name) => {
            names.insert(name.clone());
        }
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            for item in items {
                collect_targets(item, names);
            }
        }
        _ => {}
    }
}

struct Walker<'a> {
    policy: &'a PolicySet,
    bridge: &'a str,
    /// Bound names per enclosing scope, innermost last.
    scopes: Vec<HashSet<String>>,
    violations: Vec<Violation>,
}

impl Walker<'_> {
    fn report(&mut self, kind: ViolationKind, detail: impl Into<String>, pos: Pos) {
        self.violations.push(Violation {
            kind,
            detail: detail.into(),
            line: pos.line,
            col: pos.col,
        });
    }

    fn capability(&mut self, root: &str, pos: Pos) {
        if HOST_PRIMITIVES.contains(&root) {
            self.report(ViolationKind::DirectHostAccess, root, pos);
        } else if !self.policy.is_allowed(root) {
            self.report(ViolationKind::DisallowedCapability, root, pos);
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn in_scope(&mut self, scope: HashSet<String>, walk: impl FnOnce(&mut Self)) {
        self.scopes.push(scope);
        walk(self);
        self.scopes.pop();
    }

    fn name(&mut self, name: &str, pos: Pos) {
        if HOST_PRIMITIVES.contains(&name) {
            self.report(ViolationKind::DirectHostAccess, name, pos);
        } else if FORBIDDEN_OPERATIONS.contains(&name)
            && !(SHADOWABLE_OPERATIONS.contains(&name) && self.is_bound(name))
        {
            self.report(ViolationKind::ForbiddenOperation, name, pos);
        }
    }

    fn attribute(&mut self, attr: &str, pos: Pos) {
        if HOST_PRIMITIVES.contains(&attr) {
            self.report(ViolationKind::DirectHostAccess, attr, pos);
        } else if is_dunder(attr) && !ALLOWED_DUNDER_ATTRIBUTES.contains(&attr) {
            self.report(ViolationKind::ForbiddenAttributeAccess, attr, pos);
        }
    }

    fn block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn params(&mut self, params: &[Param]) {
        for param in params {
            if let Some(default) = &param.default {
                self.expr(default);
            }
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Def(def) => {
                self.params(&def.params);
                let mut scope = bindings(&def.body);
                scope.extend(def.params.iter().map(|p| p.name.clone()));
                self.in_scope(scope, |walker| walker.block(&def.body));
            }
            StmtKind::Return(value) | StmtKind::Raise(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    self.expr(test);
                    self.block(body);
                }
                self.block(orelse);
            }
            StmtKind::For { target, iter, body } => {
                self.expr(target);
                self.expr(iter);
                self.block(body);
            }
            StmtKind::While { test, body } => {
                self.expr(test);
                self.block(body);
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
            StmtKind::Import(names) => {
                for import in names {
                    if let Some(root) = import.path.first() {
                        self.capability(root, stmt.pos);
                    }
                    for segment in import.path.iter().skip(1) {
                        self.attribute(segment, stmt.pos);
                    }
                }
            }
            StmtKind::ImportFrom { module, names } => {
                if let Some(root) = module.first() {
                    self.capability(root, stmt.pos);
                }
                for (name, _) in names {
                    self.name(name, stmt.pos);
                    self.attribute(name, stmt.pos);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                finally,
            } => {
                self.block(body);
                for handler in handlers {
                    if let Some(class) = &handler.class {
                        self.name(class, handler.pos);
                    }
                    self.block(&handler.body);
                }
                self.block(finally);
            }
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    self.expr(target);
                }
                self.expr(value);
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.expr(target);
                self.expr(value);
            }
            StmtKind::Expr(expr) => self.expr(expr),
        }
    }

    fn generators(&mut self, generators: &[Comprehension]) {
        for generator in generators {
            self.expr(&generator.target);
            self.expr(&generator.iter);
            for condition in &generator.conditions {
                self.expr(condition);
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(name) => {
                if name == self.bridge {
                    // Only a direct call with a literal statement may reach it.
                    self.report(
                        ViolationKind::ForbiddenOperation,
                        format!("{} (non-call reference)", self.bridge),
                        expr.pos,
                    );
                } else {
                    self.name(name, expr.pos);
                }
            }
            ExprKind::Const(_) => {}
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            ExprKind::Dict(entries) => {
                for (key, value) in entries {
                    self.expr(key);
                    self.expr(value);
                }
            }
            ExprKind::ListComp {
                element,
                generators,
            } => self.in_scope(comprehension_bindings(generators), |walker| {
                walker.generators(generators);
                walker.expr(element);
            }),
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => self.in_scope(comprehension_bindings(generators), |walker| {
                walker.generators(generators);
                walker.expr(key);
                walker.expr(value);
            }),
            ExprKind::Attribute { value, attr } => {
                self.expr(value);
                self.attribute(attr, expr.pos);
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value);
                self.expr(index);
            }
            ExprKind::Slice { lower, upper } => {
                if let Some(lower) = lower {
                    self.expr(lower);
                }
                if let Some(upper) = upper {
                    self.expr(upper);
                }
            }
            ExprKind::Call { func, args, kwargs } => {
                match &func.kind {
                    ExprKind::Name(name) if name == self.bridge => {
                        let statement = args
                            .first()
                            .or_else(|| {
                                kwargs
                                    .iter()
                                    .find(|(key, _)| key == "statement")
                                    .map(|(_, value)| value)
                            });
                        if statement.and_then(Expr::as_str_literal).is_none() {
                            self.report(
                                ViolationKind::ForbiddenOperation,
                                format!("{}(<non-literal statement>)", self.bridge),
                                expr.pos,
                            );
                        }
                    }
                    _ => self.expr(func),
                }
                for arg in args {
                    self.expr(arg);
                }
                for (_, value) in kwargs {
                    self.expr(value);
                }
            }
            ExprKind::BinOp { left, right, .. } | ExprKind::BoolOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Compare { left, rest } => {
                self.expr(left);
                for (_, right) in rest {
                    self.expr(right);
                }
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test);
                self.expr(body);
                self.expr(orelse);
            }
            ExprKind::Lambda { params, body } => {
                self.params(params);
                let scope = params.iter().map(|p| p.name.clone()).collect();
                self.in_scope(scope, |walker| walker.expr(body));
            }
        }
    }
}

fn comprehension_bindings(generators: &[Comprehension]) -> HashSet<String> {
    let mut names = HashSet::new();
    for generator in generators {
        collect_targets(&generator.target, &mut names);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PolicySet {
        PolicySet::standard()
    }

    fn check(src: &str) -> ValidationReport {
        validate(src, &policy())
    }

    #[test]
    fn accepts_allowed_imports_and_bridge_calls() {
        let report = check(
            "import math\n\ndef total(ids):\n    rows = query('SELECT amount FROM t WHERE id = $1', [ids[0]])\n    return math.fsum([r['amount'] for r in rows])\n",
        );
        assert!(report.accepted, "{}", report.summary());
        assert!(report.violations.is_empty());
    }

    #[test]
    fn reports_every_disallowed_import() {
        let report = check("import os\nimport os.path\nfrom subprocess import run\nimport requests\n");
        assert!(!report.accepted);
        let details: Vec<_> = report
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::DisallowedCapability)
            .map(|v| v.detail.as_str())
            .collect();
        assert_eq!(details, vec!["os", "os", "subprocess", "requests"]);
    }

    #[test]
    fn forbidden_names_are_reported_even_with_allowed_imports() {
        let report = check("import math\n\ndef f(x):\n    return eval(x) + math.sqrt(2)\n");
        assert!(!report.accepted);
        assert!(report.has(ViolationKind::ForbiddenOperation, "eval"));
        assert_eq!(report.violations.len(), 1);
    }

    #[test]
    fn dunder_attributes_except_allow_set() {
        let report = check("def f(x):\n    a = x.__class__\n    b = x.__len__()\n    return x.__dict__\n");
        assert!(report.has(ViolationKind::ForbiddenAttributeAccess, "__class__"));
        assert!(report.has(ViolationKind::ForbiddenAttributeAccess, "__dict__"));
        assert!(!report.has(ViolationKind::ForbiddenAttributeAccess, "__len__"));
    }

    #[test]
    fn host_primitives_are_direct_host_access() {
        let report = check("def f():\n    return plpy.execute('SELECT 1')\n");
        assert!(report.has(ViolationKind::DirectHostAccess, "plpy"));

        let report = check("def f():\n    return spi_exec('SELECT 1')\n");
        assert!(report.has(ViolationKind::DirectHostAccess, "spi_exec"));

        let report = check("import plpy\n");
        assert!(report.has(ViolationKind::DirectHostAccess, "plpy"));
    }

    #[test]
    fn bridge_statement_must_be_literal() {
        let report = check("def f(table):\n    return query('SELECT * FROM ' + table)\n");
        assert!(report.has(
            ViolationKind::ForbiddenOperation,
            "query(<non-literal statement>)"
        ));

        let report = check("def f():\n    q = query\n    return q('SELECT 1')\n");
        assert!(report.has(ViolationKind::ForbiddenOperation, "query (non-call reference)"));

        let report = check("def f():\n    return query(statement='SELECT 1')\n");
        assert!(report.accepted, "{}", report.summary());
    }

    #[test]
    fn violations_follow_source_order() {
        let report = check("import os\ndef f():\n    exec('1')\n    return x.__globals__\n");
        let kinds: Vec<_> = report.violations.iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ViolationKind::DisallowedCapability,
                ViolationKind::ForbiddenOperation,
                ViolationKind::ForbiddenAttributeAccess,
            ]
        );
        assert_eq!(report.violations[1].line, 3);
    }

    #[test]
    fn syntax_errors_are_a_single_violation() {
        let (report, program) =
            Validator::new(&policy(), "query").validate_program("def f(:\n    pass\n");
        assert!(!report.accepted);
        assert!(program.is_none());
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::SyntaxError);
        assert!(report.violations[0].detail.starts_with("1:"));
    }

    #[test]
    fn accepted_source_returns_program() {
        let (report, program) =
            Validator::new(&policy(), "query").validate_program("def f():\n    return 1\n");
        assert!(report.accepted);
        assert!(program.unwrap().function("f").is_some());
    }

    #[test]
    fn custom_bridge_binding_is_respected() {
        let validator_policy = policy();
        let validator = Validator::new(&validator_policy, "sql");
        let report = validator.validate("def f(s):\n    return sql(s)\n");
        assert!(report.has(ViolationKind::ForbiddenOperation, "sql(<non-literal statement>)"));
    }

    #[test]
    fn everyday_names_are_allowed_where_bound() {
        let report = check(
            "def get(id, type=None):\n    object = [x for x in [id]]\n    return (id, type, object)\n",
        );
        assert!(report.accepted, "{}", report.summary());

        let report = check("def pick(rows):\n    return [row['id'] for id in rows for row in [id]]\n");
        assert!(report.accepted, "{}", report.summary());

        let report = check("def get(id):\n    return id\n\ndef other(x):\n    return id(x)\n");
        assert_eq!(report.violations.len(), 1);
        assert!(report.has(ViolationKind::ForbiddenOperation, "id"));
        assert_eq!(report.violations[0].line, 5);

        let report = check("def f(x):\n    return type(x)\n");
        assert!(report.has(ViolationKind::ForbiddenOperation, "type"));
        let report = check("def f(eval):\n    return eval\n");
        assert!(report.has(ViolationKind::ForbiddenOperation, "eval"));
    }
}

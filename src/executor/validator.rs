//! 許可リストによる構文木検証
//!
//! 実行前に構文木全体を走査し、許可リスト外の呼び出し・属性参照・名前を
//! 1つでも含むソースを拒否します（fail closed）。
//!
//! ## 主要機能
//! - モジュール直下は関数定義・定数代入・docstring のみ許可
//! - import / while / global / 入れ子の def を拒否
//! - 呼び出し先は組み込み関数・`math` / `random` の一部・リストと辞書のメソッドに限定
//! - ダンダー名（`__xxx__`）と予約名への代入を拒否

use std::collections::HashSet;

use super::ast::*;

/// 呼び出し可能な組み込み関数
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "range", "len", "min", "max", "abs", "sum", "round", "int", "float", "list", "tuple",
    "enumerate", "zip", "sorted",
];

/// 事前束縛されるモジュール名
pub const MODULES: &[&str] = &["math", "random"];

pub const MATH_FUNCTIONS: &[&str] = &[
    "sqrt", "sin", "cos", "tan", "atan2", "hypot", "floor", "ceil", "radians", "degrees",
];

pub const MATH_CONSTANTS: &[&str] = &["pi", "e"];

pub const RANDOM_FUNCTIONS: &[&str] = &["uniform", "choice", "random"];

/// 値に対して呼び出せるメソッド（list.append / list.extend / dict.get）
pub const METHODS: &[&str] = &["append", "extend", "get"];

/// 受け付けるキーワード引数名
pub const KEYWORD_ARGUMENTS: &[&str] = &["key", "reverse", "default", "start"];

/// 検証違反（最初に見つかったもの）
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub message: String,
    pub line: usize,
}

/// モジュール全体を検証
pub fn validate_module(module: &Module) -> Result<(), Violation> {
    Validator::new(module).run(module)
}

struct Validator {
    module_names: HashSet<String>,
    function_names: HashSet<String>,
    scopes: Vec<HashSet<String>>,
    loop_depth: usize,
    line: usize,
}

impl Validator {
    fn new(module: &Module) -> Self {
        let function_names = module.functions().map(|def| def.name.clone()).collect();
        Self {
            module_names: HashSet::new(),
            function_names,
            scopes: Vec::new(),
            loop_depth: 0,
            line: 0,
        }
    }

    fn run(&mut self, module: &Module) -> Result<(), Violation> {
        // モジュール直下
        for stmt in &module.body {
            self.line = stmt.line;
            match &stmt.kind {
                StmtKind::FunctionDef(_) => {}
                StmtKind::Assign { targets, value } => {
                    self.check_expr(value)?;
                    for target in targets {
                        self.check_target(target)?;
                        let mut names = Vec::new();
                        collect_target_names(target, &mut names);
                        self.module_names.extend(names);
                    }
                }
                StmtKind::Expr(Expr::Str(_)) | StmtKind::Pass => {}
                StmtKind::Import { module } => {
                    return Err(self.violation(&format!("import of '{}' is not allowed", module)));
                }
                _ => {
                    return Err(self.violation(
                        "only function definitions and assignments are allowed at module level",
                    ));
                }
            }
        }

        for def in module.functions() {
            self.check_function(def)?;
        }
        Ok(())
    }

    fn check_function(&mut self, def: &FunctionDef) -> Result<(), Violation> {
        self.line = def.line;
        self.check_name_binding(&def.name)?;

        let mut locals = HashSet::new();
        for param in &def.params {
            self.check_name_binding(&param.name)?;
            if let Some(default) = &param.default {
                self.check_expr(default)?;
            }
            locals.insert(param.name.clone());
        }
        collect_assigned_names(&def.body, &mut locals);

        self.scopes.push(locals);
        let result = self.check_block(&def.body);
        self.scopes.pop();
        result
    }

    fn check_block(&mut self, body: &[Stmt]) -> Result<(), Violation> {
        body.iter().try_for_each(|stmt| self.check_stmt(stmt))
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Result<(), Violation> {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::FunctionDef(def) => Err(self.violation(&format!(
                "nested function definition '{}' is not allowed",
                def.name
            ))),
            StmtKind::Import { module } => {
                Err(self.violation(&format!("import of '{}' is not allowed", module)))
            }
            StmtKind::While { .. } => Err(self.violation("while loops are not allowed")),
            StmtKind::Global { .. } => {
                Err(self.violation("global and nonlocal declarations are not allowed"))
            }
            StmtKind::Expr(expr) => self.check_expr(expr),
            StmtKind::Assign { targets, value } => {
                self.check_expr(value)?;
                targets.iter().try_for_each(|target| self.check_target(target))
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.check_target(target)?;
                if let Target::Name(name) = target {
                    self.check_load(name)?;
                }
                self.check_expr(value)
            }
            StmtKind::Return(value) => match value {
                Some(expr) => self.check_expr(expr),
                None => Ok(()),
            },
            StmtKind::If { test, body, orelse } => {
                self.check_expr(test)?;
                self.check_block(body)?;
                self.check_block(orelse)
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.check_expr(iter)?;
                self.check_target(target)?;
                self.loop_depth += 1;
                let result = self.check_block(body);
                self.loop_depth -= 1;
                result?;
                self.check_block(orelse)
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    Err(self.violation("'break' or 'continue' outside loop"))
                } else {
                    Ok(())
                }
            }
            StmtKind::Pass => Ok(()),
        }
    }

    fn check_target(&mut self, target: &Target) -> Result<(), Violation> {
        match target {
            Target::Name(name) => self.check_name_binding(name),
            Target::Tuple(items) => items.iter().try_for_each(|item| self.check_target(item)),
            Target::Subscript { value, index } => {
                self.check_expr(value)?;
                self.check_expr(index)
            }
        }
    }

    fn check_expr(&mut self, expr: &Expr) -> Result<(), Violation> {
        match expr {
            Expr::None | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => Ok(()),
            Expr::Name(name) => self.check_load(name),
            Expr::List(items) | Expr::Tuple(items) => {
                items.iter().try_for_each(|item| self.check_expr(item))
            }
            Expr::Dict(entries) => entries.iter().try_for_each(|(key, value)| {
                self.check_expr(key)?;
                self.check_expr(value)
            }),
            Expr::BinOp { left, right, .. } | Expr::BoolOp { left, right, .. } => {
                self.check_expr(left)?;
                self.check_expr(right)
            }
            Expr::Unary { operand, .. } => self.check_expr(operand),
            Expr::Compare { left, ops } => {
                self.check_expr(left)?;
                ops.iter().try_for_each(|(_, right)| self.check_expr(right))
            }
            Expr::IfExp { test, body, orelse } => {
                self.check_expr(test)?;
                self.check_expr(body)?;
                self.check_expr(orelse)
            }
            Expr::Call {
                func,
                args,
                keywords,
            } => self.check_call(func, args, keywords),
            Expr::Attribute { value, attr } => match value.as_ref() {
                Expr::Name(module) if module == "math" && MATH_CONSTANTS.contains(&attr.as_str()) => {
                    Ok(())
                }
                _ => Err(self.violation(&format!("attribute access '.{}' is not allowed", attr))),
            },
            Expr::Subscript { value, index } => {
                self.check_expr(value)?;
                self.check_expr(index)
            }
            Expr::Slice { lower, upper } => {
                if let Some(lower) = lower {
                    self.check_expr(lower)?;
                }
                if let Some(upper) = upper {
                    self.check_expr(upper)?;
                }
                Ok(())
            }
            Expr::ListComp { element, clauses } => self.check_comprehension(element, clauses),
            Expr::Lambda { .. } => {
                Err(self.violation("lambda is only allowed as a key= argument"))
            }
        }
    }

    fn check_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[Keyword],
    ) -> Result<(), Violation> {
        match func {
            Expr::Name(name) if BUILTIN_FUNCTIONS.contains(&name.as_str()) => {}
            Expr::Name(name) if self.function_names.contains(name) => {
                return Err(self.violation(&format!(
                    "calling user-defined function '{}' is not allowed",
                    name
                )));
            }
            Expr::Name(name) => {
                return Err(self.violation(&format!("call to '{}' is not allowed", name)));
            }
            Expr::Attribute { value, attr } => match value.as_ref() {
                Expr::Name(module) if module == "math" => {
                    if !MATH_FUNCTIONS.contains(&attr.as_str()) {
                        return Err(self.violation(&format!("call to 'math.{}' is not allowed", attr)));
                    }
                }
                Expr::Name(module) if module == "random" => {
                    if !RANDOM_FUNCTIONS.contains(&attr.as_str()) {
                        return Err(
                            self.violation(&format!("call to 'random.{}' is not allowed", attr))
                        );
                    }
                }
                receiver => {
                    if !METHODS.contains(&attr.as_str()) {
                        return Err(self.violation(&format!("method '.{}' is not allowed", attr)));
                    }
                    self.check_expr(receiver)?;
                }
            },
            _ => return Err(self.violation("only direct calls to allowed functions are permitted")),
        }

        args.iter().try_for_each(|arg| self.check_expr(arg))?;

        for keyword in keywords {
            if !KEYWORD_ARGUMENTS.contains(&keyword.name.as_str()) {
                return Err(self.violation(&format!(
                    "keyword argument '{}' is not allowed",
                    keyword.name
                )));
            }
            match (&keyword.value, keyword.name.as_str()) {
                (Expr::Lambda { params, body }, "key") => self.check_lambda(params, body)?,
                (value, _) => self.check_expr(value)?,
            }
        }
        Ok(())
    }

    fn check_lambda(&mut self, params: &[String], body: &Expr) -> Result<(), Violation> {
        for param in params {
            self.check_name_binding(param)?;
        }
        self.scopes.push(params.iter().cloned().collect());
        let result = self.check_expr(body);
        self.scopes.pop();
        result
    }

    fn check_comprehension(
        &mut self,
        element: &Expr,
        clauses: &[Comprehension],
    ) -> Result<(), Violation> {
        self.scopes.push(HashSet::new());
        let result = self.check_clauses(element, clauses);
        self.scopes.pop();
        result
    }

    fn check_clauses(&mut self, element: &Expr, clauses: &[Comprehension]) -> Result<(), Violation> {
        for clause in clauses {
            self.check_expr(&clause.iter)?;
            self.check_target(&clause.target)?;
            let mut names = Vec::new();
            collect_target_names(&clause.target, &mut names);
            if let Some(scope) = self.scopes.last_mut() {
                scope.extend(names);
            }
            clause
                .conditions
                .iter()
                .try_for_each(|condition| self.check_expr(condition))?;
        }
        self.check_expr(element)
    }

    // 名前の読み出し
    fn check_load(&self, name: &str) -> Result<(), Violation> {
        if is_dunder(name) {
            return Err(self.violation(&format!("name '{}' is not allowed", name)));
        }
        if self.scopes.iter().any(|scope| scope.contains(name))
            || self.module_names.contains(name)
            || BUILTIN_FUNCTIONS.contains(&name)
        {
            return Ok(());
        }
        if MODULES.contains(&name) {
            return Err(self.violation(&format!(
                "module '{}' may only be used for allowed calls",
                name
            )));
        }
        if self.function_names.contains(name) {
            return Err(self.violation(&format!(
                "reference to function '{}' is not allowed",
                name
            )));
        }
        Err(self.violation(&format!("name '{}' is not defined", name)))
    }

    // 名前への束縛
    fn check_name_binding(&self, name: &str) -> Result<(), Violation> {
        if is_dunder(name) {
            return Err(self.violation(&format!("name '{}' is not allowed", name)));
        }
        if BUILTIN_FUNCTIONS.contains(&name) || MODULES.contains(&name) {
            return Err(self.violation(&format!("cannot assign to reserved name '{}'", name)));
        }
        Ok(())
    }

    fn violation(&self, message: &str) -> Violation {
        Violation {
            message: message.to_string(),
            line: self.line,
        }
    }
}

fn is_dunder(name: &str) -> bool {
    name.starts_with("__")
}

fn collect_target_names(target: &Target, names: &mut Vec<String>) {
    match target {
        Target::Name(name) => names.push(name.clone()),
        Target::Tuple(items) => items.iter().for_each(|item| collect_target_names(item, names)),
        Target::Subscript { .. } => {}
    }
}

// 関数本体で代入される名前（ローカル変数）
fn collect_assigned_names(body: &[Stmt], names: &mut HashSet<String>) {
    for stmt in body {
        let mut found = Vec::new();
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                targets.iter().for_each(|t| collect_target_names(t, &mut found));
            }
            StmtKind::AugAssign { target, .. } => collect_target_names(target, &mut found),
            StmtKind::For {
                target,
                body,
                orelse,
                ..
            } => {
                collect_target_names(target, &mut found);
                collect_assigned_names(body, names);
                collect_assigned_names(orelse, names);
            }
            StmtKind::If { body, orelse, .. } => {
                collect_assigned_names(body, names);
                collect_assigned_names(orelse, names);
            }
            StmtKind::While { body, .. } => collect_assigned_names(body, names),
            _ => {}
        }
        names.extend(found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::parser::parse_module;

    fn check(source: &str) -> Result<(), Violation> {
        validate_module(&parse_module(source).expect("parse"))
    }

    #[test]
    fn test_accepts_typical_step_function() {
        let source = r#"
import_free = 1
def generate(N, Objects, BBox):
    """Spread agents over the damaged buildings."""
    x1, y1, x2, y2 = BBox
    targets = [o['position'] for o in Objects if o.get('condition') == 'damaged']
    coords = []
    for i in range(N):
        if targets:
            coords.append(targets[i % len(targets)])
        else:
            coords.append([random.uniform(x1, x2), random.uniform(y1, y2)])
    coords = sorted(coords, key=lambda p: math.hypot(p[0], p[1]))
    return coords
"#;
        assert_eq!(check(source), Ok(()));
    }

    #[test]
    fn test_rejects_import() {
        let err = check("import os\ndef f(N, Objects, BBox):\n    return []\n").unwrap_err();
        assert!(err.message.contains("import"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_rejects_unlisted_call() {
        let err = check("def f(N, Objects, BBox):\n    return open('x')\n").unwrap_err();
        assert!(err.message.contains("open"));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_rejects_dunder_attribute_escape() {
        let source = "def f(N, Objects, BBox):\n    return ().__class__\n";
        assert!(check(source).is_err());
    }

    #[test]
    fn test_rejects_unlisted_math_function() {
        assert!(check("def f(N, Objects, BBox):\n    return math.exp(1)\n").is_err());
    }

    #[test]
    fn test_rejects_while_loop() {
        let err = check("def f(N, Objects, BBox):\n    while True:\n        pass\n").unwrap_err();
        assert!(err.message.contains("while"));
    }

    #[test]
    fn test_rejects_recursive_call() {
        let err = check("def f(N, Objects, BBox):\n    return f(N, Objects, BBox)\n").unwrap_err();
        assert!(err.message.contains("user-defined"));
    }

    #[test]
    fn test_rejects_lambda_outside_key_argument() {
        assert!(check("def f(N, Objects, BBox):\n    g = lambda x: x\n    return []\n").is_err());
    }

    #[test]
    fn test_rejects_undefined_name() {
        let err = check("def f(N, Objects, BBox):\n    return [eval] * N\n").unwrap_err();
        assert!(err.message.contains("eval"));
    }

    #[test]
    fn test_rejects_shadowing_builtin() {
        assert!(check("def f(N, Objects, BBox):\n    len = 3\n    return []\n").is_err());
    }

    #[test]
    fn test_rejects_nested_function() {
        let source = "def f(N, Objects, BBox):\n    def g():\n        pass\n    return []\n";
        assert!(check(source).is_err());
    }
}

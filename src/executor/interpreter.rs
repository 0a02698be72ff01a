//! 構文木を直接評価するインタプリタ
//!
//! 検証済みのモジュールを隔離されたスコープで評価します。
//! 到達できるのは許可リストの組み込み関数と `math` / `random` のみで、
//! ファイル・ネットワーク・プロセスには一切触れません。
//!
//! 実行量は演算回数とシーケンス長の上限で制限されます。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::Rng;

use super::ast::*;
use super::validator::{BUILTIN_FUNCTIONS, MODULES};
use super::value::{DepthExceeded, LambdaValue, Value};

/// 実行量の上限
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorLimits {
    /// 評価する式・文の最大数
    pub max_operations: u64,
    /// リスト・文字列・range の最大長
    pub max_sequence_len: usize,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_sequence_len: 100_000,
        }
    }
}

/// 実行時エラー（行番号付き）
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub line: usize,
}

type EvalResult<T> = Result<T, RuntimeError>;

const DEPTH_EXCEEDED_MESSAGE: &str = "maximum nesting depth exceeded in comparison";

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

pub struct Interpreter<'r> {
    globals: HashMap<String, Value>,
    scopes: Vec<HashMap<String, Value>>,
    rng: &'r mut SmallRng,
    limits: ExecutorLimits,
    operations: u64,
    line: usize,
}

impl<'r> Interpreter<'r> {
    pub fn new(rng: &'r mut SmallRng, limits: ExecutorLimits) -> Self {
        Self {
            globals: HashMap::new(),
            scopes: Vec::new(),
            rng,
            limits,
            operations: 0,
            line: 0,
        }
    }

    /// 演算回数の累計
    pub fn operations(&self) -> u64 {
        self.operations
    }

    /// モジュール直下の代入を評価してグローバルを構築
    pub fn load_module(&mut self, module: &Module) -> EvalResult<()> {
        for stmt in &module.body {
            if matches!(stmt.kind, StmtKind::FunctionDef(_)) {
                continue;
            }
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                _ => return Err(self.error("unexpected control flow at module level")),
            }
        }
        Ok(())
    }

    /// 関数を位置引数で呼び出す
    pub fn call_function(&mut self, def: &FunctionDef, args: Vec<Value>) -> EvalResult<Value> {
        self.line = def.line;
        if args.len() > def.params.len() {
            return Err(self.error(&format!(
                "{}() takes {} positional arguments but {} were given",
                def.name,
                def.params.len(),
                args.len()
            )));
        }

        let mut locals = HashMap::new();
        let mut supplied = args.into_iter();
        for param in &def.params {
            let value = match supplied.next() {
                Some(value) => value,
                None => match &param.default {
                    Some(default) => self.eval(default)?,
                    None => {
                        return Err(self.error(&format!(
                            "{}() missing required argument '{}'",
                            def.name, param.name
                        )));
                    }
                },
            };
            locals.insert(param.name.clone(), value);
        }

        self.scopes.push(locals);
        let flow = self.exec_block(&def.body);
        self.scopes.pop();

        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::None),
            Flow::Break | Flow::Continue => Err(self.error("'break' or 'continue' outside loop")),
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec_block(&mut self, body: &[Stmt]) -> EvalResult<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> EvalResult<Flow> {
        self.line = stmt.line;
        self.count_operation()?;

        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                self.exec_aug_assign(target, *op, value)?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If { test, body, orelse } => {
                return if self.eval(test)?.truthy() {
                    self.exec_block(body)
                } else {
                    self.exec_block(orelse)
                };
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter)?;
                let items = self.iterate(&iterable)?;
                for item in items {
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Continue | Flow::Normal => {}
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::While { test, body } => {
                while self.eval(test)?.truthy() {
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Continue | Flow::Normal => {}
                    }
                }
            }
            StmtKind::FunctionDef(def) => {
                return Err(self.error(&format!(
                    "nested function definition '{}' is not allowed",
                    def.name
                )));
            }
            StmtKind::Import { module } => {
                return Err(self.error(&format!("import of '{}' is not allowed", module)));
            }
            StmtKind::Global { .. } => {
                return Err(self.error("global declarations are not allowed"));
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn exec_aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> EvalResult<()> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name)?;
                let rhs = self.eval(value)?;
                let updated = self.binary_op(op, &current, &rhs)?;
                self.bind(name, updated);
                Ok(())
            }
            Target::Subscript { value: container, index } => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                let current = self.get_item(&container, &index)?;
                let rhs = self.eval(value)?;
                let updated = self.binary_op(op, &current, &rhs)?;
                self.set_item(&container, index, updated)
            }
            Target::Tuple(_) => Err(self.error("illegal expression for augmented assignment")),
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> EvalResult<()> {
        match target {
            Target::Name(name) => {
                self.bind(name, value);
                Ok(())
            }
            Target::Tuple(targets) => {
                let items = self.iterate(&value)?;
                if items.len() != targets.len() {
                    return Err(self.error(&format!(
                        "cannot unpack {} values into {} targets",
                        items.len(),
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
            Target::Subscript { value: container, index } => {
                let container = self.eval(container)?;
                let index = self.eval(index)?;
                self.set_item(&container, index, value)
            }
        }
    }

    fn bind(&mut self, name: &str, value: Value) {
        match self.scopes.last_mut() {
            Some(scope) => scope.insert(name.to_string(), value),
            None => self.globals.insert(name.to_string(), value),
        };
    }

    fn lookup(&self, name: &str) -> EvalResult<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if let Some(builtin) = BUILTIN_FUNCTIONS.iter().find(|b| **b == name) {
            return Ok(Value::Builtin(*builtin));
        }
        if let Some(module) = MODULES.iter().find(|m| **m == name) {
            return Ok(Value::Module(*module));
        }
        Err(self.error(&format!("name '{}' is not defined", name)))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        self.count_operation()?;

        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::str(s)),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let values = self.eval_all(items)?;
                self.check_length(values.len())?;
                Ok(Value::list(values))
            }
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_all(items)?)),
            Expr::Dict(entries) => {
                let mut dict = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.eval(key)?;
                    if !key.is_hashable() {
                        return Err(self.error(&format!("unhashable type: '{}'", key.type_name())));
                    }
                    let value = self.eval(value)?;
                    Value::dict_insert(&mut dict, key, value).map_err(|e| self.too_deep(e))?;
                }
                Ok(Value::dict(dict))
            }
            Expr::BinOp { left, op, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary_op(*op, &left, &right)
            }
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                self.unary_op(*op, &operand)
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right),
                }
            }
            Expr::Compare { left, ops } => {
                let mut current = self.eval(left)?;
                for (op, right) in ops {
                    let right = self.eval(right)?;
                    if !self.compare(*op, &current, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    current = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Call {
                func,
                args,
                keywords,
            } => self.eval_call(func, args, keywords),
            Expr::Attribute { value, attr } => {
                let value = self.eval(value)?;
                match (&value, attr.as_str()) {
                    (Value::Module("math"), "pi") => Ok(Value::Float(std::f64::consts::PI)),
                    (Value::Module("math"), "e") => Ok(Value::Float(std::f64::consts::E)),
                    _ => Err(self.error(&format!(
                        "'{}' object has no attribute '{}'",
                        value.type_name(),
                        attr
                    ))),
                }
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value)?;
                if let Expr::Slice { lower, upper } = index.as_ref() {
                    let lower = self.eval_optional(lower.as_deref())?;
                    let upper = self.eval_optional(upper.as_deref())?;
                    return self.slice(&container, lower, upper);
                }
                let index = self.eval(index)?;
                self.get_item(&container, &index)
            }
            Expr::Slice { .. } => Err(self.error("slice outside of subscript")),
            Expr::ListComp { element, clauses } => {
                self.scopes.push(HashMap::new());
                let mut out = Vec::new();
                let result = self.comprehension(element, clauses, &mut out);
                self.scopes.pop();
                result?;
                Ok(Value::list(out))
            }
            Expr::Lambda { params, body } => Ok(Value::Lambda(Rc::new(LambdaValue {
                params: params.clone(),
                body: body.clone(),
            }))),
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> EvalResult<Vec<Value>> {
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    fn eval_optional(&mut self, expr: Option<&Expr>) -> EvalResult<Option<Value>> {
        expr.map(|expr| self.eval(expr)).transpose()
    }

    fn comprehension(
        &mut self,
        element: &Expr,
        clauses: &[Comprehension],
        out: &mut Vec<Value>,
    ) -> EvalResult<()> {
        let Some((clause, rest)) = clauses.split_first() else {
            let value = self.eval(element)?;
            out.push(value);
            return self.check_length(out.len());
        };

        let iterable = self.eval(&clause.iter)?;
        for item in self.iterate(&iterable)? {
            self.assign(&clause.target, item)?;
            let mut keep = true;
            for condition in &clause.conditions {
                if !self.eval(condition)?.truthy() {
                    keep = false;
                    break;
                }
            }
            if keep {
                self.comprehension(element, rest, out)?;
            }
        }
        Ok(())
    }

    fn eval_call(&mut self, func: &Expr, args: &[Expr], keywords: &[Keyword]) -> EvalResult<Value> {
        // メソッド呼び出しとモジュール関数
        if let Expr::Attribute { value, attr } = func {
            let receiver = self.eval(value)?;
            let args = self.eval_all(args)?;
            let kwargs = self.eval_keywords(keywords)?;
            return match receiver {
                Value::Module(module) => self.call_module_function(module, attr, &args),
                other => self.call_method(&other, attr, args, &kwargs),
            };
        }

        let callee = self.eval(func)?;
        let args = self.eval_all(args)?;
        let kwargs = self.eval_keywords(keywords)?;
        self.call_value(&callee, args, &kwargs)
    }

    fn eval_keywords(&mut self, keywords: &[Keyword]) -> EvalResult<Vec<(String, Value)>> {
        keywords
            .iter()
            .map(|keyword| Ok((keyword.name.clone(), self.eval(&keyword.value)?)))
            .collect()
    }

    fn call_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: &[(String, Value)],
    ) -> EvalResult<Value> {
        match callee {
            Value::Builtin(name) => self.call_builtin(name, args, kwargs),
            Value::Lambda(lambda) => {
                if !kwargs.is_empty() {
                    return Err(self.error("<lambda>() got an unexpected keyword argument"));
                }
                self.call_lambda(lambda, args)
            }
            other => Err(self.error(&format!("'{}' object is not callable", other.type_name()))),
        }
    }

    fn call_lambda(&mut self, lambda: &LambdaValue, args: Vec<Value>) -> EvalResult<Value> {
        if args.len() != lambda.params.len() {
            return Err(self.error(&format!(
                "<lambda>() takes {} arguments but {} were given",
                lambda.params.len(),
                args.len()
            )));
        }
        let scope = lambda.params.iter().cloned().zip(args).collect();
        self.scopes.push(scope);
        let result = self.eval(&lambda.body);
        self.scopes.pop();
        result
    }

    // ========================================================================
    // Builtins
    // ========================================================================

    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: &[(String, Value)],
    ) -> EvalResult<Value> {
        let kwarg = |key: &str| kwargs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        for (key, _) in kwargs {
            let accepted = match name {
                "min" | "max" => key == "key" || key == "default",
                "sorted" => key == "key" || key == "reverse",
                "sum" | "enumerate" => key == "start",
                _ => false,
            };
            if !accepted {
                return Err(self.error(&format!(
                    "{}() got an unexpected keyword argument '{}'",
                    name, key
                )));
            }
        }

        match name {
            "range" => self.builtin_range(&args),
            "len" => {
                let [value] = self.exact_args::<1>(name, args)?;
                match value.len() {
                    Some(len) => Ok(Value::Int(len as i64)),
                    None => Err(self.error(&format!(
                        "object of type '{}' has no len()",
                        value.type_name()
                    ))),
                }
            }
            "abs" => {
                let [value] = self.exact_args::<1>(name, args)?;
                match value {
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    other => match other.as_int() {
                        Some(i) => i
                            .checked_abs()
                            .map(Value::Int)
                            .ok_or_else(|| self.error("integer overflow")),
                        None => Err(self.error(&format!(
                            "bad operand type for abs(): '{}'",
                            other.type_name()
                        ))),
                    },
                }
            }
            "min" | "max" => self.builtin_min_max(name, args, kwarg("key"), kwarg("default")),
            "sum" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(self.error("sum() takes 1 or 2 arguments"));
                }
                let start = match (args.get(1), kwarg("start")) {
                    (Some(start), _) => start.clone(),
                    (None, Some(start)) => start,
                    (None, None) => Value::Int(0),
                };
                let mut total = start;
                for item in self.iterate(&args[0])? {
                    total = self.binary_op(BinOp::Add, &total, &item)?;
                }
                Ok(total)
            }
            "round" => self.builtin_round(args),
            "int" => {
                let [value] = self.exact_args::<1>(name, args)?;
                self.to_int(&value)
            }
            "float" => {
                let [value] = self.exact_args::<1>(name, args)?;
                match &value {
                    Value::Str(s) => s
                        .trim()
                        .parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| self.error(&format!("could not convert string to float: '{}'", s))),
                    other => other.as_f64().map(Value::Float).ok_or_else(|| {
                        self.error(&format!(
                            "float() argument must be a string or a number, not '{}'",
                            other.type_name()
                        ))
                    }),
                }
            }
            "list" | "tuple" => {
                let items = match args.len() {
                    0 => Vec::new(),
                    1 => self.iterate(&args[0])?,
                    n => {
                        return Err(self.error(&format!(
                            "{}() takes at most 1 argument ({} given)",
                            name, n
                        )));
                    }
                };
                Ok(if name == "list" {
                    Value::list(items)
                } else {
                    Value::tuple(items)
                })
            }
            "enumerate" => {
                if args.len() != 1 {
                    return Err(self.error("enumerate() takes exactly 1 positional argument"));
                }
                let start = match kwarg("start") {
                    Some(value) => self.expect_int(&value)?,
                    None => 0,
                };
                let items = self.iterate(&args[0])?;
                let mut pairs = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let index = i64::try_from(i)
                        .ok()
                        .and_then(|i| start.checked_add(i))
                        .ok_or_else(|| self.error("integer overflow"))?;
                    pairs.push(Value::tuple(vec![Value::Int(index), item]));
                }
                Ok(Value::list(pairs))
            }
            "zip" => {
                let sequences = args
                    .iter()
                    .map(|arg| self.iterate(arg))
                    .collect::<EvalResult<Vec<_>>>()?;
                let shortest = sequences.iter().map(Vec::len).min().unwrap_or(0);
                let rows = (0..shortest)
                    .map(|i| Value::tuple(sequences.iter().map(|seq| seq[i].clone()).collect()))
                    .collect();
                Ok(Value::list(rows))
            }
            "sorted" => {
                let [iterable] = self.exact_args::<1>(name, args)?;
                let items = self.iterate(&iterable)?;
                let reverse = kwarg("reverse").is_some_and(|v| v.truthy());
                let sorted = self.sort_values(items, kwarg("key"), reverse)?;
                Ok(Value::list(sorted))
            }
            other => Err(self.error(&format!("call to '{}' is not allowed", other))),
        }
    }

    fn builtin_range(&mut self, args: &[Value]) -> EvalResult<Value> {
        let ints = args
            .iter()
            .map(|arg| self.expect_int(arg))
            .collect::<EvalResult<Vec<_>>>()?;
        let (start, stop, step) = match ints.as_slice() {
            [stop] => (0, *stop, 1),
            [start, stop] => (*start, *stop, 1),
            [start, stop, step] => (*start, *stop, *step),
            _ => return Err(self.error("range expected 1 to 3 arguments")),
        };
        if step == 0 {
            return Err(self.error("range() arg 3 must not be zero"));
        }

        let span = if step > 0 {
            (stop as i128 - start as i128).max(0)
        } else {
            (start as i128 - stop as i128).max(0)
        };
        let step_abs = (step as i128).abs();
        let len = (span + step_abs - 1) / step_abs;
        if len > self.limits.max_sequence_len as i128 {
            return Err(self.error(&format!("range of {} elements exceeds the sequence limit", len)));
        }

        let values = (0..len as i64).map(|i| Value::Int(start + i * step)).collect();
        Ok(Value::list(values))
    }

    fn builtin_min_max(
        &mut self,
        name: &str,
        args: Vec<Value>,
        key: Option<Value>,
        default: Option<Value>,
    ) -> EvalResult<Value> {
        let items = match args.len() {
            0 => return Err(self.error(&format!("{}() expected at least 1 argument", name))),
            1 => self.iterate(&args[0])?,
            _ => args,
        };
        if items.is_empty() {
            return default.ok_or_else(|| self.error(&format!("{}() arg is an empty sequence", name)));
        }

        let wanted = if name == "min" {
            Ordering::Less
        } else {
            Ordering::Greater
        };
        let mut best: Option<(Value, Value)> = None;
        for item in items {
            let rank = match &key {
                Some(key) => self.call_value(key, vec![item.clone()], &[])?,
                None => item.clone(),
            };
            let replace = match &best {
                None => true,
                Some((_, best_rank)) => self.order(&rank, best_rank)? == wanted,
            };
            if replace {
                best = Some((item, rank));
            }
        }
        Ok(best.map(|(item, _)| item).unwrap_or(Value::None))
    }

    fn builtin_round(&mut self, args: Vec<Value>) -> EvalResult<Value> {
        match args.as_slice() {
            [value] => match value {
                Value::Float(f) => {
                    let rounded = f.round_ties_even();
                    self.float_to_int(rounded)
                }
                other => other
                    .as_int()
                    .map(Value::Int)
                    .ok_or_else(|| self.error(&format!("type {} doesn't define __round__", other.type_name()))),
            },
            [value, digits] => {
                let digits = self.expect_int(digits)?;
                match value {
                    Value::Float(f) => {
                        let scale = 10f64.powi(digits.clamp(-308, 308) as i32);
                        Ok(Value::Float((f * scale).round_ties_even() / scale))
                    }
                    other => other
                        .as_int()
                        .map(Value::Int)
                        .ok_or_else(|| self.error(&format!("type {} doesn't define __round__", other.type_name()))),
                }
            }
            _ => Err(self.error("round() takes 1 or 2 arguments")),
        }
    }

    fn sort_values(&mut self, items: Vec<Value>, key: Option<Value>, reverse: bool) -> EvalResult<Vec<Value>> {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let rank = match &key {
                Some(key) => self.call_value(key, vec![item.clone()], &[])?,
                None => item.clone(),
            };
            keyed.push((rank, item));
        }

        let mut failure = None;
        keyed.sort_by(|(a, _), (b, _)| {
            let ordering = match a.py_cmp(b) {
                Ok(Some(ordering)) => ordering,
                Ok(None) => {
                    failure.get_or_insert_with(|| {
                        format!(
                            "'<' not supported between instances of '{}' and '{}'",
                            a.type_name(),
                            b.type_name()
                        )
                    });
                    Ordering::Equal
                }
                Err(_) => {
                    failure.get_or_insert_with(|| DEPTH_EXCEEDED_MESSAGE.to_string());
                    Ordering::Equal
                }
            };
            if reverse { ordering.reverse() } else { ordering }
        });
        if let Some(message) = failure {
            return Err(self.error(&message));
        }
        Ok(keyed.into_iter().map(|(_, item)| item).collect())
    }

    fn call_module_function(&mut self, module: &str, function: &str, args: &[Value]) -> EvalResult<Value> {
        match module {
            "math" => self.call_math(function, args),
            "random" => self.call_random(function, args),
            _ => Err(self.error(&format!("module '{}' is not available", module))),
        }
    }

    fn call_math(&self, function: &str, args: &[Value]) -> EvalResult<Value> {
        let numbers = args
            .iter()
            .map(|arg| {
                arg.as_f64().ok_or_else(|| {
                    self.error(&format!("must be real number, not {}", arg.type_name()))
                })
            })
            .collect::<EvalResult<Vec<f64>>>()?;

        let unary = || -> EvalResult<f64> {
            match numbers.as_slice() {
                [x] => Ok(*x),
                _ => Err(self.error(&format!("math.{}() takes exactly one argument", function))),
            }
        };

        let result = match function {
            "sqrt" => {
                let x = unary()?;
                if x < 0.0 {
                    return Err(self.error("math domain error"));
                }
                x.sqrt()
            }
            "sin" => unary()?.sin(),
            "cos" => unary()?.cos(),
            "tan" => unary()?.tan(),
            "radians" => unary()?.to_radians(),
            "degrees" => unary()?.to_degrees(),
            "floor" => return self.float_to_int(unary()?.floor()),
            "ceil" => return self.float_to_int(unary()?.ceil()),
            "atan2" => match numbers.as_slice() {
                [y, x] => y.atan2(*x),
                _ => return Err(self.error("math.atan2() takes exactly 2 arguments")),
            },
            "hypot" => numbers.iter().map(|x| x * x).sum::<f64>().sqrt(),
            other => return Err(self.error(&format!("call to 'math.{}' is not allowed", other))),
        };
        Ok(Value::Float(result))
    }

    fn call_random(&mut self, function: &str, args: &[Value]) -> EvalResult<Value> {
        match (function, args) {
            ("random", []) => Ok(Value::Float(self.rng.r#gen::<f64>())),
            ("uniform", [a, b]) => {
                let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                    return Err(self.error("random.uniform() arguments must be numbers"));
                };
                let t = self.rng.r#gen::<f64>();
                Ok(Value::Float(a + (b - a) * t))
            }
            ("choice", [sequence]) => {
                let items = self.iterate(sequence)?;
                if items.is_empty() {
                    return Err(self.error("cannot choose from an empty sequence"));
                }
                let index = self.rng.gen_range(0..items.len());
                Ok(items[index].clone())
            }
            (other, _) => Err(self.error(&format!(
                "random.{}() called with {} arguments",
                other,
                args.len()
            ))),
        }
    }

    fn call_method(
        &mut self,
        receiver: &Value,
        method: &str,
        args: Vec<Value>,
        kwargs: &[(String, Value)],
    ) -> EvalResult<Value> {
        if let Some((key, _)) = kwargs.first() {
            return Err(self.error(&format!(
                "{}() got an unexpected keyword argument '{}'",
                method, key
            )));
        }

        match (receiver, method) {
            (Value::List(items), "append") => {
                let [item] = self.exact_args::<1>("append", args)?;
                let len = items.borrow().len() + 1;
                self.check_length(len)?;
                items.borrow_mut().push(item);
                Ok(Value::None)
            }
            (Value::List(items), "extend") => {
                let [iterable] = self.exact_args::<1>("extend", args)?;
                let extra = self.iterate(&iterable)?;
                let len = items.borrow().len() + extra.len();
                self.check_length(len)?;
                items.borrow_mut().extend(extra);
                Ok(Value::None)
            }
            (Value::Dict(entries), "get") => {
                let (key, default) = match args.as_slice() {
                    [key] => (key.clone(), Value::None),
                    [key, default] => (key.clone(), default.clone()),
                    _ => return Err(self.error("get expected 1 or 2 arguments")),
                };
                let found = Value::dict_lookup(&entries.borrow(), &key).map_err(|e| self.too_deep(e))?;
                Ok(found.unwrap_or(default))
            }
            (other, _) => Err(self.error(&format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                method
            ))),
        }
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn binary_op(&mut self, op: BinOp, left: &Value, right: &Value) -> EvalResult<Value> {
        if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
            return self.int_op(op, a, b);
        }
        if left.is_numeric() && right.is_numeric() {
            let (a, b) = (left.as_f64().unwrap_or_default(), right.as_f64().unwrap_or_default());
            return self.float_op(op, a, b);
        }

        match (op, left, right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                let joined = format!("{}{}", a, b);
                self.check_length(joined.len())?;
                Ok(Value::str(&joined))
            }
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                self.check_length(items.len())?;
                Ok(Value::list(items))
            }
            (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
                let items: Vec<Value> = a.iter().chain(b.iter()).cloned().collect();
                self.check_length(items.len())?;
                Ok(Value::tuple(items))
            }
            (BinOp::Mul, Value::List(_) | Value::Tuple(_) | Value::Str(_), count)
                if count.as_int().is_some() =>
            {
                let times = count.as_int().unwrap_or_default().max(0) as usize;
                self.repeat(left, times)
            }
            (BinOp::Mul, count, Value::List(_) | Value::Tuple(_) | Value::Str(_))
                if count.as_int().is_some() =>
            {
                let times = count.as_int().unwrap_or_default().max(0) as usize;
                self.repeat(right, times)
            }
            _ => Err(self.error(&format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op,
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn int_op(&self, op: BinOp, a: i64, b: i64) -> EvalResult<Value> {
        let overflow = || self.error("integer overflow");
        match op {
            BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if b == 0 {
                    return Err(self.error("division by zero"));
                }
                Ok(Value::Float(a as f64 / b as f64))
            }
            BinOp::FloorDiv => {
                if b == 0 {
                    return Err(self.error("integer division or modulo by zero"));
                }
                let quotient = a.checked_div(b).ok_or_else(overflow)?;
                let adjust = (a % b != 0) && ((a < 0) != (b < 0));
                Ok(Value::Int(if adjust { quotient - 1 } else { quotient }))
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(self.error("integer division or modulo by zero"));
                }
                let remainder = a.checked_rem(b).ok_or_else(overflow)?;
                let adjust = remainder != 0 && ((remainder < 0) != (b < 0));
                Ok(Value::Int(if adjust { remainder + b } else { remainder }))
            }
            BinOp::Pow => {
                if b < 0 {
                    return Ok(Value::Float((a as f64).powf(b as f64)));
                }
                let exponent = u32::try_from(b).map_err(|_| overflow())?;
                a.checked_pow(exponent).map(Value::Int).ok_or_else(overflow)
            }
        }
    }

    fn float_op(&self, op: BinOp, a: f64, b: f64) -> EvalResult<Value> {
        let result = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if b == 0.0 {
                    return Err(self.error("float division by zero"));
                }
                a / b
            }
            BinOp::FloorDiv => {
                if b == 0.0 {
                    return Err(self.error("float floor division by zero"));
                }
                (a / b).floor()
            }
            BinOp::Mod => {
                if b == 0.0 {
                    return Err(self.error("float modulo"));
                }
                let remainder = a % b;
                if remainder != 0.0 && ((remainder < 0.0) != (b < 0.0)) {
                    remainder + b
                } else {
                    remainder
                }
            }
            BinOp::Pow => {
                if a < 0.0 && b.fract() != 0.0 {
                    return Err(self.error("math domain error"));
                }
                if a == 0.0 && b < 0.0 {
                    return Err(self.error("0.0 cannot be raised to a negative power"));
                }
                a.powf(b)
            }
        };
        Ok(Value::Float(result))
    }

    fn unary_op(&self, op: UnaryOp, operand: &Value) -> EvalResult<Value> {
        match (op, operand) {
            (UnaryOp::Not, value) => Ok(Value::Bool(!value.truthy())),
            (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
            (UnaryOp::Neg, value) if value.as_int().is_some() => value
                .as_int()
                .and_then(i64::checked_neg)
                .map(Value::Int)
                .ok_or_else(|| self.error("integer overflow")),
            (UnaryOp::Pos, value) if value.as_int().is_some() => {
                Ok(Value::Int(value.as_int().unwrap_or_default()))
            }
            (_, value) => Err(self.error(&format!(
                "bad operand type for unary operator: '{}'",
                value.type_name()
            ))),
        }
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> EvalResult<bool> {
        let result = match op {
            CmpOp::Eq => self.equal(left, right)?,
            CmpOp::Ne => !self.equal(left, right)?,
            CmpOp::Lt => self.order(left, right)? == Ordering::Less,
            CmpOp::Le => self.order(left, right)? != Ordering::Greater,
            CmpOp::Gt => self.order(left, right)? == Ordering::Greater,
            CmpOp::Ge => self.order(left, right)? != Ordering::Less,
            CmpOp::In => self.contains(right, left)?,
            CmpOp::NotIn => !self.contains(right, left)?,
            CmpOp::Is => left.is_same(right),
            CmpOp::IsNot => !left.is_same(right),
        };
        Ok(result)
    }

    fn equal(&self, left: &Value, right: &Value) -> EvalResult<bool> {
        left.py_eq(right).map_err(|e| self.too_deep(e))
    }

    fn order(&self, left: &Value, right: &Value) -> EvalResult<Ordering> {
        left.py_cmp(right)
            .map_err(|e| self.too_deep(e))?
            .ok_or_else(|| {
                self.error(&format!(
                    "comparison not supported between instances of '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                ))
            })
    }

    fn any_equal<'v>(
        &self,
        candidates: impl IntoIterator<Item = &'v Value>,
        item: &Value,
    ) -> EvalResult<bool> {
        for candidate in candidates {
            if self.equal(candidate, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn contains(&self, container: &Value, item: &Value) -> EvalResult<bool> {
        match container {
            Value::List(items) => self.any_equal(items.borrow().iter(), item),
            Value::Tuple(items) => self.any_equal(items.iter(), item),
            Value::Dict(entries) => self.any_equal(entries.borrow().iter().map(|(k, _)| k), item),
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
                other => Err(self.error(&format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            other => Err(self.error(&format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    // ========================================================================
    // Sequences
    // ========================================================================

    fn iterate(&self, value: &Value) -> EvalResult<Vec<Value>> {
        value
            .iter_values()
            .ok_or_else(|| self.error(&format!("'{}' object is not iterable", value.type_name())))
    }

    fn repeat(&self, sequence: &Value, times: usize) -> EvalResult<Value> {
        let len = sequence.len().unwrap_or(0).saturating_mul(times);
        self.check_length(len)?;
        match sequence {
            Value::Str(s) => Ok(Value::str(&s.repeat(times))),
            Value::List(items) => {
                let items = items.borrow();
                Ok(Value::list(items.iter().cloned().cycle().take(items.len() * times).collect()))
            }
            Value::Tuple(items) => Ok(Value::tuple(
                items.iter().cloned().cycle().take(items.len() * times).collect(),
            )),
            other => Err(self.error(&format!("can't multiply sequence of type '{}'", other.type_name()))),
        }
    }

    fn normalize_index(&self, index: &Value, len: usize, kind: &str) -> EvalResult<usize> {
        let raw = index.as_int().ok_or_else(|| {
            self.error(&format!(
                "{} indices must be integers, not {}",
                kind,
                index.type_name()
            ))
        })?;
        let resolved = if raw < 0 { raw + len as i64 } else { raw };
        if resolved < 0 || resolved >= len as i64 {
            return Err(self.error(&format!("{} index out of range", kind)));
        }
        Ok(resolved as usize)
    }

    fn get_item(&self, container: &Value, index: &Value) -> EvalResult<Value> {
        match container {
            Value::List(items) => {
                let items = items.borrow();
                let i = self.normalize_index(index, items.len(), "list")?;
                Ok(items[i].clone())
            }
            Value::Tuple(items) => {
                let i = self.normalize_index(index, items.len(), "tuple")?;
                Ok(items[i].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = self.normalize_index(index, chars.len(), "string")?;
                Ok(Value::str(&chars[i].to_string()))
            }
            Value::Dict(entries) => Value::dict_lookup(&entries.borrow(), index)
                .map_err(|e| self.too_deep(e))?
                .ok_or_else(|| self.error(&format!("key error: {}", index))),
            other => Err(self.error(&format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn set_item(&self, container: &Value, index: Value, value: Value) -> EvalResult<()> {
        match container {
            Value::List(items) => {
                let len = items.borrow().len();
                let i = self.normalize_index(&index, len, "list")?;
                items.borrow_mut()[i] = value;
                Ok(())
            }
            Value::Dict(entries) => {
                if !index.is_hashable() {
                    return Err(self.error(&format!("unhashable type: '{}'", index.type_name())));
                }
                Value::dict_insert(&mut entries.borrow_mut(), index, value).map_err(|e| self.too_deep(e))
            }
            other => Err(self.error(&format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn slice(&self, container: &Value, lower: Option<Value>, upper: Option<Value>) -> EvalResult<Value> {
        let len = container.len().ok_or_else(|| {
            self.error(&format!("'{}' object is not subscriptable", container.type_name()))
        })?;
        let bound = |value: Option<Value>, default: usize| -> EvalResult<usize> {
            match value {
                None | Some(Value::None) => Ok(default),
                Some(value) => {
                    let raw = self.expect_int(&value)?;
                    let resolved = if raw < 0 { raw + len as i64 } else { raw };
                    Ok(resolved.clamp(0, len as i64) as usize)
                }
            }
        };
        let start = bound(lower, 0)?;
        let end = bound(upper, len)?.max(start);

        match container {
            Value::List(items) => Ok(Value::list(items.borrow()[start..end].to_vec())),
            Value::Tuple(items) => Ok(Value::tuple(items[start..end].to_vec())),
            Value::Str(s) => Ok(Value::str(&s.chars().skip(start).take(end - start).collect::<String>())),
            other => Err(self.error(&format!("'{}' object is not sliceable", other.type_name()))),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn exact_args<const N: usize>(&self, name: &str, args: Vec<Value>) -> EvalResult<[Value; N]> {
        let given = args.len();
        args.try_into().map_err(|_| {
            self.error(&format!("{}() takes exactly {} argument(s) ({} given)", name, N, given))
        })
    }

    fn expect_int(&self, value: &Value) -> EvalResult<i64> {
        value.as_int().ok_or_else(|| {
            self.error(&format!(
                "'{}' object cannot be interpreted as an integer",
                value.type_name()
            ))
        })
    }

    fn to_int(&self, value: &Value) -> EvalResult<Value> {
        match value {
            Value::Float(f) => self.float_to_int(f.trunc()),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| self.error(&format!("invalid literal for int(): '{}'", s))),
            other => other.as_int().map(Value::Int).ok_or_else(|| {
                self.error(&format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))
            }),
        }
    }

    fn float_to_int(&self, value: f64) -> EvalResult<Value> {
        if !value.is_finite() || value.abs() >= 9.2e18 {
            return Err(self.error("cannot convert float to integer"));
        }
        Ok(Value::Int(value as i64))
    }

    fn check_length(&self, len: usize) -> EvalResult<()> {
        if len > self.limits.max_sequence_len {
            return Err(self.error(&format!(
                "sequence length {} exceeds the limit of {}",
                len, self.limits.max_sequence_len
            )));
        }
        Ok(())
    }

    fn count_operation(&mut self) -> EvalResult<()> {
        self.operations += 1;
        if self.operations > self.limits.max_operations {
            return Err(self.error("operation budget exhausted"));
        }
        Ok(())
    }

    fn too_deep(&self, _: DepthExceeded) -> RuntimeError {
        self.error(DEPTH_EXCEEDED_MESSAGE)
    }

    fn error(&self, message: &str) -> RuntimeError {
        RuntimeError {
            message: message.to_string(),
            line: self.line,
        }
    }
}

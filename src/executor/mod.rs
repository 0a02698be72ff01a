//! 権限制限付きステップ関数実行器
//!
//! 外部プランナが生成した関数ソースを検証し、隔離された環境で実行して
//! 型付きの結果（座標・役割ラベル・グループラベル）を取り出します。
//!
//! ## 処理段階
//! 1. 検証: 構文解析と許可リストによる構文木の走査（fail closed）
//! 2. 抽出: 最初に定義された関数を選択（複数定義は警告のみ）
//! 3. 実行: 許可された数値関数のみを公開した隔離スコープで評価
//! 4. 呼び出し: `(N, Objects, BBox)` で呼び出し、戻り値の型と長さを検査

pub mod ast;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod validator;
pub mod value;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::mission::{FunctionType, GroupLabel, StepResult};
use crate::models::{BBox, MapObject, Vector2D};

pub use ast::ParseError;
pub use interpreter::ExecutorLimits;

use ast::{FunctionDef, Module};
use interpreter::Interpreter;
use value::Value;

/// 実行器のエラー（いずれも「このステップは実行できない」を意味する）
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("構文エラー ({0})")]
    Syntax(#[from] ParseError),

    #[error("検証エラー (行 {line}): {message}")]
    Validation { message: String, line: usize },

    #[error("実行エラー (行 {line}): {message}")]
    Execution { message: String, line: usize },

    #[error("戻り値の形式が不正です: {0}")]
    Shape(String),

    #[error("関数が定義されていません")]
    MissingFunction,
}

/// 検証済みのプログラム
#[derive(Debug, Clone)]
pub struct ValidatedProgram {
    module: Module,
    entry: FunctionDef,
}

impl ValidatedProgram {
    /// 呼び出される関数の名前
    pub fn function_name(&self) -> &str {
        &self.entry.name
    }
}

/// ステップ関数実行器
pub struct Executor {
    limits: ExecutorLimits,
    rng: SmallRng,
}

impl Executor {
    /// 新しい実行器を作成
    ///
    /// # 引数
    /// * `seed` - `random.*` の乱数シード（None ならエントロピーから生成）
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            limits: ExecutorLimits::default(),
            rng,
        }
    }

    pub fn with_limits(mut self, limits: ExecutorLimits) -> Self {
        self.limits = limits;
        self
    }

    /// ソースを構文解析・検証し、呼び出す関数を抽出する
    pub fn validate(&self, source: &str) -> Result<ValidatedProgram, ExecutorError> {
        let module = parser::parse_module(source)?;
        validator::validate_module(&module).map_err(|violation| ExecutorError::Validation {
            message: violation.message,
            line: violation.line,
        })?;

        let mut functions = module.functions();
        let entry = functions.next().cloned().ok_or(ExecutorError::MissingFunction)?;
        let ignored: Vec<&str> = functions.map(|def| def.name.as_str()).collect();
        if !ignored.is_empty() {
            warn!(
                function = %entry.name,
                ignored = ?ignored,
                "複数の関数が定義されています。最初の関数のみ実行します"
            );
        }

        Ok(ValidatedProgram { module, entry })
    }

    /// 検証済みプログラムを `(N, Objects, BBox)` で呼び出し、結果を型付けする
    pub fn run(
        &mut self,
        program: &ValidatedProgram,
        function_type: FunctionType,
        agent_count: usize,
        objects: &[MapObject],
        bbox: &BBox,
    ) -> Result<StepResult, ExecutorError> {
        let args = vec![
            Value::Int(agent_count as i64),
            Value::list(objects.iter().map(Value::from).collect()),
            Value::list(bbox.to_array().iter().map(|v| Value::Float(*v)).collect()),
        ];

        let mut interpreter = Interpreter::new(&mut self.rng, self.limits);
        let output = interpreter
            .load_module(&program.module)
            .and_then(|_| interpreter.call_function(&program.entry, args))
            .map_err(|err| ExecutorError::Execution {
                message: err.message,
                line: err.line,
            })?;

        debug!(
            function = %program.entry.name,
            operations = interpreter.operations(),
            "ステップ関数を実行しました"
        );

        extract_result(&output, function_type, agent_count)
    }

    /// 検証と実行を続けて行う
    pub fn execute(
        &mut self,
        source: &str,
        function_type: FunctionType,
        agent_count: usize,
        objects: &[MapObject],
        bbox: &BBox,
    ) -> Result<StepResult, ExecutorError> {
        let program = self.validate(source)?;
        self.run(&program, function_type, agent_count, objects, bbox)
    }
}

/// 戻り値を関数種別に応じて型付けし、長さを検査
fn extract_result(
    output: &Value,
    function_type: FunctionType,
    agent_count: usize,
) -> Result<StepResult, ExecutorError> {
    let items = match output {
        Value::List(_) | Value::Tuple(_) => output.iter_values().unwrap_or_default(),
        other => {
            return Err(ExecutorError::Shape(format!(
                "expected a sequence of {} items, got {}",
                agent_count,
                other.type_name()
            )));
        }
    };
    if items.len() != agent_count {
        return Err(ExecutorError::Shape(format!(
            "expected {} items, got {}",
            agent_count,
            items.len()
        )));
    }

    match function_type {
        FunctionType::Coordinates => items
            .iter()
            .enumerate()
            .map(|(i, item)| to_coordinate(i, item))
            .collect::<Result<Vec<_>, _>>()
            .map(StepResult::Coordinates),
        FunctionType::Role => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Str(s) => Ok(s.to_string()),
                other => Err(ExecutorError::Shape(format!(
                    "item {}: expected a role string, got {}",
                    i,
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(StepResult::Roles),
        FunctionType::Group => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Str(s) => Ok(GroupLabel::Name(s.to_string())),
                Value::Int(id) => Ok(GroupLabel::Id(*id)),
                other => Err(ExecutorError::Shape(format!(
                    "item {}: expected a group label, got {}",
                    i,
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(StepResult::Groups),
    }
}

fn to_coordinate(index: usize, item: &Value) -> Result<Vector2D, ExecutorError> {
    let pair = match item {
        Value::List(_) | Value::Tuple(_) => item.iter_values().unwrap_or_default(),
        other => {
            return Err(ExecutorError::Shape(format!(
                "item {}: expected an (x, y) pair, got {}",
                index,
                other.type_name()
            )));
        }
    };

    match pair.as_slice() {
        [x, y] if !matches!(x, Value::Bool(_)) && !matches!(y, Value::Bool(_)) => {
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Ok(Vector2D::new(x, y)),
                _ => Err(ExecutorError::Shape(format!(
                    "item {}: coordinates must be finite numbers",
                    index
                ))),
            }
        }
        _ => Err(ExecutorError::Shape(format!(
            "item {}: expected an (x, y) pair of numbers",
            index
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::map_object;

    fn executor() -> Executor {
        Executor::new(Some(42))
    }

    fn bbox() -> BBox {
        BBox::new(0.0, 0.0, 100.0, 100.0)
    }

    #[test]
    fn test_box_center_repeated_for_each_agent() {
        let source = r#"
def move_towards_center(N: int, Objects: list, BBox: list[int]) -> list[tuple[int, int]]:
    center_x = (BBox[0] + BBox[2]) / 2
    center_y = (BBox[1] + BBox[3]) / 2
    return [(center_x, center_y)] * N
"#;
        let result = executor()
            .execute(source, FunctionType::Coordinates, 5, &[], &bbox())
            .expect("valid step");
        assert_eq!(
            result,
            StepResult::Coordinates(vec![Vector2D::new(50.0, 50.0); 5])
        );
    }

    #[test]
    fn test_rejects_open_at_validation() {
        let source = "def f(N, Objects, BBox):\n    open('/etc/passwd')\n    return [(0, 0)] * N\n";
        let err = executor().validate(source).unwrap_err();
        assert!(matches!(err, ExecutorError::Validation { line: 2, .. }));
    }

    #[test]
    fn test_rejects_import_statement() {
        let source = "def f(N, Objects, BBox):\n    import math\n    return [(0, 0)] * N\n";
        assert!(matches!(
            executor().validate(source),
            Err(ExecutorError::Validation { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch_is_typed_error() {
        let source = "def f(N, Objects, BBox):\n    return [(1, 2)] * (N - 1)\n";
        let err = executor()
            .execute(source, FunctionType::Coordinates, 3, &[], &bbox())
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Shape(_)));
    }

    #[test]
    fn test_non_numeric_coordinates_are_rejected() {
        let source = "def f(N, Objects, BBox):\n    return [('a', 1)] * N\n";
        assert!(matches!(
            executor().execute(source, FunctionType::Coordinates, 2, &[], &bbox()),
            Err(ExecutorError::Shape(_))
        ));
    }

    #[test]
    fn test_role_and_group_results() {
        let roles = executor()
            .execute(
                "def f(N, Objects, BBox):\n    roles = ['scout', 'leader']\n    return [roles[i % 2] for i in range(N)]\n",
                FunctionType::Role,
                3,
                &[],
                &bbox(),
            )
            .expect("roles");
        assert_eq!(
            roles,
            StepResult::Roles(vec!["scout".into(), "leader".into(), "scout".into()])
        );

        let groups = executor()
            .execute(
                "def f(N, Objects, BBox):\n    return [i % 2 for i in range(N - 1)] + ['reserve']\n",
                FunctionType::Group,
                3,
                &[],
                &bbox(),
            )
            .expect("groups");
        assert_eq!(
            groups,
            StepResult::Groups(vec![
                GroupLabel::Id(0),
                GroupLabel::Id(1),
                GroupLabel::Name("reserve".into())
            ])
        );
    }

    #[test]
    fn test_objects_are_passed_as_records() {
        let objects = map_object::preset("hurricane_map").expect("preset");
        let source = r#"
def avoid_largest_object(N: int, Objects: list, BBox: list[int]) -> list[tuple[int, int]]:
    largest_object = max(Objects, key=lambda obj: obj["radius"])
    opposite_x = BBox[2] - largest_object["position"][0]
    opposite_y = BBox[3] - largest_object["position"][1]
    return [(opposite_x, opposite_y)] * N
"#;
        let result = executor()
            .execute(source, FunctionType::Coordinates, 2, &objects, &BBox::new(0.0, 0.0, 800.0, 600.0))
            .expect("valid step");
        // 最大のオブジェクトは Flooded Area (400, 400)
        assert_eq!(
            result,
            StepResult::Coordinates(vec![Vector2D::new(400.0, 200.0); 2])
        );
    }

    #[test]
    fn test_runtime_error_is_execution_failure() {
        let source = "def f(N, Objects, BBox):\n    return [(BBox[0] / 0, 0)] * N\n";
        assert!(matches!(
            executor().execute(source, FunctionType::Coordinates, 1, &[], &bbox()),
            Err(ExecutorError::Execution { line: 2, .. })
        ));
    }

    #[test]
    fn test_first_function_is_invoked() {
        let source = "def first(N, Objects, BBox):\n    return [(1, 1)] * N\n\ndef second(N, Objects, BBox):\n    return [(2, 2)] * N\n";
        let exec = executor();
        let program = exec.validate(source).expect("valid");
        assert_eq!(program.function_name(), "first");
    }

    #[test]
    fn test_missing_function() {
        assert_eq!(
            executor().validate("x = 1\n").unwrap_err(),
            ExecutorError::MissingFunction
        );
    }

    #[test]
    fn test_syntax_error_is_reported() {
        assert!(matches!(
            executor().validate("def f(N, Objects, BBox)\n    return []\n"),
            Err(ExecutorError::Syntax(_))
        ));
    }

    #[test]
    fn test_budget_exhaustion_is_execution_failure() {
        let limited = Executor::new(Some(1)).with_limits(ExecutorLimits {
            max_operations: 100,
            max_sequence_len: 1_000,
        });
        let mut limited = limited;
        let source = "def f(N, Objects, BBox):\n    out = []\n    for i in range(500):\n        out.append((i, i))\n    return out[:N]\n";
        assert!(matches!(
            limited.execute(source, FunctionType::Coordinates, 2, &[], &bbox()),
            Err(ExecutorError::Execution { .. })
        ));
    }

    fn coordinates_step(expression: &str) -> String {
        format!("def f(N, Objects, BBox):\n    x = {}\n    return [(0, 0)] * N\n", expression)
    }

    #[test]
    fn test_long_flat_expression_is_syntax_error() {
        let chain = vec!["1"; 5000].join(" + ");
        assert!(matches!(
            executor().execute(&coordinates_step(&chain), FunctionType::Coordinates, 1, &[], &bbox()),
            Err(ExecutorError::Syntax(_))
        ));
    }

    #[test]
    fn test_deeply_nested_expression_is_syntax_error() {
        let nested = format!("{}1{}", "[".repeat(300), "]".repeat(300));
        assert!(matches!(
            executor().validate(&coordinates_step(&nested)),
            Err(ExecutorError::Syntax(_))
        ));
        let negated = format!("{}1", "-".repeat(300));
        assert!(matches!(
            executor().validate(&coordinates_step(&negated)),
            Err(ExecutorError::Syntax(_))
        ));
    }

    #[test]
    fn test_oversized_source_is_syntax_error() {
        let source = format!("{}\n{}", coordinates_step("1"), "# padding\n".repeat(10_000));
        assert!(matches!(
            executor().validate(&source),
            Err(ExecutorError::Syntax(_))
        ));
    }

    #[test]
    fn test_self_containing_list_comparison_is_execution_failure() {
        let source = "def f(N, Objects, BBox):\n    a = []\n    a.append(a)\n    b = []\n    b.append(b)\n    if a == b:\n        return [(1, 1)] * N\n    return [(0, 0)] * N\n";
        assert!(matches!(
            executor().execute(source, FunctionType::Coordinates, 1, &[], &bbox()),
            Err(ExecutorError::Execution { line: 6, .. })
        ));
    }

    #[test]
    fn test_enumerate_overflow_is_execution_failure() {
        let source = "def f(N, Objects, BBox):\n    pairs = enumerate(range(N), start=9223372036854775807)\n    return [(i, i) for i, _ in pairs]\n";
        assert!(matches!(
            executor().execute(source, FunctionType::Coordinates, 3, &[], &bbox()),
            Err(ExecutorError::Execution { line: 2, .. })
        ));
    }

    #[test]
    fn test_error_messages_are_localized() {
        let err = ExecutorError::Execution {
            message: "division by zero".into(),
            line: 4,
        };
        assert_eq!(err.to_string(), "実行エラー (行 4): division by zero");
        assert_eq!(ExecutorError::MissingFunction.to_string(), "関数が定義されていません");
    }
}

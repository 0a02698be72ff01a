//! ミッション計画
//!
//! 外部プランナが生成したステップ列を、1 から始まる連続した
//! インデックスを持つ [`MissionPlan`] として保持します。
//!
//! ## 主要機能
//! - プランナ応答（YAML、Markdown のコードフェンス付きも可）の解析
//! - ステップ種別（role / group / coordinates）と実行結果の型付け
//! - ステップごとの進捗（PlanProgress）

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::models::Vector2D;

/// 計画の不備（ミッション開始を拒否する）
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("計画にステップがありません")]
    Empty,

    #[error("プランナ出力のYAMLが不正です: {0}")]
    Yaml(String),

    #[error("ステップ番号は1から連続している必要があります: 期待値 {expected}, 実際 {found}")]
    NonContiguous { expected: usize, found: usize },

    #[error("ステップ{0}が重複して定義されています")]
    DuplicateStep(usize),

    #[error("ステップ{step}: 不明な関数種別 '{value}'")]
    UnknownFunctionType { step: usize, value: String },

    #[error("ステップ{0}: 関数本体がありません")]
    MissingFunctionBody(usize),
}

impl From<serde_yaml::Error> for PlanError {
    fn from(err: serde_yaml::Error) -> Self {
        PlanError::Yaml(err.to_string())
    }
}

/// ステップ関数の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionType {
    /// 各エージェントに役割ラベルを割り当てる
    Role,
    /// 各エージェントにグループラベルを割り当てる
    Group,
    /// 各エージェントの目標座標を生成する
    Coordinates,
}

impl FromStr for FunctionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "role" => Ok(FunctionType::Role),
            "group" => Ok(FunctionType::Group),
            "coordinates" => Ok(FunctionType::Coordinates),
            _ => Err(format!("Invalid function type: {}", s)),
        }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionType::Role => "role",
            FunctionType::Group => "group",
            FunctionType::Coordinates => "coordinates",
        };
        f.write_str(name)
    }
}

/// グループラベル（文字列または整数）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupLabel {
    Id(i64),
    Name(String),
}

impl fmt::Display for GroupLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupLabel::Id(id) => write!(f, "{}", id),
            GroupLabel::Name(name) => f.write_str(name),
        }
    }
}

/// ステップ関数の型付き実行結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepResult {
    Coordinates(Vec<Vector2D>),
    Roles(Vec<String>),
    Groups(Vec<GroupLabel>),
}

/// 計画の1ステップ
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    /// 目的（エンジンは解釈しない）
    pub objective: String,
    pub function_type: FunctionType,
    /// 関数定義のソーステキスト
    pub function_body: String,
    pub task_type: Option<String>,
    /// 実行結果（有効化ごとに高々1回計算）
    pub result: Option<StepResult>,
}

/// プランナ出力の1ステップ（YAML 表現）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    #[serde(alias = "step")]
    pub id: usize,
    pub function_type: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default, alias = "function_body")]
    pub python_function: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlannerDocument {
    Steps(Vec<PlannedStep>),
    Wrapped { steps: Vec<PlannedStep> },
}

/// ステップ番号（1..K）から StepSpec への順序付き写像
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissionPlan {
    steps: BTreeMap<usize, StepSpec>,
}

impl MissionPlan {
    /// プランナ出力から計画を構築
    ///
    /// # 引数
    /// * `planned` - ステップ記述（順不同）
    ///
    /// # 戻り値
    /// 連続したインデックスを持つ計画、または不備を示す PlanError
    pub fn from_planned_steps(planned: &[PlannedStep]) -> Result<Self, PlanError> {
        if planned.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut steps = BTreeMap::new();
        for step in planned {
            let function_type = step.function_type.parse::<FunctionType>().map_err(|_| {
                PlanError::UnknownFunctionType {
                    step: step.id,
                    value: step.function_type.clone(),
                }
            })?;
            let function_body = match &step.python_function {
                Some(body) if !body.trim().is_empty() => body.clone(),
                _ => return Err(PlanError::MissingFunctionBody(step.id)),
            };
            let spec = StepSpec {
                objective: step.objective.clone(),
                function_type,
                function_body,
                task_type: step.task_type.clone(),
                result: None,
            };
            if steps.insert(step.id, spec).is_some() {
                return Err(PlanError::DuplicateStep(step.id));
            }
        }

        for (expected, found) in (1..).zip(steps.keys()) {
            if *found != expected {
                return Err(PlanError::NonContiguous {
                    expected,
                    found: *found,
                });
            }
        }

        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(&index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut StepSpec> {
        self.steps.get_mut(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &StepSpec)> {
        self.steps.iter().map(|(index, spec)| (*index, spec))
    }

    /// 結果キャッシュを破棄（再有効化の前に呼ぶ）
    pub fn clear_results(&mut self) {
        for spec in self.steps.values_mut() {
            spec.result = None;
        }
    }

    /// 全ステップ未完了の進捗を生成
    pub fn initial_progress(&self) -> PlanProgress {
        PlanProgress {
            steps: self
                .iter()
                .map(|(index, spec)| StepProgress {
                    step: index,
                    objective: spec.objective.clone(),
                    completed: false,
                })
                .collect(),
        }
    }
}

/// ステップごとの進捗
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepProgress {
    pub step: usize,
    pub objective: String,
    pub completed: bool,
}

/// 計画全体の進捗
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanProgress {
    pub steps: Vec<StepProgress>,
}

impl PlanProgress {
    pub fn mark_completed(&mut self, step: usize) {
        if let Some(entry) = self.steps.iter_mut().find(|entry| entry.step == step) {
            entry.completed = true;
        }
    }

    pub fn is_completed(&self, step: usize) -> bool {
        self.steps
            .iter()
            .any(|entry| entry.step == step && entry.completed)
    }

    pub fn completed_count(&self) -> usize {
        self.steps.iter().filter(|entry| entry.completed).count()
    }
}

/// Markdown のコードフェンス（```yaml ... ```）を取り除く
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// プランナの応答テキストを計画に変換
pub fn parse_plan_yaml(text: &str) -> Result<MissionPlan, PlanError> {
    let body = strip_code_fences(text);
    if body.trim().is_empty() {
        return Err(PlanError::Empty);
    }

    let document: PlannerDocument = serde_yaml::from_str(&body)?;
    let planned = match document {
        PlannerDocument::Steps(steps) => steps,
        PlannerDocument::Wrapped { steps } => steps,
    };
    MissionPlan::from_planned_steps(&planned)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLANNER_RESPONSE: &str = r#"```yaml
- id: 2
  function_type: "coordinates"
  task_type: "Move Towards Center"
  objective: "Agents move towards the center of the map."
  python_function: |
    def move_towards_center(N: int, Objects: list, BBox: list[int]) -> list[tuple[int, int]]:
        center_x = (BBox[0] + BBox[2]) / 2
        center_y = (BBox[1] + BBox[3]) / 2
        return [(center_x, center_y)] * N
- id: 1
  function_type: "role"
  objective: "Assign roles."
  python_function: |
    def assign_roles(N, Objects, BBox):
        return ["scout"] * N
```"#;

    #[test]
    fn test_parse_fenced_planner_response() {
        let plan = parse_plan_yaml(PLANNER_RESPONSE).expect("valid plan");
        assert_eq!(plan.len(), 2);
        let first = plan.get(1).expect("step 1");
        assert_eq!(first.function_type, FunctionType::Role);
        let second = plan.get(2).expect("step 2");
        assert_eq!(second.function_type, FunctionType::Coordinates);
        assert!(second.function_body.contains("move_towards_center"));
        assert_eq!(second.task_type.as_deref(), Some("Move Towards Center"));
        assert!(second.result.is_none());
    }

    #[test]
    fn test_parse_wrapped_steps_with_step_key() {
        let yaml = r#"
steps:
  - step: 1
    function_type: group
    objective: "Split"
    python_function: |
      def g(N, Objects, BBox):
          return [i % 2 for i in range(N)]
"#;
        let plan = parse_plan_yaml(yaml).expect("valid plan");
        assert_eq!(plan.get(1).map(|s| s.function_type), Some(FunctionType::Group));
    }

    #[test]
    fn test_rejects_non_contiguous_steps() {
        let yaml = r#"
- id: 1
  function_type: role
  python_function: "def f(N, Objects, BBox):\n    return []"
- id: 3
  function_type: role
  python_function: "def f(N, Objects, BBox):\n    return []"
"#;
        assert_eq!(
            parse_plan_yaml(yaml),
            Err(PlanError::NonContiguous {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn test_rejects_unknown_function_type() {
        let yaml = "- id: 1\n  function_type: teleport\n  python_function: \"def f(N, Objects, BBox):\\n    return []\"\n";
        assert!(matches!(
            parse_plan_yaml(yaml),
            Err(PlanError::UnknownFunctionType { step: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_missing_body_and_empty_plan() {
        let yaml = "- id: 1\n  function_type: role\n";
        assert_eq!(parse_plan_yaml(yaml), Err(PlanError::MissingFunctionBody(1)));
        assert_eq!(parse_plan_yaml("```yaml\n```"), Err(PlanError::Empty));
        assert!(matches!(parse_plan_yaml("not: [valid"), Err(PlanError::Yaml(_))));
    }

    #[test]
    fn test_plan_error_messages_are_localized() {
        let err = PlanError::NonContiguous { expected: 2, found: 3 };
        assert_eq!(
            err.to_string(),
            "ステップ番号は1から連続している必要があります: 期待値 2, 実際 3"
        );
        assert_eq!(PlanError::MissingFunctionBody(4).to_string(), "ステップ4: 関数本体がありません");
    }

    #[test]
    fn test_progress_tracking() {
        let plan = parse_plan_yaml(PLANNER_RESPONSE).expect("valid plan");
        let mut progress = plan.initial_progress();
        assert_eq!(progress.completed_count(), 0);
        progress.mark_completed(1);
        assert!(progress.is_completed(1));
        assert!(!progress.is_completed(2));
        assert_eq!(progress.steps[0].objective, "Assign roles.");
    }

    #[test]
    fn test_function_type_parsing() {
        assert_eq!("Coordinates".parse::<FunctionType>(), Ok(FunctionType::Coordinates));
        assert!("formation".parse::<FunctionType>().is_err());
        assert_eq!(FunctionType::Group.to_string(), "group");
    }
}

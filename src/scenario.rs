//! # ミッション設定モジュール
//!
//! YAML形式のミッションファイルを読み込み、エンジンが使用する設定に変換します。
//!
//! ## 主要機能
//! - ミッションファイルの読み込みと検証
//! - 地図オブジェクト（プリセット名または明示リスト）の解決と事前調査
//! - 地形・障害物・群パラメータの構築
//! - `--info` 用の概要表示

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::flocking::ForceWeights;
use crate::mission::{MissionPlan, PlanError, PlannedStep};
use crate::models::map_object::{self, PRESET_NAMES};
use crate::models::{AgentKinematics, BBox, MapObject, Obstacle, Rect, TerrainField, Vector2D};

/// ミッションメタデータ
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MissionMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// シミュレーション設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationSettings {
    /// 1ティックの実時間間隔（ミリ秒）
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 乱数シード（未指定ならエントロピーから生成）
    #[serde(default)]
    pub seed: Option<u64>,
    /// 最大ティック数（未指定なら無制限）
    #[serde(default)]
    pub max_ticks: Option<u64>,
    /// 検知処理の間隔（ティック）
    #[serde(default = "default_detection_interval")]
    pub detection_interval: u64,
    /// 到達評価の間隔（ティック）
    #[serde(default = "default_eval_interval")]
    pub eval_interval: u64,
    /// 到達判定の許容距離
    #[serde(default = "default_eval_tolerance")]
    pub eval_tolerance: f64,
    /// 1ステップあたりの評価回数上限（未指定なら無制限）
    #[serde(default)]
    pub max_evals: Option<u32>,
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_detection_interval() -> u64 {
    10
}

fn default_eval_interval() -> u64 {
    50
}

fn default_eval_tolerance() -> f64 {
    50.0
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            seed: None,
            max_ticks: None,
            detection_interval: default_detection_interval(),
            eval_interval: default_eval_interval(),
            eval_tolerance: default_eval_tolerance(),
            max_evals: None,
        }
    }
}

/// 世界設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorldConfig {
    pub width: f64,
    pub height: f64,
    /// ステップ関数に渡すミッション領域（未指定なら環境矩形）
    #[serde(default)]
    pub bbox: Option<BBox>,
}

impl WorldConfig {
    pub fn environment(&self) -> Rect {
        Rect::new(self.width, self.height)
    }

    pub fn mission_bbox(&self) -> BBox {
        self.bbox.unwrap_or_else(|| BBox::from_rect(&self.environment()))
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 800.0,
            height: 600.0,
            bbox: None,
        }
    }
}

/// 群設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentsConfig {
    pub count: usize,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    #[serde(default = "default_max_force")]
    pub max_force: f64,
    #[serde(default = "default_perception_radius")]
    pub perception_radius: f64,
    /// 座標ステップで生成されるターゲットの到達半径
    #[serde(default = "default_target_radius")]
    pub target_radius: f64,
    /// 初速度の各成分の上限（一様乱数）
    #[serde(default = "default_initial_speed")]
    pub initial_speed: f64,
}

fn default_max_speed() -> f64 {
    3.0
}

fn default_max_force() -> f64 {
    0.1
}

fn default_perception_radius() -> f64 {
    100.0
}

fn default_target_radius() -> f64 {
    10.0
}

fn default_initial_speed() -> f64 {
    2.0
}

impl AgentsConfig {
    pub fn kinematics(&self) -> AgentKinematics {
        AgentKinematics {
            max_speed: self.max_speed,
            max_force: self.max_force,
            perception_radius: self.perception_radius,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            count: 20,
            max_speed: default_max_speed(),
            max_force: default_max_force(),
            perception_radius: default_perception_radius(),
            target_radius: default_target_radius(),
            initial_speed: default_initial_speed(),
        }
    }
}

/// 地形設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerrainConfig {
    /// 高度グリッド（行が y 方向）
    #[serde(default)]
    pub height_map: Vec<Vec<f64>>,
    #[serde(default = "default_slope_factor")]
    pub slope_factor: f64,
}

fn default_slope_factor() -> f64 {
    -0.1
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            height_map: Vec::new(),
            slope_factor: default_slope_factor(),
        }
    }
}

/// 障害物設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObstacleConfig {
    pub position: Vector2D,
    pub radius: f64,
}

/// 地図オブジェクトの供給元
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ObjectSource {
    /// 組み込みプリセット名
    Preset(String),
    /// 明示的なオブジェクトリスト
    List(Vec<MapObject>),
}

/// 地図オブジェクト設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectsConfig {
    pub map: ObjectSource,
    /// この面積以上のオブジェクトを開始時点で検知済みにする
    #[serde(default)]
    pub presurvey_min_area: Option<f64>,
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            map: ObjectSource::List(Vec::new()),
            presurvey_min_area: None,
        }
    }
}

/// 完全なミッション設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MissionConfig {
    pub meta: MissionMeta,
    #[serde(default)]
    pub sim: SimulationSettings,
    #[serde(default)]
    pub world: WorldConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub weights: ForceWeights,
    #[serde(default)]
    pub terrain: TerrainConfig,
    #[serde(default)]
    pub obstacles: Vec<ObstacleConfig>,
    #[serde(default)]
    pub objects: ObjectsConfig,
    /// プランナ出力のステップ列
    #[serde(default)]
    pub plan: Vec<PlannedStep>,
}

impl MissionConfig {
    /// YAMLファイルからミッション設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        // ファイル存在チェック
        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        let contents =
            fs::read_to_string(path).map_err(|e| ScenarioError::IoError(path.to_path_buf(), e))?;

        let config: MissionConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ScenarioError::ParseError(path.display().to_string(), e))?;

        config.validate()?;

        Ok(config)
    }

    /// YAML文字列からミッション設定を読み込み
    pub fn from_yaml_str(contents: &str) -> Result<Self, ScenarioError> {
        let config: MissionConfig = serde_yaml::from_str(contents)
            .map_err(|e| ScenarioError::ParseError("<inline>".to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定の基本的な検証
    pub fn validate(&self) -> Result<(), ScenarioError> {
        let invalid = |msg: String| Err(ScenarioError::ValidationError(msg));

        if !(self.world.width > 0.0 && self.world.height > 0.0) {
            return invalid("world width and height must be positive".to_string());
        }
        if self.sim.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be positive".to_string());
        }
        if self.sim.detection_interval == 0 || self.sim.eval_interval == 0 {
            return invalid("detection_interval and eval_interval must be positive".to_string());
        }
        if !(self.sim.eval_tolerance > 0.0) {
            return invalid("eval_tolerance must be positive".to_string());
        }
        if self.sim.max_evals == Some(0) {
            return invalid("max_evals must be positive when set".to_string());
        }

        if self.agents.count == 0 {
            return invalid("agent count must be positive".to_string());
        }
        if !(self.agents.max_speed > 0.0
            && self.agents.max_force > 0.0
            && self.agents.perception_radius > 0.0
            && self.agents.target_radius > 0.0)
        {
            return invalid("agent kinematics must be positive".to_string());
        }
        if self.agents.initial_speed < 0.0 {
            return invalid("initial_speed must not be negative".to_string());
        }

        if !self.weights.is_valid() {
            return invalid("force weights must be finite and non-negative".to_string());
        }

        if !self.terrain.height_map.is_empty()
            && TerrainField::new(self.terrain.height_map.clone(), self.world.environment()).is_none()
        {
            return invalid("height_map must be a non-empty rectangular grid".to_string());
        }

        let bbox = self.world.mission_bbox();
        if bbox.x1 >= bbox.x2 || bbox.y1 >= bbox.y2 {
            return invalid("Invalid bbox bounds".to_string());
        }
        if bbox.x1 < 0.0 || bbox.y1 < 0.0 || bbox.x2 > self.world.width || bbox.y2 > self.world.height {
            return invalid("bbox outside world bounds".to_string());
        }

        for (index, obstacle) in self.obstacles.iter().enumerate() {
            if !(obstacle.radius > 0.0) {
                return invalid(format!("obstacle {} radius must be positive", index));
            }
        }

        if let ObjectSource::Preset(name) = &self.objects.map
            && map_object::preset(name).is_none()
        {
            return invalid(format!(
                "unknown object map '{}' (expected one of {:?})",
                name, PRESET_NAMES
            ));
        }

        Ok(())
    }

    /// 計画を構築
    pub fn plan(&self) -> Result<MissionPlan, PlanError> {
        MissionPlan::from_planned_steps(&self.plan)
    }

    /// 地図オブジェクトを解決し、事前調査を適用
    pub fn resolve_objects(&self) -> Vec<MapObject> {
        let mut objects = match &self.objects.map {
            ObjectSource::Preset(name) => map_object::preset(name).unwrap_or_default(),
            ObjectSource::List(list) => list.clone(),
        };
        if let Some(min_area) = self.objects.presurvey_min_area {
            map_object::presurvey(&mut objects, min_area);
        }
        objects
    }

    /// 地形場を構築（高度グリッドが無ければ平坦）
    pub fn terrain_field(&self) -> TerrainField {
        let environment = self.world.environment();
        TerrainField::new(self.terrain.height_map.clone(), environment)
            .unwrap_or_else(|| TerrainField::flat(environment))
    }

    /// 障害物リストを構築（IDは定義順）
    pub fn obstacle_list(&self) -> Vec<Obstacle> {
        self.obstacles
            .iter()
            .enumerate()
            .map(|(index, obstacle)| Obstacle::new(index as u32, obstacle.position, obstacle.radius))
            .collect()
    }

    /// ミッションの概要を表示
    pub fn print_summary(&self) {
        println!("=== ミッション情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!("バージョン: {}", self.meta.version);
        println!();

        println!("=== シミュレーション設定 ===");
        println!("ティック間隔: {}ミリ秒", self.sim.tick_interval_ms);
        match self.sim.max_ticks {
            Some(max_ticks) => println!("最大ティック数: {}", max_ticks),
            None => println!("最大ティック数: 無制限"),
        }
        match self.sim.seed {
            Some(seed) => println!("シード値: {}", seed),
            None => println!("シード値: ランダム"),
        }
        println!(
            "検知間隔: {}ティック / 評価間隔: {}ティック / 許容距離: {:.1}",
            self.sim.detection_interval, self.sim.eval_interval, self.sim.eval_tolerance
        );
        println!();

        println!("=== 環境 ===");
        println!("環境矩形: {:.0} x {:.0}", self.world.width, self.world.height);
        println!("ミッション領域: {:?}", self.world.mission_bbox().to_array());
        println!("障害物: {}個", self.obstacles.len());
        let (cols, rows) = self.terrain_field().dimensions();
        println!("地形グリッド: {} x {}", cols, rows);
        println!();

        println!("=== 群 ===");
        println!("エージェント数: {}機", self.agents.count);
        println!(
            "最大速度: {:.2} / 最大操舵力: {:.2} / 知覚半径: {:.1}",
            self.agents.max_speed, self.agents.max_force, self.agents.perception_radius
        );
        println!();

        let objects = self.resolve_objects();
        let detected = objects.iter().filter(|object| object.detected).count();
        println!("=== 地図オブジェクト ===");
        println!("オブジェクト数: {}個 (事前調査で検知済み: {}個)", objects.len(), detected);
        println!();

        println!("=== 計画 ===");
        println!("ステップ数: {}", self.plan.len());
        for step in &self.plan {
            println!("  {}: [{}] {}", step.id, step.function_type, step.objective);
        }
    }
}

/// ミッション設定の読み込みエラー
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("ミッションファイルが見つかりません: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("ファイル読み込みエラー {}: {}", .0.display(), .1)]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("YAML解析エラー {0}: {1}")]
    ParseError(String, #[source] serde_yaml::Error),

    #[error("設定検証エラー: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
meta:
  name: test mission
agents:
  count: 4
objects:
  map: hurricane_map
plan:
  - id: 1
    function_type: coordinates
    objective: go to center
    python_function: |
      def f(N, objects, bbox):
          return [[400, 300]] * N
"#;

    #[test]
    fn test_minimal_mission_uses_defaults() {
        let config = MissionConfig::from_yaml_str(MINIMAL).unwrap();

        assert_eq!(config.agents.count, 4);
        assert_eq!(config.sim.detection_interval, 10);
        assert_eq!(config.sim.eval_interval, 50);
        assert_eq!(config.sim.max_evals, None);
        assert_eq!(config.terrain.slope_factor, -0.1);
        assert_eq!(config.world.mission_bbox().to_array(), [0.0, 0.0, 800.0, 600.0]);
        assert_eq!(config.weights, ForceWeights::default());
        assert_eq!(config.plan().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_preset_is_rejected() {
        let yaml = MINIMAL.replace("hurricane_map", "atlantis_map");
        let result = MissionConfig::from_yaml_str(&yaml);
        assert!(matches!(result, Err(ScenarioError::ValidationError(_))));
    }

    #[test]
    fn test_ragged_height_map_is_rejected() {
        let yaml = format!("{}terrain:\n  height_map: [[0, 1], [2]]\n", MINIMAL);
        let result = MissionConfig::from_yaml_str(&yaml);
        assert!(matches!(result, Err(ScenarioError::ValidationError(_))));
    }

    #[test]
    fn test_bbox_outside_world_is_rejected() {
        let yaml = format!("{}world:\n  width: 100\n  height: 100\n  bbox: [0, 0, 200, 50]\n", MINIMAL);
        let result = MissionConfig::from_yaml_str(&yaml);
        assert!(matches!(result, Err(ScenarioError::ValidationError(_))));
    }

    #[test]
    fn test_explicit_object_list_with_presurvey() {
        let yaml = r#"
meta:
  name: objects
objects:
  presurvey_min_area: 100
  map:
    - name: Barn
      position: [10, 10]
      boundingBox: [[0, 0], [20, 20]]
      type: building
    - name: Shed
      position: [50, 50]
      boundingBox: [[48, 48], [52, 52]]
      object_type: building
"#;
        let config = MissionConfig::from_yaml_str(yaml).unwrap();
        let objects = config.resolve_objects();

        assert_eq!(objects.len(), 2);
        assert!(objects[0].detected);
        assert!(!objects[1].detected);
    }

    #[test]
    fn test_missing_file() {
        let result = MissionConfig::from_file("does/not/exist.yaml");
        assert!(matches!(result, Err(ScenarioError::FileNotFound(_))));
    }

    #[test]
    fn test_obstacles_get_sequential_ids() {
        let yaml = format!(
            "{}obstacles:\n  - position: [100, 100]\n    radius: 30\n  - position: [300, 200]\n    radius: 20\n",
            MINIMAL
        );
        let config = MissionConfig::from_yaml_str(&yaml).unwrap();
        let obstacles = config.obstacle_list();

        assert_eq!(obstacles.len(), 2);
        assert_eq!(obstacles[1].id, 1);
        assert_eq!(obstacles[1].radius, 20.0);
    }
}

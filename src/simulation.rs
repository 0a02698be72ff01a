//! # Simulation モジュール
//!
//! 群制御ミッションの中核となるミッション調整エンジンを提供します。
//!
//! このモジュールは、計画（ステップ列）に従ってステップ関数を実行し、
//! その結果でターゲット集合やエージェントのラベルを更新しながら、
//! ティック単位で群制御・検知・到達評価を進めます。
//!
//! ## 主要機能
//!
//! - **ステップ状態機械**: `Idle → StepPending(k) → StepActive(k) → Evaluating(k)` の遷移管理
//! - **ステップ境界処理**: ステップ関数の実行とターゲット再割り当て
//! - **ティック処理**: 群制御・間引き検知・到達評価
//! - **状態公開**: ティック境界ごとの完全なスナップショット生成
//!
//! ## ティック処理順序
//!
//! 1. **新規検知リストのクリア**
//! 2. **群制御**: 全エージェントの力計算と積分、高度の更新
//! 3. **検知処理**: `detection_interval` ティックごと
//! 4. **到達評価**: `eval_interval` ティックごと。全エージェントが許容距離内なら次ステップへ
//!
//! ターゲットの再割り当てはステップ境界でのみ行われ、ステップの途中では変化しません。

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::executor::{Executor, ExecutorError, ValidatedProgram};
use crate::flocking::{FlockingEngine, bound_target};
use crate::mission::{GroupLabel, MissionPlan, PlanError, PlanProgress, StepResult};
use crate::models::*;
use crate::scenario::{MissionConfig, SimulationSettings};

/// ミッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum MissionState {
    Idle,
    StepPending(usize),
    StepActive(usize),
    Evaluating(usize),
    Completed,
    Aborted,
}

impl MissionState {
    /// 終了状態か
    pub fn is_terminal(&self) -> bool {
        matches!(self, MissionState::Completed | MissionState::Aborted)
    }
}

impl std::fmt::Display for MissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissionState::Idle => write!(f, "待機中"),
            MissionState::StepPending(k) => write!(f, "ステップ{}準備中", k),
            MissionState::StepActive(k) => write!(f, "ステップ{}実行中", k),
            MissionState::Evaluating(k) => write!(f, "ステップ{}評価中", k),
            MissionState::Completed => write!(f, "完了"),
            MissionState::Aborted => write!(f, "中止"),
        }
    }
}

/// ミッション実行エラー
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MissionError {
    #[error("ミッションは既に実行中です")]
    AlreadyActive,

    #[error("計画エラー: {0}")]
    Plan(#[from] PlanError),

    #[error("ステップ{step}の実行に失敗しました: {source}")]
    Step {
        step: usize,
        #[source]
        source: ExecutorError,
    },
}

/// 公開用のエージェント状態
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub id: u32,
    pub group_id: u32,
    pub position: Vector2D,
    pub z: f64,
    pub velocity: Vector2D,
    pub acceleration: Vector2D,
    pub role: Option<String>,
    pub group_label: Option<GroupLabel>,
}

impl From<&Agent> for AgentSnapshot {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id,
            group_id: agent.group_id,
            position: agent.position,
            z: agent.z,
            velocity: agent.velocity,
            acceleration: agent.acceleration,
            role: agent.role.clone(),
            group_label: agent.group_label.clone(),
        }
    }
}

/// ティック境界で公開される状態のコピー
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub tick: u64,
    pub state: MissionState,
    pub agents: Vec<AgentSnapshot>,
    pub targets: Vec<Target>,
    pub obstacles: Vec<Obstacle>,
    /// 前回の公開以降に新しく検知されたオブジェクト
    pub new_detections: Vec<MapObject>,
    pub progress: PlanProgress,
}

pub struct SimulationEngine {
    pub tick: u64,
    pub state: MissionState,

    pub agents: Vec<Agent>,
    pub targets: Vec<Target>,
    pub obstacles: Vec<Obstacle>,
    pub objects: Vec<MapObject>,
    pub terrain: TerrainField,

    pub flocking: FlockingEngine,
    pub detections: DetectionTracker,
    pub plan: MissionPlan,
    pub progress: PlanProgress,
    programs: BTreeMap<usize, ValidatedProgram>,
    executor: Executor,

    pub settings: SimulationSettings,
    pub bbox: BBox,
    target_radius: f64,
    failed_evals: u32,
    pub abort_reason: Option<String>,
    pub verbose_level: u8,
}

impl SimulationEngine {
    /// ミッション設定からエンジンを作成
    ///
    /// エージェントは環境矩形内のランダムな位置に、ランダムな初速度で配置されます。
    /// エージェント i の初期 `group_id` は i です。
    pub fn new(config: &MissionConfig, verbose_level: u8) -> Self {
        let environment = config.world.environment();
        let kinematics = config.agents.kinematics();
        let speed = config.agents.initial_speed;

        let mut rng = match config.sim.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        let agents = (0..config.agents.count)
            .map(|index| {
                let position = Vector2D::new(
                    rng.gen_range(0.0..=environment.width),
                    rng.gen_range(0.0..=environment.height),
                );
                let velocity = Vector2D::new(rng.gen_range(-speed..=speed), rng.gen_range(-speed..=speed));
                Agent::new(index as u32, position, index as u32, kinematics).with_velocity(velocity)
            })
            .collect();

        Self {
            tick: 0,
            state: MissionState::Idle,
            agents,
            targets: Vec::new(),
            obstacles: config.obstacle_list(),
            objects: config.resolve_objects(),
            terrain: config.terrain_field(),
            flocking: FlockingEngine::new(config.weights, config.terrain.slope_factor, environment),
            detections: DetectionTracker::new(),
            plan: MissionPlan::default(),
            progress: PlanProgress::default(),
            programs: BTreeMap::new(),
            executor: Executor::new(config.sim.seed.map(|seed| seed.wrapping_add(1))),
            settings: config.sim.clone(),
            bbox: config.world.mission_bbox(),
            target_radius: config.agents.target_radius,
            failed_evals: 0,
            abort_reason: None,
            verbose_level,
        }
    }

    /// 前回ミッションのエージェント位置・速度を引き継ぐ
    ///
    /// 引き継ぎ数は現在のエージェント数までで、残りはランダム配置のままです。
    pub fn with_agent_seeds(mut self, seeds: &[Agent]) -> Self {
        for (agent, seed) in self.agents.iter_mut().zip(seeds) {
            agent.set_position(seed.get_position());
            agent.set_velocity(seed.get_velocity().clamp_magnitude(agent.kinematics.max_speed));
            agent.edges(&self.flocking.bounds);
        }
        self
    }

    /// 計画を検証してステップ1を開始
    ///
    /// 全ステップの関数本体を事前に構文解析・検証し、ステップ1を実行します。
    /// 失敗した場合は `Aborted` に遷移し、エラーを返します。
    pub fn initialize(&mut self, plan: MissionPlan) -> Result<(), MissionError> {
        if self.state != MissionState::Idle {
            return Err(MissionError::AlreadyActive);
        }
        if plan.is_empty() {
            return Err(MissionError::Plan(PlanError::Empty));
        }

        if self.verbose_level > 0 {
            info!("ミッションエンジンを初期化中...");
        }

        for (index, spec) in plan.iter() {
            match self.executor.validate(&spec.function_body) {
                Ok(program) => {
                    if self.verbose_level > 1 {
                        debug!(
                            "ステップ{}を検証しました: {} ({})",
                            index,
                            program.function_name(),
                            spec.function_type
                        );
                    }
                    self.programs.insert(index, program);
                }
                Err(source) => {
                    self.abort(&format!("ステップ{}の検証に失敗しました: {}", index, source));
                    return Err(MissionError::Step { step: index, source });
                }
            }
        }

        self.progress = plan.initial_progress();
        self.plan = plan;

        if self.verbose_level > 0 {
            info!("初期化完了:");
            info!("  エージェント: {}機", self.agents.len());
            info!("  障害物: {}個", self.obstacles.len());
            info!("  地図オブジェクト: {}個", self.objects.len());
            info!("  ステップ数: {}", self.plan.len());
        }

        if let Err(err) = self.enter_step(1) {
            self.abort(&err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// ステップ境界: ステップ関数を実行し、結果を適用して `StepActive` へ遷移
    fn enter_step(&mut self, step: usize) -> Result<(), MissionError> {
        self.state = MissionState::StepPending(step);

        let function_type = match self.plan.get(step) {
            Some(spec) => spec.function_type,
            None => return Err(MissionError::Plan(PlanError::NonContiguous { expected: step, found: 0 })),
        };
        let Some(program) = self.programs.get(&step) else {
            return Err(MissionError::Plan(PlanError::MissingFunctionBody(step)));
        };

        let result = self
            .executor
            .run(program, function_type, self.agents.len(), &self.objects, &self.bbox)
            .map_err(|source| MissionError::Step { step, source })?;

        self.apply_result(&result);
        if let Some(spec) = self.plan.get_mut(step) {
            spec.result = Some(result);
        }

        self.failed_evals = 0;
        self.state = MissionState::StepActive(step);

        if self.verbose_level > 0 {
            let objective = self.plan.get(step).map(|spec| spec.objective.as_str()).unwrap_or("");
            info!(step, tick = self.tick, "ステップ{}開始: {}", step, objective);
        }
        Ok(())
    }

    /// ステップ結果の適用
    ///
    /// 座標結果はターゲット集合を丸ごと置き換え、エージェント i をターゲット i に結び付けます。
    /// ラベル結果はエージェントに位置順で割り当てられ、物理には影響しません。
    fn apply_result(&mut self, result: &StepResult) {
        match result {
            StepResult::Coordinates(coordinates) => {
                self.targets = Target::from_coordinates(coordinates, self.target_radius);
                for (agent, target) in self.agents.iter_mut().zip(&self.targets) {
                    agent.group_id = target.id;
                }
                if self.verbose_level > 1 {
                    debug!("ターゲットを再割り当てしました: {}個", self.targets.len());
                }
            }
            StepResult::Roles(roles) => {
                for (agent, role) in self.agents.iter_mut().zip(roles) {
                    agent.role = Some(role.clone());
                }
            }
            StepResult::Groups(groups) => {
                for (agent, group) in self.agents.iter_mut().zip(groups) {
                    agent.group_label = Some(group.clone());
                }
            }
        }
    }

    /// 1ティック分の処理
    ///
    /// `StepActive` 以外の状態では何もせず false を返します。
    pub fn tick(&mut self) -> bool {
        self.detections.clear_new_detections();

        let MissionState::StepActive(step) = self.state else {
            return false;
        };

        self.process_flocking();
        self.tick += 1;

        if self.tick % self.settings.detection_interval == 0 {
            self.process_detections();
        }

        if self.tick % self.settings.eval_interval == 0 {
            self.process_evaluation(step);
        }

        if self.verbose_level > 2 {
            trace!("ティック: {} ({})", self.tick, self.state);
        }

        true
    }

    fn process_flocking(&mut self) {
        self.flocking
            .step(&mut self.agents, &self.targets, &self.obstacles, &self.terrain);
        for agent in &mut self.agents {
            agent.z = self.terrain.height_at(agent.position);
        }
    }

    fn process_detections(&mut self) {
        let newly = self
            .detections
            .update_detections(&self.agents, &mut self.objects, self.tick);

        if newly > 0 && self.verbose_level > 0 {
            let names: Vec<&str> = self
                .detections
                .new_detections
                .iter()
                .map(|object| object.name.as_str())
                .collect();
            info!(tick = self.tick, "新規検知: {}個 {:?}", newly, names);
        }
    }

    fn process_evaluation(&mut self, step: usize) {
        self.state = MissionState::Evaluating(step);

        if evaluate_positions(&self.agents, &self.targets, self.settings.eval_tolerance) {
            self.progress.mark_completed(step);
            if self.verbose_level > 0 {
                info!(step, tick = self.tick, "ステップ{}完了", step);
            }
            self.advance(step);
            return;
        }

        self.failed_evals += 1;
        if self.verbose_level > 1 {
            debug!(step, attempts = self.failed_evals, "ステップ{}は未到達です", step);
        }

        if let Some(max_evals) = self.settings.max_evals
            && self.failed_evals >= max_evals
        {
            warn!(
                step,
                attempts = self.failed_evals,
                "評価回数の上限に達したため、ステップ{}を未完了のまま次へ進みます",
                step
            );
            self.advance(step);
            return;
        }

        self.state = MissionState::StepActive(step);
    }

    /// 次のステップへ進む（最終ステップなら完了）
    fn advance(&mut self, step: usize) {
        let next = step + 1;
        if self.plan.get(next).is_none() {
            self.state = MissionState::Completed;
            if self.verbose_level > 0 {
                info!(
                    tick = self.tick,
                    "全ステップを処理しました (完了: {}/{})",
                    self.progress.completed_count(),
                    self.plan.len()
                );
            }
            return;
        }

        if let Err(err) = self.enter_step(next) {
            warn!("ミッションを中止します: {}", err);
            self.abort(&err.to_string());
        }
    }

    /// ミッションを中止
    ///
    /// 計画・進捗・ターゲット・障害物を破棄します。エージェントは次回ミッションの
    /// 初期値として残します。
    pub fn abort(&mut self, reason: &str) {
        self.state = MissionState::Aborted;
        self.abort_reason = Some(reason.to_string());
        self.targets.clear();
        self.obstacles.clear();
        self.progress = PlanProgress::default();
        self.plan.clear_results();
        self.programs.clear();
        self.detections.clear_new_detections();

        if self.verbose_level > 0 {
            info!(tick = self.tick, "ミッション中止: {}", reason);
        }
    }

    /// 現在状態のコピー
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            tick: self.tick,
            state: self.state,
            agents: self.agents.iter().map(AgentSnapshot::from).collect(),
            targets: self.targets.clone(),
            obstacles: self.obstacles.clone(),
            new_detections: self.detections.new_detections.clone(),
            progress: self.progress.clone(),
        }
    }

    /// 次回ミッションへ引き継ぐエージェント
    pub fn agent_seeds(&self) -> Vec<Agent> {
        self.agents.clone()
    }

    /// 終了状態または最大ティック数まで同期的に実行
    pub fn run(&mut self) -> Result<(), MissionError> {
        info!("=== ミッション実行開始 ===");

        while !self.state.is_terminal() {
            if let Some(max_ticks) = self.settings.max_ticks
                && self.tick >= max_ticks
            {
                break;
            }
            if !self.tick() {
                break;
            }

            if self.tick % 100 == 0 && self.verbose_level > 0 {
                info!(
                    "進行状況: {} (ティック: {}, 完了ステップ: {}/{})",
                    self.state,
                    self.tick,
                    self.progress.completed_count(),
                    self.plan.len()
                );
            }
        }

        info!("=== ミッション終了 ===");
        info!("状態: {}", self.state);
        info!("総ティック数: {}", self.tick);

        Ok(())
    }
}

/// 到達評価
///
/// 各エージェントを `group_id` に対応するターゲットと比較し、全員が許容距離未満なら true。
/// 対応するターゲットが無いエージェントは評価対象外です。
pub fn evaluate_positions(agents: &[Agent], targets: &[Target], tolerance: f64) -> bool {
    agents.iter().all(|agent| {
        bound_target(targets, agent.group_id)
            .is_none_or(|target| agent.position.distance(&target.position) < tolerance)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorError;
    use crate::mission::PlannedStep;
    use crate::scenario::{AgentsConfig, MissionMeta, ObjectSource, ObjectsConfig, TerrainConfig, WorldConfig};
    use crate::flocking::ForceWeights;

    fn config(count: usize) -> MissionConfig {
        MissionConfig {
            meta: MissionMeta {
                name: "test".to_string(),
                description: String::new(),
                version: "1.0".to_string(),
            },
            sim: SimulationSettings {
                seed: Some(7),
                ..SimulationSettings::default()
            },
            world: WorldConfig::default(),
            agents: AgentsConfig {
                count,
                ..AgentsConfig::default()
            },
            weights: ForceWeights::default(),
            terrain: TerrainConfig::default(),
            obstacles: Vec::new(),
            objects: ObjectsConfig::default(),
            plan: Vec::new(),
        }
    }

    fn step(id: usize, function_type: &str, body: &str) -> PlannedStep {
        PlannedStep {
            id,
            function_type: function_type.to_string(),
            objective: format!("step {}", id),
            task_type: None,
            python_function: Some(body.to_string()),
        }
    }

    fn plan(steps: &[PlannedStep]) -> MissionPlan {
        MissionPlan::from_planned_steps(steps).unwrap()
    }

    const SPREAD: &str = "def spread(N, objects, bbox):\n    return [[100 + 50 * i, 100] for i in range(N)]\n";
    const CENTER: &str = "def center(N, objects, bbox):\n    return [[(bbox[0] + bbox[2]) / 2, (bbox[1] + bbox[3]) / 2]] * N\n";

    fn agent_at(id: u32, x: f64, y: f64, group_id: u32) -> Agent {
        Agent::new(id, Vector2D::new(x, y), group_id, AgentKinematics::default())
    }

    #[test]
    fn test_evaluate_positions_tolerance() {
        let targets = Target::from_coordinates(&[Vector2D::new(0.0, 0.0), Vector2D::new(10.0, 10.0)], 10.0);
        let agents = vec![agent_at(0, 0.5, 0.5, 0), agent_at(1, 9.0, 9.0, 1)];

        assert!(evaluate_positions(&agents, &targets, 2.0));
        assert!(!evaluate_positions(&agents, &targets, 0.1));
    }

    #[test]
    fn test_agent_without_target_is_satisfied() {
        let targets = Target::from_coordinates(&[Vector2D::new(0.0, 0.0)], 10.0);
        let agents = vec![agent_at(0, 0.0, 0.0, 0), agent_at(1, 500.0, 500.0, 3)];
        assert!(evaluate_positions(&agents, &targets, 1.0));
        assert!(evaluate_positions(&agents, &[], 1.0));
    }

    #[test]
    fn test_initialize_rebinds_agents_by_index() {
        let mut engine = SimulationEngine::new(&config(4), 0);
        engine.initialize(plan(&[step(1, "coordinates", SPREAD)])).unwrap();

        assert_eq!(engine.state, MissionState::StepActive(1));
        assert_eq!(engine.targets.len(), 4);
        for (index, agent) in engine.agents.iter().enumerate() {
            assert_eq!(agent.group_id, index as u32);
            assert_eq!(engine.targets[index].id, index as u32);
        }
        assert_eq!(engine.targets[3].position, Vector2D::new(250.0, 100.0));
        assert_eq!(engine.targets[0].radius, 10.0);
    }

    #[test]
    fn test_role_step_labels_agents_without_physics_change() {
        let mut engine = SimulationEngine::new(&config(3), 0);
        let body = "def roles(N, objects, bbox):\n    return ['scout'] * N\n";
        engine.initialize(plan(&[step(1, "role", body)])).unwrap();

        assert!(engine.targets.is_empty());
        for (index, agent) in engine.agents.iter().enumerate() {
            assert_eq!(agent.role.as_deref(), Some("scout"));
            assert_eq!(agent.group_id, index as u32);
        }
    }

    #[test]
    fn test_wrong_result_length_fails_start() {
        let mut engine = SimulationEngine::new(&config(5), 0);
        let body = "def short(N, objects, bbox):\n    return [[0, 0]]\n";
        let result = engine.initialize(plan(&[step(1, "coordinates", body)]));

        assert!(matches!(
            result,
            Err(MissionError::Step { step: 1, source: ExecutorError::Shape(_) })
        ));
        assert_eq!(engine.state, MissionState::Aborted);
        assert!(engine.targets.is_empty());
    }

    #[test]
    fn test_invalid_later_step_fails_start() {
        let mut engine = SimulationEngine::new(&config(2), 0);
        let bad = "def bad(N, objects, bbox):\n    return open('x')\n";
        let result = engine.initialize(plan(&[step(1, "coordinates", SPREAD), step(2, "coordinates", bad)]));

        assert!(matches!(
            result,
            Err(MissionError::Step { step: 2, source: ExecutorError::Validation { .. } })
        ));
        assert_eq!(engine.state, MissionState::Aborted);
    }

    #[test]
    fn test_initialize_twice_is_rejected() {
        let mut engine = SimulationEngine::new(&config(2), 0);
        engine.initialize(plan(&[step(1, "coordinates", SPREAD)])).unwrap();
        let result = engine.initialize(plan(&[step(1, "coordinates", SPREAD)]));
        assert_eq!(result, Err(MissionError::AlreadyActive));
    }

    #[test]
    fn test_steps_advance_to_completion() {
        let mut cfg = config(3);
        cfg.sim.eval_interval = 5;
        cfg.sim.eval_tolerance = 10_000.0;
        let mut engine = SimulationEngine::new(&cfg, 0);
        engine
            .initialize(plan(&[step(1, "coordinates", SPREAD), step(2, "coordinates", CENTER)]))
            .unwrap();

        for _ in 0..5 {
            assert!(engine.tick());
        }
        assert_eq!(engine.state, MissionState::StepActive(2));
        assert!(engine.progress.is_completed(1));
        assert!(engine.targets.iter().all(|t| t.position == Vector2D::new(400.0, 300.0)));

        for _ in 0..5 {
            engine.tick();
        }
        assert_eq!(engine.state, MissionState::Completed);
        assert_eq!(engine.progress.completed_count(), 2);
        assert!(!engine.tick());
    }

    #[test]
    fn test_targets_do_not_change_mid_step() {
        let mut cfg = config(3);
        cfg.sim.eval_interval = 1000;
        let mut engine = SimulationEngine::new(&cfg, 0);
        engine.initialize(plan(&[step(1, "coordinates", SPREAD)])).unwrap();
        let targets = engine.targets.clone();
        let bindings: Vec<u32> = engine.agents.iter().map(|a| a.group_id).collect();

        for _ in 0..50 {
            engine.tick();
        }
        assert_eq!(engine.targets, targets);
        assert_eq!(engine.agents.iter().map(|a| a.group_id).collect::<Vec<_>>(), bindings);
    }

    #[test]
    fn test_max_evals_skips_unreachable_step() {
        let mut cfg = config(2);
        cfg.sim.eval_interval = 1;
        cfg.sim.eval_tolerance = 1e-9;
        cfg.sim.max_evals = Some(2);
        let mut engine = SimulationEngine::new(&cfg, 0);
        engine
            .initialize(plan(&[step(1, "coordinates", SPREAD), step(2, "coordinates", CENTER)]))
            .unwrap();

        engine.tick();
        assert_eq!(engine.state, MissionState::StepActive(1));
        engine.tick();
        assert_eq!(engine.state, MissionState::StepActive(2));
        assert!(!engine.progress.is_completed(1));
    }

    #[test]
    fn test_failure_at_later_boundary_aborts() {
        let mut cfg = config(3);
        cfg.sim.eval_interval = 1;
        cfg.sim.eval_tolerance = 10_000.0;
        let mut engine = SimulationEngine::new(&cfg, 0);
        let short = "def short(N, objects, bbox):\n    return [[0, 0]] * (N - 1)\n";
        engine
            .initialize(plan(&[step(1, "coordinates", SPREAD), step(2, "coordinates", short)]))
            .unwrap();

        engine.tick();
        assert_eq!(engine.state, MissionState::Aborted);
        assert!(engine.abort_reason.as_deref().is_some_and(|r| r.contains("ステップ2")));
        assert!(engine.targets.is_empty());
    }

    #[test]
    fn test_detection_happens_once() {
        let mut cfg = config(2);
        cfg.sim.detection_interval = 1;
        cfg.sim.eval_interval = 1000;
        cfg.objects = ObjectsConfig {
            map: ObjectSource::List(vec![MapObject::new(
                "Hut",
                [200.0, 200.0],
                [[195.0, 195.0], [205.0, 205.0]],
                "building",
            )]),
            presurvey_min_area: None,
        };
        let mut engine = SimulationEngine::new(&cfg, 0);
        for agent in &mut engine.agents {
            agent.position = Vector2D::new(200.0, 200.0);
            agent.velocity = Vector2D::ZERO;
        }
        let body = "def hold(N, objects, bbox):\n    return [objects[0]['position']] * N\n";
        engine.initialize(plan(&[step(1, "coordinates", body)])).unwrap();

        engine.tick();
        let first = engine.snapshot();
        assert_eq!(first.new_detections.len(), 1);
        assert_eq!(first.new_detections[0].name, "Hut");
        assert!(engine.objects[0].detected);

        engine.tick();
        assert!(engine.snapshot().new_detections.is_empty());
        assert_eq!(engine.detections.get_detection_stats().first_detections, 1);
        assert_eq!(engine.detections.agent_detections.len(), 2);
    }

    #[test]
    fn test_speed_and_bounds_hold_every_tick() {
        let mut cfg = config(10);
        cfg.sim.eval_interval = 10_000;
        cfg.terrain.height_map = vec![vec![0.0, 4.0, 0.0], vec![2.0, 8.0, 2.0], vec![0.0, 0.0, 6.0]];
        let mut engine = SimulationEngine::new(&cfg, 0);
        engine.initialize(plan(&[step(1, "coordinates", CENTER)])).unwrap();
        let bounds = engine.flocking.bounds;

        for _ in 0..200 {
            engine.tick();
            for agent in &engine.agents {
                assert!(agent.velocity.magnitude() <= agent.kinematics.max_speed + 1e-9);
                assert!(bounds.contains(&agent.position));
                assert!(agent.position.is_finite());
            }
        }
    }

    #[test]
    fn test_abort_discards_mission_state_and_keeps_agents() {
        let mut cfg = config(3);
        cfg.obstacles = vec![crate::scenario::ObstacleConfig {
            position: Vector2D::new(300.0, 300.0),
            radius: 30.0,
        }];
        let mut engine = SimulationEngine::new(&cfg, 0);
        engine.initialize(plan(&[step(1, "coordinates", SPREAD)])).unwrap();
        engine.tick();
        let positions: Vec<Vector2D> = engine.agents.iter().map(|a| a.position).collect();

        engine.abort("stopped");
        assert_eq!(engine.state, MissionState::Aborted);
        assert!(engine.targets.is_empty());
        assert!(engine.obstacles.is_empty());
        assert!(engine.progress.steps.is_empty());
        assert!(!engine.tick());

        let seeds = engine.agent_seeds();
        let next = SimulationEngine::new(&config(3), 0).with_agent_seeds(&seeds);
        let carried: Vec<Vector2D> = next.agents.iter().map(|a| a.position).collect();
        assert_eq!(carried, positions);
    }

    #[test]
    fn test_snapshot_reports_terrain_height() {
        let mut cfg = config(1);
        cfg.terrain.height_map = vec![vec![5.0, 5.0], vec![5.0, 5.0]];
        let mut engine = SimulationEngine::new(&cfg, 0);
        engine.initialize(plan(&[step(1, "coordinates", CENTER)])).unwrap();
        engine.tick();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.tick, 1);
        assert!((snapshot.agents[0].z - 5.0).abs() < 1e-9);
        assert_eq!(snapshot.progress.steps.len(), 1);
    }

    #[test]
    fn test_run_stops_at_max_ticks() {
        let mut cfg = config(2);
        cfg.sim.max_ticks = Some(30);
        cfg.sim.eval_tolerance = 1e-9;
        let mut engine = SimulationEngine::new(&cfg, 0);
        engine.initialize(plan(&[step(1, "coordinates", SPREAD)])).unwrap();
        engine.run().unwrap();

        assert_eq!(engine.tick, 30);
        assert_eq!(engine.state, MissionState::StepActive(1));
    }
}

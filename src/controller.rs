//! # Controller モジュール
//!
//! ミッションの開始・停止と、ティックループの駆動・状態公開を担当します。
//!
//! ## 主要機能
//!
//! - **開始/停止**: 実行中のミッションがある間の開始は拒否、停止は何度呼んでも安全
//! - **ティックループ**: `tokio::time::interval` による一定間隔のティック実行
//! - **協調的キャンセル**: 停止要求はティック境界で観測され、ティックの途中では中断しない
//! - **状態公開**: ティックごとのスナップショットを `watch` チャネルで配信
//! - **初期配置の引き継ぎ**: 終了したミッションのエージェント位置を次のミッションに使用

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mission::MissionPlan;
use crate::models::{Agent, DetectionStats};
use crate::scenario::MissionConfig;
use crate::simulation::{MissionError, MissionState, SimulationEngine, StateSnapshot};

/// 終了したミッションの結果
#[derive(Debug, Clone)]
pub struct MissionReport {
    pub snapshot: StateSnapshot,
    pub detection_stats: DetectionStats,
    pub objects_detected: usize,
    pub objects_total: usize,
    pub abort_reason: Option<String>,
}

impl MissionReport {
    fn from_engine(engine: &SimulationEngine) -> Self {
        Self {
            snapshot: engine.snapshot(),
            detection_stats: engine.detections.get_detection_stats(),
            objects_detected: engine.objects.iter().filter(|object| object.detected).count(),
            objects_total: engine.objects.len(),
            abort_reason: engine.abort_reason.clone(),
        }
    }
}

/// ミッション制御
pub struct MissionController {
    engine: Arc<Mutex<Option<SimulationEngine>>>,
    state_tx: watch::Sender<Option<StateSnapshot>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    seeds: Vec<Agent>,
    verbose_level: u8,
}

impl MissionController {
    pub fn new(verbose_level: u8) -> Self {
        let (state_tx, _) = watch::channel(None);
        Self {
            engine: Arc::new(Mutex::new(None)),
            state_tx,
            cancel: CancellationToken::new(),
            task: None,
            seeds: Vec::new(),
            verbose_level,
        }
    }

    /// 状態スナップショットの購読
    pub fn subscribe(&self) -> watch::Receiver<Option<StateSnapshot>> {
        self.state_tx.subscribe()
    }

    /// ティックループが動作中か
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// ミッションを開始
    ///
    /// 計画の全ステップを検証し、ステップ1を実行してからティックループを起動します。
    /// ステップ1までの失敗はここで返され、ティックループは起動しません。
    ///
    /// # 引数
    /// * `config` - ミッション設定
    /// * `plan` - 実行する計画
    pub async fn start(&mut self, config: &MissionConfig, plan: MissionPlan) -> Result<(), MissionError> {
        if self.is_active() {
            return Err(MissionError::AlreadyActive);
        }

        // 前回ミッションの後始末（初期配置は引き継ぐ）
        self.teardown(false).await;

        let mut engine = SimulationEngine::new(config, self.verbose_level).with_agent_seeds(&self.seeds);
        let initialized = engine.initialize(plan);
        self.state_tx.send_replace(Some(engine.snapshot()));

        if let Err(err) = initialized {
            self.seeds = engine.agent_seeds();
            return Err(err);
        }

        *self.engine.lock().await = Some(engine);

        self.cancel = CancellationToken::new();
        let period = Duration::from_millis(config.sim.tick_interval_ms);
        self.task = Some(tokio::spawn(run_tick_loop(
            Arc::clone(&self.engine),
            self.state_tx.clone(),
            self.cancel.clone(),
            period,
            self.verbose_level,
        )));

        if self.verbose_level > 0 {
            info!("ミッション「{}」を開始しました", config.meta.name);
        }
        Ok(())
    }

    /// ミッションを停止
    ///
    /// 未終了のミッションは中止状態になります。ミッションが無い場合は None を返します。
    pub async fn stop(&mut self) -> Option<MissionReport> {
        self.cancel.cancel();
        self.teardown(true).await
    }

    /// 停止要求用のトークン（次の `start` までの間有効）
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// ティックループの終了（完了・中止・最大ティック数・停止要求）を待って結果を返す
    pub async fn finish(&mut self) -> Option<MissionReport> {
        self.teardown(false).await
    }

    /// ティックループの終了を待ってエンジンを片付ける
    ///
    /// 停止要求があった場合、未終了のミッションは中止状態にします。
    async fn teardown(&mut self, abort: bool) -> Option<MissionReport> {
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!("ティックループが異常終了しました: {}", err);
        }

        let mut engine = self.engine.lock().await.take()?;
        if (abort || self.cancel.is_cancelled()) && !engine.state.is_terminal() {
            engine.abort("停止要求");
        }

        self.seeds = engine.agent_seeds();
        let report = MissionReport::from_engine(&engine);
        self.state_tx.send_replace(Some(report.snapshot.clone()));
        Some(report)
    }
}

/// ティックループ
///
/// キャンセルはティック境界でのみ観測されます。
async fn run_tick_loop(
    engine: Arc<Mutex<Option<SimulationEngine>>>,
    state_tx: watch::Sender<Option<StateSnapshot>>,
    cancel: CancellationToken,
    period: Duration,
    verbose_level: u8,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if verbose_level > 0 {
                    info!("停止要求を受信しました");
                }
                break;
            }

            _ = ticker.tick() => {
                let mut guard = engine.lock().await;
                let Some(engine) = guard.as_mut() else {
                    break;
                };

                let advanced = engine.tick();
                state_tx.send_replace(Some(engine.snapshot()));

                if engine.tick % 100 == 0 && verbose_level > 0 {
                    info!(
                        "進行状況: {} (ティック: {}, 完了ステップ: {}/{})",
                        engine.state,
                        engine.tick,
                        engine.progress.completed_count(),
                        engine.plan.len()
                    );
                }

                if !advanced || engine.state.is_terminal() {
                    break;
                }
                if let Some(max_ticks) = engine.settings.max_ticks
                    && engine.tick >= max_ticks
                {
                    if verbose_level > 0 {
                        info!("最大ティック数に到達しました: {}", max_ticks);
                    }
                    break;
                }
            }
        }
    }

    if verbose_level > 1 {
        debug!("ティックループを終了しました");
    }
}

impl Drop for MissionController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::parse_plan_yaml;

    const MISSION: &str = r#"
meta:
  name: controller test
sim:
  tick_interval_ms: 10
  seed: 3
  eval_interval: 5
  eval_tolerance: 100000
agents:
  count: 3
objects:
  map: small_town_map
"#;

    const PLAN: &str = r#"
- id: 1
  function_type: coordinates
  objective: spread out
  python_function: |
    def spread(N, objects, bbox):
        return [[100 + 10 * i, 100] for i in range(N)]
- id: 2
  function_type: role
  objective: assign roles
  python_function: |
    def roles(N, objects, bbox):
        return ['scout' if i % 2 == 0 else 'relay' for i in range(N)]
"#;

    fn config() -> MissionConfig {
        MissionConfig::from_yaml_str(MISSION).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_to_completion() {
        let mut controller = MissionController::new(0);
        controller.start(&config(), parse_plan_yaml(PLAN).unwrap()).await.unwrap();

        let report = controller.finish().await.unwrap();
        assert_eq!(report.snapshot.state, MissionState::Completed);
        assert_eq!(report.snapshot.progress.completed_count(), 2);
        assert_eq!(report.snapshot.tick, 10);
        assert_eq!(report.snapshot.agents[0].role.as_deref(), Some("scout"));
        assert_eq!(report.snapshot.agents[1].role.as_deref(), Some("relay"));
        assert!(!controller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected_while_active() {
        let mut cfg = config();
        cfg.sim.eval_tolerance = 1e-9;
        let mut controller = MissionController::new(0);
        controller.start(&cfg, parse_plan_yaml(PLAN).unwrap()).await.unwrap();

        let result = controller.start(&cfg, parse_plan_yaml(PLAN).unwrap()).await;
        assert_eq!(result, Err(MissionError::AlreadyActive));

        let report = controller.stop().await.unwrap();
        assert_eq!(report.snapshot.state, MissionState::Aborted);
        assert!(report.snapshot.targets.is_empty());
        assert_eq!(report.abort_reason.as_deref(), Some("停止要求"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut controller = MissionController::new(0);
        assert!(controller.stop().await.is_none());

        controller.start(&config(), parse_plan_yaml(PLAN).unwrap()).await.unwrap();
        assert!(controller.stop().await.is_some());
        assert!(controller.stop().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_token_aborts_on_finish() {
        let mut cfg = config();
        cfg.sim.eval_tolerance = 1e-9;
        let mut controller = MissionController::new(0);
        controller.start(&cfg, parse_plan_yaml(PLAN).unwrap()).await.unwrap();

        controller.cancellation_token().cancel();
        let report = controller.finish().await.unwrap();
        assert_eq!(report.snapshot.state, MissionState::Aborted);
        assert!(report.snapshot.progress.steps.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_reports_error_and_allows_retry() {
        let bad = r#"
- id: 1
  function_type: coordinates
  objective: broken
  python_function: |
    def broken(N, objects, bbox):
        import os
        return []
"#;
        let mut controller = MissionController::new(0);
        let result = controller.start(&config(), parse_plan_yaml(bad).unwrap()).await;
        assert!(matches!(result, Err(MissionError::Step { step: 1, .. })));
        assert!(!controller.is_active());

        controller.start(&config(), parse_plan_yaml(PLAN).unwrap()).await.unwrap();
        assert!(controller.is_active());
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_receive_snapshots() {
        let mut cfg = config();
        cfg.sim.max_ticks = Some(3);
        cfg.sim.eval_tolerance = 1e-9;
        let mut controller = MissionController::new(0);
        let rx = controller.subscribe();

        controller.start(&cfg, parse_plan_yaml(PLAN).unwrap()).await.unwrap();
        let report = controller.finish().await.unwrap();

        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.tick, 3);
        assert_eq!(latest, report.snapshot);
        assert_eq!(latest.state, MissionState::StepActive(1));
        assert_eq!(latest.targets.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_positions_carry_over() {
        let mut cfg = config();
        cfg.sim.eval_tolerance = 1e-9;
        cfg.sim.max_ticks = Some(20);
        let mut controller = MissionController::new(0);
        controller.start(&cfg, parse_plan_yaml(PLAN).unwrap()).await.unwrap();
        let report = controller.finish().await.unwrap();
        let last: Vec<_> = report.snapshot.agents.iter().map(|a| a.position).collect();

        let rx = controller.subscribe();
        controller.start(&cfg, parse_plan_yaml(PLAN).unwrap()).await.unwrap();
        let first: Vec<_> = rx
            .borrow()
            .as_ref()
            .map(|s| s.agents.iter().map(|a| a.position).collect())
            .unwrap_or_default();
        controller.stop().await;

        assert_eq!(first, last);
    }
}

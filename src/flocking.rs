//! # Flocking モジュール
//!
//! エージェントごとの操舵力の計算と積分を行う群制御エンジンです。
//!
//! 1エージェントに働く力は以下の6項の重み付き和です。
//!
//! - **整列 (alignment)**: 同一グループ近傍の平均速度へ向かう
//! - **結合 (cohesion)**: 同一グループ近傍の重心へ向かう
//! - **分離 (separation)**: 同一グループ近傍から離れる（近いほど強く）
//! - **目標追従 (target)**: 割り当てターゲットへ向かい、到達半径内では減速する
//! - **障害物回避 (obstacle)**: 知覚半径内の障害物から離れる
//! - **地形追従 (terrain)**: 地形勾配の逆方向（下り方向）へ向かう
//!
//! 各ティックでは全エージェントの力を同じ状態から計算した後に、まとめて積分します。
//! 正規化の前には必ず長さ0を確認し、その場合は力0として扱います。

use serde::{Deserialize, Serialize};

use crate::models::{
    Agent, IEntity, IMovable, Obstacle, Rect, Target, TerrainField, Vector2D,
};

/// 6項の重み（すべて非負）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForceWeights {
    pub alignment: f64,
    pub cohesion: f64,
    pub separation: f64,
    pub target: f64,
    pub obstacle: f64,
    pub terrain: f64,
}

impl Default for ForceWeights {
    fn default() -> Self {
        Self {
            alignment: 1.0,
            cohesion: 1.2,
            separation: 1.2,
            target: 1.3,
            obstacle: 1.7,
            terrain: 0.13,
        }
    }
}

impl ForceWeights {
    pub fn is_valid(&self) -> bool {
        [
            self.alignment,
            self.cohesion,
            self.separation,
            self.target,
            self.obstacle,
            self.terrain,
        ]
        .iter()
        .all(|w| w.is_finite() && *w >= 0.0)
    }
}

/// 1エージェントに働く各項の力（重み適用前）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ForceBreakdown {
    pub alignment: Vector2D,
    pub cohesion: Vector2D,
    pub separation: Vector2D,
    pub target: Vector2D,
    pub obstacle: Vector2D,
    pub terrain: Vector2D,
}

impl ForceBreakdown {
    /// 重み付き合力
    pub fn weighted_sum(&self, weights: &ForceWeights) -> Vector2D {
        self.alignment * weights.alignment
            + self.cohesion * weights.cohesion
            + self.separation * weights.separation
            + self.target * weights.target
            + self.obstacle * weights.obstacle
            + self.terrain * weights.terrain
    }
}

/// 群制御エンジン
#[derive(Debug, Clone)]
pub struct FlockingEngine {
    pub weights: ForceWeights,
    /// 地形勾配に掛ける係数（負で下り方向）
    pub slope_factor: f64,
    /// 環境矩形
    pub bounds: Rect,
}

impl FlockingEngine {
    pub fn new(weights: ForceWeights, slope_factor: f64, bounds: Rect) -> Self {
        Self {
            weights,
            slope_factor,
            bounds,
        }
    }

    /// 1ティック分の更新
    ///
    /// 全エージェントの力を現在の状態から計算し、その後に積分・境界処理を行います。
    pub fn step(
        &self,
        agents: &mut [Agent],
        targets: &[Target],
        obstacles: &[Obstacle],
        terrain: &TerrainField,
    ) {
        let forces: Vec<Vector2D> = (0..agents.len())
            .map(|index| {
                let target = bound_target(targets, agents[index].group_id);
                self.compute_forces(&agents[index], agents, target, obstacles, terrain)
                    .weighted_sum(&self.weights)
            })
            .collect();

        for (agent, force) in agents.iter_mut().zip(forces) {
            agent.apply_force(force);
            agent.move_agent(&self.bounds);
        }
    }

    /// 1エージェントの各項の力を計算
    pub fn compute_forces(
        &self,
        agent: &Agent,
        agents: &[Agent],
        target: Option<&Target>,
        obstacles: &[Obstacle],
        terrain: &TerrainField,
    ) -> ForceBreakdown {
        ForceBreakdown {
            alignment: align(agent, agents),
            cohesion: cohesion(agent, agents),
            separation: separation(agent, agents),
            target: target
                .map(|target| steer_towards_target(agent, target))
                .unwrap_or(Vector2D::ZERO),
            obstacle: steer_away_from(agent, obstacles),
            terrain: terrain.gradient_at(agent.position) * self.slope_factor,
        }
    }
}

/// group_id に対応するターゲット（ID=インデックスを優先し、なければ線形探索）
pub fn bound_target(targets: &[Target], group_id: u32) -> Option<&Target> {
    targets
        .get(group_id as usize)
        .filter(|target| target.id == group_id)
        .or_else(|| targets.iter().find(|target| target.id == group_id))
}

// 同一グループかつ知覚半径内のエージェント（自身を含む）
fn group_neighbors<'a>(agent: &'a Agent, agents: &'a [Agent]) -> impl Iterator<Item = &'a Agent> + 'a {
    agents.iter().filter(move |other| {
        other.group_id == agent.group_id
            && agent.position.distance(&other.position) < agent.kinematics.perception_radius
    })
}

/// 目標方向ベクトルから操舵力を計算
///
/// 方向を最大速度に揃えて現在速度を差し引き、最大操舵力で制限します。
fn steer(direction: Vector2D, agent: &Agent) -> Vector2D {
    if direction.magnitude() <= 0.0 {
        return Vector2D::ZERO;
    }
    let desired = direction.with_magnitude(agent.kinematics.max_speed);
    (desired - agent.velocity).clamp_magnitude(agent.kinematics.max_force)
}

/// 整列
pub fn align(agent: &Agent, agents: &[Agent]) -> Vector2D {
    let (sum, total) = group_neighbors(agent, agents)
        .fold((Vector2D::ZERO, 0usize), |(sum, n), other| (sum + other.velocity, n + 1));
    if total == 0 {
        return Vector2D::ZERO;
    }
    steer(sum / total as f64, agent)
}

/// 結合
pub fn cohesion(agent: &Agent, agents: &[Agent]) -> Vector2D {
    let (sum, total) = group_neighbors(agent, agents)
        .fold((Vector2D::ZERO, 0usize), |(sum, n), other| (sum + other.position, n + 1));
    if total == 0 {
        return Vector2D::ZERO;
    }
    let centroid = sum / total as f64;
    steer(centroid - agent.position, agent)
}

/// 分離
///
/// 距離0の相手（自身を含む）は除外し、離れる方向の単位ベクトルを距離の逆数で重み付けします。
pub fn separation(agent: &Agent, agents: &[Agent]) -> Vector2D {
    let mut sum = Vector2D::ZERO;
    let mut total = 0usize;

    for other in group_neighbors(agent, agents) {
        let diff = agent.position - other.position;
        let distance = diff.magnitude();
        if distance > 0.0 {
            sum += diff.normalize() / distance;
            total += 1;
        }
    }

    if total == 0 {
        return Vector2D::ZERO;
    }
    steer(sum / total as f64, agent)
}

/// 目標追従（到達半径内では中心で0になるよう線形に減速）
pub fn steer_towards_target(agent: &Agent, target: &Target) -> Vector2D {
    let offset = target.position - agent.position;
    let distance = offset.magnitude();
    let max_speed = agent.kinematics.max_speed;

    let desired = if distance <= 0.0 {
        Vector2D::ZERO
    } else if target.is_within_arrival(agent.position) {
        offset.with_magnitude(max_speed * (distance / target.radius))
    } else {
        offset.with_magnitude(max_speed)
    };

    (desired - agent.velocity).clamp_magnitude(agent.kinematics.max_force)
}

/// 障害物回避（知覚半径内の実体から離れる）
pub fn steer_away_from<E: IEntity>(agent: &Agent, entities: &[E]) -> Vector2D {
    let mut sum = Vector2D::ZERO;
    let mut total = 0usize;

    for entity in entities {
        let diff = agent.position - entity.get_position();
        if diff.magnitude() < agent.kinematics.perception_radius {
            sum += diff.normalize();
            total += 1;
        }
    }

    if total == 0 {
        return Vector2D::ZERO;
    }
    steer(sum / total as f64, agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentKinematics;

    const EPS: f64 = 1e-9;

    fn agent(id: u32, x: f64, y: f64, group_id: u32) -> Agent {
        Agent::new(id, Vector2D::new(x, y), group_id, AgentKinematics::default())
    }

    fn engine() -> FlockingEngine {
        FlockingEngine::new(ForceWeights::default(), -0.1, Rect::new(800.0, 600.0))
    }

    #[test]
    fn test_isolated_agent_has_no_flocking_forces() {
        let lone = agent(0, 100.0, 100.0, 0).with_velocity(Vector2D::new(1.0, 0.5));
        let others = vec![lone.clone(), agent(1, 110.0, 100.0, 1), agent(2, 500.0, 500.0, 0)];

        assert!(align(&lone, &others).is_finite());
        assert!(separation(&lone, &others).is_zero());
        assert!(cohesion(&lone, &others).is_zero());
        // 自身のみの平均速度は自身の速度と同方向、差分は速度の大きさ調整分のみ
        let a = align(&lone, &others);
        assert!(a.magnitude() <= AgentKinematics::default().max_force + EPS);
    }

    #[test]
    fn test_stationary_isolated_agent_yields_zero_terms() {
        let lone = agent(0, 100.0, 100.0, 0);
        let agents = vec![lone.clone()];
        assert!(align(&lone, &agents).is_zero());
        assert!(cohesion(&lone, &agents).is_zero());
        assert!(separation(&lone, &agents).is_zero());
    }

    #[test]
    fn test_separation_pushes_away_from_neighbor() {
        let a = agent(0, 100.0, 100.0, 0);
        let agents = vec![a.clone(), agent(1, 110.0, 100.0, 0)];
        let force = separation(&a, &agents);
        assert!(force.x < 0.0);
        assert!(force.y.abs() < EPS);
        assert!(force.magnitude() <= a.kinematics.max_force + EPS);
    }

    #[test]
    fn test_coincident_agents_do_not_produce_nan() {
        let a = agent(0, 50.0, 50.0, 0);
        let agents = vec![a.clone(), agent(1, 50.0, 50.0, 0)];
        let forces = engine().compute_forces(&a, &agents, None, &[], &TerrainField::flat(Rect::new(800.0, 600.0)));
        assert!(forces.separation.is_zero());
        assert!(forces.weighted_sum(&ForceWeights::default()).is_finite());
    }

    #[test]
    fn test_target_seek_arrival_slows_down() {
        let target = Target::new(0, Vector2D::new(105.0, 100.0), 10.0);
        let near = agent(0, 100.0, 100.0, 0);
        let far = agent(1, 0.0, 100.0, 0);

        let near_force = steer_towards_target(&near, &target);
        let far_force = steer_towards_target(&far, &target);
        assert!(near_force.x > 0.0 && far_force.x > 0.0);
        // 最大操舵力で制限される
        assert!(far_force.magnitude() <= far.kinematics.max_force + EPS);

        // 中心にいて静止していれば力は0
        let centered = agent(2, 105.0, 100.0, 0);
        assert!(steer_towards_target(&centered, &target).is_zero());
    }

    #[test]
    fn test_obstacle_avoidance_only_within_radius() {
        let a = agent(0, 100.0, 100.0, 0);
        let near = [Obstacle::new(0, Vector2D::new(100.0, 150.0), 30.0)];
        let far = [Obstacle::new(1, Vector2D::new(700.0, 500.0), 30.0)];
        assert!(steer_away_from(&a, &near).y < 0.0);
        assert!(steer_away_from(&a, &far).is_zero());
    }

    #[test]
    fn test_terrain_force_points_downhill() {
        let terrain = TerrainField::new(
            vec![
                vec![0.0, 0.0, 0.0],
                vec![0.0, 5.0, 10.0],
                vec![0.0, 0.0, 0.0],
            ],
            Rect::new(300.0, 300.0),
        )
        .expect("valid grid");
        let eng = FlockingEngine::new(ForceWeights::default(), -0.1, Rect::new(300.0, 300.0));
        let a = agent(0, 150.0, 150.0, 0);
        let forces = eng.compute_forces(&a, &[a.clone()], None, &[], &terrain);
        assert!(forces.terrain.x < 0.0);
    }

    #[test]
    fn test_step_respects_speed_and_bounds() {
        let eng = engine();
        let terrain = TerrainField::flat(eng.bounds);
        let targets = vec![Target::new(0, Vector2D::new(800.0, 600.0), 10.0)];
        let mut agents: Vec<Agent> = (0..10)
            .map(|i| agent(i, 795.0 + i as f64 * 0.5, 598.0, 0).with_velocity(Vector2D::new(3.0, 3.0)))
            .collect();

        for _ in 0..50 {
            eng.step(&mut agents, &targets, &[], &terrain);
            for a in &agents {
                assert!(a.velocity.magnitude() <= a.kinematics.max_speed + EPS);
                assert!(eng.bounds.contains(&a.position));
                if a.position.x == eng.bounds.width {
                    assert_eq!(a.velocity.x, 0.0);
                }
                if a.position.y == eng.bounds.height {
                    assert_eq!(a.velocity.y, 0.0);
                }
                assert!(a.acceleration.is_zero());
            }
        }
    }

    #[test]
    fn test_bound_target_falls_back_to_search() {
        let targets = vec![Target::new(5, Vector2D::ZERO, 1.0), Target::new(0, Vector2D::ZERO, 1.0)];
        assert_eq!(bound_target(&targets, 5).map(|t| t.id), Some(5));
        assert_eq!(bound_target(&targets, 0).map(|t| t.id), Some(0));
        assert!(bound_target(&targets, 9).is_none());
    }
}

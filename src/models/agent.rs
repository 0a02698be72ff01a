use serde::{Deserialize, Serialize};

use crate::mission::GroupLabel;
use crate::models::{
    common::{Rect, Vector2D},
    traits::{IEntity, IMovable, IPerceiver},
};

/// エージェントの運動パラメータ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentKinematics {
    /// 最大速度（1ティックあたり）
    pub max_speed: f64,
    /// 操舵力の上限
    pub max_force: f64,
    /// 近傍探索・検知の知覚半径
    pub perception_radius: f64,
}

impl Default for AgentKinematics {
    fn default() -> Self {
        Self {
            max_speed: 3.0,
            max_force: 0.1,
            perception_radius: 100.0,
        }
    }
}

/// 群制御エージェント
///
/// 位置・速度・加速度を持つ質点で、合成された操舵力によって移動します。
/// `group_id` は追従するターゲットのIDであり、群れの近傍探索範囲も兼ねます。
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    /// エージェントの一意識別子（ミッション中に再利用されない）
    pub id: u32,
    /// 現在位置
    pub position: Vector2D,
    /// 速度ベクトル（大きさは max_speed 以下）
    pub velocity: Vector2D,
    /// 加速度（積分後に0へリセット）
    pub acceleration: Vector2D,
    /// 追従ターゲットのID
    pub group_id: u32,
    /// 高度（2次元の力計算には使用しない）
    pub z: f64,
    /// ロール型ステップで割り当てられるラベル
    pub role: Option<String>,
    /// グループ型ステップで割り当てられるラベル
    pub group_label: Option<GroupLabel>,
    /// 運動パラメータ
    pub kinematics: AgentKinematics,
}

impl Agent {
    /// 新しいエージェントを作成（静止状態）
    pub fn new(id: u32, position: Vector2D, group_id: u32, kinematics: AgentKinematics) -> Self {
        Self {
            id,
            position,
            velocity: Vector2D::ZERO,
            acceleration: Vector2D::ZERO,
            group_id,
            z: 0.0,
            role: None,
            group_label: None,
            kinematics,
        }
    }

    /// 初速度を指定して作成
    pub fn with_velocity(mut self, velocity: Vector2D) -> Self {
        self.velocity = velocity.clamp_magnitude(self.kinematics.max_speed);
        self
    }

    /// 速度・位置の積分
    ///
    /// `velocity += acceleration` の後に最大速度で制限し、位置を更新して加速度をリセットします。
    pub fn integrate(&mut self) {
        self.velocity += self.acceleration;
        self.velocity = self.velocity.clamp_magnitude(self.kinematics.max_speed);
        self.position += self.velocity;
        self.acceleration = Vector2D::ZERO;
    }

    /// 環境境界の処理
    ///
    /// 各軸の位置を矩形内に丸め、丸めた軸の速度成分を0にします（非弾性停止）。
    pub fn edges(&mut self, bounds: &Rect) {
        if self.position.x > bounds.width {
            self.position.x = bounds.width;
            self.velocity.x = 0.0;
        } else if self.position.x < 0.0 {
            self.position.x = 0.0;
            self.velocity.x = 0.0;
        }

        if self.position.y > bounds.height {
            self.position.y = bounds.height;
            self.velocity.y = 0.0;
        } else if self.position.y < 0.0 {
            self.position.y = 0.0;
            self.velocity.y = 0.0;
        }
    }
}

impl IEntity for Agent {
    fn get_id(&self) -> u32 {
        self.id
    }

    fn get_position(&self) -> Vector2D {
        self.position
    }
}

impl IMovable for Agent {
    fn apply_force(&mut self, force: Vector2D) {
        self.acceleration += force;
    }

    fn move_agent(&mut self, bounds: &Rect) {
        self.integrate();
        self.edges(bounds);
    }

    fn get_velocity(&self) -> Vector2D {
        self.velocity
    }

    fn set_position(&mut self, position: Vector2D) {
        self.position = position;
    }

    fn set_velocity(&mut self, velocity: Vector2D) {
        self.velocity = velocity;
    }
}

impl IPerceiver for Agent {
    fn get_perception_radius(&self) -> f64 {
        self.kinematics.perception_radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrate_clamps_speed_and_resets_acceleration() {
        let mut agent = Agent::new(0, Vector2D::new(10.0, 10.0), 0, AgentKinematics::default());
        agent.apply_force(Vector2D::new(30.0, 40.0));
        agent.integrate();

        assert!((agent.velocity.magnitude() - 3.0).abs() < 1e-9);
        assert!(agent.acceleration.is_zero());
        assert!((agent.position.x - 11.8).abs() < 1e-9);
        assert!((agent.position.y - 12.4).abs() < 1e-9);
    }

    #[test]
    fn test_edges_stop_clamped_axis_only() {
        let bounds = Rect::new(100.0, 100.0);
        let mut agent = Agent::new(0, Vector2D::new(99.0, 50.0), 0, AgentKinematics::default())
            .with_velocity(Vector2D::new(2.5, 1.0));
        agent.move_agent(&bounds);

        assert_eq!(agent.position.x, 100.0);
        assert_eq!(agent.velocity.x, 0.0);
        assert_eq!(agent.velocity.y, 1.0);
        assert!(bounds.contains(&agent.position));
    }

    #[test]
    fn test_edges_clamp_lower_bounds() {
        let bounds = Rect::new(100.0, 100.0);
        let mut agent = Agent::new(0, Vector2D::new(1.0, 1.0), 0, AgentKinematics::default())
            .with_velocity(Vector2D::new(-2.0, -2.0));
        agent.move_agent(&bounds);

        assert_eq!(agent.position, Vector2D::new(0.0, 0.0));
        assert_eq!(agent.velocity.x, 0.0);
        assert_eq!(agent.velocity.y, 0.0);

        let mut agent = Agent::new(1, Vector2D::new(50.0, 0.5), 0, AgentKinematics::default())
            .with_velocity(Vector2D::new(1.0, -2.0));
        agent.move_agent(&bounds);

        assert_eq!(agent.position.y, 0.0);
        assert_eq!(agent.velocity.y, 0.0);
        assert_eq!(agent.velocity.x, 1.0);
        assert!(bounds.contains(&agent.position));
    }

    #[test]
    fn test_detects_is_strict() {
        let agent = Agent::new(0, Vector2D::new(0.0, 0.0), 0, AgentKinematics::default());
        assert!(agent.detects(Vector2D::new(99.9, 0.0)));
        assert!(!agent.detects(Vector2D::new(100.0, 0.0)));
    }
}

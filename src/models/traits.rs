use crate::models::common::*;

/// 位置を持つ全てのシミュレーション実体が実装する基本インターフェース
pub trait IEntity {
    /// 実体IDの取得
    fn get_id(&self) -> u32;

    /// 現在位置の取得
    fn get_position(&self) -> Vector2D;
}

/// 移動可能なエージェントのインターフェース
pub trait IMovable: IEntity {
    /// 力（加速度）の加算
    fn apply_force(&mut self, force: Vector2D);

    /// 1ティック分の積分と境界処理
    fn move_agent(&mut self, bounds: &Rect);

    /// 現在速度の取得
    fn get_velocity(&self) -> Vector2D;

    /// 位置の設定
    fn set_position(&mut self, position: Vector2D);

    /// 速度の設定
    fn set_velocity(&mut self, velocity: Vector2D);
}

/// 知覚範囲を持つ実体のインターフェース
pub trait IPerceiver: IEntity {
    /// 知覚半径の取得
    fn get_perception_radius(&self) -> f64;

    /// 指定位置を検知できるか（距離が知覚半径未満）
    fn detects(&self, position: Vector2D) -> bool {
        self.get_position().distance(&position) < self.get_perception_radius()
    }
}

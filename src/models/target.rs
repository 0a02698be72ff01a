use serde::{Deserialize, Serialize};

use crate::models::{
    common::Vector2D,
    traits::IEntity,
};

/// 目標地点
///
/// ステップ境界ごとに実行器の出力から新規作成され、作成後は変更されません。
/// ターゲット集合全体はミッション調整器が所有し、次の座標ステップで丸ごと置き換えられます。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// ターゲットの識別子（座標ステップ出力のインデックス）
    pub id: u32,
    /// 目標位置
    pub position: Vector2D,
    /// 到達判定（減速開始）半径
    pub radius: f64,
}

impl Target {
    pub fn new(id: u32, position: Vector2D, radius: f64) -> Self {
        Self { id, position, radius }
    }

    /// 座標列からターゲット集合を生成
    ///
    /// インデックス i の座標が ID i のターゲットになります。
    pub fn from_coordinates(coordinates: &[Vector2D], radius: f64) -> Vec<Target> {
        coordinates
            .iter()
            .enumerate()
            .map(|(index, position)| Target::new(index as u32, *position, radius))
            .collect()
    }

    /// 指定位置が到達半径内にあるか
    pub fn is_within_arrival(&self, position: Vector2D) -> bool {
        self.position.distance(&position) < self.radius
    }
}

impl IEntity for Target {
    fn get_id(&self) -> u32 {
        self.id
    }

    fn get_position(&self) -> Vector2D {
        self.position
    }
}

use serde::{Deserialize, Serialize};

use crate::models::{common::Vector2D, traits::IEntity};

/// 静的障害物（1ミッションの間は不変）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub id: u32,
    pub position: Vector2D,
    pub radius: f64,
}

impl Obstacle {
    pub fn new(id: u32, position: Vector2D, radius: f64) -> Self {
        Self { id, position, radius }
    }
}

impl IEntity for Obstacle {
    fn get_id(&self) -> u32 {
        self.id
    }

    fn get_position(&self) -> Vector2D {
        self.position
    }
}

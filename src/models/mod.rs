// 基本的なデータ型と数学ユーティリティ
pub mod common;

// 実体の基本インターフェース（trait）定義
pub mod traits;

// 地形高度場
pub mod terrain;

// 各実体モデルの実装
pub mod agent;
pub mod target;
pub mod obstacle;
pub mod map_object;
pub mod sensor;

// 便利な re-export
pub use common::*;
pub use traits::*;
pub use terrain::TerrainField;
pub use agent::{Agent, AgentKinematics};
pub use target::Target;
pub use obstacle::Obstacle;
pub use map_object::MapObject;
pub use sensor::{DetectionTracker, DetectionStats};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::common::Vector2D;

/// 地図上のオブジェクト
///
/// 外部の地図プロバイダから供給される静的オブジェクトです。
/// エンジンが変更するのは `detected` フラグのみで、false→true の遷移だけを行います。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapObject {
    /// オブジェクト名（検知記録のキー）
    pub name: String,
    /// 代表位置 [x, y]
    pub position: Vector2D,
    /// 外接矩形 [[x1, y1], [x2, y2]]
    #[serde(rename = "boundingBox", alias = "bounding_box")]
    pub bounding_box: [Vector2D; 2],
    /// 種別（building, tree, person, ...）
    #[serde(rename = "object_type", alias = "type")]
    pub object_type: String,
    /// 状態（damaged, intact, flooded, ...）
    #[serde(default)]
    pub condition: Option<String>,
    /// 任意の追加属性
    #[serde(default)]
    pub properties: BTreeMap<String, serde_yaml::Value>,
    /// 検知済みフラグ
    #[serde(default)]
    pub detected: bool,
}

impl MapObject {
    pub fn new(
        name: &str,
        position: [f64; 2],
        bounding_box: [[f64; 2]; 2],
        object_type: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            position: position.into(),
            bounding_box: [bounding_box[0].into(), bounding_box[1].into()],
            object_type: object_type.to_string(),
            condition: None,
            properties: BTreeMap::new(),
            detected: false,
        }
    }

    pub fn with_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// 外接矩形の面積
    pub fn area(&self) -> f64 {
        let [p1, p2] = self.bounding_box;
        (p2.x - p1.x).abs() * (p2.y - p1.y).abs()
    }

    /// 外接矩形の長辺の半分（ステップ関数に渡す半径）
    pub fn radius(&self) -> f64 {
        let [p1, p2] = self.bounding_box;
        (p2.x - p1.x).abs().max((p2.y - p1.y).abs()) / 2.0
    }

    /// 検知済みにする（初回のみ true を返す）
    pub fn mark_detected(&mut self) -> bool {
        if self.detected {
            false
        } else {
            self.detected = true;
            true
        }
    }
}

/// 面積が閾値以上のオブジェクトを検知済みにする（衛星写真による事前調査）
///
/// 戻り値は新たに検知済みとなった数です。
pub fn presurvey(objects: &mut [MapObject], min_area: f64) -> usize {
    objects
        .iter_mut()
        .filter(|object| object.area() >= min_area)
        .map(|object| object.mark_detected())
        .filter(|newly| *newly)
        .count()
}

/// 組み込みの地図プリセットを名前で取得
pub fn preset(name: &str) -> Option<Vec<MapObject>> {
    match name {
        "hurricane_map" => Some(hurricane_map()),
        "national_park_map" => Some(national_park_map()),
        "small_town_map" => Some(small_town_map()),
        _ => None,
    }
}

pub const PRESET_NAMES: [&str; 3] = ["hurricane_map", "national_park_map", "small_town_map"];

fn hurricane_map() -> Vec<MapObject> {
    vec![
        MapObject::new("Home1", [100.0, 150.0], [[90.0, 140.0], [110.0, 160.0]], "building")
            .with_condition("damaged")
            .with_property("flood_level", 0.5),
        MapObject::new("Home2", [250.0, 300.0], [[240.0, 290.0], [260.0, 310.0]], "building")
            .with_condition("destroyed"),
        MapObject::new("Flooded Area", [400.0, 400.0], [[350.0, 350.0], [450.0, 450.0]], "flood")
            .with_condition("flooded")
            .with_property("water_depth", 2.0),
        MapObject::new("Fallen Tree", [180.0, 120.0], [[170.0, 110.0], [190.0, 130.0]], "tree")
            .with_condition("fallen"),
        MapObject::new("Car", [700.0, 300.0], [[690.0, 290.0], [710.0, 310.0]], "vehicle")
            .with_condition("damaged")
            .with_property("flood_level", 1.0),
        MapObject::new("Person1", [50.0, 50.0], [[40.0, 40.0], [60.0, 60.0]], "person")
            .with_condition("injured"),
        MapObject::new("Person2", [200.0, 250.0], [[190.0, 240.0], [210.0, 260.0]], "person")
            .with_condition("deceased"),
        MapObject::new("Person3", [400.0, 500.0], [[390.0, 490.0], [410.0, 510.0]], "person")
            .with_condition("uninjured"),
    ]
}

fn national_park_map() -> Vec<MapObject> {
    vec![
        MapObject::new("Tree1", [50.0, 100.0], [[40.0, 90.0], [60.0, 110.0]], "tree")
            .with_condition("intact"),
        MapObject::new("Tree2", [120.0, 180.0], [[110.0, 170.0], [130.0, 190.0]], "tree")
            .with_condition("intact"),
        MapObject::new("Deer", [200.0, 250.0], [[190.0, 240.0], [210.0, 260.0]], "animal")
            .with_property("species", "deer")
            .with_property("speed", 10),
        MapObject::new("Open Field", [300.0, 300.0], [[280.0, 280.0], [320.0, 320.0]], "open_land")
            .with_property("grass_height", 0.5),
        MapObject::new("Lake", [400.0, 500.0], [[350.0, 450.0], [450.0, 550.0]], "water")
            .with_property("depth", 3.0)
            .with_property("type", "freshwater"),
    ]
}

fn small_town_map() -> Vec<MapObject> {
    vec![
        MapObject::new("House1", [50.0, 50.0], [[40.0, 40.0], [60.0, 60.0]], "building")
            .with_condition("intact"),
        MapObject::new("Grocery Store", [100.0, 150.0], [[90.0, 140.0], [110.0, 160.0]], "building")
            .with_condition("intact"),
        MapObject::new("Road1", [0.0, 200.0], [[0.0, 190.0], [100.0, 210.0]], "road")
            .with_property("lane_count", 2)
            .with_property("paved", true),
        MapObject::new("Strip Center", [300.0, 300.0], [[280.0, 280.0], [320.0, 320.0]], "building")
            .with_condition("intact"),
        MapObject::new("Park", [500.0, 500.0], [[480.0, 480.0], [520.0, 520.0]], "open_land")
            .with_property("has_playground", true),
    ]
}

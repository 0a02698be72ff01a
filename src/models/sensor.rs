use std::collections::HashMap;

use crate::models::{
    agent::Agent,
    map_object::MapObject,
    traits::{IEntity, IPerceiver},
};

/// 検知履歴の保持上限
const HISTORY_LIMIT: usize = 1000;

/// 群全体の検知管理
///
/// 各エージェントの知覚半径で地図オブジェクトを検知し、初回検知・再検知を記録します。
/// オブジェクトの `detected` フラグは初回検知時に一度だけ false→true に遷移し、
/// 新規検知リストにも一度だけ追加されます。
#[derive(Debug, Clone, Default)]
pub struct DetectionTracker {
    /// エージェントIDから、直近の検知で最も近かったオブジェクト名へのマッピング
    pub agent_detections: HashMap<u32, String>,
    /// 前回の公開以降に新しく検知されたオブジェクト
    pub new_detections: Vec<MapObject>,
    /// 検知イベントの履歴
    pub detection_history: Vec<DetectionEvent>,
    /// 初回検知の累計（履歴の削除に影響されない）
    pub first_detection_count: usize,
}

/// 検知イベント
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    /// イベント発生ティック
    pub tick: u64,
    /// 検知したエージェントのID
    pub agent_id: u32,
    /// 検知されたオブジェクト名
    pub object_name: String,
    /// エージェントからオブジェクトまでの距離
    pub distance: f64,
    /// 検知イベントの種類
    pub event_type: DetectionEventType,
}

/// 検知イベントの種類
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionEventType {
    /// オブジェクトを初めて検知した
    FirstDetected,
    /// 検知済みオブジェクトを再検知した
    Redetected,
}

/// 検知統計情報
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionStats {
    /// 履歴に残っている検知イベント数
    pub total_detections: usize,
    /// 初回検知の累計
    pub first_detections: usize,
    /// 何らかのオブジェクトを検知しているエージェント数
    pub agents_reporting: usize,
}

impl DetectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 検知処理
    ///
    /// 全エージェントと全オブジェクトの組を走査し、知覚半径内のオブジェクトを検知します。
    /// 戻り値は今回新しく検知済みになったオブジェクト数です。
    pub fn update_detections(&mut self, agents: &[Agent], objects: &mut [MapObject], tick: u64) -> usize {
        let mut newly_detected = 0;

        for agent in agents {
            let mut nearest: Option<(f64, usize)> = None;

            for (index, object) in objects.iter_mut().enumerate() {
                if !agent.detects(object.position) {
                    continue;
                }

                let distance = agent.get_position().distance(&object.position);
                if nearest.is_none_or(|(best, _)| distance < best) {
                    nearest = Some((distance, index));
                }

                let event_type = if object.mark_detected() {
                    newly_detected += 1;
                    self.first_detection_count += 1;
                    self.new_detections.push(object.clone());
                    DetectionEventType::FirstDetected
                } else {
                    DetectionEventType::Redetected
                };

                self.detection_history.push(DetectionEvent {
                    tick,
                    agent_id: agent.get_id(),
                    object_name: object.name.clone(),
                    distance,
                    event_type,
                });
            }

            if let Some((_, index)) = nearest {
                self.agent_detections.insert(agent.get_id(), objects[index].name.clone());
            }
        }

        // 古い履歴の削除（メモリ管理）
        if self.detection_history.len() > HISTORY_LIMIT {
            let excess = self.detection_history.len() - HISTORY_LIMIT;
            self.detection_history.drain(..excess);
        }

        newly_detected
    }

    /// 新規検知リストのクリア（ティック開始時）
    pub fn clear_new_detections(&mut self) {
        self.new_detections.clear();
    }

    /// 検知統計の計算
    pub fn get_detection_stats(&self) -> DetectionStats {
        DetectionStats {
            total_detections: self.detection_history.len(),
            first_detections: self.first_detection_count,
            agents_reporting: self.agent_detections.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{agent::AgentKinematics, common::Vector2D};

    fn agent_at(id: u32, x: f64, y: f64) -> Agent {
        Agent::new(id, Vector2D::new(x, y), 0, AgentKinematics::default())
    }

    fn objects() -> Vec<MapObject> {
        vec![
            MapObject::new("Near", [10.0, 0.0], [[5.0, -5.0], [15.0, 5.0]], "tree"),
            MapObject::new("Nearer", [5.0, 0.0], [[0.0, -5.0], [10.0, 5.0]], "tree"),
            MapObject::new("Far", [500.0, 500.0], [[490.0, 490.0], [510.0, 510.0]], "building"),
        ]
    }

    #[test]
    fn test_object_detected_exactly_once() {
        let mut tracker = DetectionTracker::new();
        let mut map = objects();
        let agents = vec![agent_at(0, 0.0, 0.0), agent_at(1, 1.0, 1.0)];

        let first = tracker.update_detections(&agents, &mut map, 10);
        assert_eq!(first, 2);
        assert_eq!(tracker.new_detections.len(), 2);
        assert!(map[0].detected && map[1].detected);
        assert!(!map[2].detected);

        tracker.clear_new_detections();
        let second = tracker.update_detections(&agents, &mut map, 20);
        assert_eq!(second, 0);
        assert!(tracker.new_detections.is_empty());
    }

    #[test]
    fn test_nearest_object_bookkeeping_updates_on_redetection() {
        let mut tracker = DetectionTracker::new();
        let mut map = objects();

        tracker.update_detections(&[agent_at(0, 0.0, 0.0)], &mut map, 10);
        assert_eq!(tracker.agent_detections.get(&0).map(String::as_str), Some("Nearer"));

        // 既に検知済みでも最寄りオブジェクトの記録は更新される
        tracker.update_detections(&[agent_at(0, 14.0, 0.0)], &mut map, 20);
        assert_eq!(tracker.agent_detections.get(&0).map(String::as_str), Some("Near"));

        let stats = tracker.get_detection_stats();
        assert_eq!(stats.first_detections, 2);
        assert_eq!(stats.total_detections, 4);
        assert_eq!(stats.agents_reporting, 1);
    }

    #[test]
    fn test_first_detections_survive_history_trim() {
        let mut tracker = DetectionTracker::new();
        let mut map = objects();
        let agents: Vec<Agent> = (0..20).map(|id| agent_at(id, 5.0, 1.0)).collect();

        for pass in 0..30 {
            tracker.update_detections(&agents, &mut map, pass);
        }

        assert_eq!(tracker.detection_history.len(), HISTORY_LIMIT);
        assert!(tracker
            .detection_history
            .iter()
            .all(|event| event.event_type == DetectionEventType::Redetected));
        let stats = tracker.get_detection_stats();
        assert_eq!(stats.first_detections, 2);
        assert_eq!(stats.total_detections, HISTORY_LIMIT);
        assert_eq!(stats.agents_reporting, 20);
    }
}

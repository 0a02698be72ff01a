use crate::models::common::{Rect, Vector2D};

/// 地形高度場
///
/// 固定解像度の高度グリッドを環境矩形に対応付けたものです。
/// 実行中に変更されることはなく、位置による参照のみを行います。
/// グリッドは `heights[row][col]`（row が y 方向、col が x 方向）で保持します。
#[derive(Debug, Clone, PartialEq)]
pub struct TerrainField {
    heights: Vec<Vec<f64>>,
    cols: usize,
    rows: usize,
    environment: Rect,
}

impl TerrainField {
    /// 高度グリッドから地形場を作成
    ///
    /// 行の長さが揃っていない、または空のグリッドは `None` を返します。
    pub fn new(heights: Vec<Vec<f64>>, environment: Rect) -> Option<Self> {
        let rows = heights.len();
        let cols = heights.first().map(|row| row.len()).unwrap_or(0);
        if rows == 0 || cols == 0 || heights.iter().any(|row| row.len() != cols) {
            return None;
        }

        Some(Self {
            heights,
            cols,
            rows,
            environment,
        })
    }

    /// 全域で高度0の平坦な地形
    pub fn flat(environment: Rect) -> Self {
        Self {
            heights: vec![vec![0.0]],
            cols: 1,
            rows: 1,
            environment,
        }
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    /// 指定位置の高度（双線形補間）
    pub fn height_at(&self, position: Vector2D) -> f64 {
        let x = position.x.clamp(0.0, self.environment.width);
        let y = position.y.clamp(0.0, self.environment.height);

        let map_x = (x / self.environment.width) * (self.cols - 1) as f64;
        let map_y = (y / self.environment.height) * (self.rows - 1) as f64;

        let x0 = (map_x.floor() as usize).min(self.cols - 1);
        let x1 = (x0 + 1).min(self.cols - 1);
        let y0 = (map_y.floor() as usize).min(self.rows - 1);
        let y1 = (y0 + 1).min(self.rows - 1);

        let h00 = self.heights[y0][x0];
        let h01 = self.heights[y0][x1];
        let h10 = self.heights[y1][x0];
        let h11 = self.heights[y1][x1];

        let tx = map_x - x0 as f64;
        let ty = map_y - y0 as f64;

        h00 * (1.0 - tx) * (1.0 - ty)
            + h01 * tx * (1.0 - ty)
            + h10 * (1.0 - tx) * ty
            + h11 * tx * ty
    }

    /// 指定位置の勾配（中心差分）
    ///
    /// 位置をグリッドセルに対応付け、内側セルに丸めてから左右・上下の差分を取ります。
    /// 3セル未満の軸では勾配を0とします。
    pub fn gradient_at(&self, position: Vector2D) -> Vector2D {
        if self.cols < 3 && self.rows < 3 {
            return Vector2D::ZERO;
        }

        let grid_x = Self::interior_index(position.x / self.environment.width, self.cols);
        let grid_y = Self::interior_index(position.y / self.environment.height, self.rows);

        let dx = if self.cols >= 3 {
            self.heights[grid_y][grid_x + 1] - self.heights[grid_y][grid_x - 1]
        } else {
            0.0
        };
        let dy = if self.rows >= 3 {
            self.heights[grid_y + 1][grid_x] - self.heights[grid_y - 1][grid_x]
        } else {
            0.0
        };

        Vector2D::new(dx, dy)
    }

    // 内側セル [1, n-2] に丸めたインデックス（n < 3 の場合は 0）
    fn interior_index(fraction: f64, n: usize) -> usize {
        if n < 3 {
            return 0;
        }
        let scaled = (fraction * n as f64).clamp(1.0, (n - 2) as f64);
        if scaled.is_finite() { scaled as usize } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_field() -> TerrainField {
        TerrainField::new(
            vec![
                vec![0.0, 0.0, 0.0, 0.0, 6.0],
                vec![2.0, 4.0, 0.0, 0.0, 0.0],
                vec![2.0, 0.0, 8.0, 0.0, 0.0],
                vec![0.0, 0.0, 0.0, 2.0, 0.0],
                vec![6.0, 0.0, 0.0, 0.0, 0.0],
            ],
            Rect::new(800.0, 600.0),
        )
        .expect("rectangular grid")
    }

    #[test]
    fn test_rejects_ragged_grid() {
        let field = TerrainField::new(vec![vec![0.0, 1.0], vec![0.0]], Rect::new(10.0, 10.0));
        assert!(field.is_none());
    }

    #[test]
    fn test_height_at_grid_corners() {
        let field = sample_field();
        assert_eq!(field.height_at(Vector2D::new(0.0, 0.0)), 0.0);
        assert_eq!(field.height_at(Vector2D::new(800.0, 0.0)), 6.0);
        assert_eq!(field.height_at(Vector2D::new(0.0, 600.0)), 6.0);
        // グリッド中心 (2,2)
        assert!((field.height_at(Vector2D::new(400.0, 300.0)) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_height_interpolates_between_cells() {
        let field = sample_field();
        // (0,0)=0 と (1,0)=0、(0,1)=2 と (1,1)=4 の中点
        let h = field.height_at(Vector2D::new(100.0, 75.0));
        assert!((h - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_gradient_points_uphill() {
        let field = sample_field();
        // セル(1,1)付近: 右隣(2,1)=0、左隣(0,1)=2 → dx=-2、下(1,2)=0、上(1,0)=0 → dy=0
        let g = field.gradient_at(Vector2D::new(200.0, 150.0));
        assert_eq!(g, Vector2D::new(-2.0, 0.0));
    }

    #[test]
    fn test_flat_field_has_zero_gradient() {
        let field = TerrainField::flat(Rect::new(100.0, 100.0));
        assert!(field.gradient_at(Vector2D::new(50.0, 50.0)).is_zero());
        assert_eq!(field.height_at(Vector2D::new(50.0, 50.0)), 0.0);
    }
}

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// 2次元ベクトル（位置・速度・加速度・力で共用）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Vector2D {
    pub x: f64,
    pub y: f64,
}

impl Vector2D {
    pub const ZERO: Vector2D = Vector2D { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// ベクトルの長さ
    pub fn magnitude(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2)).sqrt()
    }

    /// 2点間のユークリッド距離
    pub fn distance(&self, other: &Vector2D) -> f64 {
        (*self - *other).magnitude()
    }

    /// 単位ベクトル化（長さ0の場合はゼロベクトル）
    pub fn normalize(&self) -> Self {
        let mag = self.magnitude();
        if mag > 0.0 {
            Self::new(self.x / mag, self.y / mag)
        } else {
            Self::ZERO
        }
    }

    /// 指定した長さに揃える（長さ0の場合はゼロベクトル）
    pub fn with_magnitude(&self, length: f64) -> Self {
        self.normalize() * length
    }

    /// 大きさ制限（最大値でクリップ）
    pub fn clamp_magnitude(&self, max: f64) -> Self {
        let mag = self.magnitude();
        if mag > max && mag > 0.0 {
            let factor = max / mag;
            Self::new(self.x * factor, self.y * factor)
        } else {
            *self
        }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<[f64; 2]> for Vector2D {
    fn from(value: [f64; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<Vector2D> for [f64; 2] {
    fn from(value: Vector2D) -> Self {
        [value.x, value.y]
    }
}

impl Add for Vector2D {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::new(self.x + other.x, self.y + other.y)
    }
}

impl AddAssign for Vector2D {
    fn add_assign(&mut self, other: Self) {
        self.x += other.x;
        self.y += other.y;
    }
}

impl Sub for Vector2D {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::new(self.x - other.x, self.y - other.y)
    }
}

impl Mul<f64> for Vector2D {
    type Output = Self;

    fn mul(self, scalar: f64) -> Self::Output {
        Self::new(self.x * scalar, self.y * scalar)
    }
}

impl Div<f64> for Vector2D {
    type Output = Self;

    fn div(self, scalar: f64) -> Self::Output {
        Self::new(self.x / scalar, self.y / scalar)
    }
}

impl Neg for Vector2D {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self::new(-self.x, -self.y)
    }
}

/// 環境矩形（原点(0,0)から幅・高さまで）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// 境界を含めて矩形内かどうか
    pub fn contains(&self, position: &Vector2D) -> bool {
        position.x >= 0.0 && position.x <= self.width &&
        position.y >= 0.0 && position.y <= self.height
    }
}

/// ミッション領域 [x1, y1, x2, y2]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_rect(rect: &Rect) -> Self {
        Self::new(0.0, 0.0, rect.width, rect.height)
    }

    pub fn center(&self) -> Vector2D {
        Vector2D::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl From<[f64; 4]> for BBox {
    fn from(value: [f64; 4]) -> Self {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(value: BBox) -> Self {
        value.to_array()
    }
}

/// 数学ユーティリティ関数
pub mod math_utils {
    /// 許容誤差付きの比較
    pub fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() <= epsilon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_zero_vector() {
        let v = Vector2D::ZERO.normalize();
        assert!(v.is_zero());
        assert!(v.is_finite());
    }

    #[test]
    fn test_clamp_magnitude() {
        let v = Vector2D::new(3.0, 4.0).clamp_magnitude(1.0);
        assert!(math_utils::approx_eq(v.magnitude(), 1.0, 1e-12));
        let w = Vector2D::new(0.3, 0.4).clamp_magnitude(1.0);
        assert_eq!(w, Vector2D::new(0.3, 0.4));
    }

    #[test]
    fn test_rect_contains_bounds() {
        let rect = Rect::new(800.0, 600.0);
        assert!(rect.contains(&Vector2D::new(0.0, 600.0)));
        assert!(!rect.contains(&Vector2D::new(-0.1, 10.0)));
    }
}

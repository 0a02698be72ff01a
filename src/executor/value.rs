//! インタプリタの実行時値
//!
//! リストと辞書は共有・可変（`Rc<RefCell<..>>`）、タプルと文字列は不変です。
//! 値は1回の関数呼び出しの中だけで生存します。

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use super::ast::Expr;
use crate::models::MapObject;

/// 比較と表示で辿る入れ子の最大深さ
pub const MAX_VALUE_DEPTH: usize = 100;

/// 入れ子が深すぎる（または自身を含む）値を比較しようとした
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthExceeded;

/// ラムダ式（`key=` 引数専用）
#[derive(Debug)]
pub struct LambdaValue {
    pub params: Vec<String>,
    pub body: Arc<Expr>,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    /// 挿入順を保持するキーと値の組
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    Lambda(Rc<LambdaValue>),
    /// 許可リスト内の組み込み関数
    Builtin(&'static str),
    /// 事前束縛された `math` / `random`
    Module(&'static str),
}

impl Value {
    pub fn str(value: &str) -> Self {
        Value::Str(Rc::from(value))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::from(items))
    }

    pub fn dict(entries: Vec<(Value, Value)>) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn point(position: [f64; 2]) -> Self {
        Value::list(vec![Value::Float(position[0]), Value::Float(position[1])])
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Lambda(_) => "function",
            Value::Builtin(_) => "builtin_function",
            Value::Module(_) => "module",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            Value::Lambda(_) | Value::Builtin(_) | Value::Module(_) => true,
        }
    }

    /// 整数として扱える値（bool を含む）
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// 数値として扱える値（bool を含む）
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_))
    }

    /// 辞書のキーとして使えるか
    pub fn is_hashable(&self) -> bool {
        match self {
            Value::List(_) | Value::Dict(_) => false,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => true,
        }
    }

    /// 反復可能な値を要素のベクタに展開
    pub fn iter_values(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.borrow().clone()),
            Value::Tuple(items) => Some(items.to_vec()),
            Value::Str(s) => Some(s.chars().map(|c| Value::str(&c.to_string())).collect()),
            Value::Dict(entries) => Some(entries.borrow().iter().map(|(k, _)| k.clone()).collect()),
            _ => None,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(items.borrow().len()),
            Value::Tuple(items) => Some(items.len()),
            Value::Str(s) => Some(s.chars().count()),
            Value::Dict(entries) => Some(entries.borrow().len()),
            _ => None,
        }
    }

    /// 等値比較（数値は型をまたいで比較）
    pub fn py_eq(&self, other: &Value) -> Result<bool, DepthExceeded> {
        self.eq_at(other, 0)
    }

    /// 順序比較。比較不能な組み合わせは `Ok(None)`
    pub fn py_cmp(&self, other: &Value) -> Result<Option<Ordering>, DepthExceeded> {
        self.cmp_at(other, 0)
    }

    fn eq_at(&self, other: &Value, depth: usize) -> Result<bool, DepthExceeded> {
        if depth > MAX_VALUE_DEPTH {
            return Err(DepthExceeded);
        }
        let equal = match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow(), depth + 1)?
            }
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b) || seq_eq(a, b, depth + 1)?,
            (Value::Dict(a), Value::Dict(b)) => {
                Rc::ptr_eq(a, b) || entries_eq(&a.borrow(), &b.borrow(), depth + 1)?
            }
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Lambda(a), Value::Lambda(b)) => Rc::ptr_eq(a, b),
            (a, b) if a.is_numeric() && b.is_numeric() => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            },
            _ => false,
        };
        Ok(equal)
    }

    fn cmp_at(&self, other: &Value, depth: usize) -> Result<Option<Ordering>, DepthExceeded> {
        if depth > MAX_VALUE_DEPTH {
            return Err(DepthExceeded);
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) => seq_cmp(&a.borrow(), &b.borrow(), depth + 1),
            (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b, depth + 1),
            (a, b) if a.is_numeric() && b.is_numeric() => Ok(match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
            }),
            _ => Ok(None),
        }
    }

    /// `is` 演算子
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Lambda(a), Value::Lambda(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            _ => false,
        }
    }

    /// 辞書からキーで値を引く
    pub fn dict_lookup(entries: &[(Value, Value)], key: &Value) -> Result<Option<Value>, DepthExceeded> {
        for (k, v) in entries {
            if k.py_eq(key)? {
                return Ok(Some(v.clone()));
            }
        }
        Ok(None)
    }

    /// 辞書にキーを挿入（既存キーは上書き）
    pub fn dict_insert(
        entries: &mut Vec<(Value, Value)>,
        key: Value,
        value: Value,
    ) -> Result<(), DepthExceeded> {
        for entry in entries.iter_mut() {
            if entry.0.py_eq(&key)? {
                entry.1 = value;
                return Ok(());
            }
        }
        entries.push((key, value));
        Ok(())
    }

    /// YAML の値を実行時値に変換（自由形式プロパティ用）
    pub fn from_yaml(value: &serde_yaml::Value) -> Value {
        match value {
            serde_yaml::Value::Null => Value::None,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_yaml::Value::String(s) => Value::str(s),
            serde_yaml::Value::Sequence(items) => {
                Value::list(items.iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => Value::dict(
                map.iter()
                    .map(|(k, v)| (Value::from_yaml(k), Value::from_yaml(v)))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
        }
    }
}

impl From<&MapObject> for Value {
    /// 地図オブジェクトをステップ関数に渡す辞書へ変換
    fn from(object: &MapObject) -> Self {
        let [min, max] = object.bounding_box;
        let properties = object
            .properties
            .iter()
            .map(|(k, v)| (Value::str(k), Value::from_yaml(v)))
            .collect();
        let condition = match &object.condition {
            Some(condition) => Value::str(condition),
            None => Value::None,
        };

        Value::dict(vec![
            (Value::str("name"), Value::str(&object.name)),
            (
                Value::str("position"),
                Value::point([object.position.x, object.position.y]),
            ),
            (
                Value::str("boundingBox"),
                Value::list(vec![Value::point([min.x, min.y]), Value::point([max.x, max.y])]),
            ),
            (Value::str("object_type"), Value::str(&object.object_type)),
            (Value::str("type"), Value::str(&object.object_type)),
            (Value::str("condition"), condition),
            (Value::str("properties"), Value::dict(properties)),
            (Value::str("detected"), Value::Bool(object.detected)),
            (Value::str("radius"), Value::Float(object.radius())),
        ])
    }
}

fn seq_eq(a: &[Value], b: &[Value], depth: usize) -> Result<bool, DepthExceeded> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b) {
        if !x.eq_at(y, depth)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn seq_cmp(a: &[Value], b: &[Value], depth: usize) -> Result<Option<Ordering>, DepthExceeded> {
    for (x, y) in a.iter().zip(b) {
        if !x.eq_at(y, depth)? {
            return x.cmp_at(y, depth);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

// キーの挿入順は問わない
fn entries_eq(a: &[(Value, Value)], b: &[(Value, Value)], depth: usize) -> Result<bool, DepthExceeded> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (key, value) in a {
        let mut matched = false;
        for (other_key, other_value) in b {
            if other_key.eq_at(key, depth)? {
                matched = other_value.eq_at(value, depth)?;
                break;
            }
        }
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// 浮動小数点数の表示（整数値でも小数点を付ける）
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

impl Value {
    // 深すぎる入れ子（自身を含むリストなど）は `...` で打ち切る
    fn write_repr(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth > MAX_VALUE_DEPTH && matches!(self, Value::List(_) | Value::Tuple(_) | Value::Dict(_)) {
            return write!(f, "...");
        }
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::Str(s) => write!(f, "'{}'", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.write_repr(f, depth + 1)?;
                }
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.write_repr(f, depth + 1)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    key.write_repr(f, depth + 1)?;
                    write!(f, ": ")?;
                    value.write_repr(f, depth + 1)?;
                }
                write!(f, "}}")
            }
            Value::Lambda(_) => write!(f, "<lambda>"),
            Value::Builtin(name) => write!(f, "<built-in function {}>", name),
            Value::Module(name) => write!(f, "<module '{}'>", name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_repr(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_across_types() {
        assert_eq!(Value::Int(2).py_eq(&Value::Float(2.0)), Ok(true));
        assert_eq!(Value::Bool(true).py_eq(&Value::Int(1)), Ok(true));
        assert_eq!(Value::Int(2).py_eq(&Value::str("2")), Ok(false));
    }

    #[test]
    fn test_sequence_ordering_is_lexicographic() {
        let a = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::tuple(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(a.py_cmp(&b), Ok(Some(Ordering::Less)));
        assert_eq!(Value::Int(1).py_cmp(&Value::str("a")), Ok(None));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::list(vec![]).truthy());
        assert!(Value::str("x").truthy());
        assert!(!Value::Float(0.0).truthy());
        assert!(!Value::None.truthy());
    }

    #[test]
    fn test_map_object_conversion_exposes_radius_and_type() {
        let object = MapObject::new("Car", [10.0, 20.0], [[8.0, 18.0], [12.0, 26.0]], "vehicle");
        let value = Value::from(&object);
        let Value::Dict(entries) = value else {
            panic!("expected dict");
        };
        let entries = entries.borrow();
        let radius = Value::dict_lookup(&entries, &Value::str("radius"))
            .expect("lookup")
            .expect("radius");
        assert_eq!(radius.py_eq(&Value::Float(4.0)), Ok(true));
        let kind = Value::dict_lookup(&entries, &Value::str("type"))
            .expect("lookup")
            .expect("type");
        assert_eq!(kind.py_eq(&Value::str("vehicle")), Ok(true));
    }

    #[test]
    fn test_display_matches_python_repr() {
        let value = Value::list(vec![Value::Float(50.0), Value::Int(3), Value::str("a")]);
        assert_eq!(value.to_string(), "[50.0, 3, 'a']");
        assert_eq!(Value::tuple(vec![Value::None]).to_string(), "(None,)");
    }

    #[test]
    fn test_self_containing_lists_fail_comparison() {
        let a = Value::list(vec![]);
        let b = Value::list(vec![]);
        if let (Value::List(inner_a), Value::List(inner_b)) = (&a, &b) {
            inner_a.borrow_mut().push(a.clone());
            inner_b.borrow_mut().push(b.clone());
        }

        assert_eq!(a.py_eq(&a), Ok(true));
        assert_eq!(a.py_eq(&b), Err(DepthExceeded));
        assert_eq!(a.py_cmp(&b), Err(DepthExceeded));
        assert!(a.to_string().contains("..."));

        // 循環を切ってリークを防ぐ
        for value in [&a, &b] {
            if let Value::List(items) = value {
                items.borrow_mut().clear();
            }
        }
    }

    #[test]
    fn test_deep_tuples_compare_up_to_limit() {
        let nest = |levels: usize| (0..levels).fold(Value::Int(1), |inner, _| Value::tuple(vec![inner]));
        assert_eq!(nest(50).py_eq(&nest(50)), Ok(true));
        assert_eq!(nest(500).py_eq(&nest(500)), Err(DepthExceeded));
    }
}

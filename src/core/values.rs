//! Manifold-valued variables and the nonlinear estimate.
//!
//! A [`Value`] is a point on a manifold; the engine never inspects it beyond
//! the capability set `{dim, retract, local_coordinates}`. Mixed variable
//! kinds are handled with a tagged variant so that the estimate can be deep
//! copied and compared structurally.

use nalgebra::{DVector, Vector2, Vector3};
use std::collections::HashMap;

use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::core::vector_values::VectorValues;
use crate::core::{CoreError, CoreResult};
use crate::manifold::SE2;

/// A manifold-valued variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A robot pose in the plane
    Pose2(SE2),
    /// A 2D landmark position
    Point2(Vector2<f64>),
}

impl Value {
    /// Tangent space dimension of this variable.
    pub fn dim(&self) -> usize {
        match self {
            Value::Pose2(_) => 3,
            Value::Point2(_) => 2,
        }
    }

    /// Apply a tangent space step: `x ⊞ δ`.
    pub fn retract(&self, delta: &DVector<f64>) -> CoreResult<Value> {
        if delta.len() != self.dim() {
            return Err(CoreError::InconsistentDims(format!(
                "retract of a {}-dim variable with a {}-dim step",
                self.dim(),
                delta.len()
            ))
            .log());
        }
        Ok(match self {
            Value::Pose2(pose) => {
                Value::Pose2(pose.retract(&Vector3::new(delta[0], delta[1], delta[2])))
            }
            Value::Point2(point) => {
                Value::Point2(point + Vector2::new(delta[0], delta[1]))
            }
        })
    }

    /// Tangent vector from `self` to `other`: `other ⊟ self`.
    pub fn local_coordinates(&self, other: &Value) -> CoreResult<DVector<f64>> {
        match (self, other) {
            (Value::Pose2(a), Value::Pose2(b)) => {
                let xi = a.local_coordinates(b);
                Ok(DVector::from_column_slice(xi.as_slice()))
            }
            (Value::Point2(a), Value::Point2(b)) => {
                let d = b - a;
                Ok(DVector::from_column_slice(d.as_slice()))
            }
            _ => Err(CoreError::TypeMismatch(
                "local coordinates between different variable kinds".to_string(),
            )
            .log()),
        }
    }

    /// Extract the pose, failing if this is not a pose.
    pub fn as_pose2(&self) -> CoreResult<&SE2> {
        match self {
            Value::Pose2(pose) => Ok(pose),
            _ => Err(CoreError::TypeMismatch("expected a Pose2".to_string()).log()),
        }
    }

    /// Extract the point, failing if this is not a point.
    pub fn as_point2(&self) -> CoreResult<&Vector2<f64>> {
        match self {
            Value::Point2(point) => Ok(point),
            _ => Err(CoreError::TypeMismatch("expected a Point2".to_string()).log()),
        }
    }
}

/// The nonlinear estimate: a mapping from keys to manifold values.
///
/// Keys are unique; insertion order is irrelevant for correctness. Every key
/// referenced by an active factor must be present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    map: HashMap<Key, Value>,
}

impl Values {
    /// Create an empty estimate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the estimate is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether a key is present.
    pub fn contains(&self, key: Key) -> bool {
        self.map.contains_key(&key)
    }

    /// Insert a new variable. Fails with `DuplicateKey` if the key exists.
    pub fn insert(&mut self, key: Key, value: Value) -> CoreResult<()> {
        if self.map.contains_key(&key) {
            return Err(CoreError::DuplicateKey { key }.log());
        }
        self.map.insert(key, value);
        Ok(())
    }

    /// Look up a variable.
    pub fn get(&self, key: Key) -> CoreResult<&Value> {
        self.map.get(&key).ok_or(CoreError::UnknownKey { key })
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, key: Key) -> CoreResult<&mut Value> {
        self.map.get_mut(&key).ok_or(CoreError::UnknownKey { key })
    }

    /// Remove a variable, returning it if present.
    pub fn remove(&mut self, key: Key) -> Option<Value> {
        self.map.remove(&key)
    }

    /// Iterate over (key, value) pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &Value)> {
        self.map.iter().map(|(k, v)| (*k, v))
    }

    /// Keys in ascending order.
    pub fn keys_sorted(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.map.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Retract every variable along its logically ordered row of `delta`,
    /// looked up through the ordering, producing a new estimate.
    pub fn retract(&self, delta: &VectorValues, ordering: &Ordering) -> CoreResult<Values> {
        let mut retracted = Values::new();
        for (key, value) in self.iter() {
            let index = ordering.at(key)?;
            retracted.map.insert(key, value.retract(delta.row(index))?);
        }
        Ok(retracted)
    }
}

use std::{collections::BTreeMap, fmt};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Dense tensor values flowing between stages.
pub type Tensor = ArrayD<f32>;

/// Keyword arguments of a stage invocation.
pub type Kwargs = BTreeMap<String, Value>;

/// Identifies a deferred value by the process that owns its result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefId {
    pub rank: usize,
    pub seq: u64,
}

impl RefId {
    pub fn new(rank: usize, seq: u64) -> Self {
        Self { rank, seq }
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank, self.seq)
    }
}

/// An argument or result of a stage.
///
/// Concrete variants carry data, `Deferred` stands for a value that some stage
/// will produce. Nested tuples are walked recursively wherever references are
/// counted or substituted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(Tensor),
    Tuple(Vec<Value>),
    Deferred(RefId),
}

impl Value {
    /// Calls `f` for every deferred reference inside this value, duplicates included.
    pub fn visit_refs<F: FnMut(RefId)>(&self, f: &mut F) {
        match self {
            Value::Deferred(id) => f(*id),
            Value::Tuple(items) => items.iter().for_each(|item| item.visit_refs(f)),
            _ => {}
        }
    }

    /// Returns the distinct deferred references inside this value, in order of appearance.
    pub fn refs(&self) -> Vec<RefId> {
        let mut refs = Vec::new();
        self.visit_refs(&mut |id| {
            if !refs.contains(&id) {
                refs.push(id);
            }
        });
        refs
    }

    pub fn has_refs(&self) -> bool {
        match self {
            Value::Deferred(_) => true,
            Value::Tuple(items) => items.iter().any(Value::has_refs),
            _ => false,
        }
    }

    /// Replaces every deferred reference with the value returned by `f`.
    ///
    /// # Arguments
    /// * `f` - Substitution for a single reference, its error aborts the walk.
    ///
    /// # Returns
    /// The substituted value or the first error produced by `f`.
    pub fn try_map_refs<E, F>(self, f: &mut F) -> Result<Value, E>
    where
        F: FnMut(RefId) -> Result<Value, E>,
    {
        match self {
            Value::Deferred(id) => f(id),
            Value::Tuple(items) => items
                .into_iter()
                .map(|item| item.try_map_refs(f))
                .collect::<Result<Vec<_>, E>>()
                .map(Value::Tuple),
            other => Ok(other),
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_deferred(&self) -> Option<RefId> {
        match self {
            Value::Deferred(id) => Some(*id),
            _ => None,
        }
    }

    /// Element `index` of a tuple value.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Tuple(items) => items.get(index),
            _ => None,
        }
    }

    /// A short name of the variant, used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tensor(_) => "tensor",
            Value::Tuple(_) => "tuple",
            Value::Deferred(_) => "deferred",
        }
    }
}

impl From<Tensor> for Value {
    fn from(value: Tensor) -> Self {
        Value::Tensor(value)
    }
}

impl From<RefId> for Value {
    fn from(value: RefId) -> Self {
        Value::Deferred(value)
    }
}

/// Distinct deferred references across a full argument set.
pub fn collect_refs(args: &[Value], kwargs: &Kwargs) -> Vec<RefId> {
    let mut refs = Vec::new();
    let mut push = |id: RefId| {
        if !refs.contains(&id) {
            refs.push(id);
        }
    };

    args.iter()
        .chain(kwargs.values())
        .for_each(|v| v.visit_refs(&mut push));

    refs
}

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on the flattened pool length (sum of all weights).
pub const MAX_TOTAL_WEIGHT: u64 = 1_000_000;

/// A request produced by a target: the URL path (appended to the base URL) and the JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub path: String,
    pub body: serde_json::Value,
}

/// Produces one request per call. Implementations must be cheap to call and safe to share
/// between workers.
pub trait TargetGenerator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn generate(&self) -> RequestSpec;
}

pub type Target = Arc<dyn TargetGenerator>;

/// A target described by configuration: a fixed path plus a JSON body template.
///
/// String leaves of the body may contain `{{uuid}}` and `{{random}}`, which are replaced
/// on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonTarget {
    /// Display name; falls back to the path when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl JsonTarget {
    pub fn new(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            name: String::new(),
            path: path.into(),
            body,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl TargetGenerator for JsonTarget {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            &self.path
        } else {
            &self.name
        }
    }

    fn generate(&self) -> RequestSpec {
        RequestSpec {
            path: self.path.clone(),
            body: expand_placeholders(&self.body),
        }
    }
}

fn expand_placeholders(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(s) if s.contains("{{") => {
            let mut out = s.clone();
            while out.contains("{{uuid}}") {
                out = out.replacen("{{uuid}}", &uuid::Uuid::new_v4().to_string(), 1);
            }
            while out.contains("{{random}}") {
                let n: u32 = rand::thread_rng().r#gen();
                out = out.replacen("{{random}}", &n.to_string(), 1);
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(expand_placeholders).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_placeholders(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Serializable target plus its weight. This is the form that crosses process boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(flatten)]
    pub target: JsonTarget,
    pub weight: u32,
}

impl TargetSpec {
    pub fn new(target: JsonTarget, weight: u32) -> Self {
        Self { target, weight }
    }

    pub fn into_weighted(self) -> (Target, u32) {
        (Arc::new(self.target), self.weight)
    }
}

/// Flattened weighted pool: each target appears `weight` times, so a uniform draw over
/// the sequence reproduces the weight ratios.
#[derive(Debug, Clone)]
pub struct WeightedTargetPool {
    slots: Vec<Target>,
}

impl WeightedTargetPool {
    pub fn build(weights: Vec<(Target, u32)>) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::NoTargets);
        }

        let mut total: u64 = 0;
        for (target, weight) in &weights {
            if *weight == 0 {
                return Err(Error::InvalidWeight(target.name().to_string()));
            }
            total = total.saturating_add(u64::from(*weight));
        }
        if total > MAX_TOTAL_WEIGHT {
            return Err(Error::TotalWeightTooLarge(total));
        }

        let mut slots = Vec::with_capacity(total as usize);
        for (target, weight) in weights {
            slots.extend(std::iter::repeat_n(target, weight as usize));
        }

        Ok(Self { slots })
    }

    pub fn from_specs(specs: &[TargetSpec]) -> Result<Self> {
        Self::build(
            specs
                .iter()
                .cloned()
                .map(TargetSpec::into_weighted)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> &Target {
        // `build` rejects empty pools, so the range is never empty.
        &self.slots[rng.gen_range(0..self.slots.len())]
    }
}

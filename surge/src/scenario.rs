use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use surge_core::TargetSpec;

/// Scenario file. Every field can be overridden from the command line.
///
/// ```yaml
/// baseUrl: http://localhost:8080
/// testId: nightly
/// duration: 30s
/// mode: threaded
/// headers:
///   Authorization: Bearer token
/// targets:
///   - name: create-user
///     path: /users
///     weight: 3
///     body: { id: "{{uuid}}" }
///   - path: /orders
///     weight: 1
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ScenarioYaml {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration: Option<YamlDuration>,

    /// threaded | multi-process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    #[serde(
        skip_serializing_if = "BTreeMap::is_empty",
        default,
        deserialize_with = "deserialize_headers"
    )]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

impl ScenarioYaml {
    pub(crate) fn duration(&self) -> Option<Duration> {
        self.duration.map(YamlDuration::into_inner)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct YamlDuration(Duration);

impl YamlDuration {
    fn into_inner(self) -> Duration {
        self.0
    }
}

impl From<Duration> for YamlDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl Serialize for YamlDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

impl<'de> Deserialize<'de> for YamlDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = YamlDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(YamlDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(YamlDuration(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a finite, non-negative number"));
                }
                Ok(YamlDuration(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v.trim()).map_err(E::custom)?;
                Ok(YamlDuration(d))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_str(&v)
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Header values may be written as plain YAML scalars (`x-retry: 3`).
fn deserialize_headers<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    let mut out = BTreeMap::new();

    for (k, v) in raw {
        let s = match v {
            serde_yaml::Value::Null => String::new(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::String(s) => s,
            _ => {
                return Err(serde::de::Error::custom(format!(
                    "header `{k}` must be a scalar value"
                )));
            }
        };
        out.insert(k, s);
    }

    Ok(out)
}

pub(crate) fn parse(text: &str) -> anyhow::Result<ScenarioYaml> {
    // An empty document is a scenario with every field left to the CLI.
    if text.trim().is_empty() {
        return Ok(ScenarioYaml::default());
    }
    Ok(serde_yaml::from_str(text)?)
}

pub(crate) async fn load(path: &Path) -> anyhow::Result<ScenarioYaml> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read scenario YAML: {}", path.display()))?;
    parse(&text).with_context(|| format!("failed to parse YAML: {}", path.display()))
}

//! Serde adapters for losses that may be non-finite.
//!
//! JSON has no NaN or infinity: `serde_json` writes them as `null` and then
//! refuses to read `null` back as an `f64`. A diverged epoch must still leave
//! a loadable record, so these adapters spell non-finite values as the
//! strings `"NaN"`, `"inf"` and `"-inf"`, and read a bare `null` as NaN.
//!
//! Use with `#[serde(with = "crate::float_serde::scalar")]` (or `list`,
//! `optional`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Number(f64),
    Text(String),
}

fn encode(value: f64) -> Repr {
    if value.is_finite() {
        Repr::Number(value)
    } else if value.is_nan() {
        Repr::Text("NaN".to_string())
    } else if value > 0.0 {
        Repr::Text("inf".to_string())
    } else {
        Repr::Text("-inf".to_string())
    }
}

fn decode<E: serde::de::Error>(repr: Option<Repr>) -> Result<f64, E> {
    match repr {
        None => Ok(f64::NAN),
        Some(Repr::Number(v)) => Ok(v),
        Some(Repr::Text(s)) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "inf" => Ok(f64::INFINITY),
            "-inf" => Ok(f64::NEG_INFINITY),
            other => Err(E::custom(format!(
                "expected a number, 'NaN', 'inf' or '-inf', got '{other}'"
            ))),
        },
    }
}

/// A single `f64`.
pub mod scalar {
    use super::*;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        encode(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        decode(Option::<Repr>::deserialize(deserializer)?)
    }
}

/// A `Vec<f64>`.
pub mod list {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let reprs: Vec<Repr> = values.iter().map(|v| encode(*v)).collect();
        reprs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Option<Repr>>::deserialize(deserializer)?
            .into_iter()
            .map(decode)
            .collect()
    }
}

/// An `Option<f64>`; `None` stays `null`, so a non-finite `Some` is spelled out.
pub mod optional {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(encode).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<f64>, D::Error> {
        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(None),
            Some(repr) => decode(Some(repr)).map(Some),
        }
    }
}

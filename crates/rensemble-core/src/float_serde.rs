//! 非有限値を含む f64 の serde 表現
//!
//! JSON は `inf`/`NaN` を表せないため、有限値は数値のまま、
//! それ以外は文字列 `"inf"`/`"-inf"`/`"nan"` として保存する。

use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr {
    Num(f64),
    Text(String),
}

pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else if value.is_nan() {
        serializer.serialize_str("nan")
    } else if *value > 0.0 {
        serializer.serialize_str("inf")
    } else {
        serializer.serialize_str("-inf")
    }
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Repr::deserialize(deserializer)? {
        Repr::Num(v) => Ok(v),
        Repr::Text(s) => match s.as_str() {
            "inf" => Ok(f64::INFINITY),
            "-inf" => Ok(f64::NEG_INFINITY),
            "nan" => Ok(f64::NAN),
            other => Err(serde::de::Error::custom(format!("invalid float literal '{other}'"))),
        },
    }
}

/// `Option<f64>` 版
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => super::serialize(v, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        #[derive(Deserialize)]
        struct Wrap(#[serde(with = "super")] f64);
        Ok(Option::<Wrap>::deserialize(deserializer)?.map(|Wrap(v)| v))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super")]
        loss: f64,
        #[serde(with = "super::option", default)]
        extra: Option<f64>,
    }

    #[test]
    fn test_nonfinite_roundtrip() {
        for v in [1.25, f64::INFINITY, f64::NEG_INFINITY] {
            let json = serde_json::to_string(&Sample { loss: v, extra: Some(v) }).unwrap();
            let back: Sample = serde_json::from_str(&json).unwrap();
            assert_eq!(back.loss, v);
            assert_eq!(back.extra, Some(v));
        }
        let json = serde_json::to_string(&Sample { loss: f64::NAN, extra: None }).unwrap();
        assert_eq!(json, r#"{"loss":"nan","extra":null}"#);
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert!(back.loss.is_nan());
        assert_eq!(back.extra, None);
    }

    #[test]
    fn test_rejects_unknown_literal() {
        assert!(serde_json::from_str::<Sample>(r#"{"loss":"big"}"#).is_err());
    }
}

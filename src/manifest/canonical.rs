//! Canonical byte form of a manifest.
//!
//! Rules: object keys sorted by byte order at every level, no whitespace,
//! strings escaped as JSON, integers in decimal, floats in shortest
//! round-trip form. Non-finite floats are rejected.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use super::{Manifest, ManifestValue};
use crate::error::{ProvenanceError, Result};

/// Deterministic serialization of a [`Manifest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Lowercase hex SHA-256 of the canonical bytes.
    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }
}

pub fn canonicalize(manifest: &Manifest) -> Result<CanonicalBytes> {
    let mut out = Vec::with_capacity(256);
    write_map(&mut out, manifest.entries(), "$")?;
    Ok(CanonicalBytes(out))
}

/// SHA-256 hex digest of the manifest's full canonical bytes.
pub fn digest(manifest: &Manifest) -> Result<String> {
    Ok(canonicalize(manifest)?.sha256_hex())
}

fn write_value(out: &mut Vec<u8>, value: &ManifestValue, path: &str) -> Result<()> {
    match value {
        ManifestValue::Null => out.extend_from_slice(b"null"),
        ManifestValue::Bool(true) => out.extend_from_slice(b"true"),
        ManifestValue::Bool(false) => out.extend_from_slice(b"false"),
        ManifestValue::Int(i) => out.extend_from_slice(i.to_string().as_bytes()),
        ManifestValue::UInt(u) => out.extend_from_slice(u.to_string().as_bytes()),
        ManifestValue::Float(f) => write_float(out, *f, path)?,
        ManifestValue::String(s) => write_string(out, s, path)?,
        ManifestValue::List(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item, &format!("{path}[{i}]"))?;
            }
            out.push(b']');
        }
        ManifestValue::Map(map) => write_map(out, map, path)?,
    }
    Ok(())
}

fn write_map(out: &mut Vec<u8>, map: &BTreeMap<String, ManifestValue>, path: &str) -> Result<()> {
    out.push(b'{');
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        write_string(out, key, path)?;
        out.push(b':');
        write_value(out, value, &format!("{path}.{key}"))?;
    }
    out.push(b'}');
    Ok(())
}

fn write_string(out: &mut Vec<u8>, s: &str, path: &str) -> Result<()> {
    serde_json::to_writer(&mut *out, s).map_err(|e| ProvenanceError::UnserializableValue {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

fn write_float(out: &mut Vec<u8>, f: f64, path: &str) -> Result<()> {
    let number = serde_json::Number::from_f64(f).ok_or_else(|| ProvenanceError::UnserializableValue {
        path: path.to_string(),
        reason: format!("non-finite number {f}"),
    })?;
    out.extend_from_slice(number.to_string().as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(value: serde_json::Value) -> Manifest {
        Manifest::try_from(value).unwrap()
    }

    #[test]
    fn test_keys_sorted_without_whitespace() {
        let m = manifest(json!({"risk": "low", "goal": "build-x"}));
        let bytes = canonicalize(&m).unwrap();
        assert_eq!(bytes.as_bytes(), br#"{"goal":"build-x","risk":"low"}"#);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut a = Manifest::new();
        a.insert("z", 1i64);
        a.insert("a", "first");
        a.insert("m", ManifestValue::List(vec![ManifestValue::Null, true.into()]));

        let mut b = Manifest::new();
        b.insert("m", ManifestValue::List(vec![ManifestValue::Null, true.into()]));
        b.insert("a", "first");
        b.insert("z", 1i64);

        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());
    }

    #[test]
    fn test_nested_maps_sorted() {
        let m = manifest(json!({
            "outer": {"b": {"y": 2, "x": 1}, "a": [ {"q": 1, "p": 0} ]}
        }));
        assert_eq!(
            m.to_canonical_string().unwrap(),
            r#"{"outer":{"a":[{"p":0,"q":1}],"b":{"x":1,"y":2}}}"#
        );
    }

    #[test]
    fn test_repeated_calls_are_stable() {
        let m = manifest(json!({"goal": "build-x", "budget": 12.75, "tags": ["α", "β"]}));
        let first = canonicalize(&m).unwrap();
        for _ in 0..10 {
            assert_eq!(canonicalize(&m).unwrap(), first);
        }
    }

    #[test]
    fn test_number_formatting() {
        let m = manifest(json!({"f": 1.5, "i": -42, "whole": 2.0, "big": 1e300}));
        assert_eq!(
            m.to_canonical_string().unwrap(),
            r#"{"big":1e300,"f":1.5,"i":-42,"whole":2.0}"#
        );
    }

    #[test]
    fn test_string_escaping() {
        let m = manifest(json!({"s": "line\n\"quoted\"\ttab"}));
        assert_eq!(
            m.to_canonical_string().unwrap(),
            r#"{"s":"line\n\"quoted\"\ttab"}"#
        );
    }

    #[test]
    fn test_nan_rejected_with_path() {
        let mut inner = BTreeMap::new();
        inner.insert("score".to_string(), ManifestValue::Float(f64::NAN));
        let mut m = Manifest::new();
        m.insert("metrics", ManifestValue::Map(inner));

        match canonicalize(&m) {
            Err(ProvenanceError::UnserializableValue { path, .. }) => {
                assert_eq!(path, "$.metrics.score");
            }
            other => panic!("expected UnserializableValue, got {other:?}"),
        }
    }

    #[test]
    fn test_infinity_rejected_in_list() {
        let mut m = Manifest::new();
        m.insert("xs", ManifestValue::List(vec![1.0.into(), f64::INFINITY.into()]));
        match canonicalize(&m) {
            Err(ProvenanceError::UnserializableValue { path, .. }) => assert_eq!(path, "$.xs[1]"),
            other => panic!("expected UnserializableValue, got {other:?}"),
        }
    }

    #[test]
    fn test_digest_matches_sha256_of_canonical_form() {
        let m = manifest(json!({"goal": "build-x", "risk": "low"}));
        let expected = hex::encode(Sha256::digest(br#"{"goal":"build-x","risk":"low"}"#));
        assert_eq!(digest(&m).unwrap(), expected);
    }

    #[test]
    fn test_digest_covers_every_top_level_key() {
        let released = manifest(json!({"goal": "build-x", "version": "1.0.0"}));
        let bumped = manifest(json!({"goal": "build-x", "version": "9.9.9"}));
        assert_ne!(digest(&released).unwrap(), digest(&bumped).unwrap());
        assert_eq!(
            digest(&released).unwrap(),
            canonicalize(&released).unwrap().sha256_hex()
        );
    }

    #[test]
    fn test_canonical_text_reparses_to_same_bytes() {
        let m = manifest(json!({"a": [1, 2.5, null, {"k": "v"}], "u": u64::MAX}));
        let text = m.to_canonical_string().unwrap();
        let again = Manifest::from_json_str(&text).unwrap();
        assert_eq!(canonicalize(&again).unwrap().as_bytes(), text.as_bytes());
    }
}

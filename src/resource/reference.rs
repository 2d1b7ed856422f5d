//! Cross-references between resources are written as placeholders inside of a descriptor's
//! config, using the form `${<resource>.<output>}`. For example, `${cacheSubnetGroup.id}` refers
//! to the `id` output of the `cacheSubnetGroup` resource, which only becomes known once that
//! resource has been applied. The output may be a dotted path into nested outputs.
//!
//! If a string consists of _only_ a placeholder, then the resolved value replaces the whole
//! string, keeping its json type. Placeholders that are embedded in a longer string are
//! interpolated as text.
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use std::fmt::{self, Display};

lazy_static! {
    static ref PLACEHOLDER_REGEX: Regex =
        Regex::new(r"\$\{([A-Za-z][A-Za-z0-9_-]*)\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\}").unwrap();
}

/// A reference to a named output of another resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub resource: String,
    pub output: String,
}

impl OutputRef {
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> OutputRef {
        OutputRef {
            resource: resource.into(),
            output: output.into(),
        }
    }

    /// Renders the placeholder string that can be embedded in a descriptor config
    pub fn placeholder(&self) -> String {
        format!("${{{}.{}}}", self.resource, self.output)
    }

    /// Parses a string that consists of exactly one placeholder
    pub fn parse(value: &str) -> Option<OutputRef> {
        let captures = PLACEHOLDER_REGEX.captures(value)?;
        let whole = captures.get(0)?;
        if whole.start() == 0 && whole.end() == value.len() {
            Some(OutputRef::new(&captures[1], &captures[2]))
        } else {
            None
        }
    }

    /// Returns every placeholder embedded anywhere in the given string
    pub fn find_all(value: &str) -> Vec<OutputRef> {
        PLACEHOLDER_REGEX
            .captures_iter(value)
            .map(|c| OutputRef::new(&c[1], &c[2]))
            .collect()
    }
}

impl Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.output)
    }
}

/// Walks the json value and returns all the placeholders in document order
pub fn collect_references(value: &Value) -> Vec<OutputRef> {
    let mut refs = Vec::new();
    collect(value, &mut refs);
    refs
}

fn collect(value: &Value, refs: &mut Vec<OutputRef>) {
    match value {
        Value::String(s) => refs.extend(OutputRef::find_all(s)),
        Value::Array(items) => {
            for item in items {
                collect(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, refs);
            }
        }
        _ => {}
    }
}

/// Returns a copy of `value` with every placeholder replaced by the value returned from `lookup`.
/// Stops at the first error returned from the lookup.
pub(crate) fn substitute<F, E>(value: &Value, lookup: &mut F) -> Result<Value, E>
where
    F: FnMut(&OutputRef) -> Result<Value, E>,
{
    match value {
        Value::String(s) => substitute_str(s, lookup),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(substitute(item, lookup)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), substitute(item, lookup)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str<F, E>(s: &str, lookup: &mut F) -> Result<Value, E>
where
    F: FnMut(&OutputRef) -> Result<Value, E>,
{
    if let Some(reference) = OutputRef::parse(s) {
        return lookup(&reference);
    }

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;
    for captures in PLACEHOLDER_REGEX.captures_iter(s) {
        let whole = match captures.get(0) {
            Some(m) => m,
            None => continue,
        };
        result.push_str(&s[last_end..whole.start()]);
        let value = lookup(&OutputRef::new(&captures[1], &captures[2]))?;
        match value {
            Value::String(ref text) => result.push_str(text),
            ref other => result.push_str(&other.to_string()),
        }
        last_end = whole.end();
    }
    result.push_str(&s[last_end..]);
    Ok(Value::String(result))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholder_round_trips_through_parse() {
        let reference = OutputRef::new("cacheSubnetGroup", "id");
        assert_eq!("${cacheSubnetGroup.id}", reference.placeholder());
        assert_eq!(Some(reference.clone()), OutputRef::parse(&reference.placeholder()));
    }

    #[test]
    fn parse_rejects_embedded_placeholders() {
        assert_eq!(None, OutputRef::parse("redis://${cache.address}"));
        assert_eq!(None, OutputRef::parse("${cache}"));
        assert_eq!(None, OutputRef::parse("no placeholders here"));
    }

    #[test]
    fn nested_output_paths_are_kept_dotted() {
        let reference = OutputRef::parse("${cluster.network.vpcId}").unwrap();
        assert_eq!("cluster", reference.resource);
        assert_eq!("network.vpcId", reference.output);
    }

    #[test]
    fn references_are_collected_in_document_order() {
        let config = json!({
            "subnetGroupRef": "${cacheSubnetGroup.id}",
            "securityGroupRefs": ["${cacheSecurityGroup.id}"],
            "endpoint": "${cache.address}:${cache.port}",
            "port": 6379,
        });
        let mut refs = collect_references(&config);
        refs.sort();
        assert_eq!(
            vec![
                OutputRef::new("cache", "address"),
                OutputRef::new("cache", "port"),
                OutputRef::new("cacheSecurityGroup", "id"),
                OutputRef::new("cacheSubnetGroup", "id"),
            ],
            refs
        );
    }

    #[test]
    fn whole_placeholders_keep_their_json_type_and_embedded_ones_are_interpolated() {
        let config = json!({
            "subnetIds": "${cluster.privateSubnetIds}",
            "endpoint": "${cache.address}:${cache.port}",
            "untouched": true,
        });
        let mut lookup = |r: &OutputRef| -> Result<Value, ()> {
            match (r.resource.as_str(), r.output.as_str()) {
                ("cluster", "privateSubnetIds") => Ok(json!(["subnet-a", "subnet-b"])),
                ("cache", "address") => Ok(json!("cache.local")),
                ("cache", "port") => Ok(json!(6379)),
                _ => Err(()),
            }
        };
        let resolved = substitute(&config, &mut lookup).expect("failed to substitute");
        assert_eq!(
            json!({
                "subnetIds": ["subnet-a", "subnet-b"],
                "endpoint": "cache.local:6379",
                "untouched": true,
            }),
            resolved
        );
    }
}

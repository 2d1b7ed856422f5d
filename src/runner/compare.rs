use crate::resource::JsonObject;

use serde_json::Value;

use std::fmt::{self, Display, Write};

#[derive(Debug, PartialEq)]
pub struct Diff<'a> {
    /// json pointer to the differing value
    pub path: String,
    pub observed: &'a Value,
    pub desired: &'a Value,
}

impl<'a> Display for Diff<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Diff at path: '{}', observed: {}, desired: {}",
            self.path, self.observed, self.desired
        )
    }
}

pub struct Diffs<'a>(Vec<Diff<'a>>);
impl<'a> Diffs<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.0.iter().map(|d| d.path.as_str()).collect()
    }
}

impl<'a> Display for Diffs<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<empty>")
        } else {
            write!(f, "{} differences: ", self.0.len())?;
            for (i, diff) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                Display::fmt(diff, f)?;
            }
            Ok(())
        }
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// compares the config observed on the remote control plane with the desired config of a
/// resource. Remote systems typically fill in defaults and computed fields, so object keys that
/// are only present in `observed` are never reported, but values from `desired` that are
/// missing or different in `observed` will show up in the diff.
///
/// Arrays are different, since removing an item from a desired array must change the remote
/// resource. Arrays of objects that all have a `name` string field (container lists, environment
/// variables) are compared as "associative arrays", which means that items are matched up by
/// name instead of by position, and observed items whose name is not desired are reported at
/// their observed index. All other arrays are compared element by element, in order, and any
/// extra observed elements are reported.
pub fn compare_values<'a>(observed: &'a Value, desired: &'a Value) -> Diffs<'a> {
    let mut diffs = Vec::new();
    let mut path = Vec::with_capacity(8);
    compare(&mut diffs, &mut path, observed, desired);
    Diffs(diffs)
}

fn compare<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    superset: &'a Value,
    subset: &'a Value,
) {
    match (superset, subset) {
        (Value::Object(ref super_map), Value::Object(ref sub_map)) => {
            compare_objects(diffs, path, super_map, sub_map);
        }
        (Value::Array(ref super_array), Value::Array(ref sub_array)) => {
            compare_arrays(diffs, path, super_array, sub_array);
        }
        (a, b) if a != b => {
            diffs.push(diff(&*path, a, b));
        }
        _ => {}
    }
}

fn compare_objects<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    observed: &'a JsonObject,
    desired: &'a JsonObject,
) {
    for (key, desired_val) in desired.iter() {
        path.push(Segment::Key(key));
        match observed.get(key) {
            Some(observed_val) => compare(diffs, path, observed_val, desired_val),
            None => diffs.push(diff(&*path, &Value::Null, desired_val)),
        }
        path.pop();
    }
}

fn compare_arrays<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    observed: &'a [Value],
    desired: &'a [Value],
) {
    if is_associative(desired) {
        compare_associative_arrays(diffs, path, observed, desired);
        return;
    }
    for (i, desired_item) in desired.iter().enumerate() {
        path.push(Segment::Index(i));
        match observed.get(i) {
            Some(item) => compare(diffs, path, item, desired_item),
            None => diffs.push(diff(&*path, &Value::Null, desired_item)),
        }
        path.pop();
    }
    for (i, observed_item) in observed.iter().enumerate().skip(desired.len()) {
        path.push(Segment::Index(i));
        diffs.push(diff(&*path, observed_item, &Value::Null));
        path.pop();
    }
}

fn compare_associative_arrays<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    observed: &'a [Value],
    desired: &'a [Value],
) {
    for (i, desired_item) in desired.iter().enumerate() {
        path.push(Segment::Index(i));
        let observed_item = observed
            .iter()
            .find(|o| item_name(o).is_some() && item_name(o) == item_name(desired_item));
        match observed_item {
            Some(item) => compare(diffs, path, item, desired_item),
            None => diffs.push(diff(&*path, &Value::Null, desired_item)),
        }
        path.pop();
    }
    for (i, observed_item) in observed.iter().enumerate() {
        let still_desired = item_name(observed_item)
            .map(|name| desired.iter().any(|d| item_name(d) == Some(name)))
            .unwrap_or(false);
        if !still_desired {
            path.push(Segment::Index(i));
            diffs.push(diff(&*path, observed_item, &Value::Null));
            path.pop();
        }
    }
}

fn item_name(value: &Value) -> Option<&str> {
    value.get("name").and_then(Value::as_str)
}

fn is_associative(desired: &[Value]) -> bool {
    !desired.is_empty() && desired.iter().all(|v| v.is_object() && item_name(v).is_some())
}

fn diff<'a>(path: &[Segment], observed: &'a Value, desired: &'a Value) -> Diff<'a> {
    let mut p = String::with_capacity(8);
    for s in path.iter() {
        p.push('/');
        match s {
            Segment::Key(ref k) => p.push_str(k),
            Segment::Index(i) => {
                let _ = write!(p, "{}", i);
            }
        }
    }
    Diff {
        path: p,
        observed,
        desired,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn fields_only_present_remotely_are_ignored() {
        let observed = json!({
            "clusterName": "nn-kube-cluster",
            "version": "1.24",
            "endpoint": "https://cluster.local",
            "arn": "arn:cluster",
        });
        let desired = json!({
            "clusterName": "nn-kube-cluster",
            "version": "1.24",
        });
        assert!(compare_values(&observed, &desired).is_empty());
    }

    #[test]
    fn returns_diffs_from_objects() {
        let observed = json!({
            "capacity": { "desiredSize": 2, "maxSize": 4 },
            "amiType": "AL2_X86_64",
        });
        let desired = json!({
            "capacity": { "desiredSize": 3, "maxSize": 4 },
            "diskSize": 20,
        });
        let diffs = compare_values(&observed, &desired);
        assert_eq!(vec!["/capacity/desiredSize", "/diskSize"], diffs.paths());
    }

    #[test]
    fn containers_are_matched_by_name_regardless_of_order() {
        let observed = json!({
            "containers": [
                { "name": "noticeninja-api", "image": "api:1", "containerPort": 3002 },
                { "name": "noticeninja-auth", "image": "auth:1", "containerPort": 3001 },
            ]
        });
        let desired = json!({
            "containers": [
                { "name": "noticeninja-auth", "image": "auth:2", "containerPort": 3001 },
                { "name": "noticeninja-api", "image": "api:1", "containerPort": 3002 },
                { "name": "noticeninja-web", "image": "web:1", "containerPort": 3003 },
            ]
        });
        let diffs = compare_values(&observed, &desired);
        assert_eq!(vec!["/containers/0/image", "/containers/2"], diffs.paths());
    }

    #[test]
    fn removed_containers_are_reported() {
        let observed = json!({
            "containers": [
                { "name": "noticeninja-auth", "image": "auth:1", "containerPort": 3001 },
                { "name": "noticeninja-api", "image": "api:1", "containerPort": 3002 },
            ]
        });
        let desired = json!({
            "containers": [
                { "name": "noticeninja-auth", "image": "auth:1", "containerPort": 3001 },
            ]
        });
        let diffs = compare_values(&observed, &desired);
        assert_eq!(vec!["/containers/1"], diffs.paths());
    }

    #[test]
    fn removed_env_vars_are_reported() {
        let observed = json!({
            "containers": [{
                "name": "noticeninja-api",
                "env": [{ "name": "CACHE_ENDPOINT", "value": "cache.local:6379" }],
            }]
        });
        let desired = json!({
            "containers": [{ "name": "noticeninja-api" }]
        });
        assert!(compare_values(&observed, &desired).is_empty());

        let desired = json!({
            "containers": [{ "name": "noticeninja-api", "env": [] }]
        });
        let diffs = compare_values(&observed, &desired);
        assert_eq!(vec!["/containers/0/env/0"], diffs.paths());
    }

    #[test]
    fn shorter_plain_arrays_are_reported() {
        let observed = json!({ "securityGroupRefs": ["sg-1", "sg-2"] });
        let desired = json!({ "securityGroupRefs": ["sg-1"] });
        let diffs = compare_values(&observed, &desired);
        assert_eq!(vec!["/securityGroupRefs/1"], diffs.paths());
    }

    #[test]
    fn plain_arrays_are_compared_in_order() {
        let observed = json!({ "securityGroupRefs": ["sg-1", "sg-2"] });
        let desired = json!({ "securityGroupRefs": ["sg-2", "sg-1"] });
        assert_eq!(2, compare_values(&observed, &desired).len());
    }
}

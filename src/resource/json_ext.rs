use serde_json::Value;

/// Path lookups into the json outputs reported by the remote control plane
pub trait OutputJson {
    /// Looks up a nested value by a dotted path such as `network.subnets.0`. An empty path
    /// returns the value itself.
    fn get_path(&self, dotted_path: &str) -> Option<&Value>;
}

/// converts `a.b.0` into the json pointer `/a/b/0`
pub fn dotted_to_pointer(dotted_path: &str) -> String {
    let mut pointer = String::with_capacity(dotted_path.len() + 1);
    for segment in dotted_path.split('.') {
        pointer.push('/');
        pointer.push_str(&segment.replace('~', "~0").replace('/', "~1"));
    }
    pointer
}

impl OutputJson for Value {
    fn get_path(&self, dotted_path: &str) -> Option<&Value> {
        if dotted_path.is_empty() {
            return Some(self);
        }
        self.pointer(&dotted_to_pointer(dotted_path))
    }
}

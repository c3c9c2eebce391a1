use std::collections::HashMap;

use parking_lot::RwLock;

/// Static client-identity -> allowed-upstreams allow-list.
///
/// Built at startup via [`Authorizer::register`] and read on every
/// accepted connection via [`Authorizer::lookup`]. An identity with no
/// registration yields an empty list, which the server layer treats as
/// a reject.
pub struct Authorizer {
    allowed: RwLock<HashMap<String, Vec<String>>>,
}

impl Authorizer {
    pub fn new() -> Self {
        Authorizer {
            allowed: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces any prior registration for `identity`.
    pub fn register(&self, identity: &str, upstreams: Vec<String>) {
        self.allowed.write().insert(identity.to_owned(), upstreams);
    }

    /// Returns the upstreams permitted for `identity`, or an empty
    /// vector if the identity is unknown.
    pub fn lookup(&self, identity: &str) -> Vec<String> {
        self.allowed
            .read()
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Authorizer {
    fn default() -> Self {
        Self::new()
    }
}

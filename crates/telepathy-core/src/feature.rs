//! Feature identifiers naming units of optional proxy readiness.

use std::collections::BTreeSet;
use std::fmt;

/// Opaque `(class, id)` pair naming an optional piece of proxy state.
///
/// Features are declared as constants next to the proxy type that owns them.
/// The default value is "not set" and compares unequal to every declared feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Feature {
    class: &'static str,
    id: u32,
}

/// Ordered set of features; ordering keeps error reporting deterministic.
pub type Features = BTreeSet<Feature>;

impl Feature {
    pub const fn new(class: &'static str, id: u32) -> Self {
        Self { class, id }
    }

    pub fn class(&self) -> &'static str {
        self.class
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_set(&self) -> bool {
        !self.class.is_empty()
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "{}#{}", self.class, self.id)
        } else {
            f.write_str("<unset>")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const A: Feature = Feature::new("Channel", 0);
    const B: Feature = Feature::new("Channel", 1);
    const C: Feature = Feature::new("CallChannel", 0);

    #[test]
    fn equality_uses_class_and_id() {
        assert_eq!(A, Feature::new("Channel", 0));
        assert_ne!(A, B);
        assert_ne!(A, C);

        let set: HashSet<Feature> = [A, B, C, Feature::new("Channel", 0)].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn default_feature_is_unset() {
        let unset = Feature::default();
        assert!(!unset.is_set());
        assert!(A.is_set());
        assert_ne!(unset, A);
        assert_eq!(unset.to_string(), "<unset>");
        assert_eq!(C.to_string(), "CallChannel#0");
    }
}

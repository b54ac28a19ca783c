//! Grouping policies: how item ids map to group keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::types::GroupKey;

/// Separator between path, class and function parts of an item id.
pub const SCOPE_SEPARATOR: &str = "::";

/// Separator introducing a group label at the end of an item id.
pub const LABEL_SEPARATOR: char = '@';

/// Phase of items carrying no `@` marker.
pub const DEFAULT_PHASE: &str = "default";

/// Caller-supplied grouping. `None` defers to the scheduler's default.
pub type GroupOverride = Arc<dyn Fn(&str) -> Option<GroupKey> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    /// Every item is its own group.
    Identity,
    /// Everything before the last `::`.
    Scope,
    /// Everything before the first `::`.
    File,
    /// Text after the last `@`, or the whole id without a label.
    Label,
    /// Text after the last `@`, or [`DEFAULT_PHASE`] without a marker.
    Phase,
}

impl Grouping {
    pub fn key_for(&self, id: &str) -> GroupKey {
        match self {
            Grouping::Identity => id.to_string(),
            Grouping::Scope => scope_of(id).to_string(),
            Grouping::File => id.split_once(SCOPE_SEPARATOR).map_or(id, |(file, _)| file).to_string(),
            Grouping::Label => id
                .rsplit_once(LABEL_SEPARATOR)
                .map_or(id, |(_, label)| label)
                .to_string(),
            Grouping::Phase => id
                .rsplit_once(LABEL_SEPARATOR)
                .map_or(DEFAULT_PHASE, |(_, marker)| marker)
                .to_string(),
        }
    }
}

/// Scope of an item id: everything before the last `::`.
pub fn scope_of(id: &str) -> &str {
    id.rsplit_once(SCOPE_SEPARATOR).map_or(id, |(scope, _)| scope)
}

/// A default grouping plus an optional override consulted first.
#[derive(Clone)]
pub struct GroupResolver {
    default: Grouping,
    custom: Option<GroupOverride>,
}

impl GroupResolver {
    pub fn new(default: Grouping) -> Self {
        Self {
            default,
            custom: None,
        }
    }

    pub fn with_override(mut self, custom: GroupOverride) -> Self {
        self.custom = Some(custom);
        self
    }

    pub fn has_override(&self) -> bool {
        self.custom.is_some()
    }

    pub fn resolve(&self, id: &str) -> GroupKey {
        self.custom
            .as_ref()
            .and_then(|custom| custom(id))
            .unwrap_or_else(|| self.default.key_for(id))
    }
}

impl fmt::Debug for GroupResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupResolver")
            .field("default", &self.default)
            .field("custom", &self.custom.as_ref().map(|_| "<function>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_groupings() {
        let id = "pkg/test_db.py::TestDb::test_insert";
        assert_eq!(Grouping::Identity.key_for(id), id);
        assert_eq!(Grouping::Scope.key_for(id), "pkg/test_db.py::TestDb");
        assert_eq!(Grouping::File.key_for(id), "pkg/test_db.py");
        assert_eq!(Grouping::Scope.key_for("test_a.py::test_x"), "test_a.py");
        assert_eq!(Grouping::Scope.key_for("bare"), "bare");
    }

    #[test]
    fn test_label_grouping() {
        assert_eq!(Grouping::Label.key_for("a.py::test_one@db"), "db");
        assert_eq!(Grouping::Label.key_for("a.py::test_two"), "a.py::test_two");
        assert_eq!(Grouping::Phase.key_for("a.py::test_one@low"), "low");
        assert_eq!(Grouping::Phase.key_for("a.py::test_two"), DEFAULT_PHASE);
    }

    #[test]
    fn test_override_falls_back() {
        let resolver = GroupResolver::new(Grouping::File).with_override(Arc::new(|id: &str| {
            id.contains("slow").then(|| "slow".to_string())
        }));
        assert_eq!(resolver.resolve("a.py::test_slow_io"), "slow");
        assert_eq!(resolver.resolve("a.py::test_fast"), "a.py");
        assert!(format!("{:?}", resolver).contains("<function>"));
    }
}

//! The three data shapes written every cycle.

use serde::Serialize;

/// Kind of write a cycle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTarget {
    /// Standalone key `<prefix>:key:<cycle>`.
    Key,
    /// Field `<cycle>` of the hash key.
    HashField,
    /// Member `<cycle>` of the sorted set, scored `<cycle>`.
    SortedSetMember,
}

impl ProbeTarget {
    pub const ALL: [ProbeTarget; 3] = [
        ProbeTarget::Key,
        ProbeTarget::HashField,
        ProbeTarget::SortedSetMember,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeTarget::Key => "key",
            ProbeTarget::HashField => "hash_field",
            ProbeTarget::SortedSetMember => "sorted_set_member",
        }
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

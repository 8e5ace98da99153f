// Author: Lukas Bower
// Purpose: Static engine configuration covering affinity and RAM granularity.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Static configuration handed to the engine by the host at startup. The
//! launcher and its configuration file format are out of scope; hosts build
//! this structure directly or deserialize it from a JSON node.

use amber_wire::AffinityLocation;
use serde::Deserialize;

/// Top-level affinity space available to monitored children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AffinitySpace {
    /// Horizontal origin of the space.
    #[serde(default)]
    pub xpos: i32,
    /// Vertical origin of the space.
    #[serde(default)]
    pub ypos: i32,
    /// Width of the space.
    #[serde(default)]
    pub width: u32,
    /// Height of the space.
    #[serde(default)]
    pub height: u32,
}

/// Per-child affinity assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChildAffinity {
    /// Child label the entry applies to.
    pub name: String,
    /// Horizontal position assigned to the child's threads.
    #[serde(default)]
    pub xpos: i32,
    /// Vertical position assigned to the child's threads.
    #[serde(default)]
    pub ypos: i32,
}

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional top-level affinity space.
    #[serde(default)]
    pub affinity: Option<AffinitySpace>,
    /// Per-child affinity assignments.
    #[serde(default)]
    pub children: Vec<ChildAffinity>,
    /// Sub-dataspace granularity for managed RAM dataspaces, in bytes.
    /// Zero disables the incremental checkpoint mechanism.
    #[serde(default)]
    pub granularity: u64,
}

impl Config {
    /// Affinity location seeded into threads of the named child. Children
    /// without a configuration entry run at the default location.
    #[must_use]
    pub fn child_affinity(&self, name: &str) -> AffinityLocation {
        self.children
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| AffinityLocation::new(entry.xpos, entry.ypos, 1, 1))
            .unwrap_or_default()
    }

    /// Affinity parameters of the whole session space.
    #[must_use]
    pub fn session_affinity(&self) -> AffinityLocation {
        self.affinity
            .map(|space| AffinityLocation::new(space.xpos, space.ypos, space.width, space.height))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_attributes_default_to_zero() {
        let config: Config = serde_json::from_str(
            r#"{ "children": [ { "name": "sheep_counter", "xpos": 1 } ] }"#,
        )
        .expect("parse");
        assert_eq!(
            config.child_affinity("sheep_counter"),
            AffinityLocation::new(1, 0, 1, 1)
        );
        assert_eq!(config.session_affinity(), AffinityLocation::default());
        assert_eq!(config.granularity, 0);
    }

    #[test]
    fn unknown_child_gets_default_location() {
        let config = Config::default();
        assert_eq!(config.child_affinity("ghost"), AffinityLocation::default());
    }

    #[test]
    fn top_level_affinity_space_parses() {
        let config: Config = serde_json::from_str(
            r#"{ "affinity": { "xpos": 0, "ypos": 0, "width": 2, "height": 1 } }"#,
        )
        .expect("parse");
        assert_eq!(
            config.session_affinity(),
            AffinityLocation::new(0, 0, 2, 1)
        );
    }
}

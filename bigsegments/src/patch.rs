use serde::{Deserialize, Serialize};

/// One versioned change to a big segment's membership. Patches form a chain:
/// a patch applies only when its `previous_version` equals the cursor the
/// store currently holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BigSegmentPatch {
    pub environment_id: String,
    pub segment_id: String,
    pub version: String,
    pub previous_version: String,
    pub changes: PatchChanges,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchChanges {
    #[serde(default)]
    pub included: MembershipChanges,
    #[serde(default)]
    pub excluded: MembershipChanges,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChanges {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Fluent construction, mostly for tests and fixtures.
pub struct PatchBuilder {
    patch: BigSegmentPatch,
}

impl PatchBuilder {
    pub fn new(segment_id: &str, version: &str, previous_version: &str) -> Self {
        Self {
            patch: BigSegmentPatch {
                environment_id: String::new(),
                segment_id: segment_id.to_string(),
                version: version.to_string(),
                previous_version: previous_version.to_string(),
                changes: PatchChanges::default(),
            },
        }
    }

    pub fn environment_id(mut self, environment_id: &str) -> Self {
        self.patch.environment_id = environment_id.to_string();
        self
    }

    pub fn add_includes<const N: usize>(mut self, keys: [&str; N]) -> Self {
        self.patch
            .changes
            .included
            .add
            .extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn remove_includes<const N: usize>(mut self, keys: [&str; N]) -> Self {
        self.patch
            .changes
            .included
            .remove
            .extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn add_excludes<const N: usize>(mut self, keys: [&str; N]) -> Self {
        self.patch
            .changes
            .excluded
            .add
            .extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn remove_excludes<const N: usize>(mut self, keys: [&str; N]) -> Self {
        self.patch
            .changes
            .excluded
            .remove
            .extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn build(self) -> BigSegmentPatch {
        self.patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_uses_camel_case() {
        let patch = PatchBuilder::new("segment.g1", "2", "1")
            .environment_id("env-xyz")
            .add_includes(["u1"])
            .remove_excludes(["u2"])
            .build();

        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["segmentId"], "segment.g1");
        assert_eq!(json["previousVersion"], "1");
        assert_eq!(json["changes"]["included"]["add"][0], "u1");
        assert_eq!(json["changes"]["excluded"]["remove"][0], "u2");

        let parsed: BigSegmentPatch = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, patch);
    }

    #[test]
    fn missing_change_lists_default_to_empty() {
        let parsed: BigSegmentPatch = serde_json::from_str(
            r#"{"environmentId":"e","segmentId":"s","version":"1","previousVersion":"","changes":{}}"#,
        )
        .unwrap();
        assert!(parsed.changes.included.add.is_empty());
        assert!(parsed.changes.excluded.remove.is_empty());
    }
}

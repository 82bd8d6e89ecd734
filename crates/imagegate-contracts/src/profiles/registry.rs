use indexmap::IndexMap;
use thiserror::Error;

use super::ProviderProfile;

const DEFAULT_PROFILES_JSON: &str = include_str!("../../resources/default_profiles.json");

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("invalid provider profile JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("provider profile has an empty id")]
    EmptyId,
    #[error("unknown provider '{0}'")]
    Unknown(String),
}

/// Read-only set of provider profiles, keyed by lowercase id in insertion
/// order.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: IndexMap<String, ProviderProfile>,
}

impl ProfileRegistry {
    /// Uses the given profiles, or the embedded defaults when `None`.
    pub fn new(profiles: Option<IndexMap<String, ProviderProfile>>) -> Result<Self, ProfileError> {
        match profiles {
            Some(profiles) => Ok(Self { profiles }),
            None => Self::from_json(DEFAULT_PROFILES_JSON),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, ProfileError> {
        let mut registry = Self::empty();
        registry.merge_json(raw)?;
        Ok(registry)
    }

    /// Adds or replaces profiles from a JSON array. Replaced profiles keep
    /// their original position.
    pub fn merge_json(&mut self, raw: &str) -> Result<usize, ProfileError> {
        let rows: Vec<ProviderProfile> = serde_json::from_str(raw)?;
        let count = rows.len();
        for profile in rows {
            self.insert(profile)?;
        }
        Ok(count)
    }

    pub fn insert(&mut self, mut profile: ProviderProfile) -> Result<(), ProfileError> {
        let id = profile.id.trim().to_ascii_lowercase();
        if id.is_empty() {
            return Err(ProfileError::EmptyId);
        }
        profile.id = id.clone();
        self.profiles.insert(id, profile);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ProviderProfile> {
        self.profiles.get(id.trim().to_ascii_lowercase().as_str())
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ProviderProfile> {
        self.profiles.get_mut(id.trim().to_ascii_lowercase().as_str())
    }

    /// Keeps only the named profiles, in the order given.
    pub fn retain_only(&mut self, ids: &[String]) -> Result<(), ProfileError> {
        let mut kept = IndexMap::new();
        for id in ids {
            let key = id.trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }
            let Some(profile) = self.profiles.get(&key) else {
                return Err(ProfileError::Unknown(id.trim().to_string()));
            };
            kept.insert(key, profile.clone());
        }
        self.profiles = kept;
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        let mut names = self.profiles.keys().cloned().collect::<Vec<String>>();
        names.sort();
        names
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ProviderProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::{ProfileError, ProfileRegistry, DEFAULT_PROFILES_JSON};
    use crate::profiles::{AuthScheme, BodyEncoding, LogicalParam, ResponseMode};

    #[test]
    fn embedded_defaults_parse_and_cover_every_response_mode() -> anyhow::Result<()> {
        let registry = ProfileRegistry::from_json(DEFAULT_PROFILES_JSON)?;
        assert_eq!(ProfileRegistry::new(None)?.len(), registry.len());

        let together = registry.get("together").unwrap();
        assert_eq!(together.encoding, BodyEncoding::Json);
        assert_eq!(together.credential_env.as_deref(), Some("TOGETHER_API_KEY"));
        assert!(matches!(together.response, ResponseMode::JsonArray { .. }));

        let getimg = registry.get("getimg").unwrap();
        assert!(matches!(getimg.response, ResponseMode::JsonSingle { .. }));

        let stability = registry.get("stability").unwrap();
        assert_eq!(stability.encoding, BodyEncoding::Multipart);
        assert_eq!(stability.response, ResponseMode::RawBinary);
        assert!(stability.supports(LogicalParam::AspectRatio));

        let segmind = registry.get("segmind").unwrap();
        assert_eq!(
            segmind.auth,
            AuthScheme::Header {
                name: "x-api-key".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn lookups_are_case_insensitive_and_list_is_sorted() {
        let registry = ProfileRegistry::new(None).unwrap();
        assert!(registry.get(" Together ").is_some());
        let names = registry.list();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"huggingface".to_string()));
    }

    #[test]
    fn merge_replaces_existing_profile_in_place() -> anyhow::Result<()> {
        let mut registry = ProfileRegistry::new(None)?;
        let position_before = registry
            .profiles()
            .position(|profile| profile.id == "openai")
            .unwrap();
        let merged = registry.merge_json(
            r#"[{
                "id": "OpenAI",
                "endpoint": "http://localhost:9999/images",
                "auth": {"type": "none"},
                "encoding": "json",
                "params": {"prompt": "prompt"},
                "response": {"mode": "json_single"},
                "error_rule": {"type": "status_code"}
            }]"#,
        )?;
        assert_eq!(merged, 1);
        let openai = registry.get("openai").unwrap();
        assert_eq!(openai.endpoint, "http://localhost:9999/images");
        let position_after = registry
            .profiles()
            .position(|profile| profile.id == "openai")
            .unwrap();
        assert_eq!(position_before, position_after);
        Ok(())
    }

    #[test]
    fn retain_only_rejects_unknown_ids() {
        let mut registry = ProfileRegistry::new(None).unwrap();
        let err = registry
            .retain_only(&["together".to_string(), "midjourney".to_string()])
            .unwrap_err();
        assert!(matches!(err, ProfileError::Unknown(name) if name == "midjourney"));

        registry
            .retain_only(&["stability".to_string(), "together".to_string()])
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry
                .profiles()
                .map(|profile| profile.id.clone())
                .collect::<Vec<String>>(),
            vec!["stability", "together"]
        );
    }

    #[test]
    fn malformed_profiles_are_reported_not_dropped() -> anyhow::Result<()> {
        let err = ProfileRegistry::from_json(r#"[{"id": "together", "endpoint": 7}]"#)
            .unwrap_err();
        assert!(matches!(err, ProfileError::Parse(_)));

        let defaults = ProfileRegistry::new(None)?;
        let mut subset = IndexMap::new();
        let together = defaults.get("together").cloned().unwrap();
        subset.insert(together.id.clone(), together);
        let registry = ProfileRegistry::new(Some(subset))?;
        assert_eq!(registry.list(), vec!["together".to_string()]);
        Ok(())
    }

    #[test]
    fn empty_id_is_rejected() {
        let err = ProfileRegistry::from_json(
            r#"[{"id": " ", "endpoint": "x", "auth": {"type": "none"}, "encoding": "json",
                "params": {}, "response": {"mode": "raw_binary"},
                "error_rule": {"type": "status_code"}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProfileError::EmptyId));
    }
}

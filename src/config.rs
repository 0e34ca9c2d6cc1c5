use crate::error::LoadError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_FAST_ENDPOINT: &str = "https://fast.bentonow.com";
pub const DEFAULT_ADVANCED_ENDPOINT: &str = "https://app.bentonow.com";
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifiers copied verbatim from setup snippets instead of a real site id.
const PLACEHOLDER_SITE_UUIDS: &[&str] = &[
    "YOUR_SITE_UUID",
    "YOUR-SITE-UUID",
    "SITE_UUID",
    "<SITE-UUID>",
    "<SITE_UUID>",
    "XXX",
];

/// How to build the remote script reference. Immutable once handed to `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub site_uuid: String,
    /// Replaces the endpoint origin in both addressing modes.
    #[serde(default)]
    pub custom_src: Option<Url>,
    #[serde(default)]
    pub advanced: bool,
    #[serde(default, with = "timeout_ms")]
    pub timeout: Option<Duration>,
}

impl LoaderConfig {
    pub fn new(site_uuid: impl Into<String>) -> Self {
        Self {
            site_uuid: site_uuid.into(),
            custom_src: None,
            advanced: false,
            timeout: None,
        }
    }

    pub fn with_custom_src(mut self, src: Url) -> Self {
        self.custom_src = Some(src);
        self
    }

    pub fn with_advanced(mut self, advanced: bool) -> Self {
        self.advanced = advanced;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let site_uuid = std::env::var("BENTO_SITE_UUID").context("BENTO_SITE_UUID not set")?;

        let custom_src = std::env::var("BENTO_SCRIPT_SRC")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| Url::parse(v.trim()))
            .transpose()
            .context("failed to parse BENTO_SCRIPT_SRC")?;

        let advanced = std::env::var("BENTO_ADVANCED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let timeout = std::env::var("BENTO_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("failed to parse BENTO_TIMEOUT_MS")?
            .map(Duration::from_millis);

        Ok(Self {
            site_uuid,
            custom_src,
            advanced,
            timeout,
        })
    }

    /// Rejects missing or placeholder site identifiers before anything touches the page.
    pub fn validate(&self) -> Result<(), LoadError> {
        let id = self.site_uuid.trim();
        if id.is_empty() {
            return Err(LoadError::configuration("site uuid is required"));
        }
        if PLACEHOLDER_SITE_UUIDS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(id))
        {
            return Err(LoadError::configuration(format!(
                "site uuid `{id}` is a placeholder; use the uuid from your Bento account"
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(LoadError::configuration(format!(
                "site uuid `{id}` contains `{bad}`; only letters, digits, `-` and `_` are allowed"
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(LoadError::configuration("timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_LOAD_TIMEOUT)
    }

    /// Validates, then builds. Fast mode: `<endpoint>/?site_uuid=<id>`.
    /// Advanced mode: `<endpoint>/<id>.js`.
    pub fn script_url(&self) -> Result<Url, LoadError> {
        self.validate()?;
        let id = self.site_uuid.trim();
        let mut base = match &self.custom_src {
            Some(src) => src.clone(),
            None if self.advanced => parse_static(DEFAULT_ADVANCED_ENDPOINT)?,
            None => parse_static(DEFAULT_FAST_ENDPOINT)?,
        };
        if self.advanced {
            if base.cannot_be_a_base() {
                return Err(LoadError::configuration(format!(
                    "script source {base} cannot take a path"
                )));
            }
            // Pushed as one encoded segment so the id cannot alter host, query or path.
            if let Ok(mut segments) = base.path_segments_mut() {
                segments.pop_if_empty().push(&format!("{id}.js"));
            }
            Ok(base)
        } else {
            base.query_pairs_mut().append_pair("site_uuid", id);
            Ok(base)
        }
    }
}

fn parse_static(raw: &str) -> Result<Url, LoadError> {
    Url::parse(raw).map_err(|err| LoadError::configuration(format!("bad endpoint {raw}: {err}")))
}

mod timeout_ms {
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => {
                let ms = u64::try_from(d.as_millis()).map_err(|_| {
                    S::Error::custom(format!("timeout of {}ms does not fit in u64", d.as_millis()))
                })?;
                s.serialize_some(&ms)
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_placeholder_ids() {
        assert!(matches!(
            LoaderConfig::new("").validate(),
            Err(LoadError::Configuration(_))
        ));
        assert!(matches!(
            LoaderConfig::new("   ").validate(),
            Err(LoadError::Configuration(_))
        ));
        assert!(matches!(
            LoaderConfig::new("your_site_uuid").validate(),
            Err(LoadError::Configuration(_))
        ));
        assert!(LoaderConfig::new("abc").validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let cfg = LoaderConfig::new("abc").with_timeout(Duration::ZERO);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fast_url_carries_site_uuid_query() {
        let url = LoaderConfig::new("abc").script_url().unwrap();
        assert_eq!(url.as_str(), "https://fast.bentonow.com/?site_uuid=abc");
    }

    #[test]
    fn advanced_url_uses_per_site_script() {
        let url = LoaderConfig::new("abc")
            .with_advanced(true)
            .script_url()
            .unwrap();
        assert_eq!(url.as_str(), "https://app.bentonow.com/abc.js");
    }

    #[test]
    fn custom_src_replaces_endpoint() {
        let src = Url::parse("https://cdn.example.com/bento").unwrap();
        let fast = LoaderConfig::new("abc")
            .with_custom_src(src.clone())
            .script_url()
            .unwrap();
        assert_eq!(fast.as_str(), "https://cdn.example.com/bento?site_uuid=abc");
        let advanced = LoaderConfig::new("abc")
            .with_custom_src(src)
            .with_advanced(true)
            .script_url()
            .unwrap();
        assert_eq!(advanced.as_str(), "https://cdn.example.com/bento/abc.js");
    }

    #[test]
    fn hostile_ids_cannot_rewrite_the_advanced_url() {
        for id in ["//evil.example/x", "abc?x=1", "../../other", "abc#frag", "a/b"] {
            let cfg = LoaderConfig::new(id).with_advanced(true);
            assert!(
                matches!(cfg.validate(), Err(LoadError::Configuration(_))),
                "{id} should be rejected"
            );
            assert!(
                matches!(cfg.script_url(), Err(LoadError::Configuration(_))),
                "{id} should not produce a url"
            );
        }
    }

    #[test]
    fn advanced_url_keeps_origin_and_path_prefix() {
        let src = Url::parse("https://cdn.example.com/bento/").unwrap();
        let url = LoaderConfig::new("3f2a-b9_c1")
            .with_custom_src(src)
            .with_advanced(true)
            .script_url()
            .unwrap();
        assert_eq!(url.host_str(), Some("cdn.example.com"));
        assert_eq!(url.as_str(), "https://cdn.example.com/bento/3f2a-b9_c1.js");
    }

    #[test]
    fn oversized_timeout_fails_to_serialize() {
        let cfg = LoaderConfig::new("abc").with_timeout(Duration::MAX);
        assert!(serde_json::to_value(&cfg).is_err());
        let cfg = LoaderConfig::new("abc").with_timeout(Duration::from_millis(1500));
        assert_eq!(serde_json::to_value(&cfg).unwrap()["timeout"], 1500);
    }

    #[test]
    fn timeout_defaults_to_thirty_seconds() {
        assert_eq!(
            LoaderConfig::new("abc").effective_timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(
            LoaderConfig::new("abc")
                .with_timeout(Duration::from_secs(2))
                .effective_timeout(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: LoaderConfig =
            serde_json::from_value(serde_json::json!({"site_uuid": "abc", "timeout": 1500}))
                .unwrap();
        assert!(!cfg.advanced);
        assert_eq!(cfg.custom_src, None);
        assert_eq!(cfg.timeout, Some(Duration::from_millis(1500)));
    }
}

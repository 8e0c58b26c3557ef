use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
///
/// Built with the builder methods below or parsed from a compact
/// connection string, see [`EngineConfig::from_url`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Backend table/topic the realtime channel listens on
    pub topic: String,

    /// Field matched by the search text
    pub name_field: String,

    /// Fields that must be non-empty (after trimming) on create
    pub required_fields: Vec<String>,

    /// Initial page size of the view
    pub default_page_size: usize,

    /// Pending mutations unresolved after this long are rolled back
    #[serde(with = "duration_ms")]
    pub mutation_timeout: Duration,

    /// Secondary aggregate refresh cadence
    #[serde(with = "duration_ms")]
    pub aggregate_stale_after: Duration,

    /// Page size used by the full re-fetch after a reconnect
    pub resync_page_size: usize,

    /// Prefix of temporary ids assigned to optimistic creates
    pub temp_id_prefix: String,
}

impl EngineConfig {
    /// Create a configuration for the given topic
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            name_field: "name".to_string(),
            required_fields: vec!["name".to_string()],
            default_page_size: 10,
            mutation_timeout: Duration::from_secs(30),
            aggregate_stale_after: Duration::from_secs(120), // 2 minutes
            resync_page_size: 500,
            temp_id_prefix: "tmp-".to_string(),
        }
    }

    /// Set the searchable name field (also made the only required field)
    pub fn name_field(mut self, field: &str) -> Self {
        self.name_field = field.to_string();
        self.required_fields = vec![field.to_string()];
        self
    }

    /// Add a required field
    pub fn require(mut self, field: &str) -> Self {
        if !self.required_fields.iter().any(|f| f == field) {
            self.required_fields.push(field.to_string());
        }
        self
    }

    /// Set the initial page size
    pub fn default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    /// Set the pending mutation timeout
    pub fn mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = timeout;
        self
    }

    /// Set the aggregate stale time
    pub fn aggregate_stale_after(mut self, stale_after: Duration) -> Self {
        self.aggregate_stale_after = stale_after;
        self
    }

    /// Set the resync page size
    pub fn resync_page_size(mut self, size: usize) -> Self {
        self.resync_page_size = size;
        self
    }

    /// Set the temporary id prefix
    pub fn temp_id_prefix(mut self, prefix: &str) -> Self {
        self.temp_id_prefix = prefix.to_string();
        self
    }

    /// Parse from connection string
    ///
    /// Format: "livecollection://topic?page_size=25&timeout_ms=5000&stale_ms=60000&name_field=title"
    ///
    /// # Examples
    ///
    /// ```
    /// use livecollection::EngineConfig;
    ///
    /// let config = EngineConfig::from_url("livecollection://categories?page_size=25").unwrap();
    /// assert_eq!(config.topic, "categories");
    /// assert_eq!(config.default_page_size, 25);
    /// ```
    pub fn from_url(url: &str) -> Result<Self, String> {
        if !url.starts_with("livecollection://") {
            return Err("URL must start with 'livecollection://'".to_string());
        }

        let url = &url["livecollection://".len()..];
        let (topic, query) = match url.split_once('?') {
            Some((topic, query)) => (topic, Some(query)),
            None => (url, None),
        };

        if topic.is_empty() {
            return Err("Topic cannot be empty".to_string());
        }

        let mut config = Self::new(topic);

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Invalid parameter '{}'", pair))?;

            match key {
                "page_size" => {
                    config.default_page_size = parse_number(key, value)?;
                }
                "resync_page_size" => {
                    config.resync_page_size = parse_number(key, value)?;
                }
                "timeout_ms" => {
                    config.mutation_timeout = Duration::from_millis(parse_number(key, value)?);
                }
                "stale_ms" => {
                    config.aggregate_stale_after = Duration::from_millis(parse_number(key, value)?);
                }
                "name_field" => {
                    config = config.name_field(value);
                }
                "temp_id_prefix" => {
                    config.temp_id_prefix = value.to_string();
                }
                other => return Err(format!("Unknown parameter '{}'", other)),
            }
        }

        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        format!(
            "livecollection://{}?page_size={}&timeout_ms={}&stale_ms={}&name_field={}",
            self.topic,
            self.default_page_size,
            self.mutation_timeout.as_millis(),
            self.aggregate_stale_after.as_millis(),
            self.name_field
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.topic.is_empty() {
            return Err("Topic cannot be empty".to_string());
        }

        if self.name_field.is_empty() {
            return Err("Name field cannot be empty".to_string());
        }

        if self.default_page_size == 0 {
            return Err("default_page_size must be > 0".to_string());
        }

        if self.resync_page_size == 0 {
            return Err("resync_page_size must be > 0".to_string());
        }

        if self.mutation_timeout.is_zero() {
            return Err("mutation_timeout must be > 0".to_string());
        }

        if self.temp_id_prefix.is_empty() {
            return Err("temp_id_prefix cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("categories")
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value '{}' for '{}'", value, key))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

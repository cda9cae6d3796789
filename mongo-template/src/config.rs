//! Connection and template configuration.
//!
//! Configuration can be built in code with [`MongoConfig::builder`] and
//! [`TemplateConfig::builder`], or loaded from a `mongo-template.toml` file:
//!
//! ```toml
//! [connection]
//! uri = "${MONGODB_URI}"
//! app_name = "billing"
//! max_pool_size = 20
//! connect_timeout_ms = 5000
//! read_preference = "secondary_preferred"
//!
//! [template]
//! database = "billing"
//! best_effort_sessions = false
//! watch_handler_timeout_ms = 5000
//! ```
//!
//! `${VAR}` references are expanded from the environment before parsing.

use std::path::Path;
use std::time::Duration;

use mongodb::options::{Acknowledgment, ClientOptions, SelectionCriteria};
use serde::Deserialize;

use crate::error::{MongoError, MongoResult};

/// Default time a watch handler may run before the dispatcher moves on.
pub const DEFAULT_WATCH_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// MongoDB connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MongoConfig {
    /// MongoDB connection URI.
    pub uri: String,
    /// Application name (shown in server logs).
    pub app_name: Option<String>,
    /// Minimum connection pool size.
    pub min_pool_size: Option<u32>,
    /// Maximum connection pool size.
    pub max_pool_size: Option<u32>,
    /// Maximum idle time for pooled connections, in milliseconds.
    pub max_idle_time_ms: Option<u64>,
    /// Connection timeout, in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Server selection timeout, in milliseconds.
    pub server_selection_timeout_ms: Option<u64>,
    /// Read preference.
    pub read_preference: Option<ReadPreference>,
    /// Write concern.
    pub write_concern: Option<WriteConcern>,
    /// Retry writes.
    pub retry_writes: Option<bool>,
    /// Retry reads.
    pub retry_reads: Option<bool>,
    /// Direct connection (bypass replica set discovery).
    pub direct_connection: Option<bool>,
}

/// MongoDB read preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    /// Read from primary only.
    #[default]
    Primary,
    /// Read from primary preferred, fallback to secondary.
    PrimaryPreferred,
    /// Read from secondary only.
    Secondary,
    /// Read from secondary preferred, fallback to primary.
    SecondaryPreferred,
    /// Read from nearest member.
    Nearest,
}

/// MongoDB write concern.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConcern {
    /// Acknowledge writes from the specified number of nodes.
    W(u32),
    /// Acknowledge writes from majority of nodes.
    Majority,
    /// Custom tag set.
    Custom(String),
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            app_name: Some("mongo-template".to_string()),
            min_pool_size: None,
            max_pool_size: Some(10),
            max_idle_time_ms: Some(300_000),
            connect_timeout_ms: Some(10_000),
            server_selection_timeout_ms: Some(30_000),
            read_preference: Some(ReadPreference::Primary),
            write_concern: None,
            retry_writes: Some(true),
            retry_reads: Some(true),
            direct_connection: None,
        }
    }
}

impl MongoConfig {
    /// Create a new configuration from a MongoDB URI.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Create a builder for configuration.
    pub fn builder() -> MongoConfigBuilder {
        MongoConfigBuilder::new()
    }

    /// Convert to MongoDB ClientOptions.
    pub async fn to_client_options(&self) -> MongoResult<ClientOptions> {
        let mut options = ClientOptions::parse(&self.uri)
            .await
            .map_err(|e| MongoError::config(format!("failed to parse URI: {}", e)))?;

        if let Some(ref app_name) = self.app_name {
            options.app_name = Some(app_name.clone());
        }
        if self.min_pool_size.is_some() {
            options.min_pool_size = self.min_pool_size;
        }
        if self.max_pool_size.is_some() {
            options.max_pool_size = self.max_pool_size;
        }
        if let Some(ms) = self.max_idle_time_ms {
            options.max_idle_time = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.connect_timeout_ms {
            options.connect_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.server_selection_timeout_ms {
            options.server_selection_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(pref) = self.read_preference {
            options.selection_criteria = Some(SelectionCriteria::ReadPreference(
                pref.to_driver(),
            ));
        }
        if let Some(ref wc) = self.write_concern {
            options.write_concern = Some(wc.to_driver());
        }
        if self.retry_writes.is_some() {
            options.retry_writes = self.retry_writes;
        }
        if self.retry_reads.is_some() {
            options.retry_reads = self.retry_reads;
        }
        if self.direct_connection.is_some() {
            options.direct_connection = self.direct_connection;
        }

        Ok(options)
    }
}

impl ReadPreference {
    fn to_driver(self) -> mongodb::options::ReadPreference {
        use mongodb::options::ReadPreference as Driver;

        match self {
            Self::Primary => Driver::Primary,
            Self::PrimaryPreferred => Driver::PrimaryPreferred {
                options: Default::default(),
            },
            Self::Secondary => Driver::Secondary {
                options: Default::default(),
            },
            Self::SecondaryPreferred => Driver::SecondaryPreferred {
                options: Default::default(),
            },
            Self::Nearest => Driver::Nearest {
                options: Default::default(),
            },
        }
    }
}

impl WriteConcern {
    fn to_driver(&self) -> mongodb::options::WriteConcern {
        let w = match self {
            Self::W(n) => Acknowledgment::Nodes(*n),
            Self::Majority => Acknowledgment::Majority,
            Self::Custom(tag) => Acknowledgment::Custom(tag.clone()),
        };
        mongodb::options::WriteConcern::builder().w(w).build()
    }
}

/// Builder for MongoDB configuration.
#[derive(Debug, Default)]
pub struct MongoConfigBuilder {
    config: MongoConfig,
}

impl MongoConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the MongoDB URI.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.config.uri = uri.into();
        self
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = Some(name.into());
        self
    }

    /// Set the minimum pool size.
    pub fn min_pool_size(mut self, size: u32) -> Self {
        self.config.min_pool_size = Some(size);
        self
    }

    /// Set the maximum pool size.
    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.config.max_pool_size = Some(size);
        self
    }

    /// Set the maximum idle time for connections.
    pub fn max_idle_time(mut self, duration: Duration) -> Self {
        self.config.max_idle_time_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Set the server selection timeout.
    pub fn server_selection_timeout(mut self, duration: Duration) -> Self {
        self.config.server_selection_timeout_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Set the read preference.
    pub fn read_preference(mut self, pref: ReadPreference) -> Self {
        self.config.read_preference = Some(pref);
        self
    }

    /// Set the write concern.
    pub fn write_concern(mut self, wc: WriteConcern) -> Self {
        self.config.write_concern = Some(wc);
        self
    }

    /// Enable or disable retry writes.
    pub fn retry_writes(mut self, enabled: bool) -> Self {
        self.config.retry_writes = Some(enabled);
        self
    }

    /// Enable or disable retry reads.
    pub fn retry_reads(mut self, enabled: bool) -> Self {
        self.config.retry_reads = Some(enabled);
        self
    }

    /// Enable direct connection (bypass replica set discovery).
    pub fn direct_connection(mut self, enabled: bool) -> Self {
        self.config.direct_connection = Some(enabled);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> MongoResult<MongoConfig> {
        if self.config.uri.is_empty() {
            return Err(MongoError::config("connection URI is required"));
        }
        Ok(self.config)
    }
}

/// Behaviour of a [`Template`](crate::Template) instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateConfig {
    /// Database used when a record type names none.
    pub database: Option<String>,
    /// Run operations without a session when one cannot be started,
    /// instead of failing them.
    pub best_effort_sessions: bool,
    /// Default watch handler timeout, in milliseconds.
    pub watch_handler_timeout_ms: u64,
    /// Default pause between watch iterations, in milliseconds.
    pub watch_delay_ms: u64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            database: None,
            best_effort_sessions: false,
            watch_handler_timeout_ms: DEFAULT_WATCH_HANDLER_TIMEOUT.as_millis() as u64,
            watch_delay_ms: 0,
        }
    }
}

impl TemplateConfig {
    /// Create a builder for configuration.
    pub fn builder() -> TemplateConfigBuilder {
        TemplateConfigBuilder::default()
    }

    /// Default watch handler timeout.
    pub fn watch_handler_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_handler_timeout_ms)
    }

    /// Default pause between watch iterations.
    pub fn watch_delay(&self) -> Option<Duration> {
        (self.watch_delay_ms > 0).then(|| Duration::from_millis(self.watch_delay_ms))
    }
}

/// Builder for template configuration.
#[derive(Debug, Default)]
pub struct TemplateConfigBuilder {
    config: TemplateConfig,
}

impl TemplateConfigBuilder {
    /// Set the fallback database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// Degrade to session-less execution when a session cannot be started.
    pub fn best_effort_sessions(mut self, enabled: bool) -> Self {
        self.config.best_effort_sessions = enabled;
        self
    }

    /// Set the default watch handler timeout.
    pub fn watch_handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.watch_handler_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the default pause between watch iterations.
    pub fn watch_delay(mut self, delay: Duration) -> Self {
        self.config.watch_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> MongoResult<TemplateConfig> {
        if self.config.watch_handler_timeout_ms == 0 {
            return Err(MongoError::config("watch handler timeout must be positive"));
        }
        if matches!(self.config.database.as_deref(), Some("")) {
            return Err(MongoError::config("database name must not be empty"));
        }
        Ok(self.config)
    }
}

/// Contents of a `mongo-template.toml` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Connection settings.
    pub connection: MongoConfig,
    /// Template settings.
    pub template: TemplateConfig,
}

impl FileConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> MongoResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| MongoError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> MongoResult<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;

        if config.template.watch_handler_timeout_ms == 0 {
            return Err(MongoError::config("watch handler timeout must be positive"));
        }

        Ok(config)
    }
}

/// Expand environment variables in the format `${VAR_NAME}`.
///
/// Unset variables are left untouched.
fn expand_env_vars(content: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("static pattern is valid");

    re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_uri() {
        let config = MongoConfig::from_uri("mongodb://db.internal:27017");
        assert_eq!(config.uri, "mongodb://db.internal:27017");
        assert_eq!(config.max_pool_size, Some(10));
    }

    #[test]
    fn test_config_builder() {
        let config = MongoConfig::builder()
            .uri("mongodb://localhost:27017")
            .app_name("test-app")
            .max_pool_size(20)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        assert_eq!(config.app_name, Some("test-app".to_string()));
        assert_eq!(config.max_pool_size, Some(20));
        assert_eq!(config.connect_timeout_ms, Some(2000));
    }

    #[test]
    fn test_config_builder_rejects_empty_uri() {
        assert!(MongoConfig::builder().uri("").build().is_err());
    }

    #[test]
    fn test_read_preference_default() {
        let pref: ReadPreference = Default::default();
        assert_eq!(pref, ReadPreference::Primary);
    }

    #[test]
    fn test_template_config_defaults() {
        let config = TemplateConfig::default();
        assert!(!config.best_effort_sessions);
        assert_eq!(config.watch_handler_timeout(), Duration::from_secs(5));
        assert_eq!(config.watch_delay(), None);
    }

    #[test]
    fn test_template_config_builder_validation() {
        let err = TemplateConfig::builder()
            .watch_handler_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.is_config_error());

        let config = TemplateConfig::builder()
            .database("app")
            .watch_delay(Duration::from_millis(25))
            .build()
            .unwrap();
        assert_eq!(config.database.as_deref(), Some("app"));
        assert_eq!(config.watch_delay(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_parse_file_config() {
        let config = FileConfig::parse(
            r#"
            [connection]
            uri = "mongodb://replica:27017/?replicaSet=rs0"
            max_pool_size = 4
            read_preference = "secondary_preferred"
            write_concern = "majority"

            [template]
            database = "billing"
            best_effort_sessions = true
            watch_handler_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.max_pool_size, Some(4));
        assert_eq!(
            config.connection.read_preference,
            Some(ReadPreference::SecondaryPreferred)
        );
        assert_eq!(config.connection.write_concern, Some(WriteConcern::Majority));
        assert_eq!(config.template.database.as_deref(), Some("billing"));
        assert!(config.template.best_effort_sessions);
        assert_eq!(
            config.template.watch_handler_timeout(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        let err = FileConfig::parse("[template]\nshards = 3\n").unwrap_err();
        assert!(matches!(err, MongoError::Toml(_)));
    }

    #[test]
    fn test_env_var_expansion() {
        // SAFETY: test-local variable name, not read by other tests.
        unsafe {
            std::env::set_var("MONGO_TEMPLATE_TEST_URI", "mongodb://from-env:27017");
        }

        let expanded = expand_env_vars("uri = \"${MONGO_TEMPLATE_TEST_URI}\" # ${UNSET_TEMPLATE_VAR}");
        assert_eq!(
            expanded,
            "uri = \"mongodb://from-env:27017\" # ${UNSET_TEMPLATE_VAR}"
        );

        unsafe {
            std::env::remove_var("MONGO_TEMPLATE_TEST_URI");
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mongo-template.toml");
        std::fs::write(&path, "[template]\ndatabase = \"files\"\n").unwrap();

        let config = FileConfig::from_file(&path).unwrap();
        assert_eq!(config.template.database.as_deref(), Some("files"));

        let missing = FileConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, MongoError::Io { .. }));
    }
}

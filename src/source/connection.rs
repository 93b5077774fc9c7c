//! Connection descriptors.
//!
//! A descriptor is a `;`-separated list of `key=value` pairs:
//!
//! ```text
//! provider=duckdb;database=/data/sales.duckdb
//! provider=duckdb;server=db01;database=sales;uid=etl;pwd=secret;port=5432
//! ```
//!
//! Keys are case-insensitive. Values may contain `=`; only the first one
//! splits a segment.

use snafu::prelude::*;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{
    ConnectionError, IncompleteCredentialsSnafu, InvalidPortSnafu, MalformedSegmentSnafu,
    SourceError, UnsupportedProviderSnafu,
};

use super::{DuckDbSource, QuerySource};

/// Provider used when the descriptor names none.
pub const DEFAULT_PROVIDER: &str = "duckdb";

/// Parsed connection descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    pub provider: Option<String>,
    pub server: Option<String>,
    pub database: Option<String>,
    pub uid: Option<String>,
    pub pwd: Option<String>,
    pub port: Option<u16>,
    pub sslmode: Option<String>,
    pub trusted_connection: Option<bool>,
}

impl ConnectionParams {
    /// Parse a descriptor.
    ///
    /// Unknown keys are ignored. Giving a user without a password (or the
    /// reverse) is an error; giving both marks the connection as not trusted.
    pub fn parse(descriptor: &str) -> Result<Self, ConnectionError> {
        let mut params = Self::default();

        for segment in descriptor.split(';').map(str::trim) {
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .context(MalformedSegmentSnafu { segment })?;
            let value = value.trim().to_string();

            match key.trim().to_ascii_lowercase().as_str() {
                "provider" => params.provider = Some(value),
                "server" => params.server = Some(value),
                "database" => params.database = Some(value),
                "uid" => params.uid = Some(value),
                "pwd" => params.pwd = Some(value),
                "port" => {
                    let port = value.parse().context(InvalidPortSnafu { value: &value })?;
                    params.port = Some(port);
                }
                "sslmode" => params.sslmode = Some(value),
                "trusted_connection" => params.trusted_connection = Some(parse_flag(&value)),
                _ => {}
            }
        }

        if params.uid.is_some() || params.pwd.is_some() {
            ensure!(
                params.uid.is_some() && params.pwd.is_some(),
                IncompleteCredentialsSnafu
            );
            params.trusted_connection = Some(false);
        }

        Ok(params)
    }

    /// Render the descriptor, including the password.
    ///
    /// Keys appear in a fixed order and absent values are omitted.
    pub fn build(&self) -> String {
        self.render(false)
    }

    /// Provider name, lowercased, falling back to [`DEFAULT_PROVIDER`].
    pub fn provider(&self) -> String {
        self.provider
            .as_deref()
            .unwrap_or(DEFAULT_PROVIDER)
            .to_ascii_lowercase()
    }

    /// Whether the connection relies on the ambient identity instead of
    /// a user and password.
    pub fn is_trusted(&self) -> bool {
        self.trusted_connection.unwrap_or(false)
    }

    fn render(&self, mask_password: bool) -> String {
        let pwd = self
            .pwd
            .as_deref()
            .map(|pwd| if mask_password { "****" } else { pwd });
        let port = self.port.map(|port| port.to_string());
        let trusted = self
            .trusted_connection
            .map(|trusted| if trusted { "yes" } else { "no" });

        [
            ("provider", self.provider.as_deref()),
            ("server", self.server.as_deref()),
            ("database", self.database.as_deref()),
            ("uid", self.uid.as_deref()),
            ("pwd", pwd),
            ("port", port.as_deref()),
            ("sslmode", self.sslmode.as_deref()),
            ("trusted_connection", trusted),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| format!("{key}={value}")))
        .collect::<Vec<_>>()
        .join(";")
    }
}

impl FromStr for ConnectionParams {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Masks the password so descriptors can be logged.
impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "1" | "sspi"
    )
}

/// Create the source for the descriptor's provider. No connection is
/// opened until the first statement runs.
pub fn open_source(params: &ConnectionParams) -> Result<Box<dyn QuerySource>, SourceError> {
    match params.provider().as_str() {
        "duckdb" => {
            let database = params
                .database
                .as_deref()
                .filter(|db| !db.is_empty() && *db != ":memory:")
                .map(PathBuf::from);
            Ok(Box::new(DuckDbSource::new(database)))
        }
        other => UnsupportedProviderSnafu { provider: other }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_keys() {
        let params = ConnectionParams::parse(
            "Provider=duckdb;SERVER=db01;database=sales;uid=etl;pwd=a=b;port=5432;sslmode=require",
        )
        .unwrap();

        assert_eq!(params.provider.as_deref(), Some("duckdb"));
        assert_eq!(params.server.as_deref(), Some("db01"));
        assert_eq!(params.database.as_deref(), Some("sales"));
        assert_eq!(params.uid.as_deref(), Some("etl"));
        assert_eq!(params.pwd.as_deref(), Some("a=b"));
        assert_eq!(params.port, Some(5432));
        assert_eq!(params.sslmode.as_deref(), Some("require"));
        assert_eq!(params.trusted_connection, Some(false));
    }

    #[test]
    fn test_empty_segments_ignored() {
        let params = ConnectionParams::parse(";provider=duckdb;;database=x.db;").unwrap();
        assert_eq!(params.database.as_deref(), Some("x.db"));
    }

    #[test]
    fn test_segment_without_equals() {
        let err = ConnectionParams::parse("provider=duckdb;oops").unwrap_err();
        match err {
            ConnectionError::MalformedSegment { segment } => assert_eq!(segment, "oops"),
            other => panic!("Expected MalformedSegment, got {:?}", other),
        }
    }

    #[test]
    fn test_user_without_password() {
        let err = ConnectionParams::parse("server=db01;uid=etl").unwrap_err();
        assert!(matches!(err, ConnectionError::IncompleteCredentials));

        let err = ConnectionParams::parse("server=db01;pwd=secret").unwrap_err();
        assert!(matches!(err, ConnectionError::IncompleteCredentials));
    }

    #[test]
    fn test_invalid_port() {
        let err = ConnectionParams::parse("port=abc").unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidPort { .. }));
    }

    #[test]
    fn test_trusted_flag() {
        let params = ConnectionParams::parse("server=db01;trusted_connection=yes").unwrap();
        assert!(params.is_trusted());

        // Credentials override the flag.
        let params =
            ConnectionParams::parse("trusted_connection=yes;uid=etl;pwd=secret").unwrap();
        assert!(!params.is_trusted());
    }

    #[test]
    fn test_build_order_and_omission() {
        let params = ConnectionParams {
            port: Some(1433),
            uid: Some("etl".to_string()),
            pwd: Some("secret".to_string()),
            provider: Some("duckdb".to_string()),
            server: Some("db01".to_string()),
            ..Default::default()
        };
        assert_eq!(
            params.build(),
            "provider=duckdb;server=db01;uid=etl;pwd=secret;port=1433"
        );

        let reparsed = ConnectionParams::parse(&params.build()).unwrap();
        assert_eq!(reparsed.uid, params.uid);
        assert_eq!(reparsed.port, params.port);
    }

    #[test]
    fn test_display_masks_password() {
        let params = ConnectionParams::parse("server=db01;uid=etl;pwd=secret").unwrap();
        let shown = params.to_string();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("pwd=****"));
    }

    #[test]
    fn test_unsupported_provider() {
        let params = ConnectionParams::parse("provider=oracle;server=db01").unwrap();
        let err = open_source(&params).err().unwrap();
        match err {
            SourceError::UnsupportedProvider { provider } => assert_eq!(provider, "oracle"),
            other => panic!("Expected UnsupportedProvider, got {:?}", other),
        }
    }

    #[test]
    fn test_default_provider_is_duckdb() {
        let params = ConnectionParams::parse("database=:memory:").unwrap();
        assert_eq!(params.provider(), "duckdb");
        assert!(open_source(&params).is_ok());
    }
}

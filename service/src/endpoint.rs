//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Relay endpoints and connection string parsing

use crate::{RelayError, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Role of an endpoint when several are configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndpointType {
    /// Receives client traffic and hub-level messages
    #[default]
    Primary,
    /// Backup endpoint; receives hub-level messages only by default routing
    Secondary,
}

impl EndpointType {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(RelayError::InvalidConnectionString(format!(
                "unknown endpoint type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// A relay service instance the application server connects to.
///
/// Parsed from a connection string of the form
/// `Endpoint=https://relay.example.com;AccessKey=<key>;Version=1.0;Port=8443;`.
/// Keys are case-insensitive and the trailing `;` is optional.
#[derive(Clone)]
pub struct ServiceEndpoint {
    name: String,
    endpoint_type: EndpointType,
    endpoint: String,
    access_key: String,
    version: String,
    port: Option<u16>,
    online: Arc<AtomicBool>,
}

impl ServiceEndpoint {
    /// Parse an unnamed primary endpoint from a connection string
    pub fn from_connection_string(connection_string: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut access_key = None;
        let mut version = None;
        let mut port = None;

        for property in connection_string.split(';').map(str::trim) {
            if property.is_empty() {
                continue;
            }
            let Some((key, value)) = property.split_once('=') else {
                return Err(RelayError::InvalidConnectionString(format!(
                    "malformed property '{property}'"
                )));
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim_end_matches('/').to_string()),
                "accesskey" => access_key = Some(value.to_string()),
                "version" => version = Some(value.to_string()),
                "port" => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        RelayError::InvalidConnectionString(format!("invalid port '{value}'"))
                    })?);
                }
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            RelayError::InvalidConnectionString("missing Endpoint".to_string())
        })?;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(RelayError::InvalidConnectionString(format!(
                "endpoint '{endpoint}' must start with http:// or https://"
            )));
        }
        let access_key = access_key.ok_or_else(|| {
            RelayError::InvalidConnectionString("missing AccessKey".to_string())
        })?;
        let version = version.unwrap_or_else(|| "1.0".to_string());
        if version != "1.0" {
            return Err(RelayError::InvalidConnectionString(format!(
                "unsupported version '{version}'"
            )));
        }

        Ok(Self {
            name: String::new(),
            endpoint_type: EndpointType::Primary,
            endpoint,
            access_key,
            version,
            port,
            online: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Parse an endpoint whose name and type come from a configuration key.
    ///
    /// `key` is `name` or `name:type`, where type is `primary` or `secondary`.
    pub fn from_named_connection_string(key: &str, connection_string: &str) -> Result<Self> {
        let (name, endpoint_type) = match key.split_once(':') {
            Some((name, kind)) => (name, EndpointType::parse(kind)?),
            None => (key, EndpointType::Primary),
        };
        let mut endpoint = Self::from_connection_string(connection_string)?;
        endpoint.name = name.to_string();
        endpoint.endpoint_type = endpoint_type;
        Ok(endpoint)
    }

    /// Set the endpoint name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the endpoint type
    pub fn with_type(mut self, endpoint_type: EndpointType) -> Self {
        self.endpoint_type = endpoint_type;
        self
    }

    /// Endpoint name (empty when unnamed)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint type
    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    /// Endpoint URL without trailing slash
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Access key used to authenticate with the relay
    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Connection string version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Explicit port override
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether the endpoint is considered healthy
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Update endpoint health; shared by every hub using this endpoint
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("name", &self.name)
            .field("endpoint_type", &self.endpoint_type)
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "({}){}", self.endpoint_type, self.endpoint)
        } else {
            write!(f, "[{}]({}){}", self.name, self.endpoint_type, self.endpoint)
        }
    }
}

/// A [`ServiceEndpoint`] bound to one hub
#[derive(Debug, Clone)]
pub struct HubServiceEndpoint {
    hub: String,
    endpoint: ServiceEndpoint,
}

impl HubServiceEndpoint {
    /// Bind an endpoint to a hub
    pub fn new(hub: impl Into<String>, endpoint: ServiceEndpoint) -> Self {
        Self {
            hub: hub.into(),
            endpoint,
        }
    }

    /// Hub name
    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Underlying endpoint
    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// Endpoint name, falling back to the URL for unnamed endpoints
    pub fn name(&self) -> &str {
        if self.endpoint.name.is_empty() {
            &self.endpoint.endpoint
        } else {
            &self.endpoint.name
        }
    }

    /// Endpoint type
    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint.endpoint_type
    }

    /// Whether the endpoint is considered healthy
    pub fn is_online(&self) -> bool {
        self.endpoint.is_online()
    }

    /// Update endpoint health
    pub fn set_online(&self, online: bool) {
        self.endpoint.set_online(online);
    }
}

impl fmt::Display for HubServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hub, self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTION_STRING: &str =
        "Endpoint=https://relay.example.com/;AccessKey=secret;Version=1.0;";

    #[test]
    fn test_parse_connection_string() {
        let endpoint = ServiceEndpoint::from_connection_string(CONNECTION_STRING).unwrap();
        assert_eq!(endpoint.endpoint(), "https://relay.example.com");
        assert_eq!(endpoint.access_key(), "secret");
        assert_eq!(endpoint.version(), "1.0");
        assert_eq!(endpoint.port(), None);
        assert_eq!(endpoint.endpoint_type(), EndpointType::Primary);
        assert!(endpoint.is_online());
    }

    #[test]
    fn test_parse_is_case_insensitive_with_port() {
        let endpoint = ServiceEndpoint::from_connection_string(
            "endpoint=http://localhost;accesskey=k;port=8080",
        )
        .unwrap();
        assert_eq!(endpoint.port(), Some(8080));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "AccessKey=k",
            "Endpoint=https://x",
            "Endpoint=ftp://x;AccessKey=k",
            "Endpoint=https://x;AccessKey=k;Version=2.0",
            "Endpoint=https://x;AccessKey=k;Port=abc",
            "Endpoint",
        ] {
            assert!(
                matches!(
                    ServiceEndpoint::from_connection_string(bad),
                    Err(RelayError::InvalidConnectionString(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_named_endpoint() {
        let endpoint =
            ServiceEndpoint::from_named_connection_string("west:secondary", CONNECTION_STRING)
                .unwrap();
        assert_eq!(endpoint.name(), "west");
        assert_eq!(endpoint.endpoint_type(), EndpointType::Secondary);
        assert_eq!(endpoint.to_string(), "[west](secondary)https://relay.example.com");

        assert!(
            ServiceEndpoint::from_named_connection_string("west:tertiary", CONNECTION_STRING)
                .is_err()
        );
    }

    #[test]
    fn test_online_flag_shared_across_hubs() {
        let endpoint = ServiceEndpoint::from_connection_string(CONNECTION_STRING).unwrap();
        let chat = HubServiceEndpoint::new("chat", endpoint.clone());
        let game = HubServiceEndpoint::new("game", endpoint);

        chat.set_online(false);
        assert!(!game.is_online());
        assert_eq!(chat.name(), "https://relay.example.com");
    }
}

// ABOUTME: Layered broker security resolution: group config -> client property map.
// ABOUTME: Dialer factory validating SASL/TLS combinations; first-broker-host derivation.

use anyhow::{bail, Result};
use std::collections::HashMap;

use crate::config::GroupConfig;

pub const PROP_SECURITY_PROTOCOL: &str = "security.protocol";
pub const PROP_SASL_MECHANISM: &str = "sasl.mechanism";
pub const PROP_SASL_USERNAME: &str = "sasl.username";
pub const PROP_SASL_PASSWORD: &str = "sasl.password";
pub const PROP_SSL_CA_LOCATION: &str = "ssl.ca.location";
pub const PROP_SSL_CERT_LOCATION: &str = "ssl.certificate.location";
pub const PROP_SSL_KEY_LOCATION: &str = "ssl.key.location";

/// Map group config into broker client properties.
///
/// Defaults keep plaintext installs working; security settings are opt-in.
/// A legacy proxy API key alone implies SASL_SSL with PLAIN/token
/// credentials; future configs should treat that as deprecated but it must
/// keep working.
pub fn build_kafka_props(cfg: &GroupConfig) -> HashMap<String, String> {
    let mut props = HashMap::new();

    let sec = cfg.kafka_security_protocol.trim().to_uppercase();
    if !sec.is_empty() {
        props.insert(PROP_SECURITY_PROTOCOL.to_string(), sec);
    } else if !cfg.lfs_proxy_api_key.trim().is_empty() {
        props.insert(PROP_SECURITY_PROTOCOL.to_string(), "SASL_SSL".to_string());
    }

    let mech = cfg.kafka_sasl_mechanism.trim().to_uppercase();
    let user = cfg.kafka_sasl_username.trim();
    let pass = cfg.kafka_sasl_password.trim();
    if !mech.is_empty() {
        props.insert(PROP_SASL_MECHANISM.to_string(), mech);
    }
    if !user.is_empty() {
        props.insert(PROP_SASL_USERNAME.to_string(), user.to_string());
    }
    if !pass.is_empty() {
        props.insert(PROP_SASL_PASSWORD.to_string(), pass.to_string());
    }

    let legacy_key = cfg.lfs_proxy_api_key.trim();
    if !legacy_key.is_empty() && !props.contains_key(PROP_SASL_PASSWORD) {
        props.insert(PROP_SASL_MECHANISM.to_string(), "PLAIN".to_string());
        props.insert(PROP_SASL_USERNAME.to_string(), "token".to_string());
        props.insert(PROP_SASL_PASSWORD.to_string(), legacy_key.to_string());
    }

    for (key, value) in [
        (PROP_SSL_CA_LOCATION, cfg.kafka_tls_ca_file.trim()),
        (PROP_SSL_CERT_LOCATION, cfg.kafka_tls_cert_file.trim()),
        (PROP_SSL_KEY_LOCATION, cfg.kafka_tls_key_file.trim()),
    ] {
        if !value.is_empty() {
            props.insert(key.to_string(), value.to_string());
        }
    }

    props
}

/// SASL credentials resolved from the property map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslAuth {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

/// TLS material locations resolved from the property map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsLocations {
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

/// A validated broker connection recipe.
#[derive(Debug, Clone)]
pub struct BrokerDialer {
    pub host: String,
    pub security_protocol: String,
    pub sasl: Option<SaslAuth>,
    pub tls: Option<TlsLocations>,
}

impl BrokerDialer {
    pub fn uses_tls(&self) -> bool {
        self.security_protocol.contains("SSL")
    }
}

/// Build a dialer from resolved properties and the first broker host.
/// A SASL-bearing security protocol without credentials is a config error.
pub fn dialer_from_props(props: &HashMap<String, String>, host: &str) -> Result<BrokerDialer> {
    let protocol = props
        .get(PROP_SECURITY_PROTOCOL)
        .map(String::as_str)
        .unwrap_or("")
        .to_string();

    let username = props
        .get(PROP_SASL_USERNAME)
        .map(String::as_str)
        .unwrap_or("");
    let password = props
        .get(PROP_SASL_PASSWORD)
        .map(String::as_str)
        .unwrap_or("");

    let sasl = if protocol.contains("SASL") {
        if username.is_empty() || password.is_empty() {
            bail!("security protocol {protocol} selected but SASL credentials are missing");
        }
        let mechanism = props
            .get(PROP_SASL_MECHANISM)
            .map(String::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("PLAIN")
            .to_string();
        Some(SaslAuth {
            mechanism,
            username: username.to_string(),
            password: password.to_string(),
        })
    } else {
        None
    };

    let tls = if protocol.contains("SSL") {
        Some(TlsLocations {
            ca_file: props.get(PROP_SSL_CA_LOCATION).cloned(),
            cert_file: props.get(PROP_SSL_CERT_LOCATION).cloned(),
            key_file: props.get(PROP_SSL_KEY_LOCATION).cloned(),
        })
    } else {
        None
    };

    Ok(BrokerDialer {
        host: host.to_string(),
        security_protocol: protocol,
        sasl,
        tls,
    })
}

/// Resolve the full dialer from group config.
pub fn build_kafka_dialer(cfg: &GroupConfig) -> Result<BrokerDialer> {
    let props = build_kafka_props(cfg);
    let host = first_broker_host(&cfg.kafka_brokers);
    dialer_from_props(&props, &host)
}

/// The first broker's host: split the list on commas, take the first
/// host[:port], and return the host (brackets stripped for IPv6) or the raw
/// value when no port is present.
pub fn first_broker_host(brokers: &str) -> String {
    let first = brokers.split(',').next().unwrap_or("").trim();
    if first.is_empty() {
        return String::new();
    }
    if let Some(rest) = first.strip_prefix('[') {
        if let Some((host, _port)) = rest.split_once("]:") {
            return host.to_string();
        }
        return first.to_string();
    }
    // Exactly one colon separates host and port; more means a bare IPv6
    // address, which passes through untouched.
    if first.bytes().filter(|&b| b == b':').count() == 1 {
        if let Some((host, _port)) = first.split_once(':') {
            return host.to_string();
        }
    }
    first.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_settings_map_through() {
        let cfg = GroupConfig {
            kafka_security_protocol: "SASL_SSL".into(),
            kafka_sasl_mechanism: "SCRAM-SHA-512".into(),
            kafka_sasl_username: "svc-user".into(),
            kafka_sasl_password: "svc-pass".into(),
            kafka_tls_ca_file: "/etc/ssl/ca.pem".into(),
            kafka_tls_cert_file: "/etc/ssl/client.pem".into(),
            kafka_tls_key_file: "/etc/ssl/client.key".into(),
            ..Default::default()
        };
        let props = build_kafka_props(&cfg);
        assert_eq!(props[PROP_SECURITY_PROTOCOL], "SASL_SSL");
        assert_eq!(props[PROP_SASL_MECHANISM], "SCRAM-SHA-512");
        assert_eq!(props[PROP_SASL_USERNAME], "svc-user");
        assert_eq!(props[PROP_SASL_PASSWORD], "svc-pass");
        assert_eq!(props[PROP_SSL_CA_LOCATION], "/etc/ssl/ca.pem");
        assert_eq!(props[PROP_SSL_CERT_LOCATION], "/etc/ssl/client.pem");
        assert_eq!(props[PROP_SSL_KEY_LOCATION], "/etc/ssl/client.key");
    }

    #[test]
    fn legacy_proxy_key_fallback() {
        let cfg = GroupConfig {
            lfs_proxy_api_key: "api-key".into(),
            ..Default::default()
        };
        let props = build_kafka_props(&cfg);
        assert_eq!(props[PROP_SECURITY_PROTOCOL], "SASL_SSL");
        assert_eq!(props[PROP_SASL_MECHANISM], "PLAIN");
        assert_eq!(props[PROP_SASL_USERNAME], "token");
        assert_eq!(props[PROP_SASL_PASSWORD], "api-key");
    }

    #[test]
    fn explicit_password_wins_over_legacy_key() {
        let cfg = GroupConfig {
            kafka_security_protocol: "SASL_PLAINTEXT".into(),
            kafka_sasl_mechanism: "scram-sha-256".into(),
            kafka_sasl_username: "svc".into(),
            kafka_sasl_password: "secret".into(),
            lfs_proxy_api_key: "api-key".into(),
            ..Default::default()
        };
        let props = build_kafka_props(&cfg);
        assert_eq!(props[PROP_SECURITY_PROTOCOL], "SASL_PLAINTEXT");
        assert_eq!(props[PROP_SASL_MECHANISM], "SCRAM-SHA-256");
        assert_eq!(props[PROP_SASL_PASSWORD], "secret");
    }

    #[test]
    fn plaintext_install_yields_empty_props() {
        assert!(build_kafka_props(&GroupConfig::default()).is_empty());
    }

    #[test]
    fn dialer_without_security_succeeds() {
        let cfg = GroupConfig {
            kafka_brokers: "localhost:9092".into(),
            ..Default::default()
        };
        let dialer = build_kafka_dialer(&cfg).unwrap();
        assert_eq!(dialer.host, "localhost");
        assert!(dialer.sasl.is_none());
        assert!(dialer.tls.is_none());
        assert!(!dialer.uses_tls());
    }

    #[test]
    fn sasl_without_credentials_fails_construction() {
        let cfg = GroupConfig {
            kafka_brokers: "localhost:9092".into(),
            kafka_security_protocol: "SASL_SSL".into(),
            ..Default::default()
        };
        assert!(build_kafka_dialer(&cfg).is_err());
    }

    #[test]
    fn legacy_key_produces_a_valid_dialer() {
        let cfg = GroupConfig {
            kafka_brokers: "proxy.example.com:9092".into(),
            lfs_proxy_api_key: "api-key".into(),
            ..Default::default()
        };
        let dialer = build_kafka_dialer(&cfg).unwrap();
        assert_eq!(dialer.security_protocol, "SASL_SSL");
        let sasl = dialer.sasl.unwrap();
        assert_eq!(sasl.mechanism, "PLAIN");
        assert_eq!(sasl.username, "token");
        assert_eq!(sasl.password, "api-key");
        assert!(dialer.tls.is_some());
    }

    #[test]
    fn first_broker_host_cases() {
        let cases = [
            ("broker-a:9092,broker-b:9092", "broker-a"),
            ("broker-a", "broker-a"),
            ("[::1]:9092", "::1"),
            ("", ""),
        ];
        for (input, want) in cases {
            assert_eq!(first_broker_host(input), want, "input {input:?}");
        }
    }
}

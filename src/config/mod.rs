use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub jwt_public_key: Option<String>,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", 8080u16)?;
        let grace_secs = parse_var("SHUTDOWN_GRACE_SECS", 60u64)?;

        let redis_url = match non_empty_var("REDIS_URL") {
            Some(url) => url,
            None => {
                let addr = non_empty_var("REDIS_ADDR").unwrap_or_else(|| "localhost:6379".to_string());
                let tls = parse_var("REDIS_TLS", false)?;
                redis_url_from_parts(&addr, non_empty_var("REDIS_PASSWORD").as_deref(), tls)
            }
        };

        Ok(Config {
            port,
            redis_url,
            jwt_public_key: non_empty_var("JWT_PUBLIC_KEY"),
            shutdown_grace: Duration::from_secs(grace_secs),
        })
    }
}

// Password must stay out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("redis_url", &redact_url(&self.redis_url))
            .field("jwt_public_key", &self.jwt_public_key.as_ref().map(|_| "<set>"))
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

/// `rediss://` when `tls` is set. The password is percent-encoded.
pub fn redis_url_from_parts(addr: &str, password: Option<&str>, tls: bool) -> String {
    let scheme = if tls { "rediss" } else { "redis" };
    match password {
        Some(password) => format!("{}://:{}@{}", scheme, urlencoding::encode(password), addr),
        None => format!("{}://{}", scheme, addr),
    }
}

/// Replaces any userinfo in `url` with `***`.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match non_empty_var(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for name in [
            "PORT",
            "REDIS_URL",
            "REDIS_ADDR",
            "REDIS_PASSWORD",
            "REDIS_TLS",
            "JWT_PUBLIC_KEY",
            "SHUTDOWN_GRACE_SECS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_unset() {
        clear();
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert!(config.jwt_public_key.is_none());
        assert_eq!(config.shutdown_grace, Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn redis_addr_and_password_compose_url() {
        clear();
        env::set_var("REDIS_ADDR", "cache.internal:6380");
        env::set_var("REDIS_PASSWORD", "hunter2");
        let config = Config::from_env().unwrap();
        assert_eq!(config.redis_url, "redis://:hunter2@cache.internal:6380");
        assert!(!format!("{:?}", config).contains("hunter2"));
        clear();
    }

    #[test]
    #[serial]
    fn redis_url_overrides_parts() {
        clear();
        env::set_var("REDIS_URL", "redis://other:6379/2");
        env::set_var("REDIS_ADDR", "ignored:1");
        let config = Config::from_env().unwrap();
        assert_eq!(config.redis_url, "redis://other:6379/2");
        clear();
    }

    #[test]
    #[serial]
    fn invalid_port_is_an_error_not_a_panic() {
        clear();
        env::set_var("PORT", "eighty");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("PORT"));
        clear();
    }

    #[test]
    #[serial]
    fn redis_tls_switch_selects_rediss() {
        clear();
        env::set_var("REDIS_ADDR", "master.cache.amazonaws.com:6379");
        env::set_var("REDIS_PASSWORD", "token");
        env::set_var("REDIS_TLS", "true");
        let config = Config::from_env().unwrap();
        assert_eq!(config.redis_url, "rediss://:token@master.cache.amazonaws.com:6379");

        env::set_var("REDIS_TLS", "sometimes");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("REDIS_TLS"));
        clear();
    }

    #[test]
    fn password_is_percent_encoded() {
        assert_eq!(
            redis_url_from_parts("host:6379", Some("p@ss/w:rd"), false),
            "redis://:p%40ss%2Fw%3Ard@host:6379"
        );
        assert_eq!(redis_url_from_parts("host:6379", None, true), "rediss://host:6379");
    }

    #[test]
    fn redact_url_hides_userinfo() {
        assert_eq!(redact_url("redis://:pw@host:1"), "redis://***@host:1");
        assert_eq!(redact_url("redis://host:1"), "redis://host:1");
    }
}

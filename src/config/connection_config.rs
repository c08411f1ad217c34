//! Represents the SSH connection to a guest under test.
///
/// Holds the address and credentials used by the SSH connection manager.
/// The credential fields are opaque to the step runner, which only ever sees
/// a `ConnectionManager`.
///
/// # Fields
///
/// - `ip`: host name or IP address of the guest.
/// - `port`: SSH port.
/// - `username`: login user.
/// - `password`: optional password.
/// - `private_key_path`: optional path to a private key file.
/// - `max_retries`: number of TCP connect attempts before giving up.
/// - `timeout`: connect timeout, in humantime form (`15s`, `1m`).
///
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub max_retries: u8,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ip: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            password: None,
            private_key_path: None,
            max_retries: 3,
            timeout: Duration::from_secs(15),
        }
    }
}

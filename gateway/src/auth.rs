//! Broker credential resolution, performed once at startup.

use hyper::body::Bytes;
use hyper::{Method, StatusCode};
use serde::Deserialize;

use crate::config::{AuthType, MqttSettings};
use crate::upstream::{UpstreamClient, UpstreamError};
use crate::util::{UrlError, is_blank, join_url};

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("file path to auth file is empty")]
    EmptyPath,
    #[error("could not read {0}: {1}")]
    Read(String, std::io::Error),
    #[error("auth file {0} is missing the user line")]
    MissingUser(String),
    #[error("auth file {0} is missing the password line")]
    MissingPassword(String),
    #[error("could not join registration URL: {0}")]
    RegistrationUrl(#[from] UrlError),
    #[error("registration request failed: {0}")]
    Registration(#[from] UpstreamError),
    #[error("registration rejected with status {0}")]
    RegistrationStatus(StatusCode),
    #[error("could not decode registration response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Username and password presented on broker control-channel connects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub user: String,
    pub password: String,
}

/// Resolves credentials for the configured auth mode. Any failure here
/// aborts startup.
pub async fn resolve(
    settings: &MqttSettings,
    client: &UpstreamClient,
    token: &str,
) -> Result<BrokerCredentials, AuthError> {
    match settings.auth_type {
        AuthType::None => Ok(BrokerCredentials::default()),
        AuthType::File => file_credentials(&settings.auth_file),
        AuthType::Registration => {
            let url = join_url(&settings.crs.server, &settings.crs.registration_endpoint)?;
            registration_credentials(
                client,
                &url,
                &settings.crs.entity,
                token,
                &settings.crs.cfg_path,
            )
            .await
        }
    }
}

/// Reads a user line and a password line off a file.
pub fn file_credentials(path: &str) -> Result<BrokerCredentials, AuthError> {
    if is_blank(path) {
        return Err(AuthError::EmptyPath);
    }
    let contents =
        std::fs::read_to_string(path).map_err(|err| AuthError::Read(path.to_string(), err))?;
    let mut lines = contents.lines();
    let user = lines
        .next()
        .ok_or_else(|| AuthError::MissingUser(path.to_string()))?
        .to_string();
    let password = lines
        .next()
        .ok_or_else(|| AuthError::MissingPassword(path.to_string()))?
        .to_string();
    Ok(BrokerCredentials { user, password })
}

#[derive(Deserialize)]
struct RegistrationResponse {
    #[serde(rename = "ID")]
    id: String,
}

/// Registers this gateway with CRS and derives broker credentials from
/// the entity ID it assigns.
async fn registration_credentials(
    client: &UpstreamClient,
    url: &url::Url,
    entity: &str,
    token: &str,
    cfg_path: &str,
) -> Result<BrokerCredentials, AuthError> {
    let blob =
        std::fs::read(cfg_path).map_err(|err| AuthError::Read(cfg_path.to_string(), err))?;
    let response = client
        .request(
            Method::POST,
            url,
            &[("authorization", format!("Bearer {token}"))],
            &[],
            Bytes::from(blob),
        )
        .await?;
    if response.status != StatusCode::CREATED {
        return Err(AuthError::RegistrationStatus(response.status));
    }
    let registration: RegistrationResponse = serde_json::from_slice(&response.body)?;
    tracing::debug!(id = %registration.id, "obtained entity id from crs");
    Ok(BrokerCredentials {
        user: format!("{entity}-{}", registration.id),
        password: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MockCas;
    use std::io::Write;

    #[test]
    fn file_credentials_reads_two_lines() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "user").unwrap();
        writeln!(tmp, "password").unwrap();
        let credentials = file_credentials(tmp.path().to_str().unwrap()).unwrap();
        assert_eq!(credentials.user, "user");
        assert_eq!(credentials.password, "password");
    }

    #[test]
    fn file_credentials_rejects_short_files() {
        assert!(matches!(file_credentials("  "), Err(AuthError::EmptyPath)));

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "user-only").unwrap();
        assert!(matches!(
            file_credentials(tmp.path().to_str().unwrap()),
            Err(AuthError::MissingPassword(_))
        ));
    }

    fn registration_settings(server: String, cfg_path: String) -> MqttSettings {
        MqttSettings {
            server: "localhost:1883".to_string(),
            success_code: 3,
            auth_type: AuthType::Registration,
            auth_file: String::new(),
            crs: crate::config::CrsSettings {
                server,
                entity: "sw".to_string(),
                cfg_path,
                registration_endpoint: "/crs/v1/registration".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn registration_mode_derives_user_from_assigned_id() {
        let cas = MockCas::spawn().await;
        let mut cfg = tempfile::NamedTempFile::new().unwrap();
        write!(cfg, r#"{{"signed": "blob"}}"#).unwrap();

        let settings = registration_settings(
            cas.base_url(),
            cfg.path().to_str().unwrap().to_string(),
        );
        let credentials = resolve(&settings, &UpstreamClient::new(), "test.test")
            .await
            .unwrap();
        assert_eq!(credentials.user, "sw-12");
        assert_eq!(credentials.password, "test.test");

        let recorded = cas.last_request().expect("crs saw the registration");
        assert_eq!(recorded.path, "/crs/v1/registration");
        assert_eq!(recorded.authorization.as_deref(), Some("Bearer test.test"));
    }

    #[tokio::test]
    async fn registration_mode_aborts_on_empty_blob() {
        let cas = MockCas::spawn().await;
        let cfg = tempfile::NamedTempFile::new().unwrap();

        let settings = registration_settings(
            cas.base_url(),
            cfg.path().to_str().unwrap().to_string(),
        );
        let result = resolve(&settings, &UpstreamClient::new(), "test.test").await;
        assert!(matches!(result, Err(AuthError::RegistrationStatus(_))));
    }

    #[tokio::test]
    async fn none_mode_yields_empty_credentials() {
        let settings = MqttSettings::default();
        let credentials = resolve(&settings, &UpstreamClient::new(), "test.test")
            .await
            .unwrap();
        assert_eq!(credentials, BrokerCredentials::default());
    }
}

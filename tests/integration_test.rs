/**
 * Integration tests for matrixon-identity: durable state and configuration
 */

use std::{fs, sync::Arc};

use async_trait::async_trait;
use matrixon_identity::{
    config::IdentityConfig,
    database::JsonFileData,
    service::identity::{
        BindingSession, BindingState, Collaborators, Data, FoundThreePid, HomeserverApi,
        IdentityServerApi, Service, ThreePid, WellKnownResolver,
    },
    Error, Result,
};
use tempfile::TempDir;

const SERVER: &str = "https://id.example.org";

/// Accepts everything; enough to drive a binding to `CodeSent`
struct AcceptingServers;

#[async_trait]
impl IdentityServerApi for AcceptingServers {
    async fn status(&self, _base_url: &str) -> Result<()> {
        Ok(())
    }

    async fn request_token(
        &self,
        _base_url: &str,
        _threepid: &ThreePid,
        _client_secret: &str,
        send_attempt: u32,
    ) -> Result<String> {
        Ok(format!("sid-{send_attempt}"))
    }

    async fn submit_token(
        &self,
        _base_url: &str,
        _threepid: &ThreePid,
        _sid: &str,
        _client_secret: &str,
        _token: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn lookup(&self, _base_url: &str, _threepids: &[ThreePid]) -> Result<Vec<FoundThreePid>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl HomeserverApi for AcceptingServers {
    async fn bind_threepid(&self, _identity_server: &str, _sid: &str, _client_secret: &str) -> Result<()> {
        Ok(())
    }

    async fn unbind_threepid(&self, _identity_server: &str, _threepid: &ThreePid) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl WellKnownResolver for AcceptingServers {
    async fn identity_server(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

fn service_over(data: Arc<JsonFileData>) -> Service {
    let servers = Arc::new(AcceptingServers);
    Service::new(
        Collaborators {
            identity_api: servers.clone(),
            homeserver_api: servers.clone(),
            well_known: servers,
            data,
        },
        4,
    )
    .unwrap()
}

#[test]
fn test_json_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("identity.json");
    let threepid = ThreePid::msisdn("+44 7700 900123").unwrap();

    {
        let data = JsonFileData::open(&path).unwrap();
        data.set_identity_server_url(Some(SERVER)).unwrap();

        let mut session = BindingSession::new(threepid.clone(), SERVER, 4);
        session.sid = Some("sid-42".to_string());
        session.state = BindingState::Submitted;
        data.save_pending_binding(&session).unwrap();
    }

    let reopened = JsonFileData::open(&path).unwrap();
    assert_eq!(reopened.identity_server_url().unwrap().as_deref(), Some(SERVER));

    let sessions = reopened.pending_bindings().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].threepid, threepid);
    assert_eq!(sessions[0].state, BindingState::Submitted);
    assert_eq!(sessions[0].sid.as_deref(), Some("sid-42"));

    let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["pending_bindings"][0]["threepid"]["medium"], "msisdn");
}

#[tokio::test]
async fn test_pending_binding_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("identity.json");
    let threepid = ThreePid::email("alice@example.com").unwrap();

    {
        let data = Arc::new(JsonFileData::open(&path).unwrap());
        data.set_identity_server_url(Some(SERVER)).unwrap();
        let service = service_over(data);
        service.start_bind_threepid(threepid.clone()).await.unwrap();
        service.shutdown();
    }

    let service = service_over(Arc::new(JsonFileData::open(&path).unwrap()));
    assert_eq!(service.get_current_identity_server().as_deref(), Some(SERVER));
    assert_eq!(service.binding_state(&threepid), Some(BindingState::CodeSent));

    service
        .submit_validation_token(threepid.clone(), "123456")
        .await
        .unwrap();
    service.finalize_bind_threepid(threepid.clone()).await.unwrap();

    let reopened = JsonFileData::open(&path).unwrap();
    assert!(reopened.pending_bindings().unwrap().is_empty());
}

#[test]
fn test_config_from_toml_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("identity.toml");
    fs::write(
        &path,
        r#"
homeserver_url = "https://matrix.example.org"
server_name = "example.org"
identity_server = "vector.im"
request_timeout_secs = 10
log = "debug"
"#,
    )
    .unwrap();

    let config = IdentityConfig::load(Some(&path)).unwrap();
    assert_eq!(config.homeserver_url, "https://matrix.example.org");
    assert_eq!(config.identity_server.as_deref(), Some("vector.im"));
    assert_eq!(config.request_timeout_secs, 10);
    assert_eq!(config.log, "debug");
}

#[test]
fn test_config_env_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("identity.toml");
    fs::write(
        &path,
        r#"
homeserver_url = "https://matrix.example.org"
server_name = "example.org"
max_concurrent_requests = 2
"#,
    )
    .unwrap();

    std::env::set_var("MATRIXON_IDENTITY_MAX_CONCURRENT_REQUESTS", "4");
    let config = IdentityConfig::load(Some(&path)).unwrap();
    std::env::remove_var("MATRIXON_IDENTITY_MAX_CONCURRENT_REQUESTS");

    assert_eq!(config.max_concurrent_requests, 4);
}

#[test]
fn test_config_without_required_fields() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("identity.toml");
    fs::write(&path, "log = \"warn\"\n").unwrap();

    assert!(matches!(IdentityConfig::load(Some(&path)), Err(Error::BadConfig(_))));
}

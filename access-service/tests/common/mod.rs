#![allow(dead_code)]

use access_service::config::{
    AccessConfig, DispatchConfig, FcmConfig, MongoConfig, Msg91Config, SmtpConfig, StoreBackend,
    SweepConfig, TokenConfig,
};
use access_service::models::{Channel, HoldStatus, RequestStatus};
use access_service::services::directory::StaticDirectory;
use access_service::services::transports::Transport;
use access_service::services::{
    AccessService, Decision, HoldLedger, MemoryStore, MockTransport, SubmitAccess, TokenCodec,
};
use access_service::startup::{assemble_service, AppState, Application, StoreHealth};
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use std::sync::Arc;

/// Two sites. S1 has staff and members with every kind of contact; S2 has a
/// single door and nobody attached.
pub const DIRECTORY: &str = r#"
    [[sites]]
    site_id = "S1"
    name = "North Plant"
    doors = ["D1", "D2", "D3"]
    managers = ["M1"]
    responders = ["R1"]
    members = ["U1", "U2"]

    [[sites]]
    site_id = "S2"
    name = "South Warehouse"
    doors = ["D9"]

    [[users]]
    user_id = "U1"
    email = "u1@example.com"
    phone = "+15550001"

    [[users.devices]]
    token = "push-u1"
    platform = "fcm"

    [[users]]
    user_id = "U2"
    email = "u2@example.com"

    [[users.devices]]
    token = "push-u2"
    platform = "apns"

    [[users]]
    user_id = "M1"
    email = "m1@example.com"

    [[users.devices]]
    token = "push-m1"
    platform = "fcm"

    [[users]]
    user_id = "R1"
    phone = "+15550009"

    [[users.devices]]
    token = "push-r1"
    platform = "fcm"
"#;

pub fn test_config() -> AccessConfig {
    AccessConfig {
        common: CoreConfig::ephemeral(),
        store: StoreBackend::Memory,
        mongodb: MongoConfig {
            uri: String::new(),
            database: "access_test".to_string(),
        },
        token: TokenConfig {
            signing_secret: Secret::new("test-signing-secret".to_string()),
            default_ttl_minutes: 60,
            max_ttl_minutes: 240,
        },
        sweep: SweepConfig {
            // Tests drive sweeps explicitly
            interval_secs: 3600,
            expiring_soon_minutes: 10,
        },
        dispatch: DispatchConfig {
            delivery_timeout_ms: 1_000,
            max_attempts: 3,
            retry_interval_secs: 3600,
        },
        operation_timeout_ms: 5_000,
        directory_path: None,
        smtp: SmtpConfig {
            host: "smtp.test.local".to_string(),
            port: 587,
            user: "test".to_string(),
            password: "test".to_string(),
            from_email: "test@example.com".to_string(),
            from_name: "Test Service".to_string(),
            enabled: false,
        },
        msg91: Msg91Config {
            auth_key: "test-key".to_string(),
            sender_id: "TEST".to_string(),
            country_code: "1".to_string(),
            enabled: false,
        },
        fcm: FcmConfig {
            project_id: "test-project".to_string(),
            access_token: "test-token".to_string(),
            enabled: false,
        },
    }
}

pub struct Mocks {
    pub push: Arc<MockTransport>,
    pub email: Arc<MockTransport>,
    pub sms: Arc<MockTransport>,
}

impl Mocks {
    pub fn new() -> Self {
        Self {
            push: Arc::new(MockTransport::new(Channel::Push)),
            email: Arc::new(MockTransport::new(Channel::Email)),
            sms: Arc::new(MockTransport::new(Channel::Sms)),
        }
    }

    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        vec![
            self.push.clone() as Arc<dyn Transport>,
            self.email.clone() as Arc<dyn Transport>,
            self.sms.clone() as Arc<dyn Transport>,
        ]
    }
}

/// The full service graph over an in-memory store and mock transports.
pub struct Harness {
    pub config: AccessConfig,
    pub store: Arc<MemoryStore>,
    pub directory: Arc<StaticDirectory>,
    pub mocks: Mocks,
    pub access: Arc<AccessService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AccessConfig) -> Self {
        Self::with_mocks(config, Mocks::new())
    }

    pub fn with_mocks(config: AccessConfig, mocks: Mocks) -> Self {
        let store = Arc::new(MemoryStore::new());
        let directory =
            Arc::new(StaticDirectory::from_toml(DIRECTORY).expect("Failed to parse test directory"));
        let access = assemble_service(&config, store.clone(), directory.clone(), mocks.transports());

        Self {
            config,
            store,
            directory,
            mocks,
            access,
        }
    }

    pub fn ledger(&self) -> HoldLedger {
        HoldLedger::new(self.store.clone())
    }

    pub fn codec(&self) -> TokenCodec {
        TokenCodec::new(&self.config.token.signing_secret)
    }

    pub async fn submit(&self, user_id: &str, door_id: &str) -> String {
        self.access
            .submit_access_request(submit_access(user_id, "S1", door_id))
            .await
            .expect("Failed to submit access request")
            .request_id
    }

    /// Submit and grant; panics unless the grant goes through.
    pub async fn grant(&self, user_id: &str, door_id: &str) -> Decision {
        let request_id = self.submit(user_id, door_id).await;
        let decision = self
            .access
            .decide_access_request(&request_id, access_service::models::Outcome::Grant, None)
            .await
            .expect("Failed to decide access request");
        assert_eq!(decision.request.status, RequestStatus::Granted);
        assert_eq!(
            decision.hold.as_ref().map(|h| h.status),
            Some(HoldStatus::Active)
        );
        decision
    }
}

pub fn submit_access(user_id: &str, site_id: &str, door_id: &str) -> SubmitAccess {
    SubmitAccess {
        user_id: user_id.to_string(),
        door_id: door_id.to_string(),
        site_id: site_id.to_string(),
        permissions: ["open".to_string()].into_iter().collect(),
        ttl_minutes: None,
    }
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    pub harness: Harness,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let harness = Harness::new();
        let state = AppState {
            access: harness.access.clone(),
            store_health: StoreHealth::Memory,
        };

        let app = Application::build_with(&harness.config, state)
            .await
            .expect("Failed to build test application");

        let port = app.http_port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            client,
            harness,
        }
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .send()
            .await
            .expect("Failed to execute request")
    }
}

//! Shared utilities for integration testing: Ed25519 test keys, signed
//! tokens, fake packet-filter tools, and a fully wired service instance.

use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::net::TcpListener;

use access_envelope::config::EnvelopeConfig;
use access_envelope::controller::{Paths, TokenController};
use access_envelope::firewall::{IpManager, Manager, ToolPaths};
use access_envelope::http::{EnvelopeServer, ServerError, ACCESS_PATH};
use access_envelope::lifecycle::Shutdown;
use access_envelope::token::{Audience, Claims, Signer, Verifier};

// Ed25519 key material from the RFC 8032 test vectors.
pub const KEY_SEED: [u8; 32] = [
    0x9d, 0x61, 0xb1, 0x9d, 0xef, 0xfd, 0x5a, 0x60, 0xba, 0x84, 0x4a, 0xf4, 0x92, 0xec, 0x2c,
    0xc4, 0x44, 0x49, 0xc5, 0x69, 0x7b, 0x32, 0x69, 0x19, 0x70, 0x3b, 0xac, 0x03, 0x1c, 0xae,
    0x7f, 0x60,
];
pub const KEY_PUBLIC: [u8; 32] = [
    0xd7, 0x5a, 0x98, 0x01, 0x82, 0xb1, 0x0a, 0xb7, 0xd5, 0x4b, 0xfe, 0xd3, 0xc9, 0x64, 0x07,
    0x3a, 0x0e, 0xe1, 0x72, 0xf3, 0xda, 0xa6, 0x23, 0x25, 0xaf, 0x02, 0x1a, 0x68, 0xf7, 0x07,
    0x51, 0x1a,
];

pub const MACHINE: &str = "mlab1.fake0";
pub const SUBJECT: &str = "envelope";

/// Serialize an Ed25519 JWK descriptor; `private` includes the seed.
pub fn ed25519_jwk(kid: &str, private: bool) -> Vec<u8> {
    let mut jwk = serde_json::json!({
        "kty": "OKP",
        "crv": "Ed25519",
        "alg": "EdDSA",
        "kid": kid,
        "x": URL_SAFE_NO_PAD.encode(KEY_PUBLIC),
    });
    if private {
        jwk["d"] = URL_SAFE_NO_PAD.encode(KEY_SEED).into();
    }
    serde_json::to_vec(&jwk).expect("serialize test jwk")
}

/// Build a claim expiring `expires_in` seconds from now.
pub fn claim(subject: &str, expires_in: i64) -> Claims {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs() as i64;
    Claims {
        iss: "locate.measurementlab.net".to_string(),
        sub: subject.to_string(),
        aud: Audience::from(MACHINE),
        exp: Some(now + expires_in),
        extra: Default::default(),
    }
}

/// Sign a token for `subject` expiring `expires_in` seconds from now.
pub fn token(subject: &str, expires_in: i64) -> String {
    Signer::new(&ed25519_jwk("k1", true))
        .expect("test signer")
        .sign(&claim(subject, expires_in))
        .expect("sign test token")
}

/// Write a fake packet-filter tool that logs its arguments and exits 0.
pub fn fake_tool(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let script = "#!/bin/sh\n\
                  echo \"$@\" >> \"$(dirname \"$0\")/calls.log\"\n\
                  exit 0\n";
    fs::write(&path, script).expect("write fake tool");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
    path
}

pub fn fake_tools(dir: &Path) -> ToolPaths {
    ToolPaths {
        iptables: fake_tool(dir, "iptables"),
        iptables_save: fake_tool(dir, "iptables-save"),
        iptables_restore: fake_tool(dir, "iptables-restore"),
        ip6tables: fake_tool(dir, "ip6tables"),
        ip6tables_save: fake_tool(dir, "ip6tables-save"),
        ip6tables_restore: fake_tool(dir, "ip6tables-restore"),
    }
}

/// The argument log written by the fake tools.
pub fn tool_calls(dir: &Path) -> String {
    fs::read_to_string(dir.join("calls.log")).unwrap_or_default()
}

/// Poll until `cond` holds or the timeout elapses.
pub async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

/// A running envelope service backed by fake packet-filter tools.
pub struct TestService {
    pub addr: SocketAddr,
    pub manager: Arc<IpManager>,
    pub shutdown: Shutdown,
    pub tools: tempfile::TempDir,
    pub server: tokio::task::JoinHandle<Result<(), ServerError>>,
}

impl TestService {
    pub fn access_url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!(
                "ws://{}{}?access_token={}",
                self.addr, ACCESS_PATH, token
            ),
            None => format!("ws://{}{}", self.addr, ACCESS_PATH),
        }
    }

    pub fn tool_calls(&self) -> String {
        tool_calls(self.tools.path())
    }
}

/// Start a service with the token gate wired, a grant budget of
/// `max_clients`, and the given session floor.
pub async fn start_service(max_clients: usize, timeout_secs: u64) -> TestService {
    let tools = tempfile::tempdir().expect("tempdir");

    let mut config = EnvelopeConfig::default();
    config.token.machine = MACHINE.to_string();
    config.token.subject = SUBJECT.to_string();
    config.envelope.max_clients = max_clients;
    config.envelope.timeout_secs = timeout_secs;

    let verifier = Arc::new(Verifier::new(&[ed25519_jwk("k1", false)]).expect("verifier"));
    let gate = Arc::new(
        TokenController::new(verifier, &config.token, Paths::new([ACCESS_PATH]))
            .expect("token controller"),
    );
    let manager = Arc::new(IpManager::new(max_clients, fake_tools(tools.path())));
    let shutdown = Shutdown::new();

    let manager_dyn: Arc<dyn Manager> = manager.clone();
    let server = EnvelopeServer::new(&config, Some(gate), None, manager_dyn, shutdown.clone())
        .expect("envelope server");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(server.run(listener));

    TestService {
        addr,
        manager,
        shutdown,
        tools,
        server,
    }
}

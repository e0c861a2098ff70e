//! In-process connection tests.
//!
//! A real connection worker loop ([`serve_connection`]) runs against a
//! client over an in-memory duplex pipe, with real operation executables
//! written to a scratch library directory.
//!
//! Every scenario checks two things: what each side observed, and whether
//! an operation subprocess ran at all (each test op leaves a marker file).

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ceod::client::exchange;
use ceod::config::Paths;
use ceod::dispatch::{DispatchError, Dispatcher};
use ceod::protocol::{
    MSG_EXPLODE, Message, MessageTransport, ProtocolError, ProtocolResult, StreamTransport,
};
use ceod::registry::{Record, Registry};
use ceod::resolve::StaticResolver;
use ceod::security::handshake::{accept_token, initiate};
use ceod::security::keytab::KEY_LEN;
use ceod::security::{
    Keytab, Mechanism, PskAcceptor, PskInitiator, Role, SecurityContext, SecurityError,
    SecurityFlags,
};
use ceod::server::serve_connection;
use tempfile::TempDir;
use tokio::io::{DuplexStream, duplex};
use tokio::time::timeout;
use zeroize::Zeroizing;

const FQDN: &str = "here.example";
const SERVICE: &str = "ceod@here.example";
const PRINCIPAL: &str = "alice@CSCLUB";
const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];

const ECHO: u32 = 0x10;
const FAIL: u32 = 0x11;
const WHOAMI: u32 = 0x12;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    dir: TempDir,
    paths: Paths,
    registry: Registry,
    keytab: Arc<Keytab>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("etc"), dir.path().join("lib"));
        fs::create_dir_all(&paths.config_dir).unwrap();
        fs::create_dir_all(&paths.lib_dir).unwrap();

        let marker = dir.path().join("ran");
        let ops = [
            ("echo", ECHO, "exec /bin/cat".to_string()),
            ("fail", FAIL, "/bin/cat >/dev/null\nexit 1".to_string()),
            ("whoami", WHOAMI, "/bin/cat >/dev/null\nprintf '%s' \"$CEO_USER\"".to_string()),
        ];
        let mut records = Vec::new();
        for (name, msg_type, body) in ops {
            let path = paths.op_path(name);
            let script = format!("#!/bin/sh\n: > {}\n{body}\n", marker.display());
            fs::write(&path, script).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            records.push(Record {
                host: FQDN.to_string(),
                name: name.to_string(),
                msg_type,
            });
        }

        let resolver =
            StaticResolver::new(FQDN).with_host(FQDN, FQDN, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let registry =
            Registry::build(records, &paths, Some(FQDN), &resolver, &BTreeMap::new()).unwrap();

        let mut keytab = Keytab::default();
        keytab.insert(PRINCIPAL, KEY);

        Self {
            dir,
            paths,
            registry,
            keytab: Arc::new(keytab),
        }
    }

    fn op_ran(&self) -> bool {
        self.marker().exists()
    }

    fn marker(&self) -> PathBuf {
        self.dir.path().join("ran")
    }

    fn acceptor(&self) -> SecurityContext {
        SecurityContext::new(
            Role::Acceptor,
            Box::new(PskAcceptor::new(Arc::clone(&self.keytab), SERVICE)),
        )
    }

    /// Run the worker loop over `server_io` until it returns, then drop the
    /// transport so the client sees the close.
    async fn serve(&self, mut server_io: StreamTransport<DuplexStream>) -> ProtocolResult<()> {
        let dispatcher = Dispatcher::new(&self.registry, &self.paths.config_dir);
        let mut security = self.acceptor();
        let result = serve_connection(&dispatcher, &mut server_io, &mut security, "test-peer").await;
        drop(server_io);
        result
    }
}

fn initiator() -> SecurityContext {
    SecurityContext::new(
        Role::Initiator,
        Box::new(PskInitiator::new(PRINCIPAL, Zeroizing::new(KEY), SERVICE)),
    )
}

fn pipe() -> (StreamTransport<DuplexStream>, StreamTransport<DuplexStream>) {
    let (a, b) = duplex(16 * 1024);
    (StreamTransport::new(a), StreamTransport::new(b))
}

#[tokio::test]
async fn test_echo_round_trip() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mut security = initiator();
        let response = exchange(&mut client_io, &mut security, ECHO, b"0123456789").await;
        client_io.close().await.unwrap();
        response
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    server.unwrap();
    assert_eq!(client.unwrap(), b"0123456789");
    assert!(harness.op_ran());
}

#[tokio::test]
async fn test_operation_sees_short_username() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mut security = initiator();
        let response = exchange(&mut client_io, &mut security, WHOAMI, b"x").await;
        client_io.close().await.unwrap();
        response
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    server.unwrap();
    assert_eq!(client.unwrap(), b"alice");
}

#[tokio::test]
async fn test_several_requests_on_one_connection() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mut security = initiator();
        initiate(&mut client_io, &mut security).await.unwrap();
        let mut responses = Vec::new();
        for request in [&b"first"[..], &b"second"[..]] {
            let wrapped = security.wrap(request).unwrap();
            client_io.send(Message::new(ECHO, wrapped)).await.unwrap();
            let reply = client_io.recv().await.unwrap().unwrap();
            assert_eq!(reply.msg_type, ECHO);
            responses.push(security.unwrap(&reply.payload).unwrap());
        }
        client_io.close().await.unwrap();
        responses
    };

    let (server, responses) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    server.unwrap();
    assert_eq!(responses, [b"first".to_vec(), b"second".to_vec()]);
}

#[tokio::test]
async fn test_unknown_type_is_fatal_and_runs_nothing() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mut security = initiator();
        exchange(&mut client_io, &mut security, 0x4242, b"payload").await
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    let err = server.unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(
        err,
        ProtocolError::Dispatch(DispatchError::UnknownOperation { msg_type: 0x4242 })
    ));
    assert!(matches!(
        client.unwrap_err(),
        ProtocolError::ConnectionClosed { .. }
    ));
    assert!(!harness.op_ran());
}

#[tokio::test]
async fn test_reserved_type_is_unknown_operation() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mut security = initiator();
        exchange(&mut client_io, &mut security, MSG_EXPLODE, b"boom").await
    };

    let (server, _client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    assert!(matches!(
        server.unwrap_err(),
        ProtocolError::Dispatch(DispatchError::UnknownOperation { .. })
    ));
    assert!(!harness.op_ran());
}

#[tokio::test]
async fn test_operation_before_handshake_is_violation() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        client_io
            .send(Message::new(ECHO, &b"plaintext"[..]))
            .await
            .unwrap();
        client_io.recv().await
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    let err = server.unwrap_err();
    assert!(matches!(err, ProtocolError::HandshakeViolation { .. }));
    assert!(err.is_protocol_violation());
    assert!(client.unwrap().is_none());
    assert!(!harness.op_ran());
}

#[tokio::test]
async fn test_missing_confidentiality_aborts_before_dispatch() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    // Drive the mechanism directly so the client side does not enforce the
    // policy itself and actually delivers its final token.
    let client = async move {
        let mut mechanism = PskInitiator::new(PRINCIPAL, Zeroizing::new(KEY), SERVICE)
            .with_requested(SecurityFlags::ALL.difference(SecurityFlags::CONF));

        let init = mechanism.step(None).unwrap().token.unwrap();
        client_io.send(Message::auth(init)).await.unwrap();
        let reply = client_io.recv().await.unwrap().unwrap();
        let proof = mechanism.step(Some(&reply.payload)).unwrap();
        assert!(proof.complete);
        client_io
            .send(Message::auth(proof.token.unwrap()))
            .await
            .unwrap();

        let wrapped = mechanism.wrap(b"attempt").unwrap();
        // The server may already be gone; only the outcome on its side matters.
        let _ = client_io.send(Message::new(ECHO, wrapped)).await;
        client_io.recv().await
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    let err = server.unwrap_err();
    assert!(err.is_security_violation());
    match err {
        ProtocolError::Security(SecurityError::PolicyViolation { missing }) => {
            assert!(missing.contains("conf"));
        },
        other => panic!("unexpected error: {other}"),
    }
    assert!(!matches!(client, Ok(Some(_))));
    assert!(!harness.op_ran());
}

#[tokio::test]
async fn test_client_refuses_missing_confidentiality() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mechanism = PskInitiator::new(PRINCIPAL, Zeroizing::new(KEY), SERVICE)
            .with_requested(SecurityFlags::ALL.difference(SecurityFlags::CONF));
        let mut security = SecurityContext::new(Role::Initiator, Box::new(mechanism));
        let result = exchange(&mut client_io, &mut security, ECHO, b"x").await;
        drop(client_io);
        result
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    assert!(client.unwrap_err().is_security_violation());
    // The server never completed its side; the peer just went away.
    server.unwrap();
    assert!(!harness.op_ran());
}

#[tokio::test]
async fn test_handshake_token_after_establishment_is_fatal() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mut security = initiator();
        initiate(&mut client_io, &mut security).await.unwrap();
        client_io.send(Message::auth(vec![1, 2, 3])).await.unwrap();
        client_io.recv().await
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    let err = server.unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(
        err,
        ProtocolError::Security(SecurityError::UnexpectedToken { len: 3 })
    ));
    assert!(client.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_principal_is_rejected() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mut security = SecurityContext::new(
            Role::Initiator,
            Box::new(PskInitiator::new(
                "mallory@CSCLUB",
                Zeroizing::new(KEY),
                SERVICE,
            )),
        );
        exchange(&mut client_io, &mut security, ECHO, b"x").await
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    assert!(matches!(
        server.unwrap_err(),
        ProtocolError::Security(SecurityError::AuthenticationFailed { .. })
    ));
    assert!(matches!(
        client.unwrap_err(),
        ProtocolError::ConnectionClosed { .. }
    ));
    assert!(!harness.op_ran());
}

#[tokio::test]
async fn test_failing_operation_is_fatal() {
    let harness = Harness::new();
    let (mut client_io, server_io) = pipe();

    let client = async move {
        let mut security = initiator();
        exchange(&mut client_io, &mut security, FAIL, b"x").await
    };

    let (server, client) = timeout(TEST_TIMEOUT, async {
        tokio::join!(harness.serve(server_io), client)
    })
    .await
    .unwrap();

    assert!(matches!(
        server.unwrap_err(),
        ProtocolError::Dispatch(DispatchError::Failed { .. })
    ));
    assert!(client.is_err());
    assert!(harness.op_ran());
}

#[tokio::test]
async fn test_client_rejects_mismatched_response_type() {
    let harness = Harness::new();
    let (mut client_io, mut server_io) = pipe();

    // A misbehaving server: completes the handshake, then answers with the
    // wrong type.
    let server = async {
        let mut security = harness.acceptor();
        loop {
            let msg = server_io.recv().await.unwrap().unwrap();
            if msg.is_auth() {
                accept_token(&mut server_io, &mut security, &msg.payload)
                    .await
                    .unwrap();
                continue;
            }
            let request = security.unwrap(&msg.payload).unwrap();
            let wrapped = security.wrap(&request).unwrap();
            server_io
                .send(Message::new(msg.msg_type + 1, wrapped))
                .await
                .unwrap();
            break;
        }
    };
    let client = async move {
        let mut security = initiator();
        exchange(&mut client_io, &mut security, ECHO, b"x").await
    };

    let ((), client) = timeout(TEST_TIMEOUT, async { tokio::join!(server, client) })
        .await
        .unwrap();

    let err = client.unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(
        err,
        ProtocolError::TypeMismatch {
            expected: ECHO,
            got: 0x11
        }
    ));
}

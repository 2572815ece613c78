//! End-to-end session tests over pipe pairs.
//!
//! A "connection" here is two pipes crossed between a client and a server
//! session, which exercises the whole stack (framing, hello, dispatch)
//! without any cryptographic transport.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use netconf2::client;
use netconf2::config::{ClientConfig, ServerConfig};
use netconf2::rpc::{Datastore, Reply, Rpc, RpcError};
use netconf2::server::{DispatchEvent, Server};
use netconf2::xml::Element;
use netconf2::{Session, SessionStatus, TermReason, Version};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two crossed pipe pairs: (client in/out, server in/out).
fn crossed_pipes() -> ((OwnedFd, OwnedFd), (OwnedFd, OwnedFd)) {
    let (c_in, s_out) = nix::unistd::pipe().unwrap();
    let (s_in, c_out) = nix::unistd::pipe().unwrap();
    ((c_in, c_out), (s_in, s_out))
}

/// Establish one client/server session pair over pipes.
fn session_pair(server: &Server) -> (thread::JoinHandle<Session>, Arc<Session>) {
    let ((c_in, c_out), (s_in, s_out)) = crossed_pipes();
    let client = thread::spawn(move || {
        client::connect_fd(&ClientConfig::default(), c_in, c_out).unwrap()
    });
    let server_session = server.accept_fd(s_in, s_out).unwrap();
    (client, server_session)
}

#[test]
fn loopback_negotiates_version_11() {
    init_logging();
    let server = Server::new(ServerConfig::default());
    let (client, server_session) = session_pair(&server);
    let client_session = client.join().unwrap();

    assert_eq!(client_session.version(), Version::V11);
    assert_eq!(server_session.version(), Version::V11);
    assert_eq!(client_session.status(), SessionStatus::Running);
    assert_eq!(server_session.status(), SessionStatus::Running);
    assert_eq!(client_session.session_id(), server_session.session_id());
    // the server advertised its with-defaults mode
    assert!(client_session
        .capabilities()
        .iter()
        .any(|c| c.contains("with-defaults")));
}

#[test]
fn rpc_round_trip_preserves_trees() {
    init_logging();
    let server = Server::new(ServerConfig::default());
    let (client, server_session) = session_pair(&server);

    let config = Element::new("interfaces")
        .with_ns("urn:example:interfaces")
        .with_child(Element::new("interface").with_child(Element::new("name").with_text("eth0")));
    let sent = config.clone();

    let handler = thread::spawn(move || {
        let client_session = client.join().unwrap();
        let reply = client_session
            .call(
                &Rpc::EditConfig {
                    target: Datastore::Candidate,
                    default_operation: None,
                    test_option: None,
                    error_option: None,
                    config: sent,
                },
                5_000,
            )
            .unwrap();
        // the server echoed the config subtree back
        let data = netconf2::rpc::reply_data(&reply).expect("data in reply");
        data.first_child().cloned().unwrap()
    });

    let rpc = server_session.recv_rpc(5_000).unwrap().expect("an rpc");
    let id = rpc.attr("message-id").unwrap().to_string();
    let edit = rpc.first_child().unwrap();
    assert_eq!(edit.name, "edit-config");
    let echoed = edit
        .child("config")
        .and_then(|c| c.first_child())
        .cloned()
        .unwrap();
    server_session
        .send_reply(&id, Reply::Data(echoed))
        .unwrap();

    let received = handler.join().unwrap();
    // parsed trees carry inherited namespaces on every node, so compare
    // the canonical serializations
    assert_eq!(received.to_xml(), config.to_xml());
}

#[test]
fn replies_and_notifications_are_steered_into_queues() {
    init_logging();
    let server = Server::new(ServerConfig::default());
    let (client, server_session) = session_pair(&server);
    let client_session = client.join().unwrap();

    let id = client_session.send_rpc(&Rpc::DiscardChanges).unwrap();

    // the server pushes a notification before answering
    let rpc = server_session.recv_rpc(5_000).unwrap().expect("an rpc");
    assert_eq!(rpc.attr("message-id"), Some(id.to_string().as_str()));
    server_session
        .send_notification(
            "2024-02-29T12:00:00Z",
            Element::new("config-change").with_ns("urn:example:events"),
        )
        .unwrap();
    server_session.send_reply(&id.to_string(), Reply::Ok).unwrap();

    // recv_reply skips past the notification and queues it
    let reply = client_session.recv_reply(id, 5_000).unwrap();
    assert!(netconf2::rpc::reply_is_ok(&reply));
    let notif = client_session.recv_notification(1_000).unwrap();
    assert_eq!(notif.child("eventTime").unwrap().text(), "2024-02-29T12:00:00Z");
    assert!(notif.child("config-change").is_some());
}

#[test]
fn close_session_is_answered_and_torn_down_by_poll() {
    init_logging();
    let server = Server::new(ServerConfig::default());
    let (client, server_session) = session_pair(&server);

    let ps = server.new_poll_set();
    ps.add(Arc::clone(&server_session)).unwrap();

    let closer = thread::spawn(move || {
        let client_session = client.join().unwrap();
        client_session.close();
        client_session
    });

    let handler = |_: &Session, _: &Element| -> Result<Reply, RpcError> { Ok(Reply::Ok) };
    let mut closed = false;
    for _ in 0..50 {
        let (event, session) = ps.poll(500, &handler);
        if event == DispatchEvent::SessionClosed {
            assert_eq!(
                session.unwrap().termination_reason(),
                Some(TermReason::Closed)
            );
            closed = true;
            break;
        }
    }
    assert!(closed, "poll never reported the close");
    assert!(ps.is_empty(), "closed session still in the poll set");

    let client_session = closer.join().unwrap();
    assert_eq!(client_session.status(), SessionStatus::Invalid);
    assert_eq!(client_session.termination_reason(), Some(TermReason::Closed));
    assert_eq!(server_session.status(), SessionStatus::Invalid);
}

#[test]
fn concurrent_poll_dispatches_each_rpc_exactly_once() {
    init_logging();
    let server = Server::new(ServerConfig::default());

    let mut clients = Vec::new();
    let ps = Arc::new(server.new_poll_set());
    for _ in 0..3 {
        let (client, server_session) = session_pair(&server);
        ps.add(server_session).unwrap();
        clients.push(client.join().unwrap());
    }

    // one pending rpc per session before any worker runs
    let mut ids = Vec::new();
    for session in &clients {
        ids.push(session.send_rpc(&Rpc::Get { filter: None }).unwrap());
    }

    let invocations = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for _ in 0..2 {
        let ps = Arc::clone(&ps);
        let invocations = Arc::clone(&invocations);
        let handled = Arc::clone(&handled);
        workers.push(thread::spawn(move || {
            let handler = move |_: &Session, _: &Element| -> Result<Reply, RpcError> {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::Ok)
            };
            while handled.load(Ordering::SeqCst) < 3 {
                let (event, _) = ps.poll(200, &handler);
                if event == DispatchEvent::RpcHandled {
                    handled.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // exactly three handler invocations, no double delivery
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // every client got the reply to its own rpc
    for (session, id) in clients.iter().zip(ids) {
        let reply = session.recv_reply(id, 5_000).unwrap();
        assert_eq!(reply.attr("message-id"), Some(id.to_string().as_str()));
        assert!(netconf2::rpc::reply_is_ok(&reply));
    }
}

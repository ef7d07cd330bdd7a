//! End-to-end tests of the persistent connection against scripted loopback peers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cmdlink::transport::{TcpConnection, TcpServer};
use cmdlink::{Command, ConnectionConfig, ConnectionState, PersistentConnection, Response};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

/// Accept `connections` connections in turn, handing each to `handler`.
/// The listener is handed back when the script is done.
fn spawn_peer<F>(connections: usize, handler: F) -> (SocketAddr, JoinHandle<TcpServer>)
where
    F: Fn(usize, TcpConnection) + Send + 'static,
{
    let server = TcpServer::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr();
    let handle = thread::spawn(move || {
        for index in 0..connections {
            let (conn, _) = server.accept().unwrap();
            handler(index, conn);
        }
        server
    });
    (addr, handle)
}

/// Answer commands until the client closes or goes away.
fn serve<F>(mut conn: TcpConnection, mut reply: F)
where
    F: FnMut(Command) -> Option<Response>,
{
    while let Ok(command) = conn.read_frame::<Command>() {
        if command.command_type == "close" {
            return;
        }
        match reply(command) {
            Some(response) => conn.write_frame(&response).unwrap(),
            None => return,
        };
    }
}

fn test_config(addr: SocketAddr) -> ConnectionConfig {
    ConnectionConfig::default()
        .with_addr(addr)
        .with_io_timeout(Duration::from_secs(2))
        .without_heartbeat()
        .with_max_reconnect_attempts(3)
        .with_reconnect_delays(Duration::from_millis(10), Duration::from_millis(40))
}

fn params(value: Value) -> Option<cmdlink::Params> {
    value.as_object().cloned()
}

#[test]
fn test_success_result_carries_data() {
    let (addr, peer) = spawn_peer(1, |_, conn| {
        serve(conn, |command| {
            assert_eq!(command.command_type, "find_actors_by_name");
            let pattern = command.params.unwrap()["pattern"].clone();
            Some(Response::success(json!({"actors": [pattern]})))
        })
    });

    let conn = PersistentConnection::new(test_config(addr));
    assert!(conn.connect());

    let result = conn.execute("find_actors_by_name", params(json!({"pattern": "Lamp*"})));
    assert!(result.success);
    assert_eq!(result.data, params(json!({"actors": ["Lamp*"]})).unwrap());
    assert!(conn.idle_time() < Duration::from_secs(1));

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_application_error_is_surfaced_without_reconnect() {
    let (addr, peer) = spawn_peer(1, |_, conn| {
        let mut calls = 0;
        serve(conn, move |_| {
            calls += 1;
            Some(if calls == 1 {
                Response::error("Blueprint not found", false)
            } else {
                Response {
                    status: Some("error".to_string()),
                    ..Default::default()
                }
            })
        })
    });

    let conn = PersistentConnection::new(test_config(addr));
    assert!(conn.connect());

    let rejected = conn.execute("compile_blueprint", None);
    assert!(!rejected.success);
    assert_eq!(rejected.error(), Some("Blueprint not found"));
    assert!(!rejected.recoverable);

    let defaulted = conn.execute("compile_blueprint", None);
    assert_eq!(defaulted.error(), Some("Unknown error"));
    assert!(defaulted.recoverable);

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.stats().connect_count, 1);

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_connect_is_idempotent() {
    let (addr, peer) = spawn_peer(1, |_, conn| serve(conn, |_| None));

    let config = test_config(addr).with_heartbeat_interval(Duration::from_secs(30));
    let conn = PersistentConnection::new(config);

    assert!(conn.connect());
    let local = conn.local_addr();
    assert!(conn.heartbeat_running());

    assert!(conn.connect());
    assert!(conn.connect());

    let stats = conn.stats();
    assert_eq!(stats.connect_count, 1);
    assert_eq!(stats.heartbeat_starts, 1);
    assert_eq!(conn.reconnect_attempts(), 0);
    assert_eq!(conn.local_addr(), local);

    conn.disconnect();
    assert!(!conn.heartbeat_running());
    peer.join().unwrap();
}

#[test]
fn test_execute_connects_on_first_use() {
    let (addr, peer) = spawn_peer(1, |_, conn| {
        serve(conn, |_| Some(Response::success(json!({"pong": true}))))
    });

    let conn = PersistentConnection::new(test_config(addr));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    assert!(conn.probe());
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.reconnect_attempts(), 0);

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_probe_requires_pong() {
    let (addr, peer) = spawn_peer(1, |_, conn| {
        let mut calls = 0;
        serve(conn, move |command| {
            assert_eq!(command.command_type, "ping");
            assert!(command.params.is_none());
            calls += 1;
            Some(match calls {
                1 => Response::success(json!({"pong": true})),
                2 => Response::success(json!({})),
                _ => Response::error("busy", true),
            })
        })
    });

    let conn = PersistentConnection::new(test_config(addr));
    assert!(conn.connect());

    assert!(conn.probe());
    assert!(!conn.probe());
    assert!(!conn.probe());
    assert_eq!(conn.state(), ConnectionState::Connected);

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_closed_mid_response_reconnects_and_retries_once() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let peer_seen = Arc::clone(&seen);

    let (addr, peer) = spawn_peer(2, move |index, mut conn| {
        let command: Command = conn.read_frame().unwrap();
        peer_seen.lock().unwrap().push(command.clone());

        if index == 0 {
            // Half a length prefix, then hang up.
            conn.write_encoded(&[0, 0]).unwrap();
            return;
        }

        conn.write_frame(&Response::success(json!({"created": true})))
            .unwrap();
        serve(conn, |_| None);
    });

    let conn = PersistentConnection::new(test_config(addr));
    assert!(conn.connect());

    let result = conn.execute("create_blueprint", params(json!({"name": "BP_Door"})));
    assert!(result.success, "unexpected failure: {:?}", result.error());
    assert_eq!(result.data.get("created"), Some(&json!(true)));
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.stats().connect_count, 2);

    drop(conn);
    peer.join().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
}

#[test]
fn test_second_loss_is_not_retried() {
    let (addr, peer) = spawn_peer(2, |_, mut conn| {
        let _: Command = conn.read_frame().unwrap();
    });

    let conn = PersistentConnection::new(test_config(addr));
    assert!(conn.connect());

    let result = conn.execute("create_blueprint", None);
    assert!(!result.success);
    assert!(result.recoverable);
    assert_eq!(conn.state(), ConnectionState::Error);

    let server = peer.join().unwrap();
    server.set_nonblocking(true).unwrap();
    assert!(server.accept().is_err(), "a third connection was attempted");
}

#[test]
fn test_malformed_reply_is_treated_as_loss() {
    let (addr, peer) = spawn_peer(2, |index, mut conn| {
        let _: Command = conn.read_frame().unwrap();
        if index == 0 {
            let mut frame = vec![0, 0, 0, 5];
            frame.extend_from_slice(b"{nope");
            conn.write_encoded(&frame).unwrap();
            return;
        }
        conn.write_frame(&Response::success(json!({"ok": 1})))
            .unwrap();
        serve(conn, |_| None);
    });

    let conn = PersistentConnection::new(test_config(addr));
    assert!(conn.connect());

    let result = conn.execute("get_context", None);
    assert!(result.success);
    assert_eq!(conn.stats().connect_count, 2);

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_error_reply_with_unexpected_field_types_keeps_connection() {
    let seen = Arc::new(AtomicUsize::new(0));
    let peer_seen = Arc::clone(&seen);

    let (addr, peer) = spawn_peer(1, move |_, mut conn| {
        while let Ok(command) = conn.read_frame::<Command>() {
            if command.command_type == "close" {
                return;
            }
            peer_seen.fetch_add(1, Ordering::SeqCst);
            conn.write_frame(&json!({
                "status": "error",
                "error": {"code": 7, "message": "bad pin"},
                "recoverable": false
            }))
            .unwrap();
        }
    });

    let conn = PersistentConnection::new(test_config(addr));
    assert!(conn.connect());

    let result = conn.execute("set_pin", params(json!({"pin": 3})));
    assert!(!result.success);
    assert!(!result.recoverable);
    assert!(result.error().unwrap().contains("bad pin"));

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.stats().connect_count, 1);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    drop(conn);
    peer.join().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reset_before_write_fails_without_retry() {
    let (release, released) = mpsc::channel::<()>();

    let (addr, peer) = spawn_peer(2, move |index, conn| {
        if index == 0 {
            // Closing with the command still unread resets the connection.
            released.recv().unwrap();
            drop(conn);
            return;
        }
        serve(conn, |_| Some(Response::success(json!({"ok": true}))));
    });

    let config = test_config(addr).with_io_timeout(Duration::from_millis(200));
    let conn = PersistentConnection::new(config);
    assert!(conn.connect());

    let unanswered = conn.execute("get_context", None);
    assert!(unanswered.error().unwrap().contains("timed out"));
    assert_eq!(conn.state(), ConnectionState::Connected);

    release.send(()).unwrap();
    thread::sleep(Duration::from_millis(200));

    let result = conn.execute("get_context", None);
    assert!(!result.success);
    assert!(result.recoverable);
    assert_eq!(conn.state(), ConnectionState::Error);
    let stats = conn.stats();
    assert_eq!(stats.connect_count, 1);
    assert_eq!(stats.reconnect_count, 0);

    // The next call is the one that reconnects.
    let next = conn.execute("get_context", None);
    assert!(next.success, "unexpected failure: {:?}", next.error());
    assert_eq!(conn.state(), ConnectionState::Connected);
    let stats = conn.stats();
    assert_eq!(stats.connect_count, 2);
    assert_eq!(stats.reconnect_count, 1);

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_partial_frame_timeout_is_not_retried() {
    let (addr, peer) = spawn_peer(1, |_, mut conn| {
        let _: Command = conn.read_frame().unwrap();
        // Announce 20 bytes, send 5, then stall past the client's timeout.
        conn.write_encoded(&[0, 0, 0, 20, b'{', b'"', b's', b't', b'a'])
            .unwrap();
        thread::sleep(Duration::from_millis(600));
    });

    let config = test_config(addr).with_io_timeout(Duration::from_millis(200));
    let conn = PersistentConnection::new(config);
    assert!(conn.connect());

    let result = conn.execute("get_context", None);
    assert!(!result.success);
    assert!(result.recoverable);
    assert!(result.error().unwrap().contains("desynchronized"), "{:?}", result.error());
    assert_eq!(conn.state(), ConnectionState::Error);

    let stats = conn.stats();
    assert_eq!(stats.connect_count, 1);
    assert_eq!(stats.reconnect_count, 0);
    assert_eq!(stats.timeouts, 0);

    let server = peer.join().unwrap();
    server.set_nonblocking(true).unwrap();
    assert!(server.accept().is_err(), "the command was retried");
}

#[test]
fn test_refusing_peer_exhausts_attempts() {
    // Bind then drop to get a port nobody listens on.
    let addr = TcpServer::bind("127.0.0.1:0").unwrap().local_addr();

    let conn = PersistentConnection::new(test_config(addr));
    assert!(!conn.connect());

    let started = Instant::now();
    let result = conn.execute("get_context", None);

    assert!(!result.success);
    assert!(result.recoverable);
    assert_eq!(result.error(), Some(cmdlink::connection::NOT_CONNECTED));
    assert_eq!(conn.state(), ConnectionState::Error);
    assert_eq!(conn.reconnect_attempts(), 3);
    assert_eq!(conn.stats().reconnect_count, 3);
    assert!(started.elapsed() < Duration::from_secs(5));

    // Budget spent: further calls fail fast without new attempts.
    let again = conn.execute("get_context", None);
    assert!(!again.success);
    assert_eq!(conn.stats().reconnect_count, 3);
}

#[test]
fn test_explicit_connect_recovers_after_exhaustion() {
    let server = TcpServer::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr();
    drop(server);

    let conn = PersistentConnection::new(test_config(addr));
    let result = conn.execute("get_context", None);
    assert!(!result.success);
    assert_eq!(conn.reconnect_attempts(), 3);

    // The peer comes back on the same port.
    let server = match TcpServer::bind(addr) {
        Ok(server) => server,
        // Port was grabbed by someone else in the meantime.
        Err(_) => return,
    };
    let peer = thread::spawn(move || {
        let (conn, _) = server.accept().unwrap();
        serve(conn, |_| Some(Response::success(json!({"pong": true}))));
    });

    assert!(conn.connect());
    assert_eq!(conn.reconnect_attempts(), 0);
    assert!(conn.probe());

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_timeout_keeps_connection() {
    let (addr, peer) = spawn_peer(1, |_, conn| {
        serve(conn, |command| {
            if command.command_type == "slow" {
                thread::sleep(Duration::from_millis(450));
            }
            Some(Response::success(json!({"which": command.command_type})))
        })
    });

    let config = test_config(addr).with_io_timeout(Duration::from_millis(300));
    let conn = PersistentConnection::new(config);
    assert!(conn.connect());

    let slow = conn.execute("slow", None);
    assert!(!slow.success);
    assert!(slow.recoverable);
    let message = slow.error().unwrap();
    assert!(message.contains("'slow'") && message.contains("timed out after 0.3s"), "{message}");
    assert_eq!(conn.state(), ConnectionState::Connected);

    // The late reply to "slow" must not be mistaken for this one.
    let fast = conn.execute("fast", None);
    assert!(fast.success, "unexpected failure: {:?}", fast.error());
    assert_eq!(fast.data.get("which"), Some(&json!("fast")));

    let stats = conn.stats();
    assert_eq!(stats.connect_count, 1);
    assert_eq!(stats.reconnect_count, 0);
    assert_eq!(stats.timeouts, 1);

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_concurrent_callers_are_serialized() {
    let (addr, peer) = spawn_peer(1, |_, conn| {
        serve(conn, |command| {
            let n = command.params.unwrap()["n"].clone();
            Some(Response::success(json!({"n": n})))
        })
    });

    let conn = Arc::new(PersistentConnection::new(test_config(addr)));
    assert!(conn.connect());

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                for i in 0..10 {
                    let n = worker * 100 + i;
                    let result = conn.execute("echo", params(json!({"n": n})));
                    assert!(result.success);
                    assert_eq!(result.data.get("n"), Some(&json!(n)));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(conn.stats().commands_sent, 80);

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn test_heartbeat_probes_idle_connection() {
    let pings = Arc::new(AtomicUsize::new(0));
    let peer_pings = Arc::clone(&pings);

    let (addr, peer) = spawn_peer(1, move |_, conn| {
        serve(conn, |command| {
            if command.command_type == "ping" {
                peer_pings.fetch_add(1, Ordering::SeqCst);
            }
            Some(Response::success(json!({"pong": true})))
        })
    });

    let config = test_config(addr).with_heartbeat_interval(Duration::from_millis(50));
    let conn = PersistentConnection::new(config);
    assert!(conn.connect());

    thread::sleep(Duration::from_millis(400));
    assert!(pings.load(Ordering::SeqCst) >= 2);

    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(!conn.heartbeat_running());

    // The peer only returns once it has seen the close notification.
    peer.join().unwrap();

    // Nothing probes, or reconnects, a disconnected manager.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.stats().connect_count, 1);
}

#[test]
fn test_heartbeat_skips_busy_connection() {
    let pings = Arc::new(AtomicUsize::new(0));
    let peer_pings = Arc::clone(&pings);

    let (addr, peer) = spawn_peer(1, move |_, conn| {
        serve(conn, |command| {
            if command.command_type == "ping" {
                peer_pings.fetch_add(1, Ordering::SeqCst);
            }
            Some(Response::success(json!({"pong": true})))
        })
    });

    let config = test_config(addr).with_heartbeat_interval(Duration::from_millis(200));
    let conn = PersistentConnection::new(config);
    assert!(conn.connect());

    // Keep the connection busy more often than the heartbeat interval.
    for _ in 0..12 {
        assert!(conn.execute("get_context", None).success);
        thread::sleep(Duration::from_millis(40));
    }
    assert_eq!(pings.load(Ordering::SeqCst), 0);

    drop(conn);
    peer.join().unwrap();
}

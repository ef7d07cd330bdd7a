//! Echo peer example.
//!
//! A minimal command processor: answers `ping` with `{"pong": true}`, ends
//! the session on `close`, and echoes the params of anything else back as
//! the result.
//!
//! Run with: cargo run --example echo_peer
//! Then connect with: cargo run --example client

use std::thread;

use cmdlink::transport::TcpServer;
use cmdlink::{Command, DEFAULT_PORT, Response};
use serde_json::{Value, json};

fn reply_to(command: &Command) -> Response {
    match command.command_type.as_str() {
        "ping" => Response::success(json!({"pong": true})),
        "fail" => Response::error("requested failure", false),
        _ => {
            let params = command.params.clone().unwrap_or_default();
            Response::success(json!({
                "command": command.command_type,
                "echo": Value::Object(params),
            }))
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let bind_addr = format!("127.0.0.1:{DEFAULT_PORT}");
    println!("Starting echo peer on {bind_addr}...");

    let server = TcpServer::bind(bind_addr.as_str())?;
    println!("Listening on {}", server.local_addr());

    for connection in server.incoming() {
        match connection {
            Ok(mut conn) => {
                let peer = conn.peer_addr();
                println!("New connection from {peer}");

                // Handle each connection in a separate thread
                thread::spawn(move || {
                    loop {
                        match conn.read_frame::<Command>() {
                            Ok(command) => {
                                println!("Received: {}", command.command_type);
                                if command.command_type == "close" {
                                    break;
                                }

                                if let Err(e) = conn.write_frame(&reply_to(&command)) {
                                    eprintln!("Failed to send response: {e}");
                                    break;
                                }
                            }
                            Err(e) => {
                                eprintln!("Connection error: {e}");
                                break;
                            }
                        }
                    }
                    println!("Connection closed: {peer}");
                });
            }
            Err(e) => {
                eprintln!("Accept error: {e}");
            }
        }
    }

    Ok(())
}

//! Example control API client
//!
//! Shows the raw JSON-lines protocol a provisioning front end speaks to a
//! running wg-provisioner. Pass the socket path as the first argument.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/run/wg-provisioner/control.sock"));
    println!("Connecting to {:?}", socket_path);

    let mut stream = UnixStream::connect(&socket_path)?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let requests = [
        ("Getting status", r#"{"id":"req-1","action":"status"}"#),
        (
            "Creating account",
            r#"{"id":"req-2","action":"create_account","account":"demo","max_connections":2}"#,
        ),
        (
            "Provisioning a peer",
            r#"{"id":"req-3","action":"create_peer","account":"demo","label":"laptop"}"#,
        ),
        (
            "Listing peers",
            r#"{"id":"req-4","action":"list_peers","account":"demo"}"#,
        ),
        (
            "Removing account",
            r#"{"id":"req-5","action":"remove_account","account":"demo"}"#,
        ),
    ];

    let mut response = String::new();
    for (title, request) in requests {
        println!("\n--- {} ---", title);
        writeln!(stream, "{}", request)?;

        response.clear();
        reader.read_line(&mut response)?;
        println!("Response: {}", response.trim_end());
    }

    Ok(())
}

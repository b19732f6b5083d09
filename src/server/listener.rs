use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use interprocess::local_socket::tokio::{LocalSocketListener, LocalSocketStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::ipc::{read_frame_async, write_frame_async, CliToConsole, ConsoleToCli};

use super::coordinator::ConsoleEvent;

fn is_path_name(name: &str) -> bool {
    !name.starts_with('@')
}

/// Binds the console socket. A leftover socket file from a console that
/// died is replaced; a live console is an error.
pub fn bind(name: &str) -> Result<LocalSocketListener> {
    if is_path_name(name) && Path::new(name).exists() {
        if interprocess::local_socket::LocalSocketStream::connect(name).is_ok() {
            return Err(anyhow!("A console is already listening on {name}"));
        }
        fs::remove_file(name).with_context(|| format!("Failed to remove stale socket {name}"))?;
    }

    LocalSocketListener::bind(name).with_context(|| format!("Failed to bind {name}"))
}

pub fn cleanup(name: &str) {
    if is_path_name(name) {
        if let Err(e) = fs::remove_file(name) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(socket = name, error = %e, "Failed to remove socket");
            }
        }
    }
}

pub async fn loop_listener(
    listener: LocalSocketListener,
    inbox: UnboundedSender<ConsoleEvent>,
) -> Result<()> {
    loop {
        let conn = listener.accept().await?;
        let inbox = inbox.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(conn, inbox).await {
                let e = format!("{e:#}");
                warn!(error = %e, "Client connection failed");
            }
        });
    }
}

async fn handle_conn(mut conn: LocalSocketStream, inbox: UnboundedSender<ConsoleEvent>) -> Result<()> {
    let request: CliToConsole = read_frame_async(&mut conn).await?;
    debug!(?request, "Client request");

    let (reply, reply_rx) = oneshot::channel();
    inbox
        .send(ConsoleEvent::Request { request, reply })
        .map_err(|_| anyhow!("Console inbox closed"))?;
    let response = reply_rx.await.unwrap_or_else(|_| ConsoleToCli::Error {
        e: "Console dropped the request".to_string(),
    });

    write_frame_async(&mut conn, &response).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ipc::send_command;
    use crate::utils::scratch_dir;

    #[tokio::test]
    async fn requests_round_trip_through_the_socket() {
        let dir = scratch_dir("listener");
        let name = dir.join("console.sock").to_string_lossy().into_owned();

        let listener = bind(&name).unwrap();
        let (tx, mut inbox) = tokio::sync::mpsc::unbounded_channel();
        let listen = tokio::spawn(loop_listener(listener, tx));

        let client_name = name.clone();
        let client =
            tokio::task::spawn_blocking(move || send_command(&client_name, CliToConsole::Describe));

        match inbox.recv().await {
            Some(ConsoleEvent::Request { request, reply }) => {
                assert!(matches!(request, CliToConsole::Describe));
                reply
                    .send(ConsoleToCli::Runner {
                        description: "test runner".to_string(),
                    })
                    .unwrap();
            }
            _ => panic!("expected a request"),
        }

        let response = client.await.unwrap().unwrap();
        assert_eq!(
            response,
            ConsoleToCli::Runner {
                description: "test runner".to_string()
            }
        );

        // a second console must not steal a live socket
        assert!(bind(&name).is_err());

        listen.abort();
        cleanup(&name);
        assert!(!Path::new(&name).exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = scratch_dir("listener_stale");
        let name = dir.join("console.sock").to_string_lossy().into_owned();
        fs::write(&name, b"").unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let _listener = bind(&name).unwrap();
        });

        cleanup(&name);
        let _ = fs::remove_dir_all(&dir);
    }
}

use anyhow::{Context, Result};
use interprocess::local_socket::LocalSocketStream;

use crate::ipc::{read_frame, write_frame, CliToConsole, ConsoleToCli};

fn connect_socket(name: &str) -> Result<LocalSocketStream> {
    LocalSocketStream::connect(name)
        .with_context(|| format!("No console listening on {name}; start one with `homelab serve`"))
}

pub fn send_command(name: &str, cmd: CliToConsole) -> Result<ConsoleToCli> {
    let mut conn = connect_socket(name)?;
    write_frame(&mut conn, &cmd)?;
    read_frame(&mut conn)
}

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use interprocess::local_socket::NameTypeSupport;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::Job;
use crate::utils::AppPaths;

const MAX_FRAME_LEN: usize = 1 << 20;

/// A job as described by a client. The console turns it into a [`Job`], so
/// identity is always minted by the process that records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn into_job(self) -> Job {
        Job::builder(self.name, self.argv, self.cwd)
            .envs(self.env)
            .build()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum CliToConsole {
    Submit { job: JobRequest },
    Describe,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleToCli {
    Error { e: String },
    Submitted { run_id: String },
    Runner { description: String },
}

/// One console per app root. Namespaced names carry a digest of the root
/// so consoles for different roots never answer each other's clients.
pub fn socket_name(paths: &AppPaths) -> String {
    use NameTypeSupport::*;
    match NameTypeSupport::ALWAYS_AVAILABLE {
        OnlyPaths => paths.socket_path().to_string_lossy().into_owned(),
        OnlyNamespaced | Both => {
            let root = paths.root.to_string_lossy();
            let digest = Uuid::new_v5(&Uuid::NAMESPACE_URL, root.as_bytes()).simple().to_string();
            format!("@homelab-console-{}.sock", &digest[..16])
        }
    }
}

// Frames are a little-endian u32 length followed by a postcard body.

fn encode<T: serde::Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = postcard::to_allocvec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(anyhow!("Message of {} bytes exceeds frame limit", body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn frame_len(header: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("Frame of {len} bytes exceeds frame limit"));
    }
    Ok(len)
}

pub fn write_frame<W: Write, T: serde::Serialize>(w: &mut W, msg: &T) -> Result<()> {
    w.write_all(&encode(msg)?)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;
    let mut buf = vec![0u8; frame_len(header)?];
    r.read_exact(&mut buf)?;
    Ok(postcard::from_bytes(&buf)?)
}

pub async fn write_frame_async<W, T>(w: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    w.write_all(&encode(msg)?).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame_async<R, T>(r: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;
    let mut buf = vec![0u8; frame_len(header)?];
    r.read_exact(&mut buf).await?;
    Ok(postcard::from_bytes(&buf)?)
}

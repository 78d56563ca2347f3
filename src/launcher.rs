//! Spawning the consumer process and handing it one end of a socket pair

use anyhow::{Context, Result};
use handoff_ipc::{SeqPacketTransport, SOCKET_FD_ENV};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// The spawned consumer; killed on drop if still running
pub struct ConsumerProcess {
    child: Option<Child>,
}

impl ConsumerProcess {
    /// Wait for the consumer to exit on its own
    pub fn wait(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let status = child.wait().context("Failed to wait for consumer")?;
            info!("Consumer exited with {}", status);
        }
        Ok(())
    }
}

impl Drop for ConsumerProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("Killing consumer process {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: F_SETFD only changes descriptor flags of an fd we own
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error()).context("Failed to set FD_CLOEXEC");
    }
    Ok(())
}

/// Re-run this executable as the consumer, connected by a seqpacket socket pair
pub fn spawn_consumer() -> Result<(SeqPacketTransport, ConsumerProcess)> {
    // Created without CLOEXEC so the consumer end survives exec
    let (producer_sock, consumer_sock) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .context("Failed to create socket pair")?;

    // Our end must not leak into the child
    set_cloexec(producer_sock.as_raw_fd())?;

    let exe_path = std::env::current_exe().context("Failed to get current executable path")?;
    debug!(
        "Spawning consumer: {:?} (producer fd {}, consumer fd {})",
        exe_path,
        producer_sock.as_raw_fd(),
        consumer_sock.as_raw_fd()
    );

    let child = Command::new(&exe_path)
        .arg("--consumer")
        .env(SOCKET_FD_ENV, consumer_sock.as_raw_fd().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .context("Failed to spawn consumer")?;

    info!("Spawned consumer process {}", child.id());

    // The child holds its own copy now
    drop(consumer_sock);

    Ok((
        SeqPacketTransport::from_fd(producer_sock),
        ConsumerProcess { child: Some(child) },
    ))
}

/// Adopt the socket passed down by the producer
pub fn inherited_transport() -> Result<SeqPacketTransport> {
    let raw: RawFd = std::env::var(SOCKET_FD_ENV)
        .with_context(|| format!("{} not set; the consumer is started by the producer", SOCKET_FD_ENV))?
        .parse()
        .with_context(|| format!("{} is not a file descriptor", SOCKET_FD_ENV))?;

    // Don't pass it on to anything we spawn
    set_cloexec(raw)?;

    // SAFETY: the parent handed this fd to us alone and nothing else in this process owns it
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    debug!("Adopted inherited socket fd {}", raw);
    Ok(SeqPacketTransport::from_fd(fd))
}

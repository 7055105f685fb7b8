//! Multi-process coordination.
//!
//! One process per rank, rendezvousing over a local TCP socket: rank 0
//! listens, every other rank dials in and identifies itself. On top of the
//! sockets sit the two collectives the sample loop needs, a rank-0 broadcast
//! and a barrier.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use tracing::info;

use animate_rs_common::accelerator_count;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Matches the original launcher's rendezvous port range.
pub fn pick_rendezvous_port() -> u16 {
    rand::thread_rng().gen_range(10_000..20_000)
}

/// Each rank drives one accelerator, so a run cannot span more ranks than
/// there are visible devices.
pub fn validate_world_size(world_size: usize) -> Result<()> {
    if world_size == 0 {
        bail!("world size must be at least 1");
    }
    let available = accelerator_count();
    if world_size > available {
        bail!("world size {world_size} exceeds the {available} visible accelerator(s)");
    }
    Ok(())
}

#[derive(Debug)]
enum Role {
    /// Rank 0 holds one stream per worker, indexed by rank - 1.
    Main { peers: Vec<TcpStream> },
    Worker { main: TcpStream },
}

#[derive(Debug)]
pub struct DistContext {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl DistContext {
    /// Rendezvous all `world_size` processes on `127.0.0.1:port`. Returns
    /// once every rank is connected.
    pub fn bootstrap(rank: usize, world_size: usize, port: u16) -> Result<Self> {
        if rank >= world_size {
            bail!("rank {rank} out of range for world size {world_size}");
        }
        let addr = format!("127.0.0.1:{port}");
        let role = if rank == 0 {
            let listener = TcpListener::bind(&addr)
                .with_context(|| format!("cannot listen on rendezvous address {addr}"))?;
            let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
            for _ in 1..world_size {
                let (mut stream, _) = listener.accept().context("rendezvous accept failed")?;
                let peer_rank = stream.read_u32::<BigEndian>()? as usize;
                if peer_rank == 0 || peer_rank >= world_size {
                    bail!("unexpected rank {peer_rank} at rendezvous");
                }
                peers[peer_rank - 1] = Some(stream);
            }
            let peers = peers
                .into_iter()
                .map(|p| p.context("a rank connected twice at rendezvous"))
                .collect::<Result<Vec<_>>>()?;
            info!("rank 0: all {world_size} ranks connected");
            Role::Main { peers }
        } else {
            let deadline = Instant::now() + CONNECT_TIMEOUT;
            let mut main = loop {
                match TcpStream::connect(&addr) {
                    Ok(stream) => break stream,
                    Err(_) if Instant::now() < deadline => {
                        std::thread::sleep(CONNECT_RETRY);
                    }
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("cannot reach rendezvous address {addr}"));
                    }
                }
            };
            main.write_u32::<BigEndian>(rank as u32)?;
            main.flush()?;
            Role::Worker { main }
        };
        Ok(Self {
            rank,
            world_size,
            role,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    /// Length-prefixed broadcast from rank 0. Every rank returns the same
    /// bytes, rank 0 its own input.
    pub fn broadcast(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        match &mut self.role {
            Role::Main { peers } => {
                for peer in peers.iter_mut() {
                    peer.write_u64::<BigEndian>(payload.len() as u64)?;
                    peer.write_all(payload)?;
                    peer.flush()?;
                }
                Ok(payload.to_vec())
            }
            Role::Worker { main } => {
                let len = main.read_u64::<BigEndian>()? as usize;
                let mut buf = vec![0u8; len];
                main.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }

    /// Broadcast a UTF-8 path from rank 0 so every rank resolves the same
    /// output directory.
    pub fn broadcast_string(&mut self, value: &str) -> Result<String> {
        let bytes = self.broadcast(value.as_bytes())?;
        String::from_utf8(bytes).context("broadcast payload is not valid UTF-8")
    }

    /// Block until every rank has arrived. Workers check in, then rank 0
    /// releases them.
    pub fn barrier(&mut self) -> Result<()> {
        match &mut self.role {
            Role::Main { peers } => {
                for peer in peers.iter_mut() {
                    let mut byte = [0u8; 1];
                    peer.read_exact(&mut byte)?;
                }
                for peer in peers.iter_mut() {
                    peer.write_all(&[1u8])?;
                    peer.flush()?;
                }
            }
            Role::Worker { main } => {
                main.write_all(&[1u8])?;
                main.flush()?;
                let mut byte = [0u8; 1];
                main.read_exact(&mut byte)?;
            }
        }
        Ok(())
    }
}

/// Re-exec the current binary once per rank, handing each its rank and the
/// shared rendezvous port.
pub fn spawn_workers(config: &Path, world_size: usize, port: u16) -> Result<Vec<Child>> {
    let exe = std::env::current_exe().context("cannot resolve the current executable")?;
    let mut children = Vec::with_capacity(world_size);
    for rank in 0..world_size {
        let child = Command::new(&exe)
            .arg("--config")
            .arg(config)
            .arg("--dist")
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--world_size")
            .arg(world_size.to_string())
            .arg("--port")
            .arg(port.to_string())
            .spawn()
            .with_context(|| format!("cannot spawn worker for rank {rank}"))?;
        children.push(child);
    }
    Ok(children)
}

/// Wait for every worker; any nonzero exit fails the whole run.
pub fn wait_workers(children: Vec<Child>) -> Result<()> {
    for (rank, mut child) in children.into_iter().enumerate() {
        let status = child
            .wait()
            .with_context(|| format!("cannot wait on worker rank {rank}"))?;
        if !status.success() {
            bail!("worker rank {rank} exited with {status}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        // Bind port 0, note the assignment, release it for bootstrap.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn rendezvous_port_is_in_range() {
        for _ in 0..32 {
            let port = pick_rendezvous_port();
            assert!((10_000..20_000).contains(&port));
        }
    }

    #[test]
    fn rank_out_of_range_is_fatal() {
        let err = DistContext::bootstrap(2, 2, free_port()).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn broadcast_and_barrier_across_two_ranks() {
        let port = free_port();
        let worker = std::thread::spawn(move || {
            let mut ctx = DistContext::bootstrap(1, 2, port).unwrap();
            let dir = ctx.broadcast_string("").unwrap();
            ctx.barrier().unwrap();
            dir
        });
        let mut main = DistContext::bootstrap(0, 2, port).unwrap();
        assert!(main.is_main());
        let sent = main.broadcast_string("samples/run-42").unwrap();
        main.barrier().unwrap();
        assert_eq!(sent, "samples/run-42");
        assert_eq!(worker.join().unwrap(), "samples/run-42");
    }

    #[test]
    fn zero_world_size_is_rejected() {
        assert!(validate_world_size(0).is_err());
    }
}

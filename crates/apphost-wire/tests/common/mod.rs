//! In-process stand-in for the local daemon.
//!
//! Speaks the control protocol on an ephemeral loopback port: keeps a table
//! of registered ports, forwards queries to them and answers resolves from
//! a fixed table. Registrations live as long as their control connection.

#![allow(dead_code)]

use apphost_wire::frame::{FrameReadExt, FrameWriteExt};
use apphost_wire::{ClientConfig, Identity, Network};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

pub const IDENTITY_LEN: usize = 33;

pub fn key(fill: u8) -> [u8; IDENTITY_LEN] {
    let mut key = [fill; IDENTITY_LEN];
    key[0] = 0x02;
    key
}

/// Identity the daemon presents as the caller of forwarded queries.
pub fn caller() -> Identity {
    Identity::Node(key(0xaa))
}

/// Identity of the local node once it is known.
pub fn local_node() -> Identity {
    Identity::Node(key(0x11))
}

/// Identity `alice` resolves to.
pub fn alice() -> Identity {
    Identity::Node(key(0x22))
}

struct Registration {
    forward_addr: String,
    drop_signal: Arc<Notify>,
}

#[derive(Default)]
struct State {
    ports: Mutex<HashMap<String, Registration>>,
    register_code: AtomicU8,
    unknown_identity_answers: AtomicUsize,
    resolves: AtomicUsize,
}

pub struct FakeDaemon {
    addr: SocketAddr,
    state: Arc<State>,
}

impl FakeDaemon {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle(conn, state).await;
                });
            }
        });
        Self { addr, state }
    }

    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::with_daemon(self.addr.to_string());
        config.identity_poll_ms = 5;
        config
    }

    pub fn network(&self) -> Network {
        Network::new(self.config())
    }

    /// Result code returned to the next registrations instead of success.
    pub fn fail_registrations_with(&self, code: u8) {
        self.state.register_code.store(code, Ordering::SeqCst);
    }

    /// Answer `n` local identity lookups with the all-zero identity first.
    pub fn delay_identity(&self, n: usize) {
        self.state
            .unknown_identity_answers
            .store(n, Ordering::SeqCst);
    }

    pub fn resolve_count(&self) -> usize {
        self.state.resolves.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, port: &str) -> bool {
        self.state.ports.lock().unwrap().contains_key(port)
    }

    /// End the registration of `port` from the daemon side.
    pub fn drop_registration(&self, port: &str) {
        if let Some(reg) = self.state.ports.lock().unwrap().get(port) {
            reg.drop_signal.notify_one();
        }
    }

    /// Wait until `port` is no longer registered.
    pub async fn wait_unregistered(&self, port: &str) {
        for _ in 0..200 {
            if !self.is_registered(port) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{port} still registered");
    }
}

type Res<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

async fn handle(mut conn: TcpStream, state: Arc<State>) -> Res<()> {
    let op = conn.read_string8().await?;
    match op.as_str() {
        "register" => register(conn, state).await,
        "query" => query(conn, state).await,
        "resolve" => resolve(conn, state).await,
        other => Err(format!("unknown op {other}").into()),
    }
}

async fn register(mut conn: TcpStream, state: Arc<State>) -> Res<()> {
    let port = conn.read_string8().await?;
    let target = conn.read_string8().await?;

    let forced = state.register_code.load(Ordering::SeqCst);
    let drop_signal = Arc::new(Notify::new());
    let code = {
        let mut ports = state.ports.lock().unwrap();
        if forced != 0 {
            forced
        } else if ports.contains_key(&port) {
            0x04
        } else {
            let forward_addr = target.strip_prefix("tcp:").unwrap_or(&target).to_string();
            ports.insert(
                port.clone(),
                Registration {
                    forward_addr,
                    drop_signal: Arc::clone(&drop_signal),
                },
            );
            0x00
        }
    };
    conn.write_all(&[code]).await?;
    if code != 0 {
        return Ok(());
    }

    // Hold the registration until the client hangs up or the test drops it.
    let mut buf = [0u8; 16];
    loop {
        tokio::select! {
            n = tokio::io::AsyncReadExt::read(&mut conn, &mut buf) => {
                if matches!(n, Ok(0) | Err(_)) {
                    break;
                }
            }
            _ = drop_signal.notified() => break,
        }
    }
    state.ports.lock().unwrap().remove(&port);
    Ok(())
}

async fn query(mut conn: TcpStream, state: Arc<State>) -> Res<()> {
    let _target = conn.read_identity().await?;
    let port = conn.read_string8().await?;

    let forward_addr = state
        .ports
        .lock()
        .unwrap()
        .get(&port)
        .map(|r| r.forward_addr.clone());
    let Some(forward_addr) = forward_addr else {
        conn.write_all(&[0x01]).await?;
        return Ok(());
    };

    let mut service = match TcpStream::connect(forward_addr.as_str()).await {
        Ok(s) => s,
        Err(_) => {
            conn.write_all(&[0x02]).await?;
            return Ok(());
        }
    };
    service.write_identity(&caller()).await?;
    service.write_string8(&port).await?;
    match service.read_int8().await {
        Ok(0) => {
            conn.write_all(&[0x00]).await?;
            let _ = tokio::io::copy_bidirectional(&mut conn, &mut service).await;
        }
        _ => {
            conn.write_all(&[0x01]).await?;
        }
    }
    Ok(())
}

async fn resolve(mut conn: TcpStream, state: Arc<State>) -> Res<()> {
    let name = conn.read_string8().await?;
    state.resolves.fetch_add(1, Ordering::SeqCst);
    let identity = match name.as_str() {
        "localnode" => {
            let pending = state.unknown_identity_answers.load(Ordering::SeqCst);
            if pending > 0 {
                state
                    .unknown_identity_answers
                    .store(pending - 1, Ordering::SeqCst);
                Some(Identity::Local)
            } else {
                Some(local_node())
            }
        }
        "alice" => Some(alice()),
        _ => None,
    };
    match identity {
        Some(identity) => {
            conn.write_all(&[0x00]).await?;
            conn.write_identity(&identity).await?;
        }
        None => conn.write_all(&[0xff]).await?,
    }
    Ok(())
}

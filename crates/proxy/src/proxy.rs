//! The proxy server: one TCP listener per protocol generation, the session
//! registry, the unlinked login flow, and the per-direction pump tasks that
//! drive frames through the interception tables.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::cipher::console::ConsoleCipher;
use crate::cipher::detect::{DetectorCipher, ImitatorCipher, KeyDetector};
use crate::cipher::stream::StreamCipher;
use crate::cipher::PacketCipher;
use crate::commands::process_frame;
use crate::error::ProxyError;
use crate::frame::{encode_frame, Frame, FrameReader};
use crate::services::{License, Services};
use crate::session::{
    Action, Outbound, SessionState, Transport, LICENSED_IDLE_TIMEOUT, UNLICENSED_ID_BASE,
    UNLICENSED_IDLE_TIMEOUT,
};
use crate::version::GameVersion;
use crate::wire;

const OUTBOUND_QUEUE_DEPTH: usize = 512;
const READ_BUFFER_SIZE: usize = 4096;

type CipherSlot = Arc<Mutex<Option<Box<dyn PacketCipher>>>>;

fn empty_slot() -> CipherSlot {
    Arc::new(Mutex::new(None))
}

#[derive(Debug, Clone, Copy)]
struct ListenerEntry {
    version: GameVersion,
    default_destination: Option<SocketAddrV4>,
}

/// The registry owns every session; sessions refer back to it only through
/// the `Arc` handed to their tasks.
pub struct ProxyServer {
    services: Services,
    sessions: Mutex<HashMap<u64, Arc<LinkedSession>>>,
    listeners: Mutex<HashMap<u16, ListenerEntry>>,
    next_unlicensed_id: Mutex<u64>,
}

impl ProxyServer {
    pub fn new(services: Services) -> Arc<Self> {
        Arc::new(Self {
            services,
            sessions: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_unlicensed_id: Mutex::new(UNLICENSED_ID_BASE),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    async fn take_unlicensed_id(&self) -> u64 {
        let mut next = self.next_unlicensed_id.lock().await;
        let id = *next;
        *next = next.wrapping_add(1);
        if *next == 0 {
            *next = UNLICENSED_ID_BASE;
        }
        id
    }

    /// Opens a listening port for one generation. Returns the bound port
    /// (useful when asked for port 0).
    pub async fn listen(
        self: &Arc<Self>,
        port: u16,
        version: GameVersion,
        default_destination: Option<SocketAddrV4>,
    ) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind listener port {port}"))?;
        let port = listener.local_addr()?.port();
        self.register_virtual_port(port, version, default_destination)
            .await;
        info!("proxy.listen port={port} version={version}");

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!("proxy.accept port={port} version={version} peer={peer}");
                        let local = match stream.local_addr() {
                            Ok(SocketAddr::V4(v4)) => Some(v4),
                            _ => None,
                        };
                        let server = server.clone();
                        tokio::spawn(async move {
                            server
                                .on_client_connect(Box::new(stream), local, port, version)
                                .await;
                        });
                    }
                    Err(e) => {
                        error!("proxy.accept_failed port={port} error={e}");
                        break;
                    }
                }
            }
        });
        Ok(port)
    }

    /// Registers a port's generation without binding a socket, so virtual
    /// connections can be routed to it.
    pub async fn register_virtual_port(
        &self,
        port: u16,
        version: GameVersion,
        default_destination: Option<SocketAddrV4>,
    ) {
        self.listeners.lock().await.insert(
            port,
            ListenerEntry {
                version,
                default_destination,
            },
        );
    }

    /// Attaches an in-process transport as if it had connected to `port`.
    /// Unregistered ports drop the connection.
    pub async fn connect_virtual(self: &Arc<Self>, port: u16, transport: Transport) {
        let Some(entry) = self.listeners.lock().await.get(&port).copied() else {
            warn!("proxy.virtual.unregistered_port port={port}");
            return;
        };
        info!("proxy.virtual.accept port={port} version={}", entry.version);
        let server = self.clone();
        tokio::spawn(async move {
            server
                .on_client_connect(transport, None, port, entry.version)
                .await;
        });
    }

    async fn default_destination_for(&self, port: u16) -> Option<SocketAddrV4> {
        self.listeners
            .lock()
            .await
            .get(&port)
            .and_then(|e| e.default_destination)
    }

    async fn on_client_connect(
        self: &Arc<Self>,
        transport: Transport,
        local_addr: Option<SocketAddrV4>,
        port: u16,
        version: GameVersion,
    ) {
        let default_destination = self.default_destination_for(port).await;

        // Patch clients never log in to us; with a preset destination the
        // session links immediately.
        if version == GameVersion::Patch {
            let Some(destination) = default_destination else {
                error!("proxy.patch.no_destination port={port}");
                return;
            };
            let id = self.take_unlicensed_id().await;
            let session = LinkedSession::create(id, version, port, &self.services);
            session.state.lock().await.next_destination = Some(destination);
            self.sessions.lock().await.insert(id, session.clone());
            info!("proxy.session.opened id={id:016X} version={version} direct=true");
            let (read, write) = tokio::io::split(transport);
            if let Err(e) = session
                .resume(self, read, write, local_addr, None, None)
                .await
            {
                error!("proxy.session.link_failed id={id:016X} error={e:#}");
            }
            return;
        }

        if let Err(e) = self
            .run_unlinked(transport, local_addr, port, version, default_destination)
            .await
        {
            warn!("proxy.unlinked.closed port={port} version={version} error={e:#}");
        }
    }

    /// The unlinked phase: greet the client with a synthesized server-init,
    /// arm ciphers, and wait for exactly one login frame.
    async fn run_unlinked(
        self: &Arc<Self>,
        transport: Transport,
        local_addr: Option<SocketAddrV4>,
        port: u16,
        version: GameVersion,
        default_destination: Option<SocketAddrV4>,
    ) -> anyhow::Result<()> {
        let (mut read, mut write) = tokio::io::split(transport);

        let mut in_cipher: Box<dyn PacketCipher>;
        let out_cipher: Box<dyn PacketCipher>;
        let mut detector: Option<Arc<KeyDetector>> = None;

        match version {
            GameVersion::Dc | GameVersion::Pc | GameVersion::Gc => {
                let server_seed: u32 = rand::random();
                let client_seed: u32 = rand::random();
                let payload = wire::build_server_init_v2(false, server_seed, client_seed);
                let frame = Frame::new(version.server_init_opcode(), 0, payload);
                write.write_all(&encode_frame(version, &frame, None)?).await?;
                if version == GameVersion::Gc {
                    in_cipher = Box::new(ConsoleCipher::new(client_seed));
                    out_cipher = Box::new(ConsoleCipher::new(server_seed));
                } else {
                    in_cipher = Box::new(StreamCipher::new(client_seed));
                    out_cipher = Box::new(StreamCipher::new(server_seed));
                }
            }
            GameVersion::Bb => {
                let mut server_seed = [0u8; wire::BB_SEED_SIZE];
                let mut client_seed = [0u8; wire::BB_SEED_SIZE];
                rand::thread_rng().fill_bytes(&mut server_seed[..]);
                rand::thread_rng().fill_bytes(&mut client_seed[..]);
                let payload = wire::build_server_init_bb(&server_seed, &client_seed);
                let frame = Frame::new(version.server_init_opcode(), 0, payload);
                write.write_all(&encode_frame(version, &frame, None)?).await?;
                let shared = KeyDetector::new(
                    self.services.keys.candidate_keys(),
                    wire::BB_FIRST_FRAME.to_vec(),
                );
                detector = Some(shared.clone());
                in_cipher = Box::new(DetectorCipher::new(shared.clone(), &client_seed));
                out_cipher = Box::new(ImitatorCipher::new(shared, &server_seed));
            }
            GameVersion::Patch => unreachable!("patch sessions are always direct-linked"),
        }

        let login = self
            .read_login_frame(&mut read, version, in_cipher.as_mut())
            .await?;

        let mut sub_version = 0u32;
        let mut character_name = String::new();
        let mut client_config: Option<wire::ClientConfig> = None;
        let mut login_blob = Vec::new();

        let license: Option<Arc<License>> = match version {
            GameVersion::Dc | GameVersion::Pc => {
                let cmd = parse_login_v2(&login.payload)?;
                sub_version = cmd.sub_version;
                character_name = wire::cstr(&cmd.name);
                let serial = u32::from_str_radix(wire::cstr(&cmd.serial_number).trim(), 16)
                    .map_err(|_| ProxyError::framing("login serial is not hex"))?;
                self.services
                    .licenses
                    .verify_desktop(serial, &wire::cstr(&cmd.access_key))
            }
            GameVersion::Gc => {
                if login.payload.len() < wire::LOGIN_CONSOLE_SIZE {
                    return Err(ProxyError::framing("console login too short").into());
                }
                let cmd = parse_login_v2(&login.payload)?;
                sub_version = cmd.sub_version;
                character_name = wire::cstr(&cmd.name);
                client_config = Some(wire::ClientConfig::from_bytes(
                    &login.payload[wire::LOGIN_V2_SIZE..wire::LOGIN_CONSOLE_SIZE],
                )?);
                let serial = u32::from_str_radix(wire::cstr(&cmd.serial_number).trim(), 16)
                    .map_err(|_| ProxyError::framing("login serial is not hex"))?;
                self.services
                    .licenses
                    .verify_console(serial, &wire::cstr(&cmd.access_key))
            }
            GameVersion::Bb => {
                let (username, password) = wire::parse_login_bb(&login.payload)?;
                login_blob = login.payload.clone();
                self.services.licenses.verify_online(&username, &password)
            }
            GameVersion::Patch => unreachable!(),
        };

        let Some(license) = license else {
            warn!("proxy.unlinked.no_license port={port} version={version}");
            return Ok(());
        };

        // An existing session for this license is resumed with the new
        // transport and ciphers; otherwise a destination must come from the
        // client config or the listener default.
        let existing = self
            .sessions
            .lock()
            .await
            .get(&(license.serial_number as u64))
            .cloned();
        let session = match existing {
            Some(session) => {
                if session.version != version {
                    error!(
                        "proxy.session.version_mismatch id={:016X} have={} got={version}",
                        session.id, session.version
                    );
                    return Ok(());
                }
                info!("proxy.session.resume id={:016X}", session.id);
                session
            }
            None => {
                let destination = match client_config {
                    Some(cfg) if cfg.is_ours() => Some(SocketAddrV4::new(
                        Ipv4Addr::from(cfg.destination_address),
                        cfg.destination_port,
                    )),
                    _ => default_destination,
                };
                let Some(destination) = destination else {
                    error!(
                        "proxy.unlinked.no_destination port={port} serial={:08X}",
                        license.serial_number
                    );
                    return Ok(());
                };
                let session = LinkedSession::create(
                    license.serial_number as u64,
                    version,
                    port,
                    &self.services,
                );
                {
                    let mut st = session.state.lock().await;
                    st.license = Some(license.clone());
                    st.next_destination = Some(destination);
                    if let Some(cfg) = client_config.filter(|c| c.is_ours()) {
                        st.config = cfg;
                    }
                }
                self.sessions
                    .lock()
                    .await
                    .insert(license.serial_number as u64, session.clone());
                info!(
                    "proxy.session.opened id={:016X} version={version} destination={destination}",
                    session.id
                );
                session
            }
        };

        {
            let mut st = session.state.lock().await;
            st.sub_version = sub_version;
            st.character_name = character_name;
            if version == GameVersion::Bb {
                st.login_blob = login_blob;
                st.detector = detector;
            }
        }

        session
            .resume(self, read, write, local_addr, Some(in_cipher), Some(out_cipher))
            .await
    }

    async fn read_login_frame(
        &self,
        read: &mut ReadHalf<Transport>,
        version: GameVersion,
        cipher: &mut dyn PacketCipher,
    ) -> anyhow::Result<Frame> {
        let expected = version
            .login_opcode()
            .ok_or_else(|| ProxyError::framing("generation has no login opcode"))?;
        let mut reader = FrameReader::new(version);
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(frame) = reader.next_frame(Some(&mut *cipher))? {
                if frame.opcode != expected {
                    return Err(ProxyError::HandshakeUnexpected {
                        opcode: frame.opcode,
                        state: "unlinked login",
                    }
                    .into());
                }
                return Ok(frame);
            }
            let n = read.read(&mut buf).await?;
            if n == 0 {
                anyhow::bail!("client disconnected before login");
            }
            reader.feed(&buf[..n]);
        }
    }

    async fn remove_session(&self, id: u64) {
        if self.sessions.lock().await.remove(&id).is_some() {
            info!("proxy.session.closed id={id:016X}");
        }
    }

    pub async fn session_ids(&self) -> Vec<u64> {
        self.sessions.lock().await.keys().copied().collect()
    }

    /// Convenience for the surrounding shell: the one live session, or an
    /// error when there are none or several.
    pub async fn get_session(&self) -> anyhow::Result<Arc<LinkedSession>> {
        let sessions = self.sessions.lock().await;
        match sessions.len() {
            0 => anyhow::bail!("no sessions exist"),
            1 => Ok(sessions.values().next().unwrap().clone()),
            n => anyhow::bail!("{n} sessions exist"),
        }
    }
}

/// Task handles and queues for one linked session's live connections. Torn
/// down as a unit on disconnect; the session entry itself survives until
/// the idle timer fires.
#[derive(Default)]
struct SessionRuntime {
    client_tx: Option<mpsc::Sender<Outbound>>,
    server_tx: Option<mpsc::Sender<Outbound>>,
    client_in: Option<CipherSlot>,
    server_in: Option<CipherSlot>,
    client_tasks: Vec<JoinHandle<()>>,
    server_tasks: Vec<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
}

pub struct LinkedSession {
    pub id: u64,
    pub version: GameVersion,
    pub local_port: u16,
    pub state: Mutex<SessionState>,
    runtime: Mutex<SessionRuntime>,
}

impl LinkedSession {
    fn create(id: u64, version: GameVersion, local_port: u16, services: &Services) -> Arc<Self> {
        Arc::new(Self {
            id,
            version,
            local_port,
            state: Mutex::new(SessionState::new(
                version,
                local_port,
                services.save_dir.clone(),
            )),
            runtime: Mutex::new(SessionRuntime::default()),
        })
    }

    pub async fn is_connected(&self) -> bool {
        let rt = self.runtime.lock().await;
        rt.client_tx.is_some() && rt.server_tx.is_some()
    }

    /// Attaches a (new) client transport and its ciphers, cancels the idle
    /// timer, and dials the upstream destination.
    pub async fn resume(
        self: &Arc<Self>,
        registry: &Arc<ProxyServer>,
        read: ReadHalf<Transport>,
        write: WriteHalf<Transport>,
        local_addr: Option<SocketAddrV4>,
        client_in: Option<Box<dyn PacketCipher>>,
        client_out: Option<Box<dyn PacketCipher>>,
    ) -> anyhow::Result<()> {
        let destination = {
            let mut rt = self.runtime.lock().await;
            if rt.client_tx.is_some() {
                anyhow::bail!("client connection is already open for this session");
            }
            if let Some(timeout) = rt.timeout.take() {
                timeout.abort();
            }

            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
            let in_slot = empty_slot();
            *in_slot.lock().await = client_in;
            if let Some(cipher) = client_out {
                let _ = tx.send(Outbound::Arm(cipher)).await;
            }

            rt.client_tasks
                .push(tokio::spawn(writer_task(self.version, write, rx, "client")));
            rt.client_tasks.push(tokio::spawn(pump_task(
                self.clone(),
                registry.clone(),
                read,
                in_slot.clone(),
                false,
            )));
            rt.client_tx = Some(tx);
            rt.client_in = Some(in_slot);

            let mut st = self.state.lock().await;
            st.client_connected = true;
            st.client_local_addr = local_addr;
            st.saving_files.clear();
            st.next_destination
                .ok_or_else(|| anyhow::anyhow!("session has no destination"))?
        };

        self.connect_server(registry, destination).await
    }

    async fn connect_server(
        self: &Arc<Self>,
        registry: &Arc<ProxyServer>,
        destination: SocketAddrV4,
    ) -> anyhow::Result<()> {
        info!("proxy.session.connect id={:016X} destination={destination}", self.id);
        let stream = match TcpStream::connect(destination).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "proxy.session.upstream_unavailable id={:016X} destination={destination} error={e}",
                    self.id
                );
                self.disconnect(registry).await;
                return Err(ProxyError::UpstreamUnavailable(destination.to_string()).into());
            }
        };

        let transport: Transport = Box::new(stream);
        let (read, write) = tokio::io::split(transport);
        let mut rt = self.runtime.lock().await;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let in_slot = empty_slot();
        rt.server_tasks
            .push(tokio::spawn(writer_task(self.version, write, rx, "server")));
        rt.server_tasks.push(tokio::spawn(pump_task(
            self.clone(),
            registry.clone(),
            read,
            in_slot.clone(),
            true,
        )));
        rt.server_tx = Some(tx);
        rt.server_in = Some(in_slot);
        self.state.lock().await.server_connected = true;
        Ok(())
    }

    /// Drops the server connection only and dials the recorded destination
    /// again; used by hidden patch-server redirects. Runs on the pump being
    /// replaced, so the redial happens on a fresh task and the aborts come
    /// last.
    fn reconnect_server<'a>(
        self: &'a Arc<Self>,
        registry: &'a Arc<ProxyServer>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let (old_tasks, destination) = {
                let mut rt = self.runtime.lock().await;
                rt.server_tx = None;
                rt.server_in = None;
                let old: Vec<JoinHandle<()>> = rt.server_tasks.drain(..).collect();
                let mut st = self.state.lock().await;
                st.server_connected = false;
                let destination = st
                    .next_destination
                    .ok_or_else(|| anyhow::anyhow!("reconnect without destination"))?;
                (old, destination)
            };

            let session = self.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                if let Err(e) = session.connect_server(&registry, destination).await {
                    error!(
                        "proxy.session.reconnect_failed id={:016X} error={e:#}",
                        session.id
                    );
                }
            });
            for task in old_tasks {
                task.abort();
            }
            Ok(())
        })
    }

    /// Tears both transports and all four ciphers down, keeps the session
    /// entry, and starts the idle timer that eventually destroys it.
    ///
    /// Often called from inside one of the tasks it aborts; everything that
    /// suspends happens before the aborts so the teardown always completes.
    pub async fn disconnect(self: &Arc<Self>, registry: &Arc<ProxyServer>) {
        let mut rt = self.runtime.lock().await;
        if rt.client_tx.is_none() && rt.server_tx.is_none() && rt.timeout.is_some() {
            return;
        }
        let licensed = {
            let mut st = self.state.lock().await;
            st.client_connected = false;
            st.server_connected = false;
            st.license.is_some()
        };

        rt.client_tx = None;
        rt.server_tx = None;
        rt.client_in = None;
        rt.server_in = None;
        let mut tasks: Vec<JoinHandle<()>> = rt.client_tasks.drain(..).collect();
        tasks.extend(rt.server_tasks.drain(..));

        let window = if licensed {
            LICENSED_IDLE_TIMEOUT
        } else {
            UNLICENSED_IDLE_TIMEOUT
        };
        let id = self.id;
        let registry = registry.clone();
        rt.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            info!("proxy.session.timeout id={id:016X}");
            registry.remove_session(id).await;
        }));
        drop(rt);

        for task in tasks {
            task.abort();
        }
        info!(
            "proxy.session.disconnected id={:016X} resume_window_secs={}",
            self.id,
            window.as_secs()
        );
    }

    async fn send_to(&self, to_server: bool, frame: Frame) {
        let tx = {
            let rt = self.runtime.lock().await;
            if to_server {
                rt.server_tx.clone()
            } else {
                rt.client_tx.clone()
            }
        };
        match tx {
            Some(tx) => {
                if tx.send(Outbound::Frame(frame)).await.is_err() {
                    warn!("proxy.session.queue_closed id={:016X}", self.id);
                }
            }
            None => {
                let end = if to_server { "server" } else { "client" };
                warn!(
                    "proxy.session.peer_absent id={:016X} end={end} error={}",
                    self.id,
                    ProxyError::PeerAbsent(if to_server { "server" } else { "client" })
                );
            }
        }
    }

    /// Synthesizes one frame toward either endpoint. Exposed for the
    /// control shell.
    pub async fn send_to_end(&self, to_server: bool, frame: Frame) {
        self.send_to(to_server, frame).await;
    }

    async fn arm(&self, which: ArmTarget, cipher: Box<dyn PacketCipher>) {
        let rt = self.runtime.lock().await;
        match which {
            ArmTarget::ClientIn => {
                if let Some(slot) = &rt.client_in {
                    *slot.lock().await = Some(cipher);
                }
            }
            ArmTarget::ServerIn => {
                if let Some(slot) = &rt.server_in {
                    *slot.lock().await = Some(cipher);
                }
            }
            ArmTarget::ClientOut => {
                if let Some(tx) = &rt.client_tx {
                    let _ = tx.send(Outbound::Arm(cipher)).await;
                }
            }
            ArmTarget::ServerOut => {
                if let Some(tx) = &rt.server_tx {
                    let _ = tx.send(Outbound::Arm(cipher)).await;
                }
            }
        }
    }

    async fn apply_actions(
        self: &Arc<Self>,
        registry: &Arc<ProxyServer>,
        from_server: bool,
        frame: &Frame,
        actions: Vec<Action>,
    ) -> anyhow::Result<()> {
        for action in actions {
            match action {
                Action::Forward => self.send_to(!from_server, frame.clone()).await,
                Action::SendToClient(f) => self.send_to(false, f).await,
                Action::SendToServer(f) => self.send_to(true, f).await,
                Action::ArmClientIn(c) => self.arm(ArmTarget::ClientIn, c).await,
                Action::ArmClientOut(c) => self.arm(ArmTarget::ClientOut, c).await,
                Action::ArmServerIn(c) => self.arm(ArmTarget::ServerIn, c).await,
                Action::ArmServerOut(c) => self.arm(ArmTarget::ServerOut, c).await,
                Action::ReconnectServer => self.reconnect_server(registry).await?,
            }
        }
        Ok(())
    }
}

enum ArmTarget {
    ClientIn,
    ClientOut,
    ServerIn,
    ServerOut,
}

async fn writer_task(
    version: GameVersion,
    mut write: WriteHalf<Transport>,
    mut rx: mpsc::Receiver<Outbound>,
    lane: &'static str,
) {
    let mut cipher: Option<Box<dyn PacketCipher>> = None;
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Arm(c) => cipher = Some(c),
            Outbound::Frame(frame) => {
                let bytes = match encode_frame(
                    version,
                    &frame,
                    cipher.as_mut().map(|c| c.as_mut() as &mut dyn PacketCipher),
                ) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("proxy.write.encode_failed lane={lane} opcode={:02X} error={e}", frame.opcode);
                        continue;
                    }
                };
                if let Err(e) = write.write_all(&bytes).await {
                    warn!("proxy.write.failed lane={lane} error={e}");
                    break;
                }
            }
        }
    }
}

/// One direction's read loop: decrypt, frame, dispatch, apply. Any error
/// beyond a short read tears the whole session down through the common
/// disconnect path.
async fn pump_task(
    session: Arc<LinkedSession>,
    registry: Arc<ProxyServer>,
    mut read: ReadHalf<Transport>,
    in_slot: CipherSlot,
    from_server: bool,
) {
    let lane = if from_server { "server" } else { "client" };
    let mut reader = FrameReader::new(session.version);
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) => {
                info!("proxy.session.eof id={:016X} lane={lane}", session.id);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("proxy.session.read_failed id={:016X} lane={lane} error={e}", session.id);
                break;
            }
        };
        reader.feed(&buf[..n]);

        loop {
            let next = {
                let mut slot = in_slot.lock().await;
                let cipher = slot.as_mut().map(|c| c.as_mut() as &mut dyn PacketCipher);
                reader.next_frame(cipher)
            };
            let mut frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!(
                        "proxy.session.framing id={:016X} lane={lane} error={e}",
                        session.id
                    );
                    session.disconnect(&registry).await;
                    return;
                }
            };

            let actions = {
                let mut st = session.state.lock().await;
                let result = process_frame(registry.services(), &mut st, from_server, &mut frame);
                if from_server {
                    st.note_server_payload(&frame.payload);
                }
                result
            };
            let actions = match actions {
                Ok(actions) => actions,
                Err(e) => {
                    error!(
                        "proxy.session.handler_failed id={:016X} lane={lane} opcode={:02X} error={e}",
                        session.id, frame.opcode
                    );
                    session.disconnect(&registry).await;
                    return;
                }
            };
            if let Err(e) = session
                .apply_actions(&registry, from_server, &frame, actions)
                .await
            {
                error!(
                    "proxy.session.apply_failed id={:016X} lane={lane} error={e:#}",
                    session.id
                );
                return;
            }
        }
    }

    session.disconnect(&registry).await;
}

fn parse_login_v2(payload: &[u8]) -> crate::error::Result<wire::LoginV2> {
    if payload.len() < wire::LOGIN_V2_SIZE {
        return Err(ProxyError::framing(format!(
            "login: {} bytes, need {}",
            payload.len(),
            wire::LOGIN_V2_SIZE
        )));
    }
    use binrw::BinReaderExt;
    std::io::Cursor::new(payload)
        .read_le()
        .map_err(|e| ProxyError::framing(e.to_string()))
}

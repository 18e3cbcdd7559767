//! Userspace WireGuard tunnel.
//!
//! Carries TCP connections to machines' private IPv6 addresses without any
//! kernel interface: boringtun handles the noise protocol over a UDP
//! socket, smoltcp supplies the TCP stack over a virtual IP device. Each
//! `connect_tcp` call yields one in-memory stream whose bytes travel
//! through the tunnel.

use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use conveyor_core::{Error, Result};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_PACKET: usize = 65536;
const TCP_BUFFER: usize = 65535;

/// Virtual IP device fed by decapsulated WireGuard packets.
#[derive(Default)]
struct VirtualDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
}

struct VirtualRxToken {
    packet: Vec<u8>,
}

impl smoltcp::phy::RxToken for VirtualRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.packet)
    }
}

struct VirtualTxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> smoltcp::phy::TxToken for VirtualTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = vec![0u8; len];
        let result = f(&mut packet);
        self.queue.push_back(packet);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtualRxToken;
    type TxToken<'a> = VirtualTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: SmolInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx.pop_front()?;
        Some((VirtualRxToken { packet }, VirtualTxToken { queue: &mut self.tx }))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken { queue: &mut self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = 1420;
        caps
    }
}

struct ConnectRequest {
    remote: Ipv6Addr,
    port: u16,
    stream: DuplexStream,
    ready: tokio::sync::oneshot::Sender<Result<()>>,
}

struct Connection {
    handle: smoltcp::iface::SocketHandle,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    ready: Option<tokio::sync::oneshot::Sender<Result<()>>>,
    pump: JoinHandle<()>,
}

pub struct WgTunnel {
    connect_tx: mpsc::UnboundedSender<ConnectRequest>,
    driver: JoinHandle<()>,
}

impl WgTunnel {
    /// Bring up the tunnel: UDP socket to the gateway endpoint, a noise
    /// session, and the virtual interface bound to our peer address.
    pub async fn open(
        private_key: StaticSecret,
        gateway_public: PublicKey,
        endpoint: SocketAddr,
        local_ip: Ipv6Addr,
    ) -> Result<Arc<Self>> {
        let udp = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::Provisioning(format!("binding tunnel socket: {e}")))?;
        udp.connect(endpoint)
            .await
            .map_err(|e| Error::Provisioning(format!("connecting tunnel socket: {e}")))?;

        let tunn = Tunn::new(private_key, gateway_public, None, Some(25), 0, None)
            .map_err(|e| Error::Provisioning(format!("wireguard session: {e}")))?;

        let mut device = VirtualDevice::default();
        let mut iface = Interface::new(
            IfaceConfig::new(HardwareAddress::Ip),
            &mut device,
            SmolInstant::now(),
        );
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(local_ip.into()), 128));
        });

        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(udp, tunn, iface, device, connect_rx));

        Ok(Arc::new(Self { connect_tx, driver }))
    }

    /// Open a TCP connection to `remote:port` through the tunnel.
    pub async fn connect_tcp(&self, remote: Ipv6Addr, port: u16) -> Result<DuplexStream> {
        let (local, internal) = tokio::io::duplex(TCP_BUFFER);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        self.connect_tx
            .send(ConnectRequest {
                remote,
                port,
                stream: internal,
                ready: ready_tx,
            })
            .map_err(|_| Error::Transient("tunnel driver has stopped".into()))?;
        ready_rx
            .await
            .map_err(|_| Error::Transient("tunnel driver has stopped".into()))??;
        Ok(local)
    }

    pub fn close(&self) {
        self.driver.abort();
    }
}

impl Drop for WgTunnel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// The single task that owns every mutable piece of tunnel state.
async fn drive(
    udp: UdpSocket,
    mut tunn: Tunn,
    mut iface: Interface,
    mut device: VirtualDevice,
    mut connect_rx: mpsc::UnboundedReceiver<ConnectRequest>,
) {
    let mut sockets = SocketSet::new(Vec::new());
    let mut connections: Vec<Connection> = Vec::new();
    let mut next_port: u16 = 49152;
    let mut udp_buf = vec![0u8; MAX_PACKET];
    let mut scratch = vec![0u8; MAX_PACKET];
    let mut timers = tokio::time::interval(Duration::from_millis(250));
    let mut wake = tokio::time::interval(Duration::from_millis(5));

    loop {
        tokio::select! {
            request = connect_rx.recv() => {
                let Some(request) = request else { break };
                let rx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]);
                let tx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]);
                let mut socket = tcp::Socket::new(rx_buffer, tx_buffer);
                next_port = next_port.wrapping_add(1).max(49152);
                let connect = socket.connect(
                    iface.context(),
                    (IpAddress::Ipv6(request.remote.into()), request.port),
                    next_port,
                );
                match connect {
                    Ok(()) => {
                        let handle = sockets.add(socket);
                        let (inbound_tx, inbound) = mpsc::unbounded_channel();
                        let (outbound, outbound_rx) = mpsc::unbounded_channel();
                        let pump = tokio::spawn(pump_stream(request.stream, inbound_tx, outbound_rx));
                        connections.push(Connection {
                            handle,
                            inbound,
                            outbound,
                            ready: Some(request.ready),
                            pump,
                        });
                    }
                    Err(e) => {
                        let _ = request.ready.send(Err(Error::Transient(format!(
                            "tunnel connect: {e}"
                        ))));
                    }
                }
            }
            received = udp.recv(&mut udp_buf) => {
                let Ok(len) = received else { break };
                let mut datagram: &[u8] = &udp_buf[..len];
                loop {
                    match tunn.decapsulate(None, datagram, &mut scratch) {
                        TunnResult::WriteToNetwork(packet) => {
                            let _ = udp.send(packet).await;
                            // Flush any queued packets the session releases.
                            datagram = &[];
                        }
                        TunnResult::WriteToTunnel(packet, _addr) => {
                            device.rx.push_back(packet.to_vec());
                            break;
                        }
                        TunnResult::Done => break,
                        TunnResult::Err(e) => {
                            debug!(error = ?e, "decapsulation error");
                            break;
                        }
                    }
                }
            }
            _ = timers.tick() => {
                match tunn.update_timers(&mut scratch) {
                    TunnResult::WriteToNetwork(packet) => {
                        let _ = udp.send(packet).await;
                    }
                    TunnResult::Err(e) => warn!(error = ?e, "wireguard timer error"),
                    _ => {}
                }
            }
            _ = wake.tick() => {}
        }

        // Move bytes between host streams and TCP sockets, then poll the
        // interface and push produced packets through the tunnel.
        connections.retain_mut(|conn| service_connection(conn, &mut sockets));
        iface.poll(SmolInstant::now(), &mut device, &mut sockets);
        while let Some(packet) = device.tx.pop_front() {
            match tunn.encapsulate(&packet, &mut scratch) {
                TunnResult::WriteToNetwork(encrypted) => {
                    let _ = udp.send(encrypted).await;
                }
                TunnResult::Err(e) => warn!(error = ?e, "encapsulation error"),
                _ => {}
            }
        }
    }
}

/// Returns false when the connection is finished and should be dropped.
fn service_connection(conn: &mut Connection, sockets: &mut SocketSet<'_>) -> bool {
    let socket = sockets.get_mut::<tcp::Socket>(conn.handle);

    if let Some(ready) = conn.ready.take() {
        if socket.may_send() {
            let _ = ready.send(Ok(()));
        } else if !socket.is_open() {
            let _ = ready.send(Err(Error::Transient("tunnel connection refused".into())));
            conn.pump.abort();
            sockets.remove(conn.handle);
            return false;
        } else {
            conn.ready = Some(ready);
        }
    }

    while socket.can_send() {
        match conn.inbound.try_recv() {
            Ok(bytes) => {
                let mut offset = 0;
                while offset < bytes.len() {
                    match socket.send_slice(&bytes[offset..]) {
                        Ok(sent) if sent > 0 => offset += sent,
                        _ => break,
                    }
                }
            }
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                socket.close();
                break;
            }
        }
    }

    while socket.can_recv() {
        let mut chunk = vec![0u8; 8192];
        match socket.recv_slice(&mut chunk) {
            Ok(read) if read > 0 => {
                chunk.truncate(read);
                if conn.outbound.send(chunk).is_err() {
                    socket.abort();
                    break;
                }
            }
            _ => break,
        }
    }

    if !socket.is_open() && conn.ready.is_none() {
        conn.pump.abort();
        sockets.remove(conn.handle);
        return false;
    }
    true
}

/// Bridges one host-facing stream to the driver's channel pair.
async fn pump_stream(
    stream: DuplexStream,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let reader = tokio::spawn(async move {
        let mut buffer = [0u8; 8192];
        loop {
            match read_half.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if inbound_tx.send(buffer[..read].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(bytes) = outbound_rx.recv().await {
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    reader.abort();
}

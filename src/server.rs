use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use chrono::TimeDelta;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::options::{MessageType, OptionCode};
use crate::packet::{BOOTREQUEST, DhcpPacket, RawOption};
use crate::subnet::Subnet;
use crate::tracker::DataTracker;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RATE_LIMIT_WINDOW_SECS: u64 = 1;
const RATE_LIMIT_MAX_REQUESTS: usize = 10;
const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 1000;
const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    config: Arc<Config>,
    tracker: Arc<DataTracker>,
    socket: Arc<UdpSocket>,
    rate_limiter: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl DhcpServer {
    pub fn new(config: Config, tracker: Arc<DataTracker>) -> Result<Self> {
        let config = Arc::new(config);
        let socket = Arc::new(Self::create_socket()?);

        info!(
            "DHCP server starting on {}:{}",
            config.server_ip, DHCP_SERVER_PORT
        );

        Ok(Self {
            config,
            tracker,
            socket,
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn create_socket() -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let config = Arc::clone(&self.config);
                    let tracker = Arc::clone(&self.tracker);
                    let socket = Arc::clone(&self.socket);
                    let rate_limiter = Arc::clone(&self.rate_limiter);

                    tokio::spawn(async move {
                        let handler = PacketHandler {
                            config,
                            tracker,
                            socket,
                            rate_limiter,
                        };
                        if let Err(error) = handler.handle_packet(&data, source).await {
                            warn!("Error handling packet from {}: {}", source, error);
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }

    pub fn tracker(&self) -> &DataTracker {
        &self.tracker
    }
}

struct PacketHandler {
    config: Arc<Config>,
    tracker: Arc<DataTracker>,
    socket: Arc<UdpSocket>,
    rate_limiter: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl PacketHandler {
    async fn is_rate_limited(&self, key: &str) -> bool {
        let mut limiter = self.rate_limiter.lock().await;
        let now = Instant::now();
        let window = std::time::Duration::from_secs(RATE_LIMIT_WINDOW_SECS);

        if limiter.len() > RATE_LIMIT_CLEANUP_THRESHOLD {
            limiter.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < window);
                !timestamps.is_empty()
            });
        }

        let timestamps = limiter.entry(key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < window);

        if timestamps.len() >= RATE_LIMIT_MAX_REQUESTS {
            return true;
        }

        timestamps.push(now);
        false
    }

    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let packet = DhcpPacket::parse(data)?;

        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
        }

        let mac = packet.mac_string();

        if self.is_rate_limited(&mac).await {
            warn!("Rate limited: {} from {}", mac, source);
            return Ok(());
        }

        let message_type = packet
            .message_type()
            .ok_or_else(|| Error::InvalidPacket("Missing message type option".to_string()))?;

        info!("{} from {} ({})", message_type, mac, source);

        match message_type {
            MessageType::Discover => self.handle_discover(&packet).await,
            MessageType::Request => self.handle_request(&packet).await,
            MessageType::Decline | MessageType::Release => {
                self.handle_release(&packet, message_type).await
            }
            MessageType::Inform => self.handle_inform(&packet).await,
            _ => {
                warn!("Ignoring {} message", message_type);
                Ok(())
            }
        }
    }

    /// Finds the subnet serving this client: the relay address when the
    /// packet was forwarded, the client's own address when it has one, the
    /// server interface otherwise. A client bound in some subnet routes
    /// there as a last resort.
    async fn route_subnet(&self, packet: &DhcpPacket) -> Option<Arc<Subnet>> {
        let route_ip = if packet.giaddr != Ipv4Addr::UNSPECIFIED {
            packet.giaddr
        } else if packet.ciaddr != Ipv4Addr::UNSPECIFIED {
            packet.ciaddr
        } else {
            self.config.server_ip
        };

        match self.tracker.find_subnet(route_ip).await {
            Some(subnet) => Some(subnet),
            None => self.tracker.find_bound_ip(&packet.mac_string()).await,
        }
    }

    async fn handle_discover(&self, packet: &DhcpPacket) -> Result<()> {
        let mac = packet.mac_string();

        let Some(subnet) = self.route_subnet(packet).await else {
            warn!("No subnet serves DISCOVER from {}", mac);
            return Ok(());
        };

        let (lease, binding, persist) = subnet.find_or_allocate(&mac, packet.requested_ip()).await;
        if persist {
            self.tracker.save().await?;
        }

        let Some(lease) = lease else {
            warn!(subnet = subnet.name(), "No address available for {}", mac);
            return Ok(());
        };

        let (composed, lease_time) = subnet.build_options(binding.as_ref(), packet);
        let options = compose_reply_options(self.config.server_ip, Some(lease_time), composed);
        let next_server = binding
            .as_ref()
            .and_then(|binding| binding.next_server)
            .or(subnet.next_server())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let offer =
            DhcpPacket::create_reply(packet, MessageType::Offer, lease.ip, next_server, options);
        self.send_reply(&offer, packet).await?;

        info!("OFFER {} to {}", lease.ip, mac);

        Ok(())
    }

    async fn handle_request(&self, packet: &DhcpPacket) -> Result<()> {
        let mac = packet.mac_string();

        if let Some(server_id) = packet.server_identifier()
            && server_id != self.config.server_ip
        {
            info!("REQUEST from {} is for different server {}", mac, server_id);
            return Ok(());
        }

        let Some(subnet) = self.route_subnet(packet).await else {
            warn!("No subnet serves REQUEST from {}", mac);
            return Ok(());
        };

        let requested = packet
            .requested_ip()
            .or((packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr));

        let (lease, binding) = subnet.find_info(&mac).await;

        let Some(lease) = lease else {
            return self.send_nak(packet, "no lease on record").await;
        };
        let Some(requested) = requested else {
            return self.send_nak(packet, "no address requested").await;
        };
        if requested != lease.ip {
            return self.send_nak(packet, "requested address does not match lease").await;
        }

        let (composed, lease_time) = subnet.build_options(binding.as_ref(), packet);

        if subnet.update_lease_time(&mac, lease_time).await.is_none() {
            return self.send_nak(packet, "lease disappeared").await;
        }
        self.tracker.save().await?;

        let options = compose_reply_options(self.config.server_ip, Some(lease_time), composed);
        let next_server = binding
            .as_ref()
            .and_then(|binding| binding.next_server)
            .or(subnet.next_server())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let ack =
            DhcpPacket::create_reply(packet, MessageType::Ack, lease.ip, next_server, options);
        self.send_reply(&ack, packet).await?;

        info!(
            "ACK {} to {} (lease: {} seconds)",
            lease.ip,
            mac,
            lease_time.num_seconds()
        );

        Ok(())
    }

    /// DECLINE and RELEASE both just give the address back; neither is
    /// answered.
    async fn handle_release(&self, packet: &DhcpPacket, message_type: MessageType) -> Result<()> {
        let mac = packet.mac_string();

        let Some(subnet) = self.route_subnet(packet).await else {
            warn!("No subnet serves {} from {}", message_type, mac);
            return Ok(());
        };

        if subnet.free_lease(&mac).await {
            self.tracker.save().await?;
            info!(subnet = subnet.name(), "{} freed lease for {}", message_type, mac);
        }

        Ok(())
    }

    async fn handle_inform(&self, packet: &DhcpPacket) -> Result<()> {
        let mac = packet.mac_string();

        let Some(subnet) = self.route_subnet(packet).await else {
            warn!("No subnet serves INFORM from {}", mac);
            return Ok(());
        };

        let (_, binding) = subnet.find_info(&mac).await;
        let (composed, _) = subnet.build_options(binding.as_ref(), packet);
        let options = compose_reply_options(self.config.server_ip, None, composed);

        let ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            options,
        );
        self.send_reply(&ack, packet).await?;

        info!("INFORM response to {}", mac);

        Ok(())
    }

    async fn send_nak(&self, packet: &DhcpPacket, reason: &str) -> Result<()> {
        let mac = packet.mac_string();

        let nak = DhcpPacket::create_reply(
            packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            vec![RawOption::ip(OptionCode::ServerIdentifier, self.config.server_ip)],
        );

        self.send_reply(&nak, packet).await?;

        warn!("NAK to {}: {}", mac, reason);

        Ok(())
    }

    async fn send_reply(&self, reply: &DhcpPacket, request: &DhcpPacket) -> Result<()> {
        let encoded = reply.encode();
        let is_nak = reply.message_type() == Some(MessageType::Nak);
        let destination = reply_destination(request, is_nak);

        self.socket.send_to(&encoded, destination).await?;

        Ok(())
    }
}

/// The fixed server-controlled options followed by the rendered set, which
/// never overrides them.
fn compose_reply_options(
    server_ip: Ipv4Addr,
    lease_time: Option<TimeDelta>,
    composed: BTreeMap<u8, Vec<u8>>,
) -> Vec<RawOption> {
    let mut options = vec![RawOption::ip(OptionCode::ServerIdentifier, server_ip)];
    if let Some(lease_time) = lease_time {
        options.push(RawOption::seconds(
            OptionCode::LeaseTime,
            lease_time.num_seconds() as u32,
        ));
    }

    let reserved = [
        OptionCode::MessageType as u8,
        OptionCode::ServerIdentifier as u8,
        OptionCode::LeaseTime as u8,
    ];
    for (code, data) in composed {
        if reserved.contains(&code) {
            continue;
        }
        options.push(RawOption::new(code, data));
    }

    options
}

/// RFC 2131 reply addressing: relays on the server port, broadcast when the
/// client asked for it or is addressless, unicast otherwise.
fn reply_destination(request: &DhcpPacket, is_nak: bool) -> SocketAddr {
    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr == Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}

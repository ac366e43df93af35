//! UDP transport
//!
//! A receive task reads the socket and pushes datagrams into a bounded queue.
//! The tick task is the only owner of `ServerContext`: each tick it drains the
//! queue, runs the frame and writes the outbound datagrams back to the socket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::datagram_queue::{datagram_queue, DatagramSender, DEFAULT_QUEUE_CAPACITY};
use crate::net::protocol::MAX_DATAGRAM;
use crate::net::Datagram;
use crate::server::ServerContext;
use crate::world::Game;

pub struct UdpServer {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    metrics: Arc<Metrics>,
}

impl UdpServer {
    pub async fn bind(config: ServerConfig, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(config.bind_address, config.port);
        let socket = UdpSocket::bind(addr).await?;
        info!("Listening for datagrams on {}", socket.local_addr()?);

        Ok(Self {
            config,
            socket: Arc::new(socket),
            metrics,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the tick loop until `shutdown` resolves, then drop every client
    pub async fn run<G, S>(self, mut ctx: ServerContext, mut game: G, shutdown: S) -> anyhow::Result<()>
    where
        G: Game,
        S: Future<Output = ()>,
    {
        let (sender, queue) = datagram_queue(DEFAULT_QUEUE_CAPACITY, self.metrics.clone());
        let receiver = tokio::spawn(receive_loop(self.socket.clone(), sender));

        let frame_msec = self.config.frame_msec();
        let mut ticker = interval(Duration::from_millis(frame_msec));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Tick loop started at {} Hz", self.config.tick_rate);

        let start = Instant::now();
        let mut tick_count: u64 = 0;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => break,
            }
            tick_count += 1;
            let now_ms = start.elapsed().as_millis() as u64;

            game.advance(now_ms);
            let inbound = queue.drain();
            let output = ctx.run_frame(now_ms, inbound, &game, &game);
            self.send_all(output.outbound).await;
            game.handle_events(&mut ctx, output.events, now_ms);

            // Log stats periodically (every 30 seconds)
            if tick_count % (self.config.tick_rate as u64 * 30) == 0 {
                let registry = ctx.registry();
                info!(
                    "Server: {}s, {} live clients, {} datagrams queued",
                    now_ms / 1000,
                    registry.live_count(),
                    queue.pending_count()
                );
            }
        }

        info!("Dropping all clients");
        let now_ms = start.elapsed().as_millis() as u64;
        let farewell = ctx.shutdown(now_ms);
        self.send_all(farewell).await;
        receiver.abort();
        Ok(())
    }

    async fn send_all(&self, outbound: Vec<Datagram>) {
        for datagram in outbound {
            if let Err(e) = self.socket.send_to(&datagram.data, datagram.addr).await {
                debug!("Send to {} failed: {}", datagram.addr, e);
            }
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, mut sender: DatagramSender) {
    let mut buffer = vec![0u8; MAX_DATAGRAM + 1];
    loop {
        let (len, addr) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms
                debug!("Receive error: {}", e);
                continue;
            }
        };

        if let Err(e) = sender.push(Datagram::new(addr, buffer[..len].to_vec())) {
            warn!("{}, stopping receiver", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{self, ConnectionlessRequest, ConnectionlessResponse, WireFrame};
    use crate::server::ServerEvent;
    use crate::snapshot::entity::EntityState;
    use crate::world::{EntityTable, Simulation, VisibilityOracle};

    struct Quiet(EntityTable);

    impl Simulation for Quiet {
        fn entities(&self) -> &[EntityState] {
            self.0.entities()
        }
    }

    impl VisibilityOracle for Quiet {
        fn is_visible(&self, _client: usize, _entity: &EntityState) -> bool {
            true
        }
    }

    impl Game for Quiet {
        fn handle_events(&mut self, _ctx: &mut ServerContext, _events: Vec<ServerEvent>, _now_ms: u64) {}
    }

    #[tokio::test]
    async fn test_challenge_over_udp() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..Default::default()
        };
        let metrics = Arc::new(Metrics::new());
        let server = UdpServer::bind(config.clone(), metrics.clone()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let ctx = ServerContext::new(
            ServerConfig {
                port: server_addr.port(),
                ..config
            },
            metrics,
        )
        .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(ctx, Quiet(EntityTable::new()), async {
            let _ = stop_rx.await;
        }));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = protocol::encode(&WireFrame::Request(ConnectionlessRequest::GetChallenge)).unwrap();
        client.send_to(&request, server_addr).await.unwrap();

        let mut buffer = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let reply: WireFrame = protocol::decode(&buffer[..len]).unwrap();
        assert!(matches!(
            reply,
            WireFrame::Response(ConnectionlessResponse::Challenge { .. })
        ));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}

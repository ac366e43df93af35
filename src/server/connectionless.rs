//! Out-of-band requests: challenge, connect, status/info and remote console

use std::net::SocketAddr;

use tracing::{debug, info, trace, warn};

use super::{ServerContext, ServerEvent};
use crate::filter::Admission;
use crate::metrics::Metrics;
use crate::net::connection::ClientState;
use crate::net::protocol::{
    ConnectionlessRequest, ConnectionlessResponse, InfoResponse, PlayerLine, StatusResponse,
    WireFrame, PROTOCOL_VERSION,
};
use crate::net::rate_limit::{LimitCategory, RateDecision};
use crate::net::registry::{Allocation, DropReason};
use crate::net::userinfo::InfoString;

/// Longest query nonce echoed back
const MAX_NONCE_LENGTH: usize = 64;

impl ServerContext {
    pub(super) fn handle_connectionless(
        &mut self,
        addr: SocketAddr,
        request: ConnectionlessRequest,
        now_ms: u64,
    ) {
        let category = match &request {
            ConnectionlessRequest::GetChallenge => LimitCategory::Challenge,
            ConnectionlessRequest::Connect { .. } => LimitCategory::Connect,
            ConnectionlessRequest::GetStatus { .. } | ConnectionlessRequest::GetInfo { .. } => {
                LimitCategory::Query
            }
            ConnectionlessRequest::Rcon { .. } => LimitCategory::Rcon,
        };

        match self.limiter.check(addr.ip(), category, now_ms) {
            RateDecision::Allowed => {}
            RateDecision::Limited => {
                trace!("{:?} request from {} rate limited", category, addr);
                Metrics::incr(&self.metrics.packets_rate_limited);
                return;
            }
            RateDecision::Toxic => {
                Metrics::incr(&self.metrics.packets_rate_limited);
                return;
            }
        }

        match request {
            ConnectionlessRequest::GetChallenge => {
                let challenge = self.challenges.issue(addr, now_ms);
                self.send_frame(
                    addr,
                    &WireFrame::Response(ConnectionlessResponse::Challenge { challenge }),
                );
            }
            ConnectionlessRequest::Connect {
                protocol,
                challenge,
                userinfo,
            } => self.handle_connect(addr, protocol, challenge, &userinfo, now_ms),
            ConnectionlessRequest::GetStatus { nonce } => self.handle_status(addr, &nonce),
            ConnectionlessRequest::GetInfo { nonce } => self.handle_info(addr, &nonce),
            ConnectionlessRequest::Rcon { password, command } => {
                self.handle_rcon(addr, &password, command, now_ms)
            }
        }
    }

    fn reject_connect(&mut self, addr: SocketAddr, reason: &str) {
        debug!("Rejected connection from {}: {}", addr, reason);
        Metrics::incr(&self.metrics.connects_rejected);
        self.send_print(addr, reason);
    }

    fn handle_connect(
        &mut self,
        addr: SocketAddr,
        protocol: u16,
        challenge: u32,
        userinfo: &str,
        now_ms: u64,
    ) {
        if protocol != PROTOCOL_VERSION {
            self.reject_connect(
                addr,
                &format!("Server uses protocol version {}.", PROTOCOL_VERSION),
            );
            return;
        }

        if !self.challenges.verify(addr, challenge, now_ms) {
            self.reject_connect(addr, "No or bad challenge for your address.");
            return;
        }

        let userinfo = match InfoString::parse(userinfo) {
            Ok(info) => info,
            Err(e) => {
                self.reject_connect(addr, &format!("Invalid userinfo: {}", e));
                return;
            }
        };

        if let Admission::Reject(reason) = self.filter.check(addr, &userinfo, now_ms) {
            self.reject_connect(addr, &reason);
            return;
        }

        match self.registry.allocate(addr, now_ms, &self.config) {
            Allocation::Ignore => {}
            Allocation::Reject(reason) => self.reject_connect(addr, reason),
            Allocation::Slot { index, replaced } => {
                if let Some(old) = replaced {
                    self.drop_client(old, DropReason::Reconnected, now_ms);
                }
                if !self
                    .registry
                    .bind(index, addr, userinfo, now_ms, &self.config)
                {
                    warn!("Slot {} could not be bound for {}", index, addr);
                    return;
                }
                Metrics::incr(&self.metrics.connects_accepted);

                let name = self
                    .registry
                    .get(index)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                self.send_frame(
                    addr,
                    &WireFrame::Response(ConnectionlessResponse::ConnectAccepted {
                        client_num: index as u16,
                    }),
                );
                self.events.push(ServerEvent::ClientConnected {
                    client: index,
                    addr,
                    name,
                });
            }
        }
    }

    /// Server-wide info string for status replies
    fn server_info(&self) -> InfoString {
        let mut info = InfoString::default();
        let max_clients = self.registry.capacity().to_string();
        let protocol = PROTOCOL_VERSION.to_string();
        for (key, value) in [
            ("sv_hostname", self.config.hostname.as_str()),
            ("sv_maxclients", max_clients.as_str()),
            ("protocol", protocol.as_str()),
        ] {
            if let Err(e) = info.set(key, value) {
                debug!("Leaving {} out of server info: {}", key, e);
            }
        }
        info
    }

    fn handle_status(&mut self, addr: SocketAddr, nonce: &str) {
        let players = self
            .registry
            .iter()
            .filter(|c| c.state() >= ClientState::Connected)
            .map(|c| PlayerLine {
                client_num: c.num as u16,
                ping: c.ping,
                name: c.name.clone(),
            })
            .collect();

        let response = StatusResponse {
            nonce: nonce.chars().take(MAX_NONCE_LENGTH).collect(),
            info: self.server_info().to_string(),
            players,
        };
        self.send_frame(
            addr,
            &WireFrame::Response(ConnectionlessResponse::Status(response)),
        );
    }

    fn handle_info(&mut self, addr: SocketAddr, nonce: &str) {
        let response = InfoResponse {
            nonce: nonce.chars().take(MAX_NONCE_LENGTH).collect(),
            protocol: PROTOCOL_VERSION,
            hostname: self.config.hostname.clone(),
            clients: self.registry.live_count() as u16,
            max_clients: self.registry.capacity() as u16,
        };
        self.send_frame(
            addr,
            &WireFrame::Response(ConnectionlessResponse::Info(response)),
        );
    }

    fn handle_rcon(&mut self, addr: SocketAddr, password: &str, command: String, now_ms: u64) {
        let Some(expected) = self.config.rcon_password.as_deref() else {
            self.send_print(addr, "No rconpassword set on the server.");
            return;
        };

        if ring::constant_time::verify_slices_are_equal(password.as_bytes(), expected.as_bytes())
            .is_err()
        {
            warn!("Bad rcon from {}: {}", addr, command);
            self.limiter.mark_toxic(addr.ip(), now_ms);
            self.send_print(addr, "Bad rconpassword.");
            return;
        }

        info!("Rcon from {}: {}", addr, command);
        self.events.push(ServerEvent::RemoteCommand { addr, command });
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::config::ServerConfig;
    use crate::filter::{BanList, BanRecord, Subnet};
    use crate::server::tests::{client_addr, context, datagram, responses, world, TestClient};
    use crate::world::AllVisible;

    fn request(addr: SocketAddr, request: ConnectionlessRequest) -> crate::net::Datagram {
        datagram(addr, &WireFrame::Request(request))
    }

    fn printed(replies: &[ConnectionlessResponse]) -> Vec<String> {
        replies
            .iter()
            .filter_map(|r| match r {
                ConnectionlessResponse::Print { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_bad_challenge_rejected() {
        let mut ctx = context(ServerConfig::default());
        let world = world();
        let out = ctx.run_frame(
            0,
            vec![request(
                client_addr(),
                ConnectionlessRequest::Connect {
                    protocol: PROTOCOL_VERSION,
                    challenge: 12345,
                    userinfo: "\\name\\x".to_string(),
                },
            )],
            &world,
            &AllVisible,
        );
        assert_eq!(
            printed(&responses(&out, client_addr())),
            vec!["No or bad challenge for your address.".to_string()]
        );
        assert_eq!(ctx.registry().live_count(), 0);
    }

    #[test]
    fn test_protocol_mismatch_rejected() {
        let mut ctx = context(ServerConfig::default());
        let world = world();
        let challenge = ctx.challenges.issue(client_addr(), 0);
        let out = ctx.run_frame(
            0,
            vec![request(
                client_addr(),
                ConnectionlessRequest::Connect {
                    protocol: PROTOCOL_VERSION + 1,
                    challenge,
                    userinfo: String::new(),
                },
            )],
            &world,
            &AllVisible,
        );
        let text = printed(&responses(&out, client_addr()));
        assert!(text[0].contains("protocol version"));
    }

    #[test]
    fn test_banned_address_rejected() {
        let mut bans = BanList::new();
        bans.add(BanRecord::new(
            Subnet::host(IpAddr::from([10, 0, 0, 5])),
            "cheating",
            0,
            None,
        ));
        let mut ctx = context(ServerConfig::default()).with_filter(Box::new(bans));
        let world = world();

        let mut client = TestClient::new(client_addr());
        let replies = client
            .connect(&mut ctx, 0, &world, "\\name\\x")
            .unwrap_err();
        assert_eq!(printed(&replies).len(), 1);
        assert_eq!(ctx.registry().live_count(), 0);
    }

    #[test]
    fn test_reconnect_after_limit_replaces_session() {
        let config = ServerConfig::default();
        let mut ctx = context(config.clone());
        let world = world();

        let mut first = TestClient::new(client_addr());
        let old = first.connect(&mut ctx, 0, &world, "\\name\\x").unwrap();

        // Too soon: silently ignored
        let mut second = TestClient::new(client_addr());
        assert_eq!(second.connect(&mut ctx, 100, &world, "\\name\\x"), Err(Vec::new()));

        let now = config.reconnect_limit_ms + 1;
        let mut third = TestClient::new(client_addr());
        let new = third.connect(&mut ctx, now, &world, "\\name\\x").unwrap();
        assert_ne!(new, old);
        assert_eq!(ctx.registry().get(old).unwrap().state(), ClientState::Zombie);
        assert_eq!(ctx.registry().find_live(client_addr()), Some(new));
    }

    #[test]
    fn test_status_and_info() {
        let config = ServerConfig {
            hostname: "arena".to_string(),
            ..Default::default()
        };
        let mut ctx = context(config);
        let world = world();
        let mut client = TestClient::new(client_addr());
        client.connect(&mut ctx, 0, &world, "\\name\\Visor").unwrap();

        let asker: SocketAddr = "192.168.0.9:5000".parse().unwrap();
        let out = ctx.run_frame(
            10,
            vec![
                request(asker, ConnectionlessRequest::GetStatus { nonce: "abc".into() }),
                request(asker, ConnectionlessRequest::GetInfo { nonce: "def".into() }),
            ],
            &world,
            &AllVisible,
        );
        let replies = responses(&out, asker);
        match &replies[..] {
            [ConnectionlessResponse::Status(status), ConnectionlessResponse::Info(info)] => {
                assert_eq!(status.nonce, "abc");
                assert!(status.info.contains("\\sv_hostname\\arena"));
                assert_eq!(status.players.len(), 1);
                assert_eq!(status.players[0].name, "Visor");
                assert_eq!(info.nonce, "def");
                assert_eq!(info.clients, 1);
                assert_eq!(info.max_clients, 32);
            }
            other => panic!("unexpected replies {other:?}"),
        }
    }

    #[test]
    fn test_query_flood_limited() {
        let mut ctx = context(ServerConfig::default());
        let world = world();
        let asker: SocketAddr = "192.168.0.9:5000".parse().unwrap();
        let burst = ctx.config().rate_limits.query.burst as usize;
        let inbound = (0..burst + 1)
            .map(|_| request(asker, ConnectionlessRequest::GetInfo { nonce: String::new() }))
            .collect();
        let out = ctx.run_frame(0, inbound, &world, &AllVisible);
        assert_eq!(responses(&out, asker).len(), burst);
    }

    #[test]
    fn test_rcon() {
        let config = ServerConfig {
            rcon_password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let mut ctx = context(config);
        let world = world();
        let admin: SocketAddr = "172.16.0.1:4000".parse().unwrap();
        let intruder: SocketAddr = "172.16.0.2:4000".parse().unwrap();

        let out = ctx.run_frame(
            0,
            vec![
                request(
                    admin,
                    ConnectionlessRequest::Rcon {
                        password: "hunter2".into(),
                        command: "map q3dm6".into(),
                    },
                ),
                request(
                    intruder,
                    ConnectionlessRequest::Rcon {
                        password: "guess".into(),
                        command: "quit".into(),
                    },
                ),
                request(intruder, ConnectionlessRequest::GetChallenge),
            ],
            &world,
            &AllVisible,
        );

        assert_eq!(
            out.events,
            vec![ServerEvent::RemoteCommand {
                addr: admin,
                command: "map q3dm6".into()
            }]
        );
        // Wrong password: told once, then the address is shut out
        assert_eq!(
            responses(&out, intruder),
            vec![ConnectionlessResponse::Print {
                text: "Bad rconpassword.".into()
            }]
        );
    }

    #[test]
    fn test_rcon_password_must_match_exactly() {
        let config = ServerConfig {
            rcon_password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let mut ctx = context(config);
        let world = world();
        for (port, password) in [(4001, "hunter"), (4002, "hunter22"), (4003, "")] {
            let addr = SocketAddr::from(([172, 16, 0, 3], port));
            let out = ctx.run_frame(
                0,
                vec![request(
                    addr,
                    ConnectionlessRequest::Rcon {
                        password: password.into(),
                        command: "status".into(),
                    },
                )],
                &world,
                &AllVisible,
            );
            assert!(out.events.is_empty(), "accepted {password:?}");
        }
    }

    #[test]
    fn test_rcon_disabled() {
        let mut ctx = context(ServerConfig::default());
        let world = world();
        let out = ctx.run_frame(
            0,
            vec![request(
                client_addr(),
                ConnectionlessRequest::Rcon {
                    password: String::new(),
                    command: "status".into(),
                },
            )],
            &world,
            &AllVisible,
        );
        assert_eq!(
            printed(&responses(&out, client_addr())),
            vec!["No rconpassword set on the server.".to_string()]
        );
        assert!(out.events.is_empty());
    }
}

use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use snapwire_server::config::ServerConfig;
use snapwire_server::metrics::Metrics;
use snapwire_server::net::protocol::UserCmd;
use snapwire_server::net::transport::UdpServer;
use snapwire_server::server::{ServerContext, ServerEvent};
use snapwire_server::snapshot::entity::{EntityNum, EntityState};
use snapwire_server::world::{EntityTable, Game, Simulation, VisibilityOracle};

/// Config string slot holding the world name
const CS_WORLD: u16 = 0;

/// Entity 0 is the beacon, players start at 1
const FIRST_PLAYER_ENTITY: EntityNum = 1;

/// Units per second at full forward input
const PLAYER_SPEED: f32 = 320.0;

/// Minimal world: one orbiting beacon plus one entity per player
struct Sandbox {
    table: EntityTable,
}

impl Sandbox {
    fn new() -> Self {
        let mut table = EntityTable::new();
        table.upsert(EntityState::new(0));
        Self { table }
    }

    fn player_entity(client: usize) -> EntityNum {
        FIRST_PLAYER_ENTITY + client as EntityNum
    }

    fn apply_usercmd(&mut self, client: usize, cmd: &UserCmd, frame_secs: f32) {
        let Some(entity) = self.table.get_mut(Self::player_entity(client)) else {
            return;
        };
        let yaw = cmd.angles[1].to_radians();
        let forward = cmd.forward as f32 / 127.0;
        let right = cmd.right as f32 / 127.0;
        entity.velocity = [
            (yaw.cos() * forward + yaw.sin() * right) * PLAYER_SPEED,
            (yaw.sin() * forward - yaw.cos() * right) * PLAYER_SPEED,
            0.0,
        ];
        for axis in 0..3 {
            entity.origin[axis] += entity.velocity[axis] * frame_secs;
        }
        entity.angles = cmd.angles;
        entity.model_index = cmd.weapon as u16;
    }

    fn remote_command(&mut self, ctx: &mut ServerContext, addr: std::net::SocketAddr, command: &str, now_ms: u64) {
        let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
        match verb {
            "status" => {
                let mut report = format!("server id {}\n", ctx.server_id());
                for (index, conn) in ctx.registry().iter().enumerate() {
                    if conn.state().is_live() {
                        report.push_str(&format!(
                            "{:>3} {:>9?} {:>5} {}\n",
                            index,
                            conn.state(),
                            conn.frames
                                .average_ping()
                                .map_or_else(|| "-".to_string(), |ping| ping.to_string()),
                            conn.name
                        ));
                    }
                }
                ctx.send_print(addr, report);
            }
            "kick" => match rest.trim().parse::<usize>() {
                Ok(index) => ctx.kick(index, "kicked by console", now_ms),
                Err(_) => ctx.send_print(addr, "usage: kick <client>"),
            },
            "say" => ctx.broadcast(&format!("print \"console: {}\"", rest), now_ms),
            "world" => ctx.set_config_string(CS_WORLD, rest.trim(), now_ms),
            "restart" => {
                ctx.reset_session();
                ctx.set_config_string(CS_WORLD, "sandbox", now_ms);
                ctx.send_print(addr, "session restarted");
            }
            _ => ctx.send_print(addr, format!("unknown command: {}", verb)),
        }
    }
}

impl Simulation for Sandbox {
    fn entities(&self) -> &[EntityState] {
        self.table.entities()
    }
}

impl VisibilityOracle for Sandbox {
    fn is_visible(&self, _client: usize, _entity: &EntityState) -> bool {
        true
    }
}

impl Game for Sandbox {
    fn advance(&mut self, now_ms: u64) {
        if let Some(beacon) = self.table.get_mut(0) {
            let t = now_ms as f32 / 1000.0;
            beacon.origin = [t.cos() * 256.0, t.sin() * 256.0, 64.0];
        }
    }

    fn handle_events(&mut self, ctx: &mut ServerContext, events: Vec<ServerEvent>, now_ms: u64) {
        let frame_secs = ctx.config().frame_msec() as f32 / 1000.0;
        for event in events {
            match event {
                ServerEvent::ClientConnected { client, addr, name } => {
                    info!("{} connected from {} as client {}", name, addr, client);
                }
                ServerEvent::ClientEntered { client } => {
                    let mut entity = EntityState::new(Self::player_entity(client));
                    entity.kind = 1;
                    self.table.upsert(entity);
                    ctx.broadcast(&format!("print \"client {} entered the game\"", client), now_ms);
                }
                ServerEvent::ClientCommand { client, command } => {
                    debug!("Client {} command: {}", client, command);
                    if let Some(text) = command.strip_prefix("say ") {
                        ctx.broadcast(&format!("chat \"{}: {}\"", client, text), now_ms);
                    }
                }
                ServerEvent::UserCmd { client, cmd } => self.apply_usercmd(client, &cmd, frame_secs),
                ServerEvent::UserinfoChanged { client, userinfo } => {
                    debug!("Client {} userinfo: {}", client, userinfo);
                }
                ServerEvent::ClientDisconnected { client, reason } => {
                    info!("Client {} dropped: {}", client, reason);
                    self.table.remove(Self::player_entity(client));
                }
                ServerEvent::RemoteCommand { addr, command } => {
                    self.remote_command(ctx, addr, &command, now_ms)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Snapwire Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }
    info!(
        "Configuration loaded: {}:{}, max_clients={}, tick_rate={}",
        config.bind_address, config.port, config.max_clients, config.tick_rate
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    #[cfg(feature = "metrics_http")]
    {
        let metrics_clone = metrics.clone();
        let metrics_port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = snapwire_server::metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let mut ctx = ServerContext::new(config.clone(), metrics.clone())?;
    ctx.set_config_string(CS_WORLD, "sandbox", 0);

    let server = UdpServer::bind(config, metrics).await?;
    info!("Server ready on udp://{}", server.local_addr()?);

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    if let Err(e) = server.run(ctx, Sandbox::new(), shutdown).await {
        error!("Server error: {}", e);
    }

    info!("Server stopped");
    Ok(())
}

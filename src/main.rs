//! huddle - Serverless multiplayer session coordinator

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use huddle::clock::{Clock, SystemClock};
use huddle::network::{Transport, UdpTransport};
use huddle::protocol::{PlayerId, PlayerSlot};
use huddle::session::{
    CoordinatorConfig, CoordinatorState, MemoryDirectory, NotificationSink, NotifyKind,
    SessionCoordinator,
};

/// How often the coordinator frame runs
const FRAME_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Serverless multiplayer session coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (JSON)
    #[arg(short, long, global = true, env = "HUDDLE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session on the local network
    Host {
        /// Port for session traffic
        #[arg(short, long, default_value = "27032")]
        port: u16,

        /// Player name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Search the local network and join a session
    Join {
        /// Join the first session found instead of waiting for `select`
        #[arg(long)]
        auto: bool,

        /// Player name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print the default configuration as JSON
    Config,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>, name: Option<String>) -> Result<CoordinatorConfig> {
    let mut config = match path {
        Some(path) => CoordinatorConfig::load(path).map_err(anyhow::Error::msg)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(name) = name {
        if let Some(player) = config.local_players.first_mut() {
            player.name = name;
        }
    }
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

/// Sink that prints what happens to the terminal
struct ConsoleSink;

impl NotificationSink for ConsoleSink {
    fn notify(&mut self, kind: NotifyKind, param: i64) {
        match kind {
            NotifyKind::Countdown if param >= 0 => println!("Starting in {}...", param),
            NotifyKind::Countdown => println!("Countdown cancelled"),
            NotifyKind::ConnectedToSession => println!("Joined the session"),
            NotifyKind::CreatedHost => println!("Session created, waiting for players"),
            NotifyKind::ClientKicked => println!("You were removed from the session"),
            NotifyKind::LostHost => println!("Lost connection to the host"),
            NotifyKind::MigrationCompleted => println!("Host migration completed"),
            NotifyKind::EndgameHost | NotifyKind::EndgameClient => println!("Back in the lobby"),
            _ => println!("[{:?}] {}", kind, param),
        }
    }

    fn player_updated(&mut self, player: &PlayerSlot, players_needed: u32, is_host: bool) {
        println!(
            "  {} {}{} team {} (need {} more)",
            player.id,
            player.name,
            if is_host { " [host]" } else { "" },
            player.team,
            players_needed
        );
    }

    fn player_removed(&mut self, player: PlayerId) {
        println!("  {} left", player);
    }

    fn connect_to_server(&mut self, host: SocketAddr) {
        println!("Game server ready at {}", host);
    }
}

fn print_status(coordinator: &SessionCoordinator) {
    let info = coordinator.session_info();

    println!("\n=== Session ===");
    println!("State:    {}", info.state);
    println!("Role:     {}", if info.is_host { "host" } else { "client" });
    println!("Session:  {}", info.session_id);
    println!(
        "Slots:    {}/{} public, {}/{} private",
        info.slots.filled_public, info.slots.total_public, info.slots.filled_private, info.slots.total_private
    );
    println!("Players:  {} on {} machines", info.total_players, info.remotes + 1);
    println!("Teams:    {:?}", coordinator.registry().team_counts(coordinator.total_teams()));
    println!("Needed:   {}", coordinator.players_needed());
    println!("===============\n");
}

fn print_help() {
    println!("Commands:");
    println!("  status            show the session");
    println!("  select <n>        join search result n");
    println!("  search            search again");
    println!("  team [n]          pick team n, or the next team with room");
    println!("  start             start the countdown (host)");
    println!("  cancel            cancel the countdown or the current search");
    println!("  ready             the game server is up (host)");
    println!("  loaded            the level finished loading");
    println!("  end               end the game (host)");
    println!("  kick <player>     remove a player (host)");
    println!("  leave             leave the session");
    println!("  quit              leave and exit");
}

/// Apply one console command. Returns false when the user asked to quit.
fn handle_command(coordinator: &mut SessionCoordinator, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(true);
    };
    let arg = words.next();

    match command {
        "status" => print_status(coordinator),
        "search" => coordinator.start_client(true),
        "select" => {
            let index: usize = arg.context("select needs a result number")?.parse()?;
            coordinator.select_session(index);
        }
        "team" => {
            let team = arg.map(str::parse::<i32>).transpose()?;
            coordinator.change_team(team);
        }
        "start" => {
            if !coordinator.start_game() {
                println!("Cannot start yet ({} more players needed)", coordinator.players_needed());
            }
        }
        "cancel" => {
            if coordinator.state() == CoordinatorState::Pregame {
                coordinator.cancel_start_game();
            } else {
                coordinator.cancel_operation();
            }
        }
        "ready" => coordinator.on_server_ready(),
        "loaded" => coordinator.on_level_loading_finished(),
        "end" => coordinator.end_game(),
        "kick" => {
            let player: u64 = arg.context("kick needs a player id")?.parse()?;
            coordinator.kick_player_from_session(PlayerId(player));
        }
        "leave" => coordinator.kick_player_from_session(PlayerId::NONE),
        "quit" | "exit" => {
            coordinator.kick_player_from_session(PlayerId::NONE);
            return Ok(false);
        }
        "help" => print_help(),
        other => bail!("Unknown command: {}", other),
    }
    Ok(true)
}

fn print_results(coordinator: &SessionCoordinator) {
    println!("\nSessions found:");
    for (index, result) in coordinator.search_results().iter().enumerate() {
        let advert = &result.advert;
        println!(
            "  [{}] {} at {} ({}/{} players, {:?})",
            index,
            advert.session_id,
            advert.host_addr,
            advert.filled_public + advert.filled_private,
            advert.total_public() + advert.total_private(),
            result.quality
        );
    }
    println!("Type 'select <n>' to join.\n");
}

async fn run_coordinator(mut coordinator: SessionCoordinator, auto_select: bool) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    let mut last_state = coordinator.state();
    let mut quitting = false;

    print_help();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                coordinator.kick_player_from_session(PlayerId::NONE);
                quitting = true;
            }
            _ = ticker.tick() => {
                coordinator.run_frame();

                let state = coordinator.state();
                if state != last_state {
                    if state == CoordinatorState::Browsing {
                        print_results(&coordinator);
                        if auto_select {
                            coordinator.select_session(0);
                        }
                    }
                    last_state = coordinator.state();
                }

                if quitting && coordinator.state() == CoordinatorState::Initial {
                    break;
                }
            }
            line_result = stdin_reader.next_line(), if !quitting => {
                match line_result {
                    Ok(Some(line)) => match handle_command(&mut coordinator, line.trim()) {
                        Ok(true) => {}
                        Ok(false) => quitting = true,
                        Err(e) => println!("{}", e),
                    },
                    Ok(None) => {
                        info!("stdin closed");
                        coordinator.kick_player_from_session(PlayerId::NONE);
                        quitting = true;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        quitting = true;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_host(config: CoordinatorConfig, port: u16) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let mut transport = UdpTransport::bind(&format!("0.0.0.0:{}", port), clock.clone()).await?;
    transport.listen_system_link(config.system_link_port).await?;

    let mut coordinator = SessionCoordinator::new(
        config,
        Box::new(transport),
        Box::new(MemoryDirectory::new()),
        Box::new(ConsoleSink),
        clock,
    )?;

    match local_ip_address::local_ip() {
        Ok(ip) => println!("\nHosting on {}:{} ({})", ip, port, coordinator.machine_id()),
        Err(e) => {
            warn!("Could not determine local IP: {}", e);
            println!("\nHosting on port {} ({})", port, coordinator.machine_id());
        }
    }

    coordinator.start_host(true);
    run_coordinator(coordinator, false).await
}

async fn run_join(config: CoordinatorConfig, auto_select: bool) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let transport = UdpTransport::bind("0.0.0.0:0", clock.clone()).await?;
    info!("Searching from {}", transport_addr_hint(&transport));

    let mut coordinator = SessionCoordinator::new(
        config,
        Box::new(transport),
        Box::new(MemoryDirectory::new()),
        Box::new(ConsoleSink),
        clock,
    )?;

    println!("\nSearching the local network ({})...", coordinator.machine_id());
    coordinator.start_client(true);
    run_coordinator(coordinator, auto_select).await
}

fn transport_addr_hint(transport: &UdpTransport) -> String {
    let port = transport.local_addr().port();
    match local_ip_address::local_ip() {
        Ok(ip) => format!("{}:{}", ip, port),
        Err(_) => transport.local_addr().to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Host { port, name } => {
            let config = load_config(cli.config.as_ref(), name)?;
            run_host(config, port).await?;
        }
        Commands::Join { auto, name } => {
            let config = load_config(cli.config.as_ref(), name)?;
            run_join(config, auto).await?;
        }
        Commands::Config => {
            let config = load_config(cli.config.as_ref(), None)?;
            println!("{}", config.to_json().map_err(anyhow::Error::msg)?);
        }
    }

    Ok(())
}

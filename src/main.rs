//! Command line interface for zap boards. Manages relays, boards and slugs,
//! issues invoices, and follows a board's paid message feed.

use std::{fs, path::Path};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zapboard::{
    board::{BoardService, NewBoard},
    cache::Cache,
    config::Settings,
    event::unix_now,
    feed::{CorrelationTarget, Correlator, Feed, FeedUpdate},
    payment::{InvoiceRequest, PaymentRequestBuilder},
    premium::{PremiumService, MONITOR_TIMEOUT},
    relay::{RelayPool, DEFAULT_RELAYS},
    signer::{Keys, Signer},
    slug::SlugService,
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "zapboard",
    author,
    version,
    about = "Paid message boards on Nostr",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the cache directory at `CACHE_ROOT`.
    Init,
    /// Manage the relay list.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Create, inspect and list boards.
    Board {
        #[command(subcommand)]
        action: BoardAction,
    },
    /// Request an invoice for a message on a board.
    Invoice {
        board_id: String,
        /// Amount in sats.
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        message: String,
        /// Display name shown next to the message.
        #[arg(long)]
        name: Option<String>,
    },
    /// Follow a board's paid messages.
    Watch {
        board_id: String,
        /// Ignore receipts older than now.
        #[arg(long)]
        live_only: bool,
    },
    /// Custom short names for boards.
    Slug {
        #[command(subcommand)]
        action: SlugAction,
    },
    /// Check whether a user may publish explorable boards.
    Eligibility { pubkey: String },
    /// Premium listing payments for the configured identity.
    Premium {
        #[command(subcommand)]
        action: PremiumAction,
    },
}

/// Operations available under `zapboard relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay after verifying connectivity.
    Add { url: String },
    /// Remove a relay from the configuration.
    Remove { url: String },
}

#[derive(Subcommand)]
enum BoardAction {
    Create {
        #[arg(long)]
        name: String,
        /// Payout address, `user@domain`.
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 1000)]
        min_zap: u64,
        /// List the board publicly (requires `SECRET_KEY`).
        #[arg(long)]
        explorable: bool,
        #[arg(long)]
        logo: Option<String>,
    },
    Show { board_id: String },
    /// Publicly listed boards.
    Explore,
    /// Boards created from this machine.
    Mine,
    /// Remove a board from the public listing.
    Unlist { board_id: String },
}

#[derive(Subcommand)]
enum SlugAction {
    Check { slug: String },
    Resolve { slug: String },
    /// Claim a slug for a board (requires `SECRET_KEY`).
    Reserve {
        slug: String,
        board_id: String,
        /// Reference to the payment that bought the slug.
        payment: String,
    },
    ForBoard { board_id: String },
    ClearCache,
}

#[derive(Subcommand)]
enum PremiumAction {
    Invoice { board_id: String },
    Verify { board_id: String },
    /// Wait for the premium payment to arrive.
    Wait { board_id: String },
}

/// Services built from the settings.
struct App {
    cfg: Settings,
    pool: RelayPool,
    cache: Cache,
    payments: PaymentRequestBuilder,
    user: Option<Keys>,
}

impl App {
    fn new(cfg: Settings) -> anyhow::Result<Self> {
        let pool = RelayPool::new(cfg.relays.clone(), cfg.tor_socks.clone(), cfg.verify_sig);
        let cache = Cache::new(cfg.cache_root.clone());
        let payments = PaymentRequestBuilder::new(cfg.relays.clone())?;
        let user = cfg
            .secret_key
            .as_deref()
            .map(Keys::from_secret_hex)
            .transpose()
            .context("SECRET_KEY")?;
        Ok(Self {
            cfg,
            pool,
            cache,
            payments,
            user,
        })
    }

    fn boards(&self) -> BoardService {
        BoardService::new(self.pool.clone(), self.cache.clone(), self.payments.clone())
            .with_timeouts(self.cfg.query_timeout, self.cfg.publish_timeout)
    }

    fn slugs(&self) -> SlugService {
        SlugService::new(self.pool.clone(), self.cache.clone())
            .with_timeouts(self.cfg.query_timeout, self.cfg.light_publish_timeout)
            .with_price(self.cfg.slug_price)
    }

    fn premium(&self) -> PremiumService {
        PremiumService::new(self.pool.clone(), self.payments.clone())
            .with_query_timeout(self.cfg.query_timeout)
    }

    fn user(&self) -> anyhow::Result<&Keys> {
        match &self.user {
            Some(keys) => Ok(keys),
            None => bail!("SECRET_KEY is not configured"),
        }
    }
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            fs::create_dir_all(&cfg.cache_root)?;
            println!("{}", cfg.cache_root.display());
        }
        Commands::Relay { action } => handle_relay(action, &cli.env, &cfg).await?,
        command => {
            let app = App::new(cfg)?;
            let res = dispatch(&app, command).await;
            app.pool.close_all();
            res?;
        }
    }
    Ok(())
}

async fn dispatch(app: &App, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Board { action } => handle_board(app, action).await?,
        Commands::Invoice {
            board_id,
            amount,
            message,
            name,
        } => {
            let Some(board) = app.boards().load_board(&board_id).await else {
                bail!("board not found: {board_id}");
            };
            let req = InvoiceRequest {
                address: &board.lightning_address,
                amount,
                message: &message,
                board_id: &board_id,
                recipient: &board.creator_pubkey,
                display_name: name.as_deref(),
            };
            let res = app.payments.build(&req).await?;
            println!("{}", res.invoice);
        }
        Commands::Watch { board_id, live_only } => watch(app, &board_id, live_only).await?,
        Commands::Slug { action } => handle_slug(app, action).await?,
        Commands::Eligibility { pubkey } => {
            let res = app.boards().verify_user_eligibility(&pubkey).await;
            match (res.eligible, res.reason) {
                (true, _) => println!("eligible ({})", res.nip05.unwrap_or_default()),
                (false, reason) => println!("not eligible: {}", reason.unwrap_or_default()),
            }
        }
        Commands::Premium { action } => {
            let user = app.user()?.public_key_hex();
            let premium = app.premium();
            match action {
                PremiumAction::Invoice { board_id } => {
                    println!("{}", premium.invoice(&board_id, &user).await?.invoice);
                }
                PremiumAction::Verify { board_id } => {
                    if !premium.verify(&board_id, &user).await {
                        bail!("no premium payment found for {board_id}");
                    }
                    println!("paid");
                }
                PremiumAction::Wait { board_id } => {
                    let msg = premium.monitor(&board_id, &user, MONITOR_TIMEOUT).await?;
                    println!("paid {} sats", msg.amount);
                }
            }
        }
        Commands::Init | Commands::Relay { .. } => {}
    }
    Ok(())
}

async fn handle_board(app: &App, action: BoardAction) -> anyhow::Result<()> {
    let boards = app.boards();
    match action {
        BoardAction::Create {
            name,
            address,
            min_zap,
            explorable,
            logo,
        } => {
            let new = NewBoard {
                name,
                address,
                min_zap,
                explorable,
                logo_url: logo,
            };
            let stored = boards
                .create(new, app.user.as_ref().map(|k| k as &dyn Signer))
                .await?;
            println!("{}", stored.board_id);
        }
        BoardAction::Show { board_id } => {
            let Some(config) = boards.load_board(&board_id).await else {
                bail!("board not found: {board_id}");
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        BoardAction::Explore => {
            for config in boards.fetch_all_boards().await {
                println!("{}  {}", config.board_id, config.board_name);
            }
        }
        BoardAction::Mine => {
            for stored in boards.my_boards() {
                println!("{}  {}", stored.board_id, stored.config.board_name);
            }
        }
        BoardAction::Unlist { board_id } => {
            boards
                .remove_from_explore(&board_id, app.user.as_ref().map(|k| k as &dyn Signer))
                .await?;
        }
    }
    Ok(())
}

async fn handle_slug(app: &App, action: SlugAction) -> anyhow::Result<()> {
    let slugs = app.slugs();
    match action {
        SlugAction::Check { slug } => {
            let res = slugs.check_availability(&slug).await?;
            if res.available {
                println!("available ({} sats)", slugs.price());
            } else {
                println!("taken: {}", res.reason.unwrap_or_default());
            }
        }
        SlugAction::Resolve { slug } => match slugs.resolve(&slug).await {
            Some(board_id) => println!("{board_id}"),
            None => bail!("slug not found: {slug}"),
        },
        SlugAction::Reserve {
            slug,
            board_id,
            payment,
        } => {
            let id = slugs.reserve(&slug, &board_id, &payment, app.user()?).await?;
            println!("{id}");
        }
        SlugAction::ForBoard { board_id } => match slugs.slug_for_board(&board_id).await {
            Some(slug) => println!("{slug}"),
            None => bail!("no slug for board {board_id}"),
        },
        SlugAction::ClearCache => slugs.clear_cache(),
    }
    Ok(())
}

async fn watch(app: &App, board_id: &str, live_only: bool) -> anyhow::Result<()> {
    let Some(board) = app.boards().load_board(board_id).await else {
        bail!("board not found: {board_id}");
    };
    let mut correlator = Correlator::new(app.pool.clone());
    let mut feed = Feed::new();
    let target = CorrelationTarget {
        board_id: board_id.to_string(),
        recipient: board.creator_pubkey.clone(),
    };
    correlator.subscribe(target, live_only.then(unix_now));
    loop {
        let update = tokio::select! {
            update = correlator.next(&mut feed) => update,
            _ = tokio::signal::ctrl_c() => None,
        };
        match update {
            Some(FeedUpdate::Message(m)) => {
                println!(
                    "[{}] {} sats from {}: {}",
                    m.timestamp, m.amount, m.display_name, m.message
                );
            }
            Some(FeedUpdate::Live) => {
                tracing::info!(board = %board_id, messages = feed.len(), "live")
            }
            None => break,
        }
    }
    correlator.unsubscribe();
    println!("total: {} sats in {} messages", feed.total_amount(), feed.len());
    for (rank, m) in feed.leaderboard().iter().enumerate() {
        println!("#{} {} ({} sats)", rank + 1, m.display_name, m.amount);
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let cache_root = base_dir.join("zapboard-cache");
    let mut content = String::new();
    content.push_str(&format!("CACHE_ROOT={}\n", display_path(&cache_root)));
    content.push_str(&format!("RELAYS={}\n", DEFAULT_RELAYS.join(",")));
    content.push_str("TOR_SOCKS=\n");
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("SECRET_KEY=\n");
    content.push_str("PUBLISH_TIMEOUT_SECS=5\n");
    content.push_str("LIGHT_PUBLISH_TIMEOUT_SECS=3\n");
    content.push_str("QUERY_TIMEOUT_SECS=5\n");
    content.push_str("SLUG_PRICE=2100\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn handle_relay(action: RelayAction, env_path: &str, cfg: &Settings) -> anyhow::Result<()> {
    match action {
        RelayAction::Add { url } => add_relay(env_path, cfg, url).await?,
        RelayAction::Remove { url } => remove_relay(env_path, cfg, url)?,
    }
    Ok(())
}

async fn add_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    if cfg.relays.iter().any(|existing| existing == &url) {
        bail!("relay already configured: {url}");
    }
    RelayPool::test_connection(&url, cfg.tor_socks.as_deref()).await?;
    let mut relays = cfg.relays.clone();
    relays.push(url);
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn remove_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    let mut relays = cfg.relays.clone();
    let before = relays.len();
    relays.retain(|existing| existing != &url);
    if relays.len() == before {
        bail!("relay not configured: {url}");
    }
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let relays_joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("RELAYS=") {
            new_content.push_str(&format!("RELAYS={relays_joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("RELAYS={relays_joined}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var("RELAYS", relays_joined);
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zapboard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let cli = Cli::parse();
    run(cli).await
}

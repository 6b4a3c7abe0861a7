//! # Arbor CLI
//!
//! Runs small end-to-end scenarios against an in-process Arbor server:
//! concurrent writers racing for the same field, clients working offline and
//! reconciling, and writers that crash halfway through a commit.
//!
//! Set `RUST_LOG=debug` (or pass `--verbose`) to watch the controller's
//! decisions as they happen.

use std::sync::Arc;

use arbor_concurrency::lock_set;
use arbor_sdk::prelude::*;
use arbor_sdk::Result;
use arbor_store::{ChangePayload, ChangeRecord, ChangeStatus, Clock, SlotKey, SystemClock};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;

type Store = Arc<MemoryBackingStore>;
type DemoClient = Client<Arc<MemoryTransport<Store>>>;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "arbor-cli")]
#[command(about = "Replicated tree store scenarios (Arbor)")]
#[command(version)]
struct Cli {
    /// Log controller and sync decisions at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Two clients edit a model, sync, and converge
    Demo,
    /// Concurrent writers race on one field; revision-bound writes let exactly one win
    Conflict {
        /// Number of concurrent writers
        #[arg(short, long, default_value_t = 8)]
        writers: usize,
    },
    /// A client works offline, then reconciles against remote changes
    Offline,
    /// Writers crash mid-commit; the next writer times them out or rolls them forward
    Recover {
        /// Activity timeout in milliseconds
        #[arg(short, long, default_value_t = 200)]
        timeout_ms: u64,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn show_state(owner: &str, state: &ModelState) {
    let border = "─".repeat(44);
    println!("  ┌{}┐", border);
    println!(
        "  │ {:<42} │",
        format!("{} @ r{}", owner, state.revision())
            .bright_yellow()
            .to_string()
    );
    println!("  ├{}┤", border);
    if state.objects().is_empty() {
        println!("  │ {:<42} │", "(empty)".dimmed().to_string());
    }
    for (object, object_state) in state.objects() {
        println!("  │ {:<42} │", format!("{} (r{})", object, object_state.revision));
        for (field, field_state) in &object_state.fields {
            let value = field_state
                .value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  │ {:<42} │", format!("  {} = {}", field, value));
        }
    }
    println!("  └{}┘", border);
}

fn verdict(ok: bool, good: &str, bad: &str) {
    if ok {
        println!("\n  {} {}", "✓".bright_green().bold(), good.bright_green().bold());
    } else {
        println!("\n  {} {}", "✗".bright_red().bold(), bad.bright_red().bold());
    }
}

fn outcome_label(outcome: &SubmitOutcome) -> ColoredString {
    match outcome {
        SubmitOutcome::Executed(revision) => format!("executed at r{}", revision).bright_green(),
        SubmitOutcome::NoChange => "no change".bright_blue(),
        SubmitOutcome::Failed => "failed".bright_red(),
    }
}

// ─── Helpers ───────────────────────────────────────────────────────────────

fn new_server(config: ControllerConfig) -> Arc<Server<Store>> {
    Arc::new(Server::new(MemoryBackingStore::new(), config))
}

fn new_client(server: &Arc<Server<Store>>, actor: &str) -> (DemoClient, Arc<MemoryTransport<Store>>) {
    let transport = Arc::new(MemoryTransport::new(server.clone()));
    let client = Client::new(transport.clone(), ClientConfigBuilder::new().actor(actor).build());
    (client, transport)
}

fn add(address: &Address) -> Result<AtomicCommand> {
    Ok(AtomicCommand::add_entity(address.clone(), Precondition::SafeStateBound)?)
}

fn set(field: &Address, value: serde_json::Value) -> Result<AtomicCommand> {
    Ok(AtomicCommand::change_value(field.clone(), value, Precondition::Forced)?)
}

/// Create `model` with one object holding `field = value`.
async fn seed(
    server: &Server<Store>,
    model: &Address,
    object: &str,
    field: &str,
    value: serde_json::Value,
) -> Result<Address> {
    let actor = ActorId::new("seed");
    let object = model.with_object(object)?;
    let field = object.with_field(field)?;
    for command in [add(model)?, add(&object)?, add(&field)?, set(&field, value)?] {
        server.submit(&actor, &command.into()).await?;
    }
    Ok(field)
}

// ─── Demo ──────────────────────────────────────────────────────────────────

async fn run_demo() -> Result<()> {
    header("DEMO — Two Clients, One Model");
    let server = new_server(ControllerConfig::default());
    let model: Address = "/demo/tasks".parse()?;
    let task = model.with_object("t1")?;
    let title = task.with_field("title")?;
    let done = task.with_field("done")?;

    let (alice, _) = new_client(&server, "alice");
    let (bob, _) = new_client(&server, "bob");
    alice.open(&model)?;
    bob.open(&model)?;

    section("Phase 1: alice creates a task");
    for command in [add(&model)?, add(&task)?, add(&title)?, set(&title, json!("write docs"))?] {
        alice.apply(command)?;
    }
    step(&format!("alice queued {} changes", alice.pending_len(&model)?));
    let report = alice.sync(&model).await?;
    step(&format!(
        "alice synced: {} confirmed, now at r{}",
        report.confirmed.len(),
        report.revision
    ));

    section("Phase 2: bob catches up and edits");
    let report = bob.sync(&model).await?;
    step(&format!("bob received {} remote events", report.remote_events.len()));
    bob.apply(add(&done)?)?;
    bob.apply(set(&done, json!(true))?)?;
    alice.apply(set(&title, json!("write better docs"))?)?;
    step("bob: done = true    alice: title = \"write better docs\"");

    section("Phase 3: both sync");
    for (name, client) in [("alice", &alice), ("bob", &bob), ("alice", &alice)] {
        let report = client.sync(&model).await?;
        step(&format!(
            "{}: {} confirmed, {} remote, {} lost",
            name,
            report.confirmed.len(),
            report.remote_events.len(),
            report.lost.len()
        ));
    }

    let snapshot = server.snapshot(&model).await?;
    show_state("server", &snapshot);
    show_state("alice", &alice.state(&model)?);
    show_state("bob", &bob.state(&model)?);
    verdict(
        alice.state(&model)? == snapshot && bob.state(&model)? == snapshot,
        "ALL REPLICAS CONVERGED",
        "DIVERGENCE DETECTED",
    );
    Ok(())
}

// ─── Conflict ──────────────────────────────────────────────────────────────

async fn run_conflict(writers: usize) -> Result<()> {
    header("CONFLICT — Racing Writers on One Field");
    let server = new_server(ControllerConfig::default());
    let model: Address = "/demo/board".parse()?;
    let owner = seed(&server, &model, "card", "owner", json!("nobody")).await?;
    let base = server.current_revision(&model).await?;
    step(&format!("card.owner = \"nobody\" at r{}", base));

    section(&format!("{} writers claim the card, bound to r{}", writers, base));
    let claims = (0..writers).map(|i| {
        let server = server.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            let actor = ActorId::new(format!("writer-{}", i));
            let command = AtomicCommand::change_value(
                owner,
                json!(actor.to_string()),
                Precondition::SafeRevisionBound(base),
            )?;
            let outcome = server.submit(&actor, &command.into()).await?;
            Ok::<_, SdkError>((actor, outcome))
        })
    });
    let mut winners = 0;
    for joined in futures::future::join_all(claims).await {
        let Ok(result) = joined else {
            continue;
        };
        let (actor, outcome) = result?;
        if matches!(outcome, SubmitOutcome::Executed(_)) {
            winners += 1;
        }
        step(&format!("{:<10} {}", actor.to_string(), outcome_label(&outcome)));
    }
    verdict(
        winners == 1,
        "EXACTLY ONE WRITER WON",
        "REVISION BOUND WAS NOT HONOURED",
    );

    section("Forced writes serialize instead of failing");
    let forced = (0..writers).map(|i| {
        let server = server.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            let actor = ActorId::new(format!("forcer-{}", i));
            let command = set(&owner, json!(actor.to_string()))?;
            server.submit(&actor, &command.into()).await
        })
    });
    let mut executed = 0;
    for joined in futures::future::join_all(forced).await {
        if let Ok(Ok(SubmitOutcome::Executed(_))) = joined {
            executed += 1;
        }
    }
    step(&format!("{} of {} forced writes executed", executed, writers));
    show_state("server", &server.snapshot(&model).await?);
    Ok(())
}

// ─── Offline ───────────────────────────────────────────────────────────────

async fn run_offline() -> Result<()> {
    header("OFFLINE — Queue, Reconnect, Reconcile");
    let server = new_server(ControllerConfig::default());
    let model: Address = "/demo/notes".parse()?;
    let status = seed(&server, &model, "n1", "status", json!("open")).await?;
    let base = server.current_revision(&model).await?;

    let (client, transport) = new_client(&server, "laptop");
    client.open(&model)?;
    client.sync(&model).await?;
    step(&format!("laptop synced at r{}", base));

    section("Phase 1: laptop goes offline and keeps working");
    transport.set_online(false);
    let n2 = model.with_object("n2")?;
    client.apply(add(&n2)?)?;
    client.apply(AtomicCommand::change_value(
        status.clone(),
        json!("closed"),
        Precondition::SafeRevisionBound(base),
    )?)?;
    step("laptop: add n2, n1.status = \"closed\" (bound to the status it saw)");
    if let Err(err) = client.sync(&model).await {
        step(&format!("sync attempt: {}", err.to_string().bright_red()));
    }
    step(&format!("{} changes still queued", client.pending_len(&model)?));

    section("Phase 2: meanwhile, someone else edits the same note");
    let outcome = server
        .submit(&ActorId::new("phone"), &set(&status, json!("archived"))?.into())
        .await?;
    step(&format!("phone: n1.status = \"archived\" → {}", outcome_label(&outcome)));

    section("Phase 3: laptop reconnects");
    transport.set_online(true);
    let report = client.sync(&model).await?;
    step(&format!("confirmed: {}", report.confirmed.len()));
    step(&format!("remote:    {}", report.remote_events.len()));
    for lost in &report.lost {
        step(&format!(
            "{} {:?}",
            "lost:".bright_red(),
            lost.command.target().to_string()
        ));
    }
    show_state("laptop", &client.state(&model)?);
    verdict(
        client.state(&model)? == server.snapshot(&model).await?,
        "LAPTOP MATCHES SERVER",
        "LAPTOP DIVERGED",
    );
    Ok(())
}

// ─── Recover ───────────────────────────────────────────────────────────────

async fn run_recover(timeout_ms: u64) -> Result<()> {
    header("RECOVER — Crashed Writers");
    let config = ControllerConfigBuilder::new()
        .activity_timeout(timeout_ms)
        .build();
    let server = new_server(config);
    let model: Address = "/demo/ledger".parse()?;
    let balance = seed(&server, &model, "acct", "balance", json!(10)).await?;
    let base = server.current_revision(&model).await?;
    let store = server.store().clone();
    let stale_ms = SystemClock.now_millis().saturating_sub(timeout_ms * 5);

    section("Phase 1: two writers crash on the balance field");
    let command: Command = set(&balance, json!(20))?.into();
    let locks = lock_set(&command);
    store.put_unchecked(
        SlotKey::new(&model, base + 1),
        ChangeRecord::creating(ActorId::new("crashed-early"), locks.clone(), stale_ms),
    );
    step(&format!("r{}: grabbed its slot, then died", base + 1));
    store.put_unchecked(
        SlotKey::new(&model, base + 2),
        ChangeRecord::creating(ActorId::new("crashed-late"), locks, stale_ms)
            .executing(ChangePayload::Command(command), stale_ms),
    );
    step(&format!("r{}: passed its wait, then died before executing", base + 2));

    section("Phase 2: a live writer needs the same field");
    let outcome = server
        .submit(&ActorId::new("teller"), &set(&balance, json!(30))?.into())
        .await?;
    step(&format!("teller: balance = 30 → {}", outcome_label(&outcome)));

    section("Slots after recovery");
    for (revision, record) in store.records_of(&model).into_iter().skip(base as usize) {
        let status = match record.status {
            ChangeStatus::Executed => "Executed".bright_green(),
            ChangeStatus::FailedTimeout => "FailedTimeout".bright_red(),
            other => format!("{:?}", other).bright_blue(),
        };
        step(&format!("r{:<3} {:<14} {}", revision, record.actor.to_string(), status));
    }
    let snapshot = server.snapshot(&model).await?;
    show_state("server", &snapshot);
    verdict(
        snapshot.value_of(&balance) == Some(&json!(30)),
        "CRASHED WRITERS DID NOT BLOCK THE MODEL",
        "MODEL LEFT IN AN UNEXPECTED STATE",
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Demo => run_demo().await,
        Commands::Conflict { writers } => run_conflict(writers).await,
        Commands::Offline => run_offline().await,
        Commands::Recover { timeout_ms } => run_recover(timeout_ms).await,
    }
}

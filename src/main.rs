use anyhow::Context;
use clap::{Parser, Subcommand};
use backoffice_sync::queue::{EntryId, MutationQueueEntry};
use backoffice_sync::status::StatusClient;
use backoffice_sync::{config, observability, run};

#[derive(Parser)]
#[command(
	name = "backoffice-sync",
	about = "Offline sync and stock-reconciliation engine for the retail back-office"
)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the engine and its status surface (default)
	Run,
	/// Print the running daemon's snapshot as JSON
	Status {
		/// Ping the remote first so the snapshot reports connectivity
		#[arg(long)]
		probe: bool,
	},
	/// List dead-lettered mutations
	DeadLetters,
	/// Show where one queued mutation stands
	Track {
		/// Queue entry id
		id: EntryId,
	},
	/// Move a dead-lettered mutation back to pending with a fresh retry budget
	Requeue {
		/// Queue entry id
		id: EntryId,
	},
	/// Delete a dead-lettered mutation permanently
	Purge {
		/// Queue entry id
		id: EntryId,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let settings = match config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("failed to load config, using defaults: {}", e);
			config::Settings::default()
		}
	};
	let obs = observability::init_observability(settings.log_level)?;

	let daemon = StatusClient::from_settings(&settings);
	match cli.command.unwrap_or(Commands::Run) {
		Commands::Run => run(settings, obs.metrics).await?,
		Commands::Status { probe } => {
			let snapshot: serde_json::Value = if probe {
				daemon.post("/probe").await?
			} else {
				daemon.get("/status").await?
			};
			println!("{}", serde_json::to_string_pretty(&snapshot)?);
		}
		Commands::DeadLetters => {
			let dead: Vec<MutationQueueEntry> = daemon.get("/dead-letters").await?;
			if dead.is_empty() {
				println!("No dead-lettered mutations.");
			}
			for entry in dead {
				println!(
					"{}\t{:?}\t{}/{}\tretries={}\t{}",
					entry.id,
					entry.operation,
					entry.entity_type,
					entry.entity_id,
					entry.retry_count,
					entry.last_error.as_deref().unwrap_or("-")
				);
			}
		}
		Commands::Track { id } => {
			let entry: MutationQueueEntry = daemon
				.get(&format!("/mutations/{}", id))
				.await
				.with_context(|| format!("entry {}", id))?;
			println!("{}", serde_json::to_string_pretty(&entry)?);
		}
		Commands::Requeue { id } => {
			daemon
				.post_empty(&format!("/requeue/{}", id))
				.await
				.with_context(|| format!("failed to requeue entry {}", id))?;
			println!("Entry {} requeued.", id);
		}
		Commands::Purge { id } => {
			let entry: MutationQueueEntry = daemon
				.post(&format!("/purge/{}", id))
				.await
				.with_context(|| format!("failed to purge entry {}", id))?;
			println!("Entry {} ({}/{}) purged.", id, entry.entity_type, entry.entity_id);
		}
	}
	Ok(())
}

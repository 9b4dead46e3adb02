use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{LogEntryId, Role, Uid};
use storage::{Storage, DEFAULT_DATABASE_URL};

#[derive(Parser, Debug)]
#[command(about = "Maintenance commands for the lamp panel database")]
struct Cli {
    #[arg(long, default_value = DEFAULT_DATABASE_URL)]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the activity log, newest first.
    Logs {
        #[arg(long)]
        limit: Option<usize>,
    },
    DeleteLog {
        id: i64,
    },
    ClearLogs,
    Users,
    /// Change a user's role: guest, user or admin.
    SetRole {
        uid: String,
        role: String,
    },
    DeleteUser {
        uid: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Logs { limit } => {
            let logs = storage.list_logs().await?;
            for entry in logs.iter().take(limit.unwrap_or(usize::MAX)) {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    entry.id.0,
                    entry.timestamp.to_rfc3339(),
                    entry.actor_email,
                    entry.device,
                    entry.action
                );
            }
        }
        Command::DeleteLog { id } => {
            if !storage.delete_log(LogEntryId(id)).await? {
                bail!("log entry {id} not found");
            }
            println!("deleted log entry {id}");
        }
        Command::ClearLogs => {
            let removed = storage.delete_all_logs().await?;
            println!("removed {removed} log entries");
        }
        Command::Users => {
            for profile in storage.list_profiles().await? {
                println!("{}\t{}\t{}", profile.uid, profile.email, profile.role);
            }
        }
        Command::SetRole { uid, role } => {
            let role = parse_role(&role)?;
            let uid = Uid(uid);
            if !storage.set_role(&uid, role).await? {
                bail!("user {uid} not found");
            }
            println!("{uid} is now {role}");
        }
        Command::DeleteUser { uid } => {
            let uid = Uid(uid);
            if !storage.delete_profile(&uid).await? {
                bail!("user {uid} not found");
            }
            println!("deleted user {uid}");
        }
    }

    Ok(())
}

fn parse_role(raw: &str) -> Result<Role> {
    match raw.to_ascii_lowercase().as_str() {
        "guest" => Ok(Role::Guest),
        "user" => Ok(Role::User),
        "admin" => Ok(Role::Admin),
        other => bail!("unknown role '{other}', expected guest, user or admin"),
    }
}

//! Bayou room-claiming demo client executable.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use env_logger::Env;

use bayou::{pf_error, BayouClient, BayouError, ClientId};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client ID of myself; must be unique among this replica's clients.
    #[arg(short, long)]
    id: ClientId,

    /// Client API address of the replica to talk to.
    #[arg(short, long, default_value = "127.0.0.1:52700")]
    server: SocketAddr,

    #[command(subcommand)]
    cmd: ClientCmd,
}

#[derive(Subcommand, Debug)]
enum ClientCmd {
    /// Probe the replica for liveness.
    Ping,

    /// Claim a room at the given day and hour.
    Claim {
        name: String,
        day: i64,
        hour: i64,
    },

    /// Show the claim on a room slot, if any.
    Check {
        name: String,
        day: i64,
        hour: i64,

        /// Consider only stably committed claims.
        #[arg(long)]
        only_stable: bool,
    },

    /// Run a raw read query against the replica.
    Read {
        query: String,

        /// Read from the committed store instead of the full store.
        #[arg(long)]
        from_commit: bool,
    },
}

async fn client_main(args: CliArgs) -> Result<(), BayouError> {
    let mut client =
        BayouClient::new_and_connect(args.id, args.server).await?;

    match args.cmd {
        ClientCmd::Ping => {
            let alive = client.ping().await?;
            println!("alive: {}", alive);
        }

        ClientCmd::Claim { name, day, hour } => {
            let (has_conflict, was_resolved) =
                client.claim_room(&name, day, hour).await?;
            if has_conflict && !was_resolved {
                println!(
                    "claim on '{}' day {} hour {} REJECTED (double booking)",
                    name, day, hour
                );
            } else {
                println!(
                    "claimed '{}' day {} hour {} (conflict: {})",
                    name, day, hour, has_conflict
                );
            }
        }

        ClientCmd::Check {
            name,
            day,
            hour,
            only_stable,
        } => match client.check_room(&name, day, hour, only_stable).await? {
            Some(room) => println!(
                "room '{}' day {} hour {} is claimed",
                room.name, room.day, room.hour
            ),
            None => {
                println!("room '{}' day {} hour {} is free", name, day, hour)
            }
        },

        ClientCmd::Read { query, from_commit } => {
            let rows = client.read(query, from_commit).await?;
            for row in rows {
                println!("{:?}", row);
            }
        }
    }

    client.leave().await
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    let args = CliArgs::parse();
    if let Err(e) = client_main(args).await {
        pf_error!("client"; "client_main exitted: {}", e);
    }
}

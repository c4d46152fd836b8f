//! Bayou server replica executable.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::watch;

use bayou::{pf_error, pf_warn, BayouError, BayouReplica, ReplicaId};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica ID of myself.
    #[arg(short, long)]
    id: ReplicaId,

    /// List of server replica nodes' peer-to-peer addresses, the order of
    /// which maps to replica IDs.
    /// Example: '-r host1:p2p_port1 -r host2:p2p_port2 -r host3:p2p_port3'.
    #[arg(short, long)]
    replicas: Vec<SocketAddr>,

    /// ID of the replica authorized to assign commit sequence numbers.
    #[arg(long, default_value_t = 0)]
    primary: ReplicaId,

    /// Client API port open to clients.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Protocol-specific configuration TOML string.
    /// Example: '--config backer_path="/tmp/bayou.0.wal" logger_sync=true'.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(BayouError)` on any error.
    fn sanitize(&self) -> Result<(), BayouError> {
        // check for duplicate replicas
        let mut replicas_set = HashSet::new();
        for addr in self.replicas.iter() {
            if replicas_set.contains(addr) {
                return Err(BayouError(format!(
                    "duplicate replica address '{}' given",
                    addr
                )));
            }
            replicas_set.insert(addr);
        }

        if (self.id as usize) >= self.replicas.len() {
            return Err(BayouError(format!(
                "invalid replica ID {} / {}",
                self.id,
                self.replicas.len()
            )));
        }
        if (self.primary as usize) >= self.replicas.len() {
            return Err(BayouError(format!(
                "invalid primary ID {} / {}",
                self.primary,
                self.replicas.len()
            )));
        }
        let my_addr = self.replicas[self.id as usize];

        if self.api_port <= 1024 {
            Err(BayouError(format!("invalid api_port {}", self.api_port)))
        } else if self.api_port == my_addr.port() {
            Err(BayouError(format!(
                "api_port == p2p port {}",
                self.api_port
            )))
        } else if self.threads < 2 {
            Err(BayouError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), BayouError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let population = args.replicas.len() as u8;
    let p2p_addr = args.replicas[args.id as usize];
    let mut peer_addrs = HashMap::new();
    for (id, &addr) in args.replicas.iter().enumerate() {
        let id = id as ReplicaId;
        if id != args.id {
            peer_addrs.insert(id, addr);
        }
    }

    // parse client API port
    let api_addr: SocketAddr = format!("127.0.0.1:{}", args.api_port)
        .parse()
        .map_err(|e| {
            BayouError(format!(
                "failed to parse api_addr: port {}: {}",
                args.api_port, e
            ))
        })?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-replica{}", args.id))
        .build()?;

    // enter tokio runtime, setup the replica, and start the main event
    // loop logic
    runtime.block_on(async move {
        let mut replica = BayouReplica::new_and_setup(
            args.id,
            population,
            args.primary,
            api_addr,
            p2p_addr,
            peer_addrs,
            args.config.as_deref(),
        )
        .await?;

        // ctrl-c as the cooperative kill signal
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx_term.send(true);
            }
        });

        replica.run(rx_term).await?;
        pf_warn!(args.id; "replica terminated, state persisted");

        Ok::<(), BayouError>(()) // give type hint for this async closure
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exitted: {}", e);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), BayouError> {
        let args = CliArgs {
            id: 1,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52801".parse()?,
            ],
            primary: 0,
            api_port: 52701,
            threads: 2,
            config: None,
        };
        assert_eq!(args.sanitize(), Ok(()));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_api_port() -> Result<(), BayouError> {
        let args = CliArgs {
            id: 0,
            replicas: vec!["127.0.0.1:52800".parse()?],
            primary: 0,
            api_port: 1023,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_port_clash() -> Result<(), BayouError> {
        let args = CliArgs {
            id: 0,
            replicas: vec!["127.0.0.1:52800".parse()?],
            primary: 0,
            api_port: 52800,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_duplicate_replica() -> Result<(), BayouError> {
        let args = CliArgs {
            id: 0,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52800".parse()?,
            ],
            primary: 0,
            api_port: 52700,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() -> Result<(), BayouError> {
        let args = CliArgs {
            id: 2,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52801".parse()?,
            ],
            primary: 0,
            api_port: 52700,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_primary() -> Result<(), BayouError> {
        let args = CliArgs {
            id: 0,
            replicas: vec!["127.0.0.1:52800".parse()?],
            primary: 3,
            api_port: 52700,
            threads: 2,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), BayouError> {
        let args = CliArgs {
            id: 0,
            replicas: vec!["127.0.0.1:52800".parse()?],
            primary: 0,
            api_port: 52700,
            threads: 1,
            config: None,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}

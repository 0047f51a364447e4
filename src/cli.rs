//! Interface de linha de comando do `escrowd` baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (serve, show)
//! e flags globais (--config, --database-url, --verbose).

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// escrowd: índice off-chain e motor de ciclo de vida para contratos de escrow.
#[derive(Debug, Parser)]
#[command(name = "escrowd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `escrow.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// URL do banco SQLite; sobrescreve o arquivo e `DATABASE_URL`.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sobe a API HTTP.
    Serve {
        /// Endereço de escuta; sobrescreve `listen` do arquivo.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Mostra um acordo armazenado como JSON.
    Show {
        /// Identificador do acordo.
        id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_serve_subcommand() {
        let cli = Cli::parse_from(["escrowd", "serve", "--listen", "0.0.0.0:8080"]);
        match cli.command {
            Command::Serve { listen } => {
                assert_eq!(listen.unwrap().port(), 8080);
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "escrowd",
            "--config",
            "/etc/escrow.toml",
            "--database-url",
            "sqlite://escrow.db",
            "--verbose",
            "serve",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/escrow.toml")));
        assert_eq!(cli.database_url.as_deref(), Some("sqlite://escrow.db"));
    }

    #[test]
    fn cli_parses_show_subcommand() {
        let id = Uuid::new_v4();
        let cli = Cli::parse_from(["escrowd", "show", &id.to_string()]);
        match cli.command {
            Command::Show { id: parsed } => assert_eq!(parsed, id),
            _ => panic!("expected Show command"),
        }
    }

    #[test]
    fn cli_rejects_malformed_id() {
        assert!(Cli::try_parse_from(["escrowd", "show", "42"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}

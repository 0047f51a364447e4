//! Configuração do serviço carregada a partir de `escrow.toml`.
//!
//! A struct [`EscrowConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `DATABASE_URL`, `ESCROW_RPC_URL`,
//! `ESCROW_CONTRACT` e `ESCROW_ADMIN_TOKEN` têm precedência sobre o arquivo.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use crate::agreement::{ActionKind, Address};
use crate::oracle::{ReceiptPolicy, parse_word};
use crate::service::RetryConfig;
use crate::store::StoreConfig;

/// Arquivo procurado no diretório atual quando `--config` não é informado.
pub const DEFAULT_CONFIG_FILE: &str = "escrow.toml";

/// Configuração de nível superior carregada de `escrow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EscrowConfig {
    /// Endereço onde a API HTTP escuta.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// URL do banco SQLite (`sqlite://escrow.db`). Ausente = armazenamento em memória.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Máximo de conexões no pool do banco.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Endpoint JSON-RPC da chain usado para consultar recibos de transação.
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Exige um recibo on-chain bem-sucedido em toda ação de ciclo de vida.
    #[serde(default)]
    pub require_receipts: bool,

    /// Endereço do contrato de escrow. Quando presente, o recibo precisa
    /// chamar este contrato e o evento precisa ser emitido por ele.
    #[serde(default)]
    pub escrow_contract: Option<String>,

    /// Tópico de assinatura do evento (`topics[0]`) esperado por ação,
    /// ex.: `confirm = "0x..."`. Ações ausentes aceitam qualquer evento.
    #[serde(default)]
    pub event_topics: HashMap<String, String>,

    /// Token exigido para a remoção administrativa. Ausente = remoção desabilitada.
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Máximo de retentativas após conflito de concorrência otimista.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial entre retentativas.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

// Porta padrão: 3000.
fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    25
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_url: None,
            max_connections: default_max_connections(),
            rpc_url: None,
            require_receipts: false,
            escrow_contract: None,
            event_topics: HashMap::new(),
            admin_token: None,
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl EscrowConfig {
    /// Carrega a configuração de `path` (ou de `escrow.toml` no diretório atual)
    /// e aplica as variáveis de ambiente. Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_file(path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE)))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Lê apenas o arquivo, sem consultar o ambiente.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str::<EscrowConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Variáveis de ambiente não vazias sobrescrevem o arquivo.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(url) = non_empty("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = non_empty("ESCROW_RPC_URL") {
            self.rpc_url = Some(url);
        }
        if let Some(contract) = non_empty("ESCROW_CONTRACT") {
            self.escrow_contract = Some(contract);
        }
        if let Some(token) = non_empty("ESCROW_ADMIN_TOKEN") {
            self.admin_token = Some(token);
        }
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig::from_database_url(self.database_url.as_deref(), self.max_connections)
    }

    /// Valida `escrow_contract` e `event_topics`.
    pub fn receipt_policy(&self) -> Result<ReceiptPolicy> {
        let contract = self
            .escrow_contract
            .as_deref()
            .map(|raw| {
                Address::parse(raw).with_context(|| format!("escrow_contract '{raw}' is invalid"))
            })
            .transpose()?;

        let mut event_topics = HashMap::new();
        for (action, topic) in &self.event_topics {
            let action = action.parse::<ActionKind>().map_err(|err| anyhow!(err))?;
            let topic = parse_word(topic).ok_or_else(|| {
                anyhow!("event topic for {} must be 0x followed by 64 hex digits", action.as_str())
            })?;
            event_topics.insert(action, topic);
        }

        Ok(ReceiptPolicy {
            contract,
            event_topics,
        })
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }
}

use crate::auth::StaticAuthGuard;
use crate::client::{ChatClient, ClientConfig};
use crate::constants::{DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_UPDATE_INTERVAL_MS, MAX_FRAME_BYTES};
use crate::store::{ChatStore, MemoryChatStore, SqliteChatStore};
use crate::streaming::CancelPolicy;
use crate::types::*;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "STREAMCHAT_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
    #[arg(long, env = "STREAMCHAT_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, env = "STREAMCHAT_CANCEL_POLICY", default_value_t = CancelPolicy::Truncate)]
    pub cancel_policy: CancelPolicy,
    #[arg(long, env = "STREAMCHAT_NO_MATH", default_value_t = false)]
    pub no_math: bool,
    #[arg(long, env = "STREAMCHAT_UPDATE_INTERVAL_MS", default_value_t = DEFAULT_UPDATE_INTERVAL_MS)]
    pub update_interval_ms: u64,
    #[arg(long, env = "STREAMCHAT_REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, env = "STREAMCHAT_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, env = "STREAMCHAT_MAX_FRAME_BYTES", default_value_t = MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
    #[arg(long, env = "STREAMCHAT_CONNECT_RETRIES", default_value_t = 2)]
    pub connect_retries: u32,
    /// SQLite file for chat history; history stays in memory when omitted
    #[arg(long, env = "STREAMCHAT_DATABASE")]
    pub database: Option<String>,
    /// Thread to resume; a new one is created when omitted
    #[arg(long, env = "STREAMCHAT_THREAD")]
    pub thread: Option<String>,
    #[arg(long, env = "STREAMCHAT_USER")]
    pub user: Option<String>,
    #[arg(long, env = "STREAMCHAT_LOG_DIR", default_value = ".")]
    pub log_dir: String,
}

impl From<&Args> for ClientConfig {
    fn from(args: &Args) -> Self {
        Self {
            endpoint: args.endpoint.clone(),
            model: args.model.clone(),
            cancel_policy: args.cancel_policy,
            normalize_math: !args.no_math,
            update_interval: Duration::from_millis(args.update_interval_ms),
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            max_frame_bytes: args.max_frame_bytes,
            connect_retries: args.connect_retries,
        }
    }
}

pub struct AppState {
    pub client: ChatClient,
    pub store: Arc<dyn ChatStore>,
    pub args: Arc<Args>,
}

impl AppState {
    pub async fn build(args: Args) -> Result<Self> {
        let config = ClientConfig::from(&args);
        let user = args
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok());
        let client = ChatClient::new(config, Arc::new(StaticAuthGuard::new(user)))?;

        let store: Arc<dyn ChatStore> = match &args.database {
            Some(path) => Arc::new(SqliteChatStore::open(path).await?),
            None => Arc::new(MemoryChatStore::new()),
        };

        Ok(Self {
            client,
            store,
            args: Arc::new(args),
        })
    }

    pub fn initial_thread(&self) -> ThreadId {
        match &self.args.thread {
            Some(id) => ThreadId::from(id.clone()),
            None => ThreadId::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_map_onto_client_config() {
        let args = Args::parse_from([
            "streamchat",
            "--endpoint",
            "http://localhost:9999/api/generate",
            "--model",
            "llama3",
            "--cancel-policy",
            "rollback",
            "--no-math",
            "--update-interval-ms",
            "50",
        ]);
        let config = ClientConfig::from(&args);
        assert_eq!(config.endpoint, "http://localhost:9999/api/generate");
        assert_eq!(config.model, "llama3");
        assert_eq!(config.cancel_policy, CancelPolicy::Rollback);
        assert!(!config.normalize_math);
        assert_eq!(config.update_interval, Duration::from_millis(50));
        assert_eq!(config.max_frame_bytes, MAX_FRAME_BYTES);
    }
}

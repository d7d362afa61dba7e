// Concierge Engine — MCP Client Manager
//
// Pool of connected MCP clients, one per server id. Bounded size with
// oldest-eviction, idle eviction, coalesced connection (concurrent
// callers to an unconnected server share one initialisation), and a
// short unhealthy cooldown after a failed connect.

use super::client::McpClient;
use super::mapping::ToolMapping;
use super::types::McpServerConfig;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::Settings;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

struct PooledClient {
    client: Arc<McpClient>,
    last_used: Instant,
}

pub struct McpManager {
    configs: HashMap<String, McpServerConfig>,
    clients: Mutex<HashMap<String, PooledClient>>,
    /// In-flight connections, keyed by server id. Waiters re-check the
    /// pool once the slot resolves.
    connecting: Mutex<HashMap<String, watch::Receiver<bool>>>,
    /// Servers in failure cooldown, with the instant retry is allowed.
    cooldown: Mutex<HashMap<String, Instant>>,
    max_pool_size: usize,
    idle_timeout: Duration,
    cooldown_period: Duration,
    tool_timeout_secs: u64,
}

impl McpManager {
    pub fn new(settings: &Settings) -> Self {
        let configs = Self::load_server_configs(settings);
        if !configs.is_empty() {
            info!("[mcp] {} server(s) configured: {:?}", configs.len(), configs.keys());
        }
        McpManager {
            configs,
            clients: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            cooldown: Mutex::new(HashMap::new()),
            max_pool_size: settings.mcp_pool_size,
            idle_timeout: Duration::from_secs(settings.mcp_idle_timeout_secs),
            cooldown_period: Duration::from_secs(settings.mcp_cooldown_secs),
            tool_timeout_secs: settings.mcp_tool_timeout_secs,
        }
    }

    fn load_server_configs(settings: &Settings) -> HashMap<String, McpServerConfig> {
        let Some(path) = settings.mcp_servers_path.as_deref() else {
            return HashMap::new();
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(r) => r,
            Err(e) => {
                warn!("[mcp] servers file {:?} unreadable: {}", path, e);
                return HashMap::new();
            }
        };
        match serde_json::from_str::<Vec<McpServerConfig>>(&raw) {
            Ok(list) => list
                .into_iter()
                .filter(|c| c.enabled)
                .map(|c| (c.id.clone(), c))
                .collect(),
            Err(e) => {
                warn!("[mcp] servers file parse failed: {}", e);
                HashMap::new()
            }
        }
    }

    pub fn knows_server(&self, server_id: &str) -> bool {
        self.configs.contains_key(server_id)
    }

    /// Call a tool on a server, connecting on demand. Updates the
    /// client's last-used instant.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> EngineResult<String> {
        let client = self.get_client(server_id).await?;
        let result = client.call_tool(tool_name, arguments, self.tool_timeout_secs).await;

        {
            let mut clients = self.clients.lock().await;
            if let Some(pooled) = clients.get_mut(server_id) {
                pooled.last_used = Instant::now();
            }
        }
        result
    }

    /// Get (or create) the live client for a server id.
    async fn get_client(&self, server_id: &str) -> EngineResult<Arc<McpClient>> {
        loop {
            // Pool hit?
            {
                let mut clients = self.clients.lock().await;
                self.evict_idle(&mut clients).await;
                if let Some(pooled) = clients.get_mut(server_id) {
                    if pooled.client.is_alive().await {
                        pooled.last_used = Instant::now();
                        return Ok(pooled.client.clone());
                    }
                    info!("[mcp] Server '{}' connection is dead, dropping", server_id);
                    clients.remove(server_id);
                }
            }

            // Cooling down after a failed connect?
            {
                let mut cooldown = self.cooldown.lock().await;
                if let Some(until) = cooldown.get(server_id) {
                    if Instant::now() < *until {
                        return Err(EngineError::Transport(format!(
                            "MCP server '{}' is in failure cooldown",
                            server_id
                        )));
                    }
                    cooldown.remove(server_id);
                }
            }

            // Join an in-flight connect, or claim the slot.
            let tx = {
                let mut connecting = self.connecting.lock().await;
                if let Some(rx) = connecting.get(server_id) {
                    let mut rx = rx.clone();
                    drop(connecting);
                    let _ = rx.changed().await;
                    continue; // re-check the pool
                }
                let (tx, rx) = watch::channel(false);
                connecting.insert(server_id.to_string(), rx);
                tx
            };

            let outcome = self.connect(server_id).await;

            {
                let mut connecting = self.connecting.lock().await;
                connecting.remove(server_id);
            }
            let _ = tx.send(true);

            match outcome {
                Ok(client) => return Ok(client),
                Err(e) => {
                    let mut cooldown = self.cooldown.lock().await;
                    cooldown.insert(server_id.to_string(), Instant::now() + self.cooldown_period);
                    warn!(
                        "[mcp] Connect to '{}' failed ({}); cooling down {:?}",
                        server_id, e, self.cooldown_period
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn connect(&self, server_id: &str) -> EngineResult<Arc<McpClient>> {
        let config = self
            .configs
            .get(server_id)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("unknown MCP server '{}'", server_id)))?;

        let client = Arc::new(McpClient::connect(config).await?);

        let mut clients = self.clients.lock().await;
        if clients.len() >= self.max_pool_size {
            self.evict_oldest(&mut clients).await;
        }
        clients.insert(
            server_id.to_string(),
            PooledClient { client: client.clone(), last_used: Instant::now() },
        );
        Ok(client)
    }

    async fn evict_idle(&self, clients: &mut HashMap<String, PooledClient>) {
        let stale: Vec<String> = clients
            .iter()
            .filter(|(_, p)| p.last_used.elapsed() > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(pooled) = clients.remove(&id) {
                info!("[mcp] Evicting idle server '{}'", id);
                pooled.client.shutdown().await;
            }
        }
    }

    async fn evict_oldest(&self, clients: &mut HashMap<String, PooledClient>) {
        let oldest = clients
            .iter()
            .min_by_key(|(_, p)| p.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            if let Some(pooled) = clients.remove(&id) {
                warn!("[mcp] Pool full ({}), evicting oldest server '{}'", self.max_pool_size, id);
                pooled.client.shutdown().await;
            }
        }
    }

    /// Connect each server named by the mapping and check the mapped
    /// tool names exist. Failures log warnings; they never abort startup.
    pub async fn validate_mapping(&self, mapping: &ToolMapping) {
        let mut checked: HashMap<String, Vec<String>> = HashMap::new();
        for (tool, (server, server_tool)) in mapping.entries() {
            if !self.knows_server(server) {
                warn!("[mcp] mapping '{}' names unknown server '{}'", tool, server);
                continue;
            }
            let available = match checked.get(server) {
                Some(tools) => tools.clone(),
                None => match self.get_client(server).await {
                    Ok(client) => {
                        let names: Vec<String> =
                            client.tools.iter().map(|t| t.name.clone()).collect();
                        checked.insert(server.clone(), names.clone());
                        names
                    }
                    Err(e) => {
                        warn!("[mcp] mapping validation: '{}' unreachable: {}", server, e);
                        continue;
                    }
                },
            };
            if !available.contains(server_tool) {
                warn!(
                    "[mcp] mapping '{}' → '{}.{}' not in server's tools/list",
                    tool, server, server_tool
                );
            }
        }
    }

    pub async fn shutdown_all(&self) {
        let mut clients = self.clients.lock().await;
        for (id, pooled) in clients.drain() {
            info!("[mcp] Shutting down '{}'", id);
            pooled.client.shutdown().await;
        }
    }

    /// Pool status snapshot for /healthz.
    pub async fn status(&self) -> serde_json::Value {
        let clients = self.clients.lock().await;
        let connected: Vec<&String> = clients.keys().collect();
        serde_json::json!({
            "configured": self.configs.len(),
            "connected": connected,
            "max_pool_size": self.max_pool_size,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

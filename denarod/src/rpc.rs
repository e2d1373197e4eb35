//! The HTTP RPC surface: thin request handlers over the chain manager,
//! store, mempool, and peer layer.
//!
//! Every route answers the `{ok, result|error}` JSON envelope (except the
//! root status route) and sets `Access-Control-Allow-Origin: *`. A request
//! carrying a `Sender-Node` header registers its sender, which is how
//! peers discover each other.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use denaro_chain::keys::Address;
use denaro_chain::transaction::{self, Transaction};
use denaro_chain::{block::merkle, DenaroSerialize};
use denaro_consensus::ChainManager;
use denaro_network::{gossip, ChainSync, NodeInterface, NodeRegistry, SyncError};
use denaro_state::mempool::{self, MempoolError, ScrubTimer};
use denaro_state::{BoxError, Store};

use crate::rate_limit::RateLimiter;

/// Protocol version reported by the status route.
pub const NODE_VERSION: u32 = 1;

/// Recently accepted transaction hashes, deduplicating gossip echoes.
const TX_CACHE_SIZE: usize = 100;

pub struct NodeServices {
    pub manager: Arc<ChainManager>,
    pub registry: Arc<NodeRegistry>,
    pub sync: Arc<ChainSync>,
    pub scrub_timer: ScrubTimer,
    pub rate_limiter: RateLimiter,
    pub transactions_cache: Mutex<VecDeque<transaction::Hash>>,
    pub started: AtomicBool,
}

impl NodeServices {
    pub fn new(
        manager: Arc<ChainManager>,
        registry: Arc<NodeRegistry>,
        sync: Arc<ChainSync>,
    ) -> NodeServices {
        NodeServices {
            manager,
            registry,
            sync,
            scrub_timer: ScrubTimer::new(),
            rate_limiter: RateLimiter::new(),
            transactions_cache: Mutex::new(VecDeque::with_capacity(TX_CACHE_SIZE)),
            started: AtomicBool::new(false),
        }
    }

    fn store(&self) -> Arc<dyn Store> {
        self.manager.store().clone()
    }
}

pub async fn serve(addr: SocketAddr, services: Arc<NodeServices>) -> Result<(), BoxError> {
    let make_service = make_service_fn(move |conn: &AddrStream| {
        let services = services.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let services = services.clone();
                async move { Ok::<_, Infallible>(handle(services, remote, request).await) }
            }))
        }
    });
    info!(%addr, "RPC surface listening");
    Server::bind(&addr).serve(make_service).await?;
    Ok(())
}

fn envelope_ok(result: Value) -> Value {
    json!({ "ok": true, "result": result })
}

fn envelope_err(error: &str) -> Value {
    json!({ "ok": false, "error": error })
}

fn respond(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(body.to_string()))
        .expect("static response headers are valid")
}

async fn handle(
    services: Arc<NodeServices>,
    remote: SocketAddr,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().trim_matches('/').to_string();
    let query = parts.uri.query().unwrap_or("").to_string();

    let sender_node = parts
        .headers
        .get("Sender-Node")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_end_matches('/').to_string());
    if let Some(sender) = &sender_node {
        services.registry.add_node(sender);
    }
    let host = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    bootstrap(&services, &host);

    let body_json: Option<Value> = if method == Method::POST {
        hyper::body::to_bytes(body)
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    } else {
        None
    };

    // route-level rate limits, per client address
    let limited = match path.as_str() {
        "push_block" => !allow(&services, remote.ip(), "push_block", 3, 60),
        "sync_blockchain" => !allow(&services, remote.ip(), "sync_blockchain", 10, 60),
        "get_address_info" => !allow(&services, remote.ip(), "get_address_info", 1, 1),
        "add_node" => !allow(&services, remote.ip(), "add_node", 10, 60),
        "get_transaction" => !allow(&services, remote.ip(), "get_transaction", 2, 1),
        "get_block" => !allow(&services, remote.ip(), "get_block", 30, 60),
        "get_blocks" => !allow(&services, remote.ip(), "get_blocks", 10, 60),
        _ => false,
    };
    if limited {
        return respond(
            StatusCode::TOO_MANY_REQUESTS,
            envelope_err("Rate limit exceeded"),
        );
    }

    let result = match (method.as_str(), path.as_str()) {
        ("GET", "") => root(&services),
        ("GET" | "POST", "push_tx") => push_tx(&services, sender_node, &query, body_json).await,
        ("GET" | "POST", "push_block") => {
            push_block(&services, sender_node, &query, body_json).await
        }
        ("GET", "sync_blockchain") => sync_blockchain(&services, &query).await,
        ("GET", "get_mining_info") => get_mining_info(&services),
        ("GET", "get_address_info") => get_address_info(&services, &query),
        ("GET" | "POST", "add_node") => add_node(&services, &query, body_json).await,
        ("GET", "get_nodes") => get_nodes(&services),
        ("GET", "get_pending_transactions") => get_pending_transactions(&services),
        ("GET", "get_transaction") => get_transaction(&services, &query),
        ("GET", "get_block") => get_block(&services, &query),
        ("GET", "get_blocks") => get_blocks(&services, &query),
        _ => return respond(StatusCode::NOT_FOUND, envelope_err("Not found")),
    };

    match result {
        Ok(body) => respond(StatusCode::OK, body),
        Err(e) => {
            error!(%e, "internal error while handling a request");
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                envelope_err("Internal error"),
            )
        }
    }
}

fn allow(
    services: &NodeServices,
    ip: IpAddr,
    route: &'static str,
    limit: usize,
    window_secs: u64,
) -> bool {
    services
        .rate_limiter
        .check(ip, route, limit, Duration::from_secs(window_secs))
}

/// First-contact bookkeeping: merge the peer list of a known node, learn
/// our own public URL from the Host header, and announce ourselves.
fn bootstrap(services: &Arc<NodeServices>, host: &str) {
    if host.is_empty() || services.started.load(Ordering::Relaxed) {
        return;
    }
    let hostname = host
        .rsplit_once(':')
        .map(|(name, _)| name)
        .unwrap_or(host)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let local = hostname == "localhost" || ip_is_local(hostname);

    let recent = services.registry.get_recent_nodes();
    if let Some(peer) = recent.first().cloned() {
        let registry = services.registry.clone();
        let self_url = services.sync.self_url();
        tokio::spawn(async move {
            if let Ok(nodes) = NodeInterface::new(&peer, self_url).get_nodes().await {
                for node in nodes {
                    registry.add_node(&node);
                }
            }
        });
    }

    if !local {
        services.started.store(true, Ordering::Relaxed);
        let self_url = format!("http://{}", host);
        info!(%self_url, "learned own url, announcing to the network");
        services.sync.set_self_url(self_url.clone());
        services.registry.remove_node(&self_url);
        services
            .registry
            .remove_node(&self_url.replace("http://", "https://"));

        let services = services.clone();
        tokio::spawn(async move {
            gossip::propagate(
                &services.registry,
                services.sync.self_url().as_deref(),
                None,
                "add_node",
                json!({ "url": services.sync.self_url() }),
            )
            .await;
        });
    }
}

/// Addresses a peer cannot be reached back on: loopback, RFC 1918 and
/// friends.
fn ip_is_local(hostname: &str) -> bool {
    let ip: IpAddr = match hostname.parse() {
        Ok(ip) => ip,
        Err(_) => return false,
    };
    match ip {
        IpAddr::V6(v6) => v6.is_loopback(),
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || octets[0] == 0
                || octets[0] >= 240
                || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 64)
                || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
                || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
                || (octets[0] == 192 && octets[1] == 88 && octets[2] == 99)
        }
    }
}

fn query_param(query: &str, body: &Option<Value>, key: &str) -> Option<String> {
    if let Some(body) = body {
        if let Some(value) = body.get(key) {
            if let Some(s) = value.as_str() {
                return Some(s.to_string());
            }
            if value.is_number() {
                return Some(value.to_string());
            }
        }
    }
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

fn root(services: &NodeServices) -> Result<Value, BoxError> {
    let unspent_outputs_hash = services.store().get_unspent_outputs_hash()?;
    Ok(json!({
        "version": NODE_VERSION,
        "unspent_outputs_hash": unspent_outputs_hash,
    }))
}

async fn push_tx(
    services: &Arc<NodeServices>,
    sender_node: Option<String>,
    query: &str,
    body: Option<Value>,
) -> Result<Value, BoxError> {
    let tx_hex = match query_param(query, &body, "tx_hex") {
        Some(tx_hex) => tx_hex,
        None => return Ok(envelope_err("Missing tx_hex")),
    };
    let tx = match Transaction::from_hex(&tx_hex) {
        Ok(Transaction::Regular(tx)) => tx,
        Ok(Transaction::Coinbase(_)) => {
            return Ok(envelope_err("A coinbase cannot be submitted"))
        }
        Err(e) => return Ok(envelope_err(&e.to_string())),
    };
    let hash = tx.hash();
    if services
        .transactions_cache
        .lock()
        .expect("cache lock is never poisoned")
        .contains(&hash)
    {
        return Ok(envelope_err("Transaction already present"));
    }

    match mempool::add_pending_transaction(&*services.store(), tx) {
        Ok(()) => {
            if let Some(sender) = sender_node {
                services.registry.update_last_contact(&sender);
            }
            {
                let mut cache = services
                    .transactions_cache
                    .lock()
                    .expect("cache lock is never poisoned");
                if cache.len() == TX_CACHE_SIZE {
                    cache.pop_front();
                }
                cache.push_back(hash);
            }
            let gossiper = services.clone();
            tokio::spawn(async move {
                gossip::propagate(
                    &gossiper.registry,
                    gossiper.sync.self_url().as_deref(),
                    None,
                    "push_tx",
                    json!({ "tx_hex": tx_hex }),
                )
                .await;
            });
            // occasionally scrub the pool on the ingestion path too
            if rand::random::<u8>() % 10 == 0
                && services.scrub_timer.due(denaro_chain::timestamp())
            {
                let store = services.store();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = mempool::scrub_pending_pool(&*store) {
                        warn!(%e, "pending pool scrub failed");
                    }
                });
            }
            Ok(json!({ "ok": true, "result": "Transaction has been accepted" }))
        }
        Err(MempoolError::AlreadyPresent) => Ok(envelope_err("Transaction already present")),
        Err(MempoolError::Store(e)) => Err(e),
        Err(e) => Ok(envelope_err(&e.to_string())),
    }
}

async fn push_block(
    services: &Arc<NodeServices>,
    sender_node: Option<String>,
    query: &str,
    body: Option<Value>,
) -> Result<Value, BoxError> {
    let block_content = query_param(query, &body, "block_content").unwrap_or_default();
    let mut txs: Vec<String> = match body.as_ref().and_then(|b| b.get("txs")) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => query_param(query, &body, "txs")
            .unwrap_or_default()
            .split(',')
            .map(str::to_string)
            .collect(),
    };
    txs.retain(|tx| !tx.is_empty());
    let id: Option<u32> = query_param(query, &body, "id").and_then(|id| id.parse().ok());

    let content = match denaro_chain::block::BlockContent::from_hex(&block_content) {
        Ok(content) => content,
        Err(e) => return Ok(envelope_err(&e.to_string())),
    };
    let store = services.store();
    let next_block_id = store.next_block_id()?;

    let id = match id {
        Some(id) => id,
        None => match store.get_block_by_hash(&content.previous_hash)? {
            Some(previous) => previous.id + 1,
            None => {
                return Ok(match sender_node {
                    Some(sender) => {
                        spawn_sync(services, Some(sender));
                        envelope_err(
                            "Previous hash not found, had to sync according to sender node, \
                             block may have been accepted",
                        )
                    }
                    None => envelope_err("Previous hash not found"),
                })
            }
        },
    };
    if next_block_id < id {
        spawn_sync(services, sender_node);
        return Ok(envelope_err(
            "Blocks missing, had to sync according to sender node, block may have been accepted",
        ));
    }
    if next_block_id > id {
        return Ok(envelope_err("Too old block"));
    }

    // a submission may reference pending transactions by bare hash
    let mut final_transactions = Vec::new();
    let mut hashes = Vec::new();
    for tx_hex in &txs {
        if tx_hex.len() == 64 {
            match tx_hex.parse::<transaction::Hash>() {
                Ok(hash) => hashes.push(hash),
                Err(_) => return Ok(envelope_err("Invalid transaction hash")),
            }
        } else {
            match Transaction::from_hex(tx_hex) {
                Ok(Transaction::Regular(tx)) => final_transactions.push(tx),
                Ok(Transaction::Coinbase(_)) => {}
                Err(e) => return Ok(envelope_err(&e.to_string())),
            }
        }
    }
    if !hashes.is_empty() {
        let pending = store.get_pending_transactions_by_hash(&hashes)?;
        if pending.len() < hashes.len() {
            return Ok(match sender_node {
                Some(sender) => {
                    spawn_sync(services, Some(sender));
                    envelope_err(
                        "Transaction hash not found, had to sync according to sender node, \
                         block may have been accepted",
                    )
                }
                None => envelope_err("Transaction hash not found"),
            });
        }
        final_transactions.extend(pending);
    }

    let propagated_txs: Vec<String> = if final_transactions.len() < 10 {
        final_transactions.iter().map(|tx| tx.hex()).collect()
    } else {
        txs.clone()
    };
    match services
        .manager
        .create_block(&block_content, final_transactions, None)
    {
        Ok(record) => {
            if let Some(sender) = sender_node {
                services.registry.update_last_contact(&sender);
            }
            let services = services.clone();
            tokio::spawn(async move {
                gossip::propagate(
                    &services.registry,
                    services.sync.self_url().as_deref(),
                    None,
                    "push_block",
                    json!({
                        "block_content": block_content,
                        "txs": propagated_txs,
                        "id": record.id,
                    }),
                )
                .await;
            });
            Ok(json!({ "ok": true }))
        }
        Err(denaro_consensus::BlockError::Store(e)) => Err(e),
        Err(e) => {
            debug!(%e, "rejected pushed block");
            Ok(envelope_err(&e.to_string()))
        }
    }
}

async fn sync_blockchain(services: &Arc<NodeServices>, query: &str) -> Result<Value, BoxError> {
    let node_url = query_param(query, &None, "node_url");
    match services.sync.sync_blockchain(node_url).await {
        Ok(()) => Ok(json!({ "ok": true })),
        Err(SyncError::AlreadySyncing) => Ok(envelope_err("Node is already syncing")),
        Err(e) => {
            warn!(%e, "sync requested over RPC failed");
            Ok(envelope_err(&e.to_string()))
        }
    }
}

fn get_mining_info(services: &Arc<NodeServices>) -> Result<Value, BoxError> {
    services.manager.invalidate_difficulty();
    let (difficulty, last_block) = services.manager.difficulty()?;

    let entries = mempool::ordered(services.store().get_pending_entries()?);
    let entries = mempool::select_for_block(&entries);
    let pending_hexes: Vec<String> = entries.iter().map(|e| e.transaction.hex()).collect();
    let pending_hashes: Vec<String> = entries
        .iter()
        .map(|e| e.transaction.hash().to_string())
        .collect();
    let first_ten: Vec<Vec<u8>> = entries
        .iter()
        .take(10)
        .map(|e| e.transaction.denaro_serialize_to_vec())
        .collect::<Result<_, _>>()?;
    let merkle_root = merkle::root_sorted(&first_ten);

    if services.scrub_timer.due(denaro_chain::timestamp()) {
        let store = services.store();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = mempool::scrub_pending_pool(&*store) {
                warn!(%e, "pending pool scrub failed");
            }
        });
    }

    Ok(envelope_ok(json!({
        "difficulty": difficulty.as_f64(),
        "last_block": last_block.map(|b| serde_json::to_value(b)).transpose()?.unwrap_or(json!({})),
        "pending_transactions": pending_hexes.iter().take(10).collect::<Vec<_>>(),
        "pending_transactions_hashes": pending_hashes,
        "merkle_root": merkle_root.to_string(),
    })))
}

fn get_address_info(services: &Arc<NodeServices>, query: &str) -> Result<Value, BoxError> {
    #[derive(Deserialize)]
    struct Params {
        address: String,
        #[serde(default = "default_tx_limit")]
        transactions_count_limit: usize,
        #[serde(default)]
        show_pending: bool,
        #[serde(default)]
        verify: bool,
    }
    fn default_tx_limit() -> usize {
        5
    }

    let params: Params = match serde_urlencoded::from_str(query) {
        Ok(params) => params,
        Err(_) => return Ok(envelope_err("Missing address")),
    };
    if params.transactions_count_limit > 50 {
        return Ok(envelope_err("transactions_count_limit is capped at 50"));
    }
    let address: Address = match params.address.parse() {
        Ok(address) => address,
        Err(_) => return Ok(envelope_err("Invalid address")),
    };
    let store = services.store();

    let outputs = store.get_address_spendable_outputs(&address)?;
    let mut balance = denaro_chain::amount::Amount::ZERO;
    for (_, amount) in &outputs {
        balance = balance
            .checked_add(*amount)
            .ok_or("balance overflows the amount domain")?;
    }

    let transactions = if params.transactions_count_limit > 0 {
        store
            .get_address_transactions(&address, params.transactions_count_limit)?
            .iter()
            .map(|tx| transaction_to_json(&*store, tx, params.verify))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        Vec::new()
    };

    let (pending_transactions, pending_spent_outputs) = if params.show_pending {
        let pending = store
            .get_address_pending_transactions(&address)?
            .iter()
            .map(|tx| {
                transaction_to_json(&*store, &Transaction::Regular(tx.clone()), params.verify)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let spent: Vec<Value> = store
            .get_address_pending_spent_outputs(&address)?
            .iter()
            .map(|output| json!({ "tx_hash": output.tx_hash.to_string(), "index": output.index }))
            .collect();
        (Some(pending), Some(spent))
    } else {
        (None, None)
    };

    Ok(envelope_ok(json!({
        "balance": balance.to_string(),
        "spendable_outputs": outputs
            .iter()
            .map(|(output, amount)| json!({
                "amount": amount.to_string(),
                "tx_hash": output.tx_hash.to_string(),
                "index": output.index,
            }))
            .collect::<Vec<_>>(),
        "transactions": transactions,
        "pending_transactions": pending_transactions,
        "pending_spent_outputs": pending_spent_outputs,
    })))
}

async fn add_node(
    services: &Arc<NodeServices>,
    query: &str,
    body: Option<Value>,
) -> Result<Value, BoxError> {
    let url = match query_param(query, &body, "url") {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => return Ok(envelope_err("Missing url")),
    };
    if Some(url.as_str()) == services.sync.self_url().as_deref() {
        return Ok(envelope_err("Recursively adding node"));
    }
    if services.registry.contains(&url) {
        return Ok(envelope_err("Node already present"));
    }
    let node = NodeInterface::new(&url, services.sync.self_url());
    if !node.is_working().await {
        return Ok(envelope_err("Could not add node"));
    }
    services.registry.add_node(&url);
    let services = services.clone();
    let announced = url.clone();
    tokio::spawn(async move {
        gossip::propagate(
            &services.registry,
            services.sync.self_url().as_deref(),
            Some(&announced),
            "add_node",
            json!({ "url": announced.clone() }),
        )
        .await;
    });
    Ok(envelope_ok(json!("Node added")))
}

fn get_nodes(services: &NodeServices) -> Result<Value, BoxError> {
    let mut nodes = services.registry.get_recent_nodes();
    nodes.truncate(100);
    Ok(envelope_ok(json!(nodes)))
}

fn get_pending_transactions(services: &NodeServices) -> Result<Value, BoxError> {
    let hexes: Vec<String> = services
        .store()
        .get_pending_entries()?
        .iter()
        .take(1000)
        .map(|entry| entry.transaction.hex())
        .collect();
    Ok(envelope_ok(json!(hexes)))
}

fn get_transaction(services: &NodeServices, query: &str) -> Result<Value, BoxError> {
    let tx_hash = match query_param(query, &None, "tx_hash") {
        Some(hash) => hash,
        None => return Ok(envelope_err("Missing tx_hash")),
    };
    let verify = query_param(query, &None, "verify")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let tx_hash: transaction::Hash = match tx_hash.parse() {
        Ok(hash) => hash,
        Err(_) => return Ok(envelope_err("Invalid tx_hash")),
    };
    let store = services.store();
    let tx = match store.get_transaction(&tx_hash)? {
        Some(tx) => Some(tx),
        None => store
            .get_pending_transaction(&tx_hash)?
            .map(Transaction::Regular),
    };
    match tx {
        Some(tx) => Ok(envelope_ok(transaction_to_json(&*store, &tx, verify)?)),
        None => Ok(envelope_err("Transaction not found")),
    }
}

fn get_block(services: &NodeServices, query: &str) -> Result<Value, BoxError> {
    let block_param = match query_param(query, &None, "block") {
        Some(block) => block,
        None => return Ok(envelope_err("Missing block")),
    };
    let full_transactions = query_param(query, &None, "full_transactions")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let store = services.store();

    let block = if block_param.chars().all(|c| c.is_ascii_digit()) {
        match block_param.parse() {
            Ok(id) => store.get_block_by_id(id)?,
            Err(_) => return Ok(envelope_err("Block not found")),
        }
    } else {
        match block_param.parse() {
            Ok(hash) => store.get_block_by_hash(&hash)?,
            Err(_) => return Ok(envelope_err("Invalid block")),
        }
    };
    let block = match block {
        Some(block) => block,
        None => return Ok(envelope_err("Block not found")),
    };

    let transactions = store.get_block_transactions(&block.hash)?;
    let full = if full_transactions {
        Some(
            transactions
                .iter()
                .map(|tx| transaction_to_json(&*store, tx, false))
                .collect::<Result<Vec<_>, _>>()?,
        )
    } else {
        None
    };
    Ok(envelope_ok(json!({
        "block": serde_json::to_value(&block)?,
        "transactions": transactions.iter().map(|tx| tx.hex()).collect::<Vec<_>>(),
        "full_transactions": full,
    })))
}

fn get_blocks(services: &NodeServices, query: &str) -> Result<Value, BoxError> {
    #[derive(Deserialize)]
    struct Params {
        offset: u32,
        limit: u32,
    }
    let params: Params = match serde_urlencoded::from_str(query) {
        Ok(params) => params,
        Err(_) => return Ok(envelope_err("Missing offset or limit")),
    };
    if params.limit > 1000 {
        return Ok(envelope_err("limit is capped at 1000"));
    }
    let blocks = services.store().get_blocks(params.offset, params.limit)?;
    Ok(envelope_ok(serde_json::to_value(blocks)?))
}

/// The JSON view of a transaction. With `verify`, inputs are filled from
/// the store so their owners and amounts show, and the signatures are
/// re-checked.
fn transaction_to_json(
    store: &dyn Store,
    tx: &Transaction,
    verify: bool,
) -> Result<Value, BoxError> {
    match tx {
        Transaction::Coinbase(coinbase) => Ok(json!({
            "is_coinbase": true,
            "hash": coinbase.hash().to_string(),
            "block_hash": coinbase.block_hash.to_string(),
            "outputs": [{
                "address": coinbase.address.to_string(),
                "amount": coinbase.amount.to_string(),
            }],
        })),
        Transaction::Regular(tx) => {
            let mut tx = tx.clone();
            let mut verified = None;
            if verify {
                let related_hashes: Vec<transaction::Hash> =
                    tx.inputs.iter().map(|input| input.tx_hash).collect();
                let related = store.get_transactions(&related_hashes)?;
                let filled = tx.fill_inputs(&related).is_ok()
                    && tx.distribute_signatures().is_ok();
                verified = Some(filled && tx.verify().is_ok());
            }
            let inputs: Vec<Value> = tx
                .inputs
                .iter()
                .map(|input| {
                    let mut entry = json!({
                        "index": input.index,
                        "tx_hash": input.tx_hash.to_string(),
                    });
                    if let Some(output) = &input.related_output {
                        entry["address"] = json!(output.address.to_string());
                        entry["amount"] = json!(output.amount.to_string());
                    }
                    entry
                })
                .collect();
            Ok(json!({
                "is_coinbase": false,
                "hash": tx.hash().to_string(),
                "inputs": inputs,
                "outputs": tx
                    .outputs
                    .iter()
                    .map(|output| json!({
                        "address": output.address.to_string(),
                        "amount": output.amount.to_string(),
                    }))
                    .collect::<Vec<_>>(),
                "message": tx.message.as_ref().map(hex::encode),
                "fees": tx.fee().ok().map(|fee| fee.to_string()),
                "verified": verified,
            }))
        }
    }
}

fn spawn_sync(services: &Arc<NodeServices>, node_url: Option<String>) {
    let services = services.clone();
    tokio::spawn(async move {
        if let Err(e) = services.sync.sync_blockchain(node_url).await {
            debug!(%e, "background sync did not complete");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addresses_are_recognized() {
        assert!(ip_is_local("127.0.0.1"));
        assert!(ip_is_local("10.1.2.3"));
        assert!(ip_is_local("192.168.0.17"));
        assert!(ip_is_local("100.64.0.1"));
        assert!(ip_is_local("0.0.0.0"));
        assert!(ip_is_local("240.1.1.1"));
        assert!(ip_is_local("::1"));
        assert!(!ip_is_local("1.1.1.1"));
        assert!(!ip_is_local("a-public-hostname.example"));
    }

    #[test]
    fn query_params_fall_back_to_the_body() {
        let body = Some(json!({ "tx_hex": "aabb", "id": 7 }));
        assert_eq!(query_param("", &body, "tx_hex").as_deref(), Some("aabb"));
        assert_eq!(query_param("", &body, "id").as_deref(), Some("7"));
        assert_eq!(
            query_param("tx_hex=ccdd", &None, "tx_hex").as_deref(),
            Some("ccdd")
        );
        assert_eq!(query_param("", &None, "tx_hex"), None);
    }
}

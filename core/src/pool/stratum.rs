//! Stratum subprotocol: persistent line-JSON socket per pool.
//!
//! Session states: Disconnected -> Subscribing -> Authorizing -> Active,
//! then back to Disconnected with exponential backoff on any failure. The
//! session id from the first subscribe is preserved across reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

use crate::error::{CoreError, Result};
use crate::run::Core;
use crate::work::{merkle_root_from_branch, sha256d, Work};

use super::messages::{RpcMessage, RpcRequest};
use super::Pool;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_CEILING: u64 = 60;

#[derive(Clone)]
pub struct StratumClient {
    pool: Arc<Pool>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>>,
    next_id: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
}

impl StratumClient {
    fn new(pool: Arc<Pool>, write_half: OwnedWriteHalf) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(Some(write_half))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_line(&self, request: &RpcRequest) -> Result<()> {
        let json = serde_json::to_string(request)?;
        debug!("pool {} -> {}", self.pool.id.0, json);
        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| CoreError::Transient("stratum socket closed".into()))?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Request/response round trip through the pending map.
    async fn call(&self, request: RpcRequest) -> Result<RpcMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request.id, tx);
        if let Err(e) = self.send_line(&request).await {
            self.pending.lock().await.remove(&request.id);
            return Err(e);
        }
        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(CoreError::Transient("stratum connection dropped".into())),
            Err(_) => {
                self.pending.lock().await.remove(&request.id);
                Err(CoreError::Transient("stratum request timed out".into()))
            }
        }
    }

    /// Submit a share; Ok(true) accepted, Ok(false) rejected, Err transient.
    pub async fn submit_share(
        &self,
        job_id: &str,
        nonce2_hex: &str,
        ntime_hex: &str,
        nonce_hex: &str,
    ) -> Result<(bool, Option<String>)> {
        let req = RpcRequest::submit(
            self.next_id(),
            &self.pool.user,
            job_id,
            nonce2_hex,
            ntime_hex,
            nonce_hex,
        );
        let resp = self.call(req).await?;
        if let Some(reason) = resp.error_text() {
            return Ok((false, Some(reason)));
        }
        Ok((resp.result_bool(), None))
    }

    async fn shutdown_socket(&self) {
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock().await = None;
        self.pending.lock().await.clear();
    }
}

/// Per-pool stratum supervisor; owns the reconnect loop for its pool.
pub async fn run_pool_stratum(core: Arc<Core>, pool: Arc<Pool>) {
    let mut backoff = 1u64;
    loop {
        if core.is_shutdown() {
            break;
        }
        let started = Instant::now();
        match session(&core, &pool).await {
            Ok(()) => break,
            Err(e) => {
                if core.is_shutdown() {
                    break;
                }
                warn!(
                    "pool {} stratum: {} - reconnecting in {}s",
                    pool.id.0, e, backoff
                );
            }
        }
        pool.stratum_active.store(false, Ordering::Relaxed);
        *pool.stratum.lock() = None;
        // A session that lived a while earns a fresh backoff.
        if started.elapsed() > Duration::from_secs(120) {
            backoff = 1;
        }
        let mut shutdown = core.shutdown_rx();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(BACKOFF_CEILING);
    }
    pool.stratum_active.store(false, Ordering::Relaxed);
    *pool.stratum.lock() = None;
}

/// One connected session: subscribe, authorize, then serve notifications
/// until the socket dies or shutdown is requested.
async fn session(core: &Arc<Core>, pool: &Arc<Pool>) -> Result<()> {
    let host = pool.stratum_host().to_string();
    debug!("pool {} connecting to {}", pool.id.0, host);
    let stream = TcpStream::connect(&host)
        .await
        .map_err(|e| CoreError::Transient(format!("connect {}: {}", host, e)))?;
    let (read_half, write_half) = stream.into_split();
    let client = StratumClient::new(Arc::clone(pool), write_half);

    let reader_task = tokio::spawn(read_loop(
        Arc::clone(core),
        Arc::clone(pool),
        read_half,
        client.clone(),
    ));

    // Subscribing. Resuming a session keeps the pool's extranonce stable.
    let resume = pool.swork.read().sessionid.clone();
    let resp = client
        .call(RpcRequest::subscribe(client.next_id(), resume.as_deref()))
        .await?;
    apply_subscribe(pool, &resp)?;

    // Authorizing.
    let resp = client
        .call(RpcRequest::authorize(
            client.next_id(),
            &pool.user,
            &pool.pass,
        ))
        .await?;
    if !resp.result_bool() {
        // Some pools authorize lazily on first submit; keep the session.
        warn!(
            "pool {} did not confirm worker authorization ({:?})",
            pool.id.0, resp.result
        );
    }
    if let Some(diff) = core.opts.suggest_diff {
        let _ = client
            .send_line(&RpcRequest::suggest_difficulty(client.next_id(), diff))
            .await;
    }

    pool.stratum_active.store(true, Ordering::Relaxed);
    *pool.stratum.lock() = Some(client.clone());
    info!("pool {} stratum active: {}", pool.id.0, pool.url);

    // Active until disconnect or shutdown.
    let mut shutdown = core.shutdown_rx();
    let result = tokio::select! {
        joined = reader_task => match joined {
            Ok(Ok(())) => Err(CoreError::Transient("stratum connection closed".into())),
            Ok(Err(e)) => Err(CoreError::Transient(format!("stratum read: {}", e))),
            Err(e) => Err(CoreError::Transient(format!("stratum reader panicked: {}", e))),
        },
        _ = shutdown.changed() => Ok(()),
    };
    client.shutdown_socket().await;
    result
}

/// Subscribe result: [[subscriptions...], extranonce1, extranonce2_size].
fn apply_subscribe(pool: &Pool, resp: &RpcMessage) -> Result<()> {
    let result = resp
        .result
        .as_ref()
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::Transient("malformed subscribe response".into()))?;
    let nonce1 = result
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Transient("subscribe response missing extranonce1".into()))?
        .to_string();
    let nonce2_size = result.get(2).and_then(Value::as_u64).unwrap_or(4) as usize;
    let sessionid = result
        .get(0)
        .and_then(Value::as_array)
        .and_then(|subs| {
            subs.iter().find_map(|s| {
                let pair = s.as_array()?;
                if pair.first()?.as_str()? == "mining.notify" {
                    pair.get(1)?.as_str().map(str::to_string)
                } else {
                    None
                }
            })
        });

    let mut swork = pool.swork.write();
    if swork.nonce1 != nonce1 {
        swork.nonce2 = 0;
    }
    swork.nonce1 = nonce1;
    swork.nonce2_size = nonce2_size;
    if sessionid.is_some() {
        swork.sessionid = sessionid;
    }
    debug!(
        "pool {} subscribed: extranonce1 {} nonce2 size {}",
        pool.id.0, swork.nonce1, swork.nonce2_size
    );
    Ok(())
}

async fn read_loop(
    core: Arc<Core>,
    pool: Arc<Pool>,
    read_half: OwnedReadHalf,
    client: StratumClient,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let msg: RpcMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                debug!("pool {} unparseable line: {}", pool.id.0, e);
                continue;
            }
        };

        if let Some(method) = msg.method.as_deref() {
            match method {
                "mining.notify" => {
                    if let Some(params) = &msg.params {
                        if let Err(e) = handle_notify(&core, &pool, params) {
                            debug!("pool {} bad mining.notify: {}", pool.id.0, e);
                        }
                    }
                }
                "mining.set_difficulty" => {
                    let diff = msg
                        .params
                        .as_ref()
                        .and_then(Value::as_array)
                        .and_then(|a| a.first())
                        .and_then(Value::as_f64);
                    if let Some(diff) = diff {
                        pool.set_min_diff(diff);
                        pool.swork.write().target = crate::work::target_from_pdiff(diff);
                        debug!("pool {} difficulty set to {}", pool.id.0, diff);
                    }
                }
                "client.reconnect" => {
                    info!("pool {} requested reconnect", pool.id.0);
                    break;
                }
                "client.show_message" => {
                    let text = msg
                        .params
                        .as_ref()
                        .and_then(Value::as_array)
                        .and_then(|a| a.first())
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    info!("pool {} message: {}", pool.id.0, text);
                    *pool.admin_msg.lock() = Some(text);
                }
                other => debug!("pool {} unhandled method {}", pool.id.0, other),
            }
            continue;
        }

        if let Some(id) = msg.id {
            if let Some(tx) = client.pending.lock().await.remove(&id) {
                let _ = tx.send(msg);
            }
        }
    }
    client.connected.store(false, Ordering::Relaxed);
    Ok(())
}

/// mining.notify: [job_id, prevhash, coinb1, coinb2, [branch], version,
/// nbits, ntime, clean].
fn handle_notify(core: &Arc<Core>, pool: &Arc<Pool>, params: &Value) -> Result<()> {
    let arr = params
        .as_array()
        .filter(|a| a.len() >= 9)
        .ok_or_else(|| CoreError::Transient("short mining.notify".into()))?;

    let job_id = notify_str(arr, 0)?.to_string();
    let prev_hash: [u8; 32] = decode_fixed(notify_str(arr, 1)?)?;
    let coinb1 = hex::decode(notify_str(arr, 2)?)?;
    let coinb2 = hex::decode(notify_str(arr, 3)?)?;
    let branch: Vec<[u8; 32]> = arr
        .get(4)
        .and_then(Value::as_array)
        .map(|hashes| {
            hashes
                .iter()
                .filter_map(Value::as_str)
                .map(decode_fixed::<32>)
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    let version: [u8; 4] = decode_fixed(notify_str(arr, 5)?)?;
    let nbits: [u8; 4] = decode_fixed(notify_str(arr, 6)?)?;
    let ntime = u32::from_str_radix(notify_str(arr, 7)?, 16)
        .map_err(|_| CoreError::Transient("bad ntime".into()))?;
    let clean = arr.get(8).and_then(Value::as_bool).unwrap_or(false);

    let block_id = Work::block_id_from_prev_hash(&prev_hash);
    let prev_block = pool.block_id.swap(block_id, Ordering::Relaxed);
    let new_block = prev_block != block_id;

    {
        let mut swork = pool.swork.write();
        let nonce1 = hex::decode(&swork.nonce1).unwrap_or_default();
        let mut coinbase = coinb1.clone();
        coinbase.extend_from_slice(&nonce1);
        let nonce2_offset = coinbase.len();
        coinbase.extend(std::iter::repeat(0u8).take(swork.nonce2_size));
        coinbase.extend_from_slice(&coinb2);

        swork.job_id = job_id.clone();
        swork.clean = clean;
        swork.coinbase = coinbase;
        swork.nonce2_offset = nonce2_offset;
        swork.merkle_branch = branch;
        swork.header1[..4].copy_from_slice(&version);
        swork.header1[4..].copy_from_slice(&prev_hash);
        swork.diffbits = nbits;
        swork.ntime = ntime;
        swork.tv_received = Some(Instant::now());
        swork.transparency_probed = false;
    }

    pool.work_succeeded();
    debug!(
        "pool {} notify: job {} clean {} new block {}",
        pool.id.0, job_id, clean, new_block
    );
    if new_block {
        core.note_new_block(pool, block_id);
    }
    if clean || new_block {
        // Fully applied before any work can be generated from the new job:
        // the swork lock is already released, so generation sees the new
        // job, while everything staged for the old one dies here.
        core.invalidate_pool_work(pool);
    }
    Ok(())
}

fn notify_str(arr: &[Value], i: usize) -> Result<&str> {
    arr.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Transient(format!("mining.notify param {} not a string", i)))
}

fn decode_fixed<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != N {
        return Err(CoreError::Transient(format!(
            "expected {} bytes, got {}",
            N,
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Builds one work from the pool's current stratum job, consuming a nonce2.
///
/// Returns None until a job has arrived. The nonce2 increment happens under
/// the same data-lock hold as the snapshot, so concurrent generators never
/// reuse an extranonce.
pub fn gen_stratum_work(pool: &Pool) -> Option<Work> {
    let mut swork = pool.swork.write();
    if swork.job_id.is_empty() {
        return None;
    }

    let nonce2 = swork.nonce2;
    if swork.nonce2_size > 0 {
        let max = 1u128 << (8 * swork.nonce2_size as u32);
        let next = nonce2 as u128 + 1;
        if next >= max {
            swork.nonce2 = 0;
            // Extranonce space exhausted; stale until the next notify.
            pool.lagging.store(true, Ordering::Relaxed);
            debug!("pool {} nonce2 wrapped", pool.id.0);
        } else {
            swork.nonce2 = next as u64;
        }
    }

    let nonce2_le = nonce2.to_le_bytes();
    let nonce2_bytes = &nonce2_le[..swork.nonce2_size];
    let mut coinbase = swork.coinbase.clone();
    coinbase[swork.nonce2_offset..swork.nonce2_offset + swork.nonce2_size]
        .copy_from_slice(nonce2_bytes);

    let merkle_root = merkle_root_from_branch(sha256d(&coinbase), &swork.merkle_branch);

    let mut work = Work::new(pool.id);
    work.data[..36].copy_from_slice(&swork.header1);
    work.data[36..68].copy_from_slice(&merkle_root);
    work.data[68..72].copy_from_slice(&swork.ntime.to_be_bytes());
    work.data[72..76].copy_from_slice(&swork.diffbits);
    work.finalize_header();
    work.recompute_midstate();
    work.target = swork.target;

    work.stratum = true;
    work.job_id = swork.job_id.clone();
    work.nonce1 = swork.nonce1.clone();
    work.nonce2 = nonce2_bytes.to_vec();
    work.getwork_mode = crate::work::GetworkMode::Stratum;
    work.block_id = pool.block_id.load(Ordering::Relaxed);
    work.restart_id = pool.work_restart_id.load(Ordering::Relaxed);
    // Stratum pools accept a modest ntime roll window.
    work.rolltime = 60;
    work.drv_rolllimit = 60;

    let min = pool.min_diff.lock();
    work.work_difficulty = min.diff;
    work.nonce_diff = min.diff;
    drop(min);

    work.tv_getwork = swork.tv_received;
    work.tv_getwork_reply = swork.tv_received;
    pool.works_generated.fetch_add(1, Ordering::Relaxed);
    Some(work)
}

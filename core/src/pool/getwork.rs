//! HTTP work sources: getwork, getblocktemplate, and long-poll.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::error::{CoreError, Result};
use crate::run::Core;
use crate::work::{
    bdiff_from_be, merkle_branch_for_coinbase, merkle_root_from_branch, sha256d, GetworkMode,
    Template, Work,
};

use super::Pool;

/// JSON-RPC POST against the pool's rpc url; returns the whole response
/// object so callers can interpret `result`/`error` per method.
fn rpc_call(pool: &Pool, client: &reqwest::blocking::Client, body: &Value) -> Result<RpcReply> {
    let mut req = client.post(&pool.url).json(body);
    if !pool.user.is_empty() {
        req = req.basic_auth(&pool.user, Some(&pool.pass));
    }
    let resp = req.send()?;
    let status = resp.status();
    if !status.is_success() {
        return Err(CoreError::Transient(format!("http {}", status)));
    }
    let rolltime = parse_rolltime(resp.headers());
    let longpoll_path = resp
        .headers()
        .get("x-long-polling")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body: Value = resp.json()?;
    Ok(RpcReply {
        body,
        rolltime,
        longpoll_path,
    })
}

struct RpcReply {
    body: Value,
    rolltime: u32,
    longpoll_path: Option<String>,
}

/// `X-Roll-NTime: Y` or `expire=N`.
fn parse_rolltime(headers: &reqwest::header::HeaderMap) -> u32 {
    let Some(value) = headers.get("x-roll-ntime").and_then(|v| v.to_str().ok()) else {
        return 0;
    };
    let value = value.trim();
    if value.eq_ignore_ascii_case("n") || value.is_empty() {
        return 0;
    }
    if let Some(expire) = value.strip_prefix("expire=") {
        return expire.parse().unwrap_or(60);
    }
    60
}

fn note_longpoll_url(pool: &Pool, path: Option<String>) {
    let Some(path) = path else { return };
    let url = if path.starts_with("http") {
        path
    } else {
        // Relative long-poll path: splice onto the rpc origin.
        match origin_of(&pool.url) {
            Some(origin) => format!("{}{}", origin, path),
            None => return,
        }
    };
    let mut lp = pool.lp_url.lock();
    if lp.as_deref() != Some(url.as_str()) {
        info!("pool {} long-poll url: {}", pool.id.0, url);
        *lp = Some(url);
    }
}

fn origin_of(url: &str) -> Option<String> {
    let scheme_end = url.find("://")? + 3;
    let path_start = url[scheme_end..].find('/').map(|i| scheme_end + i);
    Some(match path_start {
        Some(i) => url[..i].to_string(),
        None => url.to_string(),
    })
}

/// One getwork request; the classic 128-byte hex data reply.
pub fn fetch_getwork(pool: &Pool) -> Result<Work> {
    pool.getwork_requested.fetch_add(1, Ordering::Relaxed);
    let lease = pool.ring.acquire()?;
    let reply = rpc_call(
        pool,
        &lease,
        &json!({"method": "getwork", "params": [], "id": 0}),
    )?;
    note_longpoll_url(pool, reply.longpoll_path);
    let result = reply
        .body
        .get("result")
        .filter(|r| !r.is_null())
        .ok_or_else(|| {
            CoreError::Transient(format!(
                "getwork error: {}",
                reply.body.get("error").unwrap_or(&Value::Null)
            ))
        })?;
    work_from_getwork_result(pool, result, reply.rolltime)
}

pub fn work_from_getwork_result(pool: &Pool, result: &Value, rolltime: u32) -> Result<Work> {
    let data_hex = result
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Transient("getwork reply missing data".into()))?;
    let data = hex::decode(data_hex)?;
    if data.len() != 128 {
        return Err(CoreError::Transient(format!(
            "getwork data is {} bytes",
            data.len()
        )));
    }

    let mut work = Work::new(pool.id);
    work.data.copy_from_slice(&data);
    match result.get("midstate").and_then(Value::as_str) {
        Some(ms_hex) => {
            let ms = hex::decode(ms_hex)?;
            if ms.len() != 32 {
                return Err(CoreError::Transient("bad midstate length".into()));
            }
            work.midstate.copy_from_slice(&ms);
        }
        None => work.recompute_midstate(),
    }
    if let Some(target_hex) = result.get("target").and_then(Value::as_str) {
        let target = hex::decode(target_hex)?;
        if target.len() != 32 {
            return Err(CoreError::Transient("bad target length".into()));
        }
        // getwork targets arrive little-endian.
        for (i, b) in target.iter().rev().enumerate() {
            work.target[i] = *b;
        }
    }

    let mut prev_hash = [0u8; 32];
    prev_hash.copy_from_slice(&work.data[4..36]);
    work.block_id = Work::block_id_from_prev_hash(&prev_hash);
    work.restart_id = pool.work_restart_id.load(Ordering::Relaxed);
    work.rolltime = rolltime;
    work.drv_rolllimit = rolltime;
    work.work_difficulty = bdiff_from_be(&work.target);
    work.nonce_diff = pool.min_diff.lock().diff;
    work.getwork_mode = GetworkMode::Pool;
    let now = Instant::now();
    work.tv_getwork = Some(now);
    work.tv_getwork_reply = Some(now);
    pool.works_generated.fetch_add(1, Ordering::Relaxed);
    Ok(work)
}

/// getwork submit: the solved 128-byte data block.
pub fn submit_getwork(pool: &Pool, work: &Work) -> Result<(bool, Option<String>)> {
    let lease = pool.ring.acquire()?;
    let data_hex = hex::encode(work.data);
    let reply = rpc_call(
        pool,
        &lease,
        &json!({"method": "getwork", "params": [data_hex], "id": 1}),
    )?;
    let accepted = matches!(reply.body.get("result").and_then(Value::as_bool), Some(true));
    let reason = reply
        .body
        .get("error")
        .filter(|e| !e.is_null())
        .map(|e| e.to_string());
    Ok((accepted, reason))
}

/// getblocktemplate fetch. The pool must supply `coinbasetxn`; templates
/// without one are a configuration problem, not a retry case.
pub fn fetch_template(pool: &Pool) -> Result<Arc<Template>> {
    pool.getwork_requested.fetch_add(1, Ordering::Relaxed);
    let lease = pool.ring.acquire()?;
    let reply = rpc_call(
        pool,
        &lease,
        &json!({
            "method": "getblocktemplate",
            "params": [{"capabilities": ["coinbasetxn", "workid", "longpoll"]}],
            "id": 0
        }),
    )?;
    note_longpoll_url(pool, reply.longpoll_path);
    let result = reply
        .body
        .get("result")
        .filter(|r| !r.is_null())
        .ok_or_else(|| {
            CoreError::Transient(format!(
                "getblocktemplate error: {}",
                reply.body.get("error").unwrap_or(&Value::Null)
            ))
        })?;
    template_from_result(result)
}

pub fn template_from_result(result: &Value) -> Result<Arc<Template>> {
    let version = result
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| CoreError::Transient("template missing version".into()))? as u32;
    let prev_hex = result
        .get("previousblockhash")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Transient("template missing previousblockhash".into()))?;
    let prev_display = hex::decode(prev_hex)?;
    if prev_display.len() != 32 {
        return Err(CoreError::Transient("bad previousblockhash".into()));
    }
    // Displayed hashes are byte-reversed relative to header order.
    let mut prev_hash = [0u8; 32];
    for (i, b) in prev_display.iter().rev().enumerate() {
        prev_hash[i] = *b;
    }

    let curtime = result.get("curtime").and_then(Value::as_u64).unwrap_or(0) as u32;
    let height = result.get("height").and_then(Value::as_u64).unwrap_or(0);
    let bits_hex = result
        .get("bits")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Transient("template missing bits".into()))?;
    let bits_bytes = hex::decode(bits_hex)?;
    if bits_bytes.len() != 4 {
        return Err(CoreError::Transient("bad bits".into()));
    }
    let mut bits = [0u8; 4];
    bits.copy_from_slice(&bits_bytes);

    let mut target = [0xffu8; 32];
    if let Some(target_hex) = result.get("target").and_then(Value::as_str) {
        let t = hex::decode(target_hex)?;
        if t.len() == 32 {
            target.copy_from_slice(&t);
        }
    }

    let coinbase_hex = result
        .get("coinbasetxn")
        .and_then(|c| c.get("data"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CoreError::Config("pool template does not supply coinbasetxn".into())
        })?;
    let coinbase = hex::decode(coinbase_hex)?;

    let mut tx_hashes = Vec::new();
    let mut tx_data = Vec::new();
    if let Some(txs) = result.get("transactions").and_then(Value::as_array) {
        for tx in txs {
            let hash_hex = tx
                .get("hash")
                .or_else(|| tx.get("txid"))
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::Transient("transaction without hash".into()))?;
            let display = hex::decode(hash_hex)?;
            if display.len() != 32 {
                return Err(CoreError::Transient("bad transaction hash".into()));
            }
            let mut h = [0u8; 32];
            for (i, b) in display.iter().rev().enumerate() {
                h[i] = *b;
            }
            tx_hashes.push(h);
            if let Some(data) = tx.get("data").and_then(Value::as_str) {
                tx_data.push(data.to_string());
            }
        }
    }

    let mutable_time = result
        .get("mutable")
        .and_then(Value::as_array)
        .map(|m| m.iter().filter_map(Value::as_str).any(|s| s == "time"))
        .unwrap_or(false);

    Ok(Arc::new(Template {
        version,
        prev_hash,
        bits,
        curtime,
        height,
        nonce2_offset: 0,
        nonce2_size: 0,
        merkle_branch: merkle_branch_for_coinbase(&tx_hashes),
        tx_data,
        coinbase,
        target,
        longpoll_id: result
            .get("longpollid")
            .and_then(Value::as_str)
            .map(str::to_string),
        submit_old: mutable_time,
        fetched: Instant::now(),
    }))
}

/// Base work for a template; later works come from rolling this one.
pub fn work_from_template(pool: &Pool, tmpl: &Arc<Template>) -> Work {
    let mut work = Work::new(pool.id);
    work.data[..4].copy_from_slice(&tmpl.version.to_be_bytes());
    work.data[4..36].copy_from_slice(&tmpl.prev_hash);
    let root = merkle_root_from_branch(sha256d(&tmpl.coinbase), &tmpl.merkle_branch);
    work.data[36..68].copy_from_slice(&root);
    work.data[68..72].copy_from_slice(&tmpl.curtime.to_be_bytes());
    work.data[72..76].copy_from_slice(&tmpl.bits);
    work.finalize_header();
    work.recompute_midstate();
    work.target = tmpl.target;
    work.block_id = Work::block_id_from_prev_hash(&tmpl.prev_hash);
    work.restart_id = pool.work_restart_id.load(Ordering::Relaxed);
    work.rolltime = if tmpl.submit_old { 60 } else { 0 };
    work.drv_rolllimit = work.rolltime;
    work.work_difficulty = bdiff_from_be(&tmpl.target);
    work.nonce_diff = pool.min_diff.lock().diff;
    work.getwork_mode = GetworkMode::Gbt;
    work.tmpl = Some(Arc::clone(tmpl));
    let now = Instant::now();
    work.tv_getwork = Some(now);
    work.tv_getwork_reply = Some(now);
    pool.works_generated.fetch_add(1, Ordering::Relaxed);
    work
}

/// submitblock with the solved header, coinbase, and template
/// transactions.
pub fn submit_gbt(pool: &Pool, work: &Work) -> Result<(bool, Option<String>)> {
    let tmpl = work
        .tmpl
        .as_ref()
        .ok_or_else(|| CoreError::ProtocolReject("gbt work lost its template".into()))?;
    let mut block_hex = hex::encode(&work.data[..80]);
    block_hex.push_str(&varint_hex(1 + tmpl.tx_data.len() as u64));
    block_hex.push_str(&hex::encode(&tmpl.coinbase));
    for tx in &tmpl.tx_data {
        block_hex.push_str(tx);
    }

    let lease = pool.ring.acquire()?;
    let reply = rpc_call(
        pool,
        &lease,
        &json!({"method": "submitblock", "params": [block_hex], "id": 2}),
    )?;
    // submitblock returns null on success, a reason string otherwise.
    let result = reply.body.get("result").unwrap_or(&Value::Null);
    if result.is_null() {
        Ok((true, None))
    } else {
        Ok((false, Some(result.to_string())))
    }
}

fn varint_hex(n: u64) -> String {
    let mut out = Vec::new();
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
    hex::encode(out)
}

/// OS thread per pool: a GET held open by the pool until new work exists.
pub fn longpoll_loop(core: Arc<Core>, pool: Arc<Pool>) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(90))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("pool {} long-poll client init failed: {}", pool.id.0, e);
            return;
        }
    };

    while !core.is_shutdown() {
        let Some(url) = pool.lp_url.lock().clone() else {
            // No long-poll endpoint advertised yet.
            std::thread::sleep(Duration::from_secs(1));
            continue;
        };
        let mut req = client.get(&url);
        if !pool.user.is_empty() {
            req = req.basic_auth(&pool.user, Some(&pool.pass));
        }
        match req.send() {
            Ok(resp) if resp.status().is_success() => {
                let body: Value = match resp.json() {
                    Ok(b) => b,
                    Err(e) => {
                        debug!("pool {} long-poll body: {}", pool.id.0, e);
                        continue;
                    }
                };
                let Some(result) = body.get("result").filter(|r| !r.is_null()) else {
                    continue;
                };
                match work_from_getwork_result(&pool, result, 0) {
                    Ok(mut work) => {
                        work.longpoll = true;
                        work.mandatory = true;
                        work.getwork_mode = GetworkMode::Longpoll;
                        info!("pool {} long-poll delivered new work", pool.id.0);
                        let old = pool.block_id.swap(work.block_id, Ordering::Relaxed);
                        if old != work.block_id {
                            core.note_new_block(&pool, work.block_id);
                            core.invalidate_pool_work(&pool);
                        }
                        if !pool.getwork_q.push(work) {
                            break;
                        }
                    }
                    Err(e) => debug!("pool {} long-poll work: {}", pool.id.0, e),
                }
            }
            Ok(resp) => {
                debug!("pool {} long-poll http {}", pool.id.0, resp.status());
                std::thread::sleep(core.opts.fail_pause);
            }
            Err(e) if e.is_timeout() => {
                // The held-open request simply expired; re-arm it.
                continue;
            }
            Err(e) => {
                debug!("pool {} long-poll: {}", pool.id.0, e);
                std::thread::sleep(core.opts.fail_pause);
            }
        }
    }
    debug!("pool {} long-poll thread exiting", pool.id.0);
}

//! Job construction: pool templates in, chip-ready jobs out.
//!
//! A `mining.notify` template expands into many [`Job`]s, one per
//! extranonce2 value. Each job carries everything needed to rebuild the
//! 80-byte block header later, when a nonce comes back and its achieved
//! difficulty has to be recomputed host-side.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::pow::Target;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("malformed mining.notify: {0}")]
    Malformed(&'static str),

    #[error("bad hex in mining.notify: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// A `mining.notify` work template as received from the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningNotify {
    pub job_id: String,
    /// Previous block hash in Stratum wire order (4-byte words reversed
    /// relative to header order).
    pub prev_block_hash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
}

impl MiningNotify {
    /// Parse the nine positional params of a `mining.notify`.
    pub fn from_stratum_params(params: &[Value]) -> Result<Self, NotifyError> {
        if params.len() < 9 {
            return Err(NotifyError::Malformed("fewer than 9 params"));
        }

        let job_id = params[0]
            .as_str()
            .ok_or(NotifyError::Malformed("job_id not a string"))?
            .to_string();

        let prev_block_hash = hex32(
            params[1]
                .as_str()
                .ok_or(NotifyError::Malformed("prev_hash not a string"))?,
        )?;

        let coinbase1 = hex::decode(
            params[2]
                .as_str()
                .ok_or(NotifyError::Malformed("coinbase1 not a string"))?,
        )?;
        let coinbase2 = hex::decode(
            params[3]
                .as_str()
                .ok_or(NotifyError::Malformed("coinbase2 not a string"))?,
        )?;

        let branches_json = params[4]
            .as_array()
            .ok_or(NotifyError::Malformed("merkle_branches not an array"))?;
        let mut merkle_branches = Vec::with_capacity(branches_json.len());
        for branch in branches_json {
            let s = branch
                .as_str()
                .ok_or(NotifyError::Malformed("merkle branch not a string"))?;
            merkle_branches.push(hex32(s)?);
        }

        let version = hex_u32(&params[5], "version")?;
        let nbits = hex_u32(&params[6], "nbits")?;
        let ntime = hex_u32(&params[7], "ntime")?;
        let clean_jobs = params[8]
            .as_bool()
            .ok_or(NotifyError::Malformed("clean_jobs not a bool"))?;

        Ok(Self {
            job_id,
            prev_block_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }
}

fn hex32(s: &str) -> Result<[u8; 32], NotifyError> {
    let bytes = hex::decode(s)?;
    bytes
        .try_into()
        .map_err(|_| NotifyError::Malformed("hash field not 32 bytes"))
}

fn hex_u32(v: &Value, field: &'static str) -> Result<u32, NotifyError> {
    let s = v.as_str().ok_or(NotifyError::Malformed(field))?;
    u32::from_str_radix(s, 16).map_err(|_| NotifyError::Malformed(field))
}

/// One unit of chip work, expanded from a template with a concrete
/// extranonce2. Everything here is owned so the job can outlive its
/// template across the dispatch and result pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub pool_job_id: String,
    pub extranonce2: String,
    pub version: u32,
    pub version_mask: u32,
    /// Header byte order.
    pub prev_block_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub ntime: u32,
    pub nbits: u32,
    pub starting_nonce: u32,
    pub pool_diff: u64,
    /// Template generation this job was built under; stale generations are
    /// dropped before they reach the chain.
    pub generation: u64,
}

/// Format an extranonce2 counter the way pools expect it: little-endian
/// hex of the counter, right-padded with zeros to `2 * len` characters
/// (truncated when the pool's extranonce2 is shorter than 4 bytes).
pub fn extranonce2_generate(counter: u32, len: usize) -> String {
    let bytes = counter.to_le_bytes();
    let used = len.min(bytes.len());
    let mut s = hex::encode(&bytes[..used]);
    while s.len() < 2 * len {
        s.push('0');
    }
    s
}

/// Double-sha256 merkle fold: coinbase txid combined with each branch in
/// order. Branches and result are in natural (header) byte order.
pub fn merkle_root(coinbase: &[u8], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut root = sha256d::Hash::hash(coinbase).to_byte_array();
    for branch in branches {
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&root);
        concat[32..].copy_from_slice(branch);
        root = sha256d::Hash::hash(&concat).to_byte_array();
    }
    root
}

/// Reverse each 4-byte word of a hash, converting between Stratum wire
/// order and header order.
fn swap_endian_words(hash: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (dst, src) in out.chunks_exact_mut(4).zip(hash.chunks_exact(4)) {
        dst.copy_from_slice(src);
        dst.reverse();
    }
    out
}

/// Expand a template into one concrete job.
///
/// The coinbase is `coinbase1 ‖ extranonce1 ‖ extranonce2 ‖ coinbase2`;
/// its txid folded with the merkle branches yields the header merkle root.
pub fn assemble_job(
    notify: &MiningNotify,
    extranonce1: &[u8],
    extranonce2: String,
    version_mask: u32,
    pool_diff: u64,
    generation: u64,
) -> Job {
    let mut coinbase = Vec::with_capacity(
        notify.coinbase1.len() + extranonce1.len() + extranonce2.len() / 2 + notify.coinbase2.len(),
    );
    coinbase.extend_from_slice(&notify.coinbase1);
    coinbase.extend_from_slice(extranonce1);
    // extranonce2 is generated here, always valid hex
    coinbase.extend_from_slice(&hex::decode(&extranonce2).unwrap_or_default());
    coinbase.extend_from_slice(&notify.coinbase2);

    Job {
        pool_job_id: notify.job_id.clone(),
        extranonce2,
        version: notify.version,
        version_mask,
        prev_block_hash: swap_endian_words(&notify.prev_block_hash),
        merkle_root: merkle_root(&coinbase, &notify.merkle_branches),
        ntime: notify.ntime,
        nbits: notify.nbits,
        starting_nonce: 0,
        pool_diff,
        generation,
    }
}

/// Expand the 16 rolled bits a chip reports into a full header version,
/// honoring the job's version mask.
pub fn roll_version(job_version: u32, version_mask: u32, version_bits: u16) -> u32 {
    (job_version & !version_mask) | (((version_bits as u32) << 16) & version_mask)
}

/// Serialize the 80-byte block header for a candidate nonce.
pub fn serialize_header(job: &Job, nonce: u32, version: u32) -> [u8; 80] {
    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&version.to_le_bytes());
    header[4..36].copy_from_slice(&job.prev_block_hash);
    header[36..68].copy_from_slice(&job.merkle_root);
    header[68..72].copy_from_slice(&job.ntime.to_le_bytes());
    header[72..76].copy_from_slice(&job.nbits.to_le_bytes());
    header[76..80].copy_from_slice(&nonce.to_le_bytes());
    header
}

/// Achieved difficulty of a candidate nonce: the difficulty-1 target
/// divided by the header hash, both as 256-bit values.
pub fn nonce_difficulty(job: &Job, nonce: u32, version: u32) -> f64 {
    let header = serialize_header(job, nonce, version);
    let hash = sha256d::Hash::hash(&header);
    Target::from_le_bytes(hash.to_byte_array()).difficulty_float()
}

//! Incremental hashing of JSON-serialized view headers while rendering.
//!
//! The renderer rehashes the header on every nonce bump. Re-serializing the
//! whole header each attempt would allocate, so the canonical JSON buffer is
//! built once and then patched in place: the hash list root is overwritten at
//! a fixed offset, while the variable-width decimal fields (`time`, `nonce`,
//! `consideration_count`) are rewritten at recorded offsets with the tail
//! shifted when their width changes. The SHA3 state is reset per attempt.

use sha3::{Digest, Sha3_256};

use crate::consideration::ConsiderationID;
use crate::view::{ViewHeader, ViewID};

const HDR_PREVIOUS: &[u8] = br#"{"previous":""#;
const HDR_HASH_LIST_ROOT: &[u8] = br#"","hash_list_root":""#;
const HDR_TIME: &[u8] = br#"","time":"#;
const HDR_TARGET: &[u8] = br#","target":""#;
const HDR_POINT_WORK: &[u8] = br#"","point_work":""#;
const HDR_NONCE: &[u8] = br#"","nonce":"#;
const HDR_HEIGHT: &[u8] = br#","height":"#;
const HDR_CONSIDERATION_COUNT: &[u8] = br#","consideration_count":"#;
const HDR_END: &[u8] = b"}";

/// Patches and rehashes a canonical header JSON buffer without allocating
/// per attempt.
pub struct ViewHeaderHasher {
    // these can change per attempt
    previous_hash_list_root: ConsiderationID,
    previous_time: i64,
    previous_nonce: i64,
    previous_consideration_count: i32,

    // offsets of the mutable fields in the buffer
    hash_list_root_offset: usize,
    time_offset: usize,
    nonce_offset: usize,
    consideration_count_offset: usize,

    // current widths of the variable-length decimal fields
    time_len: usize,
    nonce_len: usize,
    cn_count_len: usize,

    initialized: bool,
    buf_len: usize,
    buffer: Vec<u8>,
    hasher: Sha3_256,
    hashes_per_attempt: i64,
}

impl ViewHeaderHasher {
    pub fn new() -> Self {
        // maximum buffer length: all fragments, four 64-char hex fields,
        // three int64 decimals and one int32 decimal
        let buf_len = HDR_PREVIOUS.len()
            + HDR_HASH_LIST_ROOT.len()
            + HDR_TIME.len()
            + HDR_TARGET.len()
            + HDR_POINT_WORK.len()
            + HDR_NONCE.len()
            + HDR_HEIGHT.len()
            + HDR_CONSIDERATION_COUNT.len()
            + HDR_END.len()
            + 4 * 64
            + 3 * 19
            + 10;

        ViewHeaderHasher {
            previous_hash_list_root: ConsiderationID::default(),
            previous_time: 0,
            previous_nonce: 0,
            previous_consideration_count: 0,
            hash_list_root_offset: 0,
            time_offset: 0,
            nonce_offset: 0,
            consideration_count_offset: 0,
            time_len: 0,
            nonce_len: 0,
            cn_count_len: 0,
            initialized: false,
            buf_len: 0,
            buffer: vec![0u8; buf_len],
            hasher: Sha3_256::new(),
            hashes_per_attempt: 1,
        }
    }

    /// Discards the current buffer. Call when starting on a new candidate view.
    pub fn reset(&mut self) {
        self.initialized = false;
    }

    /// Serialize the header into the buffer from scratch, recording the
    /// offsets and widths of every mutable field.
    fn init_buffer(&mut self, header: &ViewHeader) {
        let mut n = 0;

        // previous
        n += copy_at(&mut self.buffer, n, HDR_PREVIOUS);
        n += hex_at(&mut self.buffer, n, &header.previous.0);

        // hash_list_root
        self.previous_hash_list_root = header.hash_list_root;
        n += copy_at(&mut self.buffer, n, HDR_HASH_LIST_ROOT);
        self.hash_list_root_offset = n;
        n += hex_at(&mut self.buffer, n, &header.hash_list_root.0);

        // time
        self.previous_time = header.time;
        n += copy_at(&mut self.buffer, n, HDR_TIME);
        self.time_offset = n;
        self.time_len = dec_at(&mut self.buffer, n, header.time);
        n += self.time_len;

        // target
        n += copy_at(&mut self.buffer, n, HDR_TARGET);
        n += hex_at(&mut self.buffer, n, &header.target.0);

        // point_work
        n += copy_at(&mut self.buffer, n, HDR_POINT_WORK);
        n += hex_at(&mut self.buffer, n, &header.point_work.0);

        // nonce
        self.previous_nonce = header.nonce;
        n += copy_at(&mut self.buffer, n, HDR_NONCE);
        self.nonce_offset = n;
        self.nonce_len = dec_at(&mut self.buffer, n, header.nonce);
        n += self.nonce_len;

        // height
        n += copy_at(&mut self.buffer, n, HDR_HEIGHT);
        n += dec_at(&mut self.buffer, n, header.height);

        // consideration_count
        self.previous_consideration_count = header.consideration_count;
        n += copy_at(&mut self.buffer, n, HDR_CONSIDERATION_COUNT);
        self.consideration_count_offset = n;
        self.cn_count_len = dec_at(&mut self.buffer, n, header.consideration_count as i64);
        n += self.cn_count_len;

        n += copy_at(&mut self.buffer, n, HDR_END);
        self.buf_len = n;

        self.initialized = true;
    }

    /// Called every time the header is updated and the caller wants its new ID.
    /// Returns the ID and the number of hashing attempts performed.
    pub fn update(&mut self, header: &ViewHeader) -> (ViewID, i64) {
        if !self.initialized {
            self.init_buffer(header);
        } else {
            // hash_list_root: fixed width, patch in place
            if self.previous_hash_list_root != header.hash_list_root {
                self.previous_hash_list_root = header.hash_list_root;
                hex_at(
                    &mut self.buffer,
                    self.hash_list_root_offset,
                    &header.hash_list_root.0,
                );
            }

            let mut offset: isize = 0;

            // time
            if self.previous_time != header.time {
                self.previous_time = header.time;

                let mut n = self.time_offset;
                let time_len = dec_at(&mut self.buffer, n, header.time);
                n += time_len;

                // did time shrink or grow in width?
                offset = time_len as isize - self.time_len as isize;
                self.time_len = time_len;

                if offset != 0 {
                    // shift everything below up or down
                    n += copy_at(&mut self.buffer, n, HDR_TARGET);
                    n += hex_at(&mut self.buffer, n, &header.target.0);
                    n += copy_at(&mut self.buffer, n, HDR_POINT_WORK);
                    n += hex_at(&mut self.buffer, n, &header.point_work.0);
                    copy_at(&mut self.buffer, n, HDR_NONCE);
                }
            }

            // nonce
            if offset != 0 || self.previous_nonce != header.nonce {
                self.previous_nonce = header.nonce;

                // write out the new value (or the old value at a new location)
                self.nonce_offset = (self.nonce_offset as isize + offset) as usize;
                let mut n = self.nonce_offset;
                let nonce_len = dec_at(&mut self.buffer, n, header.nonce);
                n += nonce_len;

                offset += nonce_len as isize - self.nonce_len as isize;
                self.nonce_len = nonce_len;

                if offset != 0 {
                    n += copy_at(&mut self.buffer, n, HDR_HEIGHT);
                    n += dec_at(&mut self.buffer, n, header.height);
                    copy_at(&mut self.buffer, n, HDR_CONSIDERATION_COUNT);
                }
            }

            // consideration_count
            if offset != 0 || self.previous_consideration_count != header.consideration_count {
                self.previous_consideration_count = header.consideration_count;

                self.consideration_count_offset =
                    (self.consideration_count_offset as isize + offset) as usize;
                let mut n = self.consideration_count_offset;
                let cn_count_len = dec_at(&mut self.buffer, n, header.consideration_count as i64);
                n += cn_count_len;

                offset += cn_count_len as isize - self.cn_count_len as isize;
                self.cn_count_len = cn_count_len;

                if offset != 0 {
                    copy_at(&mut self.buffer, n, HDR_END);
                }
            }

            // often a bunch of encoding happens with no net impact to the length
            self.buf_len = (self.buf_len as isize + offset) as usize;
        }

        // hash it
        self.hasher.update(&self.buffer[..self.buf_len]);
        let digest = self.hasher.finalize_reset();
        let mut id = ViewID::default();
        id.0.copy_from_slice(&digest);
        (id, self.hashes_per_attempt)
    }
}

impl Default for ViewHeaderHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_at(buf: &mut [u8], at: usize, src: &[u8]) -> usize {
    buf[at..at + src.len()].copy_from_slice(src);
    src.len()
}

fn hex_at(buf: &mut [u8], at: usize, src: &[u8; 32]) -> usize {
    hex::encode_to_slice(src, &mut buf[at..at + 64]).expect("hex output length");
    64
}

/// Writes a non-negative decimal without allocating. Returns the width.
fn dec_at(buf: &mut [u8], at: usize, v: i64) -> usize {
    debug_assert!(v >= 0);
    if v == 0 {
        buf[at] = b'0';
        return 1;
    }
    let mut tmp = [0u8; 20];
    let mut i = tmp.len();
    let mut v = v;
    while v > 0 {
        i -= 1;
        tmp[i] = b'0' + (v % 10) as u8;
        v /= 10;
    }
    let n = tmp.len() - i;
    buf[at..at + n].copy_from_slice(&tmp[i..]);
    n
}

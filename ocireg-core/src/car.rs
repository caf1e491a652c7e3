//! Wraps raw bytes as a single-block CARv1 (Content Addressable aRchive)
//! payload with a CIDv1 raw-codec / sha2-256 root, the wire format the
//! backend's `prepareBytes` step expects.
//!
//! There is no registry crate in this stack for CIDs or CAR files, so the
//! handful of bytes that make up a one-block archive are assembled by hand:
//! an unsigned varint length prefix, a DAG-CBOR header naming the root CID,
//! and a single `<cid><data>` block. `pack` is pure and synchronous; nothing
//! about it can fail short of a logic error, so it returns its result directly
//! rather than a `Result`.

use bytes::Bytes;
use sha2::{Digest as _, Sha256};

const MULTICODEC_RAW: u64 = 0x55;
const MULTICODEC_SHA2_256: u64 = 0x12;
const CID_VERSION_1: u64 = 0x01;

/// Packs `data` into a CARv1 payload and returns it alongside the root CID's
/// string form (multibase `b` + lowercase base32), the opaque identifier the
/// backend tracks pinned content under.
pub fn pack(data: &[u8]) -> (Bytes, String) {
    let digest = Sha256::digest(data);
    let cid = cid_v1_raw_sha256(&digest);
    let content_id = format!("b{}", base32_lower_nopad(&cid));

    let header = car_header(&cid);

    let mut payload = Vec::with_capacity(header.len() + cid.len() + data.len() + 16);
    push_uvarint(&mut payload, header.len() as u64);
    payload.extend_from_slice(&header);

    let block_len = cid.len() + data.len();
    push_uvarint(&mut payload, block_len as u64);
    payload.extend_from_slice(&cid);
    payload.extend_from_slice(data);

    (Bytes::from(payload), content_id)
}

fn cid_v1_raw_sha256(digest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + digest.len());
    push_uvarint(&mut out, CID_VERSION_1);
    push_uvarint(&mut out, MULTICODEC_RAW);
    push_uvarint(&mut out, MULTICODEC_SHA2_256);
    push_uvarint(&mut out, digest.len() as u64);
    out.extend_from_slice(digest);
    out
}

// CARv1 header is DAG-CBOR for {"version":1,"roots":[<cid>]}
fn car_header(cid: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(0xa2); // map(2)
    push_text(&mut out, "version");
    out.push(0x01); // uint(1)
    push_text(&mut out, "roots");
    out.push(0x81); // array(1)
    out.push(0xd8);
    out.push(0x2a); // tag(42): CID
    push_cid_bytestring(&mut out, cid);
    out
}

fn push_text(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() < 24, "header keys are short fixed strings");
    out.push(0x60 | s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

// DAG-CBOR represents a CID as a byte string whose first byte is the
// identity-multibase marker (0x00), followed by the raw binary CID.
fn push_cid_bytestring(out: &mut Vec<u8>, cid: &[u8]) {
    let len = cid.len() + 1;
    if len < 24 {
        out.push(0x40 | len as u8);
    } else if len < 256 {
        out.push(0x58);
        out.push(len as u8);
    } else {
        out.push(0x59);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    out.push(0x00);
    out.extend_from_slice(cid);
}

fn push_uvarint(out: &mut Vec<u8>, mut n: u64) {
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if n == 0 {
            break;
        }
    }
}

fn base32_lower_nopad(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits_left = 0u32;
    for &b in data {
        buffer = (buffer << 8) | b as u32;
        bits_left += 8;
        while bits_left >= 5 {
            bits_left -= 5;
            let idx = (buffer >> bits_left) & 0x1f;
            out.push(ALPHABET[idx as usize] as char);
        }
    }
    if bits_left > 0 {
        let idx = (buffer << (5 - bits_left)) & 0x1f;
        out.push(ALPHABET[idx as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_is_deterministic_and_prefixed() {
        let (payload_a, cid_a) = pack(b"hello world");
        let (payload_b, cid_b) = pack(b"hello world");
        assert_eq!(payload_a, payload_b);
        assert_eq!(cid_a, cid_b);
        assert!(cid_a.starts_with('b'));
    }

    #[test]
    fn different_bytes_yield_different_cids() {
        let (_, a) = pack(b"hello");
        let (_, b) = pack(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn payload_contains_data_verbatim() {
        let data = b"some layer bytes";
        let (payload, _) = pack(data);
        let payload = payload.to_vec();
        assert!(
            payload.windows(data.len()).any(|w| w == data),
            "packed payload should contain the raw data"
        );
    }
}

//! Request frame builders for tests that play the kernel side of a channel.

use std::os::unix::ffi::OsStrExt;

use bytes::BufMut;

use super::{
    Opcode, Operation, FUSE_GETATTR_FH, IN_HEADER_LEN, KERNEL_MINOR_VERSION, KERNEL_VERSION,
};

/// Encode a request frame the way the kernel would send it.
pub fn encode_request(unique: u64, nodeid: u64, operation: &Operation) -> Vec<u8> {
    let mut body = Vec::new();
    let opcode = match operation {
        Operation::Init {
            major,
            minor,
            max_readahead,
            flags,
        } => {
            body.put_u32_le(*major);
            body.put_u32_le(*minor);
            body.put_u32_le(*max_readahead);
            body.put_u32_le(*flags);
            Opcode::Init
        }
        Operation::Destroy => Opcode::Destroy,
        Operation::Lookup { name } => {
            body.extend_from_slice(name.as_bytes());
            body.put_u8(0);
            Opcode::Lookup
        }
        Operation::Forget { nlookup } => {
            body.put_u64_le(*nlookup);
            Opcode::Forget
        }
        Operation::BatchForget { nodes } => {
            body.put_u32_le(nodes.len() as u32);
            body.put_u32_le(0);
            for node in nodes {
                body.put_u64_le(node.nodeid);
                body.put_u64_le(node.nlookup);
            }
            Opcode::BatchForget
        }
        Operation::GetAttr { fh } => {
            body.put_u32_le(if fh.is_some() { FUSE_GETATTR_FH } else { 0 });
            body.put_u32_le(0);
            body.put_u64_le(fh.unwrap_or(0));
            Opcode::GetAttr
        }
        Operation::StatFs => Opcode::StatFs,
        Operation::Open { flags } | Operation::OpenDir { flags } => {
            body.put_u32_le(*flags);
            body.put_u32_le(0);
            if matches!(operation, Operation::Open { .. }) {
                Opcode::Open
            } else {
                Opcode::OpenDir
            }
        }
        Operation::Read {
            fh,
            offset,
            size,
            flags,
        } => {
            put_read_in(&mut body, *fh, *offset, *size, *flags);
            Opcode::Read
        }
        Operation::ReadDir { fh, offset, size } => {
            put_read_in(&mut body, *fh, *offset, *size, 0);
            Opcode::ReadDir
        }
        Operation::Release {
            fh,
            flags,
            release_flags,
            lock_owner,
        } => {
            body.put_u64_le(*fh);
            body.put_u32_le(*flags);
            body.put_u32_le(*release_flags);
            body.put_u64_le(*lock_owner);
            Opcode::Release
        }
        Operation::ReleaseDir { fh, flags } => {
            body.put_u64_le(*fh);
            body.put_u32_le(*flags);
            body.put_u32_le(0);
            body.put_u64_le(0);
            Opcode::ReleaseDir
        }
        Operation::Interrupt { unique } => {
            body.put_u64_le(*unique);
            Opcode::Interrupt
        }
        Operation::Unsupported(opcode) => *opcode,
    };
    encode_raw(opcode as u32, unique, nodeid, &body)
}

/// Encode a frame with an arbitrary opcode number and body.
pub fn encode_raw(opcode: u32, unique: u64, nodeid: u64, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(IN_HEADER_LEN + body.len());
    out.put_u32_le((IN_HEADER_LEN + body.len()) as u32);
    out.put_u32_le(opcode);
    out.put_u64_le(unique);
    out.put_u64_le(nodeid);
    out.put_u32_le(0);
    out.put_u32_le(0);
    out.put_u32_le(1);
    out.put_u32_le(0);
    out.extend_from_slice(body);
    out
}

/// The init request a current kernel sends
pub fn init_request(unique: u64) -> Vec<u8> {
    encode_request(
        unique,
        0,
        &Operation::Init {
            major: KERNEL_VERSION,
            minor: KERNEL_MINOR_VERSION,
            max_readahead: 128 * 1024,
            flags: 0,
        },
    )
}

fn put_read_in(body: &mut Vec<u8>, fh: u64, offset: u64, size: u32, flags: u32) {
    body.put_u64_le(fh);
    body.put_u64_le(offset);
    body.put_u32_le(size);
    body.put_u32_le(0);
    body.put_u64_le(0);
    body.put_u32_le(flags);
    body.put_u32_le(0);
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;
    use crate::protocol::Request;

    #[test]
    fn test_encoded_requests_decode() {
        let lookup = Operation::Lookup {
            name: OsString::from("f"),
        };
        let request = Request::decode(&encode_request(3, 1, &lookup)).unwrap();
        assert_eq!(request.operation, lookup);

        let release = Operation::ReleaseDir { fh: 4, flags: 0 };
        let request = Request::decode(&encode_request(5, 2, &release)).unwrap();
        assert_eq!(request.operation, release);
        assert_eq!(request.nodeid(), 2);
    }
}

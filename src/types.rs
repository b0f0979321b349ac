use anyhow::{bail, Result};

pub const HASH_SIZE: usize = 32;

pub type Hash = [u8; HASH_SIZE];

/// First block version that carries a parent block for merge mining.
pub const BLOCK_MAJOR_VERSION_2: u8 = 2;

pub const TX_EXTRA_MERGE_MINING_TAG: u8 = 0x03;

const MAX_TX_EXTRA_SIZE: usize = 1024;
const MAX_TX_HASH_COUNT: u64 = 0x4000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseTransaction {
    pub version: u64,
    pub unlock_time: u64,
    pub extra: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentBlock {
    pub major_version: u8,
    pub minor_version: u8,
    pub previous_hash: Hash,
    pub transaction_count: u64,
    pub base_transaction: BaseTransaction,
}

/// A block header under construction. Serialized only when major_version >= 2
/// does the parent block appear on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTemplate {
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: u64,
    pub previous_hash: Hash,
    pub nonce: u32,
    pub parent_block: ParentBlock,
    pub miner_tx_hash: Hash,
    pub tx_hashes: Vec<Hash>,
}

#[derive(Debug, Clone)]
pub struct MiningParameters {
    pub block_template: BlockTemplate,
    pub difficulty: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeMiningTag {
    pub depth: u64,
    pub merkle_root: Hash,
}

impl BlockTemplate {
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        let mut reader = BlobReader::new(blob);

        let major_version = read_version(&mut reader)?;
        let minor_version = read_version(&mut reader)?;
        let timestamp = reader.varint()?;
        let previous_hash = reader.hash()?;
        let nonce = reader.u32_le()?;

        let parent_block = if major_version >= BLOCK_MAJOR_VERSION_2 {
            let parent_major = read_version(&mut reader)?;
            let parent_minor = read_version(&mut reader)?;
            let parent_previous = reader.hash()?;
            let transaction_count = reader.varint()?;
            let tx_version = reader.varint()?;
            let unlock_time = reader.varint()?;
            let extra_len = reader.varint()?;
            if extra_len > MAX_TX_EXTRA_SIZE as u64 {
                bail!("base transaction extra of {extra_len} bytes exceeds {MAX_TX_EXTRA_SIZE}");
            }
            let extra = reader.take(extra_len as usize)?.to_vec();

            ParentBlock {
                major_version: parent_major,
                minor_version: parent_minor,
                previous_hash: parent_previous,
                transaction_count,
                base_transaction: BaseTransaction {
                    version: tx_version,
                    unlock_time,
                    extra,
                },
            }
        } else {
            ParentBlock::default()
        };

        let miner_tx_hash = reader.hash()?;
        let tx_count = reader.varint()?;
        if tx_count > MAX_TX_HASH_COUNT {
            bail!("block template lists {tx_count} transaction hashes");
        }
        let mut tx_hashes = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            tx_hashes.push(reader.hash()?);
        }

        reader.finish()?;

        Ok(Self {
            major_version,
            minor_version,
            timestamp,
            previous_hash,
            nonce,
            parent_block,
            miner_tx_hash,
            tx_hashes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.tx_hashes.len() * HASH_SIZE);

        write_varint(&mut out, u64::from(self.major_version));
        write_varint(&mut out, u64::from(self.minor_version));
        write_varint(&mut out, self.timestamp);
        out.extend_from_slice(&self.previous_hash);
        out.extend_from_slice(&self.nonce.to_le_bytes());

        if self.major_version >= BLOCK_MAJOR_VERSION_2 {
            let parent = &self.parent_block;
            write_varint(&mut out, u64::from(parent.major_version));
            write_varint(&mut out, u64::from(parent.minor_version));
            out.extend_from_slice(&parent.previous_hash);
            write_varint(&mut out, parent.transaction_count);
            write_varint(&mut out, parent.base_transaction.version);
            write_varint(&mut out, parent.base_transaction.unlock_time);
            write_varint(&mut out, parent.base_transaction.extra.len() as u64);
            out.extend_from_slice(&parent.base_transaction.extra);
        }

        out.extend_from_slice(&self.miner_tx_hash);
        write_varint(&mut out, self.tx_hashes.len() as u64);
        for hash in &self.tx_hashes {
            out.extend_from_slice(hash);
        }

        out
    }

    /// Merkle root over the miner transaction and the included transactions.
    pub fn merkle_root(&self) -> Hash {
        let mut leaves = Vec::with_capacity(1 + self.tx_hashes.len());
        leaves.push(self.miner_tx_hash);
        leaves.extend_from_slice(&self.tx_hashes);
        crate::pow::tree_hash(&leaves)
    }
}

pub fn append_merge_mining_tag(extra: &mut Vec<u8>, tag: &MergeMiningTag) -> Result<()> {
    let mut payload = Vec::with_capacity(HASH_SIZE + 10);
    write_varint(&mut payload, tag.depth);
    payload.extend_from_slice(&tag.merkle_root);

    // tag byte + payload length varint (at most 2 bytes for the sizes allowed
    // here) + payload must still fit the extra field.
    if extra.len() + 3 + payload.len() > MAX_TX_EXTRA_SIZE {
        bail!("transaction extra would exceed {MAX_TX_EXTRA_SIZE} bytes");
    }

    extra.push(TX_EXTRA_MERGE_MINING_TAG);
    write_varint(extra, payload.len() as u64);
    extra.extend_from_slice(&payload);
    Ok(())
}

fn read_version(reader: &mut BlobReader) -> Result<u8> {
    let value = reader.varint()?;
    if value > u64::from(u8::MAX) {
        bail!("block version {value} out of range");
    }
    Ok(value as u8)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

struct BlobReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            bail!("block blob truncated at offset {}", self.pos);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.take(1)?[0];
            let chunk = u64::from(byte & 0x7f);
            if shift >= 64 || (chunk << shift) >> shift != chunk {
                bail!("varint in block blob overflows 64 bits");
            }
            value |= chunk << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn u32_le(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn hash(&mut self) -> Result<Hash> {
        let bytes = self.take(HASH_SIZE)?;
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(bytes);
        Ok(hash)
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            bail!("trailing bytes after block template");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_varint(value: u64) -> u64 {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        let mut reader = BlobReader::new(&buf);
        let decoded = reader.varint().expect("varint should decode");
        reader.finish().expect("varint should consume the buffer");
        decoded
    }

    #[test]
    fn varint_roundtrips() {
        for value in [0, 1, 0x7f, 0x80, 300, 0xffff, u64::MAX] {
            assert_eq!(roundtrip_varint(value), value);
        }
    }

    #[test]
    fn varint_rejects_overflow() {
        let buf = [0xffu8; 11];
        let mut reader = BlobReader::new(&buf);
        assert!(reader.varint().is_err());
    }

    fn sample_v2_template() -> BlockTemplate {
        BlockTemplate {
            major_version: 2,
            minor_version: 0,
            timestamp: 1_654_000_123,
            previous_hash: [0x11; HASH_SIZE],
            nonce: 0xdead_beef,
            parent_block: ParentBlock {
                major_version: 1,
                minor_version: 0,
                previous_hash: [0x22; HASH_SIZE],
                transaction_count: 3,
                base_transaction: BaseTransaction {
                    version: 1,
                    unlock_time: 60,
                    extra: vec![0x01, 0x02, 0x03],
                },
            },
            miner_tx_hash: [0x33; HASH_SIZE],
            tx_hashes: vec![[0x44; HASH_SIZE], [0x55; HASH_SIZE]],
        }
    }

    #[test]
    fn template_roundtrips_without_parent() {
        let template = BlockTemplate {
            major_version: 1,
            timestamp: 42,
            previous_hash: [0xab; HASH_SIZE],
            nonce: 7,
            ..BlockTemplate::default()
        };

        let decoded = BlockTemplate::from_bytes(&template.to_bytes()).expect("blob should decode");
        assert_eq!(decoded, template);
    }

    #[test]
    fn template_roundtrips_with_parent() {
        let template = sample_v2_template();
        let decoded = BlockTemplate::from_bytes(&template.to_bytes()).expect("blob should decode");
        assert_eq!(decoded, template);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = sample_v2_template().to_bytes();
        assert!(BlockTemplate::from_bytes(&blob[..blob.len() - 1]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut blob = sample_v2_template().to_bytes();
        blob.push(0);
        assert!(BlockTemplate::from_bytes(&blob).is_err());
    }

    #[test]
    fn merge_mining_tag_layout() {
        let mut extra = Vec::new();
        let tag = MergeMiningTag {
            depth: 0,
            merkle_root: [0x77; HASH_SIZE],
        };
        append_merge_mining_tag(&mut extra, &tag).expect("tag should append");

        assert_eq!(extra[0], TX_EXTRA_MERGE_MINING_TAG);
        assert_eq!(extra[1], 33); // depth varint + 32-byte root
        assert_eq!(extra[2], 0);
        assert_eq!(&extra[3..], &[0x77; HASH_SIZE]);
    }

    #[test]
    fn merge_mining_tag_respects_extra_cap() {
        let mut extra = vec![0u8; MAX_TX_EXTRA_SIZE - 10];
        let tag = MergeMiningTag {
            depth: 0,
            merkle_root: [0; HASH_SIZE],
        };
        assert!(append_merge_mining_tag(&mut extra, &tag).is_err());
    }
}

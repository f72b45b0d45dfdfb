use crate::{
    error::{Error, Result},
    flags::TrxFlags,
    key::{Key, KeyAccess, KeyPart},
    seqno::{SEQNO_UNDEFINED, Seqno, SourceId},
};
use byteorder::{ByteOrder, LittleEndian};

/// Current wire version. Bumped when the header or key layout changes;
/// decode rejects anything newer.
const WS_VERSION: u8 = 1;

/// Fixed header length: version, pad, flags, source, conn id, trx id,
/// last seen, key count.
const HEADER_LEN: usize = 1 + 1 + 4 + 16 + 8 + 8 + 8 + 4;

/// Decoded write set as delivered by the transport.
///
/// This is the replication-visible part of a transaction: the flag word,
/// originator identity, the key set certification runs against, and the
/// opaque payload the DBMS applies. Seqnos are not part of the encoding;
/// the transport assigns them at delivery.
#[derive(Debug, Clone)]
pub struct WriteSet {
    /// Write-set flag word.
    pub flags: TrxFlags,
    /// Originating node.
    pub source_id: SourceId,
    /// Originating client connection, for NBO matching and diagnostics.
    pub conn_id: u64,
    /// Originator-local transaction id, correlates delivery with the
    /// issuing client.
    pub trx_id: u64,
    /// Highest global seqno the originator had seen committed.
    pub last_seen_seqno: Seqno,
    /// Keys touched, in access order.
    pub keys: Vec<KeyPart>,
    /// Opaque row events for the apply callback.
    pub payload: Vec<u8>,
}

impl WriteSet {
    /// Encoded length, exact.
    pub fn encoded_len(&self) -> usize {
        let keys: usize = self
            .keys
            .iter()
            .map(|kp| 2 + kp.key.parts().iter().map(|p| 2 + p.len()).sum::<usize>())
            .sum();
        HEADER_LEN + keys + 4 + self.payload.len()
    }

    /// Serializes the write set for submission to the transport.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(WS_VERSION);
        buf.push(0); // pad
        put_u32(&mut buf, self.flags.bits());
        buf.extend_from_slice(self.source_id.as_bytes());
        put_u64(&mut buf, self.conn_id);
        put_u64(&mut buf, self.trx_id);
        put_u64(&mut buf, self.last_seen_seqno as u64);
        put_u32(&mut buf, self.keys.len() as u32);
        for kp in &self.keys {
            buf.push(kp.access as u8);
            buf.push(kp.key.parts().len() as u8);
            for part in kp.key.parts() {
                put_u16(&mut buf, part.len() as u16);
                buf.extend_from_slice(part);
            }
        }
        put_u32(&mut buf, self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes a write set received from the transport.
    ///
    /// Every length field is validated against the remaining input;
    /// foreign bytes produce [`Error::Corrupt`], never a panic.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader { data, pos: 0 };

        let version = r.u8()?;
        if version != WS_VERSION {
            return Err(Error::Corrupt("unsupported write set version"));
        }
        r.u8()?; // pad

        let flags = TrxFlags::from_bits(r.u32()?).ok_or(Error::Corrupt("unknown flag bits"))?;
        let mut source = [0u8; 16];
        source.copy_from_slice(r.bytes(16)?);
        let conn_id = r.u64()?;
        let trx_id = r.u64()?;
        let last_seen_seqno = r.u64()? as Seqno;
        if last_seen_seqno < SEQNO_UNDEFINED {
            return Err(Error::Corrupt("negative last seen seqno"));
        }

        let key_count = r.u32()? as usize;
        let mut keys = Vec::with_capacity(key_count.min(1024));
        for _ in 0..key_count {
            let access =
                KeyAccess::from_byte(r.u8()?).ok_or(Error::Corrupt("unknown key access type"))?;
            let part_count = r.u8()? as usize;
            let mut parts = Vec::with_capacity(part_count);
            for _ in 0..part_count {
                let len = r.u16()? as usize;
                parts.push(r.bytes(len)?.to_vec());
            }
            keys.push(KeyPart::new(Key::new(parts), access));
        }

        let payload_len = r.u32()? as usize;
        let payload = r.bytes(payload_len)?.to_vec();
        if r.pos != data.len() {
            return Err(Error::Corrupt("trailing bytes after payload"));
        }

        Ok(Self {
            flags,
            source_id: SourceId::from_bytes(source),
            conn_id,
            trx_id,
            last_seen_seqno,
            keys,
            payload,
        })
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    let mut tmp = [0u8; 2];
    LittleEndian::write_u16(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    LittleEndian::write_u32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_u64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

/// Bounds-checked cursor over the input slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(Error::Corrupt("truncated write set"));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.bytes(2)?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WriteSet {
        WriteSet {
            flags: TrxFlags::BEGIN | TrxFlags::COMMIT,
            source_id: SourceId::from_bytes([7; 16]),
            conn_id: 3,
            trx_id: 99,
            last_seen_seqno: 17,
            keys: vec![
                KeyPart::new(Key::new([b"db".to_vec(), b"t1".to_vec(), b"row".to_vec()]), KeyAccess::Exclusive),
                KeyPart::new(Key::new([b"db".to_vec(), b"t1".to_vec()]), KeyAccess::Shared),
            ],
            payload: b"row events".to_vec(),
        }
    }

    #[test]
    fn encode_decode() {
        let ws = sample();
        let bytes = ws.encode();
        assert_eq!(bytes.len(), ws.encoded_len());

        let back = WriteSet::decode(&bytes).unwrap();
        assert_eq!(back.flags, ws.flags);
        assert_eq!(back.source_id, ws.source_id);
        assert_eq!(back.trx_id, ws.trx_id);
        assert_eq!(back.last_seen_seqno, ws.last_seen_seqno);
        assert_eq!(back.keys.len(), 2);
        assert_eq!(back.keys[0].key.fingerprint(), ws.keys[0].key.fingerprint());
        assert_eq!(back.keys[0].access, KeyAccess::Exclusive);
        assert_eq!(back.payload, ws.payload);
    }

    #[test]
    fn decode_rejects_truncation_at_every_offset() {
        let bytes = sample().encode();
        for len in 0..bytes.len() {
            assert!(
                WriteSet::decode(&bytes[..len]).is_err(),
                "decode accepted a {len}-byte prefix"
            );
        }
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let mut bytes = sample().encode();
        bytes.push(0);
        assert!(matches!(WriteSet::decode(&bytes), Err(Error::Corrupt(_))));
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut bytes = sample().encode();
        bytes[0] = 200;
        assert!(WriteSet::decode(&bytes).is_err());
    }
}

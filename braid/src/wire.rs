//! Wire message set.
//!
//! Every message travels as one fixed-size descriptor-ring slot: an 8-byte
//! header followed by an op-specific payload. All multi-byte integers are
//! big-endian on the wire.

use crate::error::FabricError;
use crate::mem::Key;

/// Fixed descriptor-ring slot size.
pub const RING_SLOT_LEN: usize = 192;
/// Encoded header size.
pub const HDR_LEN: usize = 8;
/// Largest user payload carried inline in a SEND slot.
pub const MAX_INLINE_MSG: usize = 128;
/// Largest immediate payload for injected RMA and atomic results.
pub const INJECT_MAX: usize = 32;
/// `pe_entry_id` value meaning "no initiator entry to correlate".
pub const INVALID_PE_ID: u16 = u16::MAX;

/// One ring slot worth of bytes.
pub type SlotBuf = [u8; RING_SLOT_LEN];

// Header flags.
pub const MSG_INLINE: u8 = 0x01;
pub const MSG_TAGGED: u8 = 0x02;
pub const MSG_REMOTE_CQ_DATA: u8 = 0x04;
pub const MSG_TRANSMIT_COMPLETE: u8 = 0x08;
pub const MSG_DELIVERY_COMPLETE: u8 = 0x10;
pub const MSG_ANY_COMPLETE: u8 = MSG_TRANSMIT_COMPLETE | MSG_DELIVERY_COMPLETE;
/// Ring-slot validity toggle; alternates each ring revolution.
pub const MSG_VALID_TOGGLE: u8 = 0x80;

/// Wire opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Send = 1,
    Atomic = 2,
    Status = 3,
    WriteData = 4,
    KeyRequest = 5,
    KeyExport = 6,
    KeyResponse = 7,
    KeyRevoke = 8,
}

impl TryFrom<u8> for OpCode {
    type Error = FabricError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(OpCode::Send),
            2 => Ok(OpCode::Atomic),
            3 => Ok(OpCode::Status),
            4 => Ok(OpCode::WriteData),
            5 => Ok(OpCode::KeyRequest),
            6 => Ok(OpCode::KeyExport),
            7 => Ok(OpCode::KeyResponse),
            8 => Ok(OpCode::KeyRevoke),
            other => Err(FabricError::NotImplemented(other)),
        }
    }
}

/// Message header.
///
/// `inline_len` counts the payload bytes that follow the header (for inline
/// SEND that is exactly the user data length).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgHdr {
    pub op: u8,
    pub flags: u8,
    /// Target receive-context id.
    pub rx_id: u8,
    pub inline_len: u16,
    /// Initiator TX entry, echoed in replies for correlation.
    pub pe_entry_id: u16,
}

impl MsgHdr {
    pub fn new(op: OpCode, flags: u8, rx_id: u8, pe_entry_id: u16) -> Self {
        MsgHdr {
            op: op as u8,
            flags,
            rx_id,
            inline_len: 0,
            pe_entry_id,
        }
    }

    pub fn opcode(&self) -> Result<OpCode, FabricError> {
        OpCode::try_from(self.op)
    }

    pub fn encode_into(&self, slot: &mut SlotBuf) {
        slot[0] = self.op;
        slot[1] = self.flags;
        slot[2] = self.rx_id;
        slot[3] = 0;
        slot[4..6].copy_from_slice(&self.inline_len.to_be_bytes());
        slot[6..8].copy_from_slice(&self.pe_entry_id.to_be_bytes());
    }

    pub fn decode(slot: &SlotBuf) -> MsgHdr {
        MsgHdr {
            op: slot[0],
            flags: slot[1],
            rx_id: slot[2],
            inline_len: u16::from_be_bytes([slot[4], slot[5]]),
            pe_entry_id: u16::from_be_bytes([slot[6], slot[7]]),
        }
    }
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) -> usize {
    buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
    off + 8
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_key(buf: &mut [u8], off: usize, key: Key) -> usize {
    let off = put_u64(buf, off, key.id);
    buf[off] = key.internal as u8;
    off + 1
}

fn get_key(buf: &[u8], off: usize) -> (Key, usize) {
    let id = get_u64(buf, off);
    let internal = buf[off + 8] != 0;
    (Key { id, internal }, off + 9)
}

const KEY_WIRE_LEN: usize = 9;
/// Keys per KEY_REQUEST / KEY_REVOKE message.
pub const MAX_REQ_KEYS: usize = (RING_SLOT_LEN - HDR_LEN) / KEY_WIRE_LEN;

/// Out-of-line SEND payload: where the receiver fetches the data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectPay {
    pub vaddr: u64,
    pub len: u64,
    pub key: Key,
    pub tag: u64,
    pub cq_data: u64,
}

impl IndirectPay {
    pub fn encode_into(&self, slot: &mut SlotBuf) -> u16 {
        let buf = &mut slot[HDR_LEN..];
        let off = put_u64(buf, 0, self.vaddr);
        let off = put_u64(buf, off, self.len);
        let off = put_key(buf, off, self.key);
        let off = put_u64(buf, off, self.tag);
        let off = put_u64(buf, off, self.cq_data);
        off as u16
    }

    pub fn decode(slot: &SlotBuf) -> IndirectPay {
        let buf = &slot[HDR_LEN..];
        let vaddr = get_u64(buf, 0);
        let len = get_u64(buf, 8);
        let (key, off) = get_key(buf, 16);
        IndirectPay {
            vaddr,
            len,
            key,
            tag: get_u64(buf, off),
            cq_data: get_u64(buf, off + 8),
        }
    }
}

/// Remote-atomic request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicPay {
    pub op: AtomicOp,
    pub width: AtomicWidth,
    pub vaddr: u64,
    pub key: Key,
    pub operand: u64,
    pub compare: u64,
}

impl AtomicPay {
    pub fn encode_into(&self, slot: &mut SlotBuf) -> u16 {
        let buf = &mut slot[HDR_LEN..];
        buf[0] = self.op as u8;
        buf[1] = self.width.bytes() as u8;
        let off = put_u64(buf, 2, self.vaddr);
        let off = put_key(buf, off, self.key);
        let off = put_u64(buf, off, self.operand);
        let off = put_u64(buf, off, self.compare);
        off as u16
    }

    pub fn decode(slot: &SlotBuf) -> Result<AtomicPay, FabricError> {
        let buf = &slot[HDR_LEN..];
        let op = AtomicOp::try_from(buf[0])?;
        let width = AtomicWidth::from_bytes(buf[1])?;
        let vaddr = get_u64(buf, 2);
        let (key, off) = get_key(buf, 10);
        Ok(AtomicPay {
            op,
            width,
            vaddr,
            key,
            operand: get_u64(buf, off),
            compare: get_u64(buf, off + 8),
        })
    }
}

/// Atomic operations executed natively on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomicOp {
    Read = 0,
    Write = 1,
    Band = 2,
    Bor = 3,
    Bxor = 4,
    Cswap = 5,
    Sum = 6,
}

impl AtomicOp {
    /// Whether the operation produces a pre-image for the initiator.
    pub fn fetches(&self) -> bool {
        !matches!(self, AtomicOp::Write)
    }
}

impl TryFrom<u8> for AtomicOp {
    type Error = FabricError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(AtomicOp::Read),
            1 => Ok(AtomicOp::Write),
            2 => Ok(AtomicOp::Band),
            3 => Ok(AtomicOp::Bor),
            4 => Ok(AtomicOp::Bxor),
            5 => Ok(AtomicOp::Cswap),
            6 => Ok(AtomicOp::Sum),
            other => Err(FabricError::NotImplemented(other)),
        }
    }
}

/// Operand width of an atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicWidth {
    U8,
    U16,
    U32,
    U64,
}

impl AtomicWidth {
    pub fn bytes(&self) -> u64 {
        match self {
            AtomicWidth::U8 => 1,
            AtomicWidth::U16 => 2,
            AtomicWidth::U32 => 4,
            AtomicWidth::U64 => 8,
        }
    }

    pub fn from_bytes(b: u8) -> Result<AtomicWidth, FabricError> {
        match b {
            1 => Ok(AtomicWidth::U8),
            2 => Ok(AtomicWidth::U16),
            4 => Ok(AtomicWidth::U32),
            8 => Ok(AtomicWidth::U64),
            other => Err(FabricError::NotImplemented(other)),
        }
    }

    /// Truncate a raw value to this width.
    pub fn mask(&self, v: u64) -> u64 {
        match self {
            AtomicWidth::U8 => v as u8 as u64,
            AtomicWidth::U16 => v as u16 as u64,
            AtomicWidth::U32 => v as u32 as u64,
            AtomicWidth::U64 => v,
        }
    }
}

/// STATUS reply payload: terminal result of a target-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPay {
    pub status: i32,
    /// Undelivered bytes, or the atomic pre-image.
    pub rem: u64,
}

impl StatusPay {
    pub fn encode_into(&self, slot: &mut SlotBuf) -> u16 {
        let buf = &mut slot[HDR_LEN..];
        buf[0..4].copy_from_slice(&self.status.to_be_bytes());
        put_u64(buf, 4, self.rem) as u16
    }

    pub fn decode(slot: &SlotBuf) -> StatusPay {
        let buf = &slot[HDR_LEN..];
        StatusPay {
            status: i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            rem: get_u64(buf, 4),
        }
    }
}

/// WRITEDATA payload: remote-completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDataPay {
    pub flags: u64,
    pub cq_data: u64,
}

impl WriteDataPay {
    pub fn encode_into(&self, slot: &mut SlotBuf) -> u16 {
        let buf = &mut slot[HDR_LEN..];
        let off = put_u64(buf, 0, self.flags);
        put_u64(buf, off, self.cq_data) as u16
    }

    pub fn decode(slot: &SlotBuf) -> WriteDataPay {
        let buf = &slot[HDR_LEN..];
        WriteDataPay {
            flags: get_u64(buf, 0),
            cq_data: get_u64(buf, 8),
        }
    }
}

/// Encode a packed key list (KEY_REQUEST / KEY_REVOKE).
pub fn encode_key_list(slot: &mut SlotBuf, keys: &[Key]) -> u16 {
    debug_assert!(keys.len() <= MAX_REQ_KEYS);
    let mut off = 0;
    for key in keys {
        off = put_key(&mut slot[HDR_LEN..], off, *key);
    }
    off as u16
}

/// Decode a packed key list; the count comes from `inline_len`.
pub fn decode_key_list(slot: &SlotBuf, hdr: &MsgHdr) -> Vec<Key> {
    let count = hdr.inline_len as usize / KEY_WIRE_LEN;
    let mut keys = Vec::with_capacity(count);
    let mut off = 0;
    for _ in 0..count {
        let (key, next) = get_key(&slot[HDR_LEN..], off);
        keys.push(key);
        off = next;
    }
    keys
}

/// Registration blob carried by KEY_EXPORT / KEY_IMPORT / KEY_RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDataPay {
    pub key: Key,
    pub base: u64,
    pub len: u64,
    pub access: u8,
}

impl KeyDataPay {
    pub fn encode_into(&self, slot: &mut SlotBuf) -> u16 {
        let buf = &mut slot[HDR_LEN..];
        let off = put_key(buf, 0, self.key);
        let off = put_u64(buf, off, self.base);
        let off = put_u64(buf, off, self.len);
        buf[off] = self.access;
        (off + 1) as u16
    }

    pub fn decode(slot: &SlotBuf) -> KeyDataPay {
        let buf = &slot[HDR_LEN..];
        let (key, off) = get_key(buf, 0);
        KeyDataPay {
            key,
            base: get_u64(buf, off),
            len: get_u64(buf, off + 8),
            access: buf[off + 16],
        }
    }
}

/// Lay out an inline SEND: user data, then optional tag and cq_data words
/// (present iff the matching header flag is set), 8-byte aligned.
pub fn encode_inline_send(
    slot: &mut SlotBuf,
    hdr: &mut MsgHdr,
    data: &[u8],
    tag: Option<u64>,
    cq_data: Option<u64>,
) {
    debug_assert!(data.len() <= MAX_INLINE_MSG);
    hdr.inline_len = data.len() as u16;
    slot[HDR_LEN..HDR_LEN + data.len()].copy_from_slice(data);
    let mut off = HDR_LEN + data.len().next_multiple_of(8);
    if let Some(tag) = tag {
        hdr.flags |= MSG_TAGGED;
        off = put_u64(slot, off, tag);
    }
    if let Some(data) = cq_data {
        hdr.flags |= MSG_REMOTE_CQ_DATA;
        put_u64(slot, off, data);
    }
    hdr.encode_into(slot);
}

/// Parse an inline SEND laid out by [`encode_inline_send`].
pub fn decode_inline_send<'a>(slot: &'a SlotBuf, hdr: &MsgHdr) -> (&'a [u8], u64, u64) {
    let len = hdr.inline_len as usize;
    let data = &slot[HDR_LEN..HDR_LEN + len];
    let mut off = HDR_LEN + len.next_multiple_of(8);
    let mut tag = 0;
    let mut cq_data = 0;
    if hdr.flags & MSG_TAGGED != 0 {
        tag = get_u64(slot, off);
        off += 8;
    }
    if hdr.flags & MSG_REMOTE_CQ_DATA != 0 {
        cq_data = get_u64(slot, off);
    }
    (data, tag, cq_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdr_roundtrip() {
        let hdr = MsgHdr {
            op: OpCode::Send as u8,
            flags: MSG_INLINE | MSG_TAGGED,
            rx_id: 3,
            inline_len: 77,
            pe_entry_id: 0x1234,
        };
        let mut slot = [0u8; RING_SLOT_LEN];
        hdr.encode_into(&mut slot);
        assert_eq!(MsgHdr::decode(&slot), hdr);
        // Big-endian on the wire.
        assert_eq!(&slot[4..8], &[0, 77, 0x12, 0x34]);
    }

    #[test]
    fn test_opcode_unknown() {
        assert_eq!(
            OpCode::try_from(0xab),
            Err(FabricError::NotImplemented(0xab))
        );
    }

    #[test]
    fn test_inline_send_layouts() {
        for (tag, cq) in [
            (None, None),
            (Some(0xABCD), None),
            (None, Some(7)),
            (Some(1), Some(2)),
        ] {
            let mut slot = [0u8; RING_SLOT_LEN];
            let mut hdr = MsgHdr::new(OpCode::Send, MSG_INLINE, 0, 5);
            let data = [0x5a; 13];
            encode_inline_send(&mut slot, &mut hdr, &data, tag, cq);
            let parsed = MsgHdr::decode(&slot);
            let (d, t, c) = decode_inline_send(&slot, &parsed);
            assert_eq!(d, &data);
            assert_eq!(t, tag.unwrap_or(0));
            assert_eq!(c, cq.unwrap_or(0));
            assert_eq!(parsed.flags & MSG_TAGGED != 0, tag.is_some());
        }
    }

    #[test]
    fn test_indirect_roundtrip() {
        let pay = IndirectPay {
            vaddr: 0xdead_beef_0000,
            len: 16384,
            key: Key {
                id: 42,
                internal: true,
            },
            tag: 0xABCD,
            cq_data: 99,
        };
        let mut slot = [0u8; RING_SLOT_LEN];
        pay.encode_into(&mut slot);
        assert_eq!(IndirectPay::decode(&slot), pay);
    }

    #[test]
    fn test_atomic_roundtrip() {
        let pay = AtomicPay {
            op: AtomicOp::Cswap,
            width: AtomicWidth::U32,
            vaddr: 0x1000,
            key: Key {
                id: 7,
                internal: false,
            },
            operand: 5,
            compare: 9,
        };
        let mut slot = [0u8; RING_SLOT_LEN];
        pay.encode_into(&mut slot);
        assert_eq!(AtomicPay::decode(&slot).unwrap(), pay);
    }

    #[test]
    fn test_status_roundtrip() {
        let pay = StatusPay {
            status: -3,
            rem: 12288,
        };
        let mut slot = [0u8; RING_SLOT_LEN];
        pay.encode_into(&mut slot);
        assert_eq!(StatusPay::decode(&slot), pay);
    }

    #[test]
    fn test_key_list_roundtrip() {
        let keys = vec![
            Key {
                id: 1,
                internal: false,
            },
            Key {
                id: u64::MAX,
                internal: true,
            },
        ];
        let mut slot = [0u8; RING_SLOT_LEN];
        let mut hdr = MsgHdr::new(OpCode::KeyRequest, 0, 0, INVALID_PE_ID);
        hdr.inline_len = encode_key_list(&mut slot, &keys);
        hdr.encode_into(&mut slot);
        let parsed = MsgHdr::decode(&slot);
        assert_eq!(decode_key_list(&slot, &parsed), keys);
    }

    #[test]
    fn test_key_data_roundtrip() {
        let pay = KeyDataPay {
            key: Key {
                id: 9,
                internal: false,
            },
            base: 0x4000,
            len: 65536,
            access: 0x0f,
        };
        let mut slot = [0u8; RING_SLOT_LEN];
        pay.encode_into(&mut slot);
        assert_eq!(KeyDataPay::decode(&slot), pay);
    }

    #[test]
    fn test_atomic_width_mask() {
        assert_eq!(AtomicWidth::U8.mask(0x1ff), 0xff);
        assert_eq!(AtomicWidth::U16.mask(0x1_ffff), 0xffff);
        assert_eq!(AtomicWidth::U32.mask(u64::MAX), 0xffff_ffff);
        assert_eq!(AtomicWidth::U64.mask(u64::MAX), u64::MAX);
    }
}

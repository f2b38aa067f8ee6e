//! Length-prefixed command framing.
//!
//! A frame is header + payload, zero-padded to the generation's alignment
//! before encryption. The size field counts header + payload (pre-padding);
//! the receiver decrypts whole padded blocks and truncates to the declared
//! size. Trailing garbage inside the declared size is the handler's problem,
//! not the framer's: some remote servers rely on that.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::cipher::PacketCipher;
use crate::error::{ProxyError, Result};
use crate::version::GameVersion;

/// Commands larger than this are treated as framing corruption.
const MAX_FRAME_SIZE: usize = 0x7C00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub flag: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u16, flag: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            flag,
            payload: payload.into(),
        }
    }
}

fn align_up(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) / alignment * alignment
}

fn encode_header(version: GameVersion, opcode: u16, flag: u32, size: usize) -> Result<Vec<u8>> {
    let mut header = vec![0u8; version.header_size()];
    match version {
        GameVersion::Dc | GameVersion::Gc | GameVersion::Patch => {
            if opcode > 0xFF {
                return Err(ProxyError::framing(format!(
                    "opcode {opcode:04X} does not fit a one-byte header"
                )));
            }
            header[0] = opcode as u8;
            header[1] = flag as u8;
            if version.big_endian() {
                BigEndian::write_u16(&mut header[2..4], size as u16);
            } else {
                LittleEndian::write_u16(&mut header[2..4], size as u16);
            }
        }
        GameVersion::Pc => {
            LittleEndian::write_u16(&mut header[0..2], opcode);
            LittleEndian::write_u16(&mut header[2..4], size as u16);
            LittleEndian::write_u32(&mut header[4..8], flag);
        }
        GameVersion::Bb => {
            LittleEndian::write_u16(&mut header[0..2], size as u16);
            LittleEndian::write_u16(&mut header[2..4], opcode);
            LittleEndian::write_u32(&mut header[4..8], flag);
        }
    }
    Ok(header)
}

fn decode_header(version: GameVersion, header: &[u8]) -> (u16, u32, usize) {
    match version {
        GameVersion::Dc | GameVersion::Gc => (
            header[0] as u16,
            header[1] as u32,
            BigEndian::read_u16(&header[2..4]) as usize,
        ),
        GameVersion::Patch => (
            header[0] as u16,
            header[1] as u32,
            LittleEndian::read_u16(&header[2..4]) as usize,
        ),
        GameVersion::Pc => (
            LittleEndian::read_u16(&header[0..2]),
            LittleEndian::read_u32(&header[4..8]),
            LittleEndian::read_u16(&header[2..4]) as usize,
        ),
        GameVersion::Bb => (
            LittleEndian::read_u16(&header[2..4]),
            LittleEndian::read_u32(&header[4..8]),
            LittleEndian::read_u16(&header[0..2]) as usize,
        ),
    }
}

/// Assembles, pads, and (if a cipher is armed) encrypts one frame, returning
/// the on-wire bytes.
pub fn encode_frame(
    version: GameVersion,
    frame: &Frame,
    cipher: Option<&mut dyn PacketCipher>,
) -> Result<Vec<u8>> {
    let size = version.header_size() + frame.payload.len();
    if size > MAX_FRAME_SIZE {
        return Err(ProxyError::framing(format!("frame of {size} bytes")));
    }
    let mut buf = encode_header(version, frame.opcode, frame.flag, size)?;
    buf.extend_from_slice(&frame.payload);
    buf.resize(align_up(size, version.frame_alignment()), 0);
    if let Some(cipher) = cipher {
        cipher.encrypt(&mut buf)?;
    }
    Ok(buf)
}

/// Incremental frame decoder over a buffered byte stream.
///
/// Bytes are fed in as they arrive; `next_frame` is called in a loop with
/// whatever inbound cipher is currently armed. Arming a cipher between
/// frames is supported (the handshake requires it); re-keying bytes that
/// were already decrypted is not.
pub struct FrameReader {
    version: GameVersion,
    buf: Vec<u8>,
    /// Watermark below which `buf` holds plaintext.
    decrypted: usize,
}

impl FrameReader {
    pub fn new(version: GameVersion) -> Self {
        Self {
            version,
            buf: Vec::new(),
            decrypted: 0,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Reads exactly one whole frame, or `Ok(None)` if more bytes are
    /// needed. Malformed headers surface as [`ProxyError::Framing`].
    pub fn next_frame(
        &mut self,
        mut cipher: Option<&mut dyn PacketCipher>,
    ) -> Result<Option<Frame>> {
        match &mut cipher {
            Some(cipher) => {
                let step = cipher.block_size();
                let target = self.buf.len() / step * step;
                if target > self.decrypted {
                    match cipher.decrypt(&mut self.buf[self.decrypted..target]) {
                        Ok(()) => self.decrypted = target,
                        Err(ProxyError::ShortRead) => return Ok(None),
                        Err(e) => return Err(e),
                    }
                }
            }
            // Plaintext phase: everything buffered is readable as-is.
            None => self.decrypted = self.buf.len(),
        }

        let header_size = self.version.header_size();
        if self.decrypted < header_size {
            return Ok(None);
        }
        let (opcode, flag, size) = decode_header(self.version, &self.buf[..header_size]);
        if size < header_size || size > MAX_FRAME_SIZE {
            return Err(ProxyError::framing(format!(
                "declared size {size:#X} (opcode {opcode:02X})"
            )));
        }
        let padded = align_up(size, self.version.frame_alignment());
        if self.decrypted < padded {
            return Ok(None);
        }

        let payload = self.buf[header_size..size].to_vec();
        self.buf.drain(..padded);
        self.decrypted -= padded;
        Ok(Some(Frame {
            opcode,
            flag,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::stream::StreamCipher;

    #[test]
    fn dc_header_is_big_endian() {
        let frame = Frame::new(0x19, 0x05, vec![1, 2, 3]);
        let wire = encode_frame(GameVersion::Dc, &frame, None).unwrap();
        // opcode, flag, be16 size (4 + 3), one pad byte
        assert_eq!(wire, vec![0x19, 0x05, 0x00, 0x07, 1, 2, 3, 0]);
    }

    #[test]
    fn patch_header_is_little_endian() {
        let frame = Frame::new(0x14, 0, vec![0xAA; 6]);
        let wire = encode_frame(GameVersion::Patch, &frame, None).unwrap();
        assert_eq!(&wire[..4], &[0x14, 0x00, 0x0A, 0x00]);
        assert_eq!(wire.len(), 12); // 10 rounded up to 12
    }

    #[test]
    fn pc_header_layout() {
        let frame = Frame::new(0x9D, 0x0102_0304, vec![]);
        let wire = encode_frame(GameVersion::Pc, &frame, None).unwrap();
        assert_eq!(wire, vec![0x9D, 0x00, 0x08, 0x00, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn bb_login_header_matches_detector_sentinel() {
        let frame = Frame::new(0x93, 0, vec![0u8; 0xAC]);
        let wire = encode_frame(GameVersion::Bb, &frame, None).unwrap();
        assert_eq!(&wire[..8], &[0xB4, 0x00, 0x93, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(wire.len(), 0xB8); // 0xB4 rounded up to 8
    }

    #[test]
    fn reader_handles_split_and_coalesced_frames() {
        let a = encode_frame(GameVersion::Gc, &Frame::new(0x06, 0, vec![9; 5]), None).unwrap();
        let b = encode_frame(GameVersion::Gc, &Frame::new(0x04, 1, vec![8; 36]), None).unwrap();

        let mut reader = FrameReader::new(GameVersion::Gc);
        reader.feed(&a[..3]);
        assert!(reader.next_frame(None).unwrap().is_none());
        reader.feed(&a[3..]);
        reader.feed(&b);

        let first = reader.next_frame(None).unwrap().unwrap();
        assert_eq!(first.opcode, 0x06);
        assert_eq!(first.payload, vec![9; 5]);
        let second = reader.next_frame(None).unwrap().unwrap();
        assert_eq!(second.opcode, 0x04);
        assert_eq!(second.payload.len(), 36);
        assert!(reader.next_frame(None).unwrap().is_none());
    }

    #[test]
    fn reader_truncates_padding_to_declared_size() {
        let frame = Frame::new(0x60, 0, vec![1, 2, 3, 4, 5]);
        let wire = encode_frame(GameVersion::Pc, &frame, None).unwrap();
        assert_eq!(wire.len(), 16);
        let mut reader = FrameReader::new(GameVersion::Pc);
        reader.feed(&wire);
        let out = reader.next_frame(None).unwrap().unwrap();
        assert_eq!(out.payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn ciphered_roundtrip() {
        let mut enc = StreamCipher::new(0x0BAD_F00D);
        let mut dec = StreamCipher::new(0x0BAD_F00D);
        let frame = Frame::new(0x62, 3, (0u8..32).collect::<Vec<_>>());
        let wire = encode_frame(GameVersion::Gc, &frame, Some(&mut enc)).unwrap();

        let mut reader = FrameReader::new(GameVersion::Gc);
        reader.feed(&wire);
        let out = reader
            .next_frame(Some(&mut dec as &mut dyn PacketCipher))
            .unwrap()
            .unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn cipher_armed_between_frames() {
        // First frame travels plaintext, the second is encrypted: the exact
        // shape of the server-init handoff.
        let plain = encode_frame(GameVersion::Pc, &Frame::new(0x02, 0, vec![7; 8]), None).unwrap();
        let mut enc = StreamCipher::new(42);
        let secret =
            encode_frame(GameVersion::Pc, &Frame::new(0x9D, 0, vec![1; 4]), Some(&mut enc))
                .unwrap();

        let mut reader = FrameReader::new(GameVersion::Pc);
        reader.feed(&plain);
        let first = reader.next_frame(None).unwrap().unwrap();
        assert_eq!(first.opcode, 0x02);

        reader.feed(&secret);
        let mut dec = StreamCipher::new(42);
        let second = reader
            .next_frame(Some(&mut dec as &mut dyn PacketCipher))
            .unwrap()
            .unwrap();
        assert_eq!(second.opcode, 0x9D);
        assert_eq!(second.payload, vec![1; 4]);
    }

    #[test]
    fn undersized_declared_size_is_a_framing_error() {
        let mut reader = FrameReader::new(GameVersion::Gc);
        reader.feed(&[0x19, 0x00, 0x00, 0x02]); // size 2 < header size 4
        assert!(matches!(
            reader.next_frame(None),
            Err(ProxyError::Framing(_))
        ));
    }
}

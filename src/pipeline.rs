//! Push-style byte sinks. Every link accepts any number of `write` calls
//! and exactly one terminal `finish`; output is not valid until `finish`
//! has propagated through the chain. Links may buffer arbitrarily before
//! finish. Chains are single-pass and synchronous.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::warn;
use md5::{Digest, Md5};
use rand::RngCore;

use crate::{Error, Result};

pub trait Pipeline {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

impl Pipeline for Vec<u8> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: Pipeline + ?Sized> Pipeline for &mut P {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

impl<P: Pipeline + ?Sized> Pipeline for Box<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Swallows everything.
pub struct Discard;

impl Pipeline for Discard {
    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forwards while counting bytes.
pub struct Counter<P> {
    next: P,
    count: u64,
}

impl<P: Pipeline> Counter<P> {
    pub fn new(next: P) -> Counter<P> {
        Counter { next, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<P: Pipeline> Pipeline for Counter<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.count += data.len() as u64;
        self.next.write(data)
    }

    fn finish(&mut self) -> Result<()> {
        self.next.finish()
    }
}

/// Forwards while accumulating an MD5 digest, available after finish.
pub struct Md5Sum<P> {
    next: P,
    hasher: Md5,
    digest: Option<[u8; 16]>,
}

impl<P: Pipeline> Md5Sum<P> {
    pub fn new(next: P) -> Md5Sum<P> {
        Md5Sum {
            next,
            hasher: Md5::new(),
            digest: None,
        }
    }

    pub fn digest(&self) -> Option<[u8; 16]> {
        self.digest
    }
}

impl<P: Pipeline> Pipeline for Md5Sum<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.next.write(data)
    }

    fn finish(&mut self) -> Result<()> {
        self.digest = Some(self.hasher.clone().finalize().into());
        self.next.finish()
    }
}

/// Delegates every chunk to a closure.
pub struct FnSink<F> {
    callback: F,
}

impl<F: FnMut(&[u8]) -> Result<()>> FnSink<F> {
    pub fn new(callback: F) -> FnSink<F> {
        FnSink { callback }
    }
}

impl<F: FnMut(&[u8]) -> Result<()>> Pipeline for FnSink<F> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (self.callback)(data)
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// ASCIIHexDecode encoder: lowercase hex, wrapped lines, `>` terminator.
pub struct HexEncode<P> {
    next: P,
    column: usize,
}

impl<P: Pipeline> HexEncode<P> {
    pub fn new(next: P) -> HexEncode<P> {
        HexEncode { next, column: 0 }
    }
}

impl<P: Pipeline> Pipeline for HexEncode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(data.len() * 2 + data.len() / 32);
        for &byte in data {
            out.push(HEX_DIGITS[(byte >> 4) as usize]);
            out.push(HEX_DIGITS[(byte & 0x0F) as usize]);
            self.column += 2;
            if self.column >= 72 {
                out.push(b'\n');
                self.column = 0;
            }
        }
        self.next.write(&out)
    }

    fn finish(&mut self) -> Result<()> {
        self.next.write(b">")?;
        self.next.finish()
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// ASCIIHexDecode decoder. Whitespace is ignored, `>` ends the data, an odd
/// digit count implies a trailing zero.
pub struct HexDecode<P> {
    next: P,
    pending: Option<u8>,
    done: bool,
}

impl<P: Pipeline> HexDecode<P> {
    pub fn new(next: P) -> HexDecode<P> {
        HexDecode {
            next,
            pending: None,
            done: false,
        }
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn is_pdf_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C' | 0)
}

impl<P: Pipeline> Pipeline for HexDecode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(data.len() / 2);
        for &byte in data {
            if self.done {
                break;
            }
            if byte == b'>' {
                self.done = true;
                if let Some(high) = self.pending.take() {
                    out.push(high << 4);
                }
            } else if is_pdf_whitespace(byte) {
                continue;
            } else if let Some(value) = hex_value(byte) {
                match self.pending.take() {
                    Some(high) => out.push((high << 4) | value),
                    None => self.pending = Some(value),
                }
            } else {
                return Err(Error::Pipeline(format!("invalid character {byte:#04x} in hex data")));
            }
        }
        self.next.write(&out)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(high) = self.pending.take() {
            self.next.write(&[high << 4])?;
        }
        self.next.finish()
    }
}

/// ASCII85Decode encoder.
pub struct A85Encode<P> {
    next: P,
    group: Vec<u8>,
    column: usize,
}

impl<P: Pipeline> A85Encode<P> {
    pub fn new(next: P) -> A85Encode<P> {
        A85Encode {
            next,
            group: Vec::with_capacity(4),
            column: 0,
        }
    }

    fn emit_group(&mut self, partial: usize) -> Result<()> {
        let mut group = [0u8; 4];
        group[..self.group.len()].copy_from_slice(&self.group);
        let mut word = u32::from_be_bytes(group);
        let mut chars = [0u8; 5];
        if word == 0 && partial == 4 {
            self.group.clear();
            self.column += 1;
            return self.next.write(b"z");
        }
        for slot in chars.iter_mut().rev() {
            *slot = (word % 85) as u8 + b'!';
            word /= 85;
        }
        self.group.clear();
        let take = partial + 1;
        self.column += take;
        self.next.write(&chars[..take])?;
        if self.column >= 72 {
            self.column = 0;
            self.next.write(b"\n")?;
        }
        Ok(())
    }
}

impl<P: Pipeline> Pipeline for A85Encode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        for &byte in data {
            self.group.push(byte);
            if self.group.len() == 4 {
                self.emit_group(4)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let remainder = self.group.len();
        if remainder > 0 {
            self.emit_group(remainder)?;
        }
        self.next.write(b"~>")?;
        self.next.finish()
    }
}

/// ASCII85Decode decoder. Buffers until finish; filters are allowed to.
pub struct A85Decode<P> {
    next: P,
    input: Vec<u8>,
}

impl<P: Pipeline> A85Decode<P> {
    pub fn new(next: P) -> A85Decode<P> {
        A85Decode { next, input: Vec::new() }
    }
}

impl<P: Pipeline> Pipeline for A85Decode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let mut out = Vec::with_capacity(self.input.len() * 4 / 5);
        let mut group = [0u32; 5];
        let mut len = 0usize;
        let mut data = self.input.as_slice();
        if data.starts_with(b"<~") {
            data = &data[2..];
        }
        'outer: for &byte in data {
            match byte {
                b'~' => break 'outer,
                b'z' if len == 0 => out.extend_from_slice(&[0, 0, 0, 0]),
                b'!'..=b'u' => {
                    group[len] = (byte - b'!') as u32;
                    len += 1;
                    if len == 5 {
                        let word = group.iter().fold(0u32, |acc, &digit| acc.wrapping_mul(85).wrapping_add(digit));
                        out.extend_from_slice(&word.to_be_bytes());
                        len = 0;
                    }
                }
                _ if is_pdf_whitespace(byte) => {}
                _ => {
                    return Err(Error::Pipeline(format!(
                        "invalid character {byte:#04x} in base 85 data"
                    )));
                }
            }
        }
        if len == 1 {
            return Err(Error::Pipeline("truncated base 85 group".to_string()));
        }
        if len > 1 {
            // A partial group of n digits carries n-1 bytes; pad with 'u'.
            let mut padded = group;
            for slot in padded.iter_mut().take(5).skip(len) {
                *slot = 84;
            }
            let word = padded.iter().fold(0u32, |acc, &digit| acc.wrapping_mul(85).wrapping_add(digit));
            out.extend_from_slice(&word.to_be_bytes()[..len - 1]);
        }
        self.next.write(&out)?;
        self.next.finish()
    }
}

/// RunLengthDecode decoder.
pub struct RunLengthDecode<P> {
    next: P,
    input: Vec<u8>,
}

impl<P: Pipeline> RunLengthDecode<P> {
    pub fn new(next: P) -> RunLengthDecode<P> {
        RunLengthDecode { next, input: Vec::new() }
    }
}

impl<P: Pipeline> Pipeline for RunLengthDecode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let mut out = Vec::with_capacity(self.input.len() * 2);
        let mut pos = 0;
        while pos < self.input.len() {
            let length = self.input[pos];
            pos += 1;
            match length {
                128 => break,
                0..=127 => {
                    let count = length as usize + 1;
                    let end = pos + count;
                    if end > self.input.len() {
                        return Err(Error::Pipeline("run length literal overruns data".to_string()));
                    }
                    out.extend_from_slice(&self.input[pos..end]);
                    pos = end;
                }
                129..=255 => {
                    if pos >= self.input.len() {
                        return Err(Error::Pipeline("run length repeat overruns data".to_string()));
                    }
                    out.extend(std::iter::repeat_n(self.input[pos], 257 - length as usize));
                    pos += 1;
                }
            }
        }
        self.next.write(&out)?;
        self.next.finish()
    }
}

/// RunLengthDecode encoder.
pub struct RunLengthEncode<P> {
    next: P,
    input: Vec<u8>,
}

impl<P: Pipeline> RunLengthEncode<P> {
    pub fn new(next: P) -> RunLengthEncode<P> {
        RunLengthEncode { next, input: Vec::new() }
    }
}

impl<P: Pipeline> Pipeline for RunLengthEncode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let data = &self.input;
        let mut out = Vec::with_capacity(data.len() + data.len() / 128 + 2);
        let mut pos = 0;
        while pos < data.len() {
            let run_end = {
                let byte = data[pos];
                let mut end = pos + 1;
                while end < data.len() && end - pos < 128 && data[end] == byte {
                    end += 1;
                }
                end
            };
            if run_end - pos >= 2 {
                out.push((257 - (run_end - pos)) as u8);
                out.push(data[pos]);
                pos = run_end;
            } else {
                let mut end = pos + 1;
                while end < data.len()
                    && end - pos < 128
                    && !(end + 1 < data.len() && data[end] == data[end + 1])
                {
                    end += 1;
                }
                out.push((end - pos - 1) as u8);
                out.extend_from_slice(&data[pos..end]);
                pos = end;
            }
        }
        out.push(128);
        self.next.write(&out)?;
        self.next.finish()
    }
}

/// FlateDecode encoder (zlib format), streaming.
pub struct FlateEncode<P> {
    next: P,
    compress: Compress,
    out: Vec<u8>,
}

impl<P: Pipeline> FlateEncode<P> {
    pub fn new(next: P) -> FlateEncode<P> {
        FlateEncode::with_level(next, Compression::default())
    }

    pub fn with_level(next: P, level: Compression) -> FlateEncode<P> {
        FlateEncode {
            next,
            compress: Compress::new(level, true),
            out: vec![0; 32 * 1024],
        }
    }

    fn drive(&mut self, mut data: &[u8], flush: FlushCompress) -> Result<()> {
        loop {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress(data, &mut self.out, flush)
                .map_err(|e| Error::Pipeline(format!("flate compression failed: {e}")))?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            data = &data[consumed..];
            self.next.write(&self.out[..produced])?;
            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    if data.is_empty() && flush == FlushCompress::None {
                        return Ok(());
                    }
                    if consumed == 0 && produced == 0 {
                        return Err(Error::Pipeline("flate compression made no progress".to_string()));
                    }
                }
            }
        }
    }
}

impl<P: Pipeline> Pipeline for FlateEncode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.drive(data, FlushCompress::None)
    }

    fn finish(&mut self) -> Result<()> {
        self.drive(&[], FlushCompress::Finish)?;
        self.next.finish()
    }
}

/// FlateDecode decoder, streaming and tolerant of trailing junk.
pub struct FlateDecode<P> {
    next: P,
    decompress: Decompress,
    out: Vec<u8>,
    done: bool,
}

impl<P: Pipeline> FlateDecode<P> {
    pub fn new(next: P) -> FlateDecode<P> {
        FlateDecode {
            next,
            decompress: Decompress::new(true),
            out: vec![0; 32 * 1024],
            done: false,
        }
    }
}

impl<P: Pipeline> Pipeline for FlateDecode<P> {
    fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() && !self.done {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(data, &mut self.out, FlushDecompress::None)
                .map_err(|e| Error::Pipeline(format!("flate decompression failed: {e}")))?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            self.next.write(&self.out[..produced])?;
            data = &data[consumed..];
            match status {
                Status::StreamEnd => self.done = true,
                Status::BufError if consumed == 0 && produced == 0 => {
                    return Err(Error::Pipeline("flate data is truncated or corrupt".to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.done {
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(&[], &mut self.out, FlushDecompress::Finish)
                .map_err(|e| Error::Pipeline(format!("flate decompression failed: {e}")))?;
            let produced = (self.decompress.total_out() - before_out) as usize;
            self.next.write(&self.out[..produced])?;
            if status != Status::StreamEnd {
                warn!("flate stream ended without a final block");
            }
        }
        self.next.finish()
    }
}

/// LZWDecode decoder. Buffers its input and decodes at finish.
pub struct LzwDecode<P> {
    next: P,
    input: Vec<u8>,
    early_change: bool,
}

impl<P: Pipeline> LzwDecode<P> {
    pub fn new(next: P, early_change: bool) -> LzwDecode<P> {
        LzwDecode {
            next,
            input: Vec::new(),
            early_change,
        }
    }
}

impl<P: Pipeline> Pipeline for LzwDecode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let mut decoder = if self.early_change {
            weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
        } else {
            weezl::decode::Decoder::new(weezl::BitOrder::Msb, 8)
        };
        let mut out = Vec::with_capacity(self.input.len() * 3);
        decoder
            .into_stream(&mut out)
            .decode_all(self.input.as_slice())
            .status
            .map_err(|e| Error::Pipeline(format!("lzw decompression failed: {e}")))?;
        self.next.write(&out)?;
        self.next.finish()
    }
}

/// RC4, encryption and decryption being the same operation.
pub struct Rc4Link<P> {
    next: P,
    cipher: crate::encryption::rc4::Rc4,
}

impl<P: Pipeline> Rc4Link<P> {
    pub fn new(key: &[u8], next: P) -> Rc4Link<P> {
        Rc4Link {
            next,
            cipher: crate::encryption::rc4::Rc4::new(key),
        }
    }
}

impl<P: Pipeline> Pipeline for Rc4Link<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let processed = self.cipher.process(data);
        self.next.write(&processed)
    }

    fn finish(&mut self) -> Result<()> {
        self.next.finish()
    }
}

/// Where the AES-CBC link gets its initialization vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvSource {
    /// Encrypt: generate, prepend to the output. Decrypt: consume the
    /// first input block.
    Data,
    /// Fixed bytes, still prepended on encrypt, for reproducible output.
    /// Decrypt uses the given bytes without consuming input.
    Static([u8; 16]),
    /// All zero; nothing is prepended or consumed. Used by key wrapping.
    Zero,
}

enum AesKey {
    Enc128(aes::Aes128Enc),
    Dec128(aes::Aes128Dec),
    Enc256(aes::Aes256Enc),
    Dec256(aes::Aes256Dec),
}

impl AesKey {
    fn apply(&self, block: &mut [u8; 16]) {
        let ga = GenericArray::from_mut_slice(block);
        match self {
            AesKey::Enc128(cipher) => cipher.encrypt_block(ga),
            AesKey::Dec128(cipher) => cipher.decrypt_block(ga),
            AesKey::Enc256(cipher) => cipher.encrypt_block(ga),
            AesKey::Dec256(cipher) => cipher.decrypt_block(ga),
        }
    }
}

/// AES-CBC with the PDF conventions: the IV rides in front of the data and
/// the payload carries PKCS-style padding, each pad byte equal to the pad
/// count. Both behaviors can be switched off for key wrapping.
pub struct AesCbc<P> {
    next: P,
    key: AesKey,
    encrypt: bool,
    padding: bool,
    iv: Option<[u8; 16]>,
    iv_source: IvSource,
    block: [u8; 16],
    filled: usize,
    /// Decrypt holds back one plaintext block so the pad can be stripped.
    pending: Option<[u8; 16]>,
    started: bool,
}

impl<P: Pipeline> AesCbc<P> {
    pub fn encrypt(key: &[u8], iv_source: IvSource, padding: bool, next: P) -> Result<AesCbc<P>> {
        let key = match key.len() {
            16 => AesKey::Enc128(aes::Aes128Enc::new_from_slice(key).expect("length checked")),
            32 => AesKey::Enc256(aes::Aes256Enc::new_from_slice(key).expect("length checked")),
            n => return Err(Error::Pipeline(format!("invalid AES key length {n}"))),
        };
        Ok(AesCbc {
            next,
            key,
            encrypt: true,
            padding,
            iv: None,
            iv_source,
            block: [0; 16],
            filled: 0,
            pending: None,
            started: false,
        })
    }

    pub fn decrypt(key: &[u8], iv_source: IvSource, padding: bool, next: P) -> Result<AesCbc<P>> {
        let key = match key.len() {
            16 => AesKey::Dec128(aes::Aes128Dec::new_from_slice(key).expect("length checked")),
            32 => AesKey::Dec256(aes::Aes256Dec::new_from_slice(key).expect("length checked")),
            n => return Err(Error::Pipeline(format!("invalid AES key length {n}"))),
        };
        Ok(AesCbc {
            next,
            key,
            encrypt: false,
            padding,
            iv: None,
            iv_source,
            block: [0; 16],
            filled: 0,
            pending: None,
            started: false,
        })
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        match self.iv_source {
            IvSource::Static(iv) => {
                if self.encrypt {
                    self.next.write(&iv)?;
                }
                self.iv = Some(iv);
            }
            IvSource::Zero => self.iv = Some([0; 16]),
            IvSource::Data => {
                if self.encrypt {
                    let mut iv = [0u8; 16];
                    rand::rng().fill_bytes(&mut iv);
                    self.next.write(&iv)?;
                    self.iv = Some(iv);
                }
                // Decrypt: the IV is the first input block, handled in
                // process_block.
            }
        }
        Ok(())
    }

    fn process_block(&mut self) -> Result<()> {
        debug_assert_eq!(self.filled, 16);
        self.filled = 0;
        let mut iv = match self.iv {
            Some(iv) => iv,
            None => {
                // Decrypting with the IV in the data stream.
                self.iv = Some(self.block);
                return Ok(());
            }
        };
        if self.encrypt {
            for (b, v) in self.block.iter_mut().zip(iv.iter()) {
                *b ^= v;
            }
            self.key.apply(&mut self.block);
            self.iv = Some(self.block);
            let block = self.block;
            self.next.write(&block)?;
        } else {
            let cipher_block = self.block;
            self.key.apply(&mut self.block);
            for (b, v) in self.block.iter_mut().zip(iv.iter_mut()) {
                *b ^= *v;
            }
            self.iv = Some(cipher_block);
            let plain = self.block;
            if self.padding {
                if let Some(previous) = self.pending.replace(plain) {
                    self.next.write(&previous)?;
                }
            } else {
                self.next.write(&plain)?;
            }
        }
        Ok(())
    }
}

impl<P: Pipeline> Pipeline for AesCbc<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.started {
            self.start()?;
        }
        for &byte in data {
            self.block[self.filled] = byte;
            self.filled += 1;
            if self.filled == 16 {
                self.process_block()?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.started {
            self.start()?;
        }
        if self.encrypt {
            if self.padding {
                let pad = (16 - self.filled) as u8;
                while self.filled < 16 {
                    self.block[self.filled] = pad;
                    self.filled += 1;
                }
                self.process_block()?;
            } else if self.filled > 0 {
                warn!("AES input is not a multiple of the block size, zero padding");
                while self.filled < 16 {
                    self.block[self.filled] = 0;
                    self.filled += 1;
                }
                self.process_block()?;
            }
        } else {
            if self.filled > 0 {
                warn!("AES ciphertext is not a multiple of the block size, zero padding");
                while self.filled < 16 {
                    self.block[self.filled] = 0;
                    self.filled += 1;
                }
                self.process_block()?;
            }
            if let Some(last) = self.pending.take() {
                let pad = last[15] as usize;
                if (1..=16).contains(&pad) {
                    self.next.write(&last[..16 - pad])?;
                } else {
                    warn!("AES data has an invalid trailing pad byte, keeping the block");
                    self.next.write(&last)?;
                }
            }
        }
        self.next.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! run {
        ($link:ident, $data:expr) => {{
            let mut out = Vec::new();
            {
                let mut link = $link::new(&mut out);
                link.write($data).unwrap();
                link.finish().unwrap();
            }
            out
        }};
        ($link:ident($($extra:expr),+), $data:expr) => {{
            let mut out = Vec::new();
            {
                let mut link = $link::new(&mut out, $($extra),+);
                link.write($data).unwrap();
                link.finish().unwrap();
            }
            out
        }};
    }

    #[test]
    fn counter_counts_across_writes() {
        let mut counter = Counter::new(Discard);
        counter.write(b"hello ").unwrap();
        counter.write(b"world").unwrap();
        counter.finish().unwrap();
        assert_eq!(counter.count(), 11);
    }

    #[test]
    fn fn_sink_delegates_chunks() {
        let mut seen = Vec::new();
        {
            let mut link = FnSink::new(|chunk: &[u8]| {
                seen.extend_from_slice(chunk);
                Ok(())
            });
            link.write(b"ab").unwrap();
            link.write(b"cd").unwrap();
            link.finish().unwrap();
        }
        assert_eq!(seen, b"abcd");
    }

    #[test]
    fn md5_digest_available_after_finish() {
        let mut link = Md5Sum::new(Discard);
        link.write(b"abc").unwrap();
        assert!(link.digest().is_none());
        link.finish().unwrap();
        let digest = link.digest().unwrap();
        assert_eq!(
            digest,
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28, 0xe1, 0x7f, 0x72
            ]
        );
    }

    #[test]
    fn hex_round_trip() {
        let encoded = run!(HexEncode, b"\x00\xffAB");
        assert!(encoded.ends_with(b">"));
        let decoded = run!(HexDecode, &encoded);
        assert_eq!(decoded, b"\x00\xffAB");
    }

    #[test]
    fn hex_decode_odd_digit_count() {
        let decoded = run!(HexDecode, b"41 4>");
        assert_eq!(decoded, b"A\x40");
    }

    #[test]
    fn ascii85_round_trip() {
        let data = b"Man is distinguished, not only by his reason";
        let encoded = run!(A85Encode, data);
        assert!(encoded.ends_with(b"~>"));
        let decoded = run!(A85Decode, &encoded);
        assert_eq!(decoded, data);
    }

    #[test]
    fn ascii85_zero_group_shorthand() {
        let encoded = run!(A85Encode, &[0u8; 8][..]);
        assert_eq!(&encoded[..2], b"zz");
        let decoded = run!(A85Decode, &encoded);
        assert_eq!(decoded, vec![0u8; 8]);
    }

    #[test]
    fn run_length_round_trip() {
        let data = b"aaaaaaaabcdefggggggggggggghi";
        let encoded = run!(RunLengthEncode, data);
        let decoded = run!(RunLengthDecode, &encoded);
        assert_eq!(decoded, data);
    }

    #[test]
    fn flate_round_trip_streaming() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut compressed = Vec::new();
        {
            let mut link = FlateEncode::new(&mut compressed);
            for chunk in data.chunks(377) {
                link.write(chunk).unwrap();
            }
            link.finish().unwrap();
        }
        assert!(compressed.len() < data.len());
        let mut decompressed = Vec::new();
        {
            let mut link = FlateDecode::new(&mut decompressed);
            for chunk in compressed.chunks(13) {
                link.write(chunk).unwrap();
            }
            link.finish().unwrap();
        }
        assert_eq!(decompressed, data);
    }

    #[test]
    fn aes_cbc_round_trip_with_padding() {
        let key = [7u8; 16];
        let data = b"seventeen bytes!!";
        let mut ciphertext = Vec::new();
        {
            let mut link = AesCbc::encrypt(&key, IvSource::Static([9; 16]), true, &mut ciphertext).unwrap();
            link.write(data).unwrap();
            link.finish().unwrap();
        }
        // The fixed IV is prepended, then 17 bytes pad out to two blocks.
        assert_eq!(ciphertext.len(), 48);
        assert_eq!(&ciphertext[..16], &[9; 16]);
        let mut plain = Vec::new();
        {
            let mut link = AesCbc::decrypt(&key, IvSource::Data, true, &mut plain).unwrap();
            link.write(&ciphertext).unwrap();
            link.finish().unwrap();
        }
        assert_eq!(plain, data);
    }

    #[test]
    fn aes_cbc_round_trip_with_data_iv() {
        let key = [3u8; 32];
        let data = b"exactly sixteen!";
        let mut ciphertext = Vec::new();
        {
            let mut link = AesCbc::encrypt(&key, IvSource::Data, true, &mut ciphertext).unwrap();
            link.write(data).unwrap();
            link.finish().unwrap();
        }
        // IV plus data plus one full pad block.
        assert_eq!(ciphertext.len(), 48);
        let mut plain = Vec::new();
        {
            let mut link = AesCbc::decrypt(&key, IvSource::Data, true, &mut plain).unwrap();
            link.write(&ciphertext).unwrap();
            link.finish().unwrap();
        }
        assert_eq!(plain, data);
    }

    #[test]
    fn aes_cbc_zero_iv_no_padding() {
        let key = [1u8; 32];
        let data = [0x55u8; 32];
        let mut ciphertext = Vec::new();
        {
            let mut link = AesCbc::encrypt(&key, IvSource::Zero, false, &mut ciphertext).unwrap();
            link.write(&data).unwrap();
            link.finish().unwrap();
        }
        assert_eq!(ciphertext.len(), 32);
        let mut plain = Vec::new();
        {
            let mut link = AesCbc::decrypt(&key, IvSource::Zero, false, &mut plain).unwrap();
            link.write(&ciphertext).unwrap();
            link.finish().unwrap();
        }
        assert_eq!(plain.as_slice(), data.as_slice());
    }

    #[test]
    fn lzw_decodes_known_sample() {
        // "-----A---B" from the LZW example in the PDF reference.
        let sample = [0x80, 0x0B, 0x60, 0x50, 0x22, 0x0C, 0x0C, 0x85, 0x01];
        let decoded = run!(LzwDecode(true), &sample[..]);
        assert_eq!(decoded, b"-----A---B");
    }
}

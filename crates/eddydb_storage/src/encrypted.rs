//! Random-access encrypted stream.
//!
//! The cleartext is divided into 4 KiB blocks, numbered from zero. Each
//! block is encrypted with AES-128-CBC; the IV is a 128-bit integer whose
//! high half is zero and whose low half is the block index (big-endian),
//! so any block can be decrypted without reading its predecessors.
//!
//! A random 16-byte nonce is XORed with the caller's key to derive the
//! actual cipher key, and appended to the file as a trailer so readers can
//! recover it. Non-final blocks are encrypted without padding (ciphertext
//! size equals plaintext size); the final, partial block uses PKCS7. If
//! the cleartext length is an exact multiple of the block size an empty
//! PKCS7-padded block is appended, so decryption can always recover the
//! true length.
//!
//! ```text
//! [block 0][block 1]...[block N (padded)][nonce: 16 bytes]
//! ```

use crate::error::{StreamError, StreamResult};
use crate::stream::{SeekableReadStream, WriteStream};

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use rand::RngCore;
use tracing::{trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Cleartext block size.
pub const FILE_BLOCK_SIZE: usize = 4096;
/// AES-128 key (and nonce) size in bytes.
pub const KEY_SIZE: usize = 16;
/// Constant file-size overhead: the nonce trailer.
pub const FILE_SIZE_OVERHEAD: u64 = KEY_SIZE as u64;
/// AES cipher block size.
const AES_BLOCK_SIZE: usize = 16;

/// Encryption algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// No encryption. Not supported by the encrypted stream; callers
    /// should bypass the wrapper instead.
    None,
    /// AES-128 in CBC mode.
    Aes128,
}

/// An AES-128 encryption key.
///
/// Zeroized on drop; `Debug` never prints the bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 16 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StreamResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| StreamError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    /// XORs this key with `nonce`, producing the derived cipher key.
    fn derive(&self, nonce: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
        let mut derived = [0u8; KEY_SIZE];
        for (i, d) in derived.iter_mut().enumerate() {
            *d = self.bytes[i] ^ nonce[i];
        }
        derived
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Builds the CBC IV for a block: high 64 bits zero, low 64 bits the
/// block index, big-endian.
fn block_iv(block_id: u64) -> [u8; AES_BLOCK_SIZE] {
    let mut iv = [0u8; AES_BLOCK_SIZE];
    iv[8..].copy_from_slice(&block_id.to_be_bytes());
    iv
}

fn check_algorithm(algorithm: EncryptionAlgorithm) -> StreamResult<()> {
    match algorithm {
        EncryptionAlgorithm::Aes128 => Ok(()),
        EncryptionAlgorithm::None => Err(StreamError::UnsupportedEncryption),
    }
}

/// A write stream that encrypts into an underlying [`WriteStream`].
///
/// Nothing is observable on the underlying writer until a full block
/// accumulates or [`close`](EncryptedWriteStream::close) is called.
pub struct EncryptedWriteStream {
    output: Option<Box<dyn WriteStream>>,
    key: [u8; KEY_SIZE],
    nonce: [u8; KEY_SIZE],
    buffer: Vec<u8>,
    block_id: u64,
}

impl EncryptedWriteStream {
    /// Creates an encrypting writer over `output`.
    ///
    /// A random nonce is generated; the derived key is the caller's key
    /// XOR the nonce.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnsupportedEncryption`] for any algorithm
    /// other than AES-128.
    pub fn new(
        output: Box<dyn WriteStream>,
        algorithm: EncryptionAlgorithm,
        key: &EncryptionKey,
    ) -> StreamResult<Self> {
        check_algorithm(algorithm)?;
        let mut nonce = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        Ok(Self {
            output: Some(output),
            key: key.derive(&nonce),
            nonce,
            buffer: Vec::with_capacity(FILE_BLOCK_SIZE),
            block_id: 0,
        })
    }

    /// Appends cleartext to the stream.
    ///
    /// # Errors
    ///
    /// Fails if the stream is closed or the underlying writer fails.
    pub fn write(&mut self, mut data: &[u8]) -> StreamResult<()> {
        if self.output.is_none() {
            return Err(StreamError::Closed);
        }

        // Top up the partial block buffer first.
        let capacity = (FILE_BLOCK_SIZE - self.buffer.len()).min(data.len());
        self.buffer.extend_from_slice(&data[..capacity]);
        data = &data[capacity..];
        if self.buffer.len() < FILE_BLOCK_SIZE {
            return Ok(());
        }

        let full = std::mem::replace(&mut self.buffer, Vec::with_capacity(FILE_BLOCK_SIZE));
        self.write_block(&full, false)?;

        // Whole blocks go straight through.
        while data.len() >= FILE_BLOCK_SIZE {
            self.write_block(&data[..FILE_BLOCK_SIZE], false)?;
            data = &data[FILE_BLOCK_SIZE..];
        }

        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Flushes the final padded block and the nonce trailer, then closes
    /// the underlying writer.
    pub fn close(&mut self) -> StreamResult<()> {
        if self.output.is_some() {
            let last = std::mem::take(&mut self.buffer);
            self.write_block(&last, true)?;
            let mut output = self.output.take().expect("checked above");
            output.write(&self.nonce)?;
            output.close()?;
        }
        Ok(())
    }

    fn write_block(&mut self, plaintext: &[u8], final_block: bool) -> StreamResult<()> {
        debug_assert!(plaintext.len() <= FILE_BLOCK_SIZE);
        let iv = block_iv(self.block_id);
        let cipher = Aes128CbcEnc::new(&self.key.into(), &iv.into());
        let ciphertext = if final_block {
            cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        } else {
            debug_assert_eq!(plaintext.len(), FILE_BLOCK_SIZE);
            cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext)
        };
        trace!(
            block = self.block_id,
            bytes = plaintext.len(),
            final_block,
            ciphertext = ciphertext.len(),
            "wrote encrypted block"
        );
        self.block_id += 1;
        self.output
            .as_mut()
            .ok_or(StreamError::Closed)?
            .write(&ciphertext)
    }
}

impl Drop for EncryptedWriteStream {
    fn drop(&mut self) {
        if self.output.is_some() {
            warn!("EncryptedWriteStream dropped without close(); trailer not written");
        }
        self.key.zeroize();
    }
}

/// A read stream that decrypts from an underlying [`SeekableReadStream`].
///
/// Seeks are O(1): the block containing the target position is read and
/// decrypted directly, using the block index as the IV.
pub struct EncryptedReadStream {
    input: Box<dyn SeekableReadStream>,
    key: [u8; KEY_SIZE],
    /// Ciphertext length, excluding the nonce trailer.
    input_length: u64,
    final_block_id: u64,
    /// Next block to read from the file.
    block_id: u64,
    buffer: Vec<u8>,
    buffer_block_id: Option<u64>,
    buffer_pos: usize,
    cleartext_length: Option<u64>,
}

impl EncryptedReadStream {
    /// Opens an encrypted stream for reading.
    ///
    /// Reads the nonce trailer to derive the cipher key.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::CorruptData`] if the file is too short to
    /// hold the trailer and a final block, and
    /// [`StreamError::UnsupportedEncryption`] for any algorithm other
    /// than AES-128.
    pub fn new(
        mut input: Box<dyn SeekableReadStream>,
        algorithm: EncryptionAlgorithm,
        key: &EncryptionKey,
    ) -> StreamResult<Self> {
        check_algorithm(algorithm)?;
        let total = input.length()?;
        if total < FILE_SIZE_OVERHEAD + AES_BLOCK_SIZE as u64 {
            return Err(StreamError::corrupt("file too short for nonce trailer"));
        }
        let input_length = total - FILE_SIZE_OVERHEAD;

        input.seek(input_length)?;
        let mut nonce = [0u8; KEY_SIZE];
        let n = input.read(&mut nonce)?;
        if n < KEY_SIZE {
            return Err(StreamError::corrupt("could not read nonce trailer"));
        }
        input.seek(0)?;

        Ok(Self {
            input,
            key: key.derive(&nonce),
            input_length,
            final_block_id: (input_length - 1) / FILE_BLOCK_SIZE as u64,
            block_id: 0,
            buffer: Vec::new(),
            buffer_block_id: None,
            buffer_pos: 0,
            cleartext_length: None,
        })
    }

    /// Reads up to `dst.len()` bytes at the current position.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if a block fails to decrypt.
    pub fn read(&mut self, dst: &mut [u8]) -> StreamResult<usize> {
        let mut filled = 0;
        loop {
            // Copy whatever the buffer still holds.
            let available = self.buffer.len() - self.buffer_pos;
            let n = available.min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + n]);
            self.buffer_pos += n;
            filled += n;
            if filled == dst.len() || self.block_id > self.final_block_id {
                return Ok(filled);
            }
            self.fill_buffer()?;
            if self.buffer.is_empty() {
                return Ok(filled);
            }
        }
    }

    /// Moves the read position to `pos`. Positions past the end clamp to
    /// the end of the stream.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if the target block fails to decrypt.
    pub fn seek(&mut self, mut pos: u64) -> StreamResult<()> {
        if pos > self.input_length {
            pos = self.input_length;
        }
        let block_id = (pos / FILE_BLOCK_SIZE as u64).min(self.final_block_id);
        let block_pos = block_id * FILE_BLOCK_SIZE as u64;
        if self.buffer_block_id != Some(block_id) {
            trace!(pos, block = block_id, "seek");
            self.input.seek(block_pos)?;
            self.block_id = block_id;
            self.fill_buffer()?;
        }
        self.buffer_pos = ((pos - block_pos) as usize).min(self.buffer.len());
        Ok(())
    }

    /// Current read position in cleartext bytes.
    #[must_use]
    pub fn tell(&self) -> u64 {
        match self.buffer_block_id {
            Some(block) => block * FILE_BLOCK_SIZE as u64 + self.buffer_pos as u64,
            None => 0,
        }
    }

    /// Total cleartext length.
    ///
    /// Computed lazily by decrypting the final block to discover its true
    /// post-padding size.
    ///
    /// # Errors
    ///
    /// Fails if the final block cannot be read or decrypted.
    pub fn length(&mut self) -> StreamResult<u64> {
        if let Some(length) = self.cleartext_length {
            return Ok(length);
        }
        let pos = self.tell();
        self.seek(self.input_length)?;
        let length = self.tell();
        self.seek(pos)?;
        self.cleartext_length = Some(length);
        Ok(length)
    }

    /// Reads and decrypts block `self.block_id` into the buffer.
    fn fill_buffer(&mut self) -> StreamResult<()> {
        self.buffer_block_id = Some(self.block_id);
        self.buffer_pos = 0;
        self.buffer = self.read_block_from_file()?;
        Ok(())
    }

    fn read_block_from_file(&mut self) -> StreamResult<Vec<u8>> {
        if self.block_id > self.final_block_id {
            return Ok(Vec::new());
        }
        let final_block = self.block_id == self.final_block_id;
        let read_size = if final_block {
            // Don't read into the trailer.
            (self.input_length - self.block_id * FILE_BLOCK_SIZE as u64) as usize
        } else {
            FILE_BLOCK_SIZE
        };
        let mut ciphertext = vec![0u8; read_size];
        let n = self.input.read(&mut ciphertext)?;
        if n < read_size {
            return Err(StreamError::corrupt("encrypted block is truncated"));
        }

        let iv = block_iv(self.block_id);
        let cipher = Aes128CbcDec::new(&self.key.into(), &iv.into());
        let plaintext = if final_block {
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
                .map_err(|_| StreamError::corrupt("final block failed to decrypt"))?
        } else {
            cipher
                .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
                .map_err(|_| StreamError::corrupt("block failed to decrypt"))?
        };
        trace!(
            block = self.block_id,
            bytes = read_size,
            final_block,
            plaintext = plaintext.len(),
            "read encrypted block"
        );
        self.block_id += 1;
        Ok(plaintext)
    }
}

impl Drop for EncryptedReadStream {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MemoryReadStream, MemoryWriteStream, SharedBytes};

    fn key() -> EncryptionKey {
        EncryptionKey::from_bytes(&[0x2A; KEY_SIZE]).unwrap()
    }

    fn encrypt(chunks: &[&[u8]]) -> SharedBytes {
        let buffer = SharedBytes::new();
        let mut writer = EncryptedWriteStream::new(
            Box::new(MemoryWriteStream::new(buffer.clone())),
            EncryptionAlgorithm::Aes128,
            &key(),
        )
        .unwrap();
        for chunk in chunks {
            writer.write(chunk).unwrap();
        }
        writer.close().unwrap();
        buffer
    }

    fn open(buffer: SharedBytes) -> EncryptedReadStream {
        EncryptedReadStream::new(
            Box::new(MemoryReadStream::new(buffer)),
            EncryptionAlgorithm::Aes128,
            &key(),
        )
        .unwrap()
    }

    fn read_all(reader: &mut EncryptedReadStream, expected_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; expected_len + 64];
        let n = reader.read(&mut out).unwrap();
        out.truncate(n);
        out
    }

    /// Disk size: full blocks verbatim, final block PKCS7-padded (an empty
    /// padded block when the length is a block multiple), plus the nonce.
    fn expected_file_size(clear_len: usize) -> usize {
        let full = clear_len / FILE_BLOCK_SIZE * FILE_BLOCK_SIZE;
        let rest = clear_len % FILE_BLOCK_SIZE;
        full + (rest / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE + KEY_SIZE
    }

    #[test]
    fn roundtrip_at_interesting_sizes() {
        for len in [0usize, 1, 15, 16, 100, 4095, 4096, 4097, 8192, 10_000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let buffer = encrypt(&[&data]);
            assert_eq!(
                buffer.len(),
                expected_file_size(len),
                "file size for cleartext length {len}"
            );

            let mut reader = open(buffer);
            assert_eq!(reader.length().unwrap(), len as u64);
            reader.seek(0).unwrap();
            assert_eq!(read_all(&mut reader, len), data, "roundtrip of {len} bytes");
        }
    }

    #[test]
    fn multi_chunk_write_matches_single_write() {
        let data: Vec<u8> = (0..9000).map(|i| (i % 251) as u8).collect();
        let buffer = encrypt(&[&data[..1], &data[1..5000], &data[5000..]]);
        let mut reader = open(buffer);
        assert_eq!(read_all(&mut reader, data.len()), data);
    }

    #[test]
    fn large_mixed_roundtrip() {
        // 100k '!' + 80k '?' + 110k '/' + 3k '.' = 293,000 bytes.
        let mut data = Vec::new();
        data.extend(std::iter::repeat(b'!').take(100_000));
        data.extend(std::iter::repeat(b'?').take(80_000));
        data.extend(std::iter::repeat(b'/').take(110_000));
        data.extend(std::iter::repeat(b'.').take(3_000));

        let buffer = encrypt(&[&data]);
        let mut reader = open(buffer);
        assert_eq!(reader.length().unwrap(), 293_000);
        reader.seek(0).unwrap();
        assert_eq!(read_all(&mut reader, data.len()), data);
    }

    #[test]
    fn seek_tell_and_suffix_read() {
        let data: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
        let buffer = encrypt(&[&data]);
        let mut reader = open(buffer);

        for pos in [0u64, 1, 4095, 4096, 4097, 12_345, 19_999, 20_000] {
            reader.seek(pos).unwrap();
            assert_eq!(reader.tell(), pos, "tell after seek({pos})");
            let expected = &data[pos as usize..];
            assert_eq!(read_all(&mut reader, expected.len()), expected);
        }
    }

    #[test]
    fn seek_past_end_clamps() {
        let buffer = encrypt(&[b"short"]);
        let mut reader = open(buffer);
        reader.seek(1_000_000).unwrap();
        assert_eq!(reader.tell(), 5);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn length_preserves_position() {
        let data = vec![7u8; 10_000];
        let buffer = encrypt(&[&data]);
        let mut reader = open(buffer);
        reader.seek(1234).unwrap();
        assert_eq!(reader.length().unwrap(), 10_000);
        assert_eq!(reader.tell(), 1234);
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let buffer = encrypt(&[b"some data"]);
        let mut bytes = buffer.snapshot();
        bytes.truncate(10); // trailer gone
        let result = EncryptedReadStream::new(
            Box::new(MemoryReadStream::new(SharedBytes::from_vec(bytes))),
            EncryptionAlgorithm::Aes128,
            &key(),
        );
        assert!(matches!(result, Err(StreamError::CorruptData(_))));
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let result = EncryptedWriteStream::new(
            Box::new(MemoryWriteStream::new(SharedBytes::new())),
            EncryptionAlgorithm::None,
            &key(),
        );
        assert!(matches!(result, Err(StreamError::UnsupportedEncryption)));
    }

    #[test]
    fn wrong_key_does_not_yield_cleartext() {
        let data = vec![b'x'; 5000];
        let buffer = encrypt(&[&data]);
        let other = EncryptionKey::from_bytes(&[0x55; KEY_SIZE]).unwrap();
        let mut reader = EncryptedReadStream::new(
            Box::new(MemoryReadStream::new(buffer)),
            EncryptionAlgorithm::Aes128,
            &other,
        )
        .unwrap();
        let mut out = vec![0u8; data.len()];
        match reader.read(&mut out) {
            Ok(n) => assert_ne!(&out[..n], &data[..n]),
            Err(StreamError::CorruptData(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nonces_differ_between_files() {
        let a = encrypt(&[b"same cleartext"]).snapshot();
        let b = encrypt(&[b"same cleartext"]).snapshot();
        assert_ne!(a, b, "random nonce must vary the ciphertext");
    }

    #[test]
    fn file_backed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.enc");
        let data: Vec<u8> = (0..12_345).map(|i| (i % 251) as u8).collect();

        let mut writer = EncryptedWriteStream::new(
            Box::new(crate::stream::FileWriteStream::create(&path).unwrap()),
            EncryptionAlgorithm::Aes128,
            &key(),
        )
        .unwrap();
        writer.write(&data).unwrap();
        writer.close().unwrap();

        let mut reader = EncryptedReadStream::new(
            Box::new(crate::stream::FileReadStream::open(&path).unwrap()),
            EncryptionAlgorithm::Aes128,
            &key(),
        )
        .unwrap();
        assert_eq!(reader.length().unwrap(), data.len() as u64);
        reader.seek(4096).unwrap();
        assert_eq!(read_all(&mut reader, data.len() - 4096), &data[4096..]);
    }
}

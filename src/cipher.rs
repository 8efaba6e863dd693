//! # Stream Cipher
//!
//! Byte-wise keystream transform applied to every connection after the
//! handshake.
//!
//! Each direction owns a [`FastRandom`] generator seeded from the 32-bit
//! session seed agreed during the handshake. Outgoing bytes have the next
//! keystream byte added (mod 256); incoming bytes have it subtracted.
//!
//! ## Security
//!
//! This is obfuscation, not authenticated encryption. The keystream comes from
//! a 32-bit-seeded xorshift generator, there is no integrity protection, and a
//! passive observer who brute-forces the seed recovers the traffic. The
//! transform is kept bit-exact because both peers must produce the same
//! keystream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest plaintext chunk accepted by a single `poll_write`.
const WRITE_CHUNK: usize = 64 * 1024;

/// xorshift128 generator with the fixed `y`, `z`, `w` start state used by
/// every peer.
#[derive(Clone, Debug)]
pub struct FastRandom {
    x: u32,
    y: u32,
    z: u32,
    w: u32,
}

impl FastRandom {
    const Y: u32 = 842_502_087;
    const Z: u32 = 3_579_807_591;
    const W: u32 = 273_326_509;
    const REAL_UNIT_INT: f64 = 1.0 / (i32::MAX as f64 + 1.0);

    pub fn new(seed: i32) -> Self {
        Self {
            x: seed as u32,
            y: Self::Y,
            z: Self::Z,
            w: Self::W,
        }
    }

    fn next_u32(&mut self) -> u32 {
        let t = self.x ^ (self.x << 11);
        self.x = self.y;
        self.y = self.z;
        self.z = self.w;
        self.w = (self.w ^ (self.w >> 19)) ^ (t ^ (t >> 8));
        self.w
    }

    /// Value in `0..upper_bound`.
    pub fn next(&mut self, upper_bound: u32) -> u32 {
        let sample = (self.next_u32() & 0x7FFF_FFFF) as f64;
        (Self::REAL_UNIT_INT * sample * upper_bound as f64) as u32
    }

    pub fn next_byte(&mut self) -> u8 {
        self.next(256) as u8
    }
}

/// Applies the keystream to plaintext in place.
pub fn encrypt_in_place(keystream: &mut FastRandom, data: &mut [u8]) {
    for byte in data {
        *byte = byte.wrapping_add(keystream.next_byte());
    }
}

/// Removes the keystream from ciphertext in place.
pub fn decrypt_in_place(keystream: &mut FastRandom, data: &mut [u8]) {
    for byte in data {
        *byte = byte.wrapping_sub(keystream.next_byte());
    }
}

/// Session seeds from one side's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSeeds {
    pub read_seed: i32,
    pub write_seed: i32,
}

impl SessionSeeds {
    /// The same pair as seen by the other end of the connection.
    pub fn mirrored(self) -> Self {
        Self {
            read_seed: self.write_seed,
            write_seed: self.read_seed,
        }
    }
}

/// Wraps a raw stream and applies the keystream in both directions.
///
/// Writes are encrypted into an internal buffer that is drained into the
/// inner stream before more plaintext is accepted, so the write keystream
/// only ever advances for bytes that will reach the wire.
pub struct EncryptedStream<S> {
    inner: S,
    seeds: SessionSeeds,
    read_keystream: FastRandom,
    write_keystream: FastRandom,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> EncryptedStream<S> {
    pub fn new(inner: S, seeds: SessionSeeds) -> Self {
        Self {
            inner,
            seeds,
            read_keystream: FastRandom::new(seeds.read_seed),
            write_keystream: FastRandom::new(seeds.write_seed),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn seeds(&self) -> SessionSeeds {
        self.seeds
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> EncryptedStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..]))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += written;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for EncryptedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        decrypt_in_place(&mut this.read_keystream, &mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for EncryptedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let accepted = buf.len().min(WRITE_CHUNK);
        this.pending.extend_from_slice(&buf[..accepted]);
        encrypt_in_place(&mut this.write_keystream, &mut this.pending);

        // Push what the socket takes right now; the rest goes out on the next
        // write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

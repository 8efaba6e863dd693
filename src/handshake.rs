//! # Secure Channel Handshake
//!
//! Turns a raw byte stream into an [`EncryptedStream`] without any shared
//! secret.
//!
//! ## Sequence
//!
//! ```text
//! Initiator (dialer, holds RSA key)          Responder (acceptor)
//!   --- modulus, exponent ------------------>
//!                                             picks readSeed, writeSeed
//!   <-- RSA(writeSeed), RSA(readSeed) -------
//!   first value  = initiator read seed
//!   second value = initiator write seed
//! ```
//!
//! Every field is a length-prefixed array (see [`crate::wire`]). The order is
//! strict: a single misplaced byte desynchronizes the keystreams for the rest
//! of the connection, so any error here abandons the stream.

use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha1::Sha1;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::cipher::{EncryptedStream, SessionSeeds};
use crate::error::{NetError, Result};
use crate::keys::KeyInfo;
use crate::wire::{read_byte_array, write_byte_array};

/// Minimum send/receive buffer size applied to every connection socket.
pub const MIN_SOCKET_BUFFER: usize = 16 * 1024;

/// Raises small socket buffers to [`MIN_SOCKET_BUFFER`] and disables Nagle.
pub fn apply_socket_policy(stream: &TcpStream) -> Result<()> {
    let socket = SockRef::from(stream);

    let send = socket
        .send_buffer_size()
        .map_err(|e| NetError::io("reading send buffer size", e))?;
    if send < MIN_SOCKET_BUFFER {
        socket
            .set_send_buffer_size(MIN_SOCKET_BUFFER)
            .map_err(|e| NetError::io("setting send buffer size", e))?;
    }

    let recv = socket
        .recv_buffer_size()
        .map_err(|e| NetError::io("reading receive buffer size", e))?;
    if recv < MIN_SOCKET_BUFFER {
        socket
            .set_recv_buffer_size(MIN_SOCKET_BUFFER)
            .map_err(|e| NetError::io("setting receive buffer size", e))?;
    }

    stream
        .set_nodelay(true)
        .map_err(|e| NetError::io("disabling send coalescing", e))?;
    Ok(())
}

/// Dialing side: publishes the public key and unwraps the session seeds.
pub async fn initiate<S>(mut stream: S, key: &KeyInfo) -> Result<EncryptedStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let public = key.public_key()?;
    write_byte_array(&mut stream, &public.n().to_bytes_be()).await?;
    write_byte_array(&mut stream, &public.e().to_bytes_be()).await?;
    stream.flush().await?;

    let read_seed = decrypt_seed(key, &read_byte_array(&mut stream).await?)?;
    let write_seed = decrypt_seed(key, &read_byte_array(&mut stream).await?)?;

    debug!("Handshake complete (initiator)");
    Ok(EncryptedStream::new(stream, SessionSeeds { read_seed, write_seed }))
}

/// Accepting side: picks the session seeds and wraps them for the dialer.
pub async fn respond<S>(mut stream: S) -> Result<EncryptedStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let modulus = read_byte_array(&mut stream).await?;
    let exponent = read_byte_array(&mut stream).await?;
    if modulus.is_empty() || exponent.is_empty() {
        return Err(NetError::handshake("peer sent an empty public key"));
    }
    let public = RsaPublicKey::new(
        BigUint::from_bytes_be(&modulus),
        BigUint::from_bytes_be(&exponent),
    )?;

    let seeds = generate_seeds();

    let write_wrapped = encrypt_seed(&public, seeds.write_seed)?;
    let read_wrapped = encrypt_seed(&public, seeds.read_seed)?;
    write_byte_array(&mut stream, &write_wrapped).await?;
    write_byte_array(&mut stream, &read_wrapped).await?;
    stream.flush().await?;

    debug!("Handshake complete (responder)");
    Ok(EncryptedStream::new(stream, seeds))
}

/// Two independent seeds from a fast generator keyed by the OS RNG.
fn generate_seeds() -> SessionSeeds {
    let mut rng = StdRng::from_rng(OsRng).unwrap_or_else(|_| StdRng::from_entropy());
    SessionSeeds {
        read_seed: rng.gen(),
        write_seed: rng.gen(),
    }
}

fn encrypt_seed(public: &RsaPublicKey, seed: i32) -> Result<Vec<u8>> {
    Ok(public.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &seed.to_le_bytes())?)
}

fn decrypt_seed(key: &KeyInfo, wrapped: &[u8]) -> Result<i32> {
    let plain = key.decrypt(wrapped)?;
    let bytes: [u8; 4] = plain
        .as_slice()
        .try_into()
        .map_err(|_| NetError::handshake(format!("seed has {} bytes, expected 4", plain.len())))?;
    Ok(i32::from_le_bytes(bytes))
}
